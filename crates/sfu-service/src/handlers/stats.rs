//! Liveness and statistics handlers.

use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;
use tracing::instrument;

use crate::actors::ChannelStats;
use crate::errors::SfuError;
use crate::routes::AppState;

#[derive(Serialize)]
pub struct NoopResponse {
    result: &'static str,
}

/// Handler for GET /v1/noop
pub async fn noop() -> Json<NoopResponse> {
    Json(NoopResponse { result: "ok" })
}

/// Handler for GET /v1/stats
///
/// Returns one entry per live channel with aggregated producer bitrates
/// and camera/screen counts.
#[instrument(skip_all, name = "sfu.http.stats")]
pub async fn stats(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ChannelStats>>, SfuError> {
    let stats = state.controller.get_stats().await?;
    Ok(Json(stats))
}
