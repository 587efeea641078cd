//! Channel creation and forced disconnect handlers.
//!
//! # Security
//!
//! - `GET /v1/channel` requires `Authorization: jwt <token>` verified with
//!   the global key; the `iss` claim keys idempotent creation and the
//!   optional `key` claim installs a per-channel verification key
//! - `POST /v1/disconnect` carries its token as the request body; only
//!   channels created from the caller's remote address are affected,
//!   everything else is silently skipped

use axum::{
    extract::{ConnectInfo, Query, State},
    http::{header, HeaderMap},
    Json,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use common::jwt;
use common::secret::ExposeSecret;
use common::types::ChannelId;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::errors::SfuError;
use crate::routes::{external_url, remote_addr, AppState};

/// Authorization scheme prefix for channel creation.
const AUTH_SCHEME: &str = "jwt ";

#[derive(Debug, Deserialize)]
pub struct ChannelQuery {
    #[serde(rename = "webRTC")]
    web_rtc: Option<bool>,
}

#[derive(Serialize)]
pub struct ChannelCreatedResponse {
    uuid: ChannelId,
    url: String,
}

#[derive(Serialize)]
pub struct DisconnectResponse {
    result: &'static str,
}

/// Handler for GET /v1/channel
///
/// Create a new channel, or return the channel already created by the same
/// `(remote address, iss)` pair.
///
/// # Response
///
/// - 200: `{"uuid", "url"}`
/// - 401: missing or invalid authorization
/// - 403: token has no `iss` claim
/// - 500: invalid `key` claim or engine failure
#[instrument(skip_all, name = "sfu.http.channel", fields(endpoint = "/v1/channel"))]
pub async fn create_channel(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ChannelQuery>,
    ConnectInfo(socket_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<ChannelCreatedResponse>, SfuError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix(AUTH_SCHEME))
        .ok_or(SfuError::Authentication(jwt::AuthError::Malformed))?;

    let claims = jwt::verify(token, state.global_key.expose_secret()).map_err(|e| {
        debug!(target: "sfu.http", error = %e, "Channel-create token rejected");
        SfuError::Authentication(e)
    })?;

    let issuer = claims.iss.ok_or(SfuError::MissingIssuer)?;

    let key = claims
        .key
        .map(|encoded| STANDARD.decode(&encoded))
        .transpose()
        .map_err(|e| SfuError::Config(format!("per-channel key is not valid base64: {e}")))?;

    let use_webrtc = query.web_rtc.unwrap_or(true);
    let remote = remote_addr(&state.config, &headers, socket_addr);

    let uuid = state
        .controller
        .create_channel(remote, issuer, key, use_webrtc)
        .await?;

    Ok(Json(ChannelCreatedResponse {
        uuid,
        url: external_url(&state.config, &headers),
    }))
}

/// Handler for POST /v1/disconnect
///
/// The body is a token whose `sessionIdsByChannel` claim names the sessions
/// to kick, keyed by channel uuid.
///
/// # Response
///
/// - 200 on success
/// - 422 when the token or its claims cannot be processed
#[instrument(skip_all, name = "sfu.http.disconnect", fields(endpoint = "/v1/disconnect"))]
pub async fn disconnect(
    State(state): State<Arc<AppState>>,
    ConnectInfo(socket_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<DisconnectResponse>, SfuError> {
    let claims = jwt::verify(body.trim(), state.global_key.expose_secret()).map_err(|e| {
        debug!(target: "sfu.http", error = %e, "Disconnect token rejected");
        SfuError::Unprocessable("invalid token".to_string())
    })?;

    let sessions = claims
        .session_ids_by_channel
        .ok_or_else(|| SfuError::Unprocessable("sessionIdsByChannel claim missing".to_string()))?;

    let remote = remote_addr(&state.config, &headers, socket_addr);

    state
        .controller
        .disconnect(remote, sessions)
        .await
        .map_err(|e| {
            warn!(target: "sfu.http", error = %e, "Disconnect failed");
            SfuError::Unprocessable("disconnect failed".to_string())
        })?;

    Ok(Json(DisconnectResponse { result: "ok" }))
}
