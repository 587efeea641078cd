//! HTTP routes.
//!
//! Defines the Axum router and application state. The whole surface sits
//! under `/v1`; unknown paths fall through to axum's 404 and unknown
//! methods to 405. CORS is permissive with automatic OPTIONS preflight.

use axum::{
    http::HeaderMap,
    routing::{get, post},
    Router,
};
use common::secret::SecretBox;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::actors::ControllerActorHandle;
use crate::config::Config;
use crate::gateway::Gateway;
use crate::handlers;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Process registry.
    pub controller: ControllerActorHandle,

    /// Duplex-link handshake state.
    pub gateway: Arc<Gateway>,

    /// Service configuration.
    pub config: Arc<Config>,

    /// Decoded global verification key.
    pub global_key: Arc<SecretBox<Vec<u8>>>,
}

/// Build the `/v1` router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/noop", get(handlers::noop))
        .route("/v1/stats", get(handlers::stats))
        .route("/v1/channel", get(handlers::create_channel))
        .route("/v1/disconnect", post(handlers::disconnect))
        .route("/v1/ws", get(handlers::ws_upgrade))
        .with_state(Arc::new(state))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Client address as the control plane sees it: the first-hop
/// `x-forwarded-for` entry when running behind a trusted proxy, the socket
/// address otherwise. Ports are dropped so one client keys one identity.
#[must_use]
pub fn remote_addr(
    config: &Config,
    headers: &HeaderMap,
    socket_addr: std::net::SocketAddr,
) -> String {
    if config.proxy {
        if let Some(forwarded) = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
        {
            let first_hop = forwarded.trim();
            if !first_hop.is_empty() {
                return first_hop.to_string();
            }
        }
    }
    socket_addr.ip().to_string()
}

/// External URL of this service, for clients to open their duplex link
/// against. Behind a proxy the first-hop forwarded host/proto win.
#[must_use]
pub fn external_url(config: &Config, headers: &HeaderMap) -> String {
    let forwarded = |name: &str| -> Option<String> {
        if !config.proxy {
            return None;
        }
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    let proto = forwarded("x-forwarded-proto").unwrap_or_else(|| "http".to_string());
    let host = forwarded("x-forwarded-host")
        .or_else(|| {
            headers
                .get(axum::http::header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(ToString::to_string)
        })
        .unwrap_or_else(|| format!("{}:{}", config.http_interface, config.port));

    format!("{proto}://{host}")
}
