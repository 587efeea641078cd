//! Duplex-link upgrade handler.

use axum::{
    extract::{State, WebSocketUpgrade},
    response::Response,
};
use std::sync::Arc;

use crate::bus::link::wrap_socket;
use crate::routes::AppState;

/// Handler for GET /v1/ws
///
/// Upgrades the connection and hands the link to the gateway for the
/// first-message authentication handshake.
pub async fn ws_upgrade(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| async move {
        let (link, events) = wrap_socket(socket);
        state.gateway.handle_link(link, events).await;
    })
}
