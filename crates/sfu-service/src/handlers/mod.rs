//! HTTP handlers.
//!
//! Implements the control surface:
//!
//! - `GET /v1/noop` - liveness probe
//! - `GET /v1/stats` - per-channel statistics
//! - `GET /v1/channel` - idempotent channel creation (token authenticated)
//! - `POST /v1/disconnect` - forced disconnect (token in the body)
//! - `GET /v1/ws` - duplex-link upgrade

mod channels;
mod stats;
mod ws;

pub use channels::{create_channel, disconnect};
pub use stats::{noop, stats};
pub use ws::ws_upgrade;
