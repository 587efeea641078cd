//! Abstract interface to the media engine.
//!
//! The engine that actually moves RTP — workers, routers, transports,
//! producers and consumers — lives outside this service. The control plane
//! consumes it through the trait objects defined here, which keeps the
//! coordination layer testable against an in-memory engine and keeps codec
//! negotiation details out of scope.
//!
//! RTP capability and parameter blobs are opaque [`serde_json::Value`]s:
//! the control plane forwards them between engine and clients without
//! interpreting them.

use common::types::MediaKind;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub mod codecs;

pub use codecs::RtpCodecCapability;

/// Error raised by the media engine.
#[derive(Debug, Error, Clone)]
#[error("media engine: {0}")]
pub struct MediaError(pub String);

/// Resident-memory usage of one worker, used for load-balanced selection.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceUsage {
    /// Maximum resident set size, bytes.
    pub ru_maxrss: u64,
}

/// Transport-level traffic counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TransportStats {
    /// Receive bitrate, bits/s.
    pub recv_bitrate: u64,
    /// Send bitrate, bits/s.
    pub send_bitrate: u64,
}

/// Producer-level traffic counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProducerStats {
    /// Current bitrate, bits/s.
    pub bitrate: u64,
}

/// Settings handed to the engine when creating a worker.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
}

/// Options for the per-worker WebRTC server.
#[derive(Debug, Clone)]
pub struct WebRtcServerOptions {
    /// Interface the server binds (UDP and TCP).
    pub listen_ip: String,
    /// IP announced to clients in ICE candidates.
    pub announced_ip: String,
}

/// Options for a single WebRTC transport.
#[derive(Debug, Clone, Default)]
pub struct TransportOptions {
    /// Id of the worker-level WebRTC server to attach to.
    pub webrtc_server_id: Option<String>,
    /// Whether to negotiate an SCTP association for data channels.
    pub enable_sctp: bool,
    /// Socket buffer limits, bytes.
    pub max_buf_in: Option<u32>,
    pub max_buf_out: Option<u32>,
}

/// ICE/DTLS/SCTP parameters of one transport, as sent to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportConfig {
    pub id: String,
    pub ice_parameters: serde_json::Value,
    pub ice_candidates: serde_json::Value,
    pub dtls_parameters: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sctp_parameters: Option<serde_json::Value>,
}

/// Factory for media workers.
#[async_trait::async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_worker(
        &self,
        settings: &WorkerSettings,
    ) -> Result<Arc<dyn MediaWorker>, MediaError>;
}

/// One engine worker process.
#[async_trait::async_trait]
pub trait MediaWorker: Send + Sync {
    fn id(&self) -> &str;

    /// Query resident memory usage for load-balanced selection.
    async fn get_resource_usage(&self) -> Result<ResourceUsage, MediaError>;

    async fn create_router(
        &self,
        codecs: &[RtpCodecCapability],
    ) -> Result<Arc<dyn MediaRouter>, MediaError>;

    async fn create_webrtc_server(
        &self,
        options: &WebRtcServerOptions,
    ) -> Result<Arc<dyn WebRtcServer>, MediaError>;

    /// Token that fires when the worker dies. Observers must not assume the
    /// worker is usable after this fires.
    fn died(&self) -> CancellationToken;

    async fn close(&self);
}

/// Worker-level WebRTC server sharing the configured port range.
pub trait WebRtcServer: Send + Sync {
    fn id(&self) -> &str;
}

/// Per-channel media router.
#[async_trait::async_trait]
pub trait MediaRouter: Send + Sync {
    fn id(&self) -> &str;

    /// The router's RTP capabilities, exchanged with clients.
    fn rtp_capabilities(&self) -> serde_json::Value;

    async fn create_webrtc_transport(
        &self,
        options: &TransportOptions,
    ) -> Result<Arc<dyn MediaTransport>, MediaError>;

    /// Whether a consumer can be built for `producer_id` given the client's
    /// RTP capabilities.
    async fn can_consume(&self, producer_id: &str, capabilities: &serde_json::Value) -> bool;

    async fn close(&self);
}

/// One direction of encrypted media between a participant and the server.
#[async_trait::async_trait]
pub trait MediaTransport: Send + Sync {
    fn id(&self) -> &str;
    fn ice_parameters(&self) -> serde_json::Value;
    fn ice_candidates(&self) -> serde_json::Value;
    fn dtls_parameters(&self) -> serde_json::Value;
    fn sctp_parameters(&self) -> Option<serde_json::Value>;

    async fn connect(&self, dtls_parameters: &serde_json::Value) -> Result<(), MediaError>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: &serde_json::Value,
    ) -> Result<Arc<dyn MediaProducer>, MediaError>;

    async fn consume(
        &self,
        producer_id: &str,
        capabilities: &serde_json::Value,
        paused: bool,
    ) -> Result<Arc<dyn MediaConsumer>, MediaError>;

    async fn set_max_incoming_bitrate(&self, bitrate: u32) -> Result<(), MediaError>;
    async fn set_max_outgoing_bitrate(&self, bitrate: u32) -> Result<(), MediaError>;

    async fn get_stats(&self) -> Result<TransportStats, MediaError>;

    async fn close(&self);
}

/// An uplink: one media stream a session sends to the server.
#[async_trait::async_trait]
pub trait MediaProducer: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    fn paused(&self) -> bool;
    fn rtp_parameters(&self) -> serde_json::Value;

    async fn pause(&self) -> Result<(), MediaError>;
    async fn resume(&self) -> Result<(), MediaError>;
    async fn get_stats(&self) -> Result<ProducerStats, MediaError>;
    async fn close(&self);
}

/// A downlink: one peer's stream forwarded to a session.
#[async_trait::async_trait]
pub trait MediaConsumer: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    fn paused(&self) -> bool;
    fn rtp_parameters(&self) -> serde_json::Value;

    async fn pause(&self) -> Result<(), MediaError>;
    async fn resume(&self) -> Result<(), MediaError>;
    async fn close(&self);
}

/// Build a [`TransportConfig`] from a live transport, for the client
/// handshake.
#[must_use]
pub fn transport_config(transport: &Arc<dyn MediaTransport>) -> TransportConfig {
    TransportConfig {
        id: transport.id().to_string(),
        ice_parameters: transport.ice_parameters(),
        ice_candidates: transport.ice_candidates(),
        dtls_parameters: transport.dtls_parameters(),
        sctp_parameters: transport.sctp_parameters(),
    }
}
