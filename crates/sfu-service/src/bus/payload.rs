//! Wire payloads exchanged over a framed link.
//!
//! One network frame carries a JSON **array** of [`Payload`] records so
//! multiple bus messages can share a frame (batching). Each payload is
//! dispatched independently by the receiver.

use common::types::{MediaKind, SessionId, StreamKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::media::TransportConfig;

/// Message names on the wire.
pub mod names {
    // Bidirectional
    pub const BROADCAST: &str = "BROADCAST";
    pub const ERROR: &str = "ERROR";

    // Client -> server messages
    pub const CONSUMPTION_CHANGE: &str = "CONSUMPTION_CHANGE";
    pub const INFO_CHANGE: &str = "INFO_CHANGE";
    pub const PRODUCTION_CHANGE: &str = "PRODUCTION_CHANGE";

    // Client -> server requests
    pub const CONNECT_CTS_TRANSPORT: &str = "CONNECT_CTS_TRANSPORT";
    pub const CONNECT_STC_TRANSPORT: &str = "CONNECT_STC_TRANSPORT";
    pub const INIT_PRODUCER: &str = "INIT_PRODUCER";

    // Server -> client messages
    pub const SESSION_LEAVE: &str = "SESSION_LEAVE";
    pub const S_INFO_CHANGE: &str = "S_INFO_CHANGE";

    // Server -> client requests
    pub const INIT_CONSUMER: &str = "INIT_CONSUMER";
    pub const INIT_TRANSPORTS: &str = "INIT_TRANSPORTS";
    pub const PING: &str = "PING";
}

/// A tagged bus message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusMessage {
    pub name: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl BusMessage {
    #[must_use]
    pub fn new(name: &str, payload: serde_json::Value) -> Self {
        Self {
            name: name.to_string(),
            payload,
        }
    }

    /// An `ERROR` message carrying a client-safe description.
    #[must_use]
    pub fn error(message: &str) -> Self {
        Self::new(names::ERROR, serde_json::json!({ "message": message }))
    }
}

/// One unit inside a frame: a message plus optional correlation markers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    pub message: BusMessage,
    /// Set by the sender when it expects a response under this id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub need_response: Option<String>,
    /// Set on a response, echoing the request's `need_response` id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_to: Option<String>,
}

/// `INIT_PRODUCER` request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitProducerPayload {
    #[serde(rename = "type")]
    pub stream: StreamKind,
    pub kind: MediaKind,
    pub rtp_parameters: serde_json::Value,
}

/// `PRODUCTION_CHANGE` message payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductionChangePayload {
    #[serde(rename = "type")]
    pub stream: StreamKind,
    pub active: bool,
}

/// `CONSUMPTION_CHANGE` message payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumptionChangePayload {
    pub session_id: SessionId,
    pub states: HashMap<StreamKind, bool>,
}

/// `INFO_CHANGE` message payload. `info` stays a raw value: only recognized
/// keys are applied, coerced to bool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfoChangePayload {
    pub info: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub need_refresh: Option<bool>,
}

/// Client `BROADCAST` message payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastPayload {
    #[serde(default)]
    pub message: serde_json::Value,
}

/// Server-side `BROADCAST` relayed to peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerBroadcastPayload {
    pub sender_id: SessionId,
    pub message: serde_json::Value,
}

/// `SESSION_LEAVE` message payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionLeavePayload {
    pub session_id: SessionId,
}

/// `CONNECT_CTS_TRANSPORT` / `CONNECT_STC_TRANSPORT` request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportPayload {
    pub dtls_parameters: serde_json::Value,
}

/// `INIT_TRANSPORTS` request payload, server to client. The response is the
/// client's RTP capabilities.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitTransportsPayload {
    pub capabilities: serde_json::Value,
    pub stc_config: TransportConfig,
    pub cts_config: TransportConfig,
    pub producer_options_by_kind: serde_json::Value,
}

/// `INIT_CONSUMER` request payload, server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitConsumerPayload {
    pub id: String,
    pub kind: MediaKind,
    pub producer_id: String,
    pub rtp_parameters: serde_json::Value,
    pub session_id: SessionId,
    pub active: bool,
    #[serde(rename = "type")]
    pub stream: StreamKind,
}
