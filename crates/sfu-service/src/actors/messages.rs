//! Message types exchanged between the control-plane actors.
//!
//! Three mailboxes exist: the controller (process registry), one per
//! channel, and one per session. Requests needing an answer carry a
//! `respond_to` oneshot sender; everything else is fire-and-forget, which
//! keeps the actor loops free of cross-actor await cycles.

use common::types::{ChannelId, SessionId, StreamKind};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use super::channel::ChannelActorHandle;
use super::session::SessionActorHandle;
use crate::bus::{Bus, BusEvent, LinkEvent};
use crate::errors::SfuError;
use crate::media::MediaConsumer;
use crate::media::MediaTransport;

/// Why a session closed. Mapped onto link close codes for the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Orderly close.
    Clean,
    /// Error budget exhausted or unrecoverable failure.
    Error,
    /// Removed by a forced disconnect.
    Kicked,
    /// A new session with the same id took over.
    Replaced,
    /// The containing channel closed.
    ChannelClosed,
    /// The session never reached CONNECTED before the deadline.
    ConnectionTimeout,
    /// A PING request went unanswered.
    PingTimeout,
    /// The duplex link closed under the session.
    LinkClosed,
    /// The duplex link failed.
    LinkError,
}

impl CloseReason {
    /// Link close code sent to the client for this reason.
    #[must_use]
    pub fn link_close_code(self) -> crate::bus::LinkCloseCode {
        use crate::bus::LinkCloseCode;
        match self {
            CloseReason::Error | CloseReason::LinkError => LinkCloseCode::Error,
            CloseReason::Kicked | CloseReason::Replaced | CloseReason::ChannelClosed => {
                LinkCloseCode::Kicked
            }
            CloseReason::ConnectionTimeout | CloseReason::PingTimeout => LinkCloseCode::Timeout,
            CloseReason::Clean | CloseReason::LinkClosed => LinkCloseCode::Clean,
        }
    }
}

/// Session lifecycle states. CLOSED is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    Connecting,
    Connected,
    Closed,
}

/// Mutable per-session info record shared with peers.
///
/// Fixed membership: only these six flags exist, each tri-state
/// (unknown / false / true).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_talking: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_camera_on: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_screen_sharing_on: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_self_muted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_deaf: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_raising_hand: Option<bool>,
}

impl SessionInfo {
    /// Apply recognized keys from a client-supplied patch, coercing values
    /// to booleans. Unrecognized keys are ignored. Returns whether anything
    /// changed.
    pub fn apply(&mut self, patch: &serde_json::Value) -> bool {
        let Some(object) = patch.as_object() else {
            return false;
        };

        let mut changed = false;
        for (key, value) in object {
            let flag = Some(truthy(value));
            let slot = match key.as_str() {
                "isTalking" => &mut self.is_talking,
                "isCameraOn" => &mut self.is_camera_on,
                "isScreenSharingOn" => &mut self.is_screen_sharing_on,
                "isSelfMuted" => &mut self.is_self_muted,
                "isDeaf" => &mut self.is_deaf,
                "isRaisingHand" => &mut self.is_raising_hand,
                _ => continue,
            };
            if *slot != flag {
                *slot = flag;
                changed = true;
            }
        }
        changed
    }
}

/// JavaScript-style truthiness, matching how clients historically sent
/// these flags.
fn truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Array(_) | serde_json::Value::Object(_) => true,
    }
}

/// Producer bitrates aggregated per stream slot, bits/s.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BitrateStats {
    pub audio: u64,
    pub camera: u64,
    pub screen: u64,
    pub total: u64,
}

impl BitrateStats {
    pub fn add(&mut self, kind: StreamKind, bitrate: u64) {
        match kind {
            StreamKind::Audio => self.audio += bitrate,
            StreamKind::Camera => self.camera += bitrate,
            StreamKind::Screen => self.screen += bitrate,
        }
        self.total += bitrate;
    }

    pub fn merge(&mut self, other: &BitrateStats) {
        self.audio += other.audio;
        self.camera += other.camera;
        self.screen += other.screen;
        self.total += other.total;
    }
}

/// Per-session statistics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub session_id: SessionId,
    pub bitrate: BitrateStats,
    pub info: SessionInfo,
}

/// Per-channel statistics as served by `GET /v1/stats`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStats {
    pub uuid: ChannelId,
    pub created_at: i64,
    pub sessions: usize,
    pub bitrate: BitrateStats,
    pub cameras_on: usize,
    pub screens_on: usize,
}

/// One producer as seen by a consuming peer.
#[derive(Debug, Clone)]
pub struct ProducerSnapshot {
    pub id: String,
    pub paused: bool,
}

/// A session's producer set, handed to peers that want to consume it.
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub session_id: SessionId,
    pub connected: bool,
    pub producers: HashMap<StreamKind, ProducerSnapshot>,
}

/// Result of one consumer-creation task against a peer.
pub enum ConsumeResult {
    /// A consumer was created and acknowledged by the client; install it.
    Install {
        kind: StreamKind,
        consumer: Arc<dyn MediaConsumer>,
        producer_paused: bool,
    },
    /// The slot already exists; align its paused state with the producer.
    Reconcile {
        kind: StreamKind,
        producer_paused: bool,
    },
    /// Creation failed; the recovery timer should retry.
    Failed { kind: StreamKind, error: String },
}

impl std::fmt::Debug for ConsumeResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsumeResult::Install {
                kind,
                producer_paused,
                ..
            } => f
                .debug_struct("Install")
                .field("kind", kind)
                .field("producer_paused", producer_paused)
                .finish(),
            ConsumeResult::Reconcile {
                kind,
                producer_paused,
            } => f
                .debug_struct("Reconcile")
                .field("kind", kind)
                .field("producer_paused", producer_paused)
                .finish(),
            ConsumeResult::Failed { kind, error } => f
                .debug_struct("Failed")
                .field("kind", kind)
                .field("error", error)
                .finish(),
        }
    }
}

/// Messages handled by a session actor.
pub enum SessionMessage {
    /// Bind the session to its bus and start connecting.
    Connect {
        bus: Bus,
        events: mpsc::Receiver<LinkEvent>,
    },
    /// Inbound bus traffic.
    Bus(BusEvent),
    /// Transports created and capabilities exchanged.
    TransportsReady {
        cts: Arc<dyn MediaTransport>,
        stc: Arc<dyn MediaTransport>,
        capabilities: serde_json::Value,
    },
    /// Transport creation or the capability exchange failed.
    ConnectFailed { error: String },
    /// The connection deadline fired; close unless CONNECTED.
    DeadlineCheck,
    /// A PING request was rejected.
    PingFailed { error: String },
    /// Start or refresh consumption of a peer's producers.
    ConsumeFrom { peer: SessionActorHandle },
    /// A consume task finished.
    ConsumeOutcome {
        peer_id: SessionId,
        results: Vec<ConsumeResult>,
    },
    /// The recovery delay for a peer elapsed.
    RecoveryTick { peer_id: SessionId },
    /// A peer left; release every consumer built against it.
    PeerClosed { session_id: SessionId },
    /// Deliver a message to this session's client.
    Deliver {
        message: crate::bus::BusMessage,
        batch: bool,
    },
    /// Producer set snapshot for a consuming peer.
    GetSnapshot {
        respond_to: oneshot::Sender<PeerSnapshot>,
    },
    /// Producer bitrates and info.
    GetStats {
        respond_to: oneshot::Sender<SessionStats>,
    },
    /// Current lifecycle state.
    GetState {
        respond_to: oneshot::Sender<SessionState>,
    },
    /// Close the session.
    Close {
        reason: CloseReason,
        cause: Option<String>,
    },
}

/// Messages handled by a channel actor.
pub enum ChannelMessage {
    /// Install a session, replacing any prior session with the same id.
    Join {
        session_id: SessionId,
        respond_to: oneshot::Sender<Result<SessionActorHandle, SfuError>>,
    },
    /// A session reached CONNECTED; mesh it with its peers.
    SessionConnected { session_id: SessionId },
    /// A session closed.
    SessionClosed {
        session_id: SessionId,
        instance: Uuid,
        reason: CloseReason,
    },
    /// A session's producers changed; peers should reconcile consumers.
    ReconcilePeers { from: SessionId },
    /// Deliver a message to every session except `from`.
    Fanout {
        from: SessionId,
        message: crate::bus::BusMessage,
        batch: bool,
    },
    /// A session's info record changed.
    InfoUpdated {
        session_id: SessionId,
        info: SessionInfo,
    },
    /// Snapshot of every session's info record.
    GetInfoSnapshot {
        respond_to: oneshot::Sender<HashMap<String, SessionInfo>>,
    },
    /// Aggregate channel statistics.
    GetStats {
        respond_to: oneshot::Sender<ChannelStats>,
    },
    /// Per-session statistics.
    GetSessionsStats {
        respond_to: oneshot::Sender<Vec<SessionStats>>,
    },
    /// Force-close the named sessions.
    Kick { session_ids: Vec<SessionId> },
    /// Close the channel and every session in it.
    Close,
}

/// What the gateway needs to authenticate a connection against a channel.
#[derive(Clone)]
pub struct ChannelAccess {
    pub uuid: ChannelId,
    pub handle: ChannelActorHandle,
    /// Per-channel verification key, if one was installed at creation.
    pub key: Option<Vec<u8>>,
    /// Remote address of the channel's creator.
    pub remote_addr: String,
}

/// Messages handled by the controller actor.
pub enum ControllerMessage {
    /// Create (or return the existing) channel for an issuer.
    CreateChannel {
        remote_addr: String,
        issuer: String,
        key: Option<Vec<u8>>,
        use_webrtc: bool,
        respond_to: oneshot::Sender<Result<ChannelId, SfuError>>,
    },
    /// Look up a channel by uuid.
    GetChannel {
        uuid: ChannelId,
        respond_to: oneshot::Sender<Option<ChannelAccess>>,
    },
    /// A channel closed; drop its registry entries.
    ChannelClosed { uuid: ChannelId },
    /// Statistics for every channel.
    GetStats {
        respond_to: oneshot::Sender<Vec<ChannelStats>>,
    },
    /// Force-disconnect sessions, constrained to channels created from
    /// `remote_addr`.
    Disconnect {
        remote_addr: String,
        sessions: HashMap<Uuid, Vec<String>>,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },
    /// Close every channel but keep the process up (soft reset).
    CloseAll {
        respond_to: oneshot::Sender<()>,
    },
    /// Close every channel and stop the actor.
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}
