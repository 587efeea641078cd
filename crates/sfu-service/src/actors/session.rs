//! `SessionActor` - one participant inside one channel.
//!
//! Each `SessionActor`:
//! - Owns its bus, its two transports, its producers and every consumer it
//!   holds against peers
//! - Drives the lifecycle NEW -> CONNECTING -> CONNECTED -> CLOSED
//! - Answers client requests (produce, transport connect) and relays
//!   client messages (info, broadcast, production/consumption changes)
//! - Lazily builds consumers against peers and retries per-peer after
//!   transient failures
//!
//! # Consume tasks
//!
//! Consumer creation involves a round-trip to the client, so it runs in
//! spawned tasks rather than the actor loop. Two tasks for the same peer may
//! overlap (initial mesh + recovery); results come back as mailbox messages
//! and the loser of a duplicate-slot race closes its consumer, so no
//! consumer leaks.

use common::types::{ChannelId, SessionId, StreamKind};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::messages::{
    BitrateStats, CloseReason, ConsumeResult, PeerSnapshot, ProducerSnapshot, SessionInfo,
    SessionMessage, SessionState, SessionStats,
};
use super::messages::ChannelMessage;
use crate::bus::payload::{
    BroadcastPayload, ConnectTransportPayload, ConsumptionChangePayload, InfoChangePayload,
    InitConsumerPayload, InitProducerPayload, InitTransportsPayload, PeerBroadcastPayload,
    ProductionChangePayload, SessionLeavePayload,
};
use crate::bus::{names, ping_message, Bus, BusEvent, BusMessage, LinkEvent};
use crate::config::Config;
use crate::errors::SfuError;
use crate::media::{
    transport_config, MediaConsumer, MediaProducer, MediaRouter, MediaTransport, TransportOptions,
};

/// Default channel buffer size for the session mailbox.
const SESSION_CHANNEL_BUFFER: usize = 200;

/// Errors a session absorbs before it gives up and closes.
const MAX_SESSION_ERRORS: usize = 6;

/// What the channel provides to each of its sessions.
#[derive(Clone)]
pub struct SessionContext {
    pub channel_id: ChannelId,
    pub channel_tx: mpsc::Sender<ChannelMessage>,
    pub router: Option<Arc<dyn MediaRouter>>,
    pub webrtc_server_id: Option<String>,
    pub config: Arc<Config>,
}

/// Handle to a `SessionActor`.
#[derive(Clone)]
pub struct SessionActorHandle {
    sender: mpsc::Sender<SessionMessage>,
    cancel_token: CancellationToken,
    session_id: SessionId,
    instance: Uuid,
}

impl SessionActorHandle {
    /// Get the session ID.
    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Instance id distinguishing this session from a replacement reusing
    /// the same session id.
    #[must_use]
    pub fn instance(&self) -> Uuid {
        self.instance
    }

    /// Bind the session to its bus and start connecting.
    pub async fn connect(
        &self,
        bus: Bus,
        events: mpsc::Receiver<LinkEvent>,
    ) -> Result<(), SfuError> {
        self.sender
            .send(SessionMessage::Connect { bus, events })
            .await
            .map_err(|e| SfuError::Internal(format!("session send failed: {e}")))
    }

    /// Ask this session to consume the peer's producers.
    pub async fn consume_from(&self, peer: SessionActorHandle) {
        let _ = self.sender.send(SessionMessage::ConsumeFrom { peer }).await;
    }

    /// Notify that a peer closed; its consumers must be released.
    pub async fn peer_closed(&self, session_id: SessionId) {
        let _ = self
            .sender
            .send(SessionMessage::PeerClosed { session_id })
            .await;
    }

    /// Deliver a message to this session's client.
    pub async fn deliver(&self, message: BusMessage, batch: bool) {
        let _ = self
            .sender
            .send(SessionMessage::Deliver { message, batch })
            .await;
    }

    /// Snapshot of this session's producers, for a consuming peer.
    pub async fn get_snapshot(&self) -> Result<PeerSnapshot, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionMessage::GetSnapshot { respond_to: tx })
            .await
            .map_err(|e| SfuError::Internal(format!("session send failed: {e}")))?;
        rx.await
            .map_err(|e| SfuError::Internal(format!("session receive failed: {e}")))
    }

    /// Producer bitrates and info.
    pub async fn get_stats(&self) -> Result<SessionStats, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionMessage::GetStats { respond_to: tx })
            .await
            .map_err(|e| SfuError::Internal(format!("session send failed: {e}")))?;
        rx.await
            .map_err(|e| SfuError::Internal(format!("session receive failed: {e}")))
    }

    /// Current lifecycle state.
    pub async fn get_state(&self) -> Result<SessionState, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionMessage::GetState { respond_to: tx })
            .await
            .map_err(|e| SfuError::Internal(format!("session send failed: {e}")))?;
        rx.await
            .map_err(|e| SfuError::Internal(format!("session receive failed: {e}")))
    }

    /// Close the session. Idempotent.
    pub async fn close(&self, reason: CloseReason, cause: Option<String>) {
        let _ = self
            .sender
            .send(SessionMessage::Close { reason, cause })
            .await;
    }

    /// Whether the session has closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Wait until the session closes.
    pub async fn closed(&self) {
        self.cancel_token.cancelled().await;
    }
}

/// Consumers held against one peer.
struct PeerConsumers {
    handle: SessionActorHandle,
    slots: HashMap<StreamKind, Arc<dyn MediaConsumer>>,
}

/// The `SessionActor` implementation.
pub struct SessionActor {
    session_id: SessionId,
    instance: Uuid,
    ctx: SessionContext,
    receiver: mpsc::Receiver<SessionMessage>,
    /// For spawned tasks reporting back into the mailbox.
    self_sender: mpsc::Sender<SessionMessage>,
    cancel_token: CancellationToken,
    state: SessionState,
    bus: Option<Bus>,
    /// Client -> server transport.
    cts: Option<Arc<dyn MediaTransport>>,
    /// Server -> client transport.
    stc: Option<Arc<dyn MediaTransport>>,
    /// Client RTP capabilities, exchanged during connect.
    capabilities: Option<serde_json::Value>,
    producers: HashMap<StreamKind, Arc<dyn MediaProducer>>,
    consumers: HashMap<SessionId, PeerConsumers>,
    info: SessionInfo,
    errors: Vec<String>,
    /// Per-peer single-shot recovery timers.
    recovery: HashMap<SessionId, CancellationToken>,
}

impl SessionActor {
    /// Spawn a new session actor.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(session_id: SessionId, ctx: SessionContext) -> (SessionActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(SESSION_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();
        let instance = Uuid::new_v4();

        let actor = Self {
            session_id: session_id.clone(),
            instance,
            ctx,
            receiver,
            self_sender: sender.clone(),
            cancel_token: cancel_token.clone(),
            state: SessionState::New,
            bus: None,
            cts: None,
            stc: None,
            capabilities: None,
            producers: HashMap::new(),
            consumers: HashMap::new(),
            info: SessionInfo::default(),
            errors: Vec::new(),
            recovery: HashMap::new(),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = SessionActorHandle {
            sender,
            cancel_token,
            session_id,
            instance,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "sfu.actor.session", fields(session_id = %self.session_id))]
    async fn run(mut self) {
        debug!(
            target: "sfu.actor.session",
            session_id = %self.session_id,
            "SessionActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    self.close_session(CloseReason::Clean, None).await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            let should_exit = self.handle_message(message).await;
                            if should_exit || self.state == SessionState::Closed {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        info!(
            target: "sfu.actor.session",
            session_id = %self.session_id,
            errors = self.errors.len(),
            "SessionActor stopped"
        );
    }

    /// Handle a single message. Returns true if the actor should exit.
    async fn handle_message(&mut self, message: SessionMessage) -> bool {
        match message {
            SessionMessage::Connect { bus, events } => {
                self.handle_connect(bus, events).await;
                false
            }
            SessionMessage::Bus(event) => {
                self.handle_bus_event(event).await;
                false
            }
            SessionMessage::TransportsReady {
                cts,
                stc,
                capabilities,
            } => {
                self.handle_transports_ready(cts, stc, capabilities).await;
                false
            }
            SessionMessage::ConnectFailed { error } => {
                self.close_session(CloseReason::Error, Some(error)).await;
                true
            }
            SessionMessage::DeadlineCheck => {
                if self.state == SessionState::New || self.state == SessionState::Connecting {
                    self.close_session(CloseReason::ConnectionTimeout, None).await;
                    return true;
                }
                false
            }
            SessionMessage::PingFailed { error } => {
                self.close_session(CloseReason::PingTimeout, Some(error)).await;
                true
            }
            SessionMessage::ConsumeFrom { peer } => {
                self.handle_consume_from(&peer);
                false
            }
            SessionMessage::ConsumeOutcome { peer_id, results } => {
                self.handle_consume_outcome(peer_id, results).await;
                false
            }
            SessionMessage::RecoveryTick { peer_id } => {
                self.recovery.remove(&peer_id);
                let peer = self.consumers.get(&peer_id).map(|e| e.handle.clone());
                if let Some(peer) = peer {
                    self.handle_consume_from(&peer);
                }
                false
            }
            SessionMessage::PeerClosed { session_id } => {
                self.handle_peer_closed(&session_id);
                false
            }
            SessionMessage::Deliver { message, batch } => {
                if let Some(bus) = &self.bus {
                    let _ = bus.send(message, batch);
                }
                false
            }
            SessionMessage::GetSnapshot { respond_to } => {
                let _ = respond_to.send(self.snapshot());
                false
            }
            SessionMessage::GetStats { respond_to } => {
                let stats = self.collect_stats().await;
                let _ = respond_to.send(stats);
                false
            }
            SessionMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.state);
                false
            }
            SessionMessage::Close { reason, cause } => {
                self.close_session(reason, cause).await;
                true
            }
        }
    }

    /// Wire the bus and start connecting: timers, inbound pump, transports.
    async fn handle_connect(&mut self, bus: Bus, events: mpsc::Receiver<LinkEvent>) {
        if self.state != SessionState::New {
            warn!(
                target: "sfu.actor.session",
                session_id = %self.session_id,
                state = ?self.state,
                "Connect on a session that is not NEW"
            );
            return;
        }
        self.state = SessionState::Connecting;
        self.bus = Some(bus.clone());

        // Pump inbound bus events into the mailbox
        let (bus_tx, mut bus_rx) = mpsc::channel(SESSION_CHANNEL_BUFFER);
        bus.run_inbound(events, bus_tx);
        let self_tx = self.self_sender.clone();
        let cancel = self.cancel_token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    event = bus_rx.recv() => match event {
                        Some(event) => {
                            if self_tx.send(SessionMessage::Bus(event)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        });

        // Connection deadline
        let deadline = self.ctx.config.timeouts.session;
        let self_tx = self.self_sender.clone();
        let cancel = self.cancel_token.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(deadline) => {
                    let _ = self_tx.send(SessionMessage::DeadlineCheck).await;
                }
            }
        });

        // Ping interval: each tick issues an independent PING request whose
        // own deadline is the session timeout
        let ping_every = self.ctx.config.timeouts.ping;
        let ping_timeout = self.ctx.config.timeouts.session;
        let ping_bus = bus.clone();
        let self_tx = self.self_sender.clone();
        let cancel = self.cancel_token.clone();
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + ping_every;
            let mut interval = tokio::time::interval_at(start, ping_every);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let bus = ping_bus.clone();
                        let self_tx = self_tx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = bus
                                .request_with(ping_message(), ping_timeout, false)
                                .await
                            {
                                let _ = self_tx
                                    .send(SessionMessage::PingFailed {
                                        error: e.to_string(),
                                    })
                                    .await;
                            }
                        });
                    }
                }
            }
        });

        match self.ctx.router.clone() {
            Some(router) => self.spawn_transport_init(&router, bus),
            None => {
                // Data-only channel: no transports to negotiate
                self.state = SessionState::Connected;
                let _ = self
                    .ctx
                    .channel_tx
                    .send(ChannelMessage::SessionConnected {
                        session_id: self.session_id.clone(),
                    })
                    .await;
            }
        }
    }

    /// Create both transports and run the capability exchange, off-loop.
    fn spawn_transport_init(&self, router: &Arc<dyn MediaRouter>, bus: Bus) {
        let router = Arc::clone(router);
        let self_tx = self.self_sender.clone();
        let config = Arc::clone(&self.ctx.config);
        let options = TransportOptions {
            webrtc_server_id: self.ctx.webrtc_server_id.clone(),
            enable_sctp: true,
            max_buf_in: config.max_buf_in,
            max_buf_out: config.max_buf_out,
        };

        tokio::spawn(async move {
            let (cts, stc) = tokio::join!(
                router.create_webrtc_transport(&options),
                router.create_webrtc_transport(&options),
            );

            let (cts, stc) = match (cts, stc) {
                (Ok(cts), Ok(stc)) => (cts, stc),
                (cts, stc) => {
                    // Release whichever side came up
                    if let Ok(t) = cts {
                        t.close().await;
                    }
                    if let Ok(t) = stc {
                        t.close().await;
                    }
                    let _ = self_tx
                        .send(SessionMessage::ConnectFailed {
                            error: "transport creation failed".to_string(),
                        })
                        .await;
                    return;
                }
            };

            let payload = InitTransportsPayload {
                capabilities: router.rtp_capabilities(),
                stc_config: transport_config(&stc),
                cts_config: transport_config(&cts),
                producer_options_by_kind: json!({
                    "audio": {},
                    "video": { "maxBitrate": config.max_video_bitrate },
                }),
            };
            let message = BusMessage::new(
                names::INIT_TRANSPORTS,
                serde_json::to_value(payload).unwrap_or_default(),
            );

            match bus.request(message).await {
                Ok(response) => {
                    let _ = self_tx
                        .send(SessionMessage::TransportsReady {
                            cts,
                            stc,
                            capabilities: response.payload,
                        })
                        .await;
                }
                Err(e) => {
                    cts.close().await;
                    stc.close().await;
                    let _ = self_tx
                        .send(SessionMessage::ConnectFailed {
                            error: format!("capability exchange failed: {e}"),
                        })
                        .await;
                }
            }
        });
    }

    async fn handle_transports_ready(
        &mut self,
        cts: Arc<dyn MediaTransport>,
        stc: Arc<dyn MediaTransport>,
        capabilities: serde_json::Value,
    ) {
        if self.state == SessionState::Closed {
            // Closed while the transports were being built; release them
            cts.close().await;
            stc.close().await;
            return;
        }

        if let Err(e) = cts
            .set_max_incoming_bitrate(self.ctx.config.max_bitrate_in)
            .await
        {
            warn!(target: "sfu.actor.session", session_id = %self.session_id, error = %e, "Incoming bitrate cap failed");
        }
        if let Err(e) = stc
            .set_max_outgoing_bitrate(self.ctx.config.max_bitrate_out)
            .await
        {
            warn!(target: "sfu.actor.session", session_id = %self.session_id, error = %e, "Outgoing bitrate cap failed");
        }

        self.cts = Some(cts);
        self.stc = Some(stc);
        self.capabilities = Some(capabilities);
        self.state = SessionState::Connected;

        info!(
            target: "sfu.actor.session",
            session_id = %self.session_id,
            "Session connected"
        );

        let _ = self
            .ctx
            .channel_tx
            .send(ChannelMessage::SessionConnected {
                session_id: self.session_id.clone(),
            })
            .await;
    }

    async fn handle_bus_event(&mut self, event: BusEvent) {
        match event {
            BusEvent::Message(message) => self.handle_client_message(message).await,
            BusEvent::Request {
                message,
                response_to,
            } => self.handle_client_request(message, response_to).await,
            BusEvent::Closed { error } => {
                let reason = if error.is_some() {
                    CloseReason::LinkError
                } else {
                    CloseReason::LinkClosed
                };
                self.close_session(reason, error).await;
            }
        }
    }

    async fn handle_client_message(&mut self, message: BusMessage) {
        match message.name.as_str() {
            names::PRODUCTION_CHANGE => {
                let Ok(change) =
                    serde_json::from_value::<ProductionChangePayload>(message.payload)
                else {
                    debug!(target: "sfu.actor.session", session_id = %self.session_id, "Malformed PRODUCTION_CHANGE");
                    return;
                };
                self.handle_production_change(change).await;
            }
            names::CONSUMPTION_CHANGE => {
                let Ok(change) =
                    serde_json::from_value::<ConsumptionChangePayload>(message.payload)
                else {
                    debug!(target: "sfu.actor.session", session_id = %self.session_id, "Malformed CONSUMPTION_CHANGE");
                    return;
                };
                self.handle_consumption_change(change).await;
            }
            names::INFO_CHANGE => {
                let Ok(change) = serde_json::from_value::<InfoChangePayload>(message.payload)
                else {
                    debug!(target: "sfu.actor.session", session_id = %self.session_id, "Malformed INFO_CHANGE");
                    return;
                };
                self.handle_info_change(change).await;
            }
            names::BROADCAST => {
                let broadcast =
                    serde_json::from_value::<BroadcastPayload>(message.payload).unwrap_or(
                        BroadcastPayload {
                            message: serde_json::Value::Null,
                        },
                    );
                let relayed = PeerBroadcastPayload {
                    sender_id: self.session_id.clone(),
                    message: broadcast.message,
                };
                let _ = self
                    .ctx
                    .channel_tx
                    .send(ChannelMessage::Fanout {
                        from: self.session_id.clone(),
                        message: BusMessage::new(
                            names::BROADCAST,
                            serde_json::to_value(relayed).unwrap_or_default(),
                        ),
                        batch: true,
                    })
                    .await;
            }
            other => {
                debug!(
                    target: "sfu.actor.session",
                    session_id = %self.session_id,
                    name = %other,
                    "Unknown client message"
                );
            }
        }
    }

    async fn handle_client_request(&mut self, message: BusMessage, response_to: String) {
        let Some(bus) = self.bus.clone() else {
            return;
        };
        match message.name.as_str() {
            names::INIT_PRODUCER => {
                match serde_json::from_value::<InitProducerPayload>(message.payload) {
                    Ok(request) => self.handle_produce(request, &response_to).await,
                    Err(_) => bus.respond_error(&response_to, "malformed INIT_PRODUCER"),
                }
            }
            names::CONNECT_CTS_TRANSPORT | names::CONNECT_STC_TRANSPORT => {
                let transport = if message.name == names::CONNECT_CTS_TRANSPORT {
                    self.cts.clone()
                } else {
                    self.stc.clone()
                };
                match serde_json::from_value::<ConnectTransportPayload>(message.payload) {
                    Ok(request) => match transport {
                        Some(transport) => {
                            match transport.connect(&request.dtls_parameters).await {
                                Ok(()) => {
                                    let _ = bus.respond(
                                        &response_to,
                                        BusMessage::new(&message.name, json!({})),
                                    );
                                }
                                Err(e) => {
                                    self.record_error(format!("transport connect: {e}")).await;
                                    bus.respond_error(&response_to, "transport connect failed");
                                }
                            }
                        }
                        None => bus.respond_error(&response_to, "transport not ready"),
                    },
                    Err(_) => bus.respond_error(&response_to, "malformed transport connect"),
                }
            }
            other => {
                debug!(
                    target: "sfu.actor.session",
                    session_id = %self.session_id,
                    name = %other,
                    "Unknown client request"
                );
                bus.respond_error(&response_to, "unknown request");
            }
        }
    }

    /// Handle `INIT_PRODUCER`: one producer per stream slot, prior producer
    /// closed first.
    async fn handle_produce(&mut self, request: InitProducerPayload, response_to: &str) {
        let Some(bus) = self.bus.clone() else {
            return;
        };
        let Some(cts) = self.cts.clone() else {
            bus.respond_error(response_to, "transport not ready");
            return;
        };

        if let Some(prior) = self.producers.remove(&request.stream) {
            prior.close().await;
        }

        match cts.produce(request.kind, &request.rtp_parameters).await {
            Err(e) => {
                self.record_error(format!("produce {}: {e}", request.stream))
                    .await;
                bus.respond_error(response_to, "producer creation failed");
            }
            Ok(producer) => {
                let producer_id = producer.id().to_string();
                self.producers.insert(request.stream, producer);

                match request.stream {
                    StreamKind::Camera => self.info.is_camera_on = Some(true),
                    StreamKind::Screen => self.info.is_screen_sharing_on = Some(true),
                    StreamKind::Audio => {}
                }

                debug!(
                    target: "sfu.actor.session",
                    session_id = %self.session_id,
                    stream = %request.stream,
                    producer_id = %producer_id,
                    "Producer created"
                );

                self.update_remote_consumers().await;
                self.broadcast_info().await;

                let _ = bus.respond(
                    response_to,
                    BusMessage::new(names::INIT_PRODUCER, json!({ "id": producer_id })),
                );
            }
        }
    }

    async fn handle_production_change(&mut self, change: ProductionChangePayload) {
        match change.stream {
            StreamKind::Camera => self.info.is_camera_on = Some(change.active),
            StreamKind::Screen => self.info.is_screen_sharing_on = Some(change.active),
            StreamKind::Audio => {}
        }

        if let Some(producer) = self.producers.get(&change.stream).cloned() {
            let result = if change.active {
                producer.resume().await
            } else {
                producer.pause().await
            };
            if let Err(e) = result {
                self.record_error(format!("production change {}: {e}", change.stream))
                    .await;
            }
        }

        self.update_remote_consumers().await;
        self.broadcast_info().await;
    }

    async fn handle_consumption_change(&mut self, change: ConsumptionChangePayload) {
        let consumers: Vec<(StreamKind, bool, Arc<dyn MediaConsumer>)> = self
            .consumers
            .get(&change.session_id)
            .map(|entry| {
                change
                    .states
                    .iter()
                    .filter_map(|(kind, active)| {
                        entry
                            .slots
                            .get(kind)
                            .map(|consumer| (*kind, *active, Arc::clone(consumer)))
                    })
                    .collect()
            })
            .unwrap_or_default();

        for (kind, active, consumer) in consumers {
            let result = if active {
                consumer.resume().await
            } else {
                consumer.pause().await
            };
            if let Err(e) = result {
                self.record_error(format!("consumption change {kind}: {e}")).await;
            }
        }
    }

    async fn handle_info_change(&mut self, change: InfoChangePayload) {
        let changed = self.info.apply(&change.info);

        if change.need_refresh == Some(true) {
            if let Some(bus) = self.bus.clone() {
                let channel_tx = self.ctx.channel_tx.clone();
                tokio::spawn(async move {
                    let (tx, rx) = oneshot::channel();
                    if channel_tx
                        .send(ChannelMessage::GetInfoSnapshot { respond_to: tx })
                        .await
                        .is_ok()
                    {
                        if let Ok(snapshot) = rx.await {
                            let _ = bus.send(
                                BusMessage::new(
                                    names::S_INFO_CHANGE,
                                    serde_json::to_value(snapshot).unwrap_or_default(),
                                ),
                                false,
                            );
                        }
                    }
                });
            }
        }

        if changed {
            self.broadcast_info().await;
        }
    }

    /// Schedule consumer reconciliation on every peer after this session's
    /// producer set changed.
    async fn update_remote_consumers(&self) {
        let _ = self
            .ctx
            .channel_tx
            .send(ChannelMessage::ReconcilePeers {
                from: self.session_id.clone(),
            })
            .await;
    }

    /// Push the info record to the channel cache and to every peer.
    async fn broadcast_info(&self) {
        let _ = self
            .ctx
            .channel_tx
            .send(ChannelMessage::InfoUpdated {
                session_id: self.session_id.clone(),
                info: self.info.clone(),
            })
            .await;

        let payload = json!({ self.session_id.as_str(): self.info });
        let _ = self
            .ctx
            .channel_tx
            .send(ChannelMessage::Fanout {
                from: self.session_id.clone(),
                message: BusMessage::new(names::S_INFO_CHANGE, payload),
                batch: true,
            })
            .await;
    }

    /// Start (or refresh) consumption of a peer's producers. Idempotent;
    /// overlapping calls for the same peer resolve through
    /// [`SessionMessage::ConsumeOutcome`].
    fn handle_consume_from(&mut self, peer: &SessionActorHandle) {
        if *peer.session_id() == self.session_id || self.state != SessionState::Connected {
            return;
        }
        let Some(router) = self.ctx.router.clone() else {
            return;
        };
        let (Some(stc), Some(capabilities), Some(bus)) = (
            self.stc.clone(),
            self.capabilities.clone(),
            self.bus.clone(),
        ) else {
            return;
        };

        let peer_id = peer.session_id().clone();
        let entry = self
            .consumers
            .entry(peer_id.clone())
            .or_insert_with(|| PeerConsumers {
                handle: peer.clone(),
                slots: HashMap::new(),
            });
        entry.handle = peer.clone();
        let existing: Vec<StreamKind> = entry.slots.keys().copied().collect();

        let peer = peer.clone();
        let self_tx = self.self_sender.clone();
        tokio::spawn(async move {
            let results =
                run_consume(&peer, &router, &stc, &capabilities, &bus, existing).await;
            if !results.is_empty() {
                let _ = self_tx
                    .send(SessionMessage::ConsumeOutcome { peer_id, results })
                    .await;
            }
        });
    }

    async fn handle_consume_outcome(&mut self, peer_id: SessionId, results: Vec<ConsumeResult>) {
        // A closed session (or a reaped peer) takes no new consumers
        let entry_exists = self.state != SessionState::Closed && self.consumers.contains_key(&peer_id);
        if !entry_exists {
            for result in results {
                if let ConsumeResult::Install { consumer, .. } = result {
                    tokio::spawn(async move { consumer.close().await });
                }
            }
            return;
        }

        let mut errors: Vec<String> = Vec::new();
        let mut retry = false;

        if let Some(entry) = self.consumers.get_mut(&peer_id) {
            for result in results {
                match result {
                    ConsumeResult::Install {
                        kind,
                        consumer,
                        producer_paused,
                    } => {
                        if entry.slots.contains_key(&kind) {
                            // Lost a duplicate-slot race; drop the newcomer
                            debug!(
                                target: "sfu.actor.session",
                                session_id = %self.session_id,
                                peer = %peer_id,
                                stream = %kind,
                                "Duplicate consumer discarded"
                            );
                            tokio::spawn(async move { consumer.close().await });
                            continue;
                        }
                        if !producer_paused {
                            if let Err(e) = consumer.resume().await {
                                errors.push(format!("consumer resume {kind}: {e}"));
                                retry = true;
                                let consumer = Arc::clone(&consumer);
                                tokio::spawn(async move { consumer.close().await });
                                continue;
                            }
                        }
                        entry.slots.insert(kind, consumer);
                    }
                    ConsumeResult::Reconcile {
                        kind,
                        producer_paused,
                    } => {
                        let Some(consumer) = entry.slots.get(&kind) else {
                            continue;
                        };
                        if consumer.paused() != producer_paused {
                            let result = if producer_paused {
                                consumer.pause().await
                            } else {
                                consumer.resume().await
                            };
                            if let Err(e) = result {
                                errors.push(format!("consumer reconcile {kind}: {e}"));
                                retry = true;
                                if let Some(consumer) = entry.slots.remove(&kind) {
                                    tokio::spawn(async move { consumer.close().await });
                                }
                            }
                        }
                    }
                    ConsumeResult::Failed { kind, error } => {
                        errors.push(format!("consume {kind}: {error}"));
                        retry = true;
                    }
                }
            }
        }

        for error in errors {
            self.record_error(error).await;
        }

        if retry
            && self.state == SessionState::Connected
            && self.consumers.contains_key(&peer_id)
        {
            self.arm_recovery(peer_id);
        }
    }

    /// Arm the per-peer single-shot recovery timer, replacing any prior one.
    fn arm_recovery(&mut self, peer_id: SessionId) {
        if let Some(prior) = self.recovery.remove(&peer_id) {
            prior.cancel();
        }
        let token = CancellationToken::new();
        self.recovery.insert(peer_id.clone(), token.clone());

        let delay = self.ctx.config.timeouts.recovery;
        let self_tx = self.self_sender.clone();
        let cancel = self.cancel_token.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    let _ = self_tx.send(SessionMessage::RecoveryTick { peer_id }).await;
                }
            }
        });
    }

    fn handle_peer_closed(&mut self, session_id: &SessionId) {
        if let Some(token) = self.recovery.remove(session_id) {
            token.cancel();
        }
        if let Some(entry) = self.consumers.remove(session_id) {
            tokio::spawn(async move {
                for (_, consumer) in entry.slots {
                    consumer.close().await;
                }
            });
        }
    }

    fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            session_id: self.session_id.clone(),
            connected: self.state == SessionState::Connected,
            producers: self
                .producers
                .iter()
                .map(|(kind, producer)| {
                    (
                        *kind,
                        ProducerSnapshot {
                            id: producer.id().to_string(),
                            paused: producer.paused(),
                        },
                    )
                })
                .collect(),
        }
    }

    async fn collect_stats(&self) -> SessionStats {
        let mut bitrate = BitrateStats::default();
        for (kind, producer) in &self.producers {
            let producer_bitrate = producer.get_stats().await.map_or(0, |s| s.bitrate);
            bitrate.add(*kind, producer_bitrate);
        }
        SessionStats {
            session_id: self.session_id.clone(),
            bitrate,
            info: self.info.clone(),
        }
    }

    /// Record an error against the session budget; exhausting the budget
    /// closes the session.
    async fn record_error(&mut self, error: String) {
        warn!(
            target: "sfu.actor.session",
            session_id = %self.session_id,
            error = %error,
            errors = self.errors.len() + 1,
            "Session error recorded"
        );
        self.errors.push(error);

        if self.errors.len() > MAX_SESSION_ERRORS && self.state != SessionState::Closed {
            let cause = self.errors.join("; ");
            self.close_session(CloseReason::Error, Some(cause)).await;
        }
    }

    /// Tear the session down. Idempotent; CLOSED is terminal.
    async fn close_session(&mut self, reason: CloseReason, cause: Option<String>) {
        if self.state == SessionState::Closed {
            return;
        }

        info!(
            target: "sfu.actor.session",
            session_id = %self.session_id,
            reason = ?reason,
            cause = cause.as_deref().unwrap_or(""),
            "Closing session"
        );

        // Stop ping/deadline/pump/recovery tasks
        self.cancel_token.cancel();
        for (_, token) in self.recovery.drain() {
            token.cancel();
        }

        for (_, entry) in self.consumers.drain() {
            for (_, consumer) in entry.slots {
                // Already-closed consumers are fine
                consumer.close().await;
            }
        }
        for (_, producer) in self.producers.drain() {
            producer.close().await;
        }
        if let Some(transport) = self.cts.take() {
            transport.close().await;
        }
        if let Some(transport) = self.stc.take() {
            transport.close().await;
        }

        let was_initialized = self.bus.is_some();
        if was_initialized && reason != CloseReason::ChannelClosed {
            // Tell the peers' clients to clean up; their server-side
            // consumers are reaped when the channel removes this session
            let payload = SessionLeavePayload {
                session_id: self.session_id.clone(),
            };
            let _ = self
                .ctx
                .channel_tx
                .send(ChannelMessage::Fanout {
                    from: self.session_id.clone(),
                    message: BusMessage::new(
                        names::SESSION_LEAVE,
                        serde_json::to_value(payload).unwrap_or_default(),
                    ),
                    batch: true,
                })
                .await;
        }

        self.state = SessionState::Closed;

        if let Some(bus) = self.bus.take() {
            bus.close_link(reason.link_close_code(), &format!("{reason:?}")).await;
        }

        let _ = self
            .ctx
            .channel_tx
            .send(ChannelMessage::SessionClosed {
                session_id: self.session_id.clone(),
                instance: self.instance,
                reason,
            })
            .await;
    }
}

/// Build consumers for every producible stream of `peer` that this session
/// does not hold yet, and reconcile paused state for those it does.
async fn run_consume(
    peer: &SessionActorHandle,
    router: &Arc<dyn MediaRouter>,
    stc: &Arc<dyn MediaTransport>,
    capabilities: &serde_json::Value,
    bus: &Bus,
    existing: Vec<StreamKind>,
) -> Vec<ConsumeResult> {
    let Ok(snapshot) = peer.get_snapshot().await else {
        // Peer is gone; its close notification will reap state
        return Vec::new();
    };
    if !snapshot.connected {
        return Vec::new();
    }

    let mut results = Vec::new();
    for kind in StreamKind::ALL {
        let Some(producer) = snapshot.producers.get(&kind) else {
            continue;
        };

        if existing.contains(&kind) {
            results.push(ConsumeResult::Reconcile {
                kind,
                producer_paused: producer.paused,
            });
            continue;
        }

        if !router.can_consume(&producer.id, capabilities).await {
            continue;
        }

        match stc.consume(&producer.id, capabilities, true).await {
            Err(e) => results.push(ConsumeResult::Failed {
                kind,
                error: e.to_string(),
            }),
            Ok(consumer) => {
                let init = InitConsumerPayload {
                    id: consumer.id().to_string(),
                    kind: consumer.kind(),
                    producer_id: producer.id.clone(),
                    rtp_parameters: consumer.rtp_parameters(),
                    session_id: snapshot.session_id.clone(),
                    active: !producer.paused,
                    stream: kind,
                };
                let message = BusMessage::new(
                    names::INIT_CONSUMER,
                    serde_json::to_value(init).unwrap_or_default(),
                );
                match bus.request_batched(message).await {
                    Ok(_) => results.push(ConsumeResult::Install {
                        kind,
                        consumer,
                        producer_paused: producer.paused,
                    }),
                    Err(e) => {
                        consumer.close().await;
                        results.push(ConsumeResult::Failed {
                            kind,
                            error: e.to_string(),
                        });
                    }
                }
            }
        }
    }
    results
}
