//! `ChannelActor` - per-channel registry of sessions.
//!
//! Each `ChannelActor`:
//! - Owns the session map and enforces the channel capacity
//! - Replaces sessions that rejoin with a duplicate id
//! - Meshes newly connected sessions with their peers and fans out
//!   broadcasts and info updates
//! - Arms the idle-close timer whenever at most one session remains
//! - Closes with its worker, its idle deadline, or an explicit close,
//!   terminating every session with the channel-closed reason
//!
//! A channel with a router is pinned to one worker for its entire life;
//! the worker's death token is watched directly in the actor loop.

use common::types::{ChannelId, SessionId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::messages::{
    BitrateStats, ChannelMessage, ChannelStats, CloseReason, ControllerMessage, SessionInfo,
    SessionStats,
};
use super::session::{SessionActor, SessionActorHandle, SessionContext};
use crate::config::Config;
use crate::errors::SfuError;
use crate::media::MediaRouter;

/// Default channel buffer size for the channel mailbox.
const CHANNEL_BUFFER: usize = 500;

/// How long a stats aggregation waits on one session before skipping it.
const STATS_QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);

/// Handle to a `ChannelActor`.
#[derive(Clone)]
pub struct ChannelActorHandle {
    sender: mpsc::Sender<ChannelMessage>,
    cancel_token: CancellationToken,
    uuid: ChannelId,
}

impl ChannelActorHandle {
    /// Get the channel UUID.
    #[must_use]
    pub fn uuid(&self) -> ChannelId {
        self.uuid
    }

    /// Install a session. A session with the same id is replaced.
    ///
    /// # Errors
    ///
    /// `SfuError::Overcrowded` at capacity; internal errors if the channel
    /// is gone.
    pub async fn join(&self, session_id: SessionId) -> Result<SessionActorHandle, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ChannelMessage::Join {
                session_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;
        rx.await
            .map_err(|e| SfuError::Internal(format!("channel receive failed: {e}")))?
    }

    /// Aggregate channel statistics.
    pub async fn get_stats(&self) -> Result<ChannelStats, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ChannelMessage::GetStats { respond_to: tx })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;
        rx.await
            .map_err(|e| SfuError::Internal(format!("channel receive failed: {e}")))
    }

    /// Per-session statistics.
    pub async fn get_sessions_stats(&self) -> Result<Vec<SessionStats>, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ChannelMessage::GetSessionsStats { respond_to: tx })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;
        rx.await
            .map_err(|e| SfuError::Internal(format!("channel receive failed: {e}")))
    }

    /// Force-close the named sessions.
    pub async fn kick(&self, session_ids: Vec<SessionId>) {
        let _ = self.sender.send(ChannelMessage::Kick { session_ids }).await;
    }

    /// Close the channel and every session in it.
    pub async fn close(&self) {
        let _ = self.sender.send(ChannelMessage::Close).await;
    }

    /// Whether the channel has closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Wait until the channel closes.
    pub async fn closed(&self) {
        self.cancel_token.cancelled().await;
    }
}

struct SessionEntry {
    handle: SessionActorHandle,
    instance: Uuid,
    connected: bool,
    info: SessionInfo,
}

/// The `ChannelActor` implementation.
pub struct ChannelActor {
    uuid: ChannelId,
    created_at: i64,
    receiver: mpsc::Receiver<ChannelMessage>,
    /// Cloned into sessions so they can reach the channel.
    self_sender: mpsc::Sender<ChannelMessage>,
    cancel_token: CancellationToken,
    sessions: HashMap<SessionId, SessionEntry>,
    router: Option<Arc<dyn MediaRouter>>,
    webrtc_server_id: Option<String>,
    /// Fires when the worker this channel is pinned to dies.
    worker_died: Option<CancellationToken>,
    controller_tx: mpsc::Sender<ControllerMessage>,
    config: Arc<Config>,
    /// Armed whenever at most one session remains.
    idle_deadline: Option<Instant>,
}

impl ChannelActor {
    /// Spawn a new channel actor.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        uuid: ChannelId,
        router: Option<Arc<dyn MediaRouter>>,
        webrtc_server_id: Option<String>,
        worker_died: Option<CancellationToken>,
        controller_tx: mpsc::Sender<ControllerMessage>,
        config: Arc<Config>,
    ) -> (ChannelActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();

        let actor = Self {
            uuid,
            created_at: chrono::Utc::now().timestamp(),
            receiver,
            self_sender: sender.clone(),
            cancel_token: cancel_token.clone(),
            sessions: HashMap::new(),
            router,
            webrtc_server_id,
            worker_died,
            controller_tx,
            // A single participant is not a live call; the idle deadline
            // runs from creation
            idle_deadline: Some(Instant::now() + config.timeouts.channel),
            config,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = ChannelActorHandle {
            sender,
            cancel_token,
            uuid,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "sfu.actor.channel", fields(channel = %self.uuid))]
    async fn run(mut self) {
        info!(
            target: "sfu.actor.channel",
            channel = %self.uuid,
            webrtc = self.router.is_some(),
            "ChannelActor started"
        );

        let worker_died = self.worker_died.clone();

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    self.close_channel().await;
                    break;
                }

                () = async {
                    match &worker_died {
                        Some(token) => token.cancelled().await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    warn!(
                        target: "sfu.actor.channel",
                        channel = %self.uuid,
                        "Worker died, closing channel"
                    );
                    self.close_channel().await;
                    break;
                }

                () = tokio::time::sleep_until(
                    self.idle_deadline.unwrap_or_else(Instant::now)
                ), if self.idle_deadline.is_some() => {
                    info!(
                        target: "sfu.actor.channel",
                        channel = %self.uuid,
                        sessions = self.sessions.len(),
                        "Idle deadline fired, closing channel"
                    );
                    self.close_channel().await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(ChannelMessage::Close) => {
                            self.close_channel().await;
                            break;
                        }
                        Some(message) => self.handle_message(message).await,
                        None => break,
                    }
                }
            }
        }

        info!(
            target: "sfu.actor.channel",
            channel = %self.uuid,
            "ChannelActor stopped"
        );
    }

    async fn handle_message(&mut self, message: ChannelMessage) {
        match message {
            ChannelMessage::Join {
                session_id,
                respond_to,
            } => {
                let result = self.handle_join(session_id).await;
                let _ = respond_to.send(result);
            }
            ChannelMessage::SessionConnected { session_id } => {
                self.handle_session_connected(&session_id).await;
            }
            ChannelMessage::SessionClosed {
                session_id,
                instance,
                reason,
            } => {
                self.handle_session_closed(&session_id, instance, reason).await;
            }
            ChannelMessage::ReconcilePeers { from } => {
                self.handle_reconcile_peers(&from).await;
            }
            ChannelMessage::Fanout {
                from,
                message,
                batch,
            } => {
                for (session_id, entry) in &self.sessions {
                    if *session_id != from {
                        entry.handle.deliver(message.clone(), batch).await;
                    }
                }
            }
            ChannelMessage::InfoUpdated { session_id, info } => {
                if let Some(entry) = self.sessions.get_mut(&session_id) {
                    entry.info = info;
                }
            }
            ChannelMessage::GetInfoSnapshot { respond_to } => {
                let snapshot: HashMap<String, SessionInfo> = self
                    .sessions
                    .iter()
                    .map(|(id, entry)| (id.to_string(), entry.info.clone()))
                    .collect();
                let _ = respond_to.send(snapshot);
            }
            ChannelMessage::GetStats { respond_to } => {
                self.spawn_stats(respond_to);
            }
            ChannelMessage::GetSessionsStats { respond_to } => {
                self.spawn_sessions_stats(respond_to);
            }
            ChannelMessage::Kick { session_ids } => {
                for session_id in session_ids {
                    if let Some(entry) = self.sessions.get(&session_id) {
                        info!(
                            target: "sfu.actor.channel",
                            channel = %self.uuid,
                            session_id = %session_id,
                            "Kicking session"
                        );
                        entry.handle.close(CloseReason::Kicked, None).await;
                    }
                }
            }
            ChannelMessage::Close => {
                // Handled in the run loop
            }
        }
    }

    /// Install a session, replacing a prior session holding the same id.
    async fn handle_join(
        &mut self,
        session_id: SessionId,
    ) -> Result<SessionActorHandle, SfuError> {
        if self.sessions.len() >= self.config.channel_size {
            return Err(SfuError::Overcrowded);
        }

        if let Some(prior) = self.sessions.remove(&session_id) {
            // Detached from the map first so its close notification
            // cannot evict the replacement
            debug!(
                target: "sfu.actor.channel",
                channel = %self.uuid,
                session_id = %session_id,
                "Replacing existing session"
            );
            prior.handle.close(CloseReason::Replaced, None).await;
        }

        let (handle, _task) = SessionActor::spawn(
            session_id.clone(),
            SessionContext {
                channel_id: self.uuid,
                channel_tx: self.self_sender.clone(),
                router: self.router.clone(),
                webrtc_server_id: self.webrtc_server_id.clone(),
                config: Arc::clone(&self.config),
            },
        );

        self.sessions.insert(
            session_id.clone(),
            SessionEntry {
                handle: handle.clone(),
                instance: handle.instance(),
                connected: false,
                info: SessionInfo::default(),
            },
        );

        if self.sessions.len() > 1 {
            self.idle_deadline = None;
        }

        info!(
            target: "sfu.actor.channel",
            channel = %self.uuid,
            session_id = %session_id,
            sessions = self.sessions.len(),
            "Session joined"
        );

        Ok(handle)
    }

    /// Mesh a newly connected session with every connected peer, in both
    /// directions.
    async fn handle_session_connected(&mut self, session_id: &SessionId) {
        let Some(entry) = self.sessions.get_mut(session_id) else {
            return;
        };
        entry.connected = true;
        let new_handle = entry.handle.clone();

        for (peer_id, peer) in &self.sessions {
            if peer_id == session_id || !peer.connected {
                continue;
            }
            peer.handle.consume_from(new_handle.clone()).await;
            new_handle.consume_from(peer.handle.clone()).await;
        }
    }

    async fn handle_session_closed(
        &mut self,
        session_id: &SessionId,
        instance: Uuid,
        reason: CloseReason,
    ) {
        let matches_current = self
            .sessions
            .get(session_id)
            .is_some_and(|entry| entry.instance == instance);
        if !matches_current {
            // A replaced session closing late; the id now belongs to its
            // successor
            return;
        }
        self.sessions.remove(session_id);

        debug!(
            target: "sfu.actor.channel",
            channel = %self.uuid,
            session_id = %session_id,
            reason = ?reason,
            sessions = self.sessions.len(),
            "Session closed"
        );

        for entry in self.sessions.values() {
            entry.handle.peer_closed(session_id.clone()).await;
        }

        if self.sessions.len() <= 1 {
            self.idle_deadline = Some(Instant::now() + self.config.timeouts.channel);
        }
    }

    /// Tell every other connected session to reconcile its consumers
    /// against `from`'s producers.
    async fn handle_reconcile_peers(&mut self, from: &SessionId) {
        let Some(source) = self.sessions.get(from).filter(|e| e.connected) else {
            return;
        };
        let source_handle = source.handle.clone();

        for (peer_id, peer) in &self.sessions {
            if peer_id != from && peer.connected {
                peer.handle.consume_from(source_handle.clone()).await;
            }
        }
    }

    fn spawn_stats(&self, respond_to: oneshot::Sender<ChannelStats>) {
        let handles: Vec<SessionActorHandle> =
            self.sessions.values().map(|e| e.handle.clone()).collect();
        let uuid = self.uuid;
        let created_at = self.created_at;

        tokio::spawn(async move {
            let sessions = collect_session_stats(handles).await;
            let mut bitrate = BitrateStats::default();
            let mut cameras_on = 0;
            let mut screens_on = 0;
            for stats in &sessions {
                bitrate.merge(&stats.bitrate);
                if stats.info.is_camera_on == Some(true) {
                    cameras_on += 1;
                }
                if stats.info.is_screen_sharing_on == Some(true) {
                    screens_on += 1;
                }
            }
            let _ = respond_to.send(ChannelStats {
                uuid,
                created_at,
                sessions: sessions.len(),
                bitrate,
                cameras_on,
                screens_on,
            });
        });
    }

    fn spawn_sessions_stats(&self, respond_to: oneshot::Sender<Vec<SessionStats>>) {
        let handles: Vec<SessionActorHandle> =
            self.sessions.values().map(|e| e.handle.clone()).collect();
        tokio::spawn(async move {
            let _ = respond_to.send(collect_session_stats(handles).await);
        });
    }

    /// Close every session with the channel-closed reason and deregister.
    async fn close_channel(&mut self) {
        self.cancel_token.cancel();
        self.idle_deadline = None;

        let entries: Vec<SessionEntry> = self.sessions.drain().map(|(_, e)| e).collect();
        for entry in &entries {
            entry.handle.close(CloseReason::ChannelClosed, None).await;
        }

        if let Some(router) = self.router.take() {
            router.close().await;
        }

        let _ = self
            .controller_tx
            .send(ControllerMessage::ChannelClosed { uuid: self.uuid })
            .await;
    }
}

async fn collect_session_stats(handles: Vec<SessionActorHandle>) -> Vec<SessionStats> {
    let queries = handles.iter().map(|handle| {
        tokio::time::timeout(STATS_QUERY_TIMEOUT, handle.get_stats())
    });
    futures::future::join_all(queries)
        .await
        .into_iter()
        .filter_map(|result| result.ok().and_then(Result::ok))
        .collect()
}
