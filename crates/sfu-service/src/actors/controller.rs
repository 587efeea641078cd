//! `ControllerActor` - singleton process registry.
//!
//! The controller owns the channel registries (by uuid and by issuer), the
//! binding of channels to pool workers, and the process-wide operations:
//! idempotent channel creation, forced disconnect, soft reset and shutdown.
//!
//! Channels deregister themselves through [`ControllerMessage::ChannelClosed`]
//! when they close for any reason (explicit, idle deadline, worker death),
//! so the registry never holds a dead channel.

use common::types::{ChannelId, SessionId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::channel::{ChannelActor, ChannelActorHandle};
use super::messages::{ChannelAccess, ChannelStats, ControllerMessage};
use crate::config::Config;
use crate::errors::SfuError;
use crate::media::codecs;
use crate::workers::WorkerPool;

/// Default channel buffer size for the controller mailbox.
const CONTROLLER_CHANNEL_BUFFER: usize = 1000;

/// Handle to the `ControllerActor`.
///
/// This is the public interface for interacting with the controller.
#[derive(Clone)]
pub struct ControllerActorHandle {
    sender: mpsc::Sender<ControllerMessage>,
    cancel_token: CancellationToken,
}

impl ControllerActorHandle {
    /// Create a new `ControllerActor` and return a handle to it.
    ///
    /// `pool` is absent when the process runs without a media engine; every
    /// channel is then data-only.
    #[must_use]
    pub fn new(pool: Option<WorkerPool>, config: Arc<Config>) -> Self {
        let (sender, receiver) = mpsc::channel(CONTROLLER_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();

        let actor = ControllerActor {
            receiver,
            self_sender: sender.clone(),
            cancel_token: cancel_token.clone(),
            channels: HashMap::new(),
            by_issuer: HashMap::new(),
            pool,
            config,
        };

        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
        }
    }

    /// Create (or return the existing) channel for `(remote_addr, issuer)`.
    pub async fn create_channel(
        &self,
        remote_addr: String,
        issuer: String,
        key: Option<Vec<u8>>,
        use_webrtc: bool,
    ) -> Result<ChannelId, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerMessage::CreateChannel {
                remote_addr,
                issuer,
                key,
                use_webrtc,
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("controller send failed: {e}")))?;
        rx.await
            .map_err(|e| SfuError::Internal(format!("controller receive failed: {e}")))?
    }

    /// Look up a channel by uuid.
    pub async fn get_channel(&self, uuid: ChannelId) -> Result<Option<ChannelAccess>, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerMessage::GetChannel {
                uuid,
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("controller send failed: {e}")))?;
        rx.await
            .map_err(|e| SfuError::Internal(format!("controller receive failed: {e}")))
    }

    /// Statistics for every channel.
    pub async fn get_stats(&self) -> Result<Vec<ChannelStats>, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerMessage::GetStats { respond_to: tx })
            .await
            .map_err(|e| SfuError::Internal(format!("controller send failed: {e}")))?;
        rx.await
            .map_err(|e| SfuError::Internal(format!("controller receive failed: {e}")))
    }

    /// Force-disconnect sessions on channels created from `remote_addr`.
    pub async fn disconnect(
        &self,
        remote_addr: String,
        sessions: HashMap<Uuid, Vec<String>>,
    ) -> Result<(), SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerMessage::Disconnect {
                remote_addr,
                sessions,
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("controller send failed: {e}")))?;
        rx.await
            .map_err(|e| SfuError::Internal(format!("controller receive failed: {e}")))?
    }

    /// Close every channel but keep the process up (soft reset).
    pub async fn close_all(&self) -> Result<(), SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerMessage::CloseAll { respond_to: tx })
            .await
            .map_err(|e| SfuError::Internal(format!("controller send failed: {e}")))?;
        rx.await
            .map_err(|e| SfuError::Internal(format!("controller receive failed: {e}")))
    }

    /// Close every channel and stop the actor.
    pub async fn shutdown(&self) -> Result<(), SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerMessage::Shutdown { respond_to: tx })
            .await
            .map_err(|e| SfuError::Internal(format!("controller send failed: {e}")))?;
        rx.await
            .map_err(|e| SfuError::Internal(format!("controller receive failed: {e}")))
    }

    /// Whether the controller has stopped.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

struct ChannelRecord {
    handle: ChannelActorHandle,
    key: Option<Vec<u8>>,
    remote_addr: String,
    safe_issuer: String,
}

/// The `ControllerActor` implementation.
struct ControllerActor {
    receiver: mpsc::Receiver<ControllerMessage>,
    /// Handed to channels so they can deregister on close.
    self_sender: mpsc::Sender<ControllerMessage>,
    cancel_token: CancellationToken,
    channels: HashMap<ChannelId, ChannelRecord>,
    by_issuer: HashMap<String, ChannelId>,
    pool: Option<WorkerPool>,
    config: Arc<Config>,
}

impl ControllerActor {
    /// Run the actor message loop.
    #[instrument(skip_all, name = "sfu.actor.controller")]
    async fn run(mut self) {
        info!(target: "sfu.actor.controller", "ControllerActor started");

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => break,

                msg = self.receiver.recv() => {
                    match msg {
                        Some(ControllerMessage::Shutdown { respond_to }) => {
                            self.close_all_channels().await;
                            let _ = respond_to.send(());
                            self.cancel_token.cancel();
                            break;
                        }
                        Some(message) => self.handle_message(message).await,
                        None => break,
                    }
                }
            }
        }

        info!(
            target: "sfu.actor.controller",
            channels = self.channels.len(),
            "ControllerActor stopped"
        );
    }

    async fn handle_message(&mut self, message: ControllerMessage) {
        match message {
            ControllerMessage::CreateChannel {
                remote_addr,
                issuer,
                key,
                use_webrtc,
                respond_to,
            } => {
                let result = self
                    .handle_create(remote_addr, &issuer, key, use_webrtc)
                    .await;
                let _ = respond_to.send(result);
            }
            ControllerMessage::GetChannel { uuid, respond_to } => {
                let access = self.channels.get(&uuid).map(|record| ChannelAccess {
                    uuid,
                    handle: record.handle.clone(),
                    key: record.key.clone(),
                    remote_addr: record.remote_addr.clone(),
                });
                let _ = respond_to.send(access);
            }
            ControllerMessage::ChannelClosed { uuid } => {
                if let Some(record) = self.channels.remove(&uuid) {
                    self.by_issuer.remove(&record.safe_issuer);
                    debug!(
                        target: "sfu.actor.controller",
                        channel = %uuid,
                        channels = self.channels.len(),
                        "Channel deregistered"
                    );
                }
            }
            ControllerMessage::GetStats { respond_to } => {
                let handles: Vec<ChannelActorHandle> = self
                    .channels
                    .values()
                    .map(|record| record.handle.clone())
                    .collect();
                tokio::spawn(async move {
                    let queries = handles.iter().map(ChannelActorHandle::get_stats);
                    let stats = futures::future::join_all(queries)
                        .await
                        .into_iter()
                        .filter_map(Result::ok)
                        .collect();
                    let _ = respond_to.send(stats);
                });
            }
            ControllerMessage::Disconnect {
                remote_addr,
                sessions,
                respond_to,
            } => {
                for (uuid, session_ids) in sessions {
                    let Some(record) = self.channels.get(&ChannelId(uuid)) else {
                        continue;
                    };
                    // Only the channel's creator may disconnect its sessions
                    if record.remote_addr != remote_addr {
                        continue;
                    }
                    record
                        .handle
                        .kick(session_ids.into_iter().map(SessionId::from).collect())
                        .await;
                }
                let _ = respond_to.send(Ok(()));
            }
            ControllerMessage::CloseAll { respond_to } => {
                self.close_all_channels().await;
                let _ = respond_to.send(());
            }
            ControllerMessage::Shutdown { .. } => {
                // Handled in the run loop
            }
        }
    }

    /// Idempotent channel creation keyed on `remote_addr "::" issuer`.
    async fn handle_create(
        &mut self,
        remote_addr: String,
        issuer: &str,
        key: Option<Vec<u8>>,
        use_webrtc: bool,
    ) -> Result<ChannelId, SfuError> {
        let safe_issuer = format!("{remote_addr}::{issuer}");
        if let Some(uuid) = self.by_issuer.get(&safe_issuer) {
            return Ok(*uuid);
        }

        let (router, webrtc_server_id, worker_died) = if use_webrtc {
            let Some(pool) = &self.pool else {
                return Err(SfuError::Config(
                    "no media engine configured; only data-only channels are possible"
                        .to_string(),
                ));
            };
            let pool_worker = pool.get_worker().await?;
            let selected = codecs::select(&self.config.audio_codecs, &self.config.video_codecs);
            let router = pool_worker.worker.create_router(&selected).await?;
            (
                Some(router),
                Some(pool_worker.webrtc_server.id().to_string()),
                Some(pool_worker.worker.died()),
            )
        } else {
            (None, None, None)
        };

        let uuid = ChannelId::new();
        let (handle, _task) = ChannelActor::spawn(
            uuid,
            router,
            webrtc_server_id,
            worker_died,
            self.self_sender.clone(),
            Arc::clone(&self.config),
        );

        self.channels.insert(
            uuid,
            ChannelRecord {
                handle,
                key,
                remote_addr,
                safe_issuer: safe_issuer.clone(),
            },
        );
        self.by_issuer.insert(safe_issuer, uuid);

        info!(
            target: "sfu.actor.controller",
            channel = %uuid,
            webrtc = use_webrtc,
            channels = self.channels.len(),
            "Channel created"
        );

        Ok(uuid)
    }

    async fn close_all_channels(&mut self) {
        info!(
            target: "sfu.actor.controller",
            channels = self.channels.len(),
            "Closing all channels"
        );
        for record in self.channels.values() {
            record.handle.close().await;
        }
        // Registry entries are dropped as ChannelClosed notices arrive; on
        // shutdown the whole map goes with the actor
    }
}
