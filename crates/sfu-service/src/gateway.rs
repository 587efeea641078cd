//! Gateway: first-message authentication handshake for duplex links.
//!
//! A new link sits in the pending set under an authentication deadline. Its
//! first frame must carry credentials: `{"channelUUID": ..., "jwt": ...}`,
//! or a bare token for legacy clients (whose channel comes from the
//! `sfu_channel_uuid` claim). Verification uses the channel's key when one
//! is installed, the global key otherwise; the legacy path refuses keyed
//! channels outright, since its token was never signed with their key.
//!
//! On success the gateway sends one empty frame ("authenticated"), wraps
//! the link in a bus, joins the channel and hands the bus to the session.
//! From then on the session owns the link and closes it with the code its
//! own close reason maps to.

use common::jwt;
use common::secret::{ExposeSecret, SecretBox};
use common::types::SessionId;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::actors::messages::ChannelAccess;
use crate::actors::ControllerActorHandle;
use crate::bus::{Bus, Link, LinkCloseCode, LinkEvent};
use crate::config::Config;
use crate::errors::SfuError;

/// Connection credentials carried by the first frame.
#[derive(Debug, Deserialize)]
struct Credentials {
    #[serde(rename = "channelUUID")]
    channel_uuid: Option<Uuid>,
    jwt: String,
}

/// Parsed form of the first frame.
#[derive(Debug, PartialEq)]
pub(crate) enum FirstFrame {
    /// Modern client: explicit channel + token.
    Credentials {
        channel_uuid: Option<Uuid>,
        token: String,
    },
    /// Legacy client: the frame is the token itself.
    BareToken(String),
}

/// The first frame is either a credentials object, a JSON-quoted token, or
/// the raw token text.
pub(crate) fn parse_first_frame(frame: &str) -> FirstFrame {
    if let Ok(credentials) = serde_json::from_str::<Credentials>(frame) {
        return FirstFrame::Credentials {
            channel_uuid: credentials.channel_uuid,
            token: credentials.jwt,
        };
    }
    if let Ok(token) = serde_json::from_str::<String>(frame) {
        return FirstFrame::BareToken(token);
    }
    FirstFrame::BareToken(frame.to_string())
}

/// Gateway state: the pending and authenticated link sets.
pub struct Gateway {
    controller: ControllerActorHandle,
    global_key: Arc<SecretBox<Vec<u8>>>,
    config: Arc<Config>,
    next_link_id: AtomicU64,
    pending: Mutex<HashSet<u64>>,
    authenticated: Mutex<HashSet<u64>>,
}

impl Gateway {
    #[must_use]
    pub fn new(
        controller: ControllerActorHandle,
        global_key: Arc<SecretBox<Vec<u8>>>,
        config: Arc<Config>,
    ) -> Arc<Self> {
        Arc::new(Self {
            controller,
            global_key,
            config,
            next_link_id: AtomicU64::new(1),
            pending: Mutex::new(HashSet::new()),
            authenticated: Mutex::new(HashSet::new()),
        })
    }

    /// Number of links awaiting authentication.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Number of authenticated links.
    #[must_use]
    pub fn authenticated_count(&self) -> usize {
        lock(&self.authenticated).len()
    }

    /// Drive one link through the handshake and hand it to a session.
    /// Returns when the handshake ends, one way or the other; the session
    /// keeps the link alive afterwards.
    pub async fn handle_link(
        self: &Arc<Self>,
        link: Arc<dyn Link>,
        mut events: mpsc::Receiver<LinkEvent>,
    ) {
        let link_id = self.next_link_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.pending).insert(link_id);

        let first = tokio::time::timeout(self.config.timeouts.authentication, events.recv()).await;
        let frame = match first {
            Ok(Some(LinkEvent::Frame(frame))) => frame,
            Ok(_) => {
                // Link dropped before authenticating
                lock(&self.pending).remove(&link_id);
                return;
            }
            Err(_) => {
                debug!(target: "sfu.gateway", link_id, "Authentication deadline fired");
                link.close(LinkCloseCode::Timeout, "authentication timeout")
                    .await;
                lock(&self.pending).remove(&link_id);
                return;
            }
        };

        let (access, session_id) = match self.authenticate(&frame).await {
            Ok(authenticated) => authenticated,
            Err(code) => {
                link.close(code, "authentication failed").await;
                lock(&self.pending).remove(&link_id);
                return;
            }
        };

        // The client treats the first received frame as "ready"
        let _ = link.send_frame(String::new()).await;

        let bus = Bus::new(
            Arc::clone(&link),
            self.config.timeouts.batch_delay,
            self.config.timeouts.request,
        );

        let session = match access.handle.join(session_id.clone()).await {
            Ok(session) => session,
            Err(SfuError::Overcrowded) => {
                warn!(
                    target: "sfu.gateway",
                    channel = %access.uuid,
                    session_id = %session_id,
                    "Join refused: channel full"
                );
                bus.close_link(LinkCloseCode::ChannelFull, "channel full")
                    .await;
                lock(&self.pending).remove(&link_id);
                return;
            }
            Err(e) => {
                warn!(target: "sfu.gateway", error = %e, "Join failed");
                bus.close_link(LinkCloseCode::Error, "join failed").await;
                lock(&self.pending).remove(&link_id);
                return;
            }
        };

        let _ = session.connect(bus, events).await;

        lock(&self.pending).remove(&link_id);
        lock(&self.authenticated).insert(link_id);

        info!(
            target: "sfu.gateway",
            channel = %access.uuid,
            session_id = %session_id,
            link_id,
            "Link authenticated"
        );

        let gateway = Arc::clone(self);
        tokio::spawn(async move {
            session.closed().await;
            lock(&gateway.authenticated).remove(&link_id);
        });
    }

    /// Resolve the channel and verify the token. Returns the close code to
    /// send on failure; the code never reveals why verification failed.
    async fn authenticate(
        &self,
        frame: &str,
    ) -> Result<(ChannelAccess, SessionId), LinkCloseCode> {
        let (access, claims) = match parse_first_frame(frame) {
            FirstFrame::Credentials {
                channel_uuid: Some(uuid),
                token,
            } => {
                let access = self.lookup_channel(uuid).await?;
                let key = access
                    .key
                    .clone()
                    .unwrap_or_else(|| self.global_key.expose_secret().clone());
                let claims = jwt::verify(&token, &key).map_err(|e| {
                    debug!(target: "sfu.gateway", error = %e, "Token verification failed");
                    LinkCloseCode::AuthenticationFailed
                })?;
                (access, claims)
            }
            FirstFrame::Credentials {
                channel_uuid: None,
                token,
            }
            | FirstFrame::BareToken(token) => {
                // Legacy path: the channel binding lives in the token
                let claims = jwt::verify(&token, self.global_key.expose_secret())
                    .map_err(|e| {
                        debug!(target: "sfu.gateway", error = %e, "Token verification failed");
                        LinkCloseCode::AuthenticationFailed
                    })?;
                let uuid = claims
                    .sfu_channel_uuid
                    .ok_or(LinkCloseCode::AuthenticationFailed)?;
                let access = self.lookup_channel(uuid).await?;
                if access.key.is_some() {
                    // A keyed channel cannot be entered with a token signed
                    // by the global key
                    debug!(
                        target: "sfu.gateway",
                        channel = %access.uuid,
                        "Legacy token refused for keyed channel"
                    );
                    return Err(LinkCloseCode::AuthenticationFailed);
                }
                (access, claims)
            }
        };

        let session_id = claims
            .session_id
            .ok_or(LinkCloseCode::AuthenticationFailed)?;

        Ok((access, SessionId::from(session_id)))
    }

    async fn lookup_channel(&self, uuid: Uuid) -> Result<ChannelAccess, LinkCloseCode> {
        match self
            .controller
            .get_channel(common::types::ChannelId(uuid))
            .await
        {
            Ok(Some(access)) => Ok(access),
            Ok(None) => Err(LinkCloseCode::AuthenticationFailed),
            Err(e) => {
                warn!(target: "sfu.gateway", error = %e, "Channel lookup failed");
                Err(LinkCloseCode::Error)
            }
        }
    }
}

fn lock(set: &Mutex<HashSet<u64>>) -> std::sync::MutexGuard<'_, HashSet<u64>> {
    set.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
