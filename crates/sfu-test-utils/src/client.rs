//! Scripted client for the far end of a link.
//!
//! `TestClient` speaks the wire protocol: it answers server requests
//! (capability exchange, consumer setup, pings), records everything the
//! server sends for assertions, and can issue its own requests with `c_`
//! correlation ids the way a real client library would.

use sfu_service::bus::payload::Payload;
use sfu_service::bus::{names, BusMessage, Link, LinkCloseCode, LinkEvent};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};

use crate::link::LinkEnd;

/// How long test-side waits may block before giving up.
const WAIT_TIMEOUT: Duration = Duration::from_secs(2);

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

type Pending = Arc<StdMutex<HashMap<String, oneshot::Sender<BusMessage>>>>;

/// A scripted protocol client.
pub struct TestClient {
    link: Arc<dyn Link>,
    inbox: Mutex<mpsc::UnboundedReceiver<BusMessage>>,
    peer_close_code: Mutex<watch::Receiver<Option<u16>>>,
    pending: Pending,
    id: u64,
    seq: AtomicU64,
}

impl TestClient {
    /// Client that answers server requests: `INIT_TRANSPORTS` with default
    /// capabilities, everything else with an empty object.
    #[must_use]
    pub fn new(end: LinkEnd) -> Self {
        Self::with_capabilities(end, serde_json::json!({ "codecs": [] }))
    }

    /// Client answering `INIT_TRANSPORTS` with the given capabilities.
    #[must_use]
    pub fn with_capabilities(end: LinkEnd, capabilities: serde_json::Value) -> Self {
        Self::build(end, Some(capabilities))
    }

    /// Client that records traffic but never answers requests. Used to
    /// drive request timeouts.
    #[must_use]
    pub fn silent(end: LinkEnd) -> Self {
        Self::build(end, None)
    }

    fn build(end: LinkEnd, capabilities: Option<serde_json::Value>) -> Self {
        let LinkEnd {
            link,
            mut events,
            peer_close_code,
        } = end;

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let pending: Pending = Arc::new(StdMutex::new(HashMap::new()));

        let reader_link = Arc::clone(&link);
        let reader_pending = Arc::clone(&pending);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let LinkEvent::Frame(frame) = event else {
                    break;
                };
                if frame.is_empty() {
                    // The "authenticated" signal
                    continue;
                }
                let Ok(payloads) = serde_json::from_str::<Vec<Payload>>(&frame) else {
                    continue;
                };
                for payload in payloads {
                    if let Some(response_to) = &payload.response_to {
                        if let Some(tx) =
                            reader_pending.lock().unwrap().remove(response_to)
                        {
                            let _ = tx.send(payload.message);
                        }
                        continue;
                    }

                    if let Some(request_id) = &payload.need_response {
                        if let Some(capabilities) = &capabilities {
                            let response = match payload.message.name.as_str() {
                                names::INIT_TRANSPORTS => capabilities.clone(),
                                _ => serde_json::json!({}),
                            };
                            let reply = Payload {
                                message: BusMessage::new(&payload.message.name, response),
                                need_response: None,
                                response_to: Some(request_id.clone()),
                            };
                            let frame =
                                serde_json::to_string(&vec![reply]).unwrap_or_default();
                            let _ = reader_link.send_frame(frame).await;
                        }
                    }

                    let _ = inbox_tx.send(payload.message);
                }
            }
        });

        Self {
            link,
            inbox: Mutex::new(inbox_rx),
            peer_close_code: Mutex::new(peer_close_code),
            pending,
            id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            seq: AtomicU64::new(0),
        }
    }

    /// Send one raw frame (for handshake tests).
    pub fn send_frame(&self, frame: String) {
        let link = Arc::clone(&self.link);
        tokio::spawn(async move {
            let _ = link.send_frame(frame).await;
        });
    }

    /// Fire-and-forget message.
    pub fn send(&self, name: &str, payload: serde_json::Value) {
        let frame = serde_json::to_string(&vec![Payload {
            message: BusMessage::new(name, payload),
            need_response: None,
            response_to: None,
        }])
        .unwrap_or_default();
        self.send_frame(frame);
    }

    /// Request with a `c_` correlation id; waits for the response.
    pub async fn request(
        &self,
        name: &str,
        payload: serde_json::Value,
    ) -> Result<BusMessage, String> {
        let id = format!("c_{}_{}", self.id, self.seq.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id.clone(), tx);

        let frame = serde_json::to_string(&vec![Payload {
            message: BusMessage::new(name, payload),
            need_response: Some(id),
            response_to: None,
        }])
        .map_err(|e| e.to_string())?;
        self.link
            .send_frame(frame)
            .await
            .map_err(|e| e.to_string())?;

        match tokio::time::timeout(WAIT_TIMEOUT, rx).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => Err("client reader dropped".to_string()),
            Err(_) => Err("request timed out".to_string()),
        }
    }

    /// Next recorded server message, if one arrives in time.
    pub async fn recv_message(&self) -> Option<BusMessage> {
        let mut inbox = self.inbox.lock().await;
        tokio::time::timeout(WAIT_TIMEOUT, inbox.recv())
            .await
            .ok()
            .flatten()
    }

    /// Wait for a server message with the given name, skipping others.
    ///
    /// # Panics
    ///
    /// Panics when nothing matching arrives in time.
    pub async fn expect_message(&self, name: &str) -> BusMessage {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {name}"
            );
            if let Some(message) = self.recv_message().await {
                if message.name == name {
                    return message;
                }
            } else {
                panic!("link closed while waiting for {name}");
            }
        }
    }

    /// Close the link from the client side.
    pub fn close(&self) {
        let link = Arc::clone(&self.link);
        tokio::spawn(async move {
            link.close(LinkCloseCode::Leaving, "client close").await;
        });
    }

    /// Wait for the server to close the link; returns its close code.
    pub async fn wait_close_code(&self) -> Option<u16> {
        let mut watcher = self.peer_close_code.lock().await;
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            if let Some(code) = *watcher.borrow() {
                return Some(code);
            }
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())?;
            if tokio::time::timeout(remaining, watcher.changed())
                .await
                .ok()?
                .is_err()
            {
                return None;
            }
        }
    }
}
