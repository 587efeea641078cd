//! Correlated request/response + broadcast layer over one duplex link.
//!
//! The bus owns the outbound side of a [`Link`]: fire-and-forget sends,
//! requests with correlation ids and deadlines, and trailing-edge batching
//! of outbound payloads into shared frames. The inbound side is driven by
//! [`Bus::run_inbound`], which completes pending requests and forwards
//! everything else to the owning session's mailbox as [`BusEvent`]s.
//!
//! # Batching
//!
//! Batched sends use a trailing-edge window with an immediate first flush:
//! the first batched payload (with no window armed) flushes at once and arms
//! the window; payloads arriving while the window is armed accumulate; when
//! the window fires a non-empty queue is flushed and the window re-armed,
//! an empty queue disarms it. Non-batched sends bypass the queue. Within a
//! flush, payloads keep enqueue order; across flushes ordering is FIFO.

use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use thiserror::Error;

pub mod link;
pub mod payload;

pub use link::{Link, LinkCloseCode, LinkEvent};
pub use payload::{names, BusMessage, Payload};

/// Process-unique bus id source. The id is embedded in correlation ids so
/// two buses never collide even across reconnects.
static NEXT_BUS_ID: AtomicU64 = AtomicU64::new(1);

/// Bus-level failures, local to the caller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The bus (or its link) is closed.
    #[error("bus closed")]
    Closed,

    /// A request deadline fired before the response arrived.
    #[error("request timed out")]
    Timeout,

    /// The remote answered a request with an error payload.
    #[error("remote error: {0}")]
    Remote(String),
}

/// Inbound events delivered to the bus owner.
#[derive(Debug)]
pub enum BusEvent {
    /// A fire-and-forget message.
    Message(BusMessage),
    /// A request; the owner must answer via [`Bus::respond`] or
    /// [`Bus::respond_error`] using `response_to`.
    Request {
        message: BusMessage,
        response_to: String,
    },
    /// The link closed; `error` is set when it failed rather than closed.
    Closed { error: Option<String> },
}

struct OutboundPayload {
    payload: Payload,
    batch: bool,
}

struct BusInner {
    id: u64,
    seq: AtomicU64,
    pending: Mutex<HashMap<String, oneshot::Sender<Result<BusMessage, BusError>>>>,
    outbound: mpsc::UnboundedSender<OutboundPayload>,
    link: Arc<dyn Link>,
    closed: CancellationToken,
    request_timeout: Duration,
}

/// Handle to one message bus. Cheap to clone.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    /// Wrap a link. Spawns the writer task that owns batching.
    #[must_use]
    pub fn new(link: Arc<dyn Link>, batch_delay: Duration, request_timeout: Duration) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();

        tokio::spawn(run_writer(
            Arc::clone(&link),
            outbound_rx,
            batch_delay,
            closed.clone(),
        ));

        Self {
            inner: Arc::new(BusInner {
                id: NEXT_BUS_ID.fetch_add(1, Ordering::Relaxed),
                seq: AtomicU64::new(0),
                pending: Mutex::new(HashMap::new()),
                outbound: outbound_tx,
                link,
                closed,
                request_timeout,
            }),
        }
    }

    /// Fire-and-forget send.
    ///
    /// # Errors
    ///
    /// `BusError::Closed` when the bus is closed.
    pub fn send(&self, message: BusMessage, batch: bool) -> Result<(), BusError> {
        if self.inner.closed.is_cancelled() {
            return Err(BusError::Closed);
        }
        self.inner
            .outbound
            .send(OutboundPayload {
                payload: Payload {
                    message,
                    need_response: None,
                    response_to: None,
                },
                batch,
            })
            .map_err(|_| BusError::Closed)
    }

    /// Send a request and wait for its response with the default timeout.
    pub async fn request(&self, message: BusMessage) -> Result<BusMessage, BusError> {
        self.request_with(message, self.inner.request_timeout, false)
            .await
    }

    /// Like [`Bus::request`], but the request payload joins the batching
    /// queue so it can share a frame with other batched traffic.
    pub async fn request_batched(&self, message: BusMessage) -> Result<BusMessage, BusError> {
        self.request_with(message, self.inner.request_timeout, true)
            .await
    }

    /// Send a request with an explicit timeout and batching flag.
    ///
    /// The returned future completes exactly once: with the response, or
    /// with `Timeout`/`Closed`/`Remote` — whichever happens first.
    pub async fn request_with(
        &self,
        message: BusMessage,
        timeout: Duration,
        batch: bool,
    ) -> Result<BusMessage, BusError> {
        if self.inner.closed.is_cancelled() {
            return Err(BusError::Closed);
        }

        let id = format!(
            "s_{}_{}",
            self.inner.id,
            self.inner.seq.fetch_add(1, Ordering::Relaxed)
        );
        let (tx, rx) = oneshot::channel();
        self.lock_pending().insert(id.clone(), tx);

        let sent = self.inner.outbound.send(OutboundPayload {
            payload: Payload {
                message,
                need_response: Some(id.clone()),
                response_to: None,
            },
            batch,
        });
        if sent.is_err() {
            self.lock_pending().remove(&id);
            return Err(BusError::Closed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BusError::Closed),
            Err(_) => {
                self.lock_pending().remove(&id);
                Err(BusError::Timeout)
            }
        }
    }

    /// Answer a request received through [`BusEvent::Request`].
    pub fn respond(&self, response_to: &str, message: BusMessage) -> Result<(), BusError> {
        if self.inner.closed.is_cancelled() {
            return Err(BusError::Closed);
        }
        self.inner
            .outbound
            .send(OutboundPayload {
                payload: Payload {
                    message,
                    need_response: None,
                    response_to: Some(response_to.to_string()),
                },
                batch: false,
            })
            .map_err(|_| BusError::Closed)
    }

    /// Answer a request with an error payload.
    pub fn respond_error(&self, response_to: &str, message: &str) {
        let _ = self.respond(response_to, BusMessage::error(message));
    }

    /// Whether the bus has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Close the bus: reject all pending requests, stop the writer, detach
    /// from the link. Idempotent. Does not close the link itself.
    pub fn close(&self) {
        if self.inner.closed.is_cancelled() {
            return;
        }
        self.inner.closed.cancel();

        let pending: Vec<_> = self.lock_pending().drain().collect();
        for (_, tx) in pending {
            let _ = tx.send(Err(BusError::Closed));
        }
    }

    /// Close the bus and the underlying link with a close code.
    pub async fn close_link(&self, code: LinkCloseCode, reason: &str) {
        self.close();
        self.inner.link.close(code, reason).await;
    }

    /// Drive the inbound side: parse frames, complete pending requests,
    /// forward messages and requests to `out`. Runs until the link closes
    /// or `out` is dropped.
    pub fn run_inbound(
        &self,
        mut events: mpsc::Receiver<LinkEvent>,
        out: mpsc::Sender<BusEvent>,
    ) -> JoinHandle<()> {
        let bus = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = bus.inner.closed.cancelled() => break,
                    event = events.recv() => match event {
                        Some(LinkEvent::Frame(text)) => {
                            if bus.dispatch_frame(&text, &out).await.is_err() {
                                break;
                            }
                        }
                        Some(LinkEvent::Closed) | None => {
                            bus.close();
                            let _ = out.send(BusEvent::Closed { error: None }).await;
                            break;
                        }
                        Some(LinkEvent::Error(e)) => {
                            bus.close();
                            let _ = out.send(BusEvent::Closed { error: Some(e) }).await;
                            break;
                        }
                    }
                }
            }
        })
    }

    async fn dispatch_frame(&self, text: &str, out: &mpsc::Sender<BusEvent>) -> Result<(), ()> {
        let payloads: Vec<Payload> = match serde_json::from_str(text) {
            Ok(payloads) => payloads,
            Err(e) => {
                tracing::warn!(
                    target: "sfu.bus",
                    bus_id = self.inner.id,
                    error = %e,
                    "Dropping undecodable frame"
                );
                return Ok(());
            }
        };

        for payload in payloads {
            if let Some(response_to) = payload.response_to {
                let entry = self.lock_pending().remove(&response_to);
                match entry {
                    Some(tx) => {
                        let result = if payload.message.name == names::ERROR {
                            let detail = payload.message.payload["message"]
                                .as_str()
                                .unwrap_or("unknown")
                                .to_string();
                            Err(BusError::Remote(detail))
                        } else {
                            Ok(payload.message)
                        };
                        let _ = tx.send(result);
                    }
                    None => {
                        // Response arrived after its deadline fired
                        tracing::debug!(
                            target: "sfu.bus",
                            bus_id = self.inner.id,
                            response_to = %response_to,
                            "Response for unknown request id"
                        );
                    }
                }
            } else if let Some(id) = payload.need_response {
                if out
                    .send(BusEvent::Request {
                        message: payload.message,
                        response_to: id,
                    })
                    .await
                    .is_err()
                {
                    return Err(());
                }
            } else if out.send(BusEvent::Message(payload.message)).await.is_err() {
                return Err(());
            }
        }
        Ok(())
    }

    fn lock_pending(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<Result<BusMessage, BusError>>>>
    {
        // Poisoning cannot outlive the process meaningfully here; recover
        self.inner
            .pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Writer loop: serializes payloads into frames with trailing-edge batching.
async fn run_writer(
    link: Arc<dyn Link>,
    mut rx: mpsc::UnboundedReceiver<OutboundPayload>,
    batch_delay: Duration,
    closed: CancellationToken,
) {
    let mut queue: Vec<Payload> = Vec::new();
    let mut window: Option<Instant> = None;

    loop {
        tokio::select! {
            () = closed.cancelled() => break,

            command = rx.recv() => match command {
                Some(OutboundPayload { payload, batch: false }) => {
                    send_frame(&link, std::slice::from_ref(&payload)).await;
                }
                Some(OutboundPayload { payload, batch: true }) => {
                    queue.push(payload);
                    if window.is_none() {
                        flush(&link, &mut queue).await;
                        window = Some(Instant::now() + batch_delay);
                    }
                }
                None => break,
            },

            () = tokio::time::sleep_until(window.unwrap_or_else(Instant::now)),
                if window.is_some() =>
            {
                if queue.is_empty() {
                    window = None;
                } else {
                    flush(&link, &mut queue).await;
                    window = Some(Instant::now() + batch_delay);
                }
            }
        }
    }
}

async fn flush(link: &Arc<dyn Link>, queue: &mut Vec<Payload>) {
    if queue.is_empty() {
        return;
    }
    let payloads = std::mem::take(queue);
    send_frame(link, &payloads).await;
}

async fn send_frame(link: &Arc<dyn Link>, payloads: &[Payload]) {
    match serde_json::to_string(payloads) {
        Ok(frame) => {
            if let Err(e) = link.send_frame(frame).await {
                tracing::debug!(target: "sfu.bus", error = %e, "Frame send failed");
            }
        }
        Err(e) => {
            tracing::error!(target: "sfu.bus", error = %e, "Frame serialization failed");
        }
    }
}

/// Build a `PING` request message.
#[must_use]
pub fn ping_message() -> BusMessage {
    BusMessage::new(names::PING, json!({}))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    /// Link that records every frame it is asked to send.
    struct RecordingLink {
        frames: mpsc::UnboundedSender<String>,
        closed: Mutex<Option<LinkCloseCode>>,
    }

    impl RecordingLink {
        fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Arc::new(Self {
                    frames: tx,
                    closed: Mutex::new(None),
                }),
                rx,
            )
        }
    }

    #[async_trait::async_trait]
    impl Link for RecordingLink {
        async fn send_frame(&self, frame: String) -> Result<(), BusError> {
            self.frames.send(frame).map_err(|_| BusError::Closed)
        }

        async fn close(&self, code: LinkCloseCode, _reason: &str) {
            *self.closed.lock().unwrap() = Some(code);
        }
    }

    fn test_bus(link: Arc<RecordingLink>) -> Bus {
        Bus::new(link, Duration::from_millis(10), Duration::from_millis(100))
    }

    fn frame_names(frame: &str) -> Vec<String> {
        let payloads: Vec<Payload> = serde_json::from_str(frame).unwrap();
        payloads.into_iter().map(|p| p.message.name).collect()
    }

    #[tokio::test]
    async fn test_unbatched_send_is_one_frame() {
        let (link, mut frames) = RecordingLink::new();
        let bus = test_bus(link);

        bus.send(BusMessage::new("A", serde_json::json!({})), false)
            .unwrap();

        let frame = frames.recv().await.unwrap();
        assert_eq!(frame_names(&frame), vec!["A"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batching_immediate_first_then_trailing_edge() {
        let (link, mut frames) = RecordingLink::new();
        let bus = test_bus(link);

        // First batched message flushes immediately
        bus.send(BusMessage::new("A", serde_json::json!({})), true)
            .unwrap();
        let frame = frames.recv().await.unwrap();
        assert_eq!(frame_names(&frame), vec!["A"]);

        // While the window is armed, messages accumulate
        bus.send(BusMessage::new("B", serde_json::json!({})), true)
            .unwrap();
        bus.send(BusMessage::new("C", serde_json::json!({})), true)
            .unwrap();

        // Window fires: one frame carrying both, in enqueue order
        let frame = frames.recv().await.unwrap();
        assert_eq!(frame_names(&frame), vec!["B", "C"]);

        // Queue drained, window fires empty, disarms; next batched message
        // is again immediate
        tokio::time::advance(Duration::from_millis(20)).await;
        bus.send(BusMessage::new("D", serde_json::json!({})), true)
            .unwrap();
        let frame = frames.recv().await.unwrap();
        assert_eq!(frame_names(&frame), vec!["D"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout() {
        let (link, _frames) = RecordingLink::new();
        let bus = test_bus(link);

        let result = bus.request(ping_message()).await;
        assert_eq!(result, Err(BusError::Timeout));
    }

    #[tokio::test]
    async fn test_request_resolves_on_response() {
        let (link, mut frames) = RecordingLink::new();
        let bus = test_bus(link);

        let (event_tx, event_rx) = mpsc::channel(8);
        let (out_tx, _out_rx) = mpsc::channel(8);
        bus.run_inbound(event_rx, out_tx);

        let request_bus = bus.clone();
        let request = tokio::spawn(async move { request_bus.request(ping_message()).await });

        // Extract the correlation id from the outbound frame and answer it
        let frame = frames.recv().await.unwrap();
        let payloads: Vec<Payload> = serde_json::from_str(&frame).unwrap();
        let id = payloads[0].need_response.clone().unwrap();
        assert!(id.starts_with("s_"));

        let response = serde_json::to_string(&vec![Payload {
            message: BusMessage::new("PONG", serde_json::json!({"ok": true})),
            need_response: None,
            response_to: Some(id),
        }])
        .unwrap();
        event_tx.send(LinkEvent::Frame(response)).await.unwrap();

        let result = request.await.unwrap().unwrap();
        assert_eq!(result.name, "PONG");
    }

    #[tokio::test]
    async fn test_request_rejected_with_remote_error() {
        let (link, mut frames) = RecordingLink::new();
        let bus = test_bus(link);

        let (event_tx, event_rx) = mpsc::channel(8);
        let (out_tx, _out_rx) = mpsc::channel(8);
        bus.run_inbound(event_rx, out_tx);

        let request_bus = bus.clone();
        let request = tokio::spawn(async move { request_bus.request(ping_message()).await });

        let frame = frames.recv().await.unwrap();
        let payloads: Vec<Payload> = serde_json::from_str(&frame).unwrap();
        let id = payloads[0].need_response.clone().unwrap();

        let response = serde_json::to_string(&vec![Payload {
            message: BusMessage::error("produce failed"),
            need_response: None,
            response_to: Some(id),
        }])
        .unwrap();
        event_tx.send(LinkEvent::Frame(response)).await.unwrap();

        let result = request.await.unwrap();
        assert_eq!(result, Err(BusError::Remote("produce failed".to_string())));
    }

    #[tokio::test]
    async fn test_close_rejects_pending_requests() {
        let (link, _frames) = RecordingLink::new();
        let bus = test_bus(link);

        let request_bus = bus.clone();
        let request = tokio::spawn(async move {
            request_bus
                .request_with(ping_message(), Duration::from_secs(10), false)
                .await
        });

        // Give the request a moment to register as pending
        tokio::task::yield_now().await;
        bus.close();

        let result = request.await.unwrap();
        assert_eq!(result, Err(BusError::Closed));
        assert!(bus.is_closed());
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (link, _frames) = RecordingLink::new();
        let bus = test_bus(link);

        bus.close();
        assert_eq!(
            bus.send(ping_message(), false),
            Err(BusError::Closed)
        );
    }

    #[tokio::test]
    async fn test_inbound_dispatch_messages_and_requests() {
        let (link, _frames) = RecordingLink::new();
        let bus = test_bus(link);

        let (event_tx, event_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        bus.run_inbound(event_rx, out_tx);

        let frame = serde_json::to_string(&vec![
            Payload {
                message: BusMessage::new("BROADCAST", serde_json::json!({"message": 1})),
                need_response: None,
                response_to: None,
            },
            Payload {
                message: BusMessage::new("INIT_PRODUCER", serde_json::json!({})),
                need_response: Some("c_9_0".to_string()),
                response_to: None,
            },
        ])
        .unwrap();
        event_tx.send(LinkEvent::Frame(frame)).await.unwrap();

        match out_rx.recv().await.unwrap() {
            BusEvent::Message(msg) => assert_eq!(msg.name, "BROADCAST"),
            other => panic!("expected message, got {other:?}"),
        }
        match out_rx.recv().await.unwrap() {
            BusEvent::Request {
                message,
                response_to,
            } => {
                assert_eq!(message.name, "INIT_PRODUCER");
                assert_eq!(response_to, "c_9_0");
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_link_close_closes_bus_and_notifies() {
        let (link, _frames) = RecordingLink::new();
        let bus = test_bus(link);

        let (event_tx, event_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        bus.run_inbound(event_rx, out_tx);

        event_tx.send(LinkEvent::Closed).await.unwrap();

        match out_rx.recv().await.unwrap() {
            BusEvent::Closed { error: None } => {}
            other => panic!("expected clean close, got {other:?}"),
        }
        assert!(bus.is_closed());
    }

    #[tokio::test]
    async fn test_correlation_ids_unique_across_buses() {
        let (link_a, mut frames_a) = RecordingLink::new();
        let (link_b, mut frames_b) = RecordingLink::new();
        let bus_a = test_bus(link_a);
        let bus_b = test_bus(link_b);

        let a = bus_a.clone();
        tokio::spawn(async move { a.request(ping_message()).await });
        let b = bus_b.clone();
        tokio::spawn(async move { b.request(ping_message()).await });

        let frame_a = frames_a.recv().await.unwrap();
        let frame_b = frames_b.recv().await.unwrap();
        let id_a = serde_json::from_str::<Vec<Payload>>(&frame_a).unwrap()[0]
            .need_response
            .clone()
            .unwrap();
        let id_b = serde_json::from_str::<Vec<Payload>>(&frame_b).unwrap()[0]
            .need_response
            .clone()
            .unwrap();

        assert_ne!(id_a, id_b);
    }
}
