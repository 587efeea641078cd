//! In-memory duplex link pairs.
//!
//! Each end implements [`Link`]; frames sent on one end surface as
//! [`LinkEvent::Frame`]s on the other. Closing an end delivers
//! [`LinkEvent::Closed`] to the peer and records the close code so tests
//! can assert on it.

use sfu_service::bus::{BusError, Link, LinkCloseCode, LinkEvent};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

const EVENT_BUFFER: usize = 64;

/// One end of an in-memory link.
pub struct LinkEnd {
    /// The send half, as the code under test consumes it.
    pub link: Arc<dyn Link>,
    /// Inbound events from the peer.
    pub events: mpsc::Receiver<LinkEvent>,
    /// Close code the peer closed this end with, when it did.
    pub peer_close_code: watch::Receiver<Option<u16>>,
}

struct MemoryLink {
    peer_events: mpsc::Sender<LinkEvent>,
    peer_close_code: watch::Sender<Option<u16>>,
    closed: AtomicBool,
}

#[async_trait::async_trait]
impl Link for MemoryLink {
    async fn send_frame(&self, frame: String) -> Result<(), BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        self.peer_events
            .send(LinkEvent::Frame(frame))
            .await
            .map_err(|_| BusError::Closed)
    }

    async fn close(&self, code: LinkCloseCode, _reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.peer_close_code.send(Some(code.as_u16()));
        let _ = self.peer_events.send(LinkEvent::Closed).await;
    }
}

/// Build a connected pair of link ends.
#[must_use]
pub fn memory_link_pair() -> (LinkEnd, LinkEnd) {
    let (a_events_tx, a_events_rx) = mpsc::channel(EVENT_BUFFER);
    let (b_events_tx, b_events_rx) = mpsc::channel(EVENT_BUFFER);
    let (a_close_tx, a_close_rx) = watch::channel(None);
    let (b_close_tx, b_close_rx) = watch::channel(None);

    let a = LinkEnd {
        link: Arc::new(MemoryLink {
            peer_events: b_events_tx,
            peer_close_code: b_close_tx,
            closed: AtomicBool::new(false),
        }),
        events: a_events_rx,
        peer_close_code: a_close_rx,
    };
    let b = LinkEnd {
        link: Arc::new(MemoryLink {
            peer_events: a_events_tx,
            peer_close_code: a_close_tx,
            closed: AtomicBool::new(false),
        }),
        events: b_events_rx,
        peer_close_code: b_close_rx,
    };

    (a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_cross_the_pair() {
        let (a, mut b) = memory_link_pair();

        a.link.send_frame("hello".to_string()).await.unwrap();
        match b.events.recv().await {
            Some(LinkEvent::Frame(frame)) => assert_eq!(frame, "hello"),
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_close_delivers_code_to_peer() {
        let (a, mut b) = memory_link_pair();

        a.link.close(LinkCloseCode::Kicked, "bye").await;

        match b.events.recv().await {
            Some(LinkEvent::Closed) => {}
            other => panic!("expected close, got {other:?}"),
        }
        assert_eq!(*b.peer_close_code.borrow(), Some(4108));

        // Sends after close fail
        assert!(a.link.send_frame("late".to_string()).await.is_err());
    }
}
