//! Framed duplex link abstraction.
//!
//! A [`Link`] is the send half of one text-framed duplex connection; the
//! receive half is an [`mpsc::Receiver`] of [`LinkEvent`]s produced when the
//! underlying connection is wrapped. The production adapter wraps an axum
//! WebSocket; tests use an in-memory pair.

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use super::BusError;

/// Close codes sent on the wire when a link is shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkCloseCode {
    Clean,
    Leaving,
    Error,
    AuthenticationFailed,
    Timeout,
    Kicked,
    ChannelFull,
}

impl LinkCloseCode {
    #[must_use]
    pub fn as_u16(self) -> u16 {
        match self {
            LinkCloseCode::Clean => 1000,
            LinkCloseCode::Leaving => 1001,
            LinkCloseCode::Error => 1011,
            LinkCloseCode::AuthenticationFailed => 4106,
            LinkCloseCode::Timeout => 4107,
            LinkCloseCode::Kicked => 4108,
            LinkCloseCode::ChannelFull => 4109,
        }
    }
}

/// Inbound events from a link.
#[derive(Debug)]
pub enum LinkEvent {
    /// One text frame arrived.
    Frame(String),
    /// The peer closed the connection.
    Closed,
    /// The connection failed.
    Error(String),
}

/// Send half of a framed duplex link.
#[async_trait::async_trait]
pub trait Link: Send + Sync {
    /// Send one text frame.
    async fn send_frame(&self, frame: String) -> Result<(), BusError>;

    /// Close the link with a code. Idempotent; later sends fail.
    async fn close(&self, code: LinkCloseCode, reason: &str);
}

/// Buffer for inbound link events before the session drains them.
const LINK_EVENT_BUFFER: usize = 64;

enum WsCommand {
    Frame(String),
    Close(LinkCloseCode, String),
}

/// WebSocket-backed [`Link`].
///
/// The socket is split; a writer task owns the sink and a reader task
/// translates incoming messages into [`LinkEvent`]s.
pub struct WsLink {
    commands: mpsc::UnboundedSender<WsCommand>,
}

#[async_trait::async_trait]
impl Link for WsLink {
    async fn send_frame(&self, frame: String) -> Result<(), BusError> {
        self.commands
            .send(WsCommand::Frame(frame))
            .map_err(|_| BusError::Closed)
    }

    async fn close(&self, code: LinkCloseCode, reason: &str) {
        let _ = self
            .commands
            .send(WsCommand::Close(code, reason.to_string()));
    }
}

/// Wrap a WebSocket into a [`Link`] plus its inbound event stream.
#[must_use]
pub fn wrap_socket(socket: WebSocket) -> (std::sync::Arc<dyn Link>, mpsc::Receiver<LinkEvent>) {
    let (mut sink, mut stream) = socket.split();
    let (command_tx, mut command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::channel(LINK_EVENT_BUFFER);

    // Writer: drains commands until a close command or the channel drops.
    tokio::spawn(async move {
        while let Some(command) = command_rx.recv().await {
            match command {
                WsCommand::Frame(text) => {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        tracing::debug!(target: "sfu.link", error = %e, "Frame send failed");
                        break;
                    }
                }
                WsCommand::Close(code, reason) => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: code.as_u16(),
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    // Reader: forwards text frames, stops on close or error.
    tokio::spawn(async move {
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    if event_tx.send(LinkEvent::Frame(text)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    let _ = event_tx.send(LinkEvent::Closed).await;
                    break;
                }
                Some(Ok(_)) => {
                    // Binary/ping/pong frames are not part of the protocol
                }
                Some(Err(e)) => {
                    let _ = event_tx.send(LinkEvent::Error(e.to_string())).await;
                    break;
                }
            }
        }
    });

    (std::sync::Arc::new(WsLink { commands: command_tx }), event_rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_code_values() {
        assert_eq!(LinkCloseCode::Clean.as_u16(), 1000);
        assert_eq!(LinkCloseCode::Leaving.as_u16(), 1001);
        assert_eq!(LinkCloseCode::Error.as_u16(), 1011);
        assert_eq!(LinkCloseCode::AuthenticationFailed.as_u16(), 4106);
        assert_eq!(LinkCloseCode::Timeout.as_u16(), 4107);
        assert_eq!(LinkCloseCode::Kicked.as_u16(), 4108);
        assert_eq!(LinkCloseCode::ChannelFull.as_u16(), 4109);
    }
}
