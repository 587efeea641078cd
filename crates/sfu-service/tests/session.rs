//! `SessionActor` unit-style scenarios, run as an integration test so
//! `sfu-test-utils` (which itself depends on `sfu-service`) links against
//! a single copy of this crate instead of a second `cfg(test)` copy.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use common::types::{ChannelId, SessionId};
use serde_json::json;
use sfu_service::actors::messages::ChannelMessage;
use sfu_service::actors::{CloseReason, SessionState};
use sfu_service::actors::session::{SessionActor, SessionActorHandle, SessionContext};
use sfu_service::bus::{names, Bus, BusMessage};
use sfu_service::config::{Config, Timeouts};
use sfu_test_utils::client::TestClient;
use sfu_test_utils::link::memory_link_pair;
use std::collections::HashMap as StdHashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

fn test_config() -> Arc<Config> {
    let vars = StdHashMap::from([
        (
            "AUTH_KEY".to_string(),
            "dGVzdC1hdXRoLWtleS0xMjM0NTY=".to_string(),
        ),
        ("PUBLIC_IP".to_string(), "203.0.113.7".to_string()),
    ]);
    let mut config = Config::from_vars(&vars).unwrap();
    config.timeouts = Timeouts::short();
    Arc::new(config)
}

fn data_only_context(channel_tx: mpsc::Sender<ChannelMessage>) -> SessionContext {
    SessionContext {
        channel_id: ChannelId::new(),
        channel_tx,
        router: None,
        webrtc_server_id: None,
        config: test_config(),
    }
}

/// Connect a data-only session over a memory link and return the client
/// side plus the channel mailbox.
async fn connected_session() -> (
    SessionActorHandle,
    TestClient,
    mpsc::Receiver<ChannelMessage>,
) {
    let (channel_tx, channel_rx) = mpsc::channel(64);
    let (handle, _task) = SessionActor::spawn(SessionId::from("s1"), data_only_context(channel_tx));

    let (server_end, client_end) = memory_link_pair();
    let client = TestClient::new(client_end);

    let config = test_config();
    let bus = Bus::new(
        server_end.link,
        config.timeouts.batch_delay,
        config.timeouts.request,
    );
    handle.connect(bus, server_end.events).await.unwrap();

    (handle, client, channel_rx)
}

#[tokio::test]
async fn test_session_starts_new() {
    let (channel_tx, _channel_rx) = mpsc::channel(64);
    let (handle, _task) =
        SessionActor::spawn(SessionId::from("s1"), data_only_context(channel_tx));

    assert_eq!(handle.get_state().await.unwrap(), SessionState::New);
    assert!(!handle.is_closed());

    handle.close(CloseReason::Clean, None).await;
}

#[tokio::test]
async fn test_data_only_connect_reaches_connected() {
    let (handle, _client, mut channel_rx) = connected_session().await;

    assert_eq!(handle.get_state().await.unwrap(), SessionState::Connected);
    match channel_rx.recv().await.unwrap() {
        ChannelMessage::SessionConnected { session_id } => {
            assert_eq!(session_id, SessionId::from("s1"));
        }
        _ => panic!("expected SessionConnected"),
    }
}

#[tokio::test]
async fn test_close_is_idempotent_and_emits_once() {
    let (handle, _client, mut channel_rx) = connected_session().await;

    // Drain the connect notification
    let _ = channel_rx.recv().await;

    handle.close(CloseReason::Kicked, None).await;
    handle.close(CloseReason::Clean, None).await;
    handle.closed().await;

    // SESSION_LEAVE fanout precedes the close notification
    match channel_rx.recv().await.unwrap() {
        ChannelMessage::Fanout { message, .. } => {
            assert_eq!(message.name, names::SESSION_LEAVE);
        }
        _ => panic!("expected SESSION_LEAVE fanout"),
    }
    match channel_rx.recv().await.unwrap() {
        ChannelMessage::SessionClosed { reason, .. } => {
            assert_eq!(reason, CloseReason::Kicked);
        }
        _ => panic!("expected SessionClosed"),
    }
    assert!(channel_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_channel_closed_suppresses_session_leave() {
    let (handle, _client, mut channel_rx) = connected_session().await;
    let _ = channel_rx.recv().await;

    handle.close(CloseReason::ChannelClosed, None).await;
    handle.closed().await;

    match channel_rx.recv().await.unwrap() {
        ChannelMessage::SessionClosed { reason, .. } => {
            assert_eq!(reason, CloseReason::ChannelClosed);
        }
        other => panic!("expected SessionClosed without fanout, got {other:?}"),
    }
}

#[tokio::test]
async fn test_close_sends_mapped_link_code() {
    let (handle, client, _channel_rx) = connected_session().await;

    handle.close(CloseReason::Kicked, None).await;

    let code = client.wait_close_code().await;
    assert_eq!(code, Some(4108));
}

#[tokio::test]
async fn test_link_close_closes_session() {
    let (handle, client, mut channel_rx) = connected_session().await;
    let _ = channel_rx.recv().await;

    client.close();
    handle.closed().await;

    // Skip the SESSION_LEAVE fanout
    let _ = channel_rx.recv().await;
    match channel_rx.recv().await.unwrap() {
        ChannelMessage::SessionClosed { reason, .. } => {
            assert_eq!(reason, CloseReason::LinkClosed);
        }
        _ => panic!("expected SessionClosed"),
    }
}

#[tokio::test]
async fn test_info_change_updates_and_broadcasts() {
    let (_handle, client, mut channel_rx) = connected_session().await;
    let _ = channel_rx.recv().await;

    client.send(
        names::INFO_CHANGE,
        json!({ "info": { "isSelfMuted": true, "bogus": 1 } }),
    );

    // Cache update then fanout
    match channel_rx.recv().await.unwrap() {
        ChannelMessage::InfoUpdated { info, .. } => {
            assert_eq!(info.is_self_muted, Some(true));
        }
        other => panic!("expected InfoUpdated, got {other:?}"),
    }
    match channel_rx.recv().await.unwrap() {
        ChannelMessage::Fanout { message, .. } => {
            assert_eq!(message.name, names::S_INFO_CHANGE);
            assert_eq!(message.payload["s1"]["isSelfMuted"], true);
        }
        other => panic!("expected fanout, got {other:?}"),
    }
}

#[tokio::test]
async fn test_broadcast_relays_with_sender_id() {
    let (_handle, client, mut channel_rx) = connected_session().await;
    let _ = channel_rx.recv().await;

    client.send(names::BROADCAST, json!({ "message": { "hello": "world" } }));

    match channel_rx.recv().await.unwrap() {
        ChannelMessage::Fanout {
            from,
            message,
            batch,
        } => {
            assert_eq!(from, SessionId::from("s1"));
            assert!(batch);
            assert_eq!(message.name, names::BROADCAST);
            assert_eq!(message.payload["senderId"], "s1");
            assert_eq!(message.payload["message"]["hello"], "world");
        }
        other => panic!("expected fanout, got {other:?}"),
    }
}

#[tokio::test]
async fn test_deliver_reaches_client() {
    let (handle, client, _channel_rx) = connected_session().await;

    handle
        .deliver(BusMessage::new("BROADCAST", json!({"x": 1})), false)
        .await;

    let message = client.recv_message().await.unwrap();
    assert_eq!(message.name, "BROADCAST");
    assert_eq!(message.payload["x"], 1);
}

#[tokio::test]
async fn test_snapshot_reports_connected_state() {
    let (handle, _client, _channel_rx) = connected_session().await;

    let snapshot = handle.get_snapshot().await.unwrap();
    assert_eq!(snapshot.session_id, SessionId::from("s1"));
    assert!(snapshot.connected);
    assert!(snapshot.producers.is_empty());
}
