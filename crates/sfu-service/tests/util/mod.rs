//! Shared scaffolding for the end-to-end scenarios.

#![allow(dead_code)]

use sfu_service::actors::ControllerActorHandle;
use sfu_service::config::{Config, Timeouts};
use sfu_service::gateway::Gateway;
use sfu_service::workers::WorkerPool;
use sfu_test_utils::client::TestClient;
use sfu_test_utils::engine::FakeMediaEngine;
use sfu_test_utils::link::memory_link_pair;
use sfu_test_utils::tokens::{test_key, TokenBuilder, TEST_KEY_B64};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

pub const REMOTE: &str = "198.51.100.5";

/// Short-timer config for tests.
pub fn test_config(mutate: impl FnOnce(&mut Timeouts)) -> Config {
    let vars = HashMap::from([
        ("AUTH_KEY".to_string(), TEST_KEY_B64.to_string()),
        ("PUBLIC_IP".to_string(), "203.0.113.7".to_string()),
        ("NUM_WORKERS".to_string(), "1".to_string()),
        ("CHANNEL_SIZE".to_string(), "16".to_string()),
    ]);
    let mut config = Config::from_vars(&vars).expect("test config");
    config.timeouts = Timeouts::short();
    mutate(&mut config.timeouts);
    config
}

/// A running control plane over a fake engine, without the HTTP listener.
pub struct Stack {
    pub engine: Arc<FakeMediaEngine>,
    pub controller: ControllerActorHandle,
    pub gateway: Arc<Gateway>,
    pub config: Arc<Config>,
}

impl Stack {
    pub async fn start(config: Config) -> Self {
        let config = Arc::new(config);
        let engine = FakeMediaEngine::new();
        let pool = WorkerPool::start(engine.clone(), &config)
            .await
            .expect("worker pool");
        let controller = ControllerActorHandle::new(Some(pool), Arc::clone(&config));
        let global_key = Arc::new(
            config.decoded_auth_key().expect("decoded test key"),
        );
        let gateway = Gateway::new(controller.clone(), global_key, Arc::clone(&config));

        Self {
            engine,
            controller,
            gateway,
            config,
        }
    }

    pub async fn with_defaults() -> Self {
        Self::start(test_config(|_| {})).await
    }

    /// Create a channel as `REMOTE` would through the HTTP API.
    pub async fn create_channel(&self, issuer: &str, key: Option<&[u8]>, webrtc: bool) -> Uuid {
        self.controller
            .create_channel(
                REMOTE.to_string(),
                issuer.to_string(),
                key.map(<[u8]>::to_vec),
                webrtc,
            )
            .await
            .expect("channel create")
            .0
    }

    /// Open a link, send the credentials frame, run the handshake.
    /// The returned client is live once the handshake succeeds.
    pub async fn connect_client(&self, frame: String) -> TestClient {
        let (server_end, client_end) = memory_link_pair();
        let client = TestClient::new(client_end);
        client.send_frame(frame);

        let gateway = Arc::clone(&self.gateway);
        tokio::spawn(async move {
            gateway.handle_link(server_end.link, server_end.events).await;
        });

        client
    }

    /// Connect with well-formed credentials for `session_id`.
    pub async fn connect_session(&self, channel: Uuid, session_id: &str) -> TestClient {
        let token = TokenBuilder::new().session_id(session_id).build();
        self.connect_client(credentials_frame(channel, &token)).await
    }
}

/// A `{"channelUUID", "jwt"}` credentials frame.
pub fn credentials_frame(channel: Uuid, token: &str) -> String {
    serde_json::json!({ "channelUUID": channel, "jwt": token }).to_string()
}

/// Poll until `predicate` holds or the deadline passes.
pub async fn wait_until<F, Fut>(what: &str, mut predicate: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if predicate().await {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

pub fn global_token(session_id: &str) -> String {
    TokenBuilder::new().session_id(session_id).build()
}

pub fn keyed_token(session_id: &str, key: &[u8]) -> String {
    TokenBuilder::new().key(key).session_id(session_id).build()
}

pub fn legacy_token(channel: Uuid, session_id: &str) -> String {
    TokenBuilder::new()
        .channel_uuid(channel)
        .session_id(session_id)
        .build()
}

pub fn default_test_key() -> Vec<u8> {
    test_key()
}
