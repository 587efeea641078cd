//! `Supervisor` unit-style scenarios, run as an integration test so
//! `sfu-test-utils` (which itself depends on `sfu-service`) links against
//! a single copy of this crate instead of a second `cfg(test)` copy.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use sfu_service::config::Config;
use sfu_service::errors::SfuError;
use sfu_service::supervisor::Supervisor;
use sfu_test_utils::engine::FakeMediaEngine;
use std::collections::HashMap;

fn test_config() -> Config {
    let vars = HashMap::from([
        (
            "AUTH_KEY".to_string(),
            "dGVzdC1hdXRoLWtleS0xMjM0NTY=".to_string(),
        ),
        ("PUBLIC_IP".to_string(), "127.0.0.1".to_string()),
        ("HTTP_INTERFACE".to_string(), "127.0.0.1".to_string()),
        // Ephemeral port so tests never collide
        ("PORT".to_string(), "0".to_string()),
        ("NUM_WORKERS".to_string(), "1".to_string()),
    ]);
    Config::from_vars(&vars).unwrap()
}

#[tokio::test]
async fn test_start_stop_cycle() {
    let mut supervisor = Supervisor::new(test_config(), Some(FakeMediaEngine::new()));

    supervisor.start().await.unwrap();
    assert!(supervisor.local_addr().is_some());

    // Starting twice is a no-op
    supervisor.start().await.unwrap();

    supervisor.stop().await;
    assert!(supervisor.local_addr().is_none());

    // Stopping twice is a no-op
    supervisor.stop().await;
}

#[tokio::test]
async fn test_restart_rebinds() {
    let mut supervisor = Supervisor::new(test_config(), Some(FakeMediaEngine::new()));

    supervisor.start().await.unwrap();
    supervisor.stop().await;
    supervisor.start().await.unwrap();
    assert!(supervisor.local_addr().is_some());
    supervisor.stop().await;
}

#[tokio::test]
async fn test_bad_auth_key_fails_start() {
    let vars = HashMap::from([
        ("AUTH_KEY".to_string(), "!!!not-base64!!!".to_string()),
        ("PUBLIC_IP".to_string(), "127.0.0.1".to_string()),
    ]);
    let config = Config::from_vars(&vars).unwrap();
    let mut supervisor = Supervisor::new(config, None);

    assert!(matches!(
        supervisor.start().await,
        Err(SfuError::Config(_))
    ));
}
