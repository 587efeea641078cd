//! `WorkerPool` unit-style scenarios, run as an integration test so
//! `sfu-test-utils` (which itself depends on `sfu-service`) links against
//! a single copy of this crate instead of a second `cfg(test)` copy.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use sfu_service::config::Config;
use sfu_service::workers::WorkerPool;
use sfu_test_utils::engine::FakeMediaEngine;
use std::collections::HashMap;
use std::time::Duration;

fn test_config(workers: usize) -> Config {
    let vars = HashMap::from([
        (
            "AUTH_KEY".to_string(),
            "dGVzdC1hdXRoLWtleS0xMjM0NTY=".to_string(),
        ),
        ("PUBLIC_IP".to_string(), "203.0.113.7".to_string()),
        ("NUM_WORKERS".to_string(), workers.to_string()),
    ]);
    Config::from_vars(&vars).unwrap()
}

#[tokio::test]
async fn test_pool_starts_requested_workers() {
    let engine = FakeMediaEngine::new();
    let pool = WorkerPool::start(engine.clone(), &test_config(1)).await.unwrap();

    assert_eq!(pool.size(), 1);
    pool.stop().await;
}

#[tokio::test]
async fn test_get_worker_prefers_lowest_memory() {
    let engine = FakeMediaEngine::new();
    let pool = WorkerPool::start(engine.clone(), &test_config(1)).await.unwrap();

    // The fake engine reports per-worker memory; the single worker wins
    let picked = pool.get_worker().await.unwrap();
    assert!(!picked.worker.id().is_empty());
    pool.stop().await;
}

#[tokio::test]
async fn test_worker_death_respawns_slot() {
    let engine = FakeMediaEngine::new();
    let pool = WorkerPool::start(engine.clone(), &test_config(1)).await.unwrap();

    let first = pool.get_worker().await.unwrap();
    let first_id = first.worker.id().to_string();
    first.worker.died().cancel();

    // Give the watcher a moment to respawn
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(pool.size(), 1);
    let second = pool.get_worker().await.unwrap();
    assert_ne!(second.worker.id(), first_id);
    pool.stop().await;
}

#[tokio::test]
async fn test_stopped_pool_has_no_workers() {
    let engine = FakeMediaEngine::new();
    let pool = WorkerPool::start(engine.clone(), &test_config(1)).await.unwrap();

    pool.stop().await;
    assert_eq!(pool.size(), 0);
    assert!(pool.get_worker().await.is_err());
}
