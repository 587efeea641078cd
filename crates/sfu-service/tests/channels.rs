//! Channel lifecycle scenarios: capacity on the wire, duplicate-id
//! replacement and idle close.

mod util;

use common::types::ChannelId;
use util::{test_config, wait_until, Stack};

/// Filling a channel to capacity succeeds; the next join closes its link
/// with the channel-full code.
#[tokio::test]
async fn join_beyond_capacity_closes_4109() {
    let mut config = test_config(|_| {});
    config.channel_size = 2;
    let stack = Stack::start(config).await;
    let channel = stack.create_channel("iss", None, false).await;

    let _c1 = stack.connect_session(channel, "1").await;
    let _c2 = stack.connect_session(channel, "2").await;

    let access = stack
        .controller
        .get_channel(ChannelId(channel))
        .await
        .unwrap()
        .unwrap();
    wait_until("channel at capacity", || async {
        access.handle.get_stats().await.unwrap().sessions == 2
    })
    .await;

    let c3 = stack.connect_session(channel, "3").await;
    assert_eq!(c3.wait_close_code().await, Some(4109));

    let stats = access.handle.get_stats().await.unwrap();
    assert_eq!(stats.sessions, 2);
}

/// Reconnecting with a duplicate session id evicts the prior session with
/// the kicked/replaced close code; the newcomer is the only holder of the
/// id afterwards.
#[tokio::test]
async fn duplicate_session_id_replaces_prior() {
    let stack = Stack::with_defaults().await;
    let channel = stack.create_channel("iss", None, false).await;

    let first = stack.connect_session(channel, "dup").await;

    let access = stack
        .controller
        .get_channel(ChannelId(channel))
        .await
        .unwrap()
        .unwrap();
    wait_until("first session joined", || async {
        access.handle.get_stats().await.unwrap().sessions == 1
    })
    .await;

    let _second = stack.connect_session(channel, "dup").await;

    // The prior link closes with the replaced mapping (kicked code)
    assert_eq!(first.wait_close_code().await, Some(4108));

    // Still exactly one session under the id
    let stats = access.handle.get_stats().await.unwrap();
    assert_eq!(stats.sessions, 1);
}

/// A channel whose population stays at one closes at the idle deadline
/// and disappears from the registry.
#[tokio::test]
async fn idle_channel_closes_and_deregisters() {
    let mut config = test_config(|t| {
        t.channel = std::time::Duration::from_millis(200);
    });
    config.channel_size = 4;
    let stack = Stack::start(config).await;
    let channel = stack.create_channel("iss", None, false).await;

    let client = stack.connect_session(channel, "solo").await;

    // The lone session does not keep the channel alive
    assert_eq!(client.wait_close_code().await, Some(4108));

    wait_until("channel deregistered", || async {
        stack
            .controller
            .get_channel(ChannelId(channel))
            .await
            .unwrap()
            .is_none()
    })
    .await;
}

/// A soft reset closes every channel but the process keeps serving.
#[tokio::test]
async fn soft_reset_closes_channels() {
    let stack = Stack::with_defaults().await;
    let a = stack.create_channel("iss-a", None, false).await;
    let b = stack.create_channel("iss-b", None, false).await;

    let client = stack.connect_session(a, "1").await;
    wait_until("session joined", || async {
        stack.gateway.authenticated_count() == 1
    })
    .await;

    stack.controller.close_all().await.unwrap();

    assert_eq!(client.wait_close_code().await, Some(4108));
    wait_until("registries emptied", || async {
        stack.controller.get_channel(ChannelId(a)).await.unwrap().is_none()
            && stack.controller.get_channel(ChannelId(b)).await.unwrap().is_none()
    })
    .await;

    // New channels can still be created afterwards
    let again = stack.create_channel("iss-a", None, false).await;
    assert_ne!(again, a);
}

/// Producer bitrates aggregate into the channel stats.
#[tokio::test]
async fn stats_aggregate_producer_bitrates() {
    let stack = Stack::with_defaults().await;
    let channel = stack.create_channel("iss", None, true).await;

    let c1 = stack.connect_session(channel, "1").await;
    c1.expect_message(sfu_service::bus::names::INIT_TRANSPORTS).await;

    let response = c1
        .request(
            sfu_service::bus::names::INIT_PRODUCER,
            serde_json::json!({ "type": "audio", "kind": "audio", "rtpParameters": {} }),
        )
        .await
        .expect("producer created");
    let producer_id = response.payload["id"].as_str().unwrap().to_string();

    stack.engine.set_producer_bitrate(&producer_id, 48_000);

    let access = stack
        .controller
        .get_channel(ChannelId(channel))
        .await
        .unwrap()
        .unwrap();
    wait_until("bitrate visible in stats", || async {
        let stats = access.handle.get_stats().await.unwrap();
        stats.bitrate.audio == 48_000 && stats.bitrate.total == 48_000
    })
    .await;
}
