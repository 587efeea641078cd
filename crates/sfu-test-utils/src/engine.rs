//! In-memory media engine.
//!
//! Implements the full engine trait surface with plain state: producers
//! registered on a router, consumers looked up against them, pause state in
//! atomics. Failure injection covers the paths the control plane must
//! recover from: consumer creation failures and worker death.
//!
//! # Example
//!
//! ```rust,ignore
//! use sfu_test_utils::engine::FakeMediaEngine;
//!
//! let engine = FakeMediaEngine::new();
//! engine.fail_next_consumes(2); // the next two consume() calls error
//! engine.set_producer_bitrate("producer-1", 32_000);
//! ```

use common::types::MediaKind;
use sfu_service::media::{
    MediaConsumer, MediaEngine, MediaError, MediaProducer, MediaRouter, MediaTransport,
    MediaWorker, ProducerStats, ResourceUsage, RtpCodecCapability, TransportOptions,
    TransportStats, WebRtcServer, WebRtcServerOptions, WorkerSettings,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

struct ProducerRecord {
    kind: MediaKind,
    paused: Arc<AtomicBool>,
    rtp_parameters: serde_json::Value,
}

/// Producer table shared between a router and its transports.
type ProducerTable = Arc<Mutex<HashMap<String, ProducerRecord>>>;

struct EngineInner {
    next_id: AtomicU64,
    /// Fail the next N `consume()` calls across all transports.
    consume_failures: AtomicU32,
    /// Global `can_consume` answer (the producer must still exist).
    can_consume: AtomicBool,
    /// Resident memory per worker id.
    worker_rss: Mutex<HashMap<String, u64>>,
    /// Reported bitrate per producer id.
    producer_bitrates: Mutex<HashMap<String, u64>>,
}

impl EngineInner {
    fn next(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

/// In-memory media engine with failure injection.
pub struct FakeMediaEngine {
    inner: Arc<EngineInner>,
}

impl FakeMediaEngine {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(EngineInner {
                next_id: AtomicU64::new(1),
                consume_failures: AtomicU32::new(0),
                can_consume: AtomicBool::new(true),
                worker_rss: Mutex::new(HashMap::new()),
                producer_bitrates: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Make the next `n` `consume()` calls fail.
    pub fn fail_next_consumes(&self, n: u32) {
        self.inner.consume_failures.store(n, Ordering::SeqCst);
    }

    /// Global answer for `can_consume` (the producer must still exist).
    pub fn set_can_consume(&self, value: bool) {
        self.inner.can_consume.store(value, Ordering::SeqCst);
    }

    /// Resident memory a worker reports.
    pub fn set_worker_rss(&self, worker_id: &str, rss: u64) {
        self.inner
            .worker_rss
            .lock()
            .unwrap()
            .insert(worker_id.to_string(), rss);
    }

    /// Bitrate a producer reports in its stats.
    pub fn set_producer_bitrate(&self, producer_id: &str, bitrate: u64) {
        self.inner
            .producer_bitrates
            .lock()
            .unwrap()
            .insert(producer_id.to_string(), bitrate);
    }
}

#[async_trait::async_trait]
impl MediaEngine for FakeMediaEngine {
    async fn create_worker(
        &self,
        _settings: &WorkerSettings,
    ) -> Result<Arc<dyn MediaWorker>, MediaError> {
        Ok(Arc::new(FakeWorker {
            id: self.inner.next("worker"),
            died: CancellationToken::new(),
            engine: Arc::clone(&self.inner),
        }))
    }
}

struct FakeWorker {
    id: String,
    died: CancellationToken,
    engine: Arc<EngineInner>,
}

#[async_trait::async_trait]
impl MediaWorker for FakeWorker {
    fn id(&self) -> &str {
        &self.id
    }

    async fn get_resource_usage(&self) -> Result<ResourceUsage, MediaError> {
        let rss = self
            .engine
            .worker_rss
            .lock()
            .unwrap()
            .get(&self.id)
            .copied()
            .unwrap_or(0);
        Ok(ResourceUsage { ru_maxrss: rss })
    }

    async fn create_router(
        &self,
        codecs: &[RtpCodecCapability],
    ) -> Result<Arc<dyn MediaRouter>, MediaError> {
        Ok(Arc::new(FakeRouter {
            id: self.engine.next("router"),
            capabilities: serde_json::json!({ "codecs": codecs }),
            producers: Arc::new(Mutex::new(HashMap::new())),
            engine: Arc::clone(&self.engine),
        }))
    }

    async fn create_webrtc_server(
        &self,
        _options: &WebRtcServerOptions,
    ) -> Result<Arc<dyn WebRtcServer>, MediaError> {
        Ok(Arc::new(FakeWebRtcServer {
            id: self.engine.next("webrtc-server"),
        }))
    }

    fn died(&self) -> CancellationToken {
        self.died.clone()
    }

    async fn close(&self) {
        self.died.cancel();
    }
}

struct FakeWebRtcServer {
    id: String,
}

impl WebRtcServer for FakeWebRtcServer {
    fn id(&self) -> &str {
        &self.id
    }
}

struct FakeRouter {
    id: String,
    capabilities: serde_json::Value,
    producers: ProducerTable,
    engine: Arc<EngineInner>,
}

#[async_trait::async_trait]
impl MediaRouter for FakeRouter {
    fn id(&self) -> &str {
        &self.id
    }

    fn rtp_capabilities(&self) -> serde_json::Value {
        self.capabilities.clone()
    }

    async fn create_webrtc_transport(
        &self,
        _options: &TransportOptions,
    ) -> Result<Arc<dyn MediaTransport>, MediaError> {
        Ok(Arc::new(FakeTransport {
            id: self.engine.next("transport"),
            producers: Arc::clone(&self.producers),
            engine: Arc::clone(&self.engine),
        }))
    }

    async fn can_consume(&self, producer_id: &str, _capabilities: &serde_json::Value) -> bool {
        self.engine.can_consume.load(Ordering::SeqCst)
            && self.producers.lock().unwrap().contains_key(producer_id)
    }

    async fn close(&self) {
        self.producers.lock().unwrap().clear();
    }
}

struct FakeTransport {
    id: String,
    producers: ProducerTable,
    engine: Arc<EngineInner>,
}

#[async_trait::async_trait]
impl MediaTransport for FakeTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn ice_parameters(&self) -> serde_json::Value {
        serde_json::json!({ "usernameFragment": self.id, "password": "fake" })
    }

    fn ice_candidates(&self) -> serde_json::Value {
        serde_json::json!([{ "ip": "127.0.0.1", "port": 40000 }])
    }

    fn dtls_parameters(&self) -> serde_json::Value {
        serde_json::json!({ "role": "auto", "fingerprints": [] })
    }

    fn sctp_parameters(&self) -> Option<serde_json::Value> {
        Some(serde_json::json!({ "port": 5000 }))
    }

    async fn connect(&self, _dtls_parameters: &serde_json::Value) -> Result<(), MediaError> {
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: &serde_json::Value,
    ) -> Result<Arc<dyn MediaProducer>, MediaError> {
        let id = self.engine.next("producer");
        let paused = Arc::new(AtomicBool::new(false));
        self.producers.lock().unwrap().insert(
            id.clone(),
            ProducerRecord {
                kind,
                paused: Arc::clone(&paused),
                rtp_parameters: rtp_parameters.clone(),
            },
        );
        Ok(Arc::new(FakeProducer {
            id,
            kind,
            paused,
            rtp_parameters: rtp_parameters.clone(),
            producers: Arc::clone(&self.producers),
            engine: Arc::clone(&self.engine),
        }))
    }

    async fn consume(
        &self,
        producer_id: &str,
        _capabilities: &serde_json::Value,
        paused: bool,
    ) -> Result<Arc<dyn MediaConsumer>, MediaError> {
        let failures = &self.engine.consume_failures;
        if failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(MediaError("injected consume failure".to_string()));
        }

        let producers = self.producers.lock().unwrap();
        let record = producers
            .get(producer_id)
            .ok_or_else(|| MediaError(format!("unknown producer {producer_id}")))?;

        Ok(Arc::new(FakeConsumer {
            id: self.engine.next("consumer"),
            kind: record.kind,
            paused: AtomicBool::new(paused),
            rtp_parameters: record.rtp_parameters.clone(),
        }))
    }

    async fn set_max_incoming_bitrate(&self, _bitrate: u32) -> Result<(), MediaError> {
        Ok(())
    }

    async fn set_max_outgoing_bitrate(&self, _bitrate: u32) -> Result<(), MediaError> {
        Ok(())
    }

    async fn get_stats(&self) -> Result<TransportStats, MediaError> {
        Ok(TransportStats::default())
    }

    async fn close(&self) {}
}

struct FakeProducer {
    id: String,
    kind: MediaKind,
    paused: Arc<AtomicBool>,
    rtp_parameters: serde_json::Value,
    producers: ProducerTable,
    engine: Arc<EngineInner>,
}

#[async_trait::async_trait]
impl MediaProducer for FakeProducer {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn rtp_parameters(&self) -> serde_json::Value {
        self.rtp_parameters.clone()
    }

    async fn pause(&self) -> Result<(), MediaError> {
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self) -> Result<(), MediaError> {
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn get_stats(&self) -> Result<ProducerStats, MediaError> {
        let bitrate = self
            .engine
            .producer_bitrates
            .lock()
            .unwrap()
            .get(&self.id)
            .copied()
            .unwrap_or(0);
        Ok(ProducerStats { bitrate })
    }

    async fn close(&self) {
        self.producers.lock().unwrap().remove(&self.id);
    }
}

struct FakeConsumer {
    id: String,
    kind: MediaKind,
    paused: AtomicBool,
    rtp_parameters: serde_json::Value,
}

#[async_trait::async_trait]
impl MediaConsumer for FakeConsumer {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn rtp_parameters(&self) -> serde_json::Value {
        self.rtp_parameters.clone()
    }

    async fn pause(&self) -> Result<(), MediaError> {
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self) -> Result<(), MediaError> {
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfu_service::media::WorkerSettings;

    fn settings() -> WorkerSettings {
        WorkerSettings {
            rtc_min_port: 40000,
            rtc_max_port: 49999,
        }
    }

    #[tokio::test]
    async fn test_produce_then_consume() {
        let engine = FakeMediaEngine::new();
        let worker = engine.create_worker(&settings()).await.unwrap();
        let router = worker.create_router(&[]).await.unwrap();
        let transport = router
            .create_webrtc_transport(&TransportOptions::default())
            .await
            .unwrap();

        let producer = transport
            .produce(MediaKind::Audio, &serde_json::json!({}))
            .await
            .unwrap();
        assert!(router.can_consume(producer.id(), &serde_json::json!({})).await);

        let consumer = transport
            .consume(producer.id(), &serde_json::json!({}), true)
            .await
            .unwrap();
        assert!(consumer.paused());
        assert_eq!(consumer.kind(), MediaKind::Audio);
    }

    #[tokio::test]
    async fn test_consume_failure_injection() {
        let engine = FakeMediaEngine::new();
        let worker = engine.create_worker(&settings()).await.unwrap();
        let router = worker.create_router(&[]).await.unwrap();
        let transport = router
            .create_webrtc_transport(&TransportOptions::default())
            .await
            .unwrap();
        let producer = transport
            .produce(MediaKind::Video, &serde_json::json!({}))
            .await
            .unwrap();

        engine.fail_next_consumes(1);
        assert!(transport
            .consume(producer.id(), &serde_json::json!({}), true)
            .await
            .is_err());
        // The failure budget is spent; the next call succeeds
        assert!(transport
            .consume(producer.id(), &serde_json::json!({}), true)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_closed_producer_cannot_be_consumed() {
        let engine = FakeMediaEngine::new();
        let worker = engine.create_worker(&settings()).await.unwrap();
        let router = worker.create_router(&[]).await.unwrap();
        let transport = router
            .create_webrtc_transport(&TransportOptions::default())
            .await
            .unwrap();
        let producer = transport
            .produce(MediaKind::Audio, &serde_json::json!({}))
            .await
            .unwrap();
        let producer_id = producer.id().to_string();

        producer.close().await;
        assert!(!router.can_consume(&producer_id, &serde_json::json!({})).await);
        assert!(transport
            .consume(&producer_id, &serde_json::json!({}), true)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_worker_death_token() {
        let engine = FakeMediaEngine::new();
        let worker = engine.create_worker(&settings()).await.unwrap();
        let died = worker.died();
        assert!(!died.is_cancelled());
        worker.close().await;
        assert!(died.is_cancelled());
    }
}
