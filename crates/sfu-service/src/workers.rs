//! Media worker pool.
//!
//! A fixed set of engine workers is created at startup, each carrying a
//! WebRTC server bound to the configured port range and public IP. Channels
//! are pinned to the worker returned by [`WorkerPool::get_worker`], which
//! picks the worker with the lowest resident memory at that moment.
//!
//! When a worker dies its slot is respawned with capped exponential backoff;
//! after too many consecutive failures the slot is abandoned so a broken
//! engine cannot spin the process. Channels bound to the dead worker close
//! themselves through the worker's death token.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::errors::SfuError;
use crate::media::{
    MediaEngine, MediaError, MediaWorker, WebRtcServer, WebRtcServerOptions, WorkerSettings,
};

/// Respawn backoff: initial delay, doubling up to the cap.
const RESPAWN_BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const RESPAWN_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Consecutive respawn failures before a slot is abandoned.
const MAX_RESPAWN_ATTEMPTS: u32 = 5;

/// One pool slot: the worker plus its engine-created WebRTC server.
#[derive(Clone)]
pub struct PoolWorker {
    pub worker: Arc<dyn MediaWorker>,
    pub webrtc_server: Arc<dyn WebRtcServer>,
}

struct PoolShared {
    engine: Arc<dyn MediaEngine>,
    settings: WorkerSettings,
    server_options: WebRtcServerOptions,
    slots: Mutex<Vec<Option<PoolWorker>>>,
    cancel: CancellationToken,
}

/// Fixed pool of media workers.
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<PoolShared>,
}

impl WorkerPool {
    /// Create the pool: `min(NUM_WORKERS, hardware parallelism)` workers,
    /// each with a WebRTC server.
    ///
    /// # Errors
    ///
    /// Fails if any initial worker cannot be created; partial pools are not
    /// started.
    pub async fn start(engine: Arc<dyn MediaEngine>, config: &Config) -> Result<Self, SfuError> {
        let hardware = std::thread::available_parallelism().map_or(1, |n| n.get());
        let count = config
            .num_workers
            .map_or(hardware, |n| n.min(hardware))
            .max(1);

        let shared = Arc::new(PoolShared {
            engine,
            settings: WorkerSettings {
                rtc_min_port: config.rtc_min_port,
                rtc_max_port: config.rtc_max_port,
            },
            server_options: WebRtcServerOptions {
                listen_ip: config
                    .rtc_interface
                    .clone()
                    .unwrap_or_else(|| "0.0.0.0".to_string()),
                announced_ip: config.public_ip.clone(),
            },
            slots: Mutex::new(Vec::with_capacity(count)),
            cancel: CancellationToken::new(),
        });

        for index in 0..count {
            let pool_worker = spawn_worker(&shared).await?;
            lock_slots(&shared).push(Some(pool_worker));
            tokio::spawn(watch_slot(Arc::clone(&shared), index));
        }

        info!(target: "sfu.workers", workers = count, "Worker pool started");

        Ok(Self { shared })
    }

    /// Pick the worker with the lowest resident memory. Usage is queried
    /// from every live worker concurrently; ties are broken arbitrarily.
    ///
    /// # Errors
    ///
    /// Fails when no live worker remains.
    pub async fn get_worker(&self) -> Result<PoolWorker, SfuError> {
        let workers: Vec<PoolWorker> = lock_slots(&self.shared)
            .iter()
            .flatten()
            .cloned()
            .collect();

        if workers.is_empty() {
            return Err(SfuError::Internal("no live media workers".to_string()));
        }

        let usages = futures::future::join_all(
            workers
                .iter()
                .map(|pool_worker| pool_worker.worker.get_resource_usage()),
        )
        .await;

        let mut best: Option<(u64, &PoolWorker)> = None;
        for (pool_worker, usage) in workers.iter().zip(usages) {
            // A worker that cannot report usage sorts last
            let rss = usage.map_or(u64::MAX, |u| u.ru_maxrss);
            if best.map_or(true, |(best_rss, _)| rss < best_rss) {
                best = Some((rss, pool_worker));
            }
        }

        // Non-empty list guarantees a pick
        best.map(|(_, pool_worker)| pool_worker.clone())
            .ok_or_else(|| SfuError::Internal("no live media workers".to_string()))
    }

    /// Number of live workers.
    #[must_use]
    pub fn size(&self) -> usize {
        lock_slots(&self.shared).iter().flatten().count()
    }

    /// Close every worker. Idempotent.
    pub async fn stop(&self) {
        self.shared.cancel.cancel();
        let workers: Vec<PoolWorker> = lock_slots(&self.shared)
            .iter_mut()
            .filter_map(Option::take)
            .collect();
        for pool_worker in workers {
            pool_worker.worker.close().await;
        }
    }
}

async fn spawn_worker(shared: &Arc<PoolShared>) -> Result<PoolWorker, MediaError> {
    let worker = shared.engine.create_worker(&shared.settings).await?;
    let webrtc_server = worker.create_webrtc_server(&shared.server_options).await?;
    Ok(PoolWorker {
        worker,
        webrtc_server,
    })
}

/// Supervise one slot: wait for the worker to die, then respawn with
/// backoff. Gives up on the slot after [`MAX_RESPAWN_ATTEMPTS`]
/// consecutive failures.
async fn watch_slot(shared: Arc<PoolShared>, index: usize) {
    loop {
        let Some(died) = lock_slots(&shared)
            .get(index)
            .and_then(|slot| slot.as_ref().map(|w| w.worker.died()))
        else {
            return;
        };

        tokio::select! {
            () = shared.cancel.cancelled() => return,
            () = died.cancelled() => {}
        }

        warn!(target: "sfu.workers", slot = index, "Media worker died, respawning");
        lock_slots(&shared)[index] = None;

        let mut backoff = RESPAWN_BACKOFF_INITIAL;
        let mut attempts = 0u32;
        loop {
            if shared.cancel.is_cancelled() {
                return;
            }
            match spawn_worker(&shared).await {
                Ok(pool_worker) => {
                    lock_slots(&shared)[index] = Some(pool_worker);
                    info!(target: "sfu.workers", slot = index, "Media worker respawned");
                    break;
                }
                Err(e) => {
                    attempts += 1;
                    if attempts >= MAX_RESPAWN_ATTEMPTS {
                        error!(
                            target: "sfu.workers",
                            slot = index,
                            attempts,
                            error = %e,
                            "Worker slot abandoned after repeated respawn failures"
                        );
                        return;
                    }
                    warn!(
                        target: "sfu.workers",
                        slot = index,
                        attempts,
                        error = %e,
                        backoff_ms = backoff.as_millis() as u64,
                        "Worker respawn failed"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(RESPAWN_BACKOFF_MAX);
                }
            }
        }
    }
}

fn lock_slots(shared: &Arc<PoolShared>) -> std::sync::MutexGuard<'_, Vec<Option<PoolWorker>>> {
    shared
        .slots
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}
