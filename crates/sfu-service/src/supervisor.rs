//! Process supervisor.
//!
//! Owns start/stop ordering and the signal surface:
//!
//! - SIGINT / SIGTERM: clean shutdown
//! - SIGHUP: restart (stop everything, then start again)
//! - SIGUSR2: soft reset (close all channels, services stay up)
//! - SIGUSR1: log per-channel statistics and the global incoming bitrate
//!
//! Start order is key decode, worker pool, then HTTP + gateway; stop order
//! is the reverse and idempotent. Errors inside background tasks are logged
//! by their owners and never take the process down.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::actors::ControllerActorHandle;
use crate::config::Config;
use crate::errors::SfuError;
use crate::gateway::Gateway;
use crate::media::MediaEngine;
use crate::routes::{build_router, AppState};
use crate::workers::WorkerPool;

struct Running {
    controller: ControllerActorHandle,
    pool: Option<WorkerPool>,
    http_cancel: CancellationToken,
    http_task: JoinHandle<()>,
    local_addr: SocketAddr,
}

/// The process supervisor.
pub struct Supervisor {
    config: Arc<Config>,
    engine: Option<Arc<dyn MediaEngine>>,
    running: Option<Running>,
}

impl Supervisor {
    /// Build a supervisor. Without an engine, every channel is data-only
    /// and WebRTC channel creation fails with a configuration error.
    #[must_use]
    pub fn new(config: Config, engine: Option<Arc<dyn MediaEngine>>) -> Self {
        Self {
            config: Arc::new(config),
            engine,
            running: None,
        }
    }

    /// Start all services. A no-op when already started.
    ///
    /// # Errors
    ///
    /// Fails when the key cannot be decoded, the worker pool cannot start,
    /// or the HTTP listener cannot bind.
    pub async fn start(&mut self) -> Result<(), SfuError> {
        if self.running.is_some() {
            return Ok(());
        }

        let global_key = Arc::new(
            self.config
                .decoded_auth_key()
                .map_err(|e| SfuError::Config(e.to_string()))?,
        );

        let pool = match &self.engine {
            Some(engine) => {
                Some(WorkerPool::start(Arc::clone(engine), &self.config).await?)
            }
            None => {
                warn!(
                    target: "sfu.supervisor",
                    "No media engine configured; channels will be data-only"
                );
                None
            }
        };

        let controller = ControllerActorHandle::new(pool.clone(), Arc::clone(&self.config));
        let gateway = Gateway::new(
            controller.clone(),
            Arc::clone(&global_key),
            Arc::clone(&self.config),
        );

        let router = build_router(AppState {
            controller: controller.clone(),
            gateway,
            config: Arc::clone(&self.config),
            global_key,
        });

        let bind = format!("{}:{}", self.config.http_interface, self.config.port);
        let listener = tokio::net::TcpListener::bind(&bind)
            .await
            .map_err(|e| SfuError::Internal(format!("bind {bind}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| SfuError::Internal(format!("local addr: {e}")))?;

        let http_cancel = CancellationToken::new();
        let shutdown = http_cancel.clone();
        let http_task = tokio::spawn(async move {
            let service = router.into_make_service_with_connect_info::<SocketAddr>();
            let result = axum::serve(listener, service)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await;
            if let Err(e) = result {
                error!(target: "sfu.supervisor", error = %e, "HTTP server failed");
            }
        });

        info!(
            target: "sfu.supervisor",
            addr = %local_addr,
            workers = pool.as_ref().map_or(0, WorkerPool::size),
            "Services started"
        );

        self.running = Some(Running {
            controller,
            pool,
            http_cancel,
            http_task,
            local_addr,
        });

        Ok(())
    }

    /// Stop all services in reverse start order. Idempotent.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        info!(target: "sfu.supervisor", "Stopping services");

        running.http_cancel.cancel();
        if tokio::time::timeout(std::time::Duration::from_secs(5), running.http_task)
            .await
            .is_err()
        {
            warn!(target: "sfu.supervisor", "HTTP shutdown timed out");
        }

        if let Err(e) = running.controller.shutdown().await {
            warn!(target: "sfu.supervisor", error = %e, "Controller shutdown failed");
        }

        if let Some(pool) = running.pool {
            pool.stop().await;
        }

        info!(target: "sfu.supervisor", "Services stopped");
    }

    /// Address the HTTP server is bound to, when running.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    /// Controller handle, when running.
    #[must_use]
    pub fn controller(&self) -> Option<&ControllerActorHandle> {
        self.running.as_ref().map(|r| &r.controller)
    }

    /// Start the services and block on the signal loop until a shutdown
    /// signal arrives.
    ///
    /// # Errors
    ///
    /// Fails when the initial start (or a restart) fails.
    #[cfg(unix)]
    pub async fn run(&mut self) -> Result<(), SfuError> {
        use tokio::signal::unix::{signal, SignalKind};

        self.start().await?;

        let mut sigint = signal(SignalKind::interrupt())
            .map_err(|e| SfuError::Internal(format!("signal handler: {e}")))?;
        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| SfuError::Internal(format!("signal handler: {e}")))?;
        let mut sighup = signal(SignalKind::hangup())
            .map_err(|e| SfuError::Internal(format!("signal handler: {e}")))?;
        let mut sigusr1 = signal(SignalKind::user_defined1())
            .map_err(|e| SfuError::Internal(format!("signal handler: {e}")))?;
        let mut sigusr2 = signal(SignalKind::user_defined2())
            .map_err(|e| SfuError::Internal(format!("signal handler: {e}")))?;

        loop {
            tokio::select! {
                _ = sigint.recv() => {
                    info!(target: "sfu.supervisor", "SIGINT: shutting down");
                    self.stop().await;
                    return Ok(());
                }
                _ = sigterm.recv() => {
                    info!(target: "sfu.supervisor", "SIGTERM: shutting down");
                    self.stop().await;
                    return Ok(());
                }
                _ = sighup.recv() => {
                    info!(target: "sfu.supervisor", "SIGHUP: restarting");
                    self.stop().await;
                    self.start().await?;
                }
                _ = sigusr2.recv() => {
                    info!(target: "sfu.supervisor", "SIGUSR2: soft reset, closing all channels");
                    if let Some(running) = &self.running {
                        if let Err(e) = running.controller.close_all().await {
                            warn!(target: "sfu.supervisor", error = %e, "Soft reset failed");
                        }
                    }
                }
                _ = sigusr1.recv() => {
                    self.log_stats().await;
                }
            }
        }
    }

    /// Log per-channel statistics and the global incoming bitrate.
    async fn log_stats(&self) {
        let Some(running) = &self.running else {
            return;
        };
        match running.controller.get_stats().await {
            Ok(stats) => {
                let mut incoming_total: u64 = 0;
                for channel in &stats {
                    incoming_total += channel.bitrate.total;
                    info!(
                        target: "sfu.stats",
                        channel = %channel.uuid,
                        sessions = channel.sessions,
                        audio_bps = channel.bitrate.audio,
                        camera_bps = channel.bitrate.camera,
                        screen_bps = channel.bitrate.screen,
                        cameras_on = channel.cameras_on,
                        screens_on = channel.screens_on,
                        "Channel stats"
                    );
                }
                info!(
                    target: "sfu.stats",
                    channels = stats.len(),
                    incoming_bps = incoming_total,
                    "Global stats"
                );
            }
            Err(e) => warn!(target: "sfu.supervisor", error = %e, "Stats collection failed"),
        }
    }
}
