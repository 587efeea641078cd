//! SFU control-plane service binary.
//!
//! Loads configuration from the environment, initializes tracing and runs
//! the supervisor until a shutdown signal arrives. The media engine is an
//! external collaborator; deployments link one in by constructing the
//! [`Supervisor`] with an engine implementation. Without one the service
//! still runs, serving data-only channels.

use sfu_service::config::Config;
use sfu_service::supervisor::Supervisor;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sfu_service=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting SFU control plane");

    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {e}");
        e
    })?;

    info!(
        public_ip = %config.public_ip,
        http_interface = %config.http_interface,
        port = config.port,
        channel_size = config.channel_size,
        proxy = config.proxy,
        "Configuration loaded"
    );

    let mut supervisor = Supervisor::new(config, None);
    supervisor.run().await?;

    Ok(())
}
