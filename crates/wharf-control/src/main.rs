//! wharf worker binary.
//!
//! Consumes deployment, container-operation and source-push jobs until
//! SIGINT or SIGTERM.

use tracing::info;
use tracing_subscriber::EnvFilter;

use wharf_control::{ControlConfig, ControlService};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("wharf_control=info".parse()?),
        )
        .init();

    info!("wharf worker starting");

    let config = ControlConfig::load_or_default();

    info!(
        database = %config.database.url,
        queues = ?config.worker.queues,
        prefetch = config.worker.prefetch,
        "configuration loaded"
    );

    ControlService::new(config).run().await?;

    Ok(())
}
