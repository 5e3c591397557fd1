//! Poolflow monitor entry point.

mod app;
mod config;

use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,poolflow=debug")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting poolflow monitor");

    let config = config::MonitorConfig::load()?;
    tracing::info!(
        url = %config.connection.url,
        unit = %config.subscription.unit_id,
        "configuration loaded"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(config))?;

    tracing::info!("monitor shut down cleanly");
    Ok(())
}
