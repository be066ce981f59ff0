mod bus;
mod config;
mod message;
mod platform;
mod scheduler;
mod store;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::bus::Bus;
use crate::config::Config;
use crate::scheduler::Scheduler;
use crate::store::SqliteLinkStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,bridgebot=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!("Configuration loaded successfully");
    info!(
        "  Rate limit: {} messages per {}s (capacity {})",
        config.rate_limit.refill, config.rate_limit.window_secs, config.rate_limit.capacity
    );
    info!("  Lane capacity: {}", config.dispatch.lane_capacity);
    info!("  Telegram: {}", config.telegram.is_some());
    info!("  Metrics exporter: {}", config.metrics.enabled);

    bus::metrics::install_exporter(&config.metrics)?;

    // Rebuild the link graph from storage
    let store = SqliteLinkStore::open(&config.database.path)?;
    let bus = Bus::new(config.rate_limit.clone(), &config.dispatch, Arc::new(store));
    bus.load_links().await?;

    let mut scheduler = Scheduler::new(bus.clone()).await?;
    scheduler::tasks::register_builtin_tasks(&mut scheduler).await?;
    scheduler.start().await?;

    match config.telegram {
        Some(telegram) => {
            info!("Bridge is starting...");
            platform::telegram::run(bus, telegram).await?;
        }
        None => {
            info!("No adapters configured; waiting for Ctrl-C");
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
        }
    }

    info!("Shutting down");
    scheduler.shutdown().await?;
    Ok(())
}
