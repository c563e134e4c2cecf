//! poolkeeper pool manager
//!
//! Runs one bounded pool against a cluster and keeps it tidy.
//!
//! ## Architecture
//!
//! - **Pool**: allocation, provisioning and reclaiming of slots
//! - **Monitor**: logs pool occupancy periodically
//! - **Cleanup Worker**: reclaims leaked resources and drops stale records
//! - **Cluster**: abstracts the external system (simulated for now)

use std::sync::Arc;

use anyhow::{Context, Result};
use poolkeeper::cluster::{MockCluster, Termination};
use poolkeeper::{CleanupWorker, Config, Pool, PoolMonitor, SqliteResourceStore};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first so the log level can come from it
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting poolkeeper pool manager");
    info!(
        capacity = config.capacity,
        slot_prefix = %config.slot_prefix,
        data_dir = %config.data_dir,
        "Configuration loaded"
    );

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create data dir {}", config.data_dir))?;
    let store = Arc::new(
        SqliteResourceStore::open(config.store_path()).context("failed to open resource store")?,
    );

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Create the cluster (simulated for now)
    let cluster = Arc::new(
        MockCluster::new().with_termination(Termination::AfterLists(config.mock_termination_lists)),
    );

    let pool = Arc::new(Pool::new(&config, cluster, store, shutdown_rx.clone())?);

    // Start the monitor
    let monitor = PoolMonitor::new(Arc::clone(&pool), config.monitor.clone());
    let monitor_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            monitor.run(shutdown_rx).await;
        }
    });

    // Start the cleanup worker
    let cleanup = CleanupWorker::new(Arc::clone(&pool), config.cleanup.clone());
    let cleanup_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            cleanup.run(shutdown_rx).await;
        }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = monitor_handle => {
            if let Err(e) = result {
                error!(error = %e, "Monitor task panicked");
            }
        }
        result = cleanup_handle => {
            if let Err(e) = result {
                error!(error = %e, "Cleanup task panicked");
            }
        }
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    // Give workers time to shut down gracefully
    info!("Waiting for workers to shut down...");
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;

    info!("Pool manager shutdown complete");
    Ok(())
}
