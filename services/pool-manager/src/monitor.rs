//! Periodic pool occupancy reports.
//!
//! The monitor takes a snapshot every interval and logs:
//! - Free, active and terminating slot counts
//! - Leased names and reclaims in flight
//! - Leaked resources beyond the current capacity

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::pool::{Pool, PoolStatus};

/// Monitor configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Interval between reports.
    pub interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
        }
    }
}

/// Logs pool status until shutdown.
pub struct PoolMonitor {
    pool: Arc<Pool>,
    config: MonitorConfig,
}

impl PoolMonitor {
    pub fn new(pool: Arc<Pool>, config: MonitorConfig) -> Self {
        Self { pool, config }
    }

    /// Run the monitor loop until shutdown.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Starting pool monitor"
        );

        let mut consecutive_failures = 0u32;
        let mut interval = tokio::time::interval(self.config.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.pool.status().await {
                        Ok(status) => {
                            consecutive_failures = 0;
                            report(&status);
                        }
                        Err(e) => {
                            consecutive_failures += 1;
                            if consecutive_failures <= 3 {
                                warn!(
                                    error = %e,
                                    consecutive_failures,
                                    "Pool status query failed"
                                );
                            } else {
                                error!(
                                    error = %e,
                                    consecutive_failures,
                                    "Pool status query failed repeatedly"
                                );
                            }
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Pool monitor shutting down");
                        break;
                    }
                }
            }
        }
    }
}

fn report(status: &PoolStatus) {
    info!(
        capacity = status.capacity,
        free = status.free,
        active = status.active,
        terminating = status.terminating,
        leased = status.leased,
        reclaiming = status.reclaiming,
        "Pool status"
    );

    if status.out_of_range > 0 {
        warn!(
            out_of_range = status.out_of_range,
            "Pool resources found beyond capacity"
        );
    }
}
