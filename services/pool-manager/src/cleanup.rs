//! Periodic cleanup of state the pool lost track of.
//!
//! Each pass:
//! - drops expired leases
//! - reclaims pool resources nobody owns (no record, no lease)
//! - removes records for slots the cluster no longer lists

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use poolkeeper_retry::{RetryTracker, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_WINDOW};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::cluster::ResourcePhase;
use crate::pool::Pool;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupConfig {
    pub interval: Duration,
    /// Failed deletes tolerated per slot within `retry_window`.
    pub max_delete_retries: u32,
    pub retry_window: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_delete_retries: DEFAULT_MAX_RETRIES,
            retry_window: DEFAULT_RETRY_WINDOW,
        }
    }
}

/// What one cleanup pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub expired_leases: usize,
    pub leaked_reclaimed: Vec<String>,
    pub leaked_failed: Vec<String>,
    pub stale_records: Vec<String>,
}

impl CleanupReport {
    pub fn is_empty(&self) -> bool {
        self.expired_leases == 0
            && self.leaked_reclaimed.is_empty()
            && self.leaked_failed.is_empty()
            && self.stale_records.is_empty()
    }
}

pub struct CleanupWorker {
    pool: Arc<Pool>,
    config: CleanupConfig,
    retries: Mutex<RetryTracker>,
}

impl CleanupWorker {
    pub fn new(pool: Arc<Pool>, config: CleanupConfig) -> Self {
        let retries = RetryTracker::new(config.max_delete_retries, config.retry_window);
        Self {
            pool,
            config,
            retries: Mutex::new(retries),
        }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            max_delete_retries = self.config.max_delete_retries,
            "Starting cleanup worker"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.run_once().await;
                    if !report.is_empty() {
                        info!(
                            expired_leases = report.expired_leases,
                            leaked_reclaimed = report.leaked_reclaimed.len(),
                            leaked_failed = report.leaked_failed.len(),
                            stale_records = report.stale_records.len(),
                            "Cleanup pass complete"
                        );
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Cleanup worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One cleanup pass. Failures of one step are logged and do not stop
    /// the others.
    pub async fn run_once(&self) -> CleanupReport {
        let mut report = CleanupReport {
            expired_leases: self.pool.leases().prune_expired(),
            ..Default::default()
        };
        if report.expired_leases > 0 {
            info!(expired = report.expired_leases, "Dropped expired leases");
        }
        self.lock_retries().prune();

        // Leases and records are read before the listing: a slot launched
        // after this point is still leased, and any record seen here was
        // stored after its resource was created.
        let held = self.pool.leases().held_names();
        let records = match self.pool.store().list().await {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, "Failed to list resource records");
                return report;
            }
        };
        let recorded: BTreeSet<&str> = records.iter().map(|r| r.slot_name.as_str()).collect();
        let snapshot = match self.pool.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "Failed to query cluster for cleanup");
                return report;
            }
        };

        let out_of_range_active = snapshot
            .out_of_range()
            .iter()
            .filter(|(_, phase)| *phase == ResourcePhase::Active)
            .map(|(name, _)| name.clone());
        let leaked: Vec<String> = snapshot
            .active()
            .into_iter()
            .chain(out_of_range_active)
            .filter(|name| !recorded.contains(name.as_str()) && !held.contains(name))
            .filter(|name| !self.pool.reclaimer().is_in_flight(name))
            .collect();

        for name in leaked {
            if self.lock_retries().is_exhausted(&name) {
                debug!(slot = %name, "Skipping leaked slot, delete retries exhausted");
                continue;
            }

            info!(slot = %name, "Reclaiming leaked slot");
            match self.pool.reclaimer().reclaim(&name).await {
                Ok(()) => {
                    self.lock_retries().clear(&name);
                    report.leaked_reclaimed.push(name);
                }
                Err(e) => {
                    if self.lock_retries().record_failure(&name) {
                        error!(slot = %name, error = %e, "Giving up on leaked slot");
                    } else {
                        warn!(slot = %name, error = %e, "Failed to reclaim leaked slot");
                    }
                    report.leaked_failed.push(name);
                }
            }
        }

        let present: BTreeSet<String> = snapshot
            .active()
            .into_iter()
            .chain(snapshot.terminating())
            .chain(snapshot.out_of_range().iter().map(|(name, _)| name.clone()))
            .collect();

        // Removal is keyed on the external id: the slot may have been
        // relaunched since the records were read.
        for record in records {
            let name = record.slot_name;
            if present.contains(&name) || held.contains(&name) {
                continue;
            }
            match self.pool.store().remove_if(&name, &record.external_id).await {
                Ok(true) => {
                    debug!(slot = %name, "Removed stale resource record");
                    report.stale_records.push(name);
                }
                Ok(false) => debug!(slot = %name, "Stale record was replaced, kept"),
                Err(e) => warn!(slot = %name, error = %e, "Failed to remove stale record"),
            }
        }

        report
    }

    fn lock_retries(&self) -> MutexGuard<'_, RetryTracker> {
        self.retries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
