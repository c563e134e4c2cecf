//! Slot allocation.
//!
//! Allocation picks free slots in ascending index order. When too few are
//! free it reclaims occupied slots that are not spared and polls the
//! cluster until enough have been released.
//!
//! # Invariants
//!
//! - Spared names are never returned, reclaimed or counted as free
//! - A name is handed out at most once until launched, relinquished or
//!   its lease expires
//! - Selection is deterministic for a given snapshot

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use poolkeeper_retry::Deadline;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, instrument, warn};

use crate::cluster::{ClusterView, Snapshot};
use crate::error::PoolError;
use crate::lease::LeaseTable;
use crate::reclaim::Reclaimer;

/// Allocation loop configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct AllocatorConfig {
    /// Delay between cluster snapshots while waiting.
    pub poll_interval: Duration,

    /// Default bound on one allocation. `None` waits indefinitely.
    pub timeout: Option<Duration>,

    /// Consecutive failed snapshots tolerated before giving up.
    pub max_query_failures: u32,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            timeout: Some(Duration::from_secs(300)),
            max_query_failures: 5,
        }
    }
}

/// A request for slot names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationRequest {
    pub count: usize,

    /// Names the caller is still using.
    pub spared: BTreeSet<String>,

    /// Replaces the configured timeout for this request.
    /// `Some(Duration::ZERO)` gives up after the first snapshot.
    pub timeout: Option<Duration>,
}

impl AllocationRequest {
    pub fn new(count: usize) -> Self {
        Self {
            count,
            ..Default::default()
        }
    }

    pub fn with_spared<I, S>(mut self, spared: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spared = spared.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Outcome of one selection pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    /// Enough names are free.
    Take(Vec<String>),
    /// Wait for slots to be released, reclaiming `reclaim` first.
    Wait {
        pending: usize,
        reclaim: Vec<String>,
    },
}

/// Names that must not be selected, beyond the caller's spared set.
#[derive(Debug, Clone, Copy)]
pub struct Exclusions<'a> {
    /// Names under a live lease.
    pub leased: &'a BTreeSet<String>,
    /// Names with a reclaim in flight.
    pub in_flight: &'a BTreeSet<String>,
    /// Names this allocation already asked to reclaim.
    pub requested: &'a BTreeSet<String>,
}

/// Decide what one snapshot allows for a request of `count` names.
pub fn plan(
    snapshot: &Snapshot,
    count: usize,
    spared: &BTreeSet<String>,
    exclusions: &Exclusions<'_>,
) -> Result<Plan, PoolError> {
    let usable = |name: &String| !spared.contains(name) && !exclusions.leased.contains(name);

    let free: Vec<String> = snapshot.free().into_iter().filter(usable).collect();
    if free.len() >= count {
        return Ok(Plan::Take(free.into_iter().take(count).collect()));
    }
    let missing = count - free.len();

    let terminating = snapshot.terminating().into_iter().filter(usable).count();

    let (pending_active, candidates): (Vec<String>, Vec<String>) = snapshot
        .active()
        .into_iter()
        .filter(usable)
        .partition(|name| exclusions.in_flight.contains(name) || exclusions.requested.contains(name));

    let pending = terminating + pending_active.len();
    let needed = missing.saturating_sub(pending);

    if candidates.len() < needed {
        let spared_in_pool = spared
            .iter()
            .filter(|name| snapshot.phase_of(name).is_some())
            .count();
        return Err(PoolError::PoolExhausted {
            requested: count,
            capacity: snapshot.capacity(),
            free: free.len(),
            terminating,
            reclaimable: candidates.len() + pending_active.len(),
            spared: spared_in_pool,
        });
    }

    Ok(Plan::Wait {
        pending,
        reclaim: candidates.into_iter().take(needed).collect(),
    })
}

/// Hands out slot names, reclaiming occupied slots when needed.
pub struct PoolAllocator {
    view: ClusterView,
    capacity: Arc<AtomicU32>,
    leases: Arc<LeaseTable>,
    reclaimer: Reclaimer,
    config: AllocatorConfig,
    shutdown: watch::Receiver<bool>,
    /// Serializes snapshot, selection and leasing.
    lock: Mutex<()>,
}

impl PoolAllocator {
    pub fn new(
        view: ClusterView,
        capacity: Arc<AtomicU32>,
        leases: Arc<LeaseTable>,
        reclaimer: Reclaimer,
        config: AllocatorConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            view,
            capacity,
            leases,
            reclaimer,
            config,
            shutdown,
            lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Allocate `request.count` slot names.
    ///
    /// Returned names are leased to the caller and absent from the cluster
    /// at the time of the final snapshot.
    #[instrument(skip(self, request), fields(count = request.count, spared = request.spared.len()))]
    pub async fn allocate(&self, request: &AllocationRequest) -> Result<Vec<String>, PoolError> {
        if request.count == 0 {
            return Ok(Vec::new());
        }

        let capacity = self.capacity.load(Ordering::SeqCst);
        if request.count > capacity as usize {
            return Err(PoolError::PoolExhausted {
                requested: request.count,
                capacity,
                free: 0,
                terminating: 0,
                reclaimable: 0,
                spared: request.spared.len(),
            });
        }

        let deadline = Deadline::after(request.timeout.or(self.config.timeout));
        let mut shutdown = self.shutdown.clone();
        let mut requested = BTreeSet::new();
        let mut consecutive_failures = 0u32;

        loop {
            if *shutdown.borrow() {
                return Err(PoolError::Cancelled);
            }

            match self.attempt(request, &mut requested).await {
                Ok(Some(names)) => {
                    info!(names = ?names, waited_ms = deadline.elapsed().as_millis() as u64, "Slots allocated");
                    return Ok(names);
                }
                Ok(None) => consecutive_failures = 0,
                Err(PoolError::ClusterQuery(e)) => {
                    consecutive_failures += 1;
                    if consecutive_failures >= self.config.max_query_failures {
                        warn!(error = %e, consecutive_failures, "Giving up on cluster queries");
                        return Err(PoolError::ClusterQuery(e));
                    }
                    warn!(error = %e, consecutive_failures, "Cluster query failed, retrying");
                }
                Err(e) => return Err(e),
            }

            if deadline.is_expired() {
                return Err(PoolError::Timeout {
                    requested: request.count,
                    spared: request.spared.len(),
                    elapsed: deadline.elapsed(),
                });
            }

            self.pause(deadline.clamp(self.config.poll_interval), &mut shutdown)
                .await?;
        }
    }

    /// One snapshot-select-lease pass under the allocation lock.
    async fn attempt(
        &self,
        request: &AllocationRequest,
        requested: &mut BTreeSet<String>,
    ) -> Result<Option<Vec<String>>, PoolError> {
        let _guard = self.lock.lock().await;

        // Capacity may have grown since the last pass.
        let capacity = self.capacity.load(Ordering::SeqCst);
        let snapshot = self.view.snapshot(capacity).await?;

        let leased = self.leases.held_names();
        let in_flight = self.reclaimer.in_flight();
        let exclusions = Exclusions {
            leased: &leased,
            in_flight: &in_flight,
            requested: &*requested,
        };

        match plan(&snapshot, request.count, &request.spared, &exclusions)? {
            Plan::Take(names) => {
                self.leases.grant(&names);
                Ok(Some(names))
            }
            Plan::Wait { pending, reclaim } => {
                if !reclaim.is_empty() {
                    info!(
                        reclaim = ?reclaim,
                        pending,
                        "Reclaiming slots to satisfy allocation"
                    );
                }
                for name in reclaim {
                    self.reclaimer.spawn(&name);
                    requested.insert(name);
                }
                debug!(pending, requested = requested.len(), "Waiting for slots to free up");
                Ok(None)
            }
        }
    }

    async fn pause(
        &self,
        wait: Duration,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), PoolError> {
        tokio::select! {
            _ = tokio::time::sleep(wait) => Ok(()),
            changed = shutdown.changed() => {
                if changed.is_err() {
                    // Sender gone; shutdown can no longer be signalled.
                    tokio::time::sleep(wait).await;
                    return Ok(());
                }
                if *shutdown.borrow() {
                    info!("Allocation cancelled by shutdown");
                    return Err(PoolError::Cancelled);
                }
                Ok(())
            }
        }
    }
}
