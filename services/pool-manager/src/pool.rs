//! The pool handle.
//!
//! A [`Pool`] owns everything one bounded pool needs: its capacity and
//! naming, the cluster view, leases, the reclaimer, the allocator and the
//! launcher. Independent pools are independent values.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use poolkeeper_id::SlotNamer;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::allocator::{AllocationRequest, PoolAllocator};
use crate::cluster::{ClusterApi, ClusterView, Snapshot};
use crate::config::Config;
use crate::error::PoolError;
use crate::launcher::{ProvisionLauncher, ProvisionedResource};
use crate::lease::LeaseTable;
use crate::reclaim::Reclaimer;
use crate::store::ResourceStore;

/// Point-in-time occupancy of the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub capacity: u32,
    pub free: usize,
    pub active: usize,
    pub terminating: usize,
    /// Pool-pattern resources beyond the current capacity.
    pub out_of_range: usize,
    pub leased: usize,
    pub reclaiming: usize,
}

/// A bounded pool of externally provisioned resources.
pub struct Pool {
    namer: SlotNamer,
    capacity: Arc<AtomicU32>,
    view: ClusterView,
    store: Arc<dyn ResourceStore>,
    leases: Arc<LeaseTable>,
    reclaimer: Reclaimer,
    allocator: PoolAllocator,
    launcher: ProvisionLauncher,
}

impl Pool {
    /// Build a pool over the given cluster and store.
    pub fn new(
        config: &Config,
        cluster: Arc<dyn ClusterApi>,
        store: Arc<dyn ResourceStore>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, PoolError> {
        let namer = SlotNamer::new(config.slot_prefix.as_str())?;
        let capacity = Arc::new(AtomicU32::new(config.capacity));
        let view = ClusterView::new(Arc::clone(&cluster), namer.clone());
        let leases = Arc::new(LeaseTable::new(config.lease_ttl));
        let reclaimer = Reclaimer::new(Arc::clone(&cluster), Arc::clone(&store));

        let allocator = PoolAllocator::new(
            view.clone(),
            Arc::clone(&capacity),
            Arc::clone(&leases),
            reclaimer.clone(),
            config.allocator.clone(),
            shutdown,
        );
        let launcher = ProvisionLauncher::new(
            cluster,
            Arc::clone(&store),
            Arc::clone(&leases),
            namer.clone(),
            config.launch.clone(),
        );

        info!(
            capacity = config.capacity,
            prefix = %namer.prefix(),
            "Pool initialized"
        );

        Ok(Self {
            namer,
            capacity,
            view,
            store,
            leases,
            reclaimer,
            allocator,
            launcher,
        })
    }

    pub fn namer(&self) -> &SlotNamer {
        &self.namer
    }

    /// Current capacity.
    pub fn capacity(&self) -> u32 {
        self.capacity.load(Ordering::SeqCst)
    }

    /// Raise the capacity. Returns the previous value.
    pub fn grow_capacity(&self, capacity: u32) -> Result<u32, PoolError> {
        let previous = self
            .capacity
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (capacity >= current).then_some(capacity)
            })
            .map_err(|current| PoolError::CapacityShrink {
                current,
                requested: capacity,
            })?;

        if previous != capacity {
            info!(from = previous, to = capacity, "Pool capacity raised");
        }
        Ok(previous)
    }

    /// Allocate `count` slot names, sparing the given names.
    pub async fn allocate(
        &self,
        count: usize,
        spared: &BTreeSet<String>,
    ) -> Result<Vec<String>, PoolError> {
        let request = AllocationRequest {
            count,
            spared: spared.clone(),
            timeout: None,
        };
        self.allocator.allocate(&request).await
    }

    /// Allocate with per-request options.
    pub async fn allocate_request(
        &self,
        request: &AllocationRequest,
    ) -> Result<Vec<String>, PoolError> {
        self.allocator.allocate(request).await
    }

    /// Provision an allocated slot.
    pub async fn launch(&self, slot_name: &str) -> Result<ProvisionedResource, PoolError> {
        if self.namer.index_in(slot_name, self.capacity()).is_none() {
            return Err(PoolError::InvalidSlotName(slot_name.to_string()));
        }
        self.launcher.launch(slot_name).await
    }

    /// Give slots back to the pool. Deletion happens in the background.
    ///
    /// Every name is validated before any is touched. Returns how many
    /// reclaims were started.
    #[instrument(skip(self, names), fields(count = names.len()))]
    pub async fn relinquish(&self, names: &[String]) -> Result<usize, PoolError> {
        if let Some(bad) = names.iter().find(|name| !self.namer.is_pool_name(name)) {
            return Err(PoolError::InvalidSlotName(bad.clone()));
        }

        let mut started = 0;
        for name in names {
            self.leases.release(name);
            if !self.store.mark_deleting(name).await? {
                warn!(slot = %name, "Relinquished slot has no resource record");
            }
            if self.reclaimer.spawn(name) {
                started += 1;
            }
        }

        info!(started, "Slots relinquished");
        Ok(started)
    }

    /// Fresh snapshot at the current capacity.
    pub async fn snapshot(&self) -> Result<Snapshot, PoolError> {
        self.view.snapshot(self.capacity()).await
    }

    /// Occupancy summary from a fresh snapshot.
    pub async fn status(&self) -> Result<PoolStatus, PoolError> {
        let snapshot = self.snapshot().await?;
        Ok(PoolStatus {
            capacity: snapshot.capacity(),
            free: snapshot.free().len(),
            active: snapshot.active().len(),
            terminating: snapshot.terminating().len(),
            out_of_range: snapshot.out_of_range().len(),
            leased: self.leases.len(),
            reclaiming: self.reclaimer.in_flight().len(),
        })
    }

    pub fn leases(&self) -> &LeaseTable {
        &self.leases
    }

    pub fn reclaimer(&self) -> &Reclaimer {
        &self.reclaimer
    }

    pub fn store(&self) -> &dyn ResourceStore {
        self.store.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cluster::{MockCluster, ResourcePhase};
    use crate::store::MemoryResourceStore;

    fn pool(capacity: u32) -> (Pool, Arc<MockCluster>, watch::Sender<bool>) {
        let cluster = Arc::new(MockCluster::new());
        let (tx, rx) = watch::channel(false);
        let config = Config {
            capacity,
            lease_ttl: Duration::from_secs(60),
            ..Config::default()
        };
        let pool = Pool::new(
            &config,
            cluster.clone(),
            Arc::new(MemoryResourceStore::new()),
            rx,
        )
        .unwrap();
        (pool, cluster, tx)
    }

    #[test]
    fn test_capacity_only_grows() {
        let (pool, _cluster, _tx) = pool(2);
        assert_eq!(pool.grow_capacity(4).unwrap(), 2);
        assert_eq!(pool.grow_capacity(4).unwrap(), 4);
        assert_eq!(pool.capacity(), 4);

        let err = pool.grow_capacity(3).unwrap_err();
        assert!(matches!(
            err,
            PoolError::CapacityShrink {
                current: 4,
                requested: 3
            }
        ));
        assert_eq!(pool.capacity(), 4);
    }

    #[test]
    fn test_bad_prefix_rejected() {
        let (_tx, rx) = watch::channel(false);
        let config = Config {
            slot_prefix: "Bad_Prefix".to_string(),
            ..Config::default()
        };
        let result = Pool::new(
            &config,
            Arc::new(MockCluster::new()),
            Arc::new(MemoryResourceStore::new()),
            rx,
        );
        assert!(matches!(result, Err(PoolError::Naming(_))));
    }

    #[tokio::test]
    async fn test_launch_rejects_out_of_range() {
        let (pool, cluster, _tx) = pool(2);
        let err = pool.launch("slot-3").await.unwrap_err();
        assert!(matches!(err, PoolError::InvalidSlotName(_)));
        assert_eq!(cluster.create_calls(), 0);
    }

    #[tokio::test]
    async fn test_relinquish_validates_before_acting() {
        let (pool, cluster, _tx) = pool(2);
        cluster.insert("slot-1", ResourcePhase::Active);

        let err = pool
            .relinquish(&["slot-1".to_string(), "db-1".to_string()])
            .await
            .unwrap_err();

        assert!(matches!(err, PoolError::InvalidSlotName(ref n) if n == "db-1"));
        assert_eq!(cluster.delete_calls(), 0);
    }

    #[tokio::test]
    async fn test_status_counts() {
        let (pool, cluster, _tx) = pool(3);
        cluster.insert("slot-1", ResourcePhase::Active);
        cluster.insert("slot-7", ResourcePhase::Active);

        let names = pool.allocate(1, &BTreeSet::new()).await.unwrap();
        assert_eq!(names, vec!["slot-2"]);

        let status = pool.status().await.unwrap();
        assert_eq!(
            status,
            PoolStatus {
                capacity: 3,
                free: 2,
                active: 1,
                terminating: 0,
                out_of_range: 1,
                leased: 1,
                reclaiming: 0,
            }
        );
    }
}
