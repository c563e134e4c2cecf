//! Asynchronous slot destruction.
//!
//! Each reclaim runs on its own task; callers observe completion only
//! through later cluster snapshots.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cluster::ClusterApi;
use crate::error::PoolError;
use crate::store::ResourceStore;

/// Counters for reclaim activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReclaimStats {
    pub in_flight: usize,
    pub succeeded: u64,
    pub failed: u64,
}

struct Inner {
    cluster: Arc<dyn ClusterApi>,
    store: Arc<dyn ResourceStore>,
    in_flight: Mutex<BTreeSet<String>>,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Removes the name from the in-flight set when the reclaim ends, however
/// it ends.
struct InFlightGuard {
    inner: Arc<Inner>,
    name: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.lock().remove(&self.name);
    }
}

/// Issues deletes for slots, at most one per name at a time.
#[derive(Clone)]
pub struct Reclaimer {
    inner: Arc<Inner>,
}

impl Reclaimer {
    pub fn new(cluster: Arc<dyn ClusterApi>, store: Arc<dyn ResourceStore>) -> Self {
        Self {
            inner: Arc::new(Inner {
                cluster,
                store,
                in_flight: Mutex::new(BTreeSet::new()),
                succeeded: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
        }
    }

    /// Start deleting `name` in the background.
    ///
    /// Returns false when a reclaim for the name is already in flight.
    /// Failures are logged and leave the slot as it was.
    pub fn spawn(&self, name: &str) -> bool {
        let Some(guard) = self.begin(name) else {
            debug!(slot = %name, "Reclaim already in flight");
            return false;
        };

        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.run(&guard.name).await {
                warn!(slot = %guard.name, error = %e, "Reclaim failed");
            }
            drop(guard);
        });

        true
    }

    /// Delete `name` and wait for the call to return.
    ///
    /// Runs even if a background reclaim for the same name is in flight,
    /// since deletes are idempotent.
    pub async fn reclaim(&self, name: &str) -> Result<(), PoolError> {
        let _guard = self.begin(name);
        self.run(name).await
    }

    /// Whether a reclaim for `name` is in flight.
    pub fn is_in_flight(&self, name: &str) -> bool {
        self.inner.lock().contains(name)
    }

    /// Names with a reclaim in flight.
    pub fn in_flight(&self) -> BTreeSet<String> {
        self.inner.lock().clone()
    }

    pub fn stats(&self) -> ReclaimStats {
        ReclaimStats {
            in_flight: self.inner.lock().len(),
            succeeded: self.inner.succeeded.load(Ordering::SeqCst),
            failed: self.inner.failed.load(Ordering::SeqCst),
        }
    }

    fn begin(&self, name: &str) -> Option<InFlightGuard> {
        if !self.inner.lock().insert(name.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            inner: Arc::clone(&self.inner),
            name: name.to_string(),
        })
    }

    async fn run(&self, name: &str) -> Result<(), PoolError> {
        // Read before the delete: once it returns, the name can be
        // relaunched and recorded again.
        let recorded = match self.inner.store.get(name).await {
            Ok(record) => record.map(|r| r.external_id),
            Err(e) => {
                warn!(slot = %name, error = %e, "Failed to read resource record");
                None
            }
        };

        if let Err(cause) = self.inner.cluster.delete(name).await {
            self.inner.failed.fetch_add(1, Ordering::SeqCst);
            return Err(PoolError::ReclaimFailed {
                slot_name: name.to_string(),
                cause,
            });
        }

        self.inner.succeeded.fetch_add(1, Ordering::SeqCst);
        info!(slot = %name, "Slot reclaimed");

        let Some(external_id) = recorded else {
            return Ok(());
        };
        match self.inner.store.remove_if(name, &external_id).await {
            Ok(true) => debug!(slot = %name, "Removed resource record"),
            Ok(false) => debug!(slot = %name, "Record replaced by a newer launch, kept"),
            Err(e) => warn!(slot = %name, error = %e, "Failed to remove resource record"),
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cluster::{MockCluster, ResourcePhase};
    use crate::store::{MemoryResourceStore, ResourceRecord};

    fn reclaimer(cluster: &Arc<MockCluster>, store: &Arc<MemoryResourceStore>) -> Reclaimer {
        Reclaimer::new(cluster.clone(), store.clone())
    }

    async fn wait_idle(reclaimer: &Reclaimer) {
        for _ in 0..200 {
            if reclaimer.in_flight().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("reclaims still in flight: {:?}", reclaimer.in_flight());
    }

    #[tokio::test]
    async fn test_reclaim_deletes_and_drops_record() {
        let cluster = Arc::new(MockCluster::new());
        let store = Arc::new(MemoryResourceStore::new());
        cluster.insert("slot-1", ResourcePhase::Active);
        store
            .store(&ResourceRecord::ready("slot-1", "res_a", 1))
            .await
            .unwrap();

        let reclaimer = reclaimer(&cluster, &store);
        reclaimer.reclaim("slot-1").await.unwrap();

        assert_eq!(cluster.phase("slot-1"), None);
        assert!(store.get("slot-1").await.unwrap().is_none());
        assert_eq!(reclaimer.stats().succeeded, 1);
        assert!(!reclaimer.is_in_flight("slot-1"));
    }

    #[tokio::test]
    async fn test_reclaim_keeps_record_of_newer_resource() {
        let cluster = Arc::new(MockCluster::new().with_latency(Duration::from_millis(50)));
        let store = Arc::new(MemoryResourceStore::new());
        cluster.insert("slot-1", ResourcePhase::Active);
        store
            .store(&ResourceRecord::ready("slot-1", "res_a", 1))
            .await
            .unwrap();

        let reclaimer = reclaimer(&cluster, &store);
        assert!(reclaimer.spawn("slot-1"));

        // A relaunch records the slot again while the delete is in flight.
        tokio::time::sleep(Duration::from_millis(10)).await;
        store
            .store(&ResourceRecord::ready("slot-1", "res_b", 1))
            .await
            .unwrap();
        wait_idle(&reclaimer).await;

        let record = store.get("slot-1").await.unwrap().unwrap();
        assert_eq!(record.external_id, "res_b");
        assert_eq!(reclaimer.stats().succeeded, 1);
    }

    #[tokio::test]
    async fn test_reclaim_failure_is_reported() {
        let cluster = Arc::new(MockCluster::new());
        let store = Arc::new(MemoryResourceStore::new());
        cluster.insert("slot-1", ResourcePhase::Active);
        cluster.set_fail_deletes(true);

        let reclaimer = reclaimer(&cluster, &store);
        let err = reclaimer.reclaim("slot-1").await.unwrap_err();

        assert!(matches!(err, PoolError::ReclaimFailed { ref slot_name, .. } if slot_name == "slot-1"));
        assert_eq!(cluster.phase("slot-1"), Some(ResourcePhase::Active));
        assert_eq!(reclaimer.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_spawn_deduplicates_in_flight() {
        let cluster = Arc::new(MockCluster::new().with_latency(Duration::from_millis(50)));
        let store = Arc::new(MemoryResourceStore::new());
        cluster.insert("slot-1", ResourcePhase::Active);

        let reclaimer = reclaimer(&cluster, &store);
        assert!(reclaimer.spawn("slot-1"));
        assert!(!reclaimer.spawn("slot-1"));
        assert!(reclaimer.is_in_flight("slot-1"));

        wait_idle(&reclaimer).await;
        assert_eq!(cluster.delete_calls(), 1);
        assert_eq!(cluster.phase("slot-1"), None);
        assert!(reclaimer.spawn("slot-1"));
        wait_idle(&reclaimer).await;
    }

    #[tokio::test]
    async fn test_spawned_failure_clears_in_flight() {
        let cluster = Arc::new(MockCluster::new());
        let store = Arc::new(MemoryResourceStore::new());
        cluster.insert("slot-2", ResourcePhase::Active);
        cluster.set_fail_deletes(true);

        let reclaimer = reclaimer(&cluster, &store);
        assert!(reclaimer.spawn("slot-2"));
        wait_idle(&reclaimer).await;

        assert_eq!(reclaimer.stats().failed, 1);
        assert_eq!(cluster.phase("slot-2"), Some(ResourcePhase::Active));
    }
}
