//! Simulated cluster for testing and development.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use poolkeeper_id::ResourceId;
use tracing::{debug, info};

use super::{ClusterApi, ClusterError, ListedResource, ResourceHandle, ResourcePhase};

/// How long a deleted resource stays visible as terminating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Gone as soon as `delete` returns.
    Immediate,
    /// Listed as terminating by this many `list` calls, then gone.
    AfterLists(u32),
    /// Stays terminating forever.
    Never,
}

#[derive(Debug)]
struct MockResource {
    external_id: ResourceId,
    phase: ResourcePhase,
    lists_left: Option<u32>,
}

/// In-memory cluster with failure injection and call counters.
pub struct MockCluster {
    resources: Mutex<BTreeMap<String, MockResource>>,
    termination: Termination,
    latency: Duration,

    fail_creates: AtomicU32,
    fail_readiness: AtomicU32,
    fail_lists: AtomicU32,
    fail_deletes: AtomicBool,

    create_calls: AtomicU64,
    delete_calls: AtomicU64,
    list_calls: AtomicU64,
}

impl MockCluster {
    /// Create an empty cluster where deletes complete immediately.
    pub fn new() -> Self {
        Self {
            resources: Mutex::new(BTreeMap::new()),
            termination: Termination::Immediate,
            latency: Duration::ZERO,
            fail_creates: AtomicU32::new(0),
            fail_readiness: AtomicU32::new(0),
            fail_lists: AtomicU32::new(0),
            fail_deletes: AtomicBool::new(false),
            create_calls: AtomicU64::new(0),
            delete_calls: AtomicU64::new(0),
            list_calls: AtomicU64::new(0),
        }
    }

    /// Set how deletions progress.
    pub fn with_termination(mut self, termination: Termination) -> Self {
        self.termination = termination;
        self
    }

    /// Delay every call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Seed a resource as if someone else had created it.
    pub fn insert(&self, name: &str, phase: ResourcePhase) {
        let lists_left = match (phase, self.termination) {
            (ResourcePhase::Terminating, Termination::AfterLists(n)) => Some(n.max(1)),
            (ResourcePhase::Terminating, Termination::Immediate) => Some(1),
            _ => None,
        };
        self.lock().insert(
            name.to_string(),
            MockResource {
                external_id: ResourceId::new(),
                phase,
                lists_left,
            },
        );
    }

    /// Fail the next `n` create calls before anything is created.
    pub fn fail_next_creates(&self, n: u32) {
        self.fail_creates.store(n, Ordering::SeqCst);
    }

    /// Acknowledge the next `n` creates but fail their readiness check,
    /// leaving the resource behind.
    pub fn fail_next_readiness(&self, n: u32) {
        self.fail_readiness.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` list calls.
    pub fn fail_next_lists(&self, n: u32) {
        self.fail_lists.store(n, Ordering::SeqCst);
    }

    /// Make every delete call fail (or succeed again).
    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Number of create calls so far.
    pub fn create_calls(&self) -> u64 {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Number of delete calls so far.
    pub fn delete_calls(&self) -> u64 {
        self.delete_calls.load(Ordering::SeqCst)
    }

    /// Number of list calls so far.
    pub fn list_calls(&self) -> u64 {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Number of resources currently present, terminating included.
    pub fn resource_count(&self) -> usize {
        self.lock().len()
    }

    /// Current phase of a resource; `None` when absent.
    pub fn phase(&self, name: &str) -> Option<ResourcePhase> {
        self.lock().get(name).map(|r| r.phase)
    }

    /// External id of a resource; `None` when absent.
    pub fn external_id(&self, name: &str) -> Option<String> {
        self.lock().get(name).map(|r| r.external_id.to_string())
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, MockResource>> {
        self.resources
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

impl Default for MockCluster {
    fn default() -> Self {
        Self::new()
    }
}

/// Consume one unit of an injected failure budget.
fn take_failure(budget: &AtomicU32) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl ClusterApi for MockCluster {
    async fn create(&self, name: &str) -> Result<ResourceHandle, ClusterError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        if take_failure(&self.fail_creates) {
            debug!(name, "[MOCK] Injected create failure");
            return Err(ClusterError::Unavailable(format!(
                "injected create failure for {name}"
            )));
        }

        let mut resources = self.lock();
        if let Some(existing) = resources.get(name) {
            return Err(ClusterError::Conflict(format!(
                "{name} already exists ({:?})",
                existing.phase
            )));
        }

        let external_id = ResourceId::new();
        resources.insert(
            name.to_string(),
            MockResource {
                external_id,
                phase: ResourcePhase::Active,
                lists_left: None,
            },
        );

        info!(name, external_id = %external_id, "[MOCK] Resource created");

        Ok(ResourceHandle {
            name: name.to_string(),
            external_id: external_id.to_string(),
        })
    }

    async fn await_ready(&self, handle: &ResourceHandle) -> Result<(), ClusterError> {
        if take_failure(&self.fail_readiness) {
            debug!(name = %handle.name, "[MOCK] Injected readiness failure");
            return Err(ClusterError::NotReady {
                name: handle.name.clone(),
                reason: "injected readiness failure".to_string(),
            });
        }
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), ClusterError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        if self.fail_deletes.load(Ordering::SeqCst) {
            debug!(name, "[MOCK] Injected delete failure");
            return Err(ClusterError::Unavailable(format!(
                "injected delete failure for {name}"
            )));
        }

        let mut resources = self.lock();
        let Some(resource) = resources.get_mut(name) else {
            return Ok(());
        };

        if resource.phase == ResourcePhase::Terminating {
            return Ok(());
        }

        match self.termination {
            Termination::Immediate | Termination::AfterLists(0) => {
                resources.remove(name);
            }
            Termination::AfterLists(n) => {
                resource.phase = ResourcePhase::Terminating;
                resource.lists_left = Some(n);
            }
            Termination::Never => {
                resource.phase = ResourcePhase::Terminating;
                resource.lists_left = None;
            }
        }

        info!(name, "[MOCK] Resource deletion started");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ListedResource>, ClusterError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        if take_failure(&self.fail_lists) {
            return Err(ClusterError::Unavailable("injected list failure".to_string()));
        }

        let mut resources = self.lock();
        let listing: Vec<ListedResource> = resources
            .iter()
            .map(|(name, r)| ListedResource::new(name.clone(), r.phase))
            .collect();

        // Each listing moves pending deletions one step forward.
        resources.retain(|_, r| match r.lists_left.as_mut() {
            Some(left) => {
                *left = left.saturating_sub(1);
                *left > 0
            }
            None => true,
        });

        Ok(listing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_list() {
        let cluster = MockCluster::new();
        let handle = cluster.create("slot-1").await.unwrap();
        assert!(handle.external_id.starts_with("res_"));

        let listing = cluster.list().await.unwrap();
        assert_eq!(listing, vec![ListedResource::new("slot-1", ResourcePhase::Active)]);
    }

    #[tokio::test]
    async fn test_create_conflict() {
        let cluster = MockCluster::new();
        cluster.create("slot-1").await.unwrap();
        let err = cluster.create("slot-1").await.unwrap_err();
        assert!(matches!(err, ClusterError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let cluster = MockCluster::new();
        cluster.delete("slot-9").await.unwrap();
        cluster.create("slot-1").await.unwrap();
        cluster.delete("slot-1").await.unwrap();
        cluster.delete("slot-1").await.unwrap();
        assert_eq!(cluster.resource_count(), 0);
        assert_eq!(cluster.delete_calls(), 3);
    }

    #[tokio::test]
    async fn test_termination_after_lists() {
        let cluster = MockCluster::new().with_termination(Termination::AfterLists(1));
        cluster.create("slot-1").await.unwrap();
        cluster.delete("slot-1").await.unwrap();

        let first = cluster.list().await.unwrap();
        assert_eq!(first[0].phase, ResourcePhase::Terminating);

        let second = cluster.list().await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_termination_never() {
        let cluster = MockCluster::new().with_termination(Termination::Never);
        cluster.insert("slot-1", ResourcePhase::Active);
        cluster.delete("slot-1").await.unwrap();
        for _ in 0..5 {
            cluster.list().await.unwrap();
        }
        assert_eq!(cluster.phase("slot-1"), Some(ResourcePhase::Terminating));
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let cluster = MockCluster::new();
        cluster.fail_next_creates(1);
        assert!(cluster.create("slot-1").await.is_err());
        assert!(cluster.create("slot-1").await.is_ok());

        cluster.fail_next_lists(2);
        assert!(cluster.list().await.is_err());
        assert!(cluster.list().await.is_err());
        assert!(cluster.list().await.is_ok());
        assert_eq!(cluster.list_calls(), 3);
    }

    #[tokio::test]
    async fn test_readiness_failure_leaves_resource() {
        let cluster = MockCluster::new();
        cluster.fail_next_readiness(1);
        let handle = cluster.create("slot-1").await.unwrap();
        assert!(cluster.await_ready(&handle).await.is_err());
        assert_eq!(cluster.resource_count(), 1);
        assert!(cluster.await_ready(&handle).await.is_ok());
    }

    #[tokio::test]
    async fn test_failing_deletes() {
        let cluster = MockCluster::new();
        cluster.insert("slot-1", ResourcePhase::Active);
        cluster.set_fail_deletes(true);
        assert!(cluster.delete("slot-1").await.is_err());
        assert_eq!(cluster.phase("slot-1"), Some(ResourcePhase::Active));
    }
}
