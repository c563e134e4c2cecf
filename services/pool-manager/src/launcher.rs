//! Provisioning of allocated slots.
//!
//! A launch creates the external resource under the slot name, waits for
//! it to become ready and records it. Failed attempts are rolled back
//! before the next one so a retry never races a half-created resource.

use std::sync::Arc;

use poolkeeper_id::SlotNamer;
use poolkeeper_retry::Backoff;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::cluster::{ClusterApi, ClusterError};
use crate::error::PoolError;
use crate::lease::LeaseTable;
use crate::store::{ResourceRecord, ResourceStore};

/// Launch retry configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchConfig {
    /// Attempts before giving up (at least 1).
    pub max_attempts: u32,

    /// Delay between attempts.
    pub backoff: Backoff,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::default(),
        }
    }
}

/// Launch lifecycle.
///
/// `Pending -> Creating -> Ready`, `Creating -> RollingBack -> Pending`,
/// `Creating -> Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchState {
    Pending,
    Creating,
    RollingBack,
    Ready,
    Failed,
}

/// A slot being (or having been) provisioned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisionedResource {
    pub slot_name: String,

    /// Set once the cluster acknowledges creation; cleared on rollback.
    pub external_id: Option<String>,

    /// Current attempt, starting at 1.
    pub attempt: u32,

    pub state: LaunchState,
}

impl ProvisionedResource {
    fn new(slot_name: &str) -> Self {
        Self {
            slot_name: slot_name.to_string(),
            external_id: None,
            attempt: 1,
            state: LaunchState::Pending,
        }
    }

    fn transition(&mut self, to: LaunchState) {
        debug!(
            slot = %self.slot_name,
            attempt = self.attempt,
            from = ?self.state,
            to = ?to,
            "Launch state transition"
        );
        self.state = to;
    }
}

/// Drives resource creation with bounded retries and rollback.
pub struct ProvisionLauncher {
    cluster: Arc<dyn ClusterApi>,
    store: Arc<dyn ResourceStore>,
    leases: Arc<LeaseTable>,
    namer: SlotNamer,
    config: LaunchConfig,
}

impl ProvisionLauncher {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        store: Arc<dyn ResourceStore>,
        leases: Arc<LeaseTable>,
        namer: SlotNamer,
        config: LaunchConfig,
    ) -> Self {
        Self {
            cluster,
            store,
            leases,
            namer,
            config,
        }
    }

    pub fn config(&self) -> &LaunchConfig {
        &self.config
    }

    /// Provision the resource for `slot_name`.
    ///
    /// On success the record is stored once and the slot's lease released.
    /// On failure the lease is kept; the caller relinquishes the slot.
    #[instrument(skip(self, slot_name), fields(slot = %slot_name))]
    pub async fn launch(&self, slot_name: &str) -> Result<ProvisionedResource, PoolError> {
        if !self.namer.is_pool_name(slot_name) {
            return Err(PoolError::InvalidSlotName(slot_name.to_string()));
        }

        let max_attempts = self.config.max_attempts.max(1);
        let mut resource = ProvisionedResource::new(slot_name);

        loop {
            resource.transition(LaunchState::Creating);

            let cause = match self.try_create(&mut resource).await {
                Ok(()) => break,
                Err(cause) => cause,
            };

            if resource.attempt >= max_attempts {
                return Err(self.fail(&mut resource, cause).await);
            }

            warn!(
                attempt = resource.attempt,
                max_attempts,
                error = %cause,
                "Provisioning attempt failed"
            );

            self.roll_back(&mut resource).await;

            let delay = self.config.backoff.delay(resource.attempt);
            debug!(delay_ms = delay.as_millis() as u64, "Backing off before retry");
            tokio::time::sleep(delay).await;
            resource.attempt += 1;
        }

        self.finish(&mut resource).await?;
        Ok(resource)
    }

    async fn try_create(&self, resource: &mut ProvisionedResource) -> Result<(), ClusterError> {
        let handle = self.cluster.create(&resource.slot_name).await?;
        resource.external_id = Some(handle.external_id.clone());
        self.cluster.await_ready(&handle).await
    }

    /// Undo a failed attempt. Only acknowledged resources are deleted here.
    async fn roll_back(&self, resource: &mut ProvisionedResource) {
        resource.transition(LaunchState::RollingBack);

        if let Some(external_id) = resource.external_id.take() {
            match self.cluster.delete(&resource.slot_name).await {
                Ok(()) => debug!(external_id = %external_id, "Rolled back partial resource"),
                Err(e) => warn!(
                    external_id = %external_id,
                    error = %e,
                    "Rollback failed, retrying anyway"
                ),
            }
        }

        resource.transition(LaunchState::Pending);
    }

    /// Final cleanup after the last attempt. Deletes by name whether or not
    /// creation was acknowledged.
    async fn fail(&self, resource: &mut ProvisionedResource, cause: ClusterError) -> PoolError {
        resource.transition(LaunchState::Failed);
        resource.external_id = None;

        let cleanup_warning = self.cluster.delete(&resource.slot_name).await.err();
        if let Some(ref e) = cleanup_warning {
            warn!(error = %e, "Cleanup after failed provisioning also failed");
        }

        error!(
            attempts = resource.attempt,
            error = %cause,
            "Provisioning failed"
        );

        PoolError::ProvisionFailed {
            slot_name: resource.slot_name.clone(),
            attempts: resource.attempt,
            cause,
            cleanup_warning,
        }
    }

    async fn finish(&self, resource: &mut ProvisionedResource) -> Result<(), PoolError> {
        let external_id = resource.external_id.clone().unwrap_or_default();
        let record = ResourceRecord::ready(&resource.slot_name, &external_id, resource.attempt);

        if let Err(e) = self.store.store(&record).await {
            error!(error = %e, "Failed to record provisioned resource, rolling back");
            if let Err(cleanup) = self.cluster.delete(&resource.slot_name).await {
                warn!(error = %cleanup, "Rollback after store failure failed");
            }
            resource.external_id = None;
            resource.transition(LaunchState::Failed);
            return Err(PoolError::Store(e));
        }

        resource.transition(LaunchState::Ready);
        self.leases.release(&resource.slot_name);

        info!(
            external_id = %external_id,
            attempts = resource.attempt,
            "Slot provisioned"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::cluster::{MockCluster, ResourcePhase};
    use crate::store::{MemoryResourceStore, StoreError};

    struct Fixture {
        cluster: Arc<MockCluster>,
        store: Arc<MemoryResourceStore>,
        leases: Arc<LeaseTable>,
        launcher: ProvisionLauncher,
    }

    fn fixture(max_attempts: u32) -> Fixture {
        let cluster = Arc::new(MockCluster::new());
        let store = Arc::new(MemoryResourceStore::new());
        let leases = Arc::new(LeaseTable::new(Duration::from_secs(60)));
        let launcher = ProvisionLauncher::new(
            cluster.clone(),
            store.clone(),
            leases.clone(),
            SlotNamer::default(),
            LaunchConfig {
                max_attempts,
                backoff: Backoff::none(),
            },
        );
        Fixture {
            cluster,
            store,
            leases,
            launcher,
        }
    }

    #[tokio::test]
    async fn test_launch_first_try() {
        let f = fixture(3);
        f.leases.grant(&["slot-1".to_string()]);

        let resource = f.launcher.launch("slot-1").await.unwrap();

        assert_eq!(resource.state, LaunchState::Ready);
        assert_eq!(resource.attempt, 1);
        assert_eq!(resource.external_id, f.cluster.external_id("slot-1"));
        assert_eq!(f.store.store_calls(), 1);
        assert!(!f.leases.is_held("slot-1"));
    }

    #[tokio::test]
    async fn test_readiness_failures_are_rolled_back() {
        let f = fixture(4);
        f.cluster.fail_next_readiness(3);

        let resource = f.launcher.launch("slot-2").await.unwrap();

        assert_eq!(resource.attempt, 4);
        assert_eq!(f.cluster.create_calls(), 4);
        assert_eq!(f.cluster.delete_calls(), 3);
        assert_eq!(f.store.store_calls(), 1);
        assert_eq!(f.cluster.phase("slot-2"), Some(ResourcePhase::Active));
    }

    #[tokio::test]
    async fn test_unacknowledged_failures_skip_rollback() {
        let f = fixture(3);
        f.cluster.fail_next_creates(1);

        let resource = f.launcher.launch("slot-1").await.unwrap();

        assert_eq!(resource.attempt, 2);
        assert_eq!(f.cluster.delete_calls(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_fail_and_clean_up() {
        let f = fixture(3);
        f.cluster.fail_next_creates(u32::MAX);
        f.leases.grant(&["slot-1".to_string()]);

        let err = f.launcher.launch("slot-1").await.unwrap_err();

        match err {
            PoolError::ProvisionFailed {
                slot_name,
                attempts,
                cause,
                cleanup_warning,
            } => {
                assert_eq!(slot_name, "slot-1");
                assert_eq!(attempts, 3);
                assert!(matches!(cause, ClusterError::Unavailable(_)));
                assert!(cleanup_warning.is_none());
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(f.cluster.create_calls(), 3);
        assert_eq!(f.cluster.delete_calls(), 1);
        assert_eq!(f.cluster.resource_count(), 0);
        assert_eq!(f.store.store_calls(), 0);
        assert!(f.leases.is_held("slot-1"));
    }

    #[tokio::test]
    async fn test_cleanup_failure_is_kept_apart() {
        let f = fixture(1);
        f.cluster.fail_next_readiness(1);
        f.cluster.set_fail_deletes(true);

        let err = f.launcher.launch("slot-1").await.unwrap_err();

        match err {
            PoolError::ProvisionFailed {
                cause,
                cleanup_warning,
                ..
            } => {
                assert!(matches!(cause, ClusterError::NotReady { .. }));
                assert!(matches!(cleanup_warning, Some(ClusterError::Unavailable(_))));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rejects_foreign_names() {
        let f = fixture(3);
        let err = f.launcher.launch("worker-1").await.unwrap_err();
        assert!(matches!(err, PoolError::InvalidSlotName(ref n) if n == "worker-1"));
        assert_eq!(f.cluster.create_calls(), 0);
    }

    struct FailingStore;

    #[async_trait]
    impl ResourceStore for FailingStore {
        async fn store(&self, _record: &ResourceRecord) -> Result<(), StoreError> {
            Err(StoreError::Invalid("disk full".to_string()))
        }
        async fn get(&self, _slot_name: &str) -> Result<Option<ResourceRecord>, StoreError> {
            Ok(None)
        }
        async fn list(&self) -> Result<Vec<ResourceRecord>, StoreError> {
            Ok(Vec::new())
        }
        async fn mark_deleting(&self, _slot_name: &str) -> Result<bool, StoreError> {
            Ok(false)
        }
        async fn remove_if(&self, _slot_name: &str, _external_id: &str) -> Result<bool, StoreError> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_store_failure_rolls_back_resource() {
        let cluster = Arc::new(MockCluster::new());
        let launcher = ProvisionLauncher::new(
            cluster.clone(),
            Arc::new(FailingStore),
            Arc::new(LeaseTable::new(Duration::from_secs(60))),
            SlotNamer::default(),
            LaunchConfig {
                max_attempts: 2,
                backoff: Backoff::none(),
            },
        );

        let err = launcher.launch("slot-1").await.unwrap_err();

        assert!(matches!(err, PoolError::Store(_)));
        assert_eq!(cluster.create_calls(), 1);
        assert_eq!(cluster.resource_count(), 0);
    }
}
