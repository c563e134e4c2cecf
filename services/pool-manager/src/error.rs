//! Pool error taxonomy.

use std::time::Duration;

use poolkeeper_id::NameError;
use thiserror::Error;

use crate::cluster::ClusterError;
use crate::store::StoreError;

/// Errors surfaced by pool operations.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Listing the cluster failed; retried by the polling layer until its
    /// budget runs out.
    #[error("cluster query failed: {0}")]
    ClusterQuery(#[source] ClusterError),

    /// The request cannot be satisfied even after reclaiming every slot
    /// that is not spared.
    #[error(
        "pool exhausted: requested {requested} slot(s) from capacity {capacity} \
         ({free} free, {terminating} terminating, {reclaimable} reclaimable, {spared} spared)"
    )]
    PoolExhausted {
        requested: usize,
        capacity: u32,
        free: usize,
        terminating: usize,
        reclaimable: usize,
        spared: usize,
    },

    /// Waiting for reclaimed slots took longer than allowed.
    #[error("timed out after {elapsed:?} waiting for {requested} free slot(s) ({spared} spared)")]
    Timeout {
        requested: usize,
        spared: usize,
        elapsed: Duration,
    },

    /// Shutdown was signalled while waiting.
    #[error("allocation cancelled by shutdown")]
    Cancelled,

    /// Every provisioning attempt for the slot failed.
    #[error("provisioning {slot_name} failed after {attempts} attempt(s): {cause}")]
    ProvisionFailed {
        slot_name: String,
        attempts: u32,
        #[source]
        cause: ClusterError,
        /// Failure of the final cleanup, kept apart from `cause`.
        cleanup_warning: Option<ClusterError>,
    },

    /// Deleting a slot's external resource failed.
    #[error("reclaiming {slot_name} failed: {cause}")]
    ReclaimFailed {
        slot_name: String,
        #[source]
        cause: ClusterError,
    },

    /// The name is not a slot of this pool.
    #[error("not a slot of this pool: {0}")]
    InvalidSlotName(String),

    /// Capacity may only grow at runtime.
    #[error("capacity can only grow: current {current}, requested {requested}")]
    CapacityShrink { current: u32, requested: u32 },

    /// The slot prefix is unusable.
    #[error(transparent)]
    Naming(#[from] NameError),

    /// The state store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PoolError {
    /// Errors an operator is expected to see and act upon.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            PoolError::PoolExhausted { .. } | PoolError::ProvisionFailed { .. }
        )
    }

    /// Errors worth retrying later without changing the request.
    pub fn is_retryable(&self) -> bool {
        match self {
            PoolError::ClusterQuery(e) => e.is_transient(),
            PoolError::Timeout { .. } => true,
            _ => false,
        }
    }
}
