//! Cluster API interface and the pool's view of it.
//!
//! The cluster API abstracts the external system that owns resource state:
//! - Creating a resource under a pool-assigned name
//! - Deleting a resource by name (idempotent)
//! - Listing resources with their lifecycle phase
//!
//! A simulated implementation is provided for testing and development.

mod mock;
mod view;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use mock::{MockCluster, Termination};
pub use view::{ClusterView, SlotPhase, Snapshot};

/// Errors reported by the cluster API.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClusterError {
    /// A resource with that name already exists.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Quota or capacity limits refused the request.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// The API could not be reached or timed out.
    #[error("cluster unavailable: {0}")]
    Unavailable(String),

    /// The resource was created but never became ready.
    #[error("{name} not ready: {reason}")]
    NotReady { name: String, reason: String },

    /// Anything else.
    #[error("cluster error: {0}")]
    Internal(String),
}

impl ClusterError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClusterError::Unavailable(_) | ClusterError::NotReady { .. }
        )
    }
}

/// Lifecycle phase reported by the cluster listing.
///
/// Absence from the listing means the name is free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourcePhase {
    /// The resource exists and is usable.
    Active,
    /// Deletion was requested and has not completed.
    Terminating,
}

/// One entry of a cluster listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListedResource {
    pub name: String,
    pub phase: ResourcePhase,
}

impl ListedResource {
    pub fn new(name: impl Into<String>, phase: ResourcePhase) -> Self {
        Self {
            name: name.into(),
            phase,
        }
    }
}

/// Acknowledgement of a create call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceHandle {
    /// Pool-assigned name.
    pub name: String,

    /// Identifier assigned by the external system.
    pub external_id: String,
}

/// Cluster API interface.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Create a resource under the given name.
    async fn create(&self, name: &str) -> Result<ResourceHandle, ClusterError>;

    /// Wait until a created resource is usable.
    async fn await_ready(&self, _handle: &ResourceHandle) -> Result<(), ClusterError> {
        Ok(())
    }

    /// Delete a resource by name. Deleting an absent name succeeds.
    async fn delete(&self, name: &str) -> Result<(), ClusterError>;

    /// List every resource the cluster knows about.
    async fn list(&self) -> Result<Vec<ListedResource>, ClusterError>;
}
