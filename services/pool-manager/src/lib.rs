//! poolkeeper
//!
//! Lifecycle management for a bounded pool of expensive, externally
//! provisioned cluster resources. Slots are named `{prefix}-1` through
//! `{prefix}-N`; the cluster listing is the authority on which of them are
//! occupied.
//!
//! ## Architecture
//!
//! ```text
//! Pool
//! ├── ClusterView        (snapshots of the cluster listing)
//! ├── PoolAllocator      (free-slot selection, reclaim-and-wait)
//! ├── Reclaimer          (background deletes)
//! ├── ProvisionLauncher  (create with retry and rollback)
//! └── LeaseTable         (names handed out but not yet launched)
//! ```
//!
//! [`PoolMonitor`] and [`CleanupWorker`] run beside the pool in the
//! `pool-manager` binary.
//!
//! ## Modules
//!
//! - `cluster`: cluster API trait, snapshots and the simulated cluster
//! - `store`: resource record persistence (SQLite, in-memory)
//! - `allocator`, `launcher`, `reclaim`, `lease`: pool internals
//! - `monitor`, `cleanup`: background workers

pub mod allocator;
pub mod cleanup;
pub mod cluster;
pub mod config;
pub mod error;
pub mod launcher;
pub mod lease;
pub mod monitor;
pub mod pool;
pub mod reclaim;
pub mod store;

// Re-export commonly used types
pub use allocator::{AllocationRequest, AllocatorConfig, PoolAllocator};
pub use cleanup::{CleanupConfig, CleanupReport, CleanupWorker};
pub use cluster::{ClusterApi, ClusterError, ClusterView, MockCluster, ResourcePhase, SlotPhase, Snapshot};
pub use config::Config;
pub use error::PoolError;
pub use launcher::{LaunchConfig, LaunchState, ProvisionLauncher, ProvisionedResource};
pub use lease::LeaseTable;
pub use monitor::{MonitorConfig, PoolMonitor};
pub use pool::{Pool, PoolStatus};
pub use reclaim::Reclaimer;
pub use store::{MemoryResourceStore, ResourceRecord, ResourceStore, SqliteResourceStore};
