//! Persistence of provisioned slot metadata.
//!
//! The store records one entry per successfully provisioned slot:
//! - External id and provisioning attempt count
//! - Lifecycle state (ready, deleting)
//!
//! The cluster stays the authority on whether a slot is occupied; the store
//! only carries the metadata the cluster listing does not.

mod memory;
mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::MemoryResourceStore;
pub use sqlite::SqliteResourceStore;

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store lock poisoned")]
    Poisoned,

    #[error("invalid record: {0}")]
    Invalid(String),
}

/// State of a recorded slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    /// Provisioned and handed to the caller.
    Ready,
    /// Relinquished; deletion pending.
    Deleting,
}

impl RecordState {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Deleting => "deleting",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "ready" => Some(Self::Ready),
            "deleting" => Some(Self::Deleting),
            _ => None,
        }
    }
}

/// Metadata for one provisioned slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub slot_name: String,
    pub external_id: String,
    pub state: RecordState,
    /// Attempts the launch needed.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ResourceRecord {
    /// A fresh ready record.
    pub fn ready(slot_name: impl Into<String>, external_id: impl Into<String>, attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            slot_name: slot_name.into(),
            external_id: external_id.into(),
            state: RecordState::Ready,
            attempts,
            created_at: now,
            updated_at: now,
        }
    }
}

/// External state store interface.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Persist a record, replacing any previous record for the slot.
    async fn store(&self, record: &ResourceRecord) -> Result<(), StoreError>;

    /// Fetch the record for a slot.
    async fn get(&self, slot_name: &str) -> Result<Option<ResourceRecord>, StoreError>;

    /// All records, ordered by slot name.
    async fn list(&self) -> Result<Vec<ResourceRecord>, StoreError>;

    /// Flag a slot as relinquished. Returns false when no record exists.
    async fn mark_deleting(&self, slot_name: &str) -> Result<bool, StoreError>;

    /// Drop the record for a slot if it still names `external_id`.
    ///
    /// A relaunch replaces the record under the same slot name, so removal
    /// is keyed on the resource it describes. Returns false when no such
    /// record existed.
    async fn remove_if(&self, slot_name: &str, external_id: &str) -> Result<bool, StoreError>;
}
