//! In-memory store for tests and ephemeral pools.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{RecordState, ResourceRecord, ResourceStore, StoreError};

/// Records kept in a map; counts `store` calls.
#[derive(Default)]
pub struct MemoryResourceStore {
    records: RwLock<BTreeMap<String, ResourceRecord>>,
    store_calls: AtomicU64,
}

impl MemoryResourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `store` calls so far.
    pub fn store_calls(&self) -> u64 {
        self.store_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResourceStore for MemoryResourceStore {
    async fn store(&self, record: &ResourceRecord) -> Result<(), StoreError> {
        self.store_calls.fetch_add(1, Ordering::SeqCst);
        self.records
            .write()
            .await
            .insert(record.slot_name.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, slot_name: &str) -> Result<Option<ResourceRecord>, StoreError> {
        Ok(self.records.read().await.get(slot_name).cloned())
    }

    async fn list(&self) -> Result<Vec<ResourceRecord>, StoreError> {
        Ok(self.records.read().await.values().cloned().collect())
    }

    async fn mark_deleting(&self, slot_name: &str) -> Result<bool, StoreError> {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(slot_name) else {
            return Ok(false);
        };
        record.state = RecordState::Deleting;
        record.updated_at = Utc::now();
        Ok(true)
    }

    async fn remove_if(&self, slot_name: &str, external_id: &str) -> Result<bool, StoreError> {
        let mut records = self.records.write().await;
        if !records
            .get(slot_name)
            .is_some_and(|record| record.external_id == external_id)
        {
            return Ok(false);
        }
        records.remove(slot_name);
        Ok(true)
    }
}
