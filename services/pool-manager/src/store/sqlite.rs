//! SQLite-backed resource store.
//!
//! Durable storage for slot records so a restarted pool manager can tell its
//! own resources apart from leaked ones.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use super::{RecordState, ResourceRecord, ResourceStore, StoreError};

/// SQLite store.
pub struct SqliteResourceStore {
    conn: Mutex<Connection>,
}

impl SqliteResourceStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS slot_records (
                slot_name TEXT PRIMARY KEY,
                external_id TEXT NOT NULL,
                state TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_slot_records_state ON slot_records(state);
            "#,
        )?;

        debug!("Resource store schema initialized");
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

struct RawRecord {
    slot_name: String,
    external_id: String,
    state: String,
    attempts: i64,
    created_at: i64,
    updated_at: i64,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            slot_name: row.get(0)?,
            external_id: row.get(1)?,
            state: row.get(2)?,
            attempts: row.get(3)?,
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
        })
    }

    fn into_record(self) -> Result<ResourceRecord, StoreError> {
        let state = RecordState::parse(&self.state)
            .ok_or_else(|| StoreError::Invalid(format!("unknown state '{}'", self.state)))?;
        let attempts = u32::try_from(self.attempts)
            .map_err(|_| StoreError::Invalid(format!("attempts out of range: {}", self.attempts)))?;

        Ok(ResourceRecord {
            slot_name: self.slot_name,
            external_id: self.external_id,
            state,
            attempts,
            created_at: from_millis(self.created_at)?,
            updated_at: from_millis(self.updated_at)?,
        })
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Invalid(format!("timestamp out of range: {ms}")))
}

const SELECT_COLUMNS: &str =
    "SELECT slot_name, external_id, state, attempts, created_at, updated_at FROM slot_records";

#[async_trait]
impl ResourceStore for SqliteResourceStore {
    async fn store(&self, record: &ResourceRecord) -> Result<(), StoreError> {
        self.conn()?.execute(
            r#"
            INSERT INTO slot_records (slot_name, external_id, state, attempts, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(slot_name) DO UPDATE SET
                external_id = excluded.external_id,
                state = excluded.state,
                attempts = excluded.attempts,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at
            "#,
            params![
                record.slot_name,
                record.external_id,
                record.state.as_str(),
                i64::from(record.attempts),
                record.created_at.timestamp_millis(),
                record.updated_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    async fn get(&self, slot_name: &str) -> Result<Option<ResourceRecord>, StoreError> {
        let raw = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} WHERE slot_name = ?1"))?;
            let raw = stmt
                .query_row(params![slot_name], RawRecord::from_row)
                .optional()?;
            raw
        };
        raw.map(RawRecord::into_record).transpose()
    }

    async fn list(&self) -> Result<Vec<ResourceRecord>, StoreError> {
        let raws = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} ORDER BY slot_name"))?;
            let rows = stmt.query_map([], RawRecord::from_row)?;
            let raws = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            raws
        };
        raws.into_iter().map(RawRecord::into_record).collect()
    }

    async fn mark_deleting(&self, slot_name: &str) -> Result<bool, StoreError> {
        let changed = self.conn()?.execute(
            "UPDATE slot_records SET state = ?1, updated_at = ?2 WHERE slot_name = ?3",
            params![
                RecordState::Deleting.as_str(),
                Utc::now().timestamp_millis(),
                slot_name
            ],
        )?;
        Ok(changed > 0)
    }

    async fn remove_if(&self, slot_name: &str, external_id: &str) -> Result<bool, StoreError> {
        let changed = self.conn()?.execute(
            "DELETE FROM slot_records WHERE slot_name = ?1 AND external_id = ?2",
            params![slot_name, external_id],
        )?;
        Ok(changed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_roundtrip_in_memory() {
        let store = SqliteResourceStore::open_in_memory().unwrap();
        let record = ResourceRecord::ready("slot-2", "res_abc", 3);
        store.store(&record).await.unwrap();

        let loaded = store.get("slot-2").await.unwrap().unwrap();
        assert_eq!(loaded.external_id, "res_abc");
        assert_eq!(loaded.attempts, 3);
        assert_eq!(loaded.state, RecordState::Ready);
        assert_eq!(
            loaded.created_at.timestamp_millis(),
            record.created_at.timestamp_millis()
        );

        assert!(store.get("slot-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_store_replaces_existing() {
        let store = SqliteResourceStore::open_in_memory().unwrap();
        store
            .store(&ResourceRecord::ready("slot-1", "res_old", 1))
            .await
            .unwrap();
        store
            .store(&ResourceRecord::ready("slot-1", "res_new", 2))
            .await
            .unwrap();

        let records = store.list().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].external_id, "res_new");
    }

    #[tokio::test]
    async fn test_mark_deleting_and_remove() {
        let store = SqliteResourceStore::open_in_memory().unwrap();
        store
            .store(&ResourceRecord::ready("slot-1", "res_a", 1))
            .await
            .unwrap();

        assert!(store.mark_deleting("slot-1").await.unwrap());
        assert!(!store.mark_deleting("slot-7").await.unwrap());
        assert_eq!(
            store.get("slot-1").await.unwrap().unwrap().state,
            RecordState::Deleting
        );

        assert!(store.remove_if("slot-1", "res_a").await.unwrap());
        assert!(!store.remove_if("slot-1", "res_a").await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_if_ignores_other_resource() {
        let store = SqliteResourceStore::open_in_memory().unwrap();
        store
            .store(&ResourceRecord::ready("slot-1", "res_new", 2))
            .await
            .unwrap();

        assert!(!store.remove_if("slot-1", "res_old").await.unwrap());
        assert_eq!(
            store.get("slot-1").await.unwrap().unwrap().external_id,
            "res_new"
        );
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.db");

        {
            let store = SqliteResourceStore::open(&path).unwrap();
            store
                .store(&ResourceRecord::ready("slot-4", "res_z", 1))
                .await
                .unwrap();
        }

        let store = SqliteResourceStore::open(&path).unwrap();
        let records = store.list().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].slot_name, "slot-4");
    }
}
