//! # Local Store Seam
//!
//! The engine's view of the device database. Two adapters ship with the
//! crate:
//!
//! - `tally_db::Database` (SQLite, production)
//! - [`MemoryLocalStore`] (tests, embedding)
//!
//! The engine never interprets payloads; it only reads and writes the sync
//! bookkeeping on each record.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use tally_core::{RecordKey, SyncRecord, SyncState, SyncTable};
use tally_db::Database;

use crate::error::{SyncError, SyncResult};

/// CRUD surface the engine needs from the local persistent store.
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn get(&self, table: SyncTable, local_id: &str) -> SyncResult<Option<SyncRecord>>;

    async fn upsert(&self, record: &SyncRecord) -> SyncResult<()>;

    /// Returns whether a row was removed.
    async fn delete(&self, table: SyncTable, local_id: &str) -> SyncResult<bool>;

    /// Every row of `table` whose state is not `synced`.
    async fn list_unsynced(&self, table: SyncTable) -> SyncResult<Vec<SyncRecord>>;

    async fn list_all(&self, table: SyncTable) -> SyncResult<Vec<SyncRecord>>;

    async fn find_by_remote_id(
        &self,
        table: SyncTable,
        remote_id: &str,
    ) -> SyncResult<Option<SyncRecord>>;
}

// =============================================================================
// SQLite Adapter
// =============================================================================

#[async_trait]
impl LocalStore for Database {
    async fn get(&self, table: SyncTable, local_id: &str) -> SyncResult<Option<SyncRecord>> {
        Ok(self.records().get(table, local_id).await?)
    }

    async fn upsert(&self, record: &SyncRecord) -> SyncResult<()> {
        Ok(self.records().upsert(record).await?)
    }

    async fn delete(&self, table: SyncTable, local_id: &str) -> SyncResult<bool> {
        Ok(self.records().delete(table, local_id).await?)
    }

    async fn list_unsynced(&self, table: SyncTable) -> SyncResult<Vec<SyncRecord>> {
        Ok(self.records().list_unsynced(table).await?)
    }

    async fn list_all(&self, table: SyncTable) -> SyncResult<Vec<SyncRecord>> {
        Ok(self.records().list_all(table).await?)
    }

    async fn find_by_remote_id(
        &self,
        table: SyncTable,
        remote_id: &str,
    ) -> SyncResult<Option<SyncRecord>> {
        Ok(self.records().find_by_remote_id(table, remote_id).await?)
    }
}

// =============================================================================
// In-Memory Adapter
// =============================================================================

/// Local store kept in a `HashMap`. Listing order is by `updated_at`, like
/// the SQLite adapter.
#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    rows: Mutex<HashMap<RecordKey, SyncRecord>>,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn rows(&self) -> SyncResult<std::sync::MutexGuard<'_, HashMap<RecordKey, SyncRecord>>> {
        self.rows
            .lock()
            .map_err(|_| SyncError::LocalStore("memory store lock poisoned".into()))
    }

    fn collect(&self, filter: impl Fn(&SyncRecord) -> bool) -> SyncResult<Vec<SyncRecord>> {
        let mut records: Vec<SyncRecord> =
            self.rows()?.values().filter(|r| filter(r)).cloned().collect();
        records.sort_by(|a, b| {
            a.updated_at
                .cmp(&b.updated_at)
                .then_with(|| a.local_id.cmp(&b.local_id))
        });
        Ok(records)
    }

    pub fn len(&self) -> usize {
        self.rows().map(|rows| rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl LocalStore for MemoryLocalStore {
    async fn get(&self, table: SyncTable, local_id: &str) -> SyncResult<Option<SyncRecord>> {
        Ok(self.rows()?.get(&RecordKey::new(table, local_id)).cloned())
    }

    async fn upsert(&self, record: &SyncRecord) -> SyncResult<()> {
        let mut rows = self.rows()?;
        let mut record = record.clone();
        if let Some(existing) = rows.get(&record.key()) {
            if record.remote_id.is_none() {
                record.remote_id = existing.remote_id.clone();
            }
        }
        rows.insert(record.key(), record);
        Ok(())
    }

    async fn delete(&self, table: SyncTable, local_id: &str) -> SyncResult<bool> {
        Ok(self
            .rows()?
            .remove(&RecordKey::new(table, local_id))
            .is_some())
    }

    async fn list_unsynced(&self, table: SyncTable) -> SyncResult<Vec<SyncRecord>> {
        self.collect(|r| r.table == table && r.sync_state != SyncState::Synced)
    }

    async fn list_all(&self, table: SyncTable) -> SyncResult<Vec<SyncRecord>> {
        self.collect(|r| r.table == table)
    }

    async fn find_by_remote_id(
        &self,
        table: SyncTable,
        remote_id: &str,
    ) -> SyncResult<Option<SyncRecord>> {
        Ok(self
            .rows()?
            .values()
            .find(|r| r.table == table && r.remote_id.as_deref() == Some(remote_id))
            .cloned())
    }
}
