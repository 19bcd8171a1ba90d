//! # Record Repository
//!
//! CRUD over the `sync_records` table.
//!
//! ## Row Layout
//! ```text
//! ┌────────────┬──────────┬───────────┬─────────┬────────────┬────────────┬────────┐
//! │ table_name │ local_id │ remote_id │ payload │ sync_state │ updated_at │ origin │
//! ├────────────┼──────────┼───────────┼─────────┼────────────┼────────────┼────────┤
//! │ products   │ p-1      │ r-7f3a    │ {...}   │ synced     │ 2024-...   │ local  │
//! │ sales      │ s-9      │ NULL      │ {...}   │ unsynced   │ 2024-...   │ local  │
//! └────────────┴──────────┴───────────┴─────────┴────────────┴────────────┴────────┘
//!   PRIMARY KEY (table_name, local_id)
//! ```
//!
//! `upsert` never clears a `remote_id` that is already stored.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::{DbError, DbResult};
use tally_core::{Origin, Payload, SyncRecord, SyncState, SyncTable};

const SELECT_COLUMNS: &str = r#"
    SELECT table_name, local_id, remote_id, payload, sync_state, updated_at, origin
    FROM sync_records
"#;

/// Raw row as stored in SQLite.
#[derive(Debug, sqlx::FromRow)]
struct RecordRow {
    table_name: SyncTable,
    local_id: String,
    remote_id: Option<String>,
    payload: String,
    sync_state: SyncState,
    updated_at: DateTime<Utc>,
    origin: Origin,
}

impl TryFrom<RecordRow> for SyncRecord {
    type Error = DbError;

    fn try_from(row: RecordRow) -> Result<Self, Self::Error> {
        let payload: Payload =
            serde_json::from_str(&row.payload).map_err(|e| DbError::CorruptPayload {
                key: format!("{}/{}", row.table_name, row.local_id),
                reason: e.to_string(),
            })?;

        Ok(SyncRecord {
            table: row.table_name,
            local_id: row.local_id,
            remote_id: row.remote_id,
            payload,
            sync_state: row.sync_state,
            updated_at: row.updated_at,
            origin: row.origin,
        })
    }
}

fn into_records(rows: Vec<RecordRow>) -> DbResult<Vec<SyncRecord>> {
    rows.into_iter().map(SyncRecord::try_from).collect()
}

/// Repository for synchronized records.
#[derive(Debug, Clone)]
pub struct RecordRepository {
    pool: SqlitePool,
}

impl RecordRepository {
    pub fn new(pool: SqlitePool) -> Self {
        RecordRepository { pool }
    }

    /// Fetches one record by its local identity.
    pub async fn get(&self, table: SyncTable, local_id: &str) -> DbResult<Option<SyncRecord>> {
        let sql = format!("{SELECT_COLUMNS} WHERE table_name = ?1 AND local_id = ?2");
        let row: Option<RecordRow> = sqlx::query_as(&sql)
            .bind(table)
            .bind(local_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(SyncRecord::try_from).transpose()
    }

    /// Fetches one record by the id the remote store assigned to it.
    pub async fn find_by_remote_id(
        &self,
        table: SyncTable,
        remote_id: &str,
    ) -> DbResult<Option<SyncRecord>> {
        let sql = format!("{SELECT_COLUMNS} WHERE table_name = ?1 AND remote_id = ?2 LIMIT 1");
        let row: Option<RecordRow> = sqlx::query_as(&sql)
            .bind(table)
            .bind(remote_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(SyncRecord::try_from).transpose()
    }

    /// Inserts or replaces a record.
    pub async fn upsert(&self, record: &SyncRecord) -> DbResult<()> {
        let payload = serde_json::to_string(&record.payload).map_err(|e| DbError::CorruptPayload {
            key: record.key().to_string(),
            reason: e.to_string(),
        })?;

        debug!(
            table = %record.table,
            local_id = %record.local_id,
            state = %record.sync_state,
            "Upserting record"
        );

        sqlx::query(
            r#"
            INSERT INTO sync_records (
                table_name, local_id, remote_id, payload, sync_state, updated_at, origin
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT (table_name, local_id) DO UPDATE SET
                remote_id  = COALESCE(sync_records.remote_id, excluded.remote_id),
                payload    = excluded.payload,
                sync_state = excluded.sync_state,
                updated_at = excluded.updated_at,
                origin     = excluded.origin
            "#,
        )
        .bind(record.table)
        .bind(&record.local_id)
        .bind(&record.remote_id)
        .bind(payload)
        .bind(record.sync_state)
        .bind(record.updated_at)
        .bind(record.origin)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Deletes a record. Returns whether a row was removed.
    pub async fn delete(&self, table: SyncTable, local_id: &str) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM sync_records WHERE table_name = ?1 AND local_id = ?2")
            .bind(table)
            .bind(local_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Every record of `table` whose state is not `synced`, oldest edit first.
    pub async fn list_unsynced(&self, table: SyncTable) -> DbResult<Vec<SyncRecord>> {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE table_name = ?1 AND sync_state != ?2 ORDER BY updated_at ASC"
        );
        let rows: Vec<RecordRow> = sqlx::query_as(&sql)
            .bind(table)
            .bind(SyncState::Synced)
            .fetch_all(&self.pool)
            .await?;

        into_records(rows)
    }

    /// Every record of `table`, oldest edit first.
    pub async fn list_all(&self, table: SyncTable) -> DbResult<Vec<SyncRecord>> {
        let sql = format!("{SELECT_COLUMNS} WHERE table_name = ?1 ORDER BY updated_at ASC");
        let rows: Vec<RecordRow> = sqlx::query_as(&sql)
            .bind(table)
            .fetch_all(&self.pool)
            .await?;

        into_records(rows)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use crate::{Database, DbConfig};
    use serde_json::json;
    use tally_core::{Origin, Payload, SyncRecord, SyncState, SyncTable};

    async fn db() -> Database {
        Database::new(DbConfig::in_memory()).await.unwrap()
    }

    fn payload(name: &str) -> Payload {
        json!({ "name": name, "price_cents": 250 })
            .as_object()
            .cloned()
            .unwrap()
    }

    #[tokio::test]
    async fn test_upsert_and_get() {
        let db = db().await;
        let record = SyncRecord::with_local_id(SyncTable::Products, "p-1", payload("Cola"));

        db.records().upsert(&record).await.unwrap();
        let loaded = db.records().get(SyncTable::Products, "p-1").await.unwrap().unwrap();

        assert_eq!(loaded, record);
        assert!(db.records().get(SyncTable::Sales, "p-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_replaces_but_keeps_remote_id() {
        let db = db().await;
        let mut record = SyncRecord::with_local_id(SyncTable::Products, "p-1", payload("Cola"));
        record.remote_id = Some("r-1".to_string());
        record.sync_state = SyncState::Synced;
        db.records().upsert(&record).await.unwrap();

        let mut edited = record.clone();
        edited.remote_id = None;
        edited.modify(payload("Cola Zero"));
        db.records().upsert(&edited).await.unwrap();

        let loaded = db.records().get(SyncTable::Products, "p-1").await.unwrap().unwrap();
        assert_eq!(loaded.remote_id.as_deref(), Some("r-1"));
        assert_eq!(loaded.payload["name"], "Cola Zero");
        assert_eq!(loaded.sync_state, SyncState::Unsynced);
    }

    #[tokio::test]
    async fn test_list_unsynced_skips_synced_rows() {
        let db = db().await;
        let repo = db.records();

        let mut synced = SyncRecord::with_local_id(SyncTable::Sales, "s-1", payload("a"));
        synced.sync_state = SyncState::Synced;
        let unsynced = SyncRecord::with_local_id(SyncTable::Sales, "s-2", payload("b"));
        let mut failed = SyncRecord::with_local_id(SyncTable::Sales, "s-3", payload("c"));
        failed.sync_state = SyncState::Failed;

        for r in [&synced, &unsynced, &failed] {
            repo.upsert(r).await.unwrap();
        }

        let ids: Vec<String> = repo
            .list_unsynced(SyncTable::Sales)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.local_id)
            .collect();
        assert_eq!(ids, vec!["s-2", "s-3"]);
        assert_eq!(repo.list_all(SyncTable::Sales).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_find_by_remote_id_and_delete() {
        let db = db().await;
        let repo = db.records();

        let mut record = SyncRecord::with_local_id(SyncTable::Customers, "c-1", payload("Ann"));
        record.remote_id = Some("r-42".to_string());
        record.origin = Origin::Remote;
        repo.upsert(&record).await.unwrap();

        let found = repo
            .find_by_remote_id(SyncTable::Customers, "r-42")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.local_id, "c-1");
        assert_eq!(found.origin, Origin::Remote);

        assert!(repo.delete(SyncTable::Customers, "c-1").await.unwrap());
        assert!(!repo.delete(SyncTable::Customers, "c-1").await.unwrap());
        assert!(repo
            .find_by_remote_id(SyncTable::Customers, "r-42")
            .await
            .unwrap()
            .is_none());
    }
}
