//! # Acknowledgement Reconciler
//!
//! Applies a [`TransmitReport`] to the local store and the outbound queue.
//!
//! ```text
//! ┌──────────────────────┬────────────────────────────────────────────────┐
//! │ Outcome              │ Local row / queue                              │
//! ├──────────────────────┼────────────────────────────────────────────────┤
//! │ committed            │ synced + remote_id                             │
//! │ committed, row newer │ remote_id only; newer edit stays queued        │
//! │ transient            │ failed, requeued with attempts + 1             │
//! │ transient, exhausted │ failed, not requeued (retry_failed/force_push) │
//! │ permanent            │ failed, not requeued                           │
//! │ auth / untried       │ unsynced, requeued, attempt not counted        │
//! └──────────────────────┴────────────────────────────────────────────────┘
//! ```
//!
//! Every read-compare-write runs under the store gate shared with the
//! listeners and `record_local_change`.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use tally_core::conflict::{resolve_ack, AckDisposition};
use tally_core::{ChangeBatch, SyncRecord, SyncState};

use crate::error::{ErrorClass, SyncResult};
use crate::queue::OutboundQueue;
use crate::store::LocalStore;
use crate::transmitter::{Acknowledged, RecordFailure, TransmitReport};

/// Serializes read-compare-write sequences against the local store.
pub type StoreGate = Arc<Mutex<()>>;

/// What a reconciliation did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub synced: usize,
    /// Requeued after a transient failure.
    pub retrying: usize,
    /// Gave up after `max_attempts` transient failures.
    pub exhausted: usize,
    /// Permanently rejected.
    pub rejected: usize,
    /// Requeued without counting an attempt (auth failure or never sent).
    pub deferred: usize,
    pub auth_failure: bool,
    /// Message of the last failure seen, for status detail.
    pub last_error: Option<String>,
}

impl ReconcileSummary {
    pub fn is_clean(&self) -> bool {
        self.retrying == 0
            && self.exhausted == 0
            && self.rejected == 0
            && self.deferred == 0
            && !self.auth_failure
    }

    /// Whether the records left in the queue should wait for a retry
    /// instead of being flushed right away.
    pub fn needs_retry(&self) -> bool {
        self.retrying > 0 || self.deferred > 0 || self.auth_failure
    }

    pub fn merge(&mut self, other: ReconcileSummary) {
        self.synced += other.synced;
        self.retrying += other.retrying;
        self.exhausted += other.exhausted;
        self.rejected += other.rejected;
        self.deferred += other.deferred;
        self.auth_failure |= other.auth_failure;
        if other.last_error.is_some() {
            self.last_error = other.last_error;
        }
    }
}

pub struct Reconciler {
    local: Arc<dyn LocalStore>,
    queue: Arc<OutboundQueue>,
    gate: StoreGate,
    max_attempts: u32,
}

impl Reconciler {
    pub fn new(
        local: Arc<dyn LocalStore>,
        queue: Arc<OutboundQueue>,
        gate: StoreGate,
        max_attempts: u32,
    ) -> Self {
        Reconciler {
            local,
            queue,
            gate,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Marks the rows of a dequeued batch `pending`, skipping rows edited
    /// since they were queued.
    pub async fn mark_pending(&self, batch: &ChangeBatch) -> SyncResult<()> {
        let _gate = self.gate.lock().await;
        for record in batch.iter() {
            let Some(mut current) = self.local.get(record.table, &record.local_id).await? else {
                continue;
            };
            if current.updated_at == record.updated_at && current.sync_state != SyncState::Pending {
                current.sync_state = SyncState::Pending;
                self.local.upsert(&current).await?;
            }
        }
        Ok(())
    }

    pub async fn reconcile(&self, report: TransmitReport) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();

        for ack in report.succeeded {
            match self.apply_ack(&ack).await {
                Ok(true) => summary.synced += 1,
                Ok(false) => {}
                Err(err) if err.class() == ErrorClass::Permanent => {
                    error!(key = %ack.record.key(), error = %err, "Acknowledgement conflicts with local row");
                    self.set_state(&ack.record, SyncState::Failed).await;
                    self.queue.forget(&ack.record.key());
                    summary.rejected += 1;
                    summary.last_error = Some(err.to_string());
                }
                Err(err) => {
                    warn!(key = %ack.record.key(), error = %err, "Could not record acknowledgement");
                    let attempts = self.queue.attempts(&ack.record.key());
                    self.queue.requeue(ack.record, attempts);
                    summary.deferred += 1;
                    summary.last_error = Some(err.to_string());
                }
            }
        }

        for failure in report.failed {
            self.apply_failure(failure, &mut summary).await;
        }

        for record in report.untried {
            self.defer(record, &mut summary).await;
        }

        debug!(?summary, "Reconciled transmission");
        summary
    }

    /// Returns true when the row ended up `synced`.
    async fn apply_ack(&self, ack: &Acknowledged) -> SyncResult<bool> {
        let _gate = self.gate.lock().await;
        let key = ack.record.key();
        let Some(mut current) = self.local.get(key.table, &key.local_id).await? else {
            // deleted locally while in flight
            self.queue.forget(&key);
            return Ok(false);
        };

        match resolve_ack(current.updated_at, ack.record.updated_at) {
            AckDisposition::MarkSynced => {
                current.assign_remote_id(&ack.remote_id)?;
                current.sync_state = SyncState::Synced;
                self.local.upsert(&current).await?;
                self.queue.discard_stale(&key, current.updated_at);
                self.queue.forget(&key);
                Ok(true)
            }
            AckDisposition::KeepNewerLocal => {
                debug!(%key, "Row changed while in flight, keeping newer edit queued");
                current.assign_remote_id(&ack.remote_id)?;
                self.local.upsert(&current).await?;
                self.queue.set_remote_id(&key, &ack.remote_id);
                Ok(false)
            }
        }
    }

    async fn apply_failure(&self, failure: RecordFailure, summary: &mut ReconcileSummary) {
        let RecordFailure {
            record,
            class,
            message,
        } = failure;
        let key = record.key();
        summary.last_error = Some(message.clone());

        match class {
            ErrorClass::Transient | ErrorClass::Listener => {
                let attempts = self.queue.attempts(&key) + 1;
                self.set_state(&record, SyncState::Failed).await;
                if attempts >= self.max_attempts {
                    error!(%key, attempts, %message, "Giving up on record after repeated failures");
                    self.queue.forget(&key);
                    summary.exhausted += 1;
                } else {
                    debug!(%key, attempts, %message, "Requeueing after transient failure");
                    self.queue.requeue(record, attempts);
                    summary.retrying += 1;
                }
            }
            ErrorClass::Permanent => {
                error!(%key, %message, "Record rejected by remote store");
                self.set_state(&record, SyncState::Failed).await;
                self.queue.forget(&key);
                summary.rejected += 1;
            }
            ErrorClass::Authentication => {
                summary.auth_failure = true;
                self.defer(record, summary).await;
            }
        }
    }

    async fn defer(&self, record: SyncRecord, summary: &mut ReconcileSummary) {
        let attempts = self.queue.attempts(&record.key());
        self.set_state(&record, SyncState::Unsynced).await;
        self.queue.requeue(record, attempts);
        summary.deferred += 1;
    }

    /// Updates the row's state unless it was edited after `record` was sent.
    async fn set_state(&self, record: &SyncRecord, state: SyncState) {
        let _gate = self.gate.lock().await;
        if let Err(err) = self.write_state(record, state).await {
            warn!(key = %record.key(), error = %err, %state, "Could not update sync state");
        }
    }

    async fn write_state(&self, record: &SyncRecord, state: SyncState) -> SyncResult<()> {
        if let Some(mut current) = self.local.get(record.table, &record.local_id).await? {
            if current.updated_at <= record.updated_at && current.sync_state != state {
                current.sync_state = state;
                self.local.upsert(&current).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryLocalStore;
    use serde_json::json;
    use tally_core::{Payload, SyncTable};

    struct Fixture {
        store: Arc<MemoryLocalStore>,
        queue: Arc<OutboundQueue>,
        reconciler: Reconciler,
    }

    fn fixture(max_attempts: u32) -> Fixture {
        let store = Arc::new(MemoryLocalStore::new());
        let queue = Arc::new(OutboundQueue::new());
        let reconciler = Reconciler::new(
            store.clone(),
            queue.clone(),
            Arc::new(Mutex::new(())),
            max_attempts,
        );
        Fixture {
            store,
            queue,
            reconciler,
        }
    }

    async fn stored(store: &MemoryLocalStore, id: &str) -> SyncRecord {
        let mut payload = Payload::new();
        payload.insert("name".into(), json!(id));
        let record = SyncRecord::with_local_id(SyncTable::Products, id, payload);
        store.upsert(&record).await.unwrap();
        record
    }

    fn failure(record: &SyncRecord, class: ErrorClass) -> RecordFailure {
        RecordFailure {
            record: record.clone(),
            class,
            message: format!("{class} failure"),
        }
    }

    #[tokio::test]
    async fn test_success_and_failure_split() {
        let f = fixture(5);
        let a = stored(&f.store, "p-1").await;
        let b = stored(&f.store, "p-2").await;
        let c = stored(&f.store, "p-3").await;

        let summary = f
            .reconciler
            .reconcile(TransmitReport {
                succeeded: vec![
                    Acknowledged { record: a.clone(), remote_id: "r-1".into() },
                    Acknowledged { record: b.clone(), remote_id: "r-2".into() },
                ],
                failed: vec![failure(&c, ErrorClass::Transient)],
                untried: vec![],
                commits: 1,
            })
            .await;

        assert_eq!(summary.synced, 2);
        assert_eq!(summary.retrying, 1);

        let a = f.store.get(SyncTable::Products, "p-1").await.unwrap().unwrap();
        assert_eq!(a.sync_state, SyncState::Synced);
        assert_eq!(a.remote_id.as_deref(), Some("r-1"));

        let c_row = f.store.get(SyncTable::Products, "p-3").await.unwrap().unwrap();
        assert_eq!(c_row.sync_state, SyncState::Failed);
        assert!(f.queue.contains(&c.key()));
        assert_eq!(f.queue.attempts(&c.key()), 1);
    }

    #[tokio::test]
    async fn test_ack_against_newer_local_edit() {
        let f = fixture(5);
        let sent = stored(&f.store, "p-1").await;

        let mut edited = sent.clone();
        edited.modify(Payload::new());
        f.store.upsert(&edited).await.unwrap();
        f.queue.enqueue(edited.clone());

        let summary = f
            .reconciler
            .reconcile(TransmitReport {
                succeeded: vec![Acknowledged { record: sent, remote_id: "r-1".into() }],
                ..Default::default()
            })
            .await;

        assert_eq!(summary.synced, 0);
        let row = f.store.get(SyncTable::Products, "p-1").await.unwrap().unwrap();
        assert_eq!(row.sync_state, SyncState::Unsynced);
        assert_eq!(row.remote_id.as_deref(), Some("r-1"));
        assert_eq!(row.updated_at, edited.updated_at);

        let (batch, _) = f.queue.flush(10);
        assert_eq!(batch.records()[0].remote_id.as_deref(), Some("r-1"));
    }

    #[tokio::test]
    async fn test_ack_with_different_remote_id_fails_record() {
        let f = fixture(5);
        let mut record = stored(&f.store, "p-1").await;
        record.assign_remote_id("r-1").unwrap();
        f.store.upsert(&record).await.unwrap();
        f.queue.enqueue(record.clone());
        f.queue.flush(10);

        let summary = f
            .reconciler
            .reconcile(TransmitReport {
                succeeded: vec![Acknowledged { record: record.clone(), remote_id: "r-2".into() }],
                ..Default::default()
            })
            .await;

        assert_eq!(summary.synced, 0);
        assert_eq!(summary.rejected, 1);
        assert_eq!(summary.deferred, 0);
        assert!(summary.last_error.is_some());
        assert!(!f.queue.contains(&record.key()));

        let row = f.store.get(SyncTable::Products, "p-1").await.unwrap().unwrap();
        assert_eq!(row.sync_state, SyncState::Failed);
        assert_eq!(row.remote_id.as_deref(), Some("r-1"));
    }

    #[tokio::test]
    async fn test_transient_failures_exhaust() {
        let f = fixture(2);
        let record = stored(&f.store, "p-1").await;

        let report = || TransmitReport {
            failed: vec![failure(&record, ErrorClass::Transient)],
            ..Default::default()
        };

        let first = f.reconciler.reconcile(report()).await;
        assert_eq!(first.retrying, 1);
        f.queue.flush(10);

        let second = f.reconciler.reconcile(report()).await;
        assert_eq!(second.exhausted, 1);
        assert!(!f.queue.contains(&record.key()));

        let row = f.store.get(SyncTable::Products, "p-1").await.unwrap().unwrap();
        assert_eq!(row.sync_state, SyncState::Failed);
    }

    #[tokio::test]
    async fn test_permanent_failure_not_requeued() {
        let f = fixture(5);
        let record = stored(&f.store, "p-1").await;

        let summary = f
            .reconciler
            .reconcile(TransmitReport {
                failed: vec![failure(&record, ErrorClass::Permanent)],
                ..Default::default()
            })
            .await;

        assert_eq!(summary.rejected, 1);
        assert!(f.queue.is_empty());
        assert_eq!(summary.last_error.as_deref(), Some("permanent failure"));
    }

    #[tokio::test]
    async fn test_auth_failure_defers_without_attempt() {
        let f = fixture(5);
        let a = stored(&f.store, "p-1").await;
        let b = stored(&f.store, "p-2").await;

        let summary = f
            .reconciler
            .reconcile(TransmitReport {
                failed: vec![failure(&a, ErrorClass::Authentication)],
                untried: vec![b.clone()],
                ..Default::default()
            })
            .await;

        assert!(summary.auth_failure);
        assert_eq!(summary.deferred, 2);
        assert_eq!(f.queue.len(), 2);
        assert_eq!(f.queue.attempts(&a.key()), 0);
        let row = f.store.get(SyncTable::Products, "p-1").await.unwrap().unwrap();
        assert_eq!(row.sync_state, SyncState::Unsynced);
    }

    #[tokio::test]
    async fn test_mark_pending_skips_edited_rows() {
        let f = fixture(5);
        let a = stored(&f.store, "p-1").await;
        let b = stored(&f.store, "p-2").await;

        let mut edited = b.clone();
        edited.modify(Payload::new());
        f.store.upsert(&edited).await.unwrap();

        f.reconciler
            .mark_pending(&ChangeBatch::new(vec![a, b]))
            .await
            .unwrap();

        let a = f.store.get(SyncTable::Products, "p-1").await.unwrap().unwrap();
        let b = f.store.get(SyncTable::Products, "p-2").await.unwrap().unwrap();
        assert_eq!(a.sync_state, SyncState::Pending);
        assert_eq!(b.sync_state, SyncState::Unsynced);
    }
}
