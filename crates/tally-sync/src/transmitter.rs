//! # Batch Transmitter
//!
//! Writes a [`ChangeBatch`] to the remote store in chunks of at most
//! `transport_limit` writes.
//!
//! ```text
//!   ChangeBatch (1200)
//!        │ into_chunks(500)
//!        ▼
//!   ┌─────────┐   commit_batch   ┌─────────┐   commit_batch   ┌─────────┐
//!   │ 500     │ ───────────────► │ 500     │ ───────────────► │ 200     │
//!   └─────────┘   (timeout)      └─────────┘                  └─────────┘
//!
//!   transient / permanent failure  → next chunk still attempted
//!   authentication failure         → remaining chunks reported untried
//! ```
//!
//! No retries happen here. The report goes to the reconciler.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, warn};

use tally_core::{codec, ChangeBatch, SyncRecord};

use crate::error::{ErrorClass, SyncError};
use crate::remote::{RemoteStore, RemoteWrite, WriteResult};

/// A record the remote store accepted.
#[derive(Debug, Clone)]
pub struct Acknowledged {
    /// The version that was transmitted.
    pub record: SyncRecord,
    pub remote_id: String,
}

/// A record that was not written.
#[derive(Debug, Clone)]
pub struct RecordFailure {
    pub record: SyncRecord,
    pub class: ErrorClass,
    pub message: String,
}

/// Outcome of one transmission.
#[derive(Debug, Default)]
pub struct TransmitReport {
    pub succeeded: Vec<Acknowledged>,
    pub failed: Vec<RecordFailure>,
    /// Records never sent because an earlier chunk hit an authentication
    /// failure.
    pub untried: Vec<SyncRecord>,
    /// Commit calls made.
    pub commits: usize,
}

impl TransmitReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.untried.is_empty()
    }

    pub fn auth_rejected(&self) -> bool {
        self.failed
            .iter()
            .any(|f| f.class == ErrorClass::Authentication)
    }
}

/// Sends batches to a [`RemoteStore`].
pub struct Transmitter {
    remote: Arc<dyn RemoteStore>,
    device_id: String,
    transport_limit: usize,
    commit_timeout: Duration,
}

impl Transmitter {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        device_id: impl Into<String>,
        transport_limit: usize,
        commit_timeout: Duration,
    ) -> Self {
        Transmitter {
            remote,
            device_id: device_id.into(),
            transport_limit: transport_limit.max(1),
            commit_timeout,
        }
    }

    pub async fn transmit(&self, batch: ChangeBatch) -> TransmitReport {
        let mut report = TransmitReport::default();
        let mut halted = false;

        for chunk in batch.into_chunks(self.transport_limit) {
            if halted {
                report.untried.extend(chunk);
                continue;
            }

            let mut writes = Vec::with_capacity(chunk.len());
            let mut sent = Vec::with_capacity(chunk.len());
            for record in chunk {
                match codec::encode(&record, &self.device_id) {
                    Ok(document) => {
                        writes.push(RemoteWrite {
                            table: record.table,
                            key: record.write_key().to_string(),
                            document,
                        });
                        sent.push(record);
                    }
                    Err(e) => {
                        warn!(key = %record.key(), error = %e, "Record cannot be encoded");
                        report.failed.push(RecordFailure {
                            record,
                            class: ErrorClass::Permanent,
                            message: e.to_string(),
                        });
                    }
                }
            }
            if writes.is_empty() {
                continue;
            }

            report.commits += 1;
            debug!(count = writes.len(), commit = report.commits, "Committing chunk");

            let outcome = match timeout(self.commit_timeout, self.remote.commit_batch(writes)).await {
                Ok(result) => result,
                Err(_) => Err(SyncError::Timeout(self.commit_timeout)),
            };

            match outcome {
                Ok(results) if results.len() == sent.len() => {
                    for (record, result) in sent.into_iter().zip(results) {
                        match result {
                            WriteResult::Committed { remote_id } => {
                                report.succeeded.push(Acknowledged { record, remote_id });
                            }
                            WriteResult::Rejected { class, message } => {
                                if class == ErrorClass::Authentication {
                                    halted = true;
                                }
                                report.failed.push(RecordFailure {
                                    record,
                                    class: normalize(class),
                                    message,
                                });
                            }
                        }
                    }
                }
                Ok(results) => {
                    let message = format!(
                        "remote store returned {} results for {} writes",
                        results.len(),
                        sent.len()
                    );
                    warn!(%message, "Malformed commit response");
                    fail_all(&mut report, sent, ErrorClass::Transient, &message);
                }
                Err(err) => {
                    let class = normalize(err.class());
                    warn!(error = %err, %class, count = sent.len(), "Commit failed");
                    if class == ErrorClass::Authentication {
                        halted = true;
                    }
                    fail_all(&mut report, sent, class, &err.to_string());
                }
            }
        }

        report
    }
}

/// A dropped feed is a listener concern; for writes it means "try again".
fn normalize(class: ErrorClass) -> ErrorClass {
    match class {
        ErrorClass::Listener => ErrorClass::Transient,
        other => other,
    }
}

fn fail_all(report: &mut TransmitReport, records: Vec<SyncRecord>, class: ErrorClass, message: &str) {
    report
        .failed
        .extend(records.into_iter().map(|record| RecordFailure {
            record,
            class,
            message: message.to_string(),
        }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{CommitScript, MemoryRemote};
    use crate::session::SessionIdentity;
    use serde_json::json;
    use tally_core::{Payload, SyncTable};

    fn products(n: usize) -> ChangeBatch {
        (0..n)
            .map(|i| {
                let mut payload = Payload::new();
                payload.insert("sku".into(), json!(format!("SKU-{i}")));
                SyncRecord::with_local_id(SyncTable::Products, format!("p-{i}"), payload)
            })
            .collect::<Vec<_>>()
            .into()
    }

    async fn remote() -> Arc<MemoryRemote> {
        let remote = Arc::new(MemoryRemote::new());
        remote
            .set_identity(Some(SessionIdentity::new("cashier-1")))
            .await
            .unwrap();
        remote
    }

    fn transmitter(remote: Arc<MemoryRemote>) -> Transmitter {
        Transmitter::new(remote, "till-01", 500, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_chunks_by_transport_limit() {
        let remote = remote().await;
        let report = transmitter(remote.clone()).transmit(products(1200)).await;

        assert_eq!(remote.commit_sizes(), vec![500, 500, 200]);
        assert_eq!(report.commits, 3);
        assert_eq!(report.succeeded.len(), 1200);
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_failed_chunk_does_not_stop_later_chunks() {
        let remote = remote().await;
        remote.script_commits([
            CommitScript::Succeed,
            CommitScript::FailTransient,
            CommitScript::Succeed,
        ]);

        let report = transmitter(remote.clone()).transmit(products(1200)).await;

        assert_eq!(report.succeeded.len(), 700);
        assert_eq!(report.failed.len(), 500);
        assert!(report
            .failed
            .iter()
            .all(|f| f.class == ErrorClass::Transient));
        assert_eq!(report.failed[0].record.local_id, "p-500");
    }

    #[tokio::test]
    async fn test_auth_failure_halts_remaining_chunks() {
        let remote = remote().await;
        remote.script_commits([CommitScript::Succeed, CommitScript::FailAuth]);

        let report = transmitter(remote.clone()).transmit(products(1200)).await;

        assert_eq!(report.commits, 2);
        assert_eq!(report.succeeded.len(), 500);
        assert_eq!(report.failed.len(), 500);
        assert_eq!(report.untried.len(), 200);
        assert!(report.auth_rejected());
    }

    #[tokio::test]
    async fn test_per_write_rejection() {
        let remote = remote().await;
        remote.reject_local_id("p-1");

        let report = transmitter(remote.clone()).transmit(products(3)).await;

        assert_eq!(report.succeeded.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].class, ErrorClass::Permanent);
        assert_eq!(report.failed[0].record.local_id, "p-1");
    }

    #[tokio::test]
    async fn test_reserved_field_fails_only_that_record() {
        let remote = remote().await;
        let mut records = products(2).into_records();
        records[0].payload.insert("_secret".into(), json!(1));

        let report = transmitter(remote.clone()).transmit(records.into()).await;

        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].class, ErrorClass::Permanent);
        assert_eq!(report.succeeded.len(), 1);
        assert_eq!(remote.commit_sizes(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_timeout_is_transient() {
        let remote = remote().await;
        remote.script_commits([CommitScript::Hang]);

        let tx = Transmitter::new(remote.clone(), "till-01", 500, Duration::from_secs(30));
        let report = tx.transmit(products(2)).await;

        assert_eq!(report.failed.len(), 2);
        assert_eq!(report.failed[0].class, ErrorClass::Transient);
    }
}
