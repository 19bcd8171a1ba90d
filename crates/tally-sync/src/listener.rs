//! # Inbound Change Listener
//!
//! Applies remote changes of one table to the local store.
//!
//! ## Per-Table Loop
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  subscribe(table, cursor) ──► ready_chunks(inbound_batch_size)          │
//! │        ▲                              │                                 │
//! │        │                              ▼                                 │
//! │        │                 skip has_pending_writes (echo)                 │
//! │        │                              │                                 │
//! │        │                              ▼                                 │
//! │        │       decode ─► find local row (local_id, then remote_id)      │
//! │        │                              │                                 │
//! │        │                              ▼                                 │
//! │        │        incoming.updated_at > local.updated_at ?                │
//! │        │             yes: upsert (remote, synced)   no: discard         │
//! │        │                              │                                 │
//! │        │                       cursor = event.cursor                    │
//! │        │                                                                │
//! │   backoff ◄── feed error / end          auth error ──► orchestrator     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Inbound changes never enter the outbound queue. A queued local edit that
//! lost against an applied remote change is discarded from the queue.

use std::sync::Arc;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tally_core::codec;
use tally_core::conflict::{resolve_inbound, Resolution};
use tally_core::{SyncRecord, SyncTable};

use crate::error::SyncResult;
use crate::queue::OutboundQueue;
use crate::reconciler::StoreGate;
use crate::remote::{Change, ChangeEvent, ChangeStream, Cursor, RemoteStore};
use crate::store::LocalStore;

/// What listeners report to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    /// Remote changes were written to the local store.
    Applied { table: SyncTable, count: usize },
    /// The remote store refused the session; the listener has stopped.
    /// `session` is the generation of the session the listener belonged to.
    AuthRejected {
        table: SyncTable,
        session: u64,
        message: String,
    },
}

/// Everything a listener task needs. Cheap to clone.
#[derive(Clone)]
pub(crate) struct ListenerContext {
    pub local: Arc<dyn LocalStore>,
    pub remote: Arc<dyn RemoteStore>,
    pub queue: Arc<OutboundQueue>,
    pub gate: StoreGate,
    pub events: mpsc::Sender<ListenerEvent>,
    pub batch_size: usize,
    pub backoff: ExponentialBackoff,
    /// Generation of the session that spawned the listener.
    pub session: u64,
}

/// Result of applying one change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Applied {
    Written,
    KeptLocal,
    Skipped,
}

/// Listener task body. Runs until aborted or the session is rejected.
pub(crate) async fn run(ctx: ListenerContext, table: SyncTable) {
    let mut cursor: Option<Cursor> = None;
    let mut backoff = ctx.backoff.clone();
    backoff.reset();

    loop {
        let result = match ctx.remote.subscribe(table, cursor).await {
            Ok(feed) => {
                debug!(%table, ?cursor, "Subscribed to remote changes");
                consume(&ctx, table, feed, &mut cursor, &mut backoff).await
            }
            Err(err) => Err(err),
        };

        match result {
            Err(err) if err.is_auth_error() => {
                warn!(%table, error = %err, "Listener stopped: session rejected");
                let _ = ctx
                    .events
                    .send(ListenerEvent::AuthRejected {
                        table,
                        session: ctx.session,
                        message: err.to_string(),
                    })
                    .await;
                return;
            }
            Err(err) => warn!(%table, ?cursor, error = %err, "Change feed failed, resubscribing"),
            Ok(()) => info!(%table, ?cursor, "Change feed ended, resubscribing"),
        }

        let delay = backoff.next_backoff().unwrap_or(backoff.max_interval);
        tokio::time::sleep(delay).await;
    }
}

/// Drains a feed until it ends or fails. `cursor` only advances past
/// changes that were fully applied.
async fn consume(
    ctx: &ListenerContext,
    table: SyncTable,
    feed: ChangeStream,
    cursor: &mut Option<Cursor>,
    backoff: &mut ExponentialBackoff,
) -> SyncResult<()> {
    let mut chunks = feed.ready_chunks(ctx.batch_size.max(1));

    while let Some(items) = chunks.next().await {
        let mut written = 0;
        let mut outcome = Ok(());

        for item in items {
            let event = match item {
                Ok(event) => event,
                Err(err) => {
                    outcome = Err(err);
                    break;
                }
            };
            if event.has_pending_writes {
                continue;
            }
            match apply_event(ctx, table, &event).await {
                Ok(applied) => {
                    if applied == Applied::Written {
                        written += 1;
                    }
                    *cursor = Some(event.cursor);
                }
                Err(err) => {
                    outcome = Err(err);
                    break;
                }
            }
        }

        if written > 0 {
            debug!(%table, count = written, "Applied remote changes");
            let _ = ctx
                .events
                .send(ListenerEvent::Applied {
                    table,
                    count: written,
                })
                .await;
        }
        outcome?;
        backoff.reset();
    }

    Ok(())
}

async fn apply_event(ctx: &ListenerContext, table: SyncTable, event: &ChangeEvent) -> SyncResult<Applied> {
    match &event.change {
        Change::Upsert { key, document } => {
            let incoming = match codec::decode(table, key, document) {
                Ok(record) => record,
                Err(e) => {
                    warn!(%table, %key, error = %e, "Skipping undecodable remote document");
                    return Ok(Applied::Skipped);
                }
            };
            apply_upsert(ctx, incoming).await
        }
        Change::Delete { key, updated_at } => {
            let _gate = ctx.gate.lock().await;
            let existing = match ctx.local.find_by_remote_id(table, key).await? {
                Some(row) => Some(row),
                None => ctx.local.get(table, key).await?,
            };
            let Some(existing) = existing else {
                return Ok(Applied::Skipped);
            };
            match resolve_inbound(Some(existing.updated_at), *updated_at) {
                Resolution::KeepLocal => {
                    debug!(%table, %key, "Ignoring remote delete older than local row");
                    Ok(Applied::KeptLocal)
                }
                Resolution::ApplyRemote => {
                    ctx.local.delete(table, &existing.local_id).await?;
                    ctx.queue.discard_stale(&existing.key(), *updated_at);
                    Ok(Applied::Written)
                }
            }
        }
    }
}

async fn apply_upsert(ctx: &ListenerContext, mut incoming: SyncRecord) -> SyncResult<Applied> {
    let _gate = ctx.gate.lock().await;
    let table = incoming.table;

    let existing = match ctx.local.get(table, &incoming.local_id).await? {
        Some(row) => Some(row),
        None => match incoming.remote_id.as_deref() {
            Some(remote_id) => ctx.local.find_by_remote_id(table, remote_id).await?,
            None => None,
        },
    };

    match resolve_inbound(existing.as_ref().map(|r| r.updated_at), incoming.updated_at) {
        Resolution::KeepLocal => {
            debug!(key = %incoming.key(), "Local row is as new or newer, ignoring remote change");
            Ok(Applied::KeptLocal)
        }
        Resolution::ApplyRemote => {
            if let Some(existing) = &existing {
                incoming.local_id = existing.local_id.clone();
            }
            ctx.local.upsert(&incoming).await?;
            ctx.queue.discard_stale(&incoming.key(), incoming.updated_at);
            Ok(Applied::Written)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemote;
    use crate::session::SessionIdentity;
    use crate::store::MemoryLocalStore;
    use chrono::{Duration as ChronoDuration, Utc};
    use serde_json::json;
    use std::time::Duration;
    use tally_core::{Origin, Payload, SyncState, WireDocument};
    use tokio::sync::Mutex;

    struct Harness {
        local: Arc<MemoryLocalStore>,
        remote: Arc<MemoryRemote>,
        queue: Arc<OutboundQueue>,
        events: mpsc::Receiver<ListenerEvent>,
        ctx: ListenerContext,
    }

    async fn harness() -> Harness {
        let local = Arc::new(MemoryLocalStore::new());
        let remote = Arc::new(MemoryRemote::new());
        remote
            .set_identity(Some(SessionIdentity::new("cashier-1")))
            .await
            .unwrap();
        let queue = Arc::new(OutboundQueue::new());
        let (tx, events) = mpsc::channel(64);
        let ctx = ListenerContext {
            local: local.clone(),
            remote: remote.clone(),
            queue: queue.clone(),
            gate: Arc::new(Mutex::new(())),
            events: tx,
            batch_size: 100,
            session: 3,
            backoff: ExponentialBackoff {
                initial_interval: Duration::from_millis(10),
                max_interval: Duration::from_millis(50),
                multiplier: 2.0,
                max_elapsed_time: None,
                ..Default::default()
            },
        };
        Harness {
            local,
            remote,
            queue,
            events,
            ctx,
        }
    }

    fn remote_doc(local_id: &str, name: &str, updated_at: chrono::DateTime<Utc>) -> WireDocument {
        json!({
            "name": name,
            "_local_id": local_id,
            "_updated_at": codec::format_timestamp(&updated_at),
            "_origin": "local",
            "_device": "till-02",
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    async fn wait_for<F>(mut check: F)
    where
        F: FnMut() -> bool,
    {
        for _ in 0..300 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_applies_remote_changes_as_synced() {
        let mut h = harness().await;
        let task = tokio::spawn(run(h.ctx.clone(), SyncTable::Products));

        let remote_id = h
            .remote
            .put_document(SyncTable::Products, remote_doc("p-9", "Samosa", Utc::now()))
            .unwrap();

        let event = h.events.recv().await.unwrap();
        assert_eq!(
            event,
            ListenerEvent::Applied {
                table: SyncTable::Products,
                count: 1
            }
        );

        let row = h.local.get(SyncTable::Products, "p-9").await.unwrap().unwrap();
        assert_eq!(row.origin, Origin::Remote);
        assert_eq!(row.sync_state, SyncState::Synced);
        assert_eq!(row.remote_id.as_deref(), Some(remote_id.as_str()));
        assert_eq!(row.payload["name"], "Samosa");
        assert!(!row.payload.contains_key("_device"));
        assert!(h.queue.is_empty());
        task.abort();
    }

    #[tokio::test]
    async fn test_newer_local_row_wins() {
        let h = harness().await;
        let mut payload = Payload::new();
        payload.insert("name".into(), json!("Local name"));
        let local = SyncRecord::with_local_id(SyncTable::Products, "p-1", payload);
        h.local.upsert(&local).await.unwrap();
        h.queue.enqueue(local.clone());

        let older = local.updated_at - ChronoDuration::seconds(10);
        let event = ChangeEvent {
            table: SyncTable::Products,
            cursor: 1,
            has_pending_writes: false,
            change: Change::Upsert {
                key: "r-1".into(),
                document: remote_doc("p-1", "Stale remote", older),
            },
        };

        let applied = apply_event(&h.ctx, SyncTable::Products, &event).await.unwrap();
        assert_eq!(applied, Applied::KeptLocal);
        let row = h.local.get(SyncTable::Products, "p-1").await.unwrap().unwrap();
        assert_eq!(row.payload["name"], "Local name");
        assert!(h.queue.contains(&local.key()));

        // a tie also keeps the local copy
        let tie = ChangeEvent {
            cursor: 2,
            change: Change::Upsert {
                key: "r-1".into(),
                document: remote_doc("p-1", "Tied remote", local.updated_at),
            },
            ..event
        };
        let applied = apply_event(&h.ctx, SyncTable::Products, &tie).await.unwrap();
        assert_eq!(applied, Applied::KeptLocal);
    }

    #[tokio::test]
    async fn test_newer_remote_change_replaces_queued_edit() {
        let h = harness().await;
        let mut local = SyncRecord::with_local_id(SyncTable::Customers, "c-1", Payload::new());
        local.remote_id = Some("r-c1".into());
        h.local.upsert(&local).await.unwrap();
        h.queue.enqueue(local.clone());

        // authored elsewhere: matched through the remote id
        let newer = local.updated_at + ChronoDuration::seconds(5);
        let mut document = remote_doc("other-device-id", "Asha", newer);
        document.remove("_local_id");
        let event = ChangeEvent {
            table: SyncTable::Customers,
            cursor: 4,
            has_pending_writes: false,
            change: Change::Upsert {
                key: "r-c1".into(),
                document,
            },
        };

        let applied = apply_event(&h.ctx, SyncTable::Customers, &event).await.unwrap();
        assert_eq!(applied, Applied::Written);

        let row = h.local.get(SyncTable::Customers, "c-1").await.unwrap().unwrap();
        assert_eq!(row.payload["name"], "Asha");
        assert_eq!(row.sync_state, SyncState::Synced);
        assert!(!h.queue.contains(&local.key()));
        assert_eq!(h.local.len(), 1);
    }

    #[tokio::test]
    async fn test_remote_delete_follows_conflict_rule() {
        let h = harness().await;
        let mut local = SyncRecord::with_local_id(SyncTable::Expenses, "e-1", Payload::new());
        local.remote_id = Some("r-e1".into());
        local.sync_state = SyncState::Synced;
        h.local.upsert(&local).await.unwrap();

        let delete = |updated_at| ChangeEvent {
            table: SyncTable::Expenses,
            cursor: 1,
            has_pending_writes: false,
            change: Change::Delete {
                key: "r-e1".into(),
                updated_at,
            },
        };

        let stale = delete(local.updated_at - ChronoDuration::seconds(1));
        assert_eq!(
            apply_event(&h.ctx, SyncTable::Expenses, &stale).await.unwrap(),
            Applied::KeptLocal
        );
        assert!(h.local.get(SyncTable::Expenses, "e-1").await.unwrap().is_some());

        let fresh = delete(local.updated_at + ChronoDuration::seconds(1));
        assert_eq!(
            apply_event(&h.ctx, SyncTable::Expenses, &fresh).await.unwrap(),
            Applied::Written
        );
        assert!(h.local.get(SyncTable::Expenses, "e-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pending_write_echoes_are_ignored() {
        let mut h = harness().await;
        h.remote.set_pending_echoes(true);
        let task = tokio::spawn(run(h.ctx.clone(), SyncTable::Products));

        h.remote
            .put_document(SyncTable::Products, remote_doc("p-2", "Chai", Utc::now()))
            .unwrap();

        // one applied change for the committed event, none for the echo
        let event = h.events.recv().await.unwrap();
        assert_eq!(
            event,
            ListenerEvent::Applied {
                table: SyncTable::Products,
                count: 1
            }
        );
        assert_eq!(h.local.len(), 1);
        task.abort();
    }

    #[tokio::test]
    async fn test_resubscribes_after_drop_without_replaying() {
        let mut h = harness().await;
        let task = tokio::spawn(run(h.ctx.clone(), SyncTable::Sales));

        h.remote
            .put_document(SyncTable::Sales, remote_doc("s-1", "first", Utc::now()))
            .unwrap();
        h.events.recv().await.unwrap();

        h.remote.drop_subscriptions(Some(SyncTable::Sales));
        h.remote
            .put_document(SyncTable::Sales, remote_doc("s-2", "second", Utc::now()))
            .unwrap();

        let local = h.local.clone();
        wait_for(|| local.len() == 2).await;
        assert!(!task.is_finished());
        task.abort();
    }

    #[tokio::test]
    async fn test_auth_failure_is_escalated() {
        let mut h = harness().await;
        let task = tokio::spawn(run(h.ctx.clone(), SyncTable::Products));

        // wait until the listener is subscribed
        h.remote
            .put_document(SyncTable::Products, remote_doc("p-1", "x", Utc::now()))
            .unwrap();
        h.events.recv().await.unwrap();

        h.remote.revoke_sessions();

        let event = h.events.recv().await.unwrap();
        assert!(matches!(
            event,
            ListenerEvent::AuthRejected {
                table: SyncTable::Products,
                session: 3,
                ..
            }
        ));
        task.await.unwrap();
    }
}
