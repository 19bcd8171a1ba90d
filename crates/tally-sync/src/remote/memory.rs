//! # In-Process Remote Store
//!
//! An authoritative document store living in the same process. Several
//! engines can share one `MemoryRemote` to behave like terminals talking to
//! the same backend.
//!
//! ## Change Feed
//! ```text
//!  commit_batch ──► apply (merge) ──► log[table].push(event) ──► broadcast
//!                                                                  │
//!  subscribe(table, since) ──► replay log after `since` ──► live ◄─┘
//! ```
//!
//! ## Fault Injection
//! - [`script_commits`](MemoryRemote::script_commits): per-call outcomes
//!   (transient failure, auth failure, hang)
//! - [`reject_local_id`](MemoryRemote::reject_local_id): permanent per-record
//!   rejection
//! - [`fail_local_id_once`](MemoryRemote::fail_local_id_once): one transient
//!   per-record rejection
//! - [`set_commit_delay`](MemoryRemote::set_commit_delay): slow commits
//! - [`set_pending_echoes`](MemoryRemote::set_pending_echoes): emit
//!   `has_pending_writes` notifications before each committed change
//! - [`reject_identity`](MemoryRemote::reject_identity),
//!   [`revoke_sessions`](MemoryRemote::revoke_sessions): authentication
//!   failures
//! - [`drop_subscriptions`](MemoryRemote::drop_subscriptions): listener
//!   failures

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{future, stream, StreamExt};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;
use uuid::Uuid;

use tally_core::codec::{self, FIELD_ID, FIELD_LOCAL_ID};
use tally_core::{SyncTable, WireDocument};

use super::{Change, ChangeEvent, ChangeStream, Cursor, RemoteStore, RemoteWrite, WriteResult};
use crate::error::{ErrorClass, SyncError, SyncResult};
use crate::session::SessionIdentity;

const FEED_CAPACITY: usize = 1024;

/// Scripted outcome for one `commit_batch` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitScript {
    Succeed,
    FailTransient,
    FailAuth,
    /// Never completes; exercises the commit timeout.
    Hang,
}

#[derive(Debug, Clone)]
enum FeedMessage {
    Event(ChangeEvent),
    Drop(Option<SyncTable>),
    Revoke,
}

#[derive(Debug, Default)]
struct Inner {
    docs: HashMap<SyncTable, BTreeMap<String, WireDocument>>,
    local_index: HashMap<(SyncTable, String), String>,
    log: HashMap<SyncTable, Vec<ChangeEvent>>,
    last_cursor: Cursor,
    identity: Option<SessionIdentity>,
    rejected_identities: HashSet<String>,
    script: VecDeque<CommitScript>,
    permanent_rejects: HashSet<String>,
    transient_rejects: HashSet<String>,
    commit_sizes: Vec<usize>,
    commit_delay: Duration,
    pending_echoes: bool,
}

impl Inner {
    fn check_identity(&self) -> SyncResult<()> {
        match &self.identity {
            None => Err(SyncError::Unauthenticated("no session identity".into())),
            Some(identity) if self.rejected_identities.contains(&identity.user_id) => Err(
                SyncError::Unauthenticated(format!("identity {} rejected", identity.user_id)),
            ),
            Some(_) => Ok(()),
        }
    }

    /// Merges `document` into the stored copy and returns the committed
    /// event (plus the pending echo, if enabled).
    fn apply_write(
        &mut self,
        table: SyncTable,
        key: &str,
        document: WireDocument,
        out: &mut Vec<ChangeEvent>,
    ) -> String {
        let local_id = document
            .get(FIELD_LOCAL_ID)
            .and_then(Value::as_str)
            .unwrap_or(key)
            .to_string();

        let remote_id = document
            .get(FIELD_ID)
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| self.local_index.get(&(table, local_id.clone())).cloned())
            .or_else(|| {
                self.docs
                    .get(&table)
                    .filter(|docs| docs.contains_key(key))
                    .map(|_| key.to_string())
            })
            .unwrap_or_else(|| format!("r-{}", Uuid::new_v4().simple()));

        if self.pending_echoes {
            out.push(ChangeEvent {
                table,
                cursor: self.last_cursor,
                has_pending_writes: true,
                change: Change::Upsert {
                    key: remote_id.clone(),
                    document: document.clone(),
                },
            });
        }

        let stored = self
            .docs
            .entry(table)
            .or_default()
            .entry(remote_id.clone())
            .or_default();
        for (field, value) in document {
            stored.insert(field, value);
        }
        stored.insert(FIELD_ID.to_string(), Value::String(remote_id.clone()));
        let merged = stored.clone();

        self.local_index.insert((table, local_id), remote_id.clone());

        let event = self.next_event(
            table,
            Change::Upsert {
                key: remote_id.clone(),
                document: merged,
            },
        );
        out.push(event);

        remote_id
    }

    fn next_event(&mut self, table: SyncTable, change: Change) -> ChangeEvent {
        self.last_cursor += 1;
        let event = ChangeEvent {
            table,
            cursor: self.last_cursor,
            has_pending_writes: false,
            change,
        };
        self.log.entry(table).or_default().push(event.clone());
        event
    }
}

/// In-process [`RemoteStore`].
#[derive(Debug)]
pub struct MemoryRemote {
    inner: Mutex<Inner>,
    feed: broadcast::Sender<FeedMessage>,
    commit_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks concurrent commits for the lifetime of one call.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        MemoryRemote {
            inner: Mutex::new(Inner::default()),
            feed,
            commit_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> SyncResult<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| SyncError::Internal("memory remote lock poisoned".into()))
    }

    fn publish(&self, events: Vec<ChangeEvent>) {
        for event in events {
            // No receivers is fine: nobody is listening yet.
            let _ = self.feed.send(FeedMessage::Event(event));
        }
    }

    // =========================================================================
    // Fault Injection
    // =========================================================================

    /// Queues outcomes for the next `commit_batch` calls, in order. Calls
    /// beyond the script succeed.
    pub fn script_commits(&self, script: impl IntoIterator<Item = CommitScript>) {
        if let Ok(mut inner) = self.state() {
            inner.script.extend(script);
        }
    }

    /// Permanently rejects every write authored with this local id.
    pub fn reject_local_id(&self, local_id: impl Into<String>) {
        if let Ok(mut inner) = self.state() {
            inner.permanent_rejects.insert(local_id.into());
        }
    }

    /// Rejects the next write authored with this local id with a transient
    /// error. Later writes succeed.
    pub fn fail_local_id_once(&self, local_id: impl Into<String>) {
        if let Ok(mut inner) = self.state() {
            inner.transient_rejects.insert(local_id.into());
        }
    }

    pub fn set_commit_delay(&self, delay: Duration) {
        if let Ok(mut inner) = self.state() {
            inner.commit_delay = delay;
        }
    }

    pub fn set_pending_echoes(&self, enabled: bool) {
        if let Ok(mut inner) = self.state() {
            inner.pending_echoes = enabled;
        }
    }

    pub fn reject_identity(&self, user_id: impl Into<String>) {
        if let Ok(mut inner) = self.state() {
            inner.rejected_identities.insert(user_id.into());
        }
    }

    /// Rejects the current identity and fails every open subscription with
    /// an authentication error.
    pub fn revoke_sessions(&self) {
        if let Ok(mut inner) = self.state() {
            if let Some(identity) = inner.identity.clone() {
                inner.rejected_identities.insert(identity.user_id);
            }
        }
        let _ = self.feed.send(FeedMessage::Revoke);
    }

    /// Ends open subscriptions (all tables when `table` is `None`).
    pub fn drop_subscriptions(&self, table: Option<SyncTable>) {
        let _ = self.feed.send(FeedMessage::Drop(table));
    }

    // =========================================================================
    // Direct Access (other terminals, assertions)
    // =========================================================================

    /// Writes a document as another terminal would and returns its remote id.
    pub fn put_document(&self, table: SyncTable, document: WireDocument) -> SyncResult<String> {
        let key = document
            .get(FIELD_LOCAL_ID)
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut events = Vec::new();
        let remote_id = self.state()?.apply_write(table, &key, document, &mut events);
        self.publish(events);
        Ok(remote_id)
    }

    /// Deletes a document as another terminal would.
    pub fn delete_document(
        &self,
        table: SyncTable,
        remote_id: &str,
        updated_at: DateTime<Utc>,
    ) -> SyncResult<bool> {
        let event = {
            let mut inner = self.state()?;
            let removed = inner
                .docs
                .get_mut(&table)
                .and_then(|docs| docs.remove(remote_id))
                .is_some();
            if !removed {
                return Ok(false);
            }
            inner.local_index.retain(|_, rid| rid != remote_id);
            inner.next_event(
                table,
                Change::Delete {
                    key: remote_id.to_string(),
                    updated_at,
                },
            )
        };
        self.publish(vec![event]);
        Ok(true)
    }

    pub fn document(&self, table: SyncTable, remote_id: &str) -> Option<WireDocument> {
        let inner = self.state().ok()?;
        inner.docs.get(&table)?.get(remote_id).cloned()
    }

    pub fn document_by_local_id(
        &self,
        table: SyncTable,
        local_id: &str,
    ) -> Option<(String, WireDocument)> {
        let inner = self.state().ok()?;
        let remote_id = inner.local_index.get(&(table, local_id.to_string()))?;
        let doc = inner.docs.get(&table)?.get(remote_id)?.clone();
        Some((remote_id.clone(), doc))
    }

    pub fn documents(&self, table: SyncTable) -> Vec<(String, WireDocument)> {
        self.state()
            .ok()
            .and_then(|inner| {
                inner
                    .docs
                    .get(&table)
                    .map(|docs| docs.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            })
            .unwrap_or_default()
    }

    /// Sizes of every commit that reached the apply step, in call order.
    pub fn commit_sizes(&self) -> Vec<usize> {
        self.state()
            .map(|inner| inner.commit_sizes.clone())
            .unwrap_or_default()
    }

    /// Number of `commit_batch` calls, including failed ones.
    pub fn commit_calls(&self) -> usize {
        self.commit_calls.load(Ordering::SeqCst)
    }

    /// Highest number of commits observed in flight at the same time.
    pub fn max_concurrent_commits(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn identity(&self) -> Option<SessionIdentity> {
        self.state().ok().and_then(|inner| inner.identity.clone())
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn set_identity(&self, identity: Option<SessionIdentity>) -> SyncResult<()> {
        debug!(user = ?identity.as_ref().map(|i| &i.user_id), "Memory remote identity set");
        self.state()?.identity = identity;
        Ok(())
    }

    async fn subscribe(&self, table: SyncTable, since: Option<Cursor>) -> SyncResult<ChangeStream> {
        let (rx, backlog) = {
            let inner = self.state()?;
            inner.check_identity()?;
            let rx = self.feed.subscribe();
            let backlog: Vec<ChangeEvent> = inner
                .log
                .get(&table)
                .map(|log| {
                    log.iter()
                        .filter(|e| since.map_or(true, |c| e.cursor > c))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            (rx, backlog)
        };

        let replayed_up_to = backlog
            .last()
            .map(|e| e.cursor)
            .or(since)
            .unwrap_or(0);

        debug!(%table, ?since, backlog = backlog.len(), "Memory remote subscription opened");

        let live = BroadcastStream::new(rx).filter_map(move |msg| {
            let item = match msg {
                Ok(FeedMessage::Event(event))
                    if event.table == table
                        && (event.has_pending_writes || event.cursor > replayed_up_to) =>
                {
                    Some(Ok(event))
                }
                Ok(FeedMessage::Event(_)) => None,
                Ok(FeedMessage::Drop(target)) if target.map_or(true, |t| t == table) => {
                    Some(Err(SyncError::SubscriptionDropped {
                        table,
                        reason: "dropped by server".into(),
                    }))
                }
                Ok(FeedMessage::Drop(_)) => None,
                Ok(FeedMessage::Revoke) => {
                    Some(Err(SyncError::Unauthenticated("session revoked".into())))
                }
                Err(lagged) => Some(Err(SyncError::SubscriptionDropped {
                    table,
                    reason: lagged.to_string(),
                })),
            };
            future::ready(item)
        });

        Ok(stream::iter(backlog.into_iter().map(Ok)).chain(live).boxed())
    }

    async fn commit_batch(&self, writes: Vec<RemoteWrite>) -> SyncResult<Vec<WriteResult>> {
        self.commit_calls.fetch_add(1, Ordering::SeqCst);
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let (script, delay) = {
            let mut inner = self.state()?;
            let script = inner.script.pop_front().unwrap_or(CommitScript::Succeed);
            (script, inner.commit_delay)
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match script {
            CommitScript::Succeed => {}
            CommitScript::FailTransient => {
                return Err(SyncError::Unavailable("injected transient failure".into()))
            }
            CommitScript::FailAuth => {
                return Err(SyncError::Unauthenticated("injected auth failure".into()))
            }
            CommitScript::Hang => future::pending::<()>().await,
        }

        let mut events = Vec::new();
        let results = {
            let mut inner = self.state()?;
            inner.check_identity()?;
            inner.commit_sizes.push(writes.len());

            writes
                .into_iter()
                .map(|write| {
                    let local_id = write
                        .document
                        .get(FIELD_LOCAL_ID)
                        .and_then(Value::as_str)
                        .unwrap_or(write.key.as_str())
                        .to_string();
                    if inner.permanent_rejects.contains(&local_id) {
                        return WriteResult::Rejected {
                            class: ErrorClass::Permanent,
                            message: format!("{} {} failed validation", write.table, local_id),
                        };
                    }
                    if inner.transient_rejects.remove(&local_id) {
                        return WriteResult::Rejected {
                            class: ErrorClass::Transient,
                            message: format!("{} {} temporarily unavailable", write.table, local_id),
                        };
                    }
                    if codec::document_updated_at(&write.document).is_none() {
                        return WriteResult::Rejected {
                            class: ErrorClass::Permanent,
                            message: "missing _updated_at".into(),
                        };
                    }
                    let remote_id =
                        inner.apply_write(write.table, &write.key, write.document, &mut events);
                    WriteResult::Committed { remote_id }
                })
                .collect()
        };

        self.publish(events);
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(local_id: &str, name: &str) -> WireDocument {
        json!({
            "name": name,
            "_local_id": local_id,
            "_updated_at": "2024-05-01T10:00:00Z",
            "_origin": "local",
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    fn write(local_id: &str, name: &str) -> RemoteWrite {
        RemoteWrite {
            table: SyncTable::Products,
            key: local_id.to_string(),
            document: doc(local_id, name),
        }
    }

    async fn remote() -> MemoryRemote {
        let remote = MemoryRemote::new();
        remote
            .set_identity(Some(SessionIdentity::new("cashier-1")))
            .await
            .unwrap();
        remote
    }

    #[tokio::test]
    async fn test_commit_assigns_stable_remote_id() {
        let remote = remote().await;

        let first = remote.commit_batch(vec![write("p-1", "Cola")]).await.unwrap();
        let WriteResult::Committed { remote_id } = &first[0] else {
            panic!("expected commit");
        };

        // Re-sending by local id merges into the same document
        let second = remote
            .commit_batch(vec![write("p-1", "Cola Zero")])
            .await
            .unwrap();
        assert_eq!(
            second[0],
            WriteResult::Committed {
                remote_id: remote_id.clone()
            }
        );
        assert_eq!(remote.documents(SyncTable::Products).len(), 1);
        assert_eq!(
            remote.document(SyncTable::Products, remote_id).unwrap()["name"],
            "Cola Zero"
        );
        assert_eq!(remote.commit_sizes(), vec![1, 1]);
    }

    #[tokio::test]
    async fn test_permanent_rejection_is_per_write() {
        let remote = remote().await;
        remote.reject_local_id("p-2");

        let results = remote
            .commit_batch(vec![write("p-1", "a"), write("p-2", "b")])
            .await
            .unwrap();
        assert!(matches!(results[0], WriteResult::Committed { .. }));
        assert!(matches!(
            results[1],
            WriteResult::Rejected { class: ErrorClass::Permanent, .. }
        ));
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let remote = remote().await;
        remote.script_commits([CommitScript::FailTransient, CommitScript::FailAuth]);

        let err = remote.commit_batch(vec![write("p-1", "a")]).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Transient);
        let err = remote.commit_batch(vec![write("p-1", "a")]).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Authentication);
        assert!(remote.commit_batch(vec![write("p-1", "a")]).await.is_ok());
        assert_eq!(remote.commit_calls(), 3);
    }

    #[tokio::test]
    async fn test_requires_accepted_identity() {
        let remote = MemoryRemote::new();
        assert!(remote.commit_batch(vec![write("p-1", "a")]).await.is_err());

        remote
            .set_identity(Some(SessionIdentity::new("expired")))
            .await
            .unwrap();
        remote.reject_identity("expired");
        let err = remote.subscribe(SyncTable::Products, None).await.err().unwrap();
        assert!(err.is_auth_error());
    }

    #[tokio::test]
    async fn test_subscription_replays_then_streams() {
        let remote = remote().await;
        remote.commit_batch(vec![write("p-1", "a")]).await.unwrap();

        let mut feed = remote.subscribe(SyncTable::Products, None).await.unwrap();
        let replayed = feed.next().await.unwrap().unwrap();
        assert_eq!(replayed.cursor, 1);

        remote.commit_batch(vec![write("p-2", "b")]).await.unwrap();
        let live = feed.next().await.unwrap().unwrap();
        assert_eq!(live.cursor, 2);
        assert!(!live.has_pending_writes);

        // Resuming after cursor 2 replays nothing
        let mut resumed = remote.subscribe(SyncTable::Products, Some(2)).await.unwrap();
        remote.drop_subscriptions(Some(SyncTable::Products));
        let err = resumed.next().await.unwrap().unwrap_err();
        assert_eq!(err.class(), ErrorClass::Listener);
    }

    #[tokio::test]
    async fn test_pending_echo_precedes_commit() {
        let remote = remote().await;
        remote.set_pending_echoes(true);
        let mut feed = remote.subscribe(SyncTable::Products, None).await.unwrap();

        remote.commit_batch(vec![write("p-1", "a")]).await.unwrap();

        let echo = feed.next().await.unwrap().unwrap();
        assert!(echo.has_pending_writes);
        let committed = feed.next().await.unwrap().unwrap();
        assert!(!committed.has_pending_writes);
    }

    #[tokio::test]
    async fn test_delete_document_emits_delete() {
        let remote = remote().await;
        let remote_id = remote.put_document(SyncTable::Customers, doc("c-1", "Ann")).unwrap();
        let mut feed = remote.subscribe(SyncTable::Customers, Some(1)).await.unwrap();

        assert!(remote
            .delete_document(SyncTable::Customers, &remote_id, Utc::now())
            .unwrap());
        let event = feed.next().await.unwrap().unwrap();
        assert!(matches!(event.change, Change::Delete { .. }));
        assert!(remote.document_by_local_id(SyncTable::Customers, "c-1").is_none());
    }
}
