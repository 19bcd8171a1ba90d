//! # Sync Engine
//!
//! Orchestrates both sync directions for one terminal.
//!
//! ## Engine Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        SyncEngine Architecture                          │
//! │                                                                         │
//! │   SyncHandle (Clone) ──── Command (mpsc) ────┐                         │
//! │     record_local_change: store + queue       │                         │
//! │                                              ▼                          │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                      Orchestrator task                           │  │
//! │  │                                                                  │  │
//! │  │  • StatusMachine transitions, status watch channel               │  │
//! │  │  • At most one flush task; triggers during a flush coalesce      │  │
//! │  │  • Periodic timer, queue threshold, backoff retry timer          │  │
//! │  │  • Owns the SyncSession (listeners) and the session identity     │  │
//! │  └───────────────┬───────────────────────────────┬──────────────────┘  │
//! │                  ▼                               ▼                      │
//! │  ┌────────────────────────────────┐  ┌──────────────────────────────┐  │
//! │  │ flush task                     │  │ SyncSession                  │  │
//! │  │ queue.flush → mark_pending →   │  │ one listener per table       │  │
//! │  │ transmit → reconcile           │  │ (auth failure → orchestrator)│  │
//! │  └────────────────────────────────┘  └──────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use tally_core::{Origin, StatusSnapshot, SyncRecord, SyncState, SyncTable};
use tally_db::Database;

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::listener::{ListenerContext, ListenerEvent};
use crate::machine::{FlushOutcome, StatusMachine};
use crate::queue::OutboundQueue;
use crate::reconciler::{ReconcileSummary, Reconciler, StoreGate};
use crate::remote::RemoteStore;
use crate::session::{SessionIdentity, SyncSession};
use crate::status::StatusPublisher;
use crate::store::LocalStore;
use crate::transmitter::Transmitter;

// =============================================================================
// Commands
// =============================================================================

enum Command {
    TriggerSync,
    ForcePush {
        reply: oneshot::Sender<SyncResult<usize>>,
    },
    RetryFailed {
        reply: oneshot::Sender<SyncResult<usize>>,
    },
    SetOnline(bool),
    SetIdentity {
        identity: Option<SessionIdentity>,
        reply: oneshot::Sender<SyncResult<()>>,
    },
    /// A local change was stored and queued.
    LocalChange,
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Result of one flush task, tagged with the session generation it ran
/// under.
struct FlushReport {
    generation: u64,
    summary: ReconcileSummary,
}

// =============================================================================
// Sync Handle
// =============================================================================

/// Control surface of a running engine. Cheap to clone.
#[derive(Clone)]
pub struct SyncHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<StatusSnapshot>,
    local: Arc<dyn LocalStore>,
    queue: Arc<OutboundQueue>,
    gate: StoreGate,
}

impl SyncHandle {
    async fn send(&self, command: Command) -> SyncResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SyncError::ShuttingDown)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<SyncResult<T>>) -> Command,
    ) -> SyncResult<T> {
        let (tx, rx) = oneshot::channel();
        self.send(command(tx)).await?;
        rx.await.map_err(|_| SyncError::ShuttingDown)?
    }

    /// Requests a flush. Returns once the request is queued.
    pub async fn trigger_sync(&self) -> SyncResult<()> {
        self.send(Command::TriggerSync).await
    }

    /// Re-enqueues every local record of every configured table and flushes.
    /// Returns the number of records enqueued.
    pub async fn force_push(&self) -> SyncResult<usize> {
        self.request(|reply| Command::ForcePush { reply }).await
    }

    /// Re-enqueues every record in the `failed` state and flushes.
    pub async fn retry_failed(&self) -> SyncResult<usize> {
        self.request(|reply| Command::RetryFailed { reply }).await
    }

    pub async fn set_online_hint(&self, online: bool) -> SyncResult<()> {
        self.send(Command::SetOnline(online)).await
    }

    /// Switches the authenticated identity. Listeners are rebuilt under the
    /// new identity; queued writes are kept.
    pub async fn set_session_identity(&self, identity: Option<SessionIdentity>) -> SyncResult<()> {
        self.request(|reply| Command::SetIdentity { identity, reply })
            .await
    }

    /// Durably writes a local mutation and queues it for upload.
    ///
    /// The stored version is returned: its `updated_at` is moved past the
    /// previous version if needed, and a known remote id is carried over.
    pub async fn record_local_change(&self, record: SyncRecord) -> SyncResult<SyncRecord> {
        let stored = {
            let _gate = self.gate.lock().await;
            let mut record = record;
            record.sync_state = SyncState::Unsynced;
            record.origin = Origin::Local;

            if let Some(existing) = self.local.get(record.table, &record.local_id).await? {
                if let Some(known) = existing.remote_id.as_deref() {
                    record.assign_remote_id(known)?;
                }
                if record.updated_at <= existing.updated_at {
                    record.updated_at = existing.updated_at + chrono::Duration::microseconds(1);
                }
            }

            self.local.upsert(&record).await?;
            self.queue.enqueue(record.clone());
            record
        };

        debug!(key = %stored.key(), "Local change queued");
        // the write is durable; a stopped engine picks it up on restart
        let _ = self.send(Command::LocalChange).await;
        Ok(stored)
    }

    pub fn status(&self) -> StatusSnapshot {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.clone()
    }

    /// Records waiting in the outbound queue.
    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    /// Stops the orchestrator, its listeners and any flush in flight.
    pub async fn shutdown(&self) -> SyncResult<()> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply: tx }).await.is_err() {
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }
}

// =============================================================================
// Sync Engine
// =============================================================================

/// Configured, not yet running engine.
///
/// ## Usage
/// ```rust,ignore
/// let engine = SyncEngine::builder()
///     .with_config(SyncConfig::load(None)?)
///     .with_database(db)
///     .with_remote_store(Arc::new(WsRemote::connect(ws_config)))
///     .with_identity(SessionIdentity::new(user_id))
///     .build()?;
///
/// let handle = engine.start().await?;
/// handle.record_local_change(record).await?;
/// ```
pub struct SyncEngine {
    config: Arc<SyncConfig>,
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    online: bool,
    identity: Option<SessionIdentity>,
}

impl SyncEngine {
    pub fn builder() -> SyncEngineBuilder {
        SyncEngineBuilder::default()
    }

    /// Rebuilds the outbound queue from the local store and spawns the
    /// orchestrator.
    pub async fn start(self) -> SyncResult<SyncHandle> {
        let config = self.config;
        let queue = Arc::new(OutboundQueue::new());

        let mut unsynced = Vec::new();
        for table in SyncTable::ALL {
            unsynced.extend(self.local.list_unsynced(table).await?);
        }
        unsynced.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        let restored = unsynced.len();
        for record in unsynced {
            queue.enqueue(record);
        }

        info!(
            device_id = %config.device_id(),
            tables = config.sync.tables.len(),
            restored,
            online = self.online,
            "Starting sync engine"
        );

        let gate: StoreGate = Arc::new(Mutex::new(()));
        let (command_tx, command_rx) = mpsc::channel(100);
        let (flush_tx, flush_rx) = mpsc::channel(4);
        let (listener_tx, listener_rx) = mpsc::channel(100);

        let machine = StatusMachine::new(self.online);
        let publisher = StatusPublisher::new(machine.snapshot(queue.len(), None));
        let status_rx = publisher.subscribe();

        let transmitter = Arc::new(Transmitter::new(
            self.remote.clone(),
            config.device_id(),
            config.sync.transport_limit,
            config.commit_timeout(),
        ));
        let reconciler = Arc::new(Reconciler::new(
            self.local.clone(),
            queue.clone(),
            gate.clone(),
            config.sync.max_attempts,
        ));
        let listener_ctx = ListenerContext {
            local: self.local.clone(),
            remote: self.remote.clone(),
            queue: queue.clone(),
            gate: gate.clone(),
            events: listener_tx,
            batch_size: config.sync.inbound_batch_size,
            backoff: config.retry_backoff(),
            session: 0,
        };

        let orchestrator = Orchestrator {
            retry_backoff: config.retry_backoff(),
            config: config.clone(),
            local: self.local.clone(),
            remote: self.remote,
            queue: queue.clone(),
            transmitter,
            reconciler,
            listener_ctx,
            machine,
            publisher,
            identity: None,
            session: None,
            generation: 0,
            flush: None,
            rerun_flush: false,
            retry_at: None,
            last_synced_at: None,
            commands: command_rx,
            flush_tx,
            flush_rx,
            listener_rx,
        };
        tokio::spawn(orchestrator.run(self.identity));

        Ok(SyncHandle {
            commands: command_tx,
            status: status_rx,
            local: self.local,
            queue,
            gate,
        })
    }
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for [`SyncEngine`].
pub struct SyncEngineBuilder {
    config: Option<SyncConfig>,
    local: Option<Arc<dyn LocalStore>>,
    remote: Option<Arc<dyn RemoteStore>>,
    online: bool,
    identity: Option<SessionIdentity>,
}

impl Default for SyncEngineBuilder {
    fn default() -> Self {
        SyncEngineBuilder {
            config: None,
            local: None,
            remote: None,
            online: true,
            identity: None,
        }
    }
}

impl SyncEngineBuilder {
    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_local_store(mut self, local: Arc<dyn LocalStore>) -> Self {
        self.local = Some(local);
        self
    }

    /// Uses the SQLite database as the local store.
    pub fn with_database(mut self, db: Database) -> Self {
        self.local = Some(Arc::new(db));
        self
    }

    pub fn with_remote_store(mut self, remote: Arc<dyn RemoteStore>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Connectivity hint at start. Defaults to online.
    pub fn initially_online(mut self, online: bool) -> Self {
        self.online = online;
        self
    }

    pub fn with_identity(mut self, identity: SessionIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn build(self) -> SyncResult<SyncEngine> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let local = self
            .local
            .ok_or_else(|| SyncError::InvalidConfig("Local store required".into()))?;
        let remote = self
            .remote
            .ok_or_else(|| SyncError::InvalidConfig("Remote store required".into()))?;

        Ok(SyncEngine {
            config: Arc::new(config),
            local,
            remote,
            online: self.online,
            identity: self.identity,
        })
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

struct Orchestrator {
    config: Arc<SyncConfig>,
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    queue: Arc<OutboundQueue>,
    transmitter: Arc<Transmitter>,
    reconciler: Arc<Reconciler>,
    listener_ctx: ListenerContext,
    machine: StatusMachine,
    publisher: StatusPublisher,
    identity: Option<SessionIdentity>,
    session: Option<SyncSession>,
    /// Bumped on every identity change and every session opened. Auth
    /// failures from an older generation are ignored.
    generation: u64,
    flush: Option<JoinHandle<()>>,
    /// A flush was requested while one was running.
    rerun_flush: bool,
    retry_at: Option<Instant>,
    retry_backoff: ExponentialBackoff,
    last_synced_at: Option<DateTime<Utc>>,
    commands: mpsc::Receiver<Command>,
    flush_tx: mpsc::Sender<FlushReport>,
    flush_rx: mpsc::Receiver<FlushReport>,
    listener_rx: mpsc::Receiver<ListenerEvent>,
}

impl Orchestrator {
    async fn run(mut self, identity: Option<SessionIdentity>) {
        if identity.is_some() {
            if let Err(e) = self.apply_identity(identity).await {
                error!(error = %e, "Initial session identity rejected");
                self.machine.report_error(e.to_string());
            }
        }
        self.request_flush("startup");
        self.publish();

        let period = self.config.flush_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let retry_at = self.retry_at;
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(Command::Shutdown { reply }) => {
                            self.stop().await;
                            let _ = reply.send(());
                            break;
                        }
                        Some(command) => self.handle_command(command).await,
                        None => {
                            self.stop().await;
                            break;
                        }
                    }
                }

                Some(report) = self.flush_rx.recv() => {
                    self.on_flush_finished(report).await;
                }

                Some(event) = self.listener_rx.recv() => {
                    self.on_listener_event(event).await;
                }

                _ = ticker.tick() => {
                    if !self.queue.is_empty() {
                        self.request_flush("periodic");
                    }
                }

                _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    self.retry_at = None;
                    self.request_flush("retry");
                }
            }
            self.publish();
        }

        info!("Sync engine stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::TriggerSync => self.request_flush("manual trigger"),
            Command::ForcePush { reply } => {
                let result = self.force_push().await;
                let _ = reply.send(result);
            }
            Command::RetryFailed { reply } => {
                let result = self.retry_failed().await;
                let _ = reply.send(result);
            }
            Command::SetOnline(online) => self.set_online(online).await,
            Command::SetIdentity { identity, reply } => {
                let result = self.apply_identity(identity).await;
                if result.is_ok() {
                    self.request_flush("identity changed");
                }
                let _ = reply.send(result);
            }
            Command::LocalChange => {
                if self.queue.len() >= self.config.sync.flush_threshold {
                    self.request_flush("queue threshold");
                }
            }
            Command::Shutdown { .. } => {}
        }
    }

    // =========================================================================
    // Outbound
    // =========================================================================

    fn request_flush(&mut self, reason: &'static str) {
        if !self.machine.can_sync() {
            debug!(reason, "Flush skipped: offline or blocked");
            return;
        }
        if self.identity.is_none() {
            debug!(reason, "Flush skipped: no session identity");
            return;
        }
        if self.flush.is_some() {
            self.rerun_flush = true;
            return;
        }
        if self.queue.is_empty() {
            return;
        }

        info!(reason, pending = self.queue.len(), "Starting flush");
        self.retry_at = None;
        self.machine.flush_started();

        let queue = self.queue.clone();
        let transmitter = self.transmitter.clone();
        let reconciler = self.reconciler.clone();
        let max_records = self.config.sync.flush_max_records;
        let generation = self.generation;
        let done = self.flush_tx.clone();

        self.flush = Some(tokio::spawn(async move {
            let mut total = ReconcileSummary::default();
            loop {
                let (batch, more) = queue.flush(max_records);
                if batch.is_empty() {
                    break;
                }
                if let Err(e) = reconciler.mark_pending(&batch).await {
                    warn!(error = %e, "Could not mark batch pending");
                }
                let report = transmitter.transmit(batch).await;
                let summary = reconciler.reconcile(report).await;
                let stop = summary.needs_retry();
                total.merge(summary);
                if stop || !more {
                    break;
                }
            }
            let _ = done
                .send(FlushReport {
                    generation,
                    summary: total,
                })
                .await;
        }));
    }

    async fn on_flush_finished(&mut self, report: FlushReport) {
        self.flush = None;
        let mut summary = report.summary;
        if summary.auth_failure && report.generation != self.generation {
            // rejected under an identity that has since been replaced; the
            // deferred records retry under the current one
            debug!(
                flush_generation = report.generation,
                current = self.generation,
                "Ignoring auth failure from a previous session"
            );
            summary.auth_failure = false;
        }
        if summary.synced > 0 {
            self.last_synced_at = Some(Utc::now());
        }

        let detail = summary
            .last_error
            .clone()
            .unwrap_or_else(|| "sync failed".to_string());
        let outcome = if summary.auth_failure {
            FlushOutcome::AuthRejected { detail }
        } else if summary.retrying > 0 || summary.deferred > 0 {
            FlushOutcome::Retrying {
                detail: format!("{} records waiting to retry: {detail}", self.queue.len()),
            }
        } else if summary.exhausted > 0 || summary.rejected > 0 {
            FlushOutcome::Failed {
                detail: format!(
                    "{} records failed: {detail}",
                    summary.exhausted + summary.rejected
                ),
            }
        } else {
            FlushOutcome::Clean
        };

        info!(
            synced = summary.synced,
            retrying = summary.retrying,
            exhausted = summary.exhausted,
            rejected = summary.rejected,
            "Flush finished"
        );

        match &outcome {
            FlushOutcome::AuthRejected { detail } => {
                error!(%detail, "Remote store rejected the session, suspending sync");
                self.retry_at = None;
                self.rerun_flush = false;
                self.close_session().await;
            }
            FlushOutcome::Retrying { .. } => {
                let delay = self
                    .retry_backoff
                    .next_backoff()
                    .unwrap_or(self.retry_backoff.max_interval);
                debug!(?delay, "Scheduling retry");
                self.retry_at = Some(Instant::now() + delay);
            }
            FlushOutcome::Failed { .. } | FlushOutcome::Clean => {
                self.retry_backoff.reset();
            }
        }
        self.machine.flush_finished(outcome);

        if std::mem::take(&mut self.rerun_flush) {
            self.request_flush("coalesced trigger");
        }
    }

    async fn force_push(&mut self) -> SyncResult<usize> {
        let mut count = 0;
        for &table in &self.config.sync.tables {
            for record in self.local.list_all(table).await? {
                self.queue.enqueue(record);
                count += 1;
            }
        }
        info!(count, "Force push requested");
        self.request_flush("force push");
        Ok(count)
    }

    async fn retry_failed(&mut self) -> SyncResult<usize> {
        let mut count = 0;
        for table in SyncTable::ALL {
            for record in self.local.list_unsynced(table).await? {
                if record.sync_state == SyncState::Failed {
                    // enqueue starts the attempt counter over
                    self.queue.enqueue(record);
                    count += 1;
                }
            }
        }
        info!(count, "Retrying failed records");
        self.retry_backoff.reset();
        self.request_flush("retry failed");
        Ok(count)
    }

    // =========================================================================
    // Session & Connectivity
    // =========================================================================

    async fn set_online(&mut self, online: bool) {
        if !self.machine.set_online(online) {
            return;
        }
        if online {
            info!("Connectivity restored");
            self.open_session();
            self.request_flush("connectivity restored");
        } else {
            info!("Connectivity lost");
            self.retry_at = None;
            self.close_session().await;
        }
    }

    async fn apply_identity(&mut self, identity: Option<SessionIdentity>) -> SyncResult<()> {
        self.close_session().await;

        if let Err(e) = self.remote.set_identity(identity.clone()).await {
            warn!(error = %e, "Remote store refused identity change");
            self.open_session();
            return Err(e);
        }

        info!(user = ?identity.as_ref().map(|i| i.user_id.as_str()), "Session identity changed");
        self.identity = identity;
        self.generation += 1;
        self.machine.identity_changed();
        self.retry_backoff.reset();
        self.open_session();
        Ok(())
    }

    fn open_session(&mut self) {
        if self.session.is_some() || !self.machine.can_sync() {
            return;
        }
        if let Some(identity) = self.identity.clone() {
            self.generation += 1;
            self.session = Some(SyncSession::open(
                identity,
                self.generation,
                &self.config.sync.tables,
                &self.listener_ctx,
            ));
        }
    }

    async fn close_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.close().await;
        }
    }

    async fn on_listener_event(&mut self, event: ListenerEvent) {
        match event {
            ListenerEvent::Applied { table, count } => {
                debug!(%table, count, "Inbound changes applied");
            }
            ListenerEvent::AuthRejected {
                table,
                session,
                message,
            } => {
                let current = self.session.as_ref().map(SyncSession::generation);
                if current != Some(session) {
                    // late report from a session already torn down
                    debug!(%table, session, ?current, "Ignoring auth failure from a closed session");
                    return;
                }
                error!(%table, %message, "Listener rejected by remote store, suspending sync");
                self.machine.reject_session(message);
                self.retry_at = None;
                self.close_session().await;
            }
        }
    }

    async fn stop(&mut self) {
        info!("Shutting down sync engine");
        if let Some(flush) = self.flush.take() {
            flush.abort();
        }
        self.close_session().await;
    }

    fn publish(&self) {
        self.publisher
            .publish(self.machine.snapshot(self.queue.len(), self.last_synced_at));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemote;
    use crate::store::MemoryLocalStore;

    fn config() -> SyncConfig {
        let mut config = SyncConfig::default();
        config.device.id = "till-01".into();
        config
    }

    #[test]
    fn test_builder_requires_stores() {
        let err = SyncEngine::builder().with_config(config()).build().err().unwrap();
        assert!(err.is_config_error());

        let err = SyncEngine::builder()
            .with_config(config())
            .with_local_store(Arc::new(MemoryLocalStore::new()))
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("Remote store required"));
    }

    #[test]
    fn test_builder_validates_config() {
        let mut bad = config();
        bad.sync.transport_limit = 0;
        let result = SyncEngine::builder()
            .with_config(bad)
            .with_local_store(Arc::new(MemoryLocalStore::new()))
            .with_remote_store(Arc::new(MemoryRemote::new()))
            .build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_offline_start_publishes_offline() {
        let handle = SyncEngine::builder()
            .with_config(config())
            .with_local_store(Arc::new(MemoryLocalStore::new()))
            .with_remote_store(Arc::new(MemoryRemote::new()))
            .initially_online(false)
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        assert_eq!(handle.status().status, tally_core::SyncStatus::Offline);
        handle.shutdown().await.unwrap();
        assert!(handle.trigger_sync().await.is_err());
    }
}
