//! # WebSocket Remote Store
//!
//! [`RemoteStore`] over a WebSocket connection, with automatic reconnection
//! and backoff.
//!
//! ## Connection Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    WebSocket Connection States                          │
//! │                                                                         │
//! │  ┌────────────┐    connect()    ┌────────────┐                         │
//! │  │Disconnected│ ──────────────► │ Connecting │                         │
//! │  └────────────┘                 └─────┬──────┘                         │
//! │        ▲                              │                                 │
//! │        │                    success   │   failure                       │
//! │        │                        ┌─────┴─────┐                          │
//! │        │                        ▼           ▼                           │
//! │        │              ┌────────────┐  ┌────────────┐                   │
//! │        │              │ Connected  │  │ Backoff    │                   │
//! │        │              └─────┬──────┘  └─────┬──────┘                   │
//! │        │                    │               │                           │
//! │        │              disconnect/error      │  timer expired            │
//! │        │                    ▼               │                           │
//! │        │              ┌────────────┐        │                           │
//! │        └───────────── │Reconnecting│ ◄──────┘                          │
//! │                       └────────────┘                                    │
//! │                                                                         │
//! │  While not connected, commits and subscribes fail fast with            │
//! │  `Disconnected` (transient). On disconnect every in-flight commit       │
//! │  fails and every open subscription ends with `SubscriptionDropped`.     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Request/response pairing uses `requestId` (commits) and `subscriptionId`
//! (change feeds). The socket task owns both maps; callers talk to it over
//! an mpsc command channel and wait on oneshot replies.

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures_util::stream::{SplitSink, Stream};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::time::timeout;
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tally_core::SyncTable;

use super::{ChangeEvent, ChangeStream, Cursor, RemoteStore, RemoteWrite, WriteResult};
use crate::config::SyncConfig;
use crate::error::{ErrorClass, SyncError, SyncResult};
use crate::protocol::{
    class_for_code, AuthenticatePayload, ChangePayload, CommitAckPayload, CommitPayload,
    SubscribePayload, SubscriptionErrorPayload, SyncMessage, PROTOCOL_VERSION,
};
use crate::session::SessionIdentity;

// =============================================================================
// Connection State
// =============================================================================

/// Connection state for the WebSocket remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting before reconnection attempt.
    Backoff,
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Backoff => write!(f, "backoff"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for [`WsRemote`].
#[derive(Debug, Clone)]
pub struct WsRemoteConfig {
    /// WebSocket URL of the remote store (`ws://` or `wss://`).
    pub url: String,

    pub device_id: String,

    pub device_name: String,

    pub connect_timeout: Duration,

    pub initial_backoff: Duration,

    pub max_backoff: Duration,

    /// Ping interval for keepalive. Abandoned commit slots are pruned on the
    /// same tick.
    pub ping_interval: Duration,

    /// Buffered change events per subscription before the feed is dropped
    /// and must be reopened from its cursor.
    pub subscription_buffer: usize,
}

impl Default for WsRemoteConfig {
    fn default() -> Self {
        WsRemoteConfig {
            url: String::new(),
            device_id: String::new(),
            device_name: String::new(),
            connect_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
            ping_interval: Duration::from_secs(30),
            subscription_buffer: 1024,
        }
    }
}

impl WsRemoteConfig {
    /// Derives the connection settings from the engine configuration.
    pub fn from_sync_config(config: &SyncConfig) -> SyncResult<Self> {
        let url = config
            .remote_url()
            .ok_or_else(|| SyncError::InvalidConfig("remote_url is not set".into()))?;
        Ok(WsRemoteConfig {
            url: url.to_string(),
            device_id: config.device_id().to_string(),
            device_name: config.device.name.clone(),
            initial_backoff: config.initial_backoff(),
            max_backoff: config.max_backoff(),
            ..Default::default()
        })
    }
}

// =============================================================================
// Commands
// =============================================================================

type Reply<T> = oneshot::Sender<SyncResult<T>>;

/// Type alias for the WebSocket write half.
type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

enum Command {
    Commit {
        writes: Vec<RemoteWrite>,
        reply: Reply<Vec<WriteResult>>,
    },
    Subscribe {
        subscription_id: String,
        table: SyncTable,
        cursor: Option<Cursor>,
        events: mpsc::Sender<SyncResult<ChangeEvent>>,
        reply: Reply<()>,
    },
    Unsubscribe {
        subscription_id: String,
    },
}

// =============================================================================
// WebSocket Remote Handle
// =============================================================================

/// Remote store reached over WebSocket.
///
/// ## Usage
/// ```rust,ignore
/// let remote = WsRemote::connect(WsRemoteConfig::from_sync_config(&config)?);
/// let engine = SyncEngine::builder()
///     .with_config(config)
///     .with_database(db)
///     .with_remote_store(Arc::new(remote))
///     .build()?;
/// ```
pub struct WsRemote {
    commands: mpsc::Sender<Command>,
    /// Identity sent with every Hello; changes go out as `Authenticate`.
    identity: watch::Sender<Option<SessionIdentity>>,
    subscription_buffer: usize,
    state: Arc<RwLock<ConnectionState>>,
    shutdown_tx: mpsc::Sender<()>,
}

impl WsRemote {
    /// Spawns the socket task and returns a handle to it. Dropping the handle
    /// stops the task.
    pub fn connect(config: WsRemoteConfig) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel::<Command>(100);
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let state = Arc::new(RwLock::new(ConnectionState::Disconnected));
        let subscription_buffer = config.subscription_buffer.max(1);
        let (identity_tx, identity_rx) = watch::channel(None);

        let connection = Connection {
            config,
            state: state.clone(),
            commands: commands_rx,
            shutdown_rx,
            identity: identity_rx,
            pending: HashMap::new(),
            subscriptions: HashMap::new(),
        };
        tokio::spawn(connection.run());

        WsRemote {
            commands: commands_tx,
            identity: identity_tx,
            subscription_buffer,
            state,
            shutdown_tx,
        }
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn is_connected(&self) -> bool {
        *self.state.read().await == ConnectionState::Connected
    }

    /// Triggers graceful shutdown.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| SyncError::ChannelError("Failed to send shutdown signal".into()))
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> SyncResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(command(reply_tx))
            .await
            .map_err(|_| SyncError::ShuttingDown)?;
        reply_rx.await.map_err(|_| SyncError::Disconnected)?
    }
}

#[async_trait]
impl RemoteStore for WsRemote {
    /// Never waits on the socket: the identity is picked up by the next
    /// Hello, or sent right away on an open connection.
    async fn set_identity(&self, identity: Option<SessionIdentity>) -> SyncResult<()> {
        self.identity.send_replace(identity);
        Ok(())
    }

    async fn subscribe(&self, table: SyncTable, since: Option<Cursor>) -> SyncResult<ChangeStream> {
        let subscription_id = Uuid::new_v4().to_string();
        let (events_tx, events_rx) = mpsc::channel(self.subscription_buffer);

        self.request(|reply| Command::Subscribe {
            subscription_id: subscription_id.clone(),
            table,
            cursor: since,
            events: events_tx,
            reply,
        })
        .await?;

        Ok(Box::pin(Subscription {
            events: ReceiverStream::new(events_rx),
            subscription_id,
            commands: self.commands.clone(),
        }))
    }

    async fn commit_batch(&self, writes: Vec<RemoteWrite>) -> SyncResult<Vec<WriteResult>> {
        if writes.is_empty() {
            return Ok(Vec::new());
        }
        self.request(|reply| Command::Commit { writes, reply }).await
    }
}

/// Change feed handed to a listener. Dropping it unsubscribes.
struct Subscription {
    events: ReceiverStream<SyncResult<ChangeEvent>>,
    subscription_id: String,
    commands: mpsc::Sender<Command>,
}

impl Stream for Subscription {
    type Item = SyncResult<ChangeEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_next_unpin(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.commands.try_send(Command::Unsubscribe {
            subscription_id: std::mem::take(&mut self.subscription_id),
        });
    }
}

// =============================================================================
// Socket Task
// =============================================================================

struct ActiveSubscription {
    table: SyncTable,
    events: mpsc::Sender<SyncResult<ChangeEvent>>,
}

struct Connection {
    config: WsRemoteConfig,
    state: Arc<RwLock<ConnectionState>>,
    commands: mpsc::Receiver<Command>,
    shutdown_rx: mpsc::Receiver<()>,
    identity: watch::Receiver<Option<SessionIdentity>>,
    pending: HashMap<String, Reply<Vec<WriteResult>>>,
    subscriptions: HashMap<String, ActiveSubscription>,
}

/// How a connection ended.
enum Exit {
    Shutdown,
    Lost,
}

impl Connection {
    async fn run(mut self) {
        info!(url = %self.config.url, "WebSocket remote starting");

        let mut backoff = self.create_backoff();

        'outer: loop {
            *self.state.write().await = ConnectionState::Connecting;

            match self.connect_with_timeout().await {
                Ok(ws_stream) => {
                    info!("WebSocket connected");
                    *self.state.write().await = ConnectionState::Connected;
                    backoff.reset();

                    let exit = match self.connection_loop(ws_stream).await {
                        Ok(exit) => exit,
                        Err(e) => {
                            warn!(?e, "Connection loop ended");
                            Exit::Lost
                        }
                    };
                    self.fail_in_flight("connection lost");
                    if matches!(exit, Exit::Shutdown) {
                        break;
                    }
                }
                Err(e) => {
                    error!(?e, "Failed to connect");
                }
            }

            *self.state.write().await = ConnectionState::Backoff;

            let Some(duration) = backoff.next_backoff() else {
                error!("Backoff exhausted");
                break;
            };
            debug!(?duration, "Waiting before reconnect");

            let sleep = tokio::time::sleep(duration);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => {
                        *self.state.write().await = ConnectionState::Reconnecting;
                        break;
                    }
                    _ = self.shutdown_rx.recv() => {
                        info!("Shutdown during backoff");
                        break 'outer;
                    }
                    Some(command) = self.commands.recv() => {
                        self.handle_offline(command);
                    }
                }
            }
        }

        self.fail_in_flight("remote store stopped");
        *self.state.write().await = ConnectionState::Disconnected;
        info!("WebSocket remote stopped");
    }

    async fn connect_with_timeout(
        &self,
    ) -> SyncResult<WebSocketStream<MaybeTlsStream<TcpStream>>> {
        let connect_future = connect_async(&self.config.url);

        match timeout(self.config.connect_timeout, connect_future).await {
            Ok(Ok((ws_stream, response))) => {
                debug!(status = ?response.status(), "WebSocket handshake complete");
                Ok(ws_stream)
            }
            Ok(Err(e)) => Err(SyncError::from(e)),
            Err(_) => Err(SyncError::Timeout(self.config.connect_timeout)),
        }
    }

    async fn connection_loop(
        &mut self,
        ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    ) -> SyncResult<Exit> {
        let (mut write, mut read) = ws_stream.split();

        let hello = SyncMessage::hello(
            &self.config.device_id,
            &self.config.device_name,
            self.identity.borrow_and_update().clone(),
        );
        send(&mut write, &hello).await?;

        let mut ping_interval = tokio::time::interval(self.config.ping_interval);
        ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                // an identity change goes out before requests queued after it
                biased;

                Ok(()) = self.identity.changed() => {
                    let identity = self.identity.borrow_and_update().clone();
                    debug!(user = ?identity.as_ref().map(|i| i.user_id.as_str()), "Sending new identity");
                    send(&mut write, &SyncMessage::Authenticate(AuthenticatePayload { identity })).await?;
                }

                Some(command) = self.commands.recv() => {
                    self.handle_command(command, &mut write).await?;
                }

                frame = read.next() => {
                    let Some(frame) = frame else {
                        info!("WebSocket stream ended");
                        return Ok(Exit::Lost);
                    };
                    match frame {
                        Ok(WsMessage::Text(text)) => match SyncMessage::from_json(&text) {
                            Ok(msg) => {
                                debug!(msg_type = %msg.type_name(), "Received message");
                                self.handle_message(msg, &mut write).await?;
                            }
                            Err(e) => {
                                warn!(?e, "Failed to parse message");
                            }
                        },
                        Ok(WsMessage::Ping(data)) => {
                            write.send(WsMessage::Pong(data)).await?;
                        }
                        Ok(WsMessage::Pong(_)) => {
                            debug!("Received pong");
                        }
                        Ok(WsMessage::Close(frame)) => {
                            info!(?frame, "Received close frame");
                            return Ok(Exit::Lost);
                        }
                        Ok(WsMessage::Binary(_)) => {
                            warn!("Received unexpected binary message");
                        }
                        Ok(WsMessage::Frame(_)) => {}
                        Err(e) => {
                            error!(?e, "WebSocket error");
                            return Err(SyncError::from(e));
                        }
                    }
                }

                _ = ping_interval.tick() => {
                    write.send(WsMessage::Ping(vec![].into())).await?;
                    self.pending.retain(|_, reply| !reply.is_closed());
                }

                _ = self.shutdown_rx.recv() => {
                    info!("Shutdown signal received, closing connection");
                    let _ = write.send(WsMessage::Close(None)).await;
                    return Ok(Exit::Shutdown);
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command, write: &mut WsSink) -> SyncResult<()> {
        match command {
            Command::Commit { writes, reply } => {
                let request_id = Uuid::new_v4().to_string();
                let count = writes.len();
                let msg = SyncMessage::Commit(CommitPayload {
                    request_id: request_id.clone(),
                    writes,
                });
                if let Err(e) = send(write, &msg).await {
                    let _ = reply.send(Err(SyncError::Disconnected));
                    return Err(e);
                }
                debug!(%request_id, count, "Commit sent");
                self.pending.insert(request_id, reply);
            }
            Command::Subscribe {
                subscription_id,
                table,
                cursor,
                events,
                reply,
            } => {
                let msg = SyncMessage::Subscribe(SubscribePayload {
                    subscription_id: subscription_id.clone(),
                    table,
                    cursor,
                });
                if let Err(e) = send(write, &msg).await {
                    let _ = reply.send(Err(SyncError::Disconnected));
                    return Err(e);
                }
                self.subscriptions
                    .insert(subscription_id, ActiveSubscription { table, events });
                let _ = reply.send(Ok(()));
            }
            Command::Unsubscribe { subscription_id } => {
                if self.subscriptions.remove(&subscription_id).is_some() {
                    send(write, &SyncMessage::Unsubscribe { subscription_id }).await?;
                }
            }
        }
        Ok(())
    }

    fn handle_offline(&mut self, command: Command) {
        match command {
            Command::Commit { reply, .. } => {
                let _ = reply.send(Err(SyncError::Disconnected));
            }
            Command::Subscribe { reply, .. } => {
                let _ = reply.send(Err(SyncError::Disconnected));
            }
            Command::Unsubscribe { subscription_id } => {
                self.subscriptions.remove(&subscription_id);
            }
        }
    }

    async fn handle_message(&mut self, msg: SyncMessage, write: &mut WsSink) -> SyncResult<()> {
        match msg {
            SyncMessage::Welcome(welcome) => {
                if welcome.protocol_version != PROTOCOL_VERSION {
                    return Err(SyncError::UnsupportedVersion(welcome.protocol_version));
                }
                info!(server_time = %welcome.server_time, "Remote store accepted connection");
            }
            SyncMessage::CommitAck(CommitAckPayload {
                request_id,
                results,
            }) => match self.pending.remove(&request_id) {
                Some(reply) => {
                    let _ = reply.send(Ok(results));
                }
                None => debug!(%request_id, "Ack for abandoned commit"),
            },
            SyncMessage::Change(ChangePayload {
                subscription_id,
                event,
            }) => self.deliver(&subscription_id, event, write).await?,
            SyncMessage::SubscriptionError(SubscriptionErrorPayload {
                subscription_id,
                class,
                message,
            }) => {
                if let Some(sub) = self.subscriptions.remove(&subscription_id) {
                    let err = match class {
                        ErrorClass::Listener => SyncError::SubscriptionDropped {
                            table: sub.table,
                            reason: message,
                        },
                        other => SyncError::from_class(other, message),
                    };
                    let _ = sub.events.try_send(Err(err));
                }
            }
            SyncMessage::Error {
                code,
                message,
                request_id,
            } => {
                let class = class_for_code(&code);
                match request_id.and_then(|id| self.pending.remove(&id)) {
                    Some(reply) => {
                        let _ = reply.send(Err(SyncError::from_class(class, message)));
                    }
                    None if class == ErrorClass::Authentication => {
                        warn!(%message, "Remote store rejected the session identity");
                        self.fail_all(
                            || SyncError::Unauthenticated(message.clone()),
                            |_| SyncError::Unauthenticated(message.clone()),
                        );
                    }
                    None => warn!(%code, %message, "Remote store error"),
                }
            }
            SyncMessage::Ping { timestamp } => {
                send(write, &SyncMessage::pong(&timestamp)).await?;
            }
            SyncMessage::Pong { .. } => {}
            other => {
                warn!(msg_type = %other.type_name(), "Unexpected message from remote store");
            }
        }
        Ok(())
    }

    /// Forwards a change to its listener. A listener that cannot keep up
    /// loses the feed and resubscribes from its cursor.
    async fn deliver(
        &mut self,
        subscription_id: &str,
        event: ChangeEvent,
        write: &mut WsSink,
    ) -> SyncResult<()> {
        let Some(sub) = self.subscriptions.get(subscription_id) else {
            return Ok(());
        };
        if sub.events.try_send(Ok(event)).is_err() {
            debug!(table = %sub.table, %subscription_id, "Listener fell behind, dropping feed");
            self.subscriptions.remove(subscription_id);
            send(
                write,
                &SyncMessage::Unsubscribe {
                    subscription_id: subscription_id.to_string(),
                },
            )
            .await?;
        }
        Ok(())
    }

    fn fail_in_flight(&mut self, reason: &str) {
        self.fail_all(
            || SyncError::Disconnected,
            |table| SyncError::SubscriptionDropped {
                table,
                reason: reason.to_string(),
            },
        );
    }

    /// Fails every pending commit and ends every open subscription.
    fn fail_all(
        &mut self,
        commit_err: impl Fn() -> SyncError,
        feed_err: impl Fn(SyncTable) -> SyncError,
    ) {
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(commit_err()));
        }
        for (_, sub) in self.subscriptions.drain() {
            let _ = sub.events.try_send(Err(feed_err(sub.table)));
        }
    }

    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.config.initial_backoff,
            max_interval: self.config.max_backoff,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

async fn send(write: &mut WsSink, msg: &SyncMessage) -> SyncResult<()> {
    let json = msg.to_json()?;
    debug!(msg_type = %msg.type_name(), "Sending message");
    write.send(WsMessage::Text(json.into())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tally_core::WireDocument;
    use tokio::net::TcpListener;

    use crate::protocol::{codes, WelcomePayload};
    use crate::remote::Change;

    /// Minimal remote store speaking the sync protocol.
    async fn spawn_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream));
            }
        });
        format!("ws://{addr}")
    }

    async fn serve(stream: TcpStream) {
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        while let Some(Ok(frame)) = ws.next().await {
            let WsMessage::Text(text) = frame else {
                continue;
            };
            let replies = match SyncMessage::from_json(&text).unwrap() {
                SyncMessage::Hello(_) => vec![SyncMessage::Welcome(WelcomePayload {
                    server_time: chrono::Utc::now().to_rfc3339(),
                    protocol_version: PROTOCOL_VERSION,
                })],
                SyncMessage::Commit(commit) => {
                    let results = commit
                        .writes
                        .iter()
                        .map(|w| {
                            if w.document.contains_key("reject") {
                                WriteResult::Rejected {
                                    class: ErrorClass::Permanent,
                                    message: "invalid document".into(),
                                }
                            } else {
                                WriteResult::Committed {
                                    remote_id: format!("r-{}", w.key),
                                }
                            }
                        })
                        .collect();
                    vec![SyncMessage::CommitAck(CommitAckPayload {
                        request_id: commit.request_id,
                        results,
                    })]
                }
                SyncMessage::Subscribe(sub) => {
                    let mut document = WireDocument::new();
                    document.insert("_updated_at".into(), json!("2026-01-01T00:00:00Z"));
                    vec![SyncMessage::Change(ChangePayload {
                        subscription_id: sub.subscription_id,
                        event: ChangeEvent {
                            table: sub.table,
                            cursor: sub.cursor.unwrap_or(0) + 1,
                            has_pending_writes: false,
                            change: Change::Upsert {
                                key: "r-9".into(),
                                document,
                            },
                        },
                    })]
                }
                SyncMessage::Authenticate(auth) => match auth.identity {
                    Some(identity) if identity.user_id == "revoked" => {
                        vec![SyncMessage::error(codes::UNAUTHENTICATED, "session revoked", None)]
                    }
                    _ => vec![],
                },
                _ => vec![],
            };
            for reply in replies {
                let json = reply.to_json().unwrap();
                if ws.send(WsMessage::Text(json.into())).await.is_err() {
                    return;
                }
            }
        }
    }

    async fn connected_remote(url: String) -> WsRemote {
        let remote = WsRemote::connect(WsRemoteConfig {
            url,
            device_id: "till-01".into(),
            ..Default::default()
        });
        for _ in 0..200 {
            if remote.is_connected().await {
                return remote;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("remote never connected");
    }

    fn write(key: &str, document: serde_json::Value) -> RemoteWrite {
        RemoteWrite {
            table: SyncTable::Products,
            key: key.into(),
            document: document.as_object().cloned().unwrap(),
        }
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(ConnectionState::Backoff.to_string(), "backoff");
    }

    #[test]
    fn test_config_default() {
        let config = WsRemoteConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.subscription_buffer, 1024);
    }

    #[tokio::test]
    async fn test_commit_round_trip() {
        let remote = connected_remote(spawn_server().await).await;

        let results = remote
            .commit_batch(vec![
                write("p-1", json!({ "name": "Chai" })),
                write("p-2", json!({ "reject": true })),
            ])
            .await
            .unwrap();

        assert_eq!(
            results[0],
            WriteResult::Committed {
                remote_id: "r-p-1".into()
            }
        );
        assert!(matches!(
            results[1],
            WriteResult::Rejected { class: ErrorClass::Permanent, .. }
        ));
        remote.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_resumes_after_cursor() {
        let remote = connected_remote(spawn_server().await).await;

        let mut feed = remote.subscribe(SyncTable::Products, Some(41)).await.unwrap();
        let event = feed.next().await.unwrap().unwrap();
        assert_eq!(event.cursor, 42);
        assert_eq!(event.change.key(), "r-9");
    }

    #[tokio::test]
    async fn test_revoked_identity_ends_feeds() {
        let remote = connected_remote(spawn_server().await).await;
        let mut feed = remote.subscribe(SyncTable::Sales, None).await.unwrap();
        feed.next().await.unwrap().unwrap();

        remote
            .set_identity(Some(SessionIdentity::new("revoked")))
            .await
            .unwrap();

        let err = feed.next().await.unwrap().unwrap_err();
        assert!(err.is_auth_error());
    }

    #[tokio::test]
    async fn test_commit_while_unreachable_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let remote = WsRemote::connect(WsRemoteConfig {
            url: format!("ws://{addr}"),
            ..Default::default()
        });
        let err = remote
            .commit_batch(vec![write("p-1", json!({}))])
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Transient);
    }

    #[tokio::test]
    async fn test_set_identity_does_not_wait_for_connect() {
        // accepts TCP but never completes the WebSocket handshake
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let remote = WsRemote::connect(WsRemoteConfig {
            url: format!("ws://{addr}"),
            connect_timeout: Duration::from_secs(30),
            ..Default::default()
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(remote.state().await, ConnectionState::Connecting);

        let result = tokio::time::timeout(
            Duration::from_millis(500),
            remote.set_identity(Some(SessionIdentity::new("cashier-7"))),
        )
        .await;
        assert!(matches!(result, Ok(Ok(()))));
        drop(listener);
    }
}
