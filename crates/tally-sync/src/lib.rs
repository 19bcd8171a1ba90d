//! # tally-sync: Sync Engine for Tally POS
//!
//! Keeps a terminal's local store consistent with a shared remote store
//! while tolerating intermittent connectivity. Every sale, product edit and
//! stock movement is written locally first and uploaded in the background;
//! changes made on other terminals arrive through per-table change feeds.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Engine Architecture                         │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                   SyncEngine (Orchestrator)                      │  │
//! │  │                                                                  │  │
//! │  │  Spawned as a Tokio task, driven through a SyncHandle            │  │
//! │  │  Owns the status machine and the session                         │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │ OutboundQueue  │  │  Transmitter   │  │  Reconciler            │    │
//! │  │                │  │                │  │                        │    │
//! │  │ One entry per  │  │ Chunked remote │  │ Writes ack results     │    │
//! │  │ record, newest │  │ commits, per-  │  │ back, retries or gives │    │
//! │  │ version wins   │  │ chunk failures │  │ up per record          │    │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘    │
//! │                                                                         │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │  SyncSession   │  │ Table listener │  │  RemoteStore           │    │
//! │  │                │  │                │  │                        │    │
//! │  │ Identity and   │─►│ Applies remote │◄─│ MemoryRemote (tests)   │    │
//! │  │ live listeners │  │ changes (LWW)  │  │ WsRemote (WebSocket)   │    │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘    │
//! │                                                                         │
//! │  STATUS (watch channel): idle │ syncing │ error │ offline               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`engine`] - `SyncEngine` orchestrator and its `SyncHandle`
//! - [`config`] - Sync configuration (device, remote URL, tuning)
//! - [`error`] - Sync error types and their classes
//! - [`store`] - Local store seam (SQLite and in-memory)
//! - [`remote`] - Remote store seam (in-memory and WebSocket)
//! - [`protocol`] - Message types of the WebSocket remote
//! - [`queue`] - Outbound queue
//! - [`transmitter`] - Chunked commits
//! - [`reconciler`] - Applies commit results to the local store
//! - [`listener`] - Inbound change listeners
//! - [`session`] - Session identity and listener lifetime
//! - [`machine`] - Status transitions
//! - [`status`] - Status watch channel
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tally_sync::{SessionIdentity, SyncConfig, SyncEngine, WsRemote, WsRemoteConfig};
//! use tally_db::{Database, DbConfig};
//!
//! let config = SyncConfig::load_or_default(None);
//! let remote = WsRemote::connect(WsRemoteConfig::from_sync_config(&config)?);
//!
//! let handle = SyncEngine::builder()
//!     .with_config(config)
//!     .with_database(Database::new(DbConfig::new("tally.db")).await?)
//!     .with_remote_store(Arc::new(remote))
//!     .with_identity(SessionIdentity::new("cashier-7"))
//!     .build()?
//!     .start()
//!     .await?;
//!
//! handle.record_local_change(sale).await?;
//! println!("Status: {}", handle.status().status);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod engine;
pub mod error;
pub mod listener;
pub mod machine;
pub mod protocol;
pub mod queue;
pub mod reconciler;
pub mod remote;
pub mod session;
pub mod status;
pub mod store;
pub mod transmitter;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::{DeviceConfig, StoreConfig, SyncConfig, SyncSettings};
pub use engine::{SyncEngine, SyncEngineBuilder, SyncHandle};
pub use error::{ErrorClass, SyncError, SyncResult};
pub use listener::ListenerEvent;
pub use protocol::SyncMessage;
pub use queue::OutboundQueue;
pub use remote::ws::ConnectionState;
pub use remote::{
    Change, ChangeEvent, ChangeStream, CommitScript, Cursor, MemoryRemote, RemoteStore,
    RemoteWrite, WriteResult, WsRemote, WsRemoteConfig,
};
pub use session::SessionIdentity;
pub use store::{LocalStore, MemoryLocalStore};

pub use tally_core::{StatusSnapshot, SyncStatus};
