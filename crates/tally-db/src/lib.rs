//! # tally-db: Local Store for Tally POS
//!
//! SQLite-backed persistence for [`SyncRecord`](tally_core::SyncRecord)s.
//! The sync engine only ever touches the `sync_state`, `remote_id`, `origin`
//! and `updated_at` bookkeeping columns; the payload is opaque JSON.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  tally-sync (LocalStore impl)                                          │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     tally-db (THIS CRATE)                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌────────────────┐    ┌──────────────┐  │   │
//! │  │   │   Database    │    │ RecordRepo     │    │  Migrations  │  │   │
//! │  │   │   (pool.rs)   │◄───│ get / upsert   │    │  (embedded)  │  │   │
//! │  │   │  SqlitePool   │    │ list_unsynced  │    │ 001_sync_... │  │   │
//! │  │   └───────────────┘    └────────────────┘    └──────────────┘  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite file (WAL mode)                                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tally_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("tally.db")).await?;
//! let pending = db.records().list_unsynced(SyncTable::Sales).await?;
//! ```

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};
pub use repository::records::RecordRepository;
