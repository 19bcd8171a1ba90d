//! # tally-core: Pure Sync Types for Tally POS
//!
//! Everything the sync engine needs to reason about records without touching
//! a database or a socket.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Tally POS Sync Architecture                        │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                tally-sync (engine, queue, listeners)            │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ tally-core (THIS CRATE) ★                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │   codec   │  │ conflict  │  │   batch   │  │   │
//! │  │   │SyncRecord │  │  encode   │  │   LWW     │  │ChangeBatch│  │   │
//! │  │   │ SyncTable │  │  decode   │  │           │  │  chunks   │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    tally-db (local SQLite store)                │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - `SyncRecord`, `SyncTable`, `SyncState`, `Origin`
//! - [`codec`] - Conversion between records and remote wire documents
//! - [`conflict`] - Last-write-wins rule (ties favour the local copy)
//! - [`batch`] - `ChangeBatch` and transport-limit chunking
//! - [`status`] - Published sync status
//! - [`error`] - Domain error types

// =============================================================================
// Module Declarations
// =============================================================================

pub mod batch;
pub mod codec;
pub mod conflict;
pub mod error;
pub mod status;
pub mod types;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use batch::{ChangeBatch, DEFAULT_TRANSPORT_LIMIT};
pub use codec::WireDocument;
pub use error::{CoreError, CoreResult};
pub use status::{StatusSnapshot, SyncStatus};
pub use types::*;
