//! # Remote Store Seam
//!
//! The shared backend every terminal writes to and listens on.
//!
//! ```text
//! ┌───────────────┐  commit_batch(writes)   ┌──────────────────────────┐
//! │  Transmitter  │ ──────────────────────► │                          │
//! └───────────────┘ ◄────────────────────── │       RemoteStore        │
//!                     Vec<WriteResult>      │                          │
//! ┌───────────────┐  subscribe(table, since)│  MemoryRemote (in-proc)  │
//! │ TableListener │ ──────────────────────► │  WsRemote (WebSocket)    │
//! └───────────────┘ ◄────────────────────── │                          │
//!                     ChangeStream          └──────────────────────────┘
//! ```
//!
//! Writes have merge (upsert) semantics keyed by the remote id when known,
//! else by the local id. A commit either returns one result per write, in
//! order, or fails as a whole.

pub mod memory;
pub mod ws;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

use tally_core::{SyncTable, WireDocument};

use crate::error::{ErrorClass, SyncResult};
use crate::session::SessionIdentity;

pub use memory::{CommitScript, MemoryRemote};
pub use ws::{WsRemote, WsRemoteConfig};

/// Position in a table's change feed. Resubscribing with the last applied
/// cursor resumes after it.
pub type Cursor = u64;

/// Stream of change notifications for one table. An `Err` item means the
/// subscription is gone and must be reopened.
pub type ChangeStream = BoxStream<'static, SyncResult<ChangeEvent>>;

/// One document write inside a commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteWrite {
    pub table: SyncTable,
    /// Remote id if known, else local id.
    pub key: String,
    pub document: WireDocument,
}

/// Per-write outcome of a commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum WriteResult {
    Committed {
        #[serde(rename = "remoteId")]
        remote_id: String,
    },
    Rejected {
        class: ErrorClass,
        message: String,
    },
}

/// What happened to a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Change {
    Upsert {
        key: String,
        document: WireDocument,
    },
    Delete {
        key: String,
        #[serde(rename = "updatedAt")]
        updated_at: DateTime<Utc>,
    },
}

impl Change {
    pub fn key(&self) -> &str {
        match self {
            Change::Upsert { key, .. } | Change::Delete { key, .. } => key,
        }
    }
}

/// One notification from a table subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub table: SyncTable,
    pub cursor: Cursor,
    /// Set for latency-compensated notifications of writes the server has
    /// not acknowledged yet.
    pub has_pending_writes: bool,
    pub change: Change,
}

/// Remote backend used by the engine.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Switches the authenticated identity used for later calls.
    async fn set_identity(&self, identity: Option<SessionIdentity>) -> SyncResult<()>;

    /// Opens a change feed for `table`, replaying everything after `since`.
    async fn subscribe(&self, table: SyncTable, since: Option<Cursor>) -> SyncResult<ChangeStream>;

    /// Commits writes as one unit of transport.
    async fn commit_batch(&self, writes: Vec<RemoteWrite>) -> SyncResult<Vec<WriteResult>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_write_result_wire_shape() {
        let ok = WriteResult::Committed {
            remote_id: "r-1".into(),
        };
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({ "status": "committed", "remoteId": "r-1" })
        );

        let rejected: WriteResult = serde_json::from_value(json!({
            "status": "rejected",
            "class": "permanent",
            "message": "price must be positive"
        }))
        .unwrap();
        assert!(matches!(
            rejected,
            WriteResult::Rejected { class: ErrorClass::Permanent, .. }
        ));
    }

    #[test]
    fn test_change_event_wire_shape() {
        let event = ChangeEvent {
            table: SyncTable::Products,
            cursor: 7,
            has_pending_writes: false,
            change: Change::Upsert {
                key: "r-1".into(),
                document: WireDocument::new(),
            },
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["hasPendingWrites"], false);
        assert_eq!(value["change"]["kind"], "upsert");
        assert_eq!(event.change.key(), "r-1");
    }
}
