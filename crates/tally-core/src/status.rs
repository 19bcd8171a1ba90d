//! # Sync Status
//!
//! The value published to the UI whenever the engine changes state. Only the
//! latest snapshot matters; it is never persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use ts_rs::TS;

/// Coarse engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing,
    Error,
    Offline,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Error => "error",
            SyncStatus::Offline => "offline",
        };
        f.write_str(s)
    }
}

/// Published status value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub status: SyncStatus,
    /// Human-readable detail for `error` (and occasionally `syncing`).
    pub detail: Option<String>,
    /// True while an authentication error suspends all sync activity.
    pub blocked: bool,
    /// Records waiting in the outbound queue.
    pub pending_count: usize,
    #[ts(as = "Option<String>")]
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl StatusSnapshot {
    pub fn is_error(&self) -> bool {
        self.status == SyncStatus::Error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let snapshot = StatusSnapshot {
            status: SyncStatus::Syncing,
            pending_count: 3,
            ..Default::default()
        };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["status"], "syncing");
        assert_eq!(json["pendingCount"], 3);
        assert_eq!(json["blocked"], false);
    }
}
