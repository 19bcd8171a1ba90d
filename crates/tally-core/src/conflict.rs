//! # Conflict Resolution
//!
//! Last-write-wins on `updated_at`. When both sides carry the same stamp the
//! local copy is kept.
//!
//! ```text
//!  local.updated_at    incoming.updated_at    result
//!  ────────────────    ───────────────────    ──────────
//!  (no local row)      any                    ApplyRemote
//!  T1                  T0 <= T1               KeepLocal
//!  T1                  T2 >  T1               ApplyRemote
//! ```

use chrono::{DateTime, Utc};

/// Outcome of comparing an inbound change against the local row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    ApplyRemote,
    KeepLocal,
}

/// Decides whether an inbound change replaces the local row.
pub fn resolve_inbound(
    local_updated_at: Option<DateTime<Utc>>,
    incoming_updated_at: DateTime<Utc>,
) -> Resolution {
    match local_updated_at {
        Some(local) if incoming_updated_at <= local => Resolution::KeepLocal,
        _ => Resolution::ApplyRemote,
    }
}

/// Outcome of applying a write acknowledgement to the current local row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDisposition {
    /// The row is still the version that was transmitted.
    MarkSynced,
    /// The row was edited while the batch was in flight; only the remote id
    /// may be recorded, the newer edit stays queued.
    KeepNewerLocal,
}

pub fn resolve_ack(
    current_updated_at: DateTime<Utc>,
    transmitted_updated_at: DateTime<Utc>,
) -> AckDisposition {
    if current_updated_at > transmitted_updated_at {
        AckDisposition::KeepNewerLocal
    } else {
        AckDisposition::MarkSynced
    }
}
