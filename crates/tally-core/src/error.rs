//! # Error Types
//!
//! Domain errors raised by the pure sync layer.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  tally-core   CoreError  - codec and record invariant violations       │
//! │  tally-db     DbError    - local store failures                        │
//! │  tally-sync   SyncError  - transport, remote, config, classification   │
//! │                                                                         │
//! │  Flow: CoreError → SyncError::Core (always permanent)                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Errors produced while building, encoding or decoding records.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Payload uses a field name reserved for sync bookkeeping.
    ///
    /// Reserved names start with `_` (`_id`, `_updated_at`, `_origin`, ...).
    #[error("Field '{field}' is reserved for sync metadata")]
    ReservedField { field: String },

    /// A remote document is missing or has an unreadable bookkeeping field.
    #[error("Malformed document {key}: {reason}")]
    MalformedDocument { key: String, reason: String },

    /// Attempt to overwrite a remote id that was already assigned.
    #[error("Record {key} already has remote id {existing}, refusing {assigned}")]
    RemoteIdConflict {
        key: String,
        existing: String,
        assigned: String,
    },

    /// Unknown collection name.
    #[error("Unknown table: {0}")]
    UnknownTable(String),

    /// Unknown sync state name.
    #[error("Unknown sync state: {0}")]
    UnknownState(String),

    /// Unknown origin marker.
    #[error("Unknown origin: {0}")]
    UnknownOrigin(String),
}

impl CoreError {
    pub fn malformed(key: impl Into<String>, reason: impl Into<String>) -> Self {
        CoreError::MalformedDocument {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = CoreError::ReservedField {
            field: "_id".to_string(),
        };
        assert_eq!(err.to_string(), "Field '_id' is reserved for sync metadata");

        let err = CoreError::malformed("abc", "missing _updated_at");
        assert_eq!(err.to_string(), "Malformed document abc: missing _updated_at");
    }
}
