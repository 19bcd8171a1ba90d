//! # Sync Error Types
//!
//! Every failure the engine can see, plus the classification that decides
//! what happens next.
//!
//! ## Error Classes
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  ErrorClass       Examples                      Engine reaction         │
//! │  ───────────────  ────────────────────────────  ─────────────────────── │
//! │  Transient        timeout, disconnect,          failed + requeue,       │
//! │                   temporary reject              bounded attempts        │
//! │  Permanent        malformed payload,            failed, surfaced,       │
//! │                   validation reject             not requeued            │
//! │  Authentication   identity rejected             status=error (blocked), │
//! │                                                 all activity suspended  │
//! │  Listener         subscription dropped          resubscribe that table  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use tally_core::SyncTable;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// How the engine reacts to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transient,
    Permanent,
    Authentication,
    Listener,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::Permanent => write!(f, "permanent"),
            ErrorClass::Authentication => write!(f, "authentication"),
            ErrorClass::Listener => write!(f, "listener"),
        }
    }
}

/// Sync error type covering all possible sync failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    #[error("Device ID not configured. Run initial setup first.")]
    MissingDeviceId,

    #[error("Invalid remote URL: {0}")]
    InvalidUrl(String),

    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Disconnected from remote store")]
    Disconnected,

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u32),

    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    // =========================================================================
    // Remote Store Errors
    // =========================================================================
    /// The remote store could not take the write right now.
    #[error("Remote store unavailable: {0}")]
    Unavailable(String),

    /// The remote store refused the write for good.
    #[error("Rejected by remote store: {0}")]
    Rejected(String),

    /// The session identity was refused or has expired.
    #[error("Authentication rejected: {0}")]
    Unauthenticated(String),

    /// No session identity has been set.
    #[error("No active session")]
    NoSession,

    /// A collection subscription ended unexpectedly.
    #[error("Subscription to {table} dropped: {reason}")]
    SubscriptionDropped { table: SyncTable, reason: String },

    // =========================================================================
    // Local Errors
    // =========================================================================
    #[error("Local store error: {0}")]
    LocalStore(String),

    #[error("Record error: {0}")]
    Record(#[from] tally_core::CoreError),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Sync engine is shutting down")]
    ShuttingDown,

    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<tally_db::DbError> for SyncError {
    fn from(err: tally_db::DbError) -> Self {
        SyncError::LocalStore(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => SyncError::Disconnected,
            WsError::Protocol(p) => SyncError::WebSocketError(p.to_string()),
            WsError::Io(io) => SyncError::ConnectionFailed(io.to_string()),
            WsError::Tls(tls) => SyncError::TlsError(tls.to_string()),
            other => SyncError::WebSocketError(other.to_string()),
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl SyncError {
    /// Builds an error of the given class from a message received over the
    /// wire (commit rejections, subscription errors).
    ///
    /// A listener failure with no table attached is reported as the remote
    /// being unavailable, so it stays retryable.
    pub fn from_class(class: ErrorClass, message: impl Into<String>) -> Self {
        let message = message.into();
        match class {
            ErrorClass::Transient | ErrorClass::Listener => SyncError::Unavailable(message),
            ErrorClass::Permanent => SyncError::Rejected(message),
            ErrorClass::Authentication => SyncError::Unauthenticated(message),
        }
    }

    /// Classifies the error for retry handling.
    ///
    /// Local store failures count as transient: the write is retried on the
    /// next flush once the store recovers.
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::ConnectionFailed(_)
            | SyncError::Disconnected
            | SyncError::Timeout(_)
            | SyncError::WebSocketError(_)
            | SyncError::TlsError(_)
            | SyncError::Unavailable(_)
            | SyncError::LocalStore(_)
            | SyncError::ChannelError(_)
            | SyncError::ShuttingDown => ErrorClass::Transient,

            SyncError::Unauthenticated(_) | SyncError::NoSession => ErrorClass::Authentication,

            SyncError::SubscriptionDropped { .. } => ErrorClass::Listener,

            SyncError::InvalidConfig(_)
            | SyncError::MissingDeviceId
            | SyncError::InvalidUrl(_)
            | SyncError::ConfigLoadFailed(_)
            | SyncError::ConfigSaveFailed(_)
            | SyncError::InvalidMessage(_)
            | SyncError::UnsupportedVersion(_)
            | SyncError::SerializationFailed(_)
            | SyncError::Rejected(_)
            | SyncError::Record(_)
            | SyncError::Internal(_) => ErrorClass::Permanent,
        }
    }

    /// Returns true if the operation can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Transient | ErrorClass::Listener)
    }

    pub fn is_auth_error(&self) -> bool {
        self.class() == ErrorClass::Authentication
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::MissingDeviceId
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }
}
