//! # Sync Protocol Messages
//!
//! JSON messages exchanged with the remote store over WebSocket.
//!
//! ## Message Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │    Terminal (WsRemote)                          Remote store            │
//! │                                                                         │
//! │  ── Hello {deviceId, identity, protocolVersion} ──►                    │
//! │  ◄───────────── Welcome {serverTime, protocolVersion} ──               │
//! │                                                                         │
//! │  ── Subscribe {subscriptionId, table, cursor} ────►                    │
//! │  ◄──────────────────── Change {subscriptionId, event} ─  (repeated)    │
//! │                                                                         │
//! │  ── Commit {requestId, writes[≤500]} ─────────────►                    │
//! │  ◄─────────────────── CommitAck {requestId, results} ──                │
//! │                                                                         │
//! │  ── Authenticate {identity} ──────────────────────►  (identity change) │
//! │  ◄────────── Error {code: "UNAUTHENTICATED", ...} ──  (on rejection)   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Serialization
//! Adjacently tagged: `{ "type": "Commit", "payload": { ... } }`.

use serde::{Deserialize, Serialize};

use tally_core::SyncTable;

use crate::error::ErrorClass;
use crate::remote::{ChangeEvent, Cursor, RemoteWrite, WriteResult};
use crate::session::SessionIdentity;

/// Current protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Error codes carried by [`SyncMessage::Error`].
pub mod codes {
    pub const UNAUTHENTICATED: &str = "UNAUTHENTICATED";
    pub const UNAVAILABLE: &str = "UNAVAILABLE";
    pub const REJECTED: &str = "REJECTED";
    pub const BAD_REQUEST: &str = "BAD_REQUEST";
}

/// All message types in the sync protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum SyncMessage {
    // =========================================================================
    // Connection Lifecycle
    // =========================================================================
    Hello(HelloPayload),

    Welcome(WelcomePayload),

    /// Replaces the identity of an open connection.
    Authenticate(AuthenticatePayload),

    // =========================================================================
    // Writes
    // =========================================================================
    Commit(CommitPayload),

    CommitAck(CommitAckPayload),

    // =========================================================================
    // Change Feeds
    // =========================================================================
    Subscribe(SubscribePayload),

    #[serde(rename_all = "camelCase")]
    Unsubscribe { subscription_id: String },

    Change(ChangePayload),

    SubscriptionError(SubscriptionErrorPayload),

    // =========================================================================
    // Keepalive & Errors
    // =========================================================================
    Ping { timestamp: String },

    Pong {
        ping_timestamp: String,
        pong_timestamp: String,
    },

    #[serde(rename_all = "camelCase")]
    Error {
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloPayload {
    pub device_id: String,
    pub device_name: String,
    #[serde(default)]
    pub identity: Option<SessionIdentity>,
    pub protocol_version: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WelcomePayload {
    pub server_time: String,
    pub protocol_version: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatePayload {
    pub identity: Option<SessionIdentity>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitPayload {
    pub request_id: String,
    pub writes: Vec<RemoteWrite>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitAckPayload {
    pub request_id: String,
    pub results: Vec<WriteResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribePayload {
    pub subscription_id: String,
    pub table: SyncTable,
    #[serde(default)]
    pub cursor: Option<Cursor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePayload {
    pub subscription_id: String,
    pub event: ChangeEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionErrorPayload {
    pub subscription_id: String,
    pub class: ErrorClass,
    pub message: String,
}

// =============================================================================
// Helper Functions
// =============================================================================

impl SyncMessage {
    /// Returns the message type name (for logging).
    pub fn type_name(&self) -> &'static str {
        match self {
            SyncMessage::Hello(_) => "Hello",
            SyncMessage::Welcome(_) => "Welcome",
            SyncMessage::Authenticate(_) => "Authenticate",
            SyncMessage::Commit(_) => "Commit",
            SyncMessage::CommitAck(_) => "CommitAck",
            SyncMessage::Subscribe(_) => "Subscribe",
            SyncMessage::Unsubscribe { .. } => "Unsubscribe",
            SyncMessage::Change(_) => "Change",
            SyncMessage::SubscriptionError(_) => "SubscriptionError",
            SyncMessage::Ping { .. } => "Ping",
            SyncMessage::Pong { .. } => "Pong",
            SyncMessage::Error { .. } => "Error",
        }
    }

    pub fn hello(device_id: &str, device_name: &str, identity: Option<SessionIdentity>) -> Self {
        SyncMessage::Hello(HelloPayload {
            device_id: device_id.to_string(),
            device_name: device_name.to_string(),
            identity,
            protocol_version: PROTOCOL_VERSION,
        })
    }

    pub fn ping() -> Self {
        SyncMessage::Ping {
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn pong(ping_timestamp: &str) -> Self {
        SyncMessage::Pong {
            ping_timestamp: ping_timestamp.to_string(),
            pong_timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(code: &str, message: &str, request_id: Option<String>) -> Self {
        SyncMessage::Error {
            code: code.to_string(),
            message: message.to_string(),
            request_id,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Maps a protocol error code to the engine's error class.
pub fn class_for_code(code: &str) -> ErrorClass {
    match code {
        codes::UNAUTHENTICATED => ErrorClass::Authentication,
        codes::UNAVAILABLE => ErrorClass::Transient,
        _ => ErrorClass::Permanent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::Change;
    use tally_core::WireDocument;

    #[test]
    fn test_message_serialization() {
        let hello = SyncMessage::hello("till-01", "Register 1", Some(SessionIdentity::new("cashier-7")));
        let json = hello.to_json().unwrap();
        assert!(json.contains("\"type\":\"Hello\""));
        assert!(json.contains("\"deviceId\":\"till-01\""));
        assert!(json.contains("cashier-7"));

        let parsed = SyncMessage::from_json(&json).unwrap();
        assert_eq!(parsed, hello);
    }

    #[test]
    fn test_change_message() {
        let msg = SyncMessage::Change(ChangePayload {
            subscription_id: "sub-1".into(),
            event: ChangeEvent {
                table: SyncTable::Products,
                cursor: 12,
                has_pending_writes: false,
                change: Change::Upsert {
                    key: "r-1".into(),
                    document: WireDocument::new(),
                },
            },
        });
        let json = msg.to_json().unwrap();
        assert!(json.contains("\"subscriptionId\":\"sub-1\""));
        assert!(json.contains("\"table\":\"products\""));
        assert_eq!(msg.type_name(), "Change");
        assert_eq!(SyncMessage::from_json(&json).unwrap(), msg);
    }

    #[test]
    fn test_unsubscribe_field_names() {
        let json = SyncMessage::Unsubscribe {
            subscription_id: "sub-9".into(),
        }
        .to_json()
        .unwrap();
        assert_eq!(
            json,
            r#"{"type":"Unsubscribe","payload":{"subscriptionId":"sub-9"}}"#
        );
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(class_for_code(codes::UNAUTHENTICATED), ErrorClass::Authentication);
        assert_eq!(class_for_code(codes::UNAVAILABLE), ErrorClass::Transient);
        assert_eq!(class_for_code(codes::REJECTED), ErrorClass::Permanent);

        let json = SyncMessage::error(codes::REJECTED, "bad", None).to_json().unwrap();
        assert!(!json.contains("requestId"));
    }
}
