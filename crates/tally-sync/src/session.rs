//! # Sync Session
//!
//! One authenticated connectivity window: the active identity plus one
//! listener task per synchronized table.
//!
//! ```text
//!   set_session_identity / online ──► SyncSession::open
//!                                        ├── listener(products)
//!                                        ├── listener(sales)
//!                                        └── ...
//!   identity change / offline ───────► SyncSession::close  (abort + await)
//! ```
//!
//! Dropping a session aborts its listeners; `close` additionally waits for
//! them, so no listener touches the local store after it returns.

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use tally_core::SyncTable;

use crate::listener::{self, ListenerContext};

/// Authenticated user the remote store sees.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionIdentity {
    pub user_id: String,
    /// Bearer token issued by the host's auth layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl SessionIdentity {
    pub fn new(user_id: impl Into<String>) -> Self {
        SessionIdentity {
            user_id: user_id.into(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

impl std::fmt::Debug for SessionIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionIdentity")
            .field("user_id", &self.user_id)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Open listeners under one identity.
pub struct SyncSession {
    identity: SessionIdentity,
    generation: u64,
    listeners: Vec<(SyncTable, JoinHandle<()>)>,
}

impl SyncSession {
    /// Spawns a listener for every table. The caller has already handed the
    /// identity to the remote store. Listeners report auth failures tagged
    /// with `generation`.
    pub(crate) fn open(
        identity: SessionIdentity,
        generation: u64,
        tables: &[SyncTable],
        ctx: &ListenerContext,
    ) -> Self {
        let ctx = ListenerContext {
            session: generation,
            ..ctx.clone()
        };
        let listeners = tables
            .iter()
            .map(|&table| (table, tokio::spawn(listener::run(ctx.clone(), table))))
            .collect::<Vec<_>>();

        info!(
            user = %identity.user_id,
            generation,
            tables = listeners.len(),
            "Sync session opened"
        );
        SyncSession {
            identity,
            generation,
            listeners,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Aborts every listener and waits until all of them have stopped.
    pub async fn close(mut self) {
        let listeners = std::mem::take(&mut self.listeners);
        for (_, handle) in &listeners {
            handle.abort();
        }
        for (table, handle) in listeners {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    debug!(%table, error = %e, "Listener ended abnormally");
                }
            }
        }
        info!(user = %self.identity.user_id, "Sync session closed");
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        for (_, handle) in &self.listeners {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_debug_redacts_token() {
        let identity = SessionIdentity::new("cashier-7").with_token("s3cr3t");
        let printed = format!("{identity:?}");
        assert!(printed.contains("cashier-7"));
        assert!(!printed.contains("s3cr3t"));
    }

    #[test]
    fn test_identity_wire_shape() {
        let json = serde_json::to_string(&SessionIdentity::new("cashier-7")).unwrap();
        assert_eq!(json, r#"{"userId":"cashier-7"}"#);
    }
}
