//! # Status State Machine
//!
//! Pure transition logic behind the published [`SyncStatus`]. The
//! orchestrator feeds it facts; it never performs I/O.
//!
//! ```text
//!            flush_started                 Clean
//!   ┌──────┐ ────────────► ┌─────────┐ ───────────► ┌──────┐
//!   │ idle │               │ syncing │              │ idle │
//!   └──────┘ ◄──────────── └─────────┘              └──────┘
//!     ▲  │     online         │   │ Retrying: stays syncing
//!     │  │offline             │   │
//!     │  ▼                    │   ▼
//!   ┌─────────┐      Failed / AuthRejected   ┌───────┐
//!   │ offline │                ────────────► │ error │ (blocked on auth)
//!   └─────────┘                              └───────┘
//!                 identity_changed clears the block
//! ```

use chrono::{DateTime, Utc};

use tally_core::{StatusSnapshot, SyncStatus};

/// How a flush ended, from the status point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Everything acknowledged (or given up on without new errors).
    Clean,
    /// Transient failures; a backoff retry is scheduled.
    Retrying { detail: String },
    /// Permanent or exhausted failures.
    Failed { detail: String },
    /// The remote store refused the session identity.
    AuthRejected { detail: String },
}

#[derive(Debug, Clone)]
pub struct StatusMachine {
    status: SyncStatus,
    detail: Option<String>,
    blocked: bool,
    online: bool,
}

impl StatusMachine {
    pub fn new(online: bool) -> Self {
        StatusMachine {
            status: if online {
                SyncStatus::Idle
            } else {
                SyncStatus::Offline
            },
            detail: None,
            blocked: false,
            online,
        }
    }

    pub fn status(&self) -> SyncStatus {
        self.status
    }

    /// Whether outbound and inbound activity may run.
    pub fn can_sync(&self) -> bool {
        self.online && !self.blocked
    }

    /// Returns true if connectivity actually changed.
    pub fn set_online(&mut self, online: bool) -> bool {
        if self.online == online {
            return false;
        }
        self.online = online;
        if online {
            if self.blocked {
                self.status = SyncStatus::Error;
            } else {
                self.status = SyncStatus::Idle;
                self.detail = None;
            }
        } else {
            self.status = SyncStatus::Offline;
        }
        true
    }

    pub fn flush_started(&mut self) {
        if self.can_sync() {
            self.status = SyncStatus::Syncing;
            self.detail = None;
        }
    }

    pub fn flush_finished(&mut self, outcome: FlushOutcome) {
        if let FlushOutcome::AuthRejected { detail } = outcome {
            self.reject_session(detail);
            return;
        }
        if !self.online {
            self.status = SyncStatus::Offline;
            return;
        }
        if self.blocked {
            return;
        }
        match outcome {
            FlushOutcome::Clean => {
                self.status = SyncStatus::Idle;
                self.detail = None;
            }
            FlushOutcome::Retrying { detail } => {
                self.status = SyncStatus::Syncing;
                self.detail = Some(detail);
            }
            FlushOutcome::Failed { detail } => {
                self.status = SyncStatus::Error;
                self.detail = Some(detail);
            }
            FlushOutcome::AuthRejected { .. } => {}
        }
    }

    /// Enters the blocking error state. Only a new identity clears it.
    pub fn reject_session(&mut self, detail: String) {
        self.blocked = true;
        self.detail = Some(detail);
        if self.online {
            self.status = SyncStatus::Error;
        }
    }

    /// Non-blocking error that did not come from a flush.
    pub fn report_error(&mut self, detail: String) {
        if self.online && !self.blocked {
            self.status = SyncStatus::Error;
            self.detail = Some(detail);
        }
    }

    pub fn identity_changed(&mut self) {
        self.blocked = false;
        if self.online && self.status == SyncStatus::Error {
            self.status = SyncStatus::Idle;
            self.detail = None;
        }
    }

    pub fn snapshot(
        &self,
        pending_count: usize,
        last_synced_at: Option<DateTime<Utc>>,
    ) -> StatusSnapshot {
        StatusSnapshot {
            status: self.status,
            detail: self.detail.clone(),
            blocked: self.blocked,
            pending_count,
            last_synced_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_follows_connectivity() {
        assert_eq!(StatusMachine::new(true).status(), SyncStatus::Idle);
        assert_eq!(StatusMachine::new(false).status(), SyncStatus::Offline);
    }

    #[test]
    fn test_flush_cycle() {
        let mut m = StatusMachine::new(true);
        m.flush_started();
        assert_eq!(m.status(), SyncStatus::Syncing);

        m.flush_finished(FlushOutcome::Retrying {
            detail: "3 records retrying".into(),
        });
        assert_eq!(m.status(), SyncStatus::Syncing);

        m.flush_finished(FlushOutcome::Clean);
        assert_eq!(m.status(), SyncStatus::Idle);
        assert_eq!(m.snapshot(0, None).detail, None);
    }

    #[test]
    fn test_non_blocking_error_recovers_on_next_flush() {
        let mut m = StatusMachine::new(true);
        m.flush_started();
        m.flush_finished(FlushOutcome::Failed {
            detail: "rejected".into(),
        });
        assert_eq!(m.status(), SyncStatus::Error);
        assert!(m.can_sync());

        m.flush_started();
        assert_eq!(m.status(), SyncStatus::Syncing);
        m.flush_finished(FlushOutcome::Clean);
        assert_eq!(m.status(), SyncStatus::Idle);
    }

    #[test]
    fn test_auth_rejection_blocks_until_identity_changes() {
        let mut m = StatusMachine::new(true);
        m.flush_started();
        m.flush_finished(FlushOutcome::AuthRejected {
            detail: "token expired".into(),
        });
        assert_eq!(m.status(), SyncStatus::Error);
        assert!(!m.can_sync());

        // flushes do nothing while blocked
        m.flush_started();
        assert_eq!(m.status(), SyncStatus::Error);

        // reconnecting does not clear the block
        m.set_online(false);
        m.set_online(true);
        assert_eq!(m.status(), SyncStatus::Error);
        assert!(m.snapshot(0, None).blocked);

        m.identity_changed();
        assert_eq!(m.status(), SyncStatus::Idle);
        assert!(m.can_sync());
    }

    #[test]
    fn test_offline_transitions() {
        let mut m = StatusMachine::new(true);
        assert!(m.set_online(false));
        assert!(!m.set_online(false));
        assert_eq!(m.status(), SyncStatus::Offline);

        // a flush that ends after going offline leaves the status offline
        m.flush_finished(FlushOutcome::Clean);
        assert_eq!(m.status(), SyncStatus::Offline);

        m.set_online(true);
        assert_eq!(m.status(), SyncStatus::Idle);
    }
}
