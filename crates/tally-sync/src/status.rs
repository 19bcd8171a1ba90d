//! Status channel: one current [`StatusSnapshot`], not a queue of events.

use tokio::sync::watch;

use tally_core::StatusSnapshot;

#[derive(Debug)]
pub struct StatusPublisher {
    tx: watch::Sender<StatusSnapshot>,
}

impl StatusPublisher {
    pub fn new(initial: StatusSnapshot) -> Self {
        let (tx, _) = watch::channel(initial);
        StatusPublisher { tx }
    }

    /// Publishes `snapshot` if it differs from the current one. Returns true
    /// when subscribers were notified.
    pub fn publish(&self, snapshot: StatusSnapshot) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> StatusSnapshot {
        self.tx.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::SyncStatus;

    #[tokio::test]
    async fn test_only_changes_notify() {
        let publisher = StatusPublisher::new(StatusSnapshot::default());
        let mut rx = publisher.subscribe();

        assert!(!publisher.publish(StatusSnapshot::default()));
        assert!(!rx.has_changed().unwrap());

        let syncing = StatusSnapshot {
            status: SyncStatus::Syncing,
            pending_count: 3,
            ..Default::default()
        };
        assert!(publisher.publish(syncing.clone()));
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), syncing);
        assert_eq!(publisher.current().pending_count, 3);
    }
}
