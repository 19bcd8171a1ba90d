//! # Outbound Queue
//!
//! Local mutations waiting to be written to the remote store.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        OutboundQueue                                    │
//! │                                                                         │
//! │   order (FIFO)      entries (by key)              attempts (by key)     │
//! │   ────────────      ────────────────────────      ─────────────────     │
//! │   products/p-1  ──► products/p-1 @ 10:00:03       products/p-1 → 2      │
//! │   sales/s-9     ──► sales/s-9    @ 10:00:01                             │
//! │   products/p-4  ──► products/p-4 @ 10:00:02                             │
//! │                                                                         │
//! │   enqueue(p-1 @ 10:00:05)  → replaces in place, keeps FIFO slot        │
//! │   flush(2)                 → [p-1, s-9], more = true                   │
//! │   requeue(s-9, 1)          → back of the line, attempts = 1            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The lock is a plain `std::sync::Mutex` and is never held across an await.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::debug;

use tally_core::{ChangeBatch, RecordKey, SyncRecord};

#[derive(Debug, Default)]
struct QueueInner {
    order: VecDeque<RecordKey>,
    entries: HashMap<RecordKey, SyncRecord>,
    /// Failed transmissions per key. Survives `flush` so the reconciler can
    /// count the next attempt.
    attempts: HashMap<RecordKey, u32>,
}

impl QueueInner {
    fn push(&mut self, record: SyncRecord) {
        let key = record.key();
        self.order.push_back(key.clone());
        self.entries.insert(key, record);
    }
}

/// FIFO of pending local mutations, de-duplicated by `(table, local_id)`.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    inner: Mutex<QueueInner>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Adds a record, or replaces the queued version of the same key in its
    /// current position. An older version never replaces a newer one.
    ///
    /// Returns true if the key was not queued before.
    pub fn enqueue(&self, record: SyncRecord) -> bool {
        let mut inner = self.lock();
        let key = record.key();
        match inner.entries.get_mut(&key) {
            Some(queued) => {
                if record.updated_at >= queued.updated_at {
                    if record.remote_id.is_none() {
                        let known = queued.remote_id.take();
                        *queued = SyncRecord {
                            remote_id: known,
                            ..record
                        };
                    } else {
                        *queued = record;
                    }
                    inner.attempts.remove(&key);
                }
                false
            }
            None => {
                inner.attempts.remove(&key);
                inner.push(record);
                true
            }
        }
    }

    /// Removes up to `max_size` records in FIFO order. The flag is true when
    /// records remain.
    pub fn flush(&self, max_size: usize) -> (ChangeBatch, bool) {
        let mut inner = self.lock();
        let mut records = Vec::with_capacity(max_size.min(inner.order.len()));
        while records.len() < max_size {
            let Some(key) = inner.order.pop_front() else {
                break;
            };
            if let Some(record) = inner.entries.remove(&key) {
                records.push(record);
            }
        }
        let more = !inner.order.is_empty();
        debug!(count = records.len(), more, "Flushed outbound queue");
        (ChangeBatch::new(records), more)
    }

    /// Puts a transmitted record back after a failure. If a newer version of
    /// the key was enqueued meanwhile, that version stays and `attempts` is
    /// not applied.
    pub fn requeue(&self, record: SyncRecord, attempts: u32) {
        let mut inner = self.lock();
        let key = record.key();
        if let Some(queued) = inner.entries.get(&key) {
            if queued.updated_at >= record.updated_at {
                return;
            }
            inner.entries.insert(key.clone(), record);
        } else {
            inner.push(record);
        }
        inner.attempts.insert(key, attempts);
    }

    /// Failed transmissions recorded for `key`.
    pub fn attempts(&self, key: &RecordKey) -> u32 {
        self.lock().attempts.get(key).copied().unwrap_or(0)
    }

    /// Drops the retry counter of `key`.
    pub fn forget(&self, key: &RecordKey) {
        self.lock().attempts.remove(key);
    }

    /// Records a newly assigned remote id on the queued version of `key`, so
    /// its next write merges into the same remote document.
    pub fn set_remote_id(&self, key: &RecordKey, remote_id: &str) {
        if let Some(queued) = self.lock().entries.get_mut(key) {
            if queued.remote_id.is_none() {
                queued.remote_id = Some(remote_id.to_string());
            }
        }
    }

    /// Removes the queued version of `key` if it is not newer than
    /// `updated_at`. Returns true if an entry was removed.
    pub fn discard_stale(&self, key: &RecordKey, updated_at: DateTime<Utc>) -> bool {
        let mut inner = self.lock();
        let stale = inner
            .entries
            .get(key)
            .is_some_and(|queued| queued.updated_at <= updated_at);
        if stale {
            inner.entries.remove(key);
            inner.order.retain(|k| k != key);
            inner.attempts.remove(key);
        }
        stale
    }

    pub fn contains(&self, key: &RecordKey) -> bool {
        self.lock().entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
