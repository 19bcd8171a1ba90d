//! # Change Batches
//!
//! A [`ChangeBatch`] is what one flush of the outbound queue hands to the
//! transmitter. Batches larger than the transport limit are cut into
//! sub-chunks that are committed one after another.
//!
//! ```text
//!  ChangeBatch (1,200 records), limit 500
//!  ┌──────────────────────────────────────────────┐
//!  │ r1 ... r500 │ r501 ... r1000 │ r1001 ... r1200 │
//!  └──────┬──────┴───────┬────────┴────────┬────────┘
//!     commit #1      commit #2         commit #3
//! ```

use serde::{Deserialize, Serialize};

use crate::types::SyncRecord;

/// Maximum records per remote commit unless configured otherwise.
pub const DEFAULT_TRANSPORT_LIMIT: usize = 500;

/// Ordered records taken from the outbound queue for one transmission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeBatch {
    records: Vec<SyncRecord>,
}

impl ChangeBatch {
    pub fn new(records: Vec<SyncRecord>) -> Self {
        ChangeBatch { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[SyncRecord] {
        &self.records
    }

    pub fn iter(&self) -> impl Iterator<Item = &SyncRecord> {
        self.records.iter()
    }

    pub fn into_records(self) -> Vec<SyncRecord> {
        self.records
    }

    /// Splits the batch into sub-chunks of at most `limit` records,
    /// preserving order. A `limit` of zero is treated as one.
    pub fn into_chunks(self, limit: usize) -> Vec<Vec<SyncRecord>> {
        let limit = limit.max(1);
        let mut chunks = Vec::with_capacity(self.records.len().div_ceil(limit));
        let mut records = self.records.into_iter().peekable();
        while records.peek().is_some() {
            chunks.push(records.by_ref().take(limit).collect());
        }
        chunks
    }
}

impl From<Vec<SyncRecord>> for ChangeBatch {
    fn from(records: Vec<SyncRecord>) -> Self {
        ChangeBatch::new(records)
    }
}

impl IntoIterator for ChangeBatch {
    type Item = SyncRecord;
    type IntoIter = std::vec::IntoIter<SyncRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}
