//! # Repository Module
//!
//! Database repository implementations for Tally POS.
//!
//! - [`records::RecordRepository`] - Synchronized record CRUD and sync-state queries

pub mod records;
