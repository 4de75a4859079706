//! Core type definitions for rowsync.
//!
//! This crate defines the plain data the reconciliation engine works on:
//! - Local rows and the primary-key normalizer used to compare them
//! - Remote data source entries and their identifiers
//! - Commit plans (inserts, updates and deletions)
//! - Second-resolution timestamp comparison
//!
//! Nothing in here performs I/O; the sync crate owns all network and
//! file access.

mod entry;
mod ids;
mod row;
mod timestamp;

pub use entry::{CommitEntry, CommitPlan, RemoteEntry};
pub use ids::EntryId;
pub use row::{is_truthy, normalize_key, ComparableKey, Row};
pub use timestamp::{parse_timestamp, timestamps_match};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid entry id: {0}")]
    InvalidEntryId(String),

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
}
