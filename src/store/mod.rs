//! Durable snapshot history.
//!
//! Snapshots are keyed by `(source_query, timestamp)`; the store refuses a
//! second write of the same key and any write older than the latest
//! snapshot of its source, so history is strictly ordered per source.

mod codec;
mod cursor;
mod sqlite;

use chrono::{DateTime, Utc};
use rusqlite::ErrorCode;
use serde::Serialize;
use thiserror::Error;

pub use codec::PayloadEncoding;
pub use cursor::SnapshotCursor;
pub use sqlite::{SnapshotStore, StoreOptions};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("snapshot {source_query} @ {timestamp} already persisted")]
    Duplicate {
        source_query: String,
        timestamp: DateTime<Utc>,
    },
    #[error("snapshot {source_query} @ {timestamp} is older than latest {latest}")]
    OutOfOrder {
        source_query: String,
        timestamp: DateTime<Utc>,
        latest: DateTime<Utc>,
    },
    #[error("snapshot store corrupted: {0}")]
    Corruption(String),
    #[error("failed to encode snapshot payload: {0}")]
    Encode(String),
    #[error("sqlite error: {0}")]
    Sqlite(rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Corruption invalidates the ordering and uniqueness guarantees; nothing
    /// else the store reports should stop the pipeline.
    pub fn is_corruption(&self) -> bool {
        matches!(self, StoreError::Corruption(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseCorrupt) | Some(ErrorCode::NotADatabase) => {
                StoreError::Corruption(err.to_string())
            }
            _ => StoreError::Sqlite(err),
        }
    }
}

/// Size and span of the persisted history.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct StoreStats {
    pub snapshot_count: u64,
    pub source_count: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
    pub size_bytes: u64,
}
