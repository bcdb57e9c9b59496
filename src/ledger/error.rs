//! Error types for the tracked item ledger.

use tantivy::directory::error::OpenDirectoryError;
use thiserror::Error;

/// Errors from ledger operations.
///
/// `NotFound` and `Conflict` are expected outcomes that callers branch on;
/// everything else is a genuine failure.
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Tracked item not found: {id}")]
    NotFound { id: String },

    #[error("Revision conflict for tracked item: {id}")]
    Conflict { id: String },

    #[error("Tantivy error: {0}")]
    Tantivy(#[from] tantivy::TantivyError),

    #[error("Directory error: {0}")]
    Directory(#[from] OpenDirectoryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt record {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("Ledger task failed: {0}")]
    Task(String),

    #[error("Lock poisoned")]
    LockPoisoned,
}

impl LedgerError {
    /// The record does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, LedgerError::NotFound { .. })
    }

    /// The write carried a stale revision.
    pub fn is_conflict(&self) -> bool {
        matches!(self, LedgerError::Conflict { .. })
    }
}

/// Result type for ledger operations.
pub type LedgerResult<T> = Result<T, LedgerError>;
