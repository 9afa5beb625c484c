//! Error types for storage operations.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A key written by the batch was modified after the batch's read sequence.
    #[error("write-write conflict on key {key:?}")]
    Conflict {
        /// The conflicting key.
        key: Vec<u8>,
    },

    /// The engine has been closed.
    #[error("engine is closed")]
    Closed,

    /// The engine detected inconsistent internal state.
    #[error("engine corrupted: {0}")]
    Corrupted(String),

    /// A commit failure injected for testing.
    #[error("injected commit failure")]
    InjectedFailure,
}

impl StorageError {
    /// Returns true for write-write conflicts.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}
