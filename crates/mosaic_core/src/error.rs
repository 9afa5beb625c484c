//! Error types for MosaicDB core.

use crate::types::{CollectionId, RevisionId};
use mosaic_storage::StorageError;
use std::time::Duration;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in MosaicDB core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage engine error other than a write-write conflict.
    #[error("storage error: {0}")]
    Storage(StorageError),

    /// A collection lock could not be acquired in time. Retryable.
    #[error("timed out after {timeout:?} waiting for lock on {collection}")]
    LockTimeout {
        /// The collection whose lock timed out.
        collection: CollectionId,
        /// The configured timeout.
        timeout: Duration,
    },

    /// The transaction grew past its memory limit and was aborted.
    #[error("transaction size limit exceeded: {used} bytes used, limit is {limit}")]
    ResourceExhausted {
        /// Bytes the transaction would have used.
        used: usize,
        /// Configured limit in bytes.
        limit: usize,
    },

    /// A write was attempted through a read-only transaction.
    #[error("write operation in read-only transaction")]
    ReadOnlyViolation,

    /// The replicated log's leader resigned while waiting for commitment.
    ///
    /// The outcome is ambiguous: the transaction may or may not become
    /// committed on the new leader.
    #[error("replicated log {log} lost its leader; transaction outcome is unknown")]
    ReplicationLeaderResigned {
        /// The log that resigned.
        log: u64,
    },

    /// Write-write conflict detected by the engine. The transaction aborts.
    #[error("write-write conflict on key {key:?}")]
    EngineConflict {
        /// The conflicting key.
        key: Vec<u8>,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// Collection not registered or not part of the transaction.
    #[error("collection not found: {collection}")]
    CollectionNotFound {
        /// The missing collection.
        collection: CollectionId,
    },

    /// The document revision does not exist in the transaction's view.
    #[error("document {revision} not found in {collection}")]
    DocumentNotFound {
        /// The collection searched.
        collection: CollectionId,
        /// The missing revision.
        revision: RevisionId,
    },

    /// Revision tree operation failed.
    #[error("revision tree error: {message}")]
    RevisionTree {
        /// Description of the failure.
        message: String,
    },

    /// Persisted metadata could not be encoded or decoded.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the failure.
        message: String,
    },

    /// Persisted metadata is inconsistent.
    #[error("metadata corruption in {collection}: {message}")]
    MetadataCorruption {
        /// The affected collection.
        collection: CollectionId,
        /// Description of the corruption.
        message: String,
    },
}

impl From<StorageError> for CoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Conflict { key } => Self::EngineConflict { key },
            other => Self::Storage(other),
        }
    }
}

impl CoreError {
    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates a revision tree error.
    pub fn revision_tree(message: impl Into<String>) -> Self {
        Self::RevisionTree {
            message: message.into(),
        }
    }

    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Creates a metadata corruption error.
    pub fn metadata_corruption(collection: CollectionId, message: impl Into<String>) -> Self {
        Self::MetadataCorruption {
            collection,
            message: message.into(),
        }
    }

    /// Returns true if the operation may succeed when retried as a new transaction.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout { .. } | Self::EngineConflict { .. })
    }

    /// Returns true if the outcome of the transaction is unknown.
    #[must_use]
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, Self::ReplicationLeaderResigned { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_conflict_maps_to_engine_conflict() {
        let err: CoreError = StorageError::Conflict { key: b"k".to_vec() }.into();
        assert!(matches!(err, CoreError::EngineConflict { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn other_storage_errors_are_wrapped() {
        let err: CoreError = StorageError::Closed.into();
        assert!(matches!(err, CoreError::Storage(StorageError::Closed)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn leader_resignation_is_ambiguous() {
        let err = CoreError::ReplicationLeaderResigned { log: 7 };
        assert!(err.is_ambiguous());
        assert!(!err.is_retryable());
    }
}
