//! Error types for the replicated commit protocol.

use crate::operation::LogId;
use mosaic_core::{CollectionId, CoreError};
use thiserror::Error;

/// Result type for replication operations.
pub type ReplicationResult<T> = Result<T, ReplicationError>;

/// Errors that can occur while replicating transactions.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// The log's leader resigned while an operation was in flight.
    ///
    /// The outcome of the transaction is unknown: it may still become
    /// committed under the next leader.
    #[error("replicated log {log} lost its leader; transaction outcome is unknown")]
    LeaderResigned {
        /// The log that resigned.
        log: LogId,
    },

    /// The log no longer accepts appends from this participant.
    #[error("replicated log {log} is not led by this participant")]
    NotLeader {
        /// The log.
        log: LogId,
    },

    /// No replicated log is configured for a collection.
    #[error("no replicated log for collection {collection}")]
    UnknownCollection {
        /// The collection.
        collection: CollectionId,
    },

    /// A log entry could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// Local transaction error.
    #[error("database error: {0}")]
    Core(CoreError),
}

impl ReplicationError {
    /// Returns true if the transaction may or may not have committed.
    #[must_use]
    pub fn is_ambiguous(&self) -> bool {
        match self {
            Self::LeaderResigned { .. } => true,
            Self::Core(e) => e.is_ambiguous(),
            _ => false,
        }
    }

    /// Returns true if retrying the whole transaction may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Core(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl From<CoreError> for ReplicationError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::ReplicationLeaderResigned { log } => Self::LeaderResigned { log: LogId::new(log) },
            other => Self::Core(other),
        }
    }
}

impl From<ReplicationError> for CoreError {
    fn from(err: ReplicationError) -> Self {
        match err {
            ReplicationError::LeaderResigned { log } | ReplicationError::NotLeader { log } => {
                Self::ReplicationLeaderResigned { log: log.as_u64() }
            }
            ReplicationError::UnknownCollection { collection } => Self::CollectionNotFound { collection },
            ReplicationError::Codec(message) => Self::Codec { message },
            ReplicationError::Core(e) => e,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resignation_is_ambiguous_both_ways() {
        let err = ReplicationError::LeaderResigned { log: LogId::new(3) };
        assert!(err.is_ambiguous());
        assert!(!err.is_retryable());

        let core: CoreError = err.into();
        assert!(core.is_ambiguous());
        let back: ReplicationError = core.into();
        assert!(matches!(back, ReplicationError::LeaderResigned { log } if log == LogId::new(3)));
    }

    #[test]
    fn lock_timeouts_stay_retryable() {
        let err = ReplicationError::from(CoreError::LockTimeout {
            collection: CollectionId::new(1),
            timeout: std::time::Duration::from_millis(5),
        });
        assert!(err.is_retryable());
        assert!(!err.is_ambiguous());
    }

    #[test]
    fn error_display() {
        let err = ReplicationError::UnknownCollection {
            collection: CollectionId::new(4),
        };
        assert_eq!(err.to_string(), "no replicated log for collection col:4");
    }
}
