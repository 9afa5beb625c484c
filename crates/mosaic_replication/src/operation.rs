//! Replicated log operations.
//!
//! Every operation is tagged with the leader's transaction id. Followers
//! use that id to group document operations into one local transaction
//! and to apply `Commit`/`Abort` idempotently.

use crate::error::{ReplicationError, ReplicationResult};
use mosaic_core::{CollectionId, RevisionId, TransactionId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a replicated log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogId(pub u64);

impl LogId {
    /// Creates a log id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "log:{}", self.0)
    }
}

/// Position of an entry in a replicated log. Indexes start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct LogIndex(pub u64);

impl LogIndex {
    /// Index before the first entry.
    pub const ZERO: Self = Self(0);

    /// Creates a log index.
    #[must_use]
    pub const fn new(index: u64) -> Self {
        Self(index)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A document change inside a replicated transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentAction {
    /// A revision was inserted.
    Insert {
        /// Inserted revision.
        revision: u64,
        /// Document body.
        value: Vec<u8>,
    },
    /// A revision replaced another.
    Replace {
        /// Replaced revision.
        old: u64,
        /// New revision.
        new: u64,
        /// Document body of the new revision.
        value: Vec<u8>,
    },
    /// A revision was removed.
    Remove {
        /// Removed revision.
        revision: u64,
    },
    /// Every document of the collection was removed.
    Truncate,
}

/// What a replicated operation does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationKind {
    /// A document change.
    Document {
        /// Changed collection.
        collection: u32,
        /// The change.
        action: DocumentAction,
    },
    /// The transaction committed its current batch and continues.
    IntermediateCommit,
    /// The transaction committed.
    Commit,
    /// The transaction aborted.
    Abort,
}

/// An operation sent from the leader to its followers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationOperation {
    /// Leader transaction id.
    pub transaction: u64,
    /// The operation.
    pub kind: ReplicationKind,
}

impl ReplicationOperation {
    /// Creates an operation.
    #[must_use]
    pub fn new(transaction: TransactionId, kind: ReplicationKind) -> Self {
        Self {
            transaction: transaction.as_u64(),
            kind,
        }
    }

    /// Creates a document operation.
    #[must_use]
    pub fn document(transaction: TransactionId, collection: CollectionId, action: DocumentAction) -> Self {
        Self::new(
            transaction,
            ReplicationKind::Document {
                collection: collection.as_u32(),
                action,
            },
        )
    }

    /// Returns the transaction id.
    #[must_use]
    pub fn transaction_id(&self) -> TransactionId {
        TransactionId::new(self.transaction)
    }

    /// Returns true for `Commit` and `Abort`.
    #[must_use]
    pub fn is_final(&self) -> bool {
        matches!(self.kind, ReplicationKind::Commit | ReplicationKind::Abort)
    }

    /// Encodes the operation as CBOR.
    ///
    /// # Errors
    ///
    /// Returns a codec error if encoding fails.
    pub fn encode(&self) -> ReplicationResult<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes).map_err(|e| ReplicationError::Codec(e.to_string()))?;
        Ok(bytes)
    }

    /// Decodes an operation.
    ///
    /// # Errors
    ///
    /// Returns a codec error if the bytes are not an operation.
    pub fn decode(bytes: &[u8]) -> ReplicationResult<Self> {
        ciborium::from_reader(bytes).map_err(|e| ReplicationError::Codec(e.to_string()))
    }
}

impl DocumentAction {
    /// Creates an insert action.
    #[must_use]
    pub fn insert(revision: RevisionId, value: Vec<u8>) -> Self {
        Self::Insert {
            revision: revision.as_u64(),
            value,
        }
    }

    /// Creates a replace action.
    #[must_use]
    pub fn replace(old: RevisionId, new: RevisionId, value: Vec<u8>) -> Self {
        Self::Replace {
            old: old.as_u64(),
            new: new.as_u64(),
            value,
        }
    }

    /// Creates a remove action.
    #[must_use]
    pub fn remove(revision: RevisionId) -> Self {
        Self::Remove {
            revision: revision.as_u64(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            ReplicationOperation::decode(&[0xff, 0xfe, 0x00]),
            Err(ReplicationError::Codec(_))
        ));
    }

    #[test]
    fn final_operations() {
        let txn = TransactionId::new(4);
        assert!(ReplicationOperation::new(txn, ReplicationKind::Commit).is_final());
        assert!(ReplicationOperation::new(txn, ReplicationKind::Abort).is_final());
        assert!(!ReplicationOperation::new(txn, ReplicationKind::IntermediateCommit).is_final());
    }

    fn action() -> impl Strategy<Value = DocumentAction> {
        prop_oneof![
            (any::<u64>(), prop::collection::vec(any::<u8>(), 0..32))
                .prop_map(|(revision, value)| DocumentAction::Insert { revision, value }),
            (any::<u64>(), any::<u64>(), prop::collection::vec(any::<u8>(), 0..32))
                .prop_map(|(old, new, value)| DocumentAction::Replace { old, new, value }),
            any::<u64>().prop_map(|revision| DocumentAction::Remove { revision }),
            Just(DocumentAction::Truncate),
        ]
    }

    proptest! {
        #[test]
        fn document_operations_survive_the_wire(txn in any::<u64>(), collection in any::<u32>(), action in action()) {
            let op = ReplicationOperation::document(
                TransactionId::new(txn),
                CollectionId::new(collection),
                action,
            );
            let decoded = ReplicationOperation::decode(&op.encode().unwrap()).unwrap();
            prop_assert_eq!(decoded, op);
        }
    }
}
