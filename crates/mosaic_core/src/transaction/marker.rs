//! Log markers embedded in committed batches.

use crate::error::{CoreError, CoreResult};
use crate::types::{CollectionId, TransactionId};
use serde::{Deserialize, Serialize};

/// Kind of commit a marker announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarkerKind {
    /// The final commit of a transaction.
    Commit,
    /// An intermediate commit; the transaction continues.
    IntermediateCommit,
}

/// Marker written into every transaction batch, identifying the
/// transaction and the collections it changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitMarker {
    /// Committing transaction.
    pub transaction: u64,
    /// Kind of commit.
    pub kind: MarkerKind,
    /// Collections with changes in the batch.
    pub collections: Vec<u32>,
}

impl CommitMarker {
    /// Creates a marker.
    #[must_use]
    pub fn new(transaction: TransactionId, kind: MarkerKind, collections: &[CollectionId]) -> Self {
        Self {
            transaction: transaction.as_u64(),
            kind,
            collections: collections.iter().map(|c| c.as_u32()).collect(),
        }
    }

    /// Encodes the marker as CBOR.
    ///
    /// # Errors
    ///
    /// Returns a codec error if encoding fails.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes).map_err(|e| CoreError::codec(e.to_string()))?;
        Ok(bytes)
    }

    /// Decodes a marker.
    ///
    /// # Errors
    ///
    /// Returns a codec error if the bytes are not a marker.
    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        ciborium::from_reader(bytes).map_err(|e| CoreError::codec(e.to_string()))
    }

    /// Returns the transaction id.
    #[must_use]
    pub fn transaction_id(&self) -> TransactionId {
        TransactionId::new(self.transaction)
    }
}
