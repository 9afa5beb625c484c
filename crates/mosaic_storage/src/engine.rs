//! Key-value engine trait definition.

use crate::batch::WriteBatch;
use crate::error::StorageResult;
use crate::sequence::SequenceNumber;
use crate::snapshot::Snapshot;

/// A half-open key range `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    /// Inclusive lower bound.
    pub start: Vec<u8>,
    /// Exclusive upper bound.
    pub end: Vec<u8>,
}

impl KeyRange {
    /// Creates a new range.
    #[must_use]
    pub fn new(start: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    /// Returns true if `key` lies inside the range.
    #[must_use]
    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.start.as_slice() && key < self.end.as_slice()
    }
}

/// An ordered cursor over a key range at a fixed snapshot.
pub trait EngineIterator: Send {
    /// Positions the cursor at the first key `>= target` inside the range.
    fn seek(&mut self, target: &[u8]);

    /// Returns the next visible entry, or `None` at the end of the range.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine fails while reading.
    fn next_entry(&mut self) -> StorageResult<Option<(Vec<u8>, Vec<u8>)>>;
}

/// An ordered byte-key store with snapshots and atomic batches.
///
/// The engine is an external collaborator of the transactional core. It
/// owns durability and key-level conflict detection; the core owns
/// everything above that.
///
/// # Invariants
///
/// - `commit` is atomic: either every entry of the batch becomes visible at
///   the returned sequence or none does
/// - sequence numbers returned by `commit` strictly increase
/// - a snapshot at sequence `s` never observes a batch committed after `s`
/// - implementations must be `Send + Sync`
pub trait KeyValueEngine: Send + Sync {
    /// Acquires a snapshot at the latest committed sequence.
    fn snapshot(&self) -> Snapshot;

    /// Reads `key` as of `snapshot`.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine fails while reading.
    fn get(&self, snapshot: &Snapshot, key: &[u8]) -> StorageResult<Option<Vec<u8>>>;

    /// Reads several keys as of `snapshot`, preserving order.
    ///
    /// # Errors
    ///
    /// Returns an error if any individual read fails.
    fn multi_get(&self, snapshot: &Snapshot, keys: &[&[u8]]) -> StorageResult<Vec<Option<Vec<u8>>>> {
        keys.iter().map(|key| self.get(snapshot, key)).collect()
    }

    /// Creates a cursor over `range` as of `snapshot`.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot create the cursor.
    fn iterator(&self, snapshot: &Snapshot, range: KeyRange) -> StorageResult<Box<dyn EngineIterator>>;

    /// Commits `batch` atomically and returns its sequence number.
    ///
    /// A batch without puts or deletes does not consume a sequence number;
    /// the latest sequence is returned instead.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::Conflict`] if the batch has a read
    /// sequence, is not exclusive, and one of its keys was committed after
    /// that sequence.
    fn commit(&self, batch: &WriteBatch) -> StorageResult<SequenceNumber>;

    /// Returns the sequence of the most recent commit.
    fn latest_sequence(&self) -> SequenceNumber;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_range_contains_is_half_open() {
        let range = KeyRange::new(b"b".to_vec(), b"d".to_vec());
        assert!(!range.contains(b"a"));
        assert!(range.contains(b"b"));
        assert!(range.contains(b"c\xff"));
        assert!(!range.contains(b"d"));
    }
}
