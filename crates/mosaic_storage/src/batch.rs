//! Atomic write batches.

use crate::sequence::SequenceNumber;
use std::collections::BTreeMap;
use std::ops::Bound;

/// A single staged entry in a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchEntry {
    /// Insert or overwrite a key.
    Put {
        /// The key.
        key: Vec<u8>,
        /// The value.
        value: Vec<u8>,
    },
    /// Delete a key.
    Delete {
        /// The key.
        key: Vec<u8>,
    },
    /// An opaque marker written into the engine's log alongside the batch.
    LogData(Vec<u8>),
}

impl BatchEntry {
    fn key(&self) -> Option<&[u8]> {
        match self {
            Self::Put { key, .. } | Self::Delete { key } => Some(key.as_slice()),
            Self::LogData(_) => None,
        }
    }

    fn size(&self) -> usize {
        match self {
            Self::Put { key, value } => key.len() + value.len(),
            Self::Delete { key } => key.len(),
            Self::LogData(data) => data.len(),
        }
    }
}

/// Staged mutations plus log markers, committed atomically.
///
/// The batch keeps an index from key to the latest entry touching it so
/// callers can read their own writes. `truncate` supports savepoint
/// rollback by cutting the batch back to an earlier length.
///
/// # Conflict detection
///
/// When a read sequence is set, the engine rejects the batch if any key it
/// writes was committed by someone else after that sequence. Setting the
/// batch to exclusive skips the check entirely.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    entries: Vec<BatchEntry>,
    index: BTreeMap<Vec<u8>, usize>,
    data_size: usize,
    operations: usize,
    read_sequence: Option<SequenceNumber>,
    exclusive: bool,
}

impl WriteBatch {
    /// Creates an empty batch without conflict detection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty batch that conflicts with commits after `sequence`.
    #[must_use]
    pub fn with_read_sequence(sequence: SequenceNumber) -> Self {
        Self {
            read_sequence: Some(sequence),
            ..Self::default()
        }
    }

    /// Sets the sequence used for write-write conflict detection.
    pub fn set_read_sequence(&mut self, sequence: SequenceNumber) {
        self.read_sequence = Some(sequence);
    }

    /// Returns the read sequence, if conflict detection is enabled.
    #[must_use]
    pub fn read_sequence(&self) -> Option<SequenceNumber> {
        self.read_sequence
    }

    /// Marks the batch as exclusive, disabling conflict checks.
    pub fn set_exclusive(&mut self, exclusive: bool) {
        self.exclusive = exclusive;
    }

    /// Returns true if conflict checks are disabled.
    #[must_use]
    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    /// Stages a put.
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.push(BatchEntry::Put { key, value });
    }

    /// Stages a delete.
    pub fn delete(&mut self, key: Vec<u8>) {
        self.push(BatchEntry::Delete { key });
    }

    /// Embeds a log marker.
    pub fn put_log_data(&mut self, data: Vec<u8>) {
        self.push(BatchEntry::LogData(data));
    }

    fn push(&mut self, entry: BatchEntry) {
        let position = self.entries.len();
        if let Some(key) = entry.key() {
            self.index.insert(key.to_vec(), position);
            self.operations += 1;
        }
        self.data_size += entry.size();
        self.entries.push(entry);
    }

    /// Returns the number of entries, log markers included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the batch has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the number of put and delete entries.
    #[must_use]
    pub fn operation_count(&self) -> usize {
        self.operations
    }

    /// Returns the payload bytes held by the batch.
    #[must_use]
    pub fn data_size(&self) -> usize {
        self.data_size
    }

    /// Returns all entries in staging order.
    #[must_use]
    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    /// Returns the log markers in staging order.
    pub fn log_data(&self) -> impl Iterator<Item = &[u8]> {
        self.entries.iter().filter_map(|entry| match entry {
            BatchEntry::LogData(data) => Some(data.as_slice()),
            _ => None,
        })
    }

    /// Looks up the latest staged write for `key`.
    ///
    /// Returns `None` if the batch does not touch the key,
    /// `Some(None)` if the key is deleted and `Some(Some(value))` otherwise.
    #[must_use]
    pub fn lookup(&self, key: &[u8]) -> Option<Option<&[u8]>> {
        self.index
            .get(key)
            .map(|&position| Self::entry_value(&self.entries[position]))
    }

    /// Returns the first staged write with a key after `lower` and below `upper`.
    #[must_use]
    pub fn next_in_range(
        &self,
        lower: Bound<&[u8]>,
        upper: &[u8],
    ) -> Option<(&[u8], Option<&[u8]>)> {
        let empty = match lower {
            Bound::Included(start) => start >= upper,
            Bound::Excluded(start) => start >= upper,
            Bound::Unbounded => false,
        };
        if empty {
            return None;
        }
        self.index
            .range::<[u8], _>((lower, Bound::Excluded(upper)))
            .next()
            .map(|(key, &position)| (key.as_slice(), Self::entry_value(&self.entries[position])))
    }

    fn entry_value(entry: &BatchEntry) -> Option<&[u8]> {
        match entry {
            BatchEntry::Put { value, .. } => Some(value.as_slice()),
            _ => None,
        }
    }

    /// Cuts the batch back to its first `len` entries.
    ///
    /// The key index and size accounting are rebuilt for the remaining
    /// entries.
    pub fn truncate(&mut self, len: usize) {
        if len >= self.entries.len() {
            return;
        }
        self.entries.truncate(len);
        self.index.clear();
        self.data_size = 0;
        self.operations = 0;
        for (position, entry) in self.entries.iter().enumerate() {
            if let Some(key) = entry.key() {
                self.index.insert(key.to_vec(), position);
                self.operations += 1;
            }
            self.data_size += entry.size();
        }
    }

    /// Removes every entry while keeping the conflict settings.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
        self.data_size = 0;
        self.operations = 0;
    }
}
