//! Cursors over a transaction's view of the engine.

use mosaic_storage::{EngineIterator, KeyRange};
use std::fmt;

/// Cursor merging a snapshot with the transaction's own staged writes.
///
/// The iterator remembers the methods generation it was built for and
/// the last key it returned. If an intermediate commit rotated the
/// snapshot in between, the next step rebuilds the engine cursor on the
/// new snapshot and re-seeks just past the last key, so iteration neither
/// repeats nor skips keys.
pub struct TransactionIterator {
    pub(crate) range: KeyRange,
    pub(crate) read_own_writes: bool,
    pub(crate) generation: u64,
    pub(crate) last_key: Option<Vec<u8>>,
    pub(crate) inner: Option<Box<dyn EngineIterator>>,
    pub(crate) peeked: Option<(Vec<u8>, Vec<u8>)>,
}

impl TransactionIterator {
    pub(crate) fn new(range: KeyRange, read_own_writes: bool, generation: u64) -> Self {
        Self {
            range,
            read_own_writes,
            generation,
            last_key: None,
            inner: None,
            peeked: None,
        }
    }

    /// Returns the range being iterated.
    #[must_use]
    pub fn range(&self) -> &KeyRange {
        &self.range
    }

    /// Returns the last key returned.
    #[must_use]
    pub fn last_key(&self) -> Option<&[u8]> {
        self.last_key.as_deref()
    }

    pub(crate) fn invalidate(&mut self, generation: u64) {
        self.inner = None;
        self.peeked = None;
        self.generation = generation;
    }
}

impl fmt::Debug for TransactionIterator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionIterator")
            .field("range", &self.range)
            .field("read_own_writes", &self.read_own_writes)
            .field("generation", &self.generation)
            .field("last_key", &self.last_key)
            .finish_non_exhaustive()
    }
}
