//! Snapshot handles.

use crate::sequence::SequenceNumber;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Tracks which snapshot sequences are still referenced.
///
/// Engines use the registry to learn the oldest sequence any reader can
/// still observe, which bounds version garbage collection.
#[derive(Debug, Default)]
pub struct SnapshotRegistry {
    live: Mutex<BTreeMap<SequenceNumber, usize>>,
}

impl SnapshotRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a new snapshot at `sequence`.
    pub fn acquire(self: &Arc<Self>, sequence: SequenceNumber) -> Snapshot {
        *self.live.lock().entry(sequence).or_insert(0) += 1;
        Snapshot {
            sequence,
            registry: Arc::clone(self),
        }
    }

    /// Returns the oldest live snapshot sequence, if any.
    #[must_use]
    pub fn oldest(&self) -> Option<SequenceNumber> {
        self.live.lock().keys().next().copied()
    }

    /// Returns the number of live snapshot handles.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.lock().values().sum()
    }

    fn release(&self, sequence: SequenceNumber) {
        let mut live = self.live.lock();
        if let Some(count) = live.get_mut(&sequence) {
            *count -= 1;
            if *count == 0 {
                live.remove(&sequence);
            }
        }
    }
}

/// An immutable, sequence-numbered read view.
///
/// Dropping the handle releases the registration. Cloning registers a
/// second handle on the same sequence.
pub struct Snapshot {
    sequence: SequenceNumber,
    registry: Arc<SnapshotRegistry>,
}

impl Snapshot {
    /// Returns the sequence number this snapshot reads at.
    #[must_use]
    pub fn sequence(&self) -> SequenceNumber {
        self.sequence
    }
}

impl Clone for Snapshot {
    fn clone(&self) -> Self {
        self.registry.acquire(self.sequence)
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.registry.release(self.sequence);
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("sequence", &self.sequence)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_releases_registration() {
        let registry = SnapshotRegistry::new();
        let a = registry.acquire(SequenceNumber::new(3));
        let b = registry.acquire(SequenceNumber::new(7));
        assert_eq!(registry.oldest(), Some(SequenceNumber::new(3)));

        drop(a);
        assert_eq!(registry.oldest(), Some(SequenceNumber::new(7)));
        drop(b);
        assert_eq!(registry.oldest(), None);
    }

    #[test]
    fn clone_holds_its_own_registration() {
        let registry = SnapshotRegistry::new();
        let a = registry.acquire(SequenceNumber::new(1));
        let b = a.clone();
        assert_eq!(registry.live_count(), 2);

        drop(a);
        assert_eq!(registry.oldest(), Some(SequenceNumber::new(1)));
        drop(b);
        assert_eq!(registry.live_count(), 0);
    }
}
