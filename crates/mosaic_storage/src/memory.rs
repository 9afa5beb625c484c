//! In-memory multi-version engine.

use crate::batch::{BatchEntry, WriteBatch};
use crate::engine::{EngineIterator, KeyRange, KeyValueEngine};
use crate::error::{StorageError, StorageResult};
use crate::sequence::SequenceNumber;
use crate::snapshot::{Snapshot, SnapshotRegistry};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::trace;

/// A log marker committed together with a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// The sequence of the batch that carried the marker.
    pub sequence: SequenceNumber,
    /// The marker payload.
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
struct Version {
    sequence: SequenceNumber,
    value: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
struct EngineState {
    /// Versions per key, ascending by sequence.
    versions: BTreeMap<Vec<u8>, Vec<Version>>,
    latest: SequenceNumber,
    log: Vec<LogRecord>,
}

impl EngineState {
    fn visible(&self, key: &[u8], at: SequenceNumber) -> Option<&Vec<u8>> {
        self.versions
            .get(key)
            .and_then(|versions| Self::visible_in(versions, at))
    }

    fn visible_in(versions: &[Version], at: SequenceNumber) -> Option<&Vec<u8>> {
        versions
            .iter()
            .rev()
            .find(|v| v.sequence <= at)
            .and_then(|v| v.value.as_ref())
    }
}

/// An ordered multi-version key-value store held in memory.
///
/// Every committed batch gets the next sequence number. Each key keeps the
/// list of its versions so snapshots can read any committed point in time.
/// Versions that no live snapshot can observe are removed by
/// [`InMemoryEngine::compact`].
///
/// # Thread Safety
///
/// Reads take a shared lock; commits take the exclusive lock, which also
/// serializes conflict detection with sequence assignment.
///
/// # Example
///
/// ```rust
/// use mosaic_storage::{InMemoryEngine, KeyValueEngine, WriteBatch};
///
/// let engine = InMemoryEngine::new();
/// let before = engine.snapshot();
///
/// let mut batch = WriteBatch::new();
/// batch.put(b"k".to_vec(), b"v".to_vec());
/// engine.commit(&batch).unwrap();
///
/// assert_eq!(engine.get(&before, b"k").unwrap(), None);
/// assert!(engine.get(&engine.snapshot(), b"k").unwrap().is_some());
/// ```
#[derive(Debug)]
pub struct InMemoryEngine {
    state: Arc<RwLock<EngineState>>,
    snapshots: Arc<SnapshotRegistry>,
    injected_failures: AtomicUsize,
}

impl Default for InMemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEngine {
    /// Creates an empty engine.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(EngineState::default())),
            snapshots: SnapshotRegistry::new(),
            injected_failures: AtomicUsize::new(0),
        }
    }

    /// Makes the next `count` commits fail with [`StorageError::InjectedFailure`].
    ///
    /// Useful for testing the abort path after a failed physical commit.
    pub fn fail_next_commits(&self, count: usize) {
        self.injected_failures.store(count, Ordering::SeqCst);
    }

    /// Returns the log markers committed after `after`.
    #[must_use]
    pub fn log_records_since(&self, after: SequenceNumber) -> Vec<LogRecord> {
        self.state
            .read()
            .log
            .iter()
            .filter(|record| record.sequence > after)
            .cloned()
            .collect()
    }

    /// Returns the oldest sequence still held by a snapshot.
    #[must_use]
    pub fn oldest_snapshot(&self) -> Option<SequenceNumber> {
        self.snapshots.oldest()
    }

    /// Returns the number of live snapshot handles.
    #[must_use]
    pub fn live_snapshots(&self) -> usize {
        self.snapshots.live_count()
    }

    /// Returns the number of keys with a live (non-deleted) latest version.
    #[must_use]
    pub fn live_key_count(&self) -> usize {
        let state = self.state.read();
        state
            .versions
            .values()
            .filter(|versions| versions.last().is_some_and(|v| v.value.is_some()))
            .count()
    }

    /// Drops versions that no live snapshot can observe.
    ///
    /// Returns the number of versions removed.
    pub fn compact(&self) -> usize {
        let mut state = self.state.write();
        let horizon = self.snapshots.oldest().unwrap_or(state.latest);
        let mut removed = 0;

        state.versions.retain(|_, versions| {
            // Keep the newest version at or below the horizon and everything above it.
            let keep_from = versions
                .iter()
                .rposition(|v| v.sequence <= horizon)
                .unwrap_or(0);
            removed += keep_from;
            versions.drain(..keep_from);

            let only_tombstone = versions.len() == 1
                && versions[0].value.is_none()
                && versions[0].sequence <= horizon;
            if only_tombstone {
                removed += 1;
            }
            !only_tombstone
        });

        trace!(removed, horizon = horizon.as_u64(), "compacted in-memory engine");
        removed
    }

    fn check_conflicts(state: &EngineState, batch: &WriteBatch) -> StorageResult<()> {
        let read_sequence = match batch.read_sequence() {
            Some(seq) if !batch.is_exclusive() => seq,
            _ => return Ok(()),
        };
        for entry in batch.entries() {
            let key = match entry {
                BatchEntry::Put { key, .. } | BatchEntry::Delete { key } => key,
                BatchEntry::LogData(_) => continue,
            };
            let newest = state
                .versions
                .get(key)
                .and_then(|versions| versions.last())
                .map(|v| v.sequence);
            if newest.is_some_and(|seq| seq > read_sequence) {
                return Err(StorageError::Conflict { key: key.clone() });
            }
        }
        Ok(())
    }
}

impl KeyValueEngine for InMemoryEngine {
    fn snapshot(&self) -> Snapshot {
        // Hold the read lock so no commit slips between reading and registering.
        let state = self.state.read();
        self.snapshots.acquire(state.latest)
    }

    fn get(&self, snapshot: &Snapshot, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.state.read().visible(key, snapshot.sequence()).cloned())
    }

    fn multi_get(&self, snapshot: &Snapshot, keys: &[&[u8]]) -> StorageResult<Vec<Option<Vec<u8>>>> {
        let state = self.state.read();
        Ok(keys
            .iter()
            .map(|key| state.visible(key, snapshot.sequence()).cloned())
            .collect())
    }

    fn iterator(&self, snapshot: &Snapshot, range: KeyRange) -> StorageResult<Box<dyn EngineIterator>> {
        let position = range.start.clone();
        Ok(Box::new(InMemoryIterator {
            state: Arc::clone(&self.state),
            snapshot: snapshot.clone(),
            range,
            position: Bound::Included(position),
        }))
    }

    fn commit(&self, batch: &WriteBatch) -> StorageResult<SequenceNumber> {
        let mut state = self.state.write();

        let injected = self
            .injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(StorageError::InjectedFailure);
        }

        Self::check_conflicts(&state, batch)?;

        if batch.operation_count() == 0 {
            let latest = state.latest;
            for data in batch.log_data() {
                state.log.push(LogRecord {
                    sequence: latest,
                    data: data.to_vec(),
                });
            }
            return Ok(latest);
        }

        let sequence = state.latest.next();
        for entry in batch.entries() {
            match entry {
                BatchEntry::Put { key, value } => {
                    state.versions.entry(key.clone()).or_default().push(Version {
                        sequence,
                        value: Some(value.clone()),
                    });
                }
                BatchEntry::Delete { key } => {
                    state.versions.entry(key.clone()).or_default().push(Version {
                        sequence,
                        value: None,
                    });
                }
                BatchEntry::LogData(data) => state.log.push(LogRecord {
                    sequence,
                    data: data.clone(),
                }),
            }
        }
        state.latest = sequence;

        trace!(
            sequence = sequence.as_u64(),
            entries = batch.len(),
            "committed write batch"
        );
        Ok(sequence)
    }

    fn latest_sequence(&self) -> SequenceNumber {
        self.state.read().latest
    }
}

/// Cursor over the in-memory engine.
///
/// The cursor re-reads the shared version map on every step, so it stays
/// valid while commits happen; the held snapshot keeps its view stable.
struct InMemoryIterator {
    state: Arc<RwLock<EngineState>>,
    snapshot: Snapshot,
    range: KeyRange,
    position: Bound<Vec<u8>>,
}

impl EngineIterator for InMemoryIterator {
    fn seek(&mut self, target: &[u8]) {
        let target = if target < self.range.start.as_slice() {
            self.range.start.clone()
        } else {
            target.to_vec()
        };
        self.position = Bound::Included(target);
    }

    fn next_entry(&mut self) -> StorageResult<Option<(Vec<u8>, Vec<u8>)>> {
        let lower = match &self.position {
            Bound::Included(key) | Bound::Excluded(key) if key.as_slice() >= self.range.end.as_slice() => {
                return Ok(None)
            }
            Bound::Included(key) => Bound::Included(key.as_slice()),
            Bound::Excluded(key) => Bound::Excluded(key.as_slice()),
            Bound::Unbounded => Bound::Unbounded,
        };

        let state = self.state.read();
        let at = self.snapshot.sequence();
        let found = state
            .versions
            .range::<[u8], _>((lower, Bound::Excluded(self.range.end.as_slice())))
            .find_map(|(key, versions)| {
                EngineState::visible_in(versions, at).map(|value| (key.clone(), value.clone()))
            });
        drop(state);

        if let Some((key, _)) = &found {
            self.position = Bound::Excluded(key.clone());
        } else {
            self.position = Bound::Included(self.range.end.clone());
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(engine: &InMemoryEngine, key: &[u8], value: &[u8]) -> SequenceNumber {
        let mut batch = WriteBatch::new();
        batch.put(key.to_vec(), value.to_vec());
        engine.commit(&batch).unwrap()
    }

    #[test]
    fn sequences_increase_per_batch() {
        let engine = InMemoryEngine::new();
        let s1 = put(&engine, b"a", b"1");
        let s2 = put(&engine, b"b", b"2");
        assert!(s2 > s1);
        assert_eq!(engine.latest_sequence(), s2);
    }

    #[test]
    fn empty_batch_does_not_consume_sequence() {
        let engine = InMemoryEngine::new();
        let s1 = put(&engine, b"a", b"1");
        let mut batch = WriteBatch::new();
        batch.put_log_data(b"marker".to_vec());
        assert_eq!(engine.commit(&batch).unwrap(), s1);
        assert_eq!(engine.log_records_since(SequenceNumber::ZERO).len(), 1);
    }

    #[test]
    fn snapshot_reads_are_stable() {
        let engine = InMemoryEngine::new();
        put(&engine, b"k", b"old");
        let snapshot = engine.snapshot();
        put(&engine, b"k", b"new");

        assert_eq!(engine.get(&snapshot, b"k").unwrap(), Some(b"old".to_vec()));
        assert_eq!(
            engine.get(&engine.snapshot(), b"k").unwrap(),
            Some(b"new".to_vec())
        );
    }

    #[test]
    fn delete_hides_key_for_later_snapshots() {
        let engine = InMemoryEngine::new();
        put(&engine, b"k", b"v");
        let before = engine.snapshot();
        let mut batch = WriteBatch::new();
        batch.delete(b"k".to_vec());
        engine.commit(&batch).unwrap();

        assert!(engine.get(&before, b"k").unwrap().is_some());
        assert!(engine.get(&engine.snapshot(), b"k").unwrap().is_none());
    }

    #[test]
    fn conflict_detected_after_read_sequence() {
        let engine = InMemoryEngine::new();
        let snapshot = engine.snapshot();
        put(&engine, b"k", b"theirs");

        let mut batch = WriteBatch::with_read_sequence(snapshot.sequence());
        batch.put(b"k".to_vec(), b"mine".to_vec());
        let err = engine.commit(&batch).unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn exclusive_batch_skips_conflict_check() {
        let engine = InMemoryEngine::new();
        let snapshot = engine.snapshot();
        put(&engine, b"k", b"theirs");

        let mut batch = WriteBatch::with_read_sequence(snapshot.sequence());
        batch.set_exclusive(true);
        batch.put(b"k".to_vec(), b"mine".to_vec());
        assert!(engine.commit(&batch).is_ok());
    }

    #[test]
    fn injected_failure_fails_once() {
        let engine = InMemoryEngine::new();
        engine.fail_next_commits(1);
        let mut batch = WriteBatch::new();
        batch.put(b"k".to_vec(), b"v".to_vec());
        assert!(matches!(
            engine.commit(&batch),
            Err(StorageError::InjectedFailure)
        ));
        assert!(engine.commit(&batch).is_ok());
    }

    #[test]
    fn iterator_respects_range_and_snapshot() {
        let engine = InMemoryEngine::new();
        put(&engine, b"a", b"1");
        put(&engine, b"b", b"2");
        put(&engine, b"c", b"3");
        let snapshot = engine.snapshot();
        put(&engine, b"bb", b"late");

        let mut it = engine
            .iterator(&snapshot, KeyRange::new(b"b".to_vec(), b"d".to_vec()))
            .unwrap();
        let mut keys = Vec::new();
        while let Some((key, _)) = it.next_entry().unwrap() {
            keys.push(key);
        }
        assert_eq!(keys, vec![b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn iterator_seek_repositions() {
        let engine = InMemoryEngine::new();
        for key in [b"a", b"b", b"c"] {
            put(&engine, key, b"x");
        }
        let snapshot = engine.snapshot();
        let mut it = engine
            .iterator(&snapshot, KeyRange::new(b"a".to_vec(), b"z".to_vec()))
            .unwrap();
        it.seek(b"b");
        assert_eq!(it.next_entry().unwrap().map(|(k, _)| k), Some(b"b".to_vec()));
    }

    #[test]
    fn compact_keeps_versions_visible_to_snapshots() {
        let engine = InMemoryEngine::new();
        put(&engine, b"k", b"1");
        let snapshot = engine.snapshot();
        put(&engine, b"k", b"2");
        put(&engine, b"k", b"3");

        let removed = engine.compact();
        assert_eq!(removed, 0);
        assert_eq!(engine.get(&snapshot, b"k").unwrap(), Some(b"1".to_vec()));

        drop(snapshot);
        assert_eq!(engine.compact(), 2);
        assert_eq!(
            engine.get(&engine.snapshot(), b"k").unwrap(),
            Some(b"3".to_vec())
        );
    }

    #[test]
    fn compact_drops_dead_tombstones() {
        let engine = InMemoryEngine::new();
        put(&engine, b"k", b"1");
        let mut batch = WriteBatch::new();
        batch.delete(b"k".to_vec());
        engine.commit(&batch).unwrap();

        assert_eq!(engine.compact(), 2);
        assert_eq!(engine.live_key_count(), 0);
    }

    proptest::proptest! {
        #[test]
        fn snapshots_survive_later_writes_and_compaction(
            before in proptest::collection::vec((0u8..8, proptest::option::of(0u8..=255)), 0..32),
            after in proptest::collection::vec((0u8..8, proptest::option::of(0u8..=255)), 0..32),
        ) {
            let engine = InMemoryEngine::new();
            let mut model = std::collections::BTreeMap::new();
            let apply = |writes: &[(u8, Option<u8>)], model: &mut std::collections::BTreeMap<u8, u8>| {
                for (key, value) in writes {
                    let mut batch = WriteBatch::new();
                    match value {
                        Some(v) => {
                            batch.put(vec![*key], vec![*v]);
                            model.insert(*key, *v);
                        }
                        None => {
                            batch.delete(vec![*key]);
                            model.remove(key);
                        }
                    }
                    engine.commit(&batch).unwrap();
                }
            };

            apply(&before, &mut model);
            let snapshot = engine.snapshot();
            let seen = model.clone();
            apply(&after, &mut model);
            engine.compact();

            for key in 0u8..8 {
                proptest::prop_assert_eq!(
                    engine.get(&snapshot, &[key]).unwrap(),
                    seen.get(&key).map(|v| vec![*v])
                );
                proptest::prop_assert_eq!(
                    engine.get(&engine.snapshot(), &[key]).unwrap(),
                    model.get(&key).map(|v| vec![*v])
                );
            }
        }
    }
}
