//! Document counters, commit blockers and the committable watermark.

use crate::error::{CoreError, CoreResult};
use crate::types::{CollectionId, RevisionId, SequenceNumber, TransactionId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

/// Folded document count of a collection.
///
/// Reflects every commit up to `committed_seq`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DocCount {
    /// Sequence up to which adjustments are folded.
    pub committed_seq: SequenceNumber,
    /// Documents added.
    pub added: u64,
    /// Documents removed.
    pub removed: u64,
    /// Last revision seen by a folded adjustment.
    pub last_revision: RevisionId,
}

impl DocCount {
    /// Returns `added - removed`.
    #[must_use]
    pub fn number_documents(&self) -> u64 {
        self.added.saturating_sub(self.removed)
    }

    fn apply(&mut self, adjustment: &BufferedAdjustment) {
        if adjustment.delta >= 0 {
            self.added += adjustment.delta.unsigned_abs();
        } else {
            self.removed += adjustment.delta.unsigned_abs();
        }
        if adjustment.revision != RevisionId::default() {
            self.last_revision = adjustment.revision;
        }
    }
}

/// Document count change of one commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferedAdjustment {
    /// Last revision written by the commit.
    pub revision: RevisionId,
    /// Net change in documents.
    pub delta: i64,
}

/// Persisted form of a [`DocCount`].
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct CounterRecord {
    pub committed_seq: u64,
    pub added: u64,
    pub removed: u64,
    pub last_revision: u64,
}

impl From<DocCount> for CounterRecord {
    fn from(count: DocCount) -> Self {
        Self {
            committed_seq: count.committed_seq.as_u64(),
            added: count.added,
            removed: count.removed,
            last_revision: count.last_revision.as_u64(),
        }
    }
}

impl From<CounterRecord> for DocCount {
    fn from(record: CounterRecord) -> Self {
        Self {
            committed_seq: SequenceNumber::new(record.committed_seq),
            added: record.added,
            removed: record.removed,
            last_revision: RevisionId::new(record.last_revision),
        }
    }
}

#[derive(Debug, Default)]
struct Blockers {
    by_transaction: HashMap<TransactionId, SequenceNumber>,
    by_sequence: BTreeSet<(SequenceNumber, TransactionId)>,
}

/// Counters and in-flight commit bookkeeping of one collection.
///
/// # Invariants
///
/// - A transaction holds at most one blocker, placed before its physical
///   commit at a sequence no greater than its commit sequence.
/// - `committable_seq` never exceeds the oldest blocker minus one, and
///   never decreases for non-decreasing requests.
/// - Adjustments are folded in ascending sequence order, and only once
///   their sequence is committable.
#[derive(Debug)]
pub struct CollectionMetadata {
    collection: CollectionId,
    blockers: Mutex<Blockers>,
    buffered: Mutex<BTreeMap<SequenceNumber, BufferedAdjustment>>,
    count: Mutex<DocCount>,
    live_documents: AtomicU64,
    live_revision: AtomicU64,
}

impl CollectionMetadata {
    /// Creates metadata with zero documents.
    #[must_use]
    pub fn new(collection: CollectionId) -> Self {
        Self::with_count(collection, DocCount::default())
    }

    /// Creates metadata restored from a persisted count.
    #[must_use]
    pub fn with_count(collection: CollectionId, count: DocCount) -> Self {
        Self {
            collection,
            blockers: Mutex::new(Blockers::default()),
            buffered: Mutex::new(BTreeMap::new()),
            live_documents: AtomicU64::new(count.number_documents()),
            live_revision: AtomicU64::new(count.last_revision.as_u64()),
            count: Mutex::new(count),
        }
    }

    /// Places (or moves) the blocker of `transaction` at `seq`.
    pub fn place_blocker(&self, transaction: TransactionId, seq: SequenceNumber) {
        let mut blockers = self.blockers.lock();
        if let Some(previous) = blockers.by_transaction.insert(transaction, seq) {
            blockers.by_sequence.remove(&(previous, transaction));
        }
        blockers.by_sequence.insert((seq, transaction));
        tracing::trace!(collection = %self.collection, %transaction, %seq, "placed blocker");
    }

    /// Removes the blocker of `transaction`, returning true if one existed.
    pub fn remove_blocker(&self, transaction: TransactionId) -> bool {
        let mut blockers = self.blockers.lock();
        match blockers.by_transaction.remove(&transaction) {
            Some(seq) => {
                blockers.by_sequence.remove(&(seq, transaction));
                tracing::trace!(collection = %self.collection, %transaction, %seq, "removed blocker");
                true
            }
            None => false,
        }
    }

    /// Returns true if `transaction` holds a blocker.
    #[must_use]
    pub fn has_blocker(&self, transaction: TransactionId) -> bool {
        self.blockers.lock().by_transaction.contains_key(&transaction)
    }

    /// Returns the number of blockers.
    #[must_use]
    pub fn blocker_count(&self) -> usize {
        self.blockers.lock().by_transaction.len()
    }

    /// Returns the highest sequence at or below `requested` that no
    /// in-flight commit can still land on.
    #[must_use]
    pub fn committable_seq(&self, requested: SequenceNumber) -> SequenceNumber {
        let blockers = self.blockers.lock();
        match blockers.by_sequence.first() {
            Some((oldest, _)) => requested.min(oldest.prev()),
            None => requested,
        }
    }

    /// Records the net document change of the commit at `seq`.
    ///
    /// The live counter changes immediately; the folded count changes
    /// once `seq` becomes committable.
    pub fn adjust_number_documents(&self, seq: SequenceNumber, revision: RevisionId, delta: i64) {
        if delta >= 0 {
            self.live_documents
                .fetch_add(delta.unsigned_abs(), Ordering::AcqRel);
        } else {
            let _ = self
                .live_documents
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    Some(n.saturating_sub(delta.unsigned_abs()))
                });
        }
        if revision != RevisionId::default() {
            self.live_revision.store(revision.as_u64(), Ordering::Release);
        }

        let mut buffered = self.buffered.lock();
        let entry = buffered.entry(seq).or_default();
        entry.delta += delta;
        if revision != RevisionId::default() {
            entry.revision = revision;
        }
    }

    /// Folds every buffered adjustment at or below `committable`.
    ///
    /// Returns true if any adjustment was folded.
    pub fn apply_adjustments(&self, committable: SequenceNumber) -> bool {
        let mut buffered = self.buffered.lock();
        let mut count = self.count.lock();
        let mut did_work = false;
        while let Some(entry) = buffered.first_entry() {
            if *entry.key() > committable {
                break;
            }
            let (seq, adjustment) = entry.remove_entry();
            count.apply(&adjustment);
            count.committed_seq = count.committed_seq.max(seq);
            did_work = true;
        }
        count.committed_seq = count.committed_seq.max(committable);
        did_work
    }

    /// Returns the folded count.
    #[must_use]
    pub fn document_count(&self) -> DocCount {
        *self.count.lock()
    }

    /// Returns the number of adjustments waiting to be folded.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buffered.lock().len()
    }

    /// Returns the live document count.
    #[must_use]
    pub fn number_documents(&self) -> u64 {
        self.live_documents.load(Ordering::Acquire)
    }

    /// Returns the last revision written by a commit.
    #[must_use]
    pub fn last_revision(&self) -> RevisionId {
        RevisionId::new(self.live_revision.load(Ordering::Acquire))
    }

    /// Applies a recovered operation at `seq` directly to the folded count.
    ///
    /// Returns false if the persisted count already covers `seq`.
    pub fn apply_recovered(&self, seq: SequenceNumber, revision: RevisionId, delta: i64) -> bool {
        let mut count = self.count.lock();
        if seq <= count.committed_seq {
            return false;
        }
        count.apply(&BufferedAdjustment { revision, delta });
        count.committed_seq = seq;
        self.live_documents
            .store(count.number_documents(), Ordering::Release);
        self.live_revision
            .store(count.last_revision.as_u64(), Ordering::Release);
        true
    }

    /// Encodes the folded count for persistence.
    pub(crate) fn encode_count(&self) -> CoreResult<Vec<u8>> {
        let record = CounterRecord::from(self.document_count());
        let mut bytes = Vec::new();
        ciborium::into_writer(&record, &mut bytes).map_err(|e| CoreError::codec(e.to_string()))?;
        Ok(bytes)
    }

    /// Decodes a persisted count.
    pub(crate) fn decode_count(collection: CollectionId, bytes: &[u8]) -> CoreResult<DocCount> {
        let record: CounterRecord = ciborium::from_reader(bytes)
            .map_err(|e| CoreError::metadata_corruption(collection, e.to_string()))?;
        if record.removed > record.added {
            return Err(CoreError::metadata_corruption(
                collection,
                format!(
                    "removed count {} exceeds added count {}",
                    record.removed, record.added
                ),
            ));
        }
        Ok(record.into())
    }
}
