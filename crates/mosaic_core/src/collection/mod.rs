//! Collections and their commit-consistent metadata.
//!
//! A [`Collection`] owns the state shared by every transaction touching
//! it: the collection lock, document counters, the revision tree and index
//! estimators. Transactions change counters through buffered,
//! sequence-tagged adjustments; [`Collection::serialize_meta`] folds them
//! up to the committable sequence and persists the result.

mod estimator;
mod lock;
mod metadata;

pub use estimator::{IndexEstimator, SelectivityEstimator};
pub use lock::{AccessMode, CollectionLock};
pub use metadata::{BufferedAdjustment, CollectionMetadata, DocCount};

use crate::config::Config;
use crate::error::CoreResult;
use crate::keys;
use crate::revision_tree::{RevisionTree, RevisionTreeBuffer};
use crate::types::{CollectionId, IndexId, RevisionId, SequenceNumber, TransactionId};
use mosaic_storage::{KeyValueEngine, WriteBatch};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Operation replayed from the engine's log during recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveredOperation {
    /// A document revision was inserted.
    Insert(RevisionId),
    /// A document revision was removed.
    Remove(RevisionId),
    /// A document revision replaced another.
    Replace {
        /// The removed revision.
        old: RevisionId,
        /// The inserted revision.
        new: RevisionId,
    },
    /// Every document was removed.
    Truncate,
}

/// Everything one commit changed in a collection.
#[derive(Debug, Default)]
pub(crate) struct CommitChanges {
    pub delta: i64,
    pub revision: RevisionId,
    pub truncated: bool,
    pub inserted: Vec<RevisionId>,
    pub removed: Vec<RevisionId>,
    pub index_inserts: BTreeMap<IndexId, Vec<u64>>,
    pub index_removes: BTreeMap<IndexId, Vec<u64>>,
}

/// Result of one metadata sync pass over a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataSync {
    /// The synced collection.
    pub collection: CollectionId,
    /// Sequence up to which buffers were folded.
    pub committable: SequenceNumber,
    /// True if any buffered change was folded.
    pub did_work: bool,
    /// True if metadata was written to the engine.
    pub persisted: bool,
}

/// A document collection registered with a database.
pub struct Collection {
    id: CollectionId,
    name: String,
    engine: Arc<dyn KeyValueEngine>,
    lock: CollectionLock,
    meta: CollectionMetadata,
    tree: RevisionTree,
    tree_buffer: Mutex<RevisionTreeBuffer>,
    estimators: RwLock<BTreeMap<IndexId, Arc<dyn IndexEstimator>>>,
    sync_lock: Mutex<()>,
    persisted: AtomicBool,
}

impl Collection {
    /// Opens a collection, restoring persisted counters and revision tree.
    pub(crate) fn open(
        engine: Arc<dyn KeyValueEngine>,
        id: CollectionId,
        name: impl Into<String>,
        config: &Config,
    ) -> CoreResult<Self> {
        let snapshot = engine.snapshot();
        let count = engine
            .get(&snapshot, &keys::counter_key(id))?
            .map(|bytes| CollectionMetadata::decode_count(id, &bytes))
            .transpose()?;
        let tree = match engine.get(&snapshot, &keys::tree_key(id))? {
            Some(bytes) => RevisionTree::from_bytes(&bytes)?,
            None => RevisionTree::new(config.revision_tree_depth, config.revision_tree_branching_bits)?,
        };
        drop(snapshot);

        let persisted = count.is_some();
        let count = count.unwrap_or_default();
        Ok(Self {
            id,
            name: name.into(),
            engine,
            lock: CollectionLock::new(),
            meta: CollectionMetadata::with_count(id, count),
            tree,
            tree_buffer: Mutex::new(RevisionTreeBuffer::with_applied_seq(count.committed_seq)),
            estimators: RwLock::new(BTreeMap::new()),
            sync_lock: Mutex::new(()),
            persisted: AtomicBool::new(persisted),
        })
    }

    /// Returns the collection id.
    #[must_use]
    pub fn id(&self) -> CollectionId {
        self.id
    }

    /// Returns the collection name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the live number of documents.
    #[must_use]
    pub fn number_documents(&self) -> u64 {
        self.meta.number_documents()
    }

    /// Returns the folded document count.
    #[must_use]
    pub fn document_count(&self) -> DocCount {
        self.meta.document_count()
    }

    /// Returns the collection's counters and blockers.
    #[must_use]
    pub fn metadata(&self) -> &CollectionMetadata {
        &self.meta
    }

    /// Returns the sequence up to which the live revision tree is current.
    #[must_use]
    pub fn tree_applied_seq(&self) -> SequenceNumber {
        self.tree_buffer.lock().applied_seq()
    }

    pub(crate) fn lock(&self, mode: AccessMode, timeout: Duration) -> bool {
        self.lock.lock(mode, timeout)
    }

    pub(crate) fn unlock(&self, mode: AccessMode) {
        self.lock.unlock(mode);
    }

    /// Returns true if any transaction holds the collection lock.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    /// Returns the revision tree as of `as_of`.
    ///
    /// Returns `None` if a commit at or below `as_of` may still be in
    /// flight, or if the live tree has already moved past `as_of`.
    ///
    /// # Errors
    ///
    /// Returns an error if a buffered update does not match the tree.
    pub fn revision_tree(&self, as_of: SequenceNumber) -> CoreResult<Option<RevisionTree>> {
        let committable = self.meta.committable_seq(self.engine.latest_sequence());
        if as_of > committable {
            return Ok(None);
        }
        let buffer = self.tree_buffer.lock();
        if as_of < buffer.applied_seq() {
            return Ok(None);
        }
        let tree = self.tree.clone();
        buffer.apply_copy(&tree, as_of)?;
        Ok(Some(tree))
    }

    /// Registers an index estimator.
    pub fn register_estimator(&self, index: IndexId, estimator: Arc<dyn IndexEstimator>) {
        self.estimators.write().insert(index, estimator);
    }

    /// Returns a registered estimator.
    #[must_use]
    pub fn estimator(&self, index: IndexId) -> Option<Arc<dyn IndexEstimator>> {
        self.estimators.read().get(&index).cloned()
    }

    /// Buffers the changes of the commit at `seq` and releases the
    /// transaction's blocker.
    pub(crate) fn buffer_commit(
        &self,
        transaction: TransactionId,
        seq: SequenceNumber,
        changes: CommitChanges,
    ) {
        self.meta
            .adjust_number_documents(seq, changes.revision, changes.delta);

        {
            let mut buffer = self.tree_buffer.lock();
            if changes.truncated {
                buffer.buffer_truncate(seq);
            }
            buffer.buffer_updates(seq, changes.inserted, changes.removed);
        }

        if changes.truncated || !changes.index_inserts.is_empty() || !changes.index_removes.is_empty() {
            let estimators = self.estimators.read();
            for (index, estimator) in estimators.iter() {
                if changes.truncated {
                    estimator.buffer_truncate(seq);
                }
                let inserts = changes.index_inserts.get(index).cloned().unwrap_or_default();
                let removes = changes.index_removes.get(index).cloned().unwrap_or_default();
                if !inserts.is_empty() || !removes.is_empty() {
                    estimator.buffer_updates(seq, inserts, removes);
                }
            }
        }

        self.meta.remove_blocker(transaction);
    }

    /// Folds buffered changes up to the committable sequence and persists
    /// counters, revision tree and estimators when needed.
    ///
    /// Metadata is written when `force` is set, when folding did work,
    /// when the collection was never persisted, or on a random one in
    /// `sample_rate` calls.
    ///
    /// # Errors
    ///
    /// Returns an error if folding a tree update fails or the engine
    /// rejects the metadata batch.
    pub fn serialize_meta(&self, force: bool, sample_rate: u32) -> CoreResult<MetadataSync> {
        let _sync = self.sync_lock.lock();
        let committable = self.meta.committable_seq(self.engine.latest_sequence());

        let mut did_work = self.meta.apply_adjustments(committable);
        did_work |= self.tree_buffer.lock().apply(&self.tree, committable)?;
        let estimators: Vec<(IndexId, Arc<dyn IndexEstimator>)> = self
            .estimators
            .read()
            .iter()
            .map(|(index, estimator)| (*index, Arc::clone(estimator)))
            .collect();
        for (_, estimator) in &estimators {
            did_work |= estimator.apply_updates(committable);
        }

        let sampled = sample_rate > 0 && rand::thread_rng().gen_ratio(1, sample_rate);
        let persist = force || did_work || !self.persisted.load(Ordering::Acquire) || sampled;
        if persist {
            let mut batch = WriteBatch::new();
            batch.put(keys::counter_key(self.id), self.meta.encode_count()?);
            batch.put(keys::tree_key(self.id), self.tree.to_bytes()?);
            for (index, estimator) in &estimators {
                batch.put(keys::estimator_key(self.id, *index), estimator.serialize()?);
            }
            self.engine.commit(&batch)?;
            self.persisted.store(true, Ordering::Release);
        }

        tracing::debug!(
            collection = %self.id,
            %committable,
            did_work,
            persisted = persist,
            "synced collection metadata"
        );
        Ok(MetadataSync {
            collection: self.id,
            committable,
            did_work,
            persisted: persist,
        })
    }

    /// Applies an operation found in the engine's log during recovery.
    ///
    /// Returns false if the persisted metadata already covers `seq`.
    ///
    /// # Errors
    ///
    /// Returns an error if a recovered removal does not match the tree.
    pub fn recovery_apply(&self, seq: SequenceNumber, operation: RecoveredOperation) -> CoreResult<bool> {
        let (revision, delta) = match operation {
            RecoveredOperation::Insert(rev) => (rev, 1),
            RecoveredOperation::Remove(rev) => (rev, -1),
            RecoveredOperation::Replace { new, .. } => (new, 0),
            RecoveredOperation::Truncate => {
                let live = i64::try_from(self.meta.document_count().number_documents()).unwrap_or(i64::MAX);
                (RevisionId::default(), -live)
            }
        };
        if !self.meta.apply_recovered(seq, revision, delta) {
            return Ok(false);
        }
        match operation {
            RecoveredOperation::Insert(rev) => self.tree.insert(rev.as_u64()),
            RecoveredOperation::Remove(rev) => self.tree.remove(rev.as_u64())?,
            RecoveredOperation::Replace { old, new } => {
                self.tree.remove(old.as_u64())?;
                self.tree.insert(new.as_u64());
            }
            RecoveredOperation::Truncate => self.tree.clear(),
        }
        Ok(true)
    }
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("number_documents", &self.number_documents())
            .field("tree", &self.tree)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mosaic_storage::InMemoryEngine;

    fn config() -> Config {
        Config::new().revision_tree_shape(3, 2).metadata_sample_rate(0)
    }

    fn open(engine: &Arc<InMemoryEngine>) -> Collection {
        let engine: Arc<dyn KeyValueEngine> = Arc::clone(engine) as Arc<dyn KeyValueEngine>;
        Collection::open(engine, CollectionId::new(1), "docs", &config()).unwrap()
    }

    fn bump(engine: &InMemoryEngine, n: u8) -> SequenceNumber {
        let mut batch = WriteBatch::new();
        batch.put(vec![0xff, n], vec![n]);
        engine.commit(&batch).unwrap()
    }

    fn inserts(revs: &[u64]) -> CommitChanges {
        CommitChanges {
            delta: revs.len() as i64,
            revision: RevisionId::new(revs.last().copied().unwrap_or_default()),
            inserted: revs.iter().copied().map(RevisionId::new).collect(),
            ..CommitChanges::default()
        }
    }

    #[test]
    fn sync_folds_and_persists() {
        let engine = Arc::new(InMemoryEngine::new());
        let coll = open(&engine);
        let txn = TransactionId::new(1);

        coll.metadata().place_blocker(txn, engine.latest_sequence().next());
        let seq = bump(&engine, 1);
        coll.buffer_commit(txn, seq, inserts(&[10, 11]));

        let sync = coll.serialize_meta(false, 0).unwrap();
        assert!(sync.did_work);
        assert!(sync.persisted);
        assert_eq!(coll.document_count().number_documents(), 2);
        assert_eq!(coll.tree_applied_seq(), sync.committable);

        let reopened = open(&engine);
        assert_eq!(reopened.number_documents(), 2);
        assert_eq!(
            reopened.revision_tree(engine.latest_sequence()).unwrap().unwrap().root_hash(),
            coll.revision_tree(engine.latest_sequence()).unwrap().unwrap().root_hash()
        );
    }

    #[test]
    fn idle_sync_skips_persisting_once_written() {
        let engine = Arc::new(InMemoryEngine::new());
        let coll = open(&engine);
        assert!(coll.serialize_meta(false, 0).unwrap().persisted);
        assert!(!coll.serialize_meta(false, 0).unwrap().persisted);
        assert!(coll.serialize_meta(true, 0).unwrap().persisted);
    }

    #[test]
    fn revision_tree_is_unavailable_behind_a_blocker() {
        let engine = Arc::new(InMemoryEngine::new());
        let coll = open(&engine);
        let early = bump(&engine, 1);
        coll.metadata().place_blocker(TransactionId::new(9), engine.latest_sequence().next());
        bump(&engine, 2);

        assert!(coll.revision_tree(early).unwrap().is_some());
        assert!(coll.revision_tree(engine.latest_sequence()).unwrap().is_none());
    }

    #[test]
    fn revision_tree_applies_buffers_up_to_as_of() {
        let engine = Arc::new(InMemoryEngine::new());
        let coll = open(&engine);
        let first = bump(&engine, 1);
        coll.buffer_commit(TransactionId::new(1), first, inserts(&[1]));
        let second = bump(&engine, 2);
        coll.buffer_commit(TransactionId::new(2), second, inserts(&[2]));

        assert_eq!(coll.revision_tree(first).unwrap().unwrap().count(), 1);
        assert_eq!(coll.revision_tree(second).unwrap().unwrap().count(), 2);

        coll.serialize_meta(false, 0).unwrap();
        assert!(coll.revision_tree(first).unwrap().is_none());
    }

    #[test]
    fn recovery_skips_covered_sequences() {
        let engine = Arc::new(InMemoryEngine::new());
        let coll = open(&engine);
        let seq = bump(&engine, 1);
        coll.buffer_commit(TransactionId::new(1), seq, inserts(&[5]));
        coll.serialize_meta(true, 0).unwrap();

        let reopened = open(&engine);
        assert!(!reopened
            .recovery_apply(seq, RecoveredOperation::Insert(RevisionId::new(5)))
            .unwrap());
        let later = bump(&engine, 2);
        assert!(reopened
            .recovery_apply(later, RecoveredOperation::Replace {
                old: RevisionId::new(5),
                new: RevisionId::new(6),
            })
            .unwrap());
        assert_eq!(reopened.number_documents(), 1);
    }

    #[test]
    fn estimator_updates_are_buffered_with_commits() {
        let engine = Arc::new(InMemoryEngine::new());
        let coll = open(&engine);
        let est = Arc::new(SelectivityEstimator::new());
        coll.register_estimator(IndexId::new(1), Arc::clone(&est) as Arc<dyn IndexEstimator>);

        let seq = bump(&engine, 1);
        let mut changes = inserts(&[1, 2]);
        changes.index_inserts.insert(IndexId::new(1), vec![7, 7]);
        coll.buffer_commit(TransactionId::new(1), seq, changes);
        assert_eq!(est.total(), 0);

        coll.serialize_meta(false, 0).unwrap();
        assert_eq!(est.total(), 2);
        assert!((est.selectivity() - 0.5).abs() < f64::EPSILON);
    }
}
