//! Per-collection state of a running transaction.

use crate::collection::{AccessMode, Collection, CommitChanges};
use crate::error::{CoreError, CoreResult};
use crate::types::{CollectionId, IndexId, OperationKind, RevisionId, SequenceNumber, TransactionId};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Restorable counters of a [`TransactionCollection`].
#[derive(Debug, Clone, Default)]
pub(crate) struct OperationMark {
    inserts: u64,
    updates: u64,
    removes: u64,
    revision: RevisionId,
    truncated: bool,
    tracked_inserts: usize,
    tracked_removes: usize,
    index_inserts: BTreeMap<IndexId, usize>,
    index_removes: BTreeMap<IndexId, usize>,
}

/// What a transaction did to one collection since its last commit.
#[derive(Debug)]
pub struct TransactionCollection {
    collection: Arc<Collection>,
    access: AccessMode,
    locked: bool,
    inserts: u64,
    updates: u64,
    removes: u64,
    revision: RevisionId,
    truncated: bool,
    tracked_inserts: Vec<RevisionId>,
    tracked_removes: Vec<RevisionId>,
    index_inserts: BTreeMap<IndexId, Vec<u64>>,
    index_removes: BTreeMap<IndexId, Vec<u64>>,
}

impl TransactionCollection {
    pub(crate) fn new(collection: Arc<Collection>, access: AccessMode) -> Self {
        Self {
            collection,
            access,
            locked: false,
            inserts: 0,
            updates: 0,
            removes: 0,
            revision: RevisionId::default(),
            truncated: false,
            tracked_inserts: Vec::new(),
            tracked_removes: Vec::new(),
            index_inserts: BTreeMap::new(),
            index_removes: BTreeMap::new(),
        }
    }

    /// Returns the collection id.
    #[must_use]
    pub fn id(&self) -> CollectionId {
        self.collection.id()
    }

    /// Returns the collection.
    #[must_use]
    pub fn collection(&self) -> &Arc<Collection> {
        &self.collection
    }

    /// Returns the access mode.
    #[must_use]
    pub fn access(&self) -> AccessMode {
        self.access
    }

    /// Returns true if the collection lock is held.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Acquires the collection lock in this collection's access mode.
    ///
    /// # Errors
    ///
    /// Returns `LockTimeout` if the lock is not granted within `timeout`.
    pub fn lock_usage(&mut self, timeout: Duration) -> CoreResult<()> {
        if self.locked {
            return Ok(());
        }
        if !self.collection.lock(self.access, timeout) {
            tracing::warn!(
                collection = %self.id(),
                mode = %self.access,
                ?timeout,
                "timed out waiting for collection lock"
            );
            return Err(CoreError::LockTimeout {
                collection: self.id(),
                timeout,
            });
        }
        self.locked = true;
        Ok(())
    }

    /// Releases the collection lock if held.
    pub fn release_usage(&mut self) {
        if self.locked {
            self.collection.unlock(self.access);
            self.locked = false;
        }
    }

    /// Counts an operation and remembers its revision.
    pub fn add_operation(&mut self, kind: OperationKind, revision: RevisionId) {
        match kind {
            OperationKind::Insert => self.inserts += 1,
            OperationKind::Update | OperationKind::Replace => self.updates += 1,
            OperationKind::Remove => self.removes += 1,
        }
        self.revision = revision;
    }

    /// Records a revision added to the revision tree.
    pub fn track_insert(&mut self, revision: RevisionId) {
        self.tracked_inserts.push(revision);
    }

    /// Records a revision removed from the revision tree.
    pub fn track_remove(&mut self, revision: RevisionId) {
        self.tracked_removes.push(revision);
    }

    /// Records an index value hash inserted.
    pub fn track_index_insert(&mut self, index: IndexId, hash: u64) {
        self.index_inserts.entry(index).or_default().push(hash);
    }

    /// Records an index value hash removed.
    pub fn track_index_remove(&mut self, index: IndexId, hash: u64) {
        self.index_removes.entry(index).or_default().push(hash);
    }

    /// Records a truncate that removed `removed` documents.
    ///
    /// Tree and index changes tracked before the truncate are dropped; the
    /// truncate marker clears them on commit.
    pub fn truncate(&mut self, removed: u64) {
        self.removes += removed;
        self.truncated = true;
        self.tracked_inserts.clear();
        self.tracked_removes.clear();
        self.index_inserts.clear();
        self.index_removes.clear();
    }

    /// Returns the operation counters `(inserts, updates, removes)`.
    #[must_use]
    pub fn operation_counts(&self) -> (u64, u64, u64) {
        (self.inserts, self.updates, self.removes)
    }

    /// Returns true if anything must be applied at commit.
    #[must_use]
    pub fn has_operations(&self) -> bool {
        self.inserts + self.updates + self.removes > 0
            || self.truncated
            || !self.index_inserts.is_empty()
            || !self.index_removes.is_empty()
    }

    /// Places this transaction's blocker if there is anything to commit.
    pub fn prepare_transaction(&self, transaction: TransactionId, seq: SequenceNumber) {
        if self.has_operations() {
            self.collection.metadata().place_blocker(transaction, seq);
        }
    }

    /// Buffers the committed changes at `commit_seq`, releases the blocker
    /// and resets tracked state.
    pub fn commit_counts(&mut self, transaction: TransactionId, commit_seq: SequenceNumber) {
        if !self.has_operations() {
            return;
        }
        let delta = i64::try_from(self.inserts).unwrap_or(i64::MAX)
            - i64::try_from(self.removes).unwrap_or(i64::MAX);
        let changes = CommitChanges {
            delta,
            revision: self.revision,
            truncated: self.truncated,
            inserted: std::mem::take(&mut self.tracked_inserts),
            removed: std::mem::take(&mut self.tracked_removes),
            index_inserts: std::mem::take(&mut self.index_inserts),
            index_removes: std::mem::take(&mut self.index_removes),
        };
        self.collection.buffer_commit(transaction, commit_seq, changes);
        self.reset();
    }

    /// Releases the blocker without buffering anything.
    pub fn abort_commit(&self, transaction: TransactionId) {
        self.collection.metadata().remove_blocker(transaction);
    }

    fn reset(&mut self) {
        self.inserts = 0;
        self.updates = 0;
        self.removes = 0;
        self.truncated = false;
        self.tracked_inserts.clear();
        self.tracked_removes.clear();
        self.index_inserts.clear();
        self.index_removes.clear();
    }

    pub(crate) fn mark(&self) -> OperationMark {
        OperationMark {
            inserts: self.inserts,
            updates: self.updates,
            removes: self.removes,
            revision: self.revision,
            truncated: self.truncated,
            tracked_inserts: self.tracked_inserts.len(),
            tracked_removes: self.tracked_removes.len(),
            index_inserts: self.index_inserts.iter().map(|(i, v)| (*i, v.len())).collect(),
            index_removes: self.index_removes.iter().map(|(i, v)| (*i, v.len())).collect(),
        }
    }

    pub(crate) fn rollback_to(&mut self, mark: &OperationMark) {
        self.inserts = mark.inserts;
        self.updates = mark.updates;
        self.removes = mark.removes;
        self.revision = mark.revision;
        self.truncated = mark.truncated;
        self.tracked_inserts.truncate(mark.tracked_inserts);
        self.tracked_removes.truncate(mark.tracked_removes);
        Self::rollback_index(&mut self.index_inserts, &mark.index_inserts);
        Self::rollback_index(&mut self.index_removes, &mark.index_removes);
    }

    fn rollback_index(tracked: &mut BTreeMap<IndexId, Vec<u64>>, mark: &BTreeMap<IndexId, usize>) {
        tracked.retain(|index, hashes| match mark.get(index) {
            Some(&len) => {
                hashes.truncate(len);
                len > 0
            }
            None => false,
        });
    }
}

impl Drop for TransactionCollection {
    fn drop(&mut self) {
        self.release_usage();
    }
}
