//! Transaction state machine.

use super::collection::{OperationMark, TransactionCollection};
use super::iterator::TransactionIterator;
use super::marker::{CommitMarker, MarkerKind};
use super::methods::TransactionMethods;
use crate::cache::CacheToken;
use crate::collection::AccessMode;
use crate::database::Database;
use crate::error::{CoreError, CoreResult};
use crate::hints::TransactionHints;
use crate::keys;
use crate::types::{CollectionId, IndexId, OperationKind, RevisionId, SequenceNumber, TransactionId};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Called before every intermediate commit of a transaction.
///
/// A replicated leader uses this to make the intermediate commit durable in
/// its log before the local batch is written. Returning an error vetoes the
/// intermediate commit and aborts the transaction.
pub trait IntermediateCommitHook: Send + Sync {
    /// Runs before the intermediate commit of `transaction`.
    ///
    /// # Errors
    ///
    /// Any error aborts the transaction and is returned to the caller.
    fn before_intermediate_commit(&self, transaction: TransactionId) -> CoreResult<()>;
}

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionStatus {
    /// Created but not begun.
    Created,
    /// Begun; accepts operations.
    Running,
    /// Committed. Terminal.
    Committed,
    /// Aborted. Terminal.
    Aborted,
}

impl TransactionStatus {
    /// Returns true for `Committed` and `Aborted`.
    #[must_use]
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Committed => "committed",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Options for [`Database::begin_transaction`].
///
/// # Example
///
/// ```rust,ignore
/// let options = TransactionOptions::new()
///     .read(CollectionId::new(1))
///     .write(CollectionId::new(2))
///     .hints(TransactionHints::DELAY_SNAPSHOT);
/// let mut txn = db.begin_transaction(options)?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct TransactionOptions {
    /// Use this id instead of allocating one. Followers reuse the leader's id.
    pub id: Option<TransactionId>,
    /// Behavior hints.
    pub hints: TransactionHints,
    /// Collections locked for reading.
    pub read: Vec<CollectionId>,
    /// Collections locked for writing.
    pub write: Vec<CollectionId>,
    /// Collections locked exclusively.
    pub exclusive: Vec<CollectionId>,
    /// Overrides the configured lock timeout.
    pub lock_timeout: Option<Duration>,
}

impl TransactionOptions {
    /// Creates empty options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a collection to read.
    #[must_use]
    pub fn read(mut self, collection: CollectionId) -> Self {
        self.read.push(collection);
        self
    }

    /// Adds a collection to write.
    #[must_use]
    pub fn write(mut self, collection: CollectionId) -> Self {
        self.write.push(collection);
        self
    }

    /// Adds a collection to lock exclusively.
    #[must_use]
    pub fn exclusive(mut self, collection: CollectionId) -> Self {
        self.exclusive.push(collection);
        self
    }

    /// Adds hints.
    #[must_use]
    pub fn hints(mut self, hints: TransactionHints) -> Self {
        self.hints |= hints;
        self
    }

    /// Sets the transaction id.
    #[must_use]
    pub fn with_id(mut self, id: TransactionId) -> Self {
        self.id = Some(id);
        self
    }

    /// Sets the lock timeout.
    #[must_use]
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }
}

#[derive(Debug)]
struct StateSavepoint {
    marks: BTreeMap<CollectionId, OperationMark>,
    document_operations: u64,
}

/// A document transaction.
///
/// Owns the collection locks, the engine access methods and the
/// per-collection operation counters. Dropping a running transaction
/// aborts it.
///
/// # Intermediate commits
///
/// A multi-operation transaction commits its batch early once it grows
/// past the configured thresholds and starts a new batch on a fresh
/// snapshot. This bounds memory but is not atomic with the rest of the
/// transaction: if the process dies before the final commit, batches that
/// were already committed intermediately stay durable.
///
/// # Example
///
/// ```rust,ignore
/// let mut txn = db.begin_transaction(TransactionOptions::new().write(users))?;
/// txn.insert_document(users, RevisionId::new(1), doc)?;
/// txn.commit()?;
/// ```
pub struct TransactionState {
    id: TransactionId,
    hints: TransactionHints,
    status: TransactionStatus,
    db: Database,
    lock_timeout: Duration,
    requested: BTreeMap<CollectionId, AccessMode>,
    collections: BTreeMap<CollectionId, TransactionCollection>,
    methods: TransactionMethods,
    savepoints: Vec<StateSavepoint>,
    cache_token: Option<CacheToken>,
    touched_keys: Vec<Vec<u8>>,
    document_operations: u64,
    intermediate_commits: u64,
    hook: Option<Arc<dyn IntermediateCommitHook>>,
}

impl TransactionState {
    pub(crate) fn new(db: Database, id: TransactionId, options: TransactionOptions) -> Self {
        let config = db.config();
        let write_mode = if config.exclusive_writes {
            AccessMode::Exclusive
        } else {
            AccessMode::Write
        };

        let mut requested: BTreeMap<CollectionId, AccessMode> = BTreeMap::new();
        let modes = options
            .read
            .iter()
            .map(|c| (*c, AccessMode::Read))
            .chain(options.write.iter().map(|c| (*c, write_mode)))
            .chain(options.exclusive.iter().map(|c| (*c, AccessMode::Exclusive)));
        for (collection, mode) in modes {
            requested
                .entry(collection)
                .and_modify(|m| *m = (*m).max(mode))
                .or_insert(mode);
        }

        let hints = options.hints;
        let engine = Arc::clone(db.engine());
        let methods = if hints.contains(TransactionHints::READ_ONLY) {
            TransactionMethods::read_only(engine)
        } else if hints.contains(TransactionHints::SINGLE_OPERATION) {
            TransactionMethods::single_operation(engine, config)
        } else {
            let automatic = !hints.contains(TransactionHints::FOLLOWER);
            TransactionMethods::multi_operation(engine, config, automatic)
        };

        Self {
            id,
            hints,
            status: TransactionStatus::Created,
            lock_timeout: options.lock_timeout.unwrap_or(config.lock_timeout),
            db,
            requested,
            collections: BTreeMap::new(),
            methods,
            savepoints: Vec::new(),
            cache_token: None,
            touched_keys: Vec::new(),
            document_operations: 0,
            intermediate_commits: 0,
            hook: None,
        }
    }

    /// Locks the requested collections and starts the transaction.
    ///
    /// Locks are taken in ascending collection id order. If one cannot be
    /// taken, every lock already held is released.
    ///
    /// # Errors
    ///
    /// Returns `LockTimeout` or `CollectionNotFound`, leaving the
    /// transaction in `Created`; `InvalidOperation` if it was already begun
    /// or its id is in use.
    pub fn begin(&mut self) -> CoreResult<()> {
        if self.status != TransactionStatus::Created {
            return Err(CoreError::invalid_operation(format!(
                "transaction {} is {}",
                self.id, self.status
            )));
        }
        self.db.register_active(self.id)?;

        let requested: Vec<(CollectionId, AccessMode)> =
            self.requested.iter().map(|(c, m)| (*c, *m)).collect();
        for (collection, mode) in requested {
            if let Err(e) = self.lock_collection(collection, mode) {
                if matches!(e, CoreError::LockTimeout { .. }) {
                    self.db.stats().record_lock_timeout();
                }
                self.release_locks();
                self.collections.clear();
                self.db.unregister_active(self.id);
                return Err(e);
            }
        }

        let write_modes: Vec<AccessMode> = self
            .collections
            .values()
            .map(TransactionCollection::access)
            .filter(|m| m.is_write())
            .collect();
        if !write_modes.is_empty() && write_modes.iter().all(|m| m.is_exclusive()) {
            self.methods.set_exclusive(true);
        }

        self.methods
            .begin(self.hints.contains(TransactionHints::DELAY_SNAPSHOT));
        self.cache_token = Some(self.db.cache().begin_transaction());
        if self.hints.contains(TransactionHints::GLOBAL_MANAGED) {
            self.db.set_managed_status(self.id, TransactionStatus::Running);
        }
        self.status = TransactionStatus::Running;
        self.db.stats().record_transaction_start();
        tracing::debug!(
            transaction = %self.id,
            hints = ?self.hints,
            collections = self.collections.len(),
            "began transaction"
        );
        Ok(())
    }

    fn lock_collection(&mut self, collection: CollectionId, mode: AccessMode) -> CoreResult<()> {
        let handle = self.db.collection(collection)?;
        let mut tc = TransactionCollection::new(handle, mode);
        tc.lock_usage(self.lock_timeout)?;
        self.collections.insert(collection, tc);
        Ok(())
    }

    fn release_locks(&mut self) {
        for tc in self.collections.values_mut().rev() {
            tc.release_usage();
        }
    }

    /// Returns the transaction id.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Returns the hints.
    #[must_use]
    pub fn hints(&self) -> TransactionHints {
        self.hints
    }

    /// Returns the status.
    #[must_use]
    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    /// Returns true while the transaction accepts operations.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status == TransactionStatus::Running
    }

    /// Returns the database this transaction runs on.
    #[must_use]
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Returns the number of intermediate commits performed.
    #[must_use]
    pub fn intermediate_commits(&self) -> u64 {
        self.intermediate_commits
    }

    /// Returns the number of document operations performed.
    #[must_use]
    pub fn document_operations(&self) -> u64 {
        self.document_operations
    }

    /// Returns the current snapshot sequence, if a snapshot is held.
    #[must_use]
    pub fn snapshot_sequence(&self) -> Option<SequenceNumber> {
        self.methods.snapshot_sequence()
    }

    /// Returns the engine access methods.
    #[must_use]
    pub fn methods(&self) -> &TransactionMethods {
        &self.methods
    }

    /// Returns the per-transaction state of a collection.
    #[must_use]
    pub fn collection(&self, collection: CollectionId) -> Option<&TransactionCollection> {
        self.collections.get(&collection)
    }

    /// Installs a hook run before every intermediate commit.
    pub fn set_intermediate_commit_hook(&mut self, hook: Arc<dyn IntermediateCommitHook>) {
        self.hook = Some(hook);
    }

    fn ensure_running(&self) -> CoreResult<()> {
        match self.status {
            TransactionStatus::Running => Ok(()),
            status => Err(CoreError::invalid_operation(format!(
                "transaction {} is {status}",
                self.id
            ))),
        }
    }

    fn ensure_writable(&self, collection: CollectionId) -> CoreResult<()> {
        if self.hints.contains(TransactionHints::READ_ONLY) {
            return Err(CoreError::ReadOnlyViolation);
        }
        match self.collections.get(&collection) {
            Some(tc) if tc.access().is_write() => Ok(()),
            Some(_) => Err(CoreError::invalid_operation(format!(
                "{collection} is locked for reading only"
            ))),
            None => Err(CoreError::invalid_operation(format!(
                "{collection} is not declared for writing"
            ))),
        }
    }

    fn ensure_readable(&mut self, collection: CollectionId) -> CoreResult<()> {
        if self.collections.contains_key(&collection) {
            return Ok(());
        }
        self.add_collection(collection, AccessMode::Read)
    }

    /// Adds a collection to a running transaction and locks it.
    ///
    /// Followers learn the collections of a replicated transaction only as
    /// its operations arrive. A collection already part of the transaction
    /// in an equal or stronger mode is left alone.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the transaction is not running or the
    /// collection is held in a weaker mode, `ReadOnlyViolation` for write
    /// modes in a read-only transaction, or a lock error.
    pub fn add_collection(&mut self, collection: CollectionId, mode: AccessMode) -> CoreResult<()> {
        self.ensure_running()?;
        if mode.is_write() && self.hints.contains(TransactionHints::READ_ONLY) {
            return Err(CoreError::ReadOnlyViolation);
        }
        if let Some(tc) = self.collections.get(&collection) {
            if tc.access() >= mode {
                return Ok(());
            }
            return Err(CoreError::invalid_operation(format!(
                "cannot upgrade {collection} from {} to {mode}",
                tc.access()
            )));
        }
        let result = self.lock_collection(collection, mode);
        if matches!(result, Err(CoreError::LockTimeout { .. })) {
            self.db.stats().record_lock_timeout();
        }
        result
    }

    fn tracked(&mut self, collection: CollectionId) -> CoreResult<&mut TransactionCollection> {
        self.collections
            .get_mut(&collection)
            .ok_or(CoreError::CollectionNotFound { collection })
    }

    /// Marks the current state so it can be restored.
    ///
    /// Returns the savepoint depth.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the transaction is not running.
    pub fn set_savepoint(&mut self) -> CoreResult<usize> {
        self.ensure_running()?;
        self.savepoints.push(StateSavepoint {
            marks: self
                .collections
                .iter()
                .map(|(c, tc)| (*c, tc.mark()))
                .collect(),
            document_operations: self.document_operations,
        });
        self.methods.set_savepoint();
        Ok(self.savepoints.len())
    }

    /// Undoes every write since the innermost savepoint and drops it.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the transaction is not running or no
    /// savepoint is active.
    pub fn rollback_to_savepoint(&mut self) -> CoreResult<()> {
        self.ensure_running()?;
        let savepoint = self
            .savepoints
            .pop()
            .ok_or_else(|| CoreError::invalid_operation("no savepoint to roll back to"))?;
        self.methods.rollback_to_savepoint()?;
        for (collection, mark) in &savepoint.marks {
            if let Some(tc) = self.collections.get_mut(collection) {
                tc.rollback_to(mark);
            }
        }
        self.document_operations = savepoint.document_operations;
        Ok(())
    }

    /// Drops the innermost savepoint, keeping its writes.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the transaction is not running or no
    /// savepoint is active.
    pub fn pop_savepoint(&mut self) -> CoreResult<()> {
        self.ensure_running()?;
        self.savepoints
            .pop()
            .ok_or_else(|| CoreError::invalid_operation("no savepoint to pop"))?;
        self.methods.pop_savepoint()
    }

    /// Runs one document write inside an operation savepoint.
    fn write_operation<F>(&mut self, collection: CollectionId, operation: F) -> CoreResult<()>
    where
        F: FnOnce(&mut Self) -> CoreResult<()>,
    {
        self.ensure_running()?;
        self.ensure_writable(collection)?;
        if matches!(self.methods, TransactionMethods::SingleOperation(_)) && self.document_operations > 0 {
            return Err(CoreError::invalid_operation(
                "single-operation transaction already performed its operation",
            ));
        }

        self.set_savepoint()?;
        match operation(self) {
            Ok(()) => {
                self.pop_savepoint()?;
                self.document_operations += 1;
                if self.methods.is_intermediate_commit_needed() {
                    self.trigger_intermediate_commit()?;
                }
                Ok(())
            }
            Err(e) => {
                self.rollback_to_savepoint()?;
                if matches!(e, CoreError::ResourceExhausted { .. }) {
                    tracing::warn!(transaction = %self.id, error = %e, "aborting transaction");
                    self.abort_internal();
                }
                Err(e)
            }
        }
    }

    fn touch(&mut self, key: &[u8]) {
        if let Some(token) = self.cache_token {
            self.db.cache().banish(token, key);
            self.touched_keys.push(key.to_vec());
        }
        self.db.stats().record_document_write();
    }

    fn require_document(&mut self, collection: CollectionId, revision: RevisionId) -> CoreResult<Vec<u8>> {
        let key = keys::document_key(collection, revision);
        if self.methods.get(&key, true)?.is_none() {
            return Err(CoreError::DocumentNotFound {
                collection,
                revision,
            });
        }
        Ok(key)
    }

    /// Inserts a document revision.
    ///
    /// # Errors
    ///
    /// Returns `ReadOnlyViolation`, `InvalidOperation` if the collection is
    /// not writable here, or `ResourceExhausted` (which aborts the
    /// transaction).
    pub fn insert_document(
        &mut self,
        collection: CollectionId,
        revision: RevisionId,
        document: Vec<u8>,
    ) -> CoreResult<()> {
        self.write_operation(collection, |state| {
            let key = keys::document_key(collection, revision);
            state.methods.put(key.clone(), document)?;
            state.touch(&key);
            let tc = state.tracked(collection)?;
            tc.add_operation(OperationKind::Insert, revision);
            tc.track_insert(revision);
            Ok(())
        })
    }

    /// Removes a document revision.
    ///
    /// # Errors
    ///
    /// Same as [`TransactionState::insert_document`], plus
    /// `DocumentNotFound`.
    pub fn remove_document(&mut self, collection: CollectionId, revision: RevisionId) -> CoreResult<()> {
        self.write_operation(collection, |state| {
            let key = state.require_document(collection, revision)?;
            state.methods.delete(key.clone())?;
            state.touch(&key);
            let tc = state.tracked(collection)?;
            tc.add_operation(OperationKind::Remove, revision);
            tc.track_remove(revision);
            Ok(())
        })
    }

    /// Replaces revision `old` of a document with revision `new`.
    ///
    /// # Errors
    ///
    /// Same as [`TransactionState::remove_document`].
    pub fn replace_document(
        &mut self,
        collection: CollectionId,
        old: RevisionId,
        new: RevisionId,
        document: Vec<u8>,
    ) -> CoreResult<()> {
        self.write_operation(collection, |state| {
            let old_key = state.require_document(collection, old)?;
            let new_key = keys::document_key(collection, new);
            state.methods.delete(old_key.clone())?;
            state.methods.put(new_key.clone(), document)?;
            state.touch(&old_key);
            state.touch(&new_key);
            let tc = state.tracked(collection)?;
            tc.add_operation(OperationKind::Replace, new);
            tc.track_remove(old);
            tc.track_insert(new);
            Ok(())
        })
    }

    /// Removes every document of `collection` visible to the transaction.
    ///
    /// Returns the number of documents removed.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` unless the collection is locked
    /// exclusively, plus the errors of [`TransactionState::remove_document`].
    /// Follower transactions may truncate under a write lock, since the
    /// leader held the exclusive one.
    pub fn truncate(&mut self, collection: CollectionId) -> CoreResult<u64> {
        self.ensure_running()?;
        self.ensure_writable(collection)?;
        let follower = self.hints.contains(TransactionHints::FOLLOWER);
        if !self.collections.get(&collection).is_some_and(|tc| {
            tc.access().is_exclusive() || (follower && tc.access().is_write())
        }) {
            return Err(CoreError::invalid_operation(format!(
                "truncating {collection} requires an exclusive lock"
            )));
        }

        let mut removed = 0u64;
        self.write_operation(collection, |state| {
            let mut iter = state.methods.iterator(keys::collection_range(collection), true);
            let mut doomed = Vec::new();
            while let Some((key, _)) = state.methods.next(&mut iter)? {
                doomed.push(key);
            }
            for key in doomed {
                state.methods.delete(key.clone())?;
                state.touch(&key);
                removed += 1;
            }
            state.tracked(collection)?.truncate(removed);
            Ok(())
        })?;
        Ok(removed)
    }

    /// Reads a document revision.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the transaction is not running, or a
    /// lock or engine error.
    pub fn document(
        &mut self,
        collection: CollectionId,
        revision: RevisionId,
        read_own_writes: bool,
    ) -> CoreResult<Option<Vec<u8>>> {
        self.ensure_running()?;
        self.ensure_readable(collection)?;
        self.methods
            .get(&keys::document_key(collection, revision), read_own_writes)
    }

    /// Reads several document revisions, including the transaction's own writes.
    ///
    /// # Errors
    ///
    /// Same as [`TransactionState::document`].
    pub fn documents(
        &mut self,
        collection: CollectionId,
        revisions: &[RevisionId],
    ) -> CoreResult<Vec<Option<Vec<u8>>>> {
        self.ensure_running()?;
        self.ensure_readable(collection)?;
        let keys: Vec<Vec<u8>> = revisions
            .iter()
            .map(|rev| keys::document_key(collection, *rev))
            .collect();
        let refs: Vec<&[u8]> = keys.iter().map(Vec::as_slice).collect();
        self.methods.multi_get(&refs, true)
    }

    /// Creates a cursor over the documents of `collection`.
    ///
    /// # Errors
    ///
    /// Same as [`TransactionState::document`].
    pub fn iter_documents(
        &mut self,
        collection: CollectionId,
        read_own_writes: bool,
    ) -> CoreResult<TransactionIterator> {
        self.ensure_running()?;
        self.ensure_readable(collection)?;
        Ok(self
            .methods
            .iterator(keys::collection_range(collection), read_own_writes))
    }

    /// Advances a document cursor.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the transaction is not running, or an
    /// engine error.
    pub fn next_document(
        &mut self,
        iter: &mut TransactionIterator,
    ) -> CoreResult<Option<(RevisionId, Vec<u8>)>> {
        self.ensure_running()?;
        match self.methods.next(iter)? {
            Some((key, value)) => {
                let revision = keys::revision_from_key(&key)
                    .ok_or_else(|| CoreError::invalid_operation("cursor left the document key space"))?;
                Ok(Some((revision, value)))
            }
            None => Ok(None),
        }
    }

    /// Counts an operation on `collection` without touching the engine.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the transaction is not running or the
    /// collection is not writable here, or `ReadOnlyViolation`.
    pub fn add_operation(
        &mut self,
        collection: CollectionId,
        revision: RevisionId,
        kind: OperationKind,
    ) -> CoreResult<()> {
        self.ensure_running()?;
        self.ensure_writable(collection)?;
        self.tracked(collection)?.add_operation(kind, revision);
        Ok(())
    }

    /// Records an index value hash inserted, for selectivity estimates.
    ///
    /// Ignored under [`TransactionHints::NO_INDEXING`].
    ///
    /// # Errors
    ///
    /// Same as [`TransactionState::add_operation`].
    pub fn track_index_insert(&mut self, collection: CollectionId, index: IndexId, hash: u64) -> CoreResult<()> {
        self.ensure_running()?;
        if self.hints.contains(TransactionHints::NO_INDEXING) {
            return Ok(());
        }
        self.ensure_writable(collection)?;
        self.tracked(collection)?.track_index_insert(index, hash);
        Ok(())
    }

    /// Records an index value hash removed, for selectivity estimates.
    ///
    /// Ignored under [`TransactionHints::NO_INDEXING`].
    ///
    /// # Errors
    ///
    /// Same as [`TransactionState::add_operation`].
    pub fn track_index_remove(&mut self, collection: CollectionId, index: IndexId, hash: u64) -> CoreResult<()> {
        self.ensure_running()?;
        if self.hints.contains(TransactionHints::NO_INDEXING) {
            return Ok(());
        }
        self.ensure_writable(collection)?;
        self.tracked(collection)?.track_index_remove(index, hash);
        Ok(())
    }

    /// Returns true if the transaction has anything to commit.
    #[must_use]
    pub fn has_operations(&self) -> bool {
        self.methods.has_pending_writes()
            || self
                .collections
                .values()
                .any(TransactionCollection::has_operations)
    }

    /// Commits the current batch and continues on a fresh one.
    ///
    /// Returns the commit sequence, or `None` if there was nothing to commit.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` for transactions that cannot commit
    /// intermediately or while a savepoint is active. A hook veto or a
    /// failed physical commit aborts the transaction.
    pub fn trigger_intermediate_commit(&mut self) -> CoreResult<Option<SequenceNumber>> {
        self.ensure_running()?;
        if !self.methods.supports_intermediate_commits() {
            return Err(CoreError::invalid_operation(
                "only multi-operation transactions commit intermediately",
            ));
        }
        if !self.savepoints.is_empty() {
            return Err(CoreError::invalid_operation(
                "cannot commit intermediately while a savepoint is active",
            ));
        }
        if !self.has_operations() {
            return Ok(None);
        }
        if let Some(hook) = self.hook.clone() {
            if let Err(e) = hook.before_intermediate_commit(self.id) {
                tracing::warn!(transaction = %self.id, error = %e, "intermediate commit vetoed, aborting");
                self.abort_internal();
                return Err(e);
            }
        }

        let seq = self.physical_commit(MarkerKind::IntermediateCommit)?;
        self.intermediate_commits += 1;
        self.db.stats().record_intermediate_commit();
        tracing::debug!(
            transaction = %self.id,
            %seq,
            count = self.intermediate_commits,
            "intermediate commit"
        );
        Ok(Some(seq))
    }

    /// Places blockers, writes the batch and buffers counter changes.
    ///
    /// Blockers go at `latest + 1`, which no commit has used yet, so the
    /// commit sequence is never below them. Any engine error removes the
    /// blockers without buffering and aborts the transaction.
    fn physical_commit(&mut self, kind: MarkerKind) -> CoreResult<SequenceNumber> {
        let prepare_seq = self.db.engine().latest_sequence().next();
        let changed: Vec<CollectionId> = self
            .collections
            .values()
            .filter(|tc| tc.has_operations())
            .map(TransactionCollection::id)
            .collect();
        for tc in self.collections.values() {
            tc.prepare_transaction(self.id, prepare_seq);
        }

        let result = CommitMarker::new(self.id, kind, &changed)
            .encode()
            .and_then(|marker| self.methods.put_log_data(marker))
            .and_then(|()| {
                self.methods
                    .commit_batch(kind == MarkerKind::IntermediateCommit)
            });

        match result {
            Ok(seq) => {
                // A batch without document writes does not consume a sequence.
                let commit_seq = seq.max(prepare_seq);
                for tc in self.collections.values_mut() {
                    tc.commit_counts(self.id, commit_seq);
                }
                Ok(commit_seq)
            }
            Err(e) => {
                for tc in self.collections.values() {
                    tc.abort_commit(self.id);
                }
                if matches!(e, CoreError::EngineConflict { .. }) {
                    self.db.stats().record_conflict();
                }
                tracing::warn!(transaction = %self.id, error = %e, "physical commit failed, aborting");
                self.abort_internal();
                Err(e)
            }
        }
    }

    /// Commits the transaction.
    ///
    /// Returns the commit sequence, or `None` if nothing was written.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the transaction is not running. Engine
    /// errors (`EngineConflict` among them) abort the transaction.
    pub fn commit(&mut self) -> CoreResult<Option<SequenceNumber>> {
        self.ensure_running()?;
        if !self.has_operations() {
            self.methods.abort();
            self.finish(TransactionStatus::Committed);
            return Ok(None);
        }
        let seq = self.physical_commit(MarkerKind::Commit)?;
        self.finish(TransactionStatus::Committed);
        Ok(Some(seq))
    }

    /// Aborts the transaction, discarding everything since the last
    /// intermediate commit.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the transaction is not running.
    pub fn abort(&mut self) -> CoreResult<()> {
        self.ensure_running()?;
        self.abort_internal();
        Ok(())
    }

    fn abort_internal(&mut self) {
        if self.status != TransactionStatus::Running {
            return;
        }
        self.methods.abort();
        for tc in self.collections.values() {
            tc.abort_commit(self.id);
        }
        self.finish(TransactionStatus::Aborted);
    }

    fn finish(&mut self, status: TransactionStatus) {
        self.release_locks();
        self.savepoints.clear();
        if let Some(token) = self.cache_token.take() {
            self.db.cache().end_transaction(
                token,
                &self.touched_keys,
                status == TransactionStatus::Aborted,
            );
        }
        self.touched_keys.clear();
        self.db.unregister_active(self.id);
        if self.hints.contains(TransactionHints::GLOBAL_MANAGED) {
            self.db.set_managed_status(self.id, status);
        }
        self.status = status;

        match status {
            TransactionStatus::Committed => self.db.stats().record_transaction_commit(),
            _ => self.db.stats().record_transaction_abort(),
        }
        tracing::debug!(
            transaction = %self.id,
            %status,
            operations = self.document_operations,
            intermediate_commits = self.intermediate_commits,
            "transaction finished"
        );
    }
}

impl Drop for TransactionState {
    fn drop(&mut self) {
        self.abort_internal();
    }
}

impl fmt::Debug for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionState")
            .field("id", &self.id)
            .field("hints", &self.hints)
            .field("status", &self.status)
            .field("collections", &self.collections.keys().collect::<Vec<_>>())
            .field("methods", &self.methods)
            .field("intermediate_commits", &self.intermediate_commits)
            .finish_non_exhaustive()
    }
}
