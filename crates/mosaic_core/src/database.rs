//! Database facade.

use crate::cache::DocumentCache;
use crate::collection::{
    Collection, IndexEstimator, MetadataSync, RecoveredOperation, SelectivityEstimator,
};
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::keys;
use crate::stats::DatabaseStats;
use crate::transaction::{TransactionOptions, TransactionState, TransactionStatus};
use crate::types::{CollectionId, IndexId, RevisionId, SequenceNumber, TransactionId};
use mosaic_storage::{InMemoryEngine, KeyValueEngine};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

struct DatabaseInner {
    engine: Arc<dyn KeyValueEngine>,
    config: Config,
    collections: RwLock<BTreeMap<CollectionId, Arc<Collection>>>,
    next_transaction: AtomicU64,
    active: Mutex<BTreeSet<TransactionId>>,
    managed: Mutex<HashMap<TransactionId, TransactionStatus>>,
    cache: DocumentCache,
    stats: DatabaseStats,
}

/// The main database handle.
///
/// `Database` is cheap to clone; clones share collections, the document
/// cache and statistics. It provides:
/// - Collection registration and lookup
/// - Transactions with collection locking and intermediate commits
/// - Periodic metadata synchronization
/// - Recovery of document counts and revision trees
///
/// # Example
///
/// ```rust,ignore
/// use mosaic_core::{CollectionId, Database, RevisionId, TransactionOptions};
///
/// let db = Database::open_in_memory();
/// let users = CollectionId::new(1);
/// db.register_collection(users, "users")?;
///
/// db.transaction(TransactionOptions::new().write(users), |txn| {
///     txn.insert_document(users, RevisionId::new(1), b"alice".to_vec())
/// })?;
/// db.sync_metadata(false)?;
/// assert_eq!(db.collection(users)?.number_documents(), 1);
/// ```
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl Database {
    /// Opens a database over `engine`.
    #[must_use]
    pub fn open(engine: Arc<dyn KeyValueEngine>, config: Config) -> Self {
        Self {
            inner: Arc::new(DatabaseInner {
                engine,
                config,
                collections: RwLock::new(BTreeMap::new()),
                next_transaction: AtomicU64::new(1),
                active: Mutex::new(BTreeSet::new()),
                managed: Mutex::new(HashMap::new()),
                cache: DocumentCache::default(),
                stats: DatabaseStats::new(),
            }),
        }
    }

    /// Opens a database over a fresh in-memory engine.
    #[must_use]
    pub fn open_in_memory() -> Self {
        Self::open_in_memory_with_config(Config::default())
    }

    /// Opens a database over a fresh in-memory engine with `config`.
    #[must_use]
    pub fn open_in_memory_with_config(config: Config) -> Self {
        Self::open(Arc::new(InMemoryEngine::new()), config)
    }

    /// Returns the engine.
    #[must_use]
    pub fn engine(&self) -> &Arc<dyn KeyValueEngine> {
        &self.inner.engine
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Returns the statistics.
    #[must_use]
    pub fn stats(&self) -> &DatabaseStats {
        &self.inner.stats
    }

    /// Returns the document cache.
    #[must_use]
    pub fn cache(&self) -> &DocumentCache {
        &self.inner.cache
    }

    /// Registers a collection, restoring its persisted metadata.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the id is taken, or an error if the
    /// persisted metadata cannot be decoded.
    pub fn register_collection(
        &self,
        id: CollectionId,
        name: impl Into<String>,
    ) -> CoreResult<Arc<Collection>> {
        let mut collections = self.inner.collections.write();
        if collections.contains_key(&id) {
            return Err(CoreError::invalid_operation(format!(
                "{id} is already registered"
            )));
        }
        let collection = Arc::new(Collection::open(
            Arc::clone(&self.inner.engine),
            id,
            name,
            &self.inner.config,
        )?);
        tracing::debug!(
            collection = %id,
            name = collection.name(),
            documents = collection.number_documents(),
            "registered collection"
        );
        collections.insert(id, Arc::clone(&collection));
        Ok(collection)
    }

    /// Returns a registered collection.
    ///
    /// # Errors
    ///
    /// Returns `CollectionNotFound` if it is not registered.
    pub fn collection(&self, id: CollectionId) -> CoreResult<Arc<Collection>> {
        self.inner
            .collections
            .read()
            .get(&id)
            .cloned()
            .ok_or(CoreError::CollectionNotFound { collection: id })
    }

    /// Returns every registered collection in id order.
    #[must_use]
    pub fn collections(&self) -> Vec<Arc<Collection>> {
        self.inner.collections.read().values().cloned().collect()
    }

    /// Registers a selectivity estimator for an index, restoring its
    /// persisted state.
    ///
    /// # Errors
    ///
    /// Returns `CollectionNotFound`, or an error if the persisted estimator
    /// cannot be decoded.
    pub fn register_estimator(
        &self,
        collection: CollectionId,
        index: IndexId,
    ) -> CoreResult<Arc<SelectivityEstimator>> {
        let handle = self.collection(collection)?;
        let snapshot = self.inner.engine.snapshot();
        let estimator = match self
            .inner
            .engine
            .get(&snapshot, &keys::estimator_key(collection, index))?
        {
            Some(bytes) => SelectivityEstimator::from_bytes(&bytes)?,
            None => SelectivityEstimator::new(),
        };
        let estimator = Arc::new(estimator);
        handle.register_estimator(index, Arc::clone(&estimator) as Arc<dyn IndexEstimator>);
        Ok(estimator)
    }

    /// Creates and begins a transaction.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`TransactionState::begin`].
    pub fn begin_transaction(&self, options: TransactionOptions) -> CoreResult<TransactionState> {
        let id = options.id.unwrap_or_else(|| {
            TransactionId::new(self.inner.next_transaction.fetch_add(1, Ordering::SeqCst))
        });
        let mut txn = TransactionState::new(self.clone(), id, options);
        txn.begin()?;
        Ok(txn)
    }

    /// Executes a function within a transaction.
    ///
    /// Commits if the function returns `Ok`, aborts if it returns `Err`.
    ///
    /// # Errors
    ///
    /// Returns the function's error, or the error of begin or commit.
    pub fn transaction<F, T>(&self, options: TransactionOptions, f: F) -> CoreResult<T>
    where
        F: FnOnce(&mut TransactionState) -> CoreResult<T>,
    {
        let mut txn = self.begin_transaction(options)?;
        match f(&mut txn) {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(e) => {
                if txn.is_running() {
                    txn.abort()?;
                }
                Err(e)
            }
        }
    }

    /// Folds committable metadata changes of every collection and persists
    /// them where needed.
    ///
    /// # Errors
    ///
    /// Returns the first collection error; later collections are not synced.
    pub fn sync_metadata(&self, force: bool) -> CoreResult<Vec<MetadataSync>> {
        let sample_rate = self.inner.config.metadata_sample_rate;
        let mut results = Vec::new();
        for collection in self.collections() {
            let sync = collection.serialize_meta(force, sample_rate)?;
            self.inner.stats.record_metadata_sync(sync.persisted);
            results.push(sync);
        }
        Ok(results)
    }

    /// Applies an operation found in the engine log during recovery.
    ///
    /// Returns false if the persisted metadata already covers `seq`.
    ///
    /// # Errors
    ///
    /// Returns `CollectionNotFound`, or an error if the operation does not
    /// match the revision tree.
    pub fn recovery_apply(
        &self,
        collection: CollectionId,
        seq: SequenceNumber,
        operation: RecoveredOperation,
    ) -> CoreResult<bool> {
        self.collection(collection)?.recovery_apply(seq, operation)
    }

    /// Finishes recovery by persisting every collection's metadata.
    ///
    /// # Errors
    ///
    /// Same as [`Database::sync_metadata`].
    pub fn recovery_done(&self) -> CoreResult<Vec<MetadataSync>> {
        let results = self.sync_metadata(true)?;
        tracing::info!(collections = results.len(), "recovery complete");
        Ok(results)
    }

    /// Reads a document outside any transaction, through the cache.
    ///
    /// A value read from the engine is only cached if no writer touched the
    /// key meanwhile and nothing committed since the read.
    ///
    /// # Errors
    ///
    /// Returns `CollectionNotFound` or an engine error.
    pub fn cached_document(
        &self,
        collection: CollectionId,
        revision: RevisionId,
    ) -> CoreResult<Option<Vec<u8>>> {
        self.collection(collection)?;
        let key = keys::document_key(collection, revision);
        if let Some(value) = self.inner.cache.lookup(&key) {
            return Ok(Some(value));
        }

        let engine = &self.inner.engine;
        let snapshot = engine.snapshot();
        let value = engine.get(&snapshot, &key)?;
        if let Some(value) = &value {
            let read_seq = snapshot.sequence();
            self.inner
                .cache
                .insert_checked(&key, value.clone(), || engine.latest_sequence() == read_seq);
        }
        Ok(value)
    }

    /// Returns the ids of running transactions.
    #[must_use]
    pub fn active_transactions(&self) -> Vec<TransactionId> {
        self.inner.active.lock().iter().copied().collect()
    }

    /// Returns the number of running transactions.
    #[must_use]
    pub fn active_transaction_count(&self) -> usize {
        self.inner.active.lock().len()
    }

    /// Returns the status recorded for a globally managed transaction.
    #[must_use]
    pub fn managed_status(&self, id: TransactionId) -> Option<TransactionStatus> {
        self.inner.managed.lock().get(&id).copied()
    }

    /// Forgets a globally managed transaction.
    pub fn forget_managed(&self, id: TransactionId) {
        self.inner.managed.lock().remove(&id);
    }

    pub(crate) fn register_active(&self, id: TransactionId) -> CoreResult<()> {
        if !self.inner.active.lock().insert(id) {
            return Err(CoreError::invalid_operation(format!(
                "transaction {id} is already running"
            )));
        }
        Ok(())
    }

    pub(crate) fn unregister_active(&self, id: TransactionId) {
        self.inner.active.lock().remove(&id);
    }

    pub(crate) fn set_managed_status(&self, id: TransactionId, status: TransactionStatus) {
        self.inner.managed.lock().insert(id, status);
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("collections", &self.inner.collections.read().len())
            .field("active_transactions", &self.active_transaction_count())
            .field("latest_sequence", &self.inner.engine.latest_sequence())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::AccessMode;
    use crate::hints::TransactionHints;
    use crate::revision_tree::RevisionTree;
    use crate::types::OperationKind;
    use std::thread;
    use std::time::Duration;

    const USERS: CollectionId = CollectionId(1);
    const ORDERS: CollectionId = CollectionId(2);

    fn create_db(config: Config) -> (Database, Arc<InMemoryEngine>) {
        let engine = Arc::new(InMemoryEngine::new());
        let db = Database::open(Arc::clone(&engine) as Arc<dyn KeyValueEngine>, config);
        db.register_collection(USERS, "users").unwrap();
        db.register_collection(ORDERS, "orders").unwrap();
        (db, engine)
    }

    fn small_tree() -> Config {
        Config::new().revision_tree_shape(3, 2)
    }

    fn rev(n: u64) -> RevisionId {
        RevisionId::new(n)
    }

    #[test]
    fn insert_commit_and_sync() {
        let (db, _) = create_db(small_tree());
        db.transaction(TransactionOptions::new().write(USERS), |txn| {
            txn.insert_document(USERS, rev(1), b"a".to_vec())?;
            txn.insert_document(USERS, rev(2), b"b".to_vec())
        })
        .unwrap();

        let users = db.collection(USERS).unwrap();
        assert_eq!(users.number_documents(), 2);
        db.sync_metadata(false).unwrap();
        assert_eq!(users.document_count().added, 2);

        let tree = users.revision_tree(db.engine().latest_sequence()).unwrap().unwrap();
        assert_eq!(tree.count(), 2);
    }

    #[test]
    fn commit_returns_sequence_and_trivial_commit_returns_none() {
        let (db, _) = create_db(small_tree());
        let mut txn = db.begin_transaction(TransactionOptions::new().write(USERS)).unwrap();
        txn.insert_document(USERS, rev(1), b"a".to_vec()).unwrap();
        let seq = txn.commit().unwrap();
        assert_eq!(seq, Some(db.engine().latest_sequence()));
        assert_eq!(txn.status(), TransactionStatus::Committed);

        let mut empty = db.begin_transaction(TransactionOptions::new().read(USERS)).unwrap();
        assert_eq!(empty.commit().unwrap(), None);
        assert_eq!(db.active_transaction_count(), 0);
    }

    #[test]
    fn abort_discards_writes() {
        let (db, _) = create_db(small_tree());
        let mut txn = db.begin_transaction(TransactionOptions::new().write(USERS)).unwrap();
        txn.insert_document(USERS, rev(1), b"a".to_vec()).unwrap();
        txn.abort().unwrap();
        assert_eq!(txn.status(), TransactionStatus::Aborted);

        db.sync_metadata(false).unwrap();
        assert_eq!(db.collection(USERS).unwrap().number_documents(), 0);
        assert_eq!(db.cached_document(USERS, rev(1)).unwrap(), None);
        assert!(matches!(
            txn.insert_document(USERS, rev(2), vec![]),
            Err(CoreError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn dropping_a_running_transaction_aborts_it() {
        let (db, _) = create_db(small_tree());
        {
            let mut txn = db.begin_transaction(TransactionOptions::new().exclusive(USERS)).unwrap();
            txn.insert_document(USERS, rev(1), b"a".to_vec()).unwrap();
        }
        let users = db.collection(USERS).unwrap();
        assert!(!users.is_locked());
        assert_eq!(db.active_transaction_count(), 0);
        assert_eq!(db.stats().transactions_aborted(), 1);
    }

    #[test]
    fn read_only_transaction_rejects_writes() {
        let (db, _) = create_db(small_tree());
        let mut txn = db
            .begin_transaction(
                TransactionOptions::new()
                    .read(USERS)
                    .hints(TransactionHints::READ_ONLY),
            )
            .unwrap();
        assert!(matches!(
            txn.insert_document(USERS, rev(1), vec![]),
            Err(CoreError::ReadOnlyViolation)
        ));
        assert!(txn.is_running());
    }

    #[test]
    fn writes_require_a_declared_collection() {
        let (db, _) = create_db(small_tree());
        let mut txn = db.begin_transaction(TransactionOptions::new().read(USERS)).unwrap();
        assert!(matches!(
            txn.insert_document(USERS, rev(1), vec![]),
            Err(CoreError::InvalidOperation { .. })
        ));
        assert!(matches!(
            txn.insert_document(ORDERS, rev(1), vec![]),
            Err(CoreError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn reads_lock_undeclared_collections_lazily() {
        let (db, _) = create_db(small_tree());
        db.transaction(TransactionOptions::new().write(ORDERS), |txn| {
            txn.insert_document(ORDERS, rev(7), b"o".to_vec())
        })
        .unwrap();

        let mut txn = db.begin_transaction(TransactionOptions::new()).unwrap();
        assert!(txn.collection(ORDERS).is_none());
        assert_eq!(txn.document(ORDERS, rev(7), true).unwrap(), Some(b"o".to_vec()));
        assert!(txn.collection(ORDERS).unwrap().is_locked());
    }

    #[test]
    fn unknown_collection_fails_begin() {
        let (db, _) = create_db(small_tree());
        let err = db
            .begin_transaction(TransactionOptions::new().write(CollectionId::new(99)))
            .unwrap_err();
        assert!(matches!(err, CoreError::CollectionNotFound { .. }));
        assert_eq!(db.active_transaction_count(), 0);
    }

    #[test]
    fn lock_timeout_releases_earlier_locks() {
        let (db, _) = create_db(small_tree());
        let _holder = db.begin_transaction(TransactionOptions::new().exclusive(ORDERS)).unwrap();

        let err = db
            .begin_transaction(
                TransactionOptions::new()
                    .write(USERS)
                    .write(ORDERS)
                    .lock_timeout(Duration::from_millis(20)),
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::LockTimeout { collection, .. } if collection == ORDERS));
        assert!(!db.collection(USERS).unwrap().is_locked());
        assert_eq!(db.stats().snapshot().lock_timeouts, 1);
    }

    #[test]
    fn collections_can_join_a_running_transaction() {
        let (db, _) = create_db(small_tree());
        let mut txn = db.begin_transaction(TransactionOptions::new()).unwrap();
        txn.add_collection(USERS, AccessMode::Write).unwrap();
        txn.insert_document(USERS, rev(1), vec![]).unwrap();

        txn.add_collection(ORDERS, AccessMode::Read).unwrap();
        assert!(matches!(
            txn.add_collection(ORDERS, AccessMode::Exclusive),
            Err(CoreError::InvalidOperation { .. })
        ));
        txn.add_collection(USERS, AccessMode::Read).unwrap();
        txn.commit().unwrap();
        assert_eq!(db.collection(USERS).unwrap().number_documents(), 1);
    }

    #[test]
    fn duplicate_transaction_id_is_rejected() {
        let (db, _) = create_db(small_tree());
        let id = TransactionId::new(500);
        let _first = db.begin_transaction(TransactionOptions::new().with_id(id)).unwrap();
        let err = db
            .begin_transaction(TransactionOptions::new().with_id(id))
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidOperation { .. }));
    }

    #[test]
    fn remove_and_replace() {
        let (db, _) = create_db(small_tree());
        db.transaction(TransactionOptions::new().write(USERS), |txn| {
            txn.insert_document(USERS, rev(1), b"a".to_vec())?;
            txn.insert_document(USERS, rev(2), b"b".to_vec())
        })
        .unwrap();

        db.transaction(TransactionOptions::new().write(USERS), |txn| {
            txn.remove_document(USERS, rev(1))?;
            txn.replace_document(USERS, rev(2), rev(3), b"b2".to_vec())
        })
        .unwrap();

        let users = db.collection(USERS).unwrap();
        assert_eq!(users.number_documents(), 1);
        db.sync_metadata(false).unwrap();
        let tree = users.revision_tree(db.engine().latest_sequence()).unwrap().unwrap();
        let expected = RevisionTree::new(3, 2).unwrap();
        expected.insert(3);
        assert_eq!(tree.root_hash(), expected.root_hash());
        assert_eq!(db.cached_document(USERS, rev(3)).unwrap(), Some(b"b2".to_vec()));
        assert_eq!(db.cached_document(USERS, rev(2)).unwrap(), None);
    }

    #[test]
    fn removing_a_missing_document_fails_without_side_effects() {
        let (db, _) = create_db(small_tree());
        let mut txn = db.begin_transaction(TransactionOptions::new().write(USERS)).unwrap();
        txn.insert_document(USERS, rev(1), b"a".to_vec()).unwrap();
        let err = txn.remove_document(USERS, rev(9)).unwrap_err();
        assert!(matches!(err, CoreError::DocumentNotFound { .. }));
        assert!(txn.is_running());
        assert_eq!(txn.document_operations(), 1);
        txn.commit().unwrap();
        assert_eq!(db.collection(USERS).unwrap().number_documents(), 1);
    }

    #[test]
    fn single_operation_allows_one_write() {
        let (db, _) = create_db(small_tree());
        let mut txn = db
            .begin_transaction(
                TransactionOptions::new()
                    .write(USERS)
                    .hints(TransactionHints::SINGLE_OPERATION),
            )
            .unwrap();
        txn.insert_document(USERS, rev(1), vec![1]).unwrap();
        assert!(matches!(
            txn.insert_document(USERS, rev(2), vec![2]),
            Err(CoreError::InvalidOperation { .. })
        ));
        assert!(matches!(
            txn.trigger_intermediate_commit(),
            Err(CoreError::InvalidOperation { .. })
        ));
        txn.commit().unwrap();
    }

    #[test]
    fn intermediate_commits_fold_into_counts() {
        let config = small_tree().intermediate_commit_count(2);
        let (db, _) = create_db(config);
        let mut txn = db.begin_transaction(TransactionOptions::new().write(USERS)).unwrap();
        for n in 1..=3 {
            txn.insert_document(USERS, rev(n), vec![n as u8]).unwrap();
        }
        assert_eq!(txn.intermediate_commits(), 1);

        let users = db.collection(USERS).unwrap();
        assert_eq!(users.metadata().buffered_len(), 1);

        txn.commit().unwrap();
        assert_eq!(users.metadata().buffered_len(), 2);
        assert_eq!(users.number_documents(), 3);

        db.sync_metadata(false).unwrap();
        assert_eq!(users.metadata().buffered_len(), 0);
        assert_eq!(users.document_count().added, 3);
        assert_eq!(db.stats().intermediate_commits(), 1);
    }

    #[test]
    fn follower_transactions_only_commit_intermediately_on_request() {
        let config = small_tree().intermediate_commit_count(1);
        let (db, _) = create_db(config);
        let mut txn = db
            .begin_transaction(
                TransactionOptions::new()
                    .write(USERS)
                    .hints(TransactionHints::FOLLOWER),
            )
            .unwrap();
        txn.insert_document(USERS, rev(1), vec![]).unwrap();
        txn.insert_document(USERS, rev(2), vec![]).unwrap();
        assert_eq!(txn.intermediate_commits(), 0);

        assert!(txn.trigger_intermediate_commit().unwrap().is_some());
        assert_eq!(txn.intermediate_commits(), 1);
        assert_eq!(txn.trigger_intermediate_commit().unwrap(), None);
        txn.commit().unwrap();
    }

    #[test]
    fn intermediate_commit_hook_can_veto() {
        struct Veto;
        impl crate::transaction::IntermediateCommitHook for Veto {
            fn before_intermediate_commit(&self, _: TransactionId) -> CoreResult<()> {
                Err(CoreError::ReplicationLeaderResigned { log: 1 })
            }
        }

        let (db, _) = create_db(small_tree());
        let mut txn = db.begin_transaction(TransactionOptions::new().write(USERS)).unwrap();
        txn.set_intermediate_commit_hook(Arc::new(Veto));
        txn.insert_document(USERS, rev(1), vec![]).unwrap();
        let err = txn.trigger_intermediate_commit().unwrap_err();
        assert!(err.is_ambiguous());
        assert_eq!(txn.status(), TransactionStatus::Aborted);
        assert_eq!(db.collection(USERS).unwrap().number_documents(), 0);
    }

    #[test]
    fn failed_physical_commit_aborts_and_leaves_counts_alone() {
        let (db, engine) = create_db(small_tree());
        let mut txn = db.begin_transaction(TransactionOptions::new().write(USERS)).unwrap();
        txn.insert_document(USERS, rev(1), vec![]).unwrap();

        engine.fail_next_commits(1);
        assert!(txn.commit().is_err());
        assert_eq!(txn.status(), TransactionStatus::Aborted);

        let users = db.collection(USERS).unwrap();
        assert_eq!(users.metadata().blocker_count(), 0);
        assert_eq!(users.metadata().buffered_len(), 0);
        assert_eq!(users.number_documents(), 0);
    }

    #[test]
    fn write_conflict_is_counted() {
        let (db, _) = create_db(small_tree());
        let mut first = db.begin_transaction(TransactionOptions::new().write(USERS)).unwrap();
        let mut second = db.begin_transaction(TransactionOptions::new().write(USERS)).unwrap();
        first.insert_document(USERS, rev(1), b"first".to_vec()).unwrap();
        second.insert_document(USERS, rev(1), b"second".to_vec()).unwrap();

        first.commit().unwrap();
        let err = second.commit().unwrap_err();
        assert!(matches!(err, CoreError::EngineConflict { .. }));
        assert_eq!(db.stats().snapshot().conflicts, 1);
        assert_eq!(db.collection(USERS).unwrap().number_documents(), 1);
    }

    #[test]
    fn memory_limit_aborts_transaction() {
        let config = small_tree().max_transaction_size(64);
        let (db, _) = create_db(config);
        let mut txn = db.begin_transaction(TransactionOptions::new().write(USERS)).unwrap();
        let err = txn.insert_document(USERS, rev(1), vec![0; 256]).unwrap_err();
        assert!(matches!(err, CoreError::ResourceExhausted { .. }));
        assert_eq!(txn.status(), TransactionStatus::Aborted);
        assert!(!db.collection(USERS).unwrap().is_locked());
    }

    #[test]
    fn savepoint_rollback_undoes_documents_and_counts() {
        let (db, _) = create_db(small_tree());
        let mut txn = db.begin_transaction(TransactionOptions::new().write(USERS)).unwrap();
        txn.insert_document(USERS, rev(1), vec![1]).unwrap();
        txn.set_savepoint().unwrap();
        txn.insert_document(USERS, rev(2), vec![2]).unwrap();
        txn.rollback_to_savepoint().unwrap();

        assert_eq!(txn.document(USERS, rev(2), true).unwrap(), None);
        assert_eq!(
            txn.collection(USERS).unwrap().operation_counts(),
            (1, 0, 0)
        );
        txn.commit().unwrap();
        assert_eq!(db.collection(USERS).unwrap().number_documents(), 1);
    }

    #[test]
    fn truncate_requires_exclusive_and_clears_tree() {
        let (db, _) = create_db(small_tree());
        db.transaction(TransactionOptions::new().write(USERS), |txn| {
            for n in 1..=4 {
                txn.insert_document(USERS, rev(n), vec![])?;
            }
            Ok(())
        })
        .unwrap();

        let mut shared = db.begin_transaction(TransactionOptions::new().write(USERS)).unwrap();
        assert!(matches!(shared.truncate(USERS), Err(CoreError::InvalidOperation { .. })));
        shared.abort().unwrap();

        let removed = db
            .transaction(TransactionOptions::new().exclusive(USERS), |txn| {
                let removed = txn.truncate(USERS)?;
                txn.insert_document(USERS, rev(10), vec![])?;
                Ok(removed)
            })
            .unwrap();
        assert_eq!(removed, 4);

        let users = db.collection(USERS).unwrap();
        assert_eq!(users.number_documents(), 1);
        db.sync_metadata(false).unwrap();
        let tree = users.revision_tree(db.engine().latest_sequence()).unwrap().unwrap();
        assert_eq!(tree.count(), 1);
    }

    #[test]
    fn follower_truncates_under_a_write_lock() {
        let (db, _) = create_db(small_tree());
        let mut txn = db
            .begin_transaction(
                TransactionOptions::new()
                    .write(USERS)
                    .hints(TransactionHints::FOLLOWER),
            )
            .unwrap();
        txn.insert_document(USERS, rev(1), vec![]).unwrap();
        assert_eq!(txn.truncate(USERS).unwrap(), 1);
        txn.commit().unwrap();
        assert_eq!(db.collection(USERS).unwrap().number_documents(), 0);
    }

    #[test]
    fn iteration_sees_own_writes() {
        let (db, _) = create_db(small_tree());
        db.transaction(TransactionOptions::new().write(USERS), |txn| {
            txn.insert_document(USERS, rev(1), b"a".to_vec())?;
            txn.insert_document(USERS, rev(3), b"c".to_vec())
        })
        .unwrap();

        let mut txn = db.begin_transaction(TransactionOptions::new().write(USERS)).unwrap();
        txn.insert_document(USERS, rev(2), b"b".to_vec()).unwrap();
        txn.remove_document(USERS, rev(3)).unwrap();

        let mut iter = txn.iter_documents(USERS, true).unwrap();
        let mut seen = Vec::new();
        while let Some((revision, value)) = txn.next_document(&mut iter).unwrap() {
            seen.push((revision.as_u64(), value));
        }
        assert_eq!(seen, vec![(1, b"a".to_vec()), (2, b"b".to_vec())]);
    }

    #[test]
    fn iteration_survives_intermediate_commit() {
        let config = small_tree().intermediate_commit_count(1);
        let (db, _) = create_db(config);
        db.transaction(TransactionOptions::new().write(USERS), |txn| {
            for n in 1..=4 {
                txn.insert_document(USERS, rev(n * 10), vec![])?;
            }
            Ok(())
        })
        .unwrap();

        let mut txn = db
            .begin_transaction(TransactionOptions::new().read(USERS).write(ORDERS))
            .unwrap();
        let mut iter = txn.iter_documents(USERS, true).unwrap();
        let mut seen = Vec::new();
        while let Some((revision, _)) = txn.next_document(&mut iter).unwrap() {
            seen.push(revision.as_u64());
            txn.insert_document(ORDERS, revision, vec![]).unwrap();
        }
        assert_eq!(seen, vec![10, 20, 30, 40]);
        assert!(txn.intermediate_commits() >= 3);
        txn.commit().unwrap();
    }

    #[test]
    fn blocker_hides_uncommitted_counts_from_sync() {
        let (db, _) = create_db(small_tree());
        let users = db.collection(USERS).unwrap();
        let slow = TransactionId::new(9_999);
        users
            .metadata()
            .place_blocker(slow, db.engine().latest_sequence().next());

        db.transaction(TransactionOptions::new().write(USERS), |txn| {
            txn.insert_document(USERS, rev(1), vec![])
        })
        .unwrap();
        db.sync_metadata(false).unwrap();
        assert_eq!(users.document_count().added, 0);
        assert_eq!(users.metadata().buffered_len(), 1);

        users.metadata().remove_blocker(slow);
        db.sync_metadata(false).unwrap();
        assert_eq!(users.document_count().added, 1);
    }

    #[test]
    fn concurrent_committers_produce_exact_counts() {
        let (db, _) = create_db(small_tree().intermediate_commit_count(3));
        let handles: Vec<_> = (0..4u64)
            .map(|worker| {
                let db = db.clone();
                thread::spawn(move || {
                    for batch in 0..5u64 {
                        db.transaction(TransactionOptions::new().write(USERS), |txn| {
                            for n in 0..4u64 {
                                txn.insert_document(USERS, rev(worker * 1000 + batch * 10 + n), vec![])?;
                            }
                            Ok(())
                        })
                        .unwrap();
                    }
                })
            })
            .collect();
        for _ in 0..10 {
            db.sync_metadata(false).unwrap();
        }
        for handle in handles {
            handle.join().unwrap();
        }

        db.sync_metadata(false).unwrap();
        let users = db.collection(USERS).unwrap();
        assert_eq!(users.document_count().number_documents(), 80);
        let tree = users.revision_tree(db.engine().latest_sequence()).unwrap().unwrap();
        assert_eq!(tree.count(), 80);
    }

    #[test]
    fn global_managed_status_is_recorded() {
        let (db, _) = create_db(small_tree());
        let mut txn = db
            .begin_transaction(
                TransactionOptions::new()
                    .write(USERS)
                    .hints(TransactionHints::GLOBAL_MANAGED),
            )
            .unwrap();
        let id = txn.id();
        assert_eq!(db.managed_status(id), Some(TransactionStatus::Running));
        txn.add_operation(USERS, rev(1), OperationKind::Update).unwrap();
        txn.commit().unwrap();
        assert_eq!(db.managed_status(id), Some(TransactionStatus::Committed));
        db.forget_managed(id);
        assert_eq!(db.managed_status(id), None);
    }

    #[test]
    fn cache_never_serves_stale_documents() {
        let (db, _) = create_db(small_tree());
        db.transaction(TransactionOptions::new().write(USERS), |txn| {
            txn.insert_document(USERS, rev(1), b"v1".to_vec())
        })
        .unwrap();
        assert_eq!(db.cached_document(USERS, rev(1)).unwrap(), Some(b"v1".to_vec()));

        let mut txn = db.begin_transaction(TransactionOptions::new().write(USERS)).unwrap();
        txn.remove_document(USERS, rev(1)).unwrap();
        assert_eq!(db.cached_document(USERS, rev(1)).unwrap(), Some(b"v1".to_vec()));
        assert!(db.cache().is_banished(&keys::document_key(USERS, rev(1))));
        txn.commit().unwrap();

        assert_eq!(db.cached_document(USERS, rev(1)).unwrap(), None);
    }

    #[test]
    fn estimators_track_index_hashes() {
        let (db, _) = create_db(small_tree());
        let index = IndexId::new(1);
        let estimator = db.register_estimator(USERS, index).unwrap();

        db.transaction(TransactionOptions::new().write(USERS), |txn| {
            txn.insert_document(USERS, rev(1), vec![])?;
            txn.track_index_insert(USERS, index, 7)?;
            txn.insert_document(USERS, rev(2), vec![])?;
            txn.track_index_insert(USERS, index, 7)
        })
        .unwrap();
        db.transaction(
            TransactionOptions::new()
                .write(USERS)
                .hints(TransactionHints::NO_INDEXING),
            |txn| {
                txn.insert_document(USERS, rev(3), vec![])?;
                txn.track_index_insert(USERS, index, 8)
            },
        )
        .unwrap();

        db.sync_metadata(true).unwrap();
        assert_eq!(estimator.total(), 2);
        assert!((estimator.selectivity() - 0.5).abs() < f64::EPSILON);

        let reopened = Database::open(Arc::clone(db.engine()), small_tree());
        reopened.register_collection(USERS, "users").unwrap();
        let restored = reopened.register_estimator(USERS, index).unwrap();
        assert_eq!(restored.total(), 2);
    }

    #[test]
    fn metadata_survives_reopen_and_recovery_skips_covered_sequences() {
        let (db, engine) = create_db(small_tree());
        db.transaction(TransactionOptions::new().write(USERS), |txn| {
            txn.insert_document(USERS, rev(1), vec![])?;
            txn.insert_document(USERS, rev(2), vec![])
        })
        .unwrap();
        db.sync_metadata(true).unwrap();
        let synced = db.collection(USERS).unwrap().document_count().committed_seq;

        db.transaction(TransactionOptions::new().write(USERS), |txn| {
            txn.insert_document(USERS, rev(3), vec![])
        })
        .unwrap();
        let unsynced = engine.latest_sequence();

        let reopened = Database::open(Arc::clone(&engine) as Arc<dyn KeyValueEngine>, small_tree());
        let users = reopened.register_collection(USERS, "users").unwrap();
        assert_eq!(users.number_documents(), 2);

        assert!(!reopened
            .recovery_apply(USERS, synced, RecoveredOperation::Insert(rev(2)))
            .unwrap());
        assert!(reopened
            .recovery_apply(USERS, unsynced, RecoveredOperation::Insert(rev(3)))
            .unwrap());
        reopened.recovery_done().unwrap();

        assert_eq!(users.number_documents(), 3);
        let tree = users.revision_tree(reopened.engine().latest_sequence()).unwrap().unwrap();
        assert_eq!(tree.count(), 3);
    }
}
