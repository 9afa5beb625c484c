//! Leader side of the replicated commit protocol.

use crate::error::{ReplicationError, ReplicationResult};
use crate::log::ReplicatedLog;
use crate::operation::{DocumentAction, LogId, LogIndex, ReplicationKind, ReplicationOperation};
use mosaic_core::{
    CollectionId, CoreResult, Database, IntermediateCommitHook, RevisionId, SequenceNumber,
    TransactionId, TransactionOptions, TransactionState,
};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Maps collections to the replicated logs that carry their changes.
///
/// Several collections may share one log.
#[derive(Clone, Default)]
pub struct LogDirectory {
    logs: BTreeMap<CollectionId, Arc<dyn ReplicatedLog>>,
}

impl LogDirectory {
    /// Creates an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes `collection` to `log`.
    pub fn assign(&mut self, collection: CollectionId, log: Arc<dyn ReplicatedLog>) {
        self.logs.insert(collection, log);
    }

    /// Returns the log of `collection`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownCollection` if none is assigned.
    pub fn log_for(&self, collection: CollectionId) -> ReplicationResult<Arc<dyn ReplicatedLog>> {
        self.logs
            .get(&collection)
            .cloned()
            .ok_or(ReplicationError::UnknownCollection { collection })
    }
}

impl fmt::Debug for LogDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.logs.iter().map(|(c, log)| (c, log.id())))
            .finish()
    }
}

/// A collection written by a replicated transaction and its log.
#[derive(Clone)]
pub struct ReplicatedTransactionCollection {
    collection: CollectionId,
    log: Arc<dyn ReplicatedLog>,
}

impl ReplicatedTransactionCollection {
    /// Returns the collection id.
    #[must_use]
    pub fn collection(&self) -> CollectionId {
        self.collection
    }

    /// Returns the log carrying this collection's changes.
    #[must_use]
    pub fn log(&self) -> &Arc<dyn ReplicatedLog> {
        &self.log
    }

    fn replicate(&self, transaction: TransactionId, action: DocumentAction) -> ReplicationResult<LogIndex> {
        self.log
            .append(&ReplicationOperation::document(transaction, self.collection, action))
    }
}

impl fmt::Debug for ReplicatedTransactionCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicatedTransactionCollection")
            .field("collection", &self.collection)
            .field("log", &self.log.id())
            .finish()
    }
}

/// Appends `kind` to every log and waits until each entry is committed.
fn replicate_and_wait(
    logs: &[Arc<dyn ReplicatedLog>],
    transaction: TransactionId,
    kind: &ReplicationKind,
) -> ReplicationResult<()> {
    let operation = ReplicationOperation::new(transaction, kind.clone());
    let mut pending = Vec::with_capacity(logs.len());
    for log in logs {
        pending.push((log, log.append(&operation)?));
    }
    for (log, index) in pending {
        log.wait_for_commit(index)?;
    }
    Ok(())
}

struct IntermediateCommitReplicator {
    logs: Vec<Arc<dyn ReplicatedLog>>,
}

impl IntermediateCommitHook for IntermediateCommitReplicator {
    fn before_intermediate_commit(&self, transaction: TransactionId) -> CoreResult<()> {
        replicate_and_wait(&self.logs, transaction, &ReplicationKind::IntermediateCommit)
            .map_err(Into::into)
    }
}

/// A leader transaction whose changes are replicated to followers.
///
/// Document writes apply locally first and are then appended to the
/// collection's log without waiting. Commit appends a `Commit` marker to
/// every participating log, waits until each is committed and only then
/// commits locally. Intermediate commits replicate their own marker first
/// in the same way.
///
/// If a log's leader resigns while the transaction waits, the local
/// transaction is aborted and `LeaderResigned` is returned. That outcome is
/// ambiguous: followers may still commit the transaction.
///
/// # Example
///
/// ```rust,ignore
/// let mut txn = ReplicatedTransactionState::begin(&db, &logs, TransactionOptions::new().write(users))?;
/// txn.insert_document(users, RevisionId::new(1), doc)?;
/// txn.commit()?;
/// ```
pub struct ReplicatedTransactionState {
    inner: TransactionState,
    collections: BTreeMap<CollectionId, ReplicatedTransactionCollection>,
}

impl ReplicatedTransactionState {
    /// Begins a replicated transaction.
    ///
    /// Every collection declared for writing needs a log in `directory`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownCollection`, or the errors of
    /// [`Database::begin_transaction`].
    pub fn begin(db: &Database, directory: &LogDirectory, options: TransactionOptions) -> ReplicationResult<Self> {
        let mut collections = BTreeMap::new();
        for collection in options.write.iter().chain(options.exclusive.iter()) {
            collections.insert(
                *collection,
                ReplicatedTransactionCollection {
                    collection: *collection,
                    log: directory.log_for(*collection)?,
                },
            );
        }

        let mut inner = db.begin_transaction(options)?;
        let logs = Self::distinct_logs(collections.values());
        inner.set_intermediate_commit_hook(Arc::new(IntermediateCommitReplicator { logs }));
        tracing::debug!(
            transaction = %inner.id(),
            logs = collections.len(),
            "began replicated transaction"
        );
        Ok(Self { inner, collections })
    }

    fn distinct_logs<'a>(
        collections: impl Iterator<Item = &'a ReplicatedTransactionCollection>,
    ) -> Vec<Arc<dyn ReplicatedLog>> {
        let mut logs: BTreeMap<LogId, Arc<dyn ReplicatedLog>> = BTreeMap::new();
        for tc in collections {
            logs.entry(tc.log.id()).or_insert_with(|| Arc::clone(&tc.log));
        }
        logs.into_values().collect()
    }

    /// Returns the transaction id.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.inner.id()
    }

    /// Returns the local transaction.
    #[must_use]
    pub fn state(&self) -> &TransactionState {
        &self.inner
    }

    /// Returns the replicated collection state of `collection`.
    #[must_use]
    pub fn collection(&self, collection: CollectionId) -> Option<&ReplicatedTransactionCollection> {
        self.collections.get(&collection)
    }

    fn replicate(&mut self, collection: CollectionId, action: DocumentAction) -> ReplicationResult<()> {
        let id = self.inner.id();
        let tc = self
            .collections
            .get(&collection)
            .ok_or(ReplicationError::UnknownCollection { collection })?;
        if let Err(e) = tc.replicate(id, action) {
            tracing::warn!(transaction = %id, %collection, error = %e, "replication failed, aborting");
            if self.inner.is_running() {
                self.inner.abort()?;
            }
            return Err(e);
        }
        Ok(())
    }

    /// Inserts a document and replicates the insert.
    ///
    /// # Errors
    ///
    /// Returns the local error, or `LeaderResigned` (which aborts).
    pub fn insert_document(&mut self, collection: CollectionId, revision: RevisionId, value: Vec<u8>) -> ReplicationResult<()> {
        self.inner.insert_document(collection, revision, value.clone())?;
        self.replicate(collection, DocumentAction::insert(revision, value))
    }

    /// Removes a document and replicates the removal.
    ///
    /// # Errors
    ///
    /// Same as [`ReplicatedTransactionState::insert_document`].
    pub fn remove_document(&mut self, collection: CollectionId, revision: RevisionId) -> ReplicationResult<()> {
        self.inner.remove_document(collection, revision)?;
        self.replicate(collection, DocumentAction::remove(revision))
    }

    /// Replaces a document and replicates the replacement.
    ///
    /// # Errors
    ///
    /// Same as [`ReplicatedTransactionState::insert_document`].
    pub fn replace_document(
        &mut self,
        collection: CollectionId,
        old: RevisionId,
        new: RevisionId,
        value: Vec<u8>,
    ) -> ReplicationResult<()> {
        self.inner.replace_document(collection, old, new, value.clone())?;
        self.replicate(collection, DocumentAction::replace(old, new, value))
    }

    /// Truncates a collection and replicates the truncate.
    ///
    /// # Errors
    ///
    /// Same as [`ReplicatedTransactionState::insert_document`].
    pub fn truncate(&mut self, collection: CollectionId) -> ReplicationResult<u64> {
        let removed = self.inner.truncate(collection)?;
        self.replicate(collection, DocumentAction::Truncate)?;
        Ok(removed)
    }

    /// Reads a document, including the transaction's own writes.
    ///
    /// # Errors
    ///
    /// Returns the local read error.
    pub fn document(&mut self, collection: CollectionId, revision: RevisionId) -> ReplicationResult<Option<Vec<u8>>> {
        Ok(self.inner.document(collection, revision, true)?)
    }

    /// Replicates an intermediate commit marker, then commits the current
    /// batch locally.
    ///
    /// # Errors
    ///
    /// Returns `LeaderResigned` (the transaction is aborted) or the local
    /// error.
    pub fn trigger_intermediate_commit(&mut self) -> ReplicationResult<Option<SequenceNumber>> {
        Ok(self.inner.trigger_intermediate_commit()?)
    }

    /// Replicates the commit, waits for it and commits locally.
    ///
    /// # Errors
    ///
    /// Returns `LeaderResigned` if a log resigned during the wait; the
    /// local transaction is aborted and the outcome is ambiguous. A local
    /// commit failure after replication resigns the participating logs.
    pub fn commit(&mut self) -> ReplicationResult<Option<SequenceNumber>> {
        let id = self.inner.id();
        if !self.inner.is_running() || !self.inner.has_operations() {
            return Ok(self.inner.commit()?);
        }

        let logs = Self::distinct_logs(self.collections.values());
        if let Err(e) = replicate_and_wait(&logs, id, &ReplicationKind::Commit) {
            tracing::warn!(transaction = %id, error = %e, "commit not confirmed by log, aborting locally");
            if self.inner.is_running() {
                self.inner.abort()?;
            }
            return Err(e);
        }

        match self.inner.commit() {
            Ok(seq) => {
                tracing::debug!(transaction = %id, logs = logs.len(), "replicated commit");
                Ok(seq)
            }
            Err(e) => {
                // Followers commit the replicated marker; this leader must not
                // keep serving a diverged state.
                tracing::error!(transaction = %id, error = %e, "local commit failed after replication");
                for log in &logs {
                    log.resign();
                }
                Err(e.into())
            }
        }
    }

    /// Replicates an abort marker and aborts locally.
    ///
    /// A resigned log does not prevent the local abort.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the transaction is not running.
    pub fn abort(&mut self) -> ReplicationResult<()> {
        self.replicate_abort();
        Ok(self.inner.abort()?)
    }

    fn replicate_abort(&self) {
        let operation = ReplicationOperation::new(self.inner.id(), ReplicationKind::Abort);
        for log in Self::distinct_logs(self.collections.values()) {
            if let Err(e) = log.append(&operation) {
                tracing::debug!(transaction = %self.inner.id(), log = %log.id(), error = %e, "abort not replicated");
            }
        }
    }
}

impl Drop for ReplicatedTransactionState {
    fn drop(&mut self) {
        if self.inner.is_running() {
            self.replicate_abort();
        }
    }
}

impl fmt::Debug for ReplicatedTransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicatedTransactionState")
            .field("inner", &self.inner)
            .field("collections", &self.collections)
            .finish()
    }
}
