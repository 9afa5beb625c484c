//! Follower side of the replicated commit protocol.

use crate::config::FollowerConfig;
use crate::error::ReplicationResult;
use crate::log::ReplicatedLog;
use crate::operation::{DocumentAction, LogId, LogIndex, ReplicationKind, ReplicationOperation};
use mosaic_core::{
    AccessMode, CollectionId, Database, RevisionId, TransactionHints, TransactionId,
    TransactionOptions, TransactionState, TransactionStatus,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters of a [`FollowerApplier`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FollowerStats {
    /// Operations applied.
    pub applied: u64,
    /// Follower transactions committed.
    pub committed: u64,
    /// Follower transactions aborted.
    pub aborted: u64,
    /// `Commit`/`Abort` operations for finished transactions, ignored.
    pub duplicates: u64,
}

#[derive(Debug, Default)]
struct Counters {
    applied: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
    duplicates: AtomicU64,
}

/// Applies committed log entries to a follower database.
///
/// Each leader transaction becomes one follower transaction with the
/// leader's id and the `FOLLOWER | GLOBAL_MANAGED` hints. Collections join
/// it as operations arrive. `Commit` and `Abort` for a transaction that
/// already finished are ignored, so replaying a log is harmless.
pub struct FollowerApplier {
    db: Database,
    config: FollowerConfig,
    open: Mutex<HashMap<TransactionId, TransactionState>>,
    cursors: Mutex<HashMap<LogId, LogIndex>>,
    catching_up: Mutex<()>,
    counters: Counters,
}

impl FollowerApplier {
    /// Creates an applier for `db`.
    #[must_use]
    pub fn new(db: Database, config: FollowerConfig) -> Self {
        Self {
            db,
            config,
            open: Mutex::new(HashMap::new()),
            cursors: Mutex::new(HashMap::new()),
            catching_up: Mutex::new(()),
            counters: Counters::default(),
        }
    }

    /// Returns the follower database.
    #[must_use]
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Returns the number of follower transactions still open.
    #[must_use]
    pub fn open_transactions(&self) -> usize {
        self.open.lock().len()
    }

    /// Returns the last index applied from `log`.
    #[must_use]
    pub fn applied_index(&self, log: LogId) -> LogIndex {
        self.cursors.lock().get(&log).copied().unwrap_or_default()
    }

    /// Returns a copy of the counters.
    #[must_use]
    pub fn stats(&self) -> FollowerStats {
        FollowerStats {
            applied: self.counters.applied.load(Ordering::Relaxed),
            committed: self.counters.committed.load(Ordering::Relaxed),
            aborted: self.counters.aborted.load(Ordering::Relaxed),
            duplicates: self.counters.duplicates.load(Ordering::Relaxed),
        }
    }

    /// Applies every committed entry of `log` not applied yet.
    ///
    /// Returns the number of entries applied.
    ///
    /// # Errors
    ///
    /// Returns the first error; the cursor stays on the failed entry.
    pub fn catch_up(&self, log: &dyn ReplicatedLog) -> ReplicationResult<usize> {
        // Concurrent callers would apply the same entries twice.
        let _guard = self.catching_up.lock();
        let after = self.applied_index(log.id());
        let entries = log.committed_entries(after);
        let mut applied = 0;
        for entry in entries {
            self.apply(&entry.operation()?)?;
            self.cursors.lock().insert(log.id(), entry.index);
            applied += 1;
        }
        if applied > 0 {
            tracing::debug!(log = %log.id(), applied, "follower caught up");
        }
        Ok(applied)
    }

    /// Applies one replicated operation.
    ///
    /// # Errors
    ///
    /// Returns the local transaction error. A failed document operation
    /// aborts the follower transaction.
    pub fn apply(&self, operation: &ReplicationOperation) -> ReplicationResult<()> {
        let id = operation.transaction_id();
        match &operation.kind {
            ReplicationKind::Document { collection, action } => {
                self.apply_document(id, CollectionId::new(*collection), action)?;
            }
            ReplicationKind::IntermediateCommit => {
                let mut open = self.open.lock();
                if let Some(txn) = open.get_mut(&id) {
                    if let Err(e) = txn.trigger_intermediate_commit() {
                        open.remove(&id);
                        self.counters.aborted.fetch_add(1, Ordering::Relaxed);
                        return Err(e.into());
                    }
                }
            }
            ReplicationKind::Commit => self.finish(id, true)?,
            ReplicationKind::Abort => self.finish(id, false)?,
        }
        self.counters.applied.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn apply_document(&self, id: TransactionId, collection: CollectionId, action: &DocumentAction) -> ReplicationResult<()> {
        let mut open = self.open.lock();
        if !open.contains_key(&id) {
            if self.db.managed_status(id).is_some_and(TransactionStatus::is_finished) {
                tracing::debug!(transaction = %id, "ignoring operation of finished transaction");
                return Ok(());
            }
            let mut hints = TransactionHints::FOLLOWER | TransactionHints::GLOBAL_MANAGED;
            if self.config.no_indexing {
                hints |= TransactionHints::NO_INDEXING;
            }
            let options = TransactionOptions::new()
                .with_id(id)
                .hints(hints)
                .lock_timeout(self.config.lock_timeout);
            open.insert(id, self.db.begin_transaction(options)?);
        }
        let Some(txn) = open.get_mut(&id) else {
            return Ok(());
        };

        // A collection already held for writing is never upgraded.
        let mode = match action {
            DocumentAction::Truncate if txn.collection(collection).is_none() => AccessMode::Exclusive,
            _ => AccessMode::Write,
        };
        let result = txn.add_collection(collection, mode).and_then(|()| match action {
            DocumentAction::Insert { revision, value } => {
                txn.insert_document(collection, RevisionId::new(*revision), value.clone())
            }
            DocumentAction::Replace { old, new, value } => txn.replace_document(
                collection,
                RevisionId::new(*old),
                RevisionId::new(*new),
                value.clone(),
            ),
            DocumentAction::Remove { revision } => {
                txn.remove_document(collection, RevisionId::new(*revision))
            }
            DocumentAction::Truncate => txn.truncate(collection).map(|_| ()),
        });

        if let Err(e) = result {
            tracing::warn!(transaction = %id, %collection, error = %e, "follower operation failed, aborting");
            if let Some(mut txn) = open.remove(&id) {
                if txn.is_running() {
                    txn.abort()?;
                }
            }
            self.counters.aborted.fetch_add(1, Ordering::Relaxed);
            return Err(e.into());
        }
        Ok(())
    }

    fn finish(&self, id: TransactionId, commit: bool) -> ReplicationResult<()> {
        let Some(mut txn) = self.open.lock().remove(&id) else {
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        };
        if commit {
            txn.commit()?;
            self.counters.committed.fetch_add(1, Ordering::Relaxed);
        } else {
            txn.abort()?;
            self.counters.aborted.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Aborts every open follower transaction.
    ///
    /// Called when the leader is lost. Operations that were not followed by
    /// a committed `Commit` are never treated as committed.
    ///
    /// Returns the number of transactions aborted.
    pub fn on_leadership_lost(&self) -> usize {
        let open: Vec<TransactionState> = self.open.lock().drain().map(|(_, txn)| txn).collect();
        let count = open.len();
        for mut txn in open {
            if txn.is_running() {
                if let Err(e) = txn.abort() {
                    tracing::warn!(transaction = %txn.id(), error = %e, "abort after leader loss failed");
                }
            }
            self.counters.aborted.fetch_add(1, Ordering::Relaxed);
        }
        if count > 0 {
            tracing::warn!(aborted = count, "leader lost, aborted open follower transactions");
        }
        count
    }
}

impl Drop for FollowerApplier {
    fn drop(&mut self) {
        self.on_leadership_lost();
    }
}
