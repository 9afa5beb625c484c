//! Transaction statistics.
//!
//! Atomic counters for monitoring the transactional core.
//!
//! # Usage
//!
//! ```rust,ignore
//! let stats = db.stats().snapshot();
//! println!("committed: {}", stats.transactions_committed);
//! println!("intermediate commits: {}", stats.intermediate_commits);
//! ```

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Database statistics and metrics.
///
/// All counters are atomic and monotonically increasing.
#[derive(Debug, Default)]
pub struct DatabaseStats {
    transactions_started: AtomicU64,
    transactions_committed: AtomicU64,
    transactions_aborted: AtomicU64,
    intermediate_commits: AtomicU64,
    lock_timeouts: AtomicU64,
    conflicts: AtomicU64,
    documents_written: AtomicU64,
    metadata_syncs: AtomicU64,
    metadata_persists: AtomicU64,
}

impl DatabaseStats {
    /// Creates a new stats instance.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_transaction_start(&self) {
        self.transactions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_commit(&self) {
        self.transactions_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_abort(&self) {
        self.transactions_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_intermediate_commit(&self) {
        self.intermediate_commits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_lock_timeout(&self) {
        self.lock_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_document_write(&self) {
        self.documents_written.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_metadata_sync(&self, persisted: bool) {
        self.metadata_syncs.fetch_add(1, Ordering::Relaxed);
        if persisted {
            self.metadata_persists.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Returns the total number of transactions started.
    pub fn transactions_started(&self) -> u64 {
        self.transactions_started.load(Ordering::Relaxed)
    }

    /// Returns the total number of transactions committed.
    pub fn transactions_committed(&self) -> u64 {
        self.transactions_committed.load(Ordering::Relaxed)
    }

    /// Returns the total number of transactions aborted.
    pub fn transactions_aborted(&self) -> u64 {
        self.transactions_aborted.load(Ordering::Relaxed)
    }

    /// Returns the total number of intermediate commits.
    pub fn intermediate_commits(&self) -> u64 {
        self.intermediate_commits.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of all stats.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            transactions_started: self.transactions_started(),
            transactions_committed: self.transactions_committed(),
            transactions_aborted: self.transactions_aborted(),
            intermediate_commits: self.intermediate_commits(),
            lock_timeouts: self.lock_timeouts.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            documents_written: self.documents_written.load(Ordering::Relaxed),
            metadata_syncs: self.metadata_syncs.load(Ordering::Relaxed),
            metadata_persists: self.metadata_persists.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of [`DatabaseStats`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct StatsSnapshot {
    /// Transactions started.
    pub transactions_started: u64,
    /// Transactions committed.
    pub transactions_committed: u64,
    /// Transactions aborted, explicitly or automatically.
    pub transactions_aborted: u64,
    /// Intermediate commits performed.
    pub intermediate_commits: u64,
    /// Collection lock acquisitions that timed out.
    pub lock_timeouts: u64,
    /// Physical commits rejected by write-write conflicts.
    pub conflicts: u64,
    /// Document writes staged.
    pub documents_written: u64,
    /// Metadata sync passes.
    pub metadata_syncs: u64,
    /// Metadata sync passes that wrote to the engine.
    pub metadata_persists: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_stats_are_zero() {
        let stats = DatabaseStats::new();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn record_transactions() {
        let stats = DatabaseStats::new();

        stats.record_transaction_start();
        stats.record_transaction_start();
        stats.record_transaction_commit();
        stats.record_transaction_abort();
        stats.record_intermediate_commit();

        let snap = stats.snapshot();
        assert_eq!(snap.transactions_started, 2);
        assert_eq!(snap.transactions_committed, 1);
        assert_eq!(snap.transactions_aborted, 1);
        assert_eq!(snap.intermediate_commits, 1);
    }

    #[test]
    fn metadata_sync_counts_persists_separately() {
        let stats = DatabaseStats::new();
        stats.record_metadata_sync(false);
        stats.record_metadata_sync(true);

        let snap = stats.snapshot();
        assert_eq!(snap.metadata_syncs, 2);
        assert_eq!(snap.metadata_persists, 1);
    }

    #[test]
    fn concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let stats = Arc::new(DatabaseStats::new());
        let mut handles = vec![];

        for _ in 0..10 {
            let s = Arc::clone(&stats);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    s.record_transaction_start();
                    s.record_transaction_commit();
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(stats.transactions_started(), 1000);
        assert_eq!(stats.transactions_committed(), 1000);
    }
}
