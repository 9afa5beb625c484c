//! A leader and a follower sharing one in-memory replicated log.

use crate::fixtures::{converged, TestDatabase, ORDERS, USERS};
use mosaic_core::{CollectionId, Config, CoreResult, Database, TransactionOptions};
use mosaic_replication::{
    FollowerApplier, FollowerConfig, InMemoryReplicatedLog, LogConfig, LogDirectory, LogId,
    ReplicatedLog, ReplicatedTransactionState, ReplicationResult,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A leader database, a follower applier and the log between them.
///
/// Both fixture collections are routed to the same log.
pub struct ReplicatedCluster {
    /// The leader database.
    pub leader: Database,
    /// The follower applier and its database.
    pub follower: Arc<FollowerApplier>,
    /// The shared log.
    pub log: Arc<InMemoryReplicatedLog>,
    /// Collection to log routing used by leader transactions.
    pub directory: LogDirectory,
}

impl ReplicatedCluster {
    /// Creates a cluster whose log needs `write_concern` acknowledgements.
    pub fn new(write_concern: usize) -> Self {
        Self::with_config(write_concern, crate::fixtures::test_config())
    }

    /// Creates a cluster whose leader uses `config`.
    pub fn with_config(write_concern: usize, config: Config) -> Self {
        let log = Arc::new(InMemoryReplicatedLog::new(
            LogId::new(1),
            LogConfig::new(write_concern),
        ));
        let mut directory = LogDirectory::new();
        for collection in [USERS, ORDERS] {
            directory.assign(collection, Arc::clone(&log) as Arc<dyn ReplicatedLog>);
        }
        Self {
            leader: TestDatabase::with_config(config).db,
            follower: Arc::new(FollowerApplier::new(
                TestDatabase::memory().db,
                FollowerConfig::new(),
            )),
            log,
            directory,
        }
    }

    /// Begins a replicated transaction on the leader.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`ReplicatedTransactionState::begin`].
    pub fn begin(&self, options: TransactionOptions) -> ReplicationResult<ReplicatedTransactionState> {
        ReplicatedTransactionState::begin(&self.leader, &self.directory, options)
    }

    /// Returns the follower database.
    pub fn follower_db(&self) -> &Database {
        self.follower.database()
    }

    /// Applies everything committed so far to the follower.
    ///
    /// # Errors
    ///
    /// Returns the follower's apply error.
    pub fn catch_up(&self) -> ReplicationResult<usize> {
        self.follower.catch_up(&*self.log)
    }

    /// Starts a thread that acknowledges every appended entry as
    /// `participant` and keeps the follower caught up.
    pub fn spawn_acker(&self, participant: &str) -> Acker {
        let stop = Arc::new(AtomicBool::new(false));
        let log = Arc::clone(&self.log);
        let follower = Arc::clone(&self.follower);
        let participant = participant.to_string();
        let flag = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            while !flag.load(Ordering::Acquire) {
                log.acknowledge(&participant, log.last_index());
                follower.catch_up(&*log)?;
                thread::sleep(Duration::from_micros(200));
            }
            log.acknowledge(&participant, log.last_index());
            follower.catch_up(&*log)?;
            Ok(())
        });
        Acker { stop, handle }
    }

    /// Returns true if the follower matches the leader for `collection`.
    ///
    /// # Errors
    ///
    /// Returns `CollectionNotFound` or a tree error.
    pub fn converged(&self, collection: CollectionId) -> CoreResult<bool> {
        converged(&self.leader, self.follower_db(), collection)
    }
}

/// Handle of a thread started by [`ReplicatedCluster::spawn_acker`].
pub struct Acker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<ReplicationResult<()>>,
}

impl Acker {
    /// Stops the thread after one last acknowledgement and catch-up.
    ///
    /// # Errors
    ///
    /// Returns the first follower error the thread hit.
    pub fn stop(self) -> ReplicationResult<()> {
        self.stop.store(true, Ordering::Release);
        self.handle.join().expect("acker thread panicked")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{document, revision};

    #[test]
    fn acker_replicates_commits() {
        let cluster = ReplicatedCluster::new(1);
        let acker = cluster.spawn_acker("f1");

        let mut txn = cluster.begin(TransactionOptions::new().write(USERS)).unwrap();
        txn.insert_document(USERS, revision(1), document(1)).unwrap();
        txn.commit().unwrap();

        acker.stop().unwrap();
        assert!(cluster.converged(USERS).unwrap());
        assert_eq!(cluster.follower.stats().committed, 1);
    }

    #[test]
    fn follower_lags_until_caught_up() {
        let cluster = ReplicatedCluster::new(0);
        let mut txn = cluster.begin(TransactionOptions::new().write(ORDERS)).unwrap();
        txn.insert_document(ORDERS, revision(5), document(5)).unwrap();
        txn.commit().unwrap();

        assert!(!cluster.converged(ORDERS).unwrap());
        assert_eq!(cluster.catch_up().unwrap(), 2);
        assert!(cluster.converged(ORDERS).unwrap());
    }
}
