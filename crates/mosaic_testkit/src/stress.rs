//! Stress drivers for MosaicDB.
//!
//! These drivers run concurrent writers against a database or a replicated
//! cluster and report what committed, so callers can check that document
//! counts add up exactly.

use crate::cluster::ReplicatedCluster;
use mosaic_core::{CollectionId, CoreResult, Database, RevisionId, TransactionOptions};
use mosaic_replication::{ReplicatedTransactionState, ReplicationResult};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::thread;
use std::time::{Duration, Instant};

/// Configuration for stress runs.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of concurrent writer threads.
    pub threads: usize,
    /// Transactions started by each thread.
    pub transactions_per_thread: usize,
    /// Documents inserted by each transaction.
    pub inserts_per_transaction: usize,
    /// Probability that a transaction removes one of its own earlier
    /// documents before committing.
    pub remove_ratio: f64,
    /// Probability that a transaction aborts instead of committing.
    pub abort_ratio: f64,
    /// Maximum document size in bytes.
    pub max_document_size: usize,
    /// Seed for the per-thread random generators.
    pub seed: u64,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            transactions_per_thread: 100,
            inserts_per_transaction: 8,
            remove_ratio: 0.25,
            abort_ratio: 0.1,
            max_document_size: 256,
            seed: 0x5eed,
        }
    }
}

/// Result of a stress run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StressReport {
    /// Transactions committed.
    pub committed: u64,
    /// Transactions aborted on purpose.
    pub aborted: u64,
    /// Transactions that failed with an error.
    pub failed: u64,
    /// Net documents added by committed transactions.
    pub expected_documents: u64,
    /// Documents counted in the collection afterwards.
    pub counted_documents: u64,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Committed transactions per second.
    pub transactions_per_second: f64,
}

impl StressReport {
    fn finish(mut self, counted_documents: u64, duration: Duration) -> Self {
        self.counted_documents = counted_documents;
        self.duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self.transactions_per_second = if duration.as_secs_f64() > 0.0 {
            self.committed as f64 / duration.as_secs_f64()
        } else {
            0.0
        };
        self
    }

    fn merge(&mut self, other: &ThreadTally) {
        self.committed += other.committed;
        self.aborted += other.aborted;
        self.failed += other.failed;
        self.expected_documents += other.net_documents;
    }

    /// Returns true if the counted documents equal the expected ones.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.expected_documents == self.counted_documents
    }

    /// Renders the report as pretty JSON.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    /// Prints a summary of the run.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Committed: {}", self.committed);
        println!("Aborted: {}", self.aborted);
        println!("Failed: {}", self.failed);
        println!("Documents: {} expected, {} counted", self.expected_documents, self.counted_documents);
        println!("Duration: {} ms", self.duration_ms);
        println!("Throughput: {:.2} txn/sec", self.transactions_per_second);
    }
}

#[derive(Debug, Default)]
struct ThreadTally {
    committed: u64,
    aborted: u64,
    failed: u64,
    net_documents: u64,
}

/// What one generated transaction does.
struct Plan {
    revisions: Vec<RevisionId>,
    values: Vec<Vec<u8>>,
    remove: Option<RevisionId>,
    abort: bool,
}

impl Plan {
    fn generate(rng: &mut StdRng, config: &StressConfig, worker: usize, txn: usize) -> Self {
        let base = ((worker as u64) << 40) | ((txn as u64) << 16);
        let revisions: Vec<RevisionId> = (0..config.inserts_per_transaction)
            .map(|n| RevisionId::new(base + n as u64 + 1))
            .collect();
        let values = revisions
            .iter()
            .map(|_| vec![0xAB; rng.gen_range(0..=config.max_document_size)])
            .collect();
        let remove = (!revisions.is_empty() && rng.gen_bool(config.remove_ratio))
            .then(|| revisions[rng.gen_range(0..revisions.len())]);
        Self {
            revisions,
            values,
            remove,
            abort: rng.gen_bool(config.abort_ratio),
        }
    }

    fn net_documents(&self) -> u64 {
        self.revisions.len() as u64 - u64::from(self.remove.is_some())
    }
}

fn rng_for(config: &StressConfig, worker: usize) -> StdRng {
    StdRng::seed_from_u64(config.seed ^ (worker as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15))
}

/// Runs concurrent writers against `collection` of `db`.
///
/// # Errors
///
/// Returns `CollectionNotFound` if `collection` is not registered.
pub fn run_local_stress(db: &Database, collection: CollectionId, config: &StressConfig) -> CoreResult<StressReport> {
    db.collection(collection)?;
    let start = Instant::now();
    let handles: Vec<_> = (0..config.threads)
        .map(|worker| {
            let db = db.clone();
            let config = config.clone();
            thread::spawn(move || {
                let mut rng = rng_for(&config, worker);
                let mut tally = ThreadTally::default();
                for txn in 0..config.transactions_per_thread {
                    let plan = Plan::generate(&mut rng, &config, worker, txn);
                    match run_local_plan(&db, collection, &plan) {
                        Ok(()) if plan.abort => tally.aborted += 1,
                        Ok(()) => {
                            tally.committed += 1;
                            tally.net_documents += plan.net_documents();
                        }
                        Err(e) => {
                            tracing::debug!(worker, error = %e, "stress transaction failed");
                            tally.failed += 1;
                        }
                    }
                }
                tally
            })
        })
        .collect();

    let mut report = StressReport::default();
    for handle in handles {
        report.merge(&handle.join().expect("stress worker panicked"));
    }
    let counted = db.collection(collection)?.number_documents();
    Ok(report.finish(counted, start.elapsed()))
}

fn run_local_plan(db: &Database, collection: CollectionId, plan: &Plan) -> CoreResult<()> {
    let mut txn = db.begin_transaction(TransactionOptions::new().write(collection))?;
    for (revision, value) in plan.revisions.iter().zip(&plan.values) {
        txn.insert_document(collection, *revision, value.clone())?;
    }
    if let Some(revision) = plan.remove {
        txn.remove_document(collection, revision)?;
    }
    if plan.abort {
        txn.abort()
    } else {
        txn.commit().map(|_| ())
    }
}

/// Runs concurrent replicated writers on the leader of `cluster`.
///
/// Background ackers, as many as the log's write concern needs, play the
/// followers for the whole run, so the follower is caught up when this
/// returns.
///
/// # Errors
///
/// Returns the follower's apply error, or `CollectionNotFound`.
pub fn run_replicated_stress(
    cluster: &ReplicatedCluster,
    collection: CollectionId,
    config: &StressConfig,
) -> ReplicationResult<StressReport> {
    cluster.leader.collection(collection)?;
    let ackers: Vec<_> = (0..cluster.log.config().write_concern.max(1))
        .map(|n| cluster.spawn_acker(&format!("stress-follower-{n}")))
        .collect();
    let start = Instant::now();
    let handles: Vec<_> = (0..config.threads)
        .map(|worker| {
            let leader = cluster.leader.clone();
            let directory = cluster.directory.clone();
            let config = config.clone();
            thread::spawn(move || {
                let mut rng = rng_for(&config, worker);
                let mut tally = ThreadTally::default();
                for txn in 0..config.transactions_per_thread {
                    let plan = Plan::generate(&mut rng, &config, worker, txn);
                    let result = ReplicatedTransactionState::begin(
                        &leader,
                        &directory,
                        TransactionOptions::new().write(collection),
                    )
                    .and_then(|mut txn| run_replicated_plan(&mut txn, collection, &plan));
                    match result {
                        Ok(()) if plan.abort => tally.aborted += 1,
                        Ok(()) => {
                            tally.committed += 1;
                            tally.net_documents += plan.net_documents();
                        }
                        Err(e) => {
                            tracing::debug!(worker, error = %e, "replicated stress transaction failed");
                            tally.failed += 1;
                        }
                    }
                }
                tally
            })
        })
        .collect();

    let mut report = StressReport::default();
    for handle in handles {
        report.merge(&handle.join().expect("stress worker panicked"));
    }
    let elapsed = start.elapsed();
    for acker in ackers {
        acker.stop()?;
    }
    let counted = cluster.follower_db().collection(collection)?.number_documents();
    Ok(report.finish(counted, elapsed))
}

fn run_replicated_plan(
    txn: &mut ReplicatedTransactionState,
    collection: CollectionId,
    plan: &Plan,
) -> ReplicationResult<()> {
    for (revision, value) in plan.revisions.iter().zip(&plan.values) {
        txn.insert_document(collection, *revision, value.clone())?;
    }
    if let Some(revision) = plan.remove {
        txn.remove_document(collection, revision)?;
    }
    if plan.abort {
        txn.abort()
    } else {
        txn.commit().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{TestDatabase, USERS};

    fn small() -> StressConfig {
        StressConfig {
            threads: 4,
            transactions_per_thread: 20,
            inserts_per_transaction: 4,
            max_document_size: 32,
            ..Default::default()
        }
    }

    #[test]
    fn local_stress_counts_add_up() {
        let db = TestDatabase::memory();
        let report = run_local_stress(&db, USERS, &small()).unwrap();
        assert_eq!(report.failed, 0);
        assert_eq!(report.committed + report.aborted, 80);
        assert!(report.is_consistent(), "{report:?}");
    }

    #[test]
    fn replicated_stress_converges() {
        let cluster = ReplicatedCluster::new(1);
        let report = run_replicated_stress(&cluster, USERS, &small()).unwrap();
        assert_eq!(report.failed, 0);
        assert!(report.is_consistent(), "{report:?}");
        assert!(cluster.converged(USERS).unwrap());
    }

    #[test]
    fn same_seed_same_plan() {
        let config = small();
        let a = Plan::generate(&mut rng_for(&config, 1), &config, 1, 0);
        let b = Plan::generate(&mut rng_for(&config, 1), &config, 1, 0);
        assert_eq!(a.revisions, b.revisions);
        assert_eq!(a.remove, b.remove);
        assert_eq!(a.abort, b.abort);
    }

    #[test]
    fn report_renders_as_json() {
        let report = StressReport {
            committed: 3,
            expected_documents: 5,
            counted_documents: 5,
            ..Default::default()
        };
        let json: serde_json::Value = serde_json::from_str(&report.to_json()).unwrap();
        assert_eq!(json["committed"], 3);
        assert_eq!(json["expected_documents"], 5);
    }
}
