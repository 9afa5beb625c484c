//! Named end-to-end scenarios.
//!
//! Each scenario drives the public API through one situation that has a
//! single correct outcome and reports whether it was observed.

use crate::cluster::ReplicatedCluster;
use crate::fixtures::{document, revision, test_config, TestDatabase, USERS};
use crate::stress::{run_local_stress, run_replicated_stress, StressConfig};
use mosaic_core::{CollectionMetadata, SequenceNumber, TransactionId, TransactionOptions};
use mosaic_replication::{LogIndex, ReplicatedLog, ReplicationError};
use serde::Serialize;
use std::thread;
use std::time::Duration;

/// Outcome of one scenario.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScenarioOutcome {
    /// Scenario name.
    pub name: &'static str,
    /// True if the expected outcome was observed.
    pub passed: bool,
    /// What went wrong, if anything.
    pub detail: Option<String>,
}

type Check = Result<(), String>;

fn ensure(condition: bool, message: impl FnOnce() -> String) -> Check {
    if condition {
        Ok(())
    } else {
        Err(message())
    }
}

fn fail(e: impl std::fmt::Display) -> String {
    e.to_string()
}

/// Every scenario, in run order.
pub const SCENARIOS: &[(&str, fn() -> Check)] = &[
    ("intermediate-commit-fold", intermediate_commit_fold),
    ("blocker-holds-back-fold", blocker_holds_back_fold),
    ("concurrent-exact-counts", concurrent_exact_counts),
    ("replicated-convergence", replicated_convergence),
    ("leader-crash-before-local-commit", leader_crash_before_local_commit),
];

/// Runs every scenario.
pub fn run_all() -> Vec<ScenarioOutcome> {
    SCENARIOS.iter().map(|(name, check)| run(name, *check)).collect()
}

/// Runs the scenario called `name`, if there is one.
pub fn run_named(name: &str) -> Option<ScenarioOutcome> {
    SCENARIOS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(name, check)| run(name, *check))
}

fn run(name: &'static str, check: fn() -> Check) -> ScenarioOutcome {
    tracing::debug!(scenario = name, "running scenario");
    let result = check();
    if let Err(detail) = &result {
        tracing::warn!(scenario = name, %detail, "scenario failed");
    }
    ScenarioOutcome {
        name,
        passed: result.is_ok(),
        detail: result.err(),
    }
}

/// Three inserts with an intermediate commit after two fold to +3 from two
/// buffered adjustments.
fn intermediate_commit_fold() -> Check {
    let db = TestDatabase::with_config(test_config().intermediate_commit_count(2));
    let mut txn = db
        .begin_transaction(TransactionOptions::new().write(USERS))
        .map_err(fail)?;
    for n in 1..=3 {
        txn.insert_document(USERS, revision(n), document(n)).map_err(fail)?;
    }
    ensure(txn.intermediate_commits() == 1, || {
        format!("expected one intermediate commit, saw {}", txn.intermediate_commits())
    })?;
    txn.commit().map_err(fail)?;

    let users = db.collection(USERS).map_err(fail)?;
    ensure(users.metadata().buffered_len() == 2, || {
        format!("expected two buffered adjustments, saw {}", users.metadata().buffered_len())
    })?;
    ensure(users.document_count().number_documents() == 0, || {
        "count folded before sync".to_string()
    })?;
    db.sync_metadata(true).map_err(fail)?;
    let folded = users.document_count().number_documents();
    ensure(folded == 3, || format!("expected 3 documents after fold, saw {folded}"))
}

/// A blocker at 100 holds back an adjustment buffered at 105.
fn blocker_holds_back_fold() -> Check {
    let meta = CollectionMetadata::new(USERS);
    let blocker = TransactionId::new(1);
    meta.place_blocker(blocker, SequenceNumber::new(100));
    meta.adjust_number_documents(SequenceNumber::new(105), revision(7), 1);

    let committable = meta.committable_seq(SequenceNumber::new(200));
    ensure(committable == SequenceNumber::new(99), || {
        format!("expected committable 99, saw {committable}")
    })?;
    meta.apply_adjustments(committable);
    ensure(meta.document_count().number_documents() == 0, || {
        "adjustment folded past the blocker".to_string()
    })?;

    meta.remove_blocker(blocker);
    meta.apply_adjustments(meta.committable_seq(SequenceNumber::new(200)));
    ensure(meta.document_count().number_documents() == 1, || {
        "adjustment not folded after blocker removal".to_string()
    })
}

fn concurrent_exact_counts() -> Check {
    let db = TestDatabase::memory();
    let report = run_local_stress(&db, USERS, &StressConfig::default()).map_err(fail)?;
    ensure(report.failed == 0, || format!("{} transactions failed", report.failed))?;
    ensure(report.is_consistent(), || {
        format!(
            "expected {} documents, counted {}",
            report.expected_documents, report.counted_documents
        )
    })
}

fn replicated_convergence() -> Check {
    let cluster = ReplicatedCluster::new(1);
    let config = StressConfig {
        transactions_per_thread: 25,
        ..StressConfig::default()
    };
    let report = run_replicated_stress(&cluster, USERS, &config).map_err(fail)?;
    ensure(report.is_consistent(), || {
        format!(
            "follower holds {} documents, expected {}",
            report.counted_documents, report.expected_documents
        )
    })?;
    ensure(cluster.converged(USERS).map_err(fail)?, || {
        "revision trees differ".to_string()
    })
}

/// The leader replicates its commit marker, loses leadership before the
/// quorum is reached and must not report success; after failover the
/// follower holds none of the transaction's documents.
fn leader_crash_before_local_commit() -> Check {
    let cluster = ReplicatedCluster::new(2);
    let mut txn = cluster
        .begin(TransactionOptions::new().write(USERS))
        .map_err(fail)?;
    txn.insert_document(USERS, revision(1), document(1)).map_err(fail)?;
    let documents = cluster.log.last_index();
    cluster.log.acknowledge("f1", documents);
    cluster.log.acknowledge("f2", documents);
    cluster.catch_up().map_err(fail)?;

    let committer = thread::spawn(move || txn.commit());
    let marker = LogIndex::new(documents.as_u64() + 1);
    while cluster.log.last_index() < marker {
        thread::sleep(Duration::from_millis(1));
    }
    cluster.log.acknowledge("f1", marker);
    cluster.log.resign();

    let outcome = committer
        .join()
        .map_err(|_| "committer panicked".to_string())?;
    ensure(
        matches!(outcome, Err(ReplicationError::LeaderResigned { .. })),
        || format!("expected an ambiguous outcome, saw {outcome:?}"),
    )?;
    ensure(cluster.log.commit_index() < marker, || {
        "commit marker reached the quorum".to_string()
    })?;

    cluster.catch_up().map_err(fail)?;
    cluster.follower.on_leadership_lost();
    let remaining = cluster
        .follower_db()
        .collection(USERS)
        .map_err(fail)?
        .number_documents();
    ensure(remaining == 0, || {
        format!("follower kept {remaining} uncommitted documents")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_scenario_passes() {
        for outcome in run_all() {
            assert!(outcome.passed, "{}: {:?}", outcome.name, outcome.detail);
        }
    }

    #[test]
    fn unknown_scenario() {
        assert!(run_named("no-such-scenario").is_none());
        assert!(run_named("blocker-holds-back-fold").unwrap().passed);
    }
}
