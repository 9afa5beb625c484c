//! Property-based test generators using proptest.
//!
//! Transactions are generated as scripts against a model of the live
//! revisions, so removes and replaces always name a revision that exists
//! when the script runs.

use mosaic_core::{CollectionId, CoreResult, Database, RevisionId, TransactionOptions};
use proptest::prelude::*;
use std::collections::BTreeSet;

/// One step of a generated transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptStep {
    /// Insert a fresh revision.
    Insert {
        /// Document body.
        value: Vec<u8>,
    },
    /// Remove the live revision selected by `pick` modulo the live count.
    Remove {
        /// Selector into the live revisions.
        pick: usize,
    },
    /// Replace the live revision selected by `pick` with a fresh one.
    Replace {
        /// Selector into the live revisions.
        pick: usize,
        /// Document body of the new revision.
        value: Vec<u8>,
    },
}

/// A generated transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionScript {
    /// Steps in order.
    pub steps: Vec<ScriptStep>,
    /// Whether the transaction commits or aborts at the end.
    pub commit: bool,
}

/// Strategy for generating document bodies.
pub fn document_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..64)
}

/// Strategy for generating revision ids, biased towards small values.
pub fn revision_strategy() -> impl Strategy<Value = RevisionId> {
    prop_oneof![
        3 => (0u64..4096).prop_map(RevisionId::new),
        1 => any::<u64>().prop_map(RevisionId::new),
    ]
}

/// Strategy for generating script steps.
pub fn script_step_strategy() -> impl Strategy<Value = ScriptStep> {
    prop_oneof![
        4 => document_strategy().prop_map(|value| ScriptStep::Insert { value }),
        2 => any::<usize>().prop_map(|pick| ScriptStep::Remove { pick }),
        1 => (any::<usize>(), document_strategy())
            .prop_map(|(pick, value)| ScriptStep::Replace { pick, value }),
    ]
}

/// Strategy for generating one transaction; roughly one in four aborts.
pub fn transaction_script_strategy(max_steps: usize) -> impl Strategy<Value = TransactionScript> {
    (
        prop::collection::vec(script_step_strategy(), 1..max_steps.max(2)),
        prop::bool::weighted(0.75),
    )
        .prop_map(|(steps, commit)| TransactionScript { steps, commit })
}

/// Strategy for generating a sequence of transactions.
pub fn workload_strategy(
    max_transactions: usize,
    max_steps: usize,
) -> impl Strategy<Value = Vec<TransactionScript>> {
    prop::collection::vec(transaction_script_strategy(max_steps), 1..max_transactions.max(2))
}

/// The revisions a collection should hold after a workload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionModel {
    live: BTreeSet<u64>,
    next_revision: u64,
}

impl CollectionModel {
    /// Creates an empty model.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the live revisions.
    #[must_use]
    pub fn live(&self) -> &BTreeSet<u64> {
        &self.live
    }

    /// Returns the number of live revisions.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.live.len() as u64
    }

    /// Returns true if no revision is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    fn fresh(&mut self) -> u64 {
        self.next_revision += 1;
        self.next_revision
    }

    fn pick(&self, pick: usize) -> Option<u64> {
        if self.live.is_empty() {
            return None;
        }
        self.live.iter().nth(pick % self.live.len()).copied()
    }

    /// Runs `script` against `collection` in one transaction and updates
    /// the model if it committed.
    ///
    /// Steps that need a live revision are skipped when none exists.
    ///
    /// # Errors
    ///
    /// Returns the first transaction error; the model is left unchanged.
    pub fn run(&mut self, db: &Database, collection: CollectionId, script: &TransactionScript) -> CoreResult<()> {
        let mut staged = self.clone();
        let mut txn = db.begin_transaction(TransactionOptions::new().write(collection))?;
        for step in &script.steps {
            match step {
                ScriptStep::Insert { value } => {
                    let revision = staged.fresh();
                    txn.insert_document(collection, RevisionId::new(revision), value.clone())?;
                    staged.live.insert(revision);
                }
                ScriptStep::Remove { pick } => {
                    if let Some(revision) = staged.pick(*pick) {
                        txn.remove_document(collection, RevisionId::new(revision))?;
                        staged.live.remove(&revision);
                    }
                }
                ScriptStep::Replace { pick, value } => {
                    if let Some(old) = staged.pick(*pick) {
                        let new = staged.fresh();
                        txn.replace_document(
                            collection,
                            RevisionId::new(old),
                            RevisionId::new(new),
                            value.clone(),
                        )?;
                        staged.live.remove(&old);
                        staged.live.insert(new);
                    }
                }
            }
        }

        if script.commit {
            txn.commit()?;
            *self = staged;
        } else {
            txn.abort()?;
            // Revision ids stay unique across aborted transactions.
            self.next_revision = staged.next_revision;
        }
        Ok(())
    }
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 1024,
            max_shrink_iters: 10000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{current_tree, TestDatabase, USERS};
    use mosaic_core::RevisionTree;

    #[test]
    fn aborted_scripts_leave_the_model_alone() {
        let db = TestDatabase::memory();
        let mut model = CollectionModel::new();
        let script = TransactionScript {
            steps: vec![ScriptStep::Insert { value: vec![1] }],
            commit: false,
        };
        model.run(&db, USERS, &script).unwrap();
        assert!(model.is_empty());
        assert_eq!(db.collection(USERS).unwrap().number_documents(), 0);
    }

    #[test]
    fn removes_on_an_empty_model_are_skipped() {
        let db = TestDatabase::memory();
        let mut model = CollectionModel::new();
        let script = TransactionScript {
            steps: vec![ScriptStep::Remove { pick: 3 }, ScriptStep::Insert { value: vec![] }],
            commit: true,
        };
        model.run(&db, USERS, &script).unwrap();
        assert_eq!(model.len(), 1);
    }

    proptest! {
        #![proptest_config(PropTestConfig::quick().to_proptest_config())]

        #[test]
        fn document_counts_follow_committed_transactions(workload in workload_strategy(12, 8)) {
            let db = TestDatabase::memory();
            let mut model = CollectionModel::new();
            for script in &workload {
                model.run(&db, USERS, script).unwrap();
            }
            prop_assert_eq!(db.collection(USERS).unwrap().number_documents(), model.len());

            db.sync_metadata(true).unwrap();
            prop_assert_eq!(db.collection(USERS).unwrap().document_count().number_documents(), model.len());
        }

        #[test]
        fn revision_tree_matches_live_revisions(workload in workload_strategy(8, 8)) {
            let db = TestDatabase::memory();
            let mut model = CollectionModel::new();
            for script in &workload {
                model.run(&db, USERS, script).unwrap();
            }

            let actual = current_tree(&db, USERS).unwrap().unwrap();
            let expected = RevisionTree::new(3, 3).unwrap();
            for revision in model.live() {
                expected.insert(*revision);
            }
            prop_assert!(actual.diff(&expected).unwrap().is_empty());
            prop_assert_eq!(actual.count(), model.len());
        }
    }
}
