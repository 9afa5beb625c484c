//! Test fixtures and database helpers.
//!
//! Provides convenience functions for setting up test databases
//! and common test scenarios.

use mosaic_core::{CollectionId, Config, CoreResult, Database, RevisionId, RevisionTree, TransactionOptions};
use mosaic_storage::KeyValueEngine;

/// Collection registered by every fixture database.
pub const USERS: CollectionId = CollectionId(1);

/// Second collection registered by every fixture database.
pub const ORDERS: CollectionId = CollectionId(2);

/// Configuration used by fixtures: a small revision tree so diffs stay cheap.
#[must_use]
pub fn test_config() -> Config {
    Config::new().revision_tree_shape(3, 3)
}

/// A test database with the standard collections registered.
pub struct TestDatabase {
    /// The database instance.
    pub db: Database,
}

impl TestDatabase {
    /// Creates an in-memory database with [`test_config`].
    pub fn memory() -> Self {
        Self::with_config(test_config())
    }

    /// Creates an in-memory database with `config`.
    pub fn with_config(config: Config) -> Self {
        let db = Database::open_in_memory_with_config(config);
        db.register_collection(USERS, "users")
            .expect("fresh database has no users collection");
        db.register_collection(ORDERS, "orders")
            .expect("fresh database has no orders collection");
        Self { db }
    }
}

impl std::ops::Deref for TestDatabase {
    type Target = Database;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

/// Runs a test with a temporary in-memory database.
///
/// # Example
///
/// ```rust,ignore
/// use mosaic_testkit::with_test_db;
///
/// #[test]
/// fn my_test() {
///     with_test_db(|db| {
///         assert_eq!(db.collection(USERS).unwrap().number_documents(), 0);
///     });
/// }
/// ```
pub fn with_test_db<F, R>(f: F) -> R
where
    F: FnOnce(&Database) -> R,
{
    let test_db = TestDatabase::memory();
    f(&test_db.db)
}

/// Returns revision `n`.
#[must_use]
pub fn revision(n: u64) -> RevisionId {
    RevisionId::new(n)
}

/// Returns a small document body for revision `n`.
#[must_use]
pub fn document(n: u64) -> Vec<u8> {
    format!(r#"{{"rev":{n}}}"#).into_bytes()
}

/// Returns the revision tree of `collection` as of the latest sequence.
///
/// # Errors
///
/// Returns `CollectionNotFound` or a tree error.
pub fn current_tree(db: &Database, collection: CollectionId) -> CoreResult<Option<RevisionTree>> {
    db.collection(collection)?
        .revision_tree(db.engine().latest_sequence())
}

/// Returns true if both databases hold the same number of documents in
/// `collection` and their revision trees do not differ.
///
/// # Errors
///
/// Returns `CollectionNotFound` or a tree error.
pub fn converged(a: &Database, b: &Database, collection: CollectionId) -> CoreResult<bool> {
    if a.collection(collection)?.number_documents() != b.collection(collection)?.number_documents() {
        return Ok(false);
    }
    match (current_tree(a, collection)?, current_tree(b, collection)?) {
        (Some(mine), Some(theirs)) => Ok(mine.diff(&theirs)?.is_empty()),
        _ => Ok(false),
    }
}

/// Test scenario helpers.
pub mod seeded {
    use super::*;

    /// Creates a database with `count` committed documents in [`USERS`],
    /// revisions `1..=count`.
    pub fn populated_database(count: u64) -> TestDatabase {
        let test_db = TestDatabase::memory();
        test_db
            .transaction(TransactionOptions::new().write(USERS), |txn| {
                for n in 1..=count {
                    txn.insert_document(USERS, revision(n), document(n))?;
                }
                Ok(())
            })
            .expect("failed to populate users");
        test_db
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_database() {
        let test_db = TestDatabase::memory();
        assert_eq!(test_db.collections().len(), 2);
    }

    #[test]
    fn test_with_test_db() {
        let count = with_test_db(|db| db.collection(ORDERS).unwrap().number_documents());
        assert_eq!(count, 0);
    }

    #[test]
    fn test_populated_scenario() {
        let test_db = seeded::populated_database(10);
        assert_eq!(test_db.collection(USERS).unwrap().number_documents(), 10);
    }

    #[test]
    fn test_converged() {
        let a = seeded::populated_database(3);
        let b = seeded::populated_database(3);
        assert!(converged(&a, &b, USERS).unwrap());

        let c = seeded::populated_database(4);
        assert!(!converged(&a, &c, USERS).unwrap());
    }
}
