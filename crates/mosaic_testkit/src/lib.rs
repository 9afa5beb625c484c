//! # MosaicDB Testkit
//!
//! Test utilities for MosaicDB.
//!
//! This crate provides:
//! - Test fixtures and database helpers
//! - A leader/follower cluster over an in-memory replicated log
//! - Property-based test generators using proptest
//! - Concurrent stress drivers
//! - Named end-to-end scenarios
//!
//! ## Usage
//!
//! ```rust,ignore
//! use mosaic_testkit::prelude::*;
//!
//! #[test]
//! fn test_with_database() {
//!     with_test_db(|db| {
//!         db.transaction(TransactionOptions::new().write(USERS), |txn| {
//!             txn.insert_document(USERS, revision(1), document(1))
//!         })
//!         .unwrap();
//!     });
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod cluster;
pub mod fixtures;
pub mod generators;
pub mod scenarios;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cluster::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::stress::*;
    pub use mosaic_core::{CollectionId, Config, Database, RevisionId, TransactionOptions};
}

pub use cluster::*;
pub use fixtures::*;
pub use generators::*;
pub use scenarios::{run_all, ScenarioOutcome};
pub use stress::*;
