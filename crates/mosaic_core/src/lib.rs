//! # Mosaic Core
//!
//! Transactional storage core for MosaicDB.
//!
//! This crate provides:
//! - Document transactions over an ordered key-value engine, with
//!   collection locks, savepoints and intermediate commits
//! - Per-collection document counts kept exact under concurrent commits
//!   through blockers and a committable watermark
//! - Revision trees: Merkle-style summaries of a collection's revisions
//!   that can be diffed to find ranges needing resynchronization
//! - Index selectivity estimates buffered the same way as counts
//! - A document cache that never serves values a writer is changing
//!
//! ## Example
//!
//! ```rust,ignore
//! use mosaic_core::{CollectionId, Database, RevisionId, TransactionOptions};
//!
//! let db = Database::open_in_memory();
//! let users = CollectionId::new(1);
//! db.register_collection(users, "users")?;
//!
//! let mut txn = db.begin_transaction(TransactionOptions::new().write(users))?;
//! txn.insert_document(users, RevisionId::new(1), b"alice".to_vec())?;
//! txn.commit()?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cache;
mod collection;
mod config;
mod database;
mod error;
mod hints;
pub mod keys;
pub mod revision_tree;
mod stats;
pub mod transaction;
mod types;

pub use cache::{CacheToken, DocumentCache};
pub use collection::{
    AccessMode, BufferedAdjustment, Collection, CollectionLock, CollectionMetadata, DocCount,
    IndexEstimator, MetadataSync, RecoveredOperation, SelectivityEstimator,
};
pub use config::Config;
pub use database::Database;
pub use error::{CoreError, CoreResult};
pub use hints::TransactionHints;
pub use revision_tree::RevisionTree;
pub use stats::{DatabaseStats, StatsSnapshot};
pub use transaction::{
    CommitMarker, IntermediateCommitHook, MarkerKind, TransactionIterator, TransactionOptions,
    TransactionState, TransactionStatus,
};
pub use types::{CollectionId, IndexId, OperationKind, RevisionId, SequenceNumber, TransactionId};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
