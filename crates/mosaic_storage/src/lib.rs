//! # Mosaic Storage
//!
//! The ordered key-value engine seam used by MosaicDB.
//!
//! The transactional core never talks to a concrete engine directly. It
//! consumes the [`KeyValueEngine`] trait, which offers exactly what an
//! LSM-style store provides:
//!
//! - point-in-time [`Snapshot`]s identified by a [`SequenceNumber`]
//! - point and multi-point reads against a snapshot
//! - ordered iteration over a key range
//! - atomic [`WriteBatch`] commits that return the post-commit sequence and
//!   fail with [`StorageError::Conflict`] on write-write conflicts
//! - log markers embedded in a batch
//!
//! ## Available Engines
//!
//! - [`InMemoryEngine`] - an ordered multi-version store for tests and
//!   ephemeral deployments
//!
//! ## Example
//!
//! ```rust
//! use mosaic_storage::{InMemoryEngine, KeyValueEngine, WriteBatch};
//!
//! let engine = InMemoryEngine::new();
//! let mut batch = WriteBatch::new();
//! batch.put(b"k".to_vec(), b"v".to_vec());
//! let seq = engine.commit(&batch).unwrap();
//!
//! let snapshot = engine.snapshot();
//! assert_eq!(snapshot.sequence(), seq);
//! assert_eq!(engine.get(&snapshot, b"k").unwrap(), Some(b"v".to_vec()));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod batch;
mod engine;
mod error;
mod memory;
mod sequence;
mod snapshot;

pub use batch::{BatchEntry, WriteBatch};
pub use engine::{EngineIterator, KeyRange, KeyValueEngine};
pub use error::{StorageError, StorageResult};
pub use memory::{InMemoryEngine, LogRecord};
pub use sequence::SequenceNumber;
pub use snapshot::{Snapshot, SnapshotRegistry};
