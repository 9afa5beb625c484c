//! # Mosaic Replication
//!
//! Leader/follower replicated commit protocol for MosaicDB.
//!
//! This crate provides:
//! - Replicated log operations (document changes, intermediate commits,
//!   commits and aborts) encoded as CBOR
//! - The `ReplicatedLog` seam and an in-memory log with follower
//!   acknowledgements and leader resignation
//! - Leader transactions that replicate before they commit locally
//! - A follower applier that rebuilds leader transactions idempotently
//!
//! ## Protocol
//!
//! 1. The leader applies a document write locally, then appends it to the
//!    collection's log without waiting
//! 2. On commit, the leader appends `Commit` to every participating log and
//!    waits until each entry is committed
//! 3. Only then does the leader commit locally
//! 4. Followers apply committed entries in log order
//!
//! ## Key Invariants
//!
//! - A leader never commits locally before its `Commit` is replicated
//! - A resignation during the wait is reported as an ambiguous outcome
//! - Followers apply `Commit`/`Abort` idempotently by transaction id
//! - Uncommitted log entries are never treated as committed after failover

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod follower;
mod leader;
mod log;
mod operation;

pub use config::{FollowerConfig, LogConfig};
pub use error::{ReplicationError, ReplicationResult};
pub use follower::{FollowerApplier, FollowerStats};
pub use leader::{LogDirectory, ReplicatedTransactionCollection, ReplicatedTransactionState};
pub use log::{InMemoryReplicatedLog, LogEntry, ReplicatedLog};
pub use operation::{DocumentAction, LogId, LogIndex, ReplicationKind, ReplicationOperation};
