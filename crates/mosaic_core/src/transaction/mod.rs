//! Document transactions.
//!
//! A transaction moves through `Created → Running → Committed | Aborted`
//! and owns:
//! - **Collection locks**: taken in ascending collection order at begin
//! - **Access methods**: read-only, single-operation or multi-operation
//!   batches over an engine snapshot
//! - **Savepoints**: every document operation runs inside one, so a failed
//!   operation leaves no partial writes
//! - **Intermediate commits**: large multi-operation transactions commit in
//!   pieces to bound memory
//!
//! Document counts and revision trees are updated through per-collection
//! blockers, so concurrent committers never expose a partial state.

mod collection;
mod iterator;
mod marker;
mod methods;
mod savepoint;
mod state;

pub use collection::TransactionCollection;
pub use iterator::TransactionIterator;
pub use marker::{CommitMarker, MarkerKind};
pub use methods::{BatchMethods, ReadOnlyMethods, TransactionMethods};
pub use savepoint::{MemoryTracker, Savepoint, SavepointStack, ENTRY_OVERHEAD};
pub use state::{
    IntermediateCommitHook, TransactionOptions, TransactionState, TransactionStatus,
};
