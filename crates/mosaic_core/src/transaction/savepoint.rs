//! Savepoints and memory accounting for write batches.

use crate::error::{CoreError, CoreResult};

/// Bytes charged per staged entry on top of its key and value.
pub const ENTRY_OVERHEAD: usize = 32;

/// Tracks the memory a transaction's batch holds against a limit.
#[derive(Debug, Clone)]
pub struct MemoryTracker {
    used: usize,
    limit: usize,
}

impl MemoryTracker {
    /// Creates a tracker with nothing charged.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self { used: 0, limit }
    }

    /// Charges `bytes`, failing without charging if the limit would be exceeded.
    ///
    /// # Errors
    ///
    /// Returns `ResourceExhausted` if the charge does not fit.
    pub fn charge(&mut self, bytes: usize) -> CoreResult<()> {
        let used = self.used.saturating_add(bytes);
        if used > self.limit {
            return Err(CoreError::ResourceExhausted {
                used,
                limit: self.limit,
            });
        }
        self.used = used;
        Ok(())
    }

    /// Returns the bytes charged.
    #[must_use]
    pub fn used(&self) -> usize {
        self.used
    }

    /// Returns the limit.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Resets the charge to `used`.
    pub fn reset_to(&mut self, used: usize) {
        self.used = used;
    }
}

/// State of a batch captured by `set_savepoint`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Savepoint {
    /// Batch entries at the savepoint.
    pub batch_len: usize,
    /// Memory charged at the savepoint.
    pub memory_used: usize,
    /// Pending operations at the savepoint.
    pub pending_operations: usize,
    /// Pending bytes at the savepoint.
    pub pending_bytes: usize,
}

/// A stack of nested savepoints.
#[derive(Debug, Default)]
pub struct SavepointStack {
    stack: Vec<Savepoint>,
}

impl SavepointStack {
    /// Creates an empty stack.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes a savepoint and returns the new depth.
    pub fn push(&mut self, savepoint: Savepoint) -> usize {
        self.stack.push(savepoint);
        self.stack.len()
    }

    /// Pops the innermost savepoint.
    pub fn pop(&mut self) -> Option<Savepoint> {
        self.stack.pop()
    }

    /// Returns the number of active savepoints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stack.len()
    }

    /// Returns true if no savepoint is active.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    /// Drops every savepoint.
    pub fn clear(&mut self) {
        self.stack.clear();
    }
}
