//! Database configuration.

use std::time::Duration;

/// Configuration for the transactional core.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum bytes a single write batch may hold before the transaction
    /// fails with `ResourceExhausted`.
    pub max_transaction_size: usize,

    /// Pending operations after which a multi-operation transaction
    /// performs an intermediate commit.
    pub intermediate_commit_count: usize,

    /// Pending batch bytes after which a multi-operation transaction
    /// performs an intermediate commit.
    pub intermediate_commit_size: usize,

    /// How long to wait for a collection lock.
    pub lock_timeout: Duration,

    /// Upgrade WRITE locks to EXCLUSIVE so that all-exclusive transactions
    /// can skip the engine's key-level conflict checks.
    pub exclusive_writes: bool,

    /// Depth of new revision trees (levels below the root).
    pub revision_tree_depth: usize,

    /// Branching factor of new revision trees, as a power of two.
    pub revision_tree_branching_bits: u32,

    /// Metadata sync persists an unchanged collection once every this many
    /// calls on average (0 disables sampling).
    pub metadata_sample_rate: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_transaction_size: 512 * 1024 * 1024,     // 512 MB
            intermediate_commit_count: 1_000_000,
            intermediate_commit_size: 128 * 1024 * 1024, // 128 MB
            lock_timeout: Duration::from_secs(600),
            exclusive_writes: false,
            revision_tree_depth: 6,
            revision_tree_branching_bits: 3,
            metadata_sample_rate: 16,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the transaction size limit in bytes.
    #[must_use]
    pub const fn max_transaction_size(mut self, bytes: usize) -> Self {
        self.max_transaction_size = bytes;
        self
    }

    /// Sets the operation-count threshold for intermediate commits.
    #[must_use]
    pub const fn intermediate_commit_count(mut self, count: usize) -> Self {
        self.intermediate_commit_count = count;
        self
    }

    /// Sets the byte-size threshold for intermediate commits.
    #[must_use]
    pub const fn intermediate_commit_size(mut self, bytes: usize) -> Self {
        self.intermediate_commit_size = bytes;
        self
    }

    /// Sets the collection lock timeout.
    #[must_use]
    pub const fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Sets whether WRITE locks are upgraded to EXCLUSIVE.
    #[must_use]
    pub const fn exclusive_writes(mut self, value: bool) -> Self {
        self.exclusive_writes = value;
        self
    }

    /// Sets the depth and branching bits of new revision trees.
    #[must_use]
    pub const fn revision_tree_shape(mut self, depth: usize, branching_bits: u32) -> Self {
        self.revision_tree_depth = depth;
        self.revision_tree_branching_bits = branching_bits;
        self
    }

    /// Sets the metadata persistence sample rate.
    #[must_use]
    pub const fn metadata_sample_rate(mut self, rate: u32) -> Self {
        self.metadata_sample_rate = rate;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.lock_timeout, Duration::from_secs(600));
        assert!(!config.exclusive_writes);
        assert_eq!(config.revision_tree_branching_bits, 3);
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .intermediate_commit_count(2)
            .max_transaction_size(1024)
            .exclusive_writes(true);

        assert_eq!(config.intermediate_commit_count, 2);
        assert_eq!(config.max_transaction_size, 1024);
        assert!(config.exclusive_writes);
    }
}
