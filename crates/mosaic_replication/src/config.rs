//! Configuration for replicated logs and followers.

use std::time::Duration;

/// Configuration for an in-memory replicated log.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Follower acknowledgements an entry needs before it is committed.
    /// Zero commits entries as soon as the leader appends them.
    pub write_concern: usize,
}

impl LogConfig {
    /// Creates a configuration requiring `write_concern` acknowledgements.
    pub fn new(write_concern: usize) -> Self {
        Self { write_concern }
    }

    /// Sets the write concern.
    pub fn with_write_concern(mut self, write_concern: usize) -> Self {
        self.write_concern = write_concern;
        self
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::new(1)
    }
}

/// Configuration for a follower applying replicated transactions.
#[derive(Debug, Clone)]
pub struct FollowerConfig {
    /// Lock timeout for follower transactions.
    pub lock_timeout: Duration,
    /// Skip index estimate tracking in follower transactions.
    pub no_indexing: bool,
}

impl FollowerConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            lock_timeout: Duration::from_secs(60),
            no_indexing: false,
        }
    }

    /// Sets the lock timeout.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Disables index estimate tracking.
    pub fn with_no_indexing(mut self, no_indexing: bool) -> Self {
        self.no_indexing = no_indexing;
        self
    }
}

impl Default for FollowerConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_config_builder() {
        let config = LogConfig::default().with_write_concern(2);
        assert_eq!(config.write_concern, 2);
    }

    #[test]
    fn follower_config_builder() {
        let config = FollowerConfig::new()
            .with_lock_timeout(Duration::from_millis(250))
            .with_no_indexing(true);
        assert_eq!(config.lock_timeout, Duration::from_millis(250));
        assert!(config.no_indexing);
    }
}
