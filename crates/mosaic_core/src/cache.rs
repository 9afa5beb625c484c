//! Transactional document cache.
//!
//! Serves non-transactional reads of the latest committed document
//! version. A key written by a running transaction is *banished*: it is
//! evicted and cannot be re-populated until every transaction that wrote
//! it has ended, so the cache never serves a value older than a commit.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Token identifying a transaction's cache session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheToken(u64);

impl CacheToken {
    /// Returns the raw token value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// A bounded map from engine keys to committed values.
#[derive(Debug)]
pub struct DocumentCache {
    entries: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
    banished: Mutex<HashMap<Vec<u8>, usize>>,
    capacity: usize,
    next_token: AtomicU64,
    active: AtomicU64,
}

impl DocumentCache {
    /// Creates a cache holding at most `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            banished: Mutex::new(HashMap::new()),
            capacity,
            next_token: AtomicU64::new(1),
            active: AtomicU64::new(0),
        }
    }

    /// Starts a transaction's cache session.
    pub fn begin_transaction(&self) -> CacheToken {
        self.active.fetch_add(1, Ordering::AcqRel);
        CacheToken(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    /// Evicts `key` and blocks re-population until the writer ends.
    pub fn banish(&self, _token: CacheToken, key: &[u8]) {
        *self.banished.lock().entry(key.to_vec()).or_default() += 1;
        self.entries.write().remove(key);
    }

    /// Ends a session, lifting the banishment of the keys it wrote.
    ///
    /// When the transaction aborted, cached entries for those keys are
    /// dropped as well.
    pub fn end_transaction(&self, _token: CacheToken, touched: &[Vec<u8>], aborted: bool) {
        {
            let mut banished = self.banished.lock();
            for key in touched {
                if let Some(n) = banished.get_mut(key) {
                    *n -= 1;
                    if *n == 0 {
                        banished.remove(key);
                    }
                }
            }
        }
        if aborted {
            let mut entries = self.entries.write();
            for key in touched {
                entries.remove(key);
            }
        }
        self.active.fetch_sub(1, Ordering::AcqRel);
    }

    /// Returns the cached value of `key`.
    #[must_use]
    pub fn lookup(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.entries.read().get(key).cloned()
    }

    /// Caches `value` for `key` unless the key is banished.
    ///
    /// Returns true if the value was stored.
    pub fn insert(&self, key: &[u8], value: Vec<u8>) -> bool {
        self.insert_checked(key, value, || true)
    }

    /// Caches `value` for `key` if the key is not banished and `is_current`
    /// confirms that no commit happened since the value was read.
    ///
    /// `is_current` runs while banishment is frozen, so a writer cannot
    /// slip in between the check and the insert.
    pub fn insert_checked(&self, key: &[u8], value: Vec<u8>, is_current: impl FnOnce() -> bool) -> bool {
        let banished = self.banished.lock();
        if self.capacity == 0 || banished.contains_key(key) || !is_current() {
            return false;
        }
        let mut entries = self.entries.write();
        if entries.len() >= self.capacity && !entries.contains_key(key) {
            // Drop an arbitrary entry to make room.
            if let Some(victim) = entries.keys().next().cloned() {
                entries.remove(&victim);
            }
        }
        entries.insert(key.to_vec(), value);
        true
    }

    /// Drops the cached value of `key`.
    pub fn invalidate(&self, key: &[u8]) {
        self.entries.write().remove(key);
    }

    /// Returns true if `key` is banished by a running transaction.
    #[must_use]
    pub fn is_banished(&self, key: &[u8]) -> bool {
        self.banished.lock().contains_key(key)
    }

    /// Returns the number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of open sessions.
    #[must_use]
    pub fn active_transactions(&self) -> u64 {
        self.active.load(Ordering::Acquire)
    }
}

impl Default for DocumentCache {
    fn default() -> Self {
        Self::new(16 * 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn banished_keys_are_not_cached() {
        let cache = DocumentCache::new(8);
        let token = cache.begin_transaction();
        assert!(cache.insert(b"k", b"old".to_vec()));

        cache.banish(token, b"k");
        assert_eq!(cache.lookup(b"k"), None);
        assert!(!cache.insert(b"k", b"stale".to_vec()));

        cache.end_transaction(token, &[b"k".to_vec()], false);
        assert!(cache.insert(b"k", b"new".to_vec()));
        assert_eq!(cache.lookup(b"k"), Some(b"new".to_vec()));
    }

    #[test]
    fn banishment_lasts_until_every_writer_ends() {
        let cache = DocumentCache::new(8);
        let a = cache.begin_transaction();
        let b = cache.begin_transaction();
        cache.banish(a, b"k");
        cache.banish(b, b"k");

        cache.end_transaction(a, &[b"k".to_vec()], false);
        assert!(cache.is_banished(b"k"));
        cache.end_transaction(b, &[b"k".to_vec()], true);
        assert!(!cache.is_banished(b"k"));
        assert_eq!(cache.active_transactions(), 0);
    }

    #[test]
    fn capacity_is_bounded() {
        let cache = DocumentCache::new(2);
        for i in 0..5u8 {
            cache.insert(&[i], vec![i]);
        }
        assert_eq!(cache.len(), 2);
    }
}
