//! Per-collection reader/writer lock with explicit release.

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::time::{Duration, Instant};

/// Access a transaction requests on a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AccessMode {
    /// Shared read access.
    Read,
    /// Shared write access. Concurrent writers are serialized by the engine's
    /// conflict detection.
    Write,
    /// Sole access to the collection.
    Exclusive,
}

impl AccessMode {
    /// Returns true if the mode allows writes.
    #[must_use]
    pub const fn is_write(self) -> bool {
        matches!(self, Self::Write | Self::Exclusive)
    }

    /// Returns true if the lock is held exclusively.
    #[must_use]
    pub const fn is_exclusive(self) -> bool {
        matches!(self, Self::Exclusive)
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Exclusive => "exclusive",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Default)]
struct LockState {
    shared: usize,
    exclusive: bool,
    waiting_exclusive: usize,
}

/// A reader/writer lock whose holders release it explicitly.
///
/// Unlike a guard-based lock, acquisition and release may happen in
/// different calls, which is what a transaction spanning many operations
/// needs. Waiting exclusive requests block new shared acquisitions so
/// writers are not starved.
#[derive(Debug, Default)]
pub struct CollectionLock {
    state: Mutex<LockState>,
    released: Condvar,
}

impl CollectionLock {
    /// Creates an unlocked lock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock in `mode`, waiting at most `timeout`.
    ///
    /// Returns false if the lock could not be acquired in time.
    pub fn lock(&self, mode: AccessMode, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();

        if mode.is_exclusive() {
            state.waiting_exclusive += 1;
            while state.exclusive || state.shared > 0 {
                if self.released.wait_until(&mut state, deadline).timed_out()
                    && (state.exclusive || state.shared > 0)
                {
                    state.waiting_exclusive -= 1;
                    self.released.notify_all();
                    return false;
                }
            }
            state.waiting_exclusive -= 1;
            state.exclusive = true;
        } else {
            while state.exclusive || state.waiting_exclusive > 0 {
                if self.released.wait_until(&mut state, deadline).timed_out()
                    && (state.exclusive || state.waiting_exclusive > 0)
                {
                    return false;
                }
            }
            state.shared += 1;
        }
        true
    }

    /// Releases a lock previously acquired in `mode`.
    pub fn unlock(&self, mode: AccessMode) {
        let mut state = self.state.lock();
        if mode.is_exclusive() {
            debug_assert!(state.exclusive, "unlock of an unheld exclusive lock");
            state.exclusive = false;
        } else {
            debug_assert!(state.shared > 0, "unlock of an unheld shared lock");
            state.shared = state.shared.saturating_sub(1);
        }
        drop(state);
        self.released.notify_all();
    }

    /// Returns true if any holder has the lock.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        let state = self.state.lock();
        state.exclusive || state.shared > 0
    }
}
