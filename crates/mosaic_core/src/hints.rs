//! Transaction hints.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// A set of hints selecting transaction behavior.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TransactionHints(u32);

impl TransactionHints {
    /// No hints.
    pub const NONE: Self = Self(0);
    /// The transaction never writes.
    pub const READ_ONLY: Self = Self(1 << 0);
    /// The transaction performs exactly one document operation.
    pub const SINGLE_OPERATION: Self = Self(1 << 1);
    /// The transaction replays operations received from a leader. Automatic
    /// intermediate commits are disabled; the leader's markers drive them.
    pub const FOLLOWER: Self = Self(1 << 2);
    /// The transaction is registered with the database's managed registry.
    pub const GLOBAL_MANAGED: Self = Self(1 << 3);
    /// Index estimate updates are skipped.
    pub const NO_INDEXING: Self = Self(1 << 4);
    /// The snapshot is taken on first access instead of at begin.
    pub const DELAY_SNAPSHOT: Self = Self(1 << 5);

    const NAMES: [(Self, &'static str); 6] = [
        (Self::READ_ONLY, "read-only"),
        (Self::SINGLE_OPERATION, "single-operation"),
        (Self::FOLLOWER, "follower"),
        (Self::GLOBAL_MANAGED, "global-managed"),
        (Self::NO_INDEXING, "no-indexing"),
        (Self::DELAY_SNAPSHOT, "delay-snapshot"),
    ];

    /// Returns true if every hint in `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns a copy with the hints in `other` added.
    #[must_use]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Returns a copy with the hints in `other` removed.
    #[must_use]
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Returns true if no hint is set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for TransactionHints {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.with(rhs)
    }
}

impl BitOrAssign for TransactionHints {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = self.with(rhs);
    }
}

impl fmt::Debug for TransactionHints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(hint, _)| self.contains(*hint))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "TransactionHints({})", names.join("|"))
    }
}
