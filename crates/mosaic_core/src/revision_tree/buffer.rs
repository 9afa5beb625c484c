//! Sequence-tagged revision tree updates awaiting the commit watermark.

use super::RevisionTree;
use crate::error::CoreResult;
use crate::types::{RevisionId, SequenceNumber};
use std::collections::BTreeMap;

/// Tree changes made by one commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferedTreeUpdate {
    /// The commit truncated the collection before its other changes.
    pub truncate: bool,
    /// Revisions added.
    pub inserts: Vec<RevisionId>,
    /// Revisions removed.
    pub removes: Vec<RevisionId>,
}

/// Revision tree changes keyed by commit sequence.
///
/// Updates are folded into the live tree only once their sequence is at or
/// below the committable watermark, in ascending sequence order.
#[derive(Debug, Default)]
pub struct RevisionTreeBuffer {
    pending: BTreeMap<SequenceNumber, BufferedTreeUpdate>,
    applied_seq: SequenceNumber,
}

impl RevisionTreeBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty buffer for a tree already reflecting `applied_seq`.
    #[must_use]
    pub fn with_applied_seq(applied_seq: SequenceNumber) -> Self {
        Self {
            pending: BTreeMap::new(),
            applied_seq,
        }
    }

    /// Returns the sequence up to which the live tree is current.
    #[must_use]
    pub fn applied_seq(&self) -> SequenceNumber {
        self.applied_seq
    }

    /// Returns the number of buffered commits.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Buffers inserted and removed revisions of the commit at `seq`.
    pub fn buffer_updates(
        &mut self,
        seq: SequenceNumber,
        inserts: Vec<RevisionId>,
        removes: Vec<RevisionId>,
    ) {
        if inserts.is_empty() && removes.is_empty() {
            return;
        }
        let entry = self.pending.entry(seq).or_default();
        entry.inserts.extend(inserts);
        entry.removes.extend(removes);
    }

    /// Buffers a truncate at `seq`.
    ///
    /// Changes the truncating commit buffers afterwards at the same sequence
    /// are applied after the tree is cleared.
    pub fn buffer_truncate(&mut self, seq: SequenceNumber) {
        let entry = self.pending.entry(seq).or_default();
        entry.truncate = true;
        entry.inserts.clear();
        entry.removes.clear();
    }

    /// Folds every update at or below `committable` into `tree`.
    ///
    /// Returns true if anything was applied.
    ///
    /// # Errors
    ///
    /// Returns an error if a buffered removal does not match the tree. The
    /// failing update and everything above it stay buffered.
    pub fn apply(&mut self, tree: &RevisionTree, committable: SequenceNumber) -> CoreResult<bool> {
        if committable <= self.applied_seq {
            return Ok(false);
        }
        let ready: Vec<SequenceNumber> = self.pending.range(..=committable).map(|(s, _)| *s).collect();
        let start = Self::skip_truncated(ready.iter().copied(), |s| self.pending[&s].truncate);

        let mut did_work = false;
        for (position, seq) in ready.iter().enumerate() {
            let Some(update) = self.pending.remove(seq) else {
                continue;
            };
            if position < start {
                did_work = true;
                continue;
            }
            if let Err(e) = Self::apply_one(tree, &update) {
                self.pending.insert(*seq, update);
                return Err(e);
            }
            did_work = true;
            self.applied_seq = *seq;
        }
        self.applied_seq = self.applied_seq.max(committable);
        Ok(did_work)
    }

    /// Applies buffered updates in `(applied_seq, as_of]` to `tree` without
    /// consuming them.
    ///
    /// # Errors
    ///
    /// Returns an error if a buffered removal does not match the tree.
    pub fn apply_copy(&self, tree: &RevisionTree, as_of: SequenceNumber) -> CoreResult<()> {
        if as_of <= self.applied_seq {
            return Ok(());
        }
        let ready: Vec<(&SequenceNumber, &BufferedTreeUpdate)> =
            self.pending.range(..=as_of).collect();
        let start = Self::skip_truncated(ready.iter().map(|(s, _)| **s), |s| {
            self.pending[&s].truncate
        });
        ready
            .iter()
            .skip(start)
            .try_for_each(|(_, update)| Self::apply_one(tree, update))
    }

    fn skip_truncated(
        seqs: impl Iterator<Item = SequenceNumber>,
        is_truncate: impl Fn(SequenceNumber) -> bool,
    ) -> usize {
        // Everything before the last truncate is wiped by it.
        seqs.enumerate()
            .filter(|(_, s)| is_truncate(*s))
            .map(|(i, _)| i)
            .last()
            .unwrap_or(0)
    }

    fn apply_one(tree: &RevisionTree, update: &BufferedTreeUpdate) -> CoreResult<()> {
        if update.truncate {
            tree.clear();
        }
        for revision in &update.inserts {
            tree.insert(revision.as_u64());
        }
        for revision in &update.removes {
            tree.remove(revision.as_u64())?;
        }
        Ok(())
    }
}
