//! Engine access strategies of a transaction.

use super::iterator::TransactionIterator;
use super::savepoint::{MemoryTracker, Savepoint, SavepointStack, ENTRY_OVERHEAD};
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::types::SequenceNumber;
use mosaic_storage::{KeyRange, KeyValueEngine, Snapshot, WriteBatch};
use std::fmt;
use std::ops::Bound;
use std::sync::Arc;

/// Snapshot-only access for read-only transactions.
pub struct ReadOnlyMethods {
    engine: Arc<dyn KeyValueEngine>,
    snapshot: Option<Snapshot>,
}

/// Batch-backed access for writing transactions.
pub struct BatchMethods {
    engine: Arc<dyn KeyValueEngine>,
    snapshot: Option<Snapshot>,
    batch: WriteBatch,
    savepoints: SavepointStack,
    memory: MemoryTracker,
    pending_operations: usize,
    pending_bytes: usize,
    generation: u64,
    intermediate_commit_count: usize,
    intermediate_commit_size: usize,
}

impl BatchMethods {
    fn new(engine: Arc<dyn KeyValueEngine>, config: &Config) -> Self {
        Self {
            engine,
            snapshot: None,
            batch: WriteBatch::new(),
            savepoints: SavepointStack::new(),
            memory: MemoryTracker::new(config.max_transaction_size),
            pending_operations: 0,
            pending_bytes: 0,
            generation: 0,
            intermediate_commit_count: config.intermediate_commit_count,
            intermediate_commit_size: config.intermediate_commit_size,
        }
    }

    fn ensure_snapshot(&mut self) -> SequenceNumber {
        if let Some(snapshot) = &self.snapshot {
            return snapshot.sequence();
        }
        let snapshot = self.engine.snapshot();
        let seq = snapshot.sequence();
        self.batch.set_read_sequence(seq);
        self.snapshot = Some(snapshot);
        seq
    }

    fn stage(&mut self, key: Vec<u8>, value: Option<Vec<u8>>) -> CoreResult<()> {
        self.ensure_snapshot();
        let bytes = key.len() + value.as_ref().map_or(0, Vec::len);
        self.memory.charge(bytes + ENTRY_OVERHEAD)?;
        match value {
            Some(value) => self.batch.put(key, value),
            None => self.batch.delete(key),
        }
        self.pending_operations += 1;
        self.pending_bytes += bytes;
        Ok(())
    }

    fn reset_after_commit(&mut self) {
        self.batch.clear();
        self.savepoints.clear();
        self.memory.reset_to(0);
        self.pending_operations = 0;
        self.pending_bytes = 0;
    }
}

/// How a transaction reads from and writes to the engine.
///
/// The variant is chosen once when the transaction begins and never
/// changes.
pub enum TransactionMethods {
    /// Reads only; every write fails with `ReadOnlyViolation`.
    ReadOnly(ReadOnlyMethods),
    /// One write batch, never committed early.
    SingleOperation(BatchMethods),
    /// One write batch per intermediate commit.
    MultiOperation {
        /// The batch state.
        methods: BatchMethods,
        /// Whether intermediate commits may be triggered automatically.
        intermediate_commits: bool,
    },
}

impl TransactionMethods {
    /// Creates read-only methods.
    #[must_use]
    pub fn read_only(engine: Arc<dyn KeyValueEngine>) -> Self {
        Self::ReadOnly(ReadOnlyMethods {
            engine,
            snapshot: None,
        })
    }

    /// Creates methods for a transaction with exactly one operation.
    #[must_use]
    pub fn single_operation(engine: Arc<dyn KeyValueEngine>, config: &Config) -> Self {
        Self::SingleOperation(BatchMethods::new(engine, config))
    }

    /// Creates methods for a multi-operation transaction.
    #[must_use]
    pub fn multi_operation(
        engine: Arc<dyn KeyValueEngine>,
        config: &Config,
        intermediate_commits: bool,
    ) -> Self {
        Self::MultiOperation {
            methods: BatchMethods::new(engine, config),
            intermediate_commits,
        }
    }

    fn batch_methods(&self) -> Option<&BatchMethods> {
        match self {
            Self::ReadOnly(_) => None,
            Self::SingleOperation(methods) | Self::MultiOperation { methods, .. } => Some(methods),
        }
    }

    fn batch_methods_mut(&mut self) -> CoreResult<&mut BatchMethods> {
        match self {
            Self::ReadOnly(_) => Err(CoreError::ReadOnlyViolation),
            Self::SingleOperation(methods) | Self::MultiOperation { methods, .. } => Ok(methods),
        }
    }

    fn engine(&self) -> &Arc<dyn KeyValueEngine> {
        match self {
            Self::ReadOnly(m) => &m.engine,
            Self::SingleOperation(m) | Self::MultiOperation { methods: m, .. } => &m.engine,
        }
    }

    /// Starts the methods, acquiring the snapshot unless it is deferred.
    pub fn begin(&mut self, delay_snapshot: bool) {
        if !delay_snapshot {
            self.ensure_snapshot();
        }
    }

    /// Acquires the snapshot if not held yet and returns its sequence.
    pub fn ensure_snapshot(&mut self) -> SequenceNumber {
        match self {
            Self::ReadOnly(m) => m
                .snapshot
                .get_or_insert_with(|| m.engine.snapshot())
                .sequence(),
            Self::SingleOperation(m) | Self::MultiOperation { methods: m, .. } => m.ensure_snapshot(),
        }
    }

    /// Returns the snapshot sequence, if a snapshot is held.
    #[must_use]
    pub fn snapshot_sequence(&self) -> Option<SequenceNumber> {
        match self {
            Self::ReadOnly(m) => m.snapshot.as_ref().map(Snapshot::sequence),
            Self::SingleOperation(m) | Self::MultiOperation { methods: m, .. } => {
                m.snapshot.as_ref().map(Snapshot::sequence)
            }
        }
    }

    fn snapshot(&mut self) -> Snapshot {
        self.ensure_snapshot();
        let held = match &*self {
            Self::ReadOnly(m) => m.snapshot.as_ref(),
            Self::SingleOperation(m) | Self::MultiOperation { methods: m, .. } => m.snapshot.as_ref(),
        };
        match held {
            Some(snapshot) => snapshot.clone(),
            None => self.engine().snapshot(),
        }
    }

    /// Reads `key`, consulting staged writes first if `read_own_writes`.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine read fails.
    pub fn get(&mut self, key: &[u8], read_own_writes: bool) -> CoreResult<Option<Vec<u8>>> {
        if read_own_writes {
            if let Some(staged) = self.batch_methods().and_then(|m| m.batch.lookup(key)) {
                return Ok(staged.map(<[u8]>::to_vec));
            }
        }
        let snapshot = self.snapshot();
        Ok(self.engine().get(&snapshot, key)?)
    }

    /// Reads several keys at once.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine read fails.
    pub fn multi_get(
        &mut self,
        keys: &[&[u8]],
        read_own_writes: bool,
    ) -> CoreResult<Vec<Option<Vec<u8>>>> {
        let snapshot = self.snapshot();
        let mut values = self.engine().multi_get(&snapshot, keys)?;
        if read_own_writes {
            if let Some(methods) = self.batch_methods() {
                for (value, key) in values.iter_mut().zip(keys) {
                    if let Some(staged) = methods.batch.lookup(key) {
                        *value = staged.map(<[u8]>::to_vec);
                    }
                }
            }
        }
        Ok(values)
    }

    /// Stages a put.
    ///
    /// # Errors
    ///
    /// Returns `ReadOnlyViolation` for read-only methods, or
    /// `ResourceExhausted` if the write does not fit the memory limit. A
    /// rejected write is not staged.
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) -> CoreResult<()> {
        self.batch_methods_mut()?.stage(key, Some(value))
    }

    /// Stages a delete.
    ///
    /// # Errors
    ///
    /// Same as [`TransactionMethods::put`].
    pub fn delete(&mut self, key: Vec<u8>) -> CoreResult<()> {
        self.batch_methods_mut()?.stage(key, None)
    }

    /// Embeds a log marker in the batch.
    ///
    /// # Errors
    ///
    /// Returns `ReadOnlyViolation` for read-only methods.
    pub fn put_log_data(&mut self, data: Vec<u8>) -> CoreResult<()> {
        self.batch_methods_mut()?.batch.put_log_data(data);
        Ok(())
    }

    /// Marks the current batch state and returns the savepoint depth.
    ///
    /// Read-only methods have nothing to undo and return 0.
    pub fn set_savepoint(&mut self) -> usize {
        match self {
            Self::ReadOnly(_) => 0,
            Self::SingleOperation(m) | Self::MultiOperation { methods: m, .. } => {
                let savepoint = Savepoint {
                    batch_len: m.batch.len(),
                    memory_used: m.memory.used(),
                    pending_operations: m.pending_operations,
                    pending_bytes: m.pending_bytes,
                };
                m.savepoints.push(savepoint)
            }
        }
    }

    /// Undoes everything staged since the innermost savepoint and drops it.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if no savepoint is active.
    pub fn rollback_to_savepoint(&mut self) -> CoreResult<()> {
        let Ok(m) = self.batch_methods_mut() else {
            return Ok(());
        };
        let savepoint = m
            .savepoints
            .pop()
            .ok_or_else(|| CoreError::invalid_operation("no savepoint to roll back to"))?;
        m.batch.truncate(savepoint.batch_len);
        m.memory.reset_to(savepoint.memory_used);
        m.pending_operations = savepoint.pending_operations;
        m.pending_bytes = savepoint.pending_bytes;
        Ok(())
    }

    /// Drops the innermost savepoint, keeping its writes.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if no savepoint is active.
    pub fn pop_savepoint(&mut self) -> CoreResult<()> {
        let Ok(m) = self.batch_methods_mut() else {
            return Ok(());
        };
        m.savepoints
            .pop()
            .map(|_| ())
            .ok_or_else(|| CoreError::invalid_operation("no savepoint to pop"))
    }

    /// Returns the number of active savepoints.
    #[must_use]
    pub fn savepoint_depth(&self) -> usize {
        self.batch_methods().map_or(0, |m| m.savepoints.len())
    }

    /// Returns true if a multi-operation transaction reached a threshold
    /// and no savepoint is active.
    #[must_use]
    pub fn is_intermediate_commit_needed(&self) -> bool {
        match self {
            Self::MultiOperation {
                methods,
                intermediate_commits: true,
            } => {
                methods.savepoints.is_empty()
                    && (methods.pending_operations >= methods.intermediate_commit_count
                        || methods.pending_bytes >= methods.intermediate_commit_size)
            }
            _ => false,
        }
    }

    /// Returns true if the batch holds staged writes.
    #[must_use]
    pub fn has_pending_writes(&self) -> bool {
        self.batch_methods()
            .is_some_and(|m| m.batch.operation_count() > 0)
    }

    /// Returns the number of writes staged since the last commit.
    #[must_use]
    pub fn pending_operations(&self) -> usize {
        self.batch_methods().map_or(0, |m| m.pending_operations)
    }

    /// Returns the bytes charged to the memory tracker.
    #[must_use]
    pub fn memory_used(&self) -> usize {
        self.batch_methods().map_or(0, |m| m.memory.used())
    }

    /// Returns the number of snapshot rotations so far.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.batch_methods().map_or(0, |m| m.generation)
    }

    /// Returns true if intermediate commits are possible at all.
    #[must_use]
    pub fn supports_intermediate_commits(&self) -> bool {
        matches!(self, Self::MultiOperation { .. })
    }

    /// Disables engine conflict checks for the batch.
    pub fn set_exclusive(&mut self, exclusive: bool) {
        if let Ok(m) = self.batch_methods_mut() {
            m.batch.set_exclusive(exclusive);
        }
    }

    /// Commits the batch and returns its sequence.
    ///
    /// An intermediate commit starts a fresh batch on a fresh snapshot and
    /// bumps the generation; a final commit releases the snapshot. On
    /// error the batch is left untouched.
    ///
    /// # Errors
    ///
    /// Returns the engine's error, or `ReadOnlyViolation` for read-only
    /// methods.
    pub fn commit_batch(&mut self, intermediate: bool) -> CoreResult<SequenceNumber> {
        let m = self.batch_methods_mut()?;
        let seq = m.engine.commit(&m.batch)?;
        m.reset_after_commit();
        m.snapshot = None;
        if intermediate {
            m.generation += 1;
            m.ensure_snapshot();
        }
        Ok(seq)
    }

    /// Drops staged writes and releases the snapshot.
    pub fn abort(&mut self) {
        match self {
            Self::ReadOnly(m) => m.snapshot = None,
            Self::SingleOperation(m) | Self::MultiOperation { methods: m, .. } => {
                m.reset_after_commit();
                m.snapshot = None;
            }
        }
    }

    /// Creates a cursor over `range`.
    #[must_use]
    pub fn iterator(&self, range: KeyRange, read_own_writes: bool) -> TransactionIterator {
        TransactionIterator::new(range, read_own_writes, self.generation())
    }

    /// Advances `iter`, returning the next live key and value.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cursor fails.
    pub fn next(&mut self, iter: &mut TransactionIterator) -> CoreResult<Option<(Vec<u8>, Vec<u8>)>> {
        let generation = self.generation();
        if iter.generation != generation {
            iter.invalidate(generation);
        }
        if iter.inner.is_none() {
            let snapshot = self.snapshot();
            let mut inner = self.engine().iterator(&snapshot, iter.range.clone())?;
            if let Some(last) = &iter.last_key {
                inner.seek(last);
            }
            iter.inner = Some(inner);
        }

        loop {
            let engine_entry = match iter.peeked.take() {
                Some(entry) => Some(entry),
                None => Self::next_engine_entry(iter)?,
            };

            let overlay = if iter.read_own_writes {
                self.batch_methods().and_then(|m| {
                    let lower = match &iter.last_key {
                        Some(last) => Bound::Excluded(last.as_slice()),
                        None => Bound::Included(iter.range.start.as_slice()),
                    };
                    m.batch
                        .next_in_range(lower, &iter.range.end)
                        .map(|(k, v)| (k.to_vec(), v.map(<[u8]>::to_vec)))
                })
            } else {
                None
            };

            match (overlay, engine_entry) {
                (Some((key, value)), engine_entry)
                    if engine_entry.as_ref().map_or(true, |(k, _)| key <= *k) =>
                {
                    if let Some(entry) = engine_entry {
                        if entry.0 != key {
                            iter.peeked = Some(entry);
                        }
                    }
                    iter.last_key = Some(key.clone());
                    match value {
                        Some(value) => return Ok(Some((key, value))),
                        None => continue,
                    }
                }
                (_, Some((key, value))) => {
                    iter.last_key = Some(key.clone());
                    return Ok(Some((key, value)));
                }
                (_, None) => return Ok(None),
            }
        }
    }

    fn next_engine_entry(iter: &mut TransactionIterator) -> CoreResult<Option<(Vec<u8>, Vec<u8>)>> {
        let Some(inner) = iter.inner.as_mut() else {
            return Ok(None);
        };
        loop {
            match inner.next_entry()? {
                Some((key, value)) => {
                    if iter.last_key.as_ref().is_some_and(|last| key <= *last) {
                        continue;
                    }
                    return Ok(Some((key, value)));
                }
                None => return Ok(None),
            }
        }
    }
}

impl fmt::Debug for TransactionMethods {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let variant = match self {
            Self::ReadOnly(_) => "ReadOnly",
            Self::SingleOperation(_) => "SingleOperation",
            Self::MultiOperation { .. } => "MultiOperation",
        };
        f.debug_struct("TransactionMethods")
            .field("variant", &variant)
            .field("snapshot", &self.snapshot_sequence())
            .field("pending_operations", &self.pending_operations())
            .field("savepoints", &self.savepoint_depth())
            .finish()
    }
}
