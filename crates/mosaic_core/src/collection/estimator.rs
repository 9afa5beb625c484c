//! Index selectivity estimates kept in step with committed data.

use crate::error::{CoreError, CoreResult};
use crate::types::SequenceNumber;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// An index statistic that is updated from committed transactions.
///
/// Like document counts, updates are buffered by commit sequence and only
/// applied once the sequence is committable, so a persisted estimate never
/// reflects a commit that could still be missing below it.
pub trait IndexEstimator: Send + Sync {
    /// Buffers value hashes inserted and removed by the commit at `seq`.
    fn buffer_updates(&self, seq: SequenceNumber, inserts: Vec<u64>, removes: Vec<u64>);

    /// Buffers a truncate at `seq`.
    fn buffer_truncate(&self, seq: SequenceNumber);

    /// Applies buffered updates at or below `committable`.
    ///
    /// Returns true if anything was applied.
    fn apply_updates(&self, committable: SequenceNumber) -> bool;

    /// Returns the sequence up to which updates are applied.
    fn applied_seq(&self) -> SequenceNumber;

    /// Returns the estimated fraction of distinct values, in `(0, 1]`.
    fn selectivity(&self) -> f64;

    /// Serializes the applied state.
    ///
    /// # Errors
    ///
    /// Returns a codec error if encoding fails.
    fn serialize(&self) -> CoreResult<Vec<u8>>;
}

#[derive(Debug, Default)]
struct Pending {
    truncate: bool,
    inserts: Vec<u64>,
    removes: Vec<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Counts {
    applied_seq: u64,
    values: HashMap<u64, u64>,
    total: u64,
}

impl Counts {
    fn apply(&mut self, pending: Pending) {
        if pending.truncate {
            self.values.clear();
            self.total = 0;
        }
        for hash in pending.inserts {
            *self.values.entry(hash).or_default() += 1;
            self.total += 1;
        }
        for hash in pending.removes {
            if let Some(n) = self.values.get_mut(&hash) {
                *n -= 1;
                self.total -= 1;
                if *n == 0 {
                    self.values.remove(&hash);
                }
            }
        }
    }
}

/// Exact distinct-value estimator over value hashes.
#[derive(Debug, Default)]
pub struct SelectivityEstimator {
    pending: Mutex<BTreeMap<SequenceNumber, Pending>>,
    counts: Mutex<Counts>,
}

impl SelectivityEstimator {
    /// Creates an empty estimator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restores an estimator from [`IndexEstimator::serialize`] output.
    ///
    /// # Errors
    ///
    /// Returns a codec error if the bytes are not a valid estimate.
    pub fn from_bytes(bytes: &[u8]) -> CoreResult<Self> {
        let counts: Counts =
            ciborium::from_reader(bytes).map_err(|e| CoreError::codec(e.to_string()))?;
        Ok(Self {
            pending: Mutex::new(BTreeMap::new()),
            counts: Mutex::new(counts),
        })
    }

    /// Returns the number of applied values.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.counts.lock().total
    }
}

impl IndexEstimator for SelectivityEstimator {
    fn buffer_updates(&self, seq: SequenceNumber, inserts: Vec<u64>, removes: Vec<u64>) {
        let mut pending = self.pending.lock();
        let entry = pending.entry(seq).or_default();
        entry.inserts.extend(inserts);
        entry.removes.extend(removes);
    }

    fn buffer_truncate(&self, seq: SequenceNumber) {
        let mut pending = self.pending.lock();
        let entry = pending.entry(seq).or_default();
        entry.truncate = true;
        entry.inserts.clear();
        entry.removes.clear();
    }

    fn apply_updates(&self, committable: SequenceNumber) -> bool {
        let mut pending = self.pending.lock();
        let mut counts = self.counts.lock();
        let mut did_work = false;
        while let Some(entry) = pending.first_entry() {
            if *entry.key() > committable {
                break;
            }
            counts.apply(entry.remove());
            did_work = true;
        }
        counts.applied_seq = counts.applied_seq.max(committable.as_u64());
        did_work
    }

    fn applied_seq(&self) -> SequenceNumber {
        SequenceNumber::new(self.counts.lock().applied_seq)
    }

    fn selectivity(&self) -> f64 {
        let counts = self.counts.lock();
        if counts.total == 0 {
            return 1.0;
        }
        counts.values.len() as f64 / counts.total as f64
    }

    fn serialize(&self) -> CoreResult<Vec<u8>> {
        let counts = self.counts.lock();
        let mut bytes = Vec::new();
        ciborium::into_writer(&*counts, &mut bytes).map_err(|e| CoreError::codec(e.to_string()))?;
        Ok(bytes)
    }
}
