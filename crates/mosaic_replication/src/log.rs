//! Replicated log seam and an in-memory implementation.

use crate::config::LogConfig;
use crate::error::{ReplicationError, ReplicationResult};
use crate::operation::{LogId, LogIndex, ReplicationOperation};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fmt;

/// An entry of a replicated log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Position in the log.
    pub index: LogIndex,
    /// Encoded [`ReplicationOperation`].
    pub payload: Vec<u8>,
}

impl LogEntry {
    /// Decodes the operation.
    ///
    /// # Errors
    ///
    /// Returns a codec error if the payload is corrupt.
    pub fn operation(&self) -> ReplicationResult<ReplicationOperation> {
        ReplicationOperation::decode(&self.payload)
    }
}

/// A replicated log as seen by its leader and its followers.
///
/// The leader appends operations and waits for them to be committed, which
/// happens once enough followers acknowledged them. Followers read and
/// apply committed entries only.
pub trait ReplicatedLog: Send + Sync {
    /// Returns the log id.
    fn id(&self) -> LogId;

    /// Appends an operation without waiting for it to commit.
    ///
    /// # Errors
    ///
    /// Returns `LeaderResigned` once the leader resigned.
    fn append(&self, operation: &ReplicationOperation) -> ReplicationResult<LogIndex>;

    /// Blocks until the entry at `index` is committed.
    ///
    /// # Errors
    ///
    /// Returns `LeaderResigned` if the leader resigns first.
    fn wait_for_commit(&self, index: LogIndex) -> ReplicationResult<()>;

    /// Returns the highest committed index.
    fn commit_index(&self) -> LogIndex;

    /// Returns the committed entries after `after`, in order.
    fn committed_entries(&self, after: LogIndex) -> Vec<LogEntry>;

    /// Steps down as leader. Waiters and later appends fail with
    /// `LeaderResigned`.
    fn resign(&self);
}

#[derive(Debug, Default)]
struct LogState {
    entries: Vec<LogEntry>,
    acknowledged: HashMap<String, LogIndex>,
    commit_index: LogIndex,
    resigned: bool,
}

impl LogState {
    fn last_index(&self) -> LogIndex {
        self.entries.last().map_or(LogIndex::ZERO, |e| e.index)
    }
}

/// A replicated log held in memory.
///
/// Participants acknowledge entries explicitly with
/// [`InMemoryReplicatedLog::acknowledge`]. An entry commits once
/// `write_concern` distinct participants acknowledged it.
pub struct InMemoryReplicatedLog {
    id: LogId,
    config: LogConfig,
    state: Mutex<LogState>,
    changed: Condvar,
}

impl InMemoryReplicatedLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new(id: LogId, config: LogConfig) -> Self {
        Self {
            id,
            config,
            state: Mutex::new(LogState::default()),
            changed: Condvar::new(),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// Returns the index of the last entry, committed or not.
    #[must_use]
    pub fn last_index(&self) -> LogIndex {
        self.state.lock().last_index()
    }

    /// Returns every entry after `after`, including uncommitted ones.
    #[must_use]
    pub fn entries_since(&self, after: LogIndex) -> Vec<LogEntry> {
        let state = self.state.lock();
        state
            .entries
            .iter()
            .filter(|e| e.index > after)
            .cloned()
            .collect()
    }

    /// Records that `participant` durably holds every entry up to `index`.
    ///
    /// Returns the commit index afterwards.
    pub fn acknowledge(&self, participant: &str, index: LogIndex) -> LogIndex {
        let mut state = self.state.lock();
        let index = index.min(state.last_index());
        let acked = state
            .acknowledged
            .entry(participant.to_string())
            .or_default();
        *acked = (*acked).max(index);

        let candidate = if self.config.write_concern == 0 {
            state.last_index()
        } else {
            let mut acks: Vec<LogIndex> = state.acknowledged.values().copied().collect();
            acks.sort_unstable_by(|a, b| b.cmp(a));
            acks.get(self.config.write_concern - 1)
                .copied()
                .unwrap_or(LogIndex::ZERO)
        };
        if candidate > state.commit_index && !state.resigned {
            state.commit_index = candidate;
            tracing::trace!(log = %self.id, commit_index = %candidate, "commit index advanced");
            self.changed.notify_all();
        }
        state.commit_index
    }

    /// Returns true once the leader resigned.
    #[must_use]
    pub fn is_resigned(&self) -> bool {
        self.state.lock().resigned
    }
}

impl ReplicatedLog for InMemoryReplicatedLog {
    fn id(&self) -> LogId {
        self.id
    }

    fn append(&self, operation: &ReplicationOperation) -> ReplicationResult<LogIndex> {
        let payload = operation.encode()?;
        let mut state = self.state.lock();
        if state.resigned {
            return Err(ReplicationError::LeaderResigned { log: self.id });
        }
        let index = LogIndex::new(state.last_index().as_u64() + 1);
        state.entries.push(LogEntry { index, payload });
        if self.config.write_concern == 0 {
            state.commit_index = index;
            self.changed.notify_all();
        }
        Ok(index)
    }

    fn wait_for_commit(&self, index: LogIndex) -> ReplicationResult<()> {
        let mut state = self.state.lock();
        loop {
            if state.commit_index >= index {
                return Ok(());
            }
            if state.resigned {
                return Err(ReplicationError::LeaderResigned { log: self.id });
            }
            self.changed.wait(&mut state);
        }
    }

    fn commit_index(&self) -> LogIndex {
        self.state.lock().commit_index
    }

    fn committed_entries(&self, after: LogIndex) -> Vec<LogEntry> {
        let state = self.state.lock();
        state
            .entries
            .iter()
            .filter(|e| e.index > after && e.index <= state.commit_index)
            .cloned()
            .collect()
    }

    fn resign(&self) {
        let mut state = self.state.lock();
        if !state.resigned {
            state.resigned = true;
            tracing::warn!(
                log = %self.id,
                commit_index = %state.commit_index,
                last_index = %state.last_index(),
                "leader resigned"
            );
            self.changed.notify_all();
        }
    }
}

impl fmt::Debug for InMemoryReplicatedLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InMemoryReplicatedLog")
            .field("id", &self.id)
            .field("write_concern", &self.config.write_concern)
            .field("entries", &state.entries.len())
            .field("commit_index", &state.commit_index)
            .field("resigned", &state.resigned)
            .finish()
    }
}
