//! # storage
//!
//! why: describe the durability contract the engine needs without fixing a disk format
//! relations: implemented by memory.rs (tests) and the rachis-storage crate (files)
//! what: LogStore and SnapshotStore traits, Vote and Snapshot records

use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::log::LogEntry;
use crate::topology::Topology;
use crate::{LogIndex, NodeId, Term};

/// The persisted vote record. At most one candidate per term.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub term: Term,
    pub voted_for: Option<NodeId>,
}

/// A state machine image covering every entry up to `last_included_index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    /// Membership committed as of `last_included_index`.
    pub topology: Topology,
    pub data: Vec<u8>,
}

/// Durable storage for the term, the vote and the log entries.
///
/// Every method that returns `Ok` must have made its change durable.
pub trait LogStore: Send {
    /// persist the current term and vote
    fn save_vote(&mut self, vote: &Vote) -> Result<(), StorageError>;

    /// load the persisted vote, or the default for a fresh node
    fn load_vote(&self) -> Result<Vote, StorageError>;

    /// append entries; the first must directly follow the current last index
    fn append(&mut self, entries: &[LogEntry]) -> Result<(), StorageError>;

    /// up to `max` entries starting at `index`, in order
    fn entries_from(&self, index: LogIndex, max: u64) -> Result<Vec<LogEntry>, StorageError>;

    fn entry(&self, index: LogIndex) -> Result<Option<LogEntry>, StorageError>;

    /// remove every entry with index >= `index` (conflict resolution)
    fn truncate_from(&mut self, index: LogIndex) -> Result<(), StorageError>;

    /// remove every entry with index <= `index` and remember `(index, term)`
    fn purge_to(&mut self, index: LogIndex, term: Term) -> Result<(), StorageError>;

    /// last stored index and term, or the purge point when no entries remain
    fn last_index_and_term(&self) -> Result<(LogIndex, Term), StorageError>;

    /// the last purged `(index, term)`, `(0, 0)` if nothing was purged
    fn purged(&self) -> (LogIndex, Term);

    fn first_index(&self) -> LogIndex {
        self.purged().0 + 1
    }
}

/// Durable storage for the latest state machine snapshot.
pub trait SnapshotStore: Send {
    /// atomically replace the stored snapshot
    fn save(&mut self, snapshot: &Snapshot) -> Result<(), StorageError>;

    fn load(&self) -> Result<Option<Snapshot>, StorageError>;
}

/// Check that `entries` extend a log ending at `last_index` without gaps.
///
/// Shared by every LogStore implementation.
pub fn check_contiguous(last_index: LogIndex, entries: &[LogEntry]) -> Result<(), StorageError> {
    let mut expected = last_index + 1;
    for entry in entries {
        if entry.index != expected {
            return Err(StorageError::NonContiguous { expected, got: entry.index });
        }
        expected += 1;
    }
    Ok(())
}
