//! # log
//!
//! why: manage the append-only log of commands that raft replicates
//! relations: used by node.rs for replication, persisted through a LogStore (storage.rs)
//! what: LogEntry and EntryKind, RaftLog with cached watermarks and consistency checks

use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::storage::LogStore;
use crate::topology::Topology;
use crate::{LogIndex, Term};

/// What a log entry carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// An opaque client command for the state machine.
    Command,
    /// A json-encoded `Topology` replacing the cluster membership.
    Topology,
    /// Appended by every new leader to commit entries from earlier terms.
    Noop,
}

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: Term,
    /// The index of this entry in the log (1-indexed)
    pub index: LogIndex,
    pub kind: EntryKind,
    pub payload: Vec<u8>,
}

impl LogEntry {
    /// Create a new command entry
    pub fn new(term: Term, index: LogIndex, payload: Vec<u8>) -> Self {
        Self { term, index, kind: EntryKind::Command, payload }
    }

    pub fn noop(term: Term, index: LogIndex) -> Self {
        Self { term, index, kind: EntryKind::Noop, payload: Vec::new() }
    }

    pub fn topology(term: Term, index: LogIndex, topology: &Topology) -> Result<Self, StorageError> {
        Ok(Self {
            term,
            index,
            kind: EntryKind::Topology,
            payload: serde_json::to_vec(topology)?,
        })
    }

    /// Decode the topology carried by a `Topology` entry.
    pub fn as_topology(&self) -> Result<Option<Topology>, StorageError> {
        match self.kind {
            EntryKind::Topology => Ok(Some(serde_json::from_slice(&self.payload)?)),
            _ => Ok(None),
        }
    }
}

/// Result of reconciling a leader's entries with a follower log.
#[derive(Debug, Default)]
pub struct Reconciled {
    /// Index the log was truncated from, if a conflict was found.
    pub truncated: Option<LogIndex>,
    /// Entries still to be appended, contiguous with the log.
    pub pending: Vec<LogEntry>,
}

/// The engine's view of its log.
///
/// Wraps the durable store and caches the last index/term so the hot paths
/// (vote comparisons, heartbeats) never touch storage.
pub struct RaftLog {
    store: Box<dyn LogStore>,
    last_index: LogIndex,
    last_term: Term,
}

impl RaftLog {
    pub fn new(store: Box<dyn LogStore>) -> Result<Self, StorageError> {
        let (last_index, last_term) = store.last_index_and_term()?;
        Ok(Self { store, last_index, last_term })
    }

    pub fn last_index(&self) -> LogIndex {
        self.last_index
    }

    pub fn last_term(&self) -> Term {
        self.last_term
    }

    /// Index of the oldest entry still physically stored.
    pub fn first_index(&self) -> LogIndex {
        self.store.first_index()
    }

    /// The compaction point: entries up to and including it are gone.
    pub fn purged(&self) -> (LogIndex, Term) {
        self.store.purged()
    }

    pub fn store_mut(&mut self) -> &mut dyn LogStore {
        self.store.as_mut()
    }

    pub fn into_store(self) -> Box<dyn LogStore> {
        self.store
    }

    pub fn get(&self, index: LogIndex) -> Result<Option<LogEntry>, StorageError> {
        if index == 0 || index > self.last_index {
            return Ok(None);
        }
        self.store.entry(index)
    }

    /// Term of the entry at `index`, also answering for index 0 and the purge point.
    /// `None` when the entry is unknown (past the end or compacted away).
    pub fn term_at(&self, index: LogIndex) -> Result<Option<Term>, StorageError> {
        if index == 0 {
            return Ok(Some(0));
        }
        if index == self.last_index {
            return Ok(Some(self.last_term));
        }
        let (purged_index, purged_term) = self.store.purged();
        if index == purged_index {
            return Ok(Some(purged_term));
        }
        if index < purged_index || index > self.last_index {
            return Ok(None);
        }
        Ok(self.store.entry(index)?.map(|e| e.term))
    }

    /// True if our log holds an entry at `index` with `term`.
    pub fn matches(&self, index: LogIndex, term: Term) -> Result<bool, StorageError> {
        Ok(self.term_at(index)? == Some(term))
    }

    /// Raft's "at least as up-to-date" comparison against a remote log tail.
    pub fn is_up_to_date(&self, last_index: LogIndex, last_term: Term) -> bool {
        last_term > self.last_term || (last_term == self.last_term && last_index >= self.last_index)
    }

    pub fn entries_from(&self, index: LogIndex, max: u64) -> Result<Vec<LogEntry>, StorageError> {
        if index > self.last_index {
            return Ok(Vec::new());
        }
        self.store.entries_from(index, max)
    }

    /// Append entries created locally by the leader.
    pub fn append(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        let Some(last) = entries.last() else {
            return Ok(());
        };
        self.store.append(entries)?;
        self.last_index = last.index;
        self.last_term = last.term;
        Ok(())
    }

    /// Line up entries sent by a leader after a successful consistency check.
    ///
    /// Entries we already hold with the same term are skipped, so redelivery
    /// changes nothing. Entries at or below `committed` are immutable and
    /// always skipped. The first entry with a different term truncates our
    /// log from that index. The caller appends `pending` once it has
    /// accounted for the truncation, so a failed append never hides it.
    pub fn reconcile(&mut self, entries: Vec<LogEntry>, committed: LogIndex) -> Result<Reconciled, StorageError> {
        let mut truncated = None;
        let mut pending = Vec::new();
        for entry in entries {
            if !pending.is_empty() {
                pending.push(entry);
                continue;
            }
            if entry.index <= committed.max(self.store.purged().0) {
                continue;
            }
            match self.term_at(entry.index)? {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    self.truncate_from(entry.index)?;
                    truncated = Some(entry.index);
                    pending.push(entry);
                }
                None => pending.push(entry),
            }
        }
        Ok(Reconciled { truncated, pending })
    }

    pub fn truncate_from(&mut self, index: LogIndex) -> Result<(), StorageError> {
        self.store.truncate_from(index)?;
        let (last_index, last_term) = self.store.last_index_and_term()?;
        self.last_index = last_index;
        self.last_term = last_term;
        Ok(())
    }

    /// Drop entries up to and including `index`, whose term is `term`.
    pub fn purge_to(&mut self, index: LogIndex, term: Term) -> Result<(), StorageError> {
        self.store.purge_to(index, term)?;
        let (last_index, last_term) = self.store.last_index_and_term()?;
        self.last_index = last_index;
        self.last_term = last_term;
        Ok(())
    }

    /// First index in our log holding `term`, scanning back from `from`.
    /// Used to give a rejected leader a single jump past a whole bad term.
    pub fn first_index_of_term(&self, from: LogIndex, term: Term) -> Result<LogIndex, StorageError> {
        let floor = self.store.purged().0 + 1;
        let mut index = from;
        while index > floor {
            if self.term_at(index - 1)? != Some(term) {
                break;
            }
            index -= 1;
        }
        Ok(index)
    }
}
