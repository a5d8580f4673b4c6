//! # memory
//!
//! why: run the engine without a disk, for tests and embedded single-process clusters
//! relations: implements the storage.rs and state_machine.rs contracts
//! what: MemoryLogStore, MemorySnapshotStore, KvStateMachine with its KvCommand

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::log::LogEntry;
use crate::state_machine::StateMachine;
use crate::storage::{check_contiguous, LogStore, Snapshot, SnapshotStore, Vote};
use crate::{LogIndex, Term};

/// In-memory log store. Nothing survives the process.
#[derive(Debug, Default, Clone)]
pub struct MemoryLogStore {
    vote: Vote,
    entries: VecDeque<LogEntry>,
    purged: (LogIndex, Term),
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, index: LogIndex) -> Option<usize> {
        if index <= self.purged.0 {
            return None;
        }
        let pos = (index - self.purged.0 - 1) as usize;
        (pos < self.entries.len()).then_some(pos)
    }
}

impl LogStore for MemoryLogStore {
    fn save_vote(&mut self, vote: &Vote) -> Result<(), StorageError> {
        self.vote = *vote;
        Ok(())
    }

    fn load_vote(&self) -> Result<Vote, StorageError> {
        Ok(self.vote)
    }

    fn append(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        check_contiguous(self.last_index_and_term()?.0, entries)?;
        self.entries.extend(entries.iter().cloned());
        Ok(())
    }

    fn entries_from(&self, index: LogIndex, max: u64) -> Result<Vec<LogEntry>, StorageError> {
        let Some(start) = self.position(index) else {
            return Ok(Vec::new());
        };
        Ok(self.entries.iter().skip(start).take(max as usize).cloned().collect())
    }

    fn entry(&self, index: LogIndex) -> Result<Option<LogEntry>, StorageError> {
        Ok(self.position(index).map(|pos| self.entries[pos].clone()))
    }

    fn truncate_from(&mut self, index: LogIndex) -> Result<(), StorageError> {
        let keep = index.saturating_sub(self.purged.0 + 1) as usize;
        self.entries.truncate(keep);
        Ok(())
    }

    fn purge_to(&mut self, index: LogIndex, term: Term) -> Result<(), StorageError> {
        if index <= self.purged.0 {
            return Ok(());
        }
        while self.entries.front().is_some_and(|e| e.index <= index) {
            self.entries.pop_front();
        }
        // Purging past our last entry (snapshot install) leaves an empty log.
        if self.entries.front().is_some_and(|e| e.index != index + 1) {
            self.entries.clear();
        }
        self.purged = (index, term);
        Ok(())
    }

    fn last_index_and_term(&self) -> Result<(LogIndex, Term), StorageError> {
        Ok(self.entries.back().map_or(self.purged, |e| (e.index, e.term)))
    }

    fn purged(&self) -> (LogIndex, Term) {
        self.purged
    }
}

/// In-memory snapshot store.
#[derive(Debug, Default, Clone)]
pub struct MemorySnapshotStore {
    snapshot: Option<Snapshot>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn save(&mut self, snapshot: &Snapshot) -> Result<(), StorageError> {
        self.snapshot = Some(snapshot.clone());
        Ok(())
    }

    fn load(&self) -> Result<Option<Snapshot>, StorageError> {
        Ok(self.snapshot.clone())
    }
}

/// Commands understood by `KvStateMachine`, json-encoded in entry payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvCommand {
    Set { key: String, value: String },
    Delete { key: String },
}

impl KvCommand {
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Set { key: key.into(), value: value.into() }
    }

    pub fn encode(&self) -> Vec<u8> {
        // A map of two strings always serializes.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// A small key/value state machine.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct KvStateMachine {
    data: BTreeMap<String, String>,
    applied: u64,
}

impl KvStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of commands applied since creation or the last restore.
    pub fn applied_count(&self) -> u64 {
        self.applied
    }
}

impl StateMachine for KvStateMachine {
    fn apply(&mut self, entry: &LogEntry) -> Result<Vec<u8>, String> {
        let command: KvCommand =
            serde_json::from_slice(&entry.payload).map_err(|e| format!("bad command: {e}"))?;
        self.applied += 1;
        match command {
            KvCommand::Set { key, value } => {
                let previous = self.data.insert(key, value);
                Ok(previous.unwrap_or_default().into_bytes())
            }
            KvCommand::Delete { key } => match self.data.remove(&key) {
                Some(previous) => Ok(previous.into_bytes()),
                None => Err(format!("no such key: {key}")),
            },
        }
    }

    fn take_snapshot(&mut self) -> Result<Vec<u8>, String> {
        serde_json::to_vec(&self.data).map_err(|e| e.to_string())
    }

    fn restore(&mut self, data: &[u8]) -> Result<(), String> {
        self.data = serde_json::from_slice(data).map_err(|e| e.to_string())?;
        self.applied = 0;
        Ok(())
    }
}
