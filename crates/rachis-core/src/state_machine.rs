//! # state_machine
//!
//! why: separate the replicated application from the protocol that orders its commands
//! relations: driven by the applier in node.rs, implemented by memory.rs and by embedders
//! what: StateMachine trait and the Applied notification handed back to callers

use serde::{Deserialize, Serialize};

use crate::log::{EntryKind, LogEntry};
use crate::{LogIndex, Term};

/// The application being replicated.
///
/// Only committed `Command` entries are passed to `apply`, strictly in
/// index order and each exactly once per process lifetime.
pub trait StateMachine: Send {
    /// Apply one committed command. An `Err` is the command's own result
    /// (for example a failed precondition) and does not stop the engine.
    fn apply(&mut self, entry: &LogEntry) -> Result<Vec<u8>, String>;

    /// Serialize the full current state.
    fn take_snapshot(&mut self) -> Result<Vec<u8>, String>;

    /// Replace the full current state with a snapshot image.
    fn restore(&mut self, data: &[u8]) -> Result<(), String>;
}

/// Notification that the entry at `index` was applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Applied {
    pub index: LogIndex,
    pub term: Term,
    pub kind: EntryKind,
    pub result: Result<Vec<u8>, String>,
}
