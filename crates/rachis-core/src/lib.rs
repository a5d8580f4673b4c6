//! # rachis-core
//!
//! why: implement the rachis consensus engine in pure, portable, synchronous rust
//! relations: persisted by rachis-storage, hosted by rachis-runtime
//! what: role state machine, election, log replication, topology changes, applier and snapshots

pub mod config;
pub mod election;
pub mod error;
pub mod log;
pub mod memory;
pub mod message;
pub mod node;
pub mod replication;
pub mod state_machine;
pub mod storage;
pub mod topology;

/// Stable identifier of a cluster member.
pub type NodeId = u64;

/// Logical epoch. Never decreases on a node.
pub type Term = u64;

/// Position in the replicated log, starting at 1.
pub type LogIndex = u64;

pub use config::RaftConfig;
pub use error::{ConfigError, ProposeError, RaftError, StorageError};
pub use log::{EntryKind, LogEntry};
pub use memory::{KvCommand, KvStateMachine, MemoryLogStore, MemorySnapshotStore};
pub use message::{Envelope, Message};
pub use node::{NodeState, NodeStatus, RaftNode};
pub use state_machine::{Applied, StateMachine};
pub use storage::{LogStore, Snapshot, SnapshotStore, Vote};
pub use topology::Topology;
