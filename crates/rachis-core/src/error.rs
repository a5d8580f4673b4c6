//! # error
//!
//! why: give every failure mode of the engine and its collaborators a typed shape
//! relations: returned by storage.rs implementations, config.rs validation, node.rs
//! what: StorageError, ConfigError, RaftError, ProposeError

use crate::NodeId;
use thiserror::Error;

/// Failures reported by a log store or snapshot store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage is corrupt: {0}")]
    Corrupt(String),

    /// An append that would leave a gap (or overlap) in the log.
    #[error("non-contiguous append: expected index {expected}, got {got}")]
    NonContiguous { expected: u64, got: u64 },
}

/// Invalid engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("election_timeout_min ({min}) is greater than election_timeout_max ({max})")]
    ElectionRange { min: u64, max: u64 },

    #[error("heartbeat_interval ({heartbeat}) must be below election_timeout_min ({min})")]
    HeartbeatTooSlow { heartbeat: u64, min: u64 },

    #[error("tick_ms ({tick}) must not exceed heartbeat_interval ({heartbeat})")]
    TickTooCoarse { tick: u64, heartbeat: u64 },

    #[error("invalid config document: {0}")]
    Parse(String),
}

/// Errors that abort the operation the engine was performing.
///
/// Nothing that depends on the failed write is ever sent to a peer.
#[derive(Debug, Error)]
pub enum RaftError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("state machine failure: {0}")]
    StateMachine(String),
}

/// Reasons a client proposal is refused by the engine.
#[derive(Debug, Error)]
pub enum ProposeError {
    #[error("not the leader, leader is {leader:?}")]
    NotLeader { leader: Option<NodeId> },

    #[error("a topology change is already in progress")]
    TopologyChangeInProgress,

    #[error("leader has not yet committed an entry in its term")]
    LeaderNotReady,

    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    #[error("topology is unchanged")]
    UnchangedTopology,

    #[error("leadership transfer in progress")]
    TransferInProgress,

    #[error("node {0} is not a voting member")]
    UnknownNode(NodeId),

    #[error(transparent)]
    Engine(#[from] RaftError),
}

impl From<StorageError> for ProposeError {
    fn from(e: StorageError) -> Self {
        ProposeError::Engine(RaftError::Storage(e))
    }
}
