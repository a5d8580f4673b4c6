//! # error
//!
//! why: tell a client exactly why its request did not go through
//! relations: produced by node.rs from engine ProposeErrors and channel failures
//! what: ClientError

use rachis_core::{NodeId, ProposeError};
use thiserror::Error;

/// Outcome of a client request that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// Retry against `leader`, if one is known.
    #[error("not the leader, leader is {leader:?}")]
    NotLeader { leader: Option<NodeId> },

    #[error("timed out waiting for the request to be applied")]
    Timeout,

    /// The entry may or may not commit; its outcome is unknown to this node.
    #[error("leadership changed before the request was applied")]
    LeaderChanged,

    /// Refused by the engine or by the state machine.
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("node is shut down")]
    Shutdown,

    #[error("engine failure: {0}")]
    Engine(String),
}

impl From<ProposeError> for ClientError {
    fn from(e: ProposeError) -> Self {
        match e {
            ProposeError::NotLeader { leader } => ClientError::NotLeader { leader },
            ProposeError::Engine(e) => ClientError::Engine(e.to_string()),
            other => ClientError::Rejected(other.to_string()),
        }
    }
}
