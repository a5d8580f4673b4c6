//! # message
//!
//! why: define all raft rpc message types for node communication
//! relations: produced and consumed by node.rs, carried by the runtime transport
//! what: Message (one variant per rpc and response) and the addressed Envelope

use serde::{Deserialize, Serialize};

use crate::log::LogEntry;
use crate::topology::Topology;
use crate::{LogIndex, NodeId, Term};

/// All possible Raft messages between nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Ask whether a vote would be granted at `term`, without anyone changing state
    PreVoteRequest {
        term: Term,
        candidate_id: NodeId,
        last_log_index: LogIndex,
        last_log_term: Term,
    },
    PreVoteResponse {
        term: Term,
        vote_granted: bool,
    },
    /// Request a vote during leader election
    VoteRequest {
        term: Term,
        candidate_id: NodeId,
        last_log_index: LogIndex,
        last_log_term: Term,
    },
    /// Response to a vote request
    VoteResponse {
        term: Term,
        vote_granted: bool,
    },
    /// Replicate log entries (also serves as heartbeat when entries is empty)
    AppendEntries {
        term: Term,
        leader_id: NodeId,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: LogIndex,
    },
    /// Response to AppendEntries
    AppendEntriesResponse {
        current_term: Term,
        /// On success the highest index known to match the leader,
        /// otherwise the responder's last log index.
        last_log_index: LogIndex,
        success: bool,
        /// Diagnostic text, for logs only.
        message: String,
        /// Echo of the leader the responder follows, for logs only.
        leader_id: Option<NodeId>,
        /// Where the leader should resume after a rejection.
        conflict_index: Option<LogIndex>,
    },
    /// Replace a lagging follower's state with the leader's snapshot
    InstallSnapshot {
        term: Term,
        leader_id: NodeId,
        last_included_index: LogIndex,
        last_included_term: Term,
        topology: Topology,
        data: Vec<u8>,
    },
    InstallSnapshotResponse {
        current_term: Term,
        success: bool,
    },
    /// Sent by a leader handing over leadership: start an election now
    TimeoutNow {
        term: Term,
        leader_id: NodeId,
    },
}

impl Message {
    /// The sender's term carried by every message.
    pub fn term(&self) -> Term {
        match self {
            Message::PreVoteRequest { term, .. }
            | Message::PreVoteResponse { term, .. }
            | Message::VoteRequest { term, .. }
            | Message::VoteResponse { term, .. }
            | Message::AppendEntries { term, .. }
            | Message::InstallSnapshot { term, .. }
            | Message::TimeoutNow { term, .. } => *term,
            Message::AppendEntriesResponse { current_term, .. }
            | Message::InstallSnapshotResponse { current_term, .. } => *current_term,
        }
    }

    /// Short name for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::PreVoteRequest { .. } => "PreVoteRequest",
            Message::PreVoteResponse { .. } => "PreVoteResponse",
            Message::VoteRequest { .. } => "VoteRequest",
            Message::VoteResponse { .. } => "VoteResponse",
            Message::AppendEntries { .. } => "AppendEntries",
            Message::AppendEntriesResponse { .. } => "AppendEntriesResponse",
            Message::InstallSnapshot { .. } => "InstallSnapshot",
            Message::InstallSnapshotResponse { .. } => "InstallSnapshotResponse",
            Message::TimeoutNow { .. } => "TimeoutNow",
        }
    }
}

/// A message addressed from one node to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: NodeId,
    pub to: NodeId,
    pub message: Message,
}
