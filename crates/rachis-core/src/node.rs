//! # node
//!
//! why: define the raft node state machine and state transitions
//! relations: drives election.rs, replication.rs and topology.rs; persists through storage.rs
//! what: NodeState, RaftNode (the engine), NodeStatus, the applier and snapshot paths
//!
//! The node is synchronous and owns all of its state. A host feeds it timer
//! ticks, inbound messages and client proposals one at a time, then drains
//! the outbound messages and applied notifications it produced. Nothing is
//! queued for a peer until the state it acknowledges is durable.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::RaftConfig;
use crate::election::{should_grant_pre_vote, should_grant_vote, Campaign, ElectionTimer};
use crate::error::{ProposeError, RaftError, StorageError};
use crate::log::{EntryKind, LogEntry, RaftLog};
use crate::message::{Envelope, Message};
use crate::replication::{check_consistency, Consistency, PeerProgress, Plan, Replication};
use crate::state_machine::{Applied, StateMachine};
use crate::storage::{LogStore, Snapshot, SnapshotStore, Vote};
use crate::topology::{Membership, Topology};
use crate::{LogIndex, NodeId, Term};

/// The possible states a Raft node can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NodeState {
    /// Passive state - listens for heartbeats, votes when asked
    #[default]
    Follower,
    /// Probing whether an election could be won, without touching the term
    PreCandidate,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Active state - manages log replication, sends heartbeats
    Leader,
}

/// Observable summary of a node, for logs, dashboards and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub state: NodeState,
    pub term: Term,
    pub leader: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
    pub voters: Vec<NodeId>,
    pub members: Vec<NodeId>,
}

struct LeaderState {
    replication: Replication,
    since_heartbeat: u64,
    since_quorum_check: u64,
    /// Index of the no-op appended on election; membership changes wait for it.
    noop_index: LogIndex,
    transfer: Option<Transfer>,
}

struct Transfer {
    target: NodeId,
    started: u64,
}

enum Role {
    Follower,
    PreCandidate(Campaign),
    Candidate(Campaign),
    Leader(LeaderState),
}

/// A single Raft node in the cluster
pub struct RaftNode<M: StateMachine> {
    id: NodeId,
    config: RaftConfig,
    /// Current term and vote, always equal to what is persisted.
    vote: Vote,
    log: RaftLog,
    snapshots: Box<dyn SnapshotStore>,
    state_machine: M,
    membership: Membership,
    role: Role,
    leader_id: Option<NodeId>,
    commit_index: LogIndex,
    last_applied: LogIndex,
    /// Index and term covered by the latest snapshot.
    snapshot_point: (LogIndex, Term),
    timer: ElectionTimer,
    /// Logical clock in ms, advanced by `tick()`.
    clock: u64,
    last_leader_contact: Option<u64>,
    outbox: Vec<Envelope>,
    applied: Vec<Applied>,
}

impl<M: StateMachine> RaftNode<M> {
    /// Create a node, restoring term, vote, snapshot and log from storage.
    ///
    /// `initial_topology` is used only when storage holds no membership yet.
    /// A node that is not one of its voters stays passive until a topology
    /// entry names it.
    pub fn new(
        id: NodeId,
        config: RaftConfig,
        initial_topology: Topology,
        log_store: Box<dyn LogStore>,
        snapshots: Box<dyn SnapshotStore>,
        mut state_machine: M,
    ) -> Result<Self, RaftError> {
        config.validate()?;
        let vote = log_store.load_vote()?;
        let mut log = RaftLog::new(log_store)?;
        let snapshot = snapshots.load()?;

        let (committed, snapshot_point) = match snapshot {
            Some(snapshot) => {
                state_machine.restore(&snapshot.data).map_err(RaftError::StateMachine)?;
                let (index, term) = (snapshot.last_included_index, snapshot.last_included_term);
                // Finish a compaction or snapshot install interrupted by a crash.
                if !log.matches(index, term)? {
                    log.truncate_from(log.first_index())?;
                }
                if log.purged().0 < index {
                    log.purge_to(index, term)?;
                }
                (snapshot.topology, (index, term))
            }
            None => (initial_topology, (0, 0)),
        };
        let entries = log.entries_from(log.first_index(), u64::MAX)?;
        let membership = Membership::restore(committed, &entries, snapshot_point.0)?;
        let timer = ElectionTimer::new(
            config.election_timeout_min,
            config.election_timeout_max,
            config.rng_seed.map(|seed| seed ^ id),
        );

        info!(
            node = id,
            term = vote.term,
            last_log_index = log.last_index(),
            snapshot_index = snapshot_point.0,
            "node started"
        );
        Ok(Self {
            id,
            config,
            vote,
            log,
            snapshots,
            state_machine,
            membership,
            role: Role::Follower,
            leader_id: None,
            commit_index: snapshot_point.0,
            last_applied: snapshot_point.0,
            snapshot_point,
            timer,
            clock: 0,
            last_leader_contact: None,
            outbox: Vec::new(),
            applied: Vec::new(),
        })
    }

    // -- accessors --

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn state(&self) -> NodeState {
        match self.role {
            Role::Follower => NodeState::Follower,
            Role::PreCandidate(_) => NodeState::PreCandidate,
            Role::Candidate(_) => NodeState::Candidate,
            Role::Leader(_) => NodeState::Leader,
        }
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.role, Role::Leader(_))
    }

    pub fn current_term(&self) -> Term {
        self.vote.term
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.vote.voted_for
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.leader_id
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    pub fn last_log_index(&self) -> LogIndex {
        self.log.last_index()
    }

    pub fn last_log_term(&self) -> Term {
        self.log.last_term()
    }

    pub fn snapshot_index(&self) -> LogIndex {
        self.snapshot_point.0
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    /// The committed membership, which decides `quorum_size()`.
    pub fn topology(&self) -> &Topology {
        self.membership.committed()
    }

    /// An uncommitted membership change and the index of its entry.
    pub fn pending_topology(&self) -> Option<&(LogIndex, Topology)> {
        self.membership.pending()
    }

    pub fn quorum_size(&self) -> usize {
        self.membership.committed().quorum_size()
    }

    pub fn state_machine(&self) -> &M {
        &self.state_machine
    }

    /// Leader view of a follower, for diagnostics.
    pub fn peer_progress(&self, peer: NodeId) -> Option<&PeerProgress> {
        match &self.role {
            Role::Leader(leader) => leader.replication.progress(peer),
            _ => None,
        }
    }

    pub fn entry(&self, index: LogIndex) -> Result<Option<LogEntry>, StorageError> {
        self.log.get(index)
    }

    /// Every entry still held in the log, in order.
    pub fn log_entries(&self) -> Result<Vec<LogEntry>, StorageError> {
        self.log.entries_from(self.log.first_index(), u64::MAX)
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.id,
            state: self.state(),
            term: self.vote.term,
            leader: self.leader_id,
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
            voters: self.membership.committed().voters.iter().copied().collect(),
            members: self.membership.committed().members.iter().copied().collect(),
        }
    }

    /// Drain messages produced since the last call.
    pub fn take_messages(&mut self) -> Vec<Envelope> {
        std::mem::take(&mut self.outbox)
    }

    /// Drain applied-entry notifications produced since the last call.
    pub fn take_applied(&mut self) -> Vec<Applied> {
        std::mem::take(&mut self.applied)
    }

    /// Stop the node, handing back its durable stores (crash/restart in tests).
    pub fn into_storage(self) -> (Box<dyn LogStore>, Box<dyn SnapshotStore>) {
        (self.log.into_store(), self.snapshots)
    }

    // -- driving the node --

    /// Advance logical time by one tick.
    pub fn tick(&mut self) -> Result<(), RaftError> {
        let step = self.config.tick_ms;
        self.clock += step;

        if let Role::Leader(leader) = &mut self.role {
            leader.since_heartbeat += step;
            leader.since_quorum_check += step;

            let window = self.config.election_timeout_max;
            if self.config.check_quorum && leader.since_quorum_check >= window {
                leader.since_quorum_check = 0;
                if !leader.replication.has_recent_quorum(&self.membership, self.id, self.clock, window) {
                    warn!(node = self.id, term = self.vote.term, "lost contact with a quorum, stepping down");
                    return self.become_follower(self.vote.term, None);
                }
            }
            if leader.transfer.as_ref().is_some_and(|t| self.clock - t.started >= window) {
                info!(node = self.id, "leadership transfer timed out");
                leader.transfer = None;
            }
            if leader.since_heartbeat >= self.config.heartbeat_interval {
                leader.since_heartbeat = 0;
                return self.broadcast(true);
            }
            return Ok(());
        }

        if self.timer.advance(step) {
            self.timer.reset();
            if !self.membership.is_voter(self.id) {
                return Ok(());
            }
            if self.config.pre_vote {
                self.start_pre_vote()?;
            } else {
                self.start_election()?;
            }
        }
        Ok(())
    }

    /// Handle one inbound message from `from`.
    pub fn step(&mut self, from: NodeId, message: Message) -> Result<(), RaftError> {
        if from == self.id {
            return Ok(());
        }
        let term = message.term();
        if term > self.vote.term {
            match &message {
                // Pre-votes are hypothetical and never move terms.
                Message::PreVoteRequest { .. } => {}
                Message::PreVoteResponse { vote_granted: true, .. } => {}
                Message::AppendEntries { leader_id, .. } | Message::InstallSnapshot { leader_id, .. } => {
                    let leader = *leader_id;
                    self.become_follower(term, Some(leader))?;
                }
                _ => self.become_follower(term, None)?,
            }
        }

        match message {
            Message::PreVoteRequest { term, candidate_id, last_log_index, last_log_term } => {
                self.handle_pre_vote_request(from, term, candidate_id, last_log_index, last_log_term)
            }
            Message::PreVoteResponse { term, vote_granted } => self.handle_pre_vote_response(from, term, vote_granted),
            Message::VoteRequest { term, candidate_id, last_log_index, last_log_term } => {
                self.handle_vote_request(from, term, candidate_id, last_log_index, last_log_term)
            }
            Message::VoteResponse { term, vote_granted } => self.handle_vote_response(from, term, vote_granted),
            Message::AppendEntries { term, leader_id, prev_log_index, prev_log_term, entries, leader_commit } => {
                self.handle_append_entries(from, term, leader_id, prev_log_index, prev_log_term, entries, leader_commit)
            }
            Message::AppendEntriesResponse { current_term, last_log_index, success, conflict_index, message, .. } => {
                self.handle_append_entries_response(from, current_term, last_log_index, success, conflict_index, &message)
            }
            Message::InstallSnapshot { term, leader_id, last_included_index, last_included_term, topology, data } => {
                let snapshot = Snapshot { last_included_index, last_included_term, topology, data };
                self.handle_install_snapshot(from, term, leader_id, snapshot)
            }
            Message::InstallSnapshotResponse { current_term, success } => {
                self.handle_install_snapshot_response(from, current_term, success)
            }
            Message::TimeoutNow { term, leader_id } => self.handle_timeout_now(term, leader_id),
        }
    }

    /// Append a client command. Only the leader accepts commands; the
    /// returned index is committed once a quorum stores it.
    pub fn propose(&mut self, payload: Vec<u8>) -> Result<LogIndex, ProposeError> {
        let Role::Leader(leader) = &self.role else {
            return Err(ProposeError::NotLeader { leader: self.leader_id });
        };
        if leader.transfer.is_some() {
            return Err(ProposeError::TransferInProgress);
        }
        let entry = LogEntry::new(self.vote.term, self.log.last_index() + 1, payload);
        let index = entry.index;
        self.log.append(&[entry])?;
        debug!(node = self.id, term = self.vote.term, index, "proposed command");
        self.broadcast(false)?;
        self.maybe_commit()?;
        Ok(index)
    }

    /// Propose a new membership. Changes are serialized: at most one may be
    /// uncommitted, and it only takes effect once committed.
    pub fn propose_topology(&mut self, topology: Topology) -> Result<LogIndex, ProposeError> {
        let Role::Leader(leader) = &self.role else {
            return Err(ProposeError::NotLeader { leader: self.leader_id });
        };
        if leader.transfer.is_some() {
            return Err(ProposeError::TransferInProgress);
        }
        topology.validate().map_err(ProposeError::InvalidTopology)?;
        if self.membership.pending().is_some() {
            return Err(ProposeError::TopologyChangeInProgress);
        }
        if self.commit_index < leader.noop_index {
            return Err(ProposeError::LeaderNotReady);
        }
        if &topology == self.membership.committed() {
            return Err(ProposeError::UnchangedTopology);
        }

        let entry = LogEntry::topology(self.vote.term, self.log.last_index() + 1, &topology)?;
        let index = entry.index;
        self.log.append(std::slice::from_ref(&entry))?;
        self.membership.observe(&entry)?;
        info!(node = self.id, term = self.vote.term, index, voters = ?topology.voters, "proposed topology change");
        self.sync_peers();
        self.broadcast(false)?;
        self.maybe_commit()?;
        Ok(index)
    }

    /// Hand leadership to `target` once it has caught up.
    pub fn transfer_leadership(&mut self, target: NodeId) -> Result<(), ProposeError> {
        let Role::Leader(leader) = &mut self.role else {
            return Err(ProposeError::NotLeader { leader: self.leader_id });
        };
        if target == self.id {
            return Ok(());
        }
        if !self.membership.committed().is_voter(target) {
            return Err(ProposeError::UnknownNode(target));
        }
        if leader.transfer.is_some() {
            return Err(ProposeError::TransferInProgress);
        }
        info!(node = self.id, term = self.vote.term, target, "transferring leadership");
        leader.transfer = Some(Transfer { target, started: self.clock });
        self.maybe_send_timeout_now(target);
        self.send_append(target, true)?;
        Ok(())
    }

    // -- election --

    fn start_pre_vote(&mut self) -> Result<(), RaftError> {
        let term = self.vote.term + 1;
        debug!(node = self.id, term, "starting pre-vote");
        self.role = Role::PreCandidate(Campaign::new(self.id, term));
        self.leader_id = None;
        let request = Message::PreVoteRequest {
            term,
            candidate_id: self.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        self.send_to_voters(request);
        if let Role::PreCandidate(campaign) = &self.role {
            if campaign.is_won(&self.membership) {
                return self.start_election();
            }
        }
        Ok(())
    }

    fn start_election(&mut self) -> Result<(), RaftError> {
        let term = self.vote.term + 1;
        self.persist_vote(Vote { term, voted_for: Some(self.id) })?;
        info!(node = self.id, term, "starting election");
        self.role = Role::Candidate(Campaign::new(self.id, term));
        self.leader_id = None;
        self.timer.reset();
        let request = Message::VoteRequest {
            term,
            candidate_id: self.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        self.send_to_voters(request);
        if let Role::Candidate(campaign) = &self.role {
            if campaign.is_won(&self.membership) {
                return self.become_leader();
            }
        }
        Ok(())
    }

    fn handle_pre_vote_request(
        &mut self,
        from: NodeId,
        term: Term,
        candidate: NodeId,
        last_log_index: LogIndex,
        last_log_term: Term,
    ) -> Result<(), RaftError> {
        let granted = should_grant_pre_vote(
            self.vote.term,
            &self.log,
            self.leader_alive(),
            term,
            last_log_index,
            last_log_term,
        );
        debug!(node = self.id, term = self.vote.term, candidate, granted, "pre-vote request");
        let term = if granted { term } else { self.vote.term };
        self.send(from, Message::PreVoteResponse { term, vote_granted: granted });
        Ok(())
    }

    fn handle_pre_vote_response(&mut self, from: NodeId, term: Term, granted: bool) -> Result<(), RaftError> {
        let Role::PreCandidate(campaign) = &mut self.role else {
            return Ok(());
        };
        if granted && term != campaign.term {
            return Ok(());
        }
        campaign.record(from, granted);
        if campaign.is_won(&self.membership) {
            return self.start_election();
        }
        Ok(())
    }

    fn handle_vote_request(
        &mut self,
        from: NodeId,
        term: Term,
        candidate: NodeId,
        last_log_index: LogIndex,
        last_log_term: Term,
    ) -> Result<(), RaftError> {
        let granted = term == self.vote.term
            && should_grant_vote(&self.vote, &self.log, term, candidate, last_log_index, last_log_term);
        if granted {
            if self.vote.voted_for != Some(candidate) {
                self.persist_vote(Vote { term, voted_for: Some(candidate) })?;
            }
            self.timer.reset();
        }
        debug!(node = self.id, term = self.vote.term, candidate, granted, "vote request");
        self.send(from, Message::VoteResponse { term: self.vote.term, vote_granted: granted });
        Ok(())
    }

    fn handle_vote_response(&mut self, from: NodeId, term: Term, granted: bool) -> Result<(), RaftError> {
        let Role::Candidate(campaign) = &mut self.role else {
            return Ok(());
        };
        // responses from an abandoned election are discarded
        if term != campaign.term {
            return Ok(());
        }
        campaign.record(from, granted);
        if campaign.is_won(&self.membership) {
            return self.become_leader();
        }
        Ok(())
    }

    fn handle_timeout_now(&mut self, term: Term, leader: NodeId) -> Result<(), RaftError> {
        if term != self.vote.term || self.is_leader() || !self.membership.is_voter(self.id) {
            return Ok(());
        }
        info!(node = self.id, term, leader, "leadership handed over, starting election");
        self.start_election()
    }

    fn become_leader(&mut self) -> Result<(), RaftError> {
        let term = self.vote.term;
        info!(node = self.id, term, "became leader");
        let noop = LogEntry::noop(term, self.log.last_index() + 1);
        let noop_index = noop.index;
        self.log.append(&[noop])?;

        let peers = self.peer_set();
        self.role = Role::Leader(LeaderState {
            replication: Replication::new(peers, self.log.last_index() - 1, self.clock),
            since_heartbeat: 0,
            since_quorum_check: 0,
            noop_index,
            transfer: None,
        });
        self.leader_id = Some(self.id);
        self.broadcast(true)?;
        self.maybe_commit()
    }

    /// Adopt `term` if newer and fall back to follower.
    fn become_follower(&mut self, term: Term, leader: Option<NodeId>) -> Result<(), RaftError> {
        if term > self.vote.term {
            self.persist_vote(Vote { term, voted_for: None })?;
        }
        if self.is_leader() {
            info!(node = self.id, term, "stepping down");
        }
        self.role = Role::Follower;
        self.leader_id = leader;
        self.timer.reset();
        Ok(())
    }

    fn leader_alive(&self) -> bool {
        self.is_leader()
            || self
                .last_leader_contact
                .is_some_and(|at| self.clock.saturating_sub(at) < self.config.election_timeout_min)
    }

    /// Durability precedes visibility: the vote is written before anything
    /// that depends on it can be sent.
    fn persist_vote(&mut self, vote: Vote) -> Result<(), RaftError> {
        self.log.store_mut().save_vote(&vote)?;
        self.vote = vote;
        Ok(())
    }

    // -- replication, follower side --

    #[allow(clippy::too_many_arguments)]
    fn handle_append_entries(
        &mut self,
        from: NodeId,
        term: Term,
        leader: NodeId,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: LogIndex,
    ) -> Result<(), RaftError> {
        if term < self.vote.term {
            debug!(node = self.id, term = self.vote.term, stale = term, leader, "rejecting stale append");
            let message = format!("stale term {term}, current term is {}", self.vote.term);
            self.reply_append(from, false, self.log.last_index(), None, message);
            return Ok(());
        }
        if self.is_leader() {
            error!(node = self.id, term, leader, "second leader for the same term");
            self.reply_append(from, false, self.log.last_index(), None, "I am the leader for this term".into());
            return Ok(());
        }
        if !matches!(self.role, Role::Follower) {
            self.become_follower(term, Some(leader))?;
        }
        self.leader_id = Some(leader);
        self.last_leader_contact = Some(self.clock);
        self.timer.reset();

        if let Consistency::Mismatch { conflict_index, reason } =
            check_consistency(&self.log, prev_log_index, prev_log_term)?
        {
            debug!(node = self.id, term, prev_log_index, conflict_index, "rejecting append: {reason}");
            self.reply_append(from, false, self.log.last_index(), Some(conflict_index), reason);
            return Ok(());
        }

        let matched = prev_log_index + entries.len() as u64;
        let reconciled = self.log.reconcile(entries, self.commit_index)?;
        if let Some(index) = reconciled.truncated {
            info!(node = self.id, term, index, "truncated conflicting entries");
            self.membership.truncate_from(index);
        }
        self.log.append(&reconciled.pending)?;
        for entry in &reconciled.pending {
            self.membership.observe(entry)?;
        }

        let message = format!("appended {} entries", reconciled.pending.len());
        self.reply_append(from, true, matched, None, message);

        let commit = leader_commit.min(matched);
        if commit > self.commit_index {
            self.advance_commit(commit)?;
        }
        Ok(())
    }

    fn reply_append(
        &mut self,
        to: NodeId,
        success: bool,
        last_log_index: LogIndex,
        conflict_index: Option<LogIndex>,
        message: String,
    ) {
        let response = Message::AppendEntriesResponse {
            current_term: self.vote.term,
            last_log_index,
            success,
            message,
            leader_id: self.leader_id,
            conflict_index,
        };
        self.send(to, response);
    }

    fn handle_install_snapshot(
        &mut self,
        from: NodeId,
        term: Term,
        leader: NodeId,
        snapshot: Snapshot,
    ) -> Result<(), RaftError> {
        if term < self.vote.term {
            self.send(from, Message::InstallSnapshotResponse { current_term: self.vote.term, success: false });
            return Ok(());
        }
        if self.is_leader() {
            error!(node = self.id, term, leader, "second leader for the same term");
            self.send(from, Message::InstallSnapshotResponse { current_term: self.vote.term, success: false });
            return Ok(());
        }
        if !matches!(self.role, Role::Follower) {
            self.become_follower(term, Some(leader))?;
        }
        self.leader_id = Some(leader);
        self.last_leader_contact = Some(self.clock);
        self.timer.reset();

        let success = self.install_snapshot(snapshot)?;
        self.send(from, Message::InstallSnapshotResponse { current_term: self.vote.term, success });
        Ok(())
    }

    /// Replace state machine and log prefix with `snapshot`. Returns false
    /// if the state machine refused it; the leader will send it again.
    fn install_snapshot(&mut self, snapshot: Snapshot) -> Result<bool, RaftError> {
        let (index, term) = (snapshot.last_included_index, snapshot.last_included_term);
        if index <= self.commit_index {
            return Ok(true);
        }
        let keep_suffix = self.log.matches(index, term)?;
        let suffix = if keep_suffix { self.log.entries_from(index + 1, u64::MAX)? } else { Vec::new() };
        let membership = Membership::restore(snapshot.topology.clone(), &suffix, index)?;

        // last_applied describes this image until the snapshot is durable
        let previous = self.state_machine.take_snapshot().map_err(RaftError::StateMachine)?;
        if let Err(e) = self.state_machine.restore(&snapshot.data) {
            warn!(node = self.id, index, "failed to restore snapshot: {e}");
            return Ok(false);
        }
        if let Err(e) = self.snapshots.save(&snapshot) {
            self.state_machine
                .restore(&previous)
                .map_err(|undo| RaftError::StateMachine(format!("rolling back snapshot install: {undo}")))?;
            return Err(e.into());
        }
        self.commit_index = index;
        self.last_applied = index;
        self.snapshot_point = (index, term);
        self.membership = membership;

        if !keep_suffix {
            self.log.truncate_from(self.log.first_index())?;
        }
        self.log.purge_to(index, term)?;
        info!(node = self.id, term = self.vote.term, index, "installed snapshot");
        Ok(true)
    }

    // -- replication, leader side --

    fn handle_append_entries_response(
        &mut self,
        from: NodeId,
        term: Term,
        last_log_index: LogIndex,
        success: bool,
        conflict_index: Option<LogIndex>,
        message: &str,
    ) -> Result<(), RaftError> {
        if term < self.vote.term {
            return Ok(());
        }
        let last = self.log.last_index();
        let Role::Leader(leader) = &mut self.role else {
            return Ok(());
        };
        if success {
            let advanced = leader.replication.on_success(from, last_log_index.min(last), self.clock);
            if advanced {
                self.maybe_commit()?;
            }
            self.maybe_send_timeout_now(from);
            self.send_append(from, false)
        } else {
            debug!(node = self.id, peer = from, last_log_index, ?conflict_index, "append rejected: {message}");
            leader.replication.on_reject(from, last_log_index, conflict_index, self.clock);
            self.send_append(from, true)
        }
    }

    fn handle_install_snapshot_response(&mut self, from: NodeId, term: Term, success: bool) -> Result<(), RaftError> {
        if term < self.vote.term {
            return Ok(());
        }
        let Role::Leader(leader) = &mut self.role else {
            return Ok(());
        };
        if leader.replication.on_snapshot_response(from, success, self.clock) {
            self.maybe_commit()?;
        }
        if success {
            self.send_append(from, false)?;
        }
        Ok(())
    }

    fn broadcast(&mut self, heartbeat: bool) -> Result<(), RaftError> {
        let peers: Vec<NodeId> = match &self.role {
            Role::Leader(leader) => leader.replication.peers().collect(),
            _ => return Ok(()),
        };
        for peer in peers {
            self.send_append(peer, heartbeat)?;
        }
        Ok(())
    }

    /// Send `peer` whatever it needs next: entries, a heartbeat or a snapshot.
    fn send_append(&mut self, peer: NodeId, heartbeat: bool) -> Result<(), RaftError> {
        let Role::Leader(leader) = &mut self.role else {
            return Ok(());
        };
        let plan = leader.replication.plan(peer, &self.log, heartbeat, self.clock, self.config.heartbeat_interval);
        match plan {
            Plan::Wait => {}
            Plan::Entries { prev_log_index } => {
                let Some(prev_log_term) = self.log.term_at(prev_log_index)? else {
                    return Ok(());
                };
                let entries = self.log.entries_from(prev_log_index + 1, self.config.max_entries_per_append)?;
                let last_sent = prev_log_index + entries.len() as u64;
                leader.replication.on_sent(peer, last_sent);
                self.outbox.push(Envelope {
                    from: self.id,
                    to: peer,
                    message: Message::AppendEntries {
                        term: self.vote.term,
                        leader_id: self.id,
                        prev_log_index,
                        prev_log_term,
                        entries,
                        leader_commit: self.commit_index,
                    },
                });
            }
            Plan::Snapshot => {
                let Some(snapshot) = self.snapshots.load()? else {
                    warn!(node = self.id, peer, "follower needs compacted entries but no snapshot exists");
                    return Ok(());
                };
                debug!(node = self.id, peer, index = snapshot.last_included_index, "sending snapshot");
                leader.replication.on_snapshot_sent(peer, snapshot.last_included_index, self.clock);
                self.outbox.push(Envelope {
                    from: self.id,
                    to: peer,
                    message: Message::InstallSnapshot {
                        term: self.vote.term,
                        leader_id: self.id,
                        last_included_index: snapshot.last_included_index,
                        last_included_term: snapshot.last_included_term,
                        topology: snapshot.topology,
                        data: snapshot.data,
                    },
                });
            }
        }
        Ok(())
    }

    fn maybe_send_timeout_now(&mut self, peer: NodeId) {
        let last = self.log.last_index();
        let Role::Leader(leader) = &self.role else {
            return;
        };
        let ready = leader.transfer.as_ref().is_some_and(|t| t.target == peer)
            && leader.replication.match_index(peer) == last;
        if ready {
            self.send(peer, Message::TimeoutNow { term: self.vote.term, leader_id: self.id });
        }
    }

    /// Advance the commit index to the highest entry of the current term
    /// stored on a quorum. Entries of older terms are only ever committed
    /// indirectly, by a later entry of the current term.
    fn maybe_commit(&mut self) -> Result<(), RaftError> {
        loop {
            let Role::Leader(leader) = &self.role else {
                return Ok(());
            };
            let candidate = leader.replication.quorum_index(&self.membership, self.id, self.log.last_index());
            if candidate <= self.commit_index || self.log.term_at(candidate)? != Some(self.vote.term) {
                return Ok(());
            }
            self.advance_commit(candidate)?;
        }
    }

    fn advance_commit(&mut self, index: LogIndex) -> Result<(), RaftError> {
        if index <= self.commit_index {
            return Ok(());
        }
        self.commit_index = index;
        if let Some(topology) = self.membership.commit_to(index) {
            info!(node = self.id, term = self.vote.term, voters = ?topology.voters, "topology committed");
            self.on_topology_committed()?;
        }
        self.apply_committed()
    }

    fn on_topology_committed(&mut self) -> Result<(), RaftError> {
        if !self.is_leader() {
            return Ok(());
        }
        self.sync_peers();
        if !self.membership.committed().is_voter(self.id) {
            info!(node = self.id, term = self.vote.term, "removed from voters, stepping down");
            self.broadcast(true)?;
            return self.become_follower(self.vote.term, None);
        }
        Ok(())
    }

    fn peer_set(&self) -> BTreeSet<NodeId> {
        let mut peers = self.membership.all_members();
        peers.remove(&self.id);
        peers
    }

    fn sync_peers(&mut self) {
        let peers = self.peer_set();
        let last = self.log.last_index();
        if let Role::Leader(leader) = &mut self.role {
            leader.replication.sync_peers(&peers, last, self.clock);
        }
    }

    // -- applier --

    /// Apply committed entries in index order, each exactly once.
    fn apply_committed(&mut self) -> Result<(), RaftError> {
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            let entry = self
                .log
                .get(index)?
                .ok_or_else(|| StorageError::Corrupt(format!("committed entry {index} is missing")))?;
            let result = match entry.kind {
                EntryKind::Command => self.state_machine.apply(&entry),
                EntryKind::Topology | EntryKind::Noop => Ok(Vec::new()),
            };
            if let Err(e) = &result {
                debug!(node = self.id, index, "command failed: {e}");
            }
            self.last_applied = index;
            self.applied.push(Applied { index, term: entry.term, kind: entry.kind, result });
        }
        self.maybe_snapshot()
    }

    /// Snapshot the state machine once enough entries were applied since the
    /// last snapshot, then drop the covered log prefix.
    fn maybe_snapshot(&mut self) -> Result<(), RaftError> {
        if self.last_applied - self.snapshot_point.0 < self.config.snapshot_threshold {
            return Ok(());
        }
        let index = self.last_applied;
        let term = self
            .log
            .term_at(index)?
            .ok_or_else(|| StorageError::Corrupt(format!("applied entry {index} is missing")))?;
        let data = self.state_machine.take_snapshot().map_err(RaftError::StateMachine)?;
        let snapshot = Snapshot {
            last_included_index: index,
            last_included_term: term,
            topology: self.membership.committed().clone(),
            data,
        };
        self.snapshots.save(&snapshot)?;
        self.log.purge_to(index, term)?;
        self.snapshot_point = (index, term);
        info!(node = self.id, term = self.vote.term, index, "took snapshot");
        Ok(())
    }

    // -- outbox --

    fn send(&mut self, to: NodeId, message: Message) {
        self.outbox.push(Envelope { from: self.id, to, message });
    }

    fn send_to_voters(&mut self, message: Message) {
        let me = self.id;
        let voters = self.membership.all_voters();
        for voter in voters.into_iter().filter(|v| *v != me) {
            self.send(voter, message.clone());
        }
    }
}
