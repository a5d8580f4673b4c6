//! # topology
//!
//! why: let the cluster change membership through the log without ever having two disjoint quorums
//! relations: topology entries are created by node.rs, decided by replication.rs, counted by election.rs
//! what: Topology (members + voters), Membership (committed + pending change), quorum arithmetic

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::log::LogEntry;
use crate::error::StorageError;
use crate::{LogIndex, NodeId};

/// Cluster membership. Voters are counted for quorum; the remaining
/// members (watchers) only receive replication.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub members: BTreeSet<NodeId>,
    pub voters: BTreeSet<NodeId>,
}

impl Topology {
    /// A topology in which every member votes.
    pub fn new(voters: impl IntoIterator<Item = NodeId>) -> Self {
        let voters: BTreeSet<_> = voters.into_iter().collect();
        Self { members: voters.clone(), voters }
    }

    /// A topology with the given voters plus non-voting watchers.
    pub fn with_watchers(
        voters: impl IntoIterator<Item = NodeId>,
        watchers: impl IntoIterator<Item = NodeId>,
    ) -> Self {
        let mut topology = Self::new(voters);
        topology.members.extend(watchers);
        topology
    }

    pub fn is_voter(&self, id: NodeId) -> bool {
        self.voters.contains(&id)
    }

    pub fn is_member(&self, id: NodeId) -> bool {
        self.members.contains(&id)
    }

    /// Strict majority of the voters.
    pub fn quorum_size(&self) -> usize {
        self.voters.len() / 2 + 1
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.voters.is_empty() {
            return Err("topology has no voters".into());
        }
        if let Some(id) = self.voters.iter().find(|id| !self.members.contains(id)) {
            return Err(format!("voter {id} is not a member"));
        }
        Ok(())
    }

    /// True if the nodes in `granted` form a majority of the voters.
    pub fn has_majority(&self, granted: &BTreeSet<NodeId>) -> bool {
        !self.voters.is_empty()
            && self.voters.iter().filter(|id| granted.contains(id)).count() >= self.quorum_size()
    }

    /// Highest index stored on a majority of voters, given each voter's match index.
    pub fn quorum_index(&self, matched: impl Fn(NodeId) -> LogIndex) -> LogIndex {
        if self.voters.is_empty() {
            return 0;
        }
        let mut indexes: Vec<LogIndex> = self.voters.iter().map(|id| matched(*id)).collect();
        indexes.sort_unstable_by(|a, b| b.cmp(a));
        indexes[self.quorum_size() - 1]
    }
}

/// The membership as seen by one node: the committed topology plus at most
/// one uncommitted change found in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    committed: Topology,
    pending: Option<(LogIndex, Topology)>,
}

impl Membership {
    pub fn new(committed: Topology) -> Self {
        Self { committed, pending: None }
    }

    /// Rebuild from a snapshot topology and the log entries after it.
    ///
    /// Changes are serialized, so every topology entry but the last one in a
    /// log is already committed; the last stays pending until `commit_index`
    /// reaches it.
    pub fn restore<'a>(
        committed: Topology,
        entries: impl IntoIterator<Item = &'a LogEntry>,
        commit_index: LogIndex,
    ) -> Result<Self, StorageError> {
        let mut membership = Self::new(committed);
        for entry in entries {
            membership.observe(entry)?;
        }
        membership.commit_to(commit_index);
        Ok(membership)
    }

    pub fn committed(&self) -> &Topology {
        &self.committed
    }

    pub fn pending(&self) -> Option<&(LogIndex, Topology)> {
        self.pending.as_ref()
    }

    /// Record a topology entry that just entered the log.
    pub fn observe(&mut self, entry: &LogEntry) -> Result<(), StorageError> {
        if let Some(topology) = entry.as_topology()? {
            if let Some((_, previous)) = self.pending.take() {
                self.committed = previous;
            }
            self.pending = Some((entry.index, topology));
        }
        Ok(())
    }

    /// Promote the pending change once `commit_index` covers it.
    /// Returns the newly committed topology, if any.
    pub fn commit_to(&mut self, commit_index: LogIndex) -> Option<&Topology> {
        match self.pending {
            Some((index, _)) if index <= commit_index => {
                let (_, topology) = self.pending.take()?;
                self.committed = topology;
                Some(&self.committed)
            }
            _ => None,
        }
    }

    /// Forget a pending change whose entry was truncated away.
    pub fn truncate_from(&mut self, index: LogIndex) {
        if matches!(self.pending, Some((p, _)) if p >= index) {
            self.pending = None;
        }
    }

    /// Every voter of the committed and the pending topology.
    pub fn all_voters(&self) -> BTreeSet<NodeId> {
        let mut voters = self.committed.voters.clone();
        if let Some((_, pending)) = &self.pending {
            voters.extend(pending.voters.iter().copied());
        }
        voters
    }

    /// Every member of the committed and the pending topology.
    pub fn all_members(&self) -> BTreeSet<NodeId> {
        let mut members = self.committed.members.clone();
        if let Some((_, pending)) = &self.pending {
            members.extend(pending.members.iter().copied());
        }
        members
    }

    pub fn is_voter(&self, id: NodeId) -> bool {
        self.committed.is_voter(id) || self.pending.as_ref().is_some_and(|(_, t)| t.is_voter(id))
    }

    /// Election quorum: a majority of the committed voters and, during a
    /// change, of the pending voters too.
    pub fn has_vote_quorum(&self, granted: &BTreeSet<NodeId>) -> bool {
        self.committed.has_majority(granted)
            && self.pending.as_ref().map_or(true, |(_, t)| t.has_majority(granted))
    }

    /// Highest index that may be committed given each voter's match index.
    ///
    /// Indexes below a pending change need only the committed majority;
    /// the change itself and everything after it need both majorities.
    pub fn commit_candidate(&self, matched: impl Fn(NodeId) -> LogIndex) -> LogIndex {
        let old = self.committed.quorum_index(&matched);
        match &self.pending {
            Some((index, pending)) if old >= *index => {
                let new = pending.quorum_index(&matched);
                old.min(new).max(index - 1)
            }
            _ => old,
        }
    }
}
