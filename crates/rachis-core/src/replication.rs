//! # replication
//!
//! why: move the leader's log onto followers and find out what a quorum holds
//! relations: leader half owned by node.rs while leading; follower half called from its AppendEntries handler
//! what: PeerProgress per follower, Replication tracker, follower consistency check

use std::collections::{BTreeMap, BTreeSet};

use crate::error::StorageError;
use crate::log::RaftLog;
use crate::topology::Membership;
use crate::{LogIndex, NodeId, Term};

/// How the leader talks to one follower.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressMode {
    /// Position unknown: send one batch and wait for the answer.
    Probe,
    /// Follower is in sync: stream batches and advance `next_index` optimistically.
    Replicate,
}

/// Leader-side knowledge about one follower. Rebuilt on every election win.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerProgress {
    /// Next entry to send.
    pub next_index: LogIndex,
    /// Highest entry known to be stored on the follower.
    pub match_index: LogIndex,
    /// Engine clock (ms) of the last response of any kind from this peer.
    pub last_ack: u64,
    pub mode: ProgressMode,
    /// Snapshot index and send time while an InstallSnapshot is unanswered.
    pub snapshot_in_flight: Option<(LogIndex, u64)>,
}

impl PeerProgress {
    fn new(last_log_index: LogIndex, now: u64) -> Self {
        Self {
            next_index: last_log_index + 1,
            match_index: 0,
            last_ack: now,
            mode: ProgressMode::Probe,
            snapshot_in_flight: None,
        }
    }
}

/// What the leader should send a follower next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    /// AppendEntries from `next_index` (possibly empty, as a heartbeat).
    Entries { prev_log_index: LogIndex },
    /// The follower needs entries that were compacted away.
    Snapshot,
    /// Nothing to send right now.
    Wait,
}

/// Per-follower replication state of a leader.
#[derive(Debug, Clone, Default)]
pub struct Replication {
    peers: BTreeMap<NodeId, PeerProgress>,
}

impl Replication {
    pub fn new(peers: impl IntoIterator<Item = NodeId>, last_log_index: LogIndex, now: u64) -> Self {
        let peers = peers.into_iter().map(|id| (id, PeerProgress::new(last_log_index, now))).collect();
        Self { peers }
    }

    /// Track exactly `peers`: new ones start probing, removed ones are dropped.
    pub fn sync_peers(&mut self, peers: &BTreeSet<NodeId>, last_log_index: LogIndex, now: u64) {
        self.peers.retain(|id, _| peers.contains(id));
        for id in peers {
            self.peers.entry(*id).or_insert_with(|| PeerProgress::new(last_log_index, now));
        }
    }

    pub fn peers(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.peers.keys().copied()
    }

    pub fn progress(&self, peer: NodeId) -> Option<&PeerProgress> {
        self.peers.get(&peer)
    }

    /// Decide what to send `peer`. `heartbeat` forces a message even when
    /// there is nothing new, to keep the follower's election timer quiet.
    pub fn plan(&self, peer: NodeId, log: &RaftLog, heartbeat: bool, now: u64, resend_after: u64) -> Plan {
        let Some(progress) = self.peers.get(&peer) else {
            return Plan::Wait;
        };
        if progress.next_index <= log.purged().0 {
            return match progress.snapshot_in_flight {
                Some((_, sent)) if now.saturating_sub(sent) < resend_after => Plan::Wait,
                _ => Plan::Snapshot,
            };
        }
        let has_new = progress.next_index <= log.last_index();
        if has_new || heartbeat {
            Plan::Entries { prev_log_index: progress.next_index - 1 }
        } else {
            Plan::Wait
        }
    }

    /// Record that entries up to `last_sent` went out to `peer`.
    pub fn on_sent(&mut self, peer: NodeId, last_sent: LogIndex) {
        if let Some(progress) = self.peers.get_mut(&peer) {
            if progress.mode == ProgressMode::Replicate {
                progress.next_index = progress.next_index.max(last_sent + 1);
            }
        }
    }

    pub fn on_snapshot_sent(&mut self, peer: NodeId, index: LogIndex, now: u64) {
        if let Some(progress) = self.peers.get_mut(&peer) {
            progress.snapshot_in_flight = Some((index, now));
        }
    }

    /// Follower confirmed it matches us up to `matched`. Returns true if the
    /// match index moved. Late or duplicated acknowledgements never move it back.
    pub fn on_success(&mut self, peer: NodeId, matched: LogIndex, now: u64) -> bool {
        self.touch(peer, now);
        let Some(progress) = self.peers.get_mut(&peer) else {
            return false;
        };
        progress.mode = ProgressMode::Replicate;
        progress.next_index = progress.next_index.max(matched + 1);
        if matched > progress.match_index {
            progress.match_index = matched;
            return true;
        }
        false
    }

    /// Follower rejected the consistency check. Back `next_index` off to the
    /// reported conflict (or one step), never below what is known to match.
    pub fn on_reject(&mut self, peer: NodeId, last_log_index: LogIndex, conflict_index: Option<LogIndex>, now: u64) {
        self.touch(peer, now);
        let Some(progress) = self.peers.get_mut(&peer) else {
            return;
        };
        progress.mode = ProgressMode::Probe;
        let hint = conflict_index.unwrap_or(last_log_index + 1);
        let backed_off = progress.next_index.saturating_sub(1).min(hint);
        progress.next_index = backed_off.max(progress.match_index + 1).max(1);
    }

    /// InstallSnapshot answered. On success the follower now holds the
    /// snapshot index; on failure the next heartbeat retries.
    pub fn on_snapshot_response(&mut self, peer: NodeId, success: bool, now: u64) -> bool {
        self.touch(peer, now);
        let Some(progress) = self.peers.get_mut(&peer) else {
            return false;
        };
        let Some((index, _)) = progress.snapshot_in_flight.take() else {
            return false;
        };
        if !success {
            return false;
        }
        progress.mode = ProgressMode::Probe;
        progress.next_index = progress.next_index.max(index + 1);
        if index > progress.match_index {
            progress.match_index = index;
            return true;
        }
        false
    }

    /// Any response, including a rejection, proves the peer is reachable.
    fn touch(&mut self, peer: NodeId, now: u64) {
        if let Some(progress) = self.peers.get_mut(&peer) {
            progress.last_ack = now;
        }
    }

    pub fn match_index(&self, peer: NodeId) -> LogIndex {
        self.peers.get(&peer).map_or(0, |p| p.match_index)
    }

    /// Highest index stored on a quorum, counting the leader's own log.
    /// The caller must still check the entry's term before committing.
    pub fn quorum_index(&self, membership: &Membership, leader: NodeId, leader_last: LogIndex) -> LogIndex {
        membership.commit_candidate(|id| if id == leader { leader_last } else { self.match_index(id) })
    }

    /// True if a quorum of voters answered within `window` ms before `now`.
    pub fn has_recent_quorum(&self, membership: &Membership, leader: NodeId, now: u64, window: u64) -> bool {
        let mut active: BTreeSet<NodeId> = self
            .peers
            .iter()
            .filter(|(_, p)| now.saturating_sub(p.last_ack) <= window)
            .map(|(id, _)| *id)
            .collect();
        active.insert(leader);
        membership.has_vote_quorum(&active)
    }
}

/// Outcome of a follower's log-consistency check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Consistency {
    Matches,
    Mismatch { conflict_index: LogIndex, reason: String },
}

/// Follower side: does our log contain the leader's `(prev_log_index, prev_log_term)`?
pub fn check_consistency(
    log: &RaftLog,
    prev_log_index: LogIndex,
    prev_log_term: Term,
) -> Result<Consistency, StorageError> {
    if prev_log_index > log.last_index() {
        return Ok(Consistency::Mismatch {
            conflict_index: log.last_index() + 1,
            reason: format!("log too short: last index {} < prev {}", log.last_index(), prev_log_index),
        });
    }
    // Anything compacted away was committed, and committed entries match every leader.
    if prev_log_index < log.purged().0 {
        return Ok(Consistency::Matches);
    }
    match log.term_at(prev_log_index)? {
        Some(term) if term == prev_log_term => Ok(Consistency::Matches),
        Some(term) => Ok(Consistency::Mismatch {
            conflict_index: log.first_index_of_term(prev_log_index, term)?,
            reason: format!("term mismatch at {prev_log_index}: have {term}, leader has {prev_log_term}"),
        }),
        None => Ok(Consistency::Mismatch {
            conflict_index: log.first_index(),
            reason: format!("entry {prev_log_index} unavailable"),
        }),
    }
}
