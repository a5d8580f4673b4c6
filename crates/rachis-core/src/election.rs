//! # election
//!
//! why: decide who may lead a term, and when a node should try
//! relations: driven by node.rs; quorum counting delegated to topology.rs Membership
//! what: randomized ElectionTimer, Campaign vote tally, vote and pre-vote granting rules

use std::collections::BTreeSet;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::log::RaftLog;
use crate::storage::Vote;
use crate::topology::Membership;
use crate::{LogIndex, NodeId, Term};

/// Randomized election timeout. Every reset draws a fresh timeout so that
/// nodes which timed out together rarely do so again.
#[derive(Debug)]
pub struct ElectionTimer {
    rng: StdRng,
    min: u64,
    max: u64,
    timeout: u64,
    elapsed: u64,
}

impl ElectionTimer {
    pub fn new(min: u64, max: u64, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut timer = Self { rng, min, max, timeout: max, elapsed: 0 };
        timer.reset();
        timer
    }

    pub fn reset(&mut self) {
        self.elapsed = 0;
        self.timeout = self.rng.gen_range(self.min..=self.max);
    }

    /// Advance by `ms`; true once the timeout has elapsed.
    pub fn advance(&mut self, ms: u64) -> bool {
        self.elapsed = self.elapsed.saturating_add(ms);
        self.elapsed >= self.timeout
    }

    /// Time since the last reset.
    pub fn elapsed(&self) -> u64 {
        self.elapsed
    }

    pub fn timeout(&self) -> u64 {
        self.timeout
    }
}

/// Vote tally for one campaign (a pre-vote round or a real election).
#[derive(Debug, Clone)]
pub struct Campaign {
    pub term: Term,
    granted: BTreeSet<NodeId>,
    rejected: BTreeSet<NodeId>,
}

impl Campaign {
    /// A campaign already holding the candidate's own vote.
    pub fn new(candidate: NodeId, term: Term) -> Self {
        Self {
            term,
            granted: BTreeSet::from([candidate]),
            rejected: BTreeSet::new(),
        }
    }

    /// Record a voter's answer. Repeated answers from one voter count once,
    /// and the first answer wins.
    pub fn record(&mut self, voter: NodeId, granted: bool) {
        if self.granted.contains(&voter) || self.rejected.contains(&voter) {
            return;
        }
        if granted {
            self.granted.insert(voter);
        } else {
            self.rejected.insert(voter);
        }
    }

    pub fn granted(&self) -> &BTreeSet<NodeId> {
        &self.granted
    }

    pub fn is_won(&self, membership: &Membership) -> bool {
        membership.has_vote_quorum(&self.granted)
    }
}

/// Whether to grant a vote to `candidate` for `term`.
///
/// The caller has already adopted `term` if it was newer, so `vote.term`
/// equals `term` for any request that is not stale.
pub fn should_grant_vote(
    vote: &Vote,
    log: &RaftLog,
    term: Term,
    candidate: NodeId,
    last_log_index: LogIndex,
    last_log_term: Term,
) -> bool {
    if term < vote.term {
        return false;
    }
    if vote.voted_for.is_some_and(|v| v != candidate) {
        return false;
    }
    log.is_up_to_date(last_log_index, last_log_term)
}

/// Whether to grant a pre-vote for the prospective `term`.
///
/// A node that still hears from a live leader refuses, which keeps a
/// rejoining node from disrupting a healthy cluster.
pub fn should_grant_pre_vote(
    current_term: Term,
    log: &RaftLog,
    leader_alive: bool,
    term: Term,
    last_log_index: LogIndex,
    last_log_term: Term,
) -> bool {
    term > current_term && !leader_alive && log.is_up_to_date(last_log_index, last_log_term)
}
