//! # cluster tests
//!
//! why: exercise elections, replication and membership across whole clusters under faults
//! relations: drives several rachis-core RaftNodes through an in-test message router
//! what: deterministic Cluster harness, safety checks after every step, partition/crash scenarios

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use rachis_core::{
    Envelope, KvCommand, KvStateMachine, LogIndex, LogStore, MemoryLogStore, MemorySnapshotStore, NodeId,
    NodeState, ProposeError, RaftConfig, RaftNode, SnapshotStore, Term, Topology,
};

/// Upper bound on ticks any scenario may wait for a condition.
const TICK_LIMIT: usize = 3_000;

/// Upper bound on messages delivered between two ticks.
const DELIVERY_LIMIT: usize = 200_000;

/// Route engine logs to the test output; `RUST_LOG=rachis_core=debug` to see them.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

type Stores = (Box<dyn LogStore>, Box<dyn SnapshotStore>);

/// An in-process cluster with zero-latency links that can be cut, and
/// nodes that can be crashed and restarted from their stores.
///
/// Every delivered message is followed by safety checks: at most one
/// leader per term, commit indexes never move back on a live node, and
/// all nodes apply the same entry at each index.
struct Cluster {
    config: RaftConfig,
    bootstrap: Topology,
    nodes: BTreeMap<NodeId, RaftNode<KvStateMachine>>,
    crashed: BTreeMap<NodeId, Stores>,
    cut: BTreeSet<(NodeId, NodeId)>,
    queue: VecDeque<Envelope>,
    drop_every: Option<usize>,
    delivered: usize,
    leaders: BTreeMap<Term, NodeId>,
    commits: BTreeMap<NodeId, LogIndex>,
    applied: BTreeMap<LogIndex, Term>,
}

impl Cluster {
    fn new(size: u64) -> Self {
        Self::with_config(size, RaftConfig { rng_seed: Some(11), ..RaftConfig::default() })
    }

    fn with_config(size: u64, config: RaftConfig) -> Self {
        init_tracing();
        let bootstrap = Topology::new(1..=size);
        let mut cluster = Self {
            config,
            bootstrap,
            nodes: BTreeMap::new(),
            crashed: BTreeMap::new(),
            cut: BTreeSet::new(),
            queue: VecDeque::new(),
            drop_every: None,
            delivered: 0,
            leaders: BTreeMap::new(),
            commits: BTreeMap::new(),
            applied: BTreeMap::new(),
        };
        for id in 1..=size {
            cluster.start(id, Box::new(MemoryLogStore::new()), Box::new(MemorySnapshotStore::new()));
        }
        cluster
    }

    /// Start a node that is not part of the bootstrap voters; it stays
    /// passive until a topology change names it.
    fn add_passive(&mut self, id: NodeId) {
        self.start(id, Box::new(MemoryLogStore::new()), Box::new(MemorySnapshotStore::new()));
    }

    fn start(&mut self, id: NodeId, log: Box<dyn LogStore>, snapshots: Box<dyn SnapshotStore>) {
        let node =
            RaftNode::new(id, self.config.clone(), self.bootstrap.clone(), log, snapshots, KvStateMachine::new())
                .unwrap();
        self.commits.insert(id, node.commit_index());
        self.nodes.insert(id, node);
    }

    fn node(&self, id: NodeId) -> &RaftNode<KvStateMachine> {
        &self.nodes[&id]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut RaftNode<KvStateMachine> {
        self.nodes.get_mut(&id).unwrap()
    }

    fn ids(&self) -> Vec<NodeId> {
        self.nodes.keys().chain(self.crashed.keys()).copied().collect()
    }

    // -- safety checks --

    fn observe(&mut self, id: NodeId) {
        let node = self.nodes.get_mut(&id).unwrap();
        self.queue.extend(node.take_messages());

        for applied in node.take_applied() {
            let term = *self.applied.entry(applied.index).or_insert(applied.term);
            assert_eq!(term, applied.term, "node {id} applied a different entry at {}", applied.index);
        }

        let commit = node.commit_index();
        let previous = self.commits.insert(id, commit).unwrap_or(0);
        assert!(commit >= previous, "node {id} commit index moved back from {previous} to {commit}");

        if node.is_leader() {
            let term = node.current_term();
            let leader = *self.leaders.entry(term).or_insert(id);
            assert_eq!(leader, id, "two leaders in term {term}");
        }
    }

    // -- driving --

    fn deliver(&mut self) {
        let mut budget = DELIVERY_LIMIT;
        while let Some(envelope) = self.queue.pop_front() {
            budget = budget.checked_sub(1).expect("message storm");
            self.delivered += 1;
            if self.drop_every.is_some_and(|n| self.delivered % n == 0) {
                continue;
            }
            if self.cut.contains(&(envelope.from, envelope.to)) {
                continue;
            }
            let Some(node) = self.nodes.get_mut(&envelope.to) else {
                continue;
            };
            node.step(envelope.from, envelope.message).unwrap();
            self.observe(envelope.to);
        }
    }

    fn tick(&mut self) {
        let ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        for id in ids {
            self.node_mut(id).tick().unwrap();
            self.observe(id);
        }
        self.deliver();
    }

    fn ticks(&mut self, n: usize) {
        for _ in 0..n {
            self.tick();
        }
    }

    /// Ticks until `done` holds. Panics after `TICK_LIMIT` ticks.
    fn run_until(&mut self, what: &str, done: impl Fn(&Cluster) -> bool) -> usize {
        for ticks in 0..TICK_LIMIT {
            if done(self) {
                return ticks;
            }
            self.tick();
        }
        assert!(done(self), "gave up waiting for {what}");
        TICK_LIMIT
    }

    /// The leader of the newest term among live nodes, if any.
    fn leader(&self) -> Option<NodeId> {
        self.nodes.values().filter(|n| n.is_leader()).max_by_key(|n| n.current_term()).map(|n| n.id())
    }

    /// A leader that every node it can reach agrees on.
    fn wait_for_leader(&mut self) -> NodeId {
        self.run_until("a recognized leader", |c| {
            c.leader().is_some_and(|leader| {
                let term = c.node(leader).current_term();
                c.nodes
                    .values()
                    .filter(|n| c.linked(leader, n.id()))
                    .all(|n| n.leader_id() == Some(leader) && n.current_term() == term)
            })
        });
        self.leader().unwrap()
    }

    fn linked(&self, a: NodeId, b: NodeId) -> bool {
        a == b || (!self.cut.contains(&(a, b)) && !self.cut.contains(&(b, a)))
    }

    fn propose(&mut self, key: &str, value: &str) -> LogIndex {
        let leader = self.leader().expect("no leader");
        self.propose_on(leader, key, value).unwrap()
    }

    fn propose_on(&mut self, id: NodeId, key: &str, value: &str) -> Result<LogIndex, ProposeError> {
        let result = self.node_mut(id).propose(KvCommand::set(key, value).encode());
        self.observe(id);
        self.deliver();
        result
    }

    fn change_topology(&mut self, topology: Topology) -> Result<LogIndex, ProposeError> {
        let leader = self.leader().expect("no leader");
        let result = self.node_mut(leader).propose_topology(topology);
        self.observe(leader);
        self.deliver();
        result
    }

    fn wait_applied(&mut self, ids: &[NodeId], index: LogIndex) {
        self.run_until("entries to be applied", |c| ids.iter().all(|id| c.node(*id).last_applied() >= index));
    }

    // -- faults --

    fn isolate(&mut self, id: NodeId) {
        for other in self.ids() {
            if other != id {
                self.cut.insert((id, other));
                self.cut.insert((other, id));
            }
        }
    }

    fn partition(&mut self, side: &[NodeId]) {
        for a in side {
            for b in self.ids().into_iter().filter(|b| !side.contains(b)) {
                self.cut.insert((*a, b));
                self.cut.insert((b, *a));
            }
        }
    }

    fn heal(&mut self) {
        self.cut.clear();
    }

    fn crash(&mut self, id: NodeId) {
        let node = self.nodes.remove(&id).unwrap();
        self.commits.remove(&id);
        self.crashed.insert(id, node.into_storage());
    }

    fn restart(&mut self, id: NodeId) {
        let (log, snapshots) = self.crashed.remove(&id).unwrap();
        self.start(id, log, snapshots);
    }

    fn logs_match(&self, ids: &[NodeId]) -> bool {
        let reference = self.node(ids[0]).log_entries().unwrap();
        ids[1..].iter().all(|id| self.node(*id).log_entries().unwrap() == reference)
    }

    /// Wait until the given nodes hold identical logs.
    fn wait_logs_match(&mut self, ids: &[NodeId]) {
        self.run_until("logs to converge", |c| c.logs_match(ids));
    }
}

fn ticks_per_heartbeat(config: &RaftConfig) -> usize {
    (config.heartbeat_interval / config.tick_ms) as usize
}

fn ticks_per_election(config: &RaftConfig) -> usize {
    (config.election_timeout_max / config.tick_ms) as usize
}

// =============================================================================
// SECTION 1: ELECTIONS
// =============================================================================

mod elections {
    use super::*;

    #[test]
    fn three_nodes_elect_exactly_one_leader() {
        let mut cluster = Cluster::new(3);
        let leader = cluster.wait_for_leader();
        let leaders = cluster.nodes.values().filter(|n| n.is_leader()).count();
        assert_eq!(leaders, 1);
        for id in 1..=3 {
            assert_eq!(cluster.node(id).leader_id(), Some(leader));
        }
    }

    #[test]
    fn leadership_is_stable_without_faults() {
        let mut cluster = Cluster::new(5);
        let leader = cluster.wait_for_leader();
        let term = cluster.node(leader).current_term();
        cluster.ticks(500);
        assert_eq!(cluster.leader(), Some(leader));
        assert_eq!(cluster.node(leader).current_term(), term);
    }

    #[test]
    fn new_leader_after_leader_crash() {
        let mut cluster = Cluster::new(3);
        let old = cluster.wait_for_leader();
        let old_term = cluster.node(old).current_term();
        cluster.crash(old);
        let new = cluster.wait_for_leader();
        assert_ne!(new, old);
        assert!(cluster.node(new).current_term() > old_term);
    }

    #[test]
    fn no_leader_without_a_quorum() {
        let mut cluster = Cluster::new(3);
        let leader = cluster.wait_for_leader();
        let followers: Vec<_> = (1..=3).filter(|id| *id != leader).collect();
        cluster.crash(followers[0]);
        cluster.crash(followers[1]);
        cluster.ticks(ticks_per_election(&cluster.config) * 10);
        // check-quorum removes the stranded leader and nobody can replace it
        assert_eq!(cluster.leader(), None);
    }

    #[test]
    fn stale_candidate_cannot_win() {
        let mut cluster = Cluster::new(3);
        let leader = cluster.wait_for_leader();
        let lagging = (1..=3).find(|id| *id != leader).unwrap();
        cluster.isolate(lagging);
        let index = cluster.propose("k", "v");
        let others: Vec<_> = (1..=3).filter(|id| *id != lagging).collect();
        cluster.wait_applied(&others, index);

        // the old leader goes away; only the up-to-date survivor may lead
        cluster.crash(leader);
        cluster.heal();
        let new = cluster.wait_for_leader();
        assert_ne!(new, lagging);
        assert!(cluster.node(new).last_log_index() >= index);
    }

    #[test]
    fn pre_vote_keeps_rejoining_node_from_raising_terms() {
        let config = RaftConfig { pre_vote: true, rng_seed: Some(5), ..RaftConfig::default() };
        let mut cluster = Cluster::with_config(3, config);
        let leader = cluster.wait_for_leader();
        let term = cluster.node(leader).current_term();
        let wanderer = (1..=3).find(|id| *id != leader).unwrap();

        cluster.isolate(wanderer);
        cluster.ticks(ticks_per_election(&cluster.config) * 5);
        // pre-votes never succeed alone, so the term never moves
        assert_eq!(cluster.node(wanderer).current_term(), term);

        cluster.heal();
        cluster.ticks(ticks_per_election(&cluster.config) * 2);
        assert_eq!(cluster.leader(), Some(leader));
        assert_eq!(cluster.node(leader).current_term(), term);
    }

    #[test]
    fn without_pre_vote_rejoining_node_disrupts_the_term() {
        let config = RaftConfig { pre_vote: false, rng_seed: Some(5), ..RaftConfig::default() };
        let mut cluster = Cluster::with_config(3, config);
        let leader = cluster.wait_for_leader();
        let term = cluster.node(leader).current_term();
        let wanderer = (1..=3).find(|id| *id != leader).unwrap();

        cluster.isolate(wanderer);
        cluster.ticks(ticks_per_election(&cluster.config) * 5);
        assert!(cluster.node(wanderer).current_term() > term);

        cluster.heal();
        let leader = cluster.wait_for_leader();
        assert!(cluster.node(leader).current_term() > term);
    }

    #[test]
    fn leadership_transfer_hands_over_to_target() {
        let mut cluster = Cluster::new(3);
        let leader = cluster.wait_for_leader();
        let index = cluster.propose("a", "1");
        cluster.wait_applied(&[1, 2, 3], index);

        let target = (1..=3).find(|id| *id != leader).unwrap();
        cluster.node_mut(leader).transfer_leadership(target).unwrap();
        cluster.observe(leader);
        cluster.deliver();
        cluster.run_until("transfer to complete", |c| c.leader() == Some(target));
        assert!(!cluster.node(leader).is_leader());
    }
}

// =============================================================================
// SECTION 2: REPLICATION
// =============================================================================

mod replication {
    use super::*;

    #[test]
    fn basic_replication() {
        // three nodes commit and apply in order on every node
        let mut cluster = Cluster::new(3);
        let leader = cluster.wait_for_leader();
        let a = cluster.propose("a", "1");
        let b = cluster.propose("b", "2");
        assert!(b > a);

        // the leader commits as soon as a follower stores the entry
        assert!(cluster.node(leader).commit_index() >= b);
        // followers learn it within one heartbeat
        let budget = ticks_per_heartbeat(&cluster.config);
        let waited = cluster.run_until("followers to apply", |c| (1..=3).all(|id| c.node(id).last_applied() >= b));
        assert!(waited <= budget, "took {waited} ticks");
        for id in 1..=3 {
            assert_eq!(cluster.node(id).state_machine().get("a"), Some("1"));
            assert_eq!(cluster.node(id).state_machine().get("b"), Some("2"));
        }
        cluster.wait_logs_match(&[1, 2, 3]);
    }

    #[test]
    fn lagging_follower_catches_up() {
        let mut cluster = Cluster::new(3);
        let leader = cluster.wait_for_leader();
        let lagging = (1..=3).find(|id| *id != leader).unwrap();
        cluster.isolate(lagging);
        let mut last = 0;
        for i in 0..20 {
            last = cluster.propose(&format!("k{i}"), "v");
        }
        assert!(cluster.node(lagging).last_log_index() < last);

        cluster.heal();
        cluster.wait_applied(&[lagging], last);
        cluster.wait_logs_match(&[1, 2, 3]);
    }

    #[test]
    fn progress_despite_message_loss() {
        let mut cluster = Cluster::new(3);
        cluster.wait_for_leader();
        cluster.drop_every = Some(3);
        let mut last = 0;
        let mut proposed = 0;
        while proposed < 10 {
            cluster.tick();
            let Some(leader) = cluster.leader() else {
                continue;
            };
            if let Ok(index) = cluster.propose_on(leader, &format!("k{proposed}"), "v") {
                last = index;
                proposed += 1;
            }
        }
        assert!(last > 0);
        // entries proposed under loss may be overwritten; a final one must commit
        cluster.drop_every = None;
        let leader = cluster.wait_for_leader();
        let last = cluster.propose_on(leader, "final", "v").unwrap();
        cluster.wait_applied(&[1, 2, 3], last);
        cluster.wait_logs_match(&[1, 2, 3]);
    }

    #[test]
    fn divergent_uncommitted_tail_is_replaced() {
        // a deposed leader keeps appending to its own log, then rejoins
        let mut cluster = Cluster::new(3);
        let old = cluster.wait_for_leader();
        cluster.isolate(old);
        let mut stranded = Vec::new();
        for i in 0..3 {
            stranded.push(cluster.propose_on(old, &format!("lost{i}"), "x").unwrap());
        }
        assert!(cluster.node(old).commit_index() < stranded[0]);

        let others: Vec<_> = (1..=3).filter(|id| *id != old).collect();
        cluster.run_until("a majority leader", |c| others.iter().any(|id| c.node(*id).is_leader()));
        let new = *others.iter().find(|id| cluster.node(**id).is_leader()).unwrap();
        let x = cluster.propose_on(new, "kept1", "y").unwrap();
        let y = cluster.propose_on(new, "kept2", "y").unwrap();
        cluster.wait_applied(&others, y);
        assert!(x < y);

        cluster.heal();
        cluster.wait_applied(&[old], y);
        assert!(!cluster.node(old).is_leader());
        cluster.wait_logs_match(&[1, 2, 3]);
        for id in 1..=3 {
            let kv = cluster.node(id).state_machine();
            assert_eq!(kv.get("lost0"), None);
            assert_eq!(kv.get("kept2"), Some("y"));
        }
    }

    #[test]
    fn entries_from_older_terms_commit_through_current_term() {
        let mut cluster = Cluster::new(3);
        let first = cluster.wait_for_leader();
        let index = cluster.propose("a", "1");
        cluster.wait_applied(&[1, 2, 3], index);

        // a new leader commits its no-op and everything before it
        cluster.crash(first);
        let second = cluster.wait_for_leader();
        let term = cluster.node(second).current_term();
        let noop = cluster.node(second).entry(cluster.node(second).last_log_index()).unwrap().unwrap();
        assert_eq!(noop.term, term);
        cluster.run_until("no-op commit", |c| c.node(second).commit_index() >= noop.index);
    }
}

// =============================================================================
// SECTION 3: PARTITIONS
// =============================================================================

mod partitions {
    use super::*;

    #[test]
    fn minority_leader_is_replaced_and_steps_down_on_heal() {
        // five nodes; the leader and one follower split from the other three
        let config = RaftConfig { check_quorum: false, rng_seed: Some(3), ..RaftConfig::default() };
        let mut cluster = Cluster::with_config(5, config);
        let old = cluster.wait_for_leader();
        let old_term = cluster.node(old).current_term();
        let buddy = (1..=5).find(|id| *id != old).unwrap();
        let majority: Vec<_> = (1..=5).filter(|id| *id != old && *id != buddy).collect();
        cluster.partition(&[old, buddy]);

        // the minority leader cannot commit
        let stuck = cluster.propose_on(old, "minority", "x").unwrap();
        cluster.ticks(ticks_per_election(&cluster.config));
        assert!(cluster.node(old).commit_index() < stuck);

        let limit = ticks_per_election(&cluster.config) * 10;
        let waited = cluster.run_until("majority leader", |c| majority.iter().any(|id| c.node(*id).is_leader()));
        assert!(waited <= limit);
        let new = *majority.iter().find(|id| cluster.node(**id).is_leader()).unwrap();
        let new_term = cluster.node(new).current_term();
        assert!(new_term > old_term);
        let committed = cluster.propose_on(new, "majority", "y").unwrap();
        cluster.wait_applied(&majority, committed);

        // without check-quorum the old leader only learns on contact
        assert!(cluster.node(old).is_leader());
        cluster.heal();
        cluster.run_until("old leader to step down", |c| !c.node(old).is_leader());
        cluster.wait_applied(&[old, buddy], committed);
        assert!(cluster.node(old).current_term() >= new_term);
        assert_eq!(cluster.node(old).state_machine().get("minority"), None);
        cluster.wait_logs_match(&[1, 2, 3, 4, 5]);
    }

    #[test]
    fn check_quorum_deposes_isolated_leader() {
        let mut cluster = Cluster::new(3);
        let leader = cluster.wait_for_leader();
        cluster.isolate(leader);
        let window = ticks_per_election(&cluster.config);
        cluster.ticks(window * 3);
        assert!(!cluster.node(leader).is_leader());
        assert!(matches!(
            cluster.propose_on(leader, "k", "v"),
            Err(ProposeError::NotLeader { .. })
        ));
    }

    #[test]
    fn leader_keeps_majority_side_of_a_partition() {
        // five nodes; the leader loses two followers but keeps two
        let mut cluster = Cluster::new(5);
        let leader = cluster.wait_for_leader();
        let term = cluster.node(leader).current_term();
        let followers: Vec<_> = (1..=5).filter(|id| *id != leader).collect();
        cluster.partition(&followers[..2]);

        let index = cluster.propose("k", "v");
        let side: Vec<_> = [leader, followers[2], followers[3]].to_vec();
        cluster.wait_applied(&side, index);
        cluster.ticks(ticks_per_election(&cluster.config) * 3);
        assert!(cluster.node(leader).is_leader());
        assert_eq!(cluster.node(leader).current_term(), term);
    }
}

// =============================================================================
// SECTION 4: TOPOLOGY CHANGES
// =============================================================================

mod topology {
    use super::*;

    fn ready_cluster(size: u64) -> (Cluster, NodeId) {
        let mut cluster = Cluster::new(size);
        let leader = cluster.wait_for_leader();
        let noop = cluster.node(leader).last_log_index();
        cluster.wait_applied(&[leader], noop);
        (cluster, leader)
    }

    #[test]
    fn adding_a_voter_changes_quorum_only_once_committed() {
        let (mut cluster, leader) = ready_cluster(3);
        cluster.add_passive(4);
        assert_eq!(cluster.node(leader).quorum_size(), 2);

        // propose without delivering, so nothing can commit yet
        let target = Topology::new([1, 2, 3, 4]);
        let index = cluster.node_mut(leader).propose_topology(target.clone()).unwrap();
        assert_eq!(cluster.node(leader).quorum_size(), 2);
        assert!(cluster.node(leader).commit_index() < index);

        cluster.observe(leader);
        cluster.deliver();
        cluster.wait_applied(&[1, 2, 3, 4], index);
        for id in 1..=4 {
            assert_eq!(cluster.node(id).quorum_size(), 3);
            assert_eq!(cluster.node(id).topology(), &target);
            assert!(cluster.node(id).pending_topology().is_none());
        }
        cluster.wait_logs_match(&[1, 2, 3, 4]);

        // the new voter now takes part in commits
        let next = cluster.propose("after", "add");
        cluster.wait_applied(&[4], next);
    }

    #[test]
    fn second_change_waits_for_first() {
        let (mut cluster, leader) = ready_cluster(3);
        cluster.add_passive(4);
        cluster.add_passive(5);
        let first = cluster.node_mut(leader).propose_topology(Topology::new([1, 2, 3, 4])).unwrap();
        let second = cluster.node_mut(leader).propose_topology(Topology::new([1, 2, 3, 4, 5]));
        assert!(matches!(second, Err(ProposeError::TopologyChangeInProgress)));

        cluster.observe(leader);
        cluster.deliver();
        cluster.wait_applied(&[leader], first);
        cluster.change_topology(Topology::new([1, 2, 3, 4, 5])).unwrap();
        cluster.run_until("five voters", |c| {
            (1..=5).all(|id| c.node(id).topology().voters.len() == 5 && c.node(id).quorum_size() == 3)
        });
    }

    #[test]
    fn change_needs_majority_of_both_topologies() {
        // growing 3 -> 5 with one old voter cut off: the old topology has a
        // majority (2 of 3) but the new one does not (2 of 5)
        let (mut cluster, leader) = ready_cluster(3);
        cluster.add_passive(4);
        cluster.add_passive(5);
        cluster.isolate(4);
        cluster.isolate(5);
        let follower = (1..=3).find(|id| *id != leader).unwrap();
        cluster.isolate(follower);

        let index = cluster.change_topology(Topology::new([1, 2, 3, 4, 5])).unwrap();
        cluster.ticks(ticks_per_heartbeat(&cluster.config) * 3);
        assert!(cluster.node(leader).commit_index() < index);
        assert!(cluster.node(leader).pending_topology().is_some());

        cluster.heal();
        cluster.wait_applied(&[1, 2, 3, 4, 5], index);
        assert_eq!(cluster.node(leader).topology().voters.len(), 5);
    }

    #[test]
    fn removed_leader_steps_down() {
        let (mut cluster, leader) = ready_cluster(3);
        let remaining: Vec<_> = (1..=3).filter(|id| *id != leader).collect();
        let index = cluster.change_topology(Topology::new(remaining.iter().copied())).unwrap();
        cluster.run_until("removal to commit", |c| remaining.iter().all(|id| c.node(*id).commit_index() >= index));
        assert!(!cluster.node(leader).is_leader());

        cluster.isolate(leader);
        cluster.run_until("a remaining node to lead", |c| remaining.iter().any(|id| c.node(*id).is_leader()));
        let new = *remaining.iter().find(|id| cluster.node(**id).is_leader()).unwrap();
        assert_eq!(cluster.node(new).quorum_size(), 2);
        let next = cluster.propose_on(new, "k", "v").unwrap();
        cluster.wait_applied(&remaining, next);
    }

    #[test]
    fn removed_node_cannot_disrupt_the_cluster() {
        // the leader stops replicating to a removed node, so it never learns
        // that the removal committed; its pre-votes must fail against a live leader
        let config = RaftConfig { pre_vote: true, rng_seed: Some(17), ..RaftConfig::default() };
        let mut cluster = Cluster::with_config(3, config);
        let leader = cluster.wait_for_leader();
        let noop = cluster.node(leader).last_log_index();
        cluster.wait_applied(&[leader], noop);
        let term = cluster.node(leader).current_term();

        let removed = (1..=3).find(|id| *id != leader).unwrap();
        let remaining: Vec<_> = (1..=3).filter(|id| *id != removed).collect();
        let index = cluster.change_topology(Topology::new(remaining.iter().copied())).unwrap();
        cluster.wait_applied(&remaining, index);
        assert!(cluster.node(leader).peer_progress(removed).is_none());

        cluster.ticks(ticks_per_election(&cluster.config) * 5);
        assert_eq!(cluster.leader(), Some(leader));
        assert_eq!(cluster.node(leader).current_term(), term);
        assert_ne!(cluster.node(removed).state(), NodeState::Leader);
        assert_eq!(cluster.node(removed).current_term(), term);
    }

    #[test]
    fn watchers_replicate_without_voting() {
        let (mut cluster, leader) = ready_cluster(3);
        cluster.add_passive(4);
        let index = cluster.change_topology(Topology::with_watchers([1, 2, 3], [4])).unwrap();
        cluster.wait_applied(&[1, 2, 3, 4], index);
        assert_eq!(cluster.node(leader).quorum_size(), 2);

        // commits proceed without the watcher
        cluster.isolate(4);
        let next = cluster.propose("w", "1");
        let voters = [1, 2, 3];
        cluster.wait_applied(&voters, next);
        assert!(cluster.node(4).last_applied() < next);

        cluster.heal();
        cluster.wait_applied(&[4], next);
        assert_eq!(cluster.node(4).state_machine().get("w"), Some("1"));
        // and a watcher never campaigns
        assert_ne!(cluster.node(4).state(), NodeState::Candidate);
    }
}

// =============================================================================
// SECTION 5: SNAPSHOTS AND RESTARTS
// =============================================================================

mod snapshots {
    use super::*;

    fn compacting_config() -> RaftConfig {
        RaftConfig { snapshot_threshold: 10, rng_seed: Some(21), ..RaftConfig::default() }
    }

    #[test]
    fn far_behind_follower_receives_snapshot() {
        let mut cluster = Cluster::with_config(3, compacting_config());
        let leader = cluster.wait_for_leader();
        let lagging = (1..=3).find(|id| *id != leader).unwrap();
        cluster.isolate(lagging);
        let mut last = 0;
        for i in 0..35 {
            last = cluster.propose(&format!("k{i}"), &i.to_string());
        }
        assert!(cluster.node(leader).snapshot_index() > cluster.node(lagging).last_log_index());

        cluster.heal();
        cluster.wait_applied(&[lagging], last);
        let node = cluster.node(lagging);
        assert!(node.snapshot_index() > 0);
        assert_eq!(node.state_machine().get("k0"), Some("0"));
        assert_eq!(node.state_machine().get("k34"), Some("34"));
        assert_eq!(node.state_machine().len(), 35);
    }

    #[test]
    fn restart_recovers_from_snapshot_and_log() {
        let mut cluster = Cluster::with_config(3, compacting_config());
        cluster.wait_for_leader();
        let mut last = 0;
        for i in 0..25 {
            last = cluster.propose(&format!("k{i}"), "v");
        }
        cluster.wait_applied(&[1, 2, 3], last);
        let victim = (1..=3).find(|id| Some(*id) != cluster.leader()).unwrap();
        assert!(cluster.node(victim).snapshot_index() > 0);

        cluster.crash(victim);
        cluster.restart(victim);
        let restarted = cluster.node(victim);
        assert!(restarted.last_applied() >= restarted.snapshot_index());
        assert_eq!(restarted.last_log_index(), last);

        let next = cluster.propose("after", "restart");
        cluster.wait_applied(&[victim], next);
        assert_eq!(cluster.node(victim).state_machine().len(), 26);
    }

    #[test]
    fn whole_cluster_restart_keeps_committed_entries() {
        let mut cluster = Cluster::new(3);
        cluster.wait_for_leader();
        let index = cluster.propose("durable", "yes");
        cluster.wait_applied(&[1, 2, 3], index);

        for id in 1..=3 {
            cluster.crash(id);
        }
        for id in 1..=3 {
            cluster.restart(id);
        }
        cluster.wait_for_leader();
        cluster.wait_applied(&[1, 2, 3], index);
        for id in 1..=3 {
            assert_eq!(cluster.node(id).state_machine().get("durable"), Some("yes"));
        }
    }
}

// =============================================================================
// SECTION 6: RANDOMIZED FAULTS
// =============================================================================

mod randomized {
    use super::*;

    /// Random crashes, restarts, partitions and proposals. The cluster's
    /// own checks assert safety after every message; at the end the
    /// cluster must heal and converge.
    fn run(seed: u64) {
        let config = RaftConfig { snapshot_threshold: 15, rng_seed: Some(seed), ..RaftConfig::default() };
        let mut cluster = Cluster::with_config(5, config);
        let mut rng = StdRng::seed_from_u64(seed);
        let mut proposed = 0;

        for _ in 0..1_500 {
            match rng.gen_range(0..100) {
                0..=1 => {
                    let id = rng.gen_range(1..=5);
                    if cluster.nodes.contains_key(&id) && cluster.crashed.len() < 2 {
                        cluster.crash(id);
                    }
                }
                2..=4 => {
                    if let Some(id) = cluster.crashed.keys().next().copied() {
                        cluster.restart(id);
                    }
                }
                5 => {
                    let id = rng.gen_range(1..=5);
                    cluster.isolate(id);
                }
                6..=8 => cluster.heal(),
                9..=30 => {
                    if let Some(leader) = cluster.leader() {
                        let _ = cluster.propose_on(leader, &format!("k{proposed}"), "v");
                        proposed += 1;
                    }
                }
                _ => {}
            }
            cluster.tick();
        }

        cluster.heal();
        let ids: Vec<NodeId> = cluster.crashed.keys().copied().collect();
        for id in ids {
            cluster.restart(id);
        }
        let leader = cluster.wait_for_leader();
        let index = cluster.propose_on(leader, "final", "v").unwrap();
        cluster.wait_applied(&[1, 2, 3, 4, 5], index);
        let expected = cluster.node(1).state_machine().len();
        for id in 2..=5 {
            assert_eq!(cluster.node(id).state_machine().get("final"), Some("v"));
            assert_eq!(cluster.node(id).state_machine().len(), expected);
        }
    }

    #[test]
    fn random_faults_seed_1() {
        run(1);
    }

    #[test]
    fn random_faults_seed_2() {
        run(2);
    }

    #[test]
    fn random_faults_seed_3() {
        run(3);
    }
}
