//! # node
//!
//! why: run one engine on tokio, serializing ticks, messages and client requests through a single queue
//! relations: owns a rachis-core RaftNode over any LogStore (rachis-storage files or memory); sends through transport.rs
//! what: Event, NodeOptions, RaftHandle (client api), the per-node event loop and its proposal waiters

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rachis_core::{
    Applied, ConfigError, LogIndex, LogStore, NodeId, NodeStatus, RaftConfig, RaftError, RaftNode, SnapshotStore,
    StateMachine, Term, Topology,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, Instrument};

use crate::error::ClientError;
use crate::transport::Transport;

type Reply<T> = oneshot::Sender<Result<T, ClientError>>;

/// Everything a node task reacts to. The task handles one event at a time.
pub enum Event {
    Tick,
    Message(rachis_core::Envelope),
    Propose { payload: Vec<u8>, reply: Reply<Vec<u8>> },
    ProposeTopology { topology: Topology, reply: Reply<LogIndex> },
    TransferLeadership { target: NodeId, reply: Reply<()> },
    Status { reply: oneshot::Sender<NodeStatus> },
    Shutdown,
}

/// Settings for one hosted node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeOptions {
    pub id: NodeId,
    /// Membership used when storage holds none yet.
    pub topology: Topology,
    #[serde(default)]
    pub config: RaftConfig,
    /// How long a client waits for its request to be applied.
    #[serde(default = "default_proposal_timeout")]
    pub proposal_timeout_ms: u64,
}

fn default_proposal_timeout() -> u64 {
    5000
}

impl NodeOptions {
    pub fn new(id: NodeId, topology: Topology) -> Self {
        Self { id, topology, config: RaftConfig::default(), proposal_timeout_ms: default_proposal_timeout() }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let options: Self = serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        options.config.validate()?;
        if options.proposal_timeout_ms == 0 {
            return Err(ConfigError::Zero("proposal_timeout_ms"));
        }
        Ok(options)
    }
}

/// Client side of a running node. Cheap to clone; every clone talks to the same task.
#[derive(Clone)]
pub struct RaftHandle {
    id: NodeId,
    events: mpsc::UnboundedSender<Event>,
    proposal_timeout: Duration,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl RaftHandle {
    /// Start a node task. Its messages go out through `transport`; inbound
    /// messages are delivered by feeding `Event::Message` to `sender()`.
    pub fn spawn<M: StateMachine + 'static>(
        options: NodeOptions,
        log: Box<dyn LogStore>,
        snapshots: Box<dyn SnapshotStore>,
        state_machine: M,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, RaftError> {
        let node = RaftNode::new(options.id, options.config.clone(), options.topology, log, snapshots, state_machine)?;
        let (events, queue) = mpsc::unbounded_channel();
        let task = NodeTask {
            node,
            events: queue,
            transport,
            waiters: BTreeMap::new(),
            tick: Duration::from_millis(options.config.tick_ms),
            was_leader: false,
        };
        let span = tracing::info_span!("rachis", node = options.id);
        let join = tokio::spawn(task.run().instrument(span));
        Ok(Self {
            id: options.id,
            events,
            proposal_timeout: Duration::from_millis(options.proposal_timeout_ms),
            task: Arc::new(Mutex::new(Some(join))),
        })
    }

    /// Start a node whose log, vote and snapshots live in `dir`.
    pub fn spawn_with_files<M: StateMachine + 'static>(
        options: NodeOptions,
        dir: impl AsRef<Path>,
        state_machine: M,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, RaftError> {
        let (log, snapshots) = rachis_storage::open(dir)?;
        Self::spawn(options, Box::new(log), Box::new(snapshots), state_machine, transport)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The event queue, for a transport to deliver inbound messages.
    pub fn sender(&self) -> mpsc::UnboundedSender<Event> {
        self.events.clone()
    }

    /// Replicate `payload` and wait until it is applied. Returns the state
    /// machine's result for it.
    pub async fn propose(&self, payload: Vec<u8>) -> Result<Vec<u8>, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.send(Event::Propose { payload, reply })?;
        self.wait(rx).await
    }

    /// Change the membership and wait until the change is applied.
    pub async fn propose_topology(&self, topology: Topology) -> Result<LogIndex, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.send(Event::ProposeTopology { topology, reply })?;
        self.wait(rx).await
    }

    /// Ask the leader to hand leadership to `target`. Returns once the
    /// transfer has started.
    pub async fn transfer_leadership(&self, target: NodeId) -> Result<(), ClientError> {
        let (reply, rx) = oneshot::channel();
        self.send(Event::TransferLeadership { target, reply })?;
        self.wait(rx).await
    }

    pub async fn status(&self) -> Result<NodeStatus, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.send(Event::Status { reply })?;
        rx.await.map_err(|_| ClientError::Shutdown)
    }

    /// Stop the task and wait for it to finish. Pending requests fail with
    /// `Shutdown`.
    pub async fn shutdown(&self) {
        let _ = self.events.send(Event::Shutdown);
        let join = self.task.lock().take();
        if let Some(join) = join {
            if let Err(e) = join.await {
                error!(node = self.id, "node task failed: {e}");
            }
        }
    }

    fn send(&self, event: Event) -> Result<(), ClientError> {
        self.events.send(event).map_err(|_| ClientError::Shutdown)
    }

    async fn wait<T>(&self, rx: oneshot::Receiver<Result<T, ClientError>>) -> Result<T, ClientError> {
        match tokio::time::timeout(self.proposal_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::Shutdown),
            Err(_) => Err(ClientError::Timeout),
        }
    }
}

/// A proposal appended at some index, waiting for that index to be applied.
struct Waiter {
    term: Term,
    reply: WaiterReply,
}

enum WaiterReply {
    Command(Reply<Vec<u8>>),
    Topology(Reply<LogIndex>),
}

impl Waiter {
    fn resolve(self, applied: Option<&Applied>) {
        let outcome = match applied {
            Some(applied) if applied.term == self.term => Ok(applied),
            _ => Err(ClientError::LeaderChanged),
        };
        // a client that gave up has dropped its receiver
        match self.reply {
            WaiterReply::Command(reply) => {
                let result = outcome.and_then(|a| a.result.clone().map_err(ClientError::Rejected));
                let _ = reply.send(result);
            }
            WaiterReply::Topology(reply) => {
                let _ = reply.send(outcome.map(|a| a.index));
            }
        }
    }

    fn fail(self, error: ClientError) {
        match self.reply {
            WaiterReply::Command(reply) => {
                let _ = reply.send(Err(error));
            }
            WaiterReply::Topology(reply) => {
                let _ = reply.send(Err(error));
            }
        }
    }
}

struct NodeTask<M: StateMachine> {
    node: RaftNode<M>,
    events: mpsc::UnboundedReceiver<Event>,
    transport: Arc<dyn Transport>,
    waiters: BTreeMap<LogIndex, Waiter>,
    tick: Duration,
    was_leader: bool,
}

impl<M: StateMachine + 'static> NodeTask<M> {
    async fn run(mut self) {
        info!("node task started");
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let event = tokio::select! {
                _ = interval.tick() => Event::Tick,
                event = self.events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            if matches!(event, Event::Shutdown) {
                break;
            }
            if let Err(e) = self.handle(event) {
                // nothing depending on the failed write was sent; the next event retries
                error!(term = self.node.current_term(), "engine error: {e}");
            }
            self.flush();
        }
        for (_, waiter) in std::mem::take(&mut self.waiters) {
            waiter.fail(ClientError::Shutdown);
        }
        info!("node task stopped");
    }

    fn handle(&mut self, event: Event) -> Result<(), RaftError> {
        match event {
            Event::Tick => self.node.tick(),
            Event::Message(envelope) => self.node.step(envelope.from, envelope.message),
            Event::Propose { payload, reply } => {
                match self.node.propose(payload) {
                    Ok(index) => self.wait_for(index, WaiterReply::Command(reply)),
                    Err(e) => {
                        let _ = reply.send(Err(e.into()));
                    }
                }
                Ok(())
            }
            Event::ProposeTopology { topology, reply } => {
                match self.node.propose_topology(topology) {
                    Ok(index) => self.wait_for(index, WaiterReply::Topology(reply)),
                    Err(e) => {
                        let _ = reply.send(Err(e.into()));
                    }
                }
                Ok(())
            }
            Event::TransferLeadership { target, reply } => {
                let _ = reply.send(self.node.transfer_leadership(target).map_err(ClientError::from));
                Ok(())
            }
            Event::Status { reply } => {
                let _ = reply.send(self.node.status());
                Ok(())
            }
            Event::Shutdown => Ok(()),
        }
    }

    fn wait_for(&mut self, index: LogIndex, reply: WaiterReply) {
        let waiter = Waiter { term: self.node.current_term(), reply };
        if let Some(stale) = self.waiters.insert(index, waiter) {
            // an index is reused only after its entry was overwritten
            stale.fail(ClientError::LeaderChanged);
        }
    }

    /// Ship outbound messages and settle proposals whose entries were applied.
    fn flush(&mut self) {
        for envelope in self.node.take_messages() {
            self.transport.send(envelope);
        }
        for applied in self.node.take_applied() {
            if let Some(waiter) = self.waiters.remove(&applied.index) {
                waiter.resolve(Some(&applied));
            }
        }

        let is_leader = self.node.is_leader();
        if self.was_leader && !is_leader {
            debug!(term = self.node.current_term(), pending = self.waiters.len(), "lost leadership");
            for (_, waiter) in std::mem::take(&mut self.waiters) {
                waiter.resolve(None);
            }
        }
        self.was_leader = is_leader;
    }
}
