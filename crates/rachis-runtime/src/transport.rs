//! # transport
//!
//! why: carry envelopes between node tasks without the engine knowing how
//! relations: node.rs hands every outbound envelope to a Transport; LocalNetwork feeds node.rs event queues
//! what: Transport trait, LocalNetwork (in-process routing with fault injection)

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use rachis_core::{Envelope, NodeId};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{trace, warn};

use crate::node::Event;

/// Delivers envelopes to peers. Delivery is best effort: messages may be
/// dropped, and the engine recovers through retries.
pub trait Transport: Send + Sync {
    fn send(&self, envelope: Envelope);
}

/// In-process network connecting node tasks through their event queues.
///
/// Links can be cut in both directions to simulate partitions. With wire
/// encoding enabled every envelope goes through its json form, as it would
/// on a real connection.
#[derive(Default)]
pub struct LocalNetwork {
    nodes: RwLock<HashMap<NodeId, UnboundedSender<Event>>>,
    cut: RwLock<HashSet<(NodeId, NodeId)>>,
    wire_encoding: bool,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A network that serializes every envelope to json and back.
    pub fn with_wire_encoding() -> Arc<Self> {
        Arc::new(Self { wire_encoding: true, ..Self::default() })
    }

    pub fn register(&self, id: NodeId, events: UnboundedSender<Event>) {
        self.nodes.write().insert(id, events);
    }

    pub fn unregister(&self, id: NodeId) {
        self.nodes.write().remove(&id);
    }

    /// Cut every link between `side` and the rest of the registered nodes.
    pub fn partition(&self, side: &[NodeId]) {
        let others: Vec<NodeId> = self.nodes.read().keys().copied().filter(|id| !side.contains(id)).collect();
        let mut cut = self.cut.write();
        for a in side {
            for b in &others {
                cut.insert((*a, *b));
                cut.insert((*b, *a));
            }
        }
    }

    pub fn isolate(&self, id: NodeId) {
        self.partition(&[id]);
    }

    pub fn heal(&self) {
        self.cut.write().clear();
    }

    fn encode(&self, envelope: Envelope) -> Option<Envelope> {
        if !self.wire_encoding {
            return Some(envelope);
        }
        let decoded = serde_json::to_vec(&envelope).and_then(|bytes| serde_json::from_slice(&bytes));
        match decoded {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                warn!(from = envelope.from, to = envelope.to, "failed to encode envelope: {e}");
                None
            }
        }
    }
}

impl Transport for LocalNetwork {
    fn send(&self, envelope: Envelope) {
        if self.cut.read().contains(&(envelope.from, envelope.to)) {
            trace!(from = envelope.from, to = envelope.to, kind = envelope.message.kind(), "dropped by partition");
            return;
        }
        let Some(envelope) = self.encode(envelope) else {
            return;
        };
        if let Some(events) = self.nodes.read().get(&envelope.to) {
            // a closed queue means the node stopped; the message is lost like on a real network
            let _ = events.send(Event::Message(envelope));
        }
    }
}
