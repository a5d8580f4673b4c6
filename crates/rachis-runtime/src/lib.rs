//! # rachis-runtime
//!
//! why: host rachis-core engines on tokio so clients can await their requests
//! relations: drives rachis-core RaftNode, persists through rachis-storage or the in-memory stores
//! what: RaftHandle (spawned node task), NodeOptions, Transport with the in-process LocalNetwork, ClientError

pub mod error;
pub mod node;
pub mod transport;

pub use error::ClientError;
pub use node::{Event, NodeOptions, RaftHandle};
pub use transport::{LocalNetwork, Transport};
