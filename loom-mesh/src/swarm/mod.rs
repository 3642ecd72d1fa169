//! Swarm abstraction: topic-scoped peer discovery yielding byte streams.
//!
//! The mesh participant never talks to the network directly. It joins
//! topics on a [`Swarm`] and consumes the resulting [`SwarmConnection`]s.
//!
//! - [`MemorySwarm`]: in-process network for tests
//! - [`IrohSwarm`]: iroh QUIC endpoint with bootstrap dialing

mod memory;
mod quic;

pub use memory::{MemoryNetwork, MemorySwarm};
pub use quic::{IrohSwarm, MESH_ALPN};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::error::SwarmResult;
use crate::topic::Topic;

/// A live, authenticated connection to another node.
pub struct SwarmConnection {
    /// Identity of the remote node, as authenticated by the swarm.
    pub remote_id: String,
    /// Inbound bytes.
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    /// Outbound bytes.
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
}

impl std::fmt::Debug for SwarmConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwarmConnection")
            .field("remote_id", &self.remote_id)
            .finish_non_exhaustive()
    }
}

/// Topic-based discovery and connection source.
#[async_trait]
pub trait Swarm: Send + Sync {
    /// Local node identity.
    fn local_id(&self) -> String;

    /// Addresses other nodes can use to reach this one.
    fn endpoints(&self) -> Vec<String> {
        Vec::new()
    }

    /// Join a topic. Resolves once the join is flushed to the network.
    async fn join(&self, topic: Topic) -> SwarmResult<()>;

    /// Leave a topic. Existing connections stay open.
    async fn leave(&self, topic: Topic) -> SwarmResult<()>;

    /// Take the stream of new connections. Returns `None` after the first call.
    async fn connections(&self) -> Option<mpsc::UnboundedReceiver<SwarmConnection>>;

    /// Close the connection to `remote_id`, if any.
    async fn disconnect(&self, remote_id: &str);

    /// Tear down every connection and stop discovery.
    async fn destroy(&self) -> SwarmResult<()>;
}
