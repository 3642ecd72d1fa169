//! In-process swarm for tests.
//!
//! Every [`MemorySwarm`] registered on the same [`MemoryNetwork`] that shares
//! a joined topic gets exactly one duplex connection per node pair.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use super::{Swarm, SwarmConnection};
use crate::error::{SwarmError, SwarmResult};
use crate::topic::Topic;

/// Buffer size of each simulated link.
const LINK_BUFFER: usize = 256 * 1024;

struct Node {
    topics: HashSet<Topic>,
    incoming: mpsc::UnboundedSender<SwarmConnection>,
}

#[derive(Default)]
struct NetworkState {
    nodes: HashMap<String, Node>,
    /// Linked node pairs, smaller id first.
    links: HashSet<(String, String)>,
}

/// Shared in-memory network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new node with the given id.
    pub async fn swarm(&self, node_id: impl Into<String>) -> MemorySwarm {
        let node_id = node_id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().await.nodes.insert(
            node_id.clone(),
            Node {
                topics: HashSet::new(),
                incoming: tx,
            },
        );
        MemorySwarm {
            network: self.clone(),
            node_id,
            incoming: Mutex::new(Some(rx)),
        }
    }

    /// Number of live links.
    pub async fn link_count(&self) -> usize {
        self.state.lock().await.links.len()
    }
}

fn link_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// One node on a [`MemoryNetwork`].
pub struct MemorySwarm {
    network: MemoryNetwork,
    node_id: String,
    incoming: Mutex<Option<mpsc::UnboundedReceiver<SwarmConnection>>>,
}

impl std::fmt::Debug for MemorySwarm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySwarm")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Swarm for MemorySwarm {
    fn local_id(&self) -> String {
        self.node_id.clone()
    }

    fn endpoints(&self) -> Vec<String> {
        vec![format!("memory://{}", self.node_id)]
    }

    async fn join(&self, topic: Topic) -> SwarmResult<()> {
        let mut state = self.network.state.lock().await;
        let node = state
            .nodes
            .get_mut(&self.node_id)
            .ok_or(SwarmError::Destroyed)?;
        node.topics.insert(topic);
        let local_tx = node.incoming.clone();

        let mut new_links = Vec::new();
        for (other_id, other) in &state.nodes {
            if *other_id == self.node_id || !other.topics.contains(&topic) {
                continue;
            }
            let key = link_key(&self.node_id, other_id);
            if state.links.contains(&key) {
                continue;
            }
            new_links.push((key, other_id.clone(), other.incoming.clone()));
        }

        for (key, other_id, remote_tx) in new_links {
            let (local_end, remote_end) = tokio::io::duplex(LINK_BUFFER);
            let (local_reader, local_writer) = tokio::io::split(local_end);
            let (remote_reader, remote_writer) = tokio::io::split(remote_end);

            let delivered_local = local_tx
                .send(SwarmConnection {
                    remote_id: other_id.clone(),
                    reader: Box::new(local_reader),
                    writer: Box::new(local_writer),
                })
                .is_ok();
            let delivered_remote = remote_tx
                .send(SwarmConnection {
                    remote_id: self.node_id.clone(),
                    reader: Box::new(remote_reader),
                    writer: Box::new(remote_writer),
                })
                .is_ok();

            if delivered_local && delivered_remote {
                tracing::debug!("Memory swarm linked {} <-> {}", self.node_id, other_id);
                state.links.insert(key);
            }
        }
        Ok(())
    }

    async fn leave(&self, topic: Topic) -> SwarmResult<()> {
        let mut state = self.network.state.lock().await;
        if let Some(node) = state.nodes.get_mut(&self.node_id) {
            node.topics.remove(&topic);
        }
        Ok(())
    }

    async fn connections(&self) -> Option<mpsc::UnboundedReceiver<SwarmConnection>> {
        self.incoming.lock().await.take()
    }

    async fn disconnect(&self, remote_id: &str) {
        let key = link_key(&self.node_id, remote_id);
        self.network.state.lock().await.links.remove(&key);
    }

    async fn destroy(&self) -> SwarmResult<()> {
        let mut state = self.network.state.lock().await;
        state.nodes.remove(&self.node_id);
        let node_id = &self.node_id;
        state.links.retain(|(a, b)| a != node_id && b != node_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn shared_topic_links_nodes_once() {
        let network = MemoryNetwork::new();
        let a = network.swarm("a").await;
        let b = network.swarm("b").await;
        let mut a_conns = a.connections().await.unwrap();
        let mut b_conns = b.connections().await.unwrap();
        assert!(a.connections().await.is_none());

        let topic = Topic::coordination();
        a.join(topic).await.unwrap();
        assert_eq!(network.link_count().await, 0);
        b.join(topic).await.unwrap();
        assert_eq!(network.link_count().await, 1);

        // A second shared topic does not create another link.
        let other = Topic::workspace("ws-1");
        a.join(other).await.unwrap();
        b.join(other).await.unwrap();
        assert_eq!(network.link_count().await, 1);

        let mut on_a = a_conns.recv().await.unwrap();
        let mut on_b = b_conns.recv().await.unwrap();
        assert_eq!(on_a.remote_id, "b");
        assert_eq!(on_b.remote_id, "a");

        on_a.writer.write_all(b"hello\n").await.unwrap();
        let mut buf = [0u8; 6];
        on_b.reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello\n");
    }

    #[tokio::test]
    async fn disjoint_topics_stay_unlinked() {
        let network = MemoryNetwork::new();
        let a = network.swarm("a").await;
        let b = network.swarm("b").await;
        a.join(Topic::workspace("x")).await.unwrap();
        b.join(Topic::workspace("y")).await.unwrap();
        assert_eq!(network.link_count().await, 0);
    }

    #[tokio::test]
    async fn destroyed_swarm_cannot_join() {
        let network = MemoryNetwork::new();
        let a = network.swarm("a").await;
        let b = network.swarm("b").await;
        let topic = Topic::coordination();
        a.join(topic).await.unwrap();
        b.join(topic).await.unwrap();

        a.destroy().await.unwrap();
        assert_eq!(network.link_count().await, 0);
        assert!(matches!(a.join(topic).await, Err(SwarmError::Destroyed)));
    }
}
