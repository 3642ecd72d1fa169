//! Swarm over iroh QUIC.
//!
//! Each mesh link is one iroh connection carrying a single bidirectional
//! stream. Bootstrap peers are dialed on the first topic join and redialed
//! with capped exponential backoff whenever the link drops.

use std::collections::HashSet;
use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use iroh::endpoint::Connection;
use iroh::protocol::{AcceptError, ProtocolHandler, Router};
use iroh::{Endpoint, EndpointId};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::{Swarm, SwarmConnection};
use crate::backoff::backoff_delay;
use crate::error::{SwarmError, SwarmResult};
use crate::topic::Topic;

/// Protocol identifier for mesh links.
pub const MESH_ALPN: &[u8] = b"/loom-mesh/1";

struct Shared {
    incoming: mpsc::UnboundedSender<SwarmConnection>,
    connections: DashMap<EndpointId, Connection>,
}

impl Shared {
    /// Register a link and hand its stream to the participant.
    fn register(
        self: &Arc<Self>,
        remote: EndpointId,
        connection: Connection,
        send: iroh::endpoint::SendStream,
        recv: iroh::endpoint::RecvStream,
    ) -> bool {
        self.connections.insert(remote, connection);
        self.incoming
            .send(SwarmConnection {
                remote_id: remote.to_string(),
                reader: Box::new(recv),
                writer: Box::new(send),
            })
            .is_ok()
    }
}

/// Identity of one physical link, stable for its lifetime.
trait LinkId {
    fn link_id(&self) -> usize;
}

impl LinkId for Connection {
    fn link_id(&self) -> usize {
        self.stable_id()
    }
}

/// Drop the entry for `remote` if it still refers to `link`.
///
/// A newer link registered for the same remote is left in place.
fn forget_link<K: Eq + Hash, C: LinkId>(links: &DashMap<K, C>, remote: &K, link: &C) -> bool {
    links
        .remove_if(remote, |_, current| current.link_id() == link.link_id())
        .is_some()
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("connections", &self.connections.len())
            .finish_non_exhaustive()
    }
}

/// Accepts inbound mesh links.
#[derive(Debug, Clone)]
struct MeshProtocol {
    shared: Arc<Shared>,
}

impl ProtocolHandler for MeshProtocol {
    async fn accept(&self, connection: Connection) -> Result<(), AcceptError> {
        let remote = connection.remote_id();
        let (send, recv) = connection.accept_bi().await?;
        tracing::info!("Mesh link accepted from {}", remote);

        if !self
            .shared
            .register(remote, connection.clone(), send, recv)
        {
            connection.close(0u32.into(), b"shutting down");
            return Ok(());
        }

        let shared = self.shared.clone();
        tokio::spawn(async move {
            let reason = connection.closed().await;
            tracing::debug!("Mesh link from {} closed: {}", remote, reason);
            forget_link(&shared.connections, &remote, &connection);
        });
        Ok(())
    }
}

/// A [`Swarm`] backed by an iroh endpoint.
pub struct IrohSwarm {
    endpoint: Endpoint,
    router: Mutex<Option<Router>>,
    shared: Arc<Shared>,
    incoming: Mutex<Option<mpsc::UnboundedReceiver<SwarmConnection>>>,
    bootstrap: Vec<EndpointId>,
    dialers: Mutex<Vec<JoinHandle<()>>>,
    topics: Mutex<HashSet<Topic>>,
}

impl std::fmt::Debug for IrohSwarm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IrohSwarm")
            .field("endpoint_id", &self.endpoint.id())
            .field("bootstrap", &self.bootstrap.len())
            .finish_non_exhaustive()
    }
}

impl IrohSwarm {
    /// Bind an endpoint and start accepting mesh links.
    ///
    /// `bootstrap` holds the EndpointIds of known mesh nodes.
    pub async fn bind(bootstrap: &[String]) -> SwarmResult<Self> {
        let bootstrap = bootstrap
            .iter()
            .map(|s| Self::parse_address(s))
            .collect::<SwarmResult<Vec<_>>>()?;

        let endpoint = Endpoint::builder()
            .alpns(vec![MESH_ALPN.to_vec()])
            .bind()
            .await
            .map_err(|e| SwarmError::Bind(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            incoming: tx,
            connections: DashMap::new(),
        });

        let router = Router::builder(endpoint.clone())
            .accept(
                MESH_ALPN,
                MeshProtocol {
                    shared: shared.clone(),
                },
            )
            .spawn();

        tracing::info!("Mesh endpoint bound: {}", endpoint.id());

        Ok(Self {
            endpoint,
            router: Mutex::new(Some(router)),
            shared,
            incoming: Mutex::new(Some(rx)),
            bootstrap,
            dialers: Mutex::new(Vec::new()),
            topics: Mutex::new(HashSet::new()),
        })
    }

    /// Parse a peer address string to an EndpointId.
    fn parse_address(address: &str) -> SwarmResult<EndpointId> {
        address
            .trim()
            .parse::<EndpointId>()
            .map_err(|e| SwarmError::InvalidAddress(format!("{address}: {e}")))
    }

    /// Get the underlying endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn start_dialers(&self) {
        let mut dialers = self.dialers.lock().await;
        if !dialers.is_empty() {
            return;
        }
        let local = self.endpoint.id();
        for peer in self.bootstrap.iter().copied().filter(|p| *p != local) {
            let endpoint = self.endpoint.clone();
            let shared = self.shared.clone();
            dialers.push(tokio::spawn(dial_loop(endpoint, shared, peer)));
        }
    }
}

/// Keep a link to `peer` open, redialing with backoff.
async fn dial_loop(endpoint: Endpoint, shared: Arc<Shared>, peer: EndpointId) {
    let mut attempt: u32 = 0;
    loop {
        if let Some(existing) = shared.connections.get(&peer).map(|c| c.value().clone()) {
            existing.closed().await;
            // The accept-side monitor may not have run yet.
            forget_link(&shared.connections, &peer, &existing);
            attempt = 0;
            continue;
        }

        match dial(&endpoint, peer).await {
            Ok((connection, send, recv)) => {
                tracing::info!("Mesh link established to {}", peer);
                if !shared.register(peer, connection.clone(), send, recv) {
                    connection.close(0u32.into(), b"shutting down");
                    return;
                }
                let reason = connection.closed().await;
                tracing::debug!("Mesh link to {} closed: {}", peer, reason);
                forget_link(&shared.connections, &peer, &connection);
                attempt = 0;
            }
            Err(e) => {
                attempt = attempt.saturating_add(1);
                let delay = backoff_delay(attempt);
                tracing::warn!(
                    "Mesh dial to {} failed (attempt {}): {}; retrying in {:?}",
                    peer,
                    attempt,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

async fn dial(
    endpoint: &Endpoint,
    peer: EndpointId,
) -> SwarmResult<(
    Connection,
    iroh::endpoint::SendStream,
    iroh::endpoint::RecvStream,
)> {
    let connection = endpoint
        .connect(peer, MESH_ALPN)
        .await
        .map_err(|e| SwarmError::Connect(e.to_string()))?;
    let (send, recv) = connection
        .open_bi()
        .await
        .map_err(|e| SwarmError::Connect(format!("failed to open stream: {e}")))?;
    Ok((connection, send, recv))
}

#[async_trait]
impl Swarm for IrohSwarm {
    fn local_id(&self) -> String {
        self.endpoint.id().to_string()
    }

    fn endpoints(&self) -> Vec<String> {
        vec![format!("iroh://{}", self.endpoint.id())]
    }

    async fn join(&self, topic: Topic) -> SwarmResult<()> {
        if self.router.lock().await.is_none() {
            return Err(SwarmError::Destroyed);
        }
        self.topics.lock().await.insert(topic);
        self.start_dialers().await;
        Ok(())
    }

    async fn leave(&self, topic: Topic) -> SwarmResult<()> {
        self.topics.lock().await.remove(&topic);
        Ok(())
    }

    async fn connections(&self) -> Option<mpsc::UnboundedReceiver<SwarmConnection>> {
        self.incoming.lock().await.take()
    }

    async fn disconnect(&self, remote_id: &str) {
        let Ok(remote) = Self::parse_address(remote_id) else {
            return;
        };
        if let Some((_, connection)) = self.shared.connections.remove(&remote) {
            connection.close(0u32.into(), b"closing");
        }
    }

    async fn destroy(&self) -> SwarmResult<()> {
        for dialer in self.dialers.lock().await.drain(..) {
            dialer.abort();
        }
        let ids: Vec<EndpointId> = self.shared.connections.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, connection)) = self.shared.connections.remove(&id) {
                connection.close(0u32.into(), b"closing");
            }
        }
        if let Some(router) = self.router.lock().await.take() {
            router
                .shutdown()
                .await
                .map_err(|e| SwarmError::Bind(format!("router shutdown failed: {e}")))?;
        }
        Ok(())
    }
}
