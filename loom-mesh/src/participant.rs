//! The mesh participant: relay discovery and workspace-topic gossip.
//!
//! On [`start`](MeshParticipant::start) the participant joins the mesh
//! coordination topic and attaches to every connection its [`Swarm`]
//! yields. Each connection gets a reader task (newline framing, message
//! dispatch) and a writer task fed by a bounded channel.
//!
//! A connection's identity is the swarm-authenticated remote id. Gossip
//! claiming another identity is ignored.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::MeshConfig;
use crate::error::{MeshError, MeshResult};
use crate::events::{MeshEvent, EVENT_CHANNEL_CAPACITY};
use crate::framing::{encode_line, LineDecoder};
use crate::membership::WorkspaceMembership;
use crate::messages::{Capabilities, MeshMessage, RelayInfo, WorkspaceAction, PROTOCOL_VERSION};
use crate::routing::RoutingTable;
use crate::swarm::{Swarm, SwarmConnection};
use crate::topic::Topic;

/// Outbound lines queued per connection before messages are dropped.
const OUTBOUND_QUEUE: usize = 256;

/// Read buffer size per connection.
const READ_CHUNK: usize = 16 * 1024;

/// Maximum peers collected per workspace query.
const MAX_QUERY_PEERS: usize = 1000;

/// Time allowed for queued departure announcements to drain on shutdown.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(1);

struct PeerLink {
    serial: u64,
    outbound: mpsc::Sender<Arc<Vec<u8>>>,
}

struct PendingQuery {
    topic: String,
    peers: HashSet<String>,
}

/// Snapshot of participant state for the HTTP status endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshStatus {
    /// Local node id.
    pub node_id: String,
    /// Whether the participant is running.
    pub running: bool,
    /// Whether this node announces itself as a relay.
    pub relay: bool,
    /// Open mesh connections.
    pub connections: usize,
    /// Routing table entries.
    pub known_relays: usize,
    /// Workspace topics joined locally.
    pub workspaces: usize,
    /// Workspace topics tracked from gossip.
    pub tracked_topics: usize,
    /// Seconds since the participant was created.
    pub uptime_secs: u64,
}

/// A node in the relay mesh.
pub struct MeshParticipant {
    config: MeshConfig,
    swarm: Arc<dyn Swarm>,
    node_id: String,
    created_at: Instant,
    running: AtomicBool,
    next_serial: AtomicU64,
    routing: Mutex<RoutingTable>,
    membership: Mutex<WorkspaceMembership>,
    /// Locally joined workspaces: topic → workspace id.
    workspaces: Mutex<HashMap<Topic, String>>,
    peers: DashMap<String, PeerLink>,
    latency_ms: DashMap<String, u64>,
    pending_queries: DashMap<String, PendingQuery>,
    events: broadcast::Sender<MeshEvent>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    writers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for MeshParticipant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshParticipant")
            .field("node_id", &self.node_id)
            .field("running", &self.running.load(Ordering::Relaxed))
            .field("connections", &self.peers.len())
            .finish_non_exhaustive()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

fn random_request_id() -> String {
    let mut bytes = [0u8; 16];
    getrandom::getrandom(&mut bytes).expect("getrandom failed");
    hex::encode(bytes)
}

impl MeshParticipant {
    /// Create a participant over `swarm`. Call [`start`](Self::start) to go live.
    pub fn new(config: MeshConfig, swarm: Arc<dyn Swarm>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            node_id: swarm.local_id(),
            routing: Mutex::new(RoutingTable::new(config.max_routing_table_size)),
            membership: Mutex::new(WorkspaceMembership::new(config.max_tracked_topics)),
            config,
            swarm,
            created_at: Instant::now(),
            running: AtomicBool::new(false),
            next_serial: AtomicU64::new(0),
            workspaces: Mutex::new(HashMap::new()),
            peers: DashMap::new(),
            latency_ms: DashMap::new(),
            pending_queries: DashMap::new(),
            events,
            shutdown,
            tasks: Mutex::new(Vec::new()),
            writers: Mutex::new(Vec::new()),
        })
    }

    /// Local node id.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Whether the participant is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Subscribe to mesh events.
    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: MeshEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Join the coordination topic and begin serving connections.
    pub async fn start(self: &Arc<Self>) -> MeshResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(MeshError::AlreadyStarted);
        }
        let Some(mut connections) = self.swarm.connections().await else {
            self.running.store(false, Ordering::SeqCst);
            return Err(MeshError::AlreadyStarted);
        };

        if let Err(e) = self.swarm.join(Topic::coordination()).await {
            self.running.store(false, Ordering::SeqCst);
            return Err(e.into());
        }

        let this = self.clone();
        let accept = tokio::spawn(async move {
            while let Some(connection) = connections.recv().await {
                this.attach(connection).await;
            }
        });

        let this = self.clone();
        let period = Duration::from_secs(self.config.announce_interval_secs.max(1));
        let maintenance = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately; greetings already cover it.
            interval.tick().await;
            loop {
                interval.tick().await;
                this.broadcast(&MeshMessage::Ping {
                    timestamp: now_ms(),
                });
                if this.config.relay {
                    this.broadcast(&MeshMessage::RelayAnnounce {
                        relay: this.self_info(),
                    });
                }
            }
        });

        self.tasks.lock().await.extend([accept, maintenance]);
        tracing::info!("Mesh participant started as {}", self.node_id);
        self.emit(MeshEvent::Started {
            node_id: self.node_id.clone(),
        });
        Ok(())
    }

    /// Describe this node for relay announcements.
    pub fn self_info(&self) -> RelayInfo {
        let mut endpoints = self.config.endpoints.clone();
        endpoints.extend(self.swarm.endpoints());
        RelayInfo {
            node_id: self.node_id.clone(),
            endpoints,
            capabilities: Capabilities {
                relay: self.config.relay,
                persistence: self.config.persistence,
            },
            protocol_version: PROTOCOL_VERSION,
            uptime_secs: self.created_at.elapsed().as_secs(),
            last_seen: now_ms(),
        }
    }

    async fn attach(self: &Arc<Self>, connection: SwarmConnection) {
        let SwarmConnection {
            remote_id,
            mut reader,
            mut writer,
        } = connection;
        if remote_id == self.node_id {
            return;
        }

        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::channel::<Arc<Vec<u8>>>(OUTBOUND_QUEUE);
        if self
            .peers
            .insert(
                remote_id.clone(),
                PeerLink {
                    serial,
                    outbound: tx,
                },
            )
            .is_some()
        {
            tracing::debug!("Replacing existing mesh link to {}", remote_id);
        }
        tracing::info!("Mesh peer connected: {}", remote_id);

        let writer_peer = remote_id.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if let Err(e) = writer.write_all(&line).await {
                    tracing::debug!("Mesh write to {} failed: {}", writer_peer, e);
                    break;
                }
                if let Err(e) = writer.flush().await {
                    tracing::debug!("Mesh flush to {} failed: {}", writer_peer, e);
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });
        {
            let mut writers = self.writers.lock().await;
            writers.retain(|w| !w.is_finished());
            writers.push(writer_task);
        }

        self.greet(&remote_id).await;

        let this = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut decoder = LineDecoder::default();
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                let read = tokio::select! {
                    _ = shutdown.changed() => break,
                    read = reader.read(&mut buf) => read,
                };
                let n = match read {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        tracing::debug!("Mesh read from {} failed: {}", remote_id, e);
                        break;
                    }
                };
                match decoder.push(&buf[..n]) {
                    Ok(messages) => {
                        for message in messages {
                            this.handle_message(&remote_id, message).await;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Destroying mesh link to {}: {}", remote_id, e);
                        break;
                    }
                }
            }
            this.detach(&remote_id, serial).await;
        });
    }

    async fn greet(&self, remote_id: &str) {
        self.send_to(remote_id, &MeshMessage::BootstrapRequest);
        if self.config.relay {
            self.send_to(
                remote_id,
                &MeshMessage::RelayAnnounce {
                    relay: self.self_info(),
                },
            );
        }
        let topics: Vec<Topic> = self.workspaces.lock().await.keys().copied().collect();
        for topic in topics {
            self.send_to(
                remote_id,
                &MeshMessage::WorkspaceAnnounce {
                    topic: topic.to_hex(),
                    action: WorkspaceAction::Join,
                },
            );
        }
    }

    async fn detach(&self, remote_id: &str, serial: u64) {
        let removed = self
            .peers
            .remove_if(remote_id, |_, link| link.serial == serial)
            .is_some();
        if !removed {
            return;
        }
        self.latency_ms.remove(remote_id);
        self.swarm.disconnect(remote_id).await;

        let left = self.membership.lock().await.remove_node(remote_id);
        for topic in left {
            self.emit(MeshEvent::WorkspacePeerLeft {
                topic,
                node_id: remote_id.to_string(),
            });
        }
        tracing::info!("Mesh peer disconnected: {}", remote_id);
    }

    fn send_to(&self, remote_id: &str, message: &MeshMessage) {
        let Some(link) = self.peers.get(remote_id) else {
            return;
        };
        if link.outbound.try_send(Arc::new(encode_line(message))).is_err() {
            tracing::debug!(
                "Dropping {} to {}: outbound queue full",
                message.kind(),
                remote_id
            );
        }
    }

    fn broadcast(&self, message: &MeshMessage) {
        let line = Arc::new(encode_line(message));
        for link in self.peers.iter() {
            if link.outbound.try_send(line.clone()).is_err() {
                tracing::debug!(
                    "Dropping {} to {}: outbound queue full",
                    message.kind(),
                    link.key()
                );
            }
        }
    }

    async fn handle_message(&self, remote_id: &str, message: MeshMessage) {
        tracing::trace!("Mesh {} from {}", message.kind(), remote_id);
        match message {
            MeshMessage::RelayAnnounce { mut relay } => {
                if relay.node_id != remote_id {
                    tracing::warn!(
                        "Ignoring relay-announce from {} claiming to be {}",
                        remote_id,
                        relay.node_id
                    );
                    return;
                }
                relay.last_seen = now_ms();
                let is_new = self.routing.lock().await.upsert(relay.clone());
                if is_new {
                    tracing::info!("Discovered relay {}", relay.node_id);
                    self.emit(MeshEvent::RelayDiscovered(relay));
                }
            }
            MeshMessage::BootstrapRequest => {
                let mut relays = self.routing.lock().await.all();
                if self.config.relay {
                    relays.insert(0, self.self_info());
                }
                relays.truncate(self.config.max_routing_table_size);
                self.send_to(remote_id, &MeshMessage::BootstrapResponse { relays });
            }
            MeshMessage::BootstrapResponse { relays } => {
                let now = now_ms();
                let mut discovered = Vec::new();
                {
                    let mut routing = self.routing.lock().await;
                    for mut relay in relays
                        .into_iter()
                        .filter(|r| r.node_id != self.node_id && !r.node_id.is_empty())
                        .take(self.config.max_bootstrap_accept)
                    {
                        relay.last_seen = relay.last_seen.min(now);
                        if routing.merge(relay.clone()) {
                            discovered.push(relay);
                        }
                    }
                }
                for relay in discovered {
                    self.emit(MeshEvent::RelayDiscovered(relay));
                }
            }
            MeshMessage::WorkspaceQuery { request_id, topic } => {
                let Some(parsed) = Topic::from_hex(&topic) else {
                    return;
                };
                let mut peers = self.membership.lock().await.peers(&parsed);
                if self.workspaces.lock().await.contains_key(&parsed)
                    && !peers.contains(&self.node_id)
                {
                    peers.push(self.node_id.clone());
                }
                self.send_to(
                    remote_id,
                    &MeshMessage::WorkspaceResponse {
                        request_id,
                        topic,
                        peers,
                    },
                );
            }
            MeshMessage::WorkspaceResponse {
                request_id,
                topic,
                peers,
            } => {
                if let Some(mut pending) = self.pending_queries.get_mut(&request_id) {
                    if pending.topic != topic {
                        return;
                    }
                    for peer in peers {
                        if pending.peers.len() >= MAX_QUERY_PEERS {
                            break;
                        }
                        pending.peers.insert(peer);
                    }
                }
            }
            MeshMessage::WorkspaceAnnounce { topic, action } => {
                let Some(topic) = Topic::from_hex(&topic) else {
                    return;
                };
                let mut membership = self.membership.lock().await;
                let changed = match action {
                    WorkspaceAction::Join => membership.join(topic, remote_id),
                    WorkspaceAction::Leave => membership.leave(&topic, remote_id),
                };
                drop(membership);
                if changed {
                    let node_id = remote_id.to_string();
                    self.emit(match action {
                        WorkspaceAction::Join => MeshEvent::WorkspacePeerJoined { topic, node_id },
                        WorkspaceAction::Leave => MeshEvent::WorkspacePeerLeft { topic, node_id },
                    });
                }
            }
            MeshMessage::Ping { timestamp } => {
                self.send_to(remote_id, &MeshMessage::Pong { timestamp });
            }
            MeshMessage::Pong { timestamp } => {
                let rtt = now_ms().saturating_sub(timestamp);
                self.latency_ms.insert(remote_id.to_string(), rtt);
            }
        }
    }

    /// Join a workspace topic and announce it to every mesh peer.
    pub async fn join_workspace(&self, workspace_id: &str) -> MeshResult<Topic> {
        if !self.is_running() {
            return Err(MeshError::NotStarted);
        }
        if workspace_id.is_empty() {
            return Err(MeshError::InvalidWorkspace);
        }
        let topic = Topic::workspace(workspace_id);
        if self.workspaces.lock().await.contains_key(&topic) {
            return Ok(topic);
        }

        self.swarm.join(topic).await?;
        self.workspaces
            .lock()
            .await
            .insert(topic, workspace_id.to_string());
        self.broadcast(&MeshMessage::WorkspaceAnnounce {
            topic: topic.to_hex(),
            action: WorkspaceAction::Join,
        });
        tracing::info!("Joined workspace topic {:?}", topic);
        self.emit(MeshEvent::WorkspaceJoined {
            workspace_id: workspace_id.to_string(),
            topic,
        });
        Ok(topic)
    }

    /// Announce departure from a workspace topic and leave it.
    pub async fn leave_workspace(&self, workspace_id: &str) -> MeshResult<()> {
        let topic = Topic::workspace(workspace_id);
        if self.workspaces.lock().await.remove(&topic).is_none() {
            return Ok(());
        }
        self.broadcast(&MeshMessage::WorkspaceAnnounce {
            topic: topic.to_hex(),
            action: WorkspaceAction::Leave,
        });
        self.swarm.leave(topic).await?;
        tracing::info!("Left workspace topic {:?}", topic);
        self.emit(MeshEvent::WorkspaceLeft {
            workspace_id: workspace_id.to_string(),
            topic,
        });
        Ok(())
    }

    /// Ask every mesh peer who is in `workspace_id`.
    ///
    /// Resolves after the configured timeout with whatever answers arrived.
    pub async fn query_workspace_peers(&self, workspace_id: &str) -> MeshResult<Vec<String>> {
        if !self.is_running() {
            return Err(MeshError::NotStarted);
        }
        let topic = Topic::workspace(workspace_id).to_hex();
        let request_id = random_request_id();
        self.pending_queries.insert(
            request_id.clone(),
            PendingQuery {
                topic: topic.clone(),
                peers: HashSet::new(),
            },
        );
        self.broadcast(&MeshMessage::WorkspaceQuery {
            request_id: request_id.clone(),
            topic,
        });

        tokio::time::sleep(Duration::from_millis(self.config.query_timeout_ms)).await;

        let mut peers: Vec<String> = self
            .pending_queries
            .remove(&request_id)
            .map(|(_, q)| q.peers.into_iter().collect())
            .unwrap_or_default();
        peers.sort();
        Ok(peers)
    }

    /// Best `limit` known relays.
    pub async fn get_top_relays(&self, limit: usize) -> Vec<RelayInfo> {
        self.routing.lock().await.top(limit)
    }

    /// Last measured round-trip time to a mesh peer.
    pub fn latency(&self, remote_id: &str) -> Option<Duration> {
        self.latency_ms
            .get(remote_id)
            .map(|ms| Duration::from_millis(*ms))
    }

    /// Node ids currently connected.
    pub fn connected_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.peers.iter().map(|e| e.key().clone()).collect();
        peers.sort();
        peers
    }

    /// Current state snapshot.
    pub async fn status(&self) -> MeshStatus {
        MeshStatus {
            node_id: self.node_id.clone(),
            running: self.is_running(),
            relay: self.config.relay,
            connections: self.peers.len(),
            known_relays: self.routing.lock().await.len(),
            workspaces: self.workspaces.lock().await.len(),
            tracked_topics: self.membership.lock().await.topic_count(),
            uptime_secs: self.created_at.elapsed().as_secs(),
        }
    }

    /// Leave every workspace (announcing first), then destroy the swarm.
    pub async fn shutdown(&self) -> MeshResult<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let joined: Vec<(Topic, String)> = self.workspaces.lock().await.drain().collect();
        for (topic, workspace_id) in joined {
            self.broadcast(&MeshMessage::WorkspaceAnnounce {
                topic: topic.to_hex(),
                action: WorkspaceAction::Leave,
            });
            if let Err(e) = self.swarm.leave(topic).await {
                tracing::warn!("Failed to leave workspace topic {:?}: {}", topic, e);
            }
            self.emit(MeshEvent::WorkspaceLeft {
                workspace_id,
                topic,
            });
        }

        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }

        // Dropping the senders lets each writer drain its queue and exit.
        self.peers.clear();
        let writers: Vec<JoinHandle<()>> = self.writers.lock().await.drain(..).collect();
        for writer in writers {
            if tokio::time::timeout(SHUTDOWN_DRAIN, writer).await.is_err() {
                tracing::debug!("Mesh writer did not drain before shutdown");
            }
        }

        let _ = self.shutdown.send(true);
        self.swarm.destroy().await?;
        tracing::info!("Mesh participant stopped");
        self.emit(MeshEvent::Stopped);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swarm::MemoryNetwork;

    fn test_config() -> MeshConfig {
        MeshConfig {
            enabled: true,
            query_timeout_ms: 300,
            ..MeshConfig::default()
        }
    }

    async fn node(network: &MemoryNetwork, id: &str, config: MeshConfig) -> Arc<MeshParticipant> {
        let swarm = Arc::new(network.swarm(id).await);
        MeshParticipant::new(config, swarm)
    }

    async fn next_matching(
        events: &mut broadcast::Receiver<MeshEvent>,
        pred: impl Fn(&MeshEvent) -> bool,
    ) -> MeshEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(event) = events.recv().await {
                    if pred(&event) {
                        return event;
                    }
                }
            }
        })
        .await
        .expect("event not received in time")
    }

    async fn wait_status(node: &MeshParticipant, check: impl Fn(&MeshStatus) -> bool) {
        for _ in 0..250 {
            if check(&node.status().await) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("status condition not met: {:?}", node.status().await);
    }

    /// A bare connection to a participant, for feeding raw frames.
    async fn raw_peer(network: &MemoryNetwork, id: &str) -> SwarmConnection {
        let swarm = network.swarm(id).await;
        let mut conns = swarm.connections().await.unwrap();
        swarm.join(Topic::coordination()).await.unwrap();
        conns.recv().await.unwrap()
    }

    #[tokio::test]
    async fn relays_discover_each_other() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a", test_config()).await;
        let b = node(&network, "b", test_config()).await;
        let mut a_events = a.subscribe();

        a.start().await.unwrap();
        b.start().await.unwrap();

        let event = next_matching(&mut a_events, |e| matches!(e, MeshEvent::RelayDiscovered(_))).await;
        match event {
            MeshEvent::RelayDiscovered(relay) => {
                assert_eq!(relay.node_id, "b");
                assert!(relay.endpoints.contains(&"memory://b".to_string()));
            }
            other => panic!("unexpected {other:?}"),
        }
        let top = a.get_top_relays(5).await;
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].node_id, "b");
    }

    #[tokio::test]
    async fn start_twice_fails() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a", test_config()).await;
        a.start().await.unwrap();
        assert!(matches!(a.start().await, Err(MeshError::AlreadyStarted)));
    }

    #[tokio::test]
    async fn workspace_gossip_and_query() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a", test_config()).await;
        let b = node(&network, "b", test_config()).await;
        let mut b_events = b.subscribe();
        a.start().await.unwrap();
        b.start().await.unwrap();
        wait_status(&a, |s| s.connections == 1).await;

        let topic = a.join_workspace("ws-1").await.unwrap();
        assert_eq!(topic, Topic::workspace("ws-1"));

        let event = next_matching(&mut b_events, |e| {
            matches!(e, MeshEvent::WorkspacePeerJoined { .. })
        })
        .await;
        assert_eq!(
            event,
            MeshEvent::WorkspacePeerJoined {
                topic,
                node_id: "a".to_string()
            }
        );

        // a answers for itself; b has not joined.
        let peers = b.query_workspace_peers("ws-1").await.unwrap();
        assert_eq!(peers, vec!["a".to_string()]);
        assert!(b.query_workspace_peers("ws-other").await.unwrap().is_empty());

        a.leave_workspace("ws-1").await.unwrap();
        next_matching(&mut b_events, |e| matches!(e, MeshEvent::WorkspacePeerLeft { .. })).await;
        assert_eq!(b.status().await.tracked_topics, 0);
    }

    #[tokio::test]
    async fn join_workspace_requires_start() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a", test_config()).await;
        assert!(matches!(a.join_workspace("ws").await, Err(MeshError::NotStarted)));
        a.start().await.unwrap();
        assert!(matches!(a.join_workspace("").await, Err(MeshError::InvalidWorkspace)));
    }

    #[tokio::test]
    async fn spoofed_relay_announce_is_ignored() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a", test_config()).await;
        a.start().await.unwrap();

        let mut mallory = raw_peer(&network, "mallory").await;
        let mut forged = RelayInfo {
            node_id: "victim".to_string(),
            endpoints: vec!["wss://evil.example".to_string()],
            capabilities: Capabilities::default(),
            protocol_version: PROTOCOL_VERSION,
            uptime_secs: 1_000_000,
            last_seen: 0,
        };
        let line = encode_line(&MeshMessage::RelayAnnounce {
            relay: forged.clone(),
        });
        mallory.writer.write_all(&line).await.unwrap();

        forged.node_id = "mallory".to_string();
        let line = encode_line(&MeshMessage::RelayAnnounce { relay: forged });
        mallory.writer.write_all(&line).await.unwrap();

        wait_status(&a, |s| s.known_relays == 1).await;
        let top = a.get_top_relays(10).await;
        assert_eq!(top[0].node_id, "mallory");
    }

    #[tokio::test]
    async fn bootstrap_acceptance_is_bounded() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a", test_config()).await;
        a.start().await.unwrap();

        let mut raw = raw_peer(&network, "raw").await;
        let relays: Vec<RelayInfo> = (0..120)
            .map(|i| RelayInfo {
                node_id: format!("r{i}"),
                endpoints: Vec::new(),
                capabilities: Capabilities::default(),
                protocol_version: PROTOCOL_VERSION,
                uptime_secs: 0,
                last_seen: u64::MAX,
            })
            .collect();
        let line = encode_line(&MeshMessage::BootstrapResponse { relays });
        raw.writer.write_all(&line).await.unwrap();

        wait_status(&a, |s| s.known_relays == 50).await;
        // Future last-seen claims are clamped to the local clock.
        let top = a.get_top_relays(1).await;
        assert!(top[0].last_seen <= now_ms());
    }

    #[tokio::test]
    async fn oversized_frame_destroys_link() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a", test_config()).await;
        a.start().await.unwrap();

        let SwarmConnection {
            mut reader,
            mut writer,
            ..
        } = raw_peer(&network, "flooder").await;
        wait_status(&a, |s| s.connections == 1).await;

        let write = tokio::spawn(async move {
            let chunk = vec![b'x'; 1024 * 1024];
            for _ in 0..11 {
                if writer.write_all(&chunk).await.is_err() {
                    break;
                }
            }
        });

        // The participant drops its end: reads reach EOF.
        let drained = tokio::time::timeout(Duration::from_secs(10), async {
            let mut sink = Vec::new();
            let _ = reader.read_to_end(&mut sink).await;
        })
        .await;
        assert!(drained.is_ok());
        wait_status(&a, |s| s.connections == 0).await;
        write.abort();
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a", test_config()).await;
        a.start().await.unwrap();

        let SwarmConnection {
            reader, mut writer, ..
        } = raw_peer(&network, "prober").await;
        writer
            .write_all(&encode_line(&MeshMessage::Ping { timestamp: 42 }))
            .await
            .unwrap();

        let mut decoder = LineDecoder::default();
        let mut reader = reader;
        let mut buf = vec![0u8; 4096];
        let pong = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let n = reader.read(&mut buf).await.unwrap();
                for msg in decoder.push(&buf[..n]).unwrap() {
                    if let MeshMessage::Pong { timestamp } = msg {
                        return timestamp;
                    }
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(pong, 42);
    }

    #[tokio::test]
    async fn shutdown_announces_departure() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a", test_config()).await;
        let b = node(&network, "b", test_config()).await;
        let mut a_events = a.subscribe();
        let mut b_events = b.subscribe();
        a.start().await.unwrap();
        b.start().await.unwrap();
        wait_status(&a, |s| s.connections == 1).await;

        a.join_workspace("ws-1").await.unwrap();
        next_matching(&mut b_events, |e| matches!(e, MeshEvent::WorkspacePeerJoined { .. })).await;

        a.shutdown().await.unwrap();
        let left = next_matching(&mut b_events, |e| {
            matches!(e, MeshEvent::WorkspacePeerLeft { .. })
        })
        .await;
        assert_eq!(
            left,
            MeshEvent::WorkspacePeerLeft {
                topic: Topic::workspace("ws-1"),
                node_id: "a".to_string()
            }
        );
        next_matching(&mut a_events, |e| matches!(e, MeshEvent::Stopped)).await;
        assert!(!a.is_running());
        // Second shutdown is a no-op.
        a.shutdown().await.unwrap();
    }
}
