//! Room and topic broker for signaling connections.
//!
//! The broker is independent of the socket: [`SignalingServer::connect`]
//! registers a connection and hands back the receiving end of its outbound
//! queue, [`SignalingServer::handle_text`] processes one inbound frame, and
//! [`SignalingServer::disconnect`] removes every trace of the connection.
//! The WebSocket session in [`crate::session`] pumps frames between the two.
//!
//! ## Tables
//!
//! - `peers`: per-connection state (room, topics, profile, limiter, token)
//! - `rooms`: room key → members; topic rooms are keyed `p2p:<topic>`
//! - `room_tokens`: room key → first registered auth token
//! - `sessions`: session token → peer
//!
//! Guards on `peers` are never held while `rooms` is accessed.

use crate::config::LimitsConfig;
use crate::error::{SignalError, SignalResult};
use crate::limits::MessageLimiter;
use crate::server::RelayMetrics;
use crate::storage::{RelayStorage, SqliteStorage};
use base64::{engine::general_purpose::STANDARD, Engine};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use loom_crypto::constant_time_eq;
use loom_mesh::MeshParticipant;
use loom_types::envelope::{prepare_for_relay, sanitize_plaintext};
use loom_types::{
    ClientMessage, EnablePersistence, ErrorCode, Join, PeerAnnounce, PeerId, PeerSummary,
    RelayBroadcast, RelayMessage, ServerMessage, SessionToken, Signal, Store, SyncPayload,
    SyncRequest, TopicRequest, WebrtcSignal, TOPIC_ROOM_PREFIX,
};
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Maximum length of a room id, topic or workspace id.
pub const MAX_ROOM_ID_LEN: usize = 256;

/// Maximum length of a document id.
pub const MAX_DOC_ID_LEN: usize = 256;

/// Frames buffered per connection before new frames are dropped.
pub const OUTBOUND_QUEUE_SIZE: usize = 1024;

/// Returns `true` if `id` is 1..=256 characters from `[A-Za-z0-9_\-:.]`.
pub fn is_valid_room_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_ROOM_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b':' | b'.'))
}

fn topic_key(topic: &str) -> String {
    format!("{TOPIC_ROOM_PREFIX}{topic}")
}

fn json_len(value: &Value) -> usize {
    serde_json::to_vec(value).map(|v| v.len()).unwrap_or(usize::MAX)
}

/// A freshly accepted connection.
#[derive(Debug)]
pub struct Connection {
    /// Id assigned to the connection.
    pub peer_id: PeerId,
    /// Bearer token valid while the connection is open.
    pub session_token: SessionToken,
    /// Frames to write to the socket, starting with `welcome`.
    pub outbound: mpsc::Receiver<Arc<str>>,
}

struct PeerState {
    sender: mpsc::Sender<Arc<str>>,
    room: Option<String>,
    topics: HashSet<String>,
    profile: Option<Value>,
    limiter: MessageLimiter,
    session_token: SessionToken,
}

/// Result of removing a member from a room.
struct Departure {
    remaining: Vec<PeerId>,
    emptied: bool,
}

enum WorkspaceChange {
    Join(String),
    Leave(String),
}

/// Signaling broker.
pub struct SignalingServer {
    limits: LimitsConfig,
    storage: Arc<SqliteStorage>,
    persistence_available: bool,
    metrics: Arc<RelayMetrics>,
    peers: DashMap<PeerId, PeerState>,
    rooms: DashMap<String, HashSet<PeerId>>,
    room_tokens: DashMap<String, String>,
    sessions: DashMap<SessionToken, PeerId>,
    mesh: Option<mpsc::UnboundedSender<WorkspaceChange>>,
}

impl std::fmt::Debug for SignalingServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingServer")
            .field("peers", &self.peers.len())
            .field("rooms", &self.rooms.len())
            .field("mesh", &self.mesh.is_some())
            .finish_non_exhaustive()
    }
}

impl SignalingServer {
    /// Create a broker.
    ///
    /// `persistence_available` is false when durable storage is disabled; the
    /// persistence bridge then refuses `enable_persistence` and `store`.
    pub fn new(
        limits: LimitsConfig,
        storage: Arc<SqliteStorage>,
        persistence_available: bool,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        Self {
            limits,
            storage,
            persistence_available,
            metrics,
            peers: DashMap::new(),
            rooms: DashMap::new(),
            room_tokens: DashMap::new(),
            sessions: DashMap::new(),
            mesh: None,
        }
    }

    /// Mirror topic rooms onto the mesh: the first local member joins the
    /// workspace topic, the last one to leave leaves it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_mesh(mut self, mesh: Arc<MeshParticipant>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            // Applied in order so a quick join/leave pair cannot be reordered.
            while let Some(change) = rx.recv().await {
                let result = match &change {
                    WorkspaceChange::Join(topic) => mesh.join_workspace(topic).await.map(|_| ()),
                    WorkspaceChange::Leave(topic) => mesh.leave_workspace(topic).await,
                };
                if let Err(e) = result {
                    tracing::debug!("Mesh workspace update skipped: {}", e);
                }
            }
        });
        self.mesh = Some(tx);
        self
    }

    /// Register a new connection and queue its `welcome` frame.
    pub fn connect(&self) -> Connection {
        let peer_id = PeerId::random();
        let session_token = SessionToken::random();
        let (sender, outbound) = mpsc::channel(OUTBOUND_QUEUE_SIZE);

        let welcome = ServerMessage::Welcome {
            peer_id: peer_id.clone(),
            session_token: session_token.clone(),
        };
        let _ = sender.try_send(Arc::from(welcome.to_json()));

        self.peers.insert(
            peer_id.clone(),
            PeerState {
                sender,
                room: None,
                topics: HashSet::new(),
                profile: None,
                limiter: MessageLimiter::from_config(&self.limits),
                session_token: session_token.clone(),
            },
        );
        self.sessions.insert(session_token.clone(), peer_id.clone());
        self.metrics.connections_total.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Peer {} connected (total: {})", peer_id, self.peers.len());

        Connection {
            peer_id,
            session_token,
            outbound,
        }
    }

    /// Remove a connection from its room and every topic, then forget it.
    pub fn disconnect(&self, peer: &PeerId) {
        let Some((_, state)) = self.peers.remove(peer) else {
            return;
        };
        self.sessions.remove(&state.session_token);

        if let Some(room) = state.room {
            self.depart_and_notify(&room, peer);
        }
        for topic in state.topics {
            if self.depart_and_notify(&topic_key(&topic), peer) {
                self.mesh_change(WorkspaceChange::Leave(topic));
            }
        }
        tracing::debug!("Peer {} disconnected (total: {})", peer, self.peers.len());
    }

    /// Peer that owns a session token, if its socket is still open.
    pub fn session_peer(&self, token: &str) -> Option<PeerId> {
        let token = SessionToken::parse(token)?;
        self.sessions.get(&token).map(|p| p.value().clone())
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.peers.len()
    }

    /// Number of non-empty rooms (excluding topic rooms).
    pub fn room_count(&self) -> usize {
        self.rooms
            .iter()
            .filter(|e| !e.key().starts_with(TOPIC_ROOM_PREFIX))
            .count()
    }

    /// Number of non-empty topic rooms.
    pub fn topic_count(&self) -> usize {
        self.rooms
            .iter()
            .filter(|e| e.key().starts_with(TOPIC_ROOM_PREFIX))
            .count()
    }

    /// Members of a room key, sorted.
    pub fn members(&self, room_key: &str) -> Vec<PeerId> {
        let mut members: Vec<PeerId> = self
            .rooms
            .get(room_key)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    /// Process one text frame from `peer`.
    ///
    /// Errors are reported to the peer, never returned.
    pub async fn handle_text(&self, peer: &PeerId, text: &str) {
        let allowed = match self.peers.get(peer) {
            Some(state) => state.limiter.check().is_ok(),
            None => return,
        };
        self.metrics.messages_total.fetch_add(1, Ordering::Relaxed);
        if !allowed {
            self.metrics.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
            self.reply(peer, &ServerMessage::error(ErrorCode::RateLimited));
            return;
        }

        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(_) => {
                self.fail(peer, ErrorCode::InvalidJson);
                return;
            }
        };
        let message: ClientMessage = match serde_json::from_value(value) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!("Peer {} sent an unrecognised frame: {}", peer, e);
                self.fail(peer, ErrorCode::InvalidMessage);
                return;
            }
        };

        let kind = message.kind();
        if let Err(e) = self.dispatch(peer, message).await {
            tracing::debug!("Peer {} {} rejected: {}", peer, kind, e.code);
            self.fail(peer, e.code);
        }
    }

    async fn dispatch(&self, peer: &PeerId, message: ClientMessage) -> SignalResult<()> {
        match message {
            ClientMessage::Join(join) => self.join(peer, join).await,
            ClientMessage::Leave => {
                self.leave(peer);
                Ok(())
            }
            ClientMessage::Signal(signal) => self.signal(peer, signal),
            ClientMessage::JoinTopic(req) => self.join_topic(peer, req),
            ClientMessage::LeaveTopic(req) => self.leave_topic(peer, req),
            ClientMessage::PeerRequest => {
                self.peer_request(peer);
                Ok(())
            }
            ClientMessage::PeerAnnounce(announce) => self.peer_announce(peer, announce),
            ClientMessage::WebrtcSignal(signal) => self.webrtc_signal(peer, signal),
            ClientMessage::RelayMessage(msg) => self.relay_message(peer, msg),
            ClientMessage::RelayBroadcast(msg) => self.relay_broadcast(peer, msg),
            ClientMessage::EnablePersistence(req) => self.enable_persistence(peer, req).await,
            ClientMessage::Store(store) => self.store(peer, store).await,
            ClientMessage::SyncRequest(req) => self.sync_request(peer, req).await,
            ClientMessage::Ping => {
                self.reply(peer, &ServerMessage::Pong);
                Ok(())
            }
            ClientMessage::Pong => Ok(()),
        }
    }

    // ── rooms ────────────────────────────────────────────────────────────

    async fn join(&self, peer: &PeerId, join: Join) -> SignalResult<()> {
        let room = join.room_id;
        if !is_valid_room_id(&room) || room.starts_with(TOPIC_ROOM_PREFIX) {
            return Err(ErrorCode::InvalidRoom.into());
        }
        let profile = self.check_profile(join.profile)?;
        let token = join.auth_token.filter(|t| !t.is_empty());

        let current = match self.peers.get(peer) {
            Some(state) => state.room.clone(),
            None => return Ok(()),
        };
        if current.as_deref() == Some(room.as_str()) {
            let peers = self.members(&room).into_iter().filter(|p| p != peer).collect::<Vec<_>>();
            let persisted = self.room_persisted(&room).await;
            self.reply(
                peer,
                &ServerMessage::Joined {
                    room_id: room,
                    peers: self.summaries(&peers),
                    persisted,
                },
            );
            return Ok(());
        }

        // The previous room is only left once the new one has accepted us.
        self.check_auth(&room, token.as_deref())?;
        let existing = self.admit(&room, peer)?;
        self.register_token(&room, token.as_deref(), peer)?;
        self.leave(peer);

        if let Some(mut state) = self.peers.get_mut(peer) {
            state.room = Some(room.clone());
            state.profile = profile.clone();
        }

        let persisted = self.room_persisted(&room).await;

        tracing::debug!("Peer {} joined room {} ({} already present)", peer, room, existing.len());
        self.reply(
            peer,
            &ServerMessage::Joined {
                room_id: room.clone(),
                peers: self.summaries(&existing),
                persisted,
            },
        );
        self.broadcast(
            &existing,
            &ServerMessage::PeerJoined {
                room_id: room,
                peer_id: peer.clone(),
                profile,
            },
        );
        Ok(())
    }

    async fn room_persisted(&self, room: &str) -> bool {
        if !self.persistence_available {
            return false;
        }
        self.storage.is_persistence_enabled(room).await.unwrap_or_else(|e| {
            tracing::error!("Failed to read persistence flag for {}: {}", room, e);
            false
        })
    }

    fn leave(&self, peer: &PeerId) {
        let room = self.peers.get_mut(peer).and_then(|mut s| s.room.take());
        if let Some(room) = room {
            self.depart_and_notify(&room, peer);
        }
    }

    fn signal(&self, peer: &PeerId, signal: Signal) -> SignalResult<()> {
        let room = self
            .peers
            .get(peer)
            .and_then(|s| s.room.clone())
            .ok_or(SignalError::from(ErrorCode::NotInRoom))?;
        if json_len(&signal.signal) > self.limits.max_signal_payload_bytes {
            return Err(ErrorCode::SignalPayloadTooLarge.into());
        }
        if signal.to == *peer || !self.is_member(&room, &signal.to) {
            tracing::debug!("Dropping signal from {}: target not in room {}", peer, room);
            return Ok(());
        }
        self.reply(
            &signal.to,
            &ServerMessage::Signal {
                from: peer.clone(),
                signal: signal.signal,
            },
        );
        Ok(())
    }

    // ── topics ───────────────────────────────────────────────────────────

    fn join_topic(&self, peer: &PeerId, req: TopicRequest) -> SignalResult<()> {
        let topic = req.topic;
        if !is_valid_room_id(&topic) {
            return Err(ErrorCode::InvalidTopic.into());
        }
        let key = topic_key(&topic);

        let (already_member, topic_total, profile) = match self.peers.get(peer) {
            Some(s) => (s.topics.contains(&topic), s.topics.len(), s.profile.clone()),
            None => return Ok(()),
        };
        if already_member {
            let peers = self.members(&key).into_iter().filter(|p| p != peer).collect();
            self.reply(peer, &ServerMessage::TopicJoined { topic, peers });
            return Ok(());
        }
        if topic_total >= self.limits.max_topics_per_peer {
            return Err(ErrorCode::TooManyTopics.into());
        }

        let token = req.auth_token.filter(|t| !t.is_empty());
        self.check_auth(&key, token.as_deref())?;
        let existing = self.admit(&key, peer)?;
        self.register_token(&key, token.as_deref(), peer)?;

        if let Some(mut state) = self.peers.get_mut(peer) {
            state.topics.insert(topic.clone());
        }
        if existing.is_empty() {
            self.mesh_change(WorkspaceChange::Join(topic.clone()));
        }

        let mut listed = existing.clone();
        listed.sort();
        self.reply(
            peer,
            &ServerMessage::TopicJoined {
                topic,
                peers: listed,
            },
        );
        self.broadcast(
            &existing,
            &ServerMessage::PeerJoined {
                room_id: key,
                peer_id: peer.clone(),
                profile,
            },
        );
        Ok(())
    }

    fn leave_topic(&self, peer: &PeerId, req: TopicRequest) -> SignalResult<()> {
        let removed = self
            .peers
            .get_mut(peer)
            .map(|mut s| s.topics.remove(&req.topic))
            .unwrap_or(false);
        if !removed {
            return Err(ErrorCode::NotInTopic.into());
        }
        if self.depart_and_notify(&topic_key(&req.topic), peer) {
            self.mesh_change(WorkspaceChange::Leave(req.topic.clone()));
        }
        self.reply(peer, &ServerMessage::TopicLeft { topic: req.topic });
        Ok(())
    }

    fn peer_request(&self, peer: &PeerId) {
        let peers = self.co_topic_peers(peer);
        self.reply(
            peer,
            &ServerMessage::PeerList {
                peers: self.summaries(&peers),
            },
        );
    }

    fn peer_announce(&self, peer: &PeerId, announce: PeerAnnounce) -> SignalResult<()> {
        self.require_topic(peer)?;
        if json_len(&announce.info) > self.limits.max_profile_bytes {
            return Err(ErrorCode::ProfilePayloadTooLarge.into());
        }
        let recipients = self.co_topic_peers(peer);
        self.broadcast(
            &recipients,
            &ServerMessage::PeerAnnounce {
                peer_id: peer.clone(),
                info: sanitize_plaintext(announce.info),
            },
        );
        Ok(())
    }

    fn webrtc_signal(&self, peer: &PeerId, signal: WebrtcSignal) -> SignalResult<()> {
        if json_len(&signal.signal) > self.limits.max_signal_payload_bytes {
            return Err(ErrorCode::SignalPayloadTooLarge.into());
        }
        let target = signal.target_peer_id;
        if target == *peer || !self.shares_any_room(peer, &target) {
            tracing::debug!("Dropping webrtc-signal from {}: target not reachable", peer);
            return Ok(());
        }
        self.reply(
            &target,
            &ServerMessage::WebrtcSignal {
                from_peer_id: peer.clone(),
                signal: signal.signal,
            },
        );
        Ok(())
    }

    // ── relay ────────────────────────────────────────────────────────────

    fn relay_message(&self, peer: &PeerId, msg: RelayMessage) -> SignalResult<()> {
        let topics = self.require_topic(peer)?;
        let size = json_len(&msg.payload);
        if size > self.limits.max_relay_payload_bytes {
            return Err(ErrorCode::RelayPayloadTooLarge.into());
        }
        let target = msg.target_peer_id;
        let reachable = target != *peer
            && topics
                .iter()
                .any(|topic| self.is_member(&topic_key(topic), &target));
        if !reachable {
            return Err(ErrorCode::RelayTargetNotFound.into());
        }

        self.metrics
            .bytes_relayed
            .fetch_add(size as u64, Ordering::Relaxed);
        self.reply(
            &target,
            &ServerMessage::RelayMessage {
                from_peer_id: peer.clone(),
                payload: prepare_for_relay(msg.payload),
            },
        );
        Ok(())
    }

    fn relay_broadcast(&self, peer: &PeerId, msg: RelayBroadcast) -> SignalResult<()> {
        let topics = self.require_topic(peer)?;
        let size = json_len(&msg.payload);
        if size > self.limits.max_relay_payload_bytes {
            return Err(ErrorCode::RelayPayloadTooLarge.into());
        }

        let recipients = match &msg.topic {
            Some(topic) if !topics.contains(topic) => {
                return Err(ErrorCode::NotInTopic.into());
            }
            Some(topic) => self
                .members(&topic_key(topic))
                .into_iter()
                .filter(|p| p != peer)
                .collect(),
            None => self.co_topic_peers(peer),
        };

        self.metrics
            .bytes_relayed
            .fetch_add((size * recipients.len()) as u64, Ordering::Relaxed);
        self.broadcast(
            &recipients,
            &ServerMessage::RelayBroadcast {
                from_peer_id: peer.clone(),
                topic: msg.topic,
                payload: prepare_for_relay(msg.payload),
            },
        );
        Ok(())
    }

    // ── persistence bridge ───────────────────────────────────────────────

    async fn enable_persistence(&self, peer: &PeerId, req: EnablePersistence) -> SignalResult<()> {
        if !self.persistence_available {
            return Err(ErrorCode::PersistenceDisabled.into());
        }
        let workspace = self.resolve_workspace(peer, req.workspace_id)?;
        self.storage.set_persistence(&workspace, true).await?;
        tracing::info!("Persistence enabled for workspace {}", workspace);
        self.reply(
            peer,
            &ServerMessage::PersistenceEnabled {
                workspace_id: workspace,
            },
        );
        Ok(())
    }

    async fn store(&self, peer: &PeerId, store: Store) -> SignalResult<()> {
        if !self.persistence_available {
            return Err(ErrorCode::PersistenceDisabled.into());
        }
        if store.doc_id.is_empty() || store.doc_id.len() > MAX_DOC_ID_LEN {
            return Err(ErrorCode::InvalidPayload.into());
        }
        let limit = self.limits.max_store_payload_bytes;
        if store.data.len() / 4 * 3 > limit + 2 {
            return Err(ErrorCode::StorePayloadTooLarge.into());
        }
        let blob = STANDARD
            .decode(store.data.as_bytes())
            .map_err(|_| SignalError::from(ErrorCode::InvalidPayload))?;
        if blob.is_empty() {
            return Err(ErrorCode::InvalidPayload.into());
        }
        if blob.len() > limit {
            return Err(ErrorCode::StorePayloadTooLarge.into());
        }

        let workspace = self.resolve_workspace(peer, store.workspace_id)?;
        if !self.storage.is_persistence_enabled(&workspace).await? {
            return Err(ErrorCode::PersistenceDisabled.into());
        }
        if store.is_update {
            self.storage
                .append_update(&workspace, &store.doc_id, &blob)
                .await?;
        } else {
            self.storage
                .store_document_state(&workspace, &store.doc_id, &blob)
                .await?;
        }
        self.storage.touch_workspace(&workspace).await?;

        self.metrics.blobs_stored.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .bytes_received
            .fetch_add(blob.len() as u64, Ordering::Relaxed);
        tracing::debug!(
            "Stored {} bytes for {}/{} (update: {})",
            blob.len(),
            workspace,
            store.doc_id,
            store.is_update
        );
        self.reply(peer, &ServerMessage::Stored { doc_id: store.doc_id });
        Ok(())
    }

    async fn sync_request(&self, peer: &PeerId, req: SyncRequest) -> SignalResult<()> {
        let workspace = self.resolve_workspace(peer, req.workspace_id)?;
        let enabled = self.persistence_available
            && self.storage.is_persistence_enabled(&workspace).await?;

        let data = if enabled {
            let stored = self.storage.load_document(&workspace, &req.doc_id).await?;
            let payload = match stored {
                Some(doc) => SyncPayload {
                    state: doc.state.map(|s| STANDARD.encode(s)),
                    updates: doc.updates.iter().map(|u| STANDARD.encode(u)).collect(),
                },
                None => SyncPayload {
                    state: None,
                    updates: Vec::new(),
                },
            };
            let sent = payload.state.as_ref().map_or(0, String::len)
                + payload.updates.iter().map(String::len).sum::<usize>();
            self.metrics
                .bytes_sent
                .fetch_add(sent as u64, Ordering::Relaxed);
            Some(payload)
        } else {
            None
        };

        self.reply(
            peer,
            &ServerMessage::SyncResponse {
                doc_id: req.doc_id,
                data,
            },
        );
        Ok(())
    }

    // ── helpers ──────────────────────────────────────────────────────────

    fn check_profile(&self, profile: Option<Value>) -> SignalResult<Option<Value>> {
        match profile {
            Some(p) if json_len(&p) > self.limits.max_profile_bytes => {
                Err(ErrorCode::ProfilePayloadTooLarge.into())
            }
            Some(p) => Ok(Some(sanitize_plaintext(p))),
            None => Ok(None),
        }
    }

    /// Compare `token` against the room's registered token.
    fn check_auth(&self, room_key: &str, token: Option<&str>) -> SignalResult<()> {
        let Some(registered) = self.room_tokens.get(room_key) else {
            return Ok(());
        };
        match token {
            None => Err(ErrorCode::RoomRequiresAuth.into()),
            Some(t) if constant_time_eq(registered.as_bytes(), t.as_bytes()) => Ok(()),
            Some(_) => Err(ErrorCode::AuthTokenMismatch.into()),
        }
    }

    /// Register `token` if the room has none yet (first write wins).
    ///
    /// If another join registered a different token in the meantime, the peer
    /// is removed again.
    fn register_token(&self, room_key: &str, token: Option<&str>, peer: &PeerId) -> SignalResult<()> {
        let Some(token) = token else {
            return Ok(());
        };
        let conflict = match self.room_tokens.entry(room_key.to_string()) {
            Entry::Vacant(entry) => {
                entry.insert(token.to_string());
                false
            }
            Entry::Occupied(entry) => !constant_time_eq(entry.get().as_bytes(), token.as_bytes()),
        };
        if conflict {
            self.depart(room_key, peer);
            return Err(ErrorCode::AuthTokenMismatch.into());
        }
        Ok(())
    }

    /// Add `peer` to a room, enforcing capacity. Returns the prior members.
    fn admit(&self, room_key: &str, peer: &PeerId) -> SignalResult<Vec<PeerId>> {
        let mut members = self.rooms.entry(room_key.to_string()).or_default();
        if members.contains(peer) {
            return Ok(members.iter().filter(|p| *p != peer).cloned().collect());
        }
        if members.len() >= self.limits.max_peers_per_room {
            return Err(ErrorCode::RoomFull.into());
        }
        let existing: Vec<PeerId> = members.iter().cloned().collect();
        members.insert(peer.clone());
        Ok(existing)
    }

    /// Remove `peer` from a room, deleting the room when it empties.
    fn depart(&self, room_key: &str, peer: &PeerId) -> Option<Departure> {
        let (remaining, emptied) = {
            let mut members = self.rooms.get_mut(room_key)?;
            if !members.remove(peer) {
                return None;
            }
            (
                members.iter().cloned().collect::<Vec<_>>(),
                members.is_empty(),
            )
        };
        if emptied
            && self
                .rooms
                .remove_if(room_key, |_, m| m.is_empty())
                .is_some()
        {
            self.room_tokens.remove(room_key);
        }
        Some(Departure { remaining, emptied })
    }

    /// Depart and tell the remaining members. Returns whether the room emptied.
    fn depart_and_notify(&self, room_key: &str, peer: &PeerId) -> bool {
        let Some(departure) = self.depart(room_key, peer) else {
            return false;
        };
        self.broadcast(
            &departure.remaining,
            &ServerMessage::PeerLeft {
                room_id: room_key.to_string(),
                peer_id: peer.clone(),
            },
        );
        departure.emptied
    }

    fn is_member(&self, room_key: &str, peer: &PeerId) -> bool {
        self.rooms
            .get(room_key)
            .map(|m| m.contains(peer))
            .unwrap_or(false)
    }

    /// Topics of `peer`, or `not_in_topic` if it has none.
    fn require_topic(&self, peer: &PeerId) -> SignalResult<Vec<String>> {
        let topics: Vec<String> = self
            .peers
            .get(peer)
            .map(|s| s.topics.iter().cloned().collect())
            .unwrap_or_default();
        if topics.is_empty() {
            return Err(ErrorCode::NotInTopic.into());
        }
        Ok(topics)
    }

    /// Union of members across the topics of `peer`, excluding itself.
    fn co_topic_peers(&self, peer: &PeerId) -> Vec<PeerId> {
        let topics: Vec<String> = self
            .peers
            .get(peer)
            .map(|s| s.topics.iter().cloned().collect())
            .unwrap_or_default();
        let mut union = BTreeSet::new();
        for topic in topics {
            if let Some(members) = self.rooms.get(&topic_key(&topic)) {
                union.extend(members.iter().filter(|p| *p != peer).cloned());
            }
        }
        union.into_iter().collect()
    }

    /// Whether `target` shares the room or any topic of `peer`.
    fn shares_any_room(&self, peer: &PeerId, target: &PeerId) -> bool {
        let keys: Vec<String> = match self.peers.get(peer) {
            Some(s) => s
                .room
                .iter()
                .cloned()
                .chain(s.topics.iter().map(|t| topic_key(t)))
                .collect(),
            None => return false,
        };
        keys.iter().any(|key| self.is_member(key, target))
    }

    fn resolve_workspace(&self, peer: &PeerId, requested: Option<String>) -> SignalResult<String> {
        let state = self
            .peers
            .get(peer)
            .ok_or(SignalError::from(ErrorCode::NotInRoom))?;
        match requested {
            Some(ws) if !is_valid_room_id(&ws) => Err(ErrorCode::InvalidRoom.into()),
            Some(ws) if state.room.as_deref() == Some(ws.as_str()) || state.topics.contains(&ws) => {
                Ok(ws)
            }
            Some(_) => Err(ErrorCode::NotInRoom.into()),
            None => state
                .room
                .clone()
                .ok_or(SignalError::from(ErrorCode::NotInRoom)),
        }
    }

    fn summaries(&self, peers: &[PeerId]) -> Vec<PeerSummary> {
        peers
            .iter()
            .map(|p| PeerSummary {
                peer_id: p.clone(),
                profile: self.peers.get(p).and_then(|s| s.profile.clone()),
            })
            .collect()
    }

    fn mesh_change(&self, change: WorkspaceChange) {
        if let Some(mesh) = &self.mesh {
            let _ = mesh.send(change);
        }
    }

    fn fail(&self, peer: &PeerId, code: ErrorCode) {
        self.metrics.errors_total.fetch_add(1, Ordering::Relaxed);
        self.reply(peer, &ServerMessage::error(code));
    }

    fn reply(&self, peer: &PeerId, message: &ServerMessage) {
        self.send_frame(peer, Arc::from(message.to_json()));
    }

    fn broadcast(&self, peers: &[PeerId], message: &ServerMessage) {
        if peers.is_empty() {
            return;
        }
        let frame: Arc<str> = Arc::from(message.to_json());
        for peer in peers {
            self.send_frame(peer, frame.clone());
        }
    }

    fn send_frame(&self, peer: &PeerId, frame: Arc<str>) {
        let Some(state) = self.peers.get(peer) else {
            return;
        };
        match state.sender.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("Outbound queue full for peer {}, dropping frame", peer);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("Peer {} outbound queue closed", peer);
            }
        }
    }
}
