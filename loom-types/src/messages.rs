//! Signaling frames exchanged over the WebSocket.
//!
//! Every frame is a JSON object with a `type` discriminator. Field names are
//! camelCase on the wire.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ErrorCode, PeerId, SessionToken};

/// Room-table prefix for P2P discovery topics.
pub const TOPIC_ROOM_PREFIX: &str = "p2p:";

/// Frames sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Join a room (leaving any previous room first).
    #[serde(rename = "join")]
    Join(Join),
    /// Leave the current room.
    #[serde(rename = "leave")]
    Leave,
    /// Forward a WebRTC signal to a peer in the same room.
    #[serde(rename = "signal")]
    Signal(Signal),
    /// Join a P2P discovery topic.
    #[serde(rename = "join-topic")]
    JoinTopic(TopicRequest),
    /// Leave a P2P discovery topic.
    #[serde(rename = "leave-topic")]
    LeaveTopic(TopicRequest),
    /// Ask for the union of peers across all joined topics.
    #[serde(rename = "peer-request")]
    PeerRequest,
    /// Rebroadcast a self-description to topic co-members.
    #[serde(rename = "peer-announce")]
    PeerAnnounce(PeerAnnounce),
    /// Forward a WebRTC signal to a peer found in the sender's rooms/topics.
    #[serde(rename = "webrtc-signal")]
    WebrtcSignal(WebrtcSignal),
    /// Relay an opaque payload to one co-topic peer.
    #[serde(rename = "relay-message")]
    RelayMessage(RelayMessage),
    /// Relay an opaque payload to every co-topic peer.
    #[serde(rename = "relay-broadcast")]
    RelayBroadcast(RelayBroadcast),
    /// Opt the workspace into encrypted persistence.
    #[serde(rename = "enable_persistence")]
    EnablePersistence(EnablePersistence),
    /// Store a ciphertext blob for a document.
    #[serde(rename = "store")]
    Store(Store),
    /// Fetch the stored ciphertext for a document.
    #[serde(rename = "sync_request")]
    SyncRequest(SyncRequest),
    /// Application-level keepalive.
    #[serde(rename = "ping")]
    Ping,
    /// Reply to a server ping.
    #[serde(rename = "pong")]
    Pong,
}

impl ClientMessage {
    /// Parse a text frame.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Wire name of the frame type, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Join(_) => "join",
            Self::Leave => "leave",
            Self::Signal(_) => "signal",
            Self::JoinTopic(_) => "join-topic",
            Self::LeaveTopic(_) => "leave-topic",
            Self::PeerRequest => "peer-request",
            Self::PeerAnnounce(_) => "peer-announce",
            Self::WebrtcSignal(_) => "webrtc-signal",
            Self::RelayMessage(_) => "relay-message",
            Self::RelayBroadcast(_) => "relay-broadcast",
            Self::EnablePersistence(_) => "enable_persistence",
            Self::Store(_) => "store",
            Self::SyncRequest(_) => "sync_request",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }
}

/// Join a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Join {
    /// Room to join.
    pub room_id: String,
    /// Optional profile shown to other peers (size-capped by the relay).
    #[serde(default)]
    pub profile: Option<Value>,
    /// HMAC-derived token bound to the room.
    #[serde(default)]
    pub auth_token: Option<String>,
}

/// Forward a signal to a peer in the same room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    /// Target peer id.
    pub to: PeerId,
    /// Opaque signaling payload.
    pub signal: Value,
}

/// Join or leave a P2P topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicRequest {
    /// Topic identifier (without the `p2p:` prefix).
    pub topic: String,
    /// HMAC-derived token bound to the topic room.
    #[serde(default)]
    pub auth_token: Option<String>,
}

/// Self-description broadcast to topic co-members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerAnnounce {
    /// Opaque peer description.
    pub info: Value,
}

/// WebRTC signal for a specific peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebrtcSignal {
    /// Target peer id.
    pub target_peer_id: PeerId,
    /// Opaque signaling payload.
    pub signal: Value,
}

/// Relay a payload to one peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayMessage {
    /// Target peer id.
    pub target_peer_id: PeerId,
    /// Opaque payload (encrypted envelope or legacy plaintext).
    pub payload: Value,
}

/// Relay a payload to all co-topic peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayBroadcast {
    /// Restrict the broadcast to one of the sender's topics.
    #[serde(default)]
    pub topic: Option<String>,
    /// Opaque payload (encrypted envelope or legacy plaintext).
    pub payload: Value,
}

/// Opt a workspace into persistence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnablePersistence {
    /// Workspace id; defaults to the sender's current room.
    #[serde(default)]
    pub workspace_id: Option<String>,
}

/// Store a ciphertext blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Store {
    /// Document the blob belongs to.
    pub doc_id: String,
    /// Base64 ciphertext.
    pub data: String,
    /// `true` appends to the update log, `false` replaces the full state.
    #[serde(default)]
    pub is_update: bool,
    /// Workspace id; defaults to the sender's current room.
    #[serde(default)]
    pub workspace_id: Option<String>,
}

/// Fetch the stored ciphertext for a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    /// Document to fetch.
    pub doc_id: String,
    /// Workspace id; defaults to the sender's current room.
    #[serde(default)]
    pub workspace_id: Option<String>,
}

/// A peer as listed to other peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    /// Peer id.
    pub peer_id: PeerId,
    /// Profile supplied at join time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<Value>,
}

/// Ciphertext returned by `sync_request`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPayload {
    /// Base64 full-state blob, if one was stored.
    pub state: Option<String>,
    /// Base64 incremental updates in insertion order.
    pub updates: Vec<String>,
}

/// Frames sent by the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Sent once on accept.
    #[serde(rename = "welcome", rename_all = "camelCase")]
    Welcome {
        /// Id assigned to this connection.
        peer_id: PeerId,
        /// Bearer token for the HTTP invite API.
        session_token: SessionToken,
    },
    /// Reply to `join`.
    #[serde(rename = "joined", rename_all = "camelCase")]
    Joined {
        /// Room joined.
        room_id: String,
        /// Peers already present.
        peers: Vec<PeerSummary>,
        /// Whether the workspace opted into persistence.
        persisted: bool,
    },
    /// A peer joined a room or topic the receiver is in.
    #[serde(rename = "peer_joined", rename_all = "camelCase")]
    PeerJoined {
        /// Room or `p2p:<topic>` key.
        room_id: String,
        /// Peer that joined.
        peer_id: PeerId,
        /// Profile supplied at join time.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        profile: Option<Value>,
    },
    /// A peer left a room or topic the receiver is in.
    #[serde(rename = "peer_left", rename_all = "camelCase")]
    PeerLeft {
        /// Room or `p2p:<topic>` key.
        room_id: String,
        /// Peer that left.
        peer_id: PeerId,
    },
    /// Forwarded room signal.
    #[serde(rename = "signal")]
    Signal {
        /// Sender peer id.
        from: PeerId,
        /// Opaque signaling payload.
        signal: Value,
    },
    /// Reply to `join-topic`.
    #[serde(rename = "topic-joined")]
    TopicJoined {
        /// Topic joined.
        topic: String,
        /// Peers already in the topic.
        peers: Vec<PeerId>,
    },
    /// Reply to `leave-topic`.
    #[serde(rename = "topic-left")]
    TopicLeft {
        /// Topic left.
        topic: String,
    },
    /// Reply to `peer-request`.
    #[serde(rename = "peer-list")]
    PeerList {
        /// Union of peers across the requester's topics.
        peers: Vec<PeerSummary>,
    },
    /// Forwarded self-description.
    #[serde(rename = "peer-announce", rename_all = "camelCase")]
    PeerAnnounce {
        /// Announcing peer.
        peer_id: PeerId,
        /// Opaque peer description.
        info: Value,
    },
    /// Forwarded WebRTC signal.
    #[serde(rename = "webrtc-signal", rename_all = "camelCase")]
    WebrtcSignal {
        /// Sender peer id.
        from_peer_id: PeerId,
        /// Opaque signaling payload.
        signal: Value,
    },
    /// Forwarded direct relay payload.
    #[serde(rename = "relay-message", rename_all = "camelCase")]
    RelayMessage {
        /// Sender peer id.
        from_peer_id: PeerId,
        /// Payload as forwarded.
        payload: Value,
    },
    /// Forwarded broadcast relay payload.
    #[serde(rename = "relay-broadcast", rename_all = "camelCase")]
    RelayBroadcast {
        /// Sender peer id.
        from_peer_id: PeerId,
        /// Topic the broadcast was scoped to, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        topic: Option<String>,
        /// Payload as forwarded.
        payload: Value,
    },
    /// Reply to `enable_persistence`.
    #[serde(rename = "persistence_enabled", rename_all = "camelCase")]
    PersistenceEnabled {
        /// Workspace that opted in.
        workspace_id: String,
    },
    /// Reply to `store`.
    #[serde(rename = "stored", rename_all = "camelCase")]
    Stored {
        /// Document stored.
        doc_id: String,
    },
    /// Reply to `sync_request`; `data` is null when the workspace opted out.
    #[serde(rename = "sync_response", rename_all = "camelCase")]
    SyncResponse {
        /// Document requested.
        doc_id: String,
        /// Stored ciphertext, or null.
        data: Option<SyncPayload>,
    },
    /// Application-level keepalive.
    #[serde(rename = "ping")]
    Ping,
    /// Reply to a client ping.
    #[serde(rename = "pong")]
    Pong,
    /// Typed error reply.
    #[serde(rename = "error")]
    Error {
        /// Error code.
        error: ErrorCode,
        /// Optional human-readable detail.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl ServerMessage {
    /// Build an error reply without detail.
    pub fn error(code: ErrorCode) -> Self {
        Self::Error {
            error: code,
            message: None,
        }
    }

    /// Serialize to a text frame.
    pub fn to_json(&self) -> String {
        // Every variant holds only strings, bools and `Value`s.
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"type":"error","error":"invalid_message"}"#.to_string()
        })
    }
}
