//! Gossip messages exchanged between mesh nodes.
//!
//! One JSON object per line, discriminated by `type`.

use serde::{Deserialize, Serialize};

/// Mesh protocol version advertised in relay announcements.
pub const PROTOCOL_VERSION: u32 = 1;

/// Capability flags a relay advertises.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    /// Node bridges WebSocket clients into the mesh.
    #[serde(default)]
    pub relay: bool,
    /// Node offers encrypted persistence.
    #[serde(default)]
    pub persistence: bool,
}

/// A routing table entry describing one relay node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayInfo {
    /// Swarm identity of the relay.
    pub node_id: String,
    /// Advertised addresses (e.g. `wss://relay.example.com`).
    #[serde(default)]
    pub endpoints: Vec<String>,
    /// Capability flags.
    #[serde(default)]
    pub capabilities: Capabilities,
    /// Mesh protocol version.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u32,
    /// Self-reported uptime in seconds.
    #[serde(default)]
    pub uptime_secs: u64,
    /// Unix milliseconds at which this entry was last refreshed.
    #[serde(default)]
    pub last_seen: u64,
}

fn default_protocol_version() -> u32 {
    PROTOCOL_VERSION
}

/// Direction of a workspace announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceAction {
    /// Sender joined the topic.
    Join,
    /// Sender left the topic.
    Leave,
}

/// Messages exchanged over a mesh connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MeshMessage {
    /// A relay describes itself.
    RelayAnnounce {
        /// The announcing relay.
        relay: RelayInfo,
    },
    /// Ask for the peer's known relays.
    BootstrapRequest,
    /// Known relays, newest first.
    BootstrapResponse {
        /// Relay entries.
        relays: Vec<RelayInfo>,
    },
    /// Ask who is in a workspace topic.
    #[serde(rename_all = "camelCase")]
    WorkspaceQuery {
        /// Correlates responses with the query.
        request_id: String,
        /// Hex topic.
        topic: String,
    },
    /// Answer to a workspace query.
    #[serde(rename_all = "camelCase")]
    WorkspaceResponse {
        /// The query's request id.
        request_id: String,
        /// Hex topic.
        topic: String,
        /// Node ids known to be in the topic.
        peers: Vec<String>,
    },
    /// Join/leave gossip for a workspace topic.
    WorkspaceAnnounce {
        /// Hex topic.
        topic: String,
        /// Join or leave.
        action: WorkspaceAction,
    },
    /// Liveness probe.
    Ping {
        /// Sender's unix milliseconds.
        timestamp: u64,
    },
    /// Liveness reply echoing the ping timestamp.
    Pong {
        /// Timestamp from the ping.
        timestamp: u64,
    },
}

impl MeshMessage {
    /// Wire name of the message type, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RelayAnnounce { .. } => "relay-announce",
            Self::BootstrapRequest => "bootstrap-request",
            Self::BootstrapResponse { .. } => "bootstrap-response",
            Self::WorkspaceQuery { .. } => "workspace-query",
            Self::WorkspaceResponse { .. } => "workspace-response",
            Self::WorkspaceAnnounce { .. } => "workspace-announce",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
        }
    }
}
