//! Mesh participant configuration (the `[mesh]` table of `relay.toml`).

use serde::Deserialize;

/// Mesh participant configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MeshConfig {
    /// Join the relay mesh at startup (default: false).
    #[serde(default)]
    pub enabled: bool,
    /// Announce this node as a relay (default: true).
    #[serde(default = "default_relay")]
    pub relay: bool,
    /// Advertise the persistence capability. Set from the storage config.
    #[serde(default)]
    pub persistence: bool,
    /// Public addresses announced to the mesh (e.g. `wss://relay.example.com`).
    #[serde(default)]
    pub endpoints: Vec<String>,
    /// EndpointIds of mesh nodes to dial at startup.
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,
    /// Routing table capacity (default: 500).
    #[serde(default = "default_max_routing_table_size")]
    pub max_routing_table_size: usize,
    /// Entries accepted from one bootstrap response (default: 50).
    #[serde(default = "default_max_bootstrap_accept")]
    pub max_bootstrap_accept: usize,
    /// Workspace topics tracked from gossip (default: 1000).
    #[serde(default = "default_max_tracked_topics")]
    pub max_tracked_topics: usize,
    /// How long a workspace query collects answers, in ms (default: 3000).
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
    /// Interval between relay announcements and pings, in seconds (default: 30).
    #[serde(default = "default_announce_interval_secs")]
    pub announce_interval_secs: u64,
}

fn default_relay() -> bool {
    true
}

fn default_max_routing_table_size() -> usize {
    500
}

fn default_max_bootstrap_accept() -> usize {
    50
}

fn default_max_tracked_topics() -> usize {
    1000
}

fn default_query_timeout_ms() -> u64 {
    3000
}

fn default_announce_interval_secs() -> u64 {
    30
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            relay: default_relay(),
            persistence: false,
            endpoints: Vec::new(),
            bootstrap_peers: Vec::new(),
            max_routing_table_size: default_max_routing_table_size(),
            max_bootstrap_accept: default_max_bootstrap_accept(),
            max_tracked_topics: default_max_tracked_topics(),
            query_timeout_ms: default_query_timeout_ms(),
            announce_interval_secs: default_announce_interval_secs(),
        }
    }
}
