//! Prometheus metrics endpoint.

use crate::server::Relay;
use crate::storage::RelayStorage;
use axum::{http::header::CONTENT_TYPE, response::IntoResponse, Extension};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Prometheus metrics handler.
///
/// Returns metrics in Prometheus text format.
/// Includes both gauges (current state) and counters (monotonic since startup).
pub async fn metrics_handler(Extension(relay): Extension<Arc<Relay>>) -> impl IntoResponse {
    let m = relay.metrics();
    let signaling = relay.signaling();
    let persistence = relay.persistence();

    // Gauges: current state
    let connections = signaling.connection_count();
    let rooms = signaling.room_count();
    let topics = signaling.topic_count();
    let keys_loaded = persistence.keys_loaded();
    let awaiting_key = persistence.rooms_awaiting_key();
    let mesh_peers = relay.mesh().map_or(0, |mesh| mesh.connected_peers().len());

    // Counters: monotonic since startup
    let conns_total = m.connections_total.load(Ordering::Relaxed);
    let messages = m.messages_total.load(Ordering::Relaxed);
    let rate_limits = m.rate_limit_hits.load(Ordering::Relaxed);
    let errors = m.errors_total.load(Ordering::Relaxed);
    let relayed = m.bytes_relayed.load(Ordering::Relaxed);
    let blobs = m.blobs_stored.load(Ordering::Relaxed);
    let bytes_rx = m.bytes_received.load(Ordering::Relaxed);
    let bytes_tx = m.bytes_sent.load(Ordering::Relaxed);
    let keys = m.keys_delivered.load(Ordering::Relaxed);
    let invites = m.invites_created.load(Ordering::Relaxed);

    // Storage stats (async queries, best effort)
    let documents = relay.storage().get_total_documents().await.unwrap_or(0);
    let room_states = relay.storage().get_total_room_states().await.unwrap_or(0);
    let storage_bytes = relay.storage().get_total_storage_bytes().await.unwrap_or(0);

    let body = format!(
        r#"# HELP cipherloom_relay_connections_active Number of open WebSocket connections
# TYPE cipherloom_relay_connections_active gauge
cipherloom_relay_connections_active {connections}

# HELP cipherloom_relay_rooms_active Number of non-empty rooms
# TYPE cipherloom_relay_rooms_active gauge
cipherloom_relay_rooms_active {rooms}

# HELP cipherloom_relay_topics_active Number of non-empty topic rooms
# TYPE cipherloom_relay_topics_active gauge
cipherloom_relay_topics_active {topics}

# HELP cipherloom_relay_keys_loaded Room keys held in memory
# TYPE cipherloom_relay_keys_loaded gauge
cipherloom_relay_keys_loaded {keys_loaded}

# HELP cipherloom_relay_rooms_awaiting_key Rooms whose state load waits for a key
# TYPE cipherloom_relay_rooms_awaiting_key gauge
cipherloom_relay_rooms_awaiting_key {awaiting_key}

# HELP cipherloom_relay_mesh_peers Connected mesh peers
# TYPE cipherloom_relay_mesh_peers gauge
cipherloom_relay_mesh_peers {mesh_peers}

# HELP cipherloom_relay_info Server information
# TYPE cipherloom_relay_info gauge
cipherloom_relay_info{{version="{version}"}} 1

# HELP cipherloom_relay_connections_total Total connections accepted
# TYPE cipherloom_relay_connections_total counter
cipherloom_relay_connections_total {conns_total}

# HELP cipherloom_relay_messages_total Total signaling frames received
# TYPE cipherloom_relay_messages_total counter
cipherloom_relay_messages_total {messages}

# HELP cipherloom_relay_rate_limit_hits_total Total rate limit rejections
# TYPE cipherloom_relay_rate_limit_hits_total counter
cipherloom_relay_rate_limit_hits_total {rate_limits}

# HELP cipherloom_relay_errors_total Total error replies
# TYPE cipherloom_relay_errors_total counter
cipherloom_relay_errors_total {errors}

# HELP cipherloom_relay_bytes_relayed_total Total payload bytes relayed between peers
# TYPE cipherloom_relay_bytes_relayed_total counter
cipherloom_relay_bytes_relayed_total {relayed}

# HELP cipherloom_relay_blobs_stored_total Total blobs stored since startup
# TYPE cipherloom_relay_blobs_stored_total counter
cipherloom_relay_blobs_stored_total {blobs}

# HELP cipherloom_relay_bytes_received_total Total ciphertext bytes stored
# TYPE cipherloom_relay_bytes_received_total counter
cipherloom_relay_bytes_received_total {bytes_rx}

# HELP cipherloom_relay_bytes_sent_total Total ciphertext bytes returned by sync
# TYPE cipherloom_relay_bytes_sent_total counter
cipherloom_relay_bytes_sent_total {bytes_tx}

# HELP cipherloom_relay_keys_delivered_total Total room keys accepted
# TYPE cipherloom_relay_keys_delivered_total counter
cipherloom_relay_keys_delivered_total {keys}

# HELP cipherloom_relay_invites_created_total Total invites created
# TYPE cipherloom_relay_invites_created_total counter
cipherloom_relay_invites_created_total {invites}

# HELP cipherloom_relay_storage_documents Documents with stored ciphertext
# TYPE cipherloom_relay_storage_documents gauge
cipherloom_relay_storage_documents {documents}

# HELP cipherloom_relay_storage_room_states Rooms with persisted CRDT state
# TYPE cipherloom_relay_storage_room_states gauge
cipherloom_relay_storage_room_states {room_states}

# HELP cipherloom_relay_storage_bytes Total ciphertext bytes in database
# TYPE cipherloom_relay_storage_bytes gauge
cipherloom_relay_storage_bytes {storage_bytes}
"#,
        version = env!("CARGO_PKG_VERSION"),
    );

    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}
