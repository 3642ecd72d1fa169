//! Health check endpoint.

use crate::server::Relay;
use axum::{Extension, Json};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

/// Global start time for uptime calculation.
static START_TIME: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

/// Initialize the start time (call once at startup).
pub fn init_start_time() {
    START_TIME.get_or_init(Instant::now);
}

/// Health status response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    /// Overall status.
    pub status: String,
    /// Server version.
    pub version: String,
    /// Number of open WebSocket connections.
    pub connections: usize,
    /// Number of non-empty rooms.
    pub rooms: usize,
    /// Number of non-empty topic rooms.
    pub topics: usize,
    /// Uptime in seconds.
    pub uptime_seconds: u64,
    /// Whether durable persistence is available.
    pub persistence: bool,
    /// Whether the relay participates in the mesh.
    pub mesh: bool,
}

/// Health check handler.
pub async fn health_handler(Extension(relay): Extension<Arc<Relay>>) -> Json<HealthStatus> {
    let uptime = START_TIME
        .get()
        .map(|start| start.elapsed().as_secs())
        .unwrap_or(0);
    let signaling = relay.signaling();

    Json(HealthStatus {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        connections: signaling.connection_count(),
        rooms: signaling.room_count(),
        topics: signaling.topic_count(),
        uptime_seconds: uptime,
        persistence: relay.storage_enabled(),
        mesh: relay.mesh().map_or(false, |m| m.is_running()),
    })
}
