//! Relay root: owns storage, the signaling broker, persistence and keys.
//!
//! `Relay` is shared behind an `Arc` by the HTTP layer, the WebSocket
//! sessions and the cleanup task.

use crate::config::Config;
use crate::keys::KeyRegistry;
use crate::limits::RateLimits;
use crate::persistence::PersistenceCoordinator;
use crate::signaling::SignalingServer;
use crate::storage::SqliteStorage;
use loom_mesh::MeshParticipant;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tokio::sync::watch;

/// Operational metrics for monitoring relay activity.
///
/// All counters are monotonically increasing (reset only on restart).
/// Thread-safe via `AtomicU64`, no locks needed for incrementing.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    /// Total WebSocket connections accepted.
    pub connections_total: AtomicU64,
    /// Total signaling frames received.
    pub messages_total: AtomicU64,
    /// Total rate limit rejections (messages + key deliveries).
    pub rate_limit_hits: AtomicU64,
    /// Total error replies sent to clients.
    pub errors_total: AtomicU64,
    /// Total payload bytes forwarded by relay-message/relay-broadcast.
    pub bytes_relayed: AtomicU64,
    /// Total blobs stored through the persistence bridge.
    pub blobs_stored: AtomicU64,
    /// Total ciphertext bytes received by `store`.
    pub bytes_received: AtomicU64,
    /// Total base64 bytes returned by `sync_request`.
    pub bytes_sent: AtomicU64,
    /// Total room keys accepted.
    pub keys_delivered: AtomicU64,
    /// Total invites created.
    pub invites_created: AtomicU64,
}

/// Main relay server.
pub struct Relay {
    config: Config,
    storage: Arc<SqliteStorage>,
    rate_limits: RateLimits,
    metrics: Arc<RelayMetrics>,
    signaling: Arc<SignalingServer>,
    persistence: Arc<PersistenceCoordinator>,
    keys: KeyRegistry,
    mesh: Option<Arc<MeshParticipant>>,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("config", &self.config)
            .field("rate_limits", &self.rate_limits)
            .field("metrics", &self.metrics)
            .field("signaling", &self.signaling)
            .field("mesh", &self.mesh.is_some())
            .finish_non_exhaustive()
    }
}

impl Relay {
    /// Create a relay with the given config and storage.
    ///
    /// With a mesh participant, topic rooms are mirrored onto the mesh. Must
    /// be called from within a tokio runtime in that case.
    pub fn new(config: Config, storage: SqliteStorage, mesh: Option<Arc<MeshParticipant>>) -> Self {
        let storage = Arc::new(storage);
        let metrics = Arc::new(RelayMetrics::default());
        let rate_limits = RateLimits::new(&config.limits);

        let mut signaling = SignalingServer::new(
            config.limits.clone(),
            storage.clone(),
            config.storage.enabled,
            metrics.clone(),
        );
        if let Some(mesh) = &mesh {
            signaling = signaling.with_mesh(mesh.clone());
        }

        let persistence = PersistenceCoordinator::new(
            storage.clone(),
            config.persistence.encrypted,
            config.persistence.debounce(),
        );
        let keys = KeyRegistry::new(persistence.clone());

        Self {
            config,
            storage,
            rate_limits,
            metrics,
            signaling: Arc::new(signaling),
            persistence,
            keys,
            mesh,
            shutdown: watch::channel(false).0,
        }
    }

    /// Get the relay configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get access to the storage layer.
    pub fn storage(&self) -> &SqliteStorage {
        &self.storage
    }

    /// Get a clone of the storage Arc for background tasks.
    pub fn storage_arc(&self) -> Arc<SqliteStorage> {
        self.storage.clone()
    }

    /// Whether durable storage is enabled.
    pub fn storage_enabled(&self) -> bool {
        self.config.storage.enabled
    }

    /// Get access to the rate limiters.
    pub fn rate_limits(&self) -> &RateLimits {
        &self.rate_limits
    }

    /// Get access to the operational metrics.
    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    /// Signaling broker.
    pub fn signaling(&self) -> &SignalingServer {
        &self.signaling
    }

    /// Persistence coordinator for CRDT bindings.
    pub fn persistence(&self) -> &Arc<PersistenceCoordinator> {
        &self.persistence
    }

    /// Room key registry.
    pub fn keys(&self) -> &KeyRegistry {
        &self.keys
    }

    /// Mesh participant, if the mesh is enabled.
    pub fn mesh(&self) -> Option<&Arc<MeshParticipant>> {
        self.mesh.as_ref()
    }

    /// Receiver that flips to `true` when [`Relay::shutdown`] starts.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Close every WebSocket session, flush pending persistence writes and
    /// leave the mesh.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        self.persistence.flush_all().await;
        if let Some(mesh) = &self.mesh {
            if let Err(e) = mesh.shutdown().await {
                tracing::warn!("Mesh shutdown failed: {}", e);
            }
        }
        tracing::info!("Relay shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_mesh::{MemoryNetwork, MeshConfig};
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn new_relay_is_empty() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let relay = Relay::new(Config::default(), storage, None);

        assert_eq!(relay.signaling().connection_count(), 0);
        assert_eq!(relay.keys().owned_rooms(), 0);
        assert!(relay.persistence().is_encrypted());
        assert!(relay.storage_enabled());
        assert!(relay.mesh().is_none());
    }

    #[tokio::test]
    async fn signaling_shares_relay_metrics() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let relay = Relay::new(Config::default(), storage, None);

        let conn = relay.signaling().connect();
        relay.signaling().handle_text(&conn.peer_id, r#"{"type":"ping"}"#).await;

        assert_eq!(relay.metrics().connections_total.load(Ordering::Relaxed), 1);
        assert_eq!(relay.metrics().messages_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn shutdown_stops_mesh() {
        let network = MemoryNetwork::new();
        let mesh = MeshParticipant::new(
            MeshConfig::default(),
            Arc::new(network.swarm("relay-1").await),
        );
        mesh.start().await.unwrap();

        let storage = SqliteStorage::in_memory().await.unwrap();
        let relay = Relay::new(Config::default(), storage, Some(mesh.clone()));
        let mut signal = relay.shutdown_signal();
        relay.shutdown().await;
        assert!(!mesh.is_running());
        assert!(signal.has_changed().unwrap());
        assert!(*signal.borrow_and_update());
    }

    struct StaticDoc(Vec<u8>);

    impl crate::persistence::CrdtDocument for StaticDoc {
        fn apply_update(&self, _update: &[u8], _origin: &str) -> Result<(), String> {
            Ok(())
        }

        fn encode_state(&self) -> Vec<u8> {
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn shutdown_flushes_documents_bound_by_embedder() {
        use crate::storage::RelayStorage;

        let storage = SqliteStorage::in_memory().await.unwrap();
        let relay = Relay::new(Config::default(), storage, None);
        let key = loom_crypto::DocumentKey::random();
        relay.persistence().set_key("ws-1", key.clone()).await;

        let doc = Arc::new(StaticDoc(b"doc state".to_vec()));
        relay.persistence().bind_state("ws-1", doc).await;
        relay.persistence().on_update("ws-1", "client");
        assert_eq!(relay.persistence().pending_writes(), 1);

        relay.shutdown().await;
        assert_eq!(relay.persistence().pending_writes(), 0);
        let stored = relay.storage().load_room_state("ws-1").await.unwrap().unwrap();
        assert_eq!(loom_crypto::decrypt(&stored, &key).unwrap(), b"doc state");
    }
}
