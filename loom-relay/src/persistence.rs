//! Encrypted persistence of CRDT documents.
//!
//! The coordinator binds the lifecycle of in-process CRDT documents to
//! [`SqliteStorage`]:
//!
//! ```text
//! bind_state(room) ──► load yjs_docs[room] ──► decrypt(key[room]) ──► apply_update
//!                                  │ no key yet
//!                                  └──► pending (retried on key delivery)
//!
//! on_update(room) ──► debounce(room) ──► encode_state ──► encrypt ──► save
//! write_state(room) ──► cancel debounce ──► save now ──► unbind (key kept)
//! ```
//!
//! Keys live only in memory and survive document teardown, so a client that
//! reconnects later can still read the persisted state.
//!
//! The relay itself only delivers keys and flushes on shutdown. The CRDT
//! engine embedding the relay drives the document lifecycle: it calls
//! [`bind_state`](PersistenceCoordinator::bind_state) when a document is
//! opened, [`on_update`](PersistenceCoordinator::on_update) from its update
//! callback and [`write_state`](PersistenceCoordinator::write_state) when the
//! document is torn down. It obtains the coordinator via
//! [`Relay::persistence`](crate::server::Relay::persistence).

use crate::debounce::Debouncer;
use crate::storage::{RelayStorage, SqliteStorage};
use dashmap::{DashMap, DashSet};
use loom_crypto::{decrypt, encrypt, DocumentKey};
use std::sync::Arc;
use std::time::Duration;

/// Update origin used when applying state loaded from storage.
///
/// Updates carrying this origin are not written back.
pub const PERSISTENCE_ORIGIN: &str = "persistence";

/// The CRDT engine surface the coordinator drives.
pub trait CrdtDocument: Send + Sync {
    /// Apply an encoded update.
    fn apply_update(&self, update: &[u8], origin: &str) -> Result<(), String>;

    /// Encode the full document state.
    fn encode_state(&self) -> Vec<u8>;
}

/// Result of loading a bound document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Nothing was stored for the room.
    Empty,
    /// Stored state was applied to the document.
    Loaded,
    /// State exists but cannot be read yet; write-back is suspended.
    Pending,
}

/// Binds CRDT documents to encrypted storage.
pub struct PersistenceCoordinator {
    storage: Arc<SqliteStorage>,
    encrypted: bool,
    debounce: Duration,
    docs: DashMap<String, Arc<dyn CrdtDocument>>,
    keys: DashMap<String, DocumentKey>,
    pending: DashSet<String>,
    timers: Debouncer<String>,
}

impl std::fmt::Debug for PersistenceCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceCoordinator")
            .field("encrypted", &self.encrypted)
            .field("debounce", &self.debounce)
            .field("docs", &self.docs.len())
            .field("keys", &self.keys.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl PersistenceCoordinator {
    /// Create a coordinator.
    pub fn new(storage: Arc<SqliteStorage>, encrypted: bool, debounce: Duration) -> Arc<Self> {
        Arc::new(Self {
            storage,
            encrypted,
            debounce,
            docs: DashMap::new(),
            keys: DashMap::new(),
            pending: DashSet::new(),
            timers: Debouncer::new(),
        })
    }

    /// Whether state is encrypted at rest.
    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    /// Configured debounce delay.
    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    /// Number of rooms with a delivered key.
    pub fn keys_loaded(&self) -> usize {
        self.keys.len()
    }

    /// Number of rooms waiting for a key.
    pub fn rooms_awaiting_key(&self) -> usize {
        self.pending.len()
    }

    /// Number of bound documents.
    pub fn bound_documents(&self) -> usize {
        self.docs.len()
    }

    /// Number of debounced writes waiting for their timer.
    pub fn pending_writes(&self) -> usize {
        self.timers.len()
    }

    /// Whether a key was delivered for `room`.
    pub fn has_key(&self, room: &str) -> bool {
        self.keys.contains_key(room)
    }

    /// Whether `room` is waiting for its key.
    pub fn is_pending(&self, room: &str) -> bool {
        self.pending.contains(room)
    }

    /// Whether `key` matches the key held for `room`.
    pub fn key_matches(&self, room: &str, key: &DocumentKey) -> bool {
        self.keys
            .get(room)
            .map(|held| held.same_as(key))
            .unwrap_or(false)
    }

    /// Bind a document on first access and load its persisted state.
    pub async fn bind_state(&self, room: &str, doc: Arc<dyn CrdtDocument>) -> LoadOutcome {
        self.docs.insert(room.to_string(), doc);
        self.load(room).await
    }

    /// Load persisted state into the bound document.
    async fn load(&self, room: &str) -> LoadOutcome {
        let Some(doc) = self.docs.get(room).map(|d| d.value().clone()) else {
            return LoadOutcome::Empty;
        };

        let stored = match self.storage.load_room_state(room).await {
            Ok(Some(stored)) => stored,
            Ok(None) => {
                self.pending.remove(room);
                return LoadOutcome::Empty;
            }
            Err(e) => {
                // Writing now could overwrite state we failed to read.
                tracing::error!("Failed to load state for room {}: {}", room, e);
                self.pending.insert(room.to_string());
                return LoadOutcome::Pending;
            }
        };

        let plaintext = if self.encrypted {
            let Some(key) = self.keys.get(room).map(|k| k.value().clone()) else {
                tracing::info!("Deferring load of room {}: no key delivered yet", room);
                self.pending.insert(room.to_string());
                return LoadOutcome::Pending;
            };
            match decrypt(&stored, &key) {
                Some(plaintext) => plaintext,
                None => {
                    tracing::warn!("Stored state for room {} did not decrypt with the delivered key", room);
                    self.pending.insert(room.to_string());
                    return LoadOutcome::Pending;
                }
            }
        } else {
            stored
        };

        if let Err(e) = doc.apply_update(&plaintext, PERSISTENCE_ORIGIN) {
            tracing::warn!("Failed to apply stored state for room {}: {}", room, e);
            self.pending.insert(room.to_string());
            return LoadOutcome::Pending;
        }

        self.pending.remove(room);
        tracing::debug!("Loaded persisted state for room {} ({} bytes)", room, plaintext.len());
        LoadOutcome::Loaded
    }

    /// Record a document update and (re)start its debounce timer.
    pub fn on_update(self: &Arc<Self>, room: &str, origin: &str) {
        if origin == PERSISTENCE_ORIGIN || !self.docs.contains_key(room) {
            return;
        }
        let coordinator = Arc::clone(self);
        let target = room.to_string();
        self.timers.schedule(room.to_string(), self.debounce, async move {
            coordinator.persist(&target).await;
        });
    }

    /// Tear a document down: cancel its timer, write it now, and unbind it.
    ///
    /// The room's key is kept.
    pub async fn write_state(&self, room: &str) {
        self.timers.cancel(&room.to_string());
        self.persist(room).await;
        self.docs.remove(room);
        self.pending.remove(room);
    }

    /// Write every bound document immediately. Called on shutdown.
    pub async fn flush_all(&self) {
        self.timers.cancel_all();
        let rooms: Vec<String> = self.docs.iter().map(|e| e.key().clone()).collect();
        for room in rooms {
            self.persist(&room).await;
        }
    }

    /// Install the key for `room` and run any deferred load.
    ///
    /// Returns `true` if a deferred load ran.
    pub async fn set_key(&self, room: &str, key: DocumentKey) -> bool {
        self.keys.insert(room.to_string(), key);
        if self.pending.contains(room) && self.docs.contains_key(room) {
            let outcome = self.load(room).await;
            tracing::info!("Deferred load for room {} finished: {:?}", room, outcome);
            return true;
        }
        false
    }

    /// Encode, optionally encrypt, and save the state of `room`.
    async fn persist(&self, room: &str) {
        if self.pending.contains(room) {
            tracing::debug!("Skipping write for room {}: stored state not loaded", room);
            return;
        }
        let Some(doc) = self.docs.get(room).map(|d| d.value().clone()) else {
            return;
        };

        let state = doc.encode_state();
        let blob = if self.encrypted {
            let Some(key) = self.keys.get(room).map(|k| k.value().clone()) else {
                tracing::warn!("Skipping write for room {}: no key delivered", room);
                return;
            };
            match encrypt(&state, &key) {
                Ok(blob) => blob,
                Err(e) => {
                    tracing::error!("Failed to encrypt state for room {}: {}", room, e);
                    return;
                }
            }
        } else {
            state
        };

        match self.storage.save_room_state(room, &blob).await {
            Ok(()) => tracing::debug!("Persisted room {} ({} bytes)", room, blob.len()),
            Err(e) => tracing::error!("Failed to persist room {}: {}", room, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Last-writer-wins stand-in for a CRDT document.
    #[derive(Default)]
    struct TestDoc {
        state: Mutex<Vec<u8>>,
        applied: Mutex<Vec<(Vec<u8>, String)>>,
        encodes: AtomicUsize,
    }

    impl TestDoc {
        fn set(&self, bytes: &[u8]) {
            *self.state.lock().unwrap() = bytes.to_vec();
        }

        fn applied(&self) -> Vec<(Vec<u8>, String)> {
            self.applied.lock().unwrap().clone()
        }

        fn encodes(&self) -> usize {
            self.encodes.load(Ordering::SeqCst)
        }
    }

    impl CrdtDocument for TestDoc {
        fn apply_update(&self, update: &[u8], origin: &str) -> Result<(), String> {
            self.applied
                .lock()
                .unwrap()
                .push((update.to_vec(), origin.to_string()));
            *self.state.lock().unwrap() = update.to_vec();
            Ok(())
        }

        fn encode_state(&self) -> Vec<u8> {
            self.encodes.fetch_add(1, Ordering::SeqCst);
            self.state.lock().unwrap().clone()
        }
    }

    async fn coordinator(
        encrypted: bool,
        debounce_ms: u64,
    ) -> (Arc<PersistenceCoordinator>, Arc<SqliteStorage>) {
        let storage = Arc::new(SqliteStorage::in_memory().await.unwrap());
        let coordinator = PersistenceCoordinator::new(
            storage.clone(),
            encrypted,
            Duration::from_millis(debounce_ms),
        );
        (coordinator, storage)
    }

    async fn wait_for_state(storage: &SqliteStorage, room: &str) -> Option<Vec<u8>> {
        for _ in 0..100 {
            if let Some(state) = storage.load_room_state(room).await.unwrap() {
                return Some(state);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        None
    }

    #[tokio::test]
    async fn rapid_updates_produce_one_write() {
        let (coordinator, storage) = coordinator(false, 1000).await;
        let doc = Arc::new(TestDoc::default());
        coordinator.bind_state("ws-1", doc.clone()).await;

        // Virtual time from here on; no database calls until resume().
        tokio::time::pause();

        doc.set(b"first");
        coordinator.on_update("ws-1", "client");
        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(doc.encodes(), 0);

        doc.set(b"second");
        coordinator.on_update("ws-1", "client");
        assert_eq!(coordinator.pending_writes(), 1);

        tokio::time::sleep(Duration::from_millis(950)).await;
        assert_eq!(doc.encodes(), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(doc.encodes(), 1);
        assert_eq!(coordinator.pending_writes(), 0);

        tokio::time::resume();

        assert_eq!(
            wait_for_state(&storage, "ws-1").await,
            Some(b"second".to_vec())
        );
        assert_eq!(doc.encodes(), 1);
    }

    #[tokio::test]
    async fn persistence_origin_is_not_written_back() {
        let (coordinator, _storage) = coordinator(false, 1000).await;
        let doc = Arc::new(TestDoc::default());
        coordinator.bind_state("ws-1", doc.clone()).await;

        coordinator.on_update("ws-1", PERSISTENCE_ORIGIN);
        assert_eq!(coordinator.pending_writes(), 0);

        coordinator.on_update("unbound-room", "client");
        assert_eq!(coordinator.pending_writes(), 0);
    }

    #[tokio::test]
    async fn encrypted_state_round_trips_through_storage() {
        let (coordinator, storage) = coordinator(true, 1000).await;
        let key = DocumentKey::random();
        assert!(!coordinator.set_key("ws-1", key.clone()).await);

        let doc = Arc::new(TestDoc::default());
        assert_eq!(
            coordinator.bind_state("ws-1", doc.clone()).await,
            LoadOutcome::Empty
        );
        doc.set(b"secret state");
        coordinator.write_state("ws-1").await;

        let stored = storage.load_room_state("ws-1").await.unwrap().unwrap();
        assert_ne!(stored, b"secret state".to_vec());
        assert_eq!(decrypt(&stored, &key).unwrap(), b"secret state");

        // Key survives teardown; a new document loads the state.
        assert!(coordinator.has_key("ws-1"));
        assert_eq!(coordinator.bound_documents(), 0);
        let reopened = Arc::new(TestDoc::default());
        assert_eq!(
            coordinator.bind_state("ws-1", reopened.clone()).await,
            LoadOutcome::Loaded
        );
        assert_eq!(
            reopened.applied(),
            vec![(b"secret state".to_vec(), PERSISTENCE_ORIGIN.to_string())]
        );
    }

    #[tokio::test]
    async fn missing_key_defers_load_until_delivery() {
        let (coordinator, storage) = coordinator(true, 1000).await;
        let key = DocumentKey::random();
        let blob = encrypt(b"persisted", &key).unwrap();
        storage.save_room_state("ws-1", &blob).await.unwrap();

        let doc = Arc::new(TestDoc::default());
        assert_eq!(
            coordinator.bind_state("ws-1", doc.clone()).await,
            LoadOutcome::Pending
        );
        assert!(coordinator.is_pending("ws-1"));
        assert_eq!(coordinator.rooms_awaiting_key(), 1);

        // Writes are suspended while pending.
        doc.set(b"local edit");
        coordinator.flush_all().await;
        assert_eq!(doc.encodes(), 0);
        assert_eq!(storage.load_room_state("ws-1").await.unwrap(), Some(blob));

        assert!(coordinator.set_key("ws-1", key).await);
        assert!(!coordinator.is_pending("ws-1"));
        assert_eq!(doc.applied()[0].0, b"persisted".to_vec());
    }

    #[tokio::test]
    async fn wrong_key_keeps_room_pending() {
        let (coordinator, storage) = coordinator(true, 1000).await;
        let blob = encrypt(b"persisted", &DocumentKey::random()).unwrap();
        storage.save_room_state("ws-1", &blob).await.unwrap();

        let doc = Arc::new(TestDoc::default());
        coordinator.bind_state("ws-1", doc.clone()).await;
        coordinator.set_key("ws-1", DocumentKey::random()).await;

        assert!(coordinator.is_pending("ws-1"));
        assert!(doc.applied().is_empty());
    }

    #[tokio::test]
    async fn encrypted_write_without_key_is_skipped() {
        let (coordinator, storage) = coordinator(true, 1000).await;
        let doc = Arc::new(TestDoc::default());
        coordinator.bind_state("ws-1", doc.clone()).await;
        doc.set(b"plaintext must not land on disk");

        coordinator.write_state("ws-1").await;
        assert!(storage.load_room_state("ws-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn teardown_cancels_timer_and_writes_once() {
        let (coordinator, storage) = coordinator(false, 50).await;
        let doc = Arc::new(TestDoc::default());
        coordinator.bind_state("ws-1", doc.clone()).await;

        doc.set(b"final");
        coordinator.on_update("ws-1", "client");
        coordinator.write_state("ws-1").await;
        assert_eq!(coordinator.pending_writes(), 0);
        assert_eq!(
            storage.load_room_state("ws-1").await.unwrap(),
            Some(b"final".to_vec())
        );
        assert_eq!(coordinator.bound_documents(), 0);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(doc.encodes(), 1);
    }

    #[tokio::test]
    async fn flush_all_writes_bound_documents() {
        let (coordinator, storage) = coordinator(false, 1000).await;
        let a = Arc::new(TestDoc::default());
        let b = Arc::new(TestDoc::default());
        coordinator.bind_state("a", a.clone()).await;
        coordinator.bind_state("b", b.clone()).await;
        a.set(b"A");
        b.set(b"B");
        coordinator.on_update("a", "client");

        coordinator.flush_all().await;
        assert_eq!(coordinator.pending_writes(), 0);
        assert_eq!(storage.load_room_state("a").await.unwrap(), Some(b"A".to_vec()));
        assert_eq!(storage.load_room_state("b").await.unwrap(), Some(b"B".to_vec()));
    }
}
