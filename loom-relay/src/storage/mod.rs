//! Storage layer for cipherloom-relay.
//!
//! Everything stored here is opaque: document state, updates and room state
//! are ciphertext produced by clients or by the persistence coordinator.
//! Invites hold only routing metadata.

mod sqlite;

pub use sqlite::SqliteStorage;

use crate::error::StorageResult;
use async_trait::async_trait;
use serde::Serialize;

/// Ciphertext stored for one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDocument {
    /// Last full-state blob, if one was written.
    pub state: Option<Vec<u8>>,
    /// Incremental updates written since the last full state, oldest first.
    pub updates: Vec<Vec<u8>>,
}

/// Request to create an invite.
#[derive(Debug, Clone)]
pub struct NewInvite {
    /// Opaque bearer token chosen by the client.
    pub token: String,
    /// Kind of entity the invite grants access to.
    pub entity_type: String,
    /// Entity the invite grants access to.
    pub entity_id: String,
    /// Permission granted.
    pub permission: String,
    /// Whether the client must also supply a password.
    pub requires_password: bool,
    /// Creation time in unix ms.
    pub created_at: i64,
    /// Expiry in unix ms.
    pub expires_at: Option<i64>,
    /// Maximum number of uses.
    pub max_uses: Option<i64>,
}

/// A stored invite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Invite {
    /// Opaque bearer token.
    pub token: String,
    /// Kind of entity the invite grants access to.
    pub entity_type: String,
    /// Entity the invite grants access to.
    pub entity_id: String,
    /// Permission granted.
    pub permission: String,
    /// Whether the client must also supply a password.
    pub requires_password: bool,
    /// Creation time in unix ms.
    pub created_at: i64,
    /// Expiry in unix ms.
    pub expires_at: Option<i64>,
    /// Times the invite has been used.
    pub use_count: i64,
    /// Maximum number of uses.
    pub max_uses: Option<i64>,
}

impl Invite {
    /// An invite is usable when it has neither expired nor run out of uses.
    pub fn is_valid(&self, now_ms: i64) -> bool {
        let unexpired = self.expires_at.map_or(true, |at| at > now_ms);
        let has_uses = self.max_uses.map_or(true, |max| self.use_count < max);
        unexpired && has_uses
    }
}

/// Trait for relay storage backends.
#[async_trait]
pub trait RelayStorage: Send + Sync {
    /// Set the persistence opt-in flag of a workspace (creating it if needed).
    async fn set_persistence(&self, workspace_id: &str, enabled: bool) -> StorageResult<()>;

    /// Whether a workspace opted into persistence. Unknown workspaces have not.
    async fn is_persistence_enabled(&self, workspace_id: &str) -> StorageResult<bool>;

    /// Record activity on a workspace.
    async fn touch_workspace(&self, workspace_id: &str) -> StorageResult<()>;

    /// Replace the full state of a document.
    ///
    /// Incremental updates stored before this call are superseded and removed.
    async fn store_document_state(
        &self,
        workspace_id: &str,
        document_id: &str,
        state: &[u8],
    ) -> StorageResult<()>;

    /// Append an incremental update to a document. Returns the update id.
    async fn append_update(
        &self,
        workspace_id: &str,
        document_id: &str,
        update: &[u8],
    ) -> StorageResult<i64>;

    /// Load the state and update log of a document.
    ///
    /// Returns `None` if nothing was ever stored for it.
    async fn load_document(
        &self,
        workspace_id: &str,
        document_id: &str,
    ) -> StorageResult<Option<StoredDocument>>;

    /// Write the full CRDT state of a room.
    async fn save_room_state(&self, room: &str, state: &[u8]) -> StorageResult<()>;

    /// Read the full CRDT state of a room.
    async fn load_room_state(&self, room: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Insert an invite. Fails with `DuplicateInvite` if the token exists.
    async fn create_invite(&self, invite: NewInvite) -> StorageResult<Invite>;

    /// Look up a valid invite. Expired or exhausted invites are `None`.
    async fn get_invite(&self, token: &str, now_ms: i64) -> StorageResult<Option<Invite>>;

    /// Consume one use of a valid invite and return it with the new count.
    ///
    /// Returns `None` if the invite is missing, expired or exhausted.
    async fn use_invite(&self, token: &str, now_ms: i64) -> StorageResult<Option<Invite>>;

    /// Delete invites whose expiry has passed.
    async fn delete_expired_invites(&self, now_ms: i64) -> StorageResult<u64>;

    /// Delete invites created before `cutoff_ms`, regardless of expiry.
    async fn delete_invites_created_before(&self, cutoff_ms: i64) -> StorageResult<u64>;

    /// Number of documents with stored state or updates.
    async fn get_total_documents(&self) -> StorageResult<u64>;

    /// Number of rooms with persisted CRDT state.
    async fn get_total_room_states(&self) -> StorageResult<u64>;

    /// Total ciphertext bytes across documents, updates and room state.
    async fn get_total_storage_bytes(&self) -> StorageResult<u64>;
}
