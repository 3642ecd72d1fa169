//! SQLite storage backend for cipherloom-relay.

use super::{Invite, NewInvite, RelayStorage, StoredDocument};
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// SQLite-based relay storage.
///
/// Uses WAL mode for concurrent reads/writes.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl std::fmt::Debug for SqliteStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStorage")
            .field("connections", &self.pool.size())
            .finish()
    }
}

impl SqliteStorage {
    /// Create a new SQLite storage from a database path.
    ///
    /// Creates the database file if it doesn't exist.
    pub async fn new(path: &Path) -> StorageResult<Self> {
        let path_str = path.to_str().ok_or_else(|| StorageError::InvalidPath {
            path: path.to_path_buf(),
        })?;
        let options = SqliteConnectOptions::from_str(path_str)
            .map_err(StorageError::Database)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await
            .map_err(StorageError::Database)?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Create an in-memory SQLite storage.
    ///
    /// Used by tests and when durable storage is disabled. The single
    /// connection is never recycled, since closing it drops the database.
    pub async fn in_memory() -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str(":memory:")
            .map_err(StorageError::Database)?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(StorageError::Database)?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> StorageResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workspaces (
                id TEXT PRIMARY KEY NOT NULL,
                persistence_enabled INTEGER NOT NULL DEFAULT 0,
                last_activity INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                workspace_id TEXT NOT NULL,
                document_id TEXT NOT NULL,
                state BLOB NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (workspace_id, document_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS updates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                workspace_id TEXT NOT NULL,
                document_id TEXT NOT NULL,
                data BLOB NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS yjs_docs (
                room TEXT PRIMARY KEY NOT NULL,
                state BLOB NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS invites (
                token TEXT PRIMARY KEY NOT NULL,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                permission TEXT NOT NULL,
                requires_password INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                expires_at INTEGER,
                use_count INTEGER NOT NULL DEFAULT 0,
                max_uses INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_updates_document ON updates(workspace_id, document_id)",
        )
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_invites_entity ON invites(entity_id)")
            .execute(&self.pool)
            .await
            .map_err(StorageError::Database)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_invites_expires ON invites(expires_at)")
            .execute(&self.pool)
            .await
            .map_err(StorageError::Database)?;

        Ok(())
    }

    /// Current unix time in milliseconds.
    pub fn current_timestamp_ms() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

const INVITE_COLUMNS: &str = "token, entity_type, entity_id, permission, requires_password, \
                              created_at, expires_at, use_count, max_uses";

#[async_trait]
impl RelayStorage for SqliteStorage {
    async fn set_persistence(&self, workspace_id: &str, enabled: bool) -> StorageResult<()> {
        let now = Self::current_timestamp_ms();
        sqlx::query(
            r#"
            INSERT INTO workspaces (id, persistence_enabled, last_activity, created_at)
            VALUES (?1, ?2, ?3, ?3)
            ON CONFLICT(id) DO UPDATE SET
                persistence_enabled = excluded.persistence_enabled,
                last_activity = excluded.last_activity
            "#,
        )
        .bind(workspace_id)
        .bind(enabled)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        Ok(())
    }

    async fn is_persistence_enabled(&self, workspace_id: &str) -> StorageResult<bool> {
        let enabled: Option<bool> =
            sqlx::query_scalar("SELECT persistence_enabled FROM workspaces WHERE id = ?1")
                .bind(workspace_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(StorageError::Database)?;

        Ok(enabled.unwrap_or(false))
    }

    async fn touch_workspace(&self, workspace_id: &str) -> StorageResult<()> {
        sqlx::query("UPDATE workspaces SET last_activity = ?2 WHERE id = ?1")
            .bind(workspace_id)
            .bind(Self::current_timestamp_ms())
            .execute(&self.pool)
            .await
            .map_err(StorageError::Database)?;

        Ok(())
    }

    async fn store_document_state(
        &self,
        workspace_id: &str,
        document_id: &str,
        state: &[u8],
    ) -> StorageResult<()> {
        let now = Self::current_timestamp_ms();
        let mut tx = self.pool.begin().await.map_err(StorageError::Database)?;

        sqlx::query(
            r#"
            INSERT INTO documents (workspace_id, document_id, state, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(workspace_id, document_id) DO UPDATE SET
                state = excluded.state,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(workspace_id)
        .bind(document_id)
        .bind(state)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(StorageError::Database)?;

        sqlx::query("DELETE FROM updates WHERE workspace_id = ?1 AND document_id = ?2")
            .bind(workspace_id)
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(StorageError::Database)?;

        tx.commit().await.map_err(StorageError::Database)?;
        Ok(())
    }

    async fn append_update(
        &self,
        workspace_id: &str,
        document_id: &str,
        update: &[u8],
    ) -> StorageResult<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO updates (workspace_id, document_id, data, created_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(workspace_id)
        .bind(document_id)
        .bind(update)
        .bind(Self::current_timestamp_ms())
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        Ok(result.last_insert_rowid())
    }

    async fn load_document(
        &self,
        workspace_id: &str,
        document_id: &str,
    ) -> StorageResult<Option<StoredDocument>> {
        let state: Option<Vec<u8>> = sqlx::query_scalar(
            "SELECT state FROM documents WHERE workspace_id = ?1 AND document_id = ?2",
        )
        .bind(workspace_id)
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        let updates: Vec<Vec<u8>> = sqlx::query_scalar(
            r#"
            SELECT data FROM updates
            WHERE workspace_id = ?1 AND document_id = ?2
            ORDER BY id ASC
            "#,
        )
        .bind(workspace_id)
        .bind(document_id)
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        if state.is_none() && updates.is_empty() {
            return Ok(None);
        }
        Ok(Some(StoredDocument { state, updates }))
    }

    async fn save_room_state(&self, room: &str, state: &[u8]) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO yjs_docs (room, state, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(room) DO UPDATE SET
                state = excluded.state,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(room)
        .bind(state)
        .bind(Self::current_timestamp_ms())
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        Ok(())
    }

    async fn load_room_state(&self, room: &str) -> StorageResult<Option<Vec<u8>>> {
        sqlx::query_scalar("SELECT state FROM yjs_docs WHERE room = ?1")
            .bind(room)
            .fetch_optional(&self.pool)
            .await
            .map_err(StorageError::Database)
    }

    async fn create_invite(&self, invite: NewInvite) -> StorageResult<Invite> {
        let result = sqlx::query(
            r#"
            INSERT INTO invites (token, entity_type, entity_id, permission, requires_password,
                                 created_at, expires_at, use_count, max_uses)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8)
            "#,
        )
        .bind(&invite.token)
        .bind(&invite.entity_type)
        .bind(&invite.entity_id)
        .bind(&invite.permission)
        .bind(invite.requires_password)
        .bind(invite.created_at)
        .bind(invite.expires_at)
        .bind(invite.max_uses)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(Invite {
                token: invite.token,
                entity_type: invite.entity_type,
                entity_id: invite.entity_id,
                permission: invite.permission,
                requires_password: invite.requires_password,
                created_at: invite.created_at,
                expires_at: invite.expires_at,
                use_count: 0,
                max_uses: invite.max_uses,
            }),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StorageError::DuplicateInvite)
            }
            Err(e) => Err(StorageError::Database(e)),
        }
    }

    async fn get_invite(&self, token: &str, now_ms: i64) -> StorageResult<Option<Invite>> {
        let row = sqlx::query_as::<_, InviteRow>(&format!(
            "SELECT {INVITE_COLUMNS} FROM invites WHERE token = ?1"
        ))
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        Ok(row.map(Invite::from).filter(|invite| invite.is_valid(now_ms)))
    }

    async fn use_invite(&self, token: &str, now_ms: i64) -> StorageResult<Option<Invite>> {
        // Validity check and increment happen in one statement so concurrent
        // uses cannot exceed max_uses.
        let row = sqlx::query_as::<_, InviteRow>(&format!(
            r#"
            UPDATE invites SET use_count = use_count + 1
            WHERE token = ?1
              AND (expires_at IS NULL OR expires_at > ?2)
              AND (max_uses IS NULL OR use_count < max_uses)
            RETURNING {INVITE_COLUMNS}
            "#
        ))
        .bind(token)
        .bind(now_ms)
        .fetch_optional(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        Ok(row.map(Invite::from))
    }

    async fn delete_expired_invites(&self, now_ms: i64) -> StorageResult<u64> {
        let result =
            sqlx::query("DELETE FROM invites WHERE expires_at IS NOT NULL AND expires_at <= ?1")
                .bind(now_ms)
                .execute(&self.pool)
                .await
                .map_err(StorageError::Database)?;

        Ok(result.rows_affected())
    }

    async fn delete_invites_created_before(&self, cutoff_ms: i64) -> StorageResult<u64> {
        let result = sqlx::query("DELETE FROM invites WHERE created_at < ?1")
            .bind(cutoff_ms)
            .execute(&self.pool)
            .await
            .map_err(StorageError::Database)?;

        Ok(result.rows_affected())
    }

    async fn get_total_documents(&self) -> StorageResult<u64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM (
                SELECT workspace_id, document_id FROM documents
                UNION
                SELECT workspace_id, document_id FROM updates
            )
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        Ok(count as u64)
    }

    async fn get_total_room_states(&self) -> StorageResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM yjs_docs")
            .fetch_one(&self.pool)
            .await
            .map_err(StorageError::Database)?;

        Ok(count as u64)
    }

    async fn get_total_storage_bytes(&self) -> StorageResult<u64> {
        let size: i64 = sqlx::query_scalar(
            r#"
            SELECT
                (SELECT COALESCE(SUM(LENGTH(state)), 0) FROM documents) +
                (SELECT COALESCE(SUM(LENGTH(data)), 0) FROM updates) +
                (SELECT COALESCE(SUM(LENGTH(state)), 0) FROM yjs_docs)
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        Ok(size as u64)
    }
}

/// Internal row type for invite queries.
#[derive(sqlx::FromRow)]
struct InviteRow {
    token: String,
    entity_type: String,
    entity_id: String,
    permission: String,
    requires_password: bool,
    created_at: i64,
    expires_at: Option<i64>,
    use_count: i64,
    max_uses: Option<i64>,
}

impl From<InviteRow> for Invite {
    fn from(row: InviteRow) -> Self {
        Invite {
            token: row.token,
            entity_type: row.entity_type,
            entity_id: row.entity_id,
            permission: row.permission,
            requires_password: row.requires_password,
            created_at: row.created_at,
            expires_at: row.expires_at,
            use_count: row.use_count,
            max_uses: row.max_uses,
        }
    }
}
