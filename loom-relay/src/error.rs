//! Error types for cipherloom-relay.

use loom_crypto::CryptoError;
use loom_types::ErrorCode;
use std::path::PathBuf;

/// Main error type for relay operations.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Mesh participant error.
    #[error("mesh error: {0}")]
    Mesh(#[from] loom_mesh::MeshError),

    /// Swarm setup error.
    #[error("swarm error: {0}")]
    Swarm(#[from] loom_mesh::SwarmError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Storage layer errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// An invite with this token already exists.
    #[error("invite already exists")]
    DuplicateInvite,

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// Database path error.
    #[error("invalid database path: {path}")]
    InvalidPath {
        /// The invalid path.
        path: PathBuf,
    },
}

/// A signaling request that was refused.
///
/// Carries the code sent back to the client in the `{type:"error"}` reply.
#[derive(Debug, thiserror::Error)]
#[error("{code}")]
pub struct SignalError {
    /// Reply code.
    pub code: ErrorCode,
}

impl From<ErrorCode> for SignalError {
    fn from(code: ErrorCode) -> Self {
        Self { code }
    }
}

impl From<StorageError> for SignalError {
    fn from(e: StorageError) -> Self {
        tracing::error!("Storage failure during signaling request: {}", e);
        Self {
            code: ErrorCode::StorageError,
        }
    }
}

/// Key delivery errors.
#[derive(Debug, thiserror::Error)]
pub enum KeyDeliveryError {
    /// Body or room name failed validation.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Timestamp outside the accepted window.
    #[error("timestamp outside the accepted window")]
    StaleTimestamp,

    /// Signature or public key did not verify.
    #[error("invalid signature")]
    InvalidSignature,

    /// Key bytes rejected.
    #[error("invalid key: {0}")]
    InvalidKey(CryptoError),

    /// Room already has a different key from another identity.
    #[error("Key already registered by a different identity")]
    IdentityMismatch,

    /// Too many deliveries from this address.
    #[error("rate limit exceeded")]
    RateLimited,
}

impl From<CryptoError> for KeyDeliveryError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::InvalidSignature
            | CryptoError::InvalidPublicKey
            | CryptoError::InvalidEncoding(_) => Self::InvalidSignature,
            other => Self::InvalidKey(other),
        }
    }
}

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Result type alias for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Result type alias for signaling handlers.
pub type SignalResult<T> = std::result::Result<T, SignalError>;
