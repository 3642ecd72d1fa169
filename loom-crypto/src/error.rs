//! Error types for loom-crypto.

use thiserror::Error;

/// Errors that can occur in crypto operations.
///
/// Decryption has no variant: `decrypt` reports failure as `None`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Encryption operation failed.
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Plaintext exceeds the encryptable size.
    #[error("plaintext too large: {size} bytes (max {limit})")]
    PlaintextTooLarge {
        /// Actual size.
        size: usize,
        /// Maximum allowed size.
        limit: usize,
    },

    /// Key has the wrong length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length.
        expected: usize,
        /// Actual length.
        actual: usize,
    },

    /// Key is all zero bytes.
    #[error("invalid key: all-zero key rejected")]
    ZeroKey,

    /// Key or signature was not valid base64.
    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),

    /// Ed25519 public key could not be parsed.
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Ed25519 signature did not verify.
    #[error("invalid signature")]
    InvalidSignature,
}
