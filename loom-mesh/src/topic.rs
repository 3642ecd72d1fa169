//! Swarm topic identifiers.

use sha2::{Digest, Sha256};
use std::fmt;

/// Seed hashed into the mesh coordination topic.
const COORDINATION_SEED: &[u8] = b"cipherloom/mesh-coordination/v1";

/// Prefix hashed with a workspace id to form its topic.
const WORKSPACE_PREFIX: &[u8] = b"cipherloom/workspace/";

/// A 32-byte swarm topic.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic([u8; 32]);

impl Topic {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The well-known topic every mesh node joins.
    pub fn coordination() -> Self {
        Self(Sha256::digest(COORDINATION_SEED).into())
    }

    /// Topic for a workspace id.
    pub fn workspace(workspace_id: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(WORKSPACE_PREFIX);
        hasher.update(workspace_id.as_bytes());
        Self(hasher.finalize().into())
    }

    /// Lowercase hex encoding, as carried in gossip messages.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 64-character hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes).ok()?;
        Some(Self(bytes))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic({}...)", &self.to_hex()[..8])
    }
}
