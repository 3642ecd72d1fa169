//! Identity types for signaling connections.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier the relay assigns to a connection.
///
/// 16 bytes of random data, displayed as lowercase hex. Peer ids received
/// from clients (e.g. signal targets) are carried verbatim.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Create a new random PeerId.
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        getrandom::getrandom(&mut bytes).expect("getrandom failed");
        Self(hex::encode(bytes))
    }

    /// Borrow the textual form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let end = self.0.len().min(8);
        write!(f, "PeerId({})", &self.0[..end])
    }
}

/// Bearer token issued to a connection at accept time.
///
/// 32 bytes of random data, displayed as URL-safe base64. The relay keeps a
/// token valid only while the socket that received it stays open.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionToken([u8; 32]);

impl SessionToken {
    /// Create a new random SessionToken.
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        getrandom::getrandom(&mut bytes).expect("getrandom failed");
        Self(bytes)
    }

    /// Parse the base64 form sent back by clients.
    pub fn parse(value: &str) -> Option<Self> {
        let bytes = URL_SAFE_NO_PAD.decode(value.trim()).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Get the raw bytes of this token.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl TryFrom<String> for SessionToken {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| "invalid session token".to_string())
    }
}

impl From<SessionToken> for String {
    fn from(token: SessionToken) -> Self {
        token.to_string()
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", URL_SAFE_NO_PAD.encode(self.0))
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionToken([REDACTED])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_is_hex() {
        let id = PeerId::random();
        assert_eq!(id.as_str().len(), 32);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn peer_ids_are_unique() {
        assert_ne!(PeerId::random(), PeerId::random());
    }

    #[test]
    fn peer_id_debug_handles_short_ids() {
        let id = PeerId::from("ab");
        assert_eq!(format!("{:?}", id), "PeerId(ab)");
    }

    #[test]
    fn session_token_parse_display() {
        let token = SessionToken::random();
        let text = token.to_string();
        assert_eq!(text.len(), 43);
        assert_eq!(SessionToken::parse(&text), Some(token));
    }

    #[test]
    fn session_token_rejects_garbage() {
        assert!(SessionToken::parse("not a token").is_none());
        assert!(SessionToken::parse(&URL_SAFE_NO_PAD.encode([1u8; 16])).is_none());
    }

    #[test]
    fn session_token_debug_redacts() {
        let token = SessionToken::random();
        assert!(!format!("{:?}", token).contains(&token.to_string()));
    }
}
