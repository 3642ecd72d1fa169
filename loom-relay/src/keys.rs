//! Authenticated delivery of room keys.
//!
//! A client hands the relay the key for a room together with an Ed25519
//! signature over `key-delivery:<room>:<base64 key>:<timestamp>`. The first
//! identity to deliver a key for a room becomes its owner. The owner may
//! rotate the key; other identities may only deliver the same key bytes.

use crate::error::KeyDeliveryError;
use crate::persistence::PersistenceCoordinator;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use loom_crypto::{verify_key_delivery, DeliveryIdentity, DocumentKey};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Accepted clock skew between client and relay, in ms.
pub const MAX_TIMESTAMP_SKEW_MS: i64 = 5 * 60 * 1000;

/// Body of `POST /api/rooms/:roomName/key`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyDeliveryRequest {
    /// Base64 room key.
    pub key: String,
    /// Base64 Ed25519 public key of the sender.
    pub public_key: String,
    /// Base64 signature over the delivery message.
    pub signature: String,
    /// Unix ms when the request was signed.
    pub timestamp: i64,
}

/// Successful delivery.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyDeliveryOutcome {
    /// Always `true`.
    pub success: bool,
    /// Room the key was delivered for.
    pub room: String,
    /// Whether a deferred load ran.
    pub loaded: bool,
    /// Whether the sender became (or already was) the recorded owner.
    pub owner: bool,
}

/// Records room owners and forwards keys to the persistence coordinator.
pub struct KeyRegistry {
    owners: DashMap<String, DeliveryIdentity>,
    persistence: Arc<PersistenceCoordinator>,
}

impl std::fmt::Debug for KeyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRegistry")
            .field("owners", &self.owners.len())
            .finish_non_exhaustive()
    }
}

enum Ownership {
    Owner,
    SameKey,
}

impl KeyRegistry {
    /// Create an empty registry.
    pub fn new(persistence: Arc<PersistenceCoordinator>) -> Self {
        Self {
            owners: DashMap::new(),
            persistence,
        }
    }

    /// Number of rooms with a recorded owner.
    pub fn owned_rooms(&self) -> usize {
        self.owners.len()
    }

    /// Validate and install a key for `room`.
    pub async fn deliver(
        &self,
        room: &str,
        request: &KeyDeliveryRequest,
        now_ms: i64,
    ) -> Result<KeyDeliveryOutcome, KeyDeliveryError> {
        if !crate::signaling::is_valid_room_id(room) {
            return Err(KeyDeliveryError::InvalidRequest("invalid room name".into()));
        }
        if now_ms.abs_diff(request.timestamp) > MAX_TIMESTAMP_SKEW_MS.unsigned_abs() {
            return Err(KeyDeliveryError::StaleTimestamp);
        }

        let identity = verify_key_delivery(
            &request.public_key,
            &request.signature,
            room,
            &request.key,
            request.timestamp,
        )?;
        let key = DocumentKey::from_base64(&request.key).map_err(KeyDeliveryError::InvalidKey)?;

        // The entry lock serializes concurrent deliveries for one room.
        let ownership = match self.owners.entry(room.to_string()) {
            Entry::Vacant(entry) => {
                entry.insert(identity);
                Ownership::Owner
            }
            Entry::Occupied(entry) if *entry.get() == identity => Ownership::Owner,
            Entry::Occupied(_) => {
                if self.persistence.key_matches(room, &key) {
                    Ownership::SameKey
                } else {
                    tracing::warn!("Rejected key for room {} from a non-owner identity", room);
                    return Err(KeyDeliveryError::IdentityMismatch);
                }
            }
        };

        let loaded = self.persistence.set_key(room, key).await;
        tracing::info!(
            "Key delivered for room {} ({})",
            room,
            match ownership {
                Ownership::Owner => "owner",
                Ownership::SameKey => "same key, additional identity",
            }
        );

        Ok(KeyDeliveryOutcome {
            success: true,
            room: room.to_string(),
            loaded,
            owner: matches!(ownership, Ownership::Owner),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStorage;
    use base64::{engine::general_purpose::STANDARD, Engine};
    use ed25519_dalek::SigningKey;
    use loom_crypto::sign_key_delivery;
    use rand::rngs::OsRng;
    use std::time::Duration;

    const NOW: i64 = 1_700_000_000_000;

    async fn registry() -> KeyRegistry {
        let storage = Arc::new(SqliteStorage::in_memory().await.unwrap());
        KeyRegistry::new(PersistenceCoordinator::new(
            storage,
            true,
            Duration::from_millis(1000),
        ))
    }

    fn request(signer: &SigningKey, room: &str, key: &[u8; 32], timestamp: i64) -> KeyDeliveryRequest {
        let key_b64 = STANDARD.encode(key);
        KeyDeliveryRequest {
            signature: sign_key_delivery(signer, room, &key_b64, timestamp),
            public_key: STANDARD.encode(signer.verifying_key().to_bytes()),
            key: key_b64,
            timestamp,
        }
    }

    #[tokio::test]
    async fn same_key_from_other_identity_is_accepted_different_key_rejected() {
        let registry = registry().await;
        let a = SigningKey::generate(&mut OsRng);
        let b = SigningKey::generate(&mut OsRng);
        let c = SigningKey::generate(&mut OsRng);
        let k = [7u8; 32];
        let k_prime = [9u8; 32];

        let first = registry.deliver("ws-1", &request(&a, "ws-1", &k, NOW), NOW).await.unwrap();
        assert!(first.owner);

        let second = registry.deliver("ws-1", &request(&b, "ws-1", &k, NOW), NOW).await.unwrap();
        assert!(second.success);
        assert!(!second.owner);

        let third = registry.deliver("ws-1", &request(&c, "ws-1", &k_prime, NOW), NOW).await;
        let err = third.unwrap_err();
        assert!(matches!(err, KeyDeliveryError::IdentityMismatch));
        assert!(err.to_string().contains("already registered by a different identity"));
    }

    #[tokio::test]
    async fn owner_may_rotate_key() {
        let registry = registry().await;
        let a = SigningKey::generate(&mut OsRng);

        registry.deliver("ws-1", &request(&a, "ws-1", &[1u8; 32], NOW), NOW).await.unwrap();
        let rotated = registry
            .deliver("ws-1", &request(&a, "ws-1", &[2u8; 32], NOW + 1), NOW + 1)
            .await
            .unwrap();
        assert!(rotated.owner);
        assert!(registry
            .persistence
            .key_matches("ws-1", &DocumentKey::from_slice(&[2u8; 32]).unwrap()));
    }

    #[tokio::test]
    async fn stale_and_future_timestamps_are_rejected() {
        let registry = registry().await;
        let a = SigningKey::generate(&mut OsRng);
        let old = NOW - MAX_TIMESTAMP_SKEW_MS - 1;
        let future = NOW + MAX_TIMESTAMP_SKEW_MS + 1;

        let result = registry.deliver("ws-1", &request(&a, "ws-1", &[1u8; 32], old), NOW).await;
        assert!(matches!(result, Err(KeyDeliveryError::StaleTimestamp)));
        let result = registry.deliver("ws-1", &request(&a, "ws-1", &[1u8; 32], future), NOW).await;
        assert!(matches!(result, Err(KeyDeliveryError::StaleTimestamp)));

        let edge = NOW - MAX_TIMESTAMP_SKEW_MS;
        assert!(registry.deliver("ws-1", &request(&a, "ws-1", &[1u8; 32], edge), NOW).await.is_ok());
    }

    #[tokio::test]
    async fn extreme_timestamps_are_stale() {
        let registry = registry().await;
        let a = SigningKey::generate(&mut OsRng);
        for ts in [i64::MIN, i64::MAX] {
            let result = registry.deliver("ws-1", &request(&a, "ws-1", &[1u8; 32], ts), NOW).await;
            assert!(matches!(result, Err(KeyDeliveryError::StaleTimestamp)));
        }
        assert_eq!(registry.owned_rooms(), 0);
    }

    #[tokio::test]
    async fn signature_is_bound_to_room_and_timestamp() {
        let registry = registry().await;
        let a = SigningKey::generate(&mut OsRng);

        // Signed for another room.
        let req = request(&a, "ws-2", &[1u8; 32], NOW);
        assert!(matches!(
            registry.deliver("ws-1", &req, NOW).await,
            Err(KeyDeliveryError::InvalidSignature)
        ));

        // Timestamp altered after signing.
        let mut req = request(&a, "ws-1", &[1u8; 32], NOW);
        req.timestamp += 1;
        assert!(matches!(
            registry.deliver("ws-1", &req, NOW).await,
            Err(KeyDeliveryError::InvalidSignature)
        ));
        assert_eq!(registry.owned_rooms(), 0);
    }

    #[tokio::test]
    async fn invalid_keys_are_rejected() {
        let registry = registry().await;
        let a = SigningKey::generate(&mut OsRng);

        let zero = request(&a, "ws-1", &[0u8; 32], NOW);
        assert!(matches!(
            registry.deliver("ws-1", &zero, NOW).await,
            Err(KeyDeliveryError::InvalidKey(_))
        ));

        let short_b64 = STANDARD.encode([5u8; 16]);
        let short = KeyDeliveryRequest {
            signature: sign_key_delivery(&a, "ws-1", &short_b64, NOW),
            public_key: STANDARD.encode(a.verifying_key().to_bytes()),
            key: short_b64,
            timestamp: NOW,
        };
        assert!(matches!(
            registry.deliver("ws-1", &short, NOW).await,
            Err(KeyDeliveryError::InvalidKey(_))
        ));
        assert_eq!(registry.owned_rooms(), 0);
    }

    #[tokio::test]
    async fn invalid_room_name_is_rejected() {
        let registry = registry().await;
        let a = SigningKey::generate(&mut OsRng);
        let req = request(&a, "bad room", &[1u8; 32], NOW);
        assert!(matches!(
            registry.deliver("bad room", &req, NOW).await,
            Err(KeyDeliveryError::InvalidRequest(_))
        ));
    }
}
