//! Room authentication tokens and key-delivery signatures.
//!
//! Room auth tokens are derived client-side from the workspace secret:
//! `hex(HMAC-SHA256(secret, "room-auth:" || room))`. The relay never sees
//! the secret; it only registers the first token presented for a room and
//! compares later ones in constant time.
//!
//! Key delivery proves ownership of a room's document key with an Ed25519
//! signature over `key-delivery:<room>:<base64 key>:<timestamp>`.

use base64::{engine::general_purpose::STANDARD, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::CryptoError;

type HmacSha256 = Hmac<Sha256>;

/// Size of an Ed25519 public key in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of an Ed25519 signature in bytes.
pub const SIGNATURE_SIZE: usize = 64;

/// Derive the auth token a client presents when joining `room`.
pub fn derive_room_auth_token(secret: &[u8], room: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret).expect("HMAC-SHA256 accepts keys of any length");
    mac.update(b"room-auth:");
    mac.update(room.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Canonical string signed by a key-delivery request.
pub fn key_delivery_message(room: &str, key_base64: &str, timestamp: i64) -> String {
    format!("key-delivery:{room}:{key_base64}:{timestamp}")
}

/// Sign a key-delivery request (client side).
///
/// Returns the base64 signature.
pub fn sign_key_delivery(
    signing_key: &SigningKey,
    room: &str,
    key_base64: &str,
    timestamp: i64,
) -> String {
    let message = key_delivery_message(room, key_base64, timestamp);
    STANDARD.encode(signing_key.sign(message.as_bytes()).to_bytes())
}

/// A parsed, verified key-delivery identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryIdentity([u8; PUBLIC_KEY_SIZE]);

impl DeliveryIdentity {
    /// Raw public key bytes.
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }
}

/// Verify a key-delivery signature.
///
/// `public_key` and `signature` are base64. On success returns the signer
/// identity, which the relay records as the room owner on first delivery.
pub fn verify_key_delivery(
    public_key: &str,
    signature: &str,
    room: &str,
    key_base64: &str,
    timestamp: i64,
) -> Result<DeliveryIdentity, CryptoError> {
    let pk_bytes = STANDARD
        .decode(public_key.trim())
        .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;
    let pk: [u8; PUBLIC_KEY_SIZE] = pk_bytes
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidPublicKey)?;
    let verifying_key = VerifyingKey::from_bytes(&pk).map_err(|_| CryptoError::InvalidPublicKey)?;

    let sig_bytes = STANDARD
        .decode(signature.trim())
        .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;
    let sig: [u8; SIGNATURE_SIZE] = sig_bytes
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidSignature)?;
    let signature = Signature::from_bytes(&sig);

    let message = key_delivery_message(room, key_base64, timestamp);
    verifying_key
        .verify(message.as_bytes(), &signature)
        .map_err(|_| CryptoError::InvalidSignature)?;

    Ok(DeliveryIdentity(pk))
}
