//! # loom-crypto
//!
//! At-rest encryption and key-ownership primitives for cipherloom.
//!
//! ## Padded Encryption
//!
//! ```text
//! plaintext → len(4, BE) || plaintext || zero pad to 4096n
//!           → XChaCha20-Poly1305 (random 192-bit nonce)
//!           → nonce || ciphertext || tag
//! ```
//!
//! Blob sizes only reveal a 4 KiB bucket. [`decrypt`] returns `None` on any
//! failure (wrong key, tampering, inconsistent length prefix).
//!
//! ## Key Ownership
//!
//! [`verify_key_delivery`] checks the Ed25519 signature a client attaches
//! when handing a room's [`DocumentKey`] to the relay.
//! [`derive_room_auth_token`] is the client-side HMAC used to gate rooms.
//!
//! ## Example
//!
//! ```rust
//! use cipherloom_crypto::{decrypt, encrypt, DocumentKey};
//!
//! let key = DocumentKey::random();
//! let packed = encrypt(b"crdt state", &key).unwrap();
//! assert_eq!(decrypt(&packed, &key).unwrap(), b"crdt state");
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod auth;
mod cipher;
mod error;
mod key;
mod wipe;

pub use auth::{
    derive_room_auth_token, key_delivery_message, sign_key_delivery, verify_key_delivery,
    DeliveryIdentity, PUBLIC_KEY_SIZE, SIGNATURE_SIZE,
};
pub use cipher::{
    decrypt, encrypt, padded_len, LENGTH_PREFIX_SIZE, MAX_PLAINTEXT_SIZE, MIN_PACKED_SIZE,
    NONCE_SIZE, PAD_BLOCK_SIZE, TAG_SIZE,
};
pub use error::CryptoError;
pub use key::{DocumentKey, KEY_SIZE};
pub use wipe::{constant_time_eq, secure_wipe};
