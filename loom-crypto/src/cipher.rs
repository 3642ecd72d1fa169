//! Padded XChaCha20-Poly1305 encryption of document state at rest.
//!
//! Packing:
//!
//! ```text
//! frame   = len (4 bytes, big-endian) || plaintext || zero padding
//!           padded up to the next multiple of PAD_BLOCK_SIZE
//! output  = nonce (24 bytes) || XChaCha20-Poly1305(frame)
//! ```
//!
//! Stored blob sizes therefore only reveal a 4 KiB bucket, not the exact
//! length of the document.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::key::DocumentKey;
use crate::wipe::secure_wipe;

/// Size of XChaCha20-Poly1305 nonce in bytes (192 bits).
pub const NONCE_SIZE: usize = 24;

/// Size of the Poly1305 authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// Size of the plaintext length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Padding block size in bytes.
pub const PAD_BLOCK_SIZE: usize = 4096;

/// Maximum plaintext size accepted for encryption (100 MB).
pub const MAX_PLAINTEXT_SIZE: usize = 100 * 1024 * 1024;

/// Smallest input `decrypt` will attempt to open.
pub const MIN_PACKED_SIZE: usize = NONCE_SIZE + TAG_SIZE + LENGTH_PREFIX_SIZE;

/// Length of the padded frame for a plaintext of `len` bytes.
pub fn padded_len(len: usize) -> usize {
    let framed = len + LENGTH_PREFIX_SIZE;
    framed.div_ceil(PAD_BLOCK_SIZE) * PAD_BLOCK_SIZE
}

/// Encrypt `plaintext` with a random nonce.
///
/// Two calls with the same input never produce the same output.
pub fn encrypt(plaintext: &[u8], key: &DocumentKey) -> Result<Vec<u8>, CryptoError> {
    if plaintext.len() > MAX_PLAINTEXT_SIZE {
        return Err(CryptoError::PlaintextTooLarge {
            size: plaintext.len(),
            limit: MAX_PLAINTEXT_SIZE,
        });
    }

    let mut frame = Zeroizing::new(vec![0u8; padded_len(plaintext.len())]);
    frame[..LENGTH_PREFIX_SIZE].copy_from_slice(&(plaintext.len() as u32).to_be_bytes());
    frame[LENGTH_PREFIX_SIZE..LENGTH_PREFIX_SIZE + plaintext.len()].copy_from_slice(plaintext);

    let mut nonce = [0u8; NONCE_SIZE];
    getrandom::getrandom(&mut nonce).map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let cipher = XChaCha20Poly1305::new_from_slice(key.as_bytes())
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), frame.as_slice())
        .map_err(|_| CryptoError::EncryptionFailed("aead encrypt failed".into()));
    secure_wipe(&mut frame);
    let ciphertext = ciphertext?;

    let mut packed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    packed.extend_from_slice(&nonce);
    packed.extend_from_slice(&ciphertext);
    Ok(packed)
}

/// Decrypt a packed blob.
///
/// Returns `None` for a wrong key, a tampered or truncated blob, or a length
/// prefix inconsistent with the padded frame. A missing or wrong key is an
/// expected condition during normal operation, so no error detail is given.
pub fn decrypt(packed: &[u8], key: &DocumentKey) -> Option<Vec<u8>> {
    if packed.len() < MIN_PACKED_SIZE {
        return None;
    }
    let (nonce, ciphertext) = packed.split_at(NONCE_SIZE);

    let cipher = XChaCha20Poly1305::new_from_slice(key.as_bytes()).ok()?;
    let mut frame = Zeroizing::new(cipher.decrypt(XNonce::from_slice(nonce), ciphertext).ok()?);

    let result = unpack_frame(&frame);
    secure_wipe(&mut frame);
    result
}

fn unpack_frame(frame: &[u8]) -> Option<Vec<u8>> {
    if frame.len() < LENGTH_PREFIX_SIZE {
        return None;
    }
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    prefix.copy_from_slice(&frame[..LENGTH_PREFIX_SIZE]);
    let len = u32::from_be_bytes(prefix) as usize;

    if len > frame.len() - LENGTH_PREFIX_SIZE {
        return None;
    }
    Some(frame[LENGTH_PREFIX_SIZE..LENGTH_PREFIX_SIZE + len].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> DocumentKey {
        DocumentKey::from_slice(&[byte; 32]).unwrap()
    }

    #[test]
    fn roundtrip_various_sizes() {
        let k = key(0x42);
        for size in [0usize, 1, 4091, 4092, 4093, 10_000] {
            let plaintext: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let packed = encrypt(&plaintext, &k).unwrap();
            assert_eq!(decrypt(&packed, &k).unwrap(), plaintext, "size {size}");
        }
    }

    #[test]
    fn output_size_is_bucketed() {
        let k = key(0x01);
        let small = encrypt(b"a", &k).unwrap();
        let larger = encrypt(&[7u8; 3000], &k).unwrap();
        assert_eq!(small.len(), larger.len());
        assert_eq!(small.len(), NONCE_SIZE + PAD_BLOCK_SIZE + TAG_SIZE);

        // 4092 bytes + 4-byte prefix fills one block exactly; one more spills.
        assert_eq!(padded_len(4092), PAD_BLOCK_SIZE);
        assert_eq!(padded_len(4093), 2 * PAD_BLOCK_SIZE);
    }

    #[test]
    fn nonces_make_ciphertexts_differ() {
        let k = key(0x09);
        let a = encrypt(b"same plaintext", &k).unwrap();
        let b = encrypt(b"same plaintext", &k).unwrap();
        assert_ne!(a, b);
        assert_ne!(a[..NONCE_SIZE], b[..NONCE_SIZE]);
    }

    #[test]
    fn wrong_key_fails() {
        let packed = encrypt(b"secret", &key(0x11)).unwrap();
        assert!(decrypt(&packed, &key(0x22)).is_none());
    }

    #[test]
    fn any_flipped_bit_in_ciphertext_fails() {
        let k = key(0x33);
        let packed = encrypt(b"tamper me", &k).unwrap();
        // Sample positions across the ciphertext region, including the tag.
        let positions = [
            NONCE_SIZE,
            NONCE_SIZE + 1,
            NONCE_SIZE + 100,
            packed.len() / 2,
            packed.len() - TAG_SIZE,
            packed.len() - 1,
        ];
        for pos in positions {
            for bit in 0..8 {
                let mut corrupted = packed.clone();
                corrupted[pos] ^= 1 << bit;
                assert!(decrypt(&corrupted, &k).is_none(), "pos {pos} bit {bit}");
            }
        }
    }

    #[test]
    fn flipped_nonce_fails() {
        let k = key(0x34);
        let mut packed = encrypt(b"x", &k).unwrap();
        packed[0] ^= 0x80;
        assert!(decrypt(&packed, &k).is_none());
    }

    #[test]
    fn short_input_fails() {
        let k = key(0x44);
        assert!(decrypt(&[], &k).is_none());
        assert!(decrypt(&[0u8; MIN_PACKED_SIZE - 1], &k).is_none());
        assert!(decrypt(&[0u8; MIN_PACKED_SIZE], &k).is_none());
    }

    #[test]
    fn inconsistent_length_prefix_fails() {
        // Authentic ciphertext whose frame claims more bytes than it holds.
        let k = key(0x55);
        let mut frame = vec![0u8; PAD_BLOCK_SIZE];
        frame[..4].copy_from_slice(&(PAD_BLOCK_SIZE as u32).to_be_bytes());
        let nonce = [3u8; NONCE_SIZE];
        let cipher = XChaCha20Poly1305::new_from_slice(k.as_bytes()).unwrap();
        let ct = cipher
            .encrypt(XNonce::from_slice(&nonce), frame.as_slice())
            .unwrap();
        let mut packed = nonce.to_vec();
        packed.extend_from_slice(&ct);

        assert!(decrypt(&packed, &k).is_none());
    }

    #[test]
    fn oversized_plaintext_limit() {
        // A 100MB+ allocation is too slow for unit tests; the guard sits
        // before any allocation in `encrypt`.
        assert_eq!(MAX_PLAINTEXT_SIZE, 100 * 1024 * 1024);
        assert!(padded_len(MAX_PLAINTEXT_SIZE) <= u32::MAX as usize);
    }
}
