//! Relayed payload handling.
//!
//! The relay forwards `relay-message` / `relay-broadcast` payloads without
//! interpreting them. Two shapes arrive on the wire:
//!
//! - **Encrypted envelope**: an object with `"encrypted": true`. The body is
//!   ciphertext the relay cannot read; it is forwarded byte-for-byte.
//! - **Legacy plaintext**: anything else. It is rebuilt key by key with
//!   prototype-pollution keys (`__proto__`, `constructor`, `prototype`)
//!   dropped, so browser clients never receive them from untrusted peers.

use serde_json::{Map, Value};

/// Keys dropped from plaintext payloads.
pub const FORBIDDEN_KEYS: [&str; 3] = ["__proto__", "constructor", "prototype"];

/// Nesting depth beyond which plaintext payloads are cut off.
pub const MAX_PLAINTEXT_DEPTH: usize = 32;

/// Returns `true` if the payload is marked as an encrypted envelope.
pub fn is_encrypted_envelope(payload: &Value) -> bool {
    payload
        .as_object()
        .and_then(|obj| obj.get("encrypted"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Prepare a payload for forwarding.
///
/// Encrypted envelopes are returned unchanged; plaintext payloads are copied
/// through [`sanitize_plaintext`].
pub fn prepare_for_relay(payload: Value) -> Value {
    if is_encrypted_envelope(&payload) {
        payload
    } else {
        sanitize_plaintext(payload)
    }
}

/// Copy a plaintext payload, dropping forbidden keys at every level.
///
/// Values nested deeper than [`MAX_PLAINTEXT_DEPTH`] become `null`.
pub fn sanitize_plaintext(payload: Value) -> Value {
    sanitize_at(payload, 0)
}

fn sanitize_at(value: Value, depth: usize) -> Value {
    if depth >= MAX_PLAINTEXT_DEPTH {
        return Value::Null;
    }
    match value {
        Value::Object(obj) => {
            let mut clean = Map::with_capacity(obj.len());
            for (key, inner) in obj {
                if FORBIDDEN_KEYS.contains(&key.as_str()) {
                    continue;
                }
                clean.insert(key, sanitize_at(inner, depth + 1));
            }
            Value::Object(clean)
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| sanitize_at(item, depth + 1))
                .collect(),
        ),
        scalar => scalar,
    }
}
