//! Error codes carried by `{type:"error"}` replies.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Typed error code returned to signaling clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Frame was not valid JSON.
    InvalidJson,
    /// Frame was JSON but not a known message shape.
    InvalidMessage,
    /// Room id failed length/shape validation.
    InvalidRoom,
    /// Topic failed length/shape validation.
    InvalidTopic,
    /// Room is at capacity.
    RoomFull,
    /// Connection exceeded its message window.
    RateLimited,
    /// Operation requires a joined room.
    NotInRoom,
    /// Operation requires membership in at least one topic.
    NotInTopic,
    /// Per-connection topic ceiling reached.
    TooManyTopics,
    /// Relay target is not reachable through the sender's topics.
    RelayTargetNotFound,
    /// Room has a registered auth token and none was supplied.
    RoomRequiresAuth,
    /// Supplied auth token does not match the registered one.
    AuthTokenMismatch,
    /// Profile or peer info exceeds the size cap.
    ProfilePayloadTooLarge,
    /// Signaling payload exceeds the size cap.
    SignalPayloadTooLarge,
    /// Relay payload exceeds the size cap.
    RelayPayloadTooLarge,
    /// Stored blob exceeds the size cap.
    StorePayloadTooLarge,
    /// Payload could not be decoded (e.g. invalid base64).
    InvalidPayload,
    /// Workspace has not opted into persistence (or storage is off).
    PersistenceDisabled,
    /// Storage operation failed.
    StorageError,
}

impl ErrorCode {
    /// Wire representation of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidJson => "invalid_json",
            Self::InvalidMessage => "invalid_message",
            Self::InvalidRoom => "invalid_room",
            Self::InvalidTopic => "invalid_topic",
            Self::RoomFull => "room_full",
            Self::RateLimited => "rate_limited",
            Self::NotInRoom => "not_in_room",
            Self::NotInTopic => "not_in_topic",
            Self::TooManyTopics => "too_many_topics",
            Self::RelayTargetNotFound => "relay_target_not_found",
            Self::RoomRequiresAuth => "room_requires_auth",
            Self::AuthTokenMismatch => "auth_token_mismatch",
            Self::ProfilePayloadTooLarge => "profile_payload_too_large",
            Self::SignalPayloadTooLarge => "signal_payload_too_large",
            Self::RelayPayloadTooLarge => "relay_payload_too_large",
            Self::StorePayloadTooLarge => "store_payload_too_large",
            Self::InvalidPayload => "invalid_payload",
            Self::PersistenceDisabled => "persistence_disabled",
            Self::StorageError => "storage_error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
