//! # loom-types
//!
//! Wire format types for the cipherloom signaling relay.
//!
//! This crate provides the JSON frames exchanged over the signaling WebSocket:
//! - [`PeerId`], [`SessionToken`] - Connection identity types
//! - [`ClientMessage`] / [`ServerMessage`] - Signaling frames
//! - [`ErrorCode`] - Typed error replies
//! - [`envelope`] - Classification and sanitising of relayed payloads

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod envelope;
mod error;
mod ids;
mod messages;

pub use error::ErrorCode;
pub use ids::{PeerId, SessionToken};
pub use messages::{
    ClientMessage, EnablePersistence, Join, PeerAnnounce, PeerSummary, RelayBroadcast,
    RelayMessage, ServerMessage, Signal, Store, SyncPayload, SyncRequest, TopicRequest,
    WebrtcSignal, TOPIC_ROOM_PREFIX,
};
