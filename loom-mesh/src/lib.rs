//! # loom-mesh
//!
//! Relay mesh participant for cipherloom.
//!
//! Relays find each other through a single well-known coordination topic,
//! gossip newline-delimited JSON over every swarm connection, and keep a
//! bounded, ranked routing table. Workspace topics are joined on demand so
//! relays can answer "who is in this workspace".
//!
//! ## Architecture
//!
//! ```text
//!            ┌──────────────────────────────┐
//!            │       MeshParticipant        │
//!            │  RoutingTable  Membership    │
//!            │  reader/writer task per link │
//!            └──────────────┬───────────────┘
//!                           │ SwarmConnection (AsyncRead + AsyncWrite)
//!            ┌──────────────┴───────────────┐
//!            │   Swarm (MemorySwarm/Iroh)   │
//!            └──────────────────────────────┘
//! ```
//!
//! ## Messages
//!
//! `relay-announce`, `bootstrap-request`/`bootstrap-response`,
//! `workspace-query`/`workspace-response`, `workspace-announce`,
//! `ping`/`pong`. See [`MeshMessage`].

#![warn(missing_docs)]
#![warn(clippy::all)]

mod backoff;
mod config;
mod error;
mod events;
mod framing;
mod membership;
mod messages;
mod participant;
mod routing;
pub mod swarm;
mod topic;

pub use backoff::backoff_delay;
pub use config::MeshConfig;
pub use error::{FrameError, MeshError, MeshResult, SwarmError, SwarmResult};
pub use events::MeshEvent;
pub use framing::{encode_line, LineDecoder, MAX_FRAME_BUFFER};
pub use membership::WorkspaceMembership;
pub use messages::{Capabilities, MeshMessage, RelayInfo, WorkspaceAction, PROTOCOL_VERSION};
pub use participant::{MeshParticipant, MeshStatus};
pub use routing::{RoutingTable, RECENCY_WINDOW_MS};
pub use swarm::{IrohSwarm, MemoryNetwork, MemorySwarm, Swarm, SwarmConnection};
pub use topic::Topic;
