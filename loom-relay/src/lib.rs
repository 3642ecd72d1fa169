//! # cipherloom-relay
//!
//! Zero-knowledge signaling relay for cipherloom.
//!
//! This crate implements a relay server that:
//! - Brokers rooms and P2P topics over WebSocket signaling
//! - Forwards encrypted relay payloads without reading them
//! - Stores opaque ciphertext blobs for workspaces that opted in
//! - Persists CRDT room state encrypted with keys delivered over HTTP
//! - Optionally joins the relay mesh to help peers find each other
//!
//! ## Architecture
//!
//! ```text
//! Browser A ──┐      WebSocket /ws       ┌── Browser B
//!             ├─────────────────────────►│
//!         ┌───┴──────────────────────────┴───┐
//!         │        cipherloom-relay          │
//!         │  SignalingServer   KeyRegistry   │
//!         │  PersistenceCoordinator          │
//!         │  ┌────────────────────────────┐  │
//!         │  │   SQLite (ciphertext)      │  │
//!         │  └────────────────────────────┘  │
//!         └───────────────┬──────────────────┘
//!                         │ loom-mesh
//!                   other relays
//! ```
//!
//! ## Protocol
//!
//! Signaling frames are JSON objects tagged by `type`, see
//! [`loom_types::ClientMessage`] and [`loom_types::ServerMessage`]. The HTTP
//! surface is built by [`http::build_router`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cleanup;
pub mod config;
pub mod debounce;
pub mod error;
pub mod http;
pub mod keys;
pub mod limits;
pub mod persistence;
pub mod server;
pub mod session;
pub mod signaling;
pub mod storage;

pub use config::Config;
pub use error::{RelayError, Result};
pub use server::{Relay, RelayMetrics};
