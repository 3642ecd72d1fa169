//! Error types for loom-mesh.

/// Main error type for mesh operations.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    /// Underlying swarm failed.
    #[error("swarm error: {0}")]
    Swarm(#[from] SwarmError),

    /// Participant was started twice.
    #[error("mesh participant already started")]
    AlreadyStarted,

    /// Operation requires a started participant.
    #[error("mesh participant not started")]
    NotStarted,

    /// Workspace id was empty.
    #[error("invalid workspace id")]
    InvalidWorkspace,
}

/// Errors raised by a [`Swarm`](crate::Swarm) implementation.
#[derive(Debug, thiserror::Error)]
pub enum SwarmError {
    /// Binding the local endpoint failed.
    #[error("bind failed: {0}")]
    Bind(String),

    /// Dialing a peer failed.
    #[error("connection failed: {0}")]
    Connect(String),

    /// Peer address could not be parsed.
    #[error("invalid peer address: {0}")]
    InvalidAddress(String),

    /// Swarm has been destroyed.
    #[error("swarm destroyed")]
    Destroyed,
}

/// Errors raised while decoding newline-delimited frames.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    /// Buffered bytes without a newline exceeded the cap.
    #[error("frame buffer overflow: {size} bytes (limit: {limit} bytes)")]
    Overflow {
        /// Bytes that would be buffered.
        size: usize,
        /// Maximum buffered bytes.
        limit: usize,
    },
}

/// Result type alias for mesh operations.
pub type MeshResult<T> = std::result::Result<T, MeshError>;

/// Result type alias for swarm operations.
pub type SwarmResult<T> = std::result::Result<T, SwarmError>;
