//! Events emitted by a running [`MeshParticipant`](crate::MeshParticipant).

use crate::messages::RelayInfo;
use crate::topic::Topic;

/// Capacity of the event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Observable mesh activity.
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    /// Participant joined the coordination topic.
    Started {
        /// Local node id.
        node_id: String,
    },
    /// Participant shut down.
    Stopped,
    /// A relay was added to the routing table.
    RelayDiscovered(RelayInfo),
    /// Local node joined a workspace topic.
    WorkspaceJoined {
        /// Workspace id as given by the caller.
        workspace_id: String,
        /// Derived topic.
        topic: Topic,
    },
    /// Local node left a workspace topic.
    WorkspaceLeft {
        /// Workspace id as given by the caller.
        workspace_id: String,
        /// Derived topic.
        topic: Topic,
    },
    /// A remote node announced joining a workspace topic.
    WorkspacePeerJoined {
        /// Workspace topic.
        topic: Topic,
        /// Remote node id.
        node_id: String,
    },
    /// A remote node left a workspace topic (or disconnected).
    WorkspacePeerLeft {
        /// Workspace topic.
        topic: Topic,
        /// Remote node id.
        node_id: String,
    },
}
