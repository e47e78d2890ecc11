//! Domain Ports - Boundary between the registry and the cluster transport
//!
//! The registry never reaches for an ambient message bus. Whatever carries
//! bytes between cluster members is injected as a [`ClusterTransport`]
//! capability, which keeps the synchronization protocol testable against an
//! in-process fake.

use crate::error::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

// =============================================================================
// Node ID
// =============================================================================

/// Unique identifier for a cluster member
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<&String> for NodeId {
    fn from(s: &String) -> Self {
        Self(s.clone())
    }
}

impl From<&NodeId> for NodeId {
    fn from(id: &NodeId) -> Self {
        id.clone()
    }
}

// =============================================================================
// Membership Events
// =============================================================================

/// Node lifecycle signals reported by the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipEvent {
    /// A node joined the cluster
    NodeJoined(NodeId),
    /// A node left the cluster (reported at least once per departure)
    NodeLeft(NodeId),
}

impl MembershipEvent {
    /// Get the node this event refers to
    pub fn node_id(&self) -> &NodeId {
        match self {
            MembershipEvent::NodeJoined(id) | MembershipEvent::NodeLeft(id) => id,
        }
    }
}

// =============================================================================
// Cluster Transport Port
// =============================================================================

/// Topic-scoped, best-effort message bus between cluster members
///
/// Delivery is at-most-once per publish with no ordering guarantee across
/// nodes. Implementations deliver each inbound payload on a topic to the
/// subscriber channel in the order the transport received it.
pub trait ClusterTransport: Send + Sync {
    /// Identity of the local node
    fn local_node(&self) -> &NodeId;

    /// Other members currently known to the transport
    fn peers(&self) -> Vec<NodeId>;

    /// Broadcast a payload to all current members on a topic
    ///
    /// Fire-and-forget: returning `Ok` does not imply delivery.
    fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;

    /// Subscribe to inbound payloads on a topic
    fn subscribe(&self, topic: &str) -> mpsc::UnboundedReceiver<Bytes>;

    /// Subscribe to node lifecycle signals
    fn membership(&self) -> broadcast::Receiver<MembershipEvent>;
}

/// Type alias for Arc'd ClusterTransport
pub type ClusterTransportRef = Arc<dyn ClusterTransport>;
