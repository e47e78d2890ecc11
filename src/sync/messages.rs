//! Cluster Messages
//!
//! Wire format for registry synchronization. Messages are JSON objects
//! tagged by `kind`:
//!
//! ```text
//! {"kind":"ADD","name":"topicX","origin":"node-a","checksum":123}
//! {"kind":"REMOVE","name":"topicX","origin":"node-a","checksum":0}
//! {"kind":"FULL_STATE_REQUEST","requester":"node-c","target":null}
//! {"kind":"FULL_STATE_RESPONSE","origin":"node-a","requester":"node-c","revision":7,"checksum":123,"entries":["topicX"]}
//! ```

use crate::domain::NodeId;
use crate::error::{Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A registry synchronization message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterMessage {
    /// `origin` now owns `name`
    Add {
        name: String,
        origin: NodeId,
        /// Checksum of the origin's own entries after the mutation
        checksum: u64,
    },

    /// `origin` no longer owns `name`
    Remove {
        name: String,
        origin: NodeId,
        checksum: u64,
    },

    /// Ask members to report the entries they own
    FullStateRequest {
        requester: NodeId,
        /// Only this member should answer; `None` addresses everyone
        #[serde(default)]
        target: Option<NodeId>,
    },

    /// The complete set of entries owned by `origin`
    FullStateResponse {
        origin: NodeId,
        requester: NodeId,
        revision: u64,
        /// Checksum of `entries`, taken together with them
        checksum: u64,
        entries: Vec<String>,
    },
}

impl ClusterMessage {
    /// Node that produced this message
    pub fn sender(&self) -> &NodeId {
        match self {
            ClusterMessage::Add { origin, .. } => origin,
            ClusterMessage::Remove { origin, .. } => origin,
            ClusterMessage::FullStateRequest { requester, .. } => requester,
            ClusterMessage::FullStateResponse { origin, .. } => origin,
        }
    }

    /// Wire name of the message kind
    pub fn kind(&self) -> &'static str {
        match self {
            ClusterMessage::Add { .. } => "ADD",
            ClusterMessage::Remove { .. } => "REMOVE",
            ClusterMessage::FullStateRequest { .. } => "FULL_STATE_REQUEST",
            ClusterMessage::FullStateResponse { .. } => "FULL_STATE_RESPONSE",
        }
    }

    /// Serialize for publishing
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Parse and validate an inbound payload
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let message: ClusterMessage = serde_json::from_slice(payload)?;
        message.validate()?;
        Ok(message)
    }

    fn validate(&self) -> Result<()> {
        if self.sender().is_empty() {
            return Err(Error::MalformedMessage(format!(
                "{} without a sender node id",
                self.kind()
            )));
        }
        match self {
            ClusterMessage::Add { name, .. } | ClusterMessage::Remove { name, .. } => {
                if name.is_empty() {
                    return Err(Error::MalformedMessage(format!(
                        "{} with an empty entry name",
                        self.kind()
                    )));
                }
            }
            ClusterMessage::FullStateRequest { target, .. } => {
                if target.as_ref().is_some_and(NodeId::is_empty) {
                    return Err(Error::MalformedMessage(
                        "FULL_STATE_REQUEST with an empty target".to_string(),
                    ));
                }
            }
            ClusterMessage::FullStateResponse { requester, entries, .. } => {
                if requester.is_empty() {
                    return Err(Error::MalformedMessage(
                        "FULL_STATE_RESPONSE without a requester".to_string(),
                    ));
                }
                if entries.iter().any(String::is_empty) {
                    return Err(Error::MalformedMessage(
                        "FULL_STATE_RESPONSE with an empty entry name".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}
