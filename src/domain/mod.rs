//! Domain Module
//!
//! Core identifiers and the transport port the registry is built against.

pub mod ports;

pub use ports::{ClusterTransport, ClusterTransportRef, MembershipEvent, NodeId};
