//! Cluster Transports
//!
//! Implementations of [`ClusterTransport`](crate::domain::ClusterTransport).
//! Production deployments bring their own; the in-process ones here back
//! the tests and the demo binary.

pub mod memory;

pub use memory::{InMemoryCluster, InMemoryTransport, RecordingTransport};
