//! Cluster Sync
//!
//! Wire messages, contribution checksums, and the task that keeps a
//! registry's view in line with the rest of the cluster.

pub mod checksum;
pub mod messages;
pub mod protocol;

pub use checksum::{contribution_checksum, name_hash, ChecksumTracker};
pub use messages::ClusterMessage;
pub use protocol::{Publisher, ReadyReason, Readiness, SyncPhase};
