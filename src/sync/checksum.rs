//! Contribution Checksums
//!
//! Each ADD/REMOVE carries a checksum of the names its sender owns. A
//! receiver that computes a different value for its own view of that sender
//! has missed or misordered messages and schedules a targeted full-state
//! request.
//!
//! The checksum is a wrapping sum of per-name FNV-1a hashes, so it does not
//! depend on iteration order and is stable across processes.

use crate::domain::NodeId;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a 64-bit hash of a single entry name
#[inline]
pub fn name_hash(name: &str) -> u64 {
    name.as_bytes().iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Order-independent checksum of a set of entry names
pub fn contribution_checksum<'a>(names: impl IntoIterator<Item = &'a str>) -> u64 {
    names
        .into_iter()
        .fold(0u64, |sum, name| sum.wrapping_add(name_hash(name)))
}

/// Remote checksums and in-flight reconciliations, per remote node
#[derive(Debug, Default)]
pub struct ChecksumTracker {
    /// Last checksum each node reported for its own entries
    reported: Mutex<HashMap<NodeId, u64>>,
    /// Nodes with a reconciliation already scheduled
    pending: Mutex<HashSet<NodeId>>,
}

impl ChecksumTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the checksum a node reported
    pub fn record(&self, node: &NodeId, checksum: u64) {
        self.reported.lock().insert(node.clone(), checksum);
    }

    /// Last checksum reported by a node
    pub fn reported(&self, node: &NodeId) -> Option<u64> {
        self.reported.lock().get(node).copied()
    }

    /// True if the node's reported checksum disagrees with `local_view`
    pub fn diverges(&self, node: &NodeId, local_view: u64) -> bool {
        self.reported(node).is_some_and(|reported| reported != local_view)
    }

    /// Mark a reconciliation as scheduled. Returns false if one already is.
    pub fn begin(&self, node: &NodeId) -> bool {
        self.pending.lock().insert(node.clone())
    }

    /// Clear the scheduled flag for a node
    pub fn finish(&self, node: &NodeId) {
        self.pending.lock().remove(node);
    }

    /// Drop everything known about a departed node
    pub fn forget(&self, node: &NodeId) {
        self.reported.lock().remove(node);
        self.pending.lock().remove(node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_hash_reference_values() {
        // FNV-1a 64 published test vectors
        assert_eq!(name_hash(""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(name_hash("a"), 0xaf63_dc4c_8601_ec8c);
        assert_eq!(name_hash("foobar"), 0x8594_4171_f739_67e8);
    }

    #[test]
    fn test_checksum_is_order_independent() {
        let forward = contribution_checksum(["x", "y", "z"]);
        let backward = contribution_checksum(["z", "y", "x"]);
        assert_eq!(forward, backward);
        assert_ne!(forward, contribution_checksum(["x", "y"]));
        assert_eq!(contribution_checksum(std::iter::empty::<&str>()), 0);
    }

    #[test]
    fn test_tracker_divergence() {
        let tracker = ChecksumTracker::new();
        let node = NodeId::new("node-a");

        assert!(!tracker.diverges(&node, 7));

        tracker.record(&node, contribution_checksum(["x"]));
        assert!(!tracker.diverges(&node, contribution_checksum(["x"])));
        assert!(tracker.diverges(&node, 0));

        tracker.record(&node, 0);
        assert!(!tracker.diverges(&node, 0));

        tracker.forget(&node);
        assert_eq!(tracker.reported(&node), None);
    }

    #[test]
    fn test_tracker_debounces_reconciliation() {
        let tracker = ChecksumTracker::new();
        let node = NodeId::new("node-a");

        assert!(tracker.begin(&node));
        assert!(!tracker.begin(&node));
        tracker.finish(&node);
        assert!(tracker.begin(&node));

        tracker.record(&node, 1);
        tracker.forget(&node);
        assert_eq!(tracker.reported(&node), None);
        assert!(tracker.begin(&node));
    }
}
