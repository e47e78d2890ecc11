//! Entry Table
//!
//! Per-entry owner sets plus a reverse index from node to the entries it
//! owns. Both sides are updated together so that for every (entry, node)
//! pair, `node ∈ owners(entry)` holds exactly when `entry ∈ owners_of(node)`.
//!
//! The table never talks to the network and never emits events.

use crate::domain::NodeId;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Owner sets for named entries with a node → entries reverse index
#[derive(Debug, Default, Clone)]
pub struct EntryTable {
    /// Entry name → owning nodes (never empty)
    entries: HashMap<String, HashSet<NodeId>>,
    /// Node → names it owns (never empty)
    contributions: HashMap<NodeId, HashSet<String>>,
}

impl EntryTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// True iff the entry has at least one owner
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Owners of an entry, empty if absent
    pub fn owners(&self, name: &str) -> BTreeSet<NodeId> {
        self.entries
            .get(name)
            .map(|owners| owners.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Check whether `node` currently owns `name`
    pub fn is_owner(&self, name: &str, node: &NodeId) -> bool {
        self.entries
            .get(name)
            .is_some_and(|owners| owners.contains(node))
    }

    /// Add `node` as an owner of `name`
    ///
    /// Returns true iff the entry went from absent to present. Adding an
    /// owner that is already present is a no-op returning false.
    pub fn add_owner(&mut self, name: &str, node: &NodeId) -> bool {
        let owners = self.entries.entry(name.to_string()).or_default();
        let first = owners.is_empty();
        if !owners.insert(node.clone()) {
            return false;
        }

        self.contributions
            .entry(node.clone())
            .or_default()
            .insert(name.to_string());

        first
    }

    /// Remove `node` from the owners of `name`
    ///
    /// Returns true iff the owner set became empty, in which case the entry
    /// is dropped. Removing a pair that does not exist is a no-op returning
    /// false.
    pub fn remove_owner(&mut self, name: &str, node: &NodeId) -> bool {
        let Some(owners) = self.entries.get_mut(name) else {
            return false;
        };
        if !owners.remove(node) {
            return false;
        }
        let emptied = owners.is_empty();
        if emptied {
            self.entries.remove(name);
        }

        if let Some(names) = self.contributions.get_mut(node) {
            names.remove(name);
            if names.is_empty() {
                self.contributions.remove(node);
            }
        }

        emptied
    }

    /// Entries currently owned by `node`
    pub fn owners_of(&self, node: &NodeId) -> BTreeSet<String> {
        self.contributions
            .get(node)
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Iterate over the names of all present entries
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Iterate over the names owned by `node` without cloning
    pub fn contributed_by<'a>(&'a self, node: &NodeId) -> impl Iterator<Item = &'a str> {
        self.contributions
            .get(node)
            .into_iter()
            .flat_map(|names| names.iter().map(String::as_str))
    }

    /// Iterate over nodes owning at least one entry
    pub fn nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.contributions.keys()
    }

    /// Number of present entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of nodes owning at least one entry
    pub fn node_count(&self) -> usize {
        self.contributions.len()
    }

    /// Verify the forward and reverse indexes agree and hold no empty sets
    pub fn is_consistent(&self) -> bool {
        let forward_ok = self.entries.iter().all(|(name, owners)| {
            !owners.is_empty()
                && owners.iter().all(|node| {
                    self.contributions
                        .get(node)
                        .is_some_and(|names| names.contains(name))
                })
        });
        let reverse_ok = self.contributions.iter().all(|(node, names)| {
            !names.is_empty()
                && names.iter().all(|name| {
                    self.entries
                        .get(name)
                        .is_some_and(|owners| owners.contains(node))
                })
        });
        forward_ok && reverse_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> NodeId {
        NodeId::new(id)
    }

    #[test]
    fn test_first_owner_transition() {
        let mut table = EntryTable::new();

        assert!(table.add_owner("topicX", &node("a")));
        assert!(!table.add_owner("topicX", &node("b")));
        assert!(table.contains("topicX"));
        let expected: BTreeSet<NodeId> = [node("a"), node("b")].into_iter().collect();
        assert_eq!(table.owners("topicX"), expected);
    }

    #[test]
    fn test_add_owner_is_idempotent() {
        let mut table = EntryTable::new();

        assert!(table.add_owner("topicX", &node("a")));
        assert!(!table.add_owner("topicX", &node("a")));
        assert_eq!(table.owners("topicX").len(), 1);
        assert_eq!(table.owners_of(&node("a")).len(), 1);
        assert!(table.is_consistent());
    }

    #[test]
    fn test_last_owner_transition() {
        let mut table = EntryTable::new();
        table.add_owner("topicX", &node("a"));
        table.add_owner("topicX", &node("b"));

        assert!(!table.remove_owner("topicX", &node("a")));
        assert!(table.contains("topicX"));
        assert!(table.remove_owner("topicX", &node("b")));
        assert!(!table.contains("topicX"));
        assert!(table.owners("topicX").is_empty());
        assert!(table.is_empty());
        assert_eq!(table.node_count(), 0);
    }

    #[test]
    fn test_remove_missing_pair_is_noop() {
        let mut table = EntryTable::new();
        assert!(!table.remove_owner("never-added", &node("a")));

        table.add_owner("topicX", &node("a"));
        assert!(!table.remove_owner("topicX", &node("b")));
        assert!(table.remove_owner("topicX", &node("a")));
        assert!(!table.remove_owner("topicX", &node("a")));
        assert!(table.is_consistent());
    }

    #[test]
    fn test_reverse_index_tracks_contributions() {
        let mut table = EntryTable::new();
        table.add_owner("x", &node("a"));
        table.add_owner("y", &node("a"));
        table.add_owner("y", &node("b"));

        let expected: BTreeSet<String> = ["x".to_string(), "y".to_string()].into();
        assert_eq!(table.owners_of(&node("a")), expected);
        assert_eq!(table.contributed_by(&node("b")).collect::<Vec<_>>(), vec!["y"]);
        assert!(table.owners_of(&node("c")).is_empty());

        table.remove_owner("x", &node("a"));
        table.remove_owner("y", &node("a"));
        assert!(table.owners_of(&node("a")).is_empty());
        assert_eq!(table.node_count(), 1);
        assert_eq!(table.nodes().collect::<Vec<_>>(), vec![&node("b")]);
        assert!(table.is_consistent());
    }

    #[test]
    fn test_consistency_after_mixed_operations() {
        let mut table = EntryTable::new();
        let nodes = [node("a"), node("b"), node("c")];
        let names = ["n0", "n1", "n2", "n3"];

        for step in 0..200usize {
            let name = names[(step * 7) % names.len()];
            let owner = &nodes[(step * 5) % nodes.len()];
            if step % 3 == 0 {
                table.remove_owner(name, owner);
            } else {
                table.add_owner(name, owner);
            }
            assert!(table.is_consistent(), "inconsistent after step {step}");
        }
    }
}
