//! Reconciliation Engine
//!
//! The single mutation path for the entry table. Local intent and remote
//! messages both land here, under one lock, and the engine derives the two
//! externally visible signals: an entry's first owner appearing and its last
//! owner disappearing.
//!
//! # Consistency
//!
//! This is a convergence-only structure. Adds and removes are idempotent, so
//! duplicated or dropped messages only delay convergence. Messages for the
//! same (entry, node) pair that arrive out of order are applied in arrival
//! order and the result is accepted as authoritative; no causal ordering is
//! attempted beyond what the transport provides. Divergence left behind by
//! reordering is repaired by checksum-triggered full-state reconciliation in
//! the sync layer.

use crate::domain::NodeId;
use crate::registry::entry_table::EntryTable;
use crate::registry::events::{EventKind, Notifier, RegistryEvent};
use crate::registry::metrics::RegistryMetrics;
use crate::sync::checksum::contribution_checksum;
use crate::sync::messages::ClusterMessage;
use crate::sync::protocol::Publisher;
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

// =============================================================================
// Registry State
// =============================================================================

/// Effect of a single owner mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Change {
    /// The owner set changed
    pub applied: bool,
    /// The entry crossed the absent/present boundary
    pub transitioned: bool,
}

/// Entry table plus a local revision counter
#[derive(Debug, Default)]
pub struct RegistryState {
    table: EntryTable,
    revision: u64,
}

impl RegistryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(&self) -> &EntryTable {
        &self.table
    }

    /// Incremented on every mutation that changes the table
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn add(&mut self, name: &str, node: &NodeId) -> Change {
        if self.table.is_owner(name, node) {
            return Change::default();
        }
        let transitioned = self.table.add_owner(name, node);
        self.revision += 1;
        Change {
            applied: true,
            transitioned,
        }
    }

    pub fn remove(&mut self, name: &str, node: &NodeId) -> Change {
        if !self.table.is_owner(name, node) {
            return Change::default();
        }
        let transitioned = self.table.remove_owner(name, node);
        self.revision += 1;
        Change {
            applied: true,
            transitioned,
        }
    }

    /// Checksum of the entries `node` owns in this view
    pub fn checksum_of(&self, node: &NodeId) -> u64 {
        contribution_checksum(self.table.contributed_by(node))
    }
}

/// Counts from applying a full-state dump
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MergeOutcome {
    /// Owner pairs newly attributed to the origin
    pub added: usize,
    /// Owner pairs the origin no longer reports
    pub retracted: usize,
}

// =============================================================================
// Reconciliation Engine
// =============================================================================

/// Applies local and remote operations to the entry table
pub struct ReconciliationEngine {
    /// Identity used as owner for local operations
    local: NodeId,
    /// Table and revision, guarded as one unit
    state: Mutex<RegistryState>,
    /// Outbound deltas
    publisher: Publisher,
    /// Presence transitions
    notifier: Notifier,
    metrics: Arc<RegistryMetrics>,
}

impl std::fmt::Debug for ReconciliationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ReconciliationEngine")
            .field("local", &self.local)
            .field("entries", &state.table.len())
            .field("revision", &state.revision)
            .finish()
    }
}

impl ReconciliationEngine {
    pub fn new(
        local: NodeId,
        publisher: Publisher,
        notifier: Notifier,
        metrics: Arc<RegistryMetrics>,
    ) -> Self {
        Self {
            local,
            state: Mutex::new(RegistryState::new()),
            publisher,
            notifier,
            metrics,
        }
    }

    pub fn local_node(&self) -> &NodeId {
        &self.local
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    // -------------------------------------------------------------------------
    // Local operations
    // -------------------------------------------------------------------------

    /// Assert local ownership of `name`
    ///
    /// Broadcasts ADD whenever the local node did not already own the entry,
    /// even if other nodes did, so peers learn the full owner set.
    pub fn apply_local_add(&self, name: &str) {
        let mut state = self.state.lock();
        let change = state.add(name, &self.local);
        if change.applied {
            self.metrics.record_local_add();
            let checksum = state.checksum_of(&self.local);
            self.publisher.send(&ClusterMessage::Add {
                name: name.to_string(),
                origin: self.local.clone(),
                checksum,
            });
        }
        let mut events = Vec::new();
        self.collect(name, EventKind::EntryAdded, change, &mut events);
        self.finish(state, events);
    }

    /// Retract local ownership of `name`
    ///
    /// Broadcasts REMOVE iff the local node owned the entry before the call.
    pub fn apply_local_remove(&self, name: &str) {
        let mut state = self.state.lock();
        let change = state.remove(name, &self.local);
        if change.applied {
            self.metrics.record_local_remove();
            let checksum = state.checksum_of(&self.local);
            self.publisher.send(&ClusterMessage::Remove {
                name: name.to_string(),
                origin: self.local.clone(),
                checksum,
            });
        }
        let mut events = Vec::new();
        self.collect(name, EventKind::EntryRemoved, change, &mut events);
        self.finish(state, events);
    }

    // -------------------------------------------------------------------------
    // Remote operations (never re-broadcast)
    // -------------------------------------------------------------------------

    pub fn apply_remote_add(&self, name: &str, origin: &NodeId) {
        let mut state = self.state.lock();
        let mut events = Vec::new();
        self.remote_add_locked(&mut state, name, origin, &mut events);
        self.finish(state, events);
    }

    pub fn apply_remote_remove(&self, name: &str, origin: &NodeId) {
        let mut state = self.state.lock();
        let mut events = Vec::new();
        self.remote_remove_locked(&mut state, name, origin, &mut events);
        self.finish(state, events);
    }

    /// Treat `entries` as the complete set of names `origin` owns
    ///
    /// Names attributed to `origin` but missing from the dump are retracted,
    /// listed names are added. A dump claiming to come from the local node is
    /// ignored: local contributions only change through local calls.
    pub fn apply_full_state(&self, origin: &NodeId, entries: &[String]) -> MergeOutcome {
        if *origin == self.local {
            return MergeOutcome::default();
        }

        let incoming: HashSet<&str> = entries.iter().map(String::as_str).collect();
        let mut state = self.state.lock();
        let stale: Vec<String> = state
            .table
            .contributed_by(origin)
            .filter(|name| !incoming.contains(name))
            .map(str::to_string)
            .collect();

        let mut events = Vec::new();
        let mut outcome = MergeOutcome::default();
        for name in &stale {
            if self.remote_remove_locked(&mut state, name, origin, &mut events) {
                outcome.retracted += 1;
            }
        }
        for name in incoming {
            if self.remote_add_locked(&mut state, name, origin, &mut events) {
                outcome.added += 1;
            }
        }
        self.finish(state, events);
        outcome
    }

    /// Retract every entry owned by `node`
    ///
    /// Reads the node's contributions once and removes each through the
    /// remote-remove path, so last-owner transitions still fire. Nothing is
    /// broadcast. Returns the number of retracted entries; a second call for
    /// the same node returns 0.
    pub fn remove_node(&self, node: &NodeId) -> usize {
        let mut state = self.state.lock();
        let owned = state.table.owners_of(node);
        let mut events = Vec::new();
        for name in &owned {
            self.remote_remove_locked(&mut state, name, node, &mut events);
        }
        self.finish(state, events);
        owned.len()
    }

    /// Publish the local node's entries as a FULL_STATE_RESPONSE
    ///
    /// The snapshot and the publish happen under the table lock, so a local
    /// delta can never be published between them. Returns the revision and
    /// entry count that were sent.
    pub fn publish_full_state(&self, requester: &NodeId) -> Option<(u64, usize)> {
        let state = self.state.lock();
        let entries: Vec<String> = state
            .table
            .contributed_by(&self.local)
            .map(str::to_string)
            .collect();
        let count = entries.len();
        let message = ClusterMessage::FullStateResponse {
            origin: self.local.clone(),
            requester: requester.clone(),
            revision: state.revision,
            checksum: state.checksum_of(&self.local),
            entries,
        };
        self.publisher
            .send(&message)
            .then_some((state.revision, count))
    }

    fn remote_add_locked(
        &self,
        state: &mut RegistryState,
        name: &str,
        origin: &NodeId,
        events: &mut Vec<RegistryEvent>,
    ) -> bool {
        let change = state.add(name, origin);
        if change.applied {
            self.metrics.record_remote_add();
        }
        self.collect(name, EventKind::EntryAdded, change, events);
        change.applied
    }

    fn remote_remove_locked(
        &self,
        state: &mut RegistryState,
        name: &str,
        origin: &NodeId,
        events: &mut Vec<RegistryEvent>,
    ) -> bool {
        let change = state.remove(name, origin);
        if change.applied {
            self.metrics.record_remote_remove();
        }
        self.collect(name, EventKind::EntryRemoved, change, events);
        change.applied
    }

    fn collect(&self, name: &str, kind: EventKind, change: Change, events: &mut Vec<RegistryEvent>) {
        if !change.transitioned {
            return;
        }
        debug!(entry = %name, transition = %kind, "Entry presence changed");
        events.push(match kind {
            EventKind::EntryAdded => RegistryEvent::added(name),
            EventKind::EntryRemoved => RegistryEvent::removed(name),
        });
    }

    /// Queue events in mutation order, release the table, then deliver
    fn finish(&self, state: MutexGuard<'_, RegistryState>, events: Vec<RegistryEvent>) {
        debug_assert!(state.table.is_consistent());
        if !events.is_empty() {
            let added = events
                .iter()
                .filter(|event| event.kind() == EventKind::EntryAdded)
                .count() as u64;
            self.metrics
                .record_transitions(added, events.len() as u64 - added);
            self.notifier.enqueue(events);
        }
        drop(state);
        self.notifier.flush();
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn contains(&self, name: &str) -> bool {
        self.state.lock().table.contains(name)
    }

    pub fn owners(&self, name: &str) -> BTreeSet<NodeId> {
        self.state.lock().table.owners(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.state.lock().table.names().map(str::to_string).collect()
    }

    /// Entry name → owners for the whole table
    pub fn snapshot(&self) -> HashMap<String, BTreeSet<NodeId>> {
        let state = self.state.lock();
        state
            .table
            .names()
            .map(|name| (name.to_string(), state.table.owners(name)))
            .collect()
    }

    pub fn owned_by(&self, node: &NodeId) -> BTreeSet<String> {
        self.state.lock().table.owners_of(node)
    }

    /// Nodes that own at least one entry, sorted
    pub fn contributors(&self) -> Vec<NodeId> {
        let state = self.state.lock();
        let mut nodes: Vec<NodeId> = state.table.nodes().cloned().collect();
        nodes.sort();
        nodes
    }

    /// Checksum of the entries this view attributes to `node`
    pub fn checksum_of(&self, node: &NodeId) -> u64 {
        self.state.lock().checksum_of(node)
    }

    pub fn revision(&self) -> u64 {
        self.state.lock().revision
    }

    pub fn len(&self) -> usize {
        self.state.lock().table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().table.is_empty()
    }

    pub fn is_consistent(&self) -> bool {
        self.state.lock().table.is_consistent()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::RecordingTransport;

    fn engine(local: &str) -> (ReconciliationEngine, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::new(local));
        let publisher = Publisher::new(transport.clone(), "state");
        let engine = ReconciliationEngine::new(
            NodeId::new(local),
            publisher,
            Notifier::new(64),
            Arc::new(RegistryMetrics::new()),
        );
        (engine, transport)
    }

    fn drain(rx: &mut tokio::sync::broadcast::Receiver<RegistryEvent>) -> Vec<RegistryEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn node(id: &str) -> NodeId {
        NodeId::new(id)
    }

    fn owner_set(ids: &[&str]) -> BTreeSet<NodeId> {
        ids.iter().map(|id| NodeId::new(*id)).collect()
    }

    fn name_set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn test_local_add_broadcasts_and_notifies_once() {
        let (engine, transport) = engine("a");
        let mut rx = engine.notifier().subscribe();

        engine.apply_local_add("topicX");
        engine.apply_local_add("topicX");

        assert_eq!(drain(&mut rx), vec![RegistryEvent::added("topicX")]);
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0],
            ClusterMessage::Add {
                name: "topicX".into(),
                origin: node("a"),
                checksum: contribution_checksum(["topicX"]),
            }
        );
    }

    #[test]
    fn test_local_add_broadcasts_when_others_already_own() {
        let (engine, transport) = engine("a");
        let mut rx = engine.notifier().subscribe();

        engine.apply_remote_add("topicX", &node("b"));
        engine.apply_local_add("topicX");

        // Only the first owner produces an event, but peers still need to
        // learn that "a" joined the owner set.
        assert_eq!(drain(&mut rx), vec![RegistryEvent::added("topicX")]);
        assert_eq!(transport.sent().len(), 1);
        assert_eq!(engine.owners("topicX"), owner_set(&["a", "b"]));
    }

    #[test]
    fn test_local_remove_only_broadcasts_when_owned() {
        let (engine, transport) = engine("a");

        engine.apply_local_remove("never-added");
        assert!(transport.sent().is_empty());

        engine.apply_remote_add("topicX", &node("b"));
        engine.apply_local_remove("topicX");
        assert!(transport.sent().is_empty());
        assert!(engine.contains("topicX"));

        engine.apply_local_add("topicX");
        engine.apply_local_remove("topicX");
        let sent = transport.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(
            sent[1],
            ClusterMessage::Remove {
                name: "topicX".into(),
                origin: node("a"),
                checksum: 0,
            }
        );
    }

    #[test]
    fn test_remote_operations_never_broadcast() {
        let (engine, transport) = engine("a");

        engine.apply_remote_add("x", &node("b"));
        engine.apply_remote_remove("x", &node("b"));
        engine.apply_full_state(&node("c"), &["y".to_string()]);
        engine.remove_node(&node("c"));

        assert!(transport.sent().is_empty());
    }

    #[test]
    fn test_duplicate_remote_messages_are_absorbed() {
        let (engine, _) = engine("a");
        let mut rx = engine.notifier().subscribe();

        engine.apply_remote_add("x", &node("b"));
        engine.apply_remote_add("x", &node("b"));
        let after_add = engine.owners("x");
        engine.apply_remote_remove("x", &node("b"));
        engine.apply_remote_remove("x", &node("b"));

        assert_eq!(after_add, owner_set(&["b"]));
        assert!(!engine.contains("x"));
        assert_eq!(
            drain(&mut rx),
            vec![RegistryEvent::added("x"), RegistryEvent::removed("x")]
        );
    }

    #[test]
    fn test_transitions_fire_once_per_presence_cycle() {
        let (engine, _) = engine("a");
        let mut rx = engine.notifier().subscribe();

        engine.apply_local_add("topicX");
        engine.apply_remote_add("topicX", &node("b"));
        engine.apply_remote_add("topicX", &node("c"));
        engine.apply_local_remove("topicX");
        engine.apply_remote_remove("topicX", &node("b"));
        assert_eq!(drain(&mut rx), vec![RegistryEvent::added("topicX")]);

        engine.apply_remote_remove("topicX", &node("c"));
        assert_eq!(drain(&mut rx), vec![RegistryEvent::removed("topicX")]);

        engine.apply_remote_add("topicX", &node("b"));
        assert_eq!(drain(&mut rx), vec![RegistryEvent::added("topicX")]);
    }

    #[test]
    fn test_out_of_order_delivery_applies_last_arrival() {
        let (engine, _) = engine("a");

        // REMOVE overtook the ADD it retracts.
        engine.apply_remote_remove("x", &node("b"));
        engine.apply_remote_add("x", &node("b"));

        assert!(engine.contains("x"));
        assert_eq!(engine.owners("x"), owner_set(&["b"]));
    }

    #[test]
    fn test_remove_node_cleans_up_contributions() {
        let (engine, _) = engine("a");
        let mut rx = engine.notifier().subscribe();

        engine.apply_local_add("shared");
        engine.apply_remote_add("shared", &node("b"));
        engine.apply_remote_add("only-b-1", &node("b"));
        engine.apply_remote_add("only-b-2", &node("b"));
        drain(&mut rx);

        assert_eq!(engine.remove_node(&node("b")), 3);

        assert_eq!(engine.owners("shared"), owner_set(&["a"]));
        assert!(!engine.contains("only-b-1"));
        assert!(!engine.contains("only-b-2"));
        assert!(engine.owned_by(&node("b")).is_empty());

        let mut removed: Vec<_> = drain(&mut rx)
            .into_iter()
            .map(|event| {
                assert_eq!(event.kind(), EventKind::EntryRemoved);
                event.name().to_string()
            })
            .collect();
        removed.sort();
        assert_eq!(removed, vec!["only-b-1".to_string(), "only-b-2".to_string()]);

        assert_eq!(engine.contributors(), vec![node("a")]);
        assert_eq!(engine.remove_node(&node("b")), 0);
        assert!(drain(&mut rx).is_empty());
        assert!(engine.is_consistent());
    }

    #[test]
    fn test_full_state_replaces_origin_contributions() {
        let (engine, _) = engine("a");
        engine.apply_remote_add("keep", &node("b"));
        engine.apply_remote_add("stale", &node("b"));
        engine.apply_remote_add("stale", &node("c"));

        let outcome = engine.apply_full_state(&node("b"), &["keep".to_string(), "new".to_string()]);

        assert_eq!(outcome, MergeOutcome { added: 1, retracted: 1 });
        assert_eq!(engine.owned_by(&node("b")), name_set(&["keep", "new"]));
        assert_eq!(engine.owners("stale"), owner_set(&["c"]));
    }

    #[test]
    fn test_full_state_from_local_origin_is_ignored() {
        let (engine, _) = engine("a");
        engine.apply_local_add("mine");

        let outcome = engine.apply_full_state(&node("a"), &[]);

        assert_eq!(outcome, MergeOutcome::default());
        assert!(engine.contains("mine"));
    }

    #[test]
    fn test_full_state_response_carries_checksum() {
        let (engine, transport) = engine("a");
        engine.apply_local_add("x");
        engine.apply_local_add("y");
        engine.apply_remote_add("z", &node("b"));
        transport.clear();

        assert_eq!(engine.publish_full_state(&node("c")), Some((3, 2)));

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            ClusterMessage::FullStateResponse {
                origin,
                requester,
                revision,
                checksum,
                entries,
            } => {
                assert_eq!(origin, &node("a"));
                assert_eq!(requester, &node("c"));
                assert_eq!(*revision, 3);
                assert_eq!(*checksum, contribution_checksum(["x", "y"]));
                let mut names = entries.clone();
                names.sort();
                assert_eq!(names, vec!["x".to_string(), "y".to_string()]);
            }
            other => panic!("unexpected message {other:?}"),
        }

        transport.fail_publishes(true);
        assert_eq!(engine.publish_full_state(&node("c")), None);
    }

    #[test]
    fn test_counters_only_count_applied_changes() {
        let (engine, _) = engine("a");
        engine.apply_local_add("x");
        engine.apply_local_add("x");
        engine.apply_local_remove("never-added");
        engine.apply_remote_add("y", &node("b"));
        engine.apply_full_state(&node("b"), &["y".to_string(), "z".to_string()]);
        engine.remove_node(&node("b"));
        engine.remove_node(&node("b"));

        let snapshot = engine.metrics.snapshot();
        assert_eq!(snapshot.local_adds, 1);
        assert_eq!(snapshot.local_removes, 0);
        assert_eq!(snapshot.remote_adds, 2);
        assert_eq!(snapshot.remote_removes, 2);
    }

    #[test]
    fn test_revision_only_moves_on_change() {
        let (engine, _) = engine("a");
        assert_eq!(engine.revision(), 0);

        engine.apply_local_add("x");
        engine.apply_local_add("x");
        assert_eq!(engine.revision(), 1);

        engine.apply_remote_remove("x", &node("b"));
        assert_eq!(engine.revision(), 1);

        engine.apply_local_remove("x");
        assert_eq!(engine.revision(), 2);
    }

    #[test]
    fn test_contributions_and_checksums() {
        let (engine, _) = engine("a");
        engine.apply_local_add("x");
        engine.apply_local_add("y");
        engine.apply_remote_add("z", &node("b"));

        assert_eq!(engine.revision(), 3);
        assert_eq!(
            engine.owned_by(&node("a")),
            BTreeSet::from(["x".to_string(), "y".to_string()])
        );
        assert_eq!(engine.checksum_of(&node("a")), contribution_checksum(["y", "x"]));
        assert_eq!(engine.checksum_of(&node("b")), contribution_checksum(["z"]));
        assert_eq!(engine.checksum_of(&node("c")), 0);
    }

    /// Small deterministic generator for shuffling operation orders
    struct XorShift(u64);

    impl XorShift {
        fn next(&mut self) -> u64 {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            self.0
        }

        fn shuffle<T>(&mut self, items: &mut [T]) {
            for i in (1..items.len()).rev() {
                let j = (self.next() % (i as u64 + 1)) as usize;
                items.swap(i, j);
            }
        }
    }

    #[test]
    fn test_replicas_converge_regardless_of_delivery_order() {
        #[derive(Clone)]
        enum Op {
            Add(&'static str, &'static str),
            Remove(&'static str, &'static str),
        }

        // Each (name, node) pair ends in a definite state; only ops on
        // distinct pairs are reordered relative to each other, matching a
        // transport that keeps per-sender order.
        let streams: Vec<Vec<Op>> = vec![
            vec![Op::Add("x", "n1"), Op::Add("y", "n1"), Op::Remove("x", "n1")],
            vec![Op::Add("x", "n2"), Op::Add("z", "n2")],
            vec![Op::Add("y", "n3"), Op::Remove("y", "n3"), Op::Add("y", "n3")],
        ];

        let mut rng = XorShift(0x9e37_79b9_7f4a_7c15);
        let mut views = Vec::new();
        for replica in 0..8 {
            let (engine, _) = engine(&format!("observer-{replica}"));
            let mut cursors = vec![0usize; streams.len()];
            let mut order: Vec<usize> = streams
                .iter()
                .enumerate()
                .flat_map(|(idx, ops)| std::iter::repeat(idx).take(ops.len()))
                .collect();
            rng.shuffle(&mut order);

            for stream in order {
                let op = streams[stream][cursors[stream]].clone();
                cursors[stream] += 1;
                let repeats = if rng.next() % 3 == 0 { 2 } else { 1 };
                for _ in 0..repeats {
                    match &op {
                        Op::Add(name, owner) => engine.apply_remote_add(name, &node(owner)),
                        Op::Remove(name, owner) => engine.apply_remote_remove(name, &node(owner)),
                    }
                }
                assert!(engine.is_consistent());
            }
            views.push(engine.snapshot());
        }

        let mut expected = HashMap::new();
        expected.insert("x".to_string(), owner_set(&["n2"]));
        expected.insert("y".to_string(), owner_set(&["n1", "n3"]));
        expected.insert("z".to_string(), owner_set(&["n2"]));
        for view in views {
            assert_eq!(view, expected);
        }
    }
}
