//! In-Process Transports
//!
//! [`InMemoryCluster`] connects any number of registries inside one process,
//! with per-node isolation to simulate lost messages. [`RecordingTransport`]
//! is a scripted single node: it records what the registry publishes and
//! lets a test inject inbound payloads and membership changes by hand.

use crate::domain::{ClusterTransport, MembershipEvent, NodeId};
use crate::error::{Error, Result};
use crate::sync::messages::ClusterMessage;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

pub const MEMBERSHIP_CHANNEL_CAPACITY: usize = 256;

// =============================================================================
// In-Memory Cluster
// =============================================================================

/// Per-member delivery state
struct MemberSlot {
    subscriptions: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Bytes>>>>,
    membership_tx: broadcast::Sender<MembershipEvent>,
    isolated: AtomicBool,
}

impl MemberSlot {
    fn new() -> Self {
        let (membership_tx, _) = broadcast::channel(MEMBERSHIP_CHANNEL_CAPACITY);
        Self {
            subscriptions: Mutex::new(HashMap::new()),
            membership_tx,
            isolated: AtomicBool::new(false),
        }
    }

    fn deliver(&self, topic: &str, payload: &Bytes) -> usize {
        let mut subscriptions = self.subscriptions.lock();
        let Some(senders) = subscriptions.get_mut(topic) else {
            return 0;
        };
        senders.retain(|tx| tx.send(payload.clone()).is_ok());
        senders.len()
    }
}

struct ClusterInner {
    members: DashMap<NodeId, Arc<MemberSlot>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// A cluster of in-process nodes sharing one message fabric
///
/// Publishing is synchronous, so messages from one sender reach every
/// receiver in publish order.
#[derive(Clone)]
pub struct InMemoryCluster {
    inner: Arc<ClusterInner>,
}

impl std::fmt::Debug for InMemoryCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryCluster")
            .field("members", &self.inner.members.len())
            .field("delivered", &self.inner.delivered.load(Ordering::Relaxed))
            .field("dropped", &self.inner.dropped.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ClusterInner {
                members: DashMap::new(),
                delivered: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Add a member and return its transport handle
    ///
    /// Existing members observe `NodeJoined`. Joining twice with the same id
    /// returns a handle to the existing slot.
    pub fn join(&self, id: impl Into<NodeId>) -> Arc<InMemoryTransport> {
        let id = id.into();
        let mut created = false;
        self.inner.members.entry(id.clone()).or_insert_with(|| {
            created = true;
            Arc::new(MemberSlot::new())
        });

        if created {
            info!(node = %id, "Node joined in-memory cluster");
            self.announce(&id, MembershipEvent::NodeJoined(id.clone()));
        }

        Arc::new(InMemoryTransport {
            local: id,
            cluster: Arc::clone(&self.inner),
        })
    }

    /// Remove a member; the others observe `NodeLeft`
    ///
    /// The departed node's subscriptions are closed. Returns false if the
    /// node was not a member.
    pub fn leave(&self, id: &NodeId) -> bool {
        if self.inner.members.remove(id).is_none() {
            return false;
        }
        info!(node = %id, "Node left in-memory cluster");
        self.announce(id, MembershipEvent::NodeLeft(id.clone()));
        true
    }

    /// Drop all traffic to and from a member until healed
    pub fn isolate(&self, id: &NodeId) {
        if let Some(slot) = self.inner.members.get(id) {
            slot.isolated.store(true, Ordering::SeqCst);
            debug!(node = %id, "Node isolated");
        }
    }

    pub fn heal(&self, id: &NodeId) {
        if let Some(slot) = self.inner.members.get(id) {
            slot.isolated.store(false, Ordering::SeqCst);
            debug!(node = %id, "Node healed");
        }
    }

    pub fn members(&self) -> Vec<NodeId> {
        let mut members: Vec<NodeId> = self
            .inner
            .members
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        members.sort();
        members
    }

    pub fn delivered(&self) -> u64 {
        self.inner.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    fn announce(&self, subject: &NodeId, event: MembershipEvent) {
        for member in self.inner.members.iter() {
            if member.key() != subject {
                let _ = member.value().membership_tx.send(event.clone());
            }
        }
    }
}

/// One member's handle onto an [`InMemoryCluster`]
pub struct InMemoryTransport {
    local: NodeId,
    cluster: Arc<ClusterInner>,
}

impl std::fmt::Debug for InMemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryTransport")
            .field("local", &self.local)
            .finish()
    }
}

impl InMemoryTransport {
    fn slot(&self) -> Option<Arc<MemberSlot>> {
        self.cluster
            .members
            .get(&self.local)
            .map(|slot| Arc::clone(slot.value()))
    }
}

impl ClusterTransport for InMemoryTransport {
    fn local_node(&self) -> &NodeId {
        &self.local
    }

    fn peers(&self) -> Vec<NodeId> {
        self.cluster
            .members
            .iter()
            .filter(|entry| *entry.key() != self.local)
            .map(|entry| entry.key().clone())
            .collect()
    }

    fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        let Some(sender) = self.slot() else {
            return Err(Error::Transport {
                topic: topic.to_string(),
                reason: format!("{} is not a cluster member", self.local),
            });
        };
        let sender_isolated = sender.isolated.load(Ordering::SeqCst);

        let targets: Vec<Arc<MemberSlot>> = self
            .cluster
            .members
            .iter()
            .filter(|entry| *entry.key() != self.local)
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for target in targets {
            if sender_isolated || target.isolated.load(Ordering::SeqCst) {
                self.cluster.dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if target.deliver(topic, &payload) > 0 {
                self.cluster.delivered.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> mpsc::UnboundedReceiver<Bytes> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(slot) = self.slot() {
            slot.subscriptions
                .lock()
                .entry(topic.to_string())
                .or_default()
                .push(tx);
        }
        rx
    }

    fn membership(&self) -> broadcast::Receiver<MembershipEvent> {
        match self.slot() {
            Some(slot) => slot.membership_tx.subscribe(),
            None => broadcast::channel(1).1,
        }
    }
}

// =============================================================================
// Recording Transport
// =============================================================================

/// Scripted single-node transport
///
/// Everything published is kept for inspection; nothing is delivered
/// anywhere. Tests drive inbound traffic with [`inject`](Self::inject) and
/// membership with [`depart`](Self::depart).
/// Called with every message a [`RecordingTransport`] accepts for publishing
pub type PublishHook = Arc<dyn Fn(&ClusterMessage) + Send + Sync>;

pub struct RecordingTransport {
    local: NodeId,
    peers: Mutex<Vec<NodeId>>,
    published: Mutex<Vec<(String, Bytes)>>,
    subscriptions: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Bytes>>>>,
    membership_tx: broadcast::Sender<MembershipEvent>,
    fail_publish: AtomicBool,
    on_publish: Mutex<Option<PublishHook>>,
}

impl std::fmt::Debug for RecordingTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingTransport")
            .field("local", &self.local)
            .field("published", &self.published.lock().len())
            .finish()
    }
}

impl RecordingTransport {
    pub fn new(local: impl Into<NodeId>) -> Self {
        let (membership_tx, _) = broadcast::channel(MEMBERSHIP_CHANNEL_CAPACITY);
        Self {
            local: local.into(),
            peers: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(HashMap::new()),
            membership_tx,
            fail_publish: AtomicBool::new(false),
            on_publish: Mutex::new(None),
        }
    }

    /// Pretend these nodes are already members
    pub fn with_peers<I, N>(self, peers: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<NodeId>,
    {
        *self.peers.lock() = peers.into_iter().map(Into::into).collect();
        self
    }

    /// Make every subsequent publish fail
    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Run `hook` on the publishing thread after each recorded publish
    ///
    /// The hook runs while the publisher still holds whatever locks it held
    /// around the publish call.
    pub fn set_publish_hook(&self, hook: impl Fn(&ClusterMessage) + Send + Sync + 'static) {
        *self.on_publish.lock() = Some(Arc::new(hook));
    }

    /// Raw payloads published so far, with their topics
    pub fn published(&self) -> Vec<(String, Bytes)> {
        self.published.lock().clone()
    }

    /// Published payloads decoded as registry messages
    pub fn sent(&self) -> Vec<ClusterMessage> {
        self.published
            .lock()
            .iter()
            .filter_map(|(_, payload)| ClusterMessage::decode(payload).ok())
            .collect()
    }

    pub fn clear(&self) {
        self.published.lock().clear();
    }

    /// Deliver a payload to local subscribers of `topic`
    pub fn inject(&self, topic: &str, payload: Bytes) -> usize {
        let mut subscriptions = self.subscriptions.lock();
        let Some(senders) = subscriptions.get_mut(topic) else {
            return 0;
        };
        senders.retain(|tx| tx.send(payload.clone()).is_ok());
        senders.len()
    }

    /// Encode and deliver a registry message
    pub fn inject_message(&self, topic: &str, message: &ClusterMessage) -> Result<usize> {
        Ok(self.inject(topic, message.encode()?))
    }

    /// Add a peer and signal `NodeJoined`
    pub fn arrive(&self, node: impl Into<NodeId>) {
        let node = node.into();
        self.peers.lock().push(node.clone());
        let _ = self.membership_tx.send(MembershipEvent::NodeJoined(node));
    }

    /// Drop a peer and signal `NodeLeft`
    pub fn depart(&self, node: impl Into<NodeId>) {
        let node = node.into();
        self.peers.lock().retain(|peer| *peer != node);
        let _ = self.membership_tx.send(MembershipEvent::NodeLeft(node));
    }
}

impl ClusterTransport for RecordingTransport {
    fn local_node(&self) -> &NodeId {
        &self.local
    }

    fn peers(&self) -> Vec<NodeId> {
        self.peers.lock().clone()
    }

    fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(Error::Transport {
                topic: topic.to_string(),
                reason: "publish disabled".into(),
            });
        }
        self.published.lock().push((topic.to_string(), payload.clone()));
        let hook = self.on_publish.lock().clone();
        if let Some(hook) = hook {
            if let Ok(message) = ClusterMessage::decode(&payload) {
                hook(&message);
            }
        }
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> mpsc::UnboundedReceiver<Bytes> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriptions
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        rx
    }

    fn membership(&self) -> broadcast::Receiver<MembershipEvent> {
        self.membership_tx.subscribe()
    }
}
