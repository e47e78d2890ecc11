//! Cluster Sync Protocol
//!
//! Drives the registry's conversation with the rest of the cluster:
//!
//! ```text
//!  joining node C                         members A, B
//!  ──────────────                         ────────────
//!  Starting
//!     │ FULL_STATE_REQUEST{C} ───────────▶ reply with own entries
//!  AwaitingFullState
//!     │ ◀──────── FULL_STATE_RESPONSE{A, [..]}
//!     │ ◀──────── FULL_STATE_RESPONSE{B, [..]}
//!  Ready  (all peers answered, peers left, or timeout)
//!
//!  steady state:   ADD / REMOVE{name, origin, checksum} ◀──▶ every member
//!  checksum drift: wait reconciliation_delay, then FULL_STATE_REQUEST{target}
//!  node left:      retract everything the departed node owned (no broadcast)
//! ```
//!
//! All inbound traffic for one registry is drained by a single task, and
//! every table mutation goes through the [`ReconciliationEngine`].

use crate::config::RegistryConfig;
use crate::domain::{ClusterTransportRef, MembershipEvent, NodeId};
use crate::registry::engine::ReconciliationEngine;
use crate::registry::metrics::RegistryMetrics;
use crate::sync::checksum::ChecksumTracker;
use crate::sync::messages::ClusterMessage;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// =============================================================================
// Publisher
// =============================================================================

/// Fire-and-forget sender for registry messages on one topic
#[derive(Clone)]
pub struct Publisher {
    transport: ClusterTransportRef,
    topic: String,
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher").field("topic", &self.topic).finish()
    }
}

impl Publisher {
    pub fn new(transport: ClusterTransportRef, topic: impl Into<String>) -> Self {
        Self {
            transport,
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Encode and publish. Failures are logged, never retried.
    pub fn send(&self, message: &ClusterMessage) -> bool {
        let payload: Bytes = match message.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(kind = message.kind(), error = %e, "Failed to encode cluster message");
                return false;
            }
        };
        match self.transport.publish(&self.topic, payload) {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    topic = %self.topic,
                    kind = message.kind(),
                    error = %e,
                    "Failed to publish cluster message"
                );
                false
            }
        }
    }
}

// =============================================================================
// Readiness
// =============================================================================

/// Registry lifecycle with respect to the join handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncPhase {
    Starting,
    AwaitingFullState,
    Ready,
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncPhase::Starting => write!(f, "starting"),
            SyncPhase::AwaitingFullState => write!(f, "awaiting_full_state"),
            SyncPhase::Ready => write!(f, "ready"),
        }
    }
}

/// Why the registry became ready
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReadyReason {
    /// No other members existed at startup
    SoleMember,
    /// Every peer known at startup answered or left
    AllPeersResponded,
    /// The full-state wait elapsed first (degraded start)
    Timeout,
}

impl std::fmt::Display for ReadyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadyReason::SoleMember => write!(f, "sole_member"),
            ReadyReason::AllPeersResponded => write!(f, "all_peers_responded"),
            ReadyReason::Timeout => write!(f, "timeout"),
        }
    }
}

type ReadyCallback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct ReadinessInner {
    callbacks: Vec<ReadyCallback>,
    reason: Option<ReadyReason>,
    ready_at: Option<DateTime<Utc>>,
    closed: bool,
}

/// One-shot readiness latch with callback and async waiters
pub struct Readiness {
    phase: watch::Sender<SyncPhase>,
    inner: Mutex<ReadinessInner>,
}

impl std::fmt::Debug for Readiness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Readiness")
            .field("phase", &*self.phase.borrow())
            .field("reason", &inner.reason)
            .field("waiting_callbacks", &inner.callbacks.len())
            .finish()
    }
}

impl Default for Readiness {
    fn default() -> Self {
        Self::new()
    }
}

impl Readiness {
    pub fn new() -> Self {
        let (phase, _) = watch::channel(SyncPhase::Starting);
        Self {
            phase,
            inner: Mutex::new(ReadinessInner::default()),
        }
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.phase() == SyncPhase::Ready
    }

    pub fn reason(&self) -> Option<ReadyReason> {
        self.inner.lock().reason
    }

    pub fn ready_at(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().ready_at
    }

    /// `Starting → AwaitingFullState`
    pub fn begin_waiting(&self) {
        self.phase.send_if_modified(|phase| {
            if *phase == SyncPhase::Starting {
                *phase = SyncPhase::AwaitingFullState;
                true
            } else {
                false
            }
        });
    }

    /// Run `callback` once the registry is ready, or now if it already is
    ///
    /// After [`close`](Self::close) callbacks are dropped without running.
    pub fn when_ready(&self, callback: impl FnOnce() + Send + 'static) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        if inner.reason.is_some() {
            drop(inner);
            callback();
        } else {
            inner.callbacks.push(Box::new(callback));
        }
    }

    /// Enter `Ready` and run queued callbacks. Returns false if already
    /// ready or closed.
    pub fn mark_ready(&self, reason: ReadyReason) -> bool {
        let callbacks = {
            let mut inner = self.inner.lock();
            if inner.closed || inner.reason.is_some() {
                return false;
            }
            inner.reason = Some(reason);
            inner.ready_at = Some(Utc::now());
            self.phase.send_replace(SyncPhase::Ready);
            std::mem::take(&mut inner.callbacks)
        };
        for callback in callbacks {
            callback();
        }
        true
    }

    /// Drop pending callbacks; nothing queued will ever run
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.callbacks.clear();
    }

    /// Wait until ready. Returns immediately if already ready.
    pub async fn wait(&self) {
        let mut rx = self.phase.subscribe();
        // The sender lives as long as `self`, so this only ends on Ready.
        let _ = rx.wait_for(|phase| *phase == SyncPhase::Ready).await;
    }
}

// =============================================================================
// Sync Context
// =============================================================================

/// Everything the sync task and the public facade share
pub struct SyncContext {
    pub(crate) engine: ReconciliationEngine,
    pub(crate) readiness: Readiness,
    pub(crate) checksums: ChecksumTracker,
    pub(crate) publisher: Publisher,
    pub(crate) transport: ClusterTransportRef,
    pub(crate) metrics: Arc<RegistryMetrics>,
    pub(crate) config: RegistryConfig,
    pub(crate) cancel: CancellationToken,
}

impl std::fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncContext")
            .field("engine", &self.engine)
            .field("readiness", &self.readiness)
            .field("topic", &self.config.topic)
            .finish()
    }
}

impl SyncContext {
    pub fn local_node(&self) -> &NodeId {
        self.engine.local_node()
    }

    /// Begin the join handshake against the peers known right now
    ///
    /// Returns the peers whose full state is still expected.
    pub fn begin_join(&self) -> HashSet<NodeId> {
        let local = self.local_node();
        let peers: HashSet<NodeId> = self
            .transport
            .peers()
            .into_iter()
            .filter(|peer| peer != local)
            .collect();

        if peers.is_empty() {
            self.readiness.mark_ready(ReadyReason::SoleMember);
            info!(node = %local, topic = %self.config.topic, "No peers found, registry ready");
        } else {
            self.readiness.begin_waiting();
            info!(
                node = %local,
                topic = %self.config.topic,
                peers = peers.len(),
                "Requesting full state from cluster"
            );
            self.request_full_state(None);
        }
        peers
    }

    /// Ask the cluster (or one member) for its owned entries
    pub fn request_full_state(&self, target: Option<NodeId>) {
        let message = ClusterMessage::FullStateRequest {
            requester: self.local_node().clone(),
            target,
        };
        if self.publisher.send(&message) {
            self.metrics.record_full_state_request_sent();
        }
    }

    /// Retract everything a departed node owned
    ///
    /// Idempotent: a repeated departure finds an empty contribution set.
    pub fn cleanup_departure(&self, node: &NodeId) -> usize {
        if node == self.local_node() {
            warn!(node = %node, "Ignoring departure cleanup for the local node");
            return 0;
        }
        let removed = self.engine.remove_node(node);
        self.checksums.forget(node);
        if removed > 0 {
            self.metrics.record_departure_cleaned();
            info!(node = %node, entries = removed, "Removed entries owned by departed node");
        } else {
            debug!(node = %node, "Departed node owned no entries");
        }
        removed
    }

    /// Decode and apply one inbound payload
    ///
    /// Malformed payloads are counted and dropped; processing continues with
    /// the next message.
    pub fn handle_payload(self: &Arc<Self>, payload: &[u8], pending: &mut HashSet<NodeId>) {
        self.metrics.record_message_received();
        let message = match ClusterMessage::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                self.metrics.record_message_dropped();
                warn!(
                    topic = %self.config.topic,
                    error = %e,
                    bytes = payload.len(),
                    "Dropping malformed cluster message"
                );
                return;
            }
        };
        self.handle_message(message, pending);
    }

    pub fn handle_message(self: &Arc<Self>, message: ClusterMessage, pending: &mut HashSet<NodeId>) {
        if message.sender() == self.local_node() {
            return;
        }

        match message {
            ClusterMessage::Add {
                name,
                origin,
                checksum,
            } => {
                self.engine.apply_remote_add(&name, &origin);
                self.verify_checksum(&origin, checksum);
            }
            ClusterMessage::Remove {
                name,
                origin,
                checksum,
            } => {
                self.engine.apply_remote_remove(&name, &origin);
                self.verify_checksum(&origin, checksum);
            }
            ClusterMessage::FullStateRequest { requester, target } => {
                let addressed = target
                    .as_ref()
                    .map_or(true, |target| target == self.local_node());
                if addressed {
                    self.answer_full_state(&requester);
                }
            }
            ClusterMessage::FullStateResponse {
                origin,
                requester,
                revision,
                checksum,
                entries,
            } => {
                let outcome = self.engine.apply_full_state(&origin, &entries);
                self.metrics.record_full_state_response_applied();
                debug!(
                    origin = %origin,
                    requester = %requester,
                    revision,
                    added = outcome.added,
                    retracted = outcome.retracted,
                    "Applied full state"
                );
                self.verify_checksum(&origin, checksum);
                if pending.remove(&origin) {
                    self.finish_join_if_complete(pending);
                }
            }
        }
    }

    /// A peer from the startup set left before answering
    pub fn peer_left_during_join(&self, node: &NodeId, pending: &mut HashSet<NodeId>) {
        if pending.remove(node) {
            self.finish_join_if_complete(pending);
        }
    }

    fn finish_join_if_complete(&self, pending: &HashSet<NodeId>) {
        if pending.is_empty() && self.readiness.mark_ready(ReadyReason::AllPeersResponded) {
            info!(
                node = %self.local_node(),
                entries = self.engine.len(),
                "Full state merged, registry ready"
            );
        }
    }

    fn answer_full_state(&self, requester: &NodeId) {
        if let Some((revision, count)) = self.engine.publish_full_state(requester) {
            self.metrics.record_full_state_request_answered();
            debug!(requester = %requester, entries = count, revision, "Answered full state request");
        }
    }

    /// Compare a sender's reported checksum with this view of its entries
    ///
    /// A mismatch schedules one delayed re-check per node; if the views
    /// still disagree then, a full-state request targeted at that node is
    /// published.
    fn verify_checksum(self: &Arc<Self>, origin: &NodeId, reported: u64) {
        self.checksums.record(origin, reported);
        if !self
            .checksums
            .diverges(origin, self.engine.checksum_of(origin))
        {
            return;
        }
        self.metrics.record_checksum_mismatch();
        if !self.checksums.begin(origin) {
            return;
        }

        let ctx = Arc::clone(self);
        let origin = origin.clone();
        let delay = self.config.reconciliation_delay();
        tokio::spawn(async move {
            tokio::select! {
                _ = ctx.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            ctx.checksums.finish(&origin);
            if ctx
                .checksums
                .diverges(&origin, ctx.engine.checksum_of(&origin))
            {
                info!(node = %origin, "Entry checksum still diverges, requesting full state");
                ctx.request_full_state(Some(origin));
            }
        });
    }

    /// Clean up nodes that own entries but are no longer members
    ///
    /// Used when membership events were lost and a departure may have been
    /// missed.
    fn reconcile_membership(&self) {
        let live: HashSet<NodeId> = self.transport.peers().into_iter().collect();
        for node in self.engine.contributors() {
            if &node != self.local_node() && !live.contains(&node) {
                self.cleanup_departure(&node);
            }
        }
    }
}

// =============================================================================
// Sync Loop
// =============================================================================

/// Drain inbound messages and membership events until cancelled
pub async fn run(
    ctx: Arc<SyncContext>,
    mut inbound: mpsc::UnboundedReceiver<Bytes>,
    mut membership: broadcast::Receiver<MembershipEvent>,
    mut pending: HashSet<NodeId>,
) {
    let deadline = tokio::time::sleep(ctx.config.full_state_timeout());
    tokio::pin!(deadline);
    let mut membership_open = true;

    loop {
        let awaiting = !ctx.readiness.is_ready();
        tokio::select! {
            biased;

            _ = ctx.cancel.cancelled() => {
                debug!(node = %ctx.local_node(), "Sync loop cancelled");
                break;
            }
            payload = inbound.recv() => match payload {
                Some(payload) => ctx.handle_payload(&payload, &mut pending),
                None => {
                    warn!(topic = %ctx.config.topic, "Inbound channel closed, stopping sync loop");
                    break;
                }
            },
            event = membership.recv(), if membership_open => match event {
                Ok(MembershipEvent::NodeLeft(node)) => {
                    ctx.cleanup_departure(&node);
                    ctx.peer_left_during_join(&node, &mut pending);
                }
                Ok(MembershipEvent::NodeJoined(node)) => {
                    debug!(node = %node, "Node joined cluster");
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Membership events lagged, reconciling against current peers");
                    ctx.reconcile_membership();
                }
                Err(RecvError::Closed) => {
                    debug!("Membership channel closed");
                    membership_open = false;
                }
            },
            _ = &mut deadline, if awaiting => {
                ctx.metrics.record_join_timeout();
                if ctx.readiness.mark_ready(ReadyReason::Timeout) {
                    warn!(
                        node = %ctx.local_node(),
                        missing = pending.len(),
                        entries = ctx.engine.len(),
                        "Timed out waiting for full state, starting with partial view"
                    );
                }
                pending.clear();
            }
        }
    }
}
