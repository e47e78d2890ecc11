//! State Registry
//!
//! Public entry point. Wires a [`ReconciliationEngine`] to a cluster
//! transport, runs the join handshake, and spawns the sync task that applies
//! inbound traffic.
//!
//! # Usage
//!
//! ```ignore
//! use cluster_state_registry::{RegistryConfig, StateRegistry};
//!
//! let registry = StateRegistry::start(RegistryConfig::for_topic("subscriptions"), transport)?;
//! registry.on_entry_added(|name| println!("first subscriber for {name}"));
//! registry.ready().await?;
//!
//! registry.add("orders/created");
//! assert!(registry.has("orders/created"));
//! ```

use crate::config::RegistryConfig;
use crate::domain::{ClusterTransportRef, NodeId};
use crate::error::{Error, Result};
use crate::registry::engine::ReconciliationEngine;
use crate::registry::events::{EventKind, Notifier, ObserverId, RegistryEvent};
use crate::registry::metrics::{RegistryMetrics, RegistryMetricsSnapshot};
use crate::sync::checksum::ChecksumTracker;
use crate::sync::protocol::{self, Publisher, ReadyReason, Readiness, SyncContext, SyncPhase};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Point-in-time view of a registry's lifecycle
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStatus {
    pub local_node: NodeId,
    pub topic: String,
    pub phase: SyncPhase,
    pub ready_reason: Option<ReadyReason>,
    pub ready_at: Option<DateTime<Utc>>,
    pub revision: u64,
    pub entries: usize,
    pub owned_locally: usize,
    pub shut_down: bool,
}

/// Cluster-wide registry of named entries and the nodes that own them
pub struct StateRegistry {
    ctx: Arc<SyncContext>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for StateRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateRegistry")
            .field("ctx", &self.ctx)
            .finish()
    }
}

impl StateRegistry {
    /// Start a registry on `transport`
    ///
    /// Must be called from within a tokio runtime. If the transport reports
    /// no peers the registry is ready before this returns; otherwise a
    /// full-state request is broadcast and readiness follows the handshake.
    pub fn start(config: RegistryConfig, transport: ClusterTransportRef) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|e| {
            Error::Internal(format!("state registry must start inside a tokio runtime: {e}"))
        })?;

        let local = transport.local_node().clone();
        if local.is_empty() {
            return Err(Error::Configuration(
                "transport reported an empty local node id".into(),
            ));
        }

        let metrics = Arc::new(RegistryMetrics::new());
        let publisher = Publisher::new(Arc::clone(&transport), config.topic.clone());
        let engine = ReconciliationEngine::new(
            local.clone(),
            publisher.clone(),
            Notifier::new(config.event_channel_capacity),
            Arc::clone(&metrics),
        );

        // Subscribe before asking for state so no response can be missed.
        let inbound = transport.subscribe(&config.topic);
        let membership = transport.membership();

        info!(
            node = %local,
            topic = %config.topic,
            timeout_ms = config.full_state_timeout_ms,
            "Starting state registry"
        );

        let ctx = Arc::new(SyncContext {
            engine,
            readiness: Readiness::new(),
            checksums: ChecksumTracker::new(),
            publisher,
            transport,
            metrics,
            config,
            cancel: CancellationToken::new(),
        });

        let pending = ctx.begin_join();
        let task = runtime.spawn(protocol::run(Arc::clone(&ctx), inbound, membership, pending));

        Ok(Self {
            ctx,
            task: Mutex::new(Some(task)),
        })
    }

    // =========================================================================
    // Entries
    // =========================================================================

    /// True iff at least one node owns `name`
    pub fn has(&self, name: &str) -> bool {
        self.ctx.engine.contains(name)
    }

    /// Assert local ownership of `name` and broadcast it
    pub fn add(&self, name: &str) {
        self.ctx.engine.apply_local_add(name);
    }

    /// Retract local ownership of `name`; a no-op if not owned locally
    pub fn remove(&self, name: &str) {
        self.ctx.engine.apply_local_remove(name);
    }

    /// Names of all present entries, in no particular order
    pub fn get_all(&self) -> Vec<String> {
        self.ctx.engine.names()
    }

    /// Nodes currently owning `name`
    pub fn get_all_servers(&self, name: &str) -> BTreeSet<NodeId> {
        self.ctx.engine.owners(name)
    }

    /// Every present entry with its owners
    pub fn get_all_map(&self) -> HashMap<String, BTreeSet<NodeId>> {
        self.ctx.engine.snapshot()
    }

    /// Entries the local node owns
    pub fn local_entries(&self) -> BTreeSet<String> {
        self.ctx.engine.owned_by(self.ctx.local_node())
    }

    /// Retract everything `server` owns, as when it leaves the cluster
    ///
    /// Nothing is broadcast. Returns the number of entries retracted.
    pub fn remove_all(&self, server: impl Into<NodeId>) -> usize {
        self.ctx.cleanup_departure(&server.into())
    }

    // =========================================================================
    // Readiness
    // =========================================================================

    /// Run `callback` once the join handshake completes
    ///
    /// Runs immediately if the registry is already ready, and never runs if
    /// the registry is shut down first.
    pub fn when_ready(&self, callback: impl FnOnce() + Send + 'static) {
        self.ctx.readiness.when_ready(callback);
    }

    /// Wait for the join handshake to complete
    pub async fn ready(&self) -> Result<()> {
        if self.ctx.readiness.is_ready() {
            return Ok(());
        }
        tokio::select! {
            _ = self.ctx.readiness.wait() => Ok(()),
            _ = self.ctx.cancel.cancelled() => Err(Error::Shutdown),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ctx.readiness.is_ready()
    }

    pub fn phase(&self) -> SyncPhase {
        self.ctx.readiness.phase()
    }

    pub fn status(&self) -> RegistryStatus {
        RegistryStatus {
            local_node: self.ctx.local_node().clone(),
            topic: self.ctx.config.topic.clone(),
            phase: self.ctx.readiness.phase(),
            ready_reason: self.ctx.readiness.reason(),
            ready_at: self.ctx.readiness.ready_at(),
            revision: self.ctx.engine.revision(),
            entries: self.ctx.engine.len(),
            owned_locally: self.ctx.engine.owned_by(self.ctx.local_node()).len(),
            shut_down: self.ctx.cancel.is_cancelled(),
        }
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Receiver for entry presence transitions
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.ctx.engine.notifier().subscribe()
    }

    /// Call `handler` with the name of each entry that gains its first owner
    pub fn on_entry_added(&self, handler: impl Fn(&str) + Send + Sync + 'static) -> ObserverId {
        self.ctx
            .engine
            .notifier()
            .observe(EventKind::EntryAdded, handler)
    }

    /// Call `handler` with the name of each entry that loses its last owner
    pub fn on_entry_removed(&self, handler: impl Fn(&str) + Send + Sync + 'static) -> ObserverId {
        self.ctx
            .engine
            .notifier()
            .observe(EventKind::EntryRemoved, handler)
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.ctx.engine.notifier().remove_observer(id)
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn metrics(&self) -> RegistryMetricsSnapshot {
        self.ctx.metrics.snapshot()
    }

    pub fn revision(&self) -> u64 {
        self.ctx.engine.revision()
    }

    pub fn local_node(&self) -> &NodeId {
        self.ctx.local_node()
    }

    pub fn topic(&self) -> &str {
        &self.ctx.config.topic
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Stop the sync task and drop pending `when_ready` callbacks
    ///
    /// Local entries stay readable; inbound traffic is no longer applied.
    /// Calling this more than once is harmless.
    pub fn shutdown(&self) {
        if self.ctx.cancel.is_cancelled() {
            return;
        }
        self.ctx.readiness.close();
        self.ctx.cancel.cancel();
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        info!(node = %self.ctx.local_node(), topic = %self.ctx.config.topic, "State registry shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.ctx.cancel.is_cancelled()
    }
}

impl Drop for StateRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}
