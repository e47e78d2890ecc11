//! Registry Events
//!
//! Presence transitions emitted by the registry for consumers to react to.
//! Consumers either hold a broadcast receiver or register an explicit
//! observer callback; both see the same events in the same order.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Events emitted by the state registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistryEvent {
    /// An entry gained its first owner anywhere in the cluster
    EntryAdded { name: String },

    /// An entry lost its last owner
    EntryRemoved { name: String },
}

/// Kind of presence transition an observer is interested in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    EntryAdded,
    EntryRemoved,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::EntryAdded => write!(f, "entry-added"),
            EventKind::EntryRemoved => write!(f, "entry-removed"),
        }
    }
}

impl RegistryEvent {
    /// Create an EntryAdded event
    pub fn added(name: &str) -> Self {
        RegistryEvent::EntryAdded {
            name: name.to_string(),
        }
    }

    /// Create an EntryRemoved event
    pub fn removed(name: &str) -> Self {
        RegistryEvent::EntryRemoved {
            name: name.to_string(),
        }
    }

    /// Get the entry name associated with this event
    pub fn name(&self) -> &str {
        match self {
            RegistryEvent::EntryAdded { name } => name,
            RegistryEvent::EntryRemoved { name } => name,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            RegistryEvent::EntryAdded { .. } => EventKind::EntryAdded,
            RegistryEvent::EntryRemoved { .. } => EventKind::EntryRemoved,
        }
    }
}

// =============================================================================
// Observers
// =============================================================================

/// Handle returned when registering an observer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type Handler = Arc<dyn Fn(&str) + Send + Sync>;

/// Fan-out of registry events to a broadcast channel and registered observers
///
/// Events are queued while the producer still holds the table lock, so the
/// queue order is the mutation order. Whichever thread wins the dispatch
/// lock drains the queue; a handler that mutates the registry just queues
/// more events for the drain loop it is already running inside.
pub struct Notifier {
    /// Event broadcaster
    event_tx: broadcast::Sender<RegistryEvent>,
    /// Registered observer callbacks
    observers: RwLock<Vec<(ObserverId, EventKind, Handler)>>,
    /// Events waiting for delivery, in mutation order
    pending: Mutex<VecDeque<RegistryEvent>>,
    /// Held by the thread currently draining `pending`
    dispatch: Mutex<()>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("observers", &self.observers.read().len())
            .field("pending", &self.pending.lock().len())
            .field("receivers", &self.event_tx.receiver_count())
            .finish()
    }
}

impl Notifier {
    pub fn new(channel_capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(channel_capacity.max(1));
        Self {
            event_tx,
            observers: RwLock::new(Vec::new()),
            pending: Mutex::new(VecDeque::new()),
            dispatch: Mutex::new(()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Get an event receiver
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_tx.subscribe()
    }

    /// Register a callback for one kind of transition
    pub fn observe(
        &self,
        kind: EventKind,
        handler: impl Fn(&str) + Send + Sync + 'static,
    ) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers.write().push((id, kind, Arc::new(handler)));
        id
    }

    /// Unregister a callback. Returns true if it was registered.
    pub fn remove_observer(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|(existing, _, _)| *existing != id);
        observers.len() != before
    }

    /// Queue events for delivery; call while holding the table lock
    pub fn enqueue(&self, events: impl IntoIterator<Item = RegistryEvent>) {
        self.pending.lock().extend(events);
    }

    /// Deliver queued events unless another thread is already doing so
    ///
    /// Must be called without holding the table lock.
    pub fn flush(&self) {
        loop {
            let Some(guard) = self.dispatch.try_lock() else {
                return;
            };
            loop {
                let next = self.pending.lock().pop_front();
                match next {
                    Some(event) => self.deliver(event),
                    None => break,
                }
            }
            drop(guard);
            // An event queued between the last pop and the unlock would
            // otherwise wait for the next mutation.
            if self.pending.lock().is_empty() {
                return;
            }
        }
    }

    /// Queue and deliver in one step
    pub fn emit(&self, events: impl IntoIterator<Item = RegistryEvent>) {
        self.enqueue(events);
        self.flush();
    }

    fn deliver(&self, event: RegistryEvent) {
        // Snapshot so handlers can register or remove observers.
        let kind = event.kind();
        let handlers: Vec<Handler> = self
            .observers
            .read()
            .iter()
            .filter(|(_, wanted, _)| *wanted == kind)
            .map(|(_, _, handler)| Arc::clone(handler))
            .collect();

        for handler in handlers {
            handler(event.name());
        }
        let _ = self.event_tx.send(event);
    }
}
