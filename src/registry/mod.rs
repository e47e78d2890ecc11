//! State Registry Module
//!
//! Cluster-wide registry of named entries owned by nodes. Each node only
//! ever adds or removes its own ownership; the registry reports when an
//! entry first appears anywhere in the cluster and when its last owner is
//! gone.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                          StateRegistry                               │
//! │   add / remove / has / get_all / when_ready / subscribe             │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────────────┐      ┌─────────────────────────────┐  │
//! │  │  Reconciliation Engine   │─────▶│  Notifier                   │  │
//! │  │  (single mutation path)  │      │  broadcast + observers      │  │
//! │  └────────────┬─────────────┘      └─────────────────────────────┘  │
//! │               │                                                      │
//! │  ┌────────────┴─────────────┐      ┌─────────────────────────────┐  │
//! │  │  Entry Table             │      │  Sync task                  │  │
//! │  │  owners + reverse index  │      │  ADD / REMOVE / FULL_STATE  │  │
//! │  └──────────────────────────┘      └─────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```

pub mod engine;
pub mod entry_table;
pub mod events;
pub mod facade;
pub mod metrics;

pub use engine::{MergeOutcome, ReconciliationEngine};
pub use entry_table::EntryTable;
pub use events::{EventKind, Notifier, ObserverId, RegistryEvent};
pub use facade::{RegistryStatus, StateRegistry};
pub use metrics::{RegistryMetrics, RegistryMetricsSnapshot};
