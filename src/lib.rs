//! Cluster State Registry
//!
//! An eventually-consistent, replicated registry of named entries shared by
//! the nodes of a cluster. Every entry records which nodes currently assert
//! it, so any node can answer "does X exist anywhere?" and "who holds X?"
//! without a central coordinator.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                            StateRegistry                               │
//! │     has · add · remove · get_all · get_all_servers · when_ready        │
//! ├───────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────┐        ┌──────────────────────────────┐  │
//! │  │  Reconciliation Engine  │───────▶│  Notifier                    │  │
//! │  │  one lock, one path     │        │  entry-added / entry-removed │  │
//! │  └───────────┬─────────────┘        └──────────────────────────────┘  │
//! │              │                                                         │
//! │  ┌───────────┴─────────────┐        ┌──────────────────────────────┐  │
//! │  │  Entry Table            │        │  Sync task                   │  │
//! │  │  owner sets + reverse   │◀───────│  join handshake, checksums,  │  │
//! │  │  index                  │        │  departure cleanup           │  │
//! │  └─────────────────────────┘        └──────────────┬───────────────┘  │
//! ├────────────────────────────────────────────────────┼──────────────────┤
//! │                 ClusterTransport (injected)         │                  │
//! │      publish · subscribe · peers · membership  ◀────┘                  │
//! └───────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`registry`]: Entry table, reconciliation engine, events, public facade
//! - [`sync`]: Wire messages, checksums, and the cluster sync task
//! - [`transport`]: In-process transports for tests and simulation
//! - [`domain`]: Node identity and the transport capability
//! - [`config`]: Registry configuration
//! - [`error`]: Error types and handling

pub mod config;
pub mod domain;
pub mod error;
pub mod registry;
pub mod sync;
pub mod transport;

// Re-export commonly used types
pub use config::RegistryConfig;

pub use domain::{ClusterTransport, ClusterTransportRef, MembershipEvent, NodeId};

pub use error::{Error, Result};

pub use registry::{
    EventKind, ObserverId, RegistryEvent, RegistryMetricsSnapshot, RegistryStatus, StateRegistry,
};

pub use sync::{ClusterMessage, ReadyReason, SyncPhase};

pub use transport::{InMemoryCluster, InMemoryTransport, RecordingTransport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
