//! Registry Metrics
//!
//! Cache-line aligned counters for the registry's hot paths. Each group is
//! touched from different call sites (local API vs. inbound sync task) and
//! lives on its own line to avoid false sharing.

use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Cache line size for alignment
pub const CACHE_LINE_SIZE: usize = 64;

/// Counters for mutations applied to the entry table
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct MutationMetrics {
    pub local_adds: AtomicU64,
    pub local_removes: AtomicU64,
    pub remote_adds: AtomicU64,
    pub remote_removes: AtomicU64,
    pub entries_added: AtomicU64,
    pub entries_removed: AtomicU64,
    /// Last mutation timestamp (Unix millis)
    pub last_update_ms: AtomicU64,
}

/// Counters for the synchronization protocol
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct SyncMetrics {
    pub messages_received: AtomicU64,
    pub messages_dropped: AtomicU64,
    pub full_state_requests_sent: AtomicU64,
    pub full_state_requests_answered: AtomicU64,
    pub full_state_responses_applied: AtomicU64,
    pub checksum_mismatches: AtomicU64,
    pub departures_cleaned: AtomicU64,
    pub join_timeouts: AtomicU64,
}

const _: () = assert!(std::mem::size_of::<MutationMetrics>() <= CACHE_LINE_SIZE);
const _: () = assert!(std::mem::size_of::<SyncMetrics>() <= CACHE_LINE_SIZE);

/// All registry counters
#[derive(Debug, Default)]
pub struct RegistryMetrics {
    pub mutations: MutationMetrics,
    pub sync: SyncMetrics,
}

impl RegistryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_local_add(&self) {
        self.mutations.local_adds.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    #[inline]
    pub fn record_local_remove(&self) {
        self.mutations.local_removes.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    #[inline]
    pub fn record_remote_add(&self) {
        self.mutations.remote_adds.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    #[inline]
    pub fn record_remote_remove(&self) {
        self.mutations.remote_removes.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    /// Record presence transitions derived from a mutation
    #[inline]
    pub fn record_transitions(&self, added: u64, removed: u64) {
        if added > 0 {
            self.mutations.entries_added.fetch_add(added, Ordering::Relaxed);
        }
        if removed > 0 {
            self.mutations.entries_removed.fetch_add(removed, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_message_received(&self) {
        self.sync.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_message_dropped(&self) {
        self.sync.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_full_state_request_sent(&self) {
        self.sync.full_state_requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_full_state_request_answered(&self) {
        self.sync.full_state_requests_answered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_full_state_response_applied(&self) {
        self.sync.full_state_responses_applied.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_checksum_mismatch(&self) {
        self.sync.checksum_mismatches.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_departure_cleaned(&self) {
        self.sync.departures_cleaned.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_join_timeout(&self) {
        self.sync.join_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn touch(&self) {
        self.mutations
            .last_update_ms
            .store(Utc::now().timestamp_millis() as u64, Ordering::Release);
    }

    /// Create a snapshot of current counters
    pub fn snapshot(&self) -> RegistryMetricsSnapshot {
        let m = &self.mutations;
        let s = &self.sync;
        RegistryMetricsSnapshot {
            local_adds: m.local_adds.load(Ordering::Relaxed),
            local_removes: m.local_removes.load(Ordering::Relaxed),
            remote_adds: m.remote_adds.load(Ordering::Relaxed),
            remote_removes: m.remote_removes.load(Ordering::Relaxed),
            entries_added: m.entries_added.load(Ordering::Relaxed),
            entries_removed: m.entries_removed.load(Ordering::Relaxed),
            last_update_ms: m.last_update_ms.load(Ordering::Acquire),
            messages_received: s.messages_received.load(Ordering::Relaxed),
            messages_dropped: s.messages_dropped.load(Ordering::Relaxed),
            full_state_requests_sent: s.full_state_requests_sent.load(Ordering::Relaxed),
            full_state_requests_answered: s.full_state_requests_answered.load(Ordering::Relaxed),
            full_state_responses_applied: s.full_state_responses_applied.load(Ordering::Relaxed),
            checksum_mismatches: s.checksum_mismatches.load(Ordering::Relaxed),
            departures_cleaned: s.departures_cleaned.load(Ordering::Relaxed),
            join_timeouts: s.join_timeouts.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of registry counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryMetricsSnapshot {
    pub local_adds: u64,
    pub local_removes: u64,
    pub remote_adds: u64,
    pub remote_removes: u64,
    pub entries_added: u64,
    pub entries_removed: u64,
    pub last_update_ms: u64,
    pub messages_received: u64,
    pub messages_dropped: u64,
    pub full_state_requests_sent: u64,
    pub full_state_requests_answered: u64,
    pub full_state_responses_applied: u64,
    pub checksum_mismatches: u64,
    pub departures_cleaned: u64,
    pub join_timeouts: u64,
}

impl RegistryMetricsSnapshot {
    /// Named counter values, for exporters
    pub fn counters(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("local_adds", self.local_adds),
            ("local_removes", self.local_removes),
            ("remote_adds", self.remote_adds),
            ("remote_removes", self.remote_removes),
            ("entries_added", self.entries_added),
            ("entries_removed", self.entries_removed),
            ("messages_received", self.messages_received),
            ("messages_dropped", self.messages_dropped),
            ("full_state_requests_sent", self.full_state_requests_sent),
            ("full_state_requests_answered", self.full_state_requests_answered),
            ("full_state_responses_applied", self.full_state_responses_applied),
            ("checksum_mismatches", self.checksum_mismatches),
            ("departures_cleaned", self.departures_cleaned),
            ("join_timeouts", self.join_timeouts),
        ]
    }
}
