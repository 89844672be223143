//! Query-layer counters
//!
//! - Counters only, monotonic
//! - Relaxed atomics; exactness per counter, not across counters

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Operational counters for one database handle
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    queries_executed: AtomicU64,
    queries_failed: AtomicU64,
    queries_submitted: AtomicU64,
    queries_cancelled: AtomicU64,
    live_refreshes: AtomicU64,
    live_triggers_coalesced: AtomicU64,
    temp_indexes_created: AtomicU64,
    temp_indexes_deleted: AtomicU64,
}

impl MetricsRegistry {
    /// Create a new metrics registry with all counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_queries_executed(&self) {
        self.queries_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_queries_failed(&self) {
        self.queries_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_queries_submitted(&self) {
        self.queries_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_queries_cancelled(&self) {
        self.queries_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_live_refreshes(&self) {
        self.live_refreshes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_live_triggers_coalesced(&self) {
        self.live_triggers_coalesced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_temp_indexes_created(&self) {
        self.temp_indexes_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_temp_indexes_deleted(&self) {
        self.temp_indexes_deleted.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            queries_executed: self.queries_executed.load(Ordering::Relaxed),
            queries_failed: self.queries_failed.load(Ordering::Relaxed),
            queries_submitted: self.queries_submitted.load(Ordering::Relaxed),
            queries_cancelled: self.queries_cancelled.load(Ordering::Relaxed),
            live_refreshes: self.live_refreshes.load(Ordering::Relaxed),
            live_triggers_coalesced: self.live_triggers_coalesced.load(Ordering::Relaxed),
            temp_indexes_created: self.temp_indexes_created.load(Ordering::Relaxed),
            temp_indexes_deleted: self.temp_indexes_deleted.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub queries_executed: u64,
    pub queries_failed: u64,
    pub queries_submitted: u64,
    pub queries_cancelled: u64,
    pub live_refreshes: u64,
    pub live_triggers_coalesced: u64,
    pub temp_indexes_created: u64,
    pub temp_indexes_deleted: u64,
}

impl MetricsSnapshot {
    /// Ephemeral indexes created but not yet deleted
    pub fn temp_indexes_outstanding(&self) -> u64 {
        self.temp_indexes_created
            .saturating_sub(self.temp_indexes_deleted)
    }
}
