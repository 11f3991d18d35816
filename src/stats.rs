//! Statistics tracking for the monitor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Atomic counters updated on the flow path.
pub struct Stats {
    pub queries: AtomicU64,
    pub responses: AtomicU64,
    pub blocked: AtomicU64,
    pub rejected: AtomicU64,
    /// Responses with no tracked query verdict.
    pub unattributed: AtomicU64,
    pub emitted: AtomicU64,
    started: Instant,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            queries: AtomicU64::new(0),
            responses: AtomicU64::new(0),
            blocked: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            unattributed: AtomicU64::new(0),
            emitted: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub fn record_query(&self, blocked: bool) {
        self.queries.fetch_add(1, Ordering::Relaxed);
        if blocked {
            self.blocked.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_response(&self, attributed: bool) {
        self.responses.fetch_add(1, Ordering::Relaxed);
        if !attributed {
            self.unattributed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an emitted record, returning its sequence number.
    pub fn record_emitted(&self) -> u64 {
        self.emitted.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Total records emitted since start; never reset.
    pub fn emitted_total(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    /// Take the interval counters, resetting them to zero.
    pub fn snapshot_and_reset(&self) -> StatsSnapshot {
        StatsSnapshot {
            uptime_secs: self.started.elapsed().as_secs(),
            queries: self.queries.swap(0, Ordering::Relaxed),
            responses: self.responses.swap(0, Ordering::Relaxed),
            blocked: self.blocked.swap(0, Ordering::Relaxed),
            rejected: self.rejected.swap(0, Ordering::Relaxed),
            unattributed: self.unattributed.swap(0, Ordering::Relaxed),
            emitted_total: self.emitted_total(),
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub uptime_secs: u64,
    pub queries: u64,
    pub responses: u64,
    pub blocked: u64,
    pub rejected: u64,
    pub unattributed: u64,
    pub emitted_total: u64,
}
