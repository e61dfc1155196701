//! Worker cache statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Point-in-time copy of a worker's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Requests answered from cache storage.
    pub cache_hits: u64,
    /// Requests that went to the network.
    pub network_fetches: u64,
    /// Responses written to a cache.
    pub entries_stored: u64,
    /// Body bytes written to a cache.
    pub bytes_stored: u64,
    /// Network responses returned without caching (non-200, non-http, non-GET).
    pub uncached_responses: u64,
    /// Failed network fetches answered with the shell page.
    pub shell_fallbacks: u64,
    /// Failed network fetches propagated to the caller.
    pub failures: u64,
    /// Time since the worker was created, in seconds.
    pub uptime_secs: u64,
}

impl CacheStats {
    /// Fraction of requests served from cache, in `[0, 1]`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_ratio(&self) -> f64 {
        let total = self.cache_hits + self.network_fetches;
        if total > 0 {
            self.cache_hits as f64 / total as f64
        } else {
            0.0
        }
    }
}

/// Renders a byte count for log lines, e.g. `1.50 KB`.
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 3] = ["KB", "MB", "GB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

/// Lock-free counters updated by concurrent fetch handlers.
#[derive(Debug)]
pub struct StatsTracker {
    start_time: Instant,
    cache_hits: AtomicU64,
    network_fetches: AtomicU64,
    entries_stored: AtomicU64,
    bytes_stored: AtomicU64,
    uncached_responses: AtomicU64,
    shell_fallbacks: AtomicU64,
    failures: AtomicU64,
}

impl Default for StatsTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsTracker {
    /// Creates a tracker with all counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            cache_hits: AtomicU64::new(0),
            network_fetches: AtomicU64::new(0),
            entries_stored: AtomicU64::new(0),
            bytes_stored: AtomicU64::new(0),
            uncached_responses: AtomicU64::new(0),
            shell_fallbacks: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn record_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fetch(&self) {
        self.network_fetches.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a cache write of `bytes` body bytes.
    pub fn record_store(&self, bytes: u64) {
        self.entries_stored.fetch_add(1, Ordering::Relaxed);
        self.bytes_stored.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_uncached(&self) {
        self.uncached_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback(&self) {
        self.shell_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the elapsed time since the tracker was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Copies the current counter values.
    #[must_use]
    pub fn snapshot(&self) -> CacheStats {
        CacheStats {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            network_fetches: self.network_fetches.load(Ordering::Relaxed),
            entries_stored: self.entries_stored.load(Ordering::Relaxed),
            bytes_stored: self.bytes_stored.load(Ordering::Relaxed),
            uncached_responses: self.uncached_responses.load(Ordering::Relaxed),
            shell_fallbacks: self.shell_fallbacks.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            uptime_secs: self.elapsed().as_secs(),
        }
    }
}
