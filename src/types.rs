use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

/// Per-write options for [`SegmentedCache::set()`](crate::cache::SegmentedCache::set) and
/// [`SegmentedCache::get_with_cache()`](crate::cache::SegmentedCache::get_with_cache).
///
/// A `None` TTL falls back to the cache default. `timeout` only matters for read-through calls where it bounds the
/// fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheOptions {
    pub ttl:      Option<Duration>,
    pub priority: i32,
    pub timeout:  Option<Duration>,
}

impl CacheOptions {
    pub fn ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..Self::default()
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Snapshot of cache counters. Observability only.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits:       u64,
    pub misses:     u64,
    pub hit_rate:   f64,
    pub evictions:  u64,
    pub prefetches: u64,
    pub total_size: usize,
    /// Entry count per segment, ordered by segment name.
    pub segments:   BTreeMap<String, usize>,
}

impl CacheStats {
    pub fn segment_names(&self) -> Vec<&str> {
        self.segments.keys().map(String::as_str).collect()
    }

    pub fn segment_size(&self, name: &str) -> Option<usize> {
        self.segments.get(name).copied()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchStats {
    /// Every accepted `enqueue()` call.
    pub enqueued:       u64,
    /// Writes that replaced a pending value for the same key.
    pub coalesced:      u64,
    /// Combined writes issued, successful or not.
    pub flushes:        u64,
    pub failed_flushes: u64,
    /// Key payloads lost with failed flushes.
    pub dropped_writes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub configured:    usize,
    pub connected:     usize,
    /// How many times the pool was actually built. Stays at 1 once initialized.
    pub builds:        u64,
    pub init_duration: Option<Duration>,
}

/// Reported health of the backing store. This is a status field; nothing consults it before calling the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceStats {
    pub cache:         CacheStats,
    pub batches:       BatchStats,
    pub pool:          PoolStats,
    pub circuit_state: CircuitState,
    pub uptime:        Duration,
}
