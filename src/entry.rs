use std::fmt::Debug;
use std::time::Duration;

use tokio::time::Instant;

/// One cached value together with its bookkeeping.
///
/// An entry is owned by exactly one [`Segment`](crate::segment::Segment). It is logically expired once more than
/// `ttl` has passed since `created_at`; expired entries are never handed out.
pub struct CacheEntry<V> {
    data:           V,
    created_at:     Instant,
    ttl:            Duration,
    last_access_at: Instant,
    access_count:   u64,
    priority:       i32,
    // Segment-wide touch sequence. Orders entries whose last access happened at the same instant.
    access_seq:     u64,
}

impl<V> CacheEntry<V> {
    pub(crate) fn new(data: V, ttl: Duration, priority: i32, now: Instant, seq: u64) -> Self {
        Self {
            data,
            created_at: now,
            ttl,
            last_access_at: now,
            access_count: 0,
            priority,
            access_seq: seq,
        }
    }

    #[inline]
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) > self.ttl
    }

    pub(crate) fn touch(&mut self, now: Instant, seq: u64) -> &V {
        self.last_access_at = now;
        self.access_count += 1;
        self.access_seq = seq;
        &self.data
    }

    /// Key for LRU ordering: the smallest value is the least recently used entry.
    #[inline]
    pub(crate) fn recency(&self) -> (Instant, u64) {
        (self.last_access_at, self.access_seq)
    }

    pub fn data(&self) -> &V {
        &self.data
    }

    pub fn into_data(self) -> V {
        self.data
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn last_access_at(&self) -> Instant {
        self.last_access_at
    }

    pub fn access_count(&self) -> u64 {
        self.access_count
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }
}

impl<V> Debug for CacheEntry<V>
where
    V: Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("data", &self.data)
            .field("ttl", &self.ttl)
            .field("access_count", &self.access_count)
            .field("priority", &self.priority)
            .finish()
    }
}
