use std::collections::HashMap;
use std::fmt::Debug;
use std::time::Duration;

use fieldx_plus::fx_plus;
use tokio::time::Instant;
use tracing::debug;
use tracing::trace;

use crate::config::SegmentLimits;
use crate::segment::Lookup;
use crate::segment::Segment;
use crate::traits::SegmentInvalidator;
use crate::types::CacheOptions;
use crate::types::CacheStats;

pub(crate) struct CacheState<V> {
    segments:   HashMap<String, Segment<V>>,
    hits:       u64,
    misses:     u64,
    evictions:  u64,
    prefetches: u64,
}

impl<V> Default for CacheState<V> {
    fn default() -> Self {
        Self {
            segments:   HashMap::new(),
            hits:       0,
            misses:     0,
            evictions:  0,
            prefetches: 0,
        }
    }
}

/// Process-wide key-value cache partitioned into named segments.
///
/// ```ignore
/// let cache = SegmentedCache::<Vec<News>>::builder()
///     .limits(SegmentLimits::default().with_override("news", 2))
///     .default_ttl(Duration::from_secs(60))
///     .build()?;
///
/// cache.set("news", "page:0", page, CacheOptions::ttl(Duration::from_secs(30)));
/// let page = cache.get("news", "page:0");
/// ```
///
/// Segments come into existence on the first write and disappear as a whole with
/// [`invalidate_segment()`](Self::invalidate_segment). There is no per-key invalidation: a caller mutating data is
/// responsible for dropping every segment that may hold a copy of it. Keys that need finer invalidation belong in
/// narrower segments, like the per-user `user_likes:<id>`.
#[fx_plus(
    parent,
    no_new,
    default(off),
    sync,
    builder(
        doc("Builder object of [`SegmentedCache`].", "", "See [`SegmentedCache::builder()`] method."),
        method_doc("Implement builder pattern for [`SegmentedCache`]."),
    )
)]
pub struct SegmentedCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Cache name. Only used in logs.
    #[fieldx(get(clone), builder(into), default(String::from("feed")))]
    name: String,

    #[fieldx(get, builder(into), default(SegmentLimits::default()))]
    limits: SegmentLimits,

    /// TTL of entries stored without one.
    #[fieldx(get(copy), default(Duration::from_secs(60)))]
    default_ttl: Duration,

    #[fieldx(lock, private, get, get_mut, builder(off), default(CacheState::default()))]
    state: CacheState<V>,
}

impl<V> SegmentedCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Look a key up. Expired entries count as misses and are dropped.
    pub fn get(&self, segment: &str, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut state = self.state_mut();

        let lookup = state
            .segments
            .get_mut(segment)
            .map_or(Lookup::Miss, |seg| seg.lookup(key, now));

        match lookup {
            Lookup::Hit(value) => {
                state.hits += 1;
                trace!(cache = %self.name(), segment, key, "hit");
                Some(value)
            }
            Lookup::Expired => {
                state.misses += 1;
                if state.segments.get(segment).is_some_and(|seg| seg.is_empty()) {
                    state.segments.remove(segment);
                    trace!(cache = %self.name(), segment, "last entry expired, segment dropped");
                }
                trace!(cache = %self.name(), segment, key, "expired");
                None
            }
            Lookup::Miss => {
                state.misses += 1;
                trace!(cache = %self.name(), segment, key, "miss");
                None
            }
        }
    }

    /// Store a value, replacing whatever is cached under `key`. Evicts the least recently used entry of a full
    /// segment.
    pub fn set(&self, segment: &str, key: impl Into<String>, data: V, options: CacheOptions) {
        let now = Instant::now();
        let ttl = options.ttl.unwrap_or_else(|| self.default_ttl());
        let max_size = self.limits().max_size_for(segment);
        let key = key.into();

        let mut state = self.state_mut();
        let seg = state
            .segments
            .entry(segment.to_string())
            .or_insert_with(|| Segment::new(segment, max_size));

        trace!(cache = %self.name(), segment, key = %key, ?ttl, priority = options.priority, "set");

        if let Some(evicted) = seg.insert(key, data, ttl, options.priority, now) {
            state.evictions += 1;
            debug!(cache = %self.name(), segment, key = %evicted, "evicted least recently used entry");
        }
    }

    /// Drop a whole segment. A no-op for unknown segments. Returns `true` if the segment existed.
    pub fn invalidate_segment(&self, segment: &str) -> bool {
        let removed = self.state_mut().segments.remove(segment);
        if let Some(ref seg) = removed {
            debug!(cache = %self.name(), segment, entries = seg.len(), "segment invalidated");
        }
        removed.is_some()
    }

    pub fn contains_segment(&self, segment: &str) -> bool {
        self.state().segments.contains_key(segment)
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state();
        let lookups = state.hits + state.misses;

        CacheStats {
            hits:       state.hits,
            misses:     state.misses,
            hit_rate:   if lookups > 0 {
                state.hits as f64 / lookups as f64
            }
            else {
                0.0
            },
            evictions:  state.evictions,
            prefetches: state.prefetches,
            total_size: state.segments.values().map(Segment::len).sum(),
            segments:   state
                .segments
                .iter()
                .map(|(name, seg)| (name.clone(), seg.len()))
                .collect(),
        }
    }

    pub(crate) fn note_prefetch(&self) {
        self.state_mut().prefetches += 1;
    }

    /// Drop every segment. Counters are kept.
    pub fn clear(&self) {
        self.state_mut().segments.clear();
    }
}

impl<V> SegmentInvalidator for SegmentedCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn invalidate(&self, segment: &str) -> bool {
        self.invalidate_segment(segment)
    }
}

impl<V> Debug for SegmentedCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("SegmentedCache")
            .field("name", &self.name())
            .field("segments", &state.segments.values().collect::<Vec<_>>())
            .finish()
    }
}
