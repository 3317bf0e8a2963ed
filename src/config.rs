//! Configuration of the cache layer.
//!
//! Every field has a default, so an empty JSON object is a valid configuration:
//!
//! ```
//! use feed_cache::config::FeedCacheConfig;
//!
//! let config = FeedCacheConfig::from_json(r#"{ "batch_window_ms": 25, "segments": { "overrides": { "news": 200 } } }"#)
//!     .unwrap();
//! assert_eq!(config.batch_window().as_millis(), 25);
//! assert_eq!(config.segments.max_size_for("news"), 200);
//! ```

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

/// Size limits of cache segments.
///
/// Overrides are matched by full segment name first and then by prefix, the part of a name before the first `:`. So
/// an override for `user_likes` applies to `user_likes:1`, `user_likes:2` and so on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentLimits {
    pub default_max_size: usize,
    pub overrides:        HashMap<String, usize>,
}

impl SegmentLimits {
    pub fn max_size_for(&self, segment: &str) -> usize {
        if let Some(size) = self.overrides.get(segment) {
            return *size;
        }

        segment
            .split_once(':')
            .and_then(|(prefix, _)| self.overrides.get(prefix))
            .copied()
            .unwrap_or(self.default_max_size)
    }

    pub fn with_override(mut self, segment: impl Into<String>, max_size: usize) -> Self {
        self.overrides.insert(segment.into(), max_size);
        self
    }
}

impl Default for SegmentLimits {
    fn default() -> Self {
        Self {
            default_max_size: 1_000,
            overrides:        HashMap::from([
                ("news".to_string(), 500),
                ("users".to_string(), 2_000),
                ("user_likes".to_string(), 1),
                ("user_bookmarks".to_string(), 1),
                ("user_reposts".to_string(), 1),
                ("user_following".to_string(), 1),
                ("user_followers".to_string(), 1),
                ("comments".to_string(), 1),
                ("precomputed".to_string(), 16),
            ]),
        }
    }
}

/// Time-to-live policy, in milliseconds, per kind of cached data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TtlPolicy {
    /// The first page of the feed; the most polled and the most volatile.
    pub hot_page_ms:    u64,
    pub page_ms:        u64,
    pub news_item_ms:   u64,
    pub user_ms:        u64,
    /// Per-user lists: likes, bookmarks, reposts.
    pub user_list_ms:   u64,
    pub comments_ms:    u64,
    pub precomputed_ms: u64,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            hot_page_ms:    30_000,
            page_ms:        60_000,
            news_item_ms:   120_000,
            user_ms:        300_000,
            user_list_ms:   120_000,
            comments_ms:    60_000,
            precomputed_ms: 300_000,
        }
    }
}

impl TtlPolicy {
    pub fn hot_page(&self) -> Duration {
        Duration::from_millis(self.hot_page_ms)
    }

    pub fn page(&self) -> Duration {
        Duration::from_millis(self.page_ms)
    }

    pub fn news_item(&self) -> Duration {
        Duration::from_millis(self.news_item_ms)
    }

    pub fn user(&self) -> Duration {
        Duration::from_millis(self.user_ms)
    }

    pub fn user_list(&self) -> Duration {
        Duration::from_millis(self.user_list_ms)
    }

    pub fn comments(&self) -> Duration {
        Duration::from_millis(self.comments_ms)
    }

    pub fn precomputed(&self) -> Duration {
        Duration::from_millis(self.precomputed_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedCacheConfig {
    pub segments:              SegmentLimits,
    pub ttl:                   TtlPolicy,
    /// TTL for entries stored without an explicit one.
    pub default_ttl_ms:        u64,
    pub hot_page_priority:     i32,
    /// Page sizes above this are clamped down to it.
    pub max_page_limit:        usize,
    pub batch_window_ms:       u64,
    pub precompute_period_ms:  u64,
    pub trending_limit:        usize,
    pub author_stats_limit:    usize,
    pub recommendations_limit: usize,
    pub pool_size:             usize,
    pub pool_ready_timeout_ms: u64,
    /// Upper bound for a single store round trip on a cache miss. `None` waits indefinitely.
    pub fetch_timeout_ms:      Option<u64>,
}

impl Default for FeedCacheConfig {
    fn default() -> Self {
        Self {
            segments:              SegmentLimits::default(),
            ttl:                   TtlPolicy::default(),
            default_ttl_ms:        60_000,
            hot_page_priority:     10,
            max_page_limit:        50,
            batch_window_ms:       10,
            precompute_period_ms:  60_000,
            trending_limit:        20,
            author_stats_limit:    10,
            recommendations_limit: 10,
            pool_size:             3,
            pool_ready_timeout_ms: 10_000,
            fetch_timeout_ms:      Some(5_000),
        }
    }
}

impl FeedCacheConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Clamp a requested page size into `1..=max_page_limit`.
    pub fn page_limit(&self, requested: usize) -> usize {
        requested.clamp(1, self.max_page_limit.max(1))
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    pub fn precompute_period(&self) -> Duration {
        Duration::from_millis(self.precompute_period_ms)
    }

    pub fn pool_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.pool_ready_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Option<Duration> {
        self.fetch_timeout_ms.map(Duration::from_millis)
    }
}
