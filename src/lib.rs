//! # feed-cache
//!
//! In-process caching layer for news-feed backends whose storage round trips are the bottleneck.
//!
//! Think of it as an L1 cache sitting between the feed handlers and the database.
//!
//! # The Basics
//!
//! The crate is designed for the following use case:
//!
//! - Reads vastly outnumber writes, and the same pages and profiles are read over and over.
//! - Engagement counters (likes, bookmarks, reposts, comments) are bumped far more often than the storage is happy to
//!   be written to.
//! - Some aggregates, like trending news or the author leaderboard, are expensive to compute and fine to be a minute
//!   old.
//!
//! It is made of four cooperating parts:
//!
//! - [`SegmentedCache`](cache::SegmentedCache): named segments of TTL-bound entries with per-segment LRU eviction and
//!   read-through loading via [`get_with_cache`](cache::SegmentedCache::get_with_cache).
//! - [`BatchQueue`](batch::BatchQueue): collects counter updates over a short window, coalesces them by key and writes
//!   each window out with a single [`BatchWriter`] call, invalidating the affected cache segments afterwards.
//! - [`PrecomputeScheduler`](scheduler::PrecomputeScheduler): periodically runs [`PrecomputeJob`]s and keeps their
//!   results in the `precomputed` segment.
//! - [`ConnectionPool`](pool::ConnectionPool): a fixed set of storage connections opened in parallel on first use.
//!
//! [`FeedService`](feed::FeedService) wires them together over any storage that implements
//! [`FeedStore`](feed::FeedStore).
//!
//! # Simulation
//!
//! With the `simulation` feature enabled the `test` module provides an in-memory store and a load generator; run it
//! with `cargo run --example feed_sim --features simulation -- --help`.

pub mod batch;
pub mod cache;
pub mod config;
pub mod entry;
pub mod error;
pub mod feed;
pub mod pool;
mod read_through;
pub mod scheduler;
pub mod segment;
pub mod test;
pub mod traits;
pub mod types;

#[doc(inline)]
pub use cache::SegmentedCache;
#[doc(inline)]
pub use error::CacheError;
#[doc(inline)]
pub use feed::FeedService;
#[doc(inline)]
pub use traits::BatchWriter;
#[doc(inline)]
pub use traits::PrecomputeJob;

pub mod prelude {
    pub use crate::batch::BatchQueue;
    pub use crate::batch::BatchTicket;
    pub use crate::cache::SegmentedCache;
    pub use crate::config::FeedCacheConfig;
    pub use crate::error::CacheError;
    pub use crate::error::StoreError;
    pub use crate::feed::FeedService;
    pub use crate::feed::FeedStore;
    pub use crate::pool::ConnectionPool;
    pub use crate::scheduler::PrecomputeScheduler;
    pub use crate::traits::*;
    pub use crate::types::*;
}
