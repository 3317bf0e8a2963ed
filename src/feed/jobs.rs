//! Aggregates the precompute scheduler keeps warm.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::records::map_rows;
use super::FeedStore;
use super::FeedValue;
use crate::error::CacheError;
use crate::pool::ConnectionPool;
use crate::traits::PrecomputeJob;

pub const TRENDING_NEWS: &str = "trending_news";
pub const AUTHOR_STATS: &str = "author_stats";
pub const RECOMMENDATIONS: &str = "recommendations";

/// Most engaging news of the moment, as ranked by the store.
pub struct TrendingNewsJob<S: FeedStore> {
    pool:  Arc<ConnectionPool<S>>,
    limit: usize,
    ttl:   Duration,
}

impl<S: FeedStore> TrendingNewsJob<S> {
    pub fn new(pool: Arc<ConnectionPool<S>>, limit: usize, ttl: Duration) -> Self {
        Self { pool, limit, ttl }
    }
}

#[async_trait]
impl<S: FeedStore> PrecomputeJob<FeedValue> for TrendingNewsJob<S> {
    fn name(&self) -> &str {
        TRENDING_NEWS
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }

    async fn compute(&self) -> Result<FeedValue, CacheError> {
        let conn = self.pool.connection()?;
        let rows = self.pool.connector().trending_news(&conn, self.limit).await?;
        Ok(FeedValue::NewsList(Arc::new(map_rows(&rows)?)))
    }
}

/// Author leaderboard.
pub struct AuthorStatsJob<S: FeedStore> {
    pool:  Arc<ConnectionPool<S>>,
    limit: usize,
    ttl:   Duration,
}

impl<S: FeedStore> AuthorStatsJob<S> {
    pub fn new(pool: Arc<ConnectionPool<S>>, limit: usize, ttl: Duration) -> Self {
        Self { pool, limit, ttl }
    }
}

#[async_trait]
impl<S: FeedStore> PrecomputeJob<FeedValue> for AuthorStatsJob<S> {
    fn name(&self) -> &str {
        AUTHOR_STATS
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }

    async fn compute(&self) -> Result<FeedValue, CacheError> {
        let conn = self.pool.connection()?;
        let rows = self.pool.connector().author_stats(&conn, self.limit).await?;
        Ok(FeedValue::Authors(Arc::new(map_rows(&rows)?)))
    }
}

/// Recommendations for anonymous readers. There is no personalization yet: this is the freshest page of the feed,
/// kept under its own name so that readers of it never touch the `news` segment.
pub struct RecommendationsJob<S: FeedStore> {
    pool:  Arc<ConnectionPool<S>>,
    limit: usize,
    ttl:   Duration,
}

impl<S: FeedStore> RecommendationsJob<S> {
    pub fn new(pool: Arc<ConnectionPool<S>>, limit: usize, ttl: Duration) -> Self {
        Self { pool, limit, ttl }
    }
}

#[async_trait]
impl<S: FeedStore> PrecomputeJob<FeedValue> for RecommendationsJob<S> {
    fn name(&self) -> &str {
        RECOMMENDATIONS
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }

    async fn compute(&self) -> Result<FeedValue, CacheError> {
        let conn = self.pool.connection()?;
        let rows = self.pool.connector().news_page(&conn, 0, self.limit).await?;
        Ok(FeedValue::NewsList(Arc::new(map_rows(&rows)?)))
    }
}

macro_rules! job_debug {
    ($($job:ident),+) => {
        $(
            impl<S: FeedStore> Debug for $job<S> {
                fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    f.debug_struct(stringify!($job))
                        .field("limit", &self.limit)
                        .field("ttl", &self.ttl)
                        .finish()
                }
            }
        )+
    };
}

job_debug!(TrendingNewsJob, AuthorStatsJob, RecommendationsJob);
