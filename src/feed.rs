//! News-feed service built on top of the cache layer.
//!
//! [`FeedService`] is the composition root: it owns the segmented cache, the connection pool, the counter batching
//! queue and the precompute scheduler, and exposes the feed reads and mutations. The storage itself stays behind the
//! [`FeedStore`] trait.
//!
//! Cache layout:
//!
//! | Segment                | Key                                | Content                               |
//! | ---------------------- | ---------------------------------- | ------------------------------------- |
//! | `news`                 | `page:<page>:<limit>`              | one page of the feed                  |
//! | `news`                 | `author:<uid>:page:<page>:<limit>` | one page of a single author's news    |
//! | `news`                 | `id:<id>`                          | a single news item                    |
//! | `users`                | `id:<id>`                          | a user profile                        |
//! | `user_likes:<uid>`     | `ids`                              | ids of news the user liked            |
//! | `user_bookmarks:<uid>` | `ids`                              | ids of news the user bookmarked       |
//! | `user_reposts:<uid>`   | `ids`                              | ids of news the user reposted         |
//! | `user_following:<uid>` | `ids`                              | ids of users the user follows         |
//! | `user_followers:<uid>` | `ids`                              | ids of users following the user       |
//! | `comments:<news>`      | `all`                              | comments of a news item               |
//! | `precomputed`          | job name                           | aggregates refreshed by the scheduler |
//!
//! Every written counter batch and every created, edited or deleted news item drops the whole `news` segment.

pub mod jobs;
pub mod records;

use std::collections::BTreeSet;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use fieldx_plus::fx_plus;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::instrument;

use self::jobs::AuthorStatsJob;
use self::jobs::RecommendationsJob;
use self::jobs::TrendingNewsJob;
use self::records::map_rows;
use self::records::AuthorStats;
use self::records::Comment;
use self::records::NewNews;
use self::records::News;
use self::records::NewsUpdate;
use self::records::Row;
use self::records::User;
use crate::batch::BatchQueue;
use crate::batch::BatchTicket;
use crate::cache::SegmentedCache;
use crate::config::FeedCacheConfig;
use crate::error::CacheError;
use crate::error::StoreError;
use crate::pool::ConnectionPool;
use crate::scheduler::PrecomputeScheduler;
use crate::scheduler::PRECOMPUTED;
use crate::traits::BatchWriter;
use crate::traits::Connector;
use crate::traits::PrecomputeJob;
use crate::traits::SegmentInvalidator;
use crate::types::CacheOptions;
use crate::types::CacheStats;
use crate::types::PerformanceStats;

pub const NEWS: &str = "news";
pub const USERS: &str = "users";
const USER_LIST_KEY: &str = "ids";
const COMMENTS_KEY: &str = "all";

/// A user-to-news relation stored as its own row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum Relation {
    Like,
    Bookmark,
    Repost,
}

impl Relation {
    pub fn segment_prefix(&self) -> &'static str {
        match self {
            Self::Like => "user_likes",
            Self::Bookmark => "user_bookmarks",
            Self::Repost => "user_reposts",
        }
    }

    /// The per-user segment listing the news ids this relation links the user to.
    pub fn segment(&self, user_id: &str) -> String {
        format!("{}:{user_id}", self.segment_prefix())
    }

    pub fn counter(&self) -> CounterKind {
        match self {
            Self::Like => CounterKind::Likes,
            Self::Bookmark => CounterKind::Bookmarks,
            Self::Repost => CounterKind::Reposts,
        }
    }
}

/// Denormalized news counters maintained through the batching queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, strum::Display, strum::EnumIter)]
pub enum CounterKind {
    #[strum(serialize = "update_likes")]
    Likes,
    #[strum(serialize = "update_bookmarks")]
    Bookmarks,
    #[strum(serialize = "update_reposts")]
    Reposts,
    #[strum(serialize = "update_comments")]
    Comments,
}

impl CounterKind {
    /// The `news` column the counter lives in.
    pub fn column(&self) -> &'static str {
        match self {
            Self::Likes => "likes_count",
            Self::Bookmarks => "bookmarks_count",
            Self::Reposts => "reposts_count",
            Self::Comments => "comments_count",
        }
    }
}

pub fn comments_segment(news_id: &str) -> String {
    format!("comments:{news_id}")
}

/// Which side of the follow graph a per-user list holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum FollowList {
    /// Users the owner follows.
    Following,
    /// Users following the owner.
    Followers,
}

impl FollowList {
    pub fn segment(&self, user_id: &str) -> String {
        format!("user_{self}:{user_id}")
    }
}

/// How a feed page is selected and read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageQuery {
    /// Only news of this author.
    pub author_id:     Option<String>,
    /// Skip the cached copy and reload the page from the store.
    pub force_refresh: bool,
}

impl PageQuery {
    pub fn author(author_id: impl Into<String>) -> Self {
        Self {
            author_id: Some(author_id.into()),
            ..Self::default()
        }
    }

    pub fn refreshed(mut self) -> Self {
        self.force_refresh = true;
        self
    }

    fn cache_key(&self, page: usize, limit: usize) -> String {
        match self.author_id {
            Some(ref author_id) => format!("author:{author_id}:page:{page}:{limit}"),
            None => format!("page:{page}:{limit}"),
        }
    }
}

/// What the feed cache holds. Payloads are shared, so a cache hit only bumps a reference count.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedValue {
    NewsList(Arc<Vec<News>>),
    News(Arc<News>),
    User(Arc<User>),
    Ids(Arc<BTreeSet<String>>),
    Comments(Arc<Vec<Comment>>),
    Authors(Arc<Vec<AuthorStats>>),
}

impl FeedValue {
    pub fn news_list(self) -> Option<Arc<Vec<News>>> {
        match self {
            Self::NewsList(list) => Some(list),
            _ => None,
        }
    }

    pub fn news(self) -> Option<Arc<News>> {
        match self {
            Self::News(news) => Some(news),
            _ => None,
        }
    }

    pub fn user(self) -> Option<Arc<User>> {
        match self {
            Self::User(user) => Some(user),
            _ => None,
        }
    }

    pub fn ids(self) -> Option<Arc<BTreeSet<String>>> {
        match self {
            Self::Ids(ids) => Some(ids),
            _ => None,
        }
    }

    pub fn comments(self) -> Option<Arc<Vec<Comment>>> {
        match self {
            Self::Comments(comments) => Some(comments),
            _ => None,
        }
    }

    pub fn authors(self) -> Option<Arc<Vec<AuthorStats>>> {
        match self {
            Self::Authors(authors) => Some(authors),
            _ => None,
        }
    }
}

/// Query layer of the backing store. Every query runs on a connection handed out by the pool.
#[async_trait]
pub trait FeedStore: Connector {
    /// Newest first, skipping `offset` items.
    async fn news_page(&self, conn: &Self::Connection, offset: usize, limit: usize) -> Result<Vec<Row>, StoreError>;
    /// Newest first, only news of `author_id`.
    async fn author_news_page(
        &self,
        conn: &Self::Connection,
        author_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Row>, StoreError>;
    async fn news_by_id(&self, conn: &Self::Connection, news_id: &str) -> Result<Option<Row>, StoreError>;
    async fn user_by_id(&self, conn: &Self::Connection, user_id: &str) -> Result<Option<Row>, StoreError>;
    async fn relation_ids(
        &self,
        conn: &Self::Connection,
        relation: Relation,
        user_id: &str,
    ) -> Result<Vec<String>, StoreError>;
    async fn comments(&self, conn: &Self::Connection, news_id: &str) -> Result<Vec<Row>, StoreError>;

    /// Returns `false` if the relation already existed.
    async fn insert_relation(
        &self,
        conn: &Self::Connection,
        relation: Relation,
        user_id: &str,
        news_id: &str,
    ) -> Result<bool, StoreError>;

    /// Returns `false` if there was nothing to delete.
    async fn delete_relation(
        &self,
        conn: &Self::Connection,
        relation: Relation,
        user_id: &str,
        news_id: &str,
    ) -> Result<bool, StoreError>;

    /// Returns the stored comment row.
    async fn insert_comment(
        &self,
        conn: &Self::Connection,
        news_id: &str,
        user_id: &str,
        text: &str,
    ) -> Result<Row, StoreError>;

    /// Returns the stored news row.
    async fn insert_news(&self, conn: &Self::Connection, author_id: &str, news: &NewNews) -> Result<Row, StoreError>;

    /// Returns the updated row, or `None` if there is no such news.
    async fn update_news(
        &self,
        conn: &Self::Connection,
        news_id: &str,
        update: &NewsUpdate,
    ) -> Result<Option<Row>, StoreError>;

    /// Soft delete: the news stops showing up in any read. Returns `false` if it was already gone.
    async fn delete_news(&self, conn: &Self::Connection, news_id: &str) -> Result<bool, StoreError>;

    /// Returns `false` if `follower_id` already follows `following_id`.
    async fn insert_follow(
        &self,
        conn: &Self::Connection,
        follower_id: &str,
        following_id: &str,
    ) -> Result<bool, StoreError>;

    /// Returns `false` if there was nothing to delete.
    async fn delete_follow(
        &self,
        conn: &Self::Connection,
        follower_id: &str,
        following_id: &str,
    ) -> Result<bool, StoreError>;

    /// Ids of the users on the given side of `user_id`'s follow graph.
    async fn follow_ids(
        &self,
        conn: &Self::Connection,
        list: FollowList,
        user_id: &str,
    ) -> Result<Vec<String>, StoreError>;

    /// Apply all `(news_id, delta)` pairs to `counter` in one statement.
    async fn apply_counter_deltas(
        &self,
        conn: &Self::Connection,
        counter: CounterKind,
        deltas: &[(String, i64)],
    ) -> Result<(), StoreError>;

    async fn trending_news(&self, conn: &Self::Connection, limit: usize) -> Result<Vec<Row>, StoreError>;
    async fn author_stats(&self, conn: &Self::Connection, limit: usize) -> Result<Vec<Row>, StoreError>;
}

/// Writes coalesced counter deltas to the store.
pub struct FeedBatchWriter<S: FeedStore> {
    pool: Arc<ConnectionPool<S>>,
}

impl<S: FeedStore> FeedBatchWriter<S> {
    pub fn new(pool: Arc<ConnectionPool<S>>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl<S: FeedStore> BatchWriter for FeedBatchWriter<S> {
    type Key = String;
    type Kind = CounterKind;
    type Payload = i64;

    async fn write_batch(&self, kind: &CounterKind, batch: Vec<(String, i64)>) -> Result<(), CacheError> {
        let conn = self.pool.connection()?;
        self.pool.connector().apply_counter_deltas(&conn, *kind, &batch).await?;
        Ok(())
    }

    // Every counter shows up in pages and single items alike.
    fn affected_segments(&self, _kind: &CounterKind, _keys: &[String]) -> Vec<String> {
        vec![NEWS.to_string()]
    }
}

/// Result of a relation mutation.
#[derive(Debug)]
pub struct MutationOutcome {
    /// `false` if the relation was already in the requested state. Nothing is enqueued or invalidated then.
    pub changed: bool,
    /// Resolves once the counter update left the pending batch.
    pub ticket:  Option<BatchTicket>,
}

/// The feed backend.
///
/// ```ignore
/// let feed = FeedService::builder().store(store).config(config).build()?;
/// feed.init().await?;
///
/// let page = feed.news_page(0, 20).await?;
/// feed.like_news(&page[0].id, "u1").await?;
/// ```
///
/// Reads go through [`SegmentedCache::get_with_cache()`] with the configured fetch timeout. Mutations write their row
/// directly, push the counter change into the batching queue and drop the per-user or per-news segment they made
/// stale.
#[fx_plus(
    parent,
    no_new,
    default(off),
    fallible(off, error(CacheError)),
    sync,
    builder(
        doc("Builder object of [`FeedService`].", "", "See [`FeedService::builder()`] method."),
        method_doc("Implement builder pattern for [`FeedService`]."),
    )
)]
pub struct FeedService<S>
where
    S: FeedStore,
{
    #[fieldx(get(clone), builder(required, into))]
    store: Arc<S>,

    #[fieldx(get, builder(into), default(FeedCacheConfig::default()))]
    config: FeedCacheConfig,

    #[fieldx(lazy, fallible, get(clone), builder(off))]
    cache: Arc<SegmentedCache<FeedValue>>,

    #[fieldx(lazy, fallible, get(clone), builder(off))]
    pool: Arc<ConnectionPool<S>>,

    #[fieldx(lazy, fallible, get(clone), builder(off))]
    batches: Arc<BatchQueue<FeedBatchWriter<S>>>,

    #[fieldx(lazy, fallible, get(clone), builder(off))]
    scheduler: Arc<PrecomputeScheduler<FeedValue>>,

    #[fieldx(lazy, fallible, get(clone), builder(off))]
    trending_job: Arc<TrendingNewsJob<S>>,

    #[fieldx(lazy, fallible, get(clone), builder(off))]
    author_stats_job: Arc<AuthorStatsJob<S>>,

    #[fieldx(lazy, fallible, get(clone), builder(off))]
    recommendations_job: Arc<RecommendationsJob<S>>,

    #[fieldx(private, get(off), builder(off), default(OnceCell::new()))]
    initialized: OnceCell<()>,

    #[fieldx(get(copy), builder(off), default(Instant::now()))]
    started_at: Instant,
}

impl<S> FeedService<S>
where
    S: FeedStore,
{
    fn build_cache(&self) -> Result<Arc<SegmentedCache<FeedValue>>, CacheError> {
        let config = self.config();
        Ok(SegmentedCache::builder()
            .name("feed")
            .limits(config.segments.clone())
            .default_ttl(config.default_ttl())
            .build()?)
    }

    fn build_pool(&self) -> Result<Arc<ConnectionPool<S>>, CacheError> {
        let config = self.config();
        Ok(ConnectionPool::builder()
            .connector(self.store())
            .size(config.pool_size)
            .ready_timeout(config.pool_ready_timeout())
            .build()?)
    }

    fn build_batches(&self) -> Result<Arc<BatchQueue<FeedBatchWriter<S>>>, CacheError> {
        Ok(BatchQueue::builder()
            .writer(Arc::new(FeedBatchWriter::new(self.pool()?)))
            .invalidator(self.cache()? as Arc<dyn SegmentInvalidator>)
            .window(self.config().batch_window())
            .build()?)
    }

    fn build_scheduler(&self) -> Result<Arc<PrecomputeScheduler<FeedValue>>, CacheError> {
        let jobs: Vec<Arc<dyn PrecomputeJob<FeedValue>>> = vec![
            self.trending_job()?,
            self.author_stats_job()?,
            self.recommendations_job()?,
        ];
        Ok(PrecomputeScheduler::builder()
            .cache(self.cache()?)
            .jobs(jobs)
            .period(self.config().precompute_period())
            .build()?)
    }

    fn build_trending_job(&self) -> Result<Arc<TrendingNewsJob<S>>, CacheError> {
        let config = self.config();
        Ok(Arc::new(TrendingNewsJob::new(
            self.pool()?,
            config.trending_limit,
            config.ttl.precomputed(),
        )))
    }

    fn build_author_stats_job(&self) -> Result<Arc<AuthorStatsJob<S>>, CacheError> {
        let config = self.config();
        Ok(Arc::new(AuthorStatsJob::new(
            self.pool()?,
            config.author_stats_limit,
            config.ttl.precomputed(),
        )))
    }

    fn build_recommendations_job(&self) -> Result<Arc<RecommendationsJob<S>>, CacheError> {
        let config = self.config();
        Ok(Arc::new(RecommendationsJob::new(
            self.pool()?,
            config.recommendations_limit,
            config.ttl.precomputed(),
        )))
    }

    /// Open the connection pool and start the precompute scheduler.
    ///
    /// Safe to call from many tasks at once: the pool is built exactly once and late callers wait for the build in
    /// progress. If the build fails, nothing is started and the next call tries again.
    pub async fn init(&self) -> Result<(), CacheError> {
        self.initialized
            .get_or_try_init(|| async {
                let started = Instant::now();
                let connected = self.pool()?.init().await?;
                self.scheduler()?.start();
                info!(connected, elapsed = ?started.elapsed(), "feed service initialized");
                Ok::<_, CacheError>(())
            })
            .await?;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.initialized()
    }

    /// Write out every pending counter batch and stop the scheduler. Returns the number of flushed keys.
    pub async fn close(&self) -> Result<usize, CacheError> {
        let flushed = self.batches()?.close().await;
        self.scheduler()?.stop();
        info!(flushed, "feed service closed");
        Ok(flushed)
    }

    fn connection(&self) -> Result<(Arc<S>, Arc<S::Connection>), CacheError> {
        Ok((self.store(), self.pool()?.connection()?))
    }

    fn read_options(&self, options: CacheOptions) -> CacheOptions {
        options.with_timeout(self.config().fetch_timeout())
    }

    // Read through the cache and take the expected variant out of the cached value.
    async fn cached<T, F, Fut>(
        &self,
        segment: &str,
        key: &str,
        options: CacheOptions,
        fetch: F,
        extract: fn(FeedValue) -> Option<T>,
    ) -> Result<Option<T>, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<FeedValue>, CacheError>>,
    {
        self.cached_with(segment, key, options, fetch, extract, false)
            .await
    }

    async fn cached_with<T, F, Fut>(
        &self,
        segment: &str,
        key: &str,
        options: CacheOptions,
        fetch: F,
        extract: fn(FeedValue) -> Option<T>,
        refresh: bool,
    ) -> Result<Option<T>, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<FeedValue>, CacheError>>,
    {
        let cache = self.cache()?;
        let options = self.read_options(options);
        let value = if refresh {
            cache.refresh_with_cache(segment, key, fetch, options).await?
        }
        else {
            cache.get_with_cache(segment, key, fetch, options).await?
        };

        value
            .map(|v| {
                extract(v).ok_or_else(|| CacheError::UnexpectedValue {
                    segment: segment.to_string(),
                    key:     key.to_string(),
                })
            })
            .transpose()
    }

    /// One page of the feed, newest first. The first page is the hottest one: it gets a shorter TTL and a higher
    /// priority than the rest.
    pub async fn news_page(&self, page: usize, limit: usize) -> Result<Arc<Vec<News>>, CacheError> {
        self.news_page_with(page, limit, &PageQuery::default()).await
    }

    /// One page of news selected by `query`.
    ///
    /// `limit` is clamped into `1..=max_page_limit`. A page whose offset does not fit into `usize` is empty and is
    /// answered without touching the cache or the store. Only the first page of the unfiltered feed is hot.
    #[instrument(level = "trace", skip(self))]
    pub async fn news_page_with(
        &self,
        page: usize,
        limit: usize,
        query: &PageQuery,
    ) -> Result<Arc<Vec<News>>, CacheError> {
        let config = self.config();
        let limit = config.page_limit(limit);
        let Some(offset) = page.checked_mul(limit)
        else {
            debug!(page, limit, "page offset overflows, nothing to read");
            return Ok(Arc::default());
        };

        let options = if page == 0 && query.author_id.is_none() {
            CacheOptions::ttl(config.ttl.hot_page()).with_priority(config.hot_page_priority)
        }
        else {
            CacheOptions::ttl(config.ttl.page())
        };

        let key = query.cache_key(page, limit);
        let fetch = || async {
            let (store, conn) = self.connection()?;
            let rows = match query.author_id {
                Some(ref author_id) => store.author_news_page(&conn, author_id, offset, limit).await?,
                None => store.news_page(&conn, offset, limit).await?,
            };
            Ok::<_, CacheError>(Some(FeedValue::NewsList(Arc::new(map_rows(&rows)?))))
        };

        Ok(self
            .cached_with(NEWS, &key, options, fetch, FeedValue::news_list, query.force_refresh)
            .await?
            .unwrap_or_default())
    }

    #[instrument(level = "trace", skip(self))]
    pub async fn news(&self, news_id: &str) -> Result<Option<Arc<News>>, CacheError> {
        let options = CacheOptions::ttl(self.config().ttl.news_item());
        let fetch = || async {
            let (store, conn) = self.connection()?;
            Ok::<_, CacheError>(match store.news_by_id(&conn, news_id).await? {
                Some(row) => Some(FeedValue::News(Arc::new(News::try_from(&row)?))),
                None => None,
            })
        };

        self.cached(NEWS, &format!("id:{news_id}"), options, fetch, FeedValue::news)
            .await
    }

    #[instrument(level = "trace", skip(self))]
    pub async fn user(&self, user_id: &str) -> Result<Option<Arc<User>>, CacheError> {
        let options = CacheOptions::ttl(self.config().ttl.user());
        let fetch = || async {
            let (store, conn) = self.connection()?;
            Ok::<_, CacheError>(match store.user_by_id(&conn, user_id).await? {
                Some(row) => Some(FeedValue::User(Arc::new(User::try_from(&row)?))),
                None => None,
            })
        };

        self.cached(USERS, &format!("id:{user_id}"), options, fetch, FeedValue::user)
            .await
    }

    async fn relation_ids(&self, relation: Relation, user_id: &str) -> Result<Arc<BTreeSet<String>>, CacheError> {
        let options = CacheOptions::ttl(self.config().ttl.user_list());
        let fetch = || async {
            let (store, conn) = self.connection()?;
            let ids = store.relation_ids(&conn, relation, user_id).await?;
            Ok::<_, CacheError>(Some(FeedValue::Ids(Arc::new(ids.into_iter().collect()))))
        };

        Ok(self
            .cached(&relation.segment(user_id), USER_LIST_KEY, options, fetch, FeedValue::ids)
            .await?
            .unwrap_or_default())
    }

    pub async fn user_likes(&self, user_id: &str) -> Result<Arc<BTreeSet<String>>, CacheError> {
        self.relation_ids(Relation::Like, user_id).await
    }

    pub async fn user_bookmarks(&self, user_id: &str) -> Result<Arc<BTreeSet<String>>, CacheError> {
        self.relation_ids(Relation::Bookmark, user_id).await
    }

    pub async fn user_reposts(&self, user_id: &str) -> Result<Arc<BTreeSet<String>>, CacheError> {
        self.relation_ids(Relation::Repost, user_id).await
    }

    async fn follow_ids(&self, list: FollowList, user_id: &str) -> Result<Arc<BTreeSet<String>>, CacheError> {
        let options = CacheOptions::ttl(self.config().ttl.user_list());
        let fetch = || async {
            let (store, conn) = self.connection()?;
            let ids = store.follow_ids(&conn, list, user_id).await?;
            Ok::<_, CacheError>(Some(FeedValue::Ids(Arc::new(ids.into_iter().collect()))))
        };

        Ok(self
            .cached(&list.segment(user_id), USER_LIST_KEY, options, fetch, FeedValue::ids)
            .await?
            .unwrap_or_default())
    }

    /// Ids of the users `user_id` follows.
    pub async fn user_following(&self, user_id: &str) -> Result<Arc<BTreeSet<String>>, CacheError> {
        self.follow_ids(FollowList::Following, user_id).await
    }

    /// Ids of the users following `user_id`.
    pub async fn user_followers(&self, user_id: &str) -> Result<Arc<BTreeSet<String>>, CacheError> {
        self.follow_ids(FollowList::Followers, user_id).await
    }

    /// Answered from the user's cached like list; a single store round trip on a cold cache.
    pub async fn is_news_liked(&self, news_id: &str, user_id: &str) -> Result<bool, CacheError> {
        Ok(self.user_likes(user_id).await?.contains(news_id))
    }

    #[instrument(level = "trace", skip(self))]
    pub async fn comments(&self, news_id: &str) -> Result<Arc<Vec<Comment>>, CacheError> {
        let options = CacheOptions::ttl(self.config().ttl.comments());
        let fetch = || async {
            let (store, conn) = self.connection()?;
            let rows = store.comments(&conn, news_id).await?;
            Ok::<_, CacheError>(Some(FeedValue::Comments(Arc::new(map_rows(&rows)?))))
        };

        Ok(self
            .cached(&comments_segment(news_id), COMMENTS_KEY, options, fetch, FeedValue::comments)
            .await?
            .unwrap_or_default())
    }

    // The scheduler keeps these warm; a cold or expired entry is computed on the spot by the very same job.
    async fn precomputed<T>(
        &self,
        job: Arc<dyn PrecomputeJob<FeedValue>>,
        extract: fn(FeedValue) -> Option<T>,
    ) -> Result<T, CacheError>
    where
        T: Default,
    {
        let name = job.name().to_string();
        let options = CacheOptions::ttl(job.ttl()).with_priority(job.priority());
        let fetch = move || async move { job.compute().await.map(Some) };

        Ok(self
            .cached(PRECOMPUTED, &name, options, fetch, extract)
            .await?
            .unwrap_or_default())
    }

    pub async fn trending_news(&self) -> Result<Arc<Vec<News>>, CacheError> {
        self.precomputed(self.trending_job()?, FeedValue::news_list).await
    }

    pub async fn author_stats(&self) -> Result<Arc<Vec<AuthorStats>>, CacheError> {
        self.precomputed(self.author_stats_job()?, FeedValue::authors).await
    }

    pub async fn recommendations(&self) -> Result<Arc<Vec<News>>, CacheError> {
        self.precomputed(self.recommendations_job()?, FeedValue::news_list)
            .await
    }

    #[instrument(level = "trace", skip(self))]
    async fn set_relation(
        &self,
        relation: Relation,
        news_id: &str,
        user_id: &str,
        present: bool,
    ) -> Result<MutationOutcome, CacheError> {
        let (store, conn) = self.connection()?;
        let changed = if present {
            store.insert_relation(&conn, relation, user_id, news_id).await?
        }
        else {
            store.delete_relation(&conn, relation, user_id, news_id).await?
        };

        if !changed {
            debug!(%relation, news_id, user_id, present, "relation unchanged");
            return Ok(MutationOutcome {
                changed,
                ticket: None,
            });
        }

        self.cache()?.invalidate_segment(&relation.segment(user_id));
        let delta = if present { 1 } else { -1 };
        let ticket = self
            .batches()?
            .enqueue(relation.counter(), news_id.to_string(), delta);

        Ok(MutationOutcome {
            changed,
            ticket: Some(ticket),
        })
    }

    pub async fn like_news(&self, news_id: &str, user_id: &str) -> Result<MutationOutcome, CacheError> {
        self.set_relation(Relation::Like, news_id, user_id, true).await
    }

    pub async fn unlike_news(&self, news_id: &str, user_id: &str) -> Result<MutationOutcome, CacheError> {
        self.set_relation(Relation::Like, news_id, user_id, false).await
    }

    pub async fn bookmark_news(&self, news_id: &str, user_id: &str) -> Result<MutationOutcome, CacheError> {
        self.set_relation(Relation::Bookmark, news_id, user_id, true).await
    }

    pub async fn unbookmark_news(&self, news_id: &str, user_id: &str) -> Result<MutationOutcome, CacheError> {
        self.set_relation(Relation::Bookmark, news_id, user_id, false)
            .await
    }

    pub async fn repost_news(&self, news_id: &str, user_id: &str) -> Result<MutationOutcome, CacheError> {
        self.set_relation(Relation::Repost, news_id, user_id, true).await
    }

    pub async fn unrepost_news(&self, news_id: &str, user_id: &str) -> Result<MutationOutcome, CacheError> {
        self.set_relation(Relation::Repost, news_id, user_id, false).await
    }

    #[instrument(level = "trace", skip(self, text))]
    pub async fn add_comment(
        &self,
        news_id: &str,
        user_id: &str,
        text: &str,
    ) -> Result<(Comment, BatchTicket), CacheError> {
        let (store, conn) = self.connection()?;
        let row = store.insert_comment(&conn, news_id, user_id, text).await?;
        let comment = Comment::try_from(&row)?;

        self.cache()?.invalidate_segment(&comments_segment(news_id));
        let ticket = self
            .batches()?
            .enqueue(CounterKind::Comments, news_id.to_string(), 1);

        Ok((comment, ticket))
    }

    /// Publish a news item on behalf of `author_id`. Title and content must not be blank.
    #[instrument(level = "trace", skip(self, news))]
    pub async fn create_news(&self, author_id: &str, news: &NewNews) -> Result<Arc<News>, CacheError> {
        if news.title.trim().is_empty() || news.content.trim().is_empty() {
            return Err(CacheError::InvalidRequest("title and content are required".into()));
        }

        let (store, conn) = self.connection()?;
        let row = store.insert_news(&conn, author_id, news).await?;
        let created = Arc::new(News::try_from(&row)?);

        self.cache()?.invalidate_segment(NEWS);
        debug!(news_id = %created.id, author_id, "news created");
        Ok(created)
    }

    // Ownership is checked against the store, never against a possibly stale cached copy.
    async fn authored_news(
        &self,
        store: &S,
        conn: &S::Connection,
        news_id: &str,
        user_id: &str,
    ) -> Result<News, CacheError> {
        let news = match store.news_by_id(conn, news_id).await? {
            Some(row) => News::try_from(&row)?,
            None => return Err(CacheError::NewsNotFound(news_id.to_string())),
        };

        if news.author_id != user_id {
            return Err(CacheError::NotAuthor {
                news_id: news_id.to_string(),
                user_id: user_id.to_string(),
            });
        }

        Ok(news)
    }

    /// Edit a news item. Only its author may do so.
    #[instrument(level = "trace", skip(self, update))]
    pub async fn update_news(
        &self,
        news_id: &str,
        user_id: &str,
        update: &NewsUpdate,
    ) -> Result<Arc<News>, CacheError> {
        if update.is_empty() {
            return Err(CacheError::InvalidRequest("nothing to update".into()));
        }
        if matches!(update.title, Some(ref title) if title.trim().is_empty())
            || matches!(update.content, Some(ref content) if content.trim().is_empty())
        {
            return Err(CacheError::InvalidRequest("title and content cannot be blank".into()));
        }

        let (store, conn) = self.connection()?;
        self.authored_news(&store, &conn, news_id, user_id).await?;

        let row = store
            .update_news(&conn, news_id, update)
            .await?
            .ok_or_else(|| CacheError::NewsNotFound(news_id.to_string()))?;
        let updated = Arc::new(News::try_from(&row)?);

        self.cache()?.invalidate_segment(NEWS);
        debug!(news_id, user_id, "news updated");
        Ok(updated)
    }

    /// Delete a news item. Only its author may do so. Returns `false` if it was deleted by someone else in the
    /// meantime.
    #[instrument(level = "trace", skip(self))]
    pub async fn delete_news(&self, news_id: &str, user_id: &str) -> Result<bool, CacheError> {
        let (store, conn) = self.connection()?;
        self.authored_news(&store, &conn, news_id, user_id).await?;

        let deleted = store.delete_news(&conn, news_id).await?;
        let cache = self.cache()?;
        cache.invalidate_segment(NEWS);
        cache.invalidate_segment(&comments_segment(news_id));
        debug!(news_id, user_id, deleted, "news deleted");
        Ok(deleted)
    }

    #[instrument(level = "trace", skip(self))]
    async fn set_follow(&self, follower_id: &str, following_id: &str, present: bool) -> Result<bool, CacheError> {
        if follower_id == following_id {
            return Err(CacheError::InvalidRequest("cannot follow yourself".into()));
        }

        let (store, conn) = self.connection()?;
        let changed = if present {
            store.insert_follow(&conn, follower_id, following_id).await?
        }
        else {
            store.delete_follow(&conn, follower_id, following_id).await?
        };

        if changed {
            let cache = self.cache()?;
            cache.invalidate_segment(&FollowList::Following.segment(follower_id));
            cache.invalidate_segment(&FollowList::Followers.segment(following_id));
        }
        else {
            debug!(follower_id, following_id, present, "follow unchanged");
        }

        Ok(changed)
    }

    /// Returns `false` if `follower_id` already follows `following_id`.
    pub async fn follow_user(&self, follower_id: &str, following_id: &str) -> Result<bool, CacheError> {
        self.set_follow(follower_id, following_id, true).await
    }

    /// Returns `false` if `follower_id` did not follow `following_id`.
    pub async fn unfollow_user(&self, follower_id: &str, following_id: &str) -> Result<bool, CacheError> {
        self.set_follow(follower_id, following_id, false).await
    }

    pub fn stats(&self) -> Result<CacheStats, CacheError> {
        Ok(self.cache()?.stats())
    }

    pub fn performance_stats(&self) -> Result<PerformanceStats, CacheError> {
        let pool = self.pool()?;
        Ok(PerformanceStats {
            cache:         self.cache()?.stats(),
            batches:       self.batches()?.stats(),
            pool:          pool.stats(),
            circuit_state: pool.circuit_state(),
            uptime:        self.started_at().elapsed(),
        })
    }
}

impl<S> Debug for FeedService<S>
where
    S: FeedStore,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedService")
            .field("initialized", &self.is_initialized())
            .field("config", self.config())
            .finish()
    }
}
