//! The `get-or-fetch` path every data access goes through.
//!
//! On a hit the fetch function is never called. On a miss it is called once, and a present result is stored with the
//! caller's options before being returned. A failing or timed out fetch leaves nothing behind in the cache.
//!
//! A forced refresh skips the lookup and always fetches, overwriting the entry on success.
//!
//! Concurrent misses for the same key are not coalesced: each caller runs its own fetch and the last `set()` wins.
//! Likewise a fetch started before a segment invalidation may store its, by then stale, result after the invalidation
//! has happened. Such an entry lives until its TTL runs out.

use std::future::Future;

use tracing::debug;
use tracing::instrument;
use tracing::warn;

use crate::cache::SegmentedCache;
use crate::error::CacheError;
use crate::types::CacheOptions;

impl<V> SegmentedCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Return the cached value for `segment/key`, or fetch, cache and return it.
    ///
    /// `Ok(None)` means the fetch found nothing; absent values are not cached.
    #[instrument(level = "trace", skip(self, fetch, options), fields(cache = %self.name()))]
    pub async fn get_with_cache<F, Fut, E>(
        &self,
        segment: &str,
        key: &str,
        fetch: F,
        options: CacheOptions,
    ) -> Result<Option<V>, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<V>, E>>,
        E: Into<CacheError>,
    {
        if let Some(value) = self.get(segment, key) {
            return Ok(Some(value));
        }

        self.fetch_and_store(segment, key, fetch, options).await
    }

    /// Like [`get_with_cache()`](Self::get_with_cache) but never serves the cached value: the fetch always runs and
    /// its present result replaces whatever `segment/key` held.
    ///
    /// A failing fetch leaves the old entry in place. Hit and miss counters are not touched.
    #[instrument(level = "trace", skip(self, fetch, options), fields(cache = %self.name()))]
    pub async fn refresh_with_cache<F, Fut, E>(
        &self,
        segment: &str,
        key: &str,
        fetch: F,
        options: CacheOptions,
    ) -> Result<Option<V>, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<V>, E>>,
        E: Into<CacheError>,
    {
        debug!(segment, key, "forced refresh");
        self.fetch_and_store(segment, key, fetch, options).await
    }

    async fn fetch_and_store<F, Fut, E>(
        &self,
        segment: &str,
        key: &str,
        fetch: F,
        options: CacheOptions,
    ) -> Result<Option<V>, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<V>, E>>,
        E: Into<CacheError>,
    {
        let fetched = if let Some(timeout) = options.timeout {
            tokio::time::timeout(timeout, fetch()).await.map_err(|_| {
                warn!(segment, key, ?timeout, "fetch timed out");
                CacheError::FetchTimeout {
                    segment: segment.to_string(),
                    key: key.to_string(),
                    timeout,
                }
            })?
        }
        else {
            fetch().await
        };

        let value = fetched.map_err(|err| {
            let err = err.into();
            debug!(segment, key, error = %err, "fetch failed");
            err
        })?;

        if let Some(ref value) = value {
            self.set(segment, key, value.clone(), options);
        }

        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::error::StoreError;

    fn cache() -> Arc<SegmentedCache<String>> {
        SegmentedCache::builder().build().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn second_call_is_served_from_cache() {
        let cache = cache();
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let fetch = move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, StoreError>(Some("value".to_string()))
        };

        let opts = CacheOptions::ttl(Duration::from_secs(10));
        assert_eq!(cache.get_with_cache("news", "k", fetch, opts).await.unwrap().as_deref(), Some("value"));
        assert_eq!(cache.get_with_cache("news", "k", fetch, opts).await.unwrap().as_deref(), Some("value"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_fetch_is_not_cached() {
        let cache = cache();
        let opts = CacheOptions::ttl(Duration::from_secs(10));

        let err = cache
            .get_with_cache("users", "id:7", || async { Err::<Option<String>, _>(StoreError::Query("down".into())) }, opts)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Store(StoreError::Query(_))));

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.segment_size("users"), None);

        let called = AtomicUsize::new(0);
        let counter = &called;
        let value = cache
            .get_with_cache(
                "users",
                "id:7",
                move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, StoreError>(Some("alice".to_string()))
                },
                opts,
            )
            .await
            .unwrap();
        assert_eq!(value.as_deref(), Some("alice"));
        assert_eq!(called.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn absent_value_is_not_cached() {
        let cache = cache();
        let opts = CacheOptions::default();
        let value = cache
            .get_with_cache("news", "id:404", || async { Ok::<Option<String>, StoreError>(None) }, opts)
            .await
            .unwrap();
        assert_eq!(value, None);
        assert_eq!(cache.stats().total_size, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_fetch_times_out_without_caching() {
        let cache = cache();
        let opts = CacheOptions::ttl(Duration::from_secs(10)).with_timeout(Some(Duration::from_millis(100)));

        let err = cache
            .get_with_cache(
                "news",
                "page:0",
                || async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<_, StoreError>(Some("late".to_string()))
                },
                opts,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, CacheError::FetchTimeout { .. }));
        assert!(err.is_fetch_failure());
        assert_eq!(cache.stats().total_size, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_value_is_refetched() {
        let cache = cache();
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let fetch = move || async move {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, StoreError>(Some(format!("v{n}")))
        };
        let opts = CacheOptions::ttl(Duration::from_secs(1));

        assert_eq!(cache.get_with_cache("news", "k", fetch, opts).await.unwrap().as_deref(), Some("v0"));
        tokio::time::advance(Duration::from_millis(1_001)).await;
        assert_eq!(cache.get_with_cache("news", "k", fetch, opts).await.unwrap().as_deref(), Some("v1"));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_bypasses_and_overwrites_entry() {
        let cache = cache();
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let fetch = move || async move {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, StoreError>(Some(format!("v{n}")))
        };
        let opts = CacheOptions::ttl(Duration::from_secs(60));

        assert_eq!(cache.get_with_cache("news", "k", fetch, opts).await.unwrap().as_deref(), Some("v0"));
        assert_eq!(cache.refresh_with_cache("news", "k", fetch, opts).await.unwrap().as_deref(), Some("v1"));
        assert_eq!(cache.get_with_cache("news", "k", fetch, opts).await.unwrap().as_deref(), Some("v1"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refresh_keeps_old_entry() {
        let cache = cache();
        let opts = CacheOptions::ttl(Duration::from_secs(60));
        cache.set("news", "k", "old".to_string(), opts);

        let err = cache
            .refresh_with_cache("news", "k", || async { Err::<Option<String>, _>(StoreError::Query("down".into())) }, opts)
            .await
            .unwrap_err();
        assert!(err.is_fetch_failure());
        assert_eq!(cache.get("news", "k").as_deref(), Some("old"));
    }
}
