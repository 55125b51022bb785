use async_trait::async_trait;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::models::Article;

/// Cache operations get a short budget so a slow backend cannot stall a
/// fetch.
const CACHE_OP_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend unreachable: {0}")]
    Unreachable(String),

    #[error("cache operation timed out")]
    Timeout,

    #[error("cached value could not be decoded: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Shared content cache keyed by canonical-URL hash. Single-operation
/// access; no multi-key transactions. Failures never fail a fetch.
#[async_trait]
pub trait ContentCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Article>, CacheError>;
    async fn put(&self, key: &str, article: &Article, ttl: Duration) -> Result<(), CacheError>;
}

/// Builds the cache for a run: disabled entirely when the TTL is zero,
/// redis when an endpoint is configured, otherwise in-process. A bad
/// endpoint degrades to the in-process cache.
pub fn from_config(endpoint: Option<&str>, ttl: Duration) -> Arc<dyn ContentCache> {
    if ttl.is_zero() {
        tracing::info!("Content cache disabled (zero TTL)");
        return Arc::new(NoopCache);
    }
    match endpoint {
        Some(url) => match RedisCache::new(url) {
            Ok(cache) => Arc::new(cache),
            Err(err) => {
                tracing::warn!(%err, "Invalid cache endpoint, using in-process cache");
                Arc::new(MemoryCache::new())
            }
        },
        None => Arc::new(MemoryCache::new()),
    }
}

/// Caching disabled: every read misses, every write is dropped.
pub struct NoopCache;

#[async_trait]
impl ContentCache for NoopCache {
    async fn get(&self, _key: &str) -> Result<Option<Article>, CacheError> {
        Ok(None)
    }

    async fn put(&self, _key: &str, _article: &Article, _ttl: Duration) -> Result<(), CacheError> {
        Ok(())
    }
}

pub struct MemoryCache {
    inner: Arc<retainer::Cache<String, Article>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        let inner = Arc::new(retainer::Cache::new());
        let monitor = inner.clone();
        tokio::spawn(async move {
            monitor.monitor(4, 0.25, Duration::from_secs(3)).await;
        });
        Self { inner }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContentCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Article>, CacheError> {
        Ok(self
            .inner
            .get(&key.to_string())
            .await
            .map(|guard| (*guard).clone()))
    }

    async fn put(&self, key: &str, article: &Article, ttl: Duration) -> Result<(), CacheError> {
        self.inner.insert(key.to_string(), article.clone(), ttl).await;
        Ok(())
    }
}

/// Redis-backed cache. The connection is established per operation inside
/// the operation timeout, so an unreachable backend surfaces as one warning
/// per operation rather than blocking startup.
pub struct RedisCache {
    client: redis::Client,
}

impl RedisCache {
    pub fn new(url: &str) -> Result<Self, CacheError> {
        let client =
            redis::Client::open(url).map_err(|err| CacheError::Unreachable(err.to_string()))?;
        Ok(Self { client })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, CacheError> {
        tokio::time::timeout(
            CACHE_OP_TIMEOUT,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| CacheError::Timeout)?
        .map_err(|err| CacheError::Unreachable(err.to_string()))
    }
}

#[async_trait]
impl ContentCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<Article>, CacheError> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = tokio::time::timeout(CACHE_OP_TIMEOUT, conn.get(key))
            .await
            .map_err(|_| CacheError::Timeout)?
            .map_err(|err| CacheError::Unreachable(err.to_string()))?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, article: &Article, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        let json = serde_json::to_string(article)?;
        tokio::time::timeout(
            CACHE_OP_TIMEOUT,
            conn.set_ex::<_, _, ()>(key, json, ttl.as_secs().max(1)),
        )
        .await
        .map_err(|_| CacheError::Timeout)?
        .map_err(|err| CacheError::Unreachable(err.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn article(id: &str) -> Article {
        Article {
            id: id.to_string(),
            source_id: "wire".to_string(),
            title: "Title".to_string(),
            url: format!("https://example.com/{id}"),
            author: None,
            published_at: Utc::now(),
            fetched_at: Utc::now(),
            content: "Body".to_string(),
        }
    }

    #[tokio::test]
    async fn memory_cache_round_trips() {
        let cache = MemoryCache::new();
        cache
            .put("k1", &article("a1"), Duration::from_secs(60))
            .await
            .unwrap();

        let hit = cache.get("k1").await.unwrap().unwrap();
        assert_eq!(hit.id, "a1");
        assert!(cache.get("k2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn noop_cache_accepts_writes_and_always_misses() {
        let cache = NoopCache;
        cache
            .put("k1", &article("a1"), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(cache.get("k1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_cache_expires_entries() {
        let cache = MemoryCache::new();
        cache
            .put("k1", &article("a1"), Duration::from_millis(20))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(cache.get("k1").await.unwrap().is_none());
    }
}
