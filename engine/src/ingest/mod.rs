pub mod cache;
mod html;

pub mod api;
pub mod rss;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::{PipelineConfig, SourceConfig, SourceKind};
use crate::models::Article;
use cache::ContentCache;

const USER_AGENT: &str = concat!("talkless/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("feed could not be parsed: {0}")]
    Feed(#[from] feed_rs::parser::ParseFeedError),

    #[error("unexpected response shape: {0}")]
    Shape(String),

    #[error("credential variable `{0}` is not set")]
    MissingCredential(String),

    #[error("source fetch exceeded {0:?}")]
    Timeout(Duration),

    #[error("no fetcher registered for {0:?} sources")]
    Unhandled(SourceKind),
}

/// One source kind's fetch strategy. Implementations are injected at
/// orchestrator construction, like the completer, embedder and cache.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(
        &self,
        source: &SourceConfig,
        ctx: &FetchContext<'_>,
    ) -> Result<Vec<Article>, FetchError>;
}

/// The built-in fetchers, one per source kind.
pub fn default_fetchers() -> HashMap<SourceKind, Arc<dyn Fetcher>> {
    HashMap::from([
        (SourceKind::Rss, Arc::new(rss::RssFetcher) as Arc<dyn Fetcher>),
        (SourceKind::Api, Arc::new(api::ApiFetcher) as Arc<dyn Fetcher>),
    ])
}

/// Per-source pacing. Keys wait independently; the map lock is held only to
/// read or stamp the next allowed instant, never across a sleep. The stamp
/// is taken when the request is issued, not when it completes.
pub struct SourceLimiter {
    next_allowed: Mutex<HashMap<String, Instant>>,
}

impl SourceLimiter {
    fn new() -> Self {
        Self {
            next_allowed: Mutex::new(HashMap::new()),
        }
    }

    pub async fn acquire(&self, key: &str, interval: Duration) {
        loop {
            let sleep_for = {
                let mut guard = self.next_allowed.lock().await;
                let now = Instant::now();
                match guard.get(key) {
                    Some(next) if *next > now => Some(*next - now),
                    _ => {
                        guard.insert(key.to_string(), now + interval);
                        None
                    }
                }
            };

            match sleep_for {
                Some(duration) => tokio::time::sleep(duration).await,
                None => break,
            }
        }
    }
}

/// Borrowed view of everything a single source fetch needs.
pub struct FetchContext<'a> {
    pub http: &'a reqwest::Client,
    pub cache: &'a dyn ContentCache,
    pub cache_ttl: Duration,
    pub max_age: chrono::Duration,
    pub strict_sources: bool,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct IngestBatch {
    pub articles: Vec<Article>,
    pub sources_fetched: usize,
    pub sources_failed: usize,
}

/// Owns in-flight fetch state and the cache handle for the run.
pub struct Ingestor {
    http: reqwest::Client,
    cache: Arc<dyn ContentCache>,
    fetchers: HashMap<SourceKind, Arc<dyn Fetcher>>,
    limiter: SourceLimiter,
    max_concurrent_fetches: usize,
    fetch_timeout: Duration,
    cache_ttl: Duration,
    max_age: chrono::Duration,
    strict_sources: bool,
}

impl Ingestor {
    pub fn new(pipeline: &PipelineConfig, cache: Arc<dyn ContentCache>) -> eyre::Result<Self> {
        Self::with_fetchers(pipeline, cache, default_fetchers())
    }

    pub fn with_fetchers(
        pipeline: &PipelineConfig,
        cache: Arc<dyn ContentCache>,
        fetchers: HashMap<SourceKind, Arc<dyn Fetcher>>,
    ) -> eyre::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(pipeline.fetch_timeout())
            .build()?;
        Ok(Self {
            http,
            cache,
            fetchers,
            limiter: SourceLimiter::new(),
            max_concurrent_fetches: pipeline.max_concurrent_fetches,
            fetch_timeout: pipeline.fetch_timeout(),
            cache_ttl: pipeline.cache_ttl(),
            max_age: pipeline.max_article_age(),
            strict_sources: pipeline.strict_sources,
        })
    }

    /// Fetches every enabled source concurrently, then assembles a
    /// deduplicated batch: sources in configuration order, articles within a
    /// source ascending by publication time. A failing source contributes
    /// nothing and never aborts the batch.
    #[tracing::instrument(skip_all, fields(sources = sources.len()))]
    pub async fn fetch_all(&self, sources: &[SourceConfig]) -> IngestBatch {
        let enabled: Vec<&SourceConfig> = sources.iter().filter(|source| source.enabled).collect();

        let results: HashMap<String, Result<Vec<Article>, FetchError>> =
            futures::stream::iter(enabled.iter())
                .map(|source| async move { (source.id.clone(), self.fetch(source).await) })
                .buffer_unordered(self.max_concurrent_fetches.max(1))
                .collect()
                .await;

        let mut batch = IngestBatch::default();
        let mut seen: HashSet<String> = HashSet::new();
        for source in &enabled {
            let mut articles = match results.get(&source.id) {
                Some(Ok(articles)) => {
                    batch.sources_fetched += 1;
                    articles.clone()
                }
                Some(Err(err)) => {
                    batch.sources_failed += 1;
                    tracing::warn!(source = %source.id, %err, "Source contributed no articles");
                    continue;
                }
                None => continue,
            };
            articles.sort_by(|a, b| {
                a.published_at
                    .cmp(&b.published_at)
                    .then_with(|| a.id.cmp(&b.id))
            });
            for article in articles {
                if seen.insert(article.id.clone()) {
                    batch.articles.push(article);
                }
            }
        }

        tracing::info!(
            articles = batch.articles.len(),
            fetched = batch.sources_fetched,
            failed = batch.sources_failed,
            "Ingestion finished"
        );
        batch
    }

    /// Fetches one source, honoring its rate limit and the per-source
    /// timeout.
    pub async fn fetch(&self, source: &SourceConfig) -> Result<Vec<Article>, FetchError> {
        let fetcher = self
            .fetchers
            .get(&source.kind)
            .ok_or(FetchError::Unhandled(source.kind))?;

        self.limiter
            .acquire(&source.id, source.min_request_interval())
            .await;

        let ctx = FetchContext {
            http: &self.http,
            cache: self.cache.as_ref(),
            cache_ttl: self.cache_ttl,
            max_age: self.max_age,
            strict_sources: self.strict_sources,
            now: Utc::now(),
        };

        match tokio::time::timeout(self.fetch_timeout, fetcher.fetch(source, &ctx)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout(self.fetch_timeout)),
        }
    }
}

/// Cache reads degrade to a miss; the fetch proceeds uncached.
pub(super) async fn cache_get(cache: &dyn ContentCache, key: &str) -> Option<Article> {
    match cache.get(key).await {
        Ok(hit) => hit,
        Err(err) => {
            tracing::warn!(key, %err, "Cache read failed, continuing uncached");
            None
        }
    }
}

/// Cache writes degrade to a no-op.
pub(super) async fn cache_put(
    cache: &dyn ContentCache,
    key: &str,
    article: &Article,
    ttl: Duration,
) {
    if let Err(err) = cache.put(key, article, ttl).await {
        tracing::warn!(key, %err, "Cache write failed, continuing uncached");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FieldMap;
    use async_trait::async_trait;
    use cache::{CacheError, MemoryCache};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn pipeline() -> PipelineConfig {
        PipelineConfig {
            max_article_age_hours: 48,
            fetch_timeout_secs: 5,
            ..Default::default()
        }
    }

    fn rss_source(id: &str, url: String) -> SourceConfig {
        SourceConfig {
            id: id.to_string(),
            name: id.to_uppercase(),
            kind: SourceKind::Rss,
            url,
            credential_env: None,
            declared_lean: None,
            enabled: true,
            requests_per_minute: 0,
            response_path: None,
            field_map: FieldMap::default(),
        }
    }

    fn rss_body(items: &[(&str, &str, Option<chrono::DateTime<Utc>>)]) -> String {
        let items: String = items
            .iter()
            .map(|(title, link, published)| {
                let date = published
                    .map(|dt| format!("<pubDate>{}</pubDate>", dt.to_rfc2822()))
                    .unwrap_or_default();
                format!("<item><title>{title}</title><link>{link}</link>{date}<description>&lt;p&gt;Body of {title}.&lt;/p&gt;</description></item>")
            })
            .collect();
        format!(
            "<?xml version=\"1.0\"?><rss version=\"2.0\"><channel><title>Feed</title>{items}</channel></rss>"
        )
    }

    struct FailingCache;

    #[async_trait]
    impl ContentCache for FailingCache {
        async fn get(&self, _key: &str) -> Result<Option<Article>, CacheError> {
            Err(CacheError::Unreachable("test backend down".to_string()))
        }

        async fn put(
            &self,
            _key: &str,
            _article: &Article,
            _ttl: Duration,
        ) -> Result<(), CacheError> {
            Err(CacheError::Unreachable("test backend down".to_string()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn limiter_spaces_requests_per_key() {
        let limiter = SourceLimiter::new();
        let interval = Duration::from_secs(10);

        let started = Instant::now();
        limiter.acquire("a", interval).await;
        limiter.acquire("a", interval).await;
        assert!(started.elapsed() >= interval);

        // A different key proceeds without waiting out `a`'s interval.
        let other = Instant::now();
        limiter.acquire("b", interval).await;
        assert!(other.elapsed() < interval);
    }

    #[tokio::test]
    async fn rss_fetch_normalizes_filters_and_orders() {
        let server = MockServer::start().await;
        let now = Utc::now();
        let body = rss_body(&[
            ("Newest story", "https://example.com/new/", Some(now - chrono::Duration::hours(1))),
            ("Older story", "https://example.com/old", Some(now - chrono::Duration::hours(12))),
            ("Stale story", "https://example.com/stale", Some(now - chrono::Duration::days(30))),
            ("Undated story", "https://example.com/undated", None),
        ]);
        Mock::given(method("GET"))
            .and(path("/feed.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/rss+xml"))
            .mount(&server)
            .await;

        let ingestor = Ingestor::new(&pipeline(), Arc::new(MemoryCache::new())).unwrap();
        let sources = vec![rss_source("wire", format!("{}/feed.xml", server.uri()))];
        let batch = ingestor.fetch_all(&sources).await;

        // Stale story is age-filtered; undated survives in lenient mode.
        assert_eq!(batch.sources_fetched, 1);
        let titles: Vec<&str> = batch.articles.iter().map(|a| a.title.as_str()).collect();
        assert_eq!(titles, vec!["Older story", "Newest story", "Undated story"]);

        let newest = &batch.articles[1];
        // Canonicalized: trailing slash dropped.
        assert_eq!(newest.url, "https://example.com/new");
        assert_eq!(newest.content, "Body of Newest story.");
    }

    #[tokio::test]
    async fn strict_sources_drop_undated_entries() {
        let server = MockServer::start().await;
        let body = rss_body(&[("Undated story", "https://example.com/undated", None)]);
        Mock::given(method("GET"))
            .and(path("/feed.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/rss+xml"))
            .mount(&server)
            .await;

        let config = PipelineConfig {
            strict_sources: true,
            ..pipeline()
        };
        let ingestor = Ingestor::new(&config, Arc::new(MemoryCache::new())).unwrap();
        let batch = ingestor
            .fetch_all(&[rss_source("wire", format!("{}/feed.xml", server.uri()))])
            .await;
        assert!(batch.articles.is_empty());
    }

    #[tokio::test]
    async fn failing_source_degrades_without_poisoning_batch() {
        let server = MockServer::start().await;
        let now = Utc::now();
        Mock::given(method("GET"))
            .and(path("/ok.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                rss_body(&[("Story", "https://example.com/story", Some(now))]),
                "application/rss+xml",
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/broken.xml"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let ingestor = Ingestor::new(&pipeline(), Arc::new(MemoryCache::new())).unwrap();
        let sources = vec![
            rss_source("ok", format!("{}/ok.xml", server.uri())),
            rss_source("broken", format!("{}/broken.xml", server.uri())),
        ];
        let batch = ingestor.fetch_all(&sources).await;

        assert_eq!(batch.sources_fetched, 1);
        assert_eq!(batch.sources_failed, 1);
        assert_eq!(batch.articles.len(), 1);
    }

    #[tokio::test]
    async fn cache_failure_does_not_change_the_batch() {
        let server = MockServer::start().await;
        let now = Utc::now();
        let body = rss_body(&[
            ("One", "https://example.com/one", Some(now)),
            ("Two", "https://example.com/two", Some(now)),
        ]);
        Mock::given(method("GET"))
            .and(path("/feed.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/rss+xml"))
            .mount(&server)
            .await;
        let sources = vec![rss_source("wire", format!("{}/feed.xml", server.uri()))];

        let cached = Ingestor::new(&pipeline(), Arc::new(MemoryCache::new())).unwrap();
        let uncached = Ingestor::new(&pipeline(), Arc::new(FailingCache)).unwrap();

        let with_cache = cached.fetch_all(&sources).await;
        let without_cache = uncached.fetch_all(&sources).await;

        let ids = |batch: &IngestBatch| {
            batch
                .articles
                .iter()
                .map(|article| article.id.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(ids(&with_cache), ids(&without_cache));
    }

    #[tokio::test]
    async fn shared_story_deduplicates_across_sources() {
        let server = MockServer::start().await;
        let now = Utc::now();
        Mock::given(method("GET"))
            .and(path("/a.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                rss_body(&[("Shared", "https://example.com/shared", Some(now))]),
                "application/rss+xml",
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/b.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                // Same canonical URL modulo fragment.
                rss_body(&[("Shared", "https://example.com/shared#utm", Some(now))]),
                "application/rss+xml",
            ))
            .mount(&server)
            .await;

        let ingestor = Ingestor::new(&pipeline(), Arc::new(MemoryCache::new())).unwrap();
        let sources = vec![
            rss_source("a", format!("{}/a.xml", server.uri())),
            rss_source("b", format!("{}/b.xml", server.uri())),
        ];
        let batch = ingestor.fetch_all(&sources).await;

        assert_eq!(batch.articles.len(), 1);
        assert_eq!(batch.articles[0].source_id, "a");
    }

    #[tokio::test]
    async fn api_fetch_maps_fields_and_paths() {
        let server = MockServer::start().await;
        let recent = (Utc::now() - chrono::Duration::hours(2)).to_rfc3339();
        let payload = serde_json::json!({
            "data": {
                "articles": [
                    {
                        "headline": "Central bank raises rate",
                        "web_url": "https://example.com/rates",
                        "body": "The bank moved by a quarter point.",
                        "date": recent,
                        "byline": "A. Reporter"
                    },
                    { "web_url": "https://example.com/untitled" }
                ]
            }
        });
        Mock::given(method("GET"))
            .and(path("/v1/articles"))
            .respond_with(ResponseTemplate::new(200).set_body_json(payload))
            .mount(&server)
            .await;

        let mut source = rss_source("api", format!("{}/v1/articles", server.uri()));
        source.kind = SourceKind::Api;
        source.response_path = Some("data.articles".to_string());
        source.field_map = FieldMap {
            title: "headline".to_string(),
            url: "web_url".to_string(),
            content: "body".to_string(),
            published_at: "date".to_string(),
            author: "byline".to_string(),
        };

        let ingestor = Ingestor::new(&pipeline(), Arc::new(MemoryCache::new())).unwrap();
        let batch = ingestor.fetch_all(&[source]).await;

        // The untitled item is skipped, not fatal.
        assert_eq!(batch.articles.len(), 1);
        let article = &batch.articles[0];
        assert_eq!(article.title, "Central bank raises rate");
        assert_eq!(article.author.as_deref(), Some("A. Reporter"));
        assert_eq!(article.content, "The bank moved by a quarter point.");
    }

    #[tokio::test]
    async fn injected_fetchers_replace_the_builtin_paths() {
        struct CannedFetcher;

        #[async_trait]
        impl Fetcher for CannedFetcher {
            async fn fetch(
                &self,
                source: &SourceConfig,
                ctx: &FetchContext<'_>,
            ) -> Result<Vec<Article>, FetchError> {
                Ok(vec![Article {
                    id: "canned".to_string(),
                    source_id: source.id.clone(),
                    title: "Canned".to_string(),
                    url: "https://example.com/canned".to_string(),
                    author: None,
                    published_at: ctx.now,
                    fetched_at: ctx.now,
                    content: "Canned body.".to_string(),
                }])
            }
        }

        let fetchers: HashMap<SourceKind, Arc<dyn Fetcher>> =
            HashMap::from([(SourceKind::Rss, Arc::new(CannedFetcher) as Arc<dyn Fetcher>)]);
        let ingestor =
            Ingestor::with_fetchers(&pipeline(), Arc::new(MemoryCache::new()), fetchers).unwrap();

        let batch = ingestor
            .fetch_all(&[rss_source("wire", "https://unused.example/feed".to_string())])
            .await;
        assert_eq!(batch.articles.len(), 1);
        assert_eq!(batch.articles[0].id, "canned");

        // A kind without a registered fetcher fails that source only.
        let mut api = rss_source("api", "https://unused.example/v1".to_string());
        api.kind = SourceKind::Api;
        let batch = ingestor.fetch_all(&[api]).await;
        assert_eq!(batch.sources_failed, 1);
        assert!(batch.articles.is_empty());
    }

    #[tokio::test]
    async fn missing_credential_skips_the_source() {
        let mut source = rss_source("api", "https://example.com/v1".to_string());
        source.kind = SourceKind::Api;
        source.credential_env = Some("TALKLESS_TEST_UNSET_CREDENTIAL".to_string());

        let ingestor = Ingestor::new(&pipeline(), Arc::new(MemoryCache::new())).unwrap();
        let batch = ingestor.fetch_all(&[source]).await;
        assert_eq!(batch.sources_failed, 1);
        assert!(batch.articles.is_empty());
    }
}
