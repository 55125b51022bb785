use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::html::strip_html;
use super::{FetchContext, FetchError, Fetcher};
use crate::config::SourceConfig;
use crate::ids;
use crate::models::Article;

/// Feed polling: entry content comes from the feed document itself.
pub struct RssFetcher;

#[async_trait]
impl Fetcher for RssFetcher {
    async fn fetch(
        &self,
        source: &SourceConfig,
        ctx: &FetchContext<'_>,
    ) -> Result<Vec<Article>, FetchError> {
        let response = ctx.http.get(&source.url).send().await?.error_for_status()?;
        let bytes = response.bytes().await?;
        let feed = feed_rs::parser::parse(&bytes[..])?;

        let mut articles = Vec::new();
        for entry in feed.entries {
            if let Some(article) = normalize_entry(ctx, source, entry).await {
                articles.push(article);
            }
        }
        Ok(articles)
    }
}

/// One feed entry to one article. Entries that cannot be normalized are
/// skipped without poisoning the batch.
async fn normalize_entry(
    ctx: &FetchContext<'_>,
    source: &SourceConfig,
    entry: feed_rs::model::Entry,
) -> Option<Article> {
    let Some(title) = entry.title.as_ref().map(|t| t.content.trim().to_string()) else {
        tracing::warn!(source = %source.id, entry = %entry.id, "Skipping feed entry without a title");
        return None;
    };

    let published_at = match entry.published.or(entry.updated) {
        Some(published) => published,
        None if ctx.strict_sources => {
            tracing::debug!(source = %source.id, %title, "Skipping entry without a timestamp");
            return None;
        }
        None => ctx.now,
    };
    if too_old(ctx, published_at) {
        return None;
    }

    let link = entry
        .links
        .first()
        .and_then(|link| url::Url::parse(&link.href).ok());
    let (id, url) = match link {
        Some(link) => {
            let canonical = ids::canonicalize_url(link);
            (ids::article_id(&canonical), canonical.to_string())
        }
        None => (
            ids::article_id_fallback(&source.id, &title, published_at),
            source.url.clone(),
        ),
    };

    if let Some(cached) = super::cache_get(ctx.cache, &id).await {
        return Some(cached);
    }

    let body = entry
        .content
        .and_then(|content| content.body)
        .or(entry.summary.map(|summary| summary.content))
        .unwrap_or_default();
    let article = Article {
        id: id.clone(),
        source_id: source.id.clone(),
        title,
        url,
        author: entry.authors.first().map(|person| person.name.clone()),
        published_at,
        fetched_at: ctx.now,
        content: strip_html(&body),
    };
    super::cache_put(ctx.cache, &id, &article, ctx.cache_ttl).await;
    Some(article)
}

pub(super) fn too_old(ctx: &FetchContext<'_>, published_at: DateTime<Utc>) -> bool {
    ctx.now.signed_duration_since(published_at) > ctx.max_age
}
