use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::html::strip_html;
use super::{FetchContext, FetchError, Fetcher};
use crate::config::{SourceConfig, env_var};
use crate::ids;
use crate::models::Article;

/// Authenticated JSON endpoints with a per-source field mapping.
pub struct ApiFetcher;

#[async_trait]
impl Fetcher for ApiFetcher {
    async fn fetch(
        &self,
        source: &SourceConfig,
        ctx: &FetchContext<'_>,
    ) -> Result<Vec<Article>, FetchError> {
        let mut request = ctx.http.get(&source.url);
        if let Some(var) = &source.credential_env {
            let token = env_var(var).ok_or_else(|| FetchError::MissingCredential(var.clone()))?;
            request = request.bearer_auth(token);
        }

        let response = request.send().await?.error_for_status()?;
        let payload: serde_json::Value = response.json().await?;
        let items = article_array(&payload, source.response_path.as_deref())?;

        let mut articles = Vec::new();
        for item in items {
            if let Some(article) = normalize_item(ctx, source, item).await {
                articles.push(article);
            }
        }
        Ok(articles)
    }
}

/// Walks the configured dotted path down to the article array.
fn article_array<'a>(
    payload: &'a serde_json::Value,
    path: Option<&str>,
) -> Result<&'a Vec<serde_json::Value>, FetchError> {
    let mut value = payload;
    if let Some(path) = path {
        for part in path.split('.') {
            value = value.get(part).ok_or_else(|| {
                FetchError::Shape(format!("response has no field `{part}` on path `{path}`"))
            })?;
        }
    }
    value
        .as_array()
        .ok_or_else(|| FetchError::Shape("expected a JSON array of articles".to_string()))
}

async fn normalize_item(
    ctx: &FetchContext<'_>,
    source: &SourceConfig,
    item: &serde_json::Value,
) -> Option<Article> {
    let fields = &source.field_map;
    let text = |name: &str| {
        item.get(name)
            .and_then(serde_json::Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };

    let Some(title) = text(&fields.title) else {
        tracing::warn!(source = %source.id, "Skipping API item without `{}`", fields.title);
        return None;
    };

    let published_at = match item.get(&fields.published_at).and_then(parse_timestamp) {
        Some(published) => published,
        None if ctx.strict_sources => {
            tracing::debug!(source = %source.id, %title, "Skipping item without a timestamp");
            return None;
        }
        None => ctx.now,
    };
    if super::rss::too_old(ctx, published_at) {
        return None;
    }

    let link = text(&fields.url).and_then(|raw| url::Url::parse(&raw).ok());
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

    let raw_content = text(&fields.content).unwrap_or_default();
    // API payloads are usually plain text already; only strip when markup
    // is present so blank-line paragraph boundaries survive.
    let content = if raw_content.contains('<') {
        strip_html(&raw_content)
    } else {
        raw_content
    };

    let article = Article {
        id: id.clone(),
        source_id: source.id.clone(),
        title,
        url,
        author: text(&fields.author),
        published_at,
        fetched_at: ctx.now,
        content,
    };
    super::cache_put(ctx.cache, &id, &article, ctx.cache_ttl).await;
    Some(article)
}

fn parse_timestamp(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    if let Some(raw) = value.as_str() {
        return DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .ok();
    }
    value.as_i64().and_then(|secs| DateTime::from_timestamp(secs, 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn article_array_follows_dotted_path() {
        let payload = serde_json::json!({"data": {"articles": [{"title": "A"}]}});
        let items = article_array(&payload, Some("data.articles")).unwrap();
        assert_eq!(items.len(), 1);

        assert!(article_array(&payload, Some("data.missing")).is_err());
        assert!(article_array(&payload, None).is_err());
    }

    #[test]
    fn timestamps_parse_rfc3339_and_epoch() {
        let rfc = serde_json::json!("2026-07-01T10:00:00Z");
        assert!(parse_timestamp(&rfc).is_some());

        let epoch = serde_json::json!(1_780_000_000);
        assert!(parse_timestamp(&epoch).is_some());

        assert!(parse_timestamp(&serde_json::json!("yesterday")).is_none());
    }
}
