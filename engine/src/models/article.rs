use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A normalized news item. Immutable once built; every later stage refers to
/// it by `id`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Article {
    /// Lowercase hex digest of the canonical URL (or the source/title/time
    /// fallback tuple when no usable link exists).
    pub id: String,
    pub source_id: String,
    pub title: String,
    pub url: String,
    pub author: Option<String>,
    pub published_at: DateTime<Utc>,
    /// Plain text with paragraph boundaries preserved as blank lines.
    pub content: String,
    pub fetched_at: DateTime<Utc>,
}
