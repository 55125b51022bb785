use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A generated, citation-bearing synthesis of one group.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Summary {
    /// Derived from the group id plus the generation attempt that produced
    /// the accepted text.
    pub id: String,
    pub group_id: String,
    pub text: String,
    /// One entry per cited source, ascending by source name.
    pub citations: Vec<Citation>,
    pub model: String,
    pub temperature: f32,
    pub prompt_version: String,
    /// Regeneration attempts consumed before the text was accepted.
    pub retries: u32,
    pub validation: ValidationStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Citation {
    pub source_name: String,
    /// Group members published by that source.
    pub article_ids: Vec<String>,
    /// How many times the source is cited in the text.
    pub mentions: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Accepted,
    /// Accepted only after at least one rejected attempt.
    AcceptedAfterRetry,
}
