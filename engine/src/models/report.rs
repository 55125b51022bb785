use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{Article, Group, Summary};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorKind {
    LoadedLanguage,
    Attribution,
    Framing,
    Omission,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

/// A single matched bias rule instance. Append-only; attached to an article
/// by id.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BiasIndicator {
    pub article_id: String,
    pub kind: IndicatorKind,
    /// The token or pattern text that matched.
    pub matched: String,
    /// Up to 120 characters surrounding the match.
    pub context: String,
    pub confidence: Confidence,
    pub weight: f64,
}

/// Per-run bias aggregates. Deterministic from the inputs.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TransparencyReport {
    pub total_indicators: usize,
    pub by_kind: BTreeMap<IndicatorKind, usize>,
    /// Ascending by source id.
    pub per_source: Vec<SourceBias>,
    /// Articles whose aggregate score met the per-article threshold,
    /// descending by score then ascending by id.
    pub flagged_articles: Vec<FlaggedArticle>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SourceBias {
    pub source_id: String,
    pub articles: usize,
    pub indicators: usize,
    pub mean_indicators_per_article: f64,
    /// Most frequently matched tokens, descending by count then ascending
    /// alphabetically. At most five.
    pub top_tokens: Vec<(String, usize)>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlaggedArticle {
    pub article_id: String,
    pub score: f64,
    /// Score per 1000 characters of body text.
    pub score_per_kchar: f64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StageCounts {
    pub sources_configured: usize,
    pub sources_fetched: usize,
    pub sources_failed: usize,
    pub articles_ingested: usize,
    pub articles_grouped: usize,
    pub articles_ungrouped: usize,
    pub groups_formed: usize,
    pub summaries_generated: usize,
    pub summaries_failed: usize,
    pub groups_ineligible: usize,
    pub indicators_found: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GroupFailure {
    pub group_id: String,
    pub reason: String,
}

/// One per pipeline invocation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Set when the run deadline expired and later stages were skipped.
    pub partial: bool,
    pub counts: StageCounts,
    pub bias: TransparencyReport,
    pub failures: Vec<GroupFailure>,
}

/// The handoff envelope for the persistence collaborator, serialized as one
/// JSON artifact per run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunOutput {
    pub run_id: String,
    pub articles: Vec<Article>,
    pub groups: Vec<Group>,
    pub summaries: Vec<Summary>,
    pub indicators: Vec<BiasIndicator>,
    pub report: RunReport,
}
