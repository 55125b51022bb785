use serde::{Deserialize, Serialize};

/// A set of articles judged to cover the same story. Built from a single
/// ingestion batch and not persisted beyond the run output.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Group {
    /// Lowercase hex digest of the sorted member id list, so identity is
    /// stable across re-runs on identical inputs.
    pub id: String,
    /// Member article ids, ascending.
    pub member_ids: Vec<String>,
    /// Distinct source ids present in the group, ascending.
    pub source_ids: Vec<String>,
    /// Unit-length mean of the member embeddings.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub centroid: Vec<f32>,
    pub metrics: GroupMetrics,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GroupMetrics {
    pub total_articles: usize,
    pub distinct_sources: usize,
    /// distinct_sources / total_articles, in [0, 1].
    pub source_diversity: f64,
    /// Articles per source id, ascending by source id.
    pub articles_per_source: Vec<(String, usize)>,
    /// Enabled sources with no article in this group, ascending. Advisory.
    pub coverage_gaps: Vec<String>,
}
