pub mod embed;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use text_splitter::TextSplitter;

use crate::config::GroupingConfig;
use crate::ids;
use crate::models::group::GroupMetrics;
use crate::models::{Article, Group};
use embed::{Embedder, cosine_distance, unit_normalize};

/// Character budget for the content prefix fed to the embedding model.
const EMBED_CONTENT_CHARS: std::ops::Range<usize> = 512..768;

#[derive(Debug, Default)]
pub struct GroupedBatch {
    /// Ascending by group id.
    pub groups: Vec<Group>,
    /// Noise and size-cap overflow, ascending by article id.
    pub ungrouped_ids: Vec<String>,
    pub articles_skipped: usize,
}

/// Partitions an ingestion batch into topical groups by density clustering
/// in embedding space.
pub struct Grouper {
    embedder: Arc<dyn Embedder>,
    config: GroupingConfig,
}

impl Grouper {
    pub fn new(embedder: Arc<dyn Embedder>, config: GroupingConfig) -> Self {
        Self { embedder, config }
    }

    /// Never fails as a whole: articles that cannot be embedded are excluded
    /// and counted, and a batch may legitimately produce zero groups.
    #[tracing::instrument(skip_all, fields(articles = articles.len()))]
    pub async fn group(&self, articles: &[Article]) -> GroupedBatch {
        // Sorted-id processing keeps every later step invariant under input
        // permutation.
        let mut ordered: Vec<&Article> = articles.iter().collect();
        ordered.sort_by(|a, b| a.id.cmp(&b.id));

        let (members, vectors) = self.embed_articles(&ordered).await;
        let skipped = ordered.len() - members.len();
        if members.is_empty() {
            return GroupedBatch {
                articles_skipped: skipped,
                ..Default::default()
            };
        }

        let epsilon = self.config.epsilon();
        let clusters = density_cluster(&vectors, epsilon, self.config.min_articles_per_group);

        let mut grouped: BTreeSet<usize> = BTreeSet::new();
        let mut groups = Vec::new();
        let mut ungrouped: BTreeSet<String> = BTreeSet::new();
        for cluster in clusters {
            let (kept, overflow) = self.cap_cluster(cluster, &vectors, &members);
            for &idx in &kept {
                grouped.insert(idx);
            }
            for idx in overflow {
                ungrouped.insert(members[idx].id.clone());
            }

            let mut member_ids: Vec<String> =
                kept.iter().map(|&idx| members[idx].id.clone()).collect();
            member_ids.sort_unstable();
            let centroid = centroid(kept.iter().map(|&idx| vectors[idx].as_slice()));
            groups.push(Group {
                id: ids::group_id(&member_ids),
                member_ids,
                source_ids: Vec::new(),
                centroid,
                metrics: GroupMetrics::default(),
            });
        }

        for (idx, article) in members.iter().enumerate() {
            if !grouped.contains(&idx) {
                ungrouped.insert(article.id.clone());
            }
        }

        groups.sort_by(|a, b| a.id.cmp(&b.id));
        tracing::info!(
            groups = groups.len(),
            ungrouped = ungrouped.len(),
            skipped,
            "Grouping finished"
        );
        GroupedBatch {
            groups,
            ungrouped_ids: ungrouped.into_iter().collect(),
            articles_skipped: skipped,
        }
    }

    /// Fills perspective metrics and coverage gaps for each group.
    pub fn annotate(
        &self,
        groups: &mut [Group],
        articles: &[Article],
        enabled_sources: &[String],
    ) {
        let source_of: BTreeMap<&str, &str> = articles
            .iter()
            .map(|article| (article.id.as_str(), article.source_id.as_str()))
            .collect();

        for group in groups {
            let mut per_source: BTreeMap<String, usize> = BTreeMap::new();
            for member in &group.member_ids {
                if let Some(source) = source_of.get(member.as_str()) {
                    *per_source.entry((*source).to_string()).or_default() += 1;
                }
            }

            group.source_ids = per_source.keys().cloned().collect();
            let total = group.member_ids.len();
            let distinct = per_source.len();
            group.metrics = GroupMetrics {
                total_articles: total,
                distinct_sources: distinct,
                source_diversity: distinct as f64 / total.max(1) as f64,
                coverage_gaps: enabled_sources
                    .iter()
                    .filter(|source| !per_source.contains_key(*source))
                    .cloned()
                    .collect(),
                articles_per_source: per_source.into_iter().collect(),
            };
        }
    }

    /// Batch embedding first; on a batch error fall back to one call per
    /// article so a single bad input only excludes itself.
    async fn embed_articles<'a>(
        &self,
        ordered: &[&'a Article],
    ) -> (Vec<&'a Article>, Vec<Vec<f32>>) {
        let texts: Vec<String> = ordered.iter().map(|a| embedding_text(a)).collect();
        match self.embedder.embed(texts.clone()).await {
            Ok(vectors) if vectors.len() == ordered.len() => (ordered.to_vec(), vectors),
            Ok(_) | Err(_) => {
                tracing::warn!("Batch embedding failed, retrying articles individually");
                let mut members = Vec::new();
                let mut vectors = Vec::new();
                for (article, text) in ordered.iter().zip(texts) {
                    match self.embedder.embed(vec![text]).await {
                        Ok(mut one) if !one.is_empty() => {
                            members.push(*article);
                            vectors.push(one.remove(0));
                        }
                        Ok(_) => {}
                        Err(err) => {
                            tracing::warn!(article = %article.id, %err, "Excluding article from grouping");
                        }
                    }
                }
                (members, vectors)
            }
        }
    }

    /// Oversized clusters keep the members closest to the centroid; the
    /// overflow returns to the ungrouped pool.
    fn cap_cluster(
        &self,
        cluster: Vec<usize>,
        vectors: &[Vec<f32>],
        members: &[&Article],
    ) -> (Vec<usize>, Vec<usize>) {
        let cap = self.config.max_articles_per_group;
        if cluster.len() <= cap {
            return (cluster, Vec::new());
        }
        let center = centroid(cluster.iter().map(|&idx| vectors[idx].as_slice()));
        let mut ranked = cluster;
        ranked.sort_by(|&a, &b| {
            cosine_distance(&vectors[a], &center)
                .total_cmp(&cosine_distance(&vectors[b], &center))
                .then_with(|| members[a].id.cmp(&members[b].id))
        });
        let overflow = ranked.split_off(cap);
        (ranked, overflow)
    }
}

fn embedding_text(article: &Article) -> String {
    let splitter = TextSplitter::new(EMBED_CONTENT_CHARS);
    let prefix = splitter.chunks(&article.content).next().unwrap_or_default();
    format!("{}\n{}", article.title, prefix)
}

fn centroid<'a>(vectors: impl Iterator<Item = &'a [f32]>) -> Vec<f32> {
    let mut sum: Vec<f32> = Vec::new();
    let mut count = 0usize;
    for vector in vectors {
        if sum.is_empty() {
            sum = vec![0.0; vector.len()];
        }
        for (acc, x) in sum.iter_mut().zip(vector) {
            *acc += x;
        }
        count += 1;
    }
    if count > 0 {
        for x in &mut sum {
            *x /= count as f32;
        }
    }
    unit_normalize(sum)
}

/// Density clustering over cosine distance. A point is core when at least
/// `min_pts` points (itself included) sit within `epsilon`; clusters are the
/// connected components of core points, and border points join the cluster
/// with the closest centroid, ties broken toward the cluster holding the
/// smallest index. Points reachable from no core point are noise.
fn density_cluster(vectors: &[Vec<f32>], epsilon: f32, min_pts: usize) -> Vec<Vec<usize>> {
    let n = vectors.len();
    let neighbors: Vec<Vec<usize>> = (0..n)
        .map(|i| {
            (0..n)
                .filter(|&j| cosine_distance(&vectors[i], &vectors[j]) <= epsilon)
                .collect()
        })
        .collect();
    let core: Vec<bool> = neighbors.iter().map(|near| near.len() >= min_pts).collect();

    // Connected components over core points, walked in index order.
    let mut cluster_of: Vec<Option<usize>> = vec![None; n];
    let mut clusters: Vec<Vec<usize>> = Vec::new();
    for start in 0..n {
        if !core[start] || cluster_of[start].is_some() {
            continue;
        }
        let label = clusters.len();
        let mut pending = vec![start];
        let mut component = Vec::new();
        cluster_of[start] = Some(label);
        while let Some(point) = pending.pop() {
            component.push(point);
            for &next in &neighbors[point] {
                if core[next] && cluster_of[next].is_none() {
                    cluster_of[next] = Some(label);
                    pending.push(next);
                }
            }
        }
        component.sort_unstable();
        clusters.push(component);
    }

    // Border points: within epsilon of at least one core point.
    let centroids: Vec<Vec<f32>> = clusters
        .iter()
        .map(|cluster| centroid(cluster.iter().map(|&idx| vectors[idx].as_slice())))
        .collect();
    for point in 0..n {
        if core[point] || cluster_of[point].is_some() {
            continue;
        }
        let mut candidates: Vec<usize> = neighbors[point]
            .iter()
            .filter(|&&near| core[near])
            .filter_map(|&near| cluster_of[near])
            .collect();
        candidates.sort_unstable();
        candidates.dedup();
        let chosen = candidates.into_iter().min_by(|&a, &b| {
            cosine_distance(&vectors[point], &centroids[a])
                .total_cmp(&cosine_distance(&vectors[point], &centroids[b]))
                .then_with(|| clusters[a][0].cmp(&clusters[b][0]))
        });
        if let Some(label) = chosen {
            cluster_of[point] = Some(label);
            clusters[label].push(point);
        }
    }

    for cluster in &mut clusters {
        cluster.sort_unstable();
    }
    clusters
}
