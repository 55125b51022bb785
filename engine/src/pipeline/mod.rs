use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::bias::BiasDetector;
use crate::bias::rules::RuleSet;
use crate::config::EngineConfig;
use crate::group::Grouper;
use crate::group::embed::FastEmbedder;
use crate::config::SourceKind;
use crate::ingest::cache::ContentCache;
use crate::ingest::{Fetcher, IngestBatch, Ingestor, default_fetchers};
use crate::models::report::{GroupFailure, RunReport, StageCounts};
use crate::models::{RunOutput, Summary};
use crate::summarize::provider::Completer;
use crate::summarize::{Summarizer, SummaryOutcome};

/// Drives the seven-stage run. Owns the per-run article/group/summary
/// aggregates and hands immutable references to each stage; no domain logic
/// lives here.
pub struct Orchestrator {
    config: EngineConfig,
    ingestor: Ingestor,
    grouper: Grouper,
    summarizer: Summarizer,
    detector: BiasDetector,
}

impl Orchestrator {
    /// Builds the production wiring. Everything that can fail here is a
    /// configuration problem and should terminate the process.
    pub fn from_config(config: EngineConfig) -> eyre::Result<Self> {
        let cache = crate::ingest::cache::from_config(
            config.pipeline.cache_endpoint.as_deref(),
            config.pipeline.cache_ttl(),
        );
        let embedder = Arc::new(FastEmbedder::new(&config.pipeline.grouping.embedding_model)?);
        let completer = crate::summarize::provider::from_config(&config.pipeline.summarization)?;
        let detector = BiasDetector::new(RuleSet::compile(&config.bias_rules)?);
        Self::new(config, cache, default_fetchers(), embedder, completer, detector)
    }

    /// Variant-injection seam: cache, fetchers, embedder and completer are
    /// chosen by the caller.
    pub fn new(
        config: EngineConfig,
        cache: Arc<dyn ContentCache>,
        fetchers: HashMap<SourceKind, Arc<dyn Fetcher>>,
        embedder: Arc<dyn crate::group::embed::Embedder>,
        completer: Arc<dyn Completer>,
        detector: BiasDetector,
    ) -> eyre::Result<Self> {
        let ingestor = Ingestor::with_fetchers(&config.pipeline, cache, fetchers)?;
        let grouper = Grouper::new(embedder, config.pipeline.grouping.clone());
        let summarizer = Summarizer::new(completer, config.pipeline.summarization.clone());
        Ok(Self {
            config,
            ingestor,
            grouper,
            summarizer,
            detector,
        })
    }

    pub fn schedule_interval(&self) -> std::time::Duration {
        self.config.pipeline.schedule_interval()
    }

    /// One pipeline invocation: fetch, detect, group, perspective,
    /// summarize, report, emit. Honors the overall deadline; whatever
    /// completed before expiry is emitted in a partial report.
    #[tracing::instrument(skip_all)]
    pub async fn run(&self) -> eyre::Result<RunOutput> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let deadline = self
            .config
            .pipeline
            .run_deadline()
            .map(|budget| tokio::time::Instant::now() + budget);
        tracing::info!(run = %run_id, "Pipeline run starting");

        let enabled: Vec<String> = self
            .config
            .sources
            .iter()
            .filter(|source| source.enabled)
            .map(|source| source.id.clone())
            .collect();
        let source_names: HashMap<String, String> = self
            .config
            .sources
            .iter()
            .map(|source| (source.id.clone(), source.name.clone()))
            .collect();

        let mut counts = StageCounts {
            sources_configured: enabled.len(),
            ..Default::default()
        };
        let mut partial = false;

        // Stage 1: fetch.
        let batch = match stage(deadline, self.ingestor.fetch_all(&self.config.sources)).await {
            Some(batch) => batch,
            None => {
                partial = true;
                IngestBatch::default()
            }
        };
        counts.sources_fetched = batch.sources_fetched;
        counts.sources_failed = batch.sources_failed;
        counts.articles_ingested = batch.articles.len();
        let articles = batch.articles;

        // Stage 2: detect. Rule matching never suspends.
        let indicators = self.detector.detect_all(&articles);
        counts.indicators_found = indicators.len();

        // Stage 3: group.
        let mut grouped = if partial {
            Default::default()
        } else {
            match stage(deadline, self.grouper.group(&articles)).await {
                Some(grouped) => grouped,
                None => {
                    partial = true;
                    Default::default()
                }
            }
        };
        counts.groups_formed = grouped.groups.len();
        counts.articles_ungrouped = grouped.ungrouped_ids.len();
        counts.articles_grouped = grouped
            .groups
            .iter()
            .map(|group| group.member_ids.len())
            .sum();

        // Stage 4: perspective.
        self.grouper.annotate(&mut grouped.groups, &articles, &enabled);

        // Stage 5: summarize.
        let outcomes = if partial {
            Vec::new()
        } else {
            match stage(
                deadline,
                self.summarizer
                    .summarize_all(&grouped.groups, &articles, &source_names),
            )
            .await
            {
                Some(outcomes) => outcomes,
                None => {
                    partial = true;
                    Vec::new()
                }
            }
        };

        let mut summaries: Vec<Summary> = Vec::new();
        let mut failures: Vec<GroupFailure> = Vec::new();
        for outcome in outcomes {
            match outcome {
                SummaryOutcome::Produced(summary) => {
                    counts.summaries_generated += 1;
                    summaries.push(summary);
                }
                SummaryOutcome::Failed { group_id, reason } => {
                    counts.summaries_failed += 1;
                    failures.push(GroupFailure { group_id, reason });
                }
                SummaryOutcome::Ineligible { group_id, reason } => {
                    counts.groups_ineligible += 1;
                    failures.push(GroupFailure { group_id, reason });
                }
            }
        }

        // Stage 6: report.
        let bias = self.detector.report(&articles, &indicators);
        let report = RunReport {
            run_id: run_id.clone(),
            started_at,
            finished_at: Utc::now(),
            partial,
            counts,
            bias,
            failures,
        };
        if partial {
            tracing::warn!(run = %run_id, "Deadline expired, emitting a partial report");
        }

        // Stage 7: emit.
        let output = RunOutput {
            run_id,
            articles,
            groups: grouped.groups,
            summaries,
            indicators,
            report,
        };
        let path = self.emit(&output).await?;
        tracing::info!(
            run = %output.run_id,
            artifact = %path.display(),
            summaries = output.summaries.len(),
            "Pipeline run finished"
        );
        Ok(output)
    }

    async fn emit(&self, output: &RunOutput) -> eyre::Result<PathBuf> {
        let dir = &self.config.pipeline.output_dir;
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("run-{}.json", output.run_id));
        let json = serde_json::to_vec_pretty(output)?;
        tokio::fs::write(&path, json).await?;
        Ok(path)
    }
}

/// Runs one stage against the shared deadline; `None` means the deadline
/// expired and the stage's in-flight work was cancelled.
async fn stage<T>(
    deadline: Option<tokio::time::Instant>,
    work: impl Future<Output = T>,
) -> Option<T> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, work).await.ok(),
        None => Some(work.await),
    }
}
