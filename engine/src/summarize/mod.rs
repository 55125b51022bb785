pub mod prompt;
pub mod provider;
pub mod validate;

use chrono::Utc;
use futures::stream::StreamExt;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use rand::RngExt;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use crate::config::SummarizationConfig;
use crate::ids;
use crate::models::summary::ValidationStatus;
use crate::models::{Article, Group, Summary};
use provider::{Completer, CompletionError, CompletionRequest};

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const BACKOFF_JITTER_MS: u64 = 250;

#[derive(Debug)]
pub enum SummaryOutcome {
    Produced(Summary),
    Failed { group_id: String, reason: String },
    Ineligible { group_id: String, reason: String },
}

impl SummaryOutcome {
    pub fn group_id(&self) -> &str {
        match self {
            Self::Produced(summary) => &summary.group_id,
            Self::Failed { group_id, .. } | Self::Ineligible { group_id, .. } => group_id,
        }
    }
}

/// Generates one validated summary per eligible group, retrying bounded
/// times on validation failure. The provider-level token bucket is the only
/// throttle shared across workers.
pub struct Summarizer {
    completer: Arc<dyn Completer>,
    limiter: Arc<DefaultDirectRateLimiter>,
    config: SummarizationConfig,
}

impl Summarizer {
    pub fn new(completer: Arc<dyn Completer>, config: SummarizationConfig) -> Self {
        let per_minute = NonZeroU32::new(config.requests_per_minute.max(1))
            .unwrap_or(NonZeroU32::MIN);
        Self {
            completer,
            limiter: Arc::new(RateLimiter::direct(Quota::per_minute(per_minute))),
            config,
        }
    }

    /// Summarizes groups concurrently and reassembles the outcomes in group
    /// id order, so completion order never leaks into the artifact.
    #[tracing::instrument(skip_all, fields(groups = groups.len()))]
    pub async fn summarize_all(
        &self,
        groups: &[Group],
        articles: &[Article],
        source_names: &HashMap<String, String>,
    ) -> Vec<SummaryOutcome> {
        let by_id: HashMap<&str, &Article> = articles
            .iter()
            .map(|article| (article.id.as_str(), article))
            .collect();

        let mut outcomes: Vec<SummaryOutcome> = futures::stream::iter(groups)
            .map(|group| self.summarize_group(group, &by_id, source_names))
            .buffer_unordered(self.config.max_concurrent_summaries.max(1))
            .collect()
            .await;
        outcomes.sort_by(|a, b| a.group_id().cmp(b.group_id()));
        outcomes
    }

    async fn summarize_group(
        &self,
        group: &Group,
        articles_by_id: &HashMap<&str, &Article>,
        source_names: &HashMap<String, String>,
    ) -> SummaryOutcome {
        if group.source_ids.len() < self.config.min_distinct_sources {
            tracing::info!(
                group = %group.id,
                sources = group.source_ids.len(),
                "Group is ineligible for summarization"
            );
            return SummaryOutcome::Ineligible {
                group_id: group.id.clone(),
                reason: format!(
                    "only {} distinct sources, {} required",
                    group.source_ids.len(),
                    self.config.min_distinct_sources
                ),
            };
        }

        let members: Vec<(&Article, &str)> = group
            .member_ids
            .iter()
            .filter_map(|id| articles_by_id.get(id.as_str()))
            .map(|article| {
                let name = source_names
                    .get(&article.source_id)
                    .map(String::as_str)
                    .unwrap_or(article.source_id.as_str());
                (*article, name)
            })
            .collect();

        let base_prompt = prompt::build(&members, &self.config);
        tracing::debug!(group = %group.id, template = prompt::PROMPT_VERSION, "Prompt built");

        let mut request = CompletionRequest {
            model: self.config.model.clone(),
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            prompt: base_prompt.clone(),
        };

        let mut last_reason = String::new();
        for attempt in 0..=self.config.max_retries {
            let text = match self.call_with_backoff(&request).await {
                Ok(text) => text,
                Err(err) => {
                    tracing::warn!(group = %group.id, %err, "Summary generation aborted");
                    return SummaryOutcome::Failed {
                        group_id: group.id.clone(),
                        reason: err.code().to_string(),
                    };
                }
            };

            match validate::validate(&text, request.temperature, &members, &self.config) {
                Ok(citations) => {
                    return SummaryOutcome::Produced(Summary {
                        id: ids::summary_id(&group.id, attempt),
                        group_id: group.id.clone(),
                        text,
                        citations,
                        model: self.config.model.clone(),
                        temperature: request.temperature,
                        prompt_version: prompt::PROMPT_VERSION.to_string(),
                        retries: attempt,
                        validation: if attempt == 0 {
                            ValidationStatus::Accepted
                        } else {
                            ValidationStatus::AcceptedAfterRetry
                        },
                        created_at: Utc::now(),
                    });
                }
                Err(violation) => {
                    tracing::warn!(
                        group = %group.id,
                        attempt,
                        reason = violation.code(),
                        "Summary attempt rejected"
                    );
                    last_reason = violation.code().to_string();
                    if !violation.retryable() {
                        break;
                    }
                    request.prompt = prompt::refine(&base_prompt, &violation);
                }
            }
        }

        SummaryOutcome::Failed {
            group_id: group.id.clone(),
            reason: last_reason,
        }
    }

    /// One generation attempt. Transient provider errors are retried with
    /// exponential backoff and jitter; permanent and quota errors are
    /// returned to the caller unchanged.
    async fn call_with_backoff(
        &self,
        request: &CompletionRequest,
    ) -> Result<String, CompletionError> {
        let timeout = self.config.llm_timeout();
        let mut delay = INITIAL_BACKOFF;
        let mut attempt = 0u32;
        loop {
            self.limiter.until_ready().await;
            let err = match tokio::time::timeout(timeout, self.completer.complete(request)).await {
                Ok(Ok(text)) => return Ok(text),
                Ok(Err(err)) => err,
                Err(_) => {
                    CompletionError::Transient(format!("completion exceeded {timeout:?}"))
                }
            };
            if !err.is_transient() || attempt >= self.config.max_retries {
                return Err(err);
            }
            attempt += 1;
            let jitter = Duration::from_millis(rand::rng().random_range(0..BACKOFF_JITTER_MS));
            tracing::warn!(%err, attempt, ?delay, "Transient provider error, backing off");
            tokio::time::sleep(delay + jitter).await;
            delay *= 2;
        }
    }
}
