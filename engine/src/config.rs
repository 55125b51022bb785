use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bias::rules::BiasRulesConfig;
use crate::error::ConfigError;

/// Everything a run needs, loaded once at startup. The pipeline config names
/// the sources and bias-rules files; both are resolved relative to it.
#[derive(Debug)]
pub struct EngineConfig {
    pub pipeline: PipelineConfig,
    pub sources: Vec<SourceConfig>,
    pub bias_rules: BiasRulesConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub max_article_age_hours: u64,
    pub max_concurrent_fetches: usize,
    pub fetch_timeout_secs: u64,
    pub cache_ttl_secs: u64,
    /// Redis endpoint for the shared content cache. Overridden by
    /// `CACHE_URL`; absent means an in-process cache.
    pub cache_endpoint: Option<String>,
    pub output_dir: PathBuf,
    pub schedule_interval_mins: u64,
    pub run_deadline_secs: Option<u64>,
    /// Skip feed entries that carry no publication timestamp.
    pub strict_sources: bool,
    /// Unknown configuration keys become errors instead of warnings.
    pub strict_config: bool,
    pub sources_file: PathBuf,
    pub bias_rules_file: PathBuf,
    pub grouping: GroupingConfig,
    pub summarization: SummarizationConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_article_age_hours: 48,
            max_concurrent_fetches: 4,
            fetch_timeout_secs: 30,
            cache_ttl_secs: 3600,
            cache_endpoint: None,
            output_dir: PathBuf::from("runs"),
            schedule_interval_mins: 60,
            run_deadline_secs: None,
            strict_sources: false,
            strict_config: false,
            sources_file: PathBuf::from("sources.toml"),
            bias_rules_file: PathBuf::from("bias_rules.toml"),
            grouping: GroupingConfig::default(),
            summarization: SummarizationConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn max_article_age(&self) -> chrono::Duration {
        chrono::Duration::hours(self.max_article_age_hours as i64)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn schedule_interval(&self) -> Duration {
        Duration::from_secs(self.schedule_interval_mins.max(1) * 60)
    }

    pub fn run_deadline(&self) -> Option<Duration> {
        self.run_deadline_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GroupingConfig {
    /// Cosine similarity above which two articles count as neighbors.
    pub similarity_threshold: f32,
    pub min_articles_per_group: usize,
    pub max_articles_per_group: usize,
    pub embedding_model: String,
}

impl Default for GroupingConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.7,
            min_articles_per_group: 2,
            max_articles_per_group: 12,
            embedding_model: "all-minilm-l6-v2".to_string(),
        }
    }
}

impl GroupingConfig {
    /// Neighborhood radius in cosine distance.
    pub fn epsilon(&self) -> f32 {
        1.0 - self.similarity_threshold
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SummarizationConfig {
    /// `openai` or `anthropic`.
    pub provider: String,
    pub model: String,
    /// Override for OpenAI-compatible deployments.
    pub api_base: Option<String>,
    pub temperature: f32,
    pub max_temperature: f32,
    pub min_summary_length: usize,
    pub max_summary_length: usize,
    pub max_retries: u32,
    /// Distinct cited sources required. Absent means every source in the
    /// group must be cited.
    pub required_citation_coverage: Option<usize>,
    pub min_distinct_sources: usize,
    pub min_copied_span: usize,
    pub max_concurrent_summaries: usize,
    pub llm_timeout_secs: u64,
    /// Provider-level request budget shared by all summarization workers.
    pub requests_per_minute: u32,
    pub max_tokens: u32,
}

impl Default for SummarizationConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_base: None,
            temperature: 0.3,
            max_temperature: 0.3,
            min_summary_length: 400,
            max_summary_length: 2000,
            max_retries: 2,
            required_citation_coverage: None,
            min_distinct_sources: 2,
            min_copied_span: 10,
            max_concurrent_summaries: 2,
            llm_timeout_secs: 60,
            requests_per_minute: 60,
            max_tokens: 1024,
        }
    }
}

impl SummarizationConfig {
    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Rss,
    Api,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    pub name: String,
    pub kind: SourceKind,
    pub url: String,
    /// Name of the environment variable holding the credential; the value is
    /// never placed in configuration.
    pub credential_env: Option<String>,
    pub declared_lean: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_rpm")]
    pub requests_per_minute: u32,
    /// Dotted path to the article array in an API response, e.g.
    /// `data.articles`. Defaults to the response root.
    pub response_path: Option<String>,
    #[serde(default)]
    pub field_map: FieldMap,
}

impl SourceConfig {
    /// Minimum interval between request issues against this source.
    pub fn min_request_interval(&self) -> Duration {
        if self.requests_per_minute == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(60.0 / self.requests_per_minute as f64)
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_rpm() -> u32 {
    60
}

/// Field names in an API source's article objects.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FieldMap {
    pub title: String,
    pub url: String,
    pub content: String,
    pub published_at: String,
    pub author: String,
}

impl Default for FieldMap {
    fn default() -> Self {
        Self {
            title: "title".to_string(),
            url: "url".to_string(),
            content: "content".to_string(),
            published_at: "published_at".to_string(),
            author: "author".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SourcesFile {
    sources: Vec<SourceConfig>,
}

const PIPELINE_KEYS: &[&str] = &[
    "max_article_age_hours",
    "max_concurrent_fetches",
    "fetch_timeout_secs",
    "cache_ttl_secs",
    "cache_endpoint",
    "output_dir",
    "schedule_interval_mins",
    "run_deadline_secs",
    "strict_sources",
    "strict_config",
    "sources_file",
    "bias_rules_file",
    "grouping",
    "summarization",
];

const SOURCES_KEYS: &[&str] = &["sources"];

const BIAS_RULES_KEYS: &[&str] = &[
    "loaded_words",
    "attribution_patterns",
    "framing_patterns",
    "min_confidence",
    "article_score_threshold",
];

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let table = read_table(path)?;
        let strict = table
            .get("strict_config")
            .and_then(toml::Value::as_bool)
            .unwrap_or(false);
        check_keys(path, &table, PIPELINE_KEYS, strict)?;

        let mut pipeline: PipelineConfig = deserialize_table(path, table)?;
        if let Some(cache_url) = env_var("CACHE_URL") {
            pipeline.cache_endpoint = Some(cache_url);
        }

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let sources_path = base.join(&pipeline.sources_file);
        let rules_path = base.join(&pipeline.bias_rules_file);

        let sources_table = read_table(&sources_path)?;
        check_keys(&sources_path, &sources_table, SOURCES_KEYS, strict)?;
        let sources: SourcesFile = deserialize_table(&sources_path, sources_table)?;

        let rules_table = read_table(&rules_path)?;
        check_keys(&rules_path, &rules_table, BIAS_RULES_KEYS, strict)?;
        let bias_rules: BiasRulesConfig = deserialize_table(&rules_path, rules_table)?;

        Ok(Self {
            pipeline,
            sources: sources.sources,
            bias_rules,
        })
    }
}

fn read_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    raw.parse::<toml::Table>().map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn deserialize_table<T: serde::de::DeserializeOwned>(
    path: &Path,
    table: toml::Table,
) -> Result<T, ConfigError> {
    toml::Value::Table(table)
        .try_into()
        .map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

fn check_keys(
    path: &Path,
    table: &toml::Table,
    known: &[&str],
    strict: bool,
) -> Result<(), ConfigError> {
    let unknown: Vec<String> = table
        .keys()
        .filter(|key| !known.contains(&key.as_str()))
        .cloned()
        .collect();
    if unknown.is_empty() {
        return Ok(());
    }
    if strict {
        return Err(ConfigError::UnknownKeys {
            path: path.to_path_buf(),
            keys: unknown,
        });
    }
    tracing::warn!(?path, keys = ?unknown, "Ignoring unrecognized configuration keys");
    Ok(())
}

pub fn env_var(key: &str) -> Option<String> {
    match std::env::var(key) {
        Ok(value) => Some(value),
        Err(std::env::VarError::NotPresent) => None,
        Err(std::env::VarError::NotUnicode(_)) => {
            tracing::warn!("Environment variable `{key}` is not valid unicode");
            None
        }
    }
}
