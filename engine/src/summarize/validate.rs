use regex::Regex;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::LazyLock;

use crate::config::SummarizationConfig;
use crate::models::Article;
use crate::models::summary::Citation;

/// Exact citation syntax: the bracket token is case-sensitive, the source
/// name inside is resolved case-insensitively.
static CITATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[Source: ([^\]]+)\]").expect("citation regex is valid"));

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationFailure {
    TooShort { length: usize, min: usize },
    TooLong { length: usize, max: usize },
    MissingCitations { missing: Vec<String> },
    InsufficientCitations { cited: usize, required: usize },
    CopiedSpan { phrase: String },
    TemperatureExceeded { temperature: f32, max: f32 },
}

impl ValidationFailure {
    /// Stable identifier recorded in run reports.
    pub fn code(&self) -> &'static str {
        match self {
            Self::TooShort { .. } => "too_short",
            Self::TooLong { .. } => "too_long",
            Self::MissingCitations { .. } => "missing_citations",
            Self::InsufficientCitations { .. } => "insufficient_citations",
            Self::CopiedSpan { .. } => "copied_span",
            Self::TemperatureExceeded { .. } => "temperature",
        }
    }

    /// Regeneration can fix everything except a misconfigured temperature.
    pub fn retryable(&self) -> bool {
        !matches!(self, Self::TemperatureExceeded { .. })
    }
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort { length, min } => {
                write!(f, "the summary was {length} characters, below the minimum of {min}")
            }
            Self::TooLong { length, max } => {
                write!(f, "the summary was {length} characters, above the maximum of {max}")
            }
            Self::MissingCitations { missing } => {
                write!(f, "no citation was given for {}", missing.join(", "))
            }
            Self::InsufficientCitations { cited, required } => {
                write!(f, "only {cited} distinct sources were cited, {required} are required")
            }
            Self::CopiedSpan { phrase } => {
                write!(f, "it copied the phrase \"{phrase}\" verbatim from a source article")
            }
            Self::TemperatureExceeded { temperature, max } => {
                write!(f, "temperature {temperature} exceeds the configured maximum {max}")
            }
        }
    }
}

/// Checks an attempt against every acceptance rule; returns the extracted
/// citation list when the text passes.
pub fn validate(
    text: &str,
    temperature: f32,
    articles: &[(&Article, &str)],
    config: &SummarizationConfig,
) -> Result<Vec<Citation>, ValidationFailure> {
    let length = text.chars().count();
    if length < config.min_summary_length {
        return Err(ValidationFailure::TooShort {
            length,
            min: config.min_summary_length,
        });
    }
    if length > config.max_summary_length {
        return Err(ValidationFailure::TooLong {
            length,
            max: config.max_summary_length,
        });
    }

    let citations = extract_citations(text, articles);
    let group_sources: Vec<&str> = {
        let mut names: Vec<&str> = articles.iter().map(|(_, name)| *name).collect();
        names.sort_unstable();
        names.dedup();
        names
    };
    match config.required_citation_coverage {
        None => {
            let missing: Vec<String> = group_sources
                .iter()
                .filter(|name| !citations.iter().any(|c| c.source_name == **name))
                .map(|name| (*name).to_string())
                .collect();
            if !missing.is_empty() {
                return Err(ValidationFailure::MissingCitations { missing });
            }
        }
        Some(coverage) => {
            let required = coverage.min(group_sources.len());
            if citations.len() < required {
                return Err(ValidationFailure::InsufficientCitations {
                    cited: citations.len(),
                    required,
                });
            }
        }
    }

    if let Some(phrase) = copied_span(
        text,
        articles.iter().map(|(article, _)| article.content.as_str()),
        config.min_copied_span,
    ) {
        return Err(ValidationFailure::CopiedSpan { phrase });
    }

    if temperature > config.max_temperature {
        return Err(ValidationFailure::TemperatureExceeded {
            temperature,
            max: config.max_temperature,
        });
    }

    Ok(citations)
}

/// All `[Source: <name>]` occurrences resolved against the group's sources.
/// Unknown names are dropped rather than counted toward coverage. One entry
/// per cited source, ascending by name.
pub fn extract_citations(text: &str, articles: &[(&Article, &str)]) -> Vec<Citation> {
    let mut mentions: BTreeMap<&str, usize> = BTreeMap::new();
    for capture in CITATION.captures_iter(text) {
        let cited = capture[1].trim().to_lowercase();
        let known = articles
            .iter()
            .map(|(_, name)| *name)
            .find(|name| name.to_lowercase() == cited);
        if let Some(name) = known {
            *mentions.entry(name).or_default() += 1;
        }
    }

    mentions
        .into_iter()
        .map(|(name, count)| {
            let mut article_ids: Vec<String> = articles
                .iter()
                .filter(|(_, source)| *source == name)
                .map(|(article, _)| article.id.clone())
                .collect();
            article_ids.sort_unstable();
            Citation {
                source_name: name.to_string(),
                article_ids,
                mentions: count,
            }
        })
        .collect()
}

/// First run of `span_words` consecutive words shared verbatim with any
/// source body, compared case-insensitively on whitespace-normalized tokens.
pub fn copied_span<'a>(
    text: &str,
    bodies: impl Iterator<Item = &'a str>,
    span_words: usize,
) -> Option<String> {
    if span_words == 0 {
        return None;
    }
    let mut seen: HashSet<String> = HashSet::new();
    for body in bodies {
        let words = normalized_words(body);
        for window in words.windows(span_words) {
            seen.insert(window.join(" "));
        }
    }
    if seen.is_empty() {
        return None;
    }

    let words = normalized_words(text);
    words
        .windows(span_words)
        .map(|window| window.join(" "))
        .find(|candidate| seen.contains(candidate))
}

fn normalized_words(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|word| word.to_lowercase())
        .collect()
}
