use regex::{Regex, RegexBuilder};
use serde::Deserialize;

use crate::error::ConfigError;
use crate::models::report::{Confidence, IndicatorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleScope {
    Title,
    Body,
    Any,
}

/// One rule entry as written in the bias rules file.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleSpec {
    pub pattern: String,
    pub scope: Option<RuleScope>,
    pub confidence: Option<Confidence>,
    pub weight: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct BiasRulesConfig {
    pub loaded_words: Vec<RuleSpec>,
    pub attribution_patterns: Vec<RuleSpec>,
    pub framing_patterns: Vec<RuleSpec>,
    /// Indicators below this confidence stay on the articles but are kept
    /// out of the transparency report.
    pub min_confidence: Option<Confidence>,
    pub article_score_threshold: Option<f64>,
}

pub struct CompiledRule {
    pub kind: IndicatorKind,
    pub pattern: String,
    pub regex: Regex,
    pub scope: RuleScope,
    pub confidence: Confidence,
    pub weight: f64,
}

pub struct RuleSet {
    pub rules: Vec<CompiledRule>,
    pub min_confidence: Confidence,
    pub article_score_threshold: f64,
}

impl RuleSet {
    /// Rule files are a hard dependency; any pattern that fails to compile
    /// aborts the run.
    pub fn compile(config: &BiasRulesConfig) -> Result<Self, ConfigError> {
        let mut rules = Vec::new();
        for spec in &config.loaded_words {
            rules.push(compile_rule(
                spec,
                IndicatorKind::LoadedLanguage,
                Confidence::Medium,
                literal_phrase_regex(&spec.pattern),
            )?);
        }
        for spec in &config.attribution_patterns {
            rules.push(compile_rule(
                spec,
                IndicatorKind::Attribution,
                Confidence::Medium,
                pattern_regex(&spec.pattern),
            )?);
        }
        for spec in &config.framing_patterns {
            rules.push(compile_rule(
                spec,
                IndicatorKind::Framing,
                Confidence::Low,
                pattern_regex(&spec.pattern),
            )?);
        }
        Ok(Self {
            rules,
            min_confidence: config.min_confidence.unwrap_or(Confidence::Low),
            article_score_threshold: config.article_score_threshold.unwrap_or(3.0),
        })
    }
}

fn compile_rule(
    spec: &RuleSpec,
    kind: IndicatorKind,
    default_confidence: Confidence,
    regex: Result<Regex, regex::Error>,
) -> Result<CompiledRule, ConfigError> {
    let regex = regex.map_err(|source| ConfigError::InvalidRule {
        pattern: spec.pattern.clone(),
        source,
    })?;
    Ok(CompiledRule {
        kind,
        pattern: spec.pattern.clone(),
        regex,
        scope: spec.scope.unwrap_or(RuleScope::Any),
        confidence: spec.confidence.unwrap_or(default_confidence),
        weight: spec.weight.unwrap_or(1.0),
    })
}

/// Literal token or multi-word phrase, matched case-insensitively on word
/// boundaries. Whitespace in the phrase matches any run of whitespace.
fn literal_phrase_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let words: Vec<String> = pattern
        .split_whitespace()
        .map(|word| regex::escape(word))
        .collect();
    RegexBuilder::new(&format!(r"\b{}\b", words.join(r"\s+")))
        .case_insensitive(true)
        .build()
}

/// Attribution and framing entries are regular expressions as written.
fn pattern_regex(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern).case_insensitive(true).build()
}
