pub mod rules;

use std::collections::BTreeMap;

use crate::models::Article;
use crate::models::report::{
    BiasIndicator, Confidence, FlaggedArticle, IndicatorKind, SourceBias, TransparencyReport,
};
use rules::{RuleScope, RuleSet};

const CONTEXT_SPAN_CHARS: usize = 120;
const TOP_TOKENS_PER_SOURCE: usize = 5;

/// Rule-driven detector. No learned component; every indicator traces back
/// to a configured pattern.
pub struct BiasDetector {
    rules: RuleSet,
}

impl BiasDetector {
    pub fn new(rules: RuleSet) -> Self {
        Self { rules }
    }

    /// Scans one article. Indicator order follows rule order, then match
    /// position, so repeated runs over the same text produce the same list.
    pub fn detect(&self, article: &Article) -> Vec<BiasIndicator> {
        let mut indicators = Vec::new();
        for rule in &self.rules.rules {
            match rule.kind {
                IndicatorKind::Framing => {
                    // Headline framing absent from the body.
                    if let Some(found) = rule.regex.find(&article.title)
                        && !rule.regex.is_match(&article.content)
                    {
                        indicators.push(BiasIndicator {
                            article_id: article.id.clone(),
                            kind: rule.kind,
                            matched: found.as_str().to_string(),
                            context: context_span(&article.title, found.start(), found.end()),
                            confidence: rule.confidence,
                            weight: rule.weight,
                        });
                    }
                }
                _ => {
                    for (text, scope_matches) in scoped_texts(article, rule.scope) {
                        if !scope_matches {
                            continue;
                        }
                        for found in rule.regex.find_iter(text) {
                            indicators.push(BiasIndicator {
                                article_id: article.id.clone(),
                                kind: rule.kind,
                                matched: found.as_str().to_string(),
                                context: context_span(text, found.start(), found.end()),
                                confidence: rule.confidence,
                                weight: rule.weight,
                            });
                        }
                    }
                }
            }
        }
        indicators
    }

    pub fn detect_all(&self, articles: &[Article]) -> Vec<BiasIndicator> {
        articles
            .iter()
            .flat_map(|article| self.detect(article))
            .collect()
    }

    /// Aggregates indicators at or above the configured confidence into the
    /// per-run transparency report.
    pub fn report(
        &self,
        articles: &[Article],
        indicators: &[BiasIndicator],
    ) -> TransparencyReport {
        let reportable: Vec<&BiasIndicator> = indicators
            .iter()
            .filter(|indicator| indicator.confidence >= self.rules.min_confidence)
            .collect();

        let mut by_kind: BTreeMap<IndicatorKind, usize> = BTreeMap::new();
        for indicator in &reportable {
            *by_kind.entry(indicator.kind).or_default() += 1;
        }

        // source id -> (article count, indicator count, token counts)
        let mut per_source: BTreeMap<&str, (usize, usize, BTreeMap<String, usize>)> =
            BTreeMap::new();
        let mut source_of: BTreeMap<&str, &str> = BTreeMap::new();
        for article in articles {
            source_of.insert(&article.id, &article.source_id);
            per_source.entry(&article.source_id).or_default().0 += 1;
        }
        for indicator in &reportable {
            let Some(source_id) = source_of.get(indicator.article_id.as_str()) else {
                continue;
            };
            let entry = per_source.entry(source_id).or_default();
            entry.1 += 1;
            *entry.2.entry(indicator.matched.to_lowercase()).or_default() += 1;
        }

        let per_source = per_source
            .into_iter()
            .map(|(source_id, (articles, indicators, tokens))| {
                let mut ranked: Vec<(String, usize)> = tokens.into_iter().collect();
                ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
                ranked.truncate(TOP_TOKENS_PER_SOURCE);
                SourceBias {
                    source_id: source_id.to_string(),
                    articles,
                    indicators,
                    mean_indicators_per_article: indicators as f64 / articles.max(1) as f64,
                    top_tokens: ranked,
                }
            })
            .collect();

        let mut flagged: Vec<FlaggedArticle> = articles
            .iter()
            .filter_map(|article| {
                let score: f64 = reportable
                    .iter()
                    .filter(|indicator| indicator.article_id == article.id)
                    .map(|indicator| indicator.weight)
                    .sum();
                (score >= self.rules.article_score_threshold).then(|| FlaggedArticle {
                    article_id: article.id.clone(),
                    score,
                    score_per_kchar: score * 1000.0 / article.content.chars().count().max(1) as f64,
                })
            })
            .collect();
        flagged.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.article_id.cmp(&b.article_id))
        });

        TransparencyReport {
            total_indicators: reportable.len(),
            by_kind,
            per_source,
            flagged_articles: flagged,
        }
    }

    /// Sum of indicator weights for one article.
    pub fn article_score(indicators: &[BiasIndicator], article_id: &str) -> f64 {
        indicators
            .iter()
            .filter(|indicator| indicator.article_id == article_id)
            .map(|indicator| indicator.weight)
            .sum()
    }
}

fn scoped_texts(article: &Article, scope: RuleScope) -> [(&str, bool); 2] {
    let title = matches!(scope, RuleScope::Title | RuleScope::Any);
    let body = matches!(scope, RuleScope::Body | RuleScope::Any);
    [(article.title.as_str(), title), (article.content.as_str(), body)]
}

/// A window of at most `CONTEXT_SPAN_CHARS` characters around the match,
/// clamped to char boundaries.
fn context_span(text: &str, start: usize, end: usize) -> String {
    let match_chars = text[start..end].chars().count();
    let budget = CONTEXT_SPAN_CHARS.saturating_sub(match_chars) / 2;

    let head = &text[..start];
    let skip = head.chars().count().saturating_sub(budget);
    let prefix_start = head
        .char_indices()
        .nth(skip)
        .map(|(idx, _)| idx)
        .unwrap_or(start);

    let tail = &text[end..];
    let suffix_end = end
        + tail
            .char_indices()
            .nth(budget)
            .map(|(idx, _)| idx)
            .unwrap_or(tail.len());

    text[prefix_start..suffix_end].trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rules::{BiasRulesConfig, RuleSpec};

    fn article(id: &str, source: &str, title: &str, content: &str) -> Article {
        Article {
            id: id.to_string(),
            source_id: source.to_string(),
            title: title.to_string(),
            url: format!("https://example.com/{id}"),
            author: None,
            published_at: Utc::now(),
            fetched_at: Utc::now(),
            content: content.to_string(),
        }
    }

    fn spec(pattern: &str) -> RuleSpec {
        RuleSpec {
            pattern: pattern.to_string(),
            scope: None,
            confidence: None,
            weight: None,
        }
    }

    fn detector(config: BiasRulesConfig) -> BiasDetector {
        BiasDetector::new(RuleSet::compile(&config).unwrap())
    }

    #[test]
    fn loaded_language_match_carries_context_and_weight() {
        let detector = detector(BiasRulesConfig {
            loaded_words: vec![RuleSpec {
                weight: Some(1.0),
                ..spec("slammed")
            }],
            ..Default::default()
        });
        let article = article(
            "a1",
            "reuters",
            "Committee reacts",
            "The senator slammed the proposal during the evening session.",
        );

        let indicators = detector.detect(&article);
        assert_eq!(indicators.len(), 1);
        assert_eq!(indicators[0].kind, IndicatorKind::LoadedLanguage);
        assert_eq!(indicators[0].matched, "slammed");
        assert!(indicators[0].context.contains("slammed the proposal"));
        assert_eq!(indicators[0].confidence, Confidence::Medium);
        assert!(BiasDetector::article_score(&indicators, "a1") >= 1.0);
    }

    #[test]
    fn attribution_pattern_matches_weak_sourcing() {
        let detector = detector(BiasRulesConfig {
            attribution_patterns: vec![spec(r"sources\s+say")],
            ..Default::default()
        });
        let article = article("a1", "wire", "Title", "Sources say the deal is close.");
        let indicators = detector.detect(&article);
        assert_eq!(indicators.len(), 1);
        assert_eq!(indicators[0].kind, IndicatorKind::Attribution);
    }

    #[test]
    fn framing_flags_headline_only_superlatives() {
        let detector = detector(BiasRulesConfig {
            framing_patterns: vec![spec(r"\bshocking\b")],
            ..Default::default()
        });

        let headline_only = article("a1", "wire", "Shocking result", "A result was published.");
        assert_eq!(detector.detect(&headline_only).len(), 1);

        let backed_by_body = article(
            "a2",
            "wire",
            "Shocking result",
            "Observers called the result shocking.",
        );
        assert!(detector.detect(&backed_by_body).is_empty());
    }

    #[test]
    fn detection_is_deterministic() {
        let detector = detector(BiasRulesConfig {
            loaded_words: vec![spec("outrage"), spec("slammed")],
            attribution_patterns: vec![spec(r"some\s+believe")],
            ..Default::default()
        });
        let article = article(
            "a1",
            "wire",
            "Outrage builds",
            "Some believe the outrage is overstated; critics slammed it anyway.",
        );

        let first = detector.detect(&article);
        let second = detector.detect(&article);
        let summarize = |list: &[BiasIndicator]| {
            list.iter()
                .map(|i| (i.kind, i.matched.clone(), i.context.clone()))
                .collect::<Vec<_>>()
        };
        assert_eq!(summarize(&first), summarize(&second));
        // "outrage" hits the title and the body, the other rules once each.
        assert_eq!(first.len(), 4);
    }

    #[test]
    fn report_filters_below_min_confidence_but_detect_does_not() {
        let detector = detector(BiasRulesConfig {
            loaded_words: vec![spec("slammed")],
            framing_patterns: vec![spec(r"\bshocking\b")],
            min_confidence: Some(Confidence::Medium),
            ..Default::default()
        });
        let articles = vec![article(
            "a1",
            "wire",
            "Shocking vote",
            "The chair slammed the amendment.",
        )];

        let indicators = detector.detect_all(&articles);
        assert_eq!(indicators.len(), 2);

        let report = detector.report(&articles, &indicators);
        assert_eq!(report.total_indicators, 1);
        assert_eq!(report.by_kind.get(&IndicatorKind::LoadedLanguage), Some(&1));
        assert_eq!(report.by_kind.get(&IndicatorKind::Framing), None);
    }

    #[test]
    fn report_aggregates_per_source_and_flags_articles() {
        let detector = detector(BiasRulesConfig {
            loaded_words: vec![spec("slammed"), spec("outrage")],
            article_score_threshold: Some(2.0),
            ..Default::default()
        });
        let articles = vec![
            article("a1", "wire", "T", "Critics slammed it. Outrage followed."),
            article("a2", "wire", "T", "A quiet day in parliament."),
            article("a3", "paper", "T", "Nothing loaded here."),
        ];

        let indicators = detector.detect_all(&articles);
        let report = detector.report(&articles, &indicators);

        assert_eq!(report.per_source.len(), 2);
        let wire = report
            .per_source
            .iter()
            .find(|s| s.source_id == "wire")
            .unwrap();
        assert_eq!(wire.articles, 2);
        assert_eq!(wire.indicators, 2);
        assert_eq!(wire.mean_indicators_per_article, 1.0);
        assert_eq!(wire.top_tokens[0].1, 1);

        assert_eq!(report.flagged_articles.len(), 1);
        assert_eq!(report.flagged_articles[0].article_id, "a1");
        assert_eq!(report.flagged_articles[0].score, 2.0);
    }
}
