use const_format::formatcp;
use text_splitter::TextSplitter;

use super::validate::ValidationFailure;
use crate::config::SummarizationConfig;
use crate::models::Article;

const TEMPLATE_REVISION: u32 = 1;

/// Recorded on every summary and in the logs so regenerated output can be
/// traced to the exact template wording.
pub const PROMPT_VERSION: &str = formatcp!("summary-template/v{TEMPLATE_REVISION}");

/// Character budget for each article body in the payload.
const PER_ARTICLE_CHARS: std::ops::Range<usize> = 1600..2000;

/// Builds the generation prompt for one group. `articles` come paired with
/// their source display name.
pub fn build(articles: &[(&Article, &str)], config: &SummarizationConfig) -> String {
    let mut prompt = format!(
        "You are synthesizing a news summary from several outlets covering the same story.\n\
         Write one transformative summary in your own words. Do not copy sentences or long \
         phrases from any article.\n\
         Cite every substantive claim inline as [Source: <source name>], using the source \
         names exactly as given below.\n\
         Cover the perspective of each outlet, including where they disagree.\n\
         The summary must be between {min} and {max} characters long.\n\n\
         Articles:\n",
        min = config.min_summary_length,
        max = config.max_summary_length,
    );

    let splitter = TextSplitter::new(PER_ARTICLE_CHARS);
    for (article, source_name) in articles {
        let body = splitter.chunks(&article.content).next().unwrap_or_default();
        prompt.push_str(&format!(
            "---\nSource: {source_name}\nTitle: {title}\n{body}\n",
            title = article.title,
        ));
    }
    prompt.push_str("---\n\nSummary:");
    prompt
}

/// Retry prompt naming the specific violation of the previous attempt.
pub fn refine(base: &str, violation: &ValidationFailure) -> String {
    format!(
        "{base}\n\nThe previous attempt was rejected: {violation}. \
         Rewrite the summary so this does not happen again, keeping all other requirements."
    )
}
