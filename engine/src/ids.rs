use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Strips the fragment and any trailing slash so the same story fetched from
/// two outlets hashes to the same key.
pub fn canonicalize_url(mut url: url::Url) -> url::Url {
    url.set_fragment(None);
    if url.path().ends_with('/') && url.path() != "/" {
        let trimmed = url.path().trim_end_matches('/').to_string();
        url.set_path(&trimmed);
    }
    url
}

fn digest_hex(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

pub fn article_id(canonical_url: &url::Url) -> String {
    digest_hex(&[canonical_url.as_str()])
}

/// Fallback for entries without a usable link.
pub fn article_id_fallback(
    source_id: &str,
    title: &str,
    published_at: DateTime<Utc>,
) -> String {
    digest_hex(&[source_id, title, &published_at.timestamp().to_string()])
}

/// Hash of the sorted member id list; invariant under input permutation.
pub fn group_id(member_ids: &[String]) -> String {
    let mut sorted: Vec<&str> = member_ids.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    digest_hex(&sorted)
}

pub fn summary_id(group_id: &str, generation: u32) -> String {
    digest_hex(&[group_id, &generation.to_string()])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_url_drops_fragment_and_trailing_slash() {
        let url = url::Url::parse("https://example.com/story/path/#section").unwrap();
        assert_eq!(
            canonicalize_url(url).as_str(),
            "https://example.com/story/path"
        );

        let root = url::Url::parse("https://example.com/").unwrap();
        assert_eq!(canonicalize_url(root).as_str(), "https://example.com/");
    }

    #[test]
    fn article_ids_are_deterministic_and_distinct() {
        let a = url::Url::parse("https://example.com/a").unwrap();
        let b = url::Url::parse("https://example.com/b").unwrap();
        assert_eq!(article_id(&a), article_id(&a));
        assert_ne!(article_id(&a), article_id(&b));
        assert!(article_id(&a).chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(article_id(&a), article_id(&a).to_lowercase());
    }

    #[test]
    fn fallback_id_separates_fields() {
        // "ab" + "c" must not collide with "a" + "bc"
        let t = Utc::now();
        assert_ne!(
            article_id_fallback("ab", "c", t),
            article_id_fallback("a", "bc", t)
        );
    }

    #[test]
    fn group_id_is_permutation_invariant() {
        let forward = vec!["aa".to_string(), "bb".to_string(), "cc".to_string()];
        let shuffled = vec!["cc".to_string(), "aa".to_string(), "bb".to_string()];
        assert_eq!(group_id(&forward), group_id(&shuffled));
        assert_ne!(group_id(&forward), group_id(&forward[..2].to_vec()));
    }

    #[test]
    fn summary_id_varies_with_generation() {
        assert_ne!(summary_id("abc", 0), summary_id("abc", 1));
        assert_eq!(summary_id("abc", 1), summary_id("abc", 1));
    }
}
