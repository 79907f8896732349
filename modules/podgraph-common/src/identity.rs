//! Stable identity hashing.
//!
//! Every persisted node id is a content hash of the fields that define the
//! node's identity, so re-running a stage on the same inputs produces the
//! same ids and graph upserts stay idempotent under retries.

use sha2::{Digest, Sha256};

/// Normalize a string for use as a merge key: lowercase, strip punctuation
/// (keeping spaces), collapse whitespace.
///
/// ```
/// assert_eq!(podgraph_common::normalize("The  Tim Ferriss Show!"), "the tim ferriss show");
/// assert_eq!(podgraph_common::normalize("GPT-4"), "gpt 4");
/// ```
pub fn normalize(s: &str) -> String {
    let lowered = s.to_lowercase();
    let cleaned: String = lowered
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    cleaned.split_whitespace().collect::<Vec<&str>>().join(" ")
}

/// Canonical form of an entity name, used as the merge key across units.
pub fn canonical_name(name: &str) -> String {
    normalize(name)
}

/// Normalize a directory-derived podcast name to `lower_snake` form.
///
/// ```
/// assert_eq!(podgraph_common::lower_snake("My Favorite Murder"), "my_favorite_murder");
/// ```
pub fn lower_snake(name: &str) -> String {
    normalize(name).replace(' ', "_")
}

/// Full sha256 of arbitrary bytes as lowercase hex. Used for stage payload
/// hashes and embedding cache keys.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Stable 128-bit id over identity parts, rendered as 32 hex chars.
/// Parts are newline-joined so `("a", "bc")` and `("ab", "c")` differ.
pub fn stable_id(parts: &[&str]) -> String {
    let joined = parts.join("\n");
    sha256_hex(joined.as_bytes())[..32].to_string()
}

/// Episode id: stable over `(podcastId, normalized(title), publishedDate)`.
pub fn episode_id(podcast_id: &str, title: &str, published_date: &str) -> String {
    stable_id(&[podcast_id, &normalize(title), published_date])
}

/// MeaningfulUnit id: stable over `(episodeId, startSec, endSec)` at
/// millisecond precision.
pub fn unit_id(episode_id: &str, start_sec: f64, end_sec: f64) -> String {
    stable_id(&[
        episode_id,
        &format!("{start_sec:.3}"),
        &format!("{end_sec:.3}"),
    ])
}

/// Entity id: stable over `canonicalName + type`, scoped to the podcast DB
/// by virtue of living in it.
pub fn entity_id(canonical_name: &str, type_label: &str) -> String {
    stable_id(&[canonical_name, type_label])
}

/// Quote id: stable over `(unitId, normalized(text))`.
pub fn quote_id(unit_id: &str, text: &str) -> String {
    stable_id(&[unit_id, &normalize(text)])
}

/// Insight id: stable over `(unitId, normalized(title))`.
pub fn insight_id(unit_id: &str, title: &str) -> String {
    stable_id(&[unit_id, &normalize(title)])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_punctuation_and_case() {
        assert_eq!(normalize("Hello, World!"), "hello world");
        assert_eq!(normalize("  a   b  "), "a b");
        assert_eq!(normalize(""), "");
    }

    #[test]
    fn stable_ids_are_deterministic() {
        let a = episode_id("mfm", "Episode 1: The Start", "2024-01-01");
        let b = episode_id("mfm", "episode 1  the start", "2024-01-01");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn part_boundaries_matter() {
        assert_ne!(stable_id(&["a", "bc"]), stable_id(&["ab", "c"]));
    }

    #[test]
    fn unit_ids_use_millisecond_precision() {
        let a = unit_id("ep1", 1.0001, 2.0);
        let b = unit_id("ep1", 1.0004, 2.0);
        assert_eq!(a, b);
        let c = unit_id("ep1", 1.002, 2.0);
        assert_ne!(a, c);
    }

    #[test]
    fn entity_id_merges_across_case() {
        let a = entity_id(&canonical_name("OpenAI"), "Company");
        let b = entity_id(&canonical_name("openai"), "Company");
        assert_eq!(a, b);
        assert_ne!(a, entity_id(&canonical_name("openai"), "Person"));
    }
}
