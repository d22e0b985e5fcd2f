//! Search Module
//!
//! Retrieval primitives shared by the stores:
//! - Keyword search via SQLite FTS5 (always available)
//! - Hybrid fusion (Reciprocal Rank Fusion)
//! - Optional HNSW vector search (USearch, `vector-search` feature)

#[cfg(feature = "vector-search")]
mod vector;

#[cfg(feature = "vector-search")]
pub use vector::{VectorIndex, VectorSearchError};

use std::collections::{HashMap, HashSet};

// ============================================================================
// FTS5 QUERY SANITIZATION
// ============================================================================

/// Turn free text into a safe FTS5 MATCH expression.
///
/// FTS5 has its own query grammar (`AND`, `NEAR`, quotes, `*`); raw user text
/// routinely breaks it. We keep alphanumeric tokens, quote each one, and OR
/// them together for recall.
pub fn sanitize_fts5_query(text: &str) -> String {
    let tokens: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| t.len() > 1)
        .take(12)
        .map(|t| format!("\"{}\"", t))
        .collect();
    tokens.join(" OR ")
}

// ============================================================================
// FUSION ALGORITHMS
// ============================================================================

/// Reciprocal Rank Fusion for combining search results
///
/// score(d) = sum of 1/(k + rank(d)) across all result lists. Normalizes
/// across scoring scales and rewards items appearing in multiple lists;
/// k (typically 60) dampens the effect of high ranks.
pub fn reciprocal_rank_fusion(
    keyword_results: &[(String, f32)],
    semantic_results: &[(String, f32)],
    k: f32,
) -> Vec<(String, f32)> {
    let mut scores: HashMap<String, f32> = HashMap::new();

    for (rank, (key, _)) in keyword_results.iter().enumerate() {
        *scores.entry(key.clone()).or_default() += 1.0 / (k + rank as f32);
    }
    for (rank, (key, _)) in semantic_results.iter().enumerate() {
        *scores.entry(key.clone()).or_default() += 1.0 / (k + rank as f32);
    }

    let mut results: Vec<(String, f32)> = scores.into_iter().collect();
    results.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    results
}

/// Weighted linear combination of two normalized result lists.
pub fn linear_combination(
    keyword_results: &[(String, f32)],
    semantic_results: &[(String, f32)],
    keyword_weight: f32,
    semantic_weight: f32,
) -> Vec<(String, f32)> {
    let mut scores: HashMap<String, f32> = HashMap::new();

    let max_keyword = keyword_results.first().map(|(_, s)| *s).unwrap_or(1.0).max(0.001);
    for (key, score) in keyword_results {
        *scores.entry(key.clone()).or_default() += (score / max_keyword) * keyword_weight;
    }

    let max_semantic = semantic_results.first().map(|(_, s)| *s).unwrap_or(1.0).max(0.001);
    for (key, score) in semantic_results {
        *scores.entry(key.clone()).or_default() += (score / max_semantic) * semantic_weight;
    }

    let mut results: Vec<(String, f32)> = scores.into_iter().collect();
    results.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    results
}

// ============================================================================
// SIMILARITY
// ============================================================================

/// Cosine similarity between two vectors (0.0 when dimensions differ).
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

/// Token-overlap similarity used when the vector index is unavailable.
///
/// Dice coefficient over lowercased word sets — cheap, symmetric, and good
/// enough to decide whether two notes are about the same thing.
pub fn keyword_overlap_similarity(a: &str, b: &str) -> f32 {
    let set_a: HashSet<String> = tokenize(a);
    let set_b: HashSet<String> = tokenize(b);
    if set_a.is_empty() || set_b.is_empty() {
        return 0.0;
    }
    let shared = set_a.intersection(&set_b).count() as f32;
    (2.0 * shared) / (set_a.len() + set_b.len()) as f32
}

fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 2)
        .map(|t| t.to_lowercase())
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_fts5_query() {
        assert_eq!(sanitize_fts5_query("hello world"), "\"hello\" OR \"world\"");
        // Operators and punctuation never leak through
        let q = sanitize_fts5_query("NEAR(\"x\") AND * -- drop");
        assert!(!q.contains('*'));
        assert!(!q.contains('('));
        assert_eq!(sanitize_fts5_query("!!! ?"), "");
    }

    #[test]
    fn test_reciprocal_rank_fusion() {
        let keyword = vec![
            ("doc-1".to_string(), 0.9),
            ("doc-2".to_string(), 0.8),
            ("doc-3".to_string(), 0.7),
        ];
        let semantic = vec![
            ("doc-2".to_string(), 0.95),
            ("doc-1".to_string(), 0.85),
            ("doc-4".to_string(), 0.75),
        ];

        let results = reciprocal_rank_fusion(&keyword, &semantic, 60.0);

        // doc-1 and doc-2 appear in both, so they outrank single-list hits
        let pos = |id: &str| results.iter().position(|(k, _)| k == id).unwrap();
        assert!(pos("doc-1") < pos("doc-3"));
        assert!(pos("doc-2") < pos("doc-4"));

        for i in 1..results.len() {
            assert!(results[i - 1].1 >= results[i].1);
        }
    }

    #[test]
    fn test_rrf_with_empty_list() {
        let keyword: Vec<(String, f32)> = vec![];
        let semantic = vec![("doc-1".to_string(), 0.9)];
        let results = reciprocal_rank_fusion(&keyword, &semantic, 60.0);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "doc-1");
    }

    #[test]
    fn test_linear_combination_weights() {
        let keyword = vec![("doc-1".to_string(), 1.0)];
        let semantic = vec![("doc-2".to_string(), 1.0)];
        let results = linear_combination(&keyword, &semantic, 0.9, 0.1);
        let score = |id: &str| {
            results
                .iter()
                .find(|(k, _)| k == id)
                .map(|(_, s)| *s)
                .unwrap()
        };
        assert!(score("doc-1") > score("doc-2"));
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_keyword_overlap_similarity() {
        let a = "user prefers rust for backend services";
        let b = "backend services written in rust";
        assert!(keyword_overlap_similarity(a, b) > 0.5);
        assert!(keyword_overlap_similarity(a, "completely unrelated gardening topic") < 0.2);
        assert_eq!(keyword_overlap_similarity("", "x"), 0.0);
    }
}
