//! Cross-shard result merging.
//!
//! Shards are searched independently, so the same record id can come back
//! from more than one result set (for example while a record is between
//! tiers). The first occurrence wins: result sets are consumed in the order
//! given and later duplicates are discarded even if they score higher.

use super::types::{sort_by_similarity, SearchHit};
use std::collections::HashSet;

/// Flattens `result_sets`, deduplicates by `record_id` (first seen wins),
/// drops rows with an empty id or a NaN similarity, sorts by similarity
/// descending, and truncates to `limit`.
pub fn merge(result_sets: Vec<Vec<SearchHit>>, limit: usize) -> Vec<SearchHit> {
    if limit == 0 {
        return Vec::new();
    }

    let total: usize = result_sets.iter().map(Vec::len).sum();
    let mut seen: HashSet<String> = HashSet::with_capacity(total);
    let mut merged = Vec::with_capacity(total);

    for hit in result_sets.into_iter().flatten() {
        if hit.record_id.is_empty() || hit.similarity.is_nan() {
            continue;
        }
        if !seen.insert(hit.record_id.clone()) {
            continue;
        }
        merged.push(hit);
    }

    sort_by_similarity(&mut merged);
    merged.truncate(limit);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Metadata, Tier};
    use chrono::Utc;

    fn hit(id: &str, similarity: f32) -> SearchHit {
        SearchHit {
            owner_id: "owner".into(),
            record_id: id.into(),
            content_or_summary: format!("content of {id}"),
            timestamp: Utc::now(),
            metadata: Metadata::new(),
            similarity,
            tier: Tier::Hot,
        }
    }

    fn ids(hits: &[SearchHit]) -> Vec<&str> {
        hits.iter().map(|h| h.record_id.as_str()).collect()
    }

    #[test]
    fn test_first_occurrence_wins() {
        let merged = merge(
            vec![vec![hit("a", 0.9)], vec![hit("a", 0.95), hit("b", 0.5)]],
            10,
        );
        assert_eq!(ids(&merged), vec!["a", "b"]);
        assert_eq!(merged[0].similarity, 0.9);
    }

    #[test]
    fn test_sorted_descending_and_truncated() {
        let merged = merge(
            vec![
                vec![hit("a", 0.2), hit("b", 0.8)],
                vec![hit("c", 0.5)],
                vec![hit("d", 0.99), hit("e", 0.1)],
            ],
            3,
        );
        assert_eq!(ids(&merged), vec!["d", "b", "c"]);
    }

    #[test]
    fn test_drops_rows_without_score_or_id() {
        let merged = merge(vec![vec![hit("", 0.7), hit("x", f32::NAN), hit("y", 0.3)]], 10);
        assert_eq!(ids(&merged), vec!["y"]);
    }

    #[test]
    fn test_nan_duplicate_does_not_shadow_later_valid_row() {
        let merged = merge(vec![vec![hit("a", f32::NAN)], vec![hit("a", 0.4)]], 10);
        assert_eq!(ids(&merged), vec!["a"]);
        assert_eq!(merged[0].similarity, 0.4);
    }

    #[test]
    fn test_ties_keep_first_seen_order() {
        let merged = merge(vec![vec![hit("p", 0.5)], vec![hit("q", 0.5)]], 10);
        assert_eq!(ids(&merged), vec!["p", "q"]);
    }

    #[test]
    fn test_zero_limit_and_empty_input() {
        assert!(merge(vec![vec![hit("a", 0.9)]], 0).is_empty());
        assert!(merge(Vec::new(), 5).is_empty());
        assert!(merge(vec![Vec::new(), Vec::new()], 5).is_empty());
    }
}
