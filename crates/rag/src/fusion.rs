//! Reciprocal rank fusion and fusion metrics.
//!
//! RRF(d) = Σ 1/(k + rank_i(d)) over the variant result lists that contain d,
//! with 1-indexed ranks. k = 60 per Cormack et al.; deployments may configure
//! 30. Pure functions: result lists in, merged list and metrics out.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::{RetrieverTag, SearchResult};

/// Metrics for a multi-variant fusion retrieval.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FusionMetrics {
    pub fusion_used: bool,
    pub num_queries: usize,
    pub per_query_result_counts: Vec<usize>,
    /// Unique ids in the first variant only.
    pub unique_docs_before_fusion: usize,
    /// Unique ids in the union of all variants.
    pub unique_docs_after_fusion: usize,
    /// Ids appearing in at least two variants.
    pub overlap_count: usize,
    /// overlap_count / unique_docs_after_fusion.
    pub overlap_ratio: f32,
    /// (after − before) / before.
    pub fusion_gain: f32,
}

/// Merge variant result lists with reciprocal rank fusion.
///
/// Documents absent from a list contribute nothing for that list. Metadata is
/// taken from the first occurrence; the fused score replaces the original,
/// which is preserved in `original_score`.
pub fn reciprocal_rank_fusion(result_sets: &[Vec<SearchResult>], k: f32) -> Vec<SearchResult> {
    if result_sets.is_empty() {
        return Vec::new();
    }

    let mut scores: HashMap<String, f32> = HashMap::new();
    let mut appearances: HashMap<String, usize> = HashMap::new();
    let mut data: HashMap<String, SearchResult> = HashMap::new();

    for results in result_sets {
        for (rank0, doc) in results.iter().enumerate() {
            if doc.id.is_empty() {
                continue;
            }
            let contribution = 1.0 / (k + (rank0 + 1) as f32);
            *scores.entry(doc.id.clone()).or_insert(0.0) += contribution;
            *appearances.entry(doc.id.clone()).or_insert(0) += 1;
            data.entry(doc.id.clone()).or_insert_with(|| doc.clone());
        }
    }

    let mut merged: Vec<SearchResult> = data
        .into_values()
        .map(|mut doc| {
            let rrf = scores.get(&doc.id).copied().unwrap_or(0.0);
            doc.original_score = Some(doc.score);
            doc.score = rrf;
            doc.query_appearances = appearances.get(&doc.id).copied();
            doc.retriever = RetrieverTag::Fusion;
            doc
        })
        .collect();

    crate::types::sort_results(&mut merged);
    merged
}

/// Compute fusion metrics from the variant result lists.
pub fn calculate_fusion_metrics(result_sets: &[Vec<SearchResult>]) -> FusionMetrics {
    if result_sets.is_empty() {
        return FusionMetrics::default();
    }

    let before: std::collections::HashSet<&str> =
        result_sets[0].iter().map(|d| d.id.as_str()).collect();

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for results in result_sets {
        let mut seen_in_set: std::collections::HashSet<&str> = std::collections::HashSet::new();
        for doc in results {
            if seen_in_set.insert(doc.id.as_str()) {
                *counts.entry(doc.id.as_str()).or_insert(0) += 1;
            }
        }
    }

    let after = counts.len();
    let overlap_count = counts.values().filter(|&&c| c >= 2).count();
    let overlap_ratio = if after > 0 { overlap_count as f32 / after as f32 } else { 0.0 };
    let fusion_gain = if !before.is_empty() {
        (after as f32 - before.len() as f32) / before.len() as f32
    } else {
        0.0
    };

    FusionMetrics {
        fusion_used: true,
        num_queries: result_sets.len(),
        per_query_result_counts: result_sets.iter().map(Vec::len).collect(),
        unique_docs_before_fusion: before.len(),
        unique_docs_after_fusion: after,
        overlap_count,
        overlap_ratio,
        fusion_gain,
    }
}

/// Fusion is only worth its cost when it meaningfully widens the result set.
/// Below `min_gain` the caller may prefer the first variant's results alone.
pub fn should_use_fusion_results(result_sets: &[Vec<SearchResult>], min_gain: f32) -> bool {
    if result_sets.len() < 2 {
        return false;
    }
    let metrics = calculate_fusion_metrics(result_sets);
    if metrics.unique_docs_before_fusion == 0 {
        return true;
    }
    if metrics.fusion_gain < min_gain {
        tracing::info!(
            gain = metrics.fusion_gain,
            threshold = min_gain,
            "Low fusion gain, single-variant results preferred"
        );
    }
    metrics.fusion_gain >= min_gain
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RetrieverTag;

    fn doc(id: &str, score: f32) -> SearchResult {
        SearchResult {
            id: id.to_string(),
            title: format!("title-{id}"),
            snippet: String::new(),
            score,
            source: "coll".to_string(),
            doc_type: None,
            date: None,
            retriever: RetrieverTag::Dense,
            tier: None,
            original_score: None,
            query_appearances: None,
        }
    }

    #[test]
    fn test_rrf_ranks_shared_docs_higher() {
        let sets = vec![
            vec![doc("a", 0.9), doc("b", 0.8)],
            vec![doc("b", 0.7), doc("c", 0.6)],
        ];
        let merged = reciprocal_rank_fusion(&sets, 60.0);
        assert_eq!(merged.len(), 3);
        // b appears at rank 2 and rank 1: 1/62 + 1/61 > 1/61 (a) > 1/62 (c)
        assert_eq!(merged[0].id, "b");
        assert_eq!(merged[0].query_appearances, Some(2));
        assert_eq!(merged[0].retriever, RetrieverTag::Fusion);
    }

    #[test]
    fn test_rrf_monotonicity() {
        // d at rank 1 everywhere must not rank below d2 which is at rank 2+
        let sets = vec![
            vec![doc("d", 0.9), doc("d2", 0.8)],
            vec![doc("d", 0.9), doc("d2", 0.8)],
            vec![doc("d", 0.9)],
        ];
        let merged = reciprocal_rank_fusion(&sets, 60.0);
        let pos_d = merged.iter().position(|r| r.id == "d").unwrap();
        let pos_d2 = merged.iter().position(|r| r.id == "d2").unwrap();
        assert!(pos_d < pos_d2);
    }

    #[test]
    fn test_rrf_preserves_original_score() {
        let sets = vec![vec![doc("a", 0.42)]];
        let merged = reciprocal_rank_fusion(&sets, 60.0);
        assert_eq!(merged[0].original_score, Some(0.42));
        assert!((merged[0].score - 1.0 / 61.0).abs() < 1e-6);
    }

    #[test]
    fn test_rrf_deterministic_on_ties() {
        // Two docs with identical contributions: order fixed by tie key
        let sets = vec![vec![doc("b", 0.5)], vec![doc("a", 0.5)]];
        let first = reciprocal_rank_fusion(&sets, 60.0);
        let second = reciprocal_rank_fusion(&sets, 60.0);
        let ids1: Vec<_> = first.iter().map(|r| r.id.clone()).collect();
        let ids2: Vec<_> = second.iter().map(|r| r.id.clone()).collect();
        assert_eq!(ids1, ids2);
        assert_eq!(ids1, vec!["a", "b"]);
    }

    #[test]
    fn test_empty_variant_does_not_zero_fusion() {
        let sets = vec![vec![], vec![doc("a", 0.9)]];
        let merged = reciprocal_rank_fusion(&sets, 60.0);
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn test_fusion_metrics_bounds() {
        let sets = vec![
            vec![doc("a", 0.9), doc("b", 0.8)],
            vec![doc("b", 0.7), doc("c", 0.6), doc("d", 0.5)],
        ];
        let metrics = calculate_fusion_metrics(&sets);
        assert_eq!(metrics.unique_docs_before_fusion, 2);
        assert_eq!(metrics.unique_docs_after_fusion, 4);
        assert!(metrics.fusion_gain >= 0.0);
        assert!((0.0..=1.0).contains(&metrics.overlap_ratio));
        assert_eq!(metrics.overlap_count, 1);
        assert!((metrics.fusion_gain - 1.0).abs() < 1e-6);
        assert!(metrics.unique_docs_after_fusion >= metrics.unique_docs_before_fusion);
    }

    #[test]
    fn test_should_use_fusion_low_gain() {
        let sets = vec![
            vec![doc("a", 0.9), doc("b", 0.8)],
            vec![doc("a", 0.7), doc("b", 0.6)],
        ];
        assert!(!should_use_fusion_results(&sets, 0.05));
    }

    #[test]
    fn test_should_use_fusion_empty_first_variant() {
        let sets = vec![vec![], vec![doc("a", 0.9)]];
        assert!(should_use_fusion_results(&sets, 0.05));
    }

    #[test]
    fn test_single_set_never_uses_fusion() {
        let sets = vec![vec![doc("a", 0.9)]];
        assert!(!should_use_fusion_results(&sets, 0.05));
    }
}
