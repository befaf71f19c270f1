//! Search result and metrics types for the retrieval stack.

use serde::{Deserialize, Serialize};

/// Which retriever produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrieverTag {
    Dense,
    Lexical,
    Fusion,
    Adaptive,
    Epr,
}

impl RetrieverTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrieverTag::Dense => "dense",
            RetrieverTag::Lexical => "lexical",
            RetrieverTag::Fusion => "fusion",
            RetrieverTag::Adaptive => "adaptive",
            RetrieverTag::Epr => "epr",
        }
    }
}

/// Routing tier of a result when intent routing is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Tier {
    A,
    B,
    C,
}

/// Individual search result with score and metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: String,
    pub title: String,
    /// Truncated passage text (≤200 chars with ellipsis).
    pub snippet: String,
    /// Normalized similarity or fused score.
    pub score: f32,
    /// Source collection name.
    pub source: String,
    pub doc_type: Option<String>,
    pub date: Option<String>,
    pub retriever: RetrieverTag,
    /// Set when intent routing is active.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,
    /// Original per-collection score before fusion, when fused.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_score: Option<f32>,
    /// Number of query variants that returned this document, when fused.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_appearances: Option<usize>,
}

impl SearchResult {
    /// Deterministic ordering key for score ties: tier, then collection name,
    /// then id.
    pub fn tie_key(&self) -> (u8, &str, &str) {
        let tier = match self.tier {
            Some(Tier::A) => 0,
            Some(Tier::B) => 1,
            Some(Tier::C) => 2,
            None => 3,
        };
        (tier, self.source.as_str(), self.id.as_str())
    }
}

/// Sort results by score descending with deterministic tie-breaking.
pub fn sort_results(results: &mut [SearchResult]) {
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.tie_key().cmp(&b.tie_key()))
    });
}

/// Score distribution over a result set.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ScoreStats {
    pub top: f32,
    pub mean: f32,
    pub std: f32,
    /// Normalized entropy of the score distribution; higher means flatter.
    pub entropy: f32,
}

impl ScoreStats {
    pub fn compute(scores: &[f32]) -> Self {
        if scores.is_empty() {
            return Self::default();
        }
        let top = scores[0];
        let mean = scores.iter().sum::<f32>() / scores.len() as f32;
        let std = if scores.len() > 1 {
            let variance =
                scores.iter().map(|s| (s - mean).powi(2)).sum::<f32>() / scores.len() as f32;
            variance.sqrt()
        } else {
            0.0
        };

        let total: f32 = scores.iter().sum();
        let entropy = if total > 0.0 && scores.len() > 1 {
            let raw: f32 = scores
                .iter()
                .map(|s| {
                    let p = s / total;
                    if p > 0.0 {
                        -p * (p + 1e-10).ln()
                    } else {
                        0.0
                    }
                })
                .sum();
            raw / (scores.len() as f32).ln()
        } else {
            0.0
        };

        Self { top, mean, std, entropy }
    }
}

/// Per-call retrieval metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalMetrics {
    pub total_latency_ms: f64,
    pub embed_latency_ms: f64,

    /// Per-collection latencies, keyed by collection name.
    pub collection_latencies_ms: Vec<(String, f64)>,
    /// Collections that hit their timeout.
    pub timed_out_collections: Vec<String>,

    pub result_count: usize,
    pub unique_docs_total: usize,
    pub doc_overlap_count: usize,

    pub scores: ScoreStats,

    pub strategy: String,

    // Rewrite metrics
    pub rewrite_used: bool,
    pub rewrite_latency_ms: f64,
    pub original_query: String,
    pub rewritten_query: String,

    // Fusion metrics
    pub fusion_used: bool,
    pub num_queries: usize,
    pub query_variants: Vec<String>,
    pub per_query_result_counts: Vec<usize>,
    pub unique_docs_before_fusion: usize,
    pub unique_docs_after_fusion: usize,
    pub overlap_ratio: f32,
    pub fusion_gain: f32,
    pub rrf_latency_ms: f64,
    pub expansion_latency_ms: f64,

    // Adaptive metrics
    pub adaptive_used: bool,
    pub escalation_path: Vec<String>,
    pub final_step: String,
    pub fallback_triggered: bool,
    /// One decision-trace entry per step visited.
    pub reason_codes: Vec<String>,
    pub confidence: Option<crate::confidence::ConfidenceSignals>,

    /// Similarity-threshold filter kept only the top results because the
    /// filter would otherwise have emptied the set.
    pub threshold_fallback: bool,
}

/// Complete result from the retrieval orchestrator.
#[derive(Debug, Clone, Default)]
pub struct RetrievalResult {
    pub results: Vec<SearchResult>,
    pub metrics: RetrievalMetrics,
}
