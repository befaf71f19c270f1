//! Retrieval orchestrator.
//!
//! Parallel per-collection dense search with timeouts, an optional lexical
//! sidecar, deduplication, RRF fusion over query variants, and
//! confidence-driven adaptive escalation (A→B→C→D). Per-collection timeouts
//! and single-variant failures degrade to empty lists and are flagged in
//! metrics; they never fail the whole request.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

use lagrum_core::{CollectionQuery, Embedder, Error, LexicalSearch, RawHit, Result, VectorSearch};

use crate::confidence::{
    step_config, ConfidenceCalculator, ConfidenceSignals, ConfidenceTier, EscalationStep,
};
use crate::fusion::{calculate_fusion_metrics, reciprocal_rank_fusion, FusionMetrics};
use crate::query::{QueryExpander, QueryRewriter, RewriteResult};
use crate::types::{
    sort_results, RetrievalMetrics, RetrievalResult, RetrieverTag, ScoreStats, SearchResult,
};

/// Available retrieval strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalStrategy {
    /// Sequential per-collection baseline.
    Legacy,
    /// One query, parallel per-collection dense search.
    ParallelV1,
    /// Decontextualize, then parallel search.
    RewriteV1,
    /// Rewrite, expand to ≤3 variants, fan out, RRF merge.
    RagFusion,
    /// Confidence-driven escalation A→B→C→D.
    Adaptive,
}

impl RetrievalStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrievalStrategy::Legacy => "legacy",
            RetrievalStrategy::ParallelV1 => "parallel_v1",
            RetrievalStrategy::RewriteV1 => "rewrite_v1",
            RetrievalStrategy::RagFusion => "rag_fusion",
            RetrievalStrategy::Adaptive => "adaptive",
        }
    }

    /// Parse a strategy name, e.g. from the `X-Retrieval-Strategy` header.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "legacy" => Some(RetrievalStrategy::Legacy),
            "parallel_v1" => Some(RetrievalStrategy::ParallelV1),
            "rewrite_v1" => Some(RetrievalStrategy::RewriteV1),
            "rag_fusion" => Some(RetrievalStrategy::RagFusion),
            "adaptive" => Some(RetrievalStrategy::Adaptive),
            _ => None,
        }
    }
}

/// Retriever configuration.
#[derive(Debug, Clone)]
pub struct RetrieverConfig {
    pub default_collections: Vec<String>,
    pub default_k: usize,
    pub search_timeout: Duration,
    pub similarity_threshold: f32,
    pub rrf_k: f32,
    pub max_concurrent_queries: usize,
    pub max_escalation_steps: usize,
    pub fusion_gain_min: f32,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        use lagrum_config::constants::retrieval as c;
        Self {
            default_collections: vec![
                "sfs_lagtext".to_string(),
                "riksdag_documents".to_string(),
                "swedish_gov_docs".to_string(),
            ],
            default_k: c::DEFAULT_K,
            search_timeout: Duration::from_secs_f64(
                lagrum_config::constants::timeouts::COLLECTION_SEARCH_SECS,
            ),
            similarity_threshold: c::SIMILARITY_THRESHOLD,
            rrf_k: c::RRF_K,
            max_concurrent_queries: c::MAX_CONCURRENT_QUERIES,
            max_escalation_steps: 4,
            fusion_gain_min: c::FUSION_GAIN_MIN,
        }
    }
}

pub(crate) struct CollectionOutcome {
    pub results: Vec<SearchResult>,
    pub latency_ms: f64,
    pub timed_out: bool,
}

pub(crate) struct ParallelOutcome {
    pub results: Vec<SearchResult>,
    pub latencies: Vec<(String, f64)>,
    pub timed_out: Vec<String>,
    pub overlap_count: usize,
    pub threshold_fallback: bool,
}

/// Retrieval orchestrator over a vector store, an embedder and an optional
/// lexical index.
pub struct Retriever {
    store: Arc<dyn VectorSearch>,
    embedder: Arc<dyn Embedder>,
    lexical: Option<Arc<dyn LexicalSearch>>,
    rewriter: QueryRewriter,
    expander: QueryExpander,
    calculator: ConfidenceCalculator,
    semaphore: Arc<Semaphore>,
    config: RetrieverConfig,
}

impl Retriever {
    pub fn new(
        store: Arc<dyn VectorSearch>,
        embedder: Arc<dyn Embedder>,
        config: RetrieverConfig,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_queries.max(1)));
        Self {
            store,
            embedder,
            lexical: None,
            rewriter: QueryRewriter::new(),
            expander: QueryExpander::default(),
            calculator: ConfidenceCalculator::new(),
            semaphore,
            config,
        }
    }

    /// Attach the lexical BM25 sidecar.
    pub fn with_lexical(mut self, lexical: Arc<dyn LexicalSearch>) -> Self {
        self.lexical = Some(lexical);
        self
    }

    pub fn config(&self) -> &RetrieverConfig {
        &self.config
    }

    // ── Per-collection search ─────────────────────────────────────────────

    fn truncate_snippet(text: &str) -> String {
        let max = lagrum_config::constants::retrieval::SNIPPET_MAX_CHARS;
        if text.chars().count() > max {
            let truncated: String = text.chars().take(max).collect();
            format!("{truncated}...")
        } else {
            text.to_string()
        }
    }

    fn hit_to_result(hit: RawHit, collection: &str) -> SearchResult {
        // Distance to similarity: s = 1/(1+d)
        let score = 1.0 / (1.0 + hit.distance.max(0.0));
        SearchResult {
            title: hit.meta_str("title").unwrap_or("Untitled").to_string(),
            snippet: Self::truncate_snippet(&hit.document),
            source: hit.meta_str("source").unwrap_or(collection).to_string(),
            doc_type: hit.meta_str("doc_type").map(|s| s.to_string()),
            date: hit.meta_str("date").map(|s| s.to_string()),
            id: hit.id,
            score,
            retriever: RetrieverTag::Dense,
            tier: None,
            original_score: None,
            query_appearances: None,
        }
    }

    /// Search one collection, bounded by the configured timeout. On timeout
    /// or error, returns an empty list with the flag set — never an error.
    pub(crate) async fn search_collection(
        &self,
        embedding: &[f32],
        collection: &str,
        k: usize,
        where_filter: Option<&serde_json::Value>,
    ) -> CollectionOutcome {
        let start = Instant::now();
        let query = CollectionQuery {
            collection: collection.to_string(),
            embedding: embedding.to_vec(),
            n_results: k,
            where_filter: where_filter.cloned(),
        };

        match tokio::time::timeout(self.config.search_timeout, self.store.query(&query)).await {
            Ok(Ok(hits)) => CollectionOutcome {
                results: hits.into_iter().map(|h| Self::hit_to_result(h, collection)).collect(),
                latency_ms: start.elapsed().as_secs_f64() * 1000.0,
                timed_out: false,
            },
            Ok(Err(e)) => {
                tracing::error!(collection, error = %e, "Collection search failed");
                CollectionOutcome {
                    results: Vec::new(),
                    latency_ms: start.elapsed().as_secs_f64() * 1000.0,
                    timed_out: false,
                }
            }
            Err(_) => {
                tracing::warn!(
                    collection,
                    timeout_secs = self.config.search_timeout.as_secs_f64(),
                    "Collection search timed out"
                );
                CollectionOutcome {
                    results: Vec::new(),
                    latency_ms: start.elapsed().as_secs_f64() * 1000.0,
                    timed_out: true,
                }
            }
        }
    }

    // ── Parallel multi-collection search ──────────────────────────────────

    /// Search all collections concurrently and merge with dedup (highest
    /// score wins). Wall-clock ≈ max of per-collection latencies.
    pub(crate) async fn parallel_search(
        &self,
        embedding: &[f32],
        collections: &[String],
        k: usize,
    ) -> ParallelOutcome {
        let futures = collections
            .iter()
            .map(|coll| async move { (coll.clone(), self.search_collection(embedding, coll, k, None).await) });

        let outcomes = join_all(futures).await;

        let mut all_results: Vec<SearchResult> = Vec::new();
        let mut latencies = Vec::new();
        let mut timed_out = Vec::new();

        for (name, outcome) in outcomes {
            latencies.push((name.clone(), outcome.latency_ms));
            if outcome.timed_out {
                timed_out.push(name);
            }
            all_results.extend(outcome.results);
        }

        let before_dedup = all_results.len();

        // Dedup by document id, keeping the highest score
        let mut by_id: std::collections::HashMap<String, SearchResult> =
            std::collections::HashMap::new();
        for result in all_results {
            match by_id.get(&result.id) {
                Some(existing) if existing.score >= result.score => {}
                _ => {
                    by_id.insert(result.id.clone(), result);
                }
            }
        }

        let mut unique: Vec<SearchResult> = by_id.into_values().collect();
        sort_results(&mut unique);
        let overlap_count = before_dedup - unique.len();

        let (unique, threshold_fallback) = self.apply_similarity_threshold(unique);

        ParallelOutcome { results: unique, latencies, timed_out, overlap_count, threshold_fallback }
    }

    /// Filter results below the similarity threshold, applied before any
    /// fusion. When the filter would empty the set, the top 3 are kept with
    /// a warning instead.
    fn apply_similarity_threshold(
        &self,
        results: Vec<SearchResult>,
    ) -> (Vec<SearchResult>, bool) {
        if results.is_empty() {
            return (results, false);
        }
        let threshold = self.config.similarity_threshold;
        let kept: Vec<SearchResult> =
            results.iter().filter(|r| r.score >= threshold).cloned().collect();

        if kept.is_empty() {
            let keep = lagrum_config::constants::retrieval::THRESHOLD_FALLBACK_KEEP;
            tracing::warn!(
                threshold,
                kept = keep.min(results.len()),
                "Similarity filter would empty result set, keeping top results"
            );
            (results.into_iter().take(keep).collect(), true)
        } else {
            (kept, false)
        }
    }

    /// Lexical sidecar: BM25 hits merged in with normalized scores.
    async fn lexical_sidecar(&self, lexical_query: &str, k: usize) -> Vec<SearchResult> {
        let Some(lexical) = &self.lexical else {
            return Vec::new();
        };
        if lexical_query.is_empty() {
            return Vec::new();
        }

        match lexical.search(lexical_query, k).await {
            Ok(hits) => hits
                .into_iter()
                .map(|h| SearchResult {
                    id: h.id,
                    title: h.title,
                    snippet: Self::truncate_snippet(&h.text),
                    // BM25 scores are unbounded; squash into (0,1)
                    score: h.score / (1.0 + h.score),
                    source: "lexical".to_string(),
                    doc_type: None,
                    date: None,
                    retriever: RetrieverTag::Lexical,
                    tier: None,
                    original_score: None,
                    query_appearances: None,
                })
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "Lexical sidecar failed, continuing dense-only");
                Vec::new()
            }
        }
    }

    // ── Public entry point ────────────────────────────────────────────────

    /// Execute a search with the given strategy.
    pub async fn search(
        &self,
        query: &str,
        k: usize,
        strategy: RetrievalStrategy,
        history: &[String],
        collections: Option<&[String]>,
    ) -> Result<RetrievalResult> {
        let start = Instant::now();

        let mut result = match strategy {
            RetrievalStrategy::Legacy => self.search_legacy(query, k, collections).await?,
            RetrievalStrategy::ParallelV1 => {
                self.search_parallel(query, k, collections, None).await?
            }
            RetrievalStrategy::RewriteV1 => {
                let rewrite = self.rewriter.rewrite(query, history);
                let standalone = rewrite.standalone_query.clone();
                self.search_parallel(&standalone, k, collections, Some(rewrite)).await?
            }
            RetrievalStrategy::RagFusion => self.search_fusion(query, k, history, collections).await?,
            RetrievalStrategy::Adaptive => self.search_adaptive(query, k, history, collections).await?,
        };

        result.metrics.strategy = strategy.as_str().to_string();
        result.metrics.total_latency_ms = start.elapsed().as_secs_f64() * 1000.0;
        result.metrics.result_count = result.results.len();

        tracing::info!(
            strategy = strategy.as_str(),
            results = result.results.len(),
            latency_ms = result.metrics.total_latency_ms,
            "Retrieval complete"
        );

        Ok(result)
    }

    // ── Strategies ────────────────────────────────────────────────────────

    /// Sequential per-collection baseline.
    async fn search_legacy(
        &self,
        query: &str,
        k: usize,
        collections: Option<&[String]>,
    ) -> Result<RetrievalResult> {
        let embed_start = Instant::now();
        let embedding = self.embedder.embed_single(query).await?;
        let embed_latency = embed_start.elapsed().as_secs_f64() * 1000.0;

        let names = collections.unwrap_or(&self.config.default_collections);

        let mut metrics = RetrievalMetrics { embed_latency_ms: embed_latency, ..Default::default() };
        let mut all_results = Vec::new();
        for name in names {
            let outcome = self.search_collection(&embedding, name, k, None).await;
            metrics.collection_latencies_ms.push((name.clone(), outcome.latency_ms));
            if outcome.timed_out {
                metrics.timed_out_collections.push(name.clone());
            }
            all_results.extend(outcome.results);
        }

        let mut by_id: std::collections::HashMap<String, SearchResult> =
            std::collections::HashMap::new();
        for result in all_results {
            match by_id.get(&result.id) {
                Some(existing) if existing.score >= result.score => {}
                _ => {
                    by_id.insert(result.id.clone(), result);
                }
            }
        }
        let mut results: Vec<SearchResult> = by_id.into_values().collect();
        sort_results(&mut results);
        let (results, fallback) = self.apply_similarity_threshold(results);
        let results: Vec<SearchResult> = results.into_iter().take(k).collect();

        metrics.unique_docs_total = results.len();
        metrics.threshold_fallback = fallback;
        metrics.scores = ScoreStats::compute(&results.iter().map(|r| r.score).collect::<Vec<_>>());

        Ok(RetrievalResult { results, metrics })
    }

    /// One query, parallel per-collection search, optional lexical sidecar.
    async fn search_parallel(
        &self,
        query: &str,
        k: usize,
        collections: Option<&[String]>,
        rewrite: Option<RewriteResult>,
    ) -> Result<RetrievalResult> {
        let embed_start = Instant::now();
        let embedding = self.embedder.embed_single(query).await?;
        let embed_latency = embed_start.elapsed().as_secs_f64() * 1000.0;

        let names = collections.unwrap_or(&self.config.default_collections);
        let outcome = self.parallel_search(&embedding, names, k).await;

        // Lexical sidecar on the keyword variant of the query
        let lexical_query =
            rewrite.as_ref().map(|r| r.lexical_query.clone()).unwrap_or_else(|| query.to_string());
        let lexical_hits = self.lexical_sidecar(&lexical_query, k).await;

        let mut by_id: std::collections::HashMap<String, SearchResult> =
            outcome.results.into_iter().map(|r| (r.id.clone(), r)).collect();
        for hit in lexical_hits {
            match by_id.get(&hit.id) {
                Some(existing) if existing.score >= hit.score => {}
                _ => {
                    by_id.insert(hit.id.clone(), hit);
                }
            }
        }
        let mut results: Vec<SearchResult> = by_id.into_values().collect();
        sort_results(&mut results);
        let results: Vec<SearchResult> = results.into_iter().take(k).collect();

        let mut metrics = RetrievalMetrics {
            embed_latency_ms: embed_latency,
            collection_latencies_ms: outcome.latencies,
            timed_out_collections: outcome.timed_out,
            unique_docs_total: results.len(),
            doc_overlap_count: outcome.overlap_count,
            threshold_fallback: outcome.threshold_fallback,
            scores: ScoreStats::compute(&results.iter().map(|r| r.score).collect::<Vec<_>>()),
            ..Default::default()
        };

        if let Some(rewrite) = rewrite {
            metrics.rewrite_used = rewrite.needs_rewrite;
            metrics.rewrite_latency_ms = rewrite.rewrite_latency_ms;
            metrics.original_query = rewrite.original_query;
            metrics.rewritten_query = rewrite.standalone_query;
        }

        Ok(RetrievalResult { results, metrics })
    }

    /// One fusion pass: expand, batch-embed, fan out behind the semaphore,
    /// RRF merge.
    pub(crate) async fn fusion_step(
        &self,
        query: &str,
        rewrite: &RewriteResult,
        num_queries: usize,
        k: usize,
        collections: &[String],
    ) -> Result<(Vec<SearchResult>, FusionMetrics, Vec<String>, f64)> {
        let expanded = self.expander.expand(query, rewrite, Some(num_queries));
        let variants = expanded.queries.clone();

        if !crate::query::validate_no_hallucinated_statutes(
            query,
            &expanded,
            &rewrite.detected_entities,
        ) {
            // Fall back to the single semantic variant
            return self
                .fusion_over_variants(&[query.to_string()], k, collections)
                .await
                .map(|(r, m)| (r, m, vec![query.to_string()], expanded.expansion_latency_ms));
        }

        let (merged, metrics) = self.fusion_over_variants(&variants, k, collections).await?;
        Ok((merged, metrics, variants, expanded.expansion_latency_ms))
    }

    async fn fusion_over_variants(
        &self,
        variants: &[String],
        k: usize,
        collections: &[String],
    ) -> Result<(Vec<SearchResult>, FusionMetrics)> {
        let embeddings = self.embedder.embed(variants).await?;

        // Fan out per variant, each behind the process-wide semaphore to
        // bound self-induced load on the store and the embedder.
        let searches = embeddings.iter().map(|embedding| {
            let semaphore = Arc::clone(&self.semaphore);
            async move {
                let _permit = semaphore.acquire().await.map_err(|e| {
                    Error::Internal(format!("variant semaphore closed: {e}"))
                })?;
                Ok::<Vec<SearchResult>, Error>(
                    self.parallel_search(embedding, collections, k).await.results,
                )
            }
        });

        let outcomes = join_all(searches).await;
        let result_sets: Vec<Vec<SearchResult>> = outcomes
            .into_iter()
            .enumerate()
            .map(|(i, outcome)| match outcome {
                Ok(results) => results,
                Err(e) => {
                    tracing::error!(variant = i, error = %e, "Variant search failed");
                    Vec::new()
                }
            })
            .collect();

        let metrics = calculate_fusion_metrics(&result_sets);
        let merged: Vec<SearchResult> = reciprocal_rank_fusion(&result_sets, self.config.rrf_k)
            .into_iter()
            .take(k)
            .collect();

        Ok((merged, metrics))
    }

    /// Rewrite, expand, fuse.
    async fn search_fusion(
        &self,
        query: &str,
        k: usize,
        history: &[String],
        collections: Option<&[String]>,
    ) -> Result<RetrievalResult> {
        let rewrite = self.rewriter.rewrite(query, history);
        let names = collections.unwrap_or(&self.config.default_collections).to_vec();

        let rrf_start = Instant::now();
        let (merged, fusion_metrics, variants, expansion_ms) = self
            .fusion_step(
                &rewrite.standalone_query,
                &rewrite,
                lagrum_config::constants::retrieval::MAX_QUERY_VARIANTS,
                k,
                &names,
            )
            .await?;
        let rrf_latency = rrf_start.elapsed().as_secs_f64() * 1000.0;

        let metrics = RetrievalMetrics {
            rewrite_used: rewrite.needs_rewrite,
            rewrite_latency_ms: rewrite.rewrite_latency_ms,
            original_query: rewrite.original_query.clone(),
            rewritten_query: rewrite.standalone_query.clone(),
            fusion_used: true,
            num_queries: variants.len(),
            query_variants: variants,
            per_query_result_counts: fusion_metrics.per_query_result_counts.clone(),
            unique_docs_before_fusion: fusion_metrics.unique_docs_before_fusion,
            unique_docs_after_fusion: fusion_metrics.unique_docs_after_fusion,
            overlap_ratio: fusion_metrics.overlap_ratio,
            fusion_gain: fusion_metrics.fusion_gain,
            rrf_latency_ms: rrf_latency,
            expansion_latency_ms: expansion_ms,
            unique_docs_total: merged.len(),
            scores: ScoreStats::compute(&merged.iter().map(|r| r.score).collect::<Vec<_>>()),
            ..Default::default()
        };

        Ok(RetrievalResult { results: merged, metrics })
    }

    /// Adaptive escalation: run step A, compute confidence, escalate while a
    /// threshold is breached and steps remain, then apply the no-answer
    /// policy.
    async fn search_adaptive(
        &self,
        query: &str,
        k: usize,
        history: &[String],
        collections: Option<&[String]>,
    ) -> Result<RetrievalResult> {
        let rewrite = self.rewriter.rewrite(query, history);
        let must_include = rewrite.must_include.clone();

        let routed: Vec<String> =
            collections.unwrap_or(&self.config.default_collections).to_vec();
        let all_collections = match self.store.list_collections().await {
            Ok(names) => names,
            Err(e) => {
                tracing::warn!(error = %e, "list_collections failed, using defaults");
                routed.clone()
            }
        };

        let mut escalation_path: Vec<String> = Vec::new();
        let mut reason_codes: Vec<String> = Vec::new();
        let mut final_results: Vec<SearchResult> = Vec::new();
        let mut final_signals: Option<ConfidenceSignals> = None;
        let mut last_fusion = FusionMetrics::default();
        let mut fallback_triggered = false;

        let mut step = EscalationStep::A;
        loop {
            let config = step_config(step);
            escalation_path.push(step.as_str().to_string());

            if config.fallback {
                // Step D keeps the previous results and marks them very_low
                fallback_triggered = true;
                reason_codes.push("D: fallback triggered".to_string());
                if let Some(signals) = final_signals.as_mut() {
                    signals.confidence_tier = ConfidenceTier::VeryLow;
                }
                break;
            }

            let step_collections: &[String] =
                if config.all_collections && !all_collections.is_empty() {
                    &all_collections
                } else {
                    &routed
                };
            let step_k = (k as f32 * config.k_multiplier).round() as usize;

            let (results, fusion_metrics, _variants, _expansion_ms) = self
                .fusion_step(
                    &rewrite.standalone_query,
                    &rewrite,
                    config.num_queries,
                    step_k.max(k),
                    step_collections,
                )
                .await?;

            let signals = self.calculator.compute(
                &results,
                &must_include,
                Some(&fusion_metrics),
                query,
            );

            let (escalate, reason) = self.calculator.should_escalate(&signals);
            reason_codes.push(format!("{}: {}", step.as_str(), reason));

            final_results = results.into_iter().take(k).collect();
            last_fusion = fusion_metrics;
            final_signals = Some(signals);

            if !escalate {
                tracing::info!(step = step.as_str(), "Adaptive retrieval converged");
                break;
            }

            match step.next() {
                Some(next) if escalation_path.len() < self.config.max_escalation_steps => {
                    tracing::info!(from = step.as_str(), reason = %reason, "Adaptive escalation");
                    step = next;
                }
                _ => break,
            }
        }

        // No-answer policy after the final step
        let is_final = escalation_path.last().map(|s| s == "D").unwrap_or(false);
        if let Some(signals) = final_signals.as_mut() {
            let (abstain, reason) = self.calculator.should_abstain(signals, is_final);
            if abstain {
                signals.should_abstain = true;
                signals.abstain_reason = reason.clone();
                reason_codes.push(format!("ABSTAIN: {reason}"));
                tracing::warn!(
                    reason = %reason,
                    lexical_overlap = signals.lexical_overlap,
                    "Adaptive retrieval abstaining"
                );
            }
        }

        let mut results = final_results;
        for result in &mut results {
            result.retriever = RetrieverTag::Adaptive;
        }

        let final_step = escalation_path.last().cloned().unwrap_or_default();
        let metrics = RetrievalMetrics {
            adaptive_used: true,
            rewrite_used: rewrite.needs_rewrite,
            rewrite_latency_ms: rewrite.rewrite_latency_ms,
            original_query: rewrite.original_query.clone(),
            rewritten_query: rewrite.standalone_query.clone(),
            fusion_used: true,
            overlap_ratio: last_fusion.overlap_ratio,
            fusion_gain: last_fusion.fusion_gain,
            unique_docs_before_fusion: last_fusion.unique_docs_before_fusion,
            unique_docs_after_fusion: last_fusion.unique_docs_after_fusion,
            num_queries: last_fusion.num_queries,
            escalation_path,
            final_step,
            fallback_triggered,
            reason_codes,
            confidence: final_signals,
            unique_docs_total: results.len(),
            scores: ScoreStats::compute(&results.iter().map(|r| r.score).collect::<Vec<_>>()),
            ..Default::default()
        };

        Ok(RetrievalResult { results, metrics })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use lagrum_core::LexicalHit;
    use std::collections::HashMap;

    /// Scripted in-memory vector store.
    struct FakeStore {
        /// collection → hits returned for any query
        collections: HashMap<String, Vec<RawHit>>,
        delay: Option<Duration>,
    }

    impl FakeStore {
        fn new() -> Self {
            Self { collections: HashMap::new(), delay: None }
        }

        fn with_collection(mut self, name: &str, docs: Vec<(&str, &str, f32)>) -> Self {
            let hits = docs
                .into_iter()
                .map(|(id, text, distance)| RawHit {
                    id: id.to_string(),
                    document: text.to_string(),
                    metadata: HashMap::from([
                        ("title".to_string(), serde_json::json!(format!("Titel {id}"))),
                        ("doc_type".to_string(), serde_json::json!("sfs")),
                    ]),
                    distance,
                })
                .collect();
            self.collections.insert(name.to_string(), hits);
            self
        }
    }

    #[async_trait]
    impl VectorSearch for FakeStore {
        async fn list_collections(&self) -> Result<Vec<String>> {
            let mut names: Vec<String> = self.collections.keys().cloned().collect();
            names.sort();
            Ok(names)
        }

        async fn query(&self, query: &CollectionQuery) -> Result<Vec<RawHit>> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            Ok(self
                .collections
                .get(&query.collection)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .take(query.n_results)
                .collect())
        }

        async fn count(&self, collection: &str) -> Result<usize> {
            Ok(self.collections.get(collection).map(|c| c.len()).unwrap_or(0))
        }
    }

    struct FakeEmbedder;

    #[async_trait]
    impl Embedder for FakeEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![0.1, 0.2, 0.3]).collect())
        }

        fn dimension(&self) -> usize {
            3
        }
    }

    struct FakeLexical;

    #[async_trait]
    impl lagrum_core::LexicalSearch for FakeLexical {
        async fn search(&self, _query: &str, _cutoff: usize) -> Result<Vec<LexicalHit>> {
            Ok(vec![LexicalHit {
                id: "lex1".to_string(),
                score: 8.5,
                text: "lexikal träff".to_string(),
                title: "Lexikal titel".to_string(),
            }])
        }
    }

    fn retriever(store: FakeStore) -> Retriever {
        let config = RetrieverConfig {
            default_collections: vec!["a".to_string(), "b".to_string()],
            similarity_threshold: 0.4,
            ..Default::default()
        };
        Retriever::new(Arc::new(store), Arc::new(FakeEmbedder), config)
    }

    #[tokio::test]
    async fn test_parallel_dedup_keeps_highest() {
        let store = FakeStore::new()
            .with_collection("a", vec![("doc1", "text", 0.2), ("doc2", "text", 0.5)])
            .with_collection("b", vec![("doc1", "text", 0.8)]);
        let r = retriever(store);
        let result = r
            .search("fråga om lagen", 10, RetrievalStrategy::ParallelV1, &[], None)
            .await
            .unwrap();
        let doc1 = result.results.iter().find(|x| x.id == "doc1").unwrap();
        // 1/(1+0.2) ≈ 0.833 beats 1/(1+0.8) ≈ 0.556
        assert!((doc1.score - 1.0 / 1.2).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_snippet_truncation() {
        let long_text = "x".repeat(500);
        let store =
            FakeStore::new().with_collection("a", vec![("doc1", long_text.as_str(), 0.1)]);
        let config = RetrieverConfig {
            default_collections: vec!["a".to_string()],
            ..Default::default()
        };
        let r = Retriever::new(Arc::new(store), Arc::new(FakeEmbedder), config);
        let result =
            r.search("fråga", 10, RetrievalStrategy::ParallelV1, &[], None).await.unwrap();
        assert!(result.results[0].snippet.ends_with("..."));
        assert_eq!(result.results[0].snippet.chars().count(), 203);
    }

    #[tokio::test]
    async fn test_threshold_fallback_keeps_top_three() {
        // All distances large → similarities ≈ 0.2, below the 0.4 threshold
        let store = FakeStore::new().with_collection(
            "a",
            vec![("d1", "t", 4.0), ("d2", "t", 4.5), ("d3", "t", 5.0), ("d4", "t", 6.0)],
        );
        let config = RetrieverConfig {
            default_collections: vec!["a".to_string()],
            similarity_threshold: 0.4,
            ..Default::default()
        };
        let r = Retriever::new(Arc::new(store), Arc::new(FakeEmbedder), config);
        let result =
            r.search("fråga", 10, RetrievalStrategy::ParallelV1, &[], None).await.unwrap();
        assert_eq!(result.results.len(), 3);
        assert!(result.metrics.threshold_fallback);
    }

    #[tokio::test]
    async fn test_timeout_degrades_to_empty() {
        let mut store = FakeStore::new().with_collection("a", vec![("d1", "t", 0.1)]);
        store.delay = Some(Duration::from_millis(300));
        let config = RetrieverConfig {
            default_collections: vec!["a".to_string()],
            search_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let r = Retriever::new(Arc::new(store), Arc::new(FakeEmbedder), config);
        let result =
            r.search("fråga", 10, RetrievalStrategy::ParallelV1, &[], None).await.unwrap();
        assert!(result.results.is_empty());
        assert_eq!(result.metrics.timed_out_collections, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_fusion_strategy_merges_variants() {
        let store = FakeStore::new()
            .with_collection("a", vec![("d1", "GDPR samtycke text", 0.2)])
            .with_collection("b", vec![("d2", "personuppgifter text", 0.3)]);
        let r = retriever(store);
        let result = r
            .search("Vad säger GDPR om samtycke?", 10, RetrievalStrategy::RagFusion, &[], None)
            .await
            .unwrap();
        assert!(result.metrics.fusion_used);
        assert!(result.metrics.num_queries >= 1);
        assert!(!result.results.is_empty());
        assert!(result.results.iter().all(|x| x.retriever == RetrieverTag::Fusion));
    }

    #[tokio::test]
    async fn test_adaptive_terminates_within_four_steps() {
        // Empty corpus: every step escalates, must stop at D
        let store = FakeStore::new().with_collection("a", vec![]);
        let r = retriever(store);
        let result = r
            .search("helt okänd fråga utan svar", 10, RetrievalStrategy::Adaptive, &[], None)
            .await
            .unwrap();
        assert!(result.metrics.adaptive_used);
        assert!(result.metrics.escalation_path.len() <= 4);
        assert_eq!(result.metrics.final_step, "D");
        assert!(result.metrics.fallback_triggered);
        // One reason entry per visited step plus the abstain entry
        assert!(result.metrics.reason_codes.len() >= result.metrics.escalation_path.len());
        let signals = result.metrics.confidence.as_ref().unwrap();
        assert!(signals.should_abstain);
    }

    #[tokio::test]
    async fn test_adaptive_stops_early_on_confidence() {
        let store = FakeStore::new().with_collection(
            "a",
            vec![
                ("d1", "GDPR reglerar samtycke och personuppgifter i detalj", 0.05),
                ("d2", "Om dataskydd och personlig integritet enligt GDPR", 0.9),
            ],
        );
        let r = retriever(store);
        let result = r
            .search(
                "Vad säger GDPR om samtycke personuppgifter?",
                10,
                RetrievalStrategy::Adaptive,
                &[],
                None,
            )
            .await
            .unwrap();
        // Confident on step A: no further escalation
        assert_eq!(result.metrics.escalation_path, vec!["A".to_string()]);
        assert_eq!(result.metrics.final_step, "A");
    }

    #[tokio::test]
    async fn test_lexical_sidecar_merged() {
        let store = FakeStore::new().with_collection("a", vec![("d1", "dense träff", 0.2)]);
        let config = RetrieverConfig {
            default_collections: vec!["a".to_string()],
            similarity_threshold: 0.4,
            ..Default::default()
        };
        let r = Retriever::new(Arc::new(store), Arc::new(FakeEmbedder), config)
            .with_lexical(Arc::new(FakeLexical));
        let result = r
            .search("fråga om lagen", 10, RetrievalStrategy::ParallelV1, &[], None)
            .await
            .unwrap();
        assert!(result.results.iter().any(|x| x.retriever == RetrieverTag::Lexical));
    }

    #[tokio::test]
    async fn test_rewrite_strategy_records_metrics() {
        let store = FakeStore::new().with_collection("a", vec![("d1", "GDPR text", 0.2)]);
        let r = retriever(store);
        let history = vec!["user: Berätta om GDPR".to_string()];
        let result = r
            .search("Vad säger den?", 10, RetrievalStrategy::RewriteV1, &history, None)
            .await
            .unwrap();
        assert!(result.metrics.rewrite_used);
        assert!(result.metrics.rewritten_query.contains("GDPR"));
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!(RetrievalStrategy::parse("rag_fusion"), Some(RetrievalStrategy::RagFusion));
        assert_eq!(RetrievalStrategy::parse("adaptive"), Some(RetrievalStrategy::Adaptive));
        assert_eq!(RetrievalStrategy::parse("bogus"), None);
    }
}
