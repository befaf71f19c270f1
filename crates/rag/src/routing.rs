//! Intent-based two-pass retrieval (evidence policy routing).
//!
//! Pass 1 runs a fusion search across the primary and support collections.
//! Pass 2, gated on a non-zero secondary budget, runs a separate fusion
//! search restricted to secondary (research) collections and keeps at most
//! `secondary_budget` items. Results are concatenated in stable tier order
//! (A before B before C); within a tier by score descending.

use serde::{Deserialize, Serialize};

use lagrum_core::Result;

use crate::query::{IntentClassifier, IntentResult, IntentRoutingConfig, QueryIntent};
use crate::retriever::Retriever;
use crate::types::{sort_results, RetrievalResult, RetrieverTag, SearchResult, Tier};

/// Outcome of a routed search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutedRetrieval {
    pub intent: IntentResult,
    pub routing: IntentRoutingConfig,
    pub results: Vec<SearchResult>,
    /// Retrieval metrics of pass 1 (pass 2 contributes only its capped
    /// results).
    pub metrics: crate::types::RetrievalMetrics,
}

impl Retriever {
    /// Two-pass intent-routed search. Smalltalk intent yields an empty
    /// primary list and no retrieval at all; the caller skips straight to
    /// generation.
    pub async fn search_with_routing(
        &self,
        query: &str,
        k: usize,
        history: &[String],
    ) -> Result<RoutedRetrieval> {
        let classifier = IntentClassifier::new();
        let intent = classifier.classify(query);
        let routing = IntentClassifier::routing_for_intent(intent.intent);

        tracing::info!(
            intent = intent.intent.as_str(),
            confidence = intent.confidence,
            primary = ?routing.primary,
            secondary_budget = routing.secondary_budget,
            "Intent routing"
        );

        if intent.intent == QueryIntent::Smalltalk || routing.primary.is_empty() {
            return Ok(RoutedRetrieval {
                intent,
                routing,
                results: Vec::new(),
                metrics: Default::default(),
            });
        }

        // Pass 1: primary ∪ support
        let mut pass1_collections: Vec<String> = routing.primary.clone();
        pass1_collections.extend(routing.support.iter().cloned());

        let pass1 = self
            .search(
                query,
                k,
                crate::retriever::RetrievalStrategy::RagFusion,
                history,
                Some(&pass1_collections),
            )
            .await?;

        let mut tiered: Vec<SearchResult> = pass1
            .results
            .into_iter()
            .map(|mut r| {
                let tier = if routing.primary.contains(&r.source) { Tier::A } else { Tier::B };
                r.tier = Some(tier);
                r.retriever = RetrieverTag::Epr;
                r
            })
            .collect();

        // Pass 2: budget-capped secondary sweep
        if routing.secondary_budget > 0 && !routing.secondary.is_empty() {
            let pass2 = self
                .search(
                    query,
                    routing.secondary_budget,
                    crate::retriever::RetrievalStrategy::RagFusion,
                    history,
                    Some(&routing.secondary),
                )
                .await?;

            let seen: std::collections::HashSet<String> =
                tiered.iter().map(|r| r.id.clone()).collect();

            tiered.extend(
                pass2
                    .results
                    .into_iter()
                    .filter(|r| !seen.contains(&r.id))
                    .take(routing.secondary_budget)
                    .map(|mut r| {
                        r.tier = Some(Tier::C);
                        r.retriever = RetrieverTag::Epr;
                        r
                    }),
            );
        }

        // Stable tier ordering: A before B before C, score-descending within
        // each tier.
        tiered.sort_by(|a, b| {
            a.tier
                .cmp(&b.tier)
                .then_with(|| {
                    b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.tie_key().cmp(&b.tie_key()))
        });

        Ok(RoutedRetrieval { intent, routing, results: tiered, metrics: pass1.metrics })
    }
}

/// Helper used by the orchestrator when separation is required: split the
/// routed results into primary-tier (A/B) and secondary-tier (C) groups
/// without disturbing order.
pub fn split_by_tier(results: &[SearchResult]) -> (Vec<SearchResult>, Vec<SearchResult>) {
    let mut primary = Vec::new();
    let mut secondary = Vec::new();
    for result in results {
        match result.tier {
            Some(Tier::C) => secondary.push(result.clone()),
            _ => primary.push(result.clone()),
        }
    }
    (primary, secondary)
}
