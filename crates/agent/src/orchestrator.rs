//! End-to-end pipeline orchestration.
//!
//! Binds classification, safety, decontextualization, retrieval, grading,
//! self-reflection, generation, structured-output validation with bounded
//! critic/revise, guardrail correction and reranking into the non-streaming
//! and streaming pipelines.

use async_stream::stream;
use futures::Stream;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

use lagrum_config::Settings;
use lagrum_core::{
    render_history, Embedder, Error, EvidenceLevel, GenerationConfig, LanguageModel, Message,
    ResponseMode, Result, StreamStats, TokenEvent, Turn, TurnRole, VectorSearch,
};
use lagrum_rag::{
    split_by_tier, IntentResult, IntentRoutingConfig, QueryProcessor, Reranker, RerankerConfig,
    RetrievalMetrics, RetrievalStrategy, Retriever, SearchResult,
};

use crate::critic::Critic;
use crate::events::{AgentEvent, SourceMeta};
use crate::grader::{Grader, GraderConfig};
use crate::guardrail::{Guardrail, WardenStatus};
use crate::metrics::{RagPipelineMetrics, RagResult, ResultCitation};
use crate::prompt::{self, ResponseTemplates};
use crate::structured::{self, StructuredResponse};

/// A query request as the orchestrator sees it.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub question: String,
    /// Forced mode; `None` means classify.
    pub mode: Option<ResponseMode>,
    pub k: usize,
    /// Strategy override from the `X-Retrieval-Strategy` header.
    pub strategy: Option<RetrievalStrategy>,
    pub history: Vec<Turn>,
    /// Include the thought chain in the result.
    pub debug: bool,
}

impl QueryRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            mode: None,
            k: lagrum_config::constants::retrieval::DEFAULT_K,
            strategy: None,
            history: Vec::new(),
            debug: false,
        }
    }
}

/// Outcome of the retrieval stage.
struct RetrievalStage {
    sources: Vec<SearchResult>,
    metrics: RetrievalMetrics,
    strategy: String,
    search_query: String,
    decontextualized: Option<(String, String)>,
    intent: Option<IntentResult>,
    routing: Option<IntentRoutingConfig>,
    should_abstain: bool,
    abstain_reason: String,
    latency_ms: f64,
}

/// The orchestrator. All held components are process singletons.
pub struct Orchestrator {
    settings: Settings,
    llm: Arc<dyn LanguageModel>,
    retriever: Arc<Retriever>,
    store: Arc<dyn VectorSearch>,
    embedder: Arc<dyn Embedder>,
    processor: QueryProcessor,
    guardrail: Guardrail,
    critic: Critic,
    grader: Option<Grader>,
    reranker: Reranker,
}

impl Orchestrator {
    pub fn new(
        settings: Settings,
        llm: Arc<dyn LanguageModel>,
        retriever: Arc<Retriever>,
        store: Arc<dyn VectorSearch>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        let grader = if settings.crag.enabled {
            Some(Grader::new(
                Arc::clone(&llm),
                GraderConfig {
                    threshold: settings.crag.grade_threshold,
                    max_concurrent: settings.crag.max_concurrent_grading,
                    timeout: std::time::Duration::from_secs_f64(settings.crag.grade_timeout_secs),
                },
            ))
        } else {
            None
        };

        let critic = if settings.crag.enable_self_reflection {
            Critic::new().with_reflection_model(Arc::clone(&llm))
        } else {
            Critic::new()
        };

        let reranker = Reranker::new(RerankerConfig {
            model: settings.reranking.model.clone(),
            ..Default::default()
        });

        tracing::info!(
            structured_output = settings.structured.output_enabled,
            critic_revise = settings.structured.critic_revise_enabled,
            crag = settings.crag.enabled,
            epr = settings.epr_enabled,
            "Orchestrator initialized"
        );

        Self {
            settings,
            llm,
            retriever,
            store,
            embedder,
            processor: QueryProcessor::new(),
            guardrail: Guardrail::new(),
            critic,
            grader,
            reranker,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Service health: vector store reachability plus static component
    /// status.
    pub async fn health(&self) -> Value {
        let store_ok = self.store.list_collections().await.is_ok();
        serde_json::json!({
            "vector_store": if store_ok { "ok" } else { "unreachable" },
            "structured_output": self.settings.structured.output_enabled,
            "critic_revise": self.settings.structured.critic_revise_enabled,
            "crag": self.settings.crag.enabled,
            "epr": self.settings.epr_enabled,
            "reranking": self.settings.reranking.enabled,
        })
    }

    fn resolve_mode(&self, requested: Option<ResponseMode>, question: &str) -> (ResponseMode, String) {
        match requested {
            Some(mode) => (mode, format!("Mode forced by caller: {mode}")),
            None => {
                let classification = self.processor.classify(question);
                (classification.mode, classification.reason)
            }
        }
    }

    // ── Retrieval stage ───────────────────────────────────────────────────

    async fn retrieve(&self, request: &QueryRequest, mode: ResponseMode) -> Result<RetrievalStage> {
        let start = Instant::now();

        // Decontextualize with the history window
        let decontextualized = if !request.history.is_empty() {
            let result = self.processor.decontextualize(&request.question, &request.history);
            if result.rewritten_query != result.original_query {
                Some((result.original_query, result.rewritten_query))
            } else {
                None
            }
        } else {
            None
        };
        let search_query = decontextualized
            .as_ref()
            .map(|(_, rewritten)| rewritten.clone())
            .unwrap_or_else(|| request.question.clone());

        let history_lines = render_history(&request.history);

        // EPR routing takes precedence when enabled; an explicit strategy
        // header otherwise, then adaptive, then plain parallel search.
        if self.settings.epr_enabled && request.strategy.is_none() {
            let routed =
                self.retriever.search_with_routing(&search_query, request.k, &history_lines).await?;

            let should_abstain = mode == ResponseMode::Evidence && routed.results.is_empty();
            return Ok(RetrievalStage {
                sources: routed.results,
                metrics: routed.metrics,
                strategy: "epr".to_string(),
                search_query,
                decontextualized,
                intent: Some(routed.intent),
                routing: Some(routed.routing),
                should_abstain,
                abstain_reason: if should_abstain { "no_results".to_string() } else { String::new() },
                latency_ms: start.elapsed().as_secs_f64() * 1000.0,
            });
        }

        let strategy = request.strategy.unwrap_or({
            if self.settings.retrieval.adaptive_enabled {
                RetrievalStrategy::Adaptive
            } else if self.settings.retrieval.parallel_search_enabled {
                RetrievalStrategy::ParallelV1
            } else {
                RetrievalStrategy::Legacy
            }
        });

        let result = self
            .retriever
            .search(&search_query, request.k, strategy, &history_lines, None)
            .await?;

        if result.metrics.fusion_used
            && result.metrics.num_queries >= 2
            && result.metrics.fusion_gain < self.retriever.config().fusion_gain_min
        {
            tracing::info!(
                gain = result.metrics.fusion_gain,
                "Low fusion gain, fused set matches single-variant results"
            );
        }

        let (should_abstain, abstain_reason) = match result.metrics.confidence.as_ref() {
            Some(signals) if signals.should_abstain => (true, signals.abstain_reason.clone()),
            _ => (false, String::new()),
        };

        Ok(RetrievalStage {
            sources: result.results,
            metrics: result.metrics,
            strategy: strategy.as_str().to_string(),
            search_query,
            decontextualized,
            intent: None,
            routing: None,
            should_abstain,
            abstain_reason,
            latency_ms: start.elapsed().as_secs_f64() * 1000.0,
        })
    }

    // ── Few-shot examples (RetICL) ────────────────────────────────────────

    /// Retrieve up to `k` constitutional examples for the mode from the
    /// dedicated collection. Failures degrade to no examples.
    async fn retrieve_examples(&self, query: &str, mode: ResponseMode, k: usize) -> Vec<Value> {
        if mode == ResponseMode::Chat {
            return Vec::new();
        }

        let embedding = match self.embedder.embed_single(query).await {
            Ok(embedding) => embedding,
            Err(e) => {
                tracing::debug!(error = %e, "Example embedding failed");
                return Vec::new();
            }
        };

        let query = lagrum_core::CollectionQuery {
            collection: self.settings.vector_store.examples_collection.clone(),
            embedding,
            n_results: k,
            where_filter: Some(serde_json::json!({"mode": mode.as_str().to_uppercase()})),
        };

        match self.store.query(&query).await {
            Ok(hits) => hits
                .iter()
                .filter_map(|hit| hit.meta_str("example_json"))
                .filter_map(|raw| serde_json::from_str::<Value>(raw).ok())
                .collect(),
            Err(e) => {
                tracing::debug!(error = %e, "Example collection unavailable");
                Vec::new()
            }
        }
    }

    // ── Generation helpers ────────────────────────────────────────────────

    fn build_messages(&self, system_prompt: String, question: &str, history: &[Turn]) -> Vec<Message> {
        let mut messages = vec![Message::system(system_prompt)];
        for turn in lagrum_core::history_window(history) {
            let message = match turn.role {
                TurnRole::User => Message::user(&turn.content),
                TurnRole::Assistant => Message::assistant(&turn.content),
            };
            messages.push(message);
        }
        messages.push(Message::user(format!("Fråga: {question}")));
        messages
    }

    async fn assemble_system_prompt(
        &self,
        mode: ResponseMode,
        question: &str,
        sources: &[SearchResult],
        structured_enabled: bool,
    ) -> String {
        let context = if mode == ResponseMode::Chat {
            String::new()
        } else if self.settings.epr_enabled {
            // Mark primary-tier sources explicitly when routing separates
            // tiers.
            let (primary, secondary) = split_by_tier(sources);
            if secondary.is_empty() {
                prompt::build_context(sources)
            } else {
                format!(
                    "{}\n\n— Sekundära källor (forskning, separeras i svaret) —\n\n{}",
                    prompt::build_context(&primary),
                    prompt::build_context(&secondary)
                )
            }
        } else {
            prompt::build_context(sources)
        };

        let system = prompt::build_system_prompt(mode, &context, structured_enabled);
        if mode == ResponseMode::Chat {
            return system;
        }

        let examples = self.retrieve_examples(question, mode, 2).await;
        let examples_text = prompt::format_examples(&examples);
        prompt::insert_examples(&system, &examples_text)
    }

    /// Collect a full completion, tracking fallback use.
    async fn generate(
        &self,
        messages: Vec<Message>,
        gen: GenerationConfig,
    ) -> Result<(String, StreamStats, bool)> {
        let mut rx = self.llm.chat_stream(messages, gen).await?;
        let mut text = String::new();
        let mut stats = StreamStats::default();
        let mut fell_back = false;
        while let Some(event) = rx.recv().await {
            match event {
                TokenEvent::Token(token) => text.push_str(&token),
                TokenEvent::Fallback { from, to } => {
                    tracing::warn!(%from, %to, "LLM fallback during generation");
                    fell_back = true;
                }
                TokenEvent::Done(s) => stats = s,
            }
        }
        Ok((text, stats, fell_back))
    }

    fn refusal_for(mode: ResponseMode) -> StructuredResponse {
        if mode == ResponseMode::Evidence {
            StructuredResponse::refusal()
        } else {
            StructuredResponse::safe_fallback()
        }
    }

    fn build_citations(
        structured: Option<&StructuredResponse>,
        sources: &[SearchResult],
    ) -> Vec<ResultCitation> {
        let Some(structured) = structured else {
            return Vec::new();
        };
        structured
            .kallor
            .iter()
            .filter_map(|citation| {
                match sources.iter().find(|s| s.id == citation.doc_id) {
                    Some(source) => Some(ResultCitation {
                        claim: citation.citat.clone(),
                        source_id: citation.doc_id.clone(),
                        source_title: source.title.clone(),
                        source_collection: source.source.clone(),
                        tier: source.tier,
                    }),
                    None => {
                        tracing::warn!(
                            doc_id = %citation.doc_id,
                            "Citation references a document outside the retrieved set, dropping"
                        );
                        None
                    }
                }
            })
            .collect()
    }

    fn sources_meta(sources: &[SearchResult]) -> Vec<SourceMeta> {
        sources
            .iter()
            .map(|s| SourceMeta {
                id: s.id.clone(),
                title: s.title.clone(),
                score: s.score,
                doc_type: s.doc_type.clone(),
                source: s.source.clone(),
            })
            .collect()
    }

    fn evidence_level_of(&self, sources: &[SearchResult], answer: &str) -> EvidenceLevel {
        let scored: Vec<(f32, Option<&str>)> =
            sources.iter().map(|s| (s.score, s.doc_type.as_deref())).collect();
        self.processor.determine_evidence_level(&scored, answer)
    }

    // ── Non-streaming pipeline ────────────────────────────────────────────

    /// Execute the full RAG pipeline. Security violations surface as errors
    /// (mapped to 403); other failures produce a result with `success=false`
    /// and whatever metrics had accumulated.
    pub async fn process_query(&self, request: QueryRequest) -> Result<RagResult> {
        let start = Instant::now();
        let mut reasoning_steps: Vec<String> = Vec::new();
        let mut metrics = RagPipelineMetrics::default();

        if request.question.trim().is_empty() {
            return Err(Error::Validation("Empty query".to_string()));
        }

        // Step 1: classification
        let class_start = Instant::now();
        let (mode, reason) = self.resolve_mode(request.mode, &request.question);
        metrics.query_classification_ms = class_start.elapsed().as_secs_f64() * 1000.0;
        reasoning_steps.push(format!("Query classified as {mode} ({reason})"));

        // Step 2: query safety — violations surface before any model call
        self.guardrail.check_query_safety(&request.question)?;

        if mode == ResponseMode::Chat {
            return self.process_chat(&request, start, reasoning_steps).await;
        }

        // Steps 3–5: decontextualize + retrieve
        let decont_start = Instant::now();
        let stage = match self.retrieve(&request, mode).await {
            Ok(stage) => stage,
            Err(e) => {
                metrics.total_pipeline_ms = start.elapsed().as_secs_f64() * 1000.0;
                reasoning_steps.push(format!("Retrieval failed: {e}"));
                return Ok(RagResult::failure(
                    ResponseTemplates::PIPELINE_ERROR,
                    mode,
                    e.to_string(),
                    reasoning_steps,
                    metrics,
                ));
            }
        };
        metrics.decontextualization_ms = decont_start.elapsed().as_secs_f64() * 1000.0;
        metrics.retrieval_ms = stage.latency_ms;
        metrics.retrieval_strategy = stage.strategy.clone();
        metrics.retrieval_results_count = stage.sources.len();
        metrics.top_relevance_score = stage.metrics.scores.top;

        if let Some((original, rewritten)) = &stage.decontextualized {
            reasoning_steps.push(format!("Query decontextualized: '{original}' → '{rewritten}'"));
        }
        reasoning_steps.push(format!(
            "Retrieved {} documents (strategy: {})",
            stage.sources.len(),
            stage.strategy
        ));

        let mut sources = stage.sources.clone();
        let mut thought_chain: Option<String> = None;

        // No-answer policy from adaptive retrieval
        if stage.should_abstain {
            reasoning_steps.push(format!("Abstaining: {}", stage.abstain_reason));
            return Ok(self.abstention_result(
                mode,
                &request.question,
                stage,
                reasoning_steps,
                metrics,
                start,
            ));
        }

        // Step 6: CRAG grading
        if let Some(grader) = &self.grader {
            let grading = grader.grade_documents(&stage.search_query, &sources).await;
            metrics.crag_enabled = true;
            metrics.grade_count = grading.metrics.total_documents;
            metrics.relevant_count = grading.metrics.relevant_count;
            metrics.grade_ms = grading.metrics.total_latency_ms;
            reasoning_steps.push(format!(
                "Graded {} documents, {} relevant",
                grading.metrics.total_documents, grading.metrics.relevant_count
            ));
            sources = grading.filtered;
        }

        // Step 7: self-reflection short-circuit
        if self.settings.crag.enabled
            && self.settings.crag.enable_self_reflection
            && !sources.is_empty()
        {
            let reflection =
                self.critic.self_reflection(&request.question, mode, &sources).await;
            metrics.self_reflection_used = true;
            metrics.self_reflection_ms = reflection.latency_ms;
            thought_chain = Some(reflection.thought_process.clone());

            if mode == ResponseMode::Evidence && !reflection.has_sufficient_evidence {
                reasoning_steps.push("Self-reflection: insufficient evidence, refusing".to_string());
                let mut result = self.refusal_result(mode, reasoning_steps, metrics, start);
                result.thought_chain = request.debug.then_some(reflection.thought_process);
                result.intent = stage.intent;
                result.routing = stage.routing;
                return Ok(result);
            }
        }

        // Zero sources in EVIDENCE mode: refuse rather than speculate
        if mode == ResponseMode::Evidence && sources.is_empty() {
            reasoning_steps.push("No sources retrieved in EVIDENCE mode, refusing".to_string());
            let mut result = self.refusal_result(mode, reasoning_steps, metrics, start);
            result.intent = stage.intent;
            result.routing = stage.routing;
            return Ok(result);
        }

        // Steps 8–11: prompt + generation
        let structured_enabled = self.settings.structured.output_enabled;
        let system_prompt = self
            .assemble_system_prompt(mode, &request.question, &sources, structured_enabled)
            .await;
        let messages = self.build_messages(system_prompt.clone(), &request.question, &request.history);
        let gen = self.settings.generation_config(mode);

        let llm_start = Instant::now();
        let (mut full_answer, stats, _fell_back) = match self.generate(messages, gen).await {
            Ok(outcome) => outcome,
            Err(e) => {
                metrics.total_pipeline_ms = start.elapsed().as_secs_f64() * 1000.0;
                reasoning_steps.push(format!("Generation failed: {e}"));
                return Ok(RagResult::failure(
                    ResponseTemplates::PIPELINE_ERROR,
                    mode,
                    e.to_string(),
                    reasoning_steps,
                    metrics,
                ));
            }
        };
        metrics.llm_generation_ms = llm_start.elapsed().as_secs_f64() * 1000.0;
        metrics.tokens_generated = stats.tokens_generated;
        metrics.model_used = stats.model_used.clone();
        metrics.tokens_per_second = stats.tokens_per_second();
        reasoning_steps.push(format!(
            "LLM generated {} tokens (model: {})",
            stats.tokens_generated, stats.model_used
        ));

        // Step 12: structured output parse + validate with one strict retry
        let mut structured_response: Option<StructuredResponse> = None;
        metrics.structured_output_enabled = structured_enabled;

        if structured_enabled {
            let structured_start = Instant::now();

            // Attempt 1 validates the answer already generated; the retry
            // attempt re-asks the model with the strict-JSON instruction.
            let first_answer = full_answer.clone();
            let llm_call = |instruction: Option<&'static str>| {
                let system_prompt = system_prompt.clone();
                let question = request.question.clone();
                let first_answer = first_answer.clone();
                async move {
                    match instruction {
                        None => Ok(first_answer),
                        Some(instruction) => {
                            let retry_messages = vec![
                                Message::system(system_prompt),
                                Message::user(format!("Fråga: {question}")),
                                Message::assistant(
                                    "Försökte att returnera JSON men misslyckades.",
                                ),
                                Message::user(instruction),
                            ];
                            self.generate(retry_messages, gen)
                                .await
                                .map(|(text, _, _)| text)
                                .map_err(|e| e.to_string())
                        }
                    }
                }
            };

            match structured::validate_with_retries(llm_call, mode, 2).await {
                Ok((parsed, was_retry)) => {
                    metrics.parse_errors = was_retry;
                    reasoning_steps.push(if was_retry {
                        "Structured output validation: PASSED (attempt 2 - retry)".to_string()
                    } else {
                        "Structured output validation: PASSED (attempt 1)".to_string()
                    });
                    structured_response = Some(parsed);
                }
                Err(errors) => {
                    metrics.parse_errors = true;
                    reasoning_steps.push(format!(
                        "Structured output validation: FAILED after retry ({})",
                        errors.join(", ")
                    ));
                    let fallback = Self::refusal_for(mode);
                    full_answer = fallback.svar.clone();
                    if mode == ResponseMode::Evidence {
                        sources.clear();
                    }
                    structured_response = Some(fallback);
                }
            }
            metrics.structured_output_ms = structured_start.elapsed().as_secs_f64() * 1000.0;

            if let Some(parsed) = &structured_response {
                full_answer = parsed.svar.clone();
                metrics.saknas_underlag = Some(parsed.saknas_underlag);
                metrics.kallor_count = parsed.kallor.len();
            }
        }

        // Step 13: bounded critic/revise
        if self.settings.structured.critic_revise_enabled {
            if let Some(parsed) = structured_response.take() {
                let critic_start = Instant::now();
                let max_revisions = self.settings.structured.critic_max_revisions.min(2);
                let mut current_json =
                    serde_json::to_string(&parsed.strip_internal_note()).unwrap_or_default();
                let mut revision_count = 0usize;
                let mut last_ok = false;

                while revision_count < max_revisions {
                    let critique = self.critic.critique(&current_json, mode);
                    last_ok = critique.ok;
                    if critique.ok {
                        break;
                    }
                    if revision_count < max_revisions - 1 {
                        current_json = self.critic.revise(&current_json, &critique);
                        revision_count += 1;
                    } else {
                        revision_count += 1;
                        break;
                    }
                }

                metrics.critic_revision_count = revision_count;
                metrics.critic_ms = critic_start.elapsed().as_secs_f64() * 1000.0;
                metrics.critic_ok = last_ok || {
                    // Final verdict on the last candidate
                    let final_check = self.critic.critique(&current_json, mode);
                    final_check.ok
                };

                if metrics.critic_ok {
                    if let Ok(value) = serde_json::from_str::<Value>(&current_json) {
                        if let Ok(parsed) = serde_json::from_value::<StructuredResponse>(value) {
                            full_answer = parsed.svar.clone();
                            structured_response = Some(parsed);
                        }
                    }
                } else {
                    // Still invalid after the revision ceiling: collapse to
                    // the mode fallback.
                    reasoning_steps
                        .push("Critic: still invalid after max revisions, using fallback".to_string());
                    let fallback = Self::refusal_for(mode);
                    full_answer = fallback.svar.clone();
                    if mode == ResponseMode::Evidence {
                        sources.clear();
                    }
                    structured_response = Some(fallback);
                }

                if structured_response.is_none() {
                    structured_response = Some(parsed);
                }
            }
        }

        // Step 14: guardrail
        let guardrail_start = Instant::now();
        let guardrail_result =
            self.guardrail.validate_response(&full_answer, &request.question, mode)?;
        metrics.guardrail_ms = guardrail_start.elapsed().as_secs_f64() * 1000.0;
        metrics.corrections_count = guardrail_result.corrections.len();
        reasoning_steps.push(format!(
            "Guardrail corrections: {} applied (status: {})",
            guardrail_result.corrections.len(),
            guardrail_result.status.as_str()
        ));

        // Step 15: rerank sources (not the answer)
        if self.settings.reranking.enabled && !sources.is_empty() {
            let rerank_start = Instant::now();
            let top_k = sources.len();
            match self.reranker.rerank(&stage.search_query, sources.clone(), top_k).await {
                Ok(outcome) => {
                    metrics.reranking_ms = rerank_start.elapsed().as_secs_f64() * 1000.0;
                    reasoning_steps.push(format!(
                        "Reranked sources in {:.1}ms",
                        metrics.reranking_ms
                    ));
                    sources = outcome.results;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Reranking failed, keeping retrieval order");
                }
            }
        }

        // Step 16: assemble. Every kallor entry must reference a retrieved
        // document; anything else is dropped.
        if let Some(parsed) = structured_response.as_mut() {
            let before = parsed.kallor.len();
            parsed.kallor.retain(|c| sources.iter().any(|s| s.id == c.doc_id));
            if parsed.kallor.len() < before {
                tracing::warn!(
                    dropped = before - parsed.kallor.len(),
                    "Dropped citations referencing documents outside the retrieved set"
                );
            }
        }

        let final_answer = guardrail_result.corrected_text;
        let evidence_level = self.evidence_level_of(&sources, &final_answer);
        let citations = Self::build_citations(structured_response.as_ref(), &sources);

        metrics.sources_count = sources.len();
        metrics.total_pipeline_ms = start.elapsed().as_secs_f64() * 1000.0;

        tracing::info!(
            mode = mode.as_str(),
            sources = sources.len(),
            total_ms = metrics.total_pipeline_ms,
            "RAG pipeline complete"
        );

        Ok(RagResult {
            answer: final_answer,
            sources,
            citations,
            reasoning_steps,
            metrics,
            mode,
            guardrail_status: guardrail_result.status,
            evidence_level,
            success: true,
            error: None,
            thought_chain: request.debug.then_some(thought_chain).flatten(),
            structured: structured_response.map(|s| s.strip_internal_note()),
            intent: stage.intent,
            routing: stage.routing,
        })
    }

    async fn process_chat(
        &self,
        request: &QueryRequest,
        start: Instant,
        mut reasoning_steps: Vec<String>,
    ) -> Result<RagResult> {
        let system = prompt::build_system_prompt(ResponseMode::Chat, "", false);
        let messages = self.build_messages(system, &request.question, &request.history);
        let gen = self.settings.generation_config(ResponseMode::Chat);

        let (answer, stats, _) = self.generate(messages, gen).await?;
        reasoning_steps.push("CHAT mode: direct LLM response (no retrieval)".to_string());

        let guardrail_result =
            self.guardrail.validate_response(&answer, &request.question, ResponseMode::Chat)?;

        let metrics = RagPipelineMetrics {
            total_pipeline_ms: start.elapsed().as_secs_f64() * 1000.0,
            tokens_generated: stats.tokens_generated,
            model_used: stats.model_used.clone(),
            tokens_per_second: stats.tokens_per_second(),
            llm_generation_ms: stats.total_duration_ms as f64,
            corrections_count: guardrail_result.corrections.len(),
            ..Default::default()
        };

        Ok(RagResult {
            answer: guardrail_result.corrected_text,
            sources: Vec::new(),
            citations: Vec::new(),
            reasoning_steps,
            metrics,
            mode: ResponseMode::Chat,
            guardrail_status: guardrail_result.status,
            evidence_level: EvidenceLevel::None,
            success: true,
            error: None,
            thought_chain: None,
            structured: None,
            intent: None,
            routing: None,
        })
    }

    fn abstention_result(
        &self,
        mode: ResponseMode,
        _question: &str,
        stage: RetrievalStage,
        reasoning_steps: Vec<String>,
        mut metrics: RagPipelineMetrics,
        start: Instant,
    ) -> RagResult {
        let fallback = Self::refusal_for(mode);
        metrics.total_pipeline_ms = start.elapsed().as_secs_f64() * 1000.0;
        metrics.saknas_underlag = Some(mode == ResponseMode::Evidence);

        RagResult {
            answer: fallback.svar.clone(),
            sources: Vec::new(),
            citations: Vec::new(),
            reasoning_steps,
            metrics,
            mode,
            guardrail_status: WardenStatus::Unchanged,
            evidence_level: EvidenceLevel::None,
            success: true,
            error: None,
            thought_chain: None,
            structured: Some(fallback.strip_internal_note()),
            intent: stage.intent,
            routing: stage.routing,
        }
    }

    fn refusal_result(
        &self,
        mode: ResponseMode,
        reasoning_steps: Vec<String>,
        mut metrics: RagPipelineMetrics,
        start: Instant,
    ) -> RagResult {
        let refusal = StructuredResponse::refusal();
        metrics.total_pipeline_ms = start.elapsed().as_secs_f64() * 1000.0;
        metrics.saknas_underlag = Some(true);

        RagResult {
            answer: refusal.svar.clone(),
            sources: Vec::new(),
            citations: Vec::new(),
            reasoning_steps,
            metrics,
            mode,
            guardrail_status: WardenStatus::Unchanged,
            evidence_level: EvidenceLevel::None,
            success: true,
            error: None,
            thought_chain: None,
            structured: Some(refusal.strip_internal_note()),
            intent: None,
            routing: None,
        }
    }

    // ── Streaming pipeline ────────────────────────────────────────────────

    /// Streaming variant. Events follow the fixed order: metadata,
    /// decontextualized, grading, thought_chain, refusal/token stream,
    /// corrections, done. `metadata` always precedes any `token`;
    /// `corrections` follow the last token; `done`/`error` are terminal.
    pub fn stream_query(
        self: Arc<Self>,
        request: QueryRequest,
    ) -> impl Stream<Item = AgentEvent> + Send {
        stream! {
            let start = Instant::now();

            if request.question.trim().is_empty() {
                yield AgentEvent::Error { message: "Empty query".to_string() };
                return;
            }

            let (mode, _reason) = self.resolve_mode(request.mode, &request.question);

            if let Err(e) = self.guardrail.check_query_safety(&request.question) {
                yield AgentEvent::Error { message: e.to_string() };
                return;
            }

            // CHAT: direct streaming, no retrieval
            if mode == ResponseMode::Chat {
                yield AgentEvent::Metadata {
                    mode,
                    sources: Vec::new(),
                    evidence_level: EvidenceLevel::None,
                    search_time_ms: 0.0,
                    refusal: None,
                    refusal_reason: None,
                };

                let system = prompt::build_system_prompt(ResponseMode::Chat, "", false);
                let messages = self.build_messages(system, &request.question, &request.history);
                let gen = self.settings.generation_config(ResponseMode::Chat);

                match self.llm.chat_stream(messages, gen).await {
                    Ok(mut rx) => {
                        while let Some(event) = rx.recv().await {
                            match event {
                                TokenEvent::Token(content) => yield AgentEvent::Token { content },
                                TokenEvent::Fallback { from, to } => {
                                    yield AgentEvent::Fallback { from, to }
                                }
                                TokenEvent::Done(_) => break,
                            }
                        }
                        yield AgentEvent::Done {
                            total_time_ms: start.elapsed().as_secs_f64() * 1000.0,
                        };
                    }
                    Err(e) => yield AgentEvent::Error { message: e.to_string() },
                }
                return;
            }

            // Retrieval
            let stage = match self.retrieve(&request, mode).await {
                Ok(stage) => stage,
                Err(e) => {
                    yield AgentEvent::Error { message: e.to_string() };
                    return;
                }
            };

            let mut sources = stage.sources.clone();
            let mut grading_event: Option<AgentEvent> = None;

            if let Some(grader) = &self.grader {
                let grading = grader.grade_documents(&stage.search_query, &sources).await;
                grading_event = Some(AgentEvent::Grading {
                    total: grading.metrics.total_documents,
                    relevant: grading.metrics.relevant_count,
                    message: "⚖️ Väger bevis...".to_string(),
                });
                sources = grading.filtered;
            }

            // Abstention / refusal short-circuits
            let refusal_reason = if stage.should_abstain {
                Some(stage.abstain_reason.clone())
            } else if mode == ResponseMode::Evidence && sources.is_empty() {
                Some("no_results".to_string())
            } else {
                None
            };

            // Self-reflection (may also refuse)
            let mut thought_event: Option<AgentEvent> = None;
            let mut reflection_refusal: Option<String> = None;
            if refusal_reason.is_none()
                && self.settings.crag.enabled
                && self.settings.crag.enable_self_reflection
                && !sources.is_empty()
            {
                let reflection =
                    self.critic.self_reflection(&request.question, mode, &sources).await;
                if request.debug {
                    thought_event = Some(AgentEvent::ThoughtChain {
                        content: reflection.thought_process.clone(),
                    });
                }
                if mode == ResponseMode::Evidence && !reflection.has_sufficient_evidence {
                    reflection_refusal = Some(if reflection.missing_evidence.is_empty() {
                        "Underlag saknas".to_string()
                    } else {
                        reflection.missing_evidence.join(", ")
                    });
                }
            }

            let refusal_reason = refusal_reason.or(reflection_refusal);

            if let Some(reason) = refusal_reason {
                let template = if mode == ResponseMode::Evidence {
                    ResponseTemplates::EVIDENCE_REFUSAL
                } else {
                    ResponseTemplates::SAFE_FALLBACK
                };
                yield AgentEvent::Metadata {
                    mode,
                    sources: Vec::new(),
                    evidence_level: EvidenceLevel::None,
                    search_time_ms: stage.latency_ms,
                    refusal: Some(true),
                    refusal_reason: Some(reason.clone()),
                };
                if let Some((original, rewritten)) = stage.decontextualized {
                    yield AgentEvent::Decontextualized { original, rewritten };
                }
                if let Some(event) = grading_event {
                    yield event;
                }
                if let Some(event) = thought_event {
                    yield event;
                }
                yield AgentEvent::Refusal { message: template.to_string(), reason };
                yield AgentEvent::Token { content: template.to_string() };
                yield AgentEvent::Done {
                    total_time_ms: start.elapsed().as_secs_f64() * 1000.0,
                };
                return;
            }

            let evidence_level = self.evidence_level_of(&sources, "");
            yield AgentEvent::Metadata {
                mode,
                sources: Self::sources_meta(&sources),
                evidence_level,
                search_time_ms: stage.latency_ms,
                refusal: None,
                refusal_reason: None,
            };
            if let Some((original, rewritten)) = stage.decontextualized {
                yield AgentEvent::Decontextualized { original, rewritten };
            }
            if let Some(event) = grading_event {
                yield event;
            }
            if let Some(event) = thought_event {
                yield event;
            }

            // Structured output is disabled while streaming so the internal
            // note can never reach the wire.
            let system_prompt = self
                .assemble_system_prompt(mode, &request.question, &sources, false)
                .await;
            let messages = self.build_messages(system_prompt, &request.question, &request.history);
            let gen = self.settings.generation_config(mode);

            let mut full_answer = String::new();
            match self.llm.chat_stream(messages, gen).await {
                Ok(mut rx) => {
                    while let Some(event) = rx.recv().await {
                        match event {
                            TokenEvent::Token(content) => {
                                full_answer.push_str(&content);
                                yield AgentEvent::Token { content };
                            }
                            TokenEvent::Fallback { from, to } => {
                                yield AgentEvent::Fallback { from, to };
                            }
                            TokenEvent::Done(_) => break,
                        }
                    }
                }
                Err(e) => {
                    yield AgentEvent::Error { message: e.to_string() };
                    return;
                }
            }

            // Corrections after the last token
            match self.guardrail.validate_response(&full_answer, &request.question, mode) {
                Ok(result) => {
                    if !result.corrections.is_empty() {
                        yield AgentEvent::Corrections {
                            corrections: result
                                .corrections
                                .iter()
                                .map(|c| format!("{} → {}", c.original_term, c.corrected_term))
                                .collect(),
                            corrected_text: result.corrected_text,
                        };
                    }
                }
                Err(e) => {
                    yield AgentEvent::Error { message: e.to_string() };
                    return;
                }
            }

            yield AgentEvent::Done { total_time_ms: start.elapsed().as_secs_f64() * 1000.0 };
        }
    }
}
