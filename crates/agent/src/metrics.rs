//! Pipeline metrics and the final RAG result.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use lagrum_core::{EvidenceLevel, ResponseMode};
use lagrum_rag::{IntentResult, IntentRoutingConfig, SearchResult, Tier};

use crate::guardrail::WardenStatus;

/// Metrics for the complete RAG pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RagPipelineMetrics {
    // Timing
    pub query_classification_ms: f64,
    pub decontextualization_ms: f64,
    pub retrieval_ms: f64,
    pub llm_generation_ms: f64,
    pub guardrail_ms: f64,
    pub reranking_ms: f64,
    pub structured_output_ms: f64,
    pub total_pipeline_ms: f64,

    // Component results
    pub sources_count: usize,
    pub tokens_generated: usize,
    pub corrections_count: usize,

    // Retrieval details
    pub retrieval_strategy: String,
    pub retrieval_results_count: usize,
    pub top_relevance_score: f32,

    // LLM details
    pub model_used: String,
    pub tokens_per_second: f32,

    // Structured output details
    pub structured_output_enabled: bool,
    pub parse_errors: bool,
    pub saknas_underlag: Option<bool>,
    pub kallor_count: usize,

    // Critic details
    pub critic_revision_count: usize,
    pub critic_ms: f64,
    pub critic_ok: bool,

    // CRAG details
    pub crag_enabled: bool,
    pub grade_count: usize,
    pub relevant_count: usize,
    pub grade_ms: f64,
    pub self_reflection_used: bool,
    pub self_reflection_ms: f64,
}

/// A claim-to-source binding surfaced in the API response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultCitation {
    pub claim: String,
    pub source_id: String,
    pub source_title: String,
    pub source_collection: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,
}

/// Complete result from the RAG pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagResult {
    pub answer: String,
    pub sources: Vec<SearchResult>,
    pub citations: Vec<ResultCitation>,
    pub reasoning_steps: Vec<String>,
    pub metrics: RagPipelineMetrics,
    pub mode: ResponseMode,
    pub guardrail_status: WardenStatus,
    pub evidence_level: EvidenceLevel,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Chain of thought from self-reflection; debug only, never fed back
    /// into prompts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thought_chain: Option<String>,
    /// Structured response with the internal note stripped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured: Option<Value>,
    /// Intent and routing when EPR is active.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<IntentResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routing: Option<IntentRoutingConfig>,
}

impl RagResult {
    /// Error result carrying whatever metrics accumulated before the
    /// failure.
    pub fn failure(
        answer: impl Into<String>,
        mode: ResponseMode,
        error: impl Into<String>,
        reasoning_steps: Vec<String>,
        metrics: RagPipelineMetrics,
    ) -> Self {
        Self {
            answer: answer.into(),
            sources: Vec::new(),
            citations: Vec::new(),
            reasoning_steps,
            metrics,
            mode,
            guardrail_status: WardenStatus::Error,
            evidence_level: EvidenceLevel::None,
            success: false,
            error: Some(error.into()),
            thought_chain: None,
            structured: None,
            intent: None,
            routing: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_result_shape() {
        let result = RagResult::failure(
            "Tyvärr uppstod ett fel.",
            ResponseMode::Assist,
            "boom",
            vec!["steg".to_string()],
            RagPipelineMetrics::default(),
        );
        assert!(!result.success);
        assert_eq!(result.guardrail_status, WardenStatus::Error);
        assert_eq!(result.evidence_level, EvidenceLevel::None);
        assert!(result.sources.is_empty());
    }

    #[test]
    fn test_result_serialization_omits_empty_options() {
        let result = RagResult::failure(
            "x",
            ResponseMode::Chat,
            "e",
            Vec::new(),
            RagPipelineMetrics::default(),
        );
        let json = serde_json::to_value(&result).unwrap();
        assert!(json.get("thought_chain").is_none());
        assert!(json.get("intent").is_none());
        assert_eq!(json["mode"], "chat");
    }
}
