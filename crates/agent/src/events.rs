//! Streaming events.
//!
//! The orchestrator's streaming pipeline is a generator of these discrete
//! events; the transport layer is the only place they become SSE frames.
//! Serialize→parse of any event yields the original event.

use serde::{Deserialize, Serialize};

use lagrum_core::{EvidenceLevel, ResponseMode};

/// Compact source descriptor for the metadata event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMeta {
    pub id: String,
    pub title: String,
    pub score: f32,
    pub doc_type: Option<String>,
    pub source: String,
}

/// One streaming event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// First event: mode, sources, evidence level and search time.
    Metadata {
        mode: ResponseMode,
        sources: Vec<SourceMeta>,
        evidence_level: EvidenceLevel,
        search_time_ms: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        refusal: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        refusal_reason: Option<String>,
    },
    /// The query was rewritten before retrieval.
    Decontextualized { original: String, rewritten: String },
    /// Document grading counts.
    Grading { total: usize, relevant: usize, message: String },
    /// Self-reflection chain of thought (debug mode only).
    ThoughtChain { content: String },
    /// Evidence was insufficient; the refusal text follows as a token.
    Refusal { message: String, reason: String },
    /// One LM content chunk.
    Token { content: String },
    /// Guardrail term corrections applied after the last token.
    Corrections { corrections: Vec<String>, corrected_text: String },
    /// The LM client fell back from the primary to the fallback model.
    Fallback { from: String, to: String },
    /// Fatal error; terminal.
    Error { message: String },
    /// Successful completion; terminal.
    Done { total_time_ms: f64 },
}

impl AgentEvent {
    /// True for events that end the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentEvent::Done { .. } | AgentEvent::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(event: &AgentEvent) -> AgentEvent {
        let json = serde_json::to_string(event).unwrap();
        serde_json::from_str(&json).unwrap()
    }

    #[test]
    fn test_round_trip_all_events() {
        let events = vec![
            AgentEvent::Metadata {
                mode: ResponseMode::Evidence,
                sources: vec![SourceMeta {
                    id: "d1".to_string(),
                    title: "Regeringsformen".to_string(),
                    score: 0.9,
                    doc_type: Some("sfs".to_string()),
                    source: "sfs_lagtext".to_string(),
                }],
                evidence_level: EvidenceLevel::High,
                search_time_ms: 123.4,
                refusal: None,
                refusal_reason: None,
            },
            AgentEvent::Decontextualized {
                original: "Vad säger den?".to_string(),
                rewritten: "Vad säger GDPR?".to_string(),
            },
            AgentEvent::Grading { total: 10, relevant: 7, message: "⚖️ Väger bevis...".to_string() },
            AgentEvent::ThoughtChain { content: "tankekedja".to_string() },
            AgentEvent::Refusal { message: "Tyvärr...".to_string(), reason: "no_results".to_string() },
            AgentEvent::Token { content: "Enligt ".to_string() },
            AgentEvent::Corrections {
                corrections: vec!["pul → GDPR och Dataskyddslagen (2018:218)".to_string()],
                corrected_text: "korrigerad".to_string(),
            },
            AgentEvent::Fallback { from: "primary".to_string(), to: "fallback".to_string() },
            AgentEvent::Error { message: "fel".to_string() },
            AgentEvent::Done { total_time_ms: 1234.5 },
        ];

        for event in &events {
            assert_eq!(&round_trip(event), event);
        }
    }

    #[test]
    fn test_type_discriminators() {
        let json = serde_json::to_value(AgentEvent::Token { content: "x".to_string() }).unwrap();
        assert_eq!(json["type"], "token");
        assert_eq!(json["content"], "x");

        let json = serde_json::to_value(AgentEvent::Done { total_time_ms: 1.0 }).unwrap();
        assert_eq!(json["type"], "done");

        let json = serde_json::to_value(AgentEvent::ThoughtChain { content: "t".to_string() })
            .unwrap();
        assert_eq!(json["type"], "thought_chain");
    }

    #[test]
    fn test_terminal_events() {
        assert!(AgentEvent::Done { total_time_ms: 0.0 }.is_terminal());
        assert!(AgentEvent::Error { message: String::new() }.is_terminal());
        assert!(!AgentEvent::Token { content: String::new() }.is_terminal());
    }
}
