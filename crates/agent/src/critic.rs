//! Critique, revision and self-reflection.
//!
//! `critique` and `revise` are purely deterministic: structural checks and
//! the matching fixes, no model calls. `self_reflection` asks the small LM
//! for a chain of thought before answering; the reflection text is never
//! embedded in downstream prompts.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;

use lagrum_core::{GenerationConfig, LanguageModel, Message, ResponseMode};
use lagrum_rag::SearchResult;

use crate::prompt::ResponseTemplates;
use crate::structured;

/// Result from a deterministic critique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriticResult {
    pub ok: bool,
    pub issues: Vec<String>,
    pub suggested_fix: String,
    pub latency_ms: f64,
}

/// Result from pre-generation self-reflection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriticReflection {
    pub thought_process: String,
    pub has_sufficient_evidence: bool,
    pub missing_evidence: Vec<String>,
    pub citation_plan: Vec<String>,
    pub constitutional_compliance: bool,
    pub confidence: f32,
    pub latency_ms: f64,
}

const REQUIRED_FIELDS: [&str; 5] =
    ["mode", "saknas_underlag", "svar", "kallor", "fakta_utan_kalla"];
const REQUIRED_SOURCE_FIELDS: [&str; 4] = ["doc_id", "chunk_id", "citat", "loc"];
const REFUSAL_KEYWORDS: [&str; 3] = ["kan inte besvara", "underlag saknas", "spekulera"];

/// Critic over structured responses.
pub struct Critic {
    reflection_model: Option<Arc<dyn LanguageModel>>,
}

impl Critic {
    /// Critic without self-reflection support.
    pub fn new() -> Self {
        Self { reflection_model: None }
    }

    /// Attach the small LM used for self-reflection.
    pub fn with_reflection_model(mut self, model: Arc<dyn LanguageModel>) -> Self {
        self.reflection_model = Some(model);
        self
    }

    /// Deterministic validation of a candidate structured response.
    pub fn critique(&self, candidate_json: &str, mode: ResponseMode) -> CriticResult {
        let start = Instant::now();

        let parsed: Value = match serde_json::from_str(candidate_json) {
            Ok(value) => value,
            Err(e) => {
                return CriticResult {
                    ok: false,
                    issues: vec![format!("Invalid JSON: {e}")],
                    suggested_fix: "Return valid JSON following the exact schema".to_string(),
                    latency_ms: start.elapsed().as_secs_f64() * 1000.0,
                };
            }
        };

        let mut issues = Vec::new();

        for field in REQUIRED_FIELDS {
            if parsed.get(field).is_none() {
                issues.push(format!("Missing required field: {field}"));
            }
        }

        if issues.is_empty() && mode == ResponseMode::Evidence {
            let saknas_underlag =
                parsed.get("saknas_underlag").and_then(Value::as_bool).unwrap_or(false);
            let kallor = parsed.get("kallor").and_then(Value::as_array);

            if saknas_underlag {
                if kallor.map(|k| !k.is_empty()).unwrap_or(false) {
                    issues.push("EVIDENCE refusal should have empty 'kallor'".to_string());
                }
                let svar = parsed.get("svar").and_then(Value::as_str).unwrap_or("");
                let svar_lower = svar.to_lowercase();
                if !REFUSAL_KEYWORDS.iter().any(|kw| svar_lower.contains(kw)) {
                    issues.push(
                        "EVIDENCE refusal should contain proper refusal language".to_string(),
                    );
                }
            } else {
                match kallor {
                    Some(sources) if !sources.is_empty() => {
                        for source in sources {
                            let Some(obj) = source.as_object() else {
                                issues.push(
                                    "Each source in 'kallor' must be an object".to_string(),
                                );
                                break;
                            };
                            for field in REQUIRED_SOURCE_FIELDS {
                                if !obj.contains_key(field) {
                                    issues.push(format!("Source missing required field: {field}"));
                                }
                            }
                        }
                    }
                    _ => issues
                        .push("EVIDENCE with evidence should have non-empty 'kallor'".to_string()),
                }

                let unsourced = parsed
                    .get("fakta_utan_kalla")
                    .and_then(Value::as_array)
                    .map(|f| !f.is_empty())
                    .unwrap_or(false);
                if unsourced {
                    issues.push(
                        "EVIDENCE mode should not contain 'fakta_utan_kalla' (use ASSIST mode)"
                            .to_string(),
                    );
                }
            }
        }

        // Internal notes must never leak past validation
        if parsed.get("arbetsanteckning").map(|v| !v.is_null()).unwrap_or(false) {
            issues.push("Response contains internal notes ('arbetsanteckning')".to_string());
        }

        let ok = issues.is_empty();
        CriticResult {
            suggested_fix: if ok {
                "Response is valid".to_string()
            } else {
                "Fix identified issues and return corrected JSON".to_string()
            },
            ok,
            issues,
            latency_ms: start.elapsed().as_secs_f64() * 1000.0,
        }
    }

    /// Deterministic revision: fill missing fields with defaults, strip the
    /// internal note, enforce the EVIDENCE refusal shape. No model call.
    pub fn revise(&self, candidate_json: &str, feedback: &CriticResult) -> String {
        let Ok(mut parsed) = serde_json::from_str::<Value>(candidate_json) else {
            return serde_json::to_string(&structured::StructuredResponse::safe_fallback().strip_internal_note())
                .unwrap_or_default();
        };

        if !feedback.ok {
            if let Some(obj) = parsed.as_object_mut() {
                obj.entry("saknas_underlag").or_insert(json!(false));
                obj.entry("fakta_utan_kalla").or_insert(json!([]));
                obj.entry("kallor").or_insert(json!([]));
                obj.remove("arbetsanteckning");

                let is_refusal = obj.get("mode").and_then(Value::as_str) == Some("EVIDENCE")
                    && obj.get("saknas_underlag").and_then(Value::as_bool).unwrap_or(false);
                if is_refusal {
                    obj.insert("kallor".to_string(), json!([]));
                    obj.insert("fakta_utan_kalla".to_string(), json!([]));
                    obj.insert("svar".to_string(), json!(ResponseTemplates::EVIDENCE_REFUSAL));
                }
            }
        }

        serde_json::to_string(&parsed).unwrap_or_default()
    }

    /// Chain-of-thought reflection before answering. Parse failures return a
    /// conservative "insufficient" reflection rather than an error.
    pub async fn self_reflection(
        &self,
        query: &str,
        mode: ResponseMode,
        sources: &[SearchResult],
    ) -> CriticReflection {
        let start = Instant::now();

        let Some(model) = &self.reflection_model else {
            return CriticReflection {
                thought_process: "Self-reflection disabled".to_string(),
                has_sufficient_evidence: !sources.is_empty(),
                missing_evidence: Vec::new(),
                citation_plan: Vec::new(),
                constitutional_compliance: true,
                confidence: 1.0,
                latency_ms: 0.0,
            };
        };

        let prompt = Self::reflection_prompt(query, mode, sources);
        let messages = vec![
            Message::system(
                "Du är en reflekterande AI som följer svenska förvaltningslagens principer. \
                 Reflektera noggrant innan du svarar.",
            ),
            Message::user(prompt),
        ];
        let gen = GenerationConfig { temperature: 0.3, top_p: 0.9, max_tokens: 512 };

        let response = match model.chat_complete(messages, gen).await {
            Ok((text, _)) => text,
            Err(e) => {
                tracing::error!(error = %e, "Self-reflection failed");
                return CriticReflection {
                    thought_process: format!("Reflektion misslyckades: {e}"),
                    has_sufficient_evidence: false,
                    missing_evidence: vec!["Reflektion kunde inte utföras".to_string()],
                    citation_plan: Vec::new(),
                    constitutional_compliance: false,
                    confidence: 0.0,
                    latency_ms: start.elapsed().as_secs_f64() * 1000.0,
                };
            }
        };

        let mut reflection = Self::parse_reflection(&response, sources);
        reflection.latency_ms = start.elapsed().as_secs_f64() * 1000.0;

        tracing::info!(
            sufficient = reflection.has_sufficient_evidence,
            compliance = reflection.constitutional_compliance,
            confidence = reflection.confidence,
            "Self-reflection complete"
        );

        reflection
    }

    fn reflection_prompt(query: &str, mode: ResponseMode, sources: &[SearchResult]) -> String {
        let sources_text = if sources.is_empty() {
            "Inga källor hittades".to_string()
        } else {
            sources
                .iter()
                .take(5)
                .enumerate()
                .map(|(i, s)| {
                    let snippet: String = s.snippet.chars().take(200).collect();
                    format!("[{}] {} (score: {:.2})\n{snippet}...", i + 1, s.title, s.score)
                })
                .collect::<Vec<_>>()
                .join("\n")
        };

        format!(
            r#"REFLEKTERA innan du svarar på följande fråga:

FRÅGA: {query}
SVARLÄGE: {mode_upper}
TILLGÄNGLIGA KÄLLOR ({count}):
{sources_text}

KONSTITUTIONELLA REGLER (Svenska förvaltningslagen):
1. LEGALITET: Använd endast information som stöds av dokumenten
2. TRANSPARENS: Alla påståenden måste ha källhänvisning
3. OBJEKTIVITET: Var neutral, saklig och formell
4. SERVICESKYLDIGHET: Var hjälpsam inom ramen för lagen

REFLEKTIONSFRÅGOR:
1. Vilka dokument är relevanta för frågan? Varför?
2. Finns det tillräckligt stöd i dokumenten för att ge ett rättssäkert svar?
3. Hur ska jag strukturera svaret enligt konstitutionella regler?
4. Vilka källor måste jag citera och hur?
5. Måste jag avslå frågan om underlag saknas?

Returnera endast giltig JSON:
{{
  "thought_process": "Din tankekedja på svenska (max 200 ord)",
  "has_sufficient_evidence": true/false,
  "missing_evidence": ["lista på vad som saknas"],
  "citation_plan": ["vilka dokument som ska citeras"],
  "constitutional_compliance": true/false,
  "confidence": 0.0-1.0
}}"#,
            mode_upper = mode.as_str().to_uppercase(),
            count = sources.len(),
        )
    }

    fn parse_reflection(response: &str, sources: &[SearchResult]) -> CriticReflection {
        let parsed = match structured::parse_llm_json(response) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to parse reflection response");
                return CriticReflection {
                    thought_process: format!("Kunde inte tolka reflektion: {e}"),
                    has_sufficient_evidence: !sources.is_empty(),
                    missing_evidence: vec!["Reflektion misslyckades".to_string()],
                    citation_plan: Vec::new(),
                    constitutional_compliance: false,
                    confidence: 0.0,
                    latency_ms: 0.0,
                };
            }
        };

        let string_list = |key: &str| -> Vec<String> {
            parsed
                .get(key)
                .and_then(Value::as_array)
                .map(|a| a.iter().filter_map(Value::as_str).map(String::from).collect())
                .unwrap_or_default()
        };

        let mut has_sufficient_evidence =
            parsed.get("has_sufficient_evidence").and_then(Value::as_bool).unwrap_or(false);
        let mut missing_evidence = string_list("missing_evidence");
        let mut constitutional_compliance =
            parsed.get("constitutional_compliance").and_then(Value::as_bool).unwrap_or(true);

        // The model cannot claim sufficiency with no sources at hand
        if sources.is_empty() && has_sufficient_evidence {
            has_sufficient_evidence = false;
            missing_evidence.push("Inga källor tillgängliga".to_string());
            constitutional_compliance = false;
        }

        CriticReflection {
            thought_process: parsed
                .get("thought_process")
                .and_then(Value::as_str)
                .unwrap_or("Ingen tankekedja genererad")
                .to_string(),
            has_sufficient_evidence,
            missing_evidence,
            citation_plan: string_list("citation_plan"),
            constitutional_compliance,
            confidence: parsed
                .get("confidence")
                .and_then(Value::as_f64)
                .map(|c| c.clamp(0.0, 1.0) as f32)
                .unwrap_or(0.5),
            latency_ms: 0.0,
        }
    }
}

impl Default for Critic {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn critic() -> Critic {
        Critic::new()
    }

    fn valid_candidate() -> String {
        json!({
            "mode": "EVIDENCE",
            "saknas_underlag": false,
            "svar": "Svar [Källa 1]",
            "kallor": [{"doc_id": "d", "chunk_id": "c", "citat": "q", "loc": "l"}],
            "fakta_utan_kalla": []
        })
        .to_string()
    }

    #[test]
    fn test_critique_valid() {
        let result = critic().critique(&valid_candidate(), ResponseMode::Evidence);
        assert!(result.ok, "{:?}", result.issues);
    }

    #[test]
    fn test_critique_invalid_json() {
        let result = critic().critique("not json", ResponseMode::Evidence);
        assert!(!result.ok);
        assert!(result.issues[0].contains("Invalid JSON"));
    }

    #[test]
    fn test_critique_missing_fields() {
        let result = critic().critique(r#"{"mode": "EVIDENCE"}"#, ResponseMode::Evidence);
        assert!(!result.ok);
        assert!(result.issues.iter().any(|i| i.contains("svar")));
    }

    #[test]
    fn test_critique_refusal_with_sources_rejected() {
        let candidate = json!({
            "mode": "EVIDENCE",
            "saknas_underlag": true,
            "svar": "Tyvärr kan jag inte besvara frågan, underlag saknas.",
            "kallor": [{"doc_id": "d", "chunk_id": "c", "citat": "q", "loc": "l"}],
            "fakta_utan_kalla": []
        })
        .to_string();
        let result = critic().critique(&candidate, ResponseMode::Evidence);
        assert!(!result.ok);
        assert!(result.issues.iter().any(|i| i.contains("empty 'kallor'")));
    }

    #[test]
    fn test_critique_internal_note_leak() {
        let candidate = json!({
            "mode": "ASSIST",
            "saknas_underlag": false,
            "svar": "x",
            "kallor": [],
            "fakta_utan_kalla": [],
            "arbetsanteckning": "hemligt"
        })
        .to_string();
        let result = critic().critique(&candidate, ResponseMode::Assist);
        assert!(!result.ok);
        assert!(result.issues.iter().any(|i| i.contains("arbetsanteckning")));
    }

    #[test]
    fn test_critique_evidence_unsourced_facts() {
        let candidate = json!({
            "mode": "EVIDENCE",
            "saknas_underlag": false,
            "svar": "x [Källa 1]",
            "kallor": [{"doc_id": "d", "chunk_id": "c", "citat": "q", "loc": "l"}],
            "fakta_utan_kalla": ["allmänt påstående"]
        })
        .to_string();
        let result = critic().critique(&candidate, ResponseMode::Evidence);
        assert!(!result.ok);
    }

    #[test]
    fn test_revise_fills_defaults_and_strips_note() {
        let candidate = json!({
            "mode": "ASSIST",
            "svar": "x",
            "arbetsanteckning": "hemligt"
        })
        .to_string();
        let feedback = critic().critique(&candidate, ResponseMode::Assist);
        let revised = critic().revise(&candidate, &feedback);
        let value: Value = serde_json::from_str(&revised).unwrap();
        assert!(value.get("arbetsanteckning").is_none());
        assert_eq!(value["saknas_underlag"], false);
        assert_eq!(value["kallor"], json!([]));
    }

    #[test]
    fn test_revise_enforces_refusal_shape() {
        let candidate = json!({
            "mode": "EVIDENCE",
            "saknas_underlag": true,
            "svar": "fel text",
            "kallor": [{"doc_id": "d", "chunk_id": "c", "citat": "q", "loc": "l"}],
            "fakta_utan_kalla": ["x"]
        })
        .to_string();
        let feedback = critic().critique(&candidate, ResponseMode::Evidence);
        let revised = critic().revise(&candidate, &feedback);
        let value: Value = serde_json::from_str(&revised).unwrap();
        assert_eq!(value["kallor"], json!([]));
        assert_eq!(value["fakta_utan_kalla"], json!([]));
        assert_eq!(value["svar"], json!(ResponseTemplates::EVIDENCE_REFUSAL));
    }

    #[test]
    fn test_revise_then_critique_passes() {
        let candidate = json!({"mode": "ASSIST", "svar": "x", "arbetsanteckning": "a"}).to_string();
        let c = critic();
        let feedback = c.critique(&candidate, ResponseMode::Assist);
        assert!(!feedback.ok);
        let revised = c.revise(&candidate, &feedback);
        let second = c.critique(&revised, ResponseMode::Assist);
        assert!(second.ok, "{:?}", second.issues);
    }

    #[tokio::test]
    async fn test_self_reflection_disabled_uses_sources() {
        let reflection = critic().self_reflection("fråga", ResponseMode::Evidence, &[]).await;
        assert!(!reflection.has_sufficient_evidence);
        assert_eq!(reflection.thought_process, "Self-reflection disabled");
    }

    #[test]
    fn test_parse_reflection_conservative_on_garbage() {
        let reflection = Critic::parse_reflection("inte json", &[]);
        assert!(!reflection.has_sufficient_evidence);
        assert!(!reflection.constitutional_compliance);
        assert_eq!(reflection.confidence, 0.0);
    }

    #[test]
    fn test_parse_reflection_overrides_sufficiency_without_sources() {
        let response = json!({
            "thought_process": "ser bra ut",
            "has_sufficient_evidence": true,
            "missing_evidence": [],
            "citation_plan": [],
            "constitutional_compliance": true,
            "confidence": 0.9
        })
        .to_string();
        let reflection = Critic::parse_reflection(&response, &[]);
        assert!(!reflection.has_sufficient_evidence);
        assert!(reflection.missing_evidence.contains(&"Inga källor tillgängliga".to_string()));
    }
}
