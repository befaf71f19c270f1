//! Structured-output parsing and validation.
//!
//! The model is asked to answer in strict JSON. This module extracts a JSON
//! object from possibly messy output (code fences, prose preamble), checks it
//! against the schema, enforces the mode rules, and strips the internal
//! `arbetsanteckning` field before anything leaves the service.

use jsonschema::JSONSchema;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use lagrum_core::ResponseMode;

use crate::prompt::ResponseTemplates;

/// One cited source in a structured response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Citation {
    pub doc_id: String,
    pub chunk_id: String,
    pub citat: String,
    pub loc: String,
}

/// The structured response schema the model fills in non-chat modes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredResponse {
    /// "EVIDENCE" or "ASSIST".
    pub mode: String,
    pub saknas_underlag: bool,
    pub svar: String,
    #[serde(default)]
    pub kallor: Vec<Citation>,
    #[serde(default)]
    pub fakta_utan_kalla: Vec<String>,
    /// Internal control note, stripped before the user sees the result.
    #[serde(default)]
    pub arbetsanteckning: String,
}

impl StructuredResponse {
    /// The user-visible dict: everything except the internal note. This is
    /// infallible and unconditional.
    pub fn strip_internal_note(&self) -> Value {
        json!({
            "mode": self.mode,
            "saknas_underlag": self.saknas_underlag,
            "svar": self.svar,
            "kallor": self.kallor,
            "fakta_utan_kalla": self.fakta_utan_kalla,
        })
    }

    /// Canonical EVIDENCE refusal response.
    pub fn refusal() -> Self {
        Self {
            mode: "EVIDENCE".to_string(),
            saknas_underlag: true,
            svar: ResponseTemplates::EVIDENCE_REFUSAL.to_string(),
            kallor: Vec::new(),
            fakta_utan_kalla: Vec::new(),
            arbetsanteckning: String::new(),
        }
    }

    /// Canonical ASSIST safe fallback.
    pub fn safe_fallback() -> Self {
        Self {
            mode: "ASSIST".to_string(),
            saknas_underlag: false,
            svar: ResponseTemplates::SAFE_FALLBACK.to_string(),
            kallor: Vec::new(),
            fakta_utan_kalla: Vec::new(),
            arbetsanteckning: String::new(),
        }
    }
}

static SCHEMA: Lazy<JSONSchema> = Lazy::new(|| {
    let schema = json!({
        "type": "object",
        "required": ["mode", "saknas_underlag", "svar"],
        "properties": {
            "mode": {"type": "string", "enum": ["EVIDENCE", "ASSIST"]},
            "saknas_underlag": {"type": "boolean"},
            "svar": {"type": "string"},
            "kallor": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["doc_id", "chunk_id", "citat", "loc"],
                    "properties": {
                        "doc_id": {"type": "string"},
                        "chunk_id": {"type": "string"},
                        "citat": {"type": "string"},
                        "loc": {"type": "string"}
                    }
                }
            },
            "fakta_utan_kalla": {"type": "array", "items": {"type": "string"}},
            "arbetsanteckning": {"type": "string"}
        }
    });
    JSONSchema::compile(&schema).expect("structured output schema is valid")
});

static REFUSAL_MARKER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Tyvärr kan jag inte besvara frågan").unwrap());

/// Parse a JSON object from LLM output. Tolerates markdown code fences,
/// leading/trailing prose and multiple brace groups; prefers the widest
/// balanced `{…}` span.
pub fn parse_llm_json(text: &str) -> Result<Value, String> {
    let mut candidate = text.trim();

    if let Some(stripped) = candidate.strip_prefix("```json") {
        candidate = stripped;
    } else if let Some(stripped) = candidate.strip_prefix("```") {
        candidate = stripped;
    }
    if let Some(stripped) = candidate.strip_suffix("```") {
        candidate = stripped;
    }
    let candidate = candidate.trim();

    if let Ok(value) = serde_json::from_str::<Value>(candidate) {
        if value.is_object() {
            return Ok(value);
        }
    }

    // Widest balanced span: first '{' to last '}'
    if let (Some(first), Some(last)) = (candidate.find('{'), candidate.rfind('}')) {
        if last > first {
            let span = &candidate[first..=last];
            if let Ok(value) = serde_json::from_str::<Value>(span) {
                if value.is_object() {
                    return Ok(value);
                }
            }

            // Walk brace depth to find the first balanced object
            let bytes = span.as_bytes();
            let mut depth = 0usize;
            let mut in_string = false;
            let mut escaped = false;
            for (i, &b) in bytes.iter().enumerate() {
                match b {
                    b'\\' if in_string => {
                        escaped = !escaped;
                        continue;
                    }
                    b'"' if !escaped => in_string = !in_string,
                    b'{' if !in_string => depth += 1,
                    b'}' if !in_string => {
                        depth = depth.saturating_sub(1);
                        if depth == 0 {
                            if let Ok(value) = serde_json::from_str::<Value>(&span[..=i]) {
                                if value.is_object() {
                                    return Ok(value);
                                }
                            }
                        }
                    }
                    _ => {}
                }
                escaped = false;
            }
        }
    }

    Err(format!("No valid JSON object in response ({} chars)", text.chars().count()))
}

/// Validate a parsed JSON value against the schema and mode rules. Returns
/// the typed response on success, the list of issues on failure.
pub fn validate(value: &Value, mode: ResponseMode) -> Result<StructuredResponse, Vec<String>> {
    let mut errors: Vec<String> = Vec::new();

    if let Err(validation_errors) = SCHEMA.validate(value) {
        for error in validation_errors {
            errors.push(format!("Schema validation error: {error}"));
        }
    }
    if !errors.is_empty() {
        return Err(errors);
    }

    let parsed: StructuredResponse = match serde_json::from_value(value.clone()) {
        Ok(parsed) => parsed,
        Err(e) => return Err(vec![format!("Schema deserialization error: {e}")]),
    };

    match mode {
        ResponseMode::Evidence => {
            if !parsed.fakta_utan_kalla.is_empty() {
                errors.push(format!(
                    "EVIDENCE mode: {} facts without sources; all facts must cite sources",
                    parsed.fakta_utan_kalla.len()
                ));
            }
            if parsed.saknas_underlag {
                if !parsed.kallor.is_empty() {
                    errors.push("EVIDENCE refusal must have empty 'kallor'".to_string());
                }
                if !REFUSAL_MARKER_RE.is_match(&parsed.svar) {
                    errors.push(
                        "EVIDENCE mode: saknas_underlag=true requires the refusal text in 'svar'"
                            .to_string(),
                    );
                }
            }
        }
        ResponseMode::Assist => {
            if !parsed.fakta_utan_kalla.is_empty() {
                tracing::info!(
                    count = parsed.fakta_utan_kalla.len(),
                    "ASSIST: facts without sources (allowed for general knowledge)"
                );
            }
        }
        ResponseMode::Chat => {}
    }

    if errors.is_empty() {
        Ok(parsed)
    } else {
        tracing::warn!(?errors, "Structured output validation failed");
        Err(errors)
    }
}

/// Parse and validate in one step, with retry support: the closure is called
/// again with the strict-JSON instruction after a first failure, up to
/// `max_retries` total attempts.
pub async fn validate_with_retries<F, Fut>(
    mut llm_call: F,
    mode: ResponseMode,
    max_retries: usize,
) -> Result<(StructuredResponse, bool), Vec<String>>
where
    F: FnMut(Option<&'static str>) -> Fut,
    Fut: std::future::Future<Output = Result<String, String>>,
{
    let mut last_errors = Vec::new();

    for attempt in 0..max_retries.max(1) {
        let instruction =
            if attempt == 0 { None } else { Some(ResponseTemplates::STRUCTURED_RETRY_INSTRUCTION) };

        let text = match llm_call(instruction).await {
            Ok(text) => text,
            Err(e) => {
                last_errors = vec![format!("LLM call failed on attempt {}: {e}", attempt + 1)];
                continue;
            }
        };

        match parse_llm_json(&text) {
            Ok(value) => match validate(&value, mode) {
                Ok(parsed) => return Ok((parsed, attempt > 0)),
                Err(errors) => last_errors = errors,
            },
            Err(e) => {
                last_errors = vec![format!("JSON parse error on attempt {}: {e}", attempt + 1)]
            }
        }
    }

    Err(last_errors)
}
