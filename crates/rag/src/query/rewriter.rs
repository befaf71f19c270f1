//! Conversational query reformulation.
//!
//! Pronouns reference earlier context and embeddings cannot resolve them, so
//! follow-ups are rewritten into standalone queries before retrieval:
//! "Vad säger den om samtycke?" + history about GDPR →
//! "Vad säger GDPR om samtycke?".

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Entity kinds, in substitution priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Known statute abbreviation (GDPR, OSL, RF, ...).
    Lag,
    /// Known authority name.
    Myndighet,
    /// SFS number (1998:204).
    Sfs,
    /// Chapter reference (2 kap).
    Kapitel,
    /// Paragraph reference (1 §).
    Paragraf,
}

impl EntityKind {
    fn priority(&self) -> u8 {
        match self {
            EntityKind::Lag => 0,
            EntityKind::Myndighet => 1,
            EntityKind::Sfs => 2,
            EntityKind::Kapitel => 3,
            EntityKind::Paragraf => 4,
        }
    }
}

/// A detected legal entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedEntity {
    #[serde(rename = "type")]
    pub kind: EntityKind,
    pub value: String,
    pub confidence: f32,
}

/// Result of query rewriting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RewriteResult {
    pub original_query: String,
    /// Decontextualized, self-contained query.
    pub standalone_query: String,
    /// Keyword variant for BM25 boost.
    pub lexical_query: String,
    /// Terms that must appear in top-k results.
    pub must_include: Vec<String>,
    pub detected_entities: Vec<DetectedEntity>,
    pub needs_rewrite: bool,
    pub rewrite_latency_ms: f64,
}

static SFS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d{4}:\d+)").unwrap());
static KAPITEL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)(\d+)\s*kap\.?").unwrap());
static PARAGRAF_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)\s*§").unwrap());
static WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\w+").unwrap());

/// Known Swedish statute abbreviations.
pub const LEGAL_ABBREVIATIONS: [&str; 22] = [
    "GDPR", "OSL", "RF", "TF", "YGL", "PuL", "BrB", "ÄB", "FB", "SekrL", "FörvL", "KL", "SoL",
    "LVU", "LVM", "HSL", "PSL", "MBL", "LAS", "AML", "SFB", "PBL",
];

/// Known Swedish authorities.
pub const AUTHORITIES: [&str; 21] = [
    "IMY",
    "Datainspektionen",
    "Riksdagen",
    "Regeringen",
    "Regeringskansliet",
    "Justitiedepartementet",
    "Socialdepartementet",
    "Finansdepartementet",
    "Skatteverket",
    "Försäkringskassan",
    "Arbetsförmedlingen",
    "Migrationsverket",
    "Polismyndigheten",
    "Åklagarmyndigheten",
    "Domstolsverket",
    "Socialstyrelsen",
    "Folkhälsomyndigheten",
    "IVO",
    "Konsumentverket",
    "Konkurrensverket",
    "Naturvårdsverket",
];

/// Swedish pronouns that indicate reference to previous context.
const PRONOUNS: [&str; 14] = [
    "den", "det", "dessa", "denna", "dette", "de", "dem", "hans", "hennes", "dess", "deras",
    "här", "där", "detta",
];

static PRONOUN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(?i)\b({})\b", PRONOUNS.join("|"))).unwrap()
});

static STOPWORDS: Lazy<std::collections::HashSet<&'static str>> = Lazy::new(|| {
    [
        "och", "i", "att", "det", "som", "en", "på", "är", "av", "för", "med", "till", "den",
        "har", "de", "inte", "om", "ett", "kan", "ska", "jag", "vi", "du", "vad", "hur", "när",
        "var", "vilka", "finns", "eller", "men", "så", "nu", "bara", "alla", "också", "efter",
        "vid", "från", "ut", "upp", "in", "över", "sin", "säger", "enligt", "gäller", "berätta",
    ]
    .into_iter()
    .collect()
});

/// Rewrites conversational queries into standalone search queries.
pub struct QueryRewriter;

impl QueryRewriter {
    pub fn new() -> Self {
        Self
    }

    /// True if the query contains anaphoric pronouns, or is ≤3 tokens with no
    /// explicit legal entity.
    pub fn needs_rewrite(&self, query: &str) -> bool {
        if PRONOUN_RE.is_match(query) {
            return true;
        }
        if query.split_whitespace().count() <= 3 && self.extract_entities(query).is_empty() {
            return true;
        }
        false
    }

    /// Extract legal entities from text.
    pub fn extract_entities(&self, text: &str) -> Vec<DetectedEntity> {
        let mut entities = Vec::new();

        for cap in SFS_RE.captures_iter(text) {
            entities.push(DetectedEntity {
                kind: EntityKind::Sfs,
                value: cap[1].to_string(),
                confidence: 1.0,
            });
        }
        for cap in KAPITEL_RE.captures_iter(text) {
            entities.push(DetectedEntity {
                kind: EntityKind::Kapitel,
                value: cap[1].to_string(),
                confidence: 0.95,
            });
        }
        for cap in PARAGRAF_RE.captures_iter(text) {
            entities.push(DetectedEntity {
                kind: EntityKind::Paragraf,
                value: cap[1].to_string(),
                confidence: 0.95,
            });
        }

        for abbr in LEGAL_ABBREVIATIONS {
            let pattern = format!(r"(?i)\b{}\b", regex::escape(abbr));
            if Regex::new(&pattern).map(|re| re.is_match(text)).unwrap_or(false) {
                entities.push(DetectedEntity {
                    kind: EntityKind::Lag,
                    value: abbr.to_uppercase(),
                    confidence: 0.9,
                });
            }
        }

        let lower = text.to_lowercase();
        for auth in AUTHORITIES {
            if lower.contains(&auth.to_lowercase()) {
                entities.push(DetectedEntity {
                    kind: EntityKind::Myndighet,
                    value: auth.to_string(),
                    confidence: 0.85,
                });
            }
        }

        entities
    }

    /// Replace the first pronoun with the highest-priority entity from the
    /// history (most recent turns weigh first).
    fn decontextualize(&self, query: &str, history: &[String]) -> String {
        if history.is_empty() {
            return query.to_string();
        }

        let mut entities: Vec<DetectedEntity> = Vec::new();
        for msg in history.iter().rev() {
            entities.extend(self.extract_entities(msg));
        }
        if entities.is_empty() {
            return query.to_string();
        }

        entities.sort_by(|a, b| {
            a.kind
                .priority()
                .cmp(&b.kind.priority())
                .then(b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal))
        });
        let best = &entities[0];

        PRONOUN_RE.replace(query, best.value.as_str()).to_string()
    }

    /// Main rewriting entry point.
    pub fn rewrite(&self, query: &str, history: &[String]) -> RewriteResult {
        let start = Instant::now();

        let needs_rewrite = self.needs_rewrite(query);
        let standalone_query = if needs_rewrite && !history.is_empty() {
            self.decontextualize(query, history)
        } else {
            query.to_string()
        };

        let detected_entities = self.extract_entities(&standalone_query);

        let must_include: Vec<String> = detected_entities
            .iter()
            .filter(|e| matches!(e.kind, EntityKind::Lag | EntityKind::Sfs) && e.confidence >= 0.9)
            .map(|e| e.value.clone())
            .collect();

        let lexical_query = self.build_lexical_query(&standalone_query, &detected_entities);

        let result = RewriteResult {
            original_query: query.to_string(),
            standalone_query: standalone_query.clone(),
            lexical_query,
            must_include,
            detected_entities,
            needs_rewrite,
            rewrite_latency_ms: start.elapsed().as_secs_f64() * 1000.0,
        };

        tracing::info!(
            original = query,
            standalone = %standalone_query,
            entities = result.detected_entities.len(),
            "Query rewrite"
        );

        result
    }

    /// Lexical query: entity values plus non-stopword tokens ≥3 chars, in
    /// original order.
    fn build_lexical_query(&self, query: &str, entities: &[DetectedEntity]) -> String {
        let mut terms: Vec<String> = entities.iter().map(|e| e.value.clone()).collect();

        for m in WORD_RE.find_iter(&query.to_lowercase()) {
            let word = m.as_str();
            if word.chars().count() > 2
                && !STOPWORDS.contains(word)
                && !terms.iter().any(|t| t.to_lowercase() == word)
            {
                terms.push(word.to_string());
            }
        }

        terms.join(" ")
    }
}

impl Default for QueryRewriter {
    fn default() -> Self {
        Self::new()
    }
}

// ── Guardrails ─────────────────────────────────────────────────────────────

/// Guardrail 1: every must_include term appears in at least one top-10 result
/// snippet.
pub fn validate_must_include(result: &RewriteResult, snippets: &[String]) -> bool {
    for term in &result.must_include {
        let term_lower = term.to_lowercase();
        let found = snippets.iter().take(10).any(|s| s.to_lowercase().contains(&term_lower));
        if !found {
            tracing::warn!(term = %term, "Rewrite guardrail: must_include term not in results");
            return false;
        }
    }
    true
}

/// Guardrail 2: the standalone query must not introduce entities absent from
/// the original query and the history.
pub fn validate_no_hallucination(original: &str, standalone: &str, history: &[String]) -> bool {
    let rewriter = QueryRewriter::new();

    let mut allowed: std::collections::HashSet<String> = rewriter
        .extract_entities(original)
        .into_iter()
        .map(|e| e.value.to_lowercase())
        .collect();
    for msg in history {
        for entity in rewriter.extract_entities(msg) {
            allowed.insert(entity.value.to_lowercase());
        }
    }

    for entity in rewriter.extract_entities(standalone) {
        if !allowed.contains(&entity.value.to_lowercase()) {
            tracing::warn!(entity = %entity.value, "Rewrite guardrail: hallucinated entity");
            return false;
        }
    }
    true
}

/// Guardrail 3: the standalone query stays within 0.5×–3× of the original
/// length.
pub fn validate_sanity(original: &str, standalone: &str) -> bool {
    if original.is_empty() {
        return true;
    }
    let ratio = standalone.chars().count() as f32 / original.chars().count() as f32;
    if !(0.5..=3.0).contains(&ratio) {
        tracing::warn!(ratio, "Rewrite guardrail: length ratio out of bounds");
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_needs_rewrite_pronoun() {
        let rewriter = QueryRewriter::new();
        assert!(rewriter.needs_rewrite("Vad säger den om samtycke?"));
        assert!(!rewriter.needs_rewrite("Vad säger GDPR om samtycke och behandling?"));
    }

    #[test]
    fn test_needs_rewrite_short_without_entity() {
        let rewriter = QueryRewriter::new();
        assert!(rewriter.needs_rewrite("och sedan?"));
        // Short but contains an explicit entity
        assert!(!rewriter.needs_rewrite("GDPR samtycke?"));
    }

    #[test]
    fn test_extract_sfs_number() {
        let rewriter = QueryRewriter::new();
        let entities = rewriter.extract_entities("Vad säger 1998:204 om detta?");
        assert!(entities
            .iter()
            .any(|e| e.kind == EntityKind::Sfs && e.value == "1998:204" && e.confidence == 1.0));
    }

    #[test]
    fn test_extract_chapter_and_paragraph() {
        let rewriter = QueryRewriter::new();
        let entities = rewriter.extract_entities("Se 2 kap. 1 § regeringsformen");
        assert!(entities.iter().any(|e| e.kind == EntityKind::Kapitel && e.value == "2"));
        assert!(entities.iter().any(|e| e.kind == EntityKind::Paragraf && e.value == "1"));
    }

    #[test]
    fn test_extract_abbreviation_case_insensitive() {
        let rewriter = QueryRewriter::new();
        let entities = rewriter.extract_entities("vad säger gdpr?");
        assert!(entities.iter().any(|e| e.kind == EntityKind::Lag && e.value == "GDPR"));
    }

    #[test]
    fn test_rewrite_substitutes_history_entity() {
        let rewriter = QueryRewriter::new();
        let history = vec!["Berätta om GDPR".to_string()];
        let result = rewriter.rewrite("Vad säger den om samtycke?", &history);
        assert!(result.needs_rewrite);
        assert!(result.standalone_query.contains("GDPR"));
        assert!(!result.standalone_query.to_lowercase().starts_with("vad säger den"));
    }

    #[test]
    fn test_rewrite_without_history_is_identity() {
        let rewriter = QueryRewriter::new();
        let result = rewriter.rewrite("Vad säger den?", &[]);
        assert_eq!(result.standalone_query, "Vad säger den?");
    }

    #[test]
    fn test_must_include_from_entities() {
        let rewriter = QueryRewriter::new();
        let result = rewriter.rewrite("Vad säger GDPR och 2018:218?", &[]);
        assert!(result.must_include.contains(&"GDPR".to_string()));
        assert!(result.must_include.contains(&"2018:218".to_string()));
    }

    #[test]
    fn test_lexical_query_preserves_order_and_filters_stopwords() {
        let rewriter = QueryRewriter::new();
        let result = rewriter.rewrite("Vad säger GDPR om personuppgifter och samtycke?", &[]);
        assert!(result.lexical_query.starts_with("GDPR"));
        assert!(result.lexical_query.contains("personuppgifter"));
        assert!(result.lexical_query.contains("samtycke"));
        assert!(!result.lexical_query.contains(" och "));
    }

    #[test]
    fn test_guardrail_must_include() {
        let result = RewriteResult {
            must_include: vec!["GDPR".to_string()],
            ..Default::default()
        };
        assert!(validate_must_include(&result, &["Om GDPR och samtycke".to_string()]));
        assert!(!validate_must_include(&result, &["Om skatterätt".to_string()]));
    }

    #[test]
    fn test_guardrail_no_hallucination() {
        let history = vec!["Berätta om GDPR".to_string()];
        assert!(validate_no_hallucination(
            "Vad säger den?",
            "Vad säger GDPR?",
            &history
        ));
        assert!(!validate_no_hallucination("Vad säger den?", "Vad säger OSL?", &history));
    }

    #[test]
    fn test_guardrail_sanity_bounds() {
        assert!(validate_sanity("Vad säger GDPR?", "Vad säger GDPR om samtycke?"));
        assert!(!validate_sanity("Vad säger GDPR?", "a"));
        let long = "x".repeat(200);
        assert!(!validate_sanity("Vad säger GDPR?", &long));
    }

    #[test]
    fn test_priority_lag_over_authority() {
        let rewriter = QueryRewriter::new();
        let history = vec!["IMY har uttalat sig om GDPR".to_string()];
        let result = rewriter.rewrite("Vad säger den?", &history);
        // Abbreviated statute outranks the authority in substitution priority
        assert!(result.standalone_query.contains("GDPR"));
    }
}
