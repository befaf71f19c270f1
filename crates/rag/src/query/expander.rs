//! Multi-query expansion for RAG-Fusion.
//!
//! Generates up to three variants: Q0 semantic (the standalone query), Q1
//! lexical (the rewriter's keyword query), Q2 rule-based paraphrase. A weak
//! paraphrase is dropped rather than padded.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use super::rewriter::{DetectedEntity, EntityKind, RewriteResult};

/// Kind of a query variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariantKind {
    Semantic,
    Lexical,
    Paraphrase,
}

/// Result of query expansion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpandedQueries {
    pub original: String,
    /// Ordered variants; the first is always the standalone query.
    pub queries: Vec<String>,
    pub query_kinds: Vec<VariantKind>,
    pub expansion_latency_ms: f64,
}

/// Swedish question patterns → keyword templates.
static QUESTION_PATTERNS: Lazy<Vec<(Regex, fn(&regex::Captures) -> String)>> = Lazy::new(|| {
    vec![
        (
            Regex::new(r"(?i)^vad säger (.+?) om (.+?)\?*$").unwrap(),
            (|c| format!("{} {}", &c[1], &c[2])) as fn(&regex::Captures) -> String,
        ),
        (
            Regex::new(r"(?i)^hur fungerar (.+?)\?*$").unwrap(),
            |c| format!("{} funktioner egenskaper", &c[1]),
        ),
        (
            Regex::new(r"(?i)^vilka (.+?) finns i (.+?)\?*$").unwrap(),
            |c| format!("{} {}", &c[2], &c[1]),
        ),
        (
            Regex::new(r"(?i)^vad är (.+?)\?*$").unwrap(),
            |c| format!("{} definition betydelse", &c[1]),
        ),
        (
            Regex::new(r"(?i)^när gäller (.+?)\?*$").unwrap(),
            |c| format!("{} tillämpning ikraftträdande", &c[1]),
        ),
        (
            Regex::new(r"(?i)^vem ansvarar för (.+?)\?*$").unwrap(),
            |c| format!("{} ansvar myndighet", &c[1]),
        ),
    ]
});

/// Legal context words added when paraphrasing around a known statute.
static LEGAL_CONTEXT_WORDS: Lazy<Vec<(&'static str, [&'static str; 3])>> = Lazy::new(|| {
    vec![
        ("GDPR", ["dataskydd", "personuppgifter", "integritet"]),
        ("OSL", ["sekretess", "offentlighet", "allmän handling"]),
        ("RF", ["grundlag", "regeringsform", "konstitution"]),
        ("TF", ["tryckfrihet", "yttrandefrihet", "press"]),
        ("YGL", ["yttrandefrihet", "media", "radio"]),
        ("SoL", ["socialtjänst", "bistånd", "omsorg"]),
        ("LAS", ["anställning", "uppsägning", "arbetsrätt"]),
        ("PBL", ["bygglov", "detaljplan", "planering"]),
    ]
});

static SFS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(\d{4}:\d+)\b").unwrap());
static WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\w+").unwrap());

static PARAPHRASE_STOPWORDS: Lazy<std::collections::HashSet<&'static str>> = Lazy::new(|| {
    [
        "vad", "hur", "när", "var", "vilka", "vilken", "vilket", "är", "finns", "gäller",
        "säger", "innebär", "betyder", "om", "i", "på", "för", "med", "av", "till", "den",
        "det", "och", "eller", "som", "att", "kan", "ska", "måste",
    ]
    .into_iter()
    .collect()
});

/// Generates query variants for fusion retrieval.
pub struct QueryExpander {
    max_queries: usize,
}

impl QueryExpander {
    pub fn new(max_queries: usize) -> Self {
        Self { max_queries }
    }

    /// Expand the standalone query into ≤`num_queries` variants.
    pub fn expand(
        &self,
        query: &str,
        rewrite: &RewriteResult,
        num_queries: Option<usize>,
    ) -> ExpandedQueries {
        let start = Instant::now();
        let max_q = num_queries.unwrap_or(self.max_queries);

        let mut queries = vec![query.to_string()];
        let mut kinds = vec![VariantKind::Semantic];

        // Q1: lexical variant from the rewriter
        let lexical = rewrite.lexical_query.trim();
        if !lexical.is_empty() && lexical != query && queries.len() < max_q {
            queries.push(lexical.to_string());
            kinds.push(VariantKind::Lexical);
        }

        // Q2: rule-based paraphrase
        if queries.len() < max_q {
            if let Some(paraphrase) = self.generate_paraphrase(query, &rewrite.detected_entities) {
                if !queries.contains(&paraphrase) {
                    queries.push(paraphrase);
                    kinds.push(VariantKind::Paraphrase);
                }
            }
        }

        queries.truncate(max_q);
        kinds.truncate(max_q);

        let result = ExpandedQueries {
            original: query.to_string(),
            queries,
            query_kinds: kinds,
            expansion_latency_ms: start.elapsed().as_secs_f64() * 1000.0,
        };

        tracing::debug!(variants = result.queries.len(), "Query expansion");
        result
    }

    fn generate_paraphrase(&self, query: &str, entities: &[DetectedEntity]) -> Option<String> {
        let trimmed = query.trim();

        // Strategy 1: question pattern templates
        for (pattern, template) in QUESTION_PATTERNS.iter() {
            if let Some(caps) = pattern.captures(trimmed) {
                return Some(template(&caps).trim().to_string());
            }
        }

        // Strategy 2: entity-focused reformulation with legal context words
        for entity in entities.iter().filter(|e| e.kind == EntityKind::Lag) {
            let upper = entity.value.to_uppercase();
            if let Some((_, words)) = LEGAL_CONTEXT_WORDS.iter().find(|(abbr, _)| *abbr == upper) {
                let keywords = self.extract_keywords(query);
                return Some(
                    format!("{} {} {} {}", entity.value, words[0], words[1], keywords.join(" "))
                        .trim()
                        .to_string(),
                );
            }
        }

        // Strategy 3: plain keyword extraction for short queries
        if query.split_whitespace().count() <= 5 {
            let keywords = self.extract_keywords(query);
            if !keywords.is_empty() {
                return Some(keywords.join(" "));
            }
        }

        None
    }

    fn extract_keywords(&self, query: &str) -> Vec<String> {
        WORD_RE
            .find_iter(&query.to_lowercase())
            .map(|m| m.as_str().to_string())
            .filter(|w| w.chars().count() > 2 && !PARAPHRASE_STOPWORDS.contains(w.as_str()))
            .collect()
    }
}

impl Default for QueryExpander {
    fn default() -> Self {
        Self::new(lagrum_config::constants::retrieval::MAX_QUERY_VARIANTS)
    }
}

/// Guardrail: expanded variants must not introduce SFS numbers absent from
/// the original query and its detected entities.
pub fn validate_no_hallucinated_statutes(
    original_query: &str,
    expanded: &ExpandedQueries,
    entities: &[DetectedEntity],
) -> bool {
    let mut allowed: std::collections::HashSet<String> =
        SFS_RE.find_iter(original_query).map(|m| m.as_str().to_string()).collect();
    for entity in entities.iter().filter(|e| e.kind == EntityKind::Sfs) {
        allowed.insert(entity.value.clone());
    }

    for (i, query) in expanded.queries.iter().enumerate().skip(1) {
        for m in SFS_RE.find_iter(query) {
            if !allowed.contains(m.as_str()) {
                tracing::warn!(
                    variant = i,
                    statute = m.as_str(),
                    "Expansion guardrail: hallucinated SFS number"
                );
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::rewriter::QueryRewriter;

    fn rewrite(query: &str) -> RewriteResult {
        QueryRewriter::new().rewrite(query, &[])
    }

    #[test]
    fn test_first_variant_is_standalone() {
        let expander = QueryExpander::new(3);
        let r = rewrite("Vad säger GDPR om samtycke?");
        let expanded = expander.expand(&r.standalone_query, &r, None);
        assert_eq!(expanded.queries[0], r.standalone_query);
        assert_eq!(expanded.query_kinds[0], VariantKind::Semantic);
    }

    #[test]
    fn test_lexical_variant_included() {
        let expander = QueryExpander::new(3);
        let r = rewrite("Vad säger GDPR om samtycke och personuppgifter?");
        let expanded = expander.expand(&r.standalone_query, &r, None);
        assert!(expanded.query_kinds.contains(&VariantKind::Lexical));
    }

    #[test]
    fn test_question_pattern_paraphrase() {
        let expander = QueryExpander::new(3);
        let mut r = rewrite("Vad säger OSL om sekretess?");
        r.lexical_query = String::new(); // force the paraphrase slot
        let expanded = expander.expand("Vad säger OSL om sekretess?", &r, None);
        assert!(expanded
            .queries
            .iter()
            .any(|q| q.to_lowercase().contains("osl") && q.to_lowercase().contains("sekretess")));
    }

    #[test]
    fn test_max_queries_respected() {
        let expander = QueryExpander::new(3);
        let r = rewrite("Vad säger GDPR om samtycke?");
        let expanded = expander.expand(&r.standalone_query, &r, Some(2));
        assert!(expanded.queries.len() <= 2);
    }

    #[test]
    fn test_short_query_keyword_fallback() {
        let expander = QueryExpander::new(3);
        let mut r = rewrite("yttrandefrihet grundlag");
        r.lexical_query = String::new();
        let expanded = expander.expand("yttrandefrihet grundlag", &r, None);
        // A keyword paraphrase may coincide with the original; at minimum the
        // semantic variant survives and nothing is padded beyond 3.
        assert!(!expanded.queries.is_empty() && expanded.queries.len() <= 3);
    }

    #[test]
    fn test_no_hallucinated_statutes_guardrail() {
        let r = rewrite("Vad säger 2018:218?");
        let good = ExpandedQueries {
            original: "Vad säger 2018:218?".to_string(),
            queries: vec!["Vad säger 2018:218?".to_string(), "2018:218 dataskydd".to_string()],
            query_kinds: vec![VariantKind::Semantic, VariantKind::Lexical],
            expansion_latency_ms: 0.0,
        };
        assert!(validate_no_hallucinated_statutes(
            "Vad säger 2018:218?",
            &good,
            &r.detected_entities
        ));

        let bad = ExpandedQueries {
            queries: vec!["Vad säger 2018:218?".to_string(), "1998:204 dataskydd".to_string()],
            ..good
        };
        assert!(!validate_no_hallucinated_statutes(
            "Vad säger 2018:218?",
            &bad,
            &r.detected_entities
        ));
    }
}
