//! Query classification and decontextualization.
//!
//! Classifies queries into CHAT/ASSIST/EVIDENCE (CHAT is checked before
//! EVIDENCE), rewrites follow-ups using the conversation history window, and
//! extracts search keywords. Classification never fails: an empty query falls
//! through to ASSIST.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use lagrum_core::{history_window, EvidenceLevel, ResponseMode, Turn, TurnRole};

/// Result of query classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryClassification {
    pub mode: ResponseMode,
    pub reason: String,
}

/// Result of query decontextualization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecontextualizedQuery {
    pub original_query: String,
    pub rewritten_query: String,
    pub detected_entities: Vec<String>,
    pub confidence: f32,
}

static CHAT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"^(hej|tjena|hallå|hejsan|god\s+(morgon|dag|kväll))[\s!?]*$",
        r"^(tack|tackar|bra jobbat|fint)[\s!?]*$",
        r"^(vem är du|vad kan du|hur funkar du)[\s!?]*",
        r"^(ja|nej|ok|okej|alright)[\s!?]*$",
    ]
    .iter()
    .map(|p| Regex::new(&format!("(?i){p}")).unwrap())
    .collect()
});

static EVIDENCE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"vad säger (lagen|lagstiftningen|rf|gdpr|osl|tf)",
        r"enligt \d+\s*(kap|§|kapitel)",
        r"\d+\s*kap\.?\s*\d+\s*§",
        r"visa (paragrafen|lagtext|källa|citera)\s*",
        r"(sfs|prop|sou)\s*\d{4}:\d+",
    ]
    .iter()
    .map(|p| Regex::new(&format!("(?i){p}")).unwrap())
    .collect()
});

static FOLLOWUP_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"^och\s+",
        r"^men\s+",
        r"^vad\s+med\s+",
        r"^hur\s+är\s+det\s+med",
        r"^den\s+",
        r"^det\s+",
        r"^samma\s+",
        r"^enligt\s+\w+\?$",
    ]
    .iter()
    .map(|p| Regex::new(&format!("(?i){p}")).unwrap())
    .collect()
});

static LEGAL_ENTITY_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"\bGDPR\b",
        r"\bOSL\b|offentlighets.*lagen",
        r"\bTF\b|tryckfrihetsförordningen",
        r"\bRF\b|regeringsformen",
        r"SFS\s*\d{4}:\d+",
        r"prop\.\s*\d{4}/\d{2,4}:\d+",
        r"SOU\s*\d{4}:\d+",
        r"personuppgiftslagen|\bPuL\b",
    ]
    .iter()
    .map(|p| Regex::new(&format!("(?i){p}")).unwrap())
    .collect()
});

static QUESTION_PHRASES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"^vad är\s+",
        r"^vad säger\s+",
        r"^vad innebär\s+",
        r"^hur fungerar\s+",
        r"^hur funkar\s+",
        r"^berätta om\s+",
        r"^förklara\s+",
        r"^beskriv\s+",
        r"^vilka\s+",
        r"^vilket\s+",
        r"^vilken\s+",
    ]
    .iter()
    .map(|p| Regex::new(&format!("(?i){p}")).unwrap())
    .collect()
});

static STOPWORDS: Lazy<std::collections::HashSet<&'static str>> = Lazy::new(|| {
    [
        "och", "i", "att", "en", "ett", "det", "som", "av", "för", "med", "till", "på", "är",
        "om", "har", "de", "den", "vara", "vad", "var", "hur", "när", "kan", "ska", "inte",
        "eller", "men", "så", "från", "vid", "ut", "upp", "få", "ta", "ge", "göra", "finns",
        "alla", "än", "dessa", "detta", "vilka", "vilket", "vilken", "sin", "sina", "sig",
        "oss", "vi", "ni", "dom", "dem", "deras", "vår", "vårt", "våra", "han", "hon",
        "hennes", "hans", "ja", "nej", "bara", "mycket", "mer", "mest", "enligt", "säger",
        "gäller", "berätta", "förklara", "beskriv",
    ]
    .into_iter()
    .collect()
});

static PUNCT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"[?!.,;:"']"#).unwrap());

/// Query classification and decontextualization.
pub struct QueryProcessor;

impl QueryProcessor {
    pub fn new() -> Self {
        Self
    }

    /// Classify a query into a response mode. CHAT patterns are checked
    /// before EVIDENCE; the default is ASSIST.
    pub fn classify(&self, query: &str) -> QueryClassification {
        let trimmed = query.trim();

        for pattern in CHAT_PATTERNS.iter() {
            if pattern.is_match(trimmed) {
                return QueryClassification {
                    mode: ResponseMode::Chat,
                    reason: format!("Matched CHAT pattern: {}", pattern.as_str()),
                };
            }
        }

        for pattern in EVIDENCE_PATTERNS.iter() {
            if pattern.is_match(trimmed) {
                return QueryClassification {
                    mode: ResponseMode::Evidence,
                    reason: format!("Matched EVIDENCE pattern: {}", pattern.as_str()),
                };
            }
        }

        QueryClassification {
            mode: ResponseMode::Assist,
            reason: "Default classification (neither CHAT nor EVIDENCE patterns)".to_string(),
        }
    }

    /// Rewrite a follow-up question to be standalone using conversation
    /// history. The last six turns are consulted; confidence rises with the
    /// number of detected entities.
    pub fn decontextualize(&self, query: &str, history: &[Turn]) -> DecontextualizedQuery {
        if history.len() < 2 {
            return DecontextualizedQuery {
                original_query: query.to_string(),
                rewritten_query: query.to_string(),
                detected_entities: Vec::new(),
                confidence: 0.0,
            };
        }

        let trimmed = query.trim();
        let is_followup = FOLLOWUP_PATTERNS.iter().any(|p| p.is_match(trimmed));

        // Long questions are usually self-contained
        if !is_followup && trimmed.chars().count() > 30 {
            return DecontextualizedQuery {
                original_query: query.to_string(),
                rewritten_query: query.to_string(),
                detected_entities: Vec::new(),
                confidence: 0.5,
            };
        }

        let window = history_window(history);
        let mut last_user = None;
        let mut last_assistant = None;
        for turn in window.iter().rev() {
            match turn.role {
                TurnRole::User if last_user.is_none() => last_user = Some(turn.content.as_str()),
                TurnRole::Assistant if last_assistant.is_none() => {
                    last_assistant = Some(turn.content.as_str())
                }
                _ => {}
            }
            if last_user.is_some() && last_assistant.is_some() {
                break;
            }
        }

        let Some(last_user) = last_user else {
            return DecontextualizedQuery {
                original_query: query.to_string(),
                rewritten_query: query.to_string(),
                detected_entities: Vec::new(),
                confidence: 0.3,
            };
        };

        let context = format!("{last_user} {}", last_assistant.unwrap_or(""));
        let entities = self.extract_legal_entities(&context);

        if entities.is_empty() {
            return DecontextualizedQuery {
                original_query: query.to_string(),
                rewritten_query: query.to_string(),
                detected_entities: Vec::new(),
                confidence: 0.4,
            };
        }

        let context_str = entities
            .iter()
            .take(3)
            .cloned()
            .collect::<Vec<_>>()
            .join(", ");
        let confidence = (0.5 + entities.len() as f32 * 0.1).min(0.9);

        let rewritten = if is_followup {
            format!("Angående {context_str}: {query}")
        } else {
            format!("{query} (kontext: {context_str})")
        };

        tracing::info!(
            original = query,
            rewritten = %rewritten,
            confidence,
            "Decontextualized query"
        );

        DecontextualizedQuery {
            original_query: query.to_string(),
            rewritten_query: rewritten,
            detected_entities: entities,
            confidence,
        }
    }

    /// Detect legal entities, normalized to uppercase, first occurrence kept.
    pub fn extract_legal_entities(&self, text: &str) -> Vec<String> {
        let mut entities: Vec<String> = Vec::new();
        for pattern in LEGAL_ENTITY_PATTERNS.iter() {
            for m in pattern.find_iter(text) {
                let normalized = m.as_str().to_uppercase();
                if !entities.contains(&normalized) {
                    entities.push(normalized);
                }
            }
        }
        entities
    }

    /// Extract search keywords: strip question phrases and punctuation,
    /// filter stopwords and short tokens, sort by length descending (Swedish
    /// compounds carry the most signal).
    pub fn extract_keywords(&self, query: &str) -> Vec<String> {
        let mut clean = query.to_lowercase();
        for phrase in QUESTION_PHRASES.iter() {
            clean = phrase.replace(&clean, "").to_string();
        }
        let clean = PUNCT_RE.replace_all(&clean, "");

        let mut seen = std::collections::HashSet::new();
        let mut keywords: Vec<String> = clean
            .split_whitespace()
            .filter(|w| w.chars().count() >= 3 && !STOPWORDS.contains(w))
            .filter(|w| seen.insert(w.to_string()))
            .map(|w| w.to_string())
            .collect();

        keywords.sort_by(|a, b| b.chars().count().cmp(&a.chars().count()));
        keywords
    }

    /// Evidence level from source quality: HIGH needs ≥2 sources scoring >0.7
    /// with statute/bill doc types, or mean >0.75; LOW needs mean >0.4.
    pub fn determine_evidence_level(
        &self,
        sources: &[(f32, Option<&str>)],
        _answer: &str,
    ) -> EvidenceLevel {
        if sources.is_empty() {
            return EvidenceLevel::None;
        }

        let high_quality = sources
            .iter()
            .filter(|(score, doc_type)| {
                *score > 0.7 && matches!(*doc_type, Some("sfs") | Some("prop"))
            })
            .count();
        let avg = sources.iter().map(|(s, _)| s).sum::<f32>() / sources.len() as f32;

        if high_quality >= 2 || avg > 0.75 {
            EvidenceLevel::High
        } else if avg > 0.4 {
            EvidenceLevel::Low
        } else {
            EvidenceLevel::None
        }
    }
}

impl Default for QueryProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processor() -> QueryProcessor {
        QueryProcessor::new()
    }

    #[test]
    fn test_classify_chat_greeting() {
        assert_eq!(processor().classify("Hej!").mode, ResponseMode::Chat);
        assert_eq!(processor().classify("tack!").mode, ResponseMode::Chat);
        assert_eq!(processor().classify("Vem är du?").mode, ResponseMode::Chat);
    }

    #[test]
    fn test_classify_evidence_statute() {
        assert_eq!(
            processor().classify("Vad säger lagen om personuppgifter?").mode,
            ResponseMode::Evidence
        );
        assert_eq!(processor().classify("Visa paragrafen").mode, ResponseMode::Evidence);
        assert_eq!(processor().classify("SFS 2018:218").mode, ResponseMode::Evidence);
        assert_eq!(
            processor().classify("Vad säger 2 kap. 1 § regeringsformen?").mode,
            ResponseMode::Evidence
        );
    }

    #[test]
    fn test_chat_checked_before_evidence() {
        // A greeting never becomes EVIDENCE even if followed by legal words
        assert_eq!(processor().classify("hej").mode, ResponseMode::Chat);
    }

    #[test]
    fn test_classify_default_assist() {
        assert_eq!(
            processor().classify("Berätta om yttrandefrihet").mode,
            ResponseMode::Assist
        );
    }

    #[test]
    fn test_classify_empty_is_assist() {
        assert_eq!(processor().classify("").mode, ResponseMode::Assist);
    }

    #[test]
    fn test_decontextualize_followup() {
        let history = vec![
            Turn::user("Berätta om GDPR."),
            Turn::assistant("GDPR är dataskyddsförordningen..."),
        ];
        let result = processor().decontextualize("Och enligt OSL?", &history);
        assert!(result.rewritten_query.contains("GDPR"));
        assert!(result.rewritten_query.starts_with("Angående"));
        assert!(result.confidence > 0.5);
    }

    #[test]
    fn test_decontextualize_no_history() {
        let result = processor().decontextualize("Vad säger den?", &[]);
        assert_eq!(result.rewritten_query, "Vad säger den?");
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn test_decontextualize_long_query_untouched() {
        let history = vec![Turn::user("Berätta om GDPR."), Turn::assistant("...")];
        let query = "Vilka krav ställer dataskyddsförordningen på personuppgiftsbiträden?";
        let result = processor().decontextualize(query, &history);
        assert_eq!(result.rewritten_query, query);
    }

    #[test]
    fn test_extract_keywords_sorted_by_length() {
        let keywords = processor().extract_keywords("Vad säger lagen om personuppgiftsbehandling?");
        assert!(!keywords.is_empty());
        assert_eq!(keywords[0], "personuppgiftsbehandling");
        for pair in keywords.windows(2) {
            assert!(pair[0].chars().count() >= pair[1].chars().count());
        }
    }

    #[test]
    fn test_extract_keywords_strips_question_phrase() {
        let keywords = processor().extract_keywords("Berätta om tryckfrihetsförordningen");
        assert_eq!(keywords, vec!["tryckfrihetsförordningen".to_string()]);
    }

    #[test]
    fn test_evidence_level_high() {
        let sources = vec![(0.8, Some("sfs")), (0.75, Some("prop")), (0.3, Some("guide"))];
        assert_eq!(
            processor().determine_evidence_level(&sources, ""),
            EvidenceLevel::High
        );
    }

    #[test]
    fn test_evidence_level_low() {
        let sources = vec![(0.5, Some("guide")), (0.45, None)];
        assert_eq!(processor().determine_evidence_level(&sources, ""), EvidenceLevel::Low);
    }

    #[test]
    fn test_evidence_level_none() {
        assert_eq!(processor().determine_evidence_level(&[], ""), EvidenceLevel::None);
        let weak = vec![(0.2, Some("guide"))];
        assert_eq!(processor().determine_evidence_level(&weak, ""), EvidenceLevel::None);
    }
}
