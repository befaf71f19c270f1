//! Rule-based intent classification for collection routing.
//!
//! Priority order: smalltalk, abbreviation edge, clarification edge,
//! parliament trace, policy arguments, research synthesis, practical process,
//! legal text, unknown.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Query intent categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryIntent {
    /// "Vad säger lagen?"
    LegalText,
    /// "Hur har riksdagen behandlat X?"
    ParliamentTrace,
    /// "Vilka argument använde partierna?"
    PolicyArguments,
    /// "Vad säger forskningen?"
    Research,
    /// "Hur överklagar jag?"
    Practical,
    /// Exact abbreviation references ("RF 2:1").
    EdgeAbbreviation,
    /// Disambiguation queries.
    EdgeClarification,
    /// Greetings, off-topic.
    Smalltalk,
    Unknown,
}

impl QueryIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryIntent::LegalText => "legal_text",
            QueryIntent::ParliamentTrace => "parliament_trace",
            QueryIntent::PolicyArguments => "policy_arguments",
            QueryIntent::Research => "research",
            QueryIntent::Practical => "practical",
            QueryIntent::EdgeAbbreviation => "edge_abbr",
            QueryIntent::EdgeClarification => "edge_clar",
            QueryIntent::Smalltalk => "smalltalk",
            QueryIntent::Unknown => "unknown",
        }
    }
}

/// Result of intent classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentResult {
    pub intent: QueryIntent,
    pub confidence: f32,
    pub matched_patterns: Vec<String>,
    pub suggested_collections: Vec<String>,
}

/// Two-pass routing configuration for an intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentRoutingConfig {
    /// Tier A collections for pass 1.
    pub primary: Vec<String>,
    /// Tier B supporting collections, lower ranking priority.
    pub support: Vec<String>,
    /// Tier C research collections for pass 2, budget-capped.
    pub secondary: Vec<String>,
    /// Maximum chunks allowed from secondary collections.
    pub secondary_budget: usize,
    /// Whether answers must separate primary-sourced statements from
    /// secondary ones.
    pub require_separation: bool,
}

const SFS_COLLECTION: &str = "sfs_lagtext";
const RIKSDAG_COLLECTION: &str = "riksdag_documents";
const GOV_COLLECTION: &str = "swedish_gov_docs";
const GUIDES_COLLECTION: &str = "procedural_guides";
const RESEARCH_COLLECTION: &str = "diva_research";

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns.iter().map(|p| Regex::new(&format!("(?i){p}")).unwrap()).collect()
}

static PARLIAMENT_RE: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"\bhur\s+har\s+riksdagen\s+behandlat\b",
        r"\bhur\s+behandlades\b",
        r"\bvilket\s+utskott\b",
        r"\bbetänkande(t|n)?\b",
        r"\bvotering(en)?\b",
        r"\bhur\s+röstade\b",
        r"\bproposition(en)?\s+(om|gällande)\b",
        r"\briksdagsbeslut\b",
        r"\butskottsbehandling\b",
    ])
});

static POLICY_RE: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"\bvilka\s+argument\b",
        r"\bvad\s+(sa|sade|menade)\s+(partierna|oppositionen|regeringen)\b",
        r"\bvilka\s+partier\s+(var\s+för|stödde|motsatte)\b",
        r"\bpolitisk(a)?\s+(argument|position|ståndpunkt)\b",
        r"\bkritik(en)?\s+mot\b",
    ])
});

static RESEARCH_RE: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"\bvad\s+säger\s+forskningen\b",
        r"\bevidens\s+(för|om|visar|finns)\b",
        r"\bstudier\s+(visar|om)\b",
        r"\bforskningsläge(t)?\b",
        r"\bmeta-?analys\b",
        r"\bvetenskaplig(a|t)?\s+(stöd|belägg)\b",
    ])
});

static PRACTICAL_RE: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"\bhur\s+fungerar\b",
        r"\bhur\s+gör\s+(man|jag)\b",
        r"\bhur\s+begär\b",
        r"\bhur\s+överklagar\b",
        r"\bhur\s+ansöker\b",
        r"\bhur\s+får\s+(man|jag)\b",
        r"\bhur\s+kan\s+(man|jag)\b",
        r"\bvilka\s+steg\b",
        r"\bvad\s+är\s+processen\b",
        r"\bvad\s+innebär\s+\w*skyldighet",
        r"\bvad\s+innebär\s+\w*princip",
        r"\bskillnaden\s+mellan\b",
        r"\bsteg\s+för\s+steg\b",
        r"\bpraktiskt\b",
        r"\bi\s+praktiken\b",
    ])
});

static LEGAL_RE: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"\bvad\s+säger\b",
        r"\benligt\s+(RF|TF|YGL|OSL|FL|BrB|RB)",
        r"\bvad\s+står\s+i\b",
        r"\b(regeringsformen|tryckfrihetsförordningen|yttrandefrihetsgrundlagen)\b",
        r"\b(offentlighets-?\s*och\s*sekretesslagen|förvaltningslagen|brottsbalken)\b",
        r"\bvilka\s+(grundläggande\s+)?rättigheter\b",
        r"\bvilka\s+fri-?\s*och\s*rättigheter\b",
        r"\bgrundlag(en|ar|arna)?\b",
        r"\b\d+\s*kap\.?\s*\d*\s*§\b",
    ])
});

static ABBREV_RE: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"\b(RF|TF|YGL|OSL|FL|BrB|RB)\s+\d+[:\s]*\d*\b",
        r"\bvad\s+står\s+i\s+(RF|TF|YGL|OSL)\s+\d+",
    ])
});

static CLARIFICATION_RE: Lazy<Vec<Regex>> =
    Lazy::new(|| compile(&[r"\bmenar\s+du\b", r"\bvilken\s+(av|mellan)\b"]));

static SMALLTALK_RE: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"^hej\b",
        r"^hallå\b",
        r"^god\s+(morgon|dag|kväll)\b",
        r"\bhur\s+mår\s+(du|ni)\b",
        r"\bvad\s+är\s+klockan\b",
        r"^tack\b",
    ])
});

/// Rule-based intent classifier.
pub struct IntentClassifier;

impl IntentClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Collections suggested for an intent, primary first.
    pub fn collections_for_intent(intent: QueryIntent) -> Vec<String> {
        let names: &[&str] = match intent {
            QueryIntent::ParliamentTrace => {
                &[RIKSDAG_COLLECTION, GOV_COLLECTION, SFS_COLLECTION]
            }
            QueryIntent::PolicyArguments => &[RIKSDAG_COLLECTION, GOV_COLLECTION],
            QueryIntent::Research => &[GOV_COLLECTION, RIKSDAG_COLLECTION],
            QueryIntent::Practical => {
                &[GUIDES_COLLECTION, SFS_COLLECTION, GOV_COLLECTION, RIKSDAG_COLLECTION]
            }
            QueryIntent::LegalText => &[SFS_COLLECTION, RIKSDAG_COLLECTION, GOV_COLLECTION],
            QueryIntent::EdgeAbbreviation => &[SFS_COLLECTION, RIKSDAG_COLLECTION],
            QueryIntent::EdgeClarification => &[SFS_COLLECTION, GOV_COLLECTION],
            QueryIntent::Smalltalk => &[],
            QueryIntent::Unknown => &[SFS_COLLECTION, RIKSDAG_COLLECTION, GOV_COLLECTION],
        };
        names.iter().map(|s| s.to_string()).collect()
    }

    /// Static two-pass routing table. Research collections are tier C and
    /// only reachable through an explicit budget.
    pub fn routing_for_intent(intent: QueryIntent) -> IntentRoutingConfig {
        match intent {
            QueryIntent::LegalText | QueryIntent::EdgeAbbreviation => IntentRoutingConfig {
                primary: vec![SFS_COLLECTION.to_string()],
                support: vec![RIKSDAG_COLLECTION.to_string(), GOV_COLLECTION.to_string()],
                secondary: vec![],
                secondary_budget: 0,
                require_separation: false,
            },
            QueryIntent::ParliamentTrace => IntentRoutingConfig {
                primary: vec![RIKSDAG_COLLECTION.to_string()],
                support: vec![GOV_COLLECTION.to_string(), SFS_COLLECTION.to_string()],
                secondary: vec![],
                secondary_budget: 0,
                require_separation: false,
            },
            QueryIntent::PolicyArguments => IntentRoutingConfig {
                primary: vec![RIKSDAG_COLLECTION.to_string()],
                support: vec![GOV_COLLECTION.to_string()],
                secondary: vec![RESEARCH_COLLECTION.to_string()],
                secondary_budget: 2,
                require_separation: true,
            },
            QueryIntent::Research => IntentRoutingConfig {
                primary: vec![GOV_COLLECTION.to_string()],
                support: vec![RIKSDAG_COLLECTION.to_string()],
                secondary: vec![RESEARCH_COLLECTION.to_string()],
                secondary_budget: 4,
                require_separation: true,
            },
            QueryIntent::Practical => IntentRoutingConfig {
                primary: vec![GUIDES_COLLECTION.to_string()],
                support: vec![SFS_COLLECTION.to_string(), GOV_COLLECTION.to_string()],
                secondary: vec![],
                secondary_budget: 0,
                require_separation: false,
            },
            QueryIntent::EdgeClarification => IntentRoutingConfig {
                primary: vec![SFS_COLLECTION.to_string()],
                support: vec![GOV_COLLECTION.to_string()],
                secondary: vec![],
                secondary_budget: 0,
                require_separation: false,
            },
            QueryIntent::Smalltalk => IntentRoutingConfig {
                primary: vec![],
                support: vec![],
                secondary: vec![],
                secondary_budget: 0,
                require_separation: false,
            },
            QueryIntent::Unknown => IntentRoutingConfig {
                primary: vec![SFS_COLLECTION.to_string()],
                support: vec![RIKSDAG_COLLECTION.to_string(), GOV_COLLECTION.to_string()],
                secondary: vec![],
                secondary_budget: 0,
                require_separation: false,
            },
        }
    }

    /// Classify a query.
    pub fn classify(&self, query: &str) -> IntentResult {
        let query_lower = query.to_lowercase();
        let query_lower = query_lower.trim();

        let matches = |patterns: &[Regex], label: &str| -> Vec<String> {
            patterns
                .iter()
                .filter(|re| re.is_match(query_lower))
                .map(|re| format!("{label}:{}", re.as_str()))
                .collect()
        };

        let smalltalk = matches(&SMALLTALK_RE, "smalltalk");
        if !smalltalk.is_empty() {
            return self.result(QueryIntent::Smalltalk, 0.95, smalltalk);
        }

        let abbrev = matches(&ABBREV_RE, "abbrev");
        if !abbrev.is_empty() {
            return self.result(QueryIntent::EdgeAbbreviation, 0.90, abbrev);
        }

        let clar = matches(&CLARIFICATION_RE, "clar");
        if !clar.is_empty() {
            return self.result(QueryIntent::EdgeClarification, 0.85, clar);
        }

        let parliament = matches(&PARLIAMENT_RE, "parliament");
        if !parliament.is_empty() {
            let confidence = (0.70 + parliament.len() as f32 * 0.10).min(0.95);
            return self.result(QueryIntent::ParliamentTrace, confidence, parliament);
        }

        let policy = matches(&POLICY_RE, "policy_arg");
        if !policy.is_empty() {
            let confidence = (0.70 + policy.len() as f32 * 0.10).min(0.95);
            return self.result(QueryIntent::PolicyArguments, confidence, policy);
        }

        let research = matches(&RESEARCH_RE, "research");
        if !research.is_empty() {
            let confidence = (0.70 + research.len() as f32 * 0.10).min(0.95);
            return self.result(QueryIntent::Research, confidence, research);
        }

        let practical = matches(&PRACTICAL_RE, "practical");
        let legal = matches(&LEGAL_RE, "legal");

        // Procedural wins ties: how-to questions about laws are practical.
        if !practical.is_empty() && practical.len() >= legal.len() {
            let confidence = (0.60 + practical.len() as f32 * 0.15).min(0.95);
            return self.result(QueryIntent::Practical, confidence, practical);
        }
        if !legal.is_empty() {
            let confidence = (0.60 + legal.len() as f32 * 0.15).min(0.95);
            return self.result(QueryIntent::LegalText, confidence, legal);
        }

        self.result(QueryIntent::Unknown, 0.30, Vec::new())
    }

    fn result(&self, intent: QueryIntent, confidence: f32, matched: Vec<String>) -> IntentResult {
        IntentResult {
            intent,
            confidence,
            matched_patterns: matched,
            suggested_collections: Self::collections_for_intent(intent),
        }
    }
}

impl Default for IntentClassifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(q: &str) -> IntentResult {
        IntentClassifier::new().classify(q)
    }

    #[test]
    fn test_smalltalk() {
        assert_eq!(classify("Hej, hur mår du?").intent, QueryIntent::Smalltalk);
        assert!(classify("Hej!").suggested_collections.is_empty());
    }

    #[test]
    fn test_abbreviation_edge() {
        assert_eq!(classify("Vad säger RF 2:1?").intent, QueryIntent::EdgeAbbreviation);
    }

    #[test]
    fn test_clarification_edge() {
        assert_eq!(
            classify("Menar du förvaltningslagen eller förvaltningsprocesslagen?").intent,
            QueryIntent::EdgeClarification
        );
    }

    #[test]
    fn test_parliament_trace() {
        assert_eq!(
            classify("Hur har riksdagen behandlat klimatfrågan?").intent,
            QueryIntent::ParliamentTrace
        );
        assert_eq!(
            classify("Vilket utskott hanterade propositionen?").intent,
            QueryIntent::ParliamentTrace
        );
    }

    #[test]
    fn test_policy_arguments() {
        assert_eq!(
            classify("Vilka argument använde Socialdemokraterna?").intent,
            QueryIntent::PolicyArguments
        );
        assert_eq!(
            classify("Vad var oppositionens kritik mot förslaget?").intent,
            QueryIntent::PolicyArguments
        );
    }

    #[test]
    fn test_research_synthesis() {
        assert_eq!(
            classify("Vad säger forskningen om klimatförändringar?").intent,
            QueryIntent::Research
        );
        assert_eq!(classify("Vilken evidens finns för detta?").intent, QueryIntent::Research);
    }

    #[test]
    fn test_practical_process() {
        assert_eq!(
            classify("Hur överklagar jag ett myndighetsbeslut?").intent,
            QueryIntent::Practical
        );
    }

    #[test]
    fn test_legal_text() {
        let result = classify("Vad säger Regeringsformen om yttrandefrihet?");
        assert_eq!(result.intent, QueryIntent::LegalText);
        assert_eq!(result.suggested_collections[0], "sfs_lagtext");
    }

    #[test]
    fn test_chapter_reference_is_legal() {
        assert_eq!(
            classify("Vilka grundläggande rättigheter skyddas i RF 2 kap?").intent,
            QueryIntent::LegalText
        );
    }

    #[test]
    fn test_unknown_default() {
        let result = classify("bananpaj recept");
        assert_eq!(result.intent, QueryIntent::Unknown);
        assert!((result.confidence - 0.30).abs() < 1e-6);
        assert_eq!(result.suggested_collections.len(), 3);
    }

    #[test]
    fn test_routing_smalltalk_empty_primary() {
        let routing = IntentClassifier::routing_for_intent(QueryIntent::Smalltalk);
        assert!(routing.primary.is_empty());
        assert_eq!(routing.secondary_budget, 0);
    }

    #[test]
    fn test_routing_research_has_budget_and_separation() {
        let routing = IntentClassifier::routing_for_intent(QueryIntent::Research);
        assert!(routing.secondary_budget > 0);
        assert!(routing.require_separation);
        assert!(routing.secondary.contains(&"diva_research".to_string()));
    }

    #[test]
    fn test_routing_legal_no_secondary() {
        let routing = IntentClassifier::routing_for_intent(QueryIntent::LegalText);
        assert_eq!(routing.secondary_budget, 0);
        assert!(routing.secondary.is_empty());
    }
}
