//! Confidence signals for adaptive retrieval.
//!
//! Computed from retrieval outputs alone; no LLM calls. Thresholds are
//! calibrated for RRF scores with k=60: the best possible single-variant
//! score at rank 1 is 1/61 ≈ 0.016.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use lagrum_config::constants::confidence as thresholds;

use crate::fusion::FusionMetrics;
use crate::types::SearchResult;

static SFS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{4}:\d+$").unwrap());
static TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\w+").unwrap());

/// All signals used to compute retrieval confidence. Each signal is in
/// [0, 1]; higher means more confident.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfidenceSignals {
    // Reranker signals
    pub top_score: f32,
    /// score(top1) − score(top2), normalized to the score range.
    pub margin: f32,

    // Coverage signals
    pub must_include_hit_rate: f32,
    pub must_include_total: usize,
    pub must_include_found: usize,

    // Fusion signals
    pub fusion_gain: f32,
    pub overlap_ratio: f32,

    // Diversity signals
    pub near_duplicate_ratio: f32,
    pub unique_sources: usize,

    // Query quality signals
    /// Fraction of ≥3-char non-numeric query tokens present in the top-10.
    pub lexical_overlap: f32,
    pub query_token_count: usize,
    pub has_extractable_entities: bool,

    // Derived
    pub overall_confidence: f32,
    pub confidence_tier: ConfidenceTier,
    pub should_abstain: bool,
    pub abstain_reason: String,
}

/// Confidence tier buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceTier {
    High,
    Medium,
    Low,
    #[default]
    VeryLow,
}

impl ConfidenceTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfidenceTier::High => "high",
            ConfidenceTier::Medium => "medium",
            ConfidenceTier::Low => "low",
            ConfidenceTier::VeryLow => "very_low",
        }
    }

    fn from_score(score: f32) -> Self {
        if score >= 0.7 {
            ConfidenceTier::High
        } else if score >= 0.5 {
            ConfidenceTier::Medium
        } else if score >= 0.3 {
            ConfidenceTier::Low
        } else {
            ConfidenceTier::VeryLow
        }
    }
}

/// Computes confidence signals from retrieval results.
pub struct ConfidenceCalculator;

impl ConfidenceCalculator {
    pub fn new() -> Self {
        Self
    }

    /// Compute all signals for a result set.
    pub fn compute(
        &self,
        results: &[SearchResult],
        must_include: &[String],
        fusion_metrics: Option<&FusionMetrics>,
        original_query: &str,
    ) -> ConfidenceSignals {
        let mut signals = ConfidenceSignals::default();

        if results.is_empty() {
            signals.confidence_tier = ConfidenceTier::VeryLow;
            signals.should_abstain = true;
            signals.abstain_reason = "no_results".to_string();
            signals.has_extractable_entities = !must_include.is_empty();
            return signals;
        }

        let (top_score, margin) = Self::reranker_signals(results);
        signals.top_score = top_score;
        signals.margin = margin;

        let (hit_rate, found, total) = Self::coverage_signals(results, must_include);
        signals.must_include_hit_rate = hit_rate;
        signals.must_include_found = found;
        signals.must_include_total = total;

        if let Some(fusion) = fusion_metrics {
            signals.fusion_gain = fusion.fusion_gain;
            signals.overlap_ratio = fusion.overlap_ratio;
        }

        let (near_dup, unique_sources) = Self::diversity_signals(results);
        signals.near_duplicate_ratio = near_dup;
        signals.unique_sources = unique_sources;

        let (overlap, token_count) = Self::lexical_overlap(results, original_query);
        signals.lexical_overlap = overlap;
        signals.query_token_count = token_count;
        signals.has_extractable_entities = !must_include.is_empty();

        // Finding the must_include entities is strong evidence the query is
        // valid even when the literal query words are absent from results
        // (e.g. "dataskyddslagen 2018:218" where only the SFS number occurs).
        if signals.must_include_hit_rate >= 0.5 && signals.has_extractable_entities {
            signals.lexical_overlap =
                signals.lexical_overlap.max(signals.must_include_hit_rate * 0.5);
        }

        signals.overall_confidence = Self::overall_confidence(&signals);
        signals.confidence_tier = ConfidenceTier::from_score(signals.overall_confidence);

        signals
    }

    fn reranker_signals(results: &[SearchResult]) -> (f32, f32) {
        let scores: Vec<f32> = results.iter().take(10).map(|r| r.score).collect();
        if scores.is_empty() {
            return (0.0, 0.0);
        }

        let top = scores[0];
        let margin = if scores.len() >= 2 { scores[0] - scores[1] } else { scores[0] };

        let max = scores.iter().cloned().fold(f32::MIN, f32::max);
        let min = scores.iter().cloned().fold(f32::MAX, f32::min);
        let range = if max > min { max - min } else { 1.0 };
        let margin_normalized = if range > 0.0 { margin / range } else { margin };

        (top.min(1.0), margin_normalized.min(1.0))
    }

    fn coverage_signals(results: &[SearchResult], must_include: &[String]) -> (f32, usize, usize) {
        if must_include.is_empty() {
            return (1.0, 0, 0);
        }

        let combined: String = results
            .iter()
            .take(10)
            .map(|r| format!(" {} {} ", r.snippet, r.title))
            .collect::<String>()
            .to_lowercase();

        let mut found = 0;
        for token in must_include {
            // SFS numbers match exactly; everything else case-insensitively
            let hit = if SFS_RE.is_match(token) {
                combined.contains(token.as_str())
            } else {
                combined.contains(&token.to_lowercase())
            };
            if hit {
                found += 1;
            }
        }

        let total = must_include.len();
        (found as f32 / total as f32, found, total)
    }

    fn diversity_signals(results: &[SearchResult]) -> (f32, usize) {
        if results.is_empty() {
            return (0.0, 0);
        }

        let mut sources: HashSet<String> = HashSet::new();
        let mut near_duplicates = 0usize;
        let mut seen_prefixes: HashSet<String> = HashSet::new();

        for result in results.iter().take(10) {
            let doc_type = result.doc_type.as_deref().unwrap_or("unknown");
            sources.insert(format!("{doc_type}:{}", result.source));

            let title = result.title.to_lowercase();
            let prefix: String = title.chars().take(50).collect();
            if !prefix.is_empty() {
                if seen_prefixes.contains(&prefix) {
                    near_duplicates += 1;
                }
                seen_prefixes.insert(prefix);
            }
        }

        (near_duplicates as f32 / results.len() as f32, sources.len())
    }

    /// Lexical overlap catches gibberish queries that still score moderately
    /// on other signals. Tokens: ≥3 chars, non-numeric, stopwords retained
    /// (stopword hits are exactly what distinguishes Swedish from noise).
    fn lexical_overlap(results: &[SearchResult], query: &str) -> (f32, usize) {
        if query.is_empty() {
            return (0.0, 0);
        }

        let query_lower = query.to_lowercase();
        let tokens: HashSet<&str> = TOKEN_RE
            .find_iter(&query_lower)
            .map(|m| m.as_str())
            .filter(|t| t.chars().count() > 2 && !t.chars().all(|c| c.is_ascii_digit()))
            .collect();

        if tokens.is_empty() {
            return (0.0, 0);
        }

        let combined: String = results
            .iter()
            .take(10)
            .map(|r| format!(" {} {} ", r.snippet, r.title))
            .collect::<String>()
            .to_lowercase();

        let found = tokens.iter().filter(|t| combined.contains(*t)).count();
        (found as f32 / tokens.len() as f32, tokens.len())
    }

    /// Weighted combination. Coverage and lexical overlap weigh heaviest:
    /// a specified entity that is missing, or query tokens absent from every
    /// result, dominate any ranking-shape signal.
    fn overall_confidence(signals: &ConfidenceSignals) -> f32 {
        let diversity = 1.0 - signals.near_duplicate_ratio;
        let fusion_agreement =
            if signals.overlap_ratio > 0.0 { signals.overlap_ratio } else { 0.5 };

        let mut confidence = 0.20 * signals.top_score
            + 0.10 * signals.margin
            + 0.25 * signals.must_include_hit_rate
            + 0.20 * signals.lexical_overlap
            + 0.10 * diversity
            + 0.15 * fusion_agreement;

        if !signals.has_extractable_entities && signals.query_token_count > 0 {
            confidence -= thresholds::EMPTY_ENTITIES_PENALTY;
        }

        confidence.clamp(0.0, 1.0)
    }

    /// Escalation predicate: escalate while any threshold is breached.
    /// Returns the decision and a joined reason string.
    pub fn should_escalate(&self, signals: &ConfidenceSignals) -> (bool, String) {
        let mut reasons = Vec::new();

        if signals.top_score < thresholds::TOP_SCORE_LOW {
            reasons.push(format!(
                "top_score={:.3}<{}",
                signals.top_score,
                thresholds::TOP_SCORE_LOW
            ));
        }
        if signals.margin < thresholds::MARGIN_LOW {
            reasons.push(format!("margin={:.3}<{}", signals.margin, thresholds::MARGIN_LOW));
        }
        if signals.must_include_total > 0
            && signals.must_include_hit_rate < thresholds::MUST_INCLUDE_MIN
        {
            reasons.push(format!(
                "must_include={}/{}",
                signals.must_include_found, signals.must_include_total
            ));
        }
        if signals.near_duplicate_ratio > thresholds::NEAR_DUPLICATE_MAX {
            reasons.push(format!("duplicates={:.2}", signals.near_duplicate_ratio));
        }
        if signals.lexical_overlap < thresholds::LEXICAL_OVERLAP_MIN {
            reasons.push(format!(
                "lexical_overlap={:.2}<{}",
                signals.lexical_overlap,
                thresholds::LEXICAL_OVERLAP_MIN
            ));
        }
        if signals.overall_confidence < thresholds::OVERALL_CONFIDENCE_LOW {
            reasons.push(format!("overall={:.2}", signals.overall_confidence));
        }

        let escalate = !reasons.is_empty();
        let reason = if escalate { reasons.join("; ") } else { "confidence OK".to_string() };
        (escalate, reason)
    }

    /// No-answer policy. Hard abstains apply at any step; the soft
    /// confidence checks only after the final step.
    pub fn should_abstain(
        &self,
        signals: &ConfidenceSignals,
        is_final_step: bool,
    ) -> (bool, String) {
        let mut reasons = Vec::new();

        if signals.lexical_overlap < thresholds::ABSTAIN_LEXICAL_OVERLAP {
            reasons.push("gibberish_query".to_string());
        }
        if signals.top_score == 0.0 {
            reasons.push("no_results".to_string());
        }

        if is_final_step {
            if signals.overall_confidence < thresholds::ABSTAIN_CONFIDENCE {
                reasons.push(format!(
                    "confidence={:.2}<{}",
                    signals.overall_confidence,
                    thresholds::ABSTAIN_CONFIDENCE
                ));
            }
            if !signals.has_extractable_entities
                && signals.lexical_overlap < thresholds::ABSTAIN_NO_ENTITY_OVERLAP
            {
                reasons.push("no_entities_low_overlap".to_string());
            }
        }

        let abstain = !reasons.is_empty();
        (abstain, reasons.join("; "))
    }
}

impl Default for ConfidenceCalculator {
    fn default() -> Self {
        Self::new()
    }
}

// ── Escalation policy ──────────────────────────────────────────────────────

/// Named escalation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EscalationStep {
    A,
    B,
    C,
    D,
}

impl EscalationStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationStep::A => "A",
            EscalationStep::B => "B",
            EscalationStep::C => "C",
            EscalationStep::D => "D",
        }
    }

    pub fn next(&self) -> Option<EscalationStep> {
        match self {
            EscalationStep::A => Some(EscalationStep::B),
            EscalationStep::B => Some(EscalationStep::C),
            EscalationStep::C => Some(EscalationStep::D),
            EscalationStep::D => None,
        }
    }
}

/// Configuration of one escalation step.
#[derive(Debug, Clone, Copy)]
pub struct StepConfig {
    pub num_queries: usize,
    pub k_multiplier: f32,
    /// Search every available collection instead of the routed defaults.
    pub all_collections: bool,
    /// Terminal fallback: keep the previous step's results, mark very_low.
    pub fallback: bool,
}

/// Step table: A = fusion with 2 variants, B = wider k across all
/// collections, C = 3 variants at k×2, D = fallback.
pub fn step_config(step: EscalationStep) -> StepConfig {
    match step {
        EscalationStep::A => StepConfig {
            num_queries: 2,
            k_multiplier: 1.0,
            all_collections: false,
            fallback: false,
        },
        EscalationStep::B => StepConfig {
            num_queries: 2,
            k_multiplier: 2.0,
            all_collections: true,
            fallback: false,
        },
        EscalationStep::C => StepConfig {
            num_queries: 3,
            k_multiplier: 2.0,
            all_collections: true,
            fallback: false,
        },
        EscalationStep::D => StepConfig {
            num_queries: 3,
            k_multiplier: 3.0,
            all_collections: true,
            fallback: true,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RetrieverTag;

    fn doc(id: &str, title: &str, snippet: &str, score: f32) -> SearchResult {
        SearchResult {
            id: id.to_string(),
            title: title.to_string(),
            snippet: snippet.to_string(),
            score,
            source: "sfs_lagtext".to_string(),
            doc_type: Some("sfs".to_string()),
            date: None,
            retriever: RetrieverTag::Fusion,
            tier: None,
            original_score: None,
            query_appearances: None,
        }
    }

    #[test]
    fn test_empty_results_abstain() {
        let calc = ConfidenceCalculator::new();
        let signals = calc.compute(&[], &[], None, "vad säger GDPR?");
        assert!(signals.should_abstain);
        assert_eq!(signals.abstain_reason, "no_results");
        assert_eq!(signals.confidence_tier, ConfidenceTier::VeryLow);
    }

    #[test]
    fn test_must_include_hit_rate() {
        let calc = ConfidenceCalculator::new();
        let results = vec![doc("1", "GDPR artikel 6", "Om samtycke i GDPR", 0.04)];
        let signals = calc.compute(
            &results,
            &["GDPR".to_string(), "2018:218".to_string()],
            None,
            "Vad säger GDPR?",
        );
        assert_eq!(signals.must_include_found, 1);
        assert_eq!(signals.must_include_total, 2);
        assert!((signals.must_include_hit_rate - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_empty_must_include_is_full_hit() {
        let calc = ConfidenceCalculator::new();
        let results = vec![doc("1", "t", "s", 0.04)];
        let signals = calc.compute(&results, &[], None, "fråga");
        assert!((signals.must_include_hit_rate - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_lexical_overlap_detects_gibberish() {
        let calc = ConfidenceCalculator::new();
        let results =
            vec![doc("1", "Regeringsformen", "Om grundläggande fri- och rättigheter", 0.03)];
        let signals = calc.compute(&results, &[], None, "XQZVB NONEXISTENT PLOVER");
        assert!(signals.lexical_overlap < 0.05);
        let (abstain, reason) = calc.should_abstain(&signals, true);
        assert!(abstain);
        assert!(reason.contains("gibberish_query"));
    }

    #[test]
    fn test_lexical_overlap_boost_from_must_include() {
        let calc = ConfidenceCalculator::new();
        // Query words absent from results, but the SFS number is found
        let results = vec![doc("1", "Lag (2018:218)", "Dataskyddslagen 2018:218", 0.04)];
        let signals = calc.compute(
            &results,
            &["2018:218".to_string()],
            None,
            "nymodig okänd lagstiftning",
        );
        assert!(signals.lexical_overlap >= 0.5 * signals.must_include_hit_rate);
    }

    #[test]
    fn test_near_duplicate_detection() {
        let calc = ConfidenceCalculator::new();
        let long_title = "Offentlighets- och sekretesslag (2009:400) kapitel om sekretess";
        let results = vec![
            doc("1", long_title, "s1", 0.05),
            doc("2", long_title, "s2", 0.04),
            doc("3", long_title, "s3", 0.03),
        ];
        let signals = calc.compute(&results, &[], None, "sekretess");
        assert!(signals.near_duplicate_ratio > 0.5);
    }

    #[test]
    fn test_escalation_on_low_top_score() {
        let calc = ConfidenceCalculator::new();
        let results = vec![doc("1", "t", "helt orelaterad text", 0.001)];
        let signals = calc.compute(&results, &[], None, "specifik juridisk fråga");
        let (escalate, reason) = calc.should_escalate(&signals);
        assert!(escalate);
        assert!(reason.contains("top_score"));
    }

    #[test]
    fn test_no_escalation_when_confident() {
        let calc = ConfidenceCalculator::new();
        let fusion = FusionMetrics { overlap_ratio: 0.8, fusion_gain: 0.4, ..Default::default() };
        let results = vec![
            doc("1", "GDPR samtycke", "GDPR reglerar samtycke för personuppgifter", 0.049),
            doc("2", "Dataskydd", "Behandling av personuppgifter enligt GDPR", 0.020),
        ];
        let signals = calc.compute(
            &results,
            &["GDPR".to_string()],
            Some(&fusion),
            "Vad säger GDPR om samtycke personuppgifter?",
        );
        let (escalate, reason) = calc.should_escalate(&signals);
        assert!(!escalate, "unexpected escalation: {reason}");
        assert_eq!(reason, "confidence OK");
    }

    #[test]
    fn test_abstain_only_soft_checks_on_final_step() {
        let calc = ConfidenceCalculator::new();
        let results = vec![doc("1", "Någon titel", "om någon fråga i svensk rätt", 0.02)];
        let signals = calc.compute(&results, &[], None, "om någon fråga");
        // Non-final: moderate overlap, no hard abstain
        let (abstain, _) = calc.should_abstain(&signals, false);
        assert!(!abstain);
    }

    #[test]
    fn test_tier_boundaries() {
        assert_eq!(ConfidenceTier::from_score(0.75), ConfidenceTier::High);
        assert_eq!(ConfidenceTier::from_score(0.55), ConfidenceTier::Medium);
        assert_eq!(ConfidenceTier::from_score(0.35), ConfidenceTier::Low);
        assert_eq!(ConfidenceTier::from_score(0.1), ConfidenceTier::VeryLow);
    }

    #[test]
    fn test_step_progression_terminates() {
        let mut step = EscalationStep::A;
        let mut visited = vec![step];
        while let Some(next) = step.next() {
            step = next;
            visited.push(step);
        }
        assert_eq!(visited.len(), 4);
        assert_eq!(step, EscalationStep::D);
        assert!(step_config(EscalationStep::D).fallback);
    }

    #[test]
    fn test_step_configs() {
        assert_eq!(step_config(EscalationStep::A).num_queries, 2);
        assert_eq!(step_config(EscalationStep::B).k_multiplier, 2.0);
        assert!(step_config(EscalationStep::B).all_collections);
        assert_eq!(step_config(EscalationStep::C).num_queries, 3);
    }
}
