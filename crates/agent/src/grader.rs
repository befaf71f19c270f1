//! Corrective-RAG document grading.
//!
//! Each retrieved document is graded for relevance by a cheap LM returning
//! `{relevant, reason, score}`. Documents are processed in batches of at most
//! `max_concurrent` with a per-batch timeout; a timed-out batch is treated as
//! not relevant and abandoned. Grading failures never fail the request.
//! Filtering preserves the original document order (boolean mask).

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lagrum_core::{GenerationConfig, LanguageModel, Message};
use lagrum_rag::SearchResult;

use crate::structured::parse_llm_json;

/// Grader configuration.
#[derive(Debug, Clone)]
pub struct GraderConfig {
    /// Final relevance requires the model to say relevant AND score ≥ this.
    pub threshold: f32,
    /// Batch size / concurrency cap.
    pub max_concurrent: usize,
    /// Per-batch timeout.
    pub timeout: Duration,
}

impl Default for GraderConfig {
    fn default() -> Self {
        Self { threshold: 0.3, max_concurrent: 5, timeout: Duration::from_secs(10) }
    }
}

/// Grade for one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradeResult {
    pub doc_id: String,
    pub relevant: bool,
    pub reason: String,
    pub score: f32,
    pub confidence: f32,
    pub latency_ms: f64,
}

/// Aggregate metrics for one grading call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GradingMetrics {
    pub total_documents: usize,
    pub relevant_count: usize,
    pub relevant_percentage: f32,
    pub timed_out_batches: usize,
    pub total_latency_ms: f64,
}

/// Complete grading outcome.
#[derive(Debug, Clone)]
pub struct GradingResult {
    /// One grade per input document, original order.
    pub grades: Vec<GradeResult>,
    /// Input documents that passed the grade, original order preserved.
    pub filtered: Vec<SearchResult>,
    pub metrics: GradingMetrics,
}

/// Document grader backed by a cheap LM.
pub struct Grader {
    model: Arc<dyn LanguageModel>,
    config: GraderConfig,
}

impl Grader {
    pub fn new(model: Arc<dyn LanguageModel>, config: GraderConfig) -> Self {
        Self { model, config }
    }

    /// Grade all documents and filter by relevance.
    pub async fn grade_documents(
        &self,
        query: &str,
        documents: &[SearchResult],
    ) -> GradingResult {
        let start = Instant::now();
        let mut grades: Vec<GradeResult> = Vec::with_capacity(documents.len());
        let mut timed_out_batches = 0usize;

        for batch in documents.chunks(self.config.max_concurrent.max(1)) {
            let tasks = batch.iter().map(|doc| self.grade_single(query, doc));

            match tokio::time::timeout(self.config.timeout, join_all(tasks)).await {
                Ok(batch_grades) => grades.extend(batch_grades),
                Err(_) => {
                    // Whole batch abandoned: every document in it counts as
                    // not relevant.
                    timed_out_batches += 1;
                    tracing::warn!(
                        batch_size = batch.len(),
                        timeout_secs = self.config.timeout.as_secs_f64(),
                        "Grading batch timed out"
                    );
                    grades.extend(batch.iter().map(|doc| GradeResult {
                        doc_id: doc.id.clone(),
                        relevant: false,
                        reason: "Grading timeout - treated as irrelevant".to_string(),
                        score: 0.0,
                        confidence: 0.0,
                        latency_ms: self.config.timeout.as_secs_f64() * 1000.0,
                    }));
                }
            }
        }

        // Boolean-mask filter: original order preserved
        let filtered: Vec<SearchResult> = documents
            .iter()
            .zip(grades.iter())
            .filter(|(_, grade)| grade.relevant)
            .map(|(doc, _)| doc.clone())
            .collect();

        let relevant_count = filtered.len();
        let metrics = GradingMetrics {
            total_documents: documents.len(),
            relevant_count,
            relevant_percentage: if documents.is_empty() {
                0.0
            } else {
                relevant_count as f32 / documents.len() as f32 * 100.0
            },
            timed_out_batches,
            total_latency_ms: start.elapsed().as_secs_f64() * 1000.0,
        };

        tracing::info!(
            total = metrics.total_documents,
            relevant = metrics.relevant_count,
            latency_ms = metrics.total_latency_ms,
            "Document grading complete"
        );

        GradingResult { grades, filtered, metrics }
    }

    async fn grade_single(&self, query: &str, document: &SearchResult) -> GradeResult {
        let start = Instant::now();
        let prompt = Self::grading_prompt(query, document);
        let messages = vec![Message::user(prompt)];
        let gen = GenerationConfig { temperature: 0.1, top_p: 0.9, max_tokens: 256 };

        let response = match self.model.chat_complete(messages, gen).await {
            Ok((text, _)) => text,
            Err(e) => {
                tracing::warn!(doc_id = %document.id, error = %e, "Grading call failed");
                return GradeResult {
                    doc_id: document.id.clone(),
                    relevant: false,
                    reason: format!("Bedömning misslyckades: {e}"),
                    score: 0.0,
                    confidence: 0.0,
                    latency_ms: start.elapsed().as_secs_f64() * 1000.0,
                };
            }
        };

        let mut grade = Self::parse_grade(&document.id, &response, self.config.threshold);
        grade.latency_ms = start.elapsed().as_secs_f64() * 1000.0;
        grade
    }

    fn grading_prompt(query: &str, document: &SearchResult) -> String {
        format!(
            r#"Bedöm om detta dokument är relevant för frågan.

FRÅGA: {query}

DOKUMENT:
Titel: {title}
Typ: {doc_type}
Datum: {date}
Innehåll: {snippet}

KONSTITUTIONELLA REGLER FÖR RELEVANS:
1. EXAKT MATCH: Dokumentet handlar om samma ämne som frågan
2. SEMANTISK RELEVANS: Begrepp och termer överlappar meningsfullt
3. LAGSTIFTNING: Lagtexter och förordningar är relevanta för juridiska frågor

Returnera endast giltig JSON:
{{
  "relevant": true/false,
  "reason": "Förklaring på svenska varför dokumentet är relevant/irrelevant",
  "score": 0.0-1.0
}}"#,
            title = document.title,
            doc_type = document.doc_type.as_deref().unwrap_or("Okänd"),
            date = document.date.as_deref().unwrap_or("Okänt"),
            snippet = document.snippet,
        )
    }

    /// Parse a grading response. Relevance requires both the model verdict
    /// and a score at or above the threshold; confidence is the distance of
    /// the score from the threshold, normalized.
    fn parse_grade(doc_id: &str, response: &str, threshold: f32) -> GradeResult {
        let parsed = match parse_llm_json(response) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(doc_id, error = %e, "Failed to parse grading response");
                return GradeResult {
                    doc_id: doc_id.to_string(),
                    relevant: false,
                    reason: format!("Kunde inte tolka bedömning: {e}"),
                    score: 0.0,
                    confidence: 0.0,
                    latency_ms: 0.0,
                };
            }
        };

        let relevant = parsed.get("relevant").and_then(Value::as_bool).unwrap_or(false);
        let reason = parsed
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or("Ingen förklaring given")
            .to_string();
        let score =
            parsed.get("score").and_then(Value::as_f64).unwrap_or(0.0).clamp(0.0, 1.0) as f32;

        let final_relevant = relevant && score >= threshold;
        let confidence = if score >= threshold {
            ((score - threshold) / (1.0 - threshold) + 0.5).min(1.0)
        } else if threshold > 0.0 {
            ((threshold - score) / threshold + 0.5).min(1.0)
        } else {
            0.5
        };

        GradeResult {
            doc_id: doc_id.to_string(),
            relevant: final_relevant,
            reason,
            score,
            confidence,
            latency_ms: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use lagrum_core::{Result, StreamStats, TokenEvent};
    use lagrum_rag::RetrieverTag;
    use tokio::sync::mpsc;

    fn doc(id: &str, title: &str) -> SearchResult {
        SearchResult {
            id: id.to_string(),
            title: title.to_string(),
            snippet: "textutdrag".to_string(),
            score: 0.5,
            source: "coll".to_string(),
            doc_type: Some("sfs".to_string()),
            date: None,
            retriever: RetrieverTag::Dense,
            tier: None,
            original_score: None,
            query_appearances: None,
        }
    }

    /// LM returning a canned response per call; "GDPR" in the prompt grades
    /// relevant, everything else irrelevant.
    struct ScriptedGrader;

    #[async_trait]
    impl LanguageModel for ScriptedGrader {
        async fn chat_stream(
            &self,
            messages: Vec<Message>,
            _config: GenerationConfig,
        ) -> Result<mpsc::Receiver<TokenEvent>> {
            let (tx, rx) = mpsc::channel(4);
            let relevant = messages.iter().any(|m| m.content.contains("GDPR"));
            let response = if relevant {
                r#"{"relevant": true, "reason": "handlar om GDPR", "score": 0.9}"#
            } else {
                r#"{"relevant": false, "reason": "annat ämne", "score": 0.1}"#
            };
            tx.send(TokenEvent::Token(response.to_string())).await.ok();
            tx.send(TokenEvent::Done(StreamStats::default())).await.ok();
            Ok(rx)
        }
    }

    /// LM that never responds within any timeout.
    struct HangingModel;

    #[async_trait]
    impl LanguageModel for HangingModel {
        async fn chat_stream(
            &self,
            _messages: Vec<Message>,
            _config: GenerationConfig,
        ) -> Result<mpsc::Receiver<TokenEvent>> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            unreachable!()
        }
    }

    #[tokio::test]
    async fn test_grading_filters_and_preserves_order() {
        let grader = Grader::new(Arc::new(ScriptedGrader), GraderConfig::default());
        let docs = vec![doc("1", "GDPR artikel 6"), doc("2", "Skattelag"), doc("3", "GDPR skäl 32")];
        let result = grader.grade_documents("Vad säger GDPR?", &docs).await;

        assert_eq!(result.grades.len(), 3);
        assert_eq!(result.filtered.len(), 2);
        assert_eq!(result.filtered[0].id, "1");
        assert_eq!(result.filtered[1].id, "3");
        assert_eq!(result.metrics.relevant_count, 2);
    }

    #[tokio::test]
    async fn test_batch_timeout_marks_irrelevant() {
        let config = GraderConfig { timeout: Duration::from_millis(50), ..Default::default() };
        let grader = Grader::new(Arc::new(HangingModel), config);
        let docs = vec![doc("1", "a"), doc("2", "b")];
        let result = grader.grade_documents("fråga", &docs).await;

        assert_eq!(result.grades.len(), 2);
        assert!(result.filtered.is_empty());
        assert_eq!(result.metrics.timed_out_batches, 1);
        assert!(result.grades.iter().all(|g| !g.relevant && g.score == 0.0));
    }

    #[tokio::test]
    async fn test_empty_documents() {
        let grader = Grader::new(Arc::new(ScriptedGrader), GraderConfig::default());
        let result = grader.grade_documents("fråga", &[]).await;
        assert!(result.grades.is_empty());
        assert_eq!(result.metrics.relevant_percentage, 0.0);
    }

    #[test]
    fn test_parse_grade_threshold_applied() {
        // Model says relevant but the score is under the threshold
        let grade = Grader::parse_grade("d", r#"{"relevant": true, "reason": "x", "score": 0.2}"#, 0.3);
        assert!(!grade.relevant);
        assert!((grade.score - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_parse_grade_confidence_normalized() {
        let high = Grader::parse_grade("d", r#"{"relevant": true, "reason": "x", "score": 1.0}"#, 0.3);
        assert!(high.relevant);
        assert!((high.confidence - 1.0).abs() < 1e-6);

        let near = Grader::parse_grade("d", r#"{"relevant": true, "reason": "x", "score": 0.3}"#, 0.3);
        assert!(near.relevant);
        assert!((near.confidence - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_parse_grade_garbage_is_irrelevant() {
        let grade = Grader::parse_grade("d", "modellen svamlar", 0.3);
        assert!(!grade.relevant);
        assert_eq!(grade.score, 0.0);
        assert_eq!(grade.confidence, 0.0);
    }
}
