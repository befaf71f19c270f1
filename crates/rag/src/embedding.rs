//! HTTP embedder client.
//!
//! Talks to a batch embedding server. The vector dimension is fixed
//! process-wide and verified at startup with a test embedding; a mismatch is
//! a fatal startup error.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use lagrum_core::{Embedder, Error, Result};

/// Embedder configuration.
#[derive(Debug, Clone)]
pub struct HttpEmbedderConfig {
    /// Base URL of the embedding server.
    pub url: String,
    /// Model identifier passed through to the server.
    pub model: String,
    /// Expected vector dimension.
    pub expected_dim: usize,
    /// Request timeout.
    pub timeout: Duration,
}

impl Default for HttpEmbedderConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8001".to_string(),
            model: "bge-m3".to_string(),
            expected_dim: 1024,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Embedder backed by an HTTP embedding server.
pub struct HttpEmbedder {
    client: Client,
    config: HttpEmbedderConfig,
}

impl HttpEmbedder {
    pub fn new(config: HttpEmbedderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Embedding(e.to_string()))?;
        Ok(Self { client, config })
    }

    /// Verify the configured dimension against a live test embedding.
    /// Called once at startup; a mismatch refuses service start.
    pub async fn verify_dimension(&self) -> Result<()> {
        let test = self.embed_single("dimension check").await?;
        if test.len() != self.config.expected_dim {
            return Err(Error::Configuration(format!(
                "Embedding dimension mismatch: server returned {}, expected {}",
                test.len(),
                self.config.expected_dim
            )));
        }
        tracing::info!(dim = self.config.expected_dim, model = %self.config.model, "Embedding dimension verified");
        Ok(())
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let request = EmbedRequest { model: &self.config.model, input: texts };
        let response = self
            .client
            .post(format!("{}/embed", self.config.url.trim_end_matches('/')))
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Embedding(format!("Embedding request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Embedding(format!("Embedding server returned {status}: {body}")));
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| Error::Embedding(format!("Invalid embedding response: {e}")))?;

        if parsed.embeddings.len() != texts.len() {
            return Err(Error::Embedding(format!(
                "Embedding count mismatch: sent {} texts, got {} vectors",
                texts.len(),
                parsed.embeddings.len()
            )));
        }

        for vector in &parsed.embeddings {
            if vector.len() != self.config.expected_dim {
                return Err(Error::Embedding(format!(
                    "Embedding dimension mismatch: got {}, expected {}",
                    vector.len(),
                    self.config.expected_dim
                )));
            }
        }

        Ok(parsed.embeddings)
    }

    fn dimension(&self) -> usize {
        self.config.expected_dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embed_request_serialization() {
        let input = vec!["Vad säger GDPR?".to_string()];
        let request = EmbedRequest { model: "bge-m3", input: &input };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("bge-m3"));
        assert!(json.contains("Vad säger GDPR?"));
    }

    #[test]
    fn test_embed_response_parsing() {
        let json = r#"{"embeddings": [[0.1, 0.2], [0.3, 0.4]]}"#;
        let parsed: EmbedResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.embeddings.len(), 2);
        assert_eq!(parsed.embeddings[0].len(), 2);
    }
}
