//! Trait seams for pluggable backends.
//!
//! The orchestrator and retriever depend on these traits rather than concrete
//! clients, so tests can script embedder/vector-store/LLM behavior without a
//! network.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::llm_types::{GenerationConfig, Message, StreamStats};

/// Produces fixed-dimension dense vectors for text.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts. Every returned vector has length
    /// [`Embedder::dimension`].
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embed a single text.
    async fn embed_single(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed(std::slice::from_ref(&text.to_string())).await?;
        vectors
            .pop()
            .ok_or_else(|| crate::Error::Embedding("empty embedding batch".into()))
    }

    /// Fixed process-wide embedding dimension.
    fn dimension(&self) -> usize;
}

/// A single raw hit from a vector-store collection query.
#[derive(Debug, Clone)]
pub struct RawHit {
    pub id: String,
    pub document: String,
    pub metadata: HashMap<String, Value>,
    /// Raw distance as reported by the store (lower is better).
    pub distance: f32,
}

impl RawHit {
    /// String-typed metadata lookup.
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }
}

/// A collection query in the consumed vector-store contract.
#[derive(Debug, Clone)]
pub struct CollectionQuery {
    pub collection: String,
    pub embedding: Vec<f32>,
    pub n_results: usize,
    pub where_filter: Option<Value>,
}

/// Nearest-neighbour search per named collection.
#[async_trait]
pub trait VectorSearch: Send + Sync {
    /// Names of all available collections.
    async fn list_collections(&self) -> Result<Vec<String>>;

    /// Query one collection. Returns raw hits with distances; score
    /// normalization belongs to the retriever.
    async fn query(&self, query: &CollectionQuery) -> Result<Vec<RawHit>>;

    /// Number of documents in a collection.
    async fn count(&self, collection: &str) -> Result<usize>;
}

/// Keyword search over the corpus.
#[async_trait]
pub trait LexicalSearch: Send + Sync {
    /// Search with a single, possibly-expanded query string.
    async fn search(&self, query: &str, cutoff: usize) -> Result<Vec<LexicalHit>>;
}

/// A hit from the lexical index.
#[derive(Debug, Clone)]
pub struct LexicalHit {
    pub id: String,
    pub score: f32,
    pub text: String,
    pub title: String,
}

/// One item of a streaming chat completion.
#[derive(Debug, Clone)]
pub enum TokenEvent {
    /// A content chunk.
    Token(String),
    /// The client fell back from the primary to the fallback model.
    Fallback { from: String, to: String },
    /// Terminal event with stream statistics.
    Done(StreamStats),
}

/// Token-streaming chat completion with per-call configuration.
///
/// Model fallback lives inside the client: callers only observe the
/// [`TokenEvent::Fallback`] event in the stream.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Start a streaming completion. Events arrive on the returned channel;
    /// the stream ends with [`TokenEvent::Done`] (or channel closure on a
    /// mid-stream failure).
    async fn chat_stream(
        &self,
        messages: Vec<Message>,
        config: GenerationConfig,
    ) -> Result<mpsc::Receiver<TokenEvent>>;

    /// Collect a full completion from the stream.
    async fn chat_complete(
        &self,
        messages: Vec<Message>,
        config: GenerationConfig,
    ) -> Result<(String, StreamStats)> {
        let mut rx = self.chat_stream(messages, config).await?;
        let mut text = String::new();
        let mut stats = StreamStats::default();
        while let Some(event) = rx.recv().await {
            match event {
                TokenEvent::Token(t) => text.push_str(&t),
                TokenEvent::Fallback { .. } => {}
                TokenEvent::Done(s) => stats = s,
            }
        }
        Ok((text, stats))
    }
}
