//! Retrieval stack for the Lagrum QA engine.
//!
//! Features:
//! - Dense vector search against the ChromaDB REST contract
//! - BM25 lexical search via Tantivy with Swedish stemming
//! - Swedish compound expansion at query time
//! - Query rewriting (decontextualization), expansion and intent routing
//! - Multi-query fusion with reciprocal rank fusion
//! - Confidence signals and adaptive escalation (A→B→C→D)
//! - Cross-encoder style reranking

pub mod chroma;
pub mod compound;
pub mod confidence;
pub mod embedding;
pub mod fusion;
pub mod lexical;
pub mod query;
pub mod reranker;
pub mod retriever;
pub mod routing;
pub mod types;

pub use chroma::{ChromaClient, ChromaConfig};
pub use compound::CompoundSplitter;
pub use confidence::{
    step_config, ConfidenceCalculator, ConfidenceSignals, ConfidenceTier, EscalationStep,
    StepConfig,
};
pub use embedding::{HttpEmbedder, HttpEmbedderConfig};
pub use fusion::{
    calculate_fusion_metrics, reciprocal_rank_fusion, should_use_fusion_results, FusionMetrics,
};
pub use lexical::{LexicalConfig, LexicalIndex};
pub use query::{
    DecontextualizedQuery, DetectedEntity, EntityKind, ExpandedQueries, IntentClassifier,
    IntentResult, IntentRoutingConfig, QueryClassification, QueryExpander, QueryIntent,
    QueryProcessor, QueryRewriter, RewriteResult, VariantKind,
};
pub use reranker::{RerankOutcome, Reranker, RerankerConfig};
pub use retriever::{RetrievalStrategy, Retriever, RetrieverConfig};
pub use routing::{split_by_tier, RoutedRetrieval};
pub use types::{
    sort_results, RetrievalMetrics, RetrievalResult, RetrieverTag, ScoreStats, SearchResult, Tier,
};
