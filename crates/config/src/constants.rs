//! Centralized constants.
//!
//! Single source of truth for retrieval tuning values and infrastructure
//! defaults. Corpus-specific data (collection names, correction tables,
//! pattern sets) lives as static tables next to the code that uses it.

/// Service endpoints (loaded from env vars with fallback defaults)
pub mod endpoints {
    use once_cell::sync::Lazy;

    /// ChromaDB REST endpoint (env: CHROMADB_URL)
    pub static CHROMADB_DEFAULT: Lazy<String> = Lazy::new(|| {
        std::env::var("CHROMADB_URL").unwrap_or_else(|_| "http://127.0.0.1:8000".to_string())
    });

    /// Embedding server endpoint (env: EMBEDDING_URL)
    pub static EMBEDDING_DEFAULT: Lazy<String> = Lazy::new(|| {
        std::env::var("EMBEDDING_URL").unwrap_or_else(|_| "http://127.0.0.1:8001".to_string())
    });

    /// LLM endpoint, OpenAI-compatible or Ollama (env: LLM_BASE_URL)
    pub static LLM_DEFAULT: Lazy<String> = Lazy::new(|| {
        std::env::var("LLM_BASE_URL").unwrap_or_else(|_| "http://localhost:11434".to_string())
    });
}

/// Timeouts (seconds unless noted)
pub mod timeouts {
    /// Per-collection vector query timeout.
    pub const COLLECTION_SEARCH_SECS: f64 = 5.0;

    /// Per-document grading timeout.
    pub const GRADE_SECS: f64 = 10.0;

    /// Non-streaming LLM request timeout.
    pub const LLM_REQUEST_SECS: f64 = 60.0;

    /// LLM connect timeout.
    pub const LLM_CONNECT_SECS: f64 = 5.0;
}

/// Retrieval tuning
pub mod retrieval {
    /// RRF constant from the original paper. 30 is also seen in deployments;
    /// pick one per deployment via `retrieval.rrf_k`.
    pub const RRF_K: f32 = 60.0;

    /// Results below this similarity are filtered before fusion, unless the
    /// filter would empty the set (then the top 3 are kept with a warning).
    pub const SIMILARITY_THRESHOLD: f32 = 0.5;

    /// How many results survive the empty-set fallback.
    pub const THRESHOLD_FALLBACK_KEEP: usize = 3;

    /// Snippets are truncated to this many characters with an ellipsis.
    pub const SNIPPET_MAX_CHARS: usize = 200;

    /// Maximum query variants for fusion.
    pub const MAX_QUERY_VARIANTS: usize = 3;

    /// Concurrent variant searches (process-wide semaphore).
    pub const MAX_CONCURRENT_QUERIES: usize = 3;

    /// Fusion gain below this prefers the single-query result.
    pub const FUSION_GAIN_MIN: f32 = 0.05;

    /// Default per-collection k.
    pub const DEFAULT_K: usize = 10;

    /// Hard cap on query length (DoS protection).
    pub const MAX_QUERY_CHARS: usize = 2000;
}

/// Confidence signal thresholds, calibrated for RRF scores (k=60):
/// top score at rank 1 is 1/61 ≈ 0.016, with 2 variants at rank 1 ≈ 0.033.
pub mod confidence {
    pub const TOP_SCORE_LOW: f32 = 0.025;
    pub const MARGIN_LOW: f32 = 0.003;
    pub const MUST_INCLUDE_MIN: f32 = 0.5;
    pub const NEAR_DUPLICATE_MAX: f32 = 0.7;
    pub const LEXICAL_OVERLAP_MIN: f32 = 0.15;
    pub const OVERALL_CONFIDENCE_LOW: f32 = 0.4;
    pub const ABSTAIN_CONFIDENCE: f32 = 0.25;
    pub const EMPTY_ENTITIES_PENALTY: f32 = 0.20;
    pub const ABSTAIN_LEXICAL_OVERLAP: f32 = 0.05;
    pub const ABSTAIN_NO_ENTITY_OVERLAP: f32 = 0.3;
}
