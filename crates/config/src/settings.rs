//! Main settings module.
//!
//! Layering: `config/default.yaml` → `config/{env}.yaml` → environment
//! variables prefixed `LAGRUM_` (nested fields separated by `__`, e.g.
//! `LAGRUM_RETRIEVAL__RRF_K=30`).

use config::{Config, Environment, File};
use lagrum_core::GenerationConfig;
use serde::{Deserialize, Serialize};

use crate::constants::{endpoints, retrieval, timeouts};
use crate::ConfigError;

/// Main application settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Embedding backend.
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Vector store (ChromaDB REST contract).
    #[serde(default)]
    pub vector_store: VectorStoreConfig,

    /// Lexical BM25 index.
    #[serde(default)]
    pub lexical: LexicalConfig,

    /// LLM backend and models.
    #[serde(default)]
    pub llm: LlmSettings,

    /// Per-mode generation configs.
    #[serde(default)]
    pub modes: ModeConfigs,

    /// Retrieval stack.
    #[serde(default)]
    pub retrieval: RetrievalSettings,

    /// Reranking.
    #[serde(default)]
    pub reranking: RerankingSettings,

    /// Structured output and critic.
    #[serde(default)]
    pub structured: StructuredSettings,

    /// CRAG document grading and self-reflection.
    #[serde(default)]
    pub crag: CragSettings,

    /// Evidence Policy Routing (intent-based two-pass retrieval).
    #[serde(default)]
    pub epr_enabled: bool,

    /// Force temperature=0, top_p=1 for reproducible evaluation runs.
    #[serde(default)]
    pub deterministic_eval: bool,

    /// Logging.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: default_host(), port: default_port(), cors_enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Embedding server endpoint.
    #[serde(default = "default_embedding_url")]
    pub url: String,
    /// Embedding model identifier, informational.
    #[serde(default = "default_embedding_model")]
    pub model: String,
    /// Expected vector dimension. Verified at startup against a test
    /// embedding and against every collection; mismatch is fatal.
    #[serde(default = "default_embedding_dim")]
    pub expected_dim: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            url: default_embedding_url(),
            model: default_embedding_model(),
            expected_dim: default_embedding_dim(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorStoreConfig {
    /// ChromaDB REST endpoint.
    #[serde(default = "default_chromadb_url")]
    pub url: String,
    /// Default collections searched when routing is off.
    #[serde(default = "default_collections")]
    pub default_collections: Vec<String>,
    /// Collection holding few-shot examples keyed by mode.
    #[serde(default = "default_examples_collection")]
    pub examples_collection: String,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            url: default_chromadb_url(),
            default_collections: default_collections(),
            examples_collection: default_examples_collection(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LexicalConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Index directory. In-memory when unset (tests, dev).
    #[serde(default)]
    pub index_path: Option<String>,
}

impl Default for LexicalConfig {
    fn default() -> Self {
        Self { enabled: true, index_path: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    /// Base URL of the chat endpoint.
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    /// Wire format: OpenAI-compatible SSE or legacy Ollama lines.
    #[serde(default)]
    pub api_format: LlmApiFormat,
    /// Primary model.
    #[serde(default = "default_primary_model")]
    pub constitutional_model: String,
    /// Fallback model tried exactly once after a primary timeout/connect error.
    #[serde(default = "default_fallback_model")]
    pub constitutional_fallback: String,
    /// Non-streaming request timeout (seconds).
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: f64,
    /// Connect timeout (seconds).
    #[serde(default = "default_llm_connect_timeout")]
    pub connect_timeout_secs: f64,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            api_format: LlmApiFormat::default(),
            constitutional_model: default_primary_model(),
            constitutional_fallback: default_fallback_model(),
            timeout_secs: default_llm_timeout(),
            connect_timeout_secs: default_llm_connect_timeout(),
        }
    }
}

/// Wire format of the chat endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LlmApiFormat {
    /// `data: {...}` SSE lines with `choices[0].delta.content`.
    #[default]
    OpenAi,
    /// One JSON object per line with `message.content` and `done`.
    Ollama,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeConfigs {
    #[serde(default = "default_evidence_gen")]
    pub evidence: GenerationConfig,
    #[serde(default = "default_assist_gen")]
    pub assist: GenerationConfig,
    #[serde(default = "default_chat_gen")]
    pub chat: GenerationConfig,
}

impl Default for ModeConfigs {
    fn default() -> Self {
        Self {
            evidence: default_evidence_gen(),
            assist: default_assist_gen(),
            chat: default_chat_gen(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalSettings {
    /// Per-collection search timeout (seconds).
    #[serde(default = "default_search_timeout")]
    pub search_timeout_secs: f64,
    #[serde(default = "default_true")]
    pub parallel_search_enabled: bool,
    /// Semaphore size for concurrent variant searches.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_queries: usize,
    /// Similarity threshold applied before RRF.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    /// RRF constant (60 default, 30 in some deployments).
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f32,
    #[serde(default = "default_true")]
    pub adaptive_enabled: bool,
    /// Cap on adaptive escalation steps (A→B→C→D = 4).
    #[serde(default = "default_max_escalation_steps")]
    pub max_escalation_steps: usize,
    /// Default top-k.
    #[serde(default = "default_k")]
    pub default_k: usize,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            search_timeout_secs: default_search_timeout(),
            parallel_search_enabled: true,
            max_concurrent_queries: default_max_concurrent(),
            similarity_threshold: default_similarity_threshold(),
            rrf_k: default_rrf_k(),
            adaptive_enabled: true,
            max_escalation_steps: default_max_escalation_steps(),
            default_k: default_k(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankingSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_reranking_model")]
    pub model: String,
}

impl Default for RerankingSettings {
    fn default() -> Self {
        Self { enabled: true, model: default_reranking_model() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredSettings {
    #[serde(default = "default_true")]
    pub output_enabled: bool,
    #[serde(default = "default_true")]
    pub critic_revise_enabled: bool,
    /// Hard ceiling on critic revisions.
    #[serde(default = "default_critic_max_revisions")]
    pub critic_max_revisions: usize,
}

impl Default for StructuredSettings {
    fn default() -> Self {
        Self {
            output_enabled: true,
            critic_revise_enabled: true,
            critic_max_revisions: default_critic_max_revisions(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CragSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_grade_threshold")]
    pub grade_threshold: f32,
    #[serde(default = "default_max_concurrent_grading")]
    pub max_concurrent_grading: usize,
    /// Per-batch grading timeout (seconds).
    #[serde(default = "default_grade_timeout")]
    pub grade_timeout_secs: f64,
    #[serde(default)]
    pub enable_self_reflection: bool,
    /// Cheap model used for grading and self-reflection.
    #[serde(default = "default_grader_model")]
    pub grader_model: String,
}

impl Default for CragSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            grade_threshold: default_grade_threshold(),
            max_concurrent_grading: default_max_concurrent_grading(),
            grade_timeout_secs: default_grade_timeout(),
            enable_self_reflection: false,
            grader_model: default_grader_model(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_json: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { log_level: default_log_level(), log_json: false }
    }
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generation config for a mode, honouring `deterministic_eval`.
    pub fn generation_config(&self, mode: lagrum_core::ResponseMode) -> GenerationConfig {
        let config = match mode {
            lagrum_core::ResponseMode::Evidence => self.modes.evidence,
            lagrum_core::ResponseMode::Assist => self.modes.assist,
            lagrum_core::ResponseMode::Chat => self.modes.chat,
        };
        if self.deterministic_eval {
            config.deterministic()
        } else {
            config
        }
    }

    /// Validate settings. Called once at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.embedding.expected_dim == 0 {
            return Err(ConfigError::InvalidValue {
                field: "embedding.expected_dim".to_string(),
                message: "Must be greater than zero".to_string(),
            });
        }

        if !(0.0..=1.0).contains(&self.retrieval.similarity_threshold) {
            return Err(ConfigError::InvalidValue {
                field: "retrieval.similarity_threshold".to_string(),
                message: format!(
                    "Must be between 0.0 and 1.0, got {}",
                    self.retrieval.similarity_threshold
                ),
            });
        }

        if self.retrieval.rrf_k <= 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "retrieval.rrf_k".to_string(),
                message: format!("Must be positive, got {}", self.retrieval.rrf_k),
            });
        }

        if self.retrieval.max_concurrent_queries == 0 {
            return Err(ConfigError::InvalidValue {
                field: "retrieval.max_concurrent_queries".to_string(),
                message: "Must be at least 1".to_string(),
            });
        }

        if self.retrieval.max_escalation_steps == 0 || self.retrieval.max_escalation_steps > 4 {
            return Err(ConfigError::InvalidValue {
                field: "retrieval.max_escalation_steps".to_string(),
                message: format!(
                    "Must be between 1 and 4, got {}",
                    self.retrieval.max_escalation_steps
                ),
            });
        }

        if !(0.0..=1.0).contains(&self.crag.grade_threshold) {
            return Err(ConfigError::InvalidValue {
                field: "crag.grade_threshold".to_string(),
                message: format!("Must be between 0.0 and 1.0, got {}", self.crag.grade_threshold),
            });
        }

        if self.structured.critic_max_revisions > 2 {
            return Err(ConfigError::InvalidValue {
                field: "structured.critic_max_revisions".to_string(),
                message: "At most 2 revisions are allowed".to_string(),
            });
        }

        for (name, gen) in [
            ("evidence", &self.modes.evidence),
            ("assist", &self.modes.assist),
            ("chat", &self.modes.chat),
        ] {
            if !(0.0..=2.0).contains(&gen.temperature) || !(0.0..=1.0).contains(&gen.top_p) {
                return Err(ConfigError::InvalidValue {
                    field: format!("modes.{name}"),
                    message: "temperature must be in [0,2], top_p in [0,1]".to_string(),
                });
            }
        }

        Ok(())
    }
}

/// Load settings from config files and environment.
///
/// Priority: env vars > `config/{env}.yaml` > `config/default.yaml` > defaults.
pub fn load_settings(env: Option<&str>) -> Result<Settings, ConfigError> {
    let mut builder = Config::builder().add_source(File::with_name("config/default").required(false));

    if let Some(env_name) = env {
        builder =
            builder.add_source(File::with_name(&format!("config/{env_name}")).required(false));
    }

    let config = builder
        .add_source(Environment::with_prefix("LAGRUM").separator("__"))
        .build()
        .map_err(|e| ConfigError::Load(e.to_string()))?;

    let settings: Settings =
        config.try_deserialize().map_err(|e| ConfigError::Load(e.to_string()))?;

    settings.validate()?;
    Ok(settings)
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_true() -> bool {
    true
}
fn default_embedding_url() -> String {
    endpoints::EMBEDDING_DEFAULT.clone()
}
fn default_embedding_model() -> String {
    "bge-m3".to_string()
}
fn default_embedding_dim() -> usize {
    1024
}
fn default_chromadb_url() -> String {
    endpoints::CHROMADB_DEFAULT.clone()
}
fn default_collections() -> Vec<String> {
    vec![
        "sfs_lagtext".to_string(),
        "riksdag_documents".to_string(),
        "swedish_gov_docs".to_string(),
    ]
}
fn default_examples_collection() -> String {
    "constitutional_examples".to_string()
}
fn default_llm_base_url() -> String {
    endpoints::LLM_DEFAULT.clone()
}
fn default_primary_model() -> String {
    "ministral-3:14b".to_string()
}
fn default_fallback_model() -> String {
    "qwen2.5:7b-instruct".to_string()
}
fn default_llm_timeout() -> f64 {
    timeouts::LLM_REQUEST_SECS
}
fn default_llm_connect_timeout() -> f64 {
    timeouts::LLM_CONNECT_SECS
}
fn default_evidence_gen() -> GenerationConfig {
    GenerationConfig { temperature: 0.2, top_p: 0.9, max_tokens: 1024 }
}
fn default_assist_gen() -> GenerationConfig {
    GenerationConfig { temperature: 0.5, top_p: 0.9, max_tokens: 768 }
}
fn default_chat_gen() -> GenerationConfig {
    GenerationConfig { temperature: 0.7, top_p: 0.9, max_tokens: 512 }
}
fn default_search_timeout() -> f64 {
    timeouts::COLLECTION_SEARCH_SECS
}
fn default_max_concurrent() -> usize {
    retrieval::MAX_CONCURRENT_QUERIES
}
fn default_similarity_threshold() -> f32 {
    retrieval::SIMILARITY_THRESHOLD
}
fn default_rrf_k() -> f32 {
    retrieval::RRF_K
}
fn default_max_escalation_steps() -> usize {
    4
}
fn default_k() -> usize {
    retrieval::DEFAULT_K
}
fn default_reranking_model() -> String {
    "bge-reranker-v2-m3".to_string()
}
fn default_critic_max_revisions() -> usize {
    2
}
fn default_grade_threshold() -> f32 {
    0.3
}
fn default_max_concurrent_grading() -> usize {
    5
}
fn default_grade_timeout() -> f64 {
    timeouts::GRADE_SECS
}
fn default_grader_model() -> String {
    "qwen2.5:0.5b-instruct".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use lagrum_core::ResponseMode;

    #[test]
    fn test_defaults_validate() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_mode_configs() {
        let settings = Settings::default();
        let evidence = settings.generation_config(ResponseMode::Evidence);
        assert!(evidence.temperature < settings.generation_config(ResponseMode::Chat).temperature);
    }

    #[test]
    fn test_deterministic_eval_pins_sampling() {
        let settings = Settings { deterministic_eval: true, ..Default::default() };
        let config = settings.generation_config(ResponseMode::Assist);
        assert_eq!(config.temperature, 0.0);
        assert_eq!(config.top_p, 1.0);
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let mut settings = Settings::default();
        settings.retrieval.similarity_threshold = 1.5;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_critic_revisions_capped() {
        let mut settings = Settings::default();
        settings.structured.critic_max_revisions = 3;
        assert!(settings.validate().is_err());
    }
}
