//! Configuration for the Lagrum QA engine.
//!
//! Settings are layered from YAML files and `LAGRUM_`-prefixed environment
//! variables. Fixed tuning values live in [`constants`].

pub mod constants;
pub mod settings;

pub use settings::{
    load_settings, CragSettings, EmbeddingConfig, LexicalConfig, LlmApiFormat, LlmSettings,
    ModeConfigs, ObservabilityConfig, RerankingSettings, RetrievalSettings, ServerConfig, Settings,
    StructuredSettings, VectorStoreConfig,
};

use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

impl From<ConfigError> for lagrum_core::Error {
    fn from(err: ConfigError) -> Self {
        lagrum_core::Error::Configuration(err.to_string())
    }
}
