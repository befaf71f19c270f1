//! Streaming LLM client for the Lagrum QA engine.
//!
//! Features:
//! - OpenAI-compatible SSE chat endpoint and legacy Ollama line protocol
//! - Per-call generation configuration
//! - Automatic primary→fallback model retry, surfaced as a stream event
//! - Stream statistics (tokens, time-to-first-token, tokens/s)

pub mod client;

pub use client::{LlmClient, LlmClientConfig, WireFormat};

use thiserror::Error;

/// LLM errors.
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("API error: {0}")]
    Api(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Timeout")]
    Timeout,

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout
        } else if err.is_connect() {
            LlmError::Network(format!("connect: {err}"))
        } else {
            LlmError::Network(err.to_string())
        }
    }
}

impl From<LlmError> for lagrum_core::Error {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::Timeout => lagrum_core::Error::LlmTimeout("LLM request timed out".into()),
            LlmError::Network(msg) => lagrum_core::Error::LlmConnection(msg),
            LlmError::ModelNotFound(model) => {
                lagrum_core::Error::LlmConnection(format!("model not found: {model}"))
            }
            other => lagrum_core::Error::LlmConnection(other.to_string()),
        }
    }
}
