//! Error taxonomy shared across all crates.
//!
//! Each variant maps to an HTTP status code via [`Error::status_code`].
//! Component-level failures bubble up as typed errors; recoverable conditions
//! (per-collection timeouts, single-variant failures, grader parse failures)
//! are handled locally and never reach this type.

use thiserror::Error;

/// Result alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad input: empty question, oversize query, malformed options.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Query or response matched an injection/jailbreak pattern.
    #[error("Security violation: {0}")]
    SecurityViolation(String),

    /// Requested document or collection does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Unknown strategy or missing optional component.
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// Service has not completed startup.
    #[error("Service not initialized: {0}")]
    NotInitialized(String),

    /// Upstream LLM unreachable.
    #[error("LLM connection error: {0}")]
    LlmConnection(String),

    /// Upstream LLM too slow.
    #[error("LLM timeout: {0}")]
    LlmTimeout(String),

    /// Vector-store query failure outside of timeouts.
    #[error("Retrieval error: {0}")]
    Retrieval(String),

    /// Embedding backend failure.
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Reranker failure.
    #[error("Reranker error: {0}")]
    Reranker(String),

    /// Grader failure that could not be recovered locally.
    #[error("Grading error: {0}")]
    Grading(String),

    /// Critic failure.
    #[error("Critic error: {0}")]
    Critic(String),

    /// Configuration error surfaced at startup.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Anything else internal.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status code for the user-visible error mapping.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Validation(_) => 400,
            Error::SecurityViolation(_) => 403,
            Error::NotFound(_) => 404,
            Error::NotImplemented(_) => 501,
            Error::NotInitialized(_) => 503,
            Error::LlmConnection(_) => 503,
            Error::LlmTimeout(_) => 504,
            Error::Retrieval(_)
            | Error::Embedding(_)
            | Error::Reranker(_)
            | Error::Grading(_)
            | Error::Critic(_)
            | Error::Configuration(_)
            | Error::Internal(_) => 500,
        }
    }

    /// Short machine-readable kind for the structured error body.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::SecurityViolation(_) => "security_violation",
            Error::NotFound(_) => "not_found",
            Error::NotImplemented(_) => "not_implemented",
            Error::NotInitialized(_) => "not_initialized",
            Error::LlmConnection(_) => "llm_connection",
            Error::LlmTimeout(_) => "llm_timeout",
            Error::Retrieval(_) => "retrieval",
            Error::Embedding(_) => "embedding",
            Error::Reranker(_) => "reranker",
            Error::Grading(_) => "grading",
            Error::Critic(_) => "critic",
            Error::Configuration(_) => "configuration",
            Error::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(Error::Validation("x".into()).status_code(), 400);
        assert_eq!(Error::SecurityViolation("x".into()).status_code(), 403);
        assert_eq!(Error::NotFound("x".into()).status_code(), 404);
        assert_eq!(Error::NotImplemented("x".into()).status_code(), 501);
        assert_eq!(Error::NotInitialized("x".into()).status_code(), 503);
        assert_eq!(Error::LlmConnection("x".into()).status_code(), 503);
        assert_eq!(Error::LlmTimeout("x".into()).status_code(), 504);
        assert_eq!(Error::Retrieval("x".into()).status_code(), 500);
        assert_eq!(Error::Internal("x".into()).status_code(), 500);
    }

    #[test]
    fn test_kind_strings() {
        assert_eq!(Error::SecurityViolation("x".into()).kind(), "security_violation");
        assert_eq!(Error::LlmTimeout("x".into()).kind(), "llm_timeout");
        assert_eq!(Error::Configuration("x".into()).kind(), "configuration");
    }

    #[test]
    fn test_display_messages() {
        let err = Error::NotFound("Collection not found: sfs_lagtext".to_string());
        assert_eq!(err.to_string(), "Not found: Collection not found: sfs_lagtext");
    }
}
