//! Core traits and types for the Lagrum QA engine.
//!
//! This crate provides foundational types used across all other crates:
//! - Error taxonomy with HTTP status mapping
//! - Conversation turns and the history window
//! - Document and chat message types
//! - Response modes and evidence levels
//! - Trait seams for pluggable backends (embedder, vector store, LLM)

pub mod conversation;
pub mod document;
pub mod error;
pub mod llm_types;
pub mod mode;
pub mod traits;

pub use conversation::{history_window, render_history, Turn, TurnRole, HISTORY_WINDOW};
pub use document::Document;
pub use error::{Error, Result};
pub use llm_types::{GenerationConfig, Message, Role, StreamStats};
pub use mode::{EvidenceLevel, ResponseMode};
pub use traits::{
    CollectionQuery, Embedder, LanguageModel, LexicalHit, LexicalSearch, RawHit, TokenEvent,
    VectorSearch,
};
