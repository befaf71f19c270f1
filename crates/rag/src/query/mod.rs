//! Query understanding: rewriting, expansion, intent, classification.

pub mod expander;
pub mod intent;
pub mod processor;
pub mod rewriter;

pub use expander::{validate_no_hallucinated_statutes, ExpandedQueries, QueryExpander, VariantKind};
pub use intent::{IntentClassifier, IntentResult, IntentRoutingConfig, QueryIntent};
pub use processor::{DecontextualizedQuery, QueryClassification, QueryProcessor};
pub use rewriter::{
    validate_must_include, validate_no_hallucination, validate_sanity, DetectedEntity, EntityKind,
    QueryRewriter, RewriteResult,
};
