//! Response pipeline for the Lagrum QA engine.
//!
//! The orchestrator binds classification, decontextualization, retrieval,
//! grading, self-reflection, generation, structured-output validation with a
//! bounded critic/revise loop, and post-generation guardrail corrections —
//! in both non-streaming and streaming form.

pub mod critic;
pub mod events;
pub mod grader;
pub mod guardrail;
pub mod metrics;
pub mod orchestrator;
pub mod prompt;
pub mod structured;

pub use critic::{Critic, CriticReflection, CriticResult};
pub use events::{AgentEvent, SourceMeta};
pub use grader::{GradeResult, Grader, GraderConfig, GradingMetrics, GradingResult};
pub use guardrail::{Correction, Guardrail, GuardrailResult, WardenStatus};
pub use metrics::{RagPipelineMetrics, RagResult, ResultCitation};
pub use orchestrator::{Orchestrator, QueryRequest};
pub use prompt::{ResponseTemplates, EXAMPLES_PLACEHOLDER};
pub use structured::{parse_llm_json, validate, validate_with_retries, Citation, StructuredResponse};
