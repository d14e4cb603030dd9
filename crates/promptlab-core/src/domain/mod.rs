//! Domain models for the prompt lifecycle.
//!
//! Canonical definitions for the core entities:
//! - `VersionedDocument`: a prompt body at a stage and version
//! - `ScoringMatrix`: weighted criteria for one category
//! - `QualityResult` / `ImprovementResult` / `ControllerDecision`: step outputs
//! - `AgentEvent`: the audit record of each step

pub mod decision;
pub mod digest;
pub mod document;
pub mod error;
pub mod event;
pub mod improvement;
pub mod matrix;
pub mod quality;

pub use decision::{AlignmentCheck, ControllerDecision, Verdict};
pub use digest::sha256_hex;
pub use document::{
    is_reserved_field, parse_file_name, FileNameParts, PromptVersion, Stage, VersionedDocument,
    DEFAULT_VERSION, RESERVED_FIELDS,
};
pub use error::{ErrorKind, LifecycleError, Result};
pub use event::{
    AgentEvent, ErrorInfo, EventMeta, EventPayload, EventStatus, StepKind, TerminalState,
    WorkflowId, SCHEMA_VERSION,
};
pub use improvement::{ImprovementResult, RejectedEdit, RejectionReason};
pub use matrix::{
    structural_violations, validate_structure, Category, Criterion, MatrixRegistry, ScoringMatrix,
};
pub use quality::{CriterionOutcome, QualityResult, VerdictSource};
