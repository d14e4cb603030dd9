//! Error taxonomy for the prompt lifecycle.

use serde::{Deserialize, Serialize};

use super::document::Stage;
use super::matrix::Category;

/// Serialisable classification of a lifecycle failure.
///
/// Carried inside error Events so that a reader of the log can tell a
/// judge outage from a configuration bug without parsing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    JudgeUnavailable,
    MalformedJudgeResponse,
    EmptyMatrix,
    NoActionableFeedback,
    ImprovementUnavailable,
    StructuralValidationFailure,
    InvariantViolation,
    TerminalStage,
    InvalidInput,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::JudgeUnavailable => "judge_unavailable",
            Self::MalformedJudgeResponse => "malformed_judge_response",
            Self::EmptyMatrix => "empty_matrix",
            Self::NoActionableFeedback => "no_actionable_feedback",
            Self::ImprovementUnavailable => "improvement_unavailable",
            Self::StructuralValidationFailure => "structural_validation_failure",
            Self::InvariantViolation => "invariant_violation",
            Self::TerminalStage => "terminal_stage",
            Self::InvalidInput => "invalid_input",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced by the lifecycle components.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("judge unavailable: {detail}")]
    JudgeUnavailable { detail: String },

    #[error("malformed judge response for criterion {criterion}: {detail}")]
    MalformedJudgeResponse { criterion: String, detail: String },

    #[error("scoring matrix for category {category} has no weighted criteria")]
    EmptyMatrix { category: Category },

    #[error("no actionable feedback: every criterion already passed")]
    NoActionableFeedback,

    #[error("improvement unavailable: {detail}")]
    ImprovementUnavailable { detail: String },

    #[error("structural validation failed for field {field}: {reason}")]
    StructuralValidationFailure { field: String, reason: String },

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("stage {stage} is terminal and cannot be promoted")]
    TerminalStage { stage: Stage },

    #[error("invalid version: {0}")]
    InvalidVersion(String),

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("invalid scoring matrix: {0}")]
    InvalidMatrix(String),

    #[error("run cancelled before step {step}")]
    Cancelled { step: String },

    #[error("internal error: {0}")]
    Internal(String),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl LifecycleError {
    /// Map the error onto the kind recorded in error Events.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::JudgeUnavailable { .. } => ErrorKind::JudgeUnavailable,
            Self::MalformedJudgeResponse { .. } => ErrorKind::MalformedJudgeResponse,
            Self::EmptyMatrix { .. } => ErrorKind::EmptyMatrix,
            Self::NoActionableFeedback => ErrorKind::NoActionableFeedback,
            Self::ImprovementUnavailable { .. } => ErrorKind::ImprovementUnavailable,
            Self::StructuralValidationFailure { .. } => ErrorKind::StructuralValidationFailure,
            Self::InvariantViolation(_) => ErrorKind::InvariantViolation,
            Self::TerminalStage { .. } => ErrorKind::TerminalStage,
            Self::InvalidVersion(_)
            | Self::InvalidDocument(_)
            | Self::InvalidMatrix(_)
            | Self::Yaml(_) => ErrorKind::InvalidInput,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// Result type for lifecycle operations.
pub type Result<T> = std::result::Result<T, LifecycleError>;
