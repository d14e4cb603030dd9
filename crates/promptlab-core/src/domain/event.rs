//! Agent events: the append-only audit record of a lifecycle run.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::decision::{AlignmentCheck, ControllerDecision};
use super::document::PromptVersion;
use super::error::{ErrorKind, LifecycleError};
use super::improvement::ImprovementResult;
use super::matrix::Category;
use super::quality::QualityResult;

/// Version of the event record layout.
pub const SCHEMA_VERSION: &str = "1.0";

/// Identifier shared by every event of one lifecycle run.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(String);

impl WorkflowId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// `{UTC timestamp}_workflow_{6 hex}`; sorts by start time.
    pub fn generate() -> Self {
        let stamp = Utc::now().format("%Y-%m-%dT%H-%M-%S");
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("{stamp}_workflow_{}", &suffix[..6]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Success,
    Error,
}

/// The lifecycle step an event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Evaluate,
    Decide,
    Improve,
    Promote,
    Abort,
}

impl StepKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Evaluate => "evaluate",
            Self::Decide => "decide",
            Self::Improve => "improve",
            Self::Promote => "promote",
            Self::Abort => "abort",
        }
    }

    /// Name of the component that performs this step.
    pub fn agent_name(self) -> &'static str {
        match self {
            Self::Evaluate => "QualityEvaluator",
            Self::Decide => "Controller",
            Self::Improve => "Improver",
            Self::Promote | Self::Abort => "LifecycleOrchestrator",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a run ended, recorded on its final event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TerminalState {
    Promoted,
    Aborted,
    Failed,
}

/// Structured failure details carried by error events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    pub step: StepKind,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, serde_json::Value>,
}

impl ErrorInfo {
    pub fn from_error(step: StepKind, err: &LifecycleError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            step,
            context: BTreeMap::new(),
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }
}

/// Closed set of event payloads, discriminated by `payload_kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "payload_kind", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    Quality(QualityResult),
    Improvement(ImprovementResult),
    Decision(ControllerDecision),
    Error(ErrorInfo),
}

impl EventPayload {
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::Quality(_) => "quality",
            Self::Improvement(_) => "improvement",
            Self::Decision(_) => "decision",
            Self::Error(_) => "error",
        }
    }
}

/// Contextual keys attached to every event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMeta {
    /// Evaluation round this event belongs to, starting at 1.
    pub iteration: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_event_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_digest: Option<String>,
    /// Set on the last event of a run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_state: Option<TerminalState>,
    /// Controller's alignment check of the revision, on improve events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alignment: Option<AlignmentCheck>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// One immutable entry in the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEvent {
    pub event_id: Uuid,

    pub workflow_id: WorkflowId,

    /// Position in the run, starting at 1.
    pub seq: u64,

    /// `{seq:04}-{step}`; unique within the run.
    pub step_id: String,

    pub step: StepKind,

    pub agent_name: String,

    pub agent_version: String,

    pub timestamp: DateTime<Utc>,

    /// Version of the document this step operated on (or produced, for
    /// improve and promote steps).
    pub prompt_version: PromptVersion,

    pub status: EventStatus,

    pub payload: EventPayload,

    pub schema_version: String,

    pub meta: EventMeta,
}

impl AgentEvent {
    pub fn new(
        workflow_id: WorkflowId,
        seq: u64,
        step: StepKind,
        prompt_version: PromptVersion,
        payload: EventPayload,
        meta: EventMeta,
    ) -> Self {
        let status = match payload {
            EventPayload::Error(_) => EventStatus::Error,
            _ => EventStatus::Success,
        };
        Self {
            event_id: Uuid::new_v4(),
            workflow_id,
            seq,
            step_id: format!("{seq:04}-{step}"),
            step,
            agent_name: step.agent_name().to_string(),
            agent_version: crate::VERSION.to_string(),
            timestamp: Utc::now(),
            prompt_version,
            status,
            payload,
            schema_version: SCHEMA_VERSION.to_string(),
            meta,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.meta.terminal_state.is_some()
    }
}
