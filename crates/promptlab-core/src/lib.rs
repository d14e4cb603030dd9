//! Promptlab Core Library
//!
//! Prompt lifecycle engine: scores versioned YAML prompts against weighted
//! matrices through a model judge, rewrites failing fields, and promotes
//! passing prompts along raw -> template -> config -> active. Every step is
//! recorded as an immutable event.

pub mod batch;
pub mod config;
pub mod controller;
pub mod domain;
pub mod evaluator;
pub mod event_log;
pub mod fakes;
pub mod improver;
pub mod judge;
pub mod obs;
pub mod orchestrator;
pub mod pipeline;
pub mod reporting;
pub mod store;
pub mod telemetry;

/// Version stamped into every event as `agent_version`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use domain::{
    AgentEvent, AlignmentCheck, Category, ControllerDecision, Criterion, ErrorKind, EventPayload,
    ImprovementResult, LifecycleError, MatrixRegistry, PromptVersion, QualityResult, Result,
    ScoringMatrix, Stage, StepKind, TerminalState, Verdict, VersionedDocument, WorkflowId,
};

pub use batch::{run_batch, BatchError, LifecycleJob};
pub use config::{ConfigError, LifecycleConfig};
pub use controller::decide;
pub use evaluator::QualityEvaluator;
pub use event_log::{
    verify_stream, EventLogError, EventSink, JsonlEventLog, MemoryEventLog, StreamSummary,
};
pub use improver::Improver;
pub use judge::{JudgeError, ModelJudge, OpenAiJudge, OpenAiJudgeConfig, TimeoutJudge};
pub use orchestrator::{
    cancel_pair, CancelHandle, CancelSignal, LifecycleOrchestrator, LifecyclePolicy, LifecycleRun,
    RunOutcome,
};
pub use pipeline::{PipelineContext, PipelineError, ProcessedDocument};
pub use reporting::{read_report, write_report, ReportError, WorkflowReport};
pub use store::{DocumentStore, FsDocumentStore, StoreError};
pub use telemetry::{init_tracing, LogFormat};
