//! Lifecycle orchestrator: drives one document through
//! evaluate → decide → (improve → evaluate)* → promote | abort.
//!
//! Each revision is checked for alignment with the findings it answers; a
//! revision that changes none of the failed fields aborts the run.
//!
//! A run is strictly sequential. Every step appends exactly one event before
//! the next step starts, and every run ends with exactly one terminal event,
//! whether it is promoted, aborted, cancelled, or fails.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{warn, Instrument};

use crate::controller::{
    check_alignment, decide, decide_after_revision, transition, LifecycleState, Transition,
};
use crate::domain::{
    AgentEvent, AlignmentCheck, ControllerDecision, ErrorInfo, ErrorKind, EventMeta, EventPayload, EventStatus,
    ImprovementResult, LifecycleError, PromptVersion, QualityResult, Result, ScoringMatrix, Stage,
    StepKind, TerminalState, VersionedDocument, WorkflowId,
};
use crate::evaluator::QualityEvaluator;
use crate::event_log::EventSink;
use crate::improver::Improver;
use crate::judge::ModelJudge;
use crate::obs;

/// Promotion threshold and retry ceiling, fixed for the orchestrator's life.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LifecyclePolicy {
    /// Minimum weighted score for promotion, in `[0, 1]`. Inclusive.
    pub threshold: f64,
    /// Improve cycles allowed before a failing evaluation aborts.
    pub max_retries: u32,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            threshold: 0.9,
            max_retries: 3,
        }
    }
}

impl LifecyclePolicy {
    pub fn new(threshold: f64, max_retries: u32) -> Result<Self> {
        let policy = Self {
            threshold,
            max_retries,
        };
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.threshold.is_finite() || !(0.0..=1.0).contains(&self.threshold) {
            return Err(LifecycleError::Internal(format!(
                "threshold must be within [0, 1], got {}",
                self.threshold
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Sender side of a cancellation signal.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Observed by runs between steps. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: Option<watch::Receiver<bool>>,
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        Self { rx: None }
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }
}

pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx: Some(rx) })
}

// ---------------------------------------------------------------------------
// Run results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Promoted {
        from: Stage,
        to: Stage,
        version: PromptVersion,
    },
    Aborted {
        retries: u32,
    },
    Failed {
        kind: ErrorKind,
        message: String,
    },
    Cancelled,
}

impl RunOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Promoted { .. } => "promoted",
            Self::Aborted { .. } => "aborted",
            Self::Failed { .. } => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn terminal_state(&self) -> TerminalState {
        match self {
            Self::Promoted { .. } => TerminalState::Promoted,
            Self::Aborted { .. } | Self::Cancelled => TerminalState::Aborted,
            Self::Failed { .. } => TerminalState::Failed,
        }
    }
}

/// Everything one lifecycle run produced.
#[derive(Debug, Clone)]
pub struct LifecycleRun {
    pub workflow_id: WorkflowId,
    pub initial_stage: Stage,
    pub initial_version: PromptVersion,
    /// Promoted document, or the last revision reached.
    pub document: VersionedDocument,
    pub outcome: RunOutcome,
    /// Full event sequence, in emission order. Authoritative even when the
    /// sink failed to persist some of it.
    pub events: Vec<AgentEvent>,
    pub evaluations: Vec<QualityResult>,
    pub improvements: Vec<ImprovementResult>,
    pub retries: u32,
    pub duration_ms: u64,
}

impl LifecycleRun {
    pub fn scores(&self) -> Vec<f64> {
        self.evaluations.iter().map(QualityResult::score).collect()
    }

    pub fn is_promoted(&self) -> bool {
        matches!(self.outcome, RunOutcome::Promoted { .. })
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Per-run mutable state. Lives outside the driven future so a panic inside
/// a step still leaves the events recorded so far.
struct RunContext {
    workflow_id: WorkflowId,
    sink: Arc<dyn EventSink>,
    events: Vec<AgentEvent>,
    document: VersionedDocument,
    iteration: u32,
    step: StepKind,
    retries: u32,
    evaluations: Vec<QualityResult>,
    improvements: Vec<ImprovementResult>,
    outcome: Option<RunOutcome>,
}

impl RunContext {
    async fn emit(
        &mut self,
        step: StepKind,
        payload: EventPayload,
        terminal_state: Option<TerminalState>,
    ) {
        self.emit_with_alignment(step, payload, terminal_state, None).await;
    }

    async fn emit_with_alignment(
        &mut self,
        step: StepKind,
        payload: EventPayload,
        terminal_state: Option<TerminalState>,
        alignment: Option<AlignmentCheck>,
    ) {
        let meta = EventMeta {
            iteration: self.iteration,
            source_event_id: self.events.last().map(|e| e.event_id),
            category: Some(self.document.category),
            base_name: Some(self.document.base_name.clone()),
            content_digest: Some(self.document.content_digest()),
            terminal_state,
            alignment,
            ..EventMeta::default()
        };
        let seq = self.events.len() as u64 + 1;
        let event = AgentEvent::new(
            self.workflow_id.clone(),
            seq,
            step,
            self.document.version,
            payload,
            meta,
        );

        if let Err(e) = self.sink.append(&event).await {
            obs::emit_append_failed(self.workflow_id.as_str(), seq, &e);
        }
        let status = match event.status {
            EventStatus::Success => "success",
            EventStatus::Error => "error",
        };
        obs::emit_step(self.workflow_id.as_str(), seq, step.as_str(), status);

        self.events.push(event);
    }

    async fn fail(&mut self, step: StepKind, err: LifecycleError) {
        warn!(step = %step, error = %err, "lifecycle step failed");
        let info = ErrorInfo::from_error(step, &err)
            .with_context("retry_count", serde_json::json!(self.retries));
        self.emit(step, EventPayload::Error(info), Some(TerminalState::Failed))
            .await;
        self.outcome = Some(RunOutcome::Failed {
            kind: err.kind(),
            message: err.to_string(),
        });
    }

    async fn cancel(&mut self, before: StepKind) {
        let err = LifecycleError::Cancelled {
            step: before.as_str().to_string(),
        };
        let info = ErrorInfo::from_error(before, &err);
        self.emit(
            StepKind::Abort,
            EventPayload::Error(info),
            Some(TerminalState::Aborted),
        )
        .await;
        self.outcome = Some(RunOutcome::Cancelled);
    }
}

/// Runs documents through the lifecycle with a fixed policy, judge and sink.
pub struct LifecycleOrchestrator {
    evaluator: QualityEvaluator,
    improver: Improver,
    sink: Arc<dyn EventSink>,
    policy: LifecyclePolicy,
}

impl LifecycleOrchestrator {
    pub fn new(
        judge: Arc<dyn ModelJudge>,
        sink: Arc<dyn EventSink>,
        policy: LifecyclePolicy,
    ) -> Result<Self> {
        policy.validate()?;
        Ok(Self {
            evaluator: QualityEvaluator::new(Arc::clone(&judge)),
            improver: Improver::new(judge),
            sink,
            policy,
        })
    }

    /// Escalate evaluations to `JudgeUnavailable` after `limit` consecutive
    /// judge failures.
    pub fn with_outage_limit(mut self, limit: Option<usize>) -> Self {
        self.evaluator = self.evaluator.with_outage_limit(limit);
        self
    }

    pub fn policy(&self) -> LifecyclePolicy {
        self.policy
    }

    /// Run the lifecycle for `document` under a freshly generated workflow id.
    pub async fn run_document(
        &self,
        document: VersionedDocument,
        matrix: &ScoringMatrix,
    ) -> LifecycleRun {
        self.run(document, matrix, WorkflowId::generate(), &CancelSignal::never())
            .await
    }

    /// Run the lifecycle for `document` to a terminal state.
    ///
    /// Never returns an error: failures are recorded as the terminal event
    /// and reflected in [`LifecycleRun::outcome`].
    pub async fn run(
        &self,
        document: VersionedDocument,
        matrix: &ScoringMatrix,
        workflow_id: WorkflowId,
        cancel: &CancelSignal,
    ) -> LifecycleRun {
        let span = obs::workflow_span(workflow_id.as_str(), &document.file_name());
        self.run_inner(document, matrix, workflow_id, cancel)
            .instrument(span)
            .await
    }

    async fn run_inner(
        &self,
        document: VersionedDocument,
        matrix: &ScoringMatrix,
        workflow_id: WorkflowId,
        cancel: &CancelSignal,
    ) -> LifecycleRun {
        let started = Instant::now();
        let initial_stage = document.stage;
        let initial_version = document.version;
        obs::emit_workflow_started(
            workflow_id.as_str(),
            &document.base_name,
            initial_stage.suffix(),
            &initial_version.to_string(),
        );

        let mut ctx = RunContext {
            workflow_id: workflow_id.clone(),
            sink: Arc::clone(&self.sink),
            events: Vec::new(),
            document,
            iteration: 1,
            step: StepKind::Evaluate,
            retries: 0,
            evaluations: Vec::new(),
            improvements: Vec::new(),
            outcome: None,
        };

        let driven = AssertUnwindSafe(self.drive(&mut ctx, matrix, cancel))
            .catch_unwind()
            .await;
        if let Err(payload) = driven {
            let detail = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            let step = ctx.step;
            ctx.fail(step, LifecycleError::Internal(format!("step panicked: {detail}")))
                .await;
        }

        let outcome = match ctx.outcome.take() {
            Some(outcome) => outcome,
            None => {
                let step = ctx.step;
                ctx.fail(
                    step,
                    LifecycleError::InvariantViolation("run ended without an outcome".to_string()),
                )
                .await;
                ctx.outcome.take().unwrap_or(RunOutcome::Cancelled)
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        obs::emit_workflow_finished(
            workflow_id.as_str(),
            outcome.label(),
            duration_ms,
            ctx.events.len(),
        );

        LifecycleRun {
            workflow_id,
            initial_stage,
            initial_version,
            document: ctx.document,
            outcome,
            events: ctx.events,
            evaluations: ctx.evaluations,
            improvements: ctx.improvements,
            retries: ctx.retries,
            duration_ms,
        }
    }

    async fn drive(&self, ctx: &mut RunContext, matrix: &ScoringMatrix, cancel: &CancelSignal) {
        if ctx.document.stage.next().is_none() {
            let err = LifecycleError::TerminalStage {
                stage: ctx.document.stage,
            };
            ctx.fail(StepKind::Promote, err).await;
            return;
        }

        let policy = self.policy;
        let mut state = LifecycleState::Evaluating;

        loop {
            ctx.iteration = ctx.retries + 1;

            if cancel.is_cancelled() {
                ctx.cancel(StepKind::Evaluate).await;
                return;
            }
            ctx.step = StepKind::Evaluate;
            let quality = match self.evaluator.evaluate(&ctx.document, matrix).await {
                Ok(q) => q,
                Err(e) => {
                    ctx.fail(StepKind::Evaluate, e).await;
                    return;
                }
            };
            obs::emit_scored(
                ctx.workflow_id.as_str(),
                ctx.iteration,
                quality.score(),
                policy.threshold,
            );
            ctx.emit(StepKind::Evaluate, EventPayload::Quality(quality.clone()), None)
                .await;
            ctx.evaluations.push(quality.clone());

            ctx.step = StepKind::Decide;
            let decision = decide(&quality, policy.threshold, ctx.retries, policy.max_retries);
            state = match transition(state, Transition::Decided(decision.verdict)) {
                Ok(next) => next,
                Err(e) => {
                    ctx.fail(StepKind::Decide, e).await;
                    return;
                }
            };
            ctx.emit(StepKind::Decide, EventPayload::Decision(decision.clone()), None)
                .await;

            match state {
                LifecycleState::Promoted => {
                    ctx.step = StepKind::Promote;
                    self.promote(ctx, decision).await;
                    return;
                }
                LifecycleState::Aborted => {
                    ctx.step = StepKind::Abort;
                    let retries = ctx.retries;
                    ctx.emit(
                        StepKind::Abort,
                        EventPayload::Decision(decision),
                        Some(TerminalState::Aborted),
                    )
                    .await;
                    ctx.outcome = Some(RunOutcome::Aborted { retries });
                    return;
                }
                LifecycleState::Improving => {}
                LifecycleState::Evaluating => {
                    ctx.fail(
                        StepKind::Decide,
                        LifecycleError::InvariantViolation(
                            "decision left the run in EVALUATING".to_string(),
                        ),
                    )
                    .await;
                    return;
                }
            }

            if cancel.is_cancelled() {
                ctx.cancel(StepKind::Improve).await;
                return;
            }
            ctx.step = StepKind::Improve;
            let revised = match self.improver.improve(&ctx.document, &quality).await {
                Ok(improvement) => match ctx.document.apply(&improvement) {
                    Ok(next) => (improvement, next),
                    Err(e) => {
                        ctx.fail(StepKind::Improve, e).await;
                        return;
                    }
                },
                Err(e) => {
                    ctx.fail(StepKind::Improve, e).await;
                    return;
                }
            };
            let (improvement, next) = revised;
            let alignment = check_alignment(&quality, &improvement);
            ctx.document = next;
            ctx.retries += 1;
            ctx.emit_with_alignment(
                StepKind::Improve,
                EventPayload::Improvement(improvement.clone()),
                None,
                Some(alignment.clone()),
            )
            .await;
            ctx.improvements.push(improvement);

            if let Some(abort) = decide_after_revision(
                &alignment,
                &quality,
                policy.threshold,
                ctx.retries,
                policy.max_retries,
            ) {
                if let Err(e) = transition(state, Transition::Unaligned) {
                    ctx.fail(StepKind::Abort, e).await;
                    return;
                }
                ctx.step = StepKind::Abort;
                let retries = ctx.retries;
                ctx.emit(
                    StepKind::Abort,
                    EventPayload::Decision(abort),
                    Some(TerminalState::Aborted),
                )
                .await;
                ctx.outcome = Some(RunOutcome::Aborted { retries });
                return;
            }

            state = match transition(state, Transition::Improved) {
                Ok(next) => next,
                Err(e) => {
                    ctx.fail(StepKind::Improve, e).await;
                    return;
                }
            };
        }
    }

    async fn promote(&self, ctx: &mut RunContext, decision: ControllerDecision) {
        let from = ctx.document.stage;
        match ctx.document.promote() {
            Ok(promoted) => {
                let to = promoted.stage;
                let version = promoted.version;
                let record = ControllerDecision {
                    reason: format!(
                        "promoted {from} -> {to} at v{version} after {} retries",
                        ctx.retries
                    ),
                    retry_count: 0,
                    ..decision
                };
                ctx.document = promoted;
                ctx.emit(
                    StepKind::Promote,
                    EventPayload::Decision(record),
                    Some(TerminalState::Promoted),
                )
                .await;
                ctx.outcome = Some(RunOutcome::Promoted { from, to, version });
            }
            Err(e) => ctx.fail(StepKind::Promote, e).await,
        }
    }
}
