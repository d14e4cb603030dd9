//! Structured observability hooks for lifecycle runs.
//!
//! This module provides:
//! - Workflow-scoped tracing spans via [`workflow_span`]
//! - Emission functions for key lifecycle events: start, step, finish, batch
//!
//! Events are emitted at `info!` level (configurable via `PROMPTLAB_LOG`).
//! For JSON output pass `--json` to the CLI.

use tracing::{info, warn};

/// Span tagging every log line of one run with its workflow id.
///
/// Attach with `Instrument::instrument` so the future stays `Send`.
pub fn workflow_span(workflow_id: &str, document: &str) -> tracing::Span {
    tracing::info_span!("promptlab.workflow", workflow_id = %workflow_id, document = %document)
}

/// Emit event: workflow started for a document.
pub fn emit_workflow_started(workflow_id: &str, document: &str, stage: &str, version: &str) {
    info!(
        event = "workflow.started",
        workflow_id = %workflow_id,
        document = %document,
        stage = %stage,
        version = %version,
    );
}

/// Emit event: one lifecycle step recorded.
pub fn emit_step(workflow_id: &str, seq: u64, step: &str, status: &str) {
    info!(
        event = "workflow.step",
        workflow_id = %workflow_id,
        seq = seq,
        step = %step,
        status = %status,
    );
}

/// Emit event: evaluation scored.
pub fn emit_scored(workflow_id: &str, iteration: u32, score: f64, threshold: f64) {
    info!(
        event = "workflow.scored",
        workflow_id = %workflow_id,
        iteration = iteration,
        score = score,
        threshold = threshold,
    );
}

/// Emit event: workflow reached a terminal state.
pub fn emit_workflow_finished(workflow_id: &str, outcome: &str, duration_ms: u64, events: usize) {
    info!(
        event = "workflow.finished",
        workflow_id = %workflow_id,
        outcome = %outcome,
        duration_ms = duration_ms,
        total_events = events,
    );
}

/// Emit event: an event could not be persisted (warning level).
pub fn emit_append_failed(workflow_id: &str, seq: u64, error: &dyn std::fmt::Display) {
    warn!(event = "event_log.append_failed", workflow_id = %workflow_id, seq = seq, error = %error);
}

/// Emit event: a proposed field edit was rejected.
pub fn emit_edit_rejected(field: &str, criterion: &str, reason: &str) {
    info!(event = "improver.edit_rejected", field = %field, criterion = %criterion, reason = %reason);
}

/// Emit event: a batch finished.
pub fn emit_batch_finished(total: usize, promoted: usize, aborted: usize, failed: usize) {
    info!(
        event = "batch.finished",
        total = total,
        promoted = promoted,
        aborted = aborted,
        failed = failed,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_workflow_span_create() {
        let span = workflow_span("wf-1", "lead_scoring_raw_v0.1.0.yaml");
        let _entered = span.enter();
    }

    #[traced_test]
    #[test]
    fn test_finished_event_carries_outcome() {
        emit_workflow_finished("wf-2", "aborted", 1200, 9);
        assert!(logs_contain("workflow.finished"));
        assert!(logs_contain("outcome=aborted"));
        assert!(logs_contain("total_events=9"));
    }

    #[traced_test]
    #[test]
    fn test_append_failure_is_a_warning() {
        emit_append_failed("wf-3", 4, &"disk full");
        assert!(logs_contain("WARN"));
        assert!(logs_contain("event_log.append_failed"));
    }
}
