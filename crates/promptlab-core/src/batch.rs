//! Bounded-concurrency batch runs: one independent lifecycle per document.
//!
//! Runs share only the orchestrator (judge, sink, policy) and the read-only
//! scoring matrices. Each gets its own workflow id, counter, and document.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{instrument, warn};

use crate::domain::{ScoringMatrix, VersionedDocument, WorkflowId};
use crate::obs;
use crate::orchestrator::{CancelSignal, LifecycleOrchestrator, LifecycleRun, RunOutcome};

/// One document queued for a lifecycle run.
#[derive(Debug, Clone)]
pub struct LifecycleJob {
    pub document: VersionedDocument,
    pub matrix: Arc<ScoringMatrix>,
    /// Generated when absent.
    pub workflow_id: Option<WorkflowId>,
}

impl LifecycleJob {
    pub fn new(document: VersionedDocument, matrix: Arc<ScoringMatrix>) -> Self {
        Self {
            document,
            matrix,
            workflow_id: None,
        }
    }

    pub fn with_workflow_id(mut self, id: WorkflowId) -> Self {
        self.workflow_id = Some(id);
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("lifecycle task for {document} did not complete: {detail}")]
    TaskFailed { document: String, detail: String },
}

/// Run every job to a terminal state, at most `workers` at a time.
///
/// Results are returned in input order. A worker count of zero is treated
/// as one.
#[instrument(skip_all, fields(jobs = jobs.len(), workers = workers))]
pub async fn run_batch(
    orchestrator: Arc<LifecycleOrchestrator>,
    jobs: Vec<LifecycleJob>,
    workers: usize,
    cancel: CancelSignal,
) -> Vec<Result<LifecycleRun, BatchError>> {
    let sem = Arc::new(Semaphore::new(workers.max(1)));
    let mut tasks = Vec::with_capacity(jobs.len());

    for job in jobs {
        let orchestrator = Arc::clone(&orchestrator);
        let sem = Arc::clone(&sem);
        let cancel = cancel.clone();
        let label = job.document.file_name();

        let task = tokio::spawn(async move {
            let _permit = sem.acquire_owned().await.ok();
            let workflow_id = job.workflow_id.unwrap_or_else(WorkflowId::generate);
            orchestrator
                .run(job.document, &job.matrix, workflow_id, &cancel)
                .await
        });
        tasks.push((label, task));
    }

    let mut results = Vec::with_capacity(tasks.len());
    for (label, task) in tasks {
        results.push(task.await.map_err(|e| {
            warn!(document = %label, error = %e, "lifecycle task did not complete");
            BatchError::TaskFailed {
                document: label,
                detail: e.to_string(),
            }
        }));
    }

    let (mut promoted, mut aborted, mut failed) = (0, 0, 0);
    for result in &results {
        match result.as_ref().map(|r| &r.outcome) {
            Ok(RunOutcome::Promoted { .. }) => promoted += 1,
            Ok(RunOutcome::Aborted { .. }) | Ok(RunOutcome::Cancelled) => aborted += 1,
            Ok(RunOutcome::Failed { .. }) | Err(_) => failed += 1,
        }
    }
    obs::emit_batch_finished(results.len(), promoted, aborted, failed);

    results
}
