//! Pipeline: read documents from the store, run their lifecycle, persist
//! the results.
//!
//! Persistence rules:
//! - promoted: the promoted document is written to its new stage and the
//!   source file archived;
//! - aborted or cancelled after an improvement that changed something: the
//!   last revision is written in the same stage and the source archived, so
//!   a stage holds one live file per prompt;
//! - failed, or no effective change: nothing is written.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::batch::{run_batch, BatchError, LifecycleJob};
use crate::domain::{MatrixRegistry, PromptVersion, Stage, WorkflowId};
use crate::orchestrator::{CancelSignal, LifecycleOrchestrator, LifecycleRun, RunOutcome};
use crate::reporting::{write_report, ReportError, WorkflowReport};
use crate::store::{DocumentStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Report(#[from] ReportError),

    #[error(transparent)]
    Batch(#[from] BatchError),
}

/// What happened to one source file.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessedDocument {
    pub source: PathBuf,
    pub workflow_id: WorkflowId,
    pub outcome: RunOutcome,
    pub final_stage: Stage,
    pub final_version: PromptVersion,
    pub scores: Vec<f64>,
    pub written: Option<PathBuf>,
    pub archived: Option<PathBuf>,
    pub report: Option<PathBuf>,
}

pub struct PipelineContext {
    pub store: Arc<dyn DocumentStore>,
    pub orchestrator: Arc<LifecycleOrchestrator>,
    pub registry: MatrixRegistry,
    /// Write a report per run when set.
    pub report_dir: Option<PathBuf>,
}

impl PipelineContext {
    pub async fn process_document(
        &self,
        path: &Path,
        cancel: &CancelSignal,
    ) -> Result<ProcessedDocument, PipelineError> {
        let document = self.store.read(path)?;
        let matrix = self.registry.get(document.category);
        let run = self
            .orchestrator
            .run(document, &matrix, WorkflowId::generate(), cancel)
            .await;
        self.persist(path, &run)
    }

    /// Run the latest revision of every prompt in `stage`, at most `workers`
    /// at a time. Older revisions of the same base name are skipped. Results
    /// follow the store's listing order.
    pub async fn process_stage(
        &self,
        stage: Stage,
        workers: usize,
        cancel: &CancelSignal,
    ) -> Result<Vec<Result<ProcessedDocument, PipelineError>>, PipelineError> {
        let listed = self.store.list(stage)?;

        let mut paths = Vec::with_capacity(listed.len());
        let mut documents = Vec::with_capacity(listed.len());
        let mut latest: HashMap<String, (usize, PromptVersion)> = HashMap::new();
        for path in listed {
            let read = self.store.read(&path);
            if let Ok(document) = &read {
                let i = paths.len();
                match latest.get(&document.base_name) {
                    Some((_, best)) if *best >= document.version => {}
                    _ => {
                        latest.insert(document.base_name.clone(), (i, document.version));
                    }
                }
            }
            paths.push(path);
            documents.push(read);
        }

        let mut out: Vec<Option<Result<ProcessedDocument, PipelineError>>> =
            Vec::with_capacity(paths.len());
        let mut jobs = Vec::new();
        let mut slots = Vec::new();
        for (i, read) in documents.into_iter().enumerate() {
            match read {
                Ok(document) if latest.get(&document.base_name).map(|(j, _)| *j) == Some(i) => {
                    let matrix = self.registry.get(document.category);
                    jobs.push(LifecycleJob::new(document, matrix));
                    slots.push(i);
                    out.push(None);
                }
                Ok(document) => {
                    debug!(
                        path = %paths[i].display(),
                        version = %document.version,
                        "skipping superseded revision"
                    );
                    out.push(None);
                }
                Err(e) => out.push(Some(Err(e.into()))),
            }
        }

        let runs = run_batch(Arc::clone(&self.orchestrator), jobs, workers, cancel.clone()).await;
        for (i, run) in slots.into_iter().zip(runs) {
            let processed = run
                .map_err(PipelineError::from)
                .and_then(|run| self.persist(&paths[i], &run));
            out[i] = Some(processed);
        }

        Ok(out.into_iter().flatten().collect())
    }

    fn persist(&self, source: &Path, run: &LifecycleRun) -> Result<ProcessedDocument, PipelineError> {
        let (written, archived) = match run.outcome {
            RunOutcome::Promoted { .. } => {
                let written = self.store.write(&run.document)?;
                let archived = self.store.archive(source)?;
                (Some(written), Some(archived))
            }
            RunOutcome::Aborted { .. } | RunOutcome::Cancelled
                if run.improvements.iter().any(|i| !i.is_noop()) =>
            {
                let written = self.store.write(&run.document)?;
                let archived = self.store.archive(source)?;
                (Some(written), Some(archived))
            }
            _ => (None, None),
        };

        let report = match &self.report_dir {
            Some(dir) => Some(write_report(dir, &WorkflowReport::from_run(run, source)?)?),
            None => None,
        };

        info!(
            source = %source.display(),
            workflow_id = %run.workflow_id,
            outcome = run.outcome.label(),
            written = written.is_some(),
            "document processed"
        );

        Ok(ProcessedDocument {
            source: source.to_path_buf(),
            workflow_id: run.workflow_id.clone(),
            outcome: run.outcome.clone(),
            final_stage: run.document.stage,
            final_version: run.document.version,
            scores: run.scores(),
            written,
            archived,
            report,
        })
    }
}
