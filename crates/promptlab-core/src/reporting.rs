//! Per-run workflow reports.
//!
//! `write_report` persists `<dir>/<workflow_id>/report.json`, a
//! `report.digest` holding the SHA-256 of the JSON bytes, and a markdown
//! rendering in `report.md`. `read_report` refuses a report whose digest does
//! not match.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    sha256_hex, Category, EventPayload, PromptVersion, Stage, StepKind, TerminalState, Verdict,
    WorkflowId,
};
use crate::event_log::{replay_digest, EventLogError};
use crate::orchestrator::{LifecycleRun, RunOutcome};

pub const REPORT_SCHEMA_VERSION: &str = "1.0";

const REPORT_FILE: &str = "report.json";
const DIGEST_FILE: &str = "report.digest";
const MARKDOWN_FILE: &str = "report.md";

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("report serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("event stream digest failed: {0}")]
    EventLog(#[from] EventLogError),

    #[error("report digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ReportError + '_ {
    move |source| ReportError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// One evaluate round and what followed it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationSummary {
    pub iteration: u32,
    pub version: PromptVersion,
    pub score: f64,
    pub failed_criteria: Vec<String>,
    pub decision: Option<Verdict>,
    #[serde(default)]
    pub changed_fields: Vec<String>,
    #[serde(default)]
    pub rejected_edits: usize,
    /// Alignment score of the revision that followed this round.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alignment: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowReport {
    pub schema_version: String,
    pub generated_at: DateTime<Utc>,
    pub workflow_id: WorkflowId,
    pub source: String,
    pub base_name: String,
    pub category: Category,
    pub initial_stage: Stage,
    pub initial_version: PromptVersion,
    pub final_stage: Stage,
    pub final_version: PromptVersion,
    pub outcome: String,
    pub terminal_state: TerminalState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    pub retries: u32,
    pub duration_ms: u64,
    pub event_count: usize,
    pub replay_digest: String,
    pub iterations: Vec<IterationSummary>,
}

impl WorkflowReport {
    pub fn from_run(run: &LifecycleRun, source: &Path) -> Result<Self, ReportError> {
        let mut iterations: Vec<IterationSummary> = Vec::new();
        for event in &run.events {
            match (&event.payload, iterations.last_mut()) {
                (EventPayload::Quality(q), _) => iterations.push(IterationSummary {
                    iteration: event.meta.iteration,
                    version: event.prompt_version,
                    score: q.score(),
                    failed_criteria: q.failed_criteria().map(|(name, _)| name.clone()).collect(),
                    decision: None,
                    changed_fields: Vec::new(),
                    rejected_edits: 0,
                    alignment: None,
                }),
                (EventPayload::Decision(d), Some(last)) if event.step == StepKind::Decide => {
                    last.decision = Some(d.verdict);
                }
                (EventPayload::Improvement(i), Some(last)) => {
                    last.changed_fields = i.changed_fields().map(str::to_string).collect();
                    last.rejected_edits = i.rejections.len();
                    last.alignment = event.meta.alignment.as_ref().map(|a| a.score);
                }
                _ => {}
            }
        }

        let failure = match &run.outcome {
            RunOutcome::Failed { message, .. } => Some(message.clone()),
            _ => None,
        };

        Ok(Self {
            schema_version: REPORT_SCHEMA_VERSION.to_string(),
            generated_at: Utc::now(),
            workflow_id: run.workflow_id.clone(),
            source: source.display().to_string(),
            base_name: run.document.base_name.clone(),
            category: run.document.category,
            initial_stage: run.initial_stage,
            initial_version: run.initial_version,
            final_stage: run.document.stage,
            final_version: run.document.version,
            outcome: run.outcome.label().to_string(),
            terminal_state: run.outcome.terminal_state(),
            failure,
            retries: run.retries,
            duration_ms: run.duration_ms,
            event_count: run.events.len(),
            replay_digest: replay_digest(&run.events)?,
            iterations,
        })
    }
}

/// Persist the report, its digest and its markdown rendering. Returns the
/// JSON path.
pub fn write_report(dir: &Path, report: &WorkflowReport) -> Result<PathBuf, ReportError> {
    let run_dir = dir.join(report.workflow_id.as_str());
    std::fs::create_dir_all(&run_dir).map_err(io_err(&run_dir))?;

    let path = run_dir.join(REPORT_FILE);
    let digest_path = run_dir.join(DIGEST_FILE);
    let md_path = run_dir.join(MARKDOWN_FILE);

    let json = serde_json::to_vec_pretty(report)?;
    let digest = sha256_hex(&json);

    std::fs::write(&path, &json).map_err(io_err(&path))?;
    std::fs::write(&digest_path, digest.as_bytes()).map_err(io_err(&digest_path))?;
    std::fs::write(&md_path, render_report_md(report)).map_err(io_err(&md_path))?;

    Ok(path)
}

/// Read and verify `<dir>/<workflow_id>/report.json`.
pub fn read_report(dir: &Path, workflow_id: &str) -> Result<WorkflowReport, ReportError> {
    let run_dir = dir.join(workflow_id);
    let path = run_dir.join(REPORT_FILE);
    let digest_path = run_dir.join(DIGEST_FILE);

    let json = std::fs::read(&path).map_err(io_err(&path))?;
    let expected = std::fs::read_to_string(&digest_path).map_err(io_err(&digest_path))?;
    let actual = sha256_hex(&json);
    if expected.trim() != actual {
        return Err(ReportError::DigestMismatch {
            expected: expected.trim().to_string(),
            actual,
        });
    }
    Ok(serde_json::from_slice(&json)?)
}

pub fn render_report_md(report: &WorkflowReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Workflow Report: {}\n", report.workflow_id);
    let _ = writeln!(out, "- document: `{}` ({})", report.base_name, report.category);
    let _ = writeln!(out, "- outcome: **{}**", report.outcome);
    let _ = writeln!(
        out,
        "- version: {} v{} -> {} v{}",
        report.initial_stage, report.initial_version, report.final_stage, report.final_version
    );
    let _ = writeln!(out, "- retries: {}", report.retries);
    let _ = writeln!(out, "- events: {}", report.event_count);
    if let Some(failure) = &report.failure {
        let _ = writeln!(out, "- failure: {failure}");
    }
    out.push('\n');

    out.push_str("## Iterations\n\n");
    if report.iterations.is_empty() {
        out.push_str("No evaluations recorded.\n");
        return out;
    }
    out.push_str("| # | version | score | decision | failed criteria | changed fields |\n");
    out.push_str("|---|---------|-------|----------|-----------------|----------------|\n");
    for it in &report.iterations {
        let _ = writeln!(
            out,
            "| {} | {} | {:.3} | {} | {} | {} |",
            it.iteration,
            it.version,
            it.score,
            it.decision.map_or("-", Verdict::as_str),
            dash_if_empty(&it.failed_criteria),
            dash_if_empty(&it.changed_fields),
        );
    }
    out
}

fn dash_if_empty(items: &[String]) -> String {
    if items.is_empty() {
        "-".to_string()
    } else {
        items.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::domain::{Criterion, ScoringMatrix, VersionedDocument};
    use crate::event_log::MemoryEventLog;
    use crate::fakes::FnJudge;
    use crate::improver::REWRITE_PREFIX;
    use crate::orchestrator::{CancelSignal, LifecycleOrchestrator, LifecyclePolicy};

    async fn aborted_run() -> LifecycleRun {
        // "goal" always passes, "tone" always fails; rewrites change `tone`.
        let judge = FnJudge::new(|instruction, _| {
            if instruction.starts_with(REWRITE_PREFIX) {
                Ok("```\nfriendly and direct\n```".to_string())
            } else if instruction.contains("Criterion: tone") {
                Ok(r#"{"passed": false, "feedback": "too stiff"}"#.to_string())
            } else {
                Ok(r#"{"passed": true}"#.to_string())
            }
        });
        let matrix = ScoringMatrix::new(
            Category::Raw,
            vec![
                Criterion::new("goal", 3.0, "objective", "clear goal?"),
                Criterion::new("tone", 1.0, "tone", "right tone?"),
            ],
        )
        .expect("matrix");
        let orch = LifecycleOrchestrator::new(
            Arc::new(judge),
            Arc::new(MemoryEventLog::new()),
            LifecyclePolicy::new(0.9, 1).expect("policy"),
        )
        .expect("orchestrator");
        let doc = VersionedDocument::from_yaml(
            "greeter",
            Category::Raw,
            Stage::Raw,
            PromptVersion::new(0, 1, 0),
            "role: host\nobjective: greet\ntone: formal\n",
        )
        .expect("doc");
        orch.run(doc, &matrix, WorkflowId::new("wf-report"), &CancelSignal::never())
            .await
    }

    #[tokio::test]
    async fn test_report_from_aborted_run() {
        let run = aborted_run().await;
        let report = WorkflowReport::from_run(&run, Path::new("prompts/00-raw/greeter.yaml"))
            .expect("report");

        assert_eq!(report.outcome, "aborted");
        assert_eq!(report.terminal_state, TerminalState::Aborted);
        assert_eq!(report.iterations.len(), 2);
        assert_eq!(report.iterations[0].score, 0.75);
        assert_eq!(report.iterations[0].decision, Some(Verdict::Continue));
        assert_eq!(report.iterations[0].changed_fields, vec!["tone".to_string()]);
        assert_eq!(report.iterations[0].alignment, Some(1.0));
        assert_eq!(report.iterations[1].alignment, None);
        assert_eq!(report.iterations[1].decision, Some(Verdict::Abort));
        assert_eq!(report.iterations[1].version, PromptVersion::new(0, 1, 1));
        assert_eq!(report.final_version, PromptVersion::new(0, 1, 1));
        assert_eq!(report.event_count, run.events.len());
    }

    #[tokio::test]
    async fn test_write_read_and_tamper() {
        let dir = tempfile::tempdir().expect("tempdir");
        let run = aborted_run().await;
        let report = WorkflowReport::from_run(&run, Path::new("greeter.yaml")).expect("report");

        let path = write_report(dir.path(), &report).expect("write");
        assert!(path.ends_with("wf-report/report.json"));
        assert!(dir.path().join("wf-report/report.md").exists());

        let back = read_report(dir.path(), "wf-report").expect("read");
        assert_eq!(back, report);

        std::fs::write(&path, b"{\"tampered\": true}").expect("tamper");
        assert!(matches!(
            read_report(dir.path(), "wf-report"),
            Err(ReportError::DigestMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_markdown_lists_iterations() {
        let run = aborted_run().await;
        let report = WorkflowReport::from_run(&run, Path::new("greeter.yaml")).expect("report");
        let md = render_report_md(&report);

        assert!(md.starts_with("# Workflow Report: wf-report\n\n"));
        assert!(md.contains("- outcome: **aborted**"));
        assert!(md.contains("| 1 | 0.1.0 | 0.750 | CONTINUE | tone | tone |"));
        assert!(md.contains("| 2 | 0.1.1 | 0.750 | ABORT | tone | - |"));
    }
}
