//! End-to-end lifecycle tests against scripted judges.
//!
//! Covers the run-level guarantees: one-shot promotion, bounded retries,
//! judge outages, protected fields, version monotonicity and the event log
//! contract.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use promptlab_core::domain::{ErrorKind, EventPayload, RejectionReason};
use promptlab_core::evaluator::CRITERION_PREFIX;
use promptlab_core::event_log::replay_digest;
use promptlab_core::fakes::FnJudge;
use promptlab_core::improver::REWRITE_PREFIX;
use promptlab_core::{
    verify_stream, CancelSignal, Category, Criterion, ImprovementResult, JsonlEventLog,
    LifecycleOrchestrator, LifecyclePolicy, MemoryEventLog, PromptVersion, QualityEvaluator,
    RunOutcome, ScoringMatrix, Stage, StepKind, TerminalState, Verdict, VersionedDocument,
    WorkflowId,
};

const PASS: &str = r#"{"passed": true, "feedback": "fine"}"#;

fn raw_doc() -> VersionedDocument {
    VersionedDocument::from_yaml(
        "lead_scoring",
        Category::Raw,
        Stage::Raw,
        PromptVersion::new(0, 1, 0),
        "role: analyst\nobjective: rank inbound leads\ntone: formal\nlength: short\n",
    )
    .expect("doc")
}

/// Four equal-weight criteria; `tone` is the one scripted to fail.
fn four_criteria() -> ScoringMatrix {
    ScoringMatrix::new(
        Category::Raw,
        vec![
            Criterion::new("goal", 1.0, "objective", "Is the objective clear?"),
            Criterion::new("persona", 1.0, "role", "Is the role specific?"),
            Criterion::new("tone", 1.0, "tone", "Is the tone approachable?"),
            Criterion::new("brevity", 1.0, "length", "Is the length stated?"),
        ],
    )
    .expect("matrix")
}

/// Passes every criterion except `tone`, and proposes a fresh `tone` value on
/// every rewrite request.
fn tone_always_fails() -> FnJudge {
    let rewrites = AtomicUsize::new(0);
    FnJudge::new(move |instruction, _| {
        if instruction.starts_with(REWRITE_PREFIX) {
            let n = rewrites.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!(
                r#"{{"field": "tone", "value": "warm, attempt {n}", "rationale": "less stiff"}}"#
            ))
        } else if instruction.starts_with(&format!("{CRITERION_PREFIX}tone")) {
            Ok(r#"{"passed": false, "feedback": "reads like a legal notice"}"#.to_string())
        } else {
            Ok(PASS.to_string())
        }
    })
}

fn orchestrator(judge: Arc<FnJudge>, threshold: f64, max_retries: u32) -> LifecycleOrchestrator {
    LifecycleOrchestrator::new(
        judge,
        Arc::new(MemoryEventLog::new()),
        LifecyclePolicy::new(threshold, max_retries).expect("policy"),
    )
    .expect("orchestrator")
}

fn steps(events: &[promptlab_core::AgentEvent]) -> Vec<StepKind> {
    events.iter().map(|e| e.step).collect()
}

#[tokio::test]
async fn test_passing_document_promotes_after_one_evaluation() {
    let judge = Arc::new(FnJudge::constant(PASS));
    let matrix = four_criteria();
    let run = orchestrator(judge.clone(), 0.9, 3)
        .run_document(raw_doc(), &matrix)
        .await;

    assert_eq!(
        run.outcome,
        RunOutcome::Promoted {
            from: Stage::Raw,
            to: Stage::Template,
            version: PromptVersion::new(0, 2, 0),
        }
    );
    assert_eq!(
        steps(&run.events),
        vec![StepKind::Evaluate, StepKind::Decide, StepKind::Promote]
    );
    assert_eq!(run.evaluations.len(), 1);
    assert_eq!(run.document.stage, Stage::Template);
    assert_eq!(judge.call_count(), 4);
    assert_eq!(judge.count_with_prefix(REWRITE_PREFIX), 0);

    let last = run.events.last().expect("terminal event");
    assert_eq!(last.meta.terminal_state, Some(TerminalState::Promoted));
    assert_eq!(last.prompt_version, PromptVersion::new(0, 2, 0));
}

#[tokio::test]
async fn test_stalled_score_aborts_after_max_retries() {
    // 3 of 4 criteria pass: 0.75 < 0.9 on every round.
    let judge = Arc::new(tone_always_fails());
    let matrix = four_criteria();
    let run = orchestrator(judge.clone(), 0.9, 2)
        .run_document(raw_doc(), &matrix)
        .await;

    assert_eq!(run.outcome, RunOutcome::Aborted { retries: 2 });
    assert_eq!(run.scores(), vec![0.75, 0.75, 0.75]);
    assert_eq!(
        steps(&run.events),
        vec![
            StepKind::Evaluate,
            StepKind::Decide,
            StepKind::Improve,
            StepKind::Evaluate,
            StepKind::Decide,
            StepKind::Improve,
            StepKind::Evaluate,
            StepKind::Decide,
            StepKind::Abort,
        ]
    );
    assert_eq!(judge.count_with_prefix(REWRITE_PREFIX), 2);

    let verdicts: Vec<Verdict> = run
        .events
        .iter()
        .filter(|e| e.step == StepKind::Decide)
        .filter_map(|e| match &e.payload {
            EventPayload::Decision(d) => Some(d.verdict),
            _ => None,
        })
        .collect();
    assert_eq!(verdicts, vec![Verdict::Continue, Verdict::Continue, Verdict::Abort]);

    // The aborted run keeps its last revision, in the same stage.
    assert_eq!(run.document.stage, Stage::Raw);
    assert_eq!(run.document.version, PromptVersion::new(0, 1, 2));
    assert_eq!(
        run.document.field("tone").and_then(|v| v.as_str()),
        Some("warm, attempt 2")
    );
}

#[tokio::test]
async fn test_evaluation_count_is_max_retries_plus_one() {
    for max_retries in [0u32, 1, 4] {
        let run = orchestrator(Arc::new(tone_always_fails()), 0.9, max_retries)
            .run_document(raw_doc(), &four_criteria())
            .await;
        assert_eq!(run.evaluations.len() as u32, max_retries + 1);
        assert_eq!(run.improvements.len() as u32, max_retries);
        assert_eq!(run.outcome, RunOutcome::Aborted { retries: max_retries });
    }
}

#[tokio::test]
async fn test_versions_never_decrease() {
    let run = orchestrator(Arc::new(tone_always_fails()), 0.9, 3)
        .run_document(raw_doc(), &four_criteria())
        .await;

    let versions: Vec<PromptVersion> = run.events.iter().map(|e| e.prompt_version).collect();
    assert!(versions.windows(2).all(|w| w[0] <= w[1]), "{versions:?}");
    assert_eq!(versions.first(), Some(&PromptVersion::new(0, 1, 0)));
    assert_eq!(versions.last(), Some(&PromptVersion::new(0, 1, 3)));
}

#[tokio::test]
async fn test_unavailable_judge_fails_with_a_single_error_event() {
    let judge = Arc::new(FnJudge::unavailable());
    let matrix = ScoringMatrix::builtin(Category::Raw);
    let run = orchestrator(judge.clone(), 0.9, 3)
        .run_document(raw_doc(), &matrix)
        .await;

    assert!(matches!(
        run.outcome,
        RunOutcome::Failed {
            kind: ErrorKind::JudgeUnavailable,
            ..
        }
    ));
    assert_eq!(run.events.len(), 1);
    let event = &run.events[0];
    assert_eq!(event.step, StepKind::Evaluate);
    assert_eq!(event.meta.terminal_state, Some(TerminalState::Failed));
    assert!(matches!(event.payload, EventPayload::Error(_)));
    assert_eq!(judge.count_with_prefix(REWRITE_PREFIX), 0);
    assert_eq!(run.document, raw_doc());
}

#[tokio::test]
async fn test_evaluation_is_idempotent() {
    let evaluator = QualityEvaluator::new(Arc::new(tone_always_fails()));
    let doc = raw_doc();
    let matrix = four_criteria();

    let first = evaluator.evaluate(&doc, &matrix).await.expect("first");
    let second = evaluator.evaluate(&doc, &matrix).await.expect("second");
    assert_eq!(first, second);
    assert_eq!(first.score(), 0.75);
}

#[tokio::test]
async fn test_rationale_covers_exactly_the_changed_fields() {
    let run = orchestrator(Arc::new(tone_always_fails()), 0.9, 1)
        .run_document(raw_doc(), &four_criteria())
        .await;
    let improvement = &run.improvements[0];

    let changed: Vec<&str> = improvement.changed_fields().collect();
    assert_eq!(changed, vec!["tone"]);
    assert_eq!(improvement.rationale.get("tone").map(String::as_str), Some("less stiff"));
    improvement
        .verify_against(&raw_doc().content)
        .expect("revision derived from the original");

    let json = serde_json::to_string(improvement).expect("serialize");
    let back: ImprovementResult = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(&back, improvement);
}

#[tokio::test]
async fn test_field_of_a_passed_criterion_is_never_rewritten() {
    // Both criteria read `objective`; one passes, so the field is protected.
    let judge = Arc::new(FnJudge::new(|instruction, _| {
        if instruction.starts_with(&format!("{CRITERION_PREFIX}specificity")) {
            Ok(r#"{"passed": false, "feedback": "too vague"}"#.to_string())
        } else {
            Ok(PASS.to_string())
        }
    }));
    let matrix = ScoringMatrix::new(
        Category::Raw,
        vec![
            Criterion::new("goal", 1.0, "objective", "Is there an objective?"),
            Criterion::new("specificity", 1.0, "objective", "Is the objective specific?"),
        ],
    )
    .expect("matrix");

    let run = orchestrator(judge.clone(), 0.9, 3)
        .run_document(raw_doc(), &matrix)
        .await;

    assert_eq!(judge.count_with_prefix(REWRITE_PREFIX), 0);
    // Nothing could change, so the run stops instead of re-evaluating.
    assert_eq!(
        steps(&run.events),
        vec![StepKind::Evaluate, StepKind::Decide, StepKind::Improve, StepKind::Abort]
    );
    assert_eq!(run.outcome, RunOutcome::Aborted { retries: 1 });
    assert_eq!(run.evaluations.len(), 1);
    let alignment = run.events[2].meta.alignment.as_ref().expect("alignment");
    assert_eq!(alignment.score, 0.0);
    assert_eq!(alignment.rejected, 1);
    match &run.events[3].payload {
        EventPayload::Decision(d) => assert_eq!(d.verdict, Verdict::Abort),
        other => panic!("unexpected payload {other:?}"),
    }
    assert!(verify_stream(&run.events).is_ok());

    let improvement = &run.improvements[0];
    assert!(improvement.is_noop());
    assert_eq!(improvement.revised_content, raw_doc().content);
    assert_eq!(improvement.rejections.len(), 1);
    assert_eq!(
        improvement.rejections[0].reason,
        RejectionReason::PassedCriterionField
    );
    assert_eq!(run.document.field("objective"), raw_doc().field("objective"));
}

#[tokio::test]
async fn test_jsonl_log_matches_in_memory_events() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log = Arc::new(JsonlEventLog::new(dir.path()).expect("log"));
    let orch = LifecycleOrchestrator::new(
        Arc::new(tone_always_fails()),
        log.clone(),
        LifecyclePolicy::new(0.9, 2).expect("policy"),
    )
    .expect("orchestrator");

    let id = WorkflowId::new("wf-jsonl");
    let run = orch
        .run(raw_doc(), &four_criteria(), id.clone(), &CancelSignal::never())
        .await;

    let stored = log.read(&id).await.expect("read back");
    assert_eq!(stored, run.events);

    let summary = verify_stream(&stored).expect("well-formed stream");
    assert_eq!(summary.event_count, 9);
    assert_eq!(summary.evaluations, 3);
    assert_eq!(summary.decisions, 3);
    assert_eq!(summary.improvements, 2);
    assert_eq!(summary.errors, 0);
    assert_eq!(summary.terminal_state, TerminalState::Aborted);
    assert_eq!(summary.final_version, PromptVersion::new(0, 1, 2));
}

#[tokio::test]
async fn test_identical_runs_share_a_replay_digest() {
    let matrix = four_criteria();
    let a = orchestrator(Arc::new(tone_always_fails()), 0.9, 2)
        .run(raw_doc(), &matrix, WorkflowId::new("wf-a"), &CancelSignal::never())
        .await;
    let b = orchestrator(Arc::new(tone_always_fails()), 0.9, 2)
        .run(raw_doc(), &matrix, WorkflowId::new("wf-b"), &CancelSignal::never())
        .await;

    assert_eq!(
        replay_digest(&a.events).expect("digest a"),
        replay_digest(&b.events).expect("digest b")
    );
}
