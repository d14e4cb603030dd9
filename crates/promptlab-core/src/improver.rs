//! Improver: targeted field rewrites driven by failed criteria.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_yaml::{Mapping, Value};
use tracing::{debug, warn};

use crate::domain::document::value_bytes;
use crate::domain::{
    is_reserved_field, structural_violations, Category, ImprovementResult, LifecycleError,
    QualityResult, RejectedEdit, RejectionReason, Result, VersionedDocument,
};
use crate::judge::{parse_rewrite, ModelJudge};
use crate::obs;

/// Start of every rewrite instruction, followed by the field name.
pub const REWRITE_PREFIX: &str = "Rewrite the field `";

struct Finding<'a> {
    criterion: &'a str,
    feedback: &'a str,
}

/// Instruction asking the judge to rewrite one field.
pub fn rewrite_instruction(field: &str, current: Option<&Value>, findings: &[(&str, &str)]) -> String {
    let mut out = format!(
        "{REWRITE_PREFIX}{field}` of the prompt below so that it satisfies these review findings:\n"
    );
    for (criterion, feedback) in findings {
        out.push_str(&format!("- {criterion}: {feedback}\n"));
    }
    out.push_str("Current value:\n");
    match current.map(serde_yaml::to_string) {
        Some(Ok(rendered)) => out.push_str(&rendered),
        _ => out.push_str("(missing)\n"),
    }
    out.push_str(&format!(
        "Change nothing else. Reply with a JSON object: \
         {{\"field\": \"{field}\", \"value\": <new value>, \"rationale\": \"<why this fixes the findings>\"}}"
    ));
    out
}

/// Rewrites the fields behind failed criteria, one judge call per field.
///
/// Fields tied to a passed criterion and reserved metadata keys are never
/// sent to the judge. A proposal that answers for another field, leaves the
/// value unchanged, or breaks the category's required shape is dropped and
/// recorded in `rejections`; the field keeps its previous value.
#[derive(Clone)]
pub struct Improver {
    judge: Arc<dyn ModelJudge>,
}

impl Improver {
    pub fn new(judge: Arc<dyn ModelJudge>) -> Self {
        Self { judge }
    }

    pub async fn improve(
        &self,
        document: &VersionedDocument,
        quality: &QualityResult,
    ) -> Result<ImprovementResult> {
        let protected: BTreeSet<&str> = quality
            .passed_criteria()
            .map(|(_, o)| o.target_field.as_str())
            .collect();

        let mut by_field: BTreeMap<&str, Vec<Finding<'_>>> = BTreeMap::new();
        for (name, outcome) in quality.failed_criteria() {
            by_field
                .entry(outcome.target_field.as_str())
                .or_default()
                .push(Finding {
                    criterion: name,
                    feedback: outcome.feedback.as_str(),
                });
        }
        if by_field.is_empty() {
            return Err(LifecycleError::NoActionableFeedback);
        }

        let mut revised = document.content.clone();
        let mut rationale = BTreeMap::new();
        let mut rejections = Vec::new();
        let mut attempted = 0usize;
        let mut outages = 0usize;
        let mut last_outage = String::new();

        for (field, findings) in &by_field {
            let criteria = findings
                .iter()
                .map(|f| f.criterion)
                .collect::<Vec<_>>()
                .join(",");
            let mut reject = |reason: RejectionReason, detail: String| {
                obs::emit_edit_rejected(field, &criteria, &format!("{reason:?}"));
                rejections.push(RejectedEdit {
                    field: (*field).to_string(),
                    criterion: criteria.clone(),
                    reason,
                    detail,
                });
            };

            if is_reserved_field(field) {
                reject(
                    RejectionReason::ReservedField,
                    "metadata keys are not rewritten".to_string(),
                );
                continue;
            }
            if protected.contains(field) {
                reject(
                    RejectionReason::PassedCriterionField,
                    "field is tied to a criterion that passed".to_string(),
                );
                continue;
            }

            attempted += 1;
            let current = revised.get(*field).cloned();
            let pairs: Vec<(&str, &str)> =
                findings.iter().map(|f| (f.criterion, f.feedback)).collect();
            let instruction = rewrite_instruction(field, current.as_ref(), &pairs);

            let reply = match self.judge.judge(&instruction, document).await {
                Ok(reply) => reply,
                Err(e) => {
                    outages += 1;
                    last_outage = e.to_string();
                    warn!(field = %field, error = %e, "rewrite request failed");
                    reject(RejectionReason::JudgeUnavailable, e.to_string());
                    continue;
                }
            };

            let proposal = match parse_rewrite(&reply, field) {
                Ok(p) => p,
                Err(e) => {
                    reject(RejectionReason::MalformedProposal, e.to_string());
                    continue;
                }
            };
            if proposal.field != *field {
                reject(
                    RejectionReason::OffTarget,
                    format!("judge rewrote `{}` instead", proposal.field),
                );
                continue;
            }
            if current.as_ref().map(value_bytes) == Some(value_bytes(&proposal.value)) {
                reject(RejectionReason::Unchanged, "proposal equals current value".to_string());
                continue;
            }

            let mut candidate = revised.clone();
            candidate.insert(Value::String((*field).to_string()), proposal.value);
            if let Some((broken, reason)) =
                introduced_violation(document.category, &revised, &candidate, field)
            {
                reject(
                    RejectionReason::StructuralValidation,
                    format!("{reason}: {broken}"),
                );
                continue;
            }

            debug!(field = %field, criteria = %criteria, "rewrite accepted");
            revised = candidate;
            let why = proposal.rationale.unwrap_or_else(|| {
                let notes: Vec<String> = findings
                    .iter()
                    .map(|f| format!("{}: {}", f.criterion, f.feedback))
                    .collect();
                format!("addresses {}", notes.join("; "))
            });
            rationale.insert((*field).to_string(), why);
        }

        if attempted > 0 && outages == attempted {
            return Err(LifecycleError::ImprovementUnavailable {
                detail: format!("no field could be rewritten: {last_outage}"),
            });
        }

        let result = ImprovementResult::new(revised, rationale, rejections);
        result.verify_against(&document.content)?;
        Ok(result)
    }
}

/// First structural gap the edit of `field` would leave behind: the edited
/// field itself if it is required and now missing or empty, or any required
/// field that was intact before the edit. Gaps the document already had do
/// not count against an unrelated edit.
fn introduced_violation(
    category: Category,
    before: &Mapping,
    after: &Mapping,
    field: &str,
) -> Option<(&'static str, &'static str)> {
    let existing: BTreeSet<&str> = structural_violations(category, before)
        .into_iter()
        .map(|(f, _)| f)
        .collect();
    structural_violations(category, after)
        .into_iter()
        .find(|(f, _)| *f == field || !existing.contains(f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        Category, CriterionOutcome, QualityResult, Stage, VerdictSource, DEFAULT_VERSION,
    };
    use crate::fakes::FnJudge;
    use crate::judge::JudgeError;

    fn doc() -> VersionedDocument {
        VersionedDocument::from_yaml(
            "lead",
            Category::Raw,
            Stage::Raw,
            DEFAULT_VERSION,
            "role: analyst\nobjective: score leads\nconstraints: none\n",
        )
        .expect("doc")
    }

    fn outcome(passed: bool, field: &str, feedback: &str) -> CriterionOutcome {
        CriterionOutcome {
            passed,
            feedback: feedback.to_string(),
            weight: 1.0,
            target_field: field.to_string(),
            source: VerdictSource::Judged,
        }
    }

    fn quality(entries: &[(&str, bool, &str)]) -> QualityResult {
        let map = entries
            .iter()
            .map(|(name, passed, field)| {
                ((*name).to_string(), outcome(*passed, field, "needs work"))
            })
            .collect();
        QualityResult::from_outcomes(Category::Raw, map).expect("quality")
    }

    fn rewrite_judge() -> Arc<FnJudge> {
        Arc::new(FnJudge::new(|instr, _| {
            let field = instr
                .strip_prefix(REWRITE_PREFIX)
                .and_then(|rest| rest.split('`').next())
                .unwrap_or("unknown");
            Ok(format!(
                r#"{{"field": "{field}", "value": "improved {field}", "rationale": "sharper {field}"}}"#
            ))
        }))
    }

    #[tokio::test]
    async fn test_rewrites_only_failed_fields() {
        let judge = rewrite_judge();
        let q = quality(&[("goal", false, "objective"), ("role", true, "role")]);
        let result = Improver::new(judge.clone()).improve(&doc(), &q).await.expect("improve");

        assert_eq!(result.rationale.len(), 1);
        assert_eq!(result.rationale["objective"], "sharper objective");
        assert_eq!(
            result.revised_content.get("objective"),
            Some(&Value::String("improved objective".into()))
        );
        assert_eq!(result.revised_content.get("role"), doc().content.get("role"));
        assert_eq!(judge.call_count(), 1);
    }

    #[tokio::test]
    async fn test_field_of_passed_criterion_is_rejected_without_judge_call() {
        let judge = rewrite_judge();
        let q = quality(&[("goal", false, "objective"), ("clarity", true, "objective")]);
        let result = Improver::new(judge.clone()).improve(&doc(), &q).await.expect("improve");

        assert!(result.rationale.is_empty());
        assert_eq!(result.rejections.len(), 1);
        assert_eq!(result.rejections[0].reason, RejectionReason::PassedCriterionField);
        assert_eq!(judge.call_count(), 0);
    }

    #[tokio::test]
    async fn test_no_failed_criteria_is_no_actionable_feedback() {
        let q = quality(&[("goal", true, "objective")]);
        let err = Improver::new(rewrite_judge())
            .improve(&doc(), &q)
            .await
            .expect_err("nothing to do");
        assert!(matches!(err, LifecycleError::NoActionableFeedback));
    }

    #[tokio::test]
    async fn test_structurally_invalid_edit_is_rejected() {
        let judge = Arc::new(FnJudge::constant(r#"{"field": "role", "value": ""}"#));
        let q = quality(&[("role_spec", false, "role")]);
        let result = Improver::new(judge).improve(&doc(), &q).await.expect("improve");

        assert!(result.rationale.is_empty());
        assert_eq!(result.rejections[0].reason, RejectionReason::StructuralValidation);
        assert_eq!(result.revised_content, doc().content);
    }

    #[tokio::test]
    async fn test_off_target_and_unchanged_are_rejected() {
        let judge = Arc::new(FnJudge::new(|instr, _| {
            if instr.contains("`objective`") {
                Ok(r#"{"field": "role", "value": "poet"}"#.to_string())
            } else {
                Ok(r#"{"field": "constraints", "value": "none"}"#.to_string())
            }
        }));
        let q = quality(&[("goal", false, "objective"), ("limits", false, "constraints")]);
        let result = Improver::new(judge).improve(&doc(), &q).await.expect("improve");

        let reasons: Vec<RejectionReason> = result.rejections.iter().map(|r| r.reason).collect();
        assert_eq!(
            reasons,
            vec![RejectionReason::Unchanged, RejectionReason::OffTarget]
        );
        assert!(result.is_noop());
    }

    #[tokio::test]
    async fn test_all_outages_is_improvement_unavailable() {
        let judge = Arc::new(FnJudge::new(|_, _| Err(JudgeError::Timeout(50))));
        let q = quality(&[("goal", false, "objective")]);
        let err = Improver::new(judge).improve(&doc(), &q).await.expect_err("outage");
        assert!(matches!(err, LifecycleError::ImprovementUnavailable { .. }));
    }

    fn doc_from(yaml: &str) -> VersionedDocument {
        VersionedDocument::from_yaml("lead", Category::Raw, Stage::Raw, DEFAULT_VERSION, yaml)
            .expect("doc")
    }

    #[tokio::test]
    async fn test_unrelated_edit_allowed_when_document_already_incomplete() {
        let judge = Arc::new(FnJudge::constant(
            r#"{"field": "constraints", "value": "max 100 words"}"#,
        ));
        let d = doc_from("objective: rank leads\nconstraints: none\n");
        let q = quality(&[("limits", false, "constraints")]);
        let result = Improver::new(judge).improve(&d, &q).await.expect("improve");

        assert!(result.rejections.is_empty(), "{:?}", result.rejections);
        assert!(result.rationale.contains_key("constraints"));
        assert_eq!(
            result.revised_content.get("constraints"),
            Some(&Value::String("max 100 words".into()))
        );
    }

    #[tokio::test]
    async fn test_each_missing_required_field_can_be_filled() {
        let judge = rewrite_judge();
        let d = doc_from("notes: draft\n");
        let q = quality(&[("goal", false, "objective"), ("persona", false, "role")]);
        let result = Improver::new(judge).improve(&d, &q).await.expect("improve");

        assert!(result.rejections.is_empty(), "{:?}", result.rejections);
        let changed: Vec<&str> = result.changed_fields().collect();
        assert_eq!(changed, vec!["objective", "role"]);
        assert!(structural_violations(Category::Raw, &result.revised_content).is_empty());
    }

    #[tokio::test]
    async fn test_blanking_a_required_field_is_rejected_even_if_others_are_missing() {
        let judge = Arc::new(FnJudge::constant(r#"{"field": "objective", "value": "  "}"#));
        let d = doc_from("objective: rank leads\n");
        let q = quality(&[("goal", false, "objective")]);
        let result = Improver::new(judge).improve(&d, &q).await.expect("improve");

        assert!(result.is_noop());
        assert_eq!(result.rejections[0].reason, RejectionReason::StructuralValidation);
        assert!(result.rejections[0].detail.contains("objective"));
    }

    #[tokio::test]
    async fn test_missing_field_can_be_added() {
        let judge = rewrite_judge();
        let q = quality(&[("errors", false, "error_handling")]);
        let result = Improver::new(judge).improve(&doc(), &q).await.expect("improve");
        assert!(result.rationale.contains_key("error_handling"));
        assert!(result.verify_against(&doc().content).is_ok());
    }
}
