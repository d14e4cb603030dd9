//! Quality evaluator: scores a document against a scoring matrix.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::domain::{
    Criterion, CriterionOutcome, LifecycleError, QualityResult, Result, ScoringMatrix,
    VerdictSource, VersionedDocument,
};
use crate::judge::{parse_verdict, ModelJudge};

/// First line of every evaluation instruction, followed by the criterion name.
pub const CRITERION_PREFIX: &str = "Criterion: ";

/// Instruction sent to the judge for one criterion.
pub fn criterion_instruction(criterion: &Criterion) -> String {
    format!(
        "{CRITERION_PREFIX}{}\nQuestion: {}\n\
         Judge only this criterion for the prompt below.\n\
         Reply with a JSON object: {{\"passed\": true|false, \"feedback\": \"<what to fix, one sentence>\"}}",
        criterion.name, criterion.description
    )
}

/// Asks the judge one question per criterion and folds the verdicts into a
/// weighted score.
///
/// A reply that cannot be read fails only its criterion. A criterion whose
/// judge call fails is also recorded as failed; the evaluation as a whole
/// fails with `JudgeUnavailable` when every criterion hit an outage, or when
/// an optional consecutive-outage limit is reached.
#[derive(Clone)]
pub struct QualityEvaluator {
    judge: Arc<dyn ModelJudge>,
    outage_limit: Option<usize>,
}

impl QualityEvaluator {
    pub fn new(judge: Arc<dyn ModelJudge>) -> Self {
        Self {
            judge,
            outage_limit: None,
        }
    }

    /// Escalate to `JudgeUnavailable` after `limit` consecutive outages.
    pub fn with_outage_limit(mut self, limit: Option<usize>) -> Self {
        self.outage_limit = limit.filter(|n| *n > 0);
        self
    }

    pub async fn evaluate(
        &self,
        document: &VersionedDocument,
        matrix: &ScoringMatrix,
    ) -> Result<QualityResult> {
        let total = matrix.total_weight();
        if matrix.criteria().is_empty() || total.is_nan() || total <= 0.0 {
            return Err(LifecycleError::EmptyMatrix {
                category: matrix.category(),
            });
        }

        let mut outcomes = BTreeMap::new();
        let mut consecutive_outages = 0usize;
        let mut last_outage = String::new();

        for criterion in matrix.criteria() {
            let instruction = criterion_instruction(criterion);
            let outcome = match self.judge.judge(&instruction, document).await {
                Ok(reply) => {
                    consecutive_outages = 0;
                    match parse_verdict(&reply) {
                        Ok(verdict) => {
                            debug!(criterion = %criterion.name, passed = verdict.passed, "criterion judged");
                            let feedback = if verdict.feedback.is_empty() && !verdict.passed {
                                criterion.feedback_hint.clone()
                            } else {
                                verdict.feedback
                            };
                            outcome_for(criterion, verdict.passed, feedback, VerdictSource::Judged)
                        }
                        Err(e) => {
                            let err = LifecycleError::MalformedJudgeResponse {
                                criterion: criterion.name.clone(),
                                detail: e.to_string(),
                            };
                            warn!(error = %err, "criterion marked failed");
                            outcome_for(criterion, false, reply, VerdictSource::Malformed)
                        }
                    }
                }
                Err(e) => {
                    consecutive_outages += 1;
                    last_outage = e.to_string();
                    warn!(criterion = %criterion.name, error = %e, "judge call failed");
                    if let Some(limit) = self.outage_limit {
                        if consecutive_outages >= limit {
                            return Err(LifecycleError::JudgeUnavailable {
                                detail: format!(
                                    "{consecutive_outages} consecutive judge failures, last: {last_outage}"
                                ),
                            });
                        }
                    }
                    outcome_for(
                        criterion,
                        false,
                        last_outage.clone(),
                        VerdictSource::JudgeUnavailable,
                    )
                }
            };
            outcomes.insert(criterion.name.clone(), outcome);
        }

        let result = QualityResult::from_outcomes(matrix.category(), outcomes)?;
        if result.unavailable_count() == result.per_criterion().len() {
            return Err(LifecycleError::JudgeUnavailable {
                detail: format!("no criterion could be judged: {last_outage}"),
            });
        }
        Ok(result)
    }
}

fn outcome_for(
    criterion: &Criterion,
    passed: bool,
    feedback: String,
    source: VerdictSource,
) -> CriterionOutcome {
    CriterionOutcome {
        passed,
        feedback,
        weight: criterion.weight,
        target_field: criterion.target_field.clone(),
        source,
    }
}
