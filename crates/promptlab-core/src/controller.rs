//! Controller: the promote / continue / abort decision and the run state
//! machine it drives.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::domain::{
    AlignmentCheck, ControllerDecision, ImprovementResult, LifecycleError, QualityResult, Result,
    Verdict,
};

/// Decide what happens after an evaluation.
///
/// A score equal to the threshold passes. `retry_count` is the number of
/// improvements already applied; once it reaches `max_retries` a failing
/// evaluation aborts instead of starting another improve cycle.
pub fn decide(
    quality: &QualityResult,
    threshold: f64,
    retry_count: u32,
    max_retries: u32,
) -> ControllerDecision {
    let score = quality.score();
    let (verdict, reason) = if score >= threshold {
        (
            Verdict::Promote,
            format!("score {score:.4} meets threshold {threshold:.4}"),
        )
    } else if retry_count >= max_retries {
        (
            Verdict::Abort,
            format!(
                "score {score:.4} below threshold {threshold:.4} after {retry_count} of {max_retries} retries"
            ),
        )
    } else {
        (
            Verdict::Continue,
            format!(
                "score {score:.4} below threshold {threshold:.4}, retry {} of {max_retries}",
                retry_count + 1
            ),
        )
    };
    ControllerDecision {
        verdict,
        reason,
        retry_count,
        max_retries,
        score,
        threshold,
    }
}

/// Score a revision against the failed criteria of the evaluation it
/// answers: the share of their target fields the revision changed.
pub fn check_alignment(quality: &QualityResult, improvement: &ImprovementResult) -> AlignmentCheck {
    let targeted: BTreeSet<&str> = quality
        .failed_criteria()
        .map(|(_, o)| o.target_field.as_str())
        .collect();
    let addressed: Vec<String> = improvement
        .changed_fields()
        .filter(|f| targeted.contains(f))
        .map(str::to_string)
        .collect();
    let rejected = improvement.rejections.len();

    let score = if targeted.is_empty() {
        1.0
    } else {
        addressed.len() as f64 / targeted.len() as f64
    };
    AlignmentCheck {
        score,
        rationale: format!(
            "revision changes {} of {} failed fields, {rejected} proposal(s) rejected",
            addressed.len(),
            targeted.len()
        ),
        targeted: targeted.into_iter().map(str::to_string).collect(),
        addressed,
        rejected,
    }
}

/// Abort early when a revision addresses none of its findings; another
/// evaluation of unchanged fields cannot raise the score.
pub fn decide_after_revision(
    alignment: &AlignmentCheck,
    quality: &QualityResult,
    threshold: f64,
    retry_count: u32,
    max_retries: u32,
) -> Option<ControllerDecision> {
    if alignment.is_aligned() {
        return None;
    }
    Some(ControllerDecision {
        verdict: Verdict::Abort,
        reason: format!("revision is not aligned with its findings: {}", alignment.rationale),
        retry_count,
        max_retries,
        score: quality.score(),
        threshold,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LifecycleState {
    Evaluating,
    Improving,
    Promoted,
    Aborted,
}

impl LifecycleState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Promoted | Self::Aborted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Decided(Verdict),
    Improved,
    /// The revision addressed none of the failed criteria.
    Unaligned,
    Failed,
}

/// The only legal moves of a run. Anything else is an invariant violation.
pub fn transition(state: LifecycleState, event: Transition) -> Result<LifecycleState> {
    use LifecycleState::*;
    match (state, event) {
        (Evaluating, Transition::Decided(Verdict::Promote)) => Ok(Promoted),
        (Evaluating, Transition::Decided(Verdict::Abort)) => Ok(Aborted),
        (Evaluating, Transition::Decided(Verdict::Continue)) => Ok(Improving),
        (Improving, Transition::Improved) => Ok(Evaluating),
        (Improving, Transition::Unaligned) => Ok(Aborted),
        (Evaluating | Improving, Transition::Failed) => Ok(Aborted),
        (from, event) => Err(LifecycleError::InvariantViolation(format!(
            "illegal transition {event:?} from {from:?}"
        ))),
    }
}
