//! Quality results produced by the evaluator.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::error::{LifecycleError, Result};
use super::matrix::Category;

/// Where a criterion verdict came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictSource {
    /// The judge replied and the reply was understood.
    Judged,
    /// The judge replied but no verdict could be recovered; counted as failed.
    Malformed,
    /// The judge could not be reached; counted as failed.
    JudgeUnavailable,
}

/// Verdict for a single criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionOutcome {
    pub passed: bool,
    pub feedback: String,
    pub weight: f64,
    pub target_field: String,
    pub source: VerdictSource,
}

/// Weighted pass/fail evaluation of one document revision.
///
/// `score` is always the passed weight divided by the total weight of the
/// criteria present, so it is recomputed rather than trusted on deserialize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "QualityResultRepr")]
pub struct QualityResult {
    category: Category,
    score: f64,
    per_criterion: BTreeMap<String, CriterionOutcome>,
}

#[derive(Deserialize)]
struct QualityResultRepr {
    category: Category,
    per_criterion: BTreeMap<String, CriterionOutcome>,
}

impl TryFrom<QualityResultRepr> for QualityResult {
    type Error = LifecycleError;

    fn try_from(repr: QualityResultRepr) -> Result<Self> {
        Self::from_outcomes(repr.category, repr.per_criterion)
    }
}

impl QualityResult {
    pub fn from_outcomes(
        category: Category,
        per_criterion: BTreeMap<String, CriterionOutcome>,
    ) -> Result<Self> {
        let total: f64 = per_criterion.values().map(|o| o.weight).sum();
        if total.is_nan() || total <= 0.0 {
            return Err(LifecycleError::EmptyMatrix { category });
        }
        let passed: f64 = per_criterion
            .values()
            .filter(|o| o.passed)
            .map(|o| o.weight)
            .sum();
        let score = (passed / total).clamp(0.0, 1.0);
        Ok(Self {
            category,
            score,
            per_criterion,
        })
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn score(&self) -> f64 {
        self.score
    }

    pub fn per_criterion(&self) -> &BTreeMap<String, CriterionOutcome> {
        &self.per_criterion
    }

    pub fn failed_criteria(&self) -> impl Iterator<Item = (&String, &CriterionOutcome)> {
        self.per_criterion.iter().filter(|(_, o)| !o.passed)
    }

    pub fn passed_criteria(&self) -> impl Iterator<Item = (&String, &CriterionOutcome)> {
        self.per_criterion.iter().filter(|(_, o)| o.passed)
    }

    pub fn all_passed(&self) -> bool {
        self.per_criterion.values().all(|o| o.passed)
    }

    /// Number of criteria whose verdict came from a judge outage.
    pub fn unavailable_count(&self) -> usize {
        self.per_criterion
            .values()
            .filter(|o| o.source == VerdictSource::JudgeUnavailable)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(passed: bool, weight: f64) -> CriterionOutcome {
        CriterionOutcome {
            passed,
            feedback: String::new(),
            weight,
            target_field: "objective".to_string(),
            source: VerdictSource::Judged,
        }
    }

    #[test]
    fn test_score_is_passed_weight_fraction() {
        let mut m = BTreeMap::new();
        m.insert("a".to_string(), outcome(true, 3.0));
        m.insert("b".to_string(), outcome(false, 1.0));
        let q = QualityResult::from_outcomes(Category::Feature, m).expect("score");
        assert!((q.score() - 0.75).abs() < 1e-12);
        assert_eq!(q.failed_criteria().count(), 1);
        assert!(!q.all_passed());
    }

    #[test]
    fn test_zero_weight_is_empty_matrix() {
        let mut m = BTreeMap::new();
        m.insert("a".to_string(), outcome(true, 0.0));
        let err = QualityResult::from_outcomes(Category::Raw, m).expect_err("empty");
        assert!(matches!(err, LifecycleError::EmptyMatrix { .. }));

        let err = QualityResult::from_outcomes(Category::Raw, BTreeMap::new()).expect_err("empty");
        assert!(matches!(err, LifecycleError::EmptyMatrix { .. }));
    }

    #[test]
    fn test_deserialize_recomputes_score() {
        let json = serde_json::json!({
            "category": "raw",
            "score": 0.99,
            "per_criterion": {
                "a": {"passed": true, "feedback": "", "weight": 1.0, "target_field": "role", "source": "judged"},
                "b": {"passed": false, "feedback": "vague", "weight": 1.0, "target_field": "objective", "source": "malformed"}
            }
        });
        let q: QualityResult = serde_json::from_value(json).expect("deserialize");
        assert!((q.score() - 0.5).abs() < 1e-12);
    }
}
