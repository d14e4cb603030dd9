//! Controller decisions.

use serde::{Deserialize, Serialize};

/// Outcome of one controller step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Continue,
    Promote,
    Abort,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Continue => "CONTINUE",
            Self::Promote => "PROMOTE",
            Self::Abort => "ABORT",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Continue)
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerDecision {
    pub verdict: Verdict,
    pub reason: String,
    /// Improvements already applied in this run.
    pub retry_count: u32,
    pub max_retries: u32,
    pub score: f64,
    pub threshold: f64,
}

/// How well a revision answers the failed criteria it was produced for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignmentCheck {
    /// `addressed.len() / targeted.len()`, in `[0, 1]`.
    pub score: f64,
    /// Distinct fields behind the failed criteria.
    pub targeted: Vec<String>,
    /// Targeted fields the revision actually changed.
    pub addressed: Vec<String>,
    /// Proposed edits the improver dropped.
    pub rejected: usize,
    pub rationale: String,
}

impl AlignmentCheck {
    /// A revision that changes none of the targeted fields is not worth
    /// another evaluation.
    pub fn is_aligned(&self) -> bool {
        self.score > 0.0
    }
}
