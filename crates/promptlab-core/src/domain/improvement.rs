//! Improvement results and the no-silent-edit invariant.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_yaml::Mapping;

use super::document::{is_reserved_field, key_name, value_bytes};
use super::error::{LifecycleError, Result};

/// Why a proposed field edit was not merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    /// The edit would break the category's required document shape.
    StructuralValidation,
    /// The field is tied to a criterion that passed.
    PassedCriterionField,
    /// The field is document metadata.
    ReservedField,
    /// The judge answered for a different field than the one requested.
    OffTarget,
    /// The judge could not be reached for this field.
    JudgeUnavailable,
    /// No value could be recovered from the judge reply.
    MalformedProposal,
    /// The proposed value is identical to the current one.
    Unchanged,
}

/// A candidate edit that was left out of the revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedEdit {
    pub field: String,
    pub criterion: String,
    pub reason: RejectionReason,
    pub detail: String,
}

/// Revised content plus one justification per changed field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImprovementResult {
    pub revised_content: Mapping,
    /// Changed field -> justification. Contains exactly the changed fields.
    pub rationale: BTreeMap<String, String>,
    #[serde(default)]
    pub rejections: Vec<RejectedEdit>,
}

impl ImprovementResult {
    pub fn new(
        revised_content: Mapping,
        rationale: BTreeMap<String, String>,
        rejections: Vec<RejectedEdit>,
    ) -> Self {
        Self {
            revised_content,
            rationale,
            rejections,
        }
    }

    pub fn changed_fields(&self) -> impl Iterator<Item = &str> {
        self.rationale.keys().map(String::as_str)
    }

    pub fn is_noop(&self) -> bool {
        self.rationale.is_empty()
    }

    /// Check the revision against the content it was derived from.
    ///
    /// Every rationale field must differ from `previous`; every other field
    /// must be byte-identical. Fields may not be dropped and reserved keys
    /// may not appear.
    pub fn verify_against(&self, previous: &Mapping) -> Result<()> {
        let mut keys: BTreeSet<String> = previous.keys().map(key_name).collect();
        keys.extend(self.revised_content.keys().map(key_name));

        for key in &keys {
            let before = previous.get(key.as_str()).map(value_bytes);
            let after = self.revised_content.get(key.as_str()).map(value_bytes);

            if is_reserved_field(key) && after.is_some() {
                return Err(LifecycleError::InvariantViolation(format!(
                    "revision writes reserved field `{key}`"
                )));
            }
            if before.is_some() && after.is_none() {
                return Err(LifecycleError::InvariantViolation(format!(
                    "revision drops field `{key}`"
                )));
            }

            let changed = before != after;
            let explained = self.rationale.contains_key(key);
            if changed && !explained {
                return Err(LifecycleError::InvariantViolation(format!(
                    "field `{key}` changed without a rationale entry"
                )));
            }
            if explained && !changed {
                return Err(LifecycleError::InvariantViolation(format!(
                    "rationale names unchanged field `{key}`"
                )));
            }
        }

        if let Some(stray) = self.rationale.keys().find(|k| !keys.contains(*k)) {
            return Err(LifecycleError::InvariantViolation(format!(
                "rationale names unknown field `{stray}`"
            )));
        }
        Ok(())
    }
}
