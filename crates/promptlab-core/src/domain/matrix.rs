//! Scoring matrices: weighted pass/fail criteria per prompt category.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use super::document::Stage;
use super::error::{LifecycleError, Result};

/// Kind of prompt. Selects the scoring matrix applied to a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Raw,
    Template,
    Feature,
    Usecase,
    Industry,
    Company,
    Contact,
}

impl Category {
    pub const ALL: [Category; 7] = [
        Category::Raw,
        Category::Template,
        Category::Feature,
        Category::Usecase,
        Category::Industry,
        Category::Company,
        Category::Contact,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Template => "template",
            Self::Feature => "feature",
            Self::Usecase => "usecase",
            Self::Industry => "industry",
            Self::Company => "company",
            Self::Contact => "contact",
        }
    }

    /// Category assumed for a document that does not declare one.
    pub fn default_for_stage(stage: Stage) -> Category {
        match stage {
            Stage::Raw => Self::Raw,
            _ => Self::Template,
        }
    }

    /// Fields a document of this category must carry, non-empty.
    pub fn required_fields(self) -> &'static [&'static str] {
        match self {
            Self::Raw => &["role", "objective"],
            _ => &["role", "objective", "instructions", "output_format"],
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == wanted)
            .ok_or_else(|| LifecycleError::InvalidDocument(format!("unknown category: {s}")))
    }
}

/// One weighted question the judge answers about a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Criterion {
    pub name: String,
    pub weight: f64,
    pub description: String,
    /// Document field the improver rewrites when this criterion fails.
    pub target_field: String,
    #[serde(default)]
    pub feedback_hint: String,
}

impl Criterion {
    pub fn new(
        name: impl Into<String>,
        weight: f64,
        target_field: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            weight,
            description: description.into(),
            target_field: target_field.into(),
            feedback_hint: String::new(),
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.feedback_hint = hint.into();
        self
    }
}

/// Ordered, validated set of criteria for one category.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoringMatrix {
    category: Category,
    criteria: Vec<Criterion>,
}

impl ScoringMatrix {
    /// Validate and build a matrix.
    ///
    /// Weights must be finite and non-negative and names unique. A matrix whose
    /// weights sum to zero is accepted here and rejected at evaluation time.
    pub fn new(category: Category, criteria: Vec<Criterion>) -> Result<Self> {
        let mut seen = BTreeSet::new();
        for c in &criteria {
            if c.name.trim().is_empty() {
                return Err(LifecycleError::InvalidMatrix(format!(
                    "{category}: criterion with empty name"
                )));
            }
            if !c.weight.is_finite() || c.weight < 0.0 {
                return Err(LifecycleError::InvalidMatrix(format!(
                    "{category}: criterion {} has invalid weight {}",
                    c.name, c.weight
                )));
            }
            if c.target_field.trim().is_empty() {
                return Err(LifecycleError::InvalidMatrix(format!(
                    "{category}: criterion {} has no target field",
                    c.name
                )));
            }
            if !seen.insert(c.name.as_str()) {
                return Err(LifecycleError::InvalidMatrix(format!(
                    "{category}: duplicate criterion {}",
                    c.name
                )));
            }
        }
        Ok(Self { category, criteria })
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn criteria(&self) -> &[Criterion] {
        &self.criteria
    }

    pub fn criterion(&self, name: &str) -> Option<&Criterion> {
        self.criteria.iter().find(|c| c.name == name)
    }

    /// Criteria whose failures are repaired by rewriting `field`.
    pub fn criteria_for_field<'a>(&'a self, field: &'a str) -> impl Iterator<Item = &'a Criterion> {
        self.criteria.iter().filter(move |c| c.target_field == field)
    }

    pub fn total_weight(&self) -> f64 {
        self.criteria.iter().map(|c| c.weight).sum()
    }

    /// The built-in matrix shipped for `category`.
    pub fn builtin(category: Category) -> Self {
        Self {
            category,
            criteria: builtin_criteria(category),
        }
    }
}

/// Check that `content` has every field `category` requires, non-empty.
pub fn validate_structure(category: Category, content: &Mapping) -> Result<()> {
    match structural_violations(category, content).into_iter().next() {
        Some((field, reason)) => Err(LifecycleError::StructuralValidationFailure {
            field: field.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

/// Every required field of `category` that is missing or empty in `content`,
/// with the reason, in declaration order.
pub fn structural_violations(
    category: Category,
    content: &Mapping,
) -> Vec<(&'static str, &'static str)> {
    category
        .required_fields()
        .iter()
        .filter_map(|field| match content.get(*field) {
            None | Some(Value::Null) => Some((*field, "required field is missing")),
            Some(v) if is_blank(v) => Some((*field, "required field is empty")),
            Some(_) => None,
        })
        .collect()
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::String(s) => s.trim().is_empty(),
        Value::Sequence(s) => s.is_empty(),
        Value::Mapping(m) => m.is_empty(),
        _ => false,
    }
}

/// Scoring matrices keyed by category, shared read-only across runs.
#[derive(Debug, Clone)]
pub struct MatrixRegistry {
    matrices: BTreeMap<Category, Arc<ScoringMatrix>>,
}

impl MatrixRegistry {
    pub fn builtin() -> Self {
        let matrices = Category::ALL
            .into_iter()
            .map(|c| (c, Arc::new(ScoringMatrix::builtin(c))))
            .collect();
        Self { matrices }
    }

    /// Replace the matrix for its category.
    pub fn with_override(mut self, matrix: ScoringMatrix) -> Self {
        self.matrices.insert(matrix.category(), Arc::new(matrix));
        self
    }

    pub fn get(&self, category: Category) -> Arc<ScoringMatrix> {
        match self.matrices.get(&category) {
            Some(m) => Arc::clone(m),
            None => Arc::new(ScoringMatrix::builtin(category)),
        }
    }
}

impl Default for MatrixRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

fn builtin_criteria(category: Category) -> Vec<Criterion> {
    match category {
        Category::Raw => vec![
            Criterion::new(
                "goal_clarity",
                1.2,
                "objective",
                "Does the prompt clearly define the user's goal and the expected behavior of the LLM?",
            )
            .with_hint("State the goal and the expected behaviour explicitly."),
            Criterion::new(
                "role_specification",
                1.0,
                "role",
                "Does the prompt define the LLM's role or perspective with sufficient precision?",
            )
            .with_hint("Specify the role or perspective of the model more precisely."),
            Criterion::new(
                "structure_completeness",
                1.1,
                "output_format",
                "Are all structural components present (e.g., input/output schema, constraints)?",
            )
            .with_hint("Add the missing structural elements such as an output schema."),
            Criterion::new(
                "constraint_enforcement",
                1.1,
                "constraints",
                "Are formatting and behavioral constraints clearly stated and enforceable?",
            )
            .with_hint("Tighten constraints so invalid outputs are ruled out."),
            Criterion::new(
                "evalability",
                1.1,
                "success_criteria",
                "Can the generated output be evaluated clearly and objectively?",
            )
            .with_hint("Describe how a correct output can be checked."),
            Criterion::new(
                "ambiguity_avoidance",
                1.0,
                "instructions",
                "Is the prompt free of contradictions, ambiguities, or vagueness?",
            )
            .with_hint("Remove ambiguous or contradictory phrasing."),
            Criterion::new(
                "error_handling_readiness",
                0.8,
                "error_handling",
                "Does the prompt define what should happen in case of incomplete or missing inputs?",
            )
            .with_hint("Say what to do when inputs are missing or invalid."),
        ],
        Category::Template => vec![
            Criterion::new(
                "task_clarity",
                1.0,
                "objective",
                "Is the task or instruction clearly stated and unambiguous?",
            )
            .with_hint("Prompt task unclear. Define goals explicitly and simply."),
            Criterion::new(
                "output_spec",
                1.0,
                "output_format",
                "Is the expected output format defined and consistent?",
            )
            .with_hint("Define the expected output structure (e.g. YAML, JSON, list)."),
            Criterion::new(
                "structure_check",
                0.9,
                "input_schema",
                "Is the prompt structurally valid (e.g., indentations, headers)?",
            )
            .with_hint("Correct layout and syntax to avoid confusion."),
            Criterion::new(
                "constraint_clarity",
                1.1,
                "constraints",
                "Are task constraints or rules clearly stated and enforceable?",
            )
            .with_hint("Explicitly list any rules or limits for the task."),
            Criterion::new(
                "reasoning_scope",
                1.2,
                "reasoning",
                "Does the prompt allow for traceable or explainable reasoning?",
            )
            .with_hint("Encourage explainable reasoning in the output."),
            Criterion::new(
                "evalability",
                1.3,
                "success_criteria",
                "Can the output be easily evaluated for correctness and quality?",
            )
            .with_hint("Guide format and content for better assessability."),
            Criterion::new(
                "ambiguity_avoidance",
                1.0,
                "instructions",
                "Does the prompt avoid vague or ambiguous phrasing?",
            )
            .with_hint("Use clearer phrasing or examples to clarify."),
            Criterion::new(
                "domain_alignment",
                0.8,
                "context",
                "Is the prompt aligned with its domain or context?",
            )
            .with_hint("Adapt vocabulary or examples to match the domain."),
            Criterion::new(
                "composability",
                0.7,
                "variables",
                "Is the prompt modular and reusable across contexts?",
            )
            .with_hint("Support variation through explicit template variables."),
            Criterion::new(
                "user_alignment",
                1.2,
                "audience",
                "Is the prompt aligned with user needs or usage context?",
            )
            .with_hint("Reflect typical user expectations or roles."),
        ],
        Category::Feature => vec![
            Criterion::new(
                "feature_coverage",
                1.2,
                "instructions",
                "Does the prompt extract all relevant features?",
            ),
            Criterion::new(
                "precision",
                1.1,
                "constraints",
                "Is feature extraction precise and unambiguous?",
            ),
            Criterion::new(
                "format_consistency",
                1.0,
                "output_format",
                "Is the output format consistent for features?",
            ),
            Criterion::new("clarity", 1.0, "objective", "Is the prompt clear and concise?"),
            Criterion::new(
                "evalability",
                1.3,
                "success_criteria",
                "Is the output evaluable for quality?",
            ),
            Criterion::new(
                "domain_relevance",
                1.0,
                "context",
                "Is the prompt aligned with the product domain?",
            ),
        ],
        Category::Usecase => vec![
            Criterion::new(
                "usecase_relevance",
                1.3,
                "instructions",
                "Are relevant use cases identified?",
            ),
            Criterion::new(
                "completeness",
                1.1,
                "constraints",
                "Is the detection comprehensive?",
            ),
            Criterion::new(
                "clarity",
                1.0,
                "objective",
                "Is the prompt clear and well-structured?",
            ),
            Criterion::new(
                "evalability",
                1.2,
                "output_format",
                "Is the output easy to evaluate?",
            ),
            Criterion::new(
                "ambiguity_avoidance",
                1.0,
                "examples",
                "Does the prompt avoid ambiguous descriptions?",
            ),
        ],
        Category::Industry => vec![
            Criterion::new(
                "classification_accuracy",
                1.3,
                "instructions",
                "Does the prompt lead to an accurate industry classification?",
            ),
            Criterion::new(
                "clarity",
                1.1,
                "objective",
                "Are the classification instructions clear?",
            ),
            Criterion::new(
                "evalability",
                1.2,
                "output_format",
                "Is the classification output easy to evaluate?",
            ),
            Criterion::new(
                "domain_alignment",
                1.0,
                "context",
                "Is the prompt aligned with the domain taxonomy?",
            ),
        ],
        Category::Company => vec![
            Criterion::new(
                "match_relevance",
                1.3,
                "instructions",
                "Is the proposed match strongly relevant for the target company's needs or profile?",
            )
            .with_hint("Focus on product-service fit for the specific company context."),
            Criterion::new(
                "confidence",
                1.2,
                "reasoning",
                "Does the output convey strong internal confidence in the match (e.g., justified rationale)?",
            )
            .with_hint("Ask for a rationale or confidence estimate in the answer."),
            Criterion::new(
                "business_domain_alignment",
                1.1,
                "context",
                "Does the match align with the company's industry or operational domain?",
            )
            .with_hint("Make the prompt consider industry-specific factors."),
            Criterion::new(
                "clarity",
                1.0,
                "objective",
                "Is the prompt clearly phrased and easy to interpret?",
            )
            .with_hint("Improve structure and wording for better interpretability."),
            Criterion::new(
                "evalability",
                1.1,
                "output_format",
                "Is the output from the prompt structured and evaluable for correctness?",
            )
            .with_hint("Produce verifiable and assessable answers."),
            Criterion::new(
                "ambiguity_avoidance",
                1.0,
                "constraints",
                "Does the prompt minimize the risk of ambiguous or conflicting instructions?",
            )
            .with_hint("Reformulate to avoid misinterpretation."),
        ],
        Category::Contact => vec![
            Criterion::new(
                "match_relevance",
                1.3,
                "instructions",
                "Are the matched contacts directly relevant to the product or context?",
            )
            .with_hint("Focus on roles or contexts aligned with the offering."),
            Criterion::new(
                "confidence",
                1.2,
                "reasoning",
                "Does the model provide clear confidence or reasoning for the match?",
            )
            .with_hint("Ask for an explanation or confidence indicator."),
            Criterion::new(
                "clarity",
                1.0,
                "objective",
                "Is the prompt clearly structured for the task?",
            )
            .with_hint("Refactor for better readability and clarity."),
            Criterion::new(
                "evalability",
                1.1,
                "output_format",
                "Is the contact match output easy to evaluate?",
            )
            .with_hint("Guide the model to produce verifiable responses."),
            Criterion::new(
                "ambiguity_avoidance",
                1.0,
                "constraints",
                "Is the prompt formulated to avoid ambiguity in matching criteria?",
            )
            .with_hint("Use more specific matching criteria or examples."),
        ],
    }
}
