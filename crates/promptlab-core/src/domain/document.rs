//! Versioned prompt documents and the promotion ladder.
//!
//! A document is identified on disk by `{base}_{stage}_v{X.Y.Z}.yaml`. The
//! stage suffix and the `stage` field are derived from each other, never
//! stored independently, so they cannot disagree.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use super::digest::sha256_hex;
use super::error::{LifecycleError, Result};
use super::improvement::ImprovementResult;
use super::matrix::Category;

/// Keys owned by the document metadata rather than the prompt body.
pub const RESERVED_FIELDS: [&str; 2] = ["version", "category"];

/// Version assumed when neither the file name nor the body declares one.
pub const DEFAULT_VERSION: PromptVersion = PromptVersion::new(0, 1, 0);

/// Position of a document on the promotion ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Stage {
    Raw,
    Template,
    Config,
    Active,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Raw, Stage::Template, Stage::Config, Stage::Active];

    /// File name suffix for this stage.
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Template => "template",
            Self::Config => "config",
            Self::Active => "active",
        }
    }

    /// Directory holding documents of this stage under the prompts root.
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Raw => "00-raw",
            Self::Template => "01-templates",
            Self::Config => "02-configs",
            Self::Active => "03-active",
        }
    }

    /// The stage a successful lifecycle promotes into, if any.
    pub fn next(self) -> Option<Stage> {
        match self {
            Self::Raw => Some(Self::Template),
            Self::Template => Some(Self::Config),
            Self::Config => Some(Self::Active),
            Self::Active => None,
        }
    }

    pub fn from_suffix(suffix: &str) -> Option<Stage> {
        match suffix.to_ascii_lowercase().as_str() {
            "raw" => Some(Self::Raw),
            "template" | "templ" => Some(Self::Template),
            "config" => Some(Self::Config),
            "active" => Some(Self::Active),
            _ => None,
        }
    }

    pub fn from_dir_name(dir: &str) -> Option<Stage> {
        Self::ALL.into_iter().find(|s| s.dir_name() == dir)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.suffix().to_ascii_uppercase())
    }
}

impl FromStr for Stage {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_suffix(s.trim())
            .ok_or_else(|| LifecycleError::InvalidDocument(format!("unknown stage: {s}")))
    }
}

/// Semantic version `MAJOR.MINOR.PATCH` of a prompt document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PromptVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl PromptVersion {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    pub fn bump_patch(self) -> Self {
        Self::new(self.major, self.minor, self.patch + 1)
    }

    pub fn bump_minor(self) -> Self {
        Self::new(self.major, self.minor + 1, 0)
    }

    pub fn bump_major(self) -> Self {
        Self::new(self.major + 1, 0, 0)
    }
}

impl fmt::Display for PromptVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for PromptVersion {
    type Err = LifecycleError;

    fn from_str(input: &str) -> Result<Self> {
        Self::parse_components(input, 3)
    }
}

impl PromptVersion {
    /// Parse a version declared inside a document body. YAML reads `1.3` as
    /// a float, so one- and two-component forms are accepted and padded
    /// with zeros.
    pub fn parse_declared(input: &str) -> Result<Self> {
        Self::parse_components(input, 1)
    }

    fn parse_components(input: &str, min_parts: usize) -> Result<Self> {
        let invalid = || {
            LifecycleError::InvalidVersion(format!("{input:?}, expected MAJOR.MINOR.PATCH"))
        };
        let trimmed = input.trim().trim_matches(|c: char| c == '\'' || c == '"');
        let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
        let parts: Vec<&str> = trimmed.split('.').collect();
        if parts.len() < min_parts || parts.len() > 3 {
            return Err(invalid());
        }
        let mut numbers = [0u64; 3];
        for (slot, part) in numbers.iter_mut().zip(&parts) {
            *slot = part.parse().map_err(|_| invalid())?;
        }
        Ok(Self::new(numbers[0], numbers[1], numbers[2]))
    }
}

impl TryFrom<String> for PromptVersion {
    type Error = LifecycleError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<PromptVersion> for String {
    fn from(v: PromptVersion) -> Self {
        v.to_string()
    }
}

/// Components recovered from a prompt file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNameParts {
    pub base_name: String,
    pub stage: Option<Stage>,
    pub version: Option<PromptVersion>,
}

/// Split `{base}[_{stage}][_vX.Y.Z].yaml` into its parts.
pub fn parse_file_name(file_name: &str) -> Result<FileNameParts> {
    let stem = file_name
        .strip_suffix(".yaml")
        .or_else(|| file_name.strip_suffix(".yml"))
        .unwrap_or(file_name);

    let (rest, version) = match stem.rsplit_once("_v") {
        Some((head, tail)) => match tail.parse::<PromptVersion>() {
            Ok(v) => (head, Some(v)),
            Err(_) => (stem, None),
        },
        None => (stem, None),
    };

    let (base_name, stage) = match rest.rsplit_once('_') {
        Some((head, tail)) => match Stage::from_suffix(tail) {
            Some(stage) => (head, Some(stage)),
            None => (rest, None),
        },
        None => (rest, None),
    };

    if base_name.is_empty() {
        return Err(LifecycleError::InvalidDocument(format!(
            "file name has no base name: {file_name}"
        )));
    }

    Ok(FileNameParts {
        base_name: base_name.to_string(),
        stage,
        version,
    })
}

/// Whether `field` is document metadata rather than prompt body.
pub fn is_reserved_field(field: &str) -> bool {
    RESERVED_FIELDS.contains(&field)
}

/// Render a mapping key as a field name.
pub fn key_name(key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_else(|_| format!("{other:?}")),
    }
}

/// Canonical bytes of a field value, used for change detection.
pub fn value_bytes(value: &Value) -> Vec<u8> {
    serde_yaml::to_string(value)
        .map(String::into_bytes)
        .unwrap_or_else(|_| format!("{value:?}").into_bytes())
}

/// A prompt body together with its version and lifecycle stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedDocument {
    pub base_name: String,
    pub category: Category,
    pub stage: Stage,
    pub version: PromptVersion,
    /// Prompt body: role, objective, constraints, schemas, ...
    pub content: Mapping,
}

impl VersionedDocument {
    pub fn new(
        base_name: impl Into<String>,
        category: Category,
        stage: Stage,
        version: PromptVersion,
        content: Mapping,
    ) -> Result<Self> {
        let base_name = base_name.into();
        if base_name.trim().is_empty() {
            return Err(LifecycleError::InvalidDocument(
                "base name must not be empty".to_string(),
            ));
        }
        if let Some(reserved) = content
            .keys()
            .map(key_name)
            .find(|k| is_reserved_field(k))
        {
            return Err(LifecycleError::InvalidDocument(format!(
                "body must not contain reserved key `{reserved}`"
            )));
        }
        Ok(Self {
            base_name,
            category,
            stage,
            version,
            content,
        })
    }

    /// Parse a YAML body (without reserved metadata keys).
    pub fn from_yaml(
        base_name: impl Into<String>,
        category: Category,
        stage: Stage,
        version: PromptVersion,
        yaml: &str,
    ) -> Result<Self> {
        let content = match serde_yaml::from_str::<Value>(yaml)? {
            Value::Mapping(m) => m,
            Value::Null => Mapping::new(),
            _ => {
                return Err(LifecycleError::InvalidDocument(
                    "prompt body must be a YAML mapping".to_string(),
                ))
            }
        };
        Self::new(base_name, category, stage, version, content)
    }

    /// Build a document from a mapping read from disk, lifting the reserved
    /// `version` / `category` keys into metadata.
    pub fn from_file_mapping(
        base_name: &str,
        stage: Stage,
        name_version: Option<PromptVersion>,
        mapping: Mapping,
    ) -> Result<Self> {
        let mut declared_version = None;
        let mut declared_category = None;
        let mut content = Mapping::new();
        for (key, value) in mapping {
            match key.as_str() {
                Some("version") => declared_version = Some(value),
                Some("category") => declared_category = Some(value),
                _ => {
                    content.insert(key, value);
                }
            }
        }

        let version = match (name_version, declared_version) {
            (Some(v), _) => v,
            (None, Some(Value::String(s))) => PromptVersion::parse_declared(&s)?,
            (None, Some(Value::Number(n))) => PromptVersion::parse_declared(&n.to_string())?,
            (None, Some(other)) => {
                return Err(LifecycleError::InvalidVersion(format!(
                    "{other:?}, expected MAJOR.MINOR.PATCH"
                )));
            }
            (None, None) => DEFAULT_VERSION,
        };

        let category = match declared_category {
            Some(Value::String(s)) => s.parse()?,
            Some(other) => {
                return Err(LifecycleError::InvalidDocument(format!(
                    "category must be a string, got {other:?}"
                )));
            }
            None => Category::default_for_stage(stage),
        };

        Self::new(base_name, category, stage, version, content)
    }

    /// The mapping written to disk: metadata keys first, then the body.
    pub fn to_file_mapping(&self) -> Mapping {
        let mut out = Mapping::new();
        out.insert(
            Value::String("category".to_string()),
            Value::String(self.category.as_str().to_string()),
        );
        out.insert(
            Value::String("version".to_string()),
            Value::String(self.version.to_string()),
        );
        for (k, v) in &self.content {
            out.insert(k.clone(), v.clone());
        }
        out
    }

    pub fn file_name(&self) -> String {
        format!(
            "{}_{}_v{}.yaml",
            self.base_name,
            self.stage.suffix(),
            self.version
        )
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.content.get(name)
    }

    pub fn field_bytes(&self, name: &str) -> Option<Vec<u8>> {
        self.field(name).map(value_bytes)
    }

    pub fn render_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(&self.content)?)
    }

    /// SHA-256 of the rendered body.
    pub fn content_digest(&self) -> String {
        let bytes = serde_yaml::to_string(&self.content)
            .map(String::into_bytes)
            .unwrap_or_else(|_| format!("{:?}", self.content).into_bytes());
        sha256_hex(&bytes)
    }

    /// Produce the revision described by `improvement`: same stage, next patch.
    ///
    /// Fails if the improvement edits a field it does not explain, or
    /// explains a field it does not edit.
    pub fn apply(&self, improvement: &ImprovementResult) -> Result<VersionedDocument> {
        improvement.verify_against(&self.content)?;
        Ok(Self {
            base_name: self.base_name.clone(),
            category: self.category,
            stage: self.stage,
            version: self.version.bump_patch(),
            content: improvement.revised_content.clone(),
        })
    }

    /// Move one stage up the ladder. Entering `ACTIVE` is a major release;
    /// the other promotions are minor.
    pub fn promote(&self) -> Result<VersionedDocument> {
        let next = self
            .stage
            .next()
            .ok_or(LifecycleError::TerminalStage { stage: self.stage })?;
        let version = if next == Stage::Active {
            self.version.bump_major()
        } else {
            self.version.bump_minor()
        };
        Ok(Self {
            base_name: self.base_name.clone(),
            category: self.category,
            stage: next,
            version,
            content: self.content.clone(),
        })
    }
}
