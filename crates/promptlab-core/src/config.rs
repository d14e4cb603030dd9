//! Lifecycle configuration.
//!
//! Resolution order: built-in defaults, then a TOML file, then `PROMPTLAB_*`
//! environment variables, then CLI flags (applied by the binary).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::domain::{Category, Criterion, LifecycleError, MatrixRegistry, ScoringMatrix};
use crate::judge::OpenAiJudgeConfig;
use crate::orchestrator::LifecyclePolicy;

pub const ENV_THRESHOLD: &str = "PROMPTLAB_THRESHOLD";
pub const ENV_MAX_RETRIES: &str = "PROMPTLAB_MAX_RETRIES";
pub const ENV_WORKERS: &str = "PROMPTLAB_WORKERS";
pub const ENV_JUDGE_TIMEOUT_MS: &str = "PROMPTLAB_JUDGE_TIMEOUT_MS";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("invalid scoring matrix override: {0}")]
    Matrix(#[from] LifecycleError),
}

/// Judge endpoint settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JudgeSettings {
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
}

impl Default for JudgeSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            temperature: 0.0,
            api_key_env: "OPENAI_API_KEY".to_string(),
        }
    }
}

/// Replacement criteria for one category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MatrixOverride {
    pub criteria: Vec<Criterion>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LifecycleConfig {
    pub threshold: f64,
    pub max_retries: u32,
    /// Documents processed concurrently in batch mode.
    pub workers: usize,
    pub judge_timeout_ms: u64,
    /// Fail an evaluation after this many consecutive judge outages.
    pub consecutive_outage_limit: Option<usize>,
    pub prompts_dir: PathBuf,
    pub log_dir: PathBuf,
    pub report_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub judge: JudgeSettings,
    /// Category name -> replacement matrix.
    pub matrices: BTreeMap<String, MatrixOverride>,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            threshold: 0.9,
            max_retries: 3,
            workers: 4,
            judge_timeout_ms: 60_000,
            consecutive_outage_limit: None,
            prompts_dir: PathBuf::from("prompts"),
            log_dir: PathBuf::from("logs/workflows"),
            report_dir: PathBuf::from("reports"),
            archive_dir: PathBuf::from("prompts/archive"),
            judge: JudgeSettings::default(),
            matrices: BTreeMap::new(),
        }
    }
}

impl LifecycleConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Read a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Defaults, then `path` if given, then the process environment; validated.
    pub fn resolve(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::load(p)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `PROMPTLAB_*` overrides looked up through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_THRESHOLD) {
            self.threshold = parse_env(ENV_THRESHOLD, &v)?;
        }
        if let Some(v) = lookup(ENV_MAX_RETRIES) {
            self.max_retries = parse_env(ENV_MAX_RETRIES, &v)?;
        }
        if let Some(v) = lookup(ENV_WORKERS) {
            self.workers = parse_env(ENV_WORKERS, &v)?;
        }
        if let Some(v) = lookup(ENV_JUDGE_TIMEOUT_MS) {
            self.judge_timeout_ms = parse_env(ENV_JUDGE_TIMEOUT_MS, &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.threshold.is_finite() || !(0.0..=1.0).contains(&self.threshold) {
            return Err(invalid("threshold", "must be within [0, 1]"));
        }
        if self.workers == 0 {
            return Err(invalid("workers", "must be at least 1"));
        }
        if self.judge_timeout_ms == 0 {
            return Err(invalid("judge_timeout_ms", "must be positive"));
        }
        if self.consecutive_outage_limit == Some(0) {
            return Err(invalid("consecutive_outage_limit", "must be at least 1"));
        }
        self.matrix_registry()?;
        Ok(())
    }

    pub fn policy(&self) -> Result<LifecyclePolicy, ConfigError> {
        LifecyclePolicy::new(self.threshold, self.max_retries)
            .map_err(|e| invalid("threshold", &e.to_string()))
    }

    /// Built-in matrices with this config's overrides applied.
    pub fn matrix_registry(&self) -> Result<MatrixRegistry, ConfigError> {
        let mut registry = MatrixRegistry::builtin();
        for (name, entry) in &self.matrices {
            let category: Category = name
                .parse()
                .map_err(|_| invalid(&format!("matrices.{name}"), "unknown category"))?;
            let matrix = ScoringMatrix::new(category, entry.criteria.clone())?;
            registry = registry.with_override(matrix);
        }
        Ok(registry)
    }

    pub fn openai_config(&self) -> OpenAiJudgeConfig {
        OpenAiJudgeConfig {
            base_url: self.judge.base_url.clone(),
            model: self.judge.model.clone(),
            api_key: std::env::var(&self.judge.api_key_env).ok(),
            temperature: self.judge.temperature,
            request_timeout_ms: self.judge_timeout_ms,
        }
    }
}

fn invalid(key: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid(key, &format!("cannot parse {value:?}")))
}
