//! Model judge: the external language model consulted by the evaluator and
//! the improver.
//!
//! The core never talks to a model directly. Everything goes through the
//! [`ModelJudge`] trait so that tests can substitute a scripted judge and
//! deployments can pick a provider.

pub mod openai;
pub mod parse;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::domain::VersionedDocument;

pub use openai::{OpenAiJudge, OpenAiJudgeConfig};
pub use parse::{parse_rewrite, parse_verdict, ParsedVerdict, ProposedRewrite, ReplyParseError};

/// Transport-level judge failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JudgeError {
    #[error("judge unavailable: {0}")]
    Unavailable(String),

    #[error("judge timed out after {0} ms")]
    Timeout(u64),
}

/// A text-in, text-out model consulted about a document.
#[async_trait]
pub trait ModelJudge: Send + Sync {
    /// Ask `instruction` about `context` and return the raw reply.
    async fn judge(
        &self,
        instruction: &str,
        context: &VersionedDocument,
    ) -> Result<String, JudgeError>;

    /// Short identifier recorded in logs.
    fn name(&self) -> &str {
        "judge"
    }
}

#[async_trait]
impl<J: ModelJudge + ?Sized> ModelJudge for Arc<J> {
    async fn judge(
        &self,
        instruction: &str,
        context: &VersionedDocument,
    ) -> Result<String, JudgeError> {
        (**self).judge(instruction, context).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Bounds every call of the wrapped judge by a deadline.
pub struct TimeoutJudge<J> {
    inner: J,
    timeout: Duration,
}

impl<J: ModelJudge> TimeoutJudge<J> {
    pub fn new(inner: J, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait]
impl<J: ModelJudge> ModelJudge for TimeoutJudge<J> {
    async fn judge(
        &self,
        instruction: &str,
        context: &VersionedDocument,
    ) -> Result<String, JudgeError> {
        match tokio::time::timeout(self.timeout, self.inner.judge(instruction, context)).await {
            Ok(result) => result,
            Err(_) => {
                let ms = self.timeout.as_millis() as u64;
                warn!(judge = self.inner.name(), timeout_ms = ms, "judge call timed out");
                Err(JudgeError::Timeout(ms))
            }
        }
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Category, Stage, DEFAULT_VERSION};
    use crate::fakes::{DelayedJudge, FnJudge};

    fn doc() -> VersionedDocument {
        VersionedDocument::from_yaml("t", Category::Raw, Stage::Raw, DEFAULT_VERSION, "role: r\n")
            .expect("doc")
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_judge_times_out() {
        let slow = DelayedJudge::new(Duration::from_secs(30), "PASS");
        let judge = TimeoutJudge::new(slow, Duration::from_millis(250));
        let err = judge.judge("q", &doc()).await.expect_err("timeout");
        assert_eq!(err, JudgeError::Timeout(250));
    }

    #[tokio::test]
    async fn test_timeout_judge_passes_through() {
        let fast = FnJudge::new(|_, _| Ok("PASS".to_string()));
        let judge = TimeoutJudge::new(fast, Duration::from_secs(5));
        assert_eq!(judge.judge("q", &doc()).await.expect("reply"), "PASS");
    }
}
