//! In-memory fakes for the judge and event sink traits (testing only)
//!
//! Provides `FnJudge`, `DelayedJudge` and `FailingEventSink` so lifecycle
//! runs can be driven deterministically without a model or a filesystem.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{AgentEvent, VersionedDocument};
use crate::event_log::{EventLogError, EventSink};
use crate::judge::{JudgeError, ModelJudge};

type JudgeFn = dyn Fn(&str, &VersionedDocument) -> Result<String, JudgeError> + Send + Sync;

// ---------------------------------------------------------------------------
// FnJudge
// ---------------------------------------------------------------------------

/// Judge whose replies come from a closure. Records every instruction.
pub struct FnJudge {
    reply: Box<JudgeFn>,
    calls: Mutex<Vec<String>>,
}

impl FnJudge {
    pub fn new<F>(reply: F) -> Self
    where
        F: Fn(&str, &VersionedDocument) -> Result<String, JudgeError> + Send + Sync + 'static,
    {
        Self {
            reply: Box::new(reply),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// A judge that always answers `reply`.
    pub fn constant(reply: &str) -> Self {
        let reply = reply.to_string();
        Self::new(move |_, _| Ok(reply.clone()))
    }

    /// A judge that is never reachable.
    pub fn unavailable() -> Self {
        Self::new(|_, _| Err(JudgeError::Unavailable("connection refused".to_string())))
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Number of recorded instructions that start with `prefix`.
    pub fn count_with_prefix(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|i| i.starts_with(prefix))
            .count()
    }
}

#[async_trait]
impl ModelJudge for FnJudge {
    async fn judge(
        &self,
        instruction: &str,
        context: &VersionedDocument,
    ) -> Result<String, JudgeError> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(instruction.to_string());
        (self.reply)(instruction, context)
    }

    fn name(&self) -> &str {
        "fn-judge"
    }
}

// ---------------------------------------------------------------------------
// DelayedJudge
// ---------------------------------------------------------------------------

/// Judge that sleeps before answering. Pair with a paused tokio clock.
pub struct DelayedJudge {
    delay: Duration,
    reply: String,
    calls: AtomicUsize,
}

impl DelayedJudge {
    pub fn new(delay: Duration, reply: &str) -> Self {
        Self {
            delay,
            reply: reply.to_string(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelJudge for DelayedJudge {
    async fn judge(
        &self,
        _instruction: &str,
        _context: &VersionedDocument,
    ) -> Result<String, JudgeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(self.reply.clone())
    }

    fn name(&self) -> &str {
        "delayed-judge"
    }
}

// ---------------------------------------------------------------------------
// FailingEventSink
// ---------------------------------------------------------------------------

/// Sink that rejects every append.
#[derive(Debug, Default)]
pub struct FailingEventSink {
    attempts: AtomicUsize,
}

impl FailingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventSink for FailingEventSink {
    async fn append(&self, _event: &AgentEvent) -> Result<(), EventLogError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(EventLogError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "disk full",
        )))
    }
}
