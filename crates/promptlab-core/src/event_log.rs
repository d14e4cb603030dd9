//! Event log: one append-only JSONL stream per workflow.
//!
//! Every line is an independently parseable [`AgentEvent`]. Streams are keyed
//! by workflow id so concurrent runs never share a file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::AsyncWriteExt;

use crate::domain::digest::sha256_hex;
use crate::domain::{AgentEvent, EventPayload, PromptVersion, StepKind, TerminalState, WorkflowId};

#[derive(Debug, thiserror::Error)]
pub enum EventLogError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("malformed event on line {line}: {source}")]
    Malformed {
        line: usize,
        source: serde_json::Error,
    },

    #[error("invalid workflow id for a log file name: {0}")]
    InvalidWorkflowId(String),

    #[error("event stream is empty")]
    EmptyStream,

    #[error("event stream mixes workflows {first} and {other}")]
    MixedWorkflows { first: WorkflowId, other: WorkflowId },

    #[error("event seq {found} out of order, expected {expected}")]
    OutOfOrder { expected: u64, found: u64 },

    #[error("event stream has no terminal event")]
    MissingTerminal,

    #[error("events follow the terminal event at seq {seq}")]
    TrailingEvents { seq: u64 },
}

/// The only write path for lifecycle events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn append(&self, event: &AgentEvent) -> Result<(), EventLogError>;
}

// ---------------------------------------------------------------------------
// JsonlEventLog
// ---------------------------------------------------------------------------

/// Filesystem event log.
///
/// Layout: `<dir>/<workflow_id>.jsonl`
#[derive(Debug, Clone)]
pub struct JsonlEventLog {
    dir: PathBuf,
}

impl JsonlEventLog {
    /// Create a log rooted at `dir`, creating the directory if needed.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, EventLogError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn stream_path(&self, workflow_id: &WorkflowId) -> Result<PathBuf, EventLogError> {
        let id = workflow_id.as_str();
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            return Err(EventLogError::InvalidWorkflowId(id.to_string()));
        }
        Ok(self.dir.join(format!("{id}.jsonl")))
    }

    /// Read back the stream of one workflow.
    pub async fn read(&self, workflow_id: &WorkflowId) -> Result<Vec<AgentEvent>, EventLogError> {
        read_event_stream(&self.stream_path(workflow_id)?).await
    }
}

#[async_trait]
impl EventSink for JsonlEventLog {
    async fn append(&self, event: &AgentEvent) -> Result<(), EventLogError> {
        let path = self.stream_path(&event.workflow_id)?;
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Parse a JSONL event stream. Blank lines are skipped.
pub async fn read_event_stream(path: &Path) -> Result<Vec<AgentEvent>, EventLogError> {
    let text = tokio::fs::read_to_string(path).await?;
    parse_event_stream(&text)
}

pub fn parse_event_stream(text: &str) -> Result<Vec<AgentEvent>, EventLogError> {
    text.lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty())
        .map(|(i, l)| {
            serde_json::from_str(l).map_err(|source| EventLogError::Malformed {
                line: i + 1,
                source,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// MemoryEventLog
// ---------------------------------------------------------------------------

/// In-memory event log backed by a `HashMap<workflow_id, events>`.
#[derive(Debug, Default)]
pub struct MemoryEventLog {
    streams: Mutex<HashMap<WorkflowId, Vec<AgentEvent>>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self, workflow_id: &WorkflowId) -> Vec<AgentEvent> {
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(workflow_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn workflow_ids(&self) -> Vec<WorkflowId> {
        let mut ids: Vec<WorkflowId> = self
            .streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl EventSink for MemoryEventLog {
    async fn append(&self, event: &AgentEvent) -> Result<(), EventLogError> {
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(event.workflow_id.clone())
            .or_default()
            .push(event.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

/// Shape of a verified event stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamSummary {
    pub workflow_id: WorkflowId,
    pub event_count: usize,
    pub terminal_state: TerminalState,
    pub evaluations: usize,
    pub decisions: usize,
    pub improvements: usize,
    pub errors: usize,
    pub final_version: PromptVersion,
    /// SHA-256 over the deterministic part of every event (ids and
    /// timestamps excluded). Equal for two runs that took the same path.
    pub replay_digest: String,
}

#[derive(Serialize)]
struct ReplayEntry<'a> {
    seq: u64,
    step: StepKind,
    prompt_version: PromptVersion,
    payload: &'a EventPayload,
}

/// Digest of the deterministic content of an event sequence.
pub fn replay_digest(events: &[AgentEvent]) -> Result<String, EventLogError> {
    let entries: Vec<ReplayEntry<'_>> = events
        .iter()
        .map(|e| ReplayEntry {
            seq: e.seq,
            step: e.step,
            prompt_version: e.prompt_version,
            payload: &e.payload,
        })
        .collect();
    Ok(sha256_hex(&serde_json::to_vec(&entries)?))
}

/// Check the structural guarantees of one workflow's stream: a single
/// workflow id, `seq` counting up from 1 without gaps, and exactly one
/// terminal event which comes last.
pub fn verify_stream(events: &[AgentEvent]) -> Result<StreamSummary, EventLogError> {
    let first = events.first().ok_or(EventLogError::EmptyStream)?;

    let mut terminal = None;
    for (i, event) in events.iter().enumerate() {
        if event.workflow_id != first.workflow_id {
            return Err(EventLogError::MixedWorkflows {
                first: first.workflow_id.clone(),
                other: event.workflow_id.clone(),
            });
        }
        let expected = i as u64 + 1;
        if event.seq != expected {
            return Err(EventLogError::OutOfOrder {
                expected,
                found: event.seq,
            });
        }
        if let Some(state) = event.meta.terminal_state {
            if terminal.is_some() || i + 1 != events.len() {
                return Err(EventLogError::TrailingEvents { seq: event.seq });
            }
            terminal = Some(state);
        }
    }
    let terminal_state = terminal.ok_or(EventLogError::MissingTerminal)?;

    let count = |step: StepKind| events.iter().filter(|e| e.step == step).count();
    let errors = events
        .iter()
        .filter(|e| matches!(e.payload, EventPayload::Error(_)))
        .count();
    let final_version = events
        .last()
        .map(|e| e.prompt_version)
        .unwrap_or(first.prompt_version);

    Ok(StreamSummary {
        workflow_id: first.workflow_id.clone(),
        event_count: events.len(),
        terminal_state,
        evaluations: count(StepKind::Evaluate),
        decisions: count(StepKind::Decide),
        improvements: count(StepKind::Improve),
        errors,
        final_version,
        replay_digest: replay_digest(events)?,
    })
}
