//! Core types shared by the dispatch server and the CLI.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum length of a run identifier.
pub const MAX_RUN_ID_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid run_id: {reason}")]
pub struct InvalidRunId {
    pub reason: &'static str,
}

/// Identifier of a run.
///
/// Constructed only through validation, so a `RunId` is always safe to use
/// as a single path component under the store root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RunId(String);

impl RunId {
    /// Generates a fresh time-ordered id (`UUIDv7`, simple form).
    pub fn generate() -> Self {
        Self(Uuid::now_v7().simple().to_string())
    }

    pub fn parse(raw: &str) -> Result<Self, InvalidRunId> {
        validate_run_id(raw)?;
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn validate_run_id(raw: &str) -> Result<(), InvalidRunId> {
    let reason = if raw.is_empty() {
        "empty"
    } else if raw.len() > MAX_RUN_ID_LEN {
        "longer than 64 characters"
    } else if !raw
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        "contains characters outside [A-Za-z0-9._-]"
    } else if raw == "." || raw.contains("..") {
        "path traversal"
    } else {
        return Ok(());
    };
    Err(InvalidRunId { reason })
}

impl TryFrom<String> for RunId {
    type Error = InvalidRunId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_run_id(&value)?;
        Ok(Self(value))
    }
}

impl From<RunId> for String {
    fn from(id: RunId) -> Self {
        id.0
    }
}

impl std::str::FromStr for RunId {
    type Err = InvalidRunId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RunId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Dispatch mode of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    /// Single executor invocation.
    Run,
    /// Bounded-retry control loop.
    Loop,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Loop => "loop",
        }
    }
}

/// Run lifecycle status. Terminal states never transition again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a loop attempt is judged complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditMode {
    /// Apply the completion predicate to the attempt output.
    #[default]
    Token,
    /// Ask the executor to audit the attempt, then apply the predicate to its answer.
    Executor,
}

impl AuditMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Token => "token",
            Self::Executor => "executor",
        }
    }
}

/// Loop controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Planning,
    Executing,
    Auditing,
    Retrying,
    Done,
    Failed,
    Cancelled,
}

impl LoopState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Executing => "executing",
            Self::Auditing => "auditing",
            Self::Retrying => "retrying",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted run metadata (`run.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunMeta {
    pub run_id: RunId,
    pub kind: RunKind,
    /// Registered executor name.
    pub executor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Working directory handed to the executor.
    pub workdir: String,
    /// Prompt for `run`, task for `loop`.
    pub task: String,
    /// Retry budget, loop runs only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    pub status: RunStatus,
    /// Executor invocations so far.
    #[serde(default)]
    pub attempts: u32,
    /// Verdict of the most recent executor invocation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial update applied to [`RunMeta`] by the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetaUpdate {
    pub status: Option<RunStatus>,
    pub attempts: Option<u32>,
    pub ok: Option<bool>,
    pub error: Option<String>,
}

impl MetaUpdate {
    pub fn status(status: RunStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

/// One line of a run transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Outcome of a single executor invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecResult {
    pub ok: bool,
    /// Redacted combined output.
    pub output: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub duration_ms: u64,
}

/// Full read model of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub meta: RunMeta,
    pub result: Option<String>,
    pub error: Option<String>,
    pub events: Vec<TranscriptEvent>,
}

/// Listing entry for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub kind: RunKind,
    pub status: RunStatus,
    pub task: String,
    pub executor: String,
    pub updated_at: DateTime<Utc>,
}

impl From<&RunMeta> for RunSummary {
    fn from(meta: &RunMeta) -> Self {
        Self {
            run_id: meta.run_id.clone(),
            kind: meta.kind,
            status: meta.status,
            task: meta.task.clone(),
            executor: meta.executor.clone(),
            updated_at: meta.updated_at,
        }
    }
}
