//! Transcript event names and payloads.

use crate::types::{LoopState, RunId, RunKind, TranscriptEvent};
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Transcript event type names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    RunCreated,
    RunStarted,
    ExecutorStarted,
    ExecutorFinished,
    LoopTransition,
    AuditVerdict,
    RunCompleted,
    RunFailed,
    RunCancelled,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunCreated => "RUN_CREATED",
            Self::RunStarted => "RUN_STARTED",
            Self::ExecutorStarted => "EXECUTOR_STARTED",
            Self::ExecutorFinished => "EXECUTOR_FINISHED",
            Self::LoopTransition => "LOOP_TRANSITION",
            Self::AuditVerdict => "AUDIT_VERDICT",
            Self::RunCompleted => "RUN_COMPLETED",
            Self::RunFailed => "RUN_FAILED",
            Self::RunCancelled => "RUN_CANCELLED",
        }
    }

    /// True for the events that close a transcript.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::RunCompleted | Self::RunFailed | Self::RunCancelled
        )
    }
}

/// Payload for RUN_CREATED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCreatedPayload {
    pub run_id: RunId,
    pub kind: RunKind,
    pub executor: String,
    pub workdir: String,
}

/// Payload for RUN_STARTED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStartedPayload {
    pub run_id: RunId,
}

/// Payload for EXECUTOR_STARTED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorStartedPayload {
    pub executor: String,
    /// 1-indexed invocation number within the run.
    pub attempt: u32,
    pub prompt_len: usize,
}

/// Payload for EXECUTOR_FINISHED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorFinishedPayload {
    pub executor: String,
    pub attempt: u32,
    pub ok: bool,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub output_len: usize,
}

/// Payload for LOOP_TRANSITION event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopTransitionPayload {
    pub from: LoopState,
    pub to: LoopState,
    pub attempt: u32,
}

/// Payload for AUDIT_VERDICT event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditVerdictPayload {
    pub attempt: u32,
    pub satisfied: bool,
    pub malformed: bool,
    pub reason: String,
}

/// Payload for RUN_COMPLETED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCompletedPayload {
    pub run_id: RunId,
    pub attempts: u32,
}

/// Payload for RUN_FAILED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunFailedPayload {
    pub run_id: RunId,
    pub reason: String,
}

/// Payload for RUN_CANCELLED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCancelledPayload {
    pub run_id: RunId,
    /// Where the cancellation came from (`api`, `loop`).
    pub source: String,
}

/// Union type for all event payloads.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum EventPayload {
    RunCreated(RunCreatedPayload),
    RunStarted(RunStartedPayload),
    ExecutorStarted(ExecutorStartedPayload),
    ExecutorFinished(ExecutorFinishedPayload),
    LoopTransition(LoopTransitionPayload),
    AuditVerdict(AuditVerdictPayload),
    RunCompleted(RunCompletedPayload),
    RunFailed(RunFailedPayload),
    RunCancelled(RunCancelledPayload),
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::RunCreated(_) => EventType::RunCreated,
            Self::RunStarted(_) => EventType::RunStarted,
            Self::ExecutorStarted(_) => EventType::ExecutorStarted,
            Self::ExecutorFinished(_) => EventType::ExecutorFinished,
            Self::LoopTransition(_) => EventType::LoopTransition,
            Self::AuditVerdict(_) => EventType::AuditVerdict,
            Self::RunCompleted(_) => EventType::RunCompleted,
            Self::RunFailed(_) => EventType::RunFailed,
            Self::RunCancelled(_) => EventType::RunCancelled,
        }
    }

    /// Stamps the payload into a transcript line.
    pub fn into_event(self) -> TranscriptEvent {
        let event_type = self.event_type().as_str().to_string();
        let data = serde_json::to_value(&self).unwrap_or(serde_json::Value::Null);
        TranscriptEvent {
            timestamp: Utc::now(),
            event_type,
            data,
        }
    }
}
