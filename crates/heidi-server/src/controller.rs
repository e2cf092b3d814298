//! Bounded-retry loop controller.
//!
//! State machine: `Planning -> Executing -> Auditing -> Retrying -> Executing`
//! until `Done`, `Failed` or `Cancelled`. Executor faults and `ok: false`
//! results fail the loop immediately; only "ran but did not finish"
//! attempts are retried.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use heidi_core::completion::{audit, is_complete, AuditVerdict};
use heidi_core::events::{
    AuditVerdictPayload, EventPayload, ExecutorFinishedPayload, ExecutorStartedPayload,
    LoopTransitionPayload,
};
use heidi_core::prompt::{audit_prompt, planning_prompt, retry_prompt};
use heidi_core::{AuditMode, ExecResult, LoopState, MetaUpdate, RunId};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::executor::{Executor, ExecutorError};
use crate::storage::RunStore;

/// Everything a background run needs to invoke its executor and record progress.
#[derive(Debug)]
pub struct RunContext {
    pub store: Arc<RunStore>,
    pub run_id: RunId,
    pub executor: Arc<dyn Executor>,
    pub workdir: PathBuf,
    pub cancel: CancellationToken,
    /// Executor invocations so far, including audit calls.
    pub attempts: u32,
}

impl RunContext {
    /// Append a transcript event, logging rather than failing on storage errors.
    pub async fn record(&self, payload: EventPayload) {
        if let Err(err) = self.store.append_event(&self.run_id, payload.into_event()).await {
            warn!(run_id = %self.run_id, error = %err, "failed to append transcript event");
        }
    }

    /// Invoke the executor once, recording start and finish.
    pub async fn invoke(&mut self, prompt: &str) -> Result<ExecResult, ExecutorError> {
        self.attempts += 1;
        let attempt = self.attempts;
        let executor = self.executor.name().to_string();

        if let Err(err) = self
            .store
            .update_meta(
                &self.run_id,
                MetaUpdate {
                    attempts: Some(attempt),
                    ..MetaUpdate::default()
                },
            )
            .await
        {
            warn!(run_id = %self.run_id, error = %err, "failed to record attempt");
        }
        self.record(EventPayload::ExecutorStarted(ExecutorStartedPayload {
            executor: executor.clone(),
            attempt,
            prompt_len: prompt.len(),
        }))
        .await;

        info!(run_id = %self.run_id, executor = %executor, attempt, "invoking executor");
        let result = self.executor.run(prompt, &self.workdir).await;

        match &result {
            Ok(exec) => {
                self.record(EventPayload::ExecutorFinished(ExecutorFinishedPayload {
                    executor: executor.clone(),
                    attempt,
                    ok: exec.ok,
                    exit_code: exec.exit_code,
                    duration_ms: exec.duration_ms,
                    output_len: exec.output.len(),
                }))
                .await;
                if let Err(err) = self
                    .store
                    .update_meta(
                        &self.run_id,
                        MetaUpdate {
                            ok: Some(exec.ok),
                            ..MetaUpdate::default()
                        },
                    )
                    .await
                {
                    warn!(run_id = %self.run_id, error = %err, "failed to record executor verdict");
                }
                info!(
                    run_id = %self.run_id,
                    executor = %executor,
                    attempt,
                    ok = exec.ok,
                    output_bytes = exec.output.len(),
                    "executor finished"
                );
            }
            Err(err) => {
                warn!(run_id = %self.run_id, executor = %executor, attempt, error = %err, "executor fault");
            }
        }
        result
    }
}

/// Terminal result of a loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopOutcome {
    Done { output: String, attempts: u32 },
    Failed { reason: String, attempts: u32 },
    Cancelled { attempts: u32 },
}

/// Loop policy.
#[derive(Debug, Clone)]
pub struct LoopController {
    pub max_retries: u32,
    pub backoff: Duration,
    pub audit_mode: AuditMode,
}

impl LoopController {
    pub fn new(max_retries: u32, backoff: Duration, audit_mode: AuditMode) -> Self {
        Self {
            max_retries,
            backoff,
            audit_mode,
        }
    }

    /// Audit an attempt. Errors are failures of the audit itself.
    async fn audit(
        &self,
        ctx: &mut RunContext,
        task: &str,
        output: &str,
    ) -> Result<AuditVerdict, String> {
        match self.audit_mode {
            AuditMode::Token => Ok(audit(output)),
            AuditMode::Executor => {
                if ctx.cancel.is_cancelled() {
                    return Err("cancelled before audit".to_string());
                }
                match ctx.invoke(&audit_prompt(task, output)).await {
                    Ok(review) if review.ok => Ok(audit(&review.output)),
                    Ok(review) => Err(format!("audit failed: {}", review.output)),
                    Err(err) => Err(format!("audit failed: {err}")),
                }
            }
        }
    }

    /// Drive the loop for `task` to a terminal state.
    pub async fn run(&self, ctx: &mut RunContext, task: &str) -> LoopOutcome {
        let mut state = LoopState::Planning;
        let mut prompt = String::new();
        let mut last_output = String::new();
        let mut reason = String::new();
        let mut failure = String::new();
        let mut executions = 0u32;
        let mut remaining = self.max_retries;

        loop {
            let next = match state {
                LoopState::Planning => {
                    prompt = planning_prompt(task);
                    LoopState::Executing
                }
                LoopState::Executing => {
                    if ctx.cancel.is_cancelled() {
                        LoopState::Cancelled
                    } else {
                        executions += 1;
                        match ctx.invoke(&prompt).await {
                            Err(err) => {
                                failure = err.to_string();
                                LoopState::Failed
                            }
                            Ok(result) if !result.ok => {
                                failure = result.output;
                                LoopState::Failed
                            }
                            Ok(result) => {
                                last_output = result.output;
                                if is_complete(&last_output) {
                                    LoopState::Done
                                } else {
                                    LoopState::Auditing
                                }
                            }
                        }
                    }
                }
                LoopState::Auditing => match self.audit(ctx, task, &last_output).await {
                    Err(message) if ctx.cancel.is_cancelled() => {
                        debug!(run_id = %ctx.run_id, reason = %message, "audit skipped");
                        LoopState::Cancelled
                    }
                    Err(message) => {
                        failure = message;
                        LoopState::Failed
                    }
                    Ok(verdict) => {
                        ctx.record(EventPayload::AuditVerdict(AuditVerdictPayload {
                            attempt: executions,
                            satisfied: verdict.satisfied,
                            malformed: verdict.is_malformed,
                            reason: verdict.reason.clone(),
                        }))
                        .await;
                        if verdict.satisfied {
                            LoopState::Done
                        } else if remaining > 0 {
                            reason = verdict.reason;
                            LoopState::Retrying
                        } else {
                            failure = format!(
                                "retry budget exhausted after {executions} attempts: {}",
                                verdict.reason
                            );
                            LoopState::Failed
                        }
                    }
                },
                LoopState::Retrying => {
                    remaining -= 1;
                    tokio::select! {
                        () = ctx.cancel.cancelled() => LoopState::Cancelled,
                        () = tokio::time::sleep(self.backoff) => {
                            prompt = retry_prompt(task, executions, &last_output, &reason);
                            LoopState::Executing
                        }
                    }
                }
                LoopState::Done | LoopState::Failed | LoopState::Cancelled => break,
            };

            ctx.record(EventPayload::LoopTransition(LoopTransitionPayload {
                from: state,
                to: next,
                attempt: executions,
            }))
            .await;
            debug!(run_id = %ctx.run_id, from = %state, to = %next, attempt = executions, "loop transition");
            state = next;
        }

        match state {
            LoopState::Done => LoopOutcome::Done {
                output: last_output,
                attempts: executions,
            },
            LoopState::Cancelled => LoopOutcome::Cancelled {
                attempts: executions,
            },
            _ => LoopOutcome::Failed {
                reason: failure,
                attempts: executions,
            },
        }
    }
}
