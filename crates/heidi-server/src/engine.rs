//! Run engine: accepts run and loop requests, owns one background task per
//! run, and serves the read side (get, list, cancel, stream).

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures_util::stream::{self, Stream};
use futures_util::FutureExt;
use heidi_core::events::{
    EventPayload, RunCancelledPayload, RunCompletedPayload, RunCreatedPayload, RunFailedPayload,
    RunStartedPayload,
};
use heidi_core::{
    redact, AuditMode, Config, MetaUpdate, RunId, RunKind, RunMeta, RunRecord, RunStatus,
    RunSummary, TranscriptEvent,
};
use serde::Deserialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::controller::{LoopController, LoopOutcome, RunContext};
use crate::executor::{ExecutorError, ExecutorRegistry};
use crate::storage::{Artifact, RunStore, StorageError, UpdateOutcome};

/// Message recorded for runs found `running` at startup.
pub const INTERRUPTED_MESSAGE: &str = "interrupted: server restarted before the run finished";

/// Error taxonomy surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    Executor,
    Timeout,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidArgument => "invalid_argument",
            Self::NotFound => "not_found",
            Self::Executor => "executor",
            Self::Timeout => "timeout",
            Self::Internal => "internal",
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0}")]
    InvalidArgument(String),
    #[error("run not found: {0}")]
    NotFound(RunId),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error("storage error: {0}")]
    Storage(StorageError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Executor(err) if err.is_timeout() => ErrorKind::Timeout,
            Self::Executor(_) => ErrorKind::Executor,
            Self::Storage(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<StorageError> for EngineError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::RunNotFound(id) => Self::NotFound(id),
            StorageError::AlreadyExists(id) => {
                Self::InvalidArgument(format!("run_id already exists: {id}"))
            }
            other => Self::Storage(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Parse a caller-supplied run id.
pub fn parse_run_id(raw: &str) -> Result<RunId> {
    RunId::parse(raw).map_err(|_| EngineError::InvalidArgument("Invalid run_id".to_string()))
}

/// Request for a single executor invocation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunRequest {
    pub prompt: String,
    #[serde(default)]
    pub executor: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    #[serde(default)]
    pub run_id: Option<String>,
}

/// Request for a bounded-retry loop.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoopRequest {
    pub task: String,
    #[serde(default)]
    pub executor: Option<String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    #[serde(default)]
    pub run_id: Option<String>,
}

/// Outcome of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    AlreadyTerminal(RunStatus),
}

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub default_executor: String,
    pub default_workdir: PathBuf,
    pub default_max_retries: u32,
    pub max_retries_ceiling: u32,
    pub loop_backoff: Duration,
    pub audit_mode: AuditMode,
    pub stream_poll: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            default_executor: config.default_executor.clone(),
            default_workdir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            default_max_retries: config.loop_max_retries,
            max_retries_ceiling: config.loop_max_retries_ceiling,
            loop_backoff: Duration::from_millis(config.loop_backoff_ms),
            audit_mode: config.audit_mode,
            stream_poll: Duration::from_millis(config.stream_poll_ms.max(10)),
        }
    }
}

#[derive(Debug)]
struct ActiveRun {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Live background tasks, keyed by run.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    runs: Mutex<HashMap<RunId, ActiveRun>>,
}

impl TaskRegistry {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RunId, ActiveRun>> {
        self.runs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Spawn `task` and register it before it can deregister itself.
    fn spawn<F>(&self, id: RunId, cancel: CancellationToken, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut runs = self.lock();
        let handle = tokio::spawn(task);
        runs.insert(id, ActiveRun { cancel, handle });
    }

    fn remove(&self, id: &RunId) {
        self.lock().remove(id);
    }

    fn cancel(&self, id: &RunId) -> bool {
        match self.lock().get(id) {
            Some(active) => {
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &RunId) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Signal every live run to stop at its next checkpoint and hand back
    /// their task handles.
    fn cancel_all(&self) -> Vec<JoinHandle<()>> {
        self.lock()
            .drain()
            .map(|(_, active)| {
                active.cancel.cancel();
                active.handle
            })
            .collect()
    }
}

enum Job {
    Run {
        prompt: String,
    },
    Loop {
        task: String,
        controller: LoopController,
    },
}

enum RunOutcome {
    Completed { output: String, attempts: u32 },
    Failed { error: String, attempts: u32 },
    Cancelled,
}

#[derive(Debug)]
struct Inner {
    store: Arc<RunStore>,
    registry: Arc<ExecutorRegistry>,
    tasks: TaskRegistry,
    settings: EngineSettings,
}

/// Entry point for dispatching and observing runs. Cheap to clone.
#[derive(Debug, Clone)]
pub struct RunEngine {
    inner: Arc<Inner>,
}

impl RunEngine {
    pub fn new(store: Arc<RunStore>, registry: Arc<ExecutorRegistry>, settings: EngineSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                registry,
                tasks: TaskRegistry::default(),
                settings,
            }),
        }
    }

    pub fn store(&self) -> &Arc<RunStore> {
        &self.inner.store
    }

    pub fn registry(&self) -> &Arc<ExecutorRegistry> {
        &self.inner.registry
    }

    pub fn tasks(&self) -> &TaskRegistry {
        &self.inner.tasks
    }

    pub fn active_count(&self) -> usize {
        self.inner.tasks.len()
    }

    /// Start a single executor invocation in the background.
    pub async fn submit_run(&self, request: RunRequest) -> Result<RunId> {
        if request.prompt.trim().is_empty() {
            return Err(EngineError::InvalidArgument("prompt must not be empty".to_string()));
        }
        let meta = self.prepare(
            RunKind::Run,
            request.run_id.as_deref(),
            request.executor,
            request.model,
            request.workdir,
            request.prompt.clone(),
            None,
        )?;
        self.launch(meta, Job::Run {
            prompt: request.prompt,
        })
        .await
    }

    /// Start a bounded-retry loop in the background.
    pub async fn submit_loop(&self, request: LoopRequest) -> Result<RunId> {
        if request.task.trim().is_empty() {
            return Err(EngineError::InvalidArgument("task must not be empty".to_string()));
        }
        let settings = &self.inner.settings;
        let max_retries = request.max_retries.unwrap_or(settings.default_max_retries);
        if max_retries > settings.max_retries_ceiling {
            return Err(EngineError::InvalidArgument(format!(
                "max_retries must be at most {}",
                settings.max_retries_ceiling
            )));
        }
        let meta = self.prepare(
            RunKind::Loop,
            request.run_id.as_deref(),
            request.executor,
            request.model,
            request.workdir,
            request.task.clone(),
            Some(max_retries),
        )?;
        let controller = LoopController::new(max_retries, settings.loop_backoff, settings.audit_mode);
        self.launch(meta, Job::Loop {
            task: request.task,
            controller,
        })
        .await
    }

    /// Validate a request and build its initial metadata.
    fn prepare(
        &self,
        kind: RunKind,
        run_id: Option<&str>,
        executor: Option<String>,
        model: Option<String>,
        workdir: Option<PathBuf>,
        task: String,
        max_retries: Option<u32>,
    ) -> Result<RunMeta> {
        let run_id = match run_id {
            Some(raw) => parse_run_id(raw)?,
            None => RunId::generate(),
        };
        let executor = executor
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| self.inner.settings.default_executor.clone());
        if !self.inner.registry.contains(&executor) {
            return Err(EngineError::InvalidArgument(format!(
                "unknown executor '{executor}'"
            )));
        }
        let workdir = workdir.unwrap_or_else(|| self.inner.settings.default_workdir.clone());

        let now = Utc::now();
        Ok(RunMeta {
            run_id,
            kind,
            executor,
            model: model.filter(|m| !m.trim().is_empty()),
            workdir: workdir.display().to_string(),
            task,
            max_retries,
            status: RunStatus::Running,
            attempts: 0,
            ok: None,
            error: None,
            created_at: now,
            updated_at: now,
        })
    }

    async fn launch(&self, meta: RunMeta, job: Job) -> Result<RunId> {
        let executor = self
            .inner
            .registry
            .resolve(&meta.executor, meta.model.as_deref())
            .map_err(|err| EngineError::InvalidArgument(err.to_string()))?;

        self.inner.store.create_run(&meta).await?;
        self.inner
            .store
            .append_event(
                &meta.run_id,
                EventPayload::RunCreated(RunCreatedPayload {
                    run_id: meta.run_id.clone(),
                    kind: meta.kind,
                    executor: meta.executor.clone(),
                    workdir: meta.workdir.clone(),
                })
                .into_event(),
            )
            .await?;

        let run_id = meta.run_id.clone();
        let cancel = CancellationToken::new();
        let ctx = RunContext {
            store: Arc::clone(&self.inner.store),
            run_id: run_id.clone(),
            executor,
            workdir: PathBuf::from(&meta.workdir),
            cancel: cancel.clone(),
            attempts: 0,
        };

        let inner = Arc::clone(&self.inner);
        self.inner
            .tasks
            .spawn(run_id.clone(), cancel, execute(inner, ctx, job));

        info!(
            run_id = %run_id,
            kind = meta.kind.as_str(),
            executor = %meta.executor,
            "run submitted"
        );
        Ok(run_id)
    }

    pub async fn get_run(&self, run_id: &str) -> Result<RunRecord> {
        let id = parse_run_id(run_id)?;
        Ok(self.inner.store.get_record(&id).await?)
    }

    pub async fn list_runs(&self, limit: usize) -> Result<Vec<RunSummary>> {
        Ok(self.inner.store.list_runs(limit).await?)
    }

    /// Cancel a running run. Idempotent: terminal runs are left untouched.
    pub async fn cancel_run(&self, run_id: &str) -> Result<CancelOutcome> {
        let id = parse_run_id(run_id)?;
        let event = EventPayload::RunCancelled(RunCancelledPayload {
            run_id: id.clone(),
            source: "api".to_string(),
        })
        .into_event();

        let outcome = self
            .inner
            .store
            .finish(&id, MetaUpdate::status(RunStatus::Cancelled), None, event)
            .await?;
        match outcome {
            UpdateOutcome::Applied(_) => {
                let live = self.inner.tasks.cancel(&id);
                info!(run_id = %id, live, "run cancelled");
                Ok(CancelOutcome::Cancelled)
            }
            UpdateOutcome::AlreadyTerminal(status) => Ok(CancelOutcome::AlreadyTerminal(status)),
        }
    }

    /// Stream a run's transcript from the beginning until it is terminal.
    pub async fn stream_run(
        &self,
        run_id: &str,
    ) -> Result<impl Stream<Item = TranscriptEvent> + Send + 'static> {
        let id = parse_run_id(run_id)?;
        self.inner.store.load_meta(&id).await?;
        Ok(transcript_stream(
            Arc::clone(&self.inner.store),
            id,
            self.inner.settings.stream_poll,
        ))
    }

    /// Mark runs persisted as `running` without a live task as failed.
    pub async fn recover_interrupted_runs(&self) -> Result<usize> {
        let mut recovered = 0;
        for meta in self.inner.store.list_meta().await? {
            if meta.status != RunStatus::Running || self.inner.tasks.contains(&meta.run_id) {
                continue;
            }
            let outcome = finalize(
                &self.inner.store,
                &meta.run_id,
                RunOutcome::Failed {
                    error: INTERRUPTED_MESSAGE.to_string(),
                    attempts: meta.attempts,
                },
            )
            .await;
            if matches!(outcome, Ok(true)) {
                warn!(run_id = %meta.run_id, "marked interrupted run as failed");
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    /// Ask every live run to stop, then wait up to `grace` for them to
    /// record their terminal state.
    pub async fn shutdown(&self, grace: Duration) {
        let handles = self.inner.tasks.cancel_all();
        if handles.is_empty() {
            return;
        }
        let runs = handles.len();
        match tokio::time::timeout(grace, futures_util::future::join_all(handles)).await {
            Ok(_) => info!(runs, "live runs stopped"),
            Err(_) => warn!(
                runs,
                grace_ms = grace.as_millis() as u64,
                "live runs still busy at shutdown; recovery will mark them failed"
            ),
        }
    }
}

/// Background task body: drive the job, record the outcome exactly once.
async fn execute(inner: Arc<Inner>, mut ctx: RunContext, job: Job) {
    let run_id = ctx.run_id.clone();
    let store = Arc::clone(&inner.store);

    let outcome = AssertUnwindSafe(drive(&mut ctx, job)).catch_unwind().await;
    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(run_id = %run_id, panic = %message, "run task panicked");
            RunOutcome::Failed {
                error: format!("internal error: {message}"),
                attempts: ctx.attempts,
            }
        }
    };

    if let Err(err) = finalize(&store, &run_id, outcome).await {
        error!(run_id = %run_id, error = %err, "failed to record run outcome");
    }
    inner.tasks.remove(&run_id);
}

async fn drive(ctx: &mut RunContext, job: Job) -> RunOutcome {
    if ctx.cancel.is_cancelled() {
        return RunOutcome::Cancelled;
    }
    ctx.record(EventPayload::RunStarted(RunStartedPayload {
        run_id: ctx.run_id.clone(),
    }))
    .await;

    match job {
        Job::Run { prompt } => match ctx.invoke(&prompt).await {
            Ok(result) if result.ok => RunOutcome::Completed {
                output: result.output,
                attempts: ctx.attempts,
            },
            Ok(result) => RunOutcome::Failed {
                error: result.output,
                attempts: ctx.attempts,
            },
            Err(err) => RunOutcome::Failed {
                error: err.to_string(),
                attempts: ctx.attempts,
            },
        },
        Job::Loop { task, controller } => match controller.run(ctx, &task).await {
            LoopOutcome::Done { output, .. } => RunOutcome::Completed {
                output,
                attempts: ctx.attempts,
            },
            LoopOutcome::Failed { reason, .. } => RunOutcome::Failed {
                error: reason,
                attempts: ctx.attempts,
            },
            LoopOutcome::Cancelled { .. } => RunOutcome::Cancelled,
        },
    }
}

/// Write the terminal state. Returns false if the run was already terminal.
async fn finalize(store: &RunStore, run_id: &RunId, outcome: RunOutcome) -> Result<bool> {
    let (update, artifact, payload) = match outcome {
        RunOutcome::Completed { output, attempts } => (
            MetaUpdate {
                status: Some(RunStatus::Completed),
                attempts: Some(attempts),
                ok: Some(true),
                error: None,
            },
            Some(Artifact::Result(output)),
            EventPayload::RunCompleted(RunCompletedPayload {
                run_id: run_id.clone(),
                attempts,
            }),
        ),
        RunOutcome::Failed { error, attempts } => {
            let error = redact(&error);
            (
                MetaUpdate {
                    status: Some(RunStatus::Failed),
                    attempts: Some(attempts),
                    ok: Some(false),
                    error: Some(error.clone()),
                },
                Some(Artifact::Error(error.clone())),
                EventPayload::RunFailed(RunFailedPayload {
                    run_id: run_id.clone(),
                    reason: error,
                }),
            )
        }
        RunOutcome::Cancelled => (
            MetaUpdate::status(RunStatus::Cancelled),
            None,
            EventPayload::RunCancelled(RunCancelledPayload {
                run_id: run_id.clone(),
                source: "engine".to_string(),
            }),
        ),
    };

    let status = update.status;
    match store.finish(run_id, update, artifact, payload.into_event()).await? {
        UpdateOutcome::Applied(_) => {
            info!(run_id = %run_id, status = ?status, "run finished");
            Ok(true)
        }
        UpdateOutcome::AlreadyTerminal(existing) => {
            info!(run_id = %run_id, status = %existing, "run already terminal; outcome discarded");
            Ok(false)
        }
    }
}

struct StreamState {
    store: Arc<RunStore>,
    run_id: RunId,
    offset: u64,
    pending: VecDeque<TranscriptEvent>,
    done: bool,
    poll: Duration,
}

/// Tail a transcript from offset 0, ending after a final drain once the run is terminal.
fn transcript_stream(
    store: Arc<RunStore>,
    run_id: RunId,
    poll: Duration,
) -> impl Stream<Item = TranscriptEvent> + Send + 'static {
    let state = StreamState {
        store,
        run_id,
        offset: 0,
        pending: VecDeque::new(),
        done: false,
        poll,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(event) = st.pending.pop_front() {
                return Some((event, st));
            }
            if st.done {
                return None;
            }

            // Status first: the terminal event is appended before the status is written.
            let terminal = match st.store.load_meta(&st.run_id).await {
                Ok(meta) => meta.status.is_terminal(),
                Err(err) => {
                    warn!(run_id = %st.run_id, error = %err, "stream lost run metadata");
                    true
                }
            };
            match st.store.read_events_from(&st.run_id, st.offset).await {
                Ok((events, offset)) => {
                    st.offset = offset;
                    st.pending.extend(events);
                }
                Err(err) => {
                    warn!(run_id = %st.run_id, error = %err, "stream read failed");
                    st.done = true;
                    continue;
                }
            }
            if terminal {
                st.done = true;
            } else if st.pending.is_empty() {
                tokio::time::sleep(st.poll).await;
            }
        }
    })
}
