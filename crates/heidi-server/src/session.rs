//! Managed chat-session executor.
//!
//! A [`SessionBackend`] opens a [`Session`] scoped to one executor call.
//! The session pushes [`SessionEvent`]s into a channel; the awaiting side
//! accumulates message chunks until the session goes idle or the timeout
//! expires. The session is closed on every exit path.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use heidi_core::prompt::with_workdir;
use heidi_core::{redact, ExecResult};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::executor::{expand_template, read_bounded, Executor, ExecutorError, Result};

/// Buffered events per session before the producer waits.
const EVENT_BUFFER: usize = 256;

/// Time allowed for a session process to exit or be reaped.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Stderr kept for the diagnostic of a failed session process.
const MAX_STDERR_BYTES: usize = 64 * 1024;

/// Event emitted by a managed session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A chunk of assistant output.
    Message(String),
    /// The session finished answering.
    Idle,
    /// The backend reported an error.
    Error(String),
}

/// One open conversation with a session backend.
#[async_trait]
pub trait Session: Send {
    /// Send the prompt. Events arrive on the receiver returned by [`Session::events`].
    async fn send(&mut self, prompt: &str) -> Result<()>;

    fn events(&mut self) -> &mut mpsc::Receiver<SessionEvent>;

    /// Tear the session down. Must be safe to call in any state.
    async fn close(&mut self);
}

/// Opens sessions.
#[async_trait]
pub trait SessionBackend: Send + Sync + std::fmt::Debug {
    async fn open(&self, workdir: &Path) -> Result<Box<dyn Session>>;
}

/// Executor over a [`SessionBackend`].
#[derive(Debug)]
pub struct SessionExecutor {
    name: String,
    backend: Arc<dyn SessionBackend>,
    timeout: Duration,
}

impl SessionExecutor {
    pub fn new(name: impl Into<String>, backend: Arc<dyn SessionBackend>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            backend,
            timeout,
        }
    }

    async fn converse(
        &self,
        session: &mut dyn Session,
        prompt: &str,
        started: Instant,
    ) -> Result<ExecResult> {
        let deadline = started + self.timeout;
        let mut output = String::new();
        let mut events = Vec::new();

        if let Err(err) = session.send(prompt).await {
            warn!(executor = %self.name, error = %err, "failed to send prompt to session");
            let remaining = deadline.saturating_duration_since(Instant::now());
            let reason = timeout(remaining.min(CLOSE_TIMEOUT), failure_reason(&mut *session))
                .await
                .ok()
                .flatten()
                .unwrap_or_else(|| format!("session did not accept the prompt: {err}"));
            return Ok(failed(reason, events, started));
        }

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let next = match timeout(remaining, session.events().recv()).await {
                Ok(next) => next,
                Err(_) => {
                    return Err(ExecutorError::Timeout {
                        name: self.name.clone(),
                        timeout_sec: self.timeout.as_secs(),
                        partial_output_len: output.len(),
                    });
                }
            };

            match next {
                Some(SessionEvent::Message(chunk)) => {
                    events.push(json!({ "type": "assistant.message", "len": chunk.len() }));
                    output.push_str(&chunk);
                }
                Some(SessionEvent::Idle) | None => {
                    events.push(json!({ "type": "session.idle" }));
                    return Ok(ExecResult {
                        ok: true,
                        output: redact(&output),
                        events,
                        exit_code: None,
                        duration_ms: started.elapsed().as_millis() as u64,
                    });
                }
                Some(SessionEvent::Error(message)) => return Ok(failed(message, events, started)),
            }
        }
    }
}

/// `ok: false` result carrying the redacted backend diagnostic.
fn failed(message: String, mut events: Vec<Value>, started: Instant) -> ExecResult {
    let message = redact(&message);
    events.push(json!({ "type": "session.error", "message": message }));
    ExecResult {
        ok: false,
        output: message,
        events,
        exit_code: None,
        duration_ms: started.elapsed().as_millis() as u64,
    }
}

/// After a failed send, wait for the backend's own explanation.
async fn failure_reason(session: &mut dyn Session) -> Option<String> {
    while let Some(event) = session.events().recv().await {
        match event {
            SessionEvent::Error(message) => return Some(message),
            SessionEvent::Idle => return None,
            SessionEvent::Message(_) => {}
        }
    }
    None
}

#[async_trait]
impl Executor for SessionExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, prompt: &str, workdir: &Path) -> Result<ExecResult> {
        if !workdir.is_dir() {
            return Ok(ExecResult {
                ok: false,
                output: format!("workdir does not exist: {}", workdir.display()),
                ..ExecResult::default()
            });
        }

        let started = Instant::now();
        let mut session = self.backend.open(workdir).await.map_err(|err| match err {
            ExecutorError::BinaryNotFound { program, .. } => ExecutorError::BinaryNotFound {
                name: self.name.clone(),
                program,
            },
            ExecutorError::SessionStart { reason, .. } => ExecutorError::SessionStart {
                name: self.name.clone(),
                reason,
            },
            other => ExecutorError::SessionStart {
                name: self.name.clone(),
                reason: other.to_string(),
            },
        })?;

        let prompt = with_workdir(workdir, prompt);
        let result = self.converse(session.as_mut(), &prompt, started).await;
        session.close().await;

        if let Err(err) = &result {
            warn!(executor = %self.name, error = %err, "session call failed");
        }
        result
    }
}

/// Session backend that drives a CLI speaking newline-delimited JSON events.
///
/// The prompt is written to the process's stdin; stdout lines of the form
/// `{"type":"assistant.message","data":{"content":..}}`,
/// `{"type":"session.idle"}` and `{"type":"session.error","data":{"message":..}}`
/// become [`SessionEvent`]s. End of stdout counts as idle when the process
/// exits successfully, and as an error carrying its stderr otherwise.
#[derive(Debug, Clone)]
pub struct StreamJsonBackend {
    command: Vec<String>,
    model: String,
}

impl StreamJsonBackend {
    pub fn new(command: Vec<String>, model: impl Into<String>) -> Self {
        Self {
            command,
            model: model.into(),
        }
    }
}

/// Translate one stdout line into a session event.
fn parse_event(line: &str) -> Option<SessionEvent> {
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(err) => {
            debug!(error = %err, "ignoring unparseable session line");
            return None;
        }
    };
    let data = value.get("data");
    match value.get("type").and_then(Value::as_str)? {
        "assistant.message" | "assistant.message_delta" => data
            .and_then(|d| d.get("content").or_else(|| d.get("deltaContent")))
            .and_then(Value::as_str)
            .map(|s| SessionEvent::Message(s.to_string())),
        "session.idle" => Some(SessionEvent::Idle),
        "session.error" => Some(SessionEvent::Error(
            data.and_then(|d| d.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("session error")
                .to_string(),
        )),
        _ => None,
    }
}

#[async_trait]
impl SessionBackend for StreamJsonBackend {
    async fn open(&self, workdir: &Path) -> Result<Box<dyn Session>> {
        let argv = expand_template(&self.command, workdir, &self.model);
        let Some((program, args)) = argv.split_first() else {
            return Err(ExecutorError::EmptyCommand {
                name: "session".to_string(),
            });
        };

        let mut child = Command::new(program)
            .args(args)
            .current_dir(workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ExecutorError::BinaryNotFound {
                        name: "session".to_string(),
                        program: program.clone(),
                    }
                } else {
                    ExecutorError::SessionStart {
                        name: program.clone(),
                        reason: e.to_string(),
                    }
                }
            })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take().ok_or_else(|| ExecutorError::SessionStart {
            name: program.clone(),
            reason: "stdout not captured".to_string(),
        })?;

        let stderr = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(read_bounded(stderr, MAX_STDERR_BYTES)));

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let stop = CancellationToken::new();
        let reader = tokio::spawn(pump_events(child, stdout, stderr, tx, stop.clone()));

        Ok(Box::new(StreamJsonSession {
            stdin,
            events: rx,
            stop,
            reader: Some(reader),
        }))
    }
}

/// Forward stdout events until idle, end of stream or `stop`, then reap the process.
async fn pump_events(
    mut child: Child,
    stdout: ChildStdout,
    stderr: Option<JoinHandle<std::io::Result<Vec<u8>>>>,
    tx: mpsc::Sender<SessionEvent>,
    stop: CancellationToken,
) {
    let mut lines = BufReader::new(stdout).lines();
    let eof = loop {
        let line = tokio::select! {
            () = stop.cancelled() => break false,
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if let Some(event) = parse_event(line) {
                    let idle = event == SessionEvent::Idle;
                    if tx.send(event).await.is_err() || idle {
                        break false;
                    }
                }
            }
            Ok(None) => break true,
            Err(err) => {
                let _ = tx.send(SessionEvent::Error(err.to_string())).await;
                break false;
            }
        }
    };

    if eof {
        let event = exit_event(&mut child, stderr).await;
        let _ = tx.send(event).await;
    }
    reap(child).await;
}

/// Event for a session whose stdout ended without an idle marker.
async fn exit_event(
    child: &mut Child,
    stderr: Option<JoinHandle<std::io::Result<Vec<u8>>>>,
) -> SessionEvent {
    let status = match timeout(CLOSE_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) => status,
        Ok(Err(err)) => return SessionEvent::Error(format!("session process wait failed: {err}")),
        Err(_) => return SessionEvent::Idle,
    };
    if status.success() {
        return SessionEvent::Idle;
    }
    let stderr = match stderr {
        Some(task) => match timeout(CLOSE_TIMEOUT, task).await {
            Ok(Ok(Ok(buf))) => buf,
            _ => Vec::new(),
        },
        None => Vec::new(),
    };
    SessionEvent::Error(exit_diagnostic(status, &stderr))
}

fn exit_diagnostic(status: ExitStatus, stderr: &[u8]) -> String {
    let stderr = String::from_utf8_lossy(stderr);
    let stderr = stderr.trim();
    if stderr.is_empty() {
        format!("session process exited with {status}")
    } else {
        format!("session process exited with {status}: {stderr}")
    }
}

async fn reap(mut child: Child) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }
    if let Err(err) = child.start_kill() {
        debug!(error = %err, "session process already gone");
    }
    if timeout(CLOSE_TIMEOUT, child.wait()).await.is_err() {
        warn!("session process did not exit after kill");
    }
}

struct StreamJsonSession {
    stdin: Option<ChildStdin>,
    events: mpsc::Receiver<SessionEvent>,
    stop: CancellationToken,
    reader: Option<JoinHandle<()>>,
}

#[async_trait]
impl Session for StreamJsonSession {
    async fn send(&mut self, prompt: &str) -> Result<()> {
        let Some(mut stdin) = self.stdin.take() else {
            return Ok(());
        };
        stdin.write_all(prompt.as_bytes()).await?;
        stdin.shutdown().await?;
        Ok(())
    }

    fn events(&mut self) -> &mut mpsc::Receiver<SessionEvent> {
        &mut self.events
    }

    async fn close(&mut self) {
        self.stdin.take();
        self.stop.cancel();
        self.events.close();
        let Some(reader) = self.reader.take() else {
            return;
        };
        if timeout(CLOSE_TIMEOUT * 2, reader).await.is_err() {
            warn!("session reader did not stop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Backend replaying a fixed list of events.
    #[derive(Debug, Default)]
    struct ScriptedBackend {
        events: Vec<SessionEvent>,
        fail_open: bool,
        closed: Arc<AtomicUsize>,
    }

    struct ScriptedSession {
        events: mpsc::Receiver<SessionEvent>,
        pending: Option<Vec<SessionEvent>>,
        tx: mpsc::Sender<SessionEvent>,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Session for ScriptedSession {
        async fn send(&mut self, _prompt: &str) -> Result<()> {
            for event in self.pending.take().unwrap_or_default() {
                self.tx.send(event).await.unwrap();
            }
            Ok(())
        }

        fn events(&mut self) -> &mut mpsc::Receiver<SessionEvent> {
            &mut self.events
        }

        async fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl SessionBackend for ScriptedBackend {
        async fn open(&self, _workdir: &Path) -> Result<Box<dyn Session>> {
            if self.fail_open {
                return Err(ExecutorError::SessionStart {
                    name: "scripted".to_string(),
                    reason: "auth required".to_string(),
                });
            }
            let (tx, rx) = mpsc::channel(16);
            Ok(Box::new(ScriptedSession {
                events: rx,
                pending: Some(self.events.clone()),
                tx,
                closed: Arc::clone(&self.closed),
            }))
        }
    }

    fn executor(backend: ScriptedBackend, timeout: Duration) -> (SessionExecutor, Arc<AtomicUsize>) {
        let closed = Arc::clone(&backend.closed);
        (
            SessionExecutor::new("scripted", Arc::new(backend), timeout),
            closed,
        )
    }

    #[tokio::test]
    async fn accumulates_chunks_until_idle() {
        let backend = ScriptedBackend {
            events: vec![
                SessionEvent::Message("hel".to_string()),
                SessionEvent::Message("lo".to_string()),
                SessionEvent::Idle,
            ],
            ..ScriptedBackend::default()
        };
        let (exec, closed) = executor(backend, Duration::from_secs(5));
        let result = exec.run("hi", Path::new("/tmp")).await.unwrap();
        assert!(result.ok);
        assert_eq!(result.output, "hello");
        assert_eq!(result.events.len(), 3);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeout_reports_partial_length_and_closes() {
        let backend = ScriptedBackend {
            events: vec![SessionEvent::Message("partial".to_string())],
            ..ScriptedBackend::default()
        };
        let (exec, closed) = executor(backend, Duration::from_millis(100));
        let err = exec.run("hi", Path::new("/tmp")).await.unwrap_err();
        match err {
            ExecutorError::Timeout {
                partial_output_len, ..
            } => assert_eq!(partial_output_len, "partial".len()),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn backend_error_is_not_ok() {
        let backend = ScriptedBackend {
            events: vec![SessionEvent::Error("quota GH_TOKEN=abc".to_string())],
            ..ScriptedBackend::default()
        };
        let (exec, closed) = executor(backend, Duration::from_secs(5));
        let result = exec.run("hi", Path::new("/tmp")).await.unwrap();
        assert!(!result.ok);
        assert_eq!(result.output, "quota GH_TOKEN=***REDACTED***");
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn open_failure_is_session_start_fault() {
        let backend = ScriptedBackend {
            fail_open: true,
            ..ScriptedBackend::default()
        };
        let (exec, closed) = executor(backend, Duration::from_secs(5));
        let err = exec.run("hi", Path::new("/tmp")).await.unwrap_err();
        assert!(matches!(err, ExecutorError::SessionStart { .. }));
        assert_eq!(closed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn parses_stream_json_events() {
        assert_eq!(
            parse_event(r#"{"type":"assistant.message","data":{"content":"hi"}}"#),
            Some(SessionEvent::Message("hi".to_string()))
        );
        assert_eq!(
            parse_event(r#"{"type":"session.idle"}"#),
            Some(SessionEvent::Idle)
        );
        assert_eq!(
            parse_event(r#"{"type":"session.error","data":{"message":"nope"}}"#),
            Some(SessionEvent::Error("nope".to_string()))
        );
        assert_eq!(parse_event(r#"{"type":"tool.call"}"#), None);
        assert_eq!(parse_event("not json"), None);
    }

    #[tokio::test]
    async fn stream_json_backend_runs_process() {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("session.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\n\
             read -r first\n\
             echo '{\"type\":\"assistant.message\",\"data\":{\"content\":\"got: \"}}'\n\
             printf '{\"type\":\"assistant.message\",\"data\":{\"content\":\"%s\"}}\\n' \"$first\"\n\
             echo '{\"type\":\"session.idle\"}'\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let backend = StreamJsonBackend::new(vec![script.display().to_string()], "gpt-5");
        let exec = SessionExecutor::new("copilot", Arc::new(backend), Duration::from_secs(10));
        let result = exec.run("ignored", dir.path()).await.unwrap();
        assert!(result.ok);
        assert_eq!(
            result.output,
            format!("got: WORKDIR: {}", dir.path().display())
        );
    }

    fn session_script(dir: &Path, body: &str) -> SessionExecutor {
        let script = dir.join("session.sh");
        std::fs::write(&script, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        let backend = StreamJsonBackend::new(vec![script.display().to_string()], "gpt-5");
        SessionExecutor::new("copilot", Arc::new(backend), Duration::from_secs(10))
    }

    #[tokio::test]
    async fn crashed_session_process_is_not_ok() {
        let dir = TempDir::new().unwrap();
        let exec = session_script(dir.path(), "cat >/dev/null; echo auth-failed >&2; exit 1");
        let result = exec.run("hi", dir.path()).await.unwrap();
        assert!(!result.ok);
        assert!(result.output.contains("auth-failed"), "{}", result.output);
        assert!(result.output.contains("exit status: 1"), "{}", result.output);
    }

    #[tokio::test]
    async fn session_exiting_before_reading_prompt_is_not_ok() {
        let dir = TempDir::new().unwrap();
        let exec = session_script(dir.path(), "echo auth-failed >&2; exit 1");
        // Larger than a pipe buffer, so the write fails once the process is gone.
        let prompt = "x".repeat(256 * 1024);
        let result = exec.run(&prompt, dir.path()).await.unwrap();
        assert!(!result.ok);
        assert!(result.output.contains("auth-failed"), "{}", result.output);
    }

    #[tokio::test]
    async fn clean_exit_without_idle_is_ok() {
        let dir = TempDir::new().unwrap();
        let exec = session_script(
            dir.path(),
            "cat >/dev/null; echo '{\"type\":\"assistant.message\",\"data\":{\"content\":\"done\"}}'",
        );
        let result = exec.run("hi", dir.path()).await.unwrap();
        assert!(result.ok);
        assert_eq!(result.output, "done");
    }

    #[tokio::test]
    async fn stream_json_backend_missing_binary() {
        let dir = TempDir::new().unwrap();
        let backend = StreamJsonBackend::new(vec!["heidi-no-such-session".to_string()], "m");
        let exec = SessionExecutor::new("copilot", Arc::new(backend), Duration::from_secs(1));
        let err = exec.run("x", dir.path()).await.unwrap_err();
        assert!(err.to_string().contains("unavailable"));
    }
}
