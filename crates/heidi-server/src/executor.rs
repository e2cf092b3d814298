//! Executor abstraction.
//!
//! One contract over two backend shapes: a spawned command-line tool
//! ([`ProcessExecutor`]) and a managed chat session
//! ([`crate::session::SessionExecutor`]). Ordinary backend failures are
//! returned as `ExecResult { ok: false, .. }`; only faults that prevent an
//! answer at all are `ExecutorError`s.

use std::collections::BTreeMap;
use std::fmt;
use std::os::fd::OwnedFd;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use heidi_core::{redact, Config, ExecResult};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::session::{SessionExecutor, StreamJsonBackend};

/// Interval between progress log lines while a process is running.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Grace period for pipe readers after the process exits or is killed.
const IO_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum bytes captured from a process's combined stdout and stderr.
const MAX_OUTPUT_BYTES: usize = 50 * 1024 * 1024;

/// Model used by the managed session when none is configured.
pub const DEFAULT_SESSION_MODEL: &str = "gpt-5";

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("unknown executor '{0}'")]
    UnknownExecutor(String),
    #[error("executor '{name}' unavailable: '{program}' not found in PATH")]
    BinaryNotFound { name: String, program: String },
    #[error("executor '{name}' has an empty command")]
    EmptyCommand { name: String },
    #[error("executor '{name}' failed to start session: {reason}")]
    SessionStart { name: String, reason: String },
    #[error(
        "executor '{name}' timed out after {timeout_sec}s (partial_output_len={partial_output_len})"
    )]
    Timeout {
        name: String,
        timeout_sec: u64,
        partial_output_len: usize,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecutorError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

/// A backend that turns a prompt into an [`ExecResult`].
#[async_trait]
pub trait Executor: Send + Sync + fmt::Debug {
    /// Registered name of this executor.
    fn name(&self) -> &str;

    async fn run(&self, prompt: &str, workdir: &Path) -> Result<ExecResult>;
}

/// Read from an async reader, keeping at most `max_bytes`.
pub(crate) async fn read_bounded<R: tokio::io::AsyncRead + Unpin>(
    mut reader: R,
    max_bytes: usize,
) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(8192);
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }

        let remaining = max_bytes.saturating_sub(buf.len());
        if remaining == 0 {
            warn!(max_bytes, "output exceeded limit, truncating");
            while reader.read(&mut chunk).await? > 0 {}
            break;
        }

        let to_take = n.min(remaining);
        buf.extend_from_slice(&chunk[..to_take]);
    }

    Ok(buf)
}

async fn collect(task: tokio::task::JoinHandle<std::io::Result<Vec<u8>>>, executor: &str) -> Vec<u8> {
    match timeout(IO_CAPTURE_TIMEOUT, task).await {
        Ok(Ok(Ok(buf))) => buf,
        Ok(Ok(Err(err))) => {
            warn!(executor, error = %err, "capture failed");
            Vec::new()
        }
        Ok(Err(err)) => {
            warn!(executor, error = %err, "capture task panicked");
            Vec::new()
        }
        Err(_) => {
            warn!(executor, "capture timed out");
            Vec::new()
        }
    }
}

/// `file://` URI for `path`, made absolute first.
pub(crate) fn file_uri(path: &Path) -> String {
    let absolute = std::fs::canonicalize(path)
        .or_else(|_| std::path::absolute(path))
        .unwrap_or_else(|_| path.to_path_buf());
    let encoded: Vec<String> = absolute
        .to_string_lossy()
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect();
    format!("file://{}", encoded.join("/"))
}

/// Substitute `{workdir}`, `{workdir_uri}` and `{model}` and drop tokens
/// that end up empty.
pub(crate) fn expand_template(template: &[String], workdir: &Path, model: &str) -> Vec<String> {
    let uri = template
        .iter()
        .any(|token| token.contains("{workdir_uri}"))
        .then(|| file_uri(workdir))
        .unwrap_or_default();
    let workdir = workdir.display().to_string();
    template
        .iter()
        .map(|token| {
            token
                .replace("{workdir_uri}", &uri)
                .replace("{workdir}", &workdir)
                .replace("{model}", model)
        })
        .filter(|token| !token.is_empty())
        .collect()
}

enum ProcessOutcome {
    Completed(std::process::ExitStatus),
    TimedOut,
}

/// Runs a command-line tool with the prompt as its final argument.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    name: String,
    template: Vec<String>,
    model: String,
    /// 0 disables the timeout.
    timeout_sec: u64,
}

impl ProcessExecutor {
    pub fn new(name: impl Into<String>, template: Vec<String>) -> Self {
        Self {
            name: name.into(),
            template,
            model: String::new(),
            timeout_sec: 0,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_timeout(mut self, timeout_sec: u64) -> Self {
        self.timeout_sec = timeout_sec;
        self
    }

    /// Full argument vector for `prompt`, program first.
    pub fn argv(&self, prompt: &str, workdir: &Path) -> Vec<String> {
        let mut argv = expand_template(&self.template, workdir, &self.model);
        argv.push(prompt.to_string());
        argv
    }
}

#[async_trait]
impl Executor for ProcessExecutor {
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

        let argv = self.argv(prompt, workdir);
        if argv.len() < 2 {
            return Err(ExecutorError::EmptyCommand {
                name: self.name.clone(),
            });
        }
        let program = &argv[0];

        // stdout and stderr share one pipe so output keeps its write order.
        let (reader, writer) = std::io::pipe()?;
        let mut cmd = Command::new(program);
        cmd.args(&argv[1..])
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(writer.try_clone()?)
            .stderr(writer)
            .kill_on_drop(true);

        debug!(
            executor = %self.name,
            program = %program,
            workdir = %workdir.display(),
            "spawning executor process"
        );

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ExecutorError::BinaryNotFound {
                    name: self.name.clone(),
                    program: program.clone(),
                }
            } else {
                ExecutorError::Io(e)
            }
        })?;
        // Close the parent's write ends, or the reader never sees EOF.
        drop(cmd);

        let output_pipe = pipe::Receiver::from_file(std::fs::File::from(OwnedFd::from(reader)))?;
        let capture = tokio::spawn(read_bounded(output_pipe, MAX_OUTPUT_BYTES));

        let timeout_duration = Duration::from_secs(self.timeout_sec);
        let outcome = loop {
            let elapsed = started.elapsed();

            if self.timeout_sec > 0 && elapsed >= timeout_duration {
                warn!(
                    executor = %self.name,
                    timeout_sec = self.timeout_sec,
                    "process timed out; killing"
                );
                if let Err(err) = child.kill().await {
                    warn!(executor = %self.name, error = %err, "failed to kill timed-out process");
                }
                let _ = child.wait().await;
                break ProcessOutcome::TimedOut;
            }

            let remaining = if self.timeout_sec > 0 {
                timeout_duration.saturating_sub(elapsed)
            } else {
                Duration::MAX
            };

            tokio::select! {
                result = child.wait() => break ProcessOutcome::Completed(result?),
                () = tokio::time::sleep(HEARTBEAT_INTERVAL.min(remaining)) => {
                    info!(
                        executor = %self.name,
                        elapsed_sec = started.elapsed().as_secs(),
                        "executor still running"
                    );
                }
            }
        };

        let output = String::from_utf8_lossy(&collect(capture, &self.name).await).into_owned();
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            ProcessOutcome::TimedOut => Err(ExecutorError::Timeout {
                name: self.name.clone(),
                timeout_sec: self.timeout_sec,
                partial_output_len: output.len(),
            }),
            ProcessOutcome::Completed(status) => {
                let exit_code = status.code();
                info!(
                    executor = %self.name,
                    exit_code = exit_code.unwrap_or(-1),
                    duration_ms,
                    output_bytes = output.len(),
                    "executor process finished"
                );
                Ok(ExecResult {
                    ok: exit_code == Some(0),
                    output: redact(&output),
                    events: Vec::new(),
                    exit_code,
                    duration_ms,
                })
            }
        }
    }
}

/// Settings for a process-backed registration.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub command: Vec<String>,
    pub default_model: Option<String>,
    pub timeout_sec: u64,
}

/// Settings for a session-backed registration.
#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub command: Vec<String>,
    pub default_model: Option<String>,
    pub timeout_sec: u64,
}

/// How a registered executor is built.
#[derive(Debug, Clone)]
pub enum Registration {
    Process(ProcessSpec),
    Session(SessionSpec),
    /// A ready-made executor, shared by every run.
    Instance(Arc<dyn Executor>),
}

/// Explicit table of executor names. Unknown names are an error.
#[derive(Debug, Clone, Default)]
pub struct ExecutorRegistry {
    entries: BTreeMap<String, Registration>,
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| (*s).to_string()).collect()
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in executors, with command overrides from `config`.
    ///
    /// `<name>_cmd` entries for names that are not built in register
    /// additional process executors.
    pub fn from_config(config: &Config) -> Self {
        let mut registry = Self::new();
        let process = |command: Vec<String>, default_model: Option<&str>| {
            Registration::Process(ProcessSpec {
                command,
                default_model: default_model.map(str::to_string),
                timeout_sec: config.process_timeout_sec,
            })
        };

        registry.register(
            "copilot",
            Registration::Session(SessionSpec {
                command: argv(&["copilot", "--stream-json", "--model", "{model}"]),
                default_model: Some(DEFAULT_SESSION_MODEL.to_string()),
                timeout_sec: config.session_timeout_sec,
            }),
        );
        registry.register("jules", process(argv(&["jules", "remote", "new", "--session"]), None));
        registry.register("opencode", process(argv(&["opencode", "run"]), None));
        registry.register("ollama", process(argv(&["ollama", "run", "{model}"]), Some("llama3")));
        registry.register(
            "vscode",
            process(
                argv(&[
                    "code",
                    "--folder-uri",
                    "{workdir_uri}",
                    "--command",
                    "heidi-vscode.execute",
                    "--",
                ]),
                None,
            ),
        );

        for (name, command) in &config.executor_cmds {
            match registry.entries.get_mut(name) {
                Some(Registration::Process(spec)) => spec.command.clone_from(command),
                Some(Registration::Session(spec)) => spec.command.clone_from(command),
                Some(Registration::Instance(_)) => {}
                None => registry.register(name, process(command.clone(), None)),
            }
        }

        if let Some(model) = &config.default_model {
            for registration in registry.entries.values_mut() {
                match registration {
                    Registration::Process(spec) if spec.command.iter().any(|t| t.contains("{model}")) => {
                        spec.default_model = Some(model.clone());
                    }
                    Registration::Session(spec) => spec.default_model = Some(model.clone()),
                    _ => {}
                }
            }
        }

        registry
    }

    pub fn register(&mut self, name: impl Into<String>, registration: Registration) {
        self.entries.insert(name.into(), registration);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Build the executor registered under `name`.
    pub fn resolve(&self, name: &str, model: Option<&str>) -> Result<Arc<dyn Executor>> {
        let registration = self
            .entries
            .get(name)
            .ok_or_else(|| ExecutorError::UnknownExecutor(name.to_string()))?;

        let executor: Arc<dyn Executor> = match registration {
            Registration::Process(spec) => {
                let model = model.or(spec.default_model.as_deref()).unwrap_or_default();
                Arc::new(
                    ProcessExecutor::new(name, spec.command.clone())
                        .with_model(model)
                        .with_timeout(spec.timeout_sec),
                )
            }
            Registration::Session(spec) => {
                let model = model
                    .or(spec.default_model.as_deref())
                    .unwrap_or(DEFAULT_SESSION_MODEL);
                Arc::new(SessionExecutor::new(
                    name,
                    Arc::new(StreamJsonBackend::new(spec.command.clone(), model)),
                    Duration::from_secs(spec.timeout_sec),
                ))
            }
            Registration::Instance(executor) => Arc::clone(executor),
        };
        Ok(executor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heidi_core::completion::PASS_TOKEN;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn script_executor(path: &Path) -> ProcessExecutor {
        ProcessExecutor::new("stub", vec![path.display().to_string()])
    }

    #[test]
    fn template_expansion_drops_empty_tokens() {
        let template = argv(&["ollama", "run", "{model}", "--cwd={workdir}"]);
        let expanded = expand_template(&template, Path::new("/repo"), "");
        assert_eq!(expanded, vec!["ollama", "run", "--cwd=/repo"]);

        let exec = ProcessExecutor::new("ollama", template).with_model("llama3");
        assert_eq!(
            exec.argv("hi", Path::new("/repo")),
            vec!["ollama", "run", "llama3", "--cwd=/repo", "hi"]
        );
    }

    #[test]
    fn vscode_opens_workdir_as_file_uri() {
        let registry = ExecutorRegistry::from_config(&Config::default());
        let Some(Registration::Process(spec)) = registry.entries.get("vscode") else {
            panic!("vscode is not a process executor");
        };
        let exec = ProcessExecutor::new("vscode", spec.command.clone());
        assert_eq!(
            exec.argv("go", Path::new("/heidi-missing/my repo")),
            vec![
                "code",
                "--folder-uri",
                "file:///heidi-missing/my%20repo",
                "--command",
                "heidi-vscode.execute",
                "--",
                "go",
            ]
        );
    }

    #[test]
    fn file_uri_resolves_relative_paths() {
        let uri = file_uri(Path::new("."));
        let cwd = std::env::current_dir().unwrap().canonicalize().unwrap();
        assert!(uri.starts_with("file:///"));
        assert!(uri.ends_with(cwd.file_name().unwrap().to_str().unwrap()));
    }

    #[tokio::test]
    async fn successful_process_is_ok() {
        let dir = TempDir::new().unwrap();
        let script = write_script(dir.path(), "ok.sh", "echo \"$1\"");
        let result = script_executor(&script).run("hi", dir.path()).await.unwrap();
        assert!(result.ok);
        assert_eq!(result.output.trim(), "hi");
        assert_eq!(result.exit_code, Some(0));
    }

    #[tokio::test]
    async fn nonzero_exit_is_not_ok_and_keeps_stderr() {
        let dir = TempDir::new().unwrap();
        let script = write_script(dir.path(), "fail.sh", "echo out; echo boom >&2; exit 3");
        let result = script_executor(&script).run("x", dir.path()).await.unwrap();
        assert!(!result.ok);
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.output, "out\nboom\n");
    }

    #[tokio::test]
    async fn stderr_is_interleaved_in_write_order() {
        let dir = TempDir::new().unwrap();
        let script = write_script(
            dir.path(),
            "warn.sh",
            &format!("echo 'warning: deprecated flag' >&2; echo done; echo '{PASS_TOKEN}'"),
        );
        let result = script_executor(&script).run("x", dir.path()).await.unwrap();
        assert!(result.ok);
        assert_eq!(
            result.output,
            format!("warning: deprecated flag\ndone\n{PASS_TOKEN}\n")
        );
        assert!(heidi_core::completion::is_complete(&result.output));
    }

    #[tokio::test]
    async fn output_is_redacted() {
        let dir = TempDir::new().unwrap();
        let script = write_script(dir.path(), "leak.sh", "echo GH_TOKEN=abc123");
        let result = script_executor(&script).run("x", dir.path()).await.unwrap();
        assert!(result.output.contains("GH_TOKEN=***REDACTED***"));
        assert!(!result.output.contains("abc123"));
    }

    #[tokio::test]
    async fn missing_binary_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let exec = ProcessExecutor::new("ghost", argv(&["heidi-definitely-not-installed"]));
        let err = exec.run("x", dir.path()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::BinaryNotFound { .. }));
        assert!(err.to_string().contains("unavailable"));
    }

    #[tokio::test]
    async fn missing_workdir_is_ordinary_failure() {
        let dir = TempDir::new().unwrap();
        let exec = ProcessExecutor::new("echo", argv(&["echo"]));
        let result = exec.run("x", &dir.path().join("gone")).await.unwrap();
        assert!(!result.ok);
        assert!(result.output.contains("workdir does not exist"));
    }

    #[tokio::test]
    async fn timeout_kills_and_reports_partial_length() {
        let dir = TempDir::new().unwrap();
        let script = write_script(dir.path(), "slow.sh", "echo started; exec sleep 30");
        let exec = script_executor(&script).with_timeout(1);
        let started = Instant::now();
        let err = exec.run("x", dir.path()).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(10));
        match err {
            ExecutorError::Timeout {
                timeout_sec,
                partial_output_len,
                ..
            } => {
                assert_eq!(timeout_sec, 1);
                assert!(partial_output_len >= "started".len());
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn unknown_executor_fails_closed() {
        let registry = ExecutorRegistry::from_config(&Config::default());
        let err = registry.resolve("nope", None).unwrap_err();
        assert!(matches!(err, ExecutorError::UnknownExecutor(name) if name == "nope"));
    }

    #[test]
    fn builtins_and_overrides() {
        let mut config = Config::default();
        config
            .executor_cmds
            .insert("jules".to_string(), argv(&["jules", "custom"]));
        config
            .executor_cmds
            .insert("stub-ok".to_string(), argv(&["echo"]));
        let registry = ExecutorRegistry::from_config(&config);

        let names = registry.names();
        for name in ["copilot", "jules", "ollama", "opencode", "stub-ok", "vscode"] {
            assert!(names.iter().any(|n| n == name), "missing {name}");
        }
        match registry.entries.get("jules") {
            Some(Registration::Process(spec)) => assert_eq!(spec.command, argv(&["jules", "custom"])),
            other => panic!("unexpected registration {other:?}"),
        }
        assert_eq!(registry.resolve("copilot", None).unwrap().name(), "copilot");
    }

    #[tokio::test]
    async fn registered_instance_is_shared() {
        let mut registry = ExecutorRegistry::new();
        let exec: Arc<dyn Executor> = Arc::new(ProcessExecutor::new("echo", argv(&["echo"])));
        registry.register("echo", Registration::Instance(Arc::clone(&exec)));
        let resolved = registry.resolve("echo", None).unwrap();
        assert!(Arc::ptr_eq(&exec, &resolved));

        let dir = TempDir::new().unwrap();
        let result = resolved.run("stub-ok", dir.path()).await.unwrap();
        assert!(result.ok);
        assert_eq!(result.output.trim(), "stub-ok");
    }
}
