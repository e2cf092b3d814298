//! File-backed run store.
//!
//! Layout: `<root>/<run_id>/{run.json, transcript.jsonl, result.txt, error.txt}`.
//! `run.json` is replaced atomically; the transcript is append-only;
//! `result.txt` and `error.txt` are created at most once.

use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};

use chrono::Utc;
use heidi_core::{
    redact, redact_json, MetaUpdate, RunId, RunMeta, RunRecord, RunStatus, RunSummary,
    TranscriptEvent,
};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

const META_FILE: &str = "run.json";
const TRANSCRIPT_FILE: &str = "transcript.jsonl";
const RESULT_FILE: &str = "result.txt";
const ERROR_FILE: &str = "error.txt";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("run not found: {0}")]
    RunNotFound(RunId),
    #[error("run already exists: {0}")]
    AlreadyExists(RunId),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Result of a metadata write.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    Applied(RunMeta),
    /// The run was already terminal; nothing was written.
    AlreadyTerminal(RunStatus),
}

/// Terminal output file written alongside a terminal status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    Result(String),
    Error(String),
}

/// Persistence for runs, one directory per run.
#[derive(Debug)]
pub struct RunStore {
    root: PathBuf,
    /// Serializes read-modify-write of `run.json` and transcript appends.
    write_lock: Mutex<()>,
}

impl RunStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, id: &RunId) -> PathBuf {
        self.root.join(id.as_str())
    }

    pub async fn exists(&self, id: &RunId) -> bool {
        fs::try_exists(self.run_dir(id).join(META_FILE))
            .await
            .unwrap_or(false)
    }

    /// Create the run directory and initial metadata. Fails if the id is taken.
    pub async fn create_run(&self, meta: &RunMeta) -> Result<()> {
        let dir = self.run_dir(&meta.run_id);
        match fs::create_dir(&dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return Err(StorageError::AlreadyExists(meta.run_id.clone()));
            }
            Err(err) => return Err(err.into()),
        }

        let _guard = self.write_lock.lock().await;
        self.write_meta(meta).await?;
        fs::File::create(dir.join(TRANSCRIPT_FILE)).await?;
        debug!(run_id = %meta.run_id, dir = %dir.display(), "created run directory");
        Ok(())
    }

    pub async fn load_meta(&self, id: &RunId) -> Result<RunMeta> {
        let path = self.run_dir(id).join(META_FILE);
        let raw = match fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StorageError::RunNotFound(id.clone()));
            }
            Err(err) => return Err(err.into()),
        };
        Ok(serde_json::from_str(&raw)?)
    }

    /// Merge `update` into the stored metadata unless the run is terminal.
    pub async fn update_meta(&self, id: &RunId, update: MetaUpdate) -> Result<UpdateOutcome> {
        let _guard = self.write_lock.lock().await;
        self.apply_update(id, update).await
    }

    /// Move a running run to a terminal state.
    ///
    /// Under one lock: the artifact is created, the terminal event appended,
    /// then the status written. Readers that observe the terminal status can
    /// therefore drain the transcript and find the terminal event.
    pub async fn finish(
        &self,
        id: &RunId,
        update: MetaUpdate,
        artifact: Option<Artifact>,
        event: TranscriptEvent,
    ) -> Result<UpdateOutcome> {
        let _guard = self.write_lock.lock().await;

        let current = self.load_meta(id).await?;
        if current.status.is_terminal() {
            return Ok(UpdateOutcome::AlreadyTerminal(current.status));
        }

        if let Some(artifact) = artifact {
            let (file, text) = match artifact {
                Artifact::Result(text) => (RESULT_FILE, text),
                Artifact::Error(text) => (ERROR_FILE, text),
            };
            if !self.write_once(id, file, &text).await? {
                warn!(run_id = %id, file, "terminal artifact already present; keeping original");
            }
        }
        self.append_locked(id, event).await?;
        self.apply_update(id, update).await
    }

    async fn apply_update(&self, id: &RunId, update: MetaUpdate) -> Result<UpdateOutcome> {
        let mut meta = self.load_meta(id).await?;
        if meta.status.is_terminal() {
            return Ok(UpdateOutcome::AlreadyTerminal(meta.status));
        }

        if let Some(status) = update.status {
            meta.status = status;
        }
        if let Some(attempts) = update.attempts {
            meta.attempts = attempts;
        }
        if let Some(ok) = update.ok {
            meta.ok = Some(ok);
        }
        if let Some(error) = update.error {
            meta.error = Some(error);
        }
        meta.updated_at = Utc::now();

        self.write_meta(&meta).await?;
        Ok(UpdateOutcome::Applied(meta))
    }

    async fn write_meta(&self, meta: &RunMeta) -> Result<()> {
        let mut meta = meta.clone();
        meta.task = redact(&meta.task);
        meta.error = meta.error.as_deref().map(redact);

        let dir = self.run_dir(&meta.run_id);
        let tmp = dir.join(format!("{META_FILE}.tmp"));
        let body = serde_json::to_vec_pretty(&meta)?;
        fs::write(&tmp, body).await?;
        fs::rename(&tmp, dir.join(META_FILE)).await?;
        Ok(())
    }

    /// Append one redacted event to the transcript.
    pub async fn append_event(&self, id: &RunId, event: TranscriptEvent) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.append_locked(id, event).await
    }

    async fn append_locked(&self, id: &RunId, mut event: TranscriptEvent) -> Result<()> {
        let dir = self.run_dir(id);
        if !fs::try_exists(&dir).await? {
            return Err(StorageError::RunNotFound(id.clone()));
        }

        event.data = redact_json(event.data);
        let mut line = serde_json::to_string(&event)?;
        line.push('\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(TRANSCRIPT_FILE))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Read complete transcript lines starting at byte `offset`.
    ///
    /// Returns the events and the offset just past the last complete line;
    /// a trailing partial line is left for the next call.
    pub async fn read_events_from(
        &self,
        id: &RunId,
        offset: u64,
    ) -> Result<(Vec<TranscriptEvent>, u64)> {
        let path = self.run_dir(id).join(TRANSCRIPT_FILE);
        let mut file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StorageError::RunNotFound(id.clone()));
            }
            Err(err) => return Err(err.into()),
        };

        let start = offset.min(file.metadata().await?.len());
        file.seek(SeekFrom::Start(start)).await?;
        let mut tail = Vec::new();
        file.read_to_end(&mut tail).await?;

        let Some(last_newline) = tail.iter().rposition(|b| *b == b'\n') else {
            return Ok((Vec::new(), start));
        };

        let complete = &tail[..=last_newline];
        let mut events = Vec::new();
        for line in complete.split(|b| *b == b'\n') {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<TranscriptEvent>(line) {
                Ok(event) => events.push(event),
                Err(err) => warn!(run_id = %id, error = %err, "skipping malformed transcript line"),
            }
        }

        Ok((events, start + last_newline as u64 + 1))
    }

    pub async fn read_events(&self, id: &RunId) -> Result<Vec<TranscriptEvent>> {
        Ok(self.read_events_from(id, 0).await?.0)
    }

    /// Create `file` with `text` unless it already exists. Returns whether it was written.
    async fn write_once(&self, id: &RunId, file: &str, text: &str) -> Result<bool> {
        let path = self.run_dir(id).join(file);
        let mut handle = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(handle) => handle,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        handle.write_all(redact(text).as_bytes()).await?;
        handle.flush().await?;
        Ok(true)
    }

    async fn read_optional(&self, id: &RunId, file: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.run_dir(id).join(file)).await {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn read_result(&self, id: &RunId) -> Result<Option<String>> {
        self.read_optional(id, RESULT_FILE).await
    }

    pub async fn read_error(&self, id: &RunId) -> Result<Option<String>> {
        self.read_optional(id, ERROR_FILE).await
    }

    pub async fn get_record(&self, id: &RunId) -> Result<RunRecord> {
        let meta = self.load_meta(id).await?;
        Ok(RunRecord {
            run_id: id.clone(),
            result: self.read_result(id).await?,
            error: self.read_error(id).await?,
            events: self.read_events(id).await?,
            meta,
        })
    }

    /// All readable run metadata. Unreadable entries are skipped.
    pub async fn list_meta(&self) -> Result<Vec<RunMeta>> {
        let mut entries = fs::read_dir(&self.root).await?;
        let mut metas = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(|n| RunId::parse(n).ok()) else {
                continue;
            };
            match self.load_meta(&id).await {
                Ok(meta) => metas.push(meta),
                Err(err) => warn!(run_id = %id, error = %err, "skipping unreadable run"),
            }
        }
        Ok(metas)
    }

    /// Most recently updated runs first.
    pub async fn list_runs(&self, limit: usize) -> Result<Vec<RunSummary>> {
        let mut metas = self.list_meta().await?;
        metas.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| b.run_id.cmp(&a.run_id))
        });
        Ok(metas.iter().take(limit).map(RunSummary::from).collect())
    }
}
