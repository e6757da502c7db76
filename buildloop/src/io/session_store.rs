//! Durable session records.
//!
//! A [`SessionStore`] wraps an injectable [`SessionBackend`]: [`FileBackend`]
//! keeps one pretty-printed JSON file per session under
//! `.buildloop/sessions/`, [`MemoryBackend`] keeps them in memory for tests.
//! File writes go through a temp file and a rename so readers never observe a
//! partially written record.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use rand::{Rng, distributions::Alphanumeric};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::plan::TaskRef;
use crate::core::types::{FailureContext, Mode, SessionStatus};

/// One supervised build-loop execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    pub project_id: String,
    pub mode: Mode,
    pub status: SessionStatus,
    /// Owning controller while active; cleared on a terminal status.
    pub pid: Option<u32>,
    /// Completed iterations.
    pub iteration: u32,
    pub started_at: DateTime<Utc>,
    pub paused_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub agent: String,
    pub model: Option<String>,
    pub log_path: PathBuf,
    /// Task the last iteration worked on.
    pub task: Option<TaskRef>,
    pub stop_reason: Option<String>,
    /// Failed iterations in a row on the current task.
    pub consecutive_failures: u32,
    /// Corrective context for the next prompt.
    pub last_failure: Option<FailureContext>,
}

/// Fields fixed when a session is created.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub project_id: String,
    pub mode: Mode,
    pub agent: String,
    pub model: Option<String>,
    pub pid: Option<u32>,
}

impl Session {
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn mark_paused(&mut self) {
        self.status = SessionStatus::Paused;
        self.paused_at = Some(Utc::now());
    }

    pub fn mark_running(&mut self) {
        self.status = SessionStatus::Running;
        self.paused_at = None;
    }

    pub fn mark_stopped(&mut self, reason: impl Into<String>) {
        self.status = SessionStatus::Stopped;
        self.stopped_at = Some(Utc::now());
        self.stop_reason = Some(reason.into());
        self.pid = None;
    }

    pub fn mark_completed(&mut self) {
        self.status = SessionStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.pid = None;
    }
}

/// `<yyyymmdd>-<hhmmss>-<6 alphanumerics>`, sortable by creation time.
pub fn new_session_id(now: DateTime<Utc>) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect::<String>()
        .to_ascii_lowercase();
    format!("{}-{suffix}", now.format("%Y%m%d-%H%M%S"))
}

/// Storage for session records.
pub trait SessionBackend {
    fn load(&self, id: &str) -> Result<Option<Session>>;
    fn save(&self, session: &Session) -> Result<()>;
    fn list(&self) -> Result<Vec<Session>>;
}

/// One JSON file per session in a directory.
#[derive(Debug, Clone)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn session_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

impl SessionBackend for FileBackend {
    fn load(&self, id: &str) -> Result<Option<Session>> {
        let path = self.session_path(id);
        if !path.exists() {
            return Ok(None);
        }
        read_session(&path).map(Some)
    }

    fn save(&self, session: &Session) -> Result<()> {
        let path = self.session_path(&session.id);
        debug!(
            path = %path.display(),
            status = %session.status,
            iteration = session.iteration,
            "writing session"
        );
        let mut buf = serde_json::to_string_pretty(session).context("serialize session")?;
        buf.push('\n');
        write_atomic(&path, &buf)
    }

    fn list(&self) -> Result<Vec<Session>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut sessions = Vec::new();
        let entries = fs::read_dir(&self.dir)
            .with_context(|| format!("read sessions dir {}", self.dir.display()))?;
        for entry in entries {
            let path = entry.context("read sessions dir entry")?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                sessions.push(read_session(&path)?);
            }
        }
        Ok(sessions)
    }
}

fn read_session(path: &Path) -> Result<Session> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read session {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse session {}", path.display()))
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("session path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    let mut file = File::create(&tmp_path)
        .with_context(|| format!("create temp session {}", tmp_path.display()))?;
    file.write_all(contents.as_bytes())
        .and_then(|()| file.sync_all())
        .with_context(|| format!("write temp session {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace session {}", path.display()))?;
    Ok(())
}

/// Exclusive lock over a sessions directory, held while checking for an
/// active session and creating one. Released on drop.
#[derive(Debug)]
pub struct SessionsLock {
    file: File,
}

impl SessionsLock {
    pub fn acquire(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
        let path = dir.join(".lock");
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("open lock {}", path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("lock {}", path.display()))?;
        debug!(path = %path.display(), "sessions lock acquired");
        Ok(Self { file })
    }
}

impl Drop for SessionsLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            debug!(err = %err, "unlock sessions dir");
        }
    }
}

/// In-memory records with optional save-failure injection.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    sessions: Mutex<BTreeMap<String, Session>>,
    /// Saves still allowed before every later save fails.
    saves_left: Mutex<Option<usize>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let `count` more saves succeed, then fail every save after that.
    pub fn fail_saves_after(&self, count: usize) {
        if let Ok(mut left) = self.saves_left.lock() {
            *left = Some(count);
        }
    }
}

impl SessionBackend for MemoryBackend {
    fn load(&self, id: &str) -> Result<Option<Session>> {
        let sessions = self
            .sessions
            .lock()
            .map_err(|_| anyhow!("session map lock poisoned"))?;
        Ok(sessions.get(id).cloned())
    }

    fn save(&self, session: &Session) -> Result<()> {
        let mut left = self
            .saves_left
            .lock()
            .map_err(|_| anyhow!("save budget lock poisoned"))?;
        match left.as_mut() {
            Some(0) => return Err(anyhow!("injected save failure for {}", session.id)),
            Some(n) => *n -= 1,
            None => {}
        }
        self.sessions
            .lock()
            .map_err(|_| anyhow!("session map lock poisoned"))?
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    fn list(&self) -> Result<Vec<Session>> {
        let sessions = self
            .sessions
            .lock()
            .map_err(|_| anyhow!("session map lock poisoned"))?;
        Ok(sessions.values().cloned().collect())
    }
}

/// A start request found another live session for the project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlreadyRunningError {
    pub session_id: String,
    pub status: SessionStatus,
    pub pid: Option<u32>,
}

impl fmt::Display for AlreadyRunningError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session {} is already {}", self.session_id, self.status)?;
        if let Some(pid) = self.pid {
            write!(f, " (pid {pid})")?;
        }
        Ok(())
    }
}

impl std::error::Error for AlreadyRunningError {}

/// Session records for one or more projects.
#[derive(Debug)]
pub struct SessionStore<B> {
    backend: B,
}

impl<B: SessionBackend> SessionStore<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Create and persist a fresh `running` session.
    pub fn create(&self, new: NewSession, log_dir: &Path) -> Result<Session> {
        let now = Utc::now();
        let id = new_session_id(now);
        let session = Session {
            log_path: log_dir.join(format!("{id}.log")),
            id,
            project_id: new.project_id,
            mode: new.mode,
            status: SessionStatus::Running,
            pid: new.pid,
            iteration: 0,
            started_at: now,
            paused_at: None,
            stopped_at: None,
            completed_at: None,
            agent: new.agent,
            model: new.model,
            task: None,
            stop_reason: None,
            consecutive_failures: 0,
            last_failure: None,
        };
        self.save(&session)?;
        Ok(session)
    }

    pub fn save(&self, session: &Session) -> Result<()> {
        self.backend
            .save(session)
            .with_context(|| format!("persist session {}", session.id))
    }

    pub fn get(&self, id: &str) -> Result<Option<Session>> {
        self.backend.load(id)
    }

    /// The project's sessions, newest first.
    pub fn list(&self, project_id: &str) -> Result<Vec<Session>> {
        let mut sessions: Vec<Session> = self
            .backend
            .list()?
            .into_iter()
            .filter(|session| session.project_id == project_id)
            .collect();
        sessions.sort_by(|a, b| {
            b.started_at
                .cmp(&a.started_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(sessions)
    }

    /// Newest `running` or `paused` session for the project.
    pub fn active_for_project(&self, project_id: &str) -> Result<Option<Session>> {
        Ok(self
            .list(project_id)?
            .into_iter()
            .find(Session::is_active))
    }

    pub fn latest_for_project(&self, project_id: &str) -> Result<Option<Session>> {
        Ok(self.list(project_id)?.into_iter().next())
    }
}
