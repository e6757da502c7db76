//! Append-only per-session log under `.buildloop/logs/`.
//!
//! The log is line-oriented so it can be tailed while the loop runs. Each
//! iteration starts with a `=== iteration N ... ===` marker, followed by
//! `--- section ---` blocks for the prompt, raw agent output, and gates.
//!
//! This is a product artifact, separate from `tracing` diagnostics.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{SecondsFormat, Utc};
use tracing::warn;

/// Shared append handle. Clones write to the same file.
#[derive(Debug, Clone)]
pub struct SessionLog {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl SessionLog {
    /// Open (or create) the log for appending.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create log dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open session log {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append raw bytes and flush.
    pub fn append(&self, bytes: &[u8]) -> Result<()> {
        let mut file = self
            .file
            .lock()
            .map_err(|_| anyhow!("session log lock poisoned"))?;
        file.write_all(bytes)
            .and_then(|()| file.flush())
            .with_context(|| format!("append session log {}", self.path.display()))
    }

    /// Append `text`, adding a trailing newline if missing.
    pub fn line(&self, text: &str) -> Result<()> {
        if text.ends_with('\n') {
            self.append(text.as_bytes())
        } else {
            self.append(format!("{text}\n").as_bytes())
        }
    }

    pub fn iteration_header(&self, iteration: u32, task: Option<&str>) -> Result<()> {
        let at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        match task {
            Some(task) => self.line(&format!("=== iteration {iteration} task {task} at {at} ===")),
            None => self.line(&format!("=== iteration {iteration} at {at} ===")),
        }
    }

    pub fn section(&self, title: &str) -> Result<()> {
        self.line(&format!("--- {title} ---"))
    }

    /// Write a section header followed by its body.
    pub fn block(&self, title: &str, body: &str) -> Result<()> {
        self.section(title)?;
        if !body.is_empty() {
            self.line(body)?;
        }
        Ok(())
    }

    /// Tee live process output. Failures are reported but never abort the child.
    pub fn tee(&self, bytes: &[u8]) {
        if let Err(err) = self.append(bytes) {
            warn!(err = %err, "failed to tee output to session log");
        }
    }
}

/// Read the whole log. A missing log reads as empty.
///
/// Agent output is logged verbatim, so invalid UTF-8 is replaced rather than rejected.
pub fn read_log(path: &Path) -> Result<String> {
    if !path.exists() {
        return Ok(String::new());
    }
    let bytes = fs::read(path).with_context(|| format!("read session log {}", path.display()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Copy the log to `out`, then keep copying appended lines until `keep_going` returns false.
///
/// `keep_going` is checked whenever no new data is available. Bytes are copied
/// as logged, without UTF-8 validation.
pub fn follow_log<W: Write, F: FnMut() -> bool>(
    path: &Path,
    out: &mut W,
    poll_interval: Duration,
    mut keep_going: F,
) -> Result<()> {
    let file = File::open(path).with_context(|| format!("open session log {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let n = reader
            .read_until(b'\n', &mut buf)
            .context("read session log")?;
        if n > 0 {
            out.write_all(&buf).context("write log output")?;
            continue;
        }
        out.flush().context("flush log output")?;
        if !keep_going() {
            // Drain anything written between the last read and the stop decision.
            let mut rest = Vec::new();
            reader.read_to_end(&mut rest).context("read session log")?;
            out.write_all(&rest).context("write log output")?;
            return Ok(());
        }
        thread::sleep(poll_interval);
        // Re-sync in case the file was truncated externally.
        let pos = reader.stream_position().context("log position")?;
        let len = reader.get_ref().metadata().context("log metadata")?.len();
        if len < pos {
            reader.seek(SeekFrom::Start(0)).context("rewind session log")?;
        }
    }
}
