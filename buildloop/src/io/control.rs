//! Operator control of a running session: stop, pause, resume.
//!
//! Requests reach the controller three ways:
//!
//! - SIGINT/SIGTERM, via [`install_signal_handler`], set the stop flag;
//! - `buildloop pause|resume|stop` write a one-word request into the session's
//!   control inbox file, which the controller drains at iteration boundaries;
//! - in-process callers (tests) use the [`LoopControl`] methods directly.
//!
//! The stop flag is a [`CancelToken`] shared with child-process waits so a
//! stop interrupts a running agent or gate immediately.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, warn};

/// Cloneable cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A request written into the control inbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    Pause,
    Resume,
    Stop,
}

impl ControlRequest {
    pub fn as_str(self) -> &'static str {
        match self {
            ControlRequest::Pause => "pause",
            ControlRequest::Resume => "resume",
            ControlRequest::Stop => "stop",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "pause" => Some(ControlRequest::Pause),
            "resume" => Some(ControlRequest::Resume),
            "stop" => Some(ControlRequest::Stop),
            _ => None,
        }
    }
}

/// Control state observed by the controller. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct LoopControl {
    stop: CancelToken,
    pause: Arc<AtomicBool>,
    inbox: Option<PathBuf>,
}

impl LoopControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also accept requests written to `path` (see [`send_request`]).
    pub fn with_inbox(path: impl Into<PathBuf>) -> Self {
        Self {
            inbox: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.stop.clone()
    }

    pub fn request_stop(&self) {
        self.stop.cancel();
    }

    pub fn request_pause(&self) {
        self.pause.store(true, Ordering::SeqCst);
    }

    pub fn request_resume(&self) {
        self.pause.store(false, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn pause_requested(&self) -> bool {
        self.pause.load(Ordering::SeqCst)
    }

    /// Drain the inbox file, applying any request it holds.
    ///
    /// Unknown contents are discarded with a warning.
    pub fn poll_inbox(&self) -> Result<()> {
        let Some(path) = &self.inbox else {
            return Ok(());
        };
        if !path.exists() {
            return Ok(());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read control inbox {}", path.display()))?;
        fs::remove_file(path)
            .with_context(|| format!("remove control inbox {}", path.display()))?;

        match ControlRequest::parse(&raw) {
            Some(request) => {
                debug!(request = request.as_str(), "control request received");
                self.apply(request);
            }
            None => warn!(contents = %raw.trim(), "ignoring unknown control request"),
        }
        Ok(())
    }

    pub fn apply(&self, request: ControlRequest) {
        match request {
            ControlRequest::Pause => self.request_pause(),
            ControlRequest::Resume => self.request_resume(),
            ControlRequest::Stop => self.request_stop(),
        }
    }
}

/// Write a request into a session's control inbox (temp file + rename).
pub fn send_request(inbox: &Path, request: ControlRequest) -> Result<()> {
    let parent = inbox
        .parent()
        .with_context(|| format!("control inbox missing parent {}", inbox.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = inbox.with_extension("control.tmp");
    fs::write(&tmp_path, format!("{}\n", request.as_str()))
        .with_context(|| format!("write {}", tmp_path.display()))?;
    fs::rename(&tmp_path, inbox).with_context(|| format!("replace {}", inbox.display()))?;
    Ok(())
}

/// Route SIGINT/SIGTERM to `control`'s stop flag.
///
/// Can only be installed once per process.
pub fn install_signal_handler(control: &LoopControl) -> Result<()> {
    let stop = control.cancel_token();
    ctrlc::set_handler(move || {
        if !stop.is_cancelled() {
            info!("interrupt received, stopping session");
        }
        stop.cancel();
    })
    .map_err(|err| anyhow!("install signal handler: {err}"))
}

/// Whether a process with this id still exists.
///
/// Platforms without a cheap check report every pid as alive.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;

    let Some(pid) = unix_pid(pid) else {
        return false;
    };
    // EPERM: it exists but belongs to someone else.
    matches!(kill(pid, None), Ok(()) | Err(Errno::EPERM))
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    true
}

/// Ask a controller process to stop (SIGTERM). A no-op off Unix.
#[cfg(unix)]
pub fn signal_stop(pid: u32) -> Result<()> {
    use nix::sys::signal::{Signal, kill};

    let target = unix_pid(pid).ok_or_else(|| anyhow!("invalid pid {pid}"))?;
    kill(target, Signal::SIGTERM).with_context(|| format!("send SIGTERM to {pid}"))?;
    debug!(pid, "sent SIGTERM");
    Ok(())
}

#[cfg(not(unix))]
pub fn signal_stop(_pid: u32) -> Result<()> {
    Ok(())
}

/// A positive pid; 0 and out-of-range ids would address process groups.
#[cfg(unix)]
fn unix_pid(pid: u32) -> Option<nix::unistd::Pid> {
    i32::try_from(pid)
        .ok()
        .filter(|raw| *raw > 0)
        .map(nix::unistd::Pid::from_raw)
}
