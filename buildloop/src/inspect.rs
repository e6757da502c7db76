//! Read-side commands: `status`, `list`, `logs`, and control delivery for
//! `pause`, `resume` and `stop`.

use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, warn};

use crate::io::control::{ControlRequest, pid_alive, send_request, signal_stop};
use crate::io::init::ProjectPaths;
use crate::io::session_log::{follow_log, read_log};
use crate::io::session_store::{Session, SessionBackend, SessionStore};

const FOLLOW_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// The named session, or the project's newest one.
pub fn find_session<B: SessionBackend>(
    store: &SessionStore<B>,
    project_id: &str,
    id: Option<&str>,
) -> Result<Session> {
    match id {
        Some(id) => store
            .get(id)?
            .ok_or_else(|| anyhow!("no session with id '{id}'")),
        None => store
            .latest_for_project(project_id)?
            .ok_or_else(|| anyhow!("no sessions for project '{project_id}'")),
    }
}

/// Multi-line human-readable description of a session.
pub fn format_status(session: &Session) -> String {
    let mut out = String::new();
    let status = match session.pid {
        Some(pid) if session.is_active() && !pid_alive(pid) => {
            format!("{} (pid {pid}, controller not running)", session.status)
        }
        Some(pid) => format!("{} (pid {pid})", session.status),
        None => session.status.to_string(),
    };
    out.push_str(&format!("session    {}\n", session.id));
    out.push_str(&format!("project    {}\n", session.project_id));
    out.push_str(&format!("mode       {}\n", session.mode.as_str()));
    out.push_str(&format!("status     {status}\n"));
    out.push_str(&format!("iteration  {}\n", session.iteration));
    if let Some(task) = &session.task {
        out.push_str(&format!("task       {} ({})\n", task.id, task.title()));
    }
    match &session.model {
        Some(model) => out.push_str(&format!("agent      {} (model {model})\n", session.agent)),
        None => out.push_str(&format!("agent      {}\n", session.agent)),
    }
    let stamp = |at: &DateTime<Utc>| at.to_rfc3339_opts(SecondsFormat::Secs, true);
    out.push_str(&format!("started    {}\n", stamp(&session.started_at)));
    if let Some(at) = &session.paused_at {
        out.push_str(&format!("paused     {}\n", stamp(at)));
    }
    if let Some(at) = &session.stopped_at {
        out.push_str(&format!("stopped    {}\n", stamp(at)));
    }
    if let Some(at) = &session.completed_at {
        out.push_str(&format!("completed  {}\n", stamp(at)));
    }
    if let Some(reason) = &session.stop_reason {
        out.push_str(&format!("reason     {reason}\n"));
    }
    if session.consecutive_failures > 0 {
        let last = session
            .last_failure
            .as_ref()
            .map_or("", |failure| failure.summary.as_str());
        out.push_str(&format!(
            "failures   {} in a row ({last})\n",
            session.consecutive_failures
        ));
    }
    out.push_str(&format!("log        {}\n", session.log_path.display()));
    out
}

/// One line per session, newest first.
pub fn format_list(sessions: &[Session]) -> String {
    let mut out = String::new();
    for session in sessions {
        let task = session.task.as_ref().map_or("-", |task| task.id.as_str());
        out.push_str(&format!(
            "{}  {:<9} {:<5} iter {:>3}  {}\n",
            session.id,
            session.status.as_str(),
            session.mode.as_str(),
            session.iteration,
            task
        ));
    }
    out
}

/// Write a session's log to `out`; with `follow`, keep tailing while it is active.
pub fn write_logs<B: SessionBackend, W: Write>(
    store: &SessionStore<B>,
    session: &Session,
    follow: bool,
    out: &mut W,
) -> Result<()> {
    if !follow {
        let contents = read_log(&session.log_path)?;
        out.write_all(contents.as_bytes())
            .context("write log output")?;
        return Ok(());
    }
    if !session.log_path.exists() {
        return Err(anyhow!(
            "log {} does not exist yet",
            session.log_path.display()
        ));
    }
    let id = session.id.clone();
    follow_log(&session.log_path, out, FOLLOW_POLL_INTERVAL, || {
        match store.get(&id) {
            Ok(Some(current)) => current.is_active(),
            Ok(None) => false,
            Err(err) => {
                warn!(err = %err, "stop following: cannot read session");
                false
            }
        }
    })
}

/// Deliver `request` to the project's active session and return it.
///
/// `stop` also sends SIGTERM to a live controller so a running child is
/// interrupted immediately instead of at the next iteration boundary.
pub fn deliver_request<B: SessionBackend>(
    paths: &ProjectPaths,
    store: &SessionStore<B>,
    project_id: &str,
    request: ControlRequest,
) -> Result<Session> {
    let session = store
        .active_for_project(project_id)?
        .ok_or_else(|| anyhow!("no active session for project '{project_id}'"))?;
    send_request(&paths.control_path(&session.id), request)?;
    debug!(session = %session.id, request = request.as_str(), "control request written");

    if request == ControlRequest::Stop {
        if let Some(pid) = session.pid.filter(|pid| pid_alive(*pid)) {
            signal_stop(pid)?;
        }
    }
    Ok(session)
}
