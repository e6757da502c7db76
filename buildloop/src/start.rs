//! Preparing a session for `buildloop start`.
//!
//! Configuration is loaded and the agent resolved before any session record is
//! written, so configuration errors never leave a session behind. At most one
//! session per project may be active with a live controller: a second start is
//! rejected with [`AlreadyRunningError`], while an active session whose
//! controller died is adopted and continues from its last persisted iteration.

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info};

use crate::core::types::{Mode, SessionStatus};
use crate::io::agents::{AgentInvocation, resolve_agent};
use crate::io::config::{ProjectConfig, load_config};
use crate::io::init::ProjectPaths;
use crate::io::session_store::{
    AlreadyRunningError, NewSession, Session, SessionBackend, SessionStore, SessionsLock,
};

/// A session ready to hand to the controller.
#[derive(Debug, Clone)]
pub struct PreparedSession {
    pub session: Session,
    pub config: ProjectConfig,
    pub agent: AgentInvocation,
    /// True when a stale session was taken over instead of creating one.
    pub adopted: bool,
}

/// Project id from config, falling back to the directory name.
pub fn project_id(paths: &ProjectPaths, config: &ProjectConfig) -> String {
    config
        .project_id
        .clone()
        .unwrap_or_else(|| paths.default_project_id())
}

/// Load config and resolve the agent. No session state is touched.
pub fn load_project(paths: &ProjectPaths) -> Result<(ProjectConfig, AgentInvocation)> {
    if !paths.state_dir.is_dir() {
        return Err(anyhow!(
            "{} is not initialised (run `buildloop init`)",
            paths.root.display()
        ));
    }
    let config = load_config(&paths.config_path)?;
    let agent = resolve_agent(&config)
        .with_context(|| format!("invalid config {}", paths.config_path.display()))?;
    Ok((config, agent))
}

/// Create, or adopt, the session a new controller (process `pid`) will run.
///
/// `is_alive` reports whether a recorded controller pid still exists. The
/// check and the create run under the sessions-directory lock, so concurrent
/// starts see each other's records.
pub fn prepare_session<B: SessionBackend>(
    paths: &ProjectPaths,
    store: &SessionStore<B>,
    mode: Mode,
    pid: u32,
    is_alive: impl Fn(u32) -> bool,
) -> Result<PreparedSession> {
    let (config, agent) = load_project(paths)?;
    let project_id = project_id(paths, &config);
    let _lock = SessionsLock::acquire(&paths.sessions_dir)?;

    if let Some(mut active) = store.active_for_project(&project_id)? {
        if let Some(owner) = active.pid.filter(|owner| *owner != pid && is_alive(*owner)) {
            return Err(AlreadyRunningError {
                session_id: active.id,
                status: active.status,
                pid: Some(owner),
            }
            .into());
        }

        if active.mode == mode {
            info!(
                session = %active.id,
                iteration = active.iteration,
                stale_pid = ?active.pid,
                "adopting session from a controller that exited"
            );
            if active.status == SessionStatus::Paused {
                active.mark_running();
            }
            active.pid = Some(pid);
            active.agent.clone_from(&agent.agent);
            active.model.clone_from(&agent.model);
            store.save(&active)?;
            return Ok(PreparedSession {
                session: active,
                config,
                agent,
                adopted: true,
            });
        }

        debug!(
            session = %active.id,
            mode = active.mode.as_str(),
            "closing stale session started in another mode"
        );
        active.mark_stopped("abandoned: controller exited");
        store.save(&active)?;
    }

    let session = store.create(
        NewSession {
            project_id,
            mode,
            agent: agent.agent.clone(),
            model: agent.model.clone(),
            pid: Some(pid),
        },
        &paths.logs_dir,
    )?;
    info!(session = %session.id, mode = mode.as_str(), "session created");
    Ok(PreparedSession {
        session,
        config,
        agent,
        adopted: false,
    })
}
