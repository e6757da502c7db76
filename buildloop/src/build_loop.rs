//! The build loop controller.
//!
//! One call to [`run_session`] drives a session until it reaches a terminal
//! status. Each iteration reads the plan, renders a prompt, runs the agent,
//! runs the gates when the agent reports done, applies the transition table,
//! bumps the iteration counter and persists the session. Operator requests are
//! observed at iteration boundaries and (for stop) while a child is running.

use std::fmt;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Result, bail};
use tracing::{error, info, instrument, warn};

use crate::core::transition::{LoopEvent, iteration_limit_reached, retries_remain, transition};
use crate::core::types::{AgentOutcome, FailureContext, Mode, SessionStatus};
use crate::exit_codes;
use crate::io::agent::{AgentRequest, AgentRun, run_agent};
use crate::io::agents::AgentInvocation;
use crate::io::config::ProjectConfig;
use crate::io::control::LoopControl;
use crate::io::gates::{GateRequest, GateRun, run_gates};
use crate::io::init::ProjectPaths;
use crate::io::plan::{read_current_task, read_plan, read_task_document};
use crate::io::process::CommandRunner;
use crate::io::prompt::{DEFAULT_PROMPT_BUDGET_BYTES, PromptBuilder, PromptInputs};
use crate::io::session_log::SessionLog;
use crate::io::session_store::{Session, SessionBackend, SessionStore};

const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Stop reason recorded when the iteration ceiling is hit.
pub const MAX_ITERATIONS_REASON: &str = "max iterations reached";

/// Build mode found nothing under "In Progress".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoTaskError {
    pub plan_path: PathBuf,
}

impl fmt::Display for NoTaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "no task in progress in {} (list one under an `In Progress` heading)",
            self.plan_path.display()
        )
    }
}

impl std::error::Error for NoTaskError {}

/// Static inputs for a session run.
#[derive(Debug, Clone, Copy)]
pub struct LoopRequest<'a> {
    pub paths: &'a ProjectPaths,
    pub config: &'a ProjectConfig,
    pub agent: &'a AgentInvocation,
}

/// Collaborators injected into the controller.
pub struct LoopDeps<'a, R: ?Sized, B> {
    pub runner: &'a R,
    pub store: &'a SessionStore<B>,
    pub control: &'a LoopControl,
}

/// Why [`run_session`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    /// Agent reported done and every gate passed.
    Completed,
    Blocked { reason: String },
    /// The retry ceiling was exceeded; `summary` describes the last failure.
    RetriesExhausted { summary: String },
    MaxIterations { max_iterations: u32 },
    /// Operator stop. `interrupted_work` is set when a child was killed.
    Stopped { interrupted_work: bool },
}

impl LoopStop {
    pub fn exit_code(&self) -> i32 {
        match self {
            LoopStop::Completed => exit_codes::OK,
            LoopStop::Blocked { .. } => exit_codes::BLOCKED,
            LoopStop::RetriesExhausted { .. } | LoopStop::MaxIterations { .. } => {
                exit_codes::EXHAUSTED
            }
            LoopStop::Stopped {
                interrupted_work: true,
            } => exit_codes::INTERRUPTED,
            LoopStop::Stopped {
                interrupted_work: false,
            } => exit_codes::OK,
        }
    }
}

impl fmt::Display for LoopStop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopStop::Completed => f.write_str("completed"),
            LoopStop::Blocked { reason } => write!(f, "blocked: {reason}"),
            LoopStop::RetriesExhausted { summary } => write!(f, "retries exhausted: {summary}"),
            LoopStop::MaxIterations { max_iterations } => {
                write!(f, "{MAX_ITERATIONS_REASON} ({max_iterations})")
            }
            LoopStop::Stopped {
                interrupted_work: true,
            } => f.write_str("stopped during an iteration"),
            LoopStop::Stopped {
                interrupted_work: false,
            } => f.write_str("stopped between iterations"),
        }
    }
}

/// Final state of a session run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub session: Session,
    pub stop: LoopStop,
    /// Iterations completed by this call.
    pub iterations_run: u32,
}

/// Progress notification after each completed iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationReport {
    pub iteration: u32,
    pub task_id: Option<String>,
    /// Agent outcome, or the failing gate.
    pub result: String,
    pub status: SessionStatus,
}

enum Verdict {
    Passed,
    Blocked(String),
    AgentFailed(FailureContext),
    GateFailed(FailureContext),
}

enum IterationEnd {
    Continue(IterationReport),
    Stop(IterationReport, LoopStop),
    Interrupted,
}

/// Drive `session` until it stops or completes.
///
/// Fatal errors (no task, persistence, runner failures) mark the session
/// stopped with the error as its reason, best effort, and are returned.
#[instrument(skip_all, fields(session = %session.id, mode = session.mode.as_str()))]
pub fn run_session<R, B, F>(
    request: &LoopRequest<'_>,
    deps: &LoopDeps<'_, R, B>,
    mut session: Session,
    mut on_iteration: F,
) -> Result<LoopOutcome>
where
    R: CommandRunner + ?Sized,
    B: SessionBackend,
    F: FnMut(&IterationReport),
{
    if session.status.is_terminal() {
        bail!("session {} is already {}", session.id, session.status);
    }
    let log = SessionLog::open(&session.log_path)?;
    let start_iteration = session.iteration;

    match drive(request, deps, &mut session, &log, &mut on_iteration) {
        Ok(stop) => {
            info!(stop = %stop, iteration = session.iteration, "session finished");
            Ok(LoopOutcome {
                iterations_run: session.iteration - start_iteration,
                session,
                stop,
            })
        }
        Err(err) => {
            error!("session failed: {err:#}");
            if let Err(log_err) = log.section(&format!("fatal: {err:#}")) {
                warn!(err = %log_err, "failed to log fatal error");
            }
            if !session.status.is_terminal() {
                session.mark_stopped(format!("error: {err:#}"));
                if let Err(save_err) = deps.store.save(&session) {
                    warn!("failed to record session stop: {save_err:#}");
                }
            }
            Err(err)
        }
    }
}

fn drive<R, B, F>(
    request: &LoopRequest<'_>,
    deps: &LoopDeps<'_, R, B>,
    session: &mut Session,
    log: &SessionLog,
    on_iteration: &mut F,
) -> Result<LoopStop>
where
    R: CommandRunner + ?Sized,
    B: SessionBackend,
    F: FnMut(&IterationReport),
{
    let control = deps.control;
    log.section(&format!(
        "session {} {} mode, agent {}, starting after iteration {}",
        session.id,
        session.mode.as_str(),
        request.agent.agent,
        session.iteration
    ))?;

    loop {
        control.poll_inbox()?;
        if control.stop_requested() {
            return finish(
                deps,
                session,
                log,
                LoopEvent::Stop,
                "stopped by operator",
                LoopStop::Stopped {
                    interrupted_work: false,
                },
            );
        }

        if control.pause_requested() {
            apply(session, log, LoopEvent::Pause, None)?;
            deps.store.save(session)?;
            while control.pause_requested() && !control.stop_requested() {
                thread::sleep(PAUSE_POLL_INTERVAL);
                control.poll_inbox()?;
            }
            if control.stop_requested() {
                return finish(
                    deps,
                    session,
                    log,
                    LoopEvent::Stop,
                    "stopped by operator",
                    LoopStop::Stopped {
                        interrupted_work: false,
                    },
                );
            }
            apply(session, log, LoopEvent::Resume, None)?;
            deps.store.save(session)?;
        }

        let max_iterations = request.config.max_iterations;
        if iteration_limit_reached(session.iteration, max_iterations) {
            return finish(
                deps,
                session,
                log,
                LoopEvent::IterationLimit,
                MAX_ITERATIONS_REASON,
                LoopStop::MaxIterations { max_iterations },
            );
        }

        match run_iteration(request, deps, session, log)? {
            IterationEnd::Continue(report) => {
                on_iteration(&report);
                if iteration_limit_reached(session.iteration, max_iterations) {
                    return finish(
                        deps,
                        session,
                        log,
                        LoopEvent::IterationLimit,
                        MAX_ITERATIONS_REASON,
                        LoopStop::MaxIterations { max_iterations },
                    );
                }
            }
            IterationEnd::Stop(report, stop) => {
                on_iteration(&report);
                return Ok(stop);
            }
            IterationEnd::Interrupted => {
                let reason =
                    format!("stopped by operator during iteration {}", session.iteration + 1);
                return finish(
                    deps,
                    session,
                    log,
                    LoopEvent::Stop,
                    reason,
                    LoopStop::Stopped {
                        interrupted_work: true,
                    },
                );
            }
        }
    }
}

fn run_iteration<R, B>(
    request: &LoopRequest<'_>,
    deps: &LoopDeps<'_, R, B>,
    session: &mut Session,
    log: &SessionLog,
) -> Result<IterationEnd>
where
    R: CommandRunner + ?Sized,
    B: SessionBackend,
{
    let paths = request.paths;
    let config = request.config;
    let iteration = session.iteration + 1;

    let task = read_current_task(paths)?;
    if session.mode == Mode::Build && task.is_none() {
        return Err(NoTaskError {
            plan_path: paths.plan_path.clone(),
        }
        .into());
    }
    let task_id = task.as_ref().map(|t| t.id.clone());
    if session.task.as_ref().map(|t| &t.id) != task_id.as_ref() {
        if session.consecutive_failures > 0 || session.last_failure.is_some() {
            info!(task = ?task_id, "task changed, resetting failure count");
        }
        session.consecutive_failures = 0;
        session.last_failure = None;
    }
    session.task = task.clone();

    log.iteration_header(iteration, task_id.as_deref())?;

    let task_document = match &task {
        Some(task) => read_task_document(paths, task)?,
        None => None,
    };
    let prompt = PromptBuilder::new(DEFAULT_PROMPT_BUDGET_BYTES, config.failure_context_limit_bytes)
        .build(&PromptInputs {
            mode: session.mode,
            project_id: session.project_id.clone(),
            task,
            task_document,
            plan: read_plan(paths)?,
            plan_path: ".buildloop/PLAN.md".to_string(),
            tasks_dir: ".buildloop/tasks".to_string(),
            failure: session.last_failure.clone(),
            attempt: session.consecutive_failures + 1,
            gates: config.gates.iter().map(|g| g.name.clone()).collect(),
        })?;
    log.block("prompt", &prompt)?;

    let cancel = deps.control.cancel_token();
    let outcome = match run_agent(
        deps.runner,
        &AgentRequest {
            invocation: request.agent,
            prompt: &prompt,
            workdir: &paths.root,
            timeout: config.iteration_timeout(),
            output_limit_bytes: config.output_limit_bytes,
            log,
            cancel: &cancel,
        },
    )? {
        AgentRun::Finished(outcome) => outcome,
        AgentRun::Interrupted => return Ok(IterationEnd::Interrupted),
    };

    let verdict = match &outcome {
        AgentOutcome::Done if session.mode == Mode::Plan => Verdict::Passed,
        AgentOutcome::Done => match run_gates(
            deps.runner,
            &config.gates,
            &GateRequest {
                workdir: &paths.root,
                timeout: config.gate_timeout(),
                output_limit_bytes: config.output_limit_bytes,
                log,
                cancel: &cancel,
            },
        )? {
            GateRun::Interrupted { .. } => return Ok(IterationEnd::Interrupted),
            GateRun::Finished(gate) if gate.succeeded => Verdict::Passed,
            GateRun::Finished(gate) => Verdict::GateFailed(FailureContext::from_gate(&gate)),
        },
        AgentOutcome::Blocked { reason } => Verdict::Blocked(reason.clone()),
        AgentOutcome::Failed(failure) => Verdict::AgentFailed(FailureContext::from_agent(failure)),
    };

    let mut result = outcome.label();
    let mut stop_reason = None;
    let mut stop = None;
    let event = match verdict {
        Verdict::Passed => {
            session.consecutive_failures = 0;
            session.last_failure = None;
            stop = Some(LoopStop::Completed);
            LoopEvent::GatesPassed
        }
        Verdict::Blocked(reason) => {
            result = format!("blocked: {reason}");
            stop_reason = Some(result.clone());
            stop = Some(LoopStop::Blocked { reason });
            LoopEvent::AgentBlocked
        }
        Verdict::AgentFailed(context) => {
            let remain = record_failure(session, config, context, &mut stop_reason, &mut stop);
            LoopEvent::AgentFailed {
                retries_remain: remain,
            }
        }
        Verdict::GateFailed(context) => {
            result = context.summary.clone();
            let remain = record_failure(session, config, context, &mut stop_reason, &mut stop);
            LoopEvent::GateFailed {
                retries_remain: remain,
            }
        }
    };

    apply(session, log, event, stop_reason)?;
    session.iteration = iteration;
    deps.store.save(session)?;

    let report = IterationReport {
        iteration,
        task_id,
        result,
        status: session.status,
    };
    Ok(match stop {
        Some(stop) => IterationEnd::Stop(report, stop),
        None => IterationEnd::Continue(report),
    })
}

/// Count a failed attempt and carry its context forward.
///
/// Returns whether another attempt is allowed; when not, fills in the stop.
fn record_failure(
    session: &mut Session,
    config: &ProjectConfig,
    context: FailureContext,
    stop_reason: &mut Option<String>,
    stop: &mut Option<LoopStop>,
) -> bool {
    session.consecutive_failures += 1;
    let remain = retries_remain(session.consecutive_failures, config.max_retries);
    if !remain {
        *stop_reason = Some(format!("retries exhausted: {}", context.summary));
        *stop = Some(LoopStop::RetriesExhausted {
            summary: context.summary.clone(),
        });
    }
    session.last_failure = Some(context);
    remain
}

/// Apply `event` through the transition table and stamp the session.
fn apply(
    session: &mut Session,
    log: &SessionLog,
    event: LoopEvent,
    stop_reason: Option<String>,
) -> Result<()> {
    let from = session.status;
    let next = transition(from, event)?;
    match next {
        SessionStatus::Running => session.mark_running(),
        SessionStatus::Paused => session.mark_paused(),
        SessionStatus::Stopped => {
            session.mark_stopped(stop_reason.unwrap_or_else(|| event.to_string()));
        }
        SessionStatus::Completed => session.mark_completed(),
    }
    info!(%from, to = %next, %event, "session transition");
    log.section(&format!("transition {from} -> {next} ({event})"))
}

fn finish<R: ?Sized, B: SessionBackend>(
    deps: &LoopDeps<'_, R, B>,
    session: &mut Session,
    log: &SessionLog,
    event: LoopEvent,
    reason: impl Into<String>,
    stop: LoopStop,
) -> Result<LoopStop> {
    apply(session, log, event, Some(reason.into()))?;
    deps.store.save(session)?;
    Ok(stop)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::fs;

    use super::*;
    use crate::core::types::FailureSource;
    use crate::io::config::GateSpec;
    use crate::io::control::{ControlRequest, send_request};
    use crate::io::process::CommandSpec;
    use crate::io::session_store::{MemoryBackend, NewSession};
    use crate::test_support::{ScriptedCommand, ScriptedRunner, TestProject};

    const DONE: &str = "all good\n<TASK_DONE>\n";

    struct Harness {
        project: TestProject,
        config: ProjectConfig,
        agent: AgentInvocation,
        store: SessionStore<MemoryBackend>,
        control: LoopControl,
    }

    impl Harness {
        fn new(config: ProjectConfig) -> Self {
            let project = TestProject::new().expect("project");
            project
                .write_plan_with_task("001-first-task")
                .expect("plan");
            Self {
                project,
                config,
                agent: AgentInvocation {
                    agent: "fake".to_string(),
                    model: None,
                    command: CommandSpec {
                        program: "agent".to_string(),
                        args: Vec::new(),
                        env: BTreeMap::new(),
                    },
                },
                store: SessionStore::new(MemoryBackend::new()),
                control: LoopControl::new(),
            }
        }

        fn session(&self, mode: Mode) -> Session {
            self.store
                .create(
                    NewSession {
                        project_id: "demo".to_string(),
                        mode,
                        agent: "fake".to_string(),
                        model: None,
                        pid: Some(1),
                    },
                    &self.project.paths().logs_dir,
                )
                .expect("create session")
        }

        fn run(&self, runner: &ScriptedRunner, session: Session) -> Result<LoopOutcome> {
            run_session(
                &LoopRequest {
                    paths: self.project.paths(),
                    config: &self.config,
                    agent: &self.agent,
                },
                &LoopDeps {
                    runner,
                    store: &self.store,
                    control: &self.control,
                },
                session,
                |_| {},
            )
        }

        fn stored(&self, id: &str) -> Session {
            self.store.get(id).expect("get").expect("stored session")
        }
    }

    fn gated(names: &[&str]) -> ProjectConfig {
        ProjectConfig {
            gates: names
                .iter()
                .map(|name| GateSpec {
                    name: (*name).to_string(),
                    command: vec![format!("gate-{name}")],
                })
                .collect(),
            ..ProjectConfig::default()
        }
    }

    #[test]
    fn done_with_passing_gates_completes() {
        let h = Harness::new(gated(&["fmt", "test"]));
        let runner = ScriptedRunner::new(vec![
            ScriptedCommand::exit(0, DONE),
            ScriptedCommand::exit(0, "fmt ok"),
            ScriptedCommand::exit(0, "tests ok"),
        ]);
        let session = h.session(Mode::Build);
        let id = session.id.clone();

        let outcome = h.run(&runner, session).expect("run");

        assert_eq!(outcome.stop, LoopStop::Completed);
        assert_eq!(outcome.stop.exit_code(), exit_codes::OK);
        assert_eq!(outcome.iterations_run, 1);
        assert_eq!(runner.programs(), vec!["agent", "gate-fmt", "gate-test"]);
        let stored = h.stored(&id);
        assert_eq!(stored.status, SessionStatus::Completed);
        assert_eq!(stored.iteration, 1);
        assert_eq!(stored.pid, None);
        assert!(stored.completed_at.is_some());
        assert_eq!(stored.task.map(|t| t.id).as_deref(), Some("001-first-task"));
    }

    #[test]
    fn prompt_and_transition_are_logged() {
        let h = Harness::new(gated(&["test"]));
        let runner = ScriptedRunner::new(vec![
            ScriptedCommand::exit(0, DONE),
            ScriptedCommand::exit(0, "ok"),
        ]);
        let session = h.session(Mode::Build);
        let log_path = session.log_path.clone();
        h.run(&runner, session).expect("run");

        let log = fs::read_to_string(log_path).expect("log");
        assert!(log.contains("=== iteration 1 task 001-first-task at "));
        assert!(log.contains("--- prompt ---"));
        assert!(log.contains("all good\n<TASK_DONE>\n"));
        assert!(log.contains("--- gate test exit 0 ---"));
        assert!(log.contains("--- transition running -> completed (gates passed) ---"));
        let prompt = &runner.calls()[0].stdin;
        assert!(prompt.as_deref().is_some_and(|p| p.contains("First Task")));
    }

    #[test]
    fn blocked_stops_without_running_gates() {
        let h = Harness::new(gated(&["test"]));
        let runner = ScriptedRunner::new(vec![ScriptedCommand::exit(
            0,
            "<TASK_DONE>\n<TASK_BLOCKED reason=\"missing dep\">\n",
        )]);
        let session = h.session(Mode::Build);
        let id = session.id.clone();

        let outcome = h.run(&runner, session).expect("run");

        assert_eq!(
            outcome.stop,
            LoopStop::Blocked {
                reason: "missing dep".to_string()
            }
        );
        assert_eq!(outcome.stop.exit_code(), exit_codes::BLOCKED);
        assert_eq!(runner.programs(), vec!["agent"]);
        let stored = h.stored(&id);
        assert_eq!(stored.status, SessionStatus::Stopped);
        assert_eq!(stored.stop_reason.as_deref(), Some("blocked: missing dep"));
        assert_eq!(stored.iteration, 1);
    }

    #[test]
    fn gate_failure_is_fed_into_next_prompt() {
        let h = Harness::new(gated(&["test"]));
        let runner = ScriptedRunner::new(vec![
            ScriptedCommand::exit(0, DONE),
            ScriptedCommand::exit(1, "assertion `left == right` failed"),
            ScriptedCommand::exit(0, DONE),
            ScriptedCommand::exit(0, "ok"),
        ]);
        let session = h.session(Mode::Build);
        let id = session.id.clone();

        let outcome = h.run(&runner, session).expect("run");

        assert_eq!(outcome.stop, LoopStop::Completed);
        let calls = runner.calls();
        let first = calls[0].stdin.clone().expect("first prompt");
        let second = calls[2].stdin.clone().expect("second prompt");
        assert!(!first.contains("Previous Attempt Failed"));
        assert!(second.contains("gate test failed (exit 1)"));
        assert!(second.contains("assertion `left == right` failed"));
        assert!(second.contains("attempt: 2"));

        let stored = h.stored(&id);
        assert_eq!(stored.iteration, 2);
        assert_eq!(stored.consecutive_failures, 0);
        assert_eq!(stored.last_failure, None);
    }

    #[test]
    fn gate_failures_exhaust_retries() {
        let h = Harness::new(ProjectConfig {
            max_retries: 1,
            ..gated(&["test"])
        });
        let runner = ScriptedRunner::new(vec![
            ScriptedCommand::exit(0, DONE),
            ScriptedCommand::exit(1, "red"),
            ScriptedCommand::exit(0, DONE),
            ScriptedCommand::exit(1, "still red"),
        ]);
        let session = h.session(Mode::Build);
        let id = session.id.clone();

        let outcome = h.run(&runner, session).expect("run");

        assert_eq!(
            outcome.stop,
            LoopStop::RetriesExhausted {
                summary: "gate test failed (exit 1)".to_string()
            }
        );
        assert_eq!(outcome.stop.exit_code(), exit_codes::EXHAUSTED);
        runner.assert_drained().expect("drained");
        let stored = h.stored(&id);
        assert_eq!(stored.status, SessionStatus::Stopped);
        assert_eq!(stored.iteration, 2);
        assert_eq!(stored.consecutive_failures, 2);
        assert_eq!(
            stored.last_failure.map(|f| f.source),
            Some(FailureSource::Gate)
        );
    }

    #[test]
    fn agent_and_gate_failures_share_one_counter() {
        let h = Harness::new(ProjectConfig {
            max_retries: 1,
            ..gated(&["test"])
        });
        let runner = ScriptedRunner::new(vec![
            ScriptedCommand::exit_with_stderr(1, "", "crash\n"),
            ScriptedCommand::exit(0, DONE),
            ScriptedCommand::exit(1, "red"),
        ]);
        let outcome = h.run(&runner, h.session(Mode::Build)).expect("run");
        assert!(matches!(outcome.stop, LoopStop::RetriesExhausted { .. }));
        assert_eq!(outcome.session.iteration, 2);
        let second = runner.calls()[1].stdin.clone().expect("prompt");
        assert!(second.contains("agent run failed: process error (exit 1)"));
        assert!(second.contains("crash"));
    }

    #[test]
    fn ambiguous_output_is_retried_not_accepted() {
        let h = Harness::new(ProjectConfig::default());
        let runner = ScriptedRunner::new(vec![
            ScriptedCommand::exit(0, "i think i did it"),
            ScriptedCommand::exit(0, DONE),
        ]);
        let outcome = h.run(&runner, h.session(Mode::Build)).expect("run");
        assert_eq!(outcome.stop, LoopStop::Completed);
        assert_eq!(outcome.session.iteration, 2);
    }

    #[test]
    fn iteration_ceiling_stops_the_session() {
        let h = Harness::new(ProjectConfig {
            max_iterations: 2,
            max_retries: 10,
            ..ProjectConfig::default()
        });
        let runner = ScriptedRunner::new(vec![
            ScriptedCommand::exit(0, "no marker"),
            ScriptedCommand::exit(0, "no marker"),
        ]);
        let session = h.session(Mode::Build);
        let id = session.id.clone();

        let outcome = h.run(&runner, session).expect("run");

        assert_eq!(outcome.stop, LoopStop::MaxIterations { max_iterations: 2 });
        let stored = h.stored(&id);
        assert_eq!(stored.status, SessionStatus::Stopped);
        assert_eq!(stored.iteration, 2);
        assert_eq!(stored.stop_reason.as_deref(), Some(MAX_ITERATIONS_REASON));
    }

    #[test]
    fn adopted_session_at_ceiling_runs_nothing() {
        let h = Harness::new(ProjectConfig {
            max_iterations: 3,
            ..ProjectConfig::default()
        });
        let mut session = h.session(Mode::Build);
        session.iteration = 3;
        let runner = ScriptedRunner::new(Vec::new());
        let outcome = h.run(&runner, session).expect("run");
        assert_eq!(outcome.stop, LoopStop::MaxIterations { max_iterations: 3 });
        assert_eq!(outcome.iterations_run, 0);
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn missing_task_is_fatal_and_recorded() {
        let h = Harness::new(ProjectConfig::default());
        h.project.write_plan("# Plan\n\n## In Progress\n\n").expect("plan");
        let runner = ScriptedRunner::new(Vec::new());
        let session = h.session(Mode::Build);
        let id = session.id.clone();

        let err = h.run(&runner, session).unwrap_err();

        assert!(err.downcast_ref::<NoTaskError>().is_some());
        assert!(runner.calls().is_empty());
        let stored = h.stored(&id);
        assert_eq!(stored.status, SessionStatus::Stopped);
        assert!(
            stored
                .stop_reason
                .is_some_and(|reason| reason.contains("no task in progress"))
        );
    }

    #[test]
    fn stop_between_iterations_exits_cleanly() {
        let h = Harness::new(ProjectConfig::default());
        let control = h.control.clone();
        let runner = ScriptedRunner::new(vec![
            ScriptedCommand::exit(0, "no marker").with_hook(move || control.request_stop()),
        ]);
        let session = h.session(Mode::Build);
        let id = session.id.clone();

        let outcome = h.run(&runner, session).expect("run");

        assert_eq!(
            outcome.stop,
            LoopStop::Stopped {
                interrupted_work: false
            }
        );
        assert_eq!(outcome.stop.exit_code(), exit_codes::OK);
        let stored = h.stored(&id);
        assert_eq!(stored.status, SessionStatus::Stopped);
        assert_eq!(stored.iteration, 1);
        assert_eq!(stored.stop_reason.as_deref(), Some("stopped by operator"));
    }

    #[test]
    fn stop_during_agent_run_does_not_count_the_iteration() {
        let h = Harness::new(ProjectConfig::default());
        let runner = ScriptedRunner::new(vec![ScriptedCommand::cancelled("halfway")]);
        let session = h.session(Mode::Build);
        let id = session.id.clone();

        let outcome = h.run(&runner, session).expect("run");

        assert_eq!(
            outcome.stop,
            LoopStop::Stopped {
                interrupted_work: true
            }
        );
        assert_eq!(outcome.stop.exit_code(), exit_codes::INTERRUPTED);
        let stored = h.stored(&id);
        assert_eq!(stored.status, SessionStatus::Stopped);
        assert_eq!(stored.iteration, 0);
        assert_eq!(stored.pid, None);
    }

    #[test]
    fn stop_during_gate_is_interrupted_work() {
        let h = Harness::new(gated(&["test"]));
        let runner = ScriptedRunner::new(vec![
            ScriptedCommand::exit(0, DONE),
            ScriptedCommand::cancelled(""),
        ]);
        let outcome = h.run(&runner, h.session(Mode::Build)).expect("run");
        assert_eq!(
            outcome.stop,
            LoopStop::Stopped {
                interrupted_work: true
            }
        );
        assert_eq!(outcome.session.iteration, 0);
    }

    #[test]
    fn failed_persist_keeps_last_good_iteration() {
        let h = Harness::new(ProjectConfig {
            max_retries: 10,
            ..ProjectConfig::default()
        });
        let session = h.session(Mode::Build);
        let id = session.id.clone();
        h.store.backend().fail_saves_after(1);
        let runner = ScriptedRunner::new(vec![
            ScriptedCommand::exit(0, "no marker"),
            ScriptedCommand::exit(0, "no marker"),
        ]);

        let err = h.run(&runner, session).unwrap_err();

        assert!(format!("{err:#}").contains("injected save failure"));
        let stored = h.stored(&id);
        assert_eq!(stored.iteration, 1);
        assert_eq!(stored.status, SessionStatus::Running);
    }

    #[test]
    fn task_change_resets_failure_count() {
        let h = Harness::new(ProjectConfig {
            max_retries: 1,
            ..ProjectConfig::default()
        });
        let plan_path = h.project.paths().plan_path.clone();
        let runner = ScriptedRunner::new(vec![
            ScriptedCommand::exit(1, "nope").with_hook(move || {
                fs::write(
                    &plan_path,
                    "## In Progress\n- [ ] tasks/002-second-task.md\n",
                )
                .expect("rewrite plan");
            }),
            ScriptedCommand::exit(1, "nope again"),
            ScriptedCommand::exit(0, DONE),
        ]);

        let outcome = h.run(&runner, h.session(Mode::Build)).expect("run");

        assert_eq!(outcome.stop, LoopStop::Completed);
        assert_eq!(outcome.session.iteration, 3);
        let second = runner.calls()[1].stdin.clone().expect("prompt");
        assert!(second.contains("002-second-task"));
        assert!(!second.contains("Previous Attempt Failed"));
    }

    #[test]
    fn plan_mode_skips_gates_and_needs_no_task() {
        let h = Harness::new(gated(&["test"]));
        h.project.write_plan("# Plan\n").expect("plan");
        let runner = ScriptedRunner::new(vec![ScriptedCommand::exit(0, DONE)]);

        let outcome = h.run(&runner, h.session(Mode::Plan)).expect("run");

        assert_eq!(outcome.stop, LoopStop::Completed);
        assert_eq!(runner.programs(), vec!["agent"]);
        let prompt = runner.calls()[0].stdin.clone().expect("prompt");
        assert!(prompt.contains("### Planning Contract"));
    }

    #[test]
    fn pause_waits_for_resume_at_boundary() {
        let h = Harness::new(ProjectConfig::default());
        let control = h.control.clone();
        let runner = ScriptedRunner::new(vec![
            ScriptedCommand::exit(0, "no marker").with_hook(move || {
                control.request_pause();
                let control = control.clone();
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(300));
                    control.request_resume();
                });
            }),
            ScriptedCommand::exit(0, DONE),
        ]);
        let session = h.session(Mode::Build);
        let log_path = session.log_path.clone();

        let outcome = h.run(&runner, session).expect("run");

        assert_eq!(outcome.stop, LoopStop::Completed);
        assert_eq!(outcome.session.paused_at, None);
        let log = fs::read_to_string(log_path).expect("log");
        assert!(log.contains("transition running -> paused (pause)"));
        assert!(log.contains("transition paused -> running (resume)"));
    }

    #[test]
    fn stop_while_paused_stops_cleanly() {
        let h = Harness::new(ProjectConfig::default());
        let control = h.control.clone();
        let runner = ScriptedRunner::new(vec![
            ScriptedCommand::exit(0, "no marker").with_hook(move || {
                control.request_pause();
                let control = control.clone();
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(300));
                    control.request_stop();
                });
            }),
        ]);
        let session = h.session(Mode::Build);
        let log_path = session.log_path.clone();

        let outcome = h.run(&runner, session).expect("run");

        assert_eq!(
            outcome.stop,
            LoopStop::Stopped {
                interrupted_work: false
            }
        );
        assert_eq!(outcome.session.status, SessionStatus::Stopped);
        let log = fs::read_to_string(log_path).expect("log");
        assert!(log.contains("transition paused -> stopped (stop)"));
    }

    #[test]
    fn inbox_stop_is_honoured_at_boundary() {
        let mut h = Harness::new(ProjectConfig::default());
        let session = h.session(Mode::Build);
        let inbox = h.project.paths().control_path(&session.id);
        h.control = LoopControl::with_inbox(&inbox);
        let runner = ScriptedRunner::new(vec![
            ScriptedCommand::exit(0, "no marker").with_hook(move || {
                send_request(&inbox, ControlRequest::Stop).expect("send stop");
            }),
        ]);

        let outcome = h.run(&runner, session).expect("run");

        assert_eq!(
            outcome.stop,
            LoopStop::Stopped {
                interrupted_work: false
            }
        );
        assert_eq!(outcome.session.iteration, 1);
    }

    #[test]
    fn terminal_session_is_rejected() {
        let h = Harness::new(ProjectConfig::default());
        let mut session = h.session(Mode::Build);
        session.mark_completed();
        let runner = ScriptedRunner::new(Vec::new());
        let err = h.run(&runner, session).unwrap_err();
        assert!(err.to_string().contains("already completed"));
    }

    #[test]
    fn iteration_reports_are_emitted() {
        let h = Harness::new(gated(&["test"]));
        let runner = ScriptedRunner::new(vec![
            ScriptedCommand::exit(0, DONE),
            ScriptedCommand::exit(2, "lint"),
            ScriptedCommand::exit(0, DONE),
            ScriptedCommand::exit(0, "ok"),
        ]);
        let mut reports = Vec::new();
        run_session(
            &LoopRequest {
                paths: h.project.paths(),
                config: &h.config,
                agent: &h.agent,
            },
            &LoopDeps {
                runner: &runner,
                store: &h.store,
                control: &h.control,
            },
            h.session(Mode::Build),
            |report| reports.push(report.clone()),
        )
        .expect("run");

        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].result, "gate test failed (exit 2)");
        assert_eq!(reports[0].status, SessionStatus::Running);
        assert_eq!(reports[1].result, "done");
        assert_eq!(reports[1].status, SessionStatus::Completed);
    }
}
