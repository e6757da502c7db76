//! One agent run: spawn, feed the prompt, classify.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::core::classifier::{AgentExit, classify, is_marker_line, tail};
use crate::core::types::{AgentFailure, AgentOutcome, FailureKind};
use crate::io::agents::AgentInvocation;
use crate::io::control::CancelToken;
use crate::io::process::{CommandRequest, CommandRunner, SpawnError};
use crate::io::session_log::SessionLog;

/// Bytes of output kept as failure detail when stderr is empty.
const DETAIL_TAIL_BYTES: usize = 4_000;

#[derive(Debug, Clone)]
pub struct AgentRequest<'a> {
    pub invocation: &'a AgentInvocation,
    pub prompt: &'a str,
    pub workdir: &'a Path,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    pub log: &'a SessionLog,
    pub cancel: &'a CancelToken,
}

/// How an agent run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentRun {
    Finished(AgentOutcome),
    /// A stop request killed the agent; no outcome was produced.
    Interrupted,
}

/// Run the agent once and classify its output.
///
/// Spawn failures are reported as `Failed(ProcessError)` so they count against
/// the retry ceiling like any other agent failure.
#[instrument(skip_all, fields(agent = %request.invocation.agent))]
pub fn run_agent<R: CommandRunner + ?Sized>(
    runner: &R,
    request: &AgentRequest<'_>,
) -> Result<AgentRun> {
    let command = &request.invocation.command;
    request.log.section(&format!("agent output: {command}"))?;

    let output = match runner.run(&CommandRequest {
        command,
        workdir: request.workdir,
        stdin: Some(request.prompt.as_bytes()),
        timeout: request.timeout,
        output_limit_bytes: request.output_limit_bytes,
        retain: Some(is_marker_line),
        tee: Some(request.log),
        cancel: request.cancel,
    }) {
        Ok(output) => output,
        Err(err) => {
            let Some(spawn) = err.downcast_ref::<SpawnError>() else {
                return Err(err);
            };
            warn!(error = %spawn, "agent failed to start");
            request.log.line(&format!("[{spawn}]"))?;
            let outcome = AgentOutcome::Failed(AgentFailure {
                kind: FailureKind::ProcessError { exit_code: None },
                detail: spawn.to_string(),
            });
            request.log.section(&format!("agent outcome: {}", outcome.label()))?;
            return Ok(AgentRun::Finished(outcome));
        }
    };

    if output.cancelled {
        request.log.section("agent interrupted")?;
        return Ok(AgentRun::Interrupted);
    }

    let text = output.output_text();
    let stderr = output.stderr_text();
    // Marker lines may have scrolled out of the kept tail.
    let scanned = match output.truncated {
        0 => text.clone(),
        _ => format!("{}{text}", String::from_utf8_lossy(&output.retained)),
    };
    let mut outcome = classify(AgentExit {
        exit_code: output.exit_code,
        timed_out: output.timed_out,
        output: &scanned,
        stderr: &stderr,
    });
    if let AgentOutcome::Failed(failure) = &mut outcome {
        if failure.detail.trim().is_empty() {
            failure.detail = tail(&text, DETAIL_TAIL_BYTES);
        } else {
            failure.detail = tail(&failure.detail, DETAIL_TAIL_BYTES);
        }
        if failure.kind == FailureKind::Timeout {
            request
                .log
                .line(&format!("[agent timed out after {}s]", request.timeout.as_secs()))?;
        }
    }

    info!(outcome = %outcome.label(), exit_code = ?output.exit_code, "agent finished");
    request
        .log
        .section(&format!("agent outcome: {}", outcome.label()))?;
    Ok(AgentRun::Finished(outcome))
}
