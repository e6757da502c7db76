//! Fail-fast verification gates.
//!
//! Gates run in configured order after the agent reports done. The first
//! failing gate ends the run and its output becomes the corrective context for
//! the next attempt; later gates are never started.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, instrument, warn};

use crate::core::types::GateResult;
use crate::io::config::GateSpec;
use crate::io::control::CancelToken;
use crate::io::process::{CommandRequest, CommandRunner, CommandSpec, SpawnError};
use crate::io::session_log::SessionLog;

#[derive(Debug, Clone)]
pub struct GateRequest<'a> {
    pub workdir: &'a Path,
    /// Budget for each gate.
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    pub log: &'a SessionLog,
    pub cancel: &'a CancelToken,
}

/// How a gate run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateRun {
    /// The first failing gate's result, or [`GateResult::all_passed`].
    Finished(GateResult),
    /// A stop request killed the named gate.
    Interrupted { gate_name: String },
}

/// Run `gates` in order, stopping at the first failure.
#[instrument(skip_all, fields(gates = gates.len()))]
pub fn run_gates<R: CommandRunner + ?Sized>(
    runner: &R,
    gates: &[GateSpec],
    request: &GateRequest<'_>,
) -> Result<GateRun> {
    for gate in gates {
        let command = CommandSpec::from_argv(&gate.command)?;
        request
            .log
            .section(&format!("gate {}: {}", gate.name, command))?;

        let result = match runner.run(&CommandRequest {
            command: &command,
            workdir: request.workdir,
            stdin: None,
            timeout: request.timeout,
            output_limit_bytes: request.output_limit_bytes,
            retain: None,
            tee: Some(request.log),
            cancel: request.cancel,
        }) {
            Ok(output) if output.cancelled => {
                request.log.section(&format!("gate {} interrupted", gate.name))?;
                return Ok(GateRun::Interrupted {
                    gate_name: gate.name.clone(),
                });
            }
            Ok(output) => {
                let mut text = output.output_text();
                if output.timed_out {
                    text.push_str(&format!(
                        "\n[gate timed out after {}s]\n",
                        request.timeout.as_secs()
                    ));
                }
                let exit_code = if output.timed_out {
                    None
                } else {
                    output.exit_code
                };
                GateResult::new(&gate.name, exit_code, text)
            }
            Err(err) => match err.downcast_ref::<SpawnError>() {
                Some(spawn) => GateResult::new(&gate.name, None, spawn.to_string()),
                None => return Err(err),
            },
        };

        let exit = result
            .exit_code
            .map_or_else(|| "none".to_string(), |code| code.to_string());
        request
            .log
            .section(&format!("gate {} exit {exit}", gate.name))?;

        if !result.succeeded {
            warn!(gate = %gate.name, exit_code = ?result.exit_code, "gate failed");
            return Ok(GateRun::Finished(result));
        }
        debug!(gate = %gate.name, "gate passed");
    }

    info!("all gates passed");
    Ok(GateRun::Finished(GateResult::all_passed()))
}
