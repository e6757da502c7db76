//! Test-only stand-ins: a scripted command runner and a scratch project.

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Result, anyhow};

use crate::io::config::{ProjectConfig, write_config};
use crate::io::init::{InitOptions, ProjectPaths, init_project};
use crate::io::process::{CommandOutput, CommandRequest, CommandRunner, SpawnError};

type Hook = Box<dyn FnOnce() + Send>;

/// One queued response for [`ScriptedRunner`].
pub struct ScriptedCommand {
    result: ScriptedResult,
    hook: Option<Hook>,
}

enum ScriptedResult {
    Output(CommandOutput),
    SpawnError,
    Fail(String),
}

impl ScriptedCommand {
    /// Process that exits with `code` after printing `output`.
    pub fn exit(code: i32, output: &str) -> Self {
        Self::output(CommandOutput {
            exit_code: Some(code),
            output: output.as_bytes().to_vec(),
            ..CommandOutput::default()
        })
    }

    /// Process that exits with `code`, printing `stderr` on stderr.
    pub fn exit_with_stderr(code: i32, output: &str, stderr: &str) -> Self {
        let mut combined = output.as_bytes().to_vec();
        combined.extend_from_slice(stderr.as_bytes());
        Self::output(CommandOutput {
            exit_code: Some(code),
            output: combined,
            stderr: stderr.as_bytes().to_vec(),
            ..CommandOutput::default()
        })
    }

    /// Process killed after exceeding its timeout.
    pub fn timeout(output: &str) -> Self {
        Self::output(CommandOutput {
            exit_code: None,
            output: output.as_bytes().to_vec(),
            timed_out: true,
            ..CommandOutput::default()
        })
    }

    /// Process killed by a stop request. Also trips the request's cancel token.
    pub fn cancelled(output: &str) -> Self {
        Self::output(CommandOutput {
            exit_code: None,
            output: output.as_bytes().to_vec(),
            cancelled: true,
            ..CommandOutput::default()
        })
    }

    /// Program that cannot be started.
    pub fn spawn_error() -> Self {
        Self {
            result: ScriptedResult::SpawnError,
            hook: None,
        }
    }

    /// Runner-level error other than a spawn failure.
    pub fn fail(message: &str) -> Self {
        Self {
            result: ScriptedResult::Fail(message.to_string()),
            hook: None,
        }
    }

    /// Run `hook` while this command is "executing".
    pub fn with_hook(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    fn output(output: CommandOutput) -> Self {
        Self {
            result: ScriptedResult::Output(output),
            hook: None,
        }
    }
}

/// A command the scripted runner was asked to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
}

/// Replays queued responses in order and records every call.
pub struct ScriptedRunner {
    queue: Mutex<VecDeque<ScriptedCommand>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedRunner {
    pub fn new(commands: Vec<ScriptedCommand>) -> Self {
        Self {
            queue: Mutex::new(commands.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn programs(&self) -> Vec<String> {
        self.calls().into_iter().map(|call| call.program).collect()
    }

    pub fn remaining(&self) -> usize {
        self.queue.lock().expect("queue lock").len()
    }

    pub fn assert_drained(&self) -> Result<()> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(anyhow!("{n} scripted commands were never run")),
        }
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, request: &CommandRequest<'_>) -> Result<CommandOutput> {
        self.calls.lock().expect("calls lock").push(RecordedCall {
            program: request.command.program.clone(),
            args: request.command.args.clone(),
            stdin: request
                .stdin
                .map(|bytes| String::from_utf8_lossy(bytes).into_owned()),
        });
        let next = self
            .queue
            .lock()
            .expect("queue lock")
            .pop_front()
            .ok_or_else(|| anyhow!("unexpected command {}", request.command))?;

        if let Some(hook) = next.hook {
            hook();
        }
        match next.result {
            ScriptedResult::Output(output) => {
                if let Some(log) = request.tee {
                    log.tee(&output.output);
                    if !output.output.is_empty() && !output.output.ends_with(b"\n") {
                        log.tee(b"\n");
                    }
                }
                if output.cancelled {
                    request.cancel.cancel();
                }
                Ok(output)
            }
            ScriptedResult::SpawnError => Err(SpawnError {
                program: request.command.program.clone(),
                source: io::Error::new(io::ErrorKind::NotFound, "no such file"),
            }
            .into()),
            ScriptedResult::Fail(message) => Err(anyhow!(message)),
        }
    }
}

/// Scratch project with `.buildloop/` initialised.
pub struct TestProject {
    dir: tempfile::TempDir,
    paths: ProjectPaths,
}

impl TestProject {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let paths = init_project(dir.path(), &InitOptions { force: false })?;
        Ok(Self { dir, paths })
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn paths(&self) -> &ProjectPaths {
        &self.paths
    }

    pub fn write_plan(&self, contents: &str) -> Result<()> {
        fs::write(&self.paths.plan_path, contents)?;
        Ok(())
    }

    /// Plan whose In Progress section holds `tasks/<id>.md`.
    pub fn write_plan_with_task(&self, id: &str) -> Result<()> {
        self.write_plan(&format!(
            "# Plan\n\n## In Progress\n\n- [ ] tasks/{id}.md\n\n## Backlog\n"
        ))
    }

    pub fn write_config(&self, config: &ProjectConfig) -> Result<()> {
        write_config(&self.paths.config_path, config)
    }
}
