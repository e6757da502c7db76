//! Child process execution behind the [`CommandRunner`] seam.
//!
//! The controller never spawns processes directly: agents and gates both go
//! through `CommandRunner::run`, so tests swap in scripted runners. The
//! production [`ProcessRunner`] spawns the child, drains stdout/stderr on
//! reader threads (interleaving them line by line and teeing them to the
//! session log), and polls for exit so timeouts and cancellation are honoured.
//!
//! Only the last `output_limit_bytes` of each stream are kept in memory. Lines
//! accepted by [`CommandRequest::retain`] are kept in full regardless, so
//! markers printed early in a long run are not lost. The timeout and stop
//! request also cover anything the child left running with the pipes open:
//! the whole process group is killed before the readers are joined.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::io::control::CancelToken;
use crate::io::session_log::SessionLog;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long to wait for the output pipes to close after killing the group.
const READER_GRACE: Duration = Duration::from_secs(2);

/// Executable, arguments and extra environment for one process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    /// Build from an argv vector (`["cargo", "test"]`).
    pub fn from_argv(argv: &[String]) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow!("command must not be empty"))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            env: BTreeMap::new(),
        })
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// One process invocation.
#[derive(Debug, Clone)]
pub struct CommandRequest<'a> {
    pub command: &'a CommandSpec,
    pub workdir: &'a Path,
    /// Bytes written to the child's stdin, which is then closed.
    pub stdin: Option<&'a [u8]>,
    pub timeout: Duration,
    /// Bounds the output kept in memory (the tail is kept); the pipes are
    /// still drained past it.
    pub output_limit_bytes: usize,
    /// Lines kept in [`CommandOutput::retained`] even when truncated away.
    pub retain: Option<fn(&[u8]) -> bool>,
    /// Live copy of the output stream.
    pub tee: Option<&'a SessionLog>,
    pub cancel: &'a CancelToken,
}

/// Captured result of a finished (or killed) process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    /// Tail of stdout and stderr interleaved in arrival order.
    pub output: Vec<u8>,
    /// Tail of stderr alone.
    pub stderr: Vec<u8>,
    /// Bytes dropped from the front of `output`.
    pub truncated: usize,
    /// Lines matched by [`CommandRequest::retain`], in arrival order.
    pub retained: Vec<u8>,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl CommandOutput {
    pub fn output_text(&self) -> String {
        let body = String::from_utf8_lossy(&self.output);
        if self.truncated == 0 {
            return body.into_owned();
        }
        format!("[output truncated {} bytes]\n{body}", self.truncated)
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out && !self.cancelled
    }
}

/// The process could not be started at all.
#[derive(Debug)]
pub struct SpawnError {
    pub program: String,
    pub source: std::io::Error,
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to spawn '{}': {}", self.program, self.source)
    }
}

impl std::error::Error for SpawnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Capability to run one command to completion.
pub trait CommandRunner {
    fn run(&self, request: &CommandRequest<'_>) -> Result<CommandOutput>;
}

/// Runs real child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run(&self, request: &CommandRequest<'_>) -> Result<CommandOutput> {
        run_command(request)
    }
}

#[derive(Debug, Default)]
struct Captured {
    output: VecDeque<u8>,
    stderr: VecDeque<u8>,
    truncated: usize,
    retained: Vec<u8>,
}

impl Captured {
    fn push(&mut self, line: &[u8], limit: usize, is_stderr: bool, retain: bool) {
        self.truncated += keep_tail(&mut self.output, line, limit);
        if is_stderr {
            keep_tail(&mut self.stderr, line, limit);
        }
        if retain && self.retained.len() + line.len() <= limit {
            self.retained.extend_from_slice(line);
        }
    }
}

/// Append `line`, dropping from the front past `limit`. Returns bytes dropped.
fn keep_tail(buf: &mut VecDeque<u8>, line: &[u8], limit: usize) -> usize {
    buf.extend(line);
    let excess = buf.len().saturating_sub(limit);
    buf.drain(..excess);
    excess
}

/// Spawn the command, feed stdin, and wait for it under timeout and cancellation.
#[instrument(skip_all, fields(program = %request.command.program, timeout_secs = request.timeout.as_secs()))]
pub fn run_command(request: &CommandRequest<'_>) -> Result<CommandOutput> {
    let mut cmd = Command::new(&request.command.program);
    cmd.args(&request.command.args)
        .envs(&request.command.env)
        .current_dir(request.workdir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if request.stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    // Own process group, so a kill also reaches anything the child spawned.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(SpawnError {
                program: request.command.program.clone(),
                source: e,
            }
            .into());
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let captured = Arc::new(Mutex::new(Captured::default()));
    let limit = request.output_limit_bytes;
    let reader = |is_stderr| ReaderConfig {
        limit,
        is_stderr,
        retain: request.retain,
        tee: request.tee.cloned(),
    };
    let stdout_handle = spawn_reader(stdout, captured.clone(), reader(false));
    let stderr_handle = spawn_reader(stderr, captured.clone(), reader(true));

    let stdin_handle = match request.stdin {
        Some(input) => {
            let child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            let input = input.to_vec();
            Some(thread::spawn(move || write_stdin(child_stdin, &input)))
        }
        None => None,
    };

    let deadline = Instant::now() + request.timeout;
    let mut timed_out = false;
    let mut cancelled = false;
    let status = loop {
        if let Some(status) = child.wait_timeout(POLL_INTERVAL).context("wait for command")? {
            break status;
        }
        match interruption(request, deadline) {
            Some(Interruption::Cancelled) => cancelled = true,
            Some(Interruption::TimedOut) => timed_out = true,
            None => continue,
        }
        terminate(&mut child);
        break child.wait().context("wait command after kill")?;
    };

    // The child is gone, but anything it left behind may still hold the pipes.
    let pgid = child.id();
    let readers = [stdout_handle, stderr_handle];
    if !timed_out && !cancelled {
        loop {
            if readers.iter().all(|handle| handle.is_finished()) {
                break;
            }
            match interruption(request, deadline) {
                Some(Interruption::Cancelled) => cancelled = true,
                Some(Interruption::TimedOut) => timed_out = true,
                None => {
                    thread::sleep(POLL_INTERVAL);
                    continue;
                }
            }
            warn!("output pipes held open after exit, killing process group");
            kill_group(pgid);
            break;
        }
    }

    let grace = Instant::now() + READER_GRACE;
    for handle in stdin_handle.into_iter().chain(readers) {
        while !handle.is_finished() && Instant::now() < grace {
            thread::sleep(POLL_INTERVAL);
        }
        if handle.is_finished() {
            join_reader(handle).context("join pipe thread")?;
        } else {
            warn!("pipe still open after kill, abandoning its thread");
        }
    }

    let captured = std::mem::take(
        &mut *captured
            .lock()
            .map_err(|_| anyhow!("output buffer lock poisoned"))?,
    );
    if captured.truncated > 0 {
        warn!(truncated = captured.truncated, "output truncated");
    }

    let exit_code = reported_exit_code(status, timed_out || cancelled);
    debug!(?exit_code, timed_out, cancelled, "command finished");
    Ok(CommandOutput {
        exit_code,
        output: captured.output.into(),
        stderr: captured.stderr.into(),
        truncated: captured.truncated,
        retained: captured.retained,
        timed_out,
        cancelled,
    })
}

enum Interruption {
    Cancelled,
    TimedOut,
}

fn interruption(request: &CommandRequest<'_>, deadline: Instant) -> Option<Interruption> {
    if request.cancel.is_cancelled() {
        warn!("cancellation requested, killing child");
        Some(Interruption::Cancelled)
    } else if Instant::now() >= deadline {
        warn!(
            timeout_secs = request.timeout.as_secs(),
            "command timed out, killing"
        );
        Some(Interruption::TimedOut)
    } else {
        None
    }
}

/// A killed command reports no exit code even if its direct child had exited.
fn reported_exit_code(status: ExitStatus, killed: bool) -> Option<i32> {
    if killed { None } else { status.code() }
}

struct ReaderConfig {
    limit: usize,
    is_stderr: bool,
    retain: Option<fn(&[u8]) -> bool>,
    tee: Option<SessionLog>,
}

fn spawn_reader<R: Read + Send + 'static>(
    reader: R,
    captured: Arc<Mutex<Captured>>,
    config: ReaderConfig,
) -> thread::JoinHandle<Result<()>> {
    thread::spawn(move || {
        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();
        loop {
            line.clear();
            let n = reader.read_until(b'\n', &mut line).context("read output")?;
            if n == 0 {
                return Ok(());
            }
            if let Some(log) = &config.tee {
                log.tee(&line);
            }
            let retain = config.retain.is_some_and(|keep| keep(&line));
            let mut guard = captured
                .lock()
                .map_err(|_| anyhow!("output buffer lock poisoned"))?;
            guard.push(&line, config.limit, config.is_stderr, retain);
        }
    })
}

/// Write the input and close the pipe. A child that exits without reading is not an error.
fn write_stdin<W: Write>(mut stdin: W, input: &[u8]) -> Result<()> {
    match stdin.write_all(input) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::BrokenPipe => {
            warn!("child closed stdin before reading the full input");
            Ok(())
        }
        Err(e) => Err(e).context("write stdin"),
    }
}

fn join_reader(handle: thread::JoinHandle<Result<()>>) -> Result<()> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

/// Kill the child and its process group. Errors are logged: the child may already be gone.
fn terminate(child: &mut Child) {
    kill_group(child.id());
    if let Err(err) = child.kill() {
        debug!(err = %err, "kill child");
    }
}

/// SIGKILL every process in group `pgid`.
#[cfg(unix)]
fn kill_group(pgid: u32) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pgid) else {
        debug!(pgid, "process group id out of range");
        return;
    };
    if let Err(err) = killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        debug!(err = %err, "process group kill failed");
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) {}
