//! Deterministic classification of agent output.
//!
//! The agent signals completion by printing literal markers:
//!
//! - `<TASK_DONE>` when the task is finished,
//! - `<TASK_BLOCKED reason="...">` when it cannot proceed.
//!
//! Blocked wins over Done when both appear. A clean exit with neither marker is
//! reported as [`FailureKind::Ambiguous`] rather than assumed to be success.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::{AgentFailure, AgentOutcome, FailureKind};

pub const DONE_MARKER: &str = "<TASK_DONE>";

const MARKER_PREFIX: &[u8] = b"<TASK_";

static BLOCKED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<TASK_BLOCKED\s+reason="([^"]*)"\s*>"#).unwrap());

/// Markers found in captured output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Marker {
    Done,
    Blocked { reason: String },
}

/// Scan output for markers, applying Blocked-over-Done precedence.
pub fn scan_markers(output: &str) -> Option<Marker> {
    if let Some(caps) = BLOCKED_RE.captures(output) {
        return Some(Marker::Blocked {
            reason: caps[1].to_string(),
        });
    }
    if output.contains(DONE_MARKER) {
        return Some(Marker::Done);
    }
    None
}

/// Whether a raw output line may carry a marker.
pub fn is_marker_line(line: &[u8]) -> bool {
    line.windows(MARKER_PREFIX.len())
        .any(|window| window == MARKER_PREFIX)
}

/// Facts about a finished agent process needed for classification.
#[derive(Debug, Clone, Copy)]
pub struct AgentExit<'a> {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    /// Interleaved stdout and stderr.
    pub output: &'a str,
    pub stderr: &'a str,
}

/// Classify a finished agent run.
///
/// Rules, in order:
/// 1. timeout ⇒ `Failed(Timeout)`
/// 2. a Blocked marker ⇒ `Blocked`, regardless of exit code
/// 3. non-zero exit ⇒ `Failed(ProcessError)` with stderr as detail
/// 4. a Done marker ⇒ `Done`
/// 5. otherwise ⇒ `Failed(Ambiguous)`
pub fn classify(exit: AgentExit<'_>) -> AgentOutcome {
    if exit.timed_out {
        return AgentOutcome::Failed(AgentFailure {
            kind: FailureKind::Timeout,
            detail: tail(exit.output, 4_000),
        });
    }

    let marker = scan_markers(exit.output);
    if let Some(Marker::Blocked { reason }) = marker {
        return AgentOutcome::Blocked { reason };
    }

    if exit.exit_code != Some(0) {
        return AgentOutcome::Failed(AgentFailure {
            kind: FailureKind::ProcessError {
                exit_code: exit.exit_code,
            },
            detail: exit.stderr.to_string(),
        });
    }

    match marker {
        Some(Marker::Done) => AgentOutcome::Done,
        _ => AgentOutcome::Failed(AgentFailure {
            kind: FailureKind::Ambiguous,
            detail: format!(
                "agent exited cleanly without {DONE_MARKER} or <TASK_BLOCKED reason=\"...\">"
            ),
        }),
    }
}

/// Keep the last `limit` bytes of `text`, respecting char boundaries.
pub fn tail(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut start = text.len() - limit;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("[... {start} bytes omitted]\n{}", &text[start..])
}
