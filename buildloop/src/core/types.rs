//! Shared deterministic types for the build loop.
//!
//! These types define stable contracts between the controller and its
//! collaborators. They carry no I/O and serialize to a stable JSON shape.

use std::fmt;

use serde::{Deserialize, Serialize};

/// What a session is asking the agent to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Refine the plan document; no gates run.
    Plan,
    /// Implement the in-progress task and verify it with gates.
    Build,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Plan => "plan",
            Mode::Build => "build",
        }
    }
}

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Paused,
    Stopped,
    Completed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Paused => "paused",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Completed => "completed",
        }
    }

    /// `stopped` and `completed` accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Stopped | SessionStatus::Completed)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an agent run did not produce a usable outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    /// The process exited non-zero (or could not be spawned).
    ProcessError { exit_code: Option<i32> },
    /// The process exceeded its wall-clock budget and was killed.
    Timeout,
    /// The process exited cleanly without emitting a marker.
    Ambiguous,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::ProcessError {
                exit_code: Some(code),
            } => write!(f, "process error (exit {code})"),
            FailureKind::ProcessError { exit_code: None } => f.write_str("process error"),
            FailureKind::Timeout => f.write_str("timeout"),
            FailureKind::Ambiguous => f.write_str("ambiguous output (no marker)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentFailure {
    pub kind: FailureKind,
    /// Captured stderr or a runner-side explanation.
    pub detail: String,
}

/// Classified result of one agent run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentOutcome {
    Done,
    Blocked { reason: String },
    Failed(AgentFailure),
}

impl AgentOutcome {
    pub fn label(&self) -> String {
        match self {
            AgentOutcome::Done => "done".to_string(),
            AgentOutcome::Blocked { reason } => format!("blocked ({reason})"),
            AgentOutcome::Failed(failure) => format!("failed: {}", failure.kind),
        }
    }
}

/// Result of one verification gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateResult {
    pub gate_name: String,
    /// `None` when the gate was killed before exiting (timeout).
    pub exit_code: Option<i32>,
    pub output: String,
    pub succeeded: bool,
}

impl GateResult {
    pub fn new(gate_name: impl Into<String>, exit_code: Option<i32>, output: String) -> Self {
        Self {
            gate_name: gate_name.into(),
            exit_code,
            output,
            succeeded: exit_code == Some(0),
        }
    }

    /// Returned when every gate passed (or none are configured).
    pub fn all_passed() -> Self {
        Self::new("all", Some(0), String::new())
    }
}

/// Where the previous failed attempt went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureSource {
    Agent,
    Gate,
}

/// Corrective context carried into the next prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureContext {
    pub source: FailureSource,
    /// One-line description (e.g. `gate lint failed (exit 1)`).
    pub summary: String,
    /// Captured output relevant to the failure.
    pub detail: String,
}

impl FailureContext {
    pub fn from_agent(failure: &AgentFailure) -> Self {
        Self {
            source: FailureSource::Agent,
            summary: format!("agent run failed: {}", failure.kind),
            detail: failure.detail.clone(),
        }
    }

    pub fn from_gate(result: &GateResult) -> Self {
        let summary = match result.exit_code {
            Some(code) => format!("gate {} failed (exit {code})", result.gate_name),
            None => format!("gate {} did not finish", result.gate_name),
        };
        Self {
            source: FailureSource::Gate,
            summary,
            detail: result.output.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_result_success_tracks_exit_code() {
        assert!(GateResult::new("fmt", Some(0), String::new()).succeeded);
        assert!(!GateResult::new("fmt", Some(2), String::new()).succeeded);
        assert!(!GateResult::new("fmt", None, String::new()).succeeded);
        assert!(GateResult::all_passed().succeeded);
    }

    #[test]
    fn gate_failure_context_names_gate() {
        let ctx = FailureContext::from_gate(&GateResult::new("lint", Some(1), "warn".into()));
        assert_eq!(ctx.source, FailureSource::Gate);
        assert_eq!(ctx.summary, "gate lint failed (exit 1)");
        assert_eq!(ctx.detail, "warn");
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&SessionStatus::Completed).expect("serialize");
        assert_eq!(json, "\"completed\"");
        assert!(SessionStatus::Stopped.is_terminal());
        assert!(!SessionStatus::Paused.is_terminal());
    }
}
