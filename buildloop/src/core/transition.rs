//! Session state machine.
//!
//! Every status change made by the controller goes through [`transition`], so
//! the table below is the single source of truth for legal moves.
//!
//! | from            | event                         | to        |
//! |-----------------|-------------------------------|-----------|
//! | running         | done + gates passed           | completed |
//! | running         | agent blocked                 | stopped   |
//! | running         | agent/gate failed, retries    | running   |
//! | running         | agent/gate failed, exhausted  | stopped   |
//! | running         | pause                         | paused    |
//! | paused          | resume                        | running   |
//! | running, paused | stop                          | stopped   |
//! | running, paused | iteration limit               | stopped   |

use std::fmt;

use crate::core::types::SessionStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopEvent {
    /// Agent reported done and every gate passed.
    GatesPassed,
    AgentBlocked,
    AgentFailed { retries_remain: bool },
    GateFailed { retries_remain: bool },
    Pause,
    Resume,
    Stop,
    IterationLimit,
}

impl fmt::Display for LoopEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LoopEvent::GatesPassed => "gates passed",
            LoopEvent::AgentBlocked => "agent blocked",
            LoopEvent::AgentFailed {
                retries_remain: true,
            } => "agent failed (retrying)",
            LoopEvent::AgentFailed {
                retries_remain: false,
            } => "agent failed (retries exhausted)",
            LoopEvent::GateFailed {
                retries_remain: true,
            } => "gate failed (retrying)",
            LoopEvent::GateFailed {
                retries_remain: false,
            } => "gate failed (retries exhausted)",
            LoopEvent::Pause => "pause",
            LoopEvent::Resume => "resume",
            LoopEvent::Stop => "stop",
            LoopEvent::IterationLimit => "iteration limit",
        };
        f.write_str(label)
    }
}

/// An event that the table does not allow from the current status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: SessionStatus,
    pub event: LoopEvent,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid transition: '{}' from {}", self.event, self.from)
    }
}

impl std::error::Error for InvalidTransition {}

/// Apply `event` to `from`, returning the next status.
pub fn transition(from: SessionStatus, event: LoopEvent) -> Result<SessionStatus, InvalidTransition> {
    use SessionStatus::{Completed, Paused, Running, Stopped};

    let next = match (from, event) {
        (Running, LoopEvent::GatesPassed) => Completed,
        (Running, LoopEvent::AgentBlocked) => Stopped,
        (Running, LoopEvent::AgentFailed { retries_remain })
        | (Running, LoopEvent::GateFailed { retries_remain }) => {
            if retries_remain {
                Running
            } else {
                Stopped
            }
        }
        (Running, LoopEvent::Pause) => Paused,
        (Paused, LoopEvent::Resume) => Running,
        (Running | Paused, LoopEvent::Stop | LoopEvent::IterationLimit) => Stopped,
        _ => return Err(InvalidTransition { from, event }),
    };
    Ok(next)
}

/// Whether another attempt is allowed after `consecutive_failures` failures.
///
/// `max_retries = 3` allows one initial attempt plus three retries.
pub fn retries_remain(consecutive_failures: u32, max_retries: u32) -> bool {
    consecutive_failures <= max_retries
}

pub fn iteration_limit_reached(iteration: u32, max_iterations: u32) -> bool {
    iteration >= max_iterations
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionStatus::{Completed, Paused, Running, Stopped};

    #[test]
    fn done_with_passing_gates_completes() {
        assert_eq!(transition(Running, LoopEvent::GatesPassed), Ok(Completed));
    }

    #[test]
    fn blocked_stops_never_completes() {
        assert_eq!(transition(Running, LoopEvent::AgentBlocked), Ok(Stopped));
    }

    #[test]
    fn failures_retry_until_exhausted() {
        for event in [
            LoopEvent::AgentFailed {
                retries_remain: true,
            },
            LoopEvent::GateFailed {
                retries_remain: true,
            },
        ] {
            assert_eq!(transition(Running, event), Ok(Running));
        }
        for event in [
            LoopEvent::AgentFailed {
                retries_remain: false,
            },
            LoopEvent::GateFailed {
                retries_remain: false,
            },
        ] {
            assert_eq!(transition(Running, event), Ok(Stopped));
        }
    }

    #[test]
    fn pause_resume_round_trip() {
        assert_eq!(transition(Running, LoopEvent::Pause), Ok(Paused));
        assert_eq!(transition(Paused, LoopEvent::Resume), Ok(Running));
    }

    #[test]
    fn stop_and_limit_apply_to_active_states() {
        for from in [Running, Paused] {
            assert_eq!(transition(from, LoopEvent::Stop), Ok(Stopped));
            assert_eq!(transition(from, LoopEvent::IterationLimit), Ok(Stopped));
        }
    }

    #[test]
    fn terminal_states_reject_every_event() {
        for from in [Stopped, Completed] {
            for event in [
                LoopEvent::GatesPassed,
                LoopEvent::Resume,
                LoopEvent::Stop,
                LoopEvent::IterationLimit,
            ] {
                assert_eq!(
                    transition(from, event),
                    Err(InvalidTransition { from, event })
                );
            }
        }
    }

    #[test]
    fn paused_cannot_take_iteration_outcomes() {
        assert!(transition(Paused, LoopEvent::GatesPassed).is_err());
        assert!(transition(Running, LoopEvent::Resume).is_err());
    }

    #[test]
    fn retry_ceiling_counts_retries_after_first_attempt() {
        assert!(retries_remain(1, 3));
        assert!(retries_remain(3, 3));
        assert!(!retries_remain(4, 3));
        assert!(!retries_remain(1, 0));
    }

    #[test]
    fn iteration_limit_is_inclusive() {
        assert!(!iteration_limit_reached(4, 5));
        assert!(iteration_limit_reached(5, 5));
    }
}
