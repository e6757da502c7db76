//! Supervised, restartable build loop for coding agents.
//!
//! A session repeatedly takes the task listed under "In Progress" in
//! `.buildloop/PLAN.md`, hands it to an external agent, verifies the result
//! with configured gate commands and decides whether to retry, stop or finish.
//!
//! - **[`core`]**: pure logic (plan parsing, marker classification, the
//!   session state machine). No I/O.
//! - **[`io`]**: processes, files, prompts and operator control, behind seams
//!   ([`io::process::CommandRunner`], [`io::session_store::SessionBackend`])
//!   that tests replace.
//!
//! [`build_loop`] composes the two into iterations; [`start`] and [`inspect`]
//! back the CLI commands.

pub mod build_loop;
pub mod core;
pub mod exit_codes;
pub mod inspect;
pub mod io;
pub mod logging;
pub mod start;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
