//! Side-effecting helpers: filesystem state, processes, prompts, control.

pub mod agent;
pub mod agents;
pub mod config;
pub mod control;
pub mod gates;
pub mod init;
pub mod plan;
pub mod process;
pub mod prompt;
pub mod session_log;
pub mod session_store;
