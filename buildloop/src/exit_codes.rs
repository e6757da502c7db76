//! Stable exit codes for `buildloop` commands.

/// Command succeeded, the session completed, or it was stopped between iterations.
pub const OK: i32 = 0;
/// Invalid layout/config, no task in progress, persistence failure, or other errors.
pub const ERROR: i32 = 1;
/// The agent reported `<TASK_BLOCKED>`.
pub const BLOCKED: i32 = 2;
/// The retry or iteration ceiling was reached.
pub const EXHAUSTED: i32 = 3;
/// A stop request killed an agent or gate mid-iteration.
pub const INTERRUPTED: i32 = 130;
