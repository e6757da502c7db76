//! Deterministic, pure logic shared by the build loop.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and return deterministic outputs suitable for tests.

pub mod classifier;
pub mod plan;
pub mod transition;
pub mod types;
