//! Deterministic, pure logic shared by the lifecycle pipelines.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and return deterministic outputs suitable for tests.

pub mod diff;
pub mod history;
pub mod naming;
pub mod safety;
pub mod step_log;
pub mod types;
