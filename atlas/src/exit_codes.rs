//! Stable exit codes for atlas CLI commands.

/// The operation passed (or the query succeeded).
pub const OK: i32 = 0;
/// The operation failed, or an error occurred before a result was produced.
pub const FAIL: i32 = 1;
