//! Stable exit codes for `execloop` commands.

/// Command succeeded, or the loop ended with a passing verdict.
pub const OK: i32 = 0;
/// Invalid config or input, a fatal model/spawn fault, or any other error.
pub const INVALID: i32 = 1;
/// The iteration budget ran out without a passing verdict.
pub const EXHAUSTED: i32 = 2;
/// The run stopped because cancellation was requested (Ctrl-C).
pub const CANCELLED: i32 = 3;
