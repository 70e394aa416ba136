//! Autonomous generate → execute → validate → iterate loop.
//!
//! A model produces code, the code is written into a sandboxed workspace and
//! executed under a timeout, and the outcome is scored by a layered
//! "waterfall" of checks. Failures are fed back into the next prompt until a
//! verdict passes, the iteration budget runs out, or the run is cancelled.
//!
//! - **[`core`]**: Pure, deterministic logic (code extraction, tool-call
//!   parsing, shell screening, scoring policy). No I/O.
//! - **[`io`]**: Side-effecting operations (filesystem, subprocesses, git,
//!   config, traces). Collaborators sit behind traits so tests can fake them.
//!
//! Orchestration modules ([`looping`], [`waterfall`], [`dispatch`],
//! [`task_run`]) coordinate core logic with I/O.

pub mod cancel;
pub mod core;
pub mod dispatch;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod task_run;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod waterfall;
