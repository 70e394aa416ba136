//! Deterministic, pure logic shared by the loop.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod markdown;
pub mod run_command;
pub mod scoring;
pub mod shell_safety;
pub mod tool_calls;
pub mod types;
