//! I/O helpers: workspace access, subprocesses, git, config and traces.

pub mod atomic;
pub mod command;
pub mod config;
pub mod git;
pub mod model;
pub mod navigator;
pub mod path_guard;
pub mod process;
pub mod prompt;
pub mod retry;
pub mod tasks;
pub mod trace;
pub mod version_control;
