//! Shared value types passed between the loop's stages.
//!
//! These types carry no I/O and stay stable across runs so they can be
//! serialized into traces and compared in tests.

use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Outcome of one command execution. Produced once, consumed by the scorer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// The runtime ceiling fired and the process was terminated.
    #[serde(default)]
    pub timed_out: bool,
}

impl ExecResult {
    pub fn new(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
            timed_out: false,
        }
    }
}

/// A command to execute: either a shell string or a program with an argv list.
///
/// Deserializes from `"echo hi"` or `["python3", ["main.py"]]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandSpec {
    Shell(String),
    Argv(String, Vec<String>),
}

/// Shell string that means "derive the run command from the artifact language".
pub const PLACEHOLDER_COMMAND: &str = "echo OK";

impl CommandSpec {
    pub fn argv(program: impl Into<String>, args: &[&str]) -> Self {
        Self::Argv(
            program.into(),
            args.iter().map(|arg| arg.to_string()).collect(),
        )
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, Self::Shell(cmd) if cmd.trim() == PLACEHOLDER_COMMAND)
    }
}

impl Default for CommandSpec {
    fn default() -> Self {
        Self::Shell(PLACEHOLDER_COMMAND.to_string())
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shell(cmd) => f.write_str(cmd),
            Self::Argv(program, args) if args.is_empty() => f.write_str(program),
            Self::Argv(program, args) => write!(f, "{} {}", program, args.join(" ")),
        }
    }
}

/// Iteration budget: a positive count or unbounded (`"infinity"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationLimit {
    Finite(u32),
    Unbounded,
}

impl IterationLimit {
    /// True if iteration number `iter` (1-indexed) is within the budget.
    pub fn allows(&self, iter: u32) -> bool {
        match self {
            Self::Finite(max) => iter <= *max,
            Self::Unbounded => true,
        }
    }
}

impl Default for IterationLimit {
    fn default() -> Self {
        Self::Finite(5)
    }
}

impl fmt::Display for IterationLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Finite(max) => write!(f, "{max}"),
            Self::Unbounded => f.write_str("infinity"),
        }
    }
}

impl FromStr for IterationLimit {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "infinity" | "inf" | "unbounded" => return Ok(Self::Unbounded),
            _ => {}
        }
        let max: u32 = trimmed
            .parse()
            .map_err(|_| anyhow!("max_iterations must be a positive integer or \"infinity\" (got '{raw}')"))?;
        if max == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        Ok(Self::Finite(max))
    }
}

impl Serialize for IterationLimit {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Finite(max) => serializer.serialize_u32(*max),
            Self::Unbounded => serializer.serialize_str("infinity"),
        }
    }
}

impl<'de> Deserialize<'de> for IterationLimit {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Count(i64),
            Word(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Count(count) => u32::try_from(count)
                .ok()
                .filter(|count| *count > 0)
                .map(Self::Finite)
                .ok_or_else(|| serde::de::Error::custom("max_iterations must be > 0")),
            Raw::Word(word) => word.parse().map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iteration_limit_parses_sentinel_and_counts() {
        assert_eq!("infinity".parse::<IterationLimit>().unwrap(), IterationLimit::Unbounded);
        assert_eq!("3".parse::<IterationLimit>().unwrap(), IterationLimit::Finite(3));
        assert!("0".parse::<IterationLimit>().is_err());
        assert!("many".parse::<IterationLimit>().is_err());
    }

    #[test]
    fn iteration_limit_allows_up_to_max() {
        let limit = IterationLimit::Finite(2);
        assert!(limit.allows(1));
        assert!(limit.allows(2));
        assert!(!limit.allows(3));
        assert!(IterationLimit::Unbounded.allows(u32::MAX));
    }

    #[test]
    fn command_spec_deserializes_both_forms() {
        #[derive(Deserialize)]
        struct Wrapper {
            cmd: CommandSpec,
        }

        let shell: Wrapper = toml::from_str(r#"cmd = "echo hi""#).expect("shell form");
        assert_eq!(shell.cmd, CommandSpec::Shell("echo hi".to_string()));

        let argv: Wrapper = toml::from_str(r#"cmd = ["python3", ["main.py", "-v"]]"#).expect("argv form");
        assert_eq!(argv.cmd, CommandSpec::argv("python3", &["main.py", "-v"]));
    }

    #[test]
    fn placeholder_is_detected() {
        assert!(CommandSpec::default().is_placeholder());
        assert!(!CommandSpec::Shell("echo hi".to_string()).is_placeholder());
        assert!(!CommandSpec::argv("echo", &["OK"]).is_placeholder());
    }
}
