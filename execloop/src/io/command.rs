//! Safety-checked command execution.
//!
//! The [`CommandRunner`] trait decouples the iteration loop from real
//! subprocesses. [`CommandExecutor`] spawns commands under [`run_supervised`],
//! screens shell strings before they reach `sh`, and overwrites a transcript
//! of the most recent execution.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::cancel::{CancellationToken, CancelledError};
use crate::core::shell_safety::screen_shell_command;
use crate::core::types::{CommandSpec, ExecResult};
use crate::io::process::{CommandOutput, ProcessLimits, run_supervised};

/// Exit code reported for a command refused by the shell screen.
pub const BLOCKED_EXIT_CODE: i32 = 126;

/// File name of the transcript written under the log directory.
pub const TRANSCRIPT_FILE: &str = "last_command.log";

/// Execution options for [`CommandExecutor`].
#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub timeout: Duration,
    /// Skip the shell-operator and dangerous-pattern screen for shell strings.
    pub allow_unsafe_shell: bool,
    pub output_limit_bytes: usize,
    pub kill_grace: Duration,
    /// Working directory for the child; inherits the caller's when `None`.
    pub cwd: Option<PathBuf>,
    /// Where the transcript is written; no transcript when `None`.
    pub transcript_path: Option<PathBuf>,
}

impl Default for ExecOptions {
    fn default() -> Self {
        let limits = ProcessLimits::default();
        Self {
            timeout: limits.timeout,
            allow_unsafe_shell: false,
            output_limit_bytes: limits.output_limit_bytes,
            kill_grace: limits.kill_grace,
            cwd: None,
            transcript_path: None,
        }
    }
}

/// Abstraction over command execution backends.
pub trait CommandRunner {
    /// Run `command` to completion. Non-zero exits and timeouts are data, not errors.
    fn execute(&self, command: &CommandSpec, cancel: &CancellationToken) -> Result<ExecResult>;
}

/// Executor that spawns real subprocesses.
pub struct CommandExecutor {
    options: ExecOptions,
}

impl CommandExecutor {
    pub fn new(options: ExecOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ExecOptions {
        &self.options
    }

    fn build(&self, command: &CommandSpec) -> Command {
        let mut cmd = match command {
            CommandSpec::Shell(line) => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(line);
                cmd
            }
            CommandSpec::Argv(program, args) => {
                let mut cmd = Command::new(program);
                cmd.args(args);
                cmd
            }
        };
        if let Some(cwd) = &self.options.cwd {
            cmd.current_dir(cwd);
        }
        cmd
    }

    fn limits(&self) -> ProcessLimits {
        ProcessLimits {
            timeout: self.options.timeout,
            output_limit_bytes: self.options.output_limit_bytes,
            kill_grace: self.options.kill_grace,
        }
    }

    fn record(&self, transcript: &Transcript<'_>) {
        let Some(path) = &self.options.transcript_path else {
            return;
        };
        if let Err(err) = write_transcript(path, transcript) {
            warn!(err = %format!("{err:#}"), path = %path.display(), "failed to write command transcript");
        }
    }
}

impl CommandRunner for CommandExecutor {
    #[instrument(skip_all, fields(command = %command, timeout_ms = self.options.timeout.as_millis() as u64))]
    fn execute(&self, command: &CommandSpec, cancel: &CancellationToken) -> Result<ExecResult> {
        cancel.check("execute")?;

        if let CommandSpec::Shell(line) = command
            && !self.options.allow_unsafe_shell
            && let Some(block) = screen_shell_command(line)
        {
            let reason = block.describe();
            warn!(command = %line, %reason, "blocked shell command");
            let result = ExecResult::new(
                BLOCKED_EXIT_CODE,
                "",
                format!("command blocked: {reason}: {line}"),
            );
            self.record(&Transcript {
                command,
                result: &result,
                signal: None,
                note: Some(&reason),
            });
            return Ok(result);
        }

        info!("executing command");
        let output = run_supervised(self.build(command), None, self.limits(), cancel)
            .with_context(|| format!("execute {command}"))?;
        let result = exec_result(&output);
        self.record(&Transcript {
            command,
            result: &result,
            signal: output.signal,
            note: output.cancelled.then_some("cancelled"),
        });

        if output.cancelled {
            return Err(CancelledError { stage: "execute" }.into());
        }
        debug!(exit_code = result.exit_code, timed_out = result.timed_out, "command complete");
        Ok(result)
    }
}

fn exec_result(output: &CommandOutput) -> ExecResult {
    ExecResult {
        exit_code: output.exit_code,
        stdout: output.stdout_lossy(),
        stderr: output.stderr_lossy(),
        timed_out: output.timed_out,
    }
}

struct Transcript<'a> {
    command: &'a CommandSpec,
    result: &'a ExecResult,
    signal: Option<i32>,
    note: Option<&'a str>,
}

fn write_transcript(path: &Path, transcript: &Transcript<'_>) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create transcript dir {}", parent.display()))?;
    }
    let signal = transcript
        .signal
        .map_or_else(|| "none".to_string(), |signal| signal.to_string());
    let mut buf = String::new();
    buf.push_str(&format!("command: {}\n", transcript.command));
    buf.push_str(&format!("exitCode={}\n", transcript.result.exit_code));
    buf.push_str(&format!("signal={signal}\n"));
    buf.push_str(&format!("timedOut={}\n", transcript.result.timed_out));
    if let Some(note) = transcript.note {
        buf.push_str(&format!("note: {note}\n"));
    }
    buf.push_str("=== stdout ===\n");
    buf.push_str(&transcript.result.stdout);
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(&transcript.result.stderr);
    buf.push('\n');
    fs::write(path, buf).with_context(|| format!("write transcript {}", path.display()))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::cancel::is_cancelled_error;
    use crate::core::run_command::derive_run_command;
    use crate::io::process::SpawnError;

    fn executor(dir: &Path, allow_unsafe_shell: bool) -> CommandExecutor {
        CommandExecutor::new(ExecOptions {
            timeout: Duration::from_secs(5),
            allow_unsafe_shell,
            cwd: Some(dir.to_path_buf()),
            transcript_path: Some(dir.join("logs").join(TRANSCRIPT_FILE)),
            kill_grace: Duration::from_millis(200),
            ..ExecOptions::default()
        })
    }

    #[test]
    fn dangerous_command_is_blocked_without_spawning() {
        let temp = tempfile::tempdir().expect("tempdir");
        let exec = executor(temp.path(), false);
        let result = exec
            .execute(&CommandSpec::Shell("rm -rf /".to_string()), &CancellationToken::new())
            .expect("execute");
        assert_eq!(result.exit_code, BLOCKED_EXIT_CODE);
        assert!(result.stderr.contains("command blocked"));

        let transcript =
            fs::read_to_string(temp.path().join("logs").join(TRANSCRIPT_FILE)).expect("transcript");
        assert!(transcript.contains("exitCode=126"));
        assert!(transcript.contains("rm -rf /"));
    }

    #[test]
    fn shell_operators_are_blocked_unless_overridden() {
        let temp = tempfile::tempdir().expect("tempdir");
        let command = CommandSpec::Shell("echo a; echo b".to_string());

        let blocked = executor(temp.path(), false)
            .execute(&command, &CancellationToken::new())
            .expect("execute");
        assert_eq!(blocked.exit_code, BLOCKED_EXIT_CODE);

        let allowed = executor(temp.path(), true)
            .execute(&command, &CancellationToken::new())
            .expect("execute");
        assert_eq!(allowed.exit_code, 0);
        assert_eq!(allowed.stdout, "a\nb\n");
    }

    #[test]
    fn argv_form_skips_the_shell_screen() {
        let temp = tempfile::tempdir().expect("tempdir");
        let result = executor(temp.path(), false)
            .execute(&CommandSpec::argv("echo", &["a;", "$(b)"]), &CancellationToken::new())
            .expect("execute");
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "a; $(b)\n");
    }

    #[test]
    fn timeout_is_reported_as_data() {
        let temp = tempfile::tempdir().expect("tempdir");
        let exec = CommandExecutor::new(ExecOptions {
            timeout: Duration::from_millis(200),
            kill_grace: Duration::from_millis(200),
            transcript_path: Some(temp.path().join(TRANSCRIPT_FILE)),
            ..ExecOptions::default()
        });
        let result = exec
            .execute(&CommandSpec::argv("sleep", &["5"]), &CancellationToken::new())
            .expect("execute");
        assert!(result.timed_out);
        assert_ne!(result.exit_code, 0);
        let transcript = fs::read_to_string(temp.path().join(TRANSCRIPT_FILE)).expect("transcript");
        assert!(transcript.contains("timedOut=true"));
    }

    #[test]
    fn spawn_failure_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = executor(temp.path(), false)
            .execute(&CommandSpec::argv("no-such-binary-xyz", &[]), &CancellationToken::new())
            .expect_err("spawn fails");
        assert!(err.downcast_ref::<SpawnError>().is_some());
    }

    #[test]
    fn non_executable_artifact_fails_as_data() {
        let temp = tempfile::tempdir().expect("tempdir");
        let artifact = temp.path().join("out.go");
        fs::write(&artifact, "package main\n").expect("write artifact");
        let command = derive_run_command(&CommandSpec::default(), "go", &artifact);
        let result = executor(temp.path(), false)
            .execute(&command, &CancellationToken::new())
            .expect("execute");
        assert_eq!(result.exit_code, 126);
        assert!(!result.stderr.is_empty());
    }

    #[test]
    fn cancelled_before_start_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let token = CancellationToken::new();
        token.cancel();
        let err = executor(temp.path(), false)
            .execute(&CommandSpec::Shell("echo hi".to_string()), &token)
            .expect_err("cancelled");
        assert!(is_cancelled_error(&err));
    }
}
