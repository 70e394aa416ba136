//! Model provider abstraction.
//!
//! The [`ModelProvider`] trait decouples the loop from the actual model
//! backend. [`CommandModel`] pipes the prompt to an external command on stdin
//! and reads markdown from stdout. Tests use scripted providers.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{info, instrument};

use crate::cancel::{CancellationToken, CancelledError};
use crate::core::scoring::excerpt;
use crate::io::process::{ProcessLimits, run_supervised};

/// Prompt in, markdown out. Failures are fatal for the current run.
pub trait ModelProvider {
    fn generate(&self, prompt: &str, cancel: &CancellationToken) -> Result<String>;
}

/// Model backend that runs a command with the prompt on stdin.
#[derive(Debug, Clone)]
pub struct CommandModel {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    workdir: Option<PathBuf>,
}

impl CommandModel {
    /// `command[0]` is the program, the rest are its arguments.
    pub fn new(command: &[String], timeout: Duration) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| anyhow!("model command must not be empty"))?;
        if program.trim().is_empty() {
            return Err(anyhow!("model command program must not be empty"));
        }
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout,
            workdir: None,
        })
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }
}

impl ModelProvider for CommandModel {
    #[instrument(skip_all, fields(program = %self.program, prompt_bytes = prompt.len()))]
    fn generate(&self, prompt: &str, cancel: &CancellationToken) -> Result<String> {
        cancel.check("generate")?;
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        let limits = ProcessLimits {
            timeout: self.timeout,
            output_limit_bytes: 4 * 1024 * 1024,
            ..ProcessLimits::default()
        };
        info!("invoking model command");
        let output = run_supervised(cmd, Some(prompt.as_bytes()), limits, cancel)
            .with_context(|| format!("run model command {}", self.program))?;

        if output.cancelled {
            return Err(CancelledError { stage: "generate" }.into());
        }
        if output.timed_out {
            return Err(anyhow!(
                "model command timed out after {}s",
                self.timeout.as_secs()
            ));
        }
        if output.exit_code != 0 {
            return Err(anyhow!(
                "model command exited with code {}: {}",
                output.exit_code,
                excerpt(&output.stderr_lossy(), 500)
            ));
        }
        let text = output.stdout_lossy();
        if text.trim().is_empty() {
            return Err(anyhow!("model command produced no output"));
        }
        Ok(text)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandModel {
        CommandModel::new(
            &["sh".to_string(), "-c".to_string(), script.to_string()],
            Duration::from_secs(5),
        )
        .expect("model")
    }

    #[test]
    fn prompt_is_piped_on_stdin() {
        let model = sh("printf 'echo: '; cat");
        let text = model
            .generate("write code", &CancellationToken::new())
            .expect("generate");
        assert_eq!(text, "echo: write code");
    }

    #[test]
    fn nonzero_exit_is_a_model_fault() {
        let model = sh("echo 'quota exceeded' >&2; exit 4");
        let err = model
            .generate("x", &CancellationToken::new())
            .expect_err("fails");
        let text = format!("{err:#}");
        assert!(text.contains("code 4"));
        assert!(text.contains("quota exceeded"));
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(CommandModel::new(&[], Duration::from_secs(1)).is_err());
    }
}
