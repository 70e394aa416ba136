//! Test-only collaborators: scripted model and runner, recording sinks.

use std::collections::VecDeque;
use std::path::Path;
use std::process::Command;
use std::sync::Mutex;

use anyhow::{Result, anyhow};
use chrono::Utc;
use serde_json::Value;

use crate::cancel::CancellationToken;
use crate::core::types::{CommandSpec, ExecResult};
use crate::io::command::CommandRunner;
use crate::io::model::ModelProvider;
use crate::io::trace::{TraceEvent, TraceSink};
use crate::io::version_control::{VcOutcome, VcRequest, VersionControl};

/// Wrap `code` in a python fence, the way a model reply would.
pub fn python_reply(code: &str) -> String {
    format!("Here is the script.\n\n```python\n{code}\n```\n")
}

/// Model that replays canned replies in order and records every prompt.
///
/// Errors once the script runs out.
#[derive(Debug, Default)]
pub struct ScriptedModel {
    replies: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedModel {
    pub fn new(replies: impl IntoIterator<Item = String>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|prompts| prompts.clone()).unwrap_or_default()
    }
}

impl ModelProvider for ScriptedModel {
    fn generate(&self, prompt: &str, cancel: &CancellationToken) -> Result<String> {
        cancel.check("generate")?;
        self.prompts
            .lock()
            .map_err(|_| anyhow!("prompt log poisoned"))?
            .push(prompt.to_string());
        self.replies
            .lock()
            .map_err(|_| anyhow!("reply script poisoned"))?
            .pop_front()
            .ok_or_else(|| anyhow!("scripted model has no replies left"))
    }
}

/// Runner that returns canned results in order and records the commands it saw.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    results: Mutex<VecDeque<ExecResult>>,
    commands: Mutex<Vec<CommandSpec>>,
}

impl ScriptedRunner {
    pub fn new(results: impl IntoIterator<Item = ExecResult>) -> Self {
        Self {
            results: Mutex::new(results.into_iter().collect()),
            commands: Mutex::new(Vec::new()),
        }
    }

    pub fn commands(&self) -> Vec<CommandSpec> {
        self.commands.lock().map(|commands| commands.clone()).unwrap_or_default()
    }
}

impl CommandRunner for ScriptedRunner {
    fn execute(&self, command: &CommandSpec, cancel: &CancellationToken) -> Result<ExecResult> {
        cancel.check("execute")?;
        self.commands
            .lock()
            .map_err(|_| anyhow!("command log poisoned"))?
            .push(command.clone());
        self.results
            .lock()
            .map_err(|_| anyhow!("result script poisoned"))?
            .pop_front()
            .ok_or_else(|| anyhow!("scripted runner has no results left"))
    }
}

/// Version control that records requests and fails the first `n` calls.
#[derive(Debug, Default)]
pub struct RecordingVersionControl {
    failures_left: Mutex<u32>,
    requests: Mutex<Vec<VcRequest>>,
}

impl RecordingVersionControl {
    pub fn failing_first(n: u32) -> Self {
        Self {
            failures_left: Mutex::new(n),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<VcRequest> {
        self.requests.lock().map(|requests| requests.clone()).unwrap_or_default()
    }
}

impl VersionControl for RecordingVersionControl {
    fn run(&self, request: &VcRequest) -> Result<VcOutcome> {
        self.requests
            .lock()
            .map_err(|_| anyhow!("request log poisoned"))?
            .push(request.clone());
        let mut failures_left = self
            .failures_left
            .lock()
            .map_err(|_| anyhow!("failure counter poisoned"))?;
        if *failures_left > 0 {
            *failures_left -= 1;
            return Err(anyhow!("simulated version control failure"));
        }
        Ok(VcOutcome {
            committed: true,
            pushed: request.auto_push,
            reason: None,
            note: None,
        })
    }
}

/// Trace sink that keeps events in memory.
#[derive(Debug)]
pub struct RecordingTrace {
    run_id: String,
    events: Mutex<Vec<TraceEvent>>,
}

impl RecordingTrace {
    pub fn new(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.lock().map(|events| events.clone()).unwrap_or_default()
    }
}

impl TraceSink for RecordingTrace {
    fn run_id(&self) -> &str {
        &self.run_id
    }

    fn emit(&self, iter: Option<u32>, event: &str, data: Option<Value>) {
        if let Ok(mut events) = self.events.lock() {
            events.push(TraceEvent {
                ts: Utc::now(),
                run_id: self.run_id.clone(),
                iter,
                event: event.to_string(),
                data,
            });
        }
    }
}

/// Initialize a git repository at `dir` with a local identity and one commit.
pub fn init_git_repo(dir: &Path) -> Result<()> {
    for args in [
        &["init", "-q"][..],
        &["config", "user.email", "loop@example.com"],
        &["config", "user.name", "Loop Test"],
        &["config", "commit.gpgsign", "false"],
    ] {
        git(dir, args)?;
    }
    std::fs::write(dir.join("README.md"), "seed\n")?;
    git(dir, &["add", "README.md"])?;
    git(dir, &["commit", "-q", "-m", "seed"])?;
    Ok(())
}

fn git(dir: &Path, args: &[&str]) -> Result<()> {
    let status = Command::new("git").args(args).current_dir(dir).status()?;
    if !status.success() {
        return Err(anyhow!("git {} failed with {status}", args.join(" ")));
    }
    Ok(())
}
