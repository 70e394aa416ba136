//! Iteration controller: generate, extract, write, execute, score, dispatch, repeat.
//!
//! Each iteration runs its steps strictly in order. The controller keeps only
//! the iteration count and the last verdict; per-iteration detail is handed to
//! the caller's callback and the trace sink, not retained.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::cancel::{CancellationToken, is_cancelled_error};
use crate::core::markdown::extract_code;
use crate::core::run_command::derive_run_command;
use crate::core::scoring::Verdict;
use crate::core::tool_calls::parse_tool_calls;
use crate::core::types::{CommandSpec, ExecResult, IterationLimit};
use crate::dispatch::{DispatchReport, ToolDispatcher};
use crate::io::atomic::write_atomic;
use crate::io::command::CommandRunner;
use crate::io::config::{LoopConfig, VersionControlConfig};
use crate::io::model::ModelProvider;
use crate::io::navigator::Navigator;
use crate::io::path_guard::Workspace;
use crate::io::prompt::{InitialPrompt, PromptEngine, RetryPrompt};
use crate::io::retry::{RetryPolicy, retry_with_backoff};
use crate::io::trace::TraceSink;
use crate::io::version_control::{VcOutcome, VcRequest, VersionControl};
use crate::waterfall::OutcomeScorer;

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopStop {
    /// The last verdict passed.
    Success,
    /// The iteration budget ran out without a passing verdict.
    Exhausted,
    /// Cancellation was observed.
    Cancelled,
    /// A model or spawn fault ended the run; see [`LoopOutcome::error`].
    Aborted,
}

/// Summary of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopOutcome {
    pub run_id: String,
    /// Iterations started, including one interrupted by cancellation.
    pub iterations: u32,
    pub stop: LoopStop,
    pub last_verdict: Option<Verdict>,
    pub artifact_path: PathBuf,
    /// Error chain of the fault behind [`LoopStop::Aborted`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What one iteration did. Passed to the caller's callback, then dropped.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationRecord {
    pub iteration: u32,
    pub prompt: String,
    pub artifact_path: PathBuf,
    /// False when the model reply had no code block for the target language.
    pub code_found: bool,
    pub exec: Option<ExecResult>,
    pub verdict: Option<Verdict>,
    pub tools: DispatchReport,
}

/// Resolved inputs for one run.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub run_id: String,
    pub task: String,
    pub lang: String,
    /// Absolute, inside the workspace.
    pub artifact_path: PathBuf,
    /// Already derived from the language when the placeholder was configured.
    pub run_command: CommandSpec,
    pub max_iterations: IterationLimit,
    pub contract_markers: Vec<String>,
    pub version_control: VersionControlConfig,
    pub repo_path: PathBuf,
    pub retry: RetryPolicy,
}

impl LoopSettings {
    /// Resolve config against `workspace`. Rejects an artifact path outside it.
    pub fn from_config(
        cfg: &LoopConfig,
        workspace: &Workspace,
        task: &str,
        run_id: &str,
    ) -> Result<Self> {
        let requested = cfg.artifact_path_in(workspace.root());
        let artifact_path = workspace
            .resolve(&requested)
            .with_context(|| format!("artifact path {}", requested.display()))?;
        Ok(Self {
            run_id: run_id.to_string(),
            task: task.to_string(),
            lang: cfg.lang.clone(),
            run_command: derive_run_command(&cfg.run_command, &cfg.lang, &artifact_path),
            artifact_path,
            max_iterations: cfg.max_iterations,
            contract_markers: cfg.scoring.contract_markers.clone(),
            version_control: cfg.version_control.clone(),
            repo_path: workspace.root().to_path_buf(),
            retry: RetryPolicy::default(),
        })
    }

    fn vc_request(&self) -> VcRequest {
        VcRequest {
            repo_path: self.repo_path.clone(),
            commit_message: self.version_control.commit_message.clone(),
            auto_push: self.version_control.auto_push,
            generate_notes: self.version_control.generate_notes,
        }
    }
}

/// Drives the generate/execute/validate cycle with borrowed collaborators.
pub struct IterationController<'a, M, R> {
    model: &'a M,
    runner: &'a R,
    scorer: &'a OutcomeScorer,
    navigator: Option<&'a Navigator>,
    version_control: Option<&'a dyn VersionControl>,
    trace: Option<&'a dyn TraceSink>,
    prompts: PromptEngine,
}

enum IterationResult {
    Passed(IterationRecord),
    Failed {
        record: IterationRecord,
        next_prompt: String,
    },
}

impl<'a, M: ModelProvider, R: CommandRunner> IterationController<'a, M, R> {
    pub fn new(model: &'a M, runner: &'a R, scorer: &'a OutcomeScorer) -> Self {
        Self {
            model,
            runner,
            scorer,
            navigator: None,
            version_control: None,
            trace: None,
            prompts: PromptEngine::new(),
        }
    }

    pub fn with_navigator(mut self, navigator: &'a Navigator) -> Self {
        self.navigator = Some(navigator);
        self
    }

    pub fn with_version_control(mut self, version_control: &'a dyn VersionControl) -> Self {
        self.version_control = Some(version_control);
        self
    }

    pub fn with_trace(mut self, trace: &'a dyn TraceSink) -> Self {
        self.trace = Some(trace);
        self
    }

    /// Run until a verdict passes, the budget is exhausted, or `cancel` fires.
    ///
    /// Model failures and spawn failures stop the run as [`LoopStop::Aborted`],
    /// keeping the iteration count and last verdict; everything else is
    /// recoverable within the budget. Only a broken prompt template is an `Err`.
    #[instrument(skip_all, fields(run_id = %settings.run_id, max_iterations = %settings.max_iterations))]
    pub fn run<F: FnMut(&IterationRecord)>(
        &self,
        settings: &LoopSettings,
        cancel: &CancellationToken,
        mut on_iteration: F,
    ) -> Result<LoopOutcome> {
        self.emit(
            None,
            "run.start",
            json!({
                "task": settings.task,
                "lang": settings.lang,
                "artifact": settings.artifact_path,
                "runCommand": settings.run_command.to_string(),
                "maxIterations": settings.max_iterations.to_string(),
            }),
        );

        if settings.version_control.before {
            self.run_version_control("before", settings, cancel);
        }

        let mut prompt = self.prompts.render_initial(&InitialPrompt {
            task: &settings.task,
            lang: &settings.lang,
            artifact: &settings.artifact_path.display().to_string(),
            run_command: &settings.run_command.to_string(),
            markers: &settings.contract_markers,
            tools_enabled: self.navigator.is_some(),
        })?;
        let mut last_verdict: Option<Verdict> = None;
        let mut iterations = 0u32;
        let mut error = None;

        let stop = loop {
            if cancel.is_cancelled() {
                break LoopStop::Cancelled;
            }
            let next = iterations + 1;
            if !settings.max_iterations.allows(next) {
                break LoopStop::Exhausted;
            }
            iterations = next;

            match self.run_iteration(iterations, &prompt, settings, cancel) {
                Ok(IterationResult::Passed(record)) => {
                    last_verdict = record.verdict.clone();
                    on_iteration(&record);
                    break LoopStop::Success;
                }
                Ok(IterationResult::Failed {
                    record,
                    next_prompt,
                }) => {
                    if record.verdict.is_some() {
                        last_verdict = record.verdict.clone();
                    }
                    on_iteration(&record);
                    prompt = next_prompt;
                }
                Err(err) if is_cancelled_error(&err) => {
                    info!(iteration = iterations, "run cancelled");
                    break LoopStop::Cancelled;
                }
                Err(err) => {
                    let message = format!("iteration {iterations}: {err:#}");
                    warn!(error = %message, "run aborted");
                    self.emit(Some(iterations), "run.error", json!({"error": message}));
                    error = Some(message);
                    break LoopStop::Aborted;
                }
            }
        };

        if stop == LoopStop::Success && settings.version_control.after {
            self.run_version_control("after", settings, cancel);
        }

        info!(?stop, iterations, "run finished");
        self.emit(
            None,
            "run.end",
            json!({
                "stop": stop,
                "iterations": iterations,
                "score": last_verdict.as_ref().map(|verdict| verdict.score),
            }),
        );
        Ok(LoopOutcome {
            run_id: settings.run_id.clone(),
            iterations,
            stop,
            last_verdict,
            artifact_path: settings.artifact_path.clone(),
            error,
        })
    }

    #[instrument(skip_all, fields(iteration = iteration))]
    fn run_iteration(
        &self,
        iteration: u32,
        prompt: &str,
        settings: &LoopSettings,
        cancel: &CancellationToken,
    ) -> Result<IterationResult> {
        cancel.check("generate")?;
        self.emit(Some(iteration), "iteration.start", json!({"promptBytes": prompt.len()}));
        let markdown = self
            .model
            .generate(prompt, cancel)
            .context("model provider failed")?;
        self.emit(
            Some(iteration),
            "model.response",
            json!({"bytes": markdown.len()}),
        );

        let Some(code) = extract_code(&markdown, &settings.lang) else {
            warn!(iteration, lang = %settings.lang, "no code block in model output");
            self.emit(Some(iteration), "code.missing", json!({"lang": settings.lang}));
            let tools = self.dispatch_tools(&markdown, iteration, settings, cancel)?;
            let next_prompt =
                self.prompts
                    .render_missing_code(&settings.task, &settings.lang, iteration)?;
            return Ok(IterationResult::Failed {
                record: IterationRecord {
                    iteration,
                    prompt: prompt.to_string(),
                    artifact_path: settings.artifact_path.clone(),
                    code_found: false,
                    exec: None,
                    verdict: None,
                    tools,
                },
                next_prompt,
            });
        };

        cancel.check("write")?;
        write_artifact(&settings.artifact_path, &code)?;
        self.emit(
            Some(iteration),
            "artifact.written",
            json!({"path": settings.artifact_path, "bytes": code.len()}),
        );

        let exec = self.runner.execute(&settings.run_command, cancel)?;
        self.emit(
            Some(iteration),
            "exec.result",
            json!({"exitCode": exec.exit_code, "timedOut": exec.timed_out}),
        );

        let verdict = self
            .scorer
            .evaluate(&exec, Some(&settings.artifact_path), cancel)?;
        self.emit(
            Some(iteration),
            "score",
            json!({"passed": verdict.passed, "score": verdict.score, "layer": verdict.layer, "reason": verdict.reason}),
        );
        info!(iteration, passed = verdict.passed, score = verdict.score, "iteration scored");

        let tools = self.dispatch_tools(&markdown, iteration, settings, cancel)?;
        let passed = verdict.passed;
        let next_prompt = if passed {
            None
        } else {
            Some(self.prompts.render_retry(&RetryPrompt {
                task: &settings.task,
                lang: &settings.lang,
                iteration,
                verdict: &verdict,
                pass_threshold: self.scorer.policy().pass_threshold,
                exec: &exec,
                code: &code,
                markers: &settings.contract_markers,
            })?)
        };

        let record = IterationRecord {
            iteration,
            prompt: prompt.to_string(),
            artifact_path: settings.artifact_path.clone(),
            code_found: true,
            exec: Some(exec),
            verdict: Some(verdict),
            tools,
        };
        Ok(match next_prompt {
            None => IterationResult::Passed(record),
            Some(next_prompt) => IterationResult::Failed {
                record,
                next_prompt,
            },
        })
    }

    fn dispatch_tools(
        &self,
        markdown: &str,
        iteration: u32,
        settings: &LoopSettings,
        cancel: &CancellationToken,
    ) -> Result<DispatchReport> {
        let parse = parse_tool_calls(markdown);
        let mut dispatcher = ToolDispatcher::new().with_retry(settings.retry);
        if let Some(navigator) = self.navigator {
            dispatcher = dispatcher.with_navigator(navigator);
        }
        if let Some(vc) = self.version_control {
            dispatcher = dispatcher.with_version_control(
                vc,
                settings.version_control.authorized(),
                settings.vc_request(),
            );
        }
        if let Some(trace) = self.trace {
            dispatcher = dispatcher.with_trace(trace);
        }
        dispatcher.dispatch(&parse, Some(iteration), cancel)
    }

    /// Commit (and maybe push) around the run. Failures are logged, not fatal.
    fn run_version_control(
        &self,
        phase: &'static str,
        settings: &LoopSettings,
        cancel: &CancellationToken,
    ) -> Option<VcOutcome> {
        let Some(vc) = self.version_control else {
            warn!(phase, "version control enabled but no backend configured");
            return None;
        };
        let request = settings.vc_request();
        let event = format!("vc.{phase}");
        match retry_with_backoff("version control", settings.retry, cancel, |_| vc.run(&request)) {
            Ok(outcome) => {
                info!(phase, committed = outcome.committed, pushed = outcome.pushed, "version control finished");
                self.emit(
                    None,
                    &event,
                    serde_json::to_value(&outcome).unwrap_or(serde_json::Value::Null),
                );
                Some(outcome)
            }
            Err(err) => {
                warn!(phase, err = %format!("{err:#}"), "version control failed");
                self.emit(None, &event, json!({"error": format!("{err:#}")}));
                None
            }
        }
    }

    fn emit(&self, iter: Option<u32>, event: &str, data: serde_json::Value) {
        if let Some(trace) = self.trace {
            trace.emit(iter, event, Some(data));
        }
    }
}

fn write_artifact(path: &Path, code: &str) -> Result<()> {
    let mut contents = code.to_string();
    if !contents.ends_with('\n') {
        contents.push('\n');
    }
    write_atomic(path, contents.as_bytes())
        .with_context(|| format!("write artifact {}", path.display()))
}
