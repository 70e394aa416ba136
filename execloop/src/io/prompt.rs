//! Prompt rendering for the generate step.
//!
//! The first prompt frames the task; later prompts feed back either the
//! failed verdict or the missing-code guidance.

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::scoring::{CheckResult, Verdict, excerpt};
use crate::core::types::ExecResult;

const INITIAL_TEMPLATE: &str = include_str!("prompts/initial.md");
const RETRY_TEMPLATE: &str = include_str!("prompts/retry.md");
const MISSING_CODE_TEMPLATE: &str = include_str!("prompts/missing_code.md");

/// Characters of stdout/stderr/code carried into a retry prompt.
const EXCERPT_CHARS: usize = 2_000;

/// Inputs for the first prompt of a run.
#[derive(Debug, Clone)]
pub struct InitialPrompt<'a> {
    pub task: &'a str,
    pub lang: &'a str,
    pub artifact: &'a str,
    pub run_command: &'a str,
    pub markers: &'a [String],
    pub tools_enabled: bool,
}

/// Inputs for a prompt that follows a failed verdict.
#[derive(Debug, Clone)]
pub struct RetryPrompt<'a> {
    pub task: &'a str,
    pub lang: &'a str,
    pub iteration: u32,
    pub verdict: &'a Verdict,
    pub pass_threshold: f64,
    pub exec: &'a ExecResult,
    pub code: &'a str,
    pub markers: &'a [String],
}

#[derive(Debug, Serialize)]
struct CheckView<'a> {
    kind: &'static str,
    passed: bool,
    skipped: bool,
    points: String,
    max_points: String,
    message: &'a str,
}

impl<'a> CheckView<'a> {
    fn from_check(check: &'a CheckResult) -> Self {
        Self {
            kind: check.kind.as_str(),
            passed: check.passed,
            skipped: check.skipped,
            points: format_points(check.points),
            max_points: format_points(check.max_points),
            message: &check.message,
        }
    }
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("initial", INITIAL_TEMPLATE)
            .expect("initial template should be valid");
        env.add_template("retry", RETRY_TEMPLATE)
            .expect("retry template should be valid");
        env.add_template("missing_code", MISSING_CODE_TEMPLATE)
            .expect("missing_code template should be valid");
        Self { env }
    }

    pub fn render_initial(&self, input: &InitialPrompt<'_>) -> Result<String> {
        let template = self.env.get_template("initial")?;
        let rendered = template.render(context! {
            task => input.task.trim(),
            lang => input.lang,
            artifact => input.artifact,
            run_command => input.run_command,
            markers => input.markers,
            tools => input.tools_enabled,
        })?;
        Ok(rendered)
    }

    pub fn render_retry(&self, input: &RetryPrompt<'_>) -> Result<String> {
        let checks: Vec<CheckView<'_>> = input
            .verdict
            .breakdown
            .checks()
            .into_iter()
            .map(CheckView::from_check)
            .collect();
        let non_empty = |text: &str| {
            let cut = excerpt(text, EXCERPT_CHARS);
            (!cut.is_empty()).then_some(cut)
        };
        let template = self.env.get_template("retry")?;
        let rendered = template.render(context! {
            task => input.task.trim(),
            lang => input.lang,
            iteration => input.iteration,
            score => format_points(input.verdict.score),
            threshold => format_points(input.pass_threshold),
            layer => input.verdict.layer.map(|layer| layer.as_str()),
            reason => input.verdict.reason.as_str(),
            checks => checks,
            code => non_empty(input.code),
            stdout => non_empty(&input.exec.stdout),
            stderr => non_empty(&input.exec.stderr),
            markers => input.markers,
        })?;
        Ok(rendered)
    }

    pub fn render_missing_code(&self, task: &str, lang: &str, iteration: u32) -> Result<String> {
        let template = self.env.get_template("missing_code")?;
        let rendered = template.render(context! {
            task => task.trim(),
            lang => lang,
            iteration => iteration,
        })?;
        Ok(rendered)
    }
}

fn format_points(points: f64) -> String {
    if points.fract() == 0.0 {
        format!("{points:.0}")
    } else {
        format!("{points:.1}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::scoring::{CheckKind, ScoreBreakdown, ScoringPolicy};

    fn failed_verdict() -> (Verdict, ExecResult) {
        let policy = ScoringPolicy::default();
        let exec = ExecResult::new(1, "partial", "Traceback (most recent call last):\nValueError");
        let breakdown = ScoreBreakdown::new(
            policy.check_exit_code(&exec),
            CheckResult::skipped(CheckKind::Stderr, 20.0, CheckKind::ExitCode),
            CheckResult::skipped(CheckKind::OutputContract, 30.0, CheckKind::ExitCode),
            CheckResult::skipped(CheckKind::Artifact, 10.0, CheckKind::ExitCode),
            100.0,
        );
        (Verdict::from_breakdown(breakdown, 70.0), exec)
    }

    #[test]
    fn retry_prompt_carries_failure_details() {
        let (verdict, exec) = failed_verdict();
        let markers = vec!["__RESULT__=SUCCESS".to_string()];
        let prompt = PromptEngine::new()
            .render_retry(&RetryPrompt {
                task: "Print the answer.",
                lang: "python",
                iteration: 2,
                verdict: &verdict,
                pass_threshold: 70.0,
                exec: &exec,
                code: "print(1/0)",
                markers: &markers,
            })
            .expect("render");

        assert!(prompt.starts_with("Print the answer."));
        assert!(prompt.contains("Attempt 2 failed"));
        assert!(prompt.contains("Failed layer: `exit-code`"));
        assert!(prompt.contains("- exit-code: failed (0/40)"));
        assert!(prompt.contains("- stderr: skipped"));
        assert!(prompt.contains("print(1/0)"));
        assert!(prompt.contains("ValueError"));
        assert!(prompt.contains("`__RESULT__=SUCCESS`"));
    }

    #[test]
    fn missing_code_prompt_names_language() {
        let prompt = PromptEngine::new()
            .render_missing_code("Do it.", "ts", 1)
            .expect("render");
        assert!(prompt.contains("```ts code block"));
        assert!(prompt.contains("Attempt 1 produced no runnable code"));
    }

    #[test]
    fn initial_prompt_mentions_tools_only_when_enabled() {
        let engine = PromptEngine::new();
        let mut input = InitialPrompt {
            task: "Sum numbers.",
            lang: "python",
            artifact: "out.py",
            run_command: "python3 out.py",
            markers: &[],
            tools_enabled: false,
        };
        let plain = engine.render_initial(&input).expect("render");
        assert!(!plain.contains("json-tool"));
        input.tools_enabled = true;
        let with_tools = engine.render_initial(&input).expect("render");
        assert!(with_tools.contains("json-tool"));
    }
}
