//! Scoring policy and per-layer checks for the waterfall validator.
//!
//! The policy is an immutable value built once from configuration and passed
//! into the scorer; nothing here reads globals. Checks that need the
//! filesystem (artifact reads) live in [`crate::waterfall`].

use std::fmt;
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::types::ExecResult;

/// Default output contract marker.
pub const DEFAULT_CONTRACT_MARKER: &str = "__RESULT__=SUCCESS";

static CRITICAL_STDERR: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile_ci(&[
        r"\bfatal error\b",
        r"\bsegmentation fault\b",
        r"\bcore dumped\b",
        r"\bunhandled exception\b",
        r"(?m)^\s*traceback \(most recent call last\)",
    ])
});

static WARNING_STDERR: LazyLock<Vec<Regex>> =
    LazyLock::new(|| compile_ci(&[r"\bwarning:", r"\bdeprecat(ed|ion)\b"]));

fn compile_ci(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|pattern| {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .expect("valid stderr pattern")
        })
        .collect()
}

/// The four waterfall layers, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckKind {
    ExitCode,
    Stderr,
    OutputContract,
    Artifact,
}

impl CheckKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExitCode => "exit-code",
            Self::Stderr => "stderr",
            Self::OutputContract => "output-contract",
            Self::Artifact => "artifact",
        }
    }

    /// Severity of a failure in this layer. Critical failures abort the waterfall.
    pub fn severity(&self) -> Severity {
        match self {
            Self::ExitCode | Self::Stderr => Severity::Critical,
            Self::OutputContract => Severity::Medium,
            Self::Artifact => Severity::Low,
        }
    }
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

/// Result of one waterfall layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    pub kind: CheckKind,
    pub passed: bool,
    /// Not evaluated because an earlier layer failed critically.
    pub skipped: bool,
    pub points: f64,
    pub max_points: f64,
    pub severity: Severity,
    pub message: String,
}

impl CheckResult {
    pub fn pass(kind: CheckKind, points: f64, max_points: f64, message: impl Into<String>) -> Self {
        Self {
            kind,
            passed: true,
            skipped: false,
            points,
            max_points,
            severity: kind.severity(),
            message: message.into(),
        }
    }

    pub fn fail(kind: CheckKind, max_points: f64, message: impl Into<String>) -> Self {
        Self {
            kind,
            passed: false,
            skipped: false,
            points: 0.0,
            max_points,
            severity: kind.severity(),
            message: message.into(),
        }
    }

    pub fn skipped(kind: CheckKind, max_points: f64, after: CheckKind) -> Self {
        Self {
            kind,
            passed: false,
            skipped: true,
            points: 0.0,
            max_points,
            severity: kind.severity(),
            message: format!("skipped after critical failure in {after}"),
        }
    }

    /// A failed, evaluated check whose severity aborts the waterfall.
    pub fn is_critical_failure(&self) -> bool {
        !self.passed && !self.skipped && self.severity == Severity::Critical
    }
}

/// Per-layer breakdown of one scored execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreBreakdown {
    pub exit_code: CheckResult,
    pub stderr: CheckResult,
    pub output_contract: CheckResult,
    pub artifact: CheckResult,
    pub total_score: f64,
    pub max_score: f64,
}

impl ScoreBreakdown {
    /// Build a breakdown whose total is the sum of the four layers' points.
    pub fn new(
        exit_code: CheckResult,
        stderr: CheckResult,
        output_contract: CheckResult,
        artifact: CheckResult,
        max_score: f64,
    ) -> Self {
        let total_score = exit_code.points + stderr.points + output_contract.points + artifact.points;
        Self {
            exit_code,
            stderr,
            output_contract,
            artifact,
            total_score,
            max_score,
        }
    }

    /// Layers in evaluation order.
    pub fn checks(&self) -> [&CheckResult; 4] {
        [&self.exit_code, &self.stderr, &self.output_contract, &self.artifact]
    }
}

/// Pass/fail decision for one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub passed: bool,
    pub score: f64,
    /// First critical failure, else first failed layer. `None` when every layer passed.
    pub layer: Option<CheckKind>,
    pub reason: String,
    pub breakdown: ScoreBreakdown,
}

impl Verdict {
    pub fn from_breakdown(breakdown: ScoreBreakdown, pass_threshold: f64) -> Self {
        let critical = breakdown
            .checks()
            .into_iter()
            .find(|check| check.is_critical_failure())
            .cloned();
        let first_failed = breakdown
            .checks()
            .into_iter()
            .find(|check| !check.passed && !check.skipped)
            .cloned();
        let score = breakdown.total_score;
        let passed = critical.is_none() && score >= pass_threshold;

        let (layer, reason) = match (&critical, &first_failed) {
            (Some(check), _) => (Some(check.kind), format!("critical failure: {}", check.message)),
            (None, _) if passed => (None, format!("score {score:.1} >= threshold {pass_threshold:.1}")),
            (None, Some(check)) => (
                Some(check.kind),
                format!("score {score:.1} below threshold {pass_threshold:.1}; {}", check.message),
            ),
            (None, None) => (None, format!("score {score:.1} below threshold {pass_threshold:.1}")),
        };

        Self {
            passed,
            score,
            layer,
            reason,
            breakdown,
        }
    }
}

/// Points available per layer. Defaults sum to 100.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Weights {
    pub exit_code: f64,
    pub stderr: f64,
    pub output_contract: f64,
    pub artifact: f64,
}

impl Default for Weights {
    fn default() -> Self {
        Self {
            exit_code: 40.0,
            stderr: 20.0,
            output_contract: 30.0,
            artifact: 10.0,
        }
    }
}

impl Weights {
    pub fn total(&self) -> f64 {
        self.exit_code + self.stderr + self.output_contract + self.artifact
    }
}

/// A required stdout/artifact marker: a literal substring, or `/regex/`.
#[derive(Debug, Clone)]
pub enum ContractMarker {
    Literal(String),
    Pattern(Regex),
}

impl ContractMarker {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.len() >= 2 && trimmed.starts_with('/') && trimmed.ends_with('/') {
            let pattern = &trimmed[1..trimmed.len() - 1];
            let re = Regex::new(pattern)
                .with_context(|| format!("invalid contract marker regex {trimmed}"))?;
            return Ok(Self::Pattern(re));
        }
        if trimmed.is_empty() {
            return Err(anyhow!("contract marker must not be empty"));
        }
        Ok(Self::Literal(trimmed.to_string()))
    }

    pub fn is_match(&self, text: &str) -> bool {
        match self {
            Self::Literal(marker) => text.contains(marker.as_str()),
            Self::Pattern(re) => re.is_match(text),
        }
    }
}

/// Immutable scoring configuration.
#[derive(Debug, Clone)]
pub struct ScoringPolicy {
    pub weights: Weights,
    /// Minimum total score (0..=100) for a passing verdict.
    pub pass_threshold: f64,
    /// Fraction of the stderr layer's points removed when warnings are present.
    pub warning_penalty: f64,
    /// Minimum fraction of contract markers that still earns prorated credit.
    pub partial_credit_threshold: f64,
    pub contract_markers: Vec<ContractMarker>,
    pub critical_stderr: Vec<Regex>,
    pub warning_stderr: Vec<Regex>,
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            weights: Weights::default(),
            pass_threshold: 70.0,
            warning_penalty: 0.5,
            partial_credit_threshold: 0.5,
            contract_markers: vec![ContractMarker::Literal(DEFAULT_CONTRACT_MARKER.to_string())],
            critical_stderr: CRITICAL_STDERR.clone(),
            warning_stderr: WARNING_STDERR.clone(),
        }
    }
}

impl ScoringPolicy {
    /// Build a policy with the default pattern sets and the given thresholds/markers.
    pub fn new(
        pass_threshold: f64,
        warning_penalty: f64,
        partial_credit_threshold: f64,
        markers: &[String],
    ) -> Result<Self> {
        if !(0.0..=100.0).contains(&pass_threshold) {
            return Err(anyhow!("pass_threshold must be within 0..=100"));
        }
        if !(0.0..=1.0).contains(&warning_penalty) {
            return Err(anyhow!("warning_penalty must be within 0.0..=1.0"));
        }
        if !(0.0..=1.0).contains(&partial_credit_threshold) {
            return Err(anyhow!("partial_credit_threshold must be within 0.0..=1.0"));
        }
        let contract_markers = markers
            .iter()
            .map(|marker| ContractMarker::parse(marker))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            pass_threshold,
            warning_penalty,
            partial_credit_threshold,
            contract_markers,
            ..Self::default()
        })
    }

    pub fn check_exit_code(&self, exec: &ExecResult) -> CheckResult {
        let max = self.weights.exit_code;
        if exec.exit_code == 0 {
            return CheckResult::pass(CheckKind::ExitCode, max, max, "process exited with code 0");
        }
        let suffix = if exec.timed_out { " (timed out)" } else { "" };
        CheckResult::fail(
            CheckKind::ExitCode,
            max,
            format!("process exited with non-zero code {}{suffix}", exec.exit_code),
        )
    }

    pub fn check_stderr(&self, exec: &ExecResult) -> CheckResult {
        let max = self.weights.stderr;
        if let Some(re) = self.critical_stderr.iter().find(|re| re.is_match(&exec.stderr)) {
            return CheckResult::fail(
                CheckKind::Stderr,
                max,
                format!(
                    "critical error in stderr (/{}/): {}",
                    re.as_str(),
                    excerpt(&exec.stderr, 200)
                ),
            );
        }
        let warnings = self
            .warning_stderr
            .iter()
            .filter(|re| re.is_match(&exec.stderr))
            .count();
        if warnings > 0 {
            let points = max * (1.0 - self.warning_penalty);
            return CheckResult::pass(
                CheckKind::Stderr,
                points,
                max,
                format!(
                    "warnings in stderr ({warnings} pattern(s)); {:.0}% penalty applied",
                    self.warning_penalty * 100.0
                ),
            );
        }
        CheckResult::pass(CheckKind::Stderr, max, max, "no critical errors or warnings in stderr")
    }

    /// Count how many contract markers match `text`.
    pub fn count_contract_matches(&self, text: &str) -> usize {
        self.contract_markers
            .iter()
            .filter(|marker| marker.is_match(text))
            .count()
    }

    /// Contract layer result for `matched` of the configured markers found in `source`.
    pub fn contract_result(&self, matched: usize, source: &str) -> CheckResult {
        let max = self.weights.output_contract;
        let total = self.contract_markers.len();
        if total == 0 {
            return CheckResult::pass(CheckKind::OutputContract, max, max, "no output contract configured");
        }
        let fraction = matched as f64 / total as f64;
        if matched > 0 && fraction >= self.partial_credit_threshold {
            return CheckResult::pass(
                CheckKind::OutputContract,
                max * fraction,
                max,
                format!("{matched}/{total} contract marker(s) matched in {source}"),
            );
        }
        CheckResult::fail(
            CheckKind::OutputContract,
            max,
            format!(
                "{matched}/{total} contract marker(s) matched in {source}; below {:.0}% partial-credit threshold",
                self.partial_credit_threshold * 100.0
            ),
        )
    }
}

/// True if stdout is a JSON object whose `result` or `status` is `"success"`.
pub fn stdout_reports_json_success(stdout: &str) -> bool {
    let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(stdout.trim()) else {
        return false;
    };
    ["result", "status"].iter().any(|key| {
        obj.get(*key)
            .and_then(Value::as_str)
            .is_some_and(|value| value.eq_ignore_ascii_case("success"))
    })
}

/// First `max_chars` characters of `text`, trimmed.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(max_chars).collect();
    format!("{cut}...")
}
