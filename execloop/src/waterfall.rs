//! Waterfall outcome scorer.
//!
//! Four layers run in order: exit code, stderr, output contract, artifact.
//! A critical failure skips every later layer; other failures only withhold
//! that layer's points. The verdict passes when nothing failed critically and
//! the summed score reaches the policy threshold.

use std::fs;
use std::path::Path;

use anyhow::Result;
use tracing::{debug, instrument};

use crate::cancel::CancellationToken;
use crate::core::scoring::{
    CheckKind, CheckResult, ScoreBreakdown, ScoringPolicy, Verdict, stdout_reports_json_success,
};
use crate::core::types::ExecResult;

/// Scores executions against an immutable [`ScoringPolicy`].
#[derive(Debug, Clone, Default)]
pub struct OutcomeScorer {
    policy: ScoringPolicy,
}

impl OutcomeScorer {
    pub fn new(policy: ScoringPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ScoringPolicy {
        &self.policy
    }

    /// Score one execution. `artifact` is the file the command ran, if any.
    ///
    /// Errors only when `cancel` is already set; validation failures are verdicts.
    #[instrument(skip_all, fields(exit_code = exec.exit_code, has_artifact = artifact.is_some()))]
    pub fn evaluate(
        &self,
        exec: &ExecResult,
        artifact: Option<&Path>,
        cancel: &CancellationToken,
    ) -> Result<Verdict> {
        cancel.check("score")?;
        let weights = self.policy.weights;

        let exit_code = self.policy.check_exit_code(exec);
        if exit_code.is_critical_failure() {
            return Ok(self.conclude(
                exit_code,
                CheckResult::skipped(CheckKind::Stderr, weights.stderr, CheckKind::ExitCode),
                CheckResult::skipped(CheckKind::OutputContract, weights.output_contract, CheckKind::ExitCode),
                CheckResult::skipped(CheckKind::Artifact, weights.artifact, CheckKind::ExitCode),
            ));
        }

        let stderr = self.policy.check_stderr(exec);
        if stderr.is_critical_failure() {
            return Ok(self.conclude(
                exit_code,
                stderr,
                CheckResult::skipped(CheckKind::OutputContract, weights.output_contract, CheckKind::Stderr),
                CheckResult::skipped(CheckKind::Artifact, weights.artifact, CheckKind::Stderr),
            ));
        }

        let output_contract = self.check_output_contract(exec, artifact);
        let artifact = self.check_artifact(artifact);
        Ok(self.conclude(exit_code, stderr, output_contract, artifact))
    }

    fn conclude(
        &self,
        exit_code: CheckResult,
        stderr: CheckResult,
        output_contract: CheckResult,
        artifact: CheckResult,
    ) -> Verdict {
        let breakdown = ScoreBreakdown::new(
            exit_code,
            stderr,
            output_contract,
            artifact,
            self.policy.weights.total(),
        );
        let verdict = Verdict::from_breakdown(breakdown, self.policy.pass_threshold);
        debug!(
            passed = verdict.passed,
            score = verdict.score,
            layer = ?verdict.layer,
            "scored execution"
        );
        verdict
    }

    fn check_output_contract(&self, exec: &ExecResult, artifact: Option<&Path>) -> CheckResult {
        let max = self.policy.weights.output_contract;
        if self.policy.contract_markers.is_empty() {
            return self.policy.contract_result(0, "stdout");
        }
        if stdout_reports_json_success(&exec.stdout) {
            return CheckResult::pass(
                CheckKind::OutputContract,
                max,
                max,
                "stdout JSON reports success",
            );
        }

        let matched = self.policy.count_contract_matches(&exec.stdout);
        if matched > 0 {
            return self.policy.contract_result(matched, "stdout");
        }
        let Some(path) = artifact else {
            return self.policy.contract_result(0, "stdout");
        };
        match fs::read_to_string(path) {
            Ok(text) => {
                let matched = self.policy.count_contract_matches(&text);
                self.policy.contract_result(matched, "stdout or artifact")
            }
            Err(err) => {
                debug!(path = %path.display(), err = %err, "artifact unreadable for contract check");
                self.policy.contract_result(0, "stdout")
            }
        }
    }

    fn check_artifact(&self, artifact: Option<&Path>) -> CheckResult {
        let max = self.policy.weights.artifact;
        let Some(path) = artifact else {
            return CheckResult::pass(CheckKind::Artifact, max, max, "no artifact to validate");
        };
        match fs::read_to_string(path) {
            Ok(text) if text.trim().is_empty() => CheckResult::fail(
                CheckKind::Artifact,
                max,
                format!("artifact {} is empty", path.display()),
            ),
            Ok(_) => CheckResult::pass(
                CheckKind::Artifact,
                max,
                max,
                format!("artifact {} exists and is non-empty", path.display()),
            ),
            Err(err) => CheckResult::fail(
                CheckKind::Artifact,
                max,
                format!("artifact {} unreadable: {err}", path.display()),
            ),
        }
    }
}
