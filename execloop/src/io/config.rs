//! Loop configuration stored in `execloop.toml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::run_command::default_artifact_name;
use crate::core::scoring::{DEFAULT_CONTRACT_MARKER, ScoringPolicy};
use crate::core::types::{CommandSpec, IterationLimit};
use crate::io::atomic::write_atomic;
use crate::io::command::{ExecOptions, TRANSCRIPT_FILE};
use crate::io::navigator::DEFAULT_MAX_FILE_SIZE;

/// Default config file name, looked up in the current directory.
pub const CONFIG_FILE: &str = "execloop.toml";

/// Loop configuration (TOML).
///
/// Every section is optional; missing fields fall back to the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoopConfig {
    /// Sandbox root for artifacts and navigator calls.
    pub workspace: PathBuf,
    /// Artifact path, relative to the workspace. Defaults to `out.<ext>`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<PathBuf>,
    /// Target language tag, used for code extraction and run-command derivation.
    pub lang: String,
    /// Shell string or `[program, [args...]]`. `"echo OK"` derives from `lang`.
    pub run_command: CommandSpec,
    pub max_iterations: IterationLimit,
    /// Transcript, trace and task-state directory, relative to the workspace.
    pub log_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,

    pub executor: ExecutorConfig,
    pub scoring: ScoringConfig,
    pub navigator: NavigatorConfig,
    pub version_control: VersionControlConfig,
    pub trace: TraceConfig,
    pub model: ModelConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutorConfig {
    pub timeout_ms: u64,
    pub allow_unsafe_shell: bool,
    pub output_limit_bytes: usize,
    /// Grace period between the terminate signal and a forced kill.
    pub kill_grace_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 60_000,
            allow_unsafe_shell: false,
            output_limit_bytes: 1_000_000,
            kill_grace_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScoringConfig {
    pub pass_threshold: f64,
    pub warning_penalty: f64,
    pub partial_credit_threshold: f64,
    /// Literal substrings, or `/regex/`.
    pub contract_markers: Vec<String>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            pass_threshold: 70.0,
            warning_penalty: 0.5,
            partial_credit_threshold: 0.5,
            contract_markers: vec![DEFAULT_CONTRACT_MARKER.to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NavigatorConfig {
    pub enabled: bool,
    pub max_file_size: u64,
}

impl Default for NavigatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VersionControlConfig {
    /// Commit before the first iteration.
    pub before: bool,
    /// Commit after a successful run.
    pub after: bool,
    pub auto_push: bool,
    pub generate_notes: bool,
    pub commit_message: String,
}

impl Default for VersionControlConfig {
    fn default() -> Self {
        Self {
            before: false,
            after: false,
            auto_push: false,
            generate_notes: false,
            commit_message: "execloop: automated commit".to_string(),
        }
    }
}

impl VersionControlConfig {
    /// Version-control tool calls are only honored when either phase is enabled.
    pub fn authorized(&self) -> bool {
        self.before || self.after
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TraceConfig {
    pub enabled: bool,
    /// Number of most recent `trace-*.jsonl` files kept.
    pub retain: usize,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retain: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModelConfig {
    /// Command that reads a prompt on stdin and prints markdown (e.g. `["llm", "-m", "gpt"]`).
    pub command: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: 600,
        }
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            workspace: PathBuf::from("."),
            artifact_path: None,
            lang: "python".to_string(),
            run_command: CommandSpec::default(),
            max_iterations: IterationLimit::default(),
            log_dir: PathBuf::from(".execloop"),
            run_id: None,
            executor: ExecutorConfig::default(),
            scoring: ScoringConfig::default(),
            navigator: NavigatorConfig::default(),
            version_control: VersionControlConfig::default(),
            trace: TraceConfig::default(),
            model: ModelConfig::default(),
        }
    }
}

impl LoopConfig {
    pub fn validate(&self) -> Result<()> {
        if self.lang.trim().is_empty() {
            return Err(anyhow!("lang must not be empty"));
        }
        if self.executor.timeout_ms == 0 {
            return Err(anyhow!("executor.timeout_ms must be > 0"));
        }
        if self.executor.output_limit_bytes == 0 {
            return Err(anyhow!("executor.output_limit_bytes must be > 0"));
        }
        if self.navigator.max_file_size == 0 {
            return Err(anyhow!("navigator.max_file_size must be > 0"));
        }
        if self.trace.retain == 0 {
            return Err(anyhow!("trace.retain must be > 0"));
        }
        if self.model.timeout_secs == 0 {
            return Err(anyhow!("model.timeout_secs must be > 0"));
        }
        if let CommandSpec::Argv(program, _) = &self.run_command
            && program.trim().is_empty()
        {
            return Err(anyhow!("run_command program must not be empty"));
        }
        if let Some(run_id) = &self.run_id
            && (run_id.contains(['/', '\\']) || run_id.contains(".."))
        {
            return Err(anyhow!("run_id must not contain path separators or '..' (got '{run_id}')"));
        }
        self.scoring_policy().context("invalid [scoring] section")?;
        Ok(())
    }

    /// Error unless `[model].command` names a program.
    pub fn require_model_command(&self) -> Result<()> {
        match self.model.command.first() {
            Some(program) if !program.trim().is_empty() => Ok(()),
            _ => Err(anyhow!("model.command must be a non-empty array to run the loop")),
        }
    }

    /// Apply `EXECLOOP_*` overrides. `lookup` is usually `|key| std::env::var(key).ok()`.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(raw) = lookup("EXECLOOP_CMD_TIMEOUT_MS") {
            self.executor.timeout_ms = raw
                .trim()
                .parse()
                .with_context(|| format!("EXECLOOP_CMD_TIMEOUT_MS must be an integer (got '{raw}')"))?;
        }
        if let Some(raw) = lookup("EXECLOOP_ALLOW_UNSAFE_SHELL") {
            match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => self.executor.allow_unsafe_shell = true,
                "0" | "false" | "no" | "" => self.executor.allow_unsafe_shell = false,
                other => {
                    return Err(anyhow!(
                        "EXECLOOP_ALLOW_UNSAFE_SHELL must be one of 1|true|yes|0|false|no (got '{other}')"
                    ));
                }
            }
        }
        if let Some(raw) = lookup("EXECLOOP_OUTPUT_CONTRACT") {
            self.scoring.contract_markers = raw
                .split(',')
                .map(str::trim)
                .filter(|marker| !marker.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(raw) = lookup("EXECLOOP_RUN_ID")
            && !raw.trim().is_empty()
        {
            self.run_id = Some(raw.trim().to_string());
        }
        if let Some(raw) = lookup("EXECLOOP_TRACE_RETAIN") {
            self.trace.retain = raw
                .trim()
                .parse()
                .with_context(|| format!("EXECLOOP_TRACE_RETAIN must be an integer (got '{raw}')"))?;
        }
        if let Some(raw) = lookup("EXECLOOP_ARTIFACT_PATH")
            && !raw.trim().is_empty()
        {
            self.artifact_path = Some(PathBuf::from(raw.trim()));
        }
        if let Some(raw) = lookup("EXECLOOP_LANG")
            && !raw.trim().is_empty()
        {
            self.lang = raw.trim().to_string();
        }
        if let Some(raw) = lookup("EXECLOOP_MAX_ITERATIONS") {
            self.max_iterations = raw.parse().context("EXECLOOP_MAX_ITERATIONS")?;
        }
        Ok(())
    }

    pub fn scoring_policy(&self) -> Result<ScoringPolicy> {
        ScoringPolicy::new(
            self.scoring.pass_threshold,
            self.scoring.warning_penalty,
            self.scoring.partial_credit_threshold,
            &self.scoring.contract_markers,
        )
    }

    /// Artifact path under `workspace_root`.
    pub fn artifact_path_in(&self, workspace_root: &Path) -> PathBuf {
        match &self.artifact_path {
            Some(path) => workspace_root.join(path),
            None => workspace_root.join(default_artifact_name(&self.lang)),
        }
    }

    /// Log directory under `workspace_root` (absolute `log_dir` is kept as-is).
    pub fn log_dir_in(&self, workspace_root: &Path) -> PathBuf {
        workspace_root.join(&self.log_dir)
    }

    /// Executor options running in `workspace_root`, with the transcript under `log_dir`.
    pub fn exec_options(&self, workspace_root: &Path, log_dir: &Path) -> ExecOptions {
        ExecOptions {
            timeout: Duration::from_millis(self.executor.timeout_ms),
            allow_unsafe_shell: self.executor.allow_unsafe_shell,
            output_limit_bytes: self.executor.output_limit_bytes,
            kill_grace: Duration::from_millis(self.executor.kill_grace_ms),
            cwd: Some(workspace_root.to_path_buf()),
            transcript_path: Some(log_dir.join(TRANSCRIPT_FILE)),
        }
    }
}

/// Load config from a TOML file and apply environment overrides.
///
/// If the file is missing, starts from `LoopConfig::default()`.
pub fn load_config(path: &Path, lookup: impl Fn(&str) -> Option<String>) -> Result<LoopConfig> {
    let mut cfg = if path.exists() {
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?
    } else {
        LoopConfig::default()
    };
    cfg.apply_env_overrides(lookup)?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &LoopConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}
