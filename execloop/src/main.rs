//! Autonomous generate/execute/validate loop.
//!
//! `execloop run` asks a model for code, runs it inside a sandboxed workspace,
//! scores the outcome through the waterfall, and feeds failures back until a
//! verdict passes or the iteration budget runs out.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use execloop::cancel::CancellationToken;
use execloop::core::scoring::Verdict;
use execloop::core::tool_calls::parse_tool_calls;
use execloop::core::types::{CommandSpec, ExecResult, IterationLimit};
use execloop::dispatch::ToolDispatcher;
use execloop::exit_codes;
use execloop::io::command::{CommandExecutor, CommandRunner};
use execloop::io::config::{CONFIG_FILE, LoopConfig, load_config, write_config};
use execloop::io::model::CommandModel;
use execloop::io::navigator::Navigator;
use execloop::io::path_guard::Workspace;
use execloop::io::tasks::TaskList;
use execloop::io::trace::{JsonlTrace, generate_run_id};
use execloop::io::version_control::{EnvCredentials, GitVersionControl, VcRequest};
use execloop::logging;
use execloop::looping::{IterationController, IterationRecord, LoopSettings, LoopStop};
use execloop::task_run::run_task_list;
use execloop::waterfall::OutcomeScorer;

#[derive(Parser)]
#[command(
    name = "execloop",
    version,
    about = "Generate, execute, and validate code until it passes"
)]
struct Cli {
    /// Config file (TOML).
    #[arg(long, global = true, default_value = CONFIG_FILE)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default config file.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Run the loop for one prompt, or for every task in a todo file.
    Run(RunArgs),
    /// Parse `json-tool` blocks from a markdown file and dispatch them.
    Tools {
        /// Markdown file holding the tool calls.
        markdown: PathBuf,
    },
    /// Run one command through the executor and print its score.
    Exec {
        /// Allow shell operators in a single-string command.
        #[arg(long)]
        allow_unsafe: bool,
        /// One shell string, or a program followed by its arguments.
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Task prompt.
    #[arg(long, conflicts_with_all = ["prompt_file", "tasks"])]
    prompt: Option<String>,
    /// File holding the task prompt.
    #[arg(long, conflicts_with = "tasks")]
    prompt_file: Option<PathBuf>,
    /// Target language tag (overrides config).
    #[arg(long)]
    lang: Option<String>,
    /// Artifact path relative to the workspace (overrides config).
    #[arg(long)]
    output: Option<PathBuf>,
    /// Positive integer or `infinity` (overrides config).
    #[arg(long)]
    max_iterations: Option<IterationLimit>,
    /// Todo file split into tasks, one loop per task.
    #[arg(long)]
    tasks: Option<PathBuf>,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => cmd_init(&cli.config, force),
        Command::Run(args) => cmd_run(&cli.config, args),
        Command::Tools { markdown } => cmd_tools(&cli.config, &markdown),
        Command::Exec {
            allow_unsafe,
            command,
        } => cmd_exec(&cli.config, allow_unsafe, command),
    }
}

fn cmd_init(config_path: &Path, force: bool) -> Result<i32> {
    if config_path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        );
    }
    write_config(config_path, &LoopConfig::default())?;
    println!("wrote {}", config_path.display());
    Ok(exit_codes::OK)
}

fn cmd_run(config_path: &Path, args: RunArgs) -> Result<i32> {
    let mut cfg = load_config(config_path, env_lookup)?;
    if let Some(lang) = args.lang {
        cfg.lang = lang;
    }
    if let Some(output) = args.output {
        cfg.artifact_path = Some(output);
    }
    if let Some(limit) = args.max_iterations {
        cfg.max_iterations = limit;
    }
    cfg.validate()?;
    cfg.require_model_command()?;

    let task = match (&args.prompt, &args.prompt_file) {
        (Some(prompt), _) => Some(prompt.clone()),
        (None, Some(path)) => Some(
            fs::read_to_string(path)
                .with_context(|| format!("read prompt file {}", path.display()))?,
        ),
        (None, None) => None,
    };
    if task.as_deref().is_some_and(|task| task.trim().is_empty()) {
        bail!("prompt must not be empty");
    }
    if task.is_none() && args.tasks.is_none() {
        bail!("one of --prompt, --prompt-file or --tasks is required");
    }

    let workspace = open_workspace(&cfg)?;
    let root = workspace.root().to_path_buf();
    let log_dir = cfg.log_dir_in(&root);
    let run_id = cfg.run_id.clone().unwrap_or_else(generate_run_id);

    let model = CommandModel::new(&cfg.model.command, Duration::from_secs(cfg.model.timeout_secs))?
        .with_workdir(&root);
    let executor = CommandExecutor::new(cfg.exec_options(&root, &log_dir));
    let scorer = OutcomeScorer::new(cfg.scoring_policy()?);
    let navigator = cfg
        .navigator
        .enabled
        .then(|| Navigator::new(workspace.clone(), cfg.navigator.max_file_size));
    let version_control = cfg
        .version_control
        .authorized()
        .then(|| GitVersionControl::new(EnvCredentials::from_process_env()));
    let trace = cfg
        .trace
        .enabled
        .then(|| JsonlTrace::new(&log_dir, run_id.clone(), cfg.trace.retain));

    let mut controller = IterationController::new(&model, &executor, &scorer);
    if let Some(navigator) = navigator.as_ref() {
        controller = controller.with_navigator(navigator);
    }
    if let Some(vc) = version_control.as_ref() {
        controller = controller.with_version_control(vc);
    }
    if let Some(trace) = trace.as_ref() {
        controller = controller.with_trace(trace);
    }

    let cancel = CancellationToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || handler_token.cancel()).context("install Ctrl-C handler")?;

    let settings = LoopSettings::from_config(&cfg, &workspace, task.as_deref().unwrap_or(""), &run_id)?;

    let stop = if let Some(todo) = &args.tasks {
        let mut tasks = TaskList::init(todo, &log_dir.join("tasks"))?;
        if tasks.is_empty() {
            bail!("no tasks found in {}", todo.display());
        }
        let summary = run_task_list(&controller, &mut tasks, &settings, &cancel, |idx, record| {
            report_iteration(Some(idx), record);
        })?;
        print_json(&summary)?;
        summary.stop
    } else {
        let outcome = controller.run(&settings, &cancel, |record| report_iteration(None, record))?;
        print_json(&outcome)?;
        if let Some(error) = &outcome.error {
            eprintln!("{error}");
        }
        outcome.stop
    };

    Ok(match stop {
        LoopStop::Success => exit_codes::OK,
        LoopStop::Exhausted => exit_codes::EXHAUSTED,
        LoopStop::Cancelled => exit_codes::CANCELLED,
        LoopStop::Aborted => exit_codes::INVALID,
    })
}

fn cmd_tools(config_path: &Path, markdown_path: &Path) -> Result<i32> {
    let cfg = load_config(config_path, env_lookup)?;
    let markdown = fs::read_to_string(markdown_path)
        .with_context(|| format!("read {}", markdown_path.display()))?;
    let workspace = open_workspace(&cfg)?;
    let navigator = cfg
        .navigator
        .enabled
        .then(|| Navigator::new(workspace.clone(), cfg.navigator.max_file_size));
    let version_control = GitVersionControl::new(EnvCredentials::from_process_env());
    let defaults = VcRequest {
        repo_path: workspace.root().to_path_buf(),
        commit_message: cfg.version_control.commit_message.clone(),
        auto_push: cfg.version_control.auto_push,
        generate_notes: cfg.version_control.generate_notes,
    };

    let mut dispatcher = ToolDispatcher::new().with_version_control(
        &version_control,
        cfg.version_control.authorized(),
        defaults,
    );
    if let Some(navigator) = navigator.as_ref() {
        dispatcher = dispatcher.with_navigator(navigator);
    }
    let report = dispatcher.dispatch(&parse_tool_calls(&markdown), None, &CancellationToken::new())?;
    print_json(&report)?;
    Ok(exit_codes::OK)
}

#[derive(Serialize)]
struct ExecReport<'a> {
    command: String,
    exec: &'a ExecResult,
    verdict: &'a Verdict,
}

fn cmd_exec(config_path: &Path, allow_unsafe: bool, command: Vec<String>) -> Result<i32> {
    let cfg = load_config(config_path, env_lookup)?;
    let workspace = open_workspace(&cfg)?;
    let root = workspace.root().to_path_buf();
    let mut options = cfg.exec_options(&root, &cfg.log_dir_in(&root));
    options.allow_unsafe_shell |= allow_unsafe;

    let spec = command_spec(command)?;
    let cancel = CancellationToken::new();
    let exec = CommandExecutor::new(options).execute(&spec, &cancel)?;
    let verdict = OutcomeScorer::new(cfg.scoring_policy()?).evaluate(&exec, None, &cancel)?;
    print_json(&ExecReport {
        command: spec.to_string(),
        exec: &exec,
        verdict: &verdict,
    })?;
    Ok(if verdict.passed {
        exit_codes::OK
    } else {
        exit_codes::INVALID
    })
}

fn command_spec(mut command: Vec<String>) -> Result<CommandSpec> {
    match command.len() {
        0 => bail!("command must not be empty"),
        1 => Ok(CommandSpec::Shell(command.remove(0))),
        _ => {
            let program = command.remove(0);
            Ok(CommandSpec::Argv(program, command))
        }
    }
}

fn open_workspace(cfg: &LoopConfig) -> Result<Workspace> {
    fs::create_dir_all(&cfg.workspace)
        .with_context(|| format!("create workspace {}", cfg.workspace.display()))?;
    Workspace::new(&cfg.workspace)
}

fn report_iteration(task: Option<usize>, record: &IterationRecord) {
    let prefix = task.map(|idx| format!("task {} ", idx + 1)).unwrap_or_default();
    match &record.verdict {
        Some(verdict) => eprintln!(
            "{prefix}iteration {}: score {:.1} ({})",
            record.iteration,
            verdict.score,
            if verdict.passed { "passed" } else { verdict.reason.as_str() }
        ),
        None => eprintln!("{prefix}iteration {}: no code block in reply", record.iteration),
    }
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Print `value` as pretty JSON on stdout.
fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["execloop", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true }));
        assert_eq!(cli.config, PathBuf::from(CONFIG_FILE));
    }

    #[test]
    fn parse_run_overrides() {
        let cli = Cli::parse_from([
            "execloop",
            "run",
            "--prompt",
            "print hi",
            "--lang",
            "ts",
            "--max-iterations",
            "infinity",
            "--config",
            "alt.toml",
        ]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.prompt.as_deref(), Some("print hi"));
        assert_eq!(args.lang.as_deref(), Some("ts"));
        assert_eq!(args.max_iterations, Some(IterationLimit::Unbounded));
        assert_eq!(cli.config, PathBuf::from("alt.toml"));
    }

    #[test]
    fn prompt_and_tasks_conflict() {
        assert!(
            Cli::try_parse_from(["execloop", "run", "--prompt", "x", "--tasks", "todo.md"]).is_err()
        );
    }

    #[test]
    fn parse_exec_trailing_command() {
        let cli = Cli::parse_from(["execloop", "exec", "--allow-unsafe", "--", "ls", "-la"]);
        let Command::Exec {
            allow_unsafe,
            command,
        } = cli.command
        else {
            panic!("expected exec");
        };
        assert!(allow_unsafe);
        assert_eq!(
            command_spec(command).expect("spec"),
            CommandSpec::argv("ls", &["-la"])
        );
    }

    #[test]
    fn single_word_exec_is_a_shell_string() {
        assert_eq!(
            command_spec(vec!["echo hi".to_string()]).expect("spec"),
            CommandSpec::Shell("echo hi".to_string())
        );
        assert!(command_spec(Vec::new()).is_err());
    }
}
