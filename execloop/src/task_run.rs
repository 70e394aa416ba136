//! Drive one loop per task in a persisted [`TaskList`].

use anyhow::Result;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::cancel::CancellationToken;
use crate::io::command::CommandRunner;
use crate::io::model::ModelProvider;
use crate::io::tasks::TaskList;
use crate::looping::{IterationController, IterationRecord, LoopOutcome, LoopSettings, LoopStop};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRunSummary {
    pub total: usize,
    /// Tasks marked done, including ones finished by earlier runs.
    pub completed: usize,
    /// `Success` only when every task is done.
    pub stop: LoopStop,
    pub runs: Vec<LoopOutcome>,
}

/// Run the loop for each remaining task, in order.
///
/// A successful run marks its task done; the first non-successful run stops
/// the list and leaves that task current for the next invocation.
#[instrument(skip_all, fields(total = tasks.len()))]
pub fn run_task_list<M, R, F>(
    controller: &IterationController<'_, M, R>,
    tasks: &mut TaskList,
    base: &LoopSettings,
    cancel: &CancellationToken,
    mut on_iteration: F,
) -> Result<TaskRunSummary>
where
    M: ModelProvider,
    R: CommandRunner,
    F: FnMut(usize, &IterationRecord),
{
    let mut runs = Vec::new();
    let mut stop = LoopStop::Success;

    while let Some((idx, task)) = tasks.current() {
        let settings = LoopSettings {
            run_id: format!("{}-t{}", base.run_id, idx + 1),
            task: task.to_string(),
            ..base.clone()
        };
        info!(task = idx + 1, "starting task");
        let outcome = controller.run(&settings, cancel, |record| on_iteration(idx, record))?;
        let task_stop = outcome.stop;
        runs.push(outcome);

        if task_stop != LoopStop::Success {
            warn!(task = idx + 1, stop = ?task_stop, "task did not succeed, stopping list");
            stop = task_stop;
            break;
        }
        tasks.mark_current_done()?;
    }

    let completed = tasks.state().done.iter().filter(|done| **done).count();
    Ok(TaskRunSummary {
        total: tasks.len(),
        completed,
        stop,
        runs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;

    use crate::core::types::{CommandSpec, ExecResult, IterationLimit};
    use crate::io::config::VersionControlConfig;
    use crate::io::retry::RetryPolicy;
    use crate::test_support::{ScriptedModel, ScriptedRunner, python_reply};
    use crate::waterfall::OutcomeScorer;

    fn base(root: &std::path::Path) -> LoopSettings {
        LoopSettings {
            run_id: "batch".to_string(),
            task: String::new(),
            lang: "python".to_string(),
            artifact_path: root.join("out.py"),
            run_command: CommandSpec::argv("python3", &["out.py"]),
            max_iterations: IterationLimit::Finite(1),
            contract_markers: vec!["__RESULT__=SUCCESS".to_string()],
            version_control: VersionControlConfig::default(),
            repo_path: root.to_path_buf(),
            retry: RetryPolicy {
                max_attempts: 1,
                base_delay: Duration::from_millis(1),
            },
        }
    }

    #[test]
    fn stops_on_first_failed_task_and_resumes_there() {
        let temp = tempfile::tempdir().expect("tempdir");
        let todo = temp.path().join("todo.md");
        fs::write(&todo, "- first\n- second\n- third\n").expect("write todo");
        let state_dir = temp.path().join("state");
        let mut tasks = TaskList::init(&todo, &state_dir).expect("tasks");

        let model = ScriptedModel::new([python_reply("print('ok')"), python_reply("exit(1)")]);
        let runner = ScriptedRunner::new([
            ExecResult::new(0, "__RESULT__=SUCCESS", ""),
            ExecResult::new(1, "", ""),
        ]);
        let scorer = OutcomeScorer::default();
        let controller = IterationController::new(&model, &runner, &scorer);

        let mut seen = Vec::new();
        let summary = run_task_list(
            &controller,
            &mut tasks,
            &base(temp.path()),
            &CancellationToken::new(),
            |idx, record| seen.push((idx, record.iteration)),
        )
        .expect("run tasks");

        assert_eq!(summary.stop, LoopStop::Exhausted);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.runs.len(), 2);
        assert_eq!(summary.runs[1].run_id, "batch-t2");
        assert_eq!(seen, [(0, 1), (1, 1)]);
        assert!(model.prompts()[1].starts_with("second"));

        let resumed = TaskList::init(&todo, &state_dir).expect("resume");
        assert_eq!(resumed.current(), Some((1, "second")));
    }

    #[test]
    fn finished_list_is_a_success() {
        let temp = tempfile::tempdir().expect("tempdir");
        let todo = temp.path().join("todo.md");
        fs::write(&todo, "- only\n").expect("write todo");
        let mut tasks = TaskList::init(&todo, &temp.path().join("state")).expect("tasks");
        tasks.mark_current_done().expect("done");

        let model = ScriptedModel::default();
        let runner = ScriptedRunner::default();
        let scorer = OutcomeScorer::default();
        let summary = run_task_list(
            &IterationController::new(&model, &runner, &scorer),
            &mut tasks,
            &base(temp.path()),
            &CancellationToken::new(),
            |_, _| {},
        )
        .expect("run tasks");
        assert_eq!(summary.stop, LoopStop::Success);
        assert!(summary.runs.is_empty());
        assert_eq!(summary.completed, 1);
    }
}
