//! Decomposed objectives persisted as one file per task plus a JSON state file.
//!
//! Layout under the state directory:
//! - `tasks/task_001.md`, `tasks/task_002.md`, ...
//! - `state.json` (`{version, current, done[]}`), written atomically.
//!
//! Concurrent runs against the same directory are not supported.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::io::atomic::write_atomic;

const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskState {
    pub version: u32,
    /// Index of the first task not yet done (`== len` when finished).
    pub current: usize,
    pub done: Vec<bool>,
}

/// Ordered task list backed by files.
#[derive(Debug)]
pub struct TaskList {
    todo_path: PathBuf,
    tasks_dir: PathBuf,
    state_path: PathBuf,
    tasks: Vec<String>,
    state: TaskState,
}

impl TaskList {
    /// Load existing state from `state_dir`, or split `todo_path` into fresh task files.
    pub fn init(todo_path: &Path, state_dir: &Path) -> Result<Self> {
        let mut list = Self {
            todo_path: todo_path.to_path_buf(),
            tasks_dir: state_dir.join("tasks"),
            state_path: state_dir.join("state.json"),
            tasks: Vec::new(),
            state: TaskState {
                version: STATE_VERSION,
                current: 0,
                done: Vec::new(),
            },
        };
        fs::create_dir_all(&list.tasks_dir)
            .with_context(|| format!("create {}", list.tasks_dir.display()))?;

        if list.state_path.exists() {
            match list.load_existing() {
                Ok(()) => {
                    info!(total = list.len(), current = list.state.current, "resumed task list");
                    return Ok(list);
                }
                Err(err) => {
                    warn!(err = %format!("{err:#}"), "task state unusable, re-scanning todo file");
                }
            }
        }
        list.prepare_from_todo()?;
        info!(total = list.len(), "prepared task list");
        Ok(list)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn state(&self) -> &TaskState {
        &self.state
    }

    /// 0-based index and text of the current task.
    pub fn current(&self) -> Option<(usize, &str)> {
        self.tasks
            .get(self.state.current)
            .map(|task| (self.state.current, task.as_str()))
    }

    pub fn is_finished(&self) -> bool {
        self.state.current >= self.tasks.len()
    }

    /// Mark the current task done and advance past any already-done tasks.
    pub fn mark_current_done(&mut self) -> Result<()> {
        if self.is_finished() {
            return Ok(());
        }
        let current = self.state.current;
        self.state.done[current] = true;
        let mut next = current + 1;
        while next < self.tasks.len() && self.state.done[next] {
            next += 1;
        }
        self.state.current = next;
        debug!(done = current, next, "task marked done");
        self.save_state()
    }

    fn load_existing(&mut self) -> Result<()> {
        let raw = fs::read_to_string(&self.state_path)
            .with_context(|| format!("read {}", self.state_path.display()))?;
        let state: TaskState = serde_json::from_str(&raw)
            .with_context(|| format!("parse {}", self.state_path.display()))?;
        if state.version != STATE_VERSION {
            return Err(anyhow!("unsupported task state version {}", state.version));
        }

        let mut files: Vec<PathBuf> = fs::read_dir(&self.tasks_dir)
            .with_context(|| format!("read {}", self.tasks_dir.display()))?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "md"))
            .collect();
        files.sort();
        let tasks = files
            .iter()
            .map(|path| fs::read_to_string(path).with_context(|| format!("read {}", path.display())))
            .collect::<Result<Vec<_>>>()?;

        if tasks.len() != state.done.len() || state.current > tasks.len() {
            return Err(anyhow!(
                "task state does not match task files ({} files, {} flags)",
                tasks.len(),
                state.done.len()
            ));
        }
        self.tasks = tasks;
        self.state = state;
        Ok(())
    }

    fn prepare_from_todo(&mut self) -> Result<()> {
        let raw = fs::read_to_string(&self.todo_path)
            .with_context(|| format!("read todo file {}", self.todo_path.display()))?;
        let items = split_todo(&raw);

        for entry in fs::read_dir(&self.tasks_dir)
            .with_context(|| format!("read {}", self.tasks_dir.display()))?
        {
            let path = entry.context("read tasks dir entry")?.path();
            if path.extension().is_some_and(|ext| ext == "md") {
                fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
            }
        }
        for (idx, item) in items.iter().enumerate() {
            let path = self.tasks_dir.join(format!("task_{:03}.md", idx + 1));
            fs::write(&path, item).with_context(|| format!("write {}", path.display()))?;
        }

        self.state = TaskState {
            version: STATE_VERSION,
            current: 0,
            done: vec![false; items.len()],
        };
        self.tasks = items;
        self.save_state()
    }

    fn save_state(&self) -> Result<()> {
        let mut buf = serde_json::to_string_pretty(&self.state).context("serialize task state")?;
        buf.push('\n');
        write_atomic(&self.state_path, buf.as_bytes())
    }
}

/// Split a todo document into tasks: `- ` bullets if any, else blank-line separated paragraphs.
pub fn split_todo(raw: &str) -> Vec<String> {
    let bullets: Vec<String> = raw
        .lines()
        .map(str::trim)
        .filter_map(|line| line.strip_prefix("- "))
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect();
    if !bullets.is_empty() {
        return bullets;
    }

    let mut items = Vec::new();
    let mut paragraph: Vec<&str> = Vec::new();
    for line in raw.lines() {
        if line.trim().is_empty() {
            if !paragraph.is_empty() {
                items.push(paragraph.join("\n").trim().to_string());
                paragraph.clear();
            }
        } else {
            paragraph.push(line);
        }
    }
    if !paragraph.is_empty() {
        items.push(paragraph.join("\n").trim().to_string());
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bullets_win_over_paragraphs() {
        let raw = "# Plan\n\n- first task\n- second task\n\nnotes\n";
        assert_eq!(split_todo(raw), ["first task", "second task"]);
    }

    #[test]
    fn paragraphs_when_no_bullets() {
        let raw = "Build the parser.\nHandle errors.\n\n\nWrite tests.\n";
        assert_eq!(
            split_todo(raw),
            ["Build the parser.\nHandle errors.", "Write tests."]
        );
    }

    #[test]
    fn progress_is_persisted_and_resumed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let todo = temp.path().join("todo.md");
        fs::write(&todo, "- a\n- b\n- c\n").expect("write todo");
        let state_dir = temp.path().join("state");

        let mut list = TaskList::init(&todo, &state_dir).expect("init");
        assert_eq!(list.len(), 3);
        assert_eq!(list.current(), Some((0, "a")));
        assert!(state_dir.join("tasks/task_001.md").exists());

        list.mark_current_done().expect("done");
        assert_eq!(list.current(), Some((1, "b")));

        // Todo edits are ignored once state exists.
        fs::write(&todo, "- x\n").expect("rewrite todo");
        let mut resumed = TaskList::init(&todo, &state_dir).expect("resume");
        assert_eq!(resumed.len(), 3);
        assert_eq!(resumed.current(), Some((1, "b")));
        assert_eq!(resumed.state().done, [true, false, false]);

        resumed.mark_current_done().expect("done");
        resumed.mark_current_done().expect("done");
        assert!(resumed.is_finished());
        assert_eq!(resumed.current(), None);
        resumed.mark_current_done().expect("no-op when finished");
    }

    #[test]
    fn corrupt_state_triggers_rescan() {
        let temp = tempfile::tempdir().expect("tempdir");
        let todo = temp.path().join("todo.md");
        fs::write(&todo, "- only\n").expect("write todo");
        let state_dir = temp.path().join("state");
        fs::create_dir_all(&state_dir).expect("mkdir");
        fs::write(state_dir.join("state.json"), "{not json").expect("write state");

        let list = TaskList::init(&todo, &state_dir).expect("init");
        assert_eq!(list.current(), Some((0, "only")));
    }
}
