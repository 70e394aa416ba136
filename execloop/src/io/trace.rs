//! Per-run JSON-lines trace files.
//!
//! One append-only file per run id (`trace-<run-id>.jsonl`) under the log
//! directory. Older files are pruned to the most recent `retain` on first emit.
//! Trace output is a product artifact, separate from `tracing` diagnostics.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

const TRACE_PREFIX: &str = "trace-";
const TRACE_SUFFIX: &str = ".jsonl";
const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// One trace line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceEvent {
    pub ts: DateTime<Utc>,
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iter: Option<u32>,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Destination for structured trace events. Emission never fails the caller.
pub trait TraceSink {
    fn run_id(&self) -> &str;
    fn emit(&self, iter: Option<u32>, event: &str, data: Option<Value>);
}

/// Trace sink appending to `<dir>/trace-<run-id>.jsonl`.
pub struct JsonlTrace {
    run_id: String,
    dir: PathBuf,
    retain: usize,
    prepared: OnceLock<()>,
}

impl JsonlTrace {
    pub fn new(dir: impl Into<PathBuf>, run_id: impl Into<String>, retain: usize) -> Self {
        Self {
            run_id: run_id.into(),
            dir: dir.into(),
            retain,
            prepared: OnceLock::new(),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.dir
            .join(format!("{TRACE_PREFIX}{}{TRACE_SUFFIX}", self.run_id))
    }

    fn prepare(&self) {
        if let Err(err) = fs::create_dir_all(&self.dir) {
            warn!(dir = %self.dir.display(), err = %err, "failed to create trace dir");
            return;
        }
        // Keep room for this run's file.
        let keep = self.retain.saturating_sub(1);
        match prune_traces(&self.dir, keep) {
            Ok(0) => {}
            Ok(removed) => debug!(removed, "pruned old trace files"),
            Err(err) => warn!(err = %format!("{err:#}"), "failed to prune trace files"),
        }
    }

    fn append(&self, event: &TraceEvent) -> Result<()> {
        let mut line = serde_json::to_string(event).context("serialize trace event")?;
        line.push('\n');
        let path = self.path();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open trace {}", path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append trace {}", path.display()))
    }
}

impl TraceSink for JsonlTrace {
    fn run_id(&self) -> &str {
        &self.run_id
    }

    fn emit(&self, iter: Option<u32>, event: &str, data: Option<Value>) {
        self.prepared.get_or_init(|| self.prepare());
        let event = TraceEvent {
            ts: Utc::now(),
            run_id: self.run_id.clone(),
            iter,
            event: event.to_string(),
            data,
        };
        if let Err(err) = self.append(&event) {
            warn!(err = %format!("{err:#}"), event = %event.event, "failed to write trace event");
        }
    }
}

/// Delete all but the `keep` most recently modified trace files in `dir`.
pub fn prune_traces(dir: &Path, keep: usize) -> Result<usize> {
    let mut traces = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let entry = entry.context("read trace dir entry")?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !(name.starts_with(TRACE_PREFIX) && name.ends_with(TRACE_SUFFIX)) {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|meta| meta.modified())
            .unwrap_or(UNIX_EPOCH);
        traces.push((modified, entry.path()));
    }
    if traces.len() <= keep {
        return Ok(0);
    }
    traces.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));
    let mut removed = 0;
    for (_, path) in traces.into_iter().skip(keep) {
        match fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(err) => warn!(path = %path.display(), err = %err, "failed to remove trace file"),
        }
    }
    Ok(removed)
}

/// Fresh run id: base36 milliseconds since the epoch, `-`, six random base36 characters.
pub fn generate_run_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or_default();
    let mut rng = rand::thread_rng();
    let suffix: String = (0..6)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect();
    format!("{}-{suffix}", to_base36(millis))
}

fn to_base36(mut value: u128) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(BASE36[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();
    String::from_utf8_lossy(&digits).into_owned()
}

/// Read every event from a trace file. Used by tests and the CLI.
pub fn read_trace(path: &Path) -> Result<Vec<TraceEvent>> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).context("parse trace line"))
        .collect()
}
