//! Supervised child processes: timeouts, cancellation, bounded output.

use std::fmt;
use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::cancel::CancellationToken;

const POLL_SLICE: Duration = Duration::from_millis(50);

/// Marker error for a child process that could not be started at all.
///
/// Distinct from a non-zero exit: the caller gets no output to score.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnError {
    pub program: String,
    pub message: String,
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to spawn {}: {}", self.program, self.message)
    }
}

impl std::error::Error for SpawnError {}

/// Limits applied to one supervised child.
#[derive(Debug, Clone, Copy)]
pub struct ProcessLimits {
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    /// Time between the terminate signal and a forced kill.
    pub kill_grace: Duration,
}

impl Default for ProcessLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            output_limit_bytes: 1_000_000,
            kill_grace: Duration::from_millis(2_000),
        }
    }
}

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    /// Exit code, or `128 + signal` when the process was killed by a signal.
    pub exit_code: i32,
    pub signal: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl CommandOutput {
    pub fn stdout_lossy(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).into_owned();
        if self.stdout_truncated > 0 {
            text.push_str(&format!("\n[stdout truncated {} bytes]\n", self.stdout_truncated));
        }
        text
    }

    pub fn stderr_lossy(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stderr).into_owned();
        if self.stderr_truncated > 0 {
            text.push_str(&format!("\n[stderr truncated {} bytes]\n", self.stderr_truncated));
        }
        text
    }
}

/// How the wait ended. Exactly one of these is produced per child.
enum Resolution {
    Exited(ExitStatus),
    TimedOut(ExitStatus),
    Cancelled(ExitStatus),
}

/// Run a command under a timeout and a cancellation token, capturing stdout/stderr.
///
/// Output is read concurrently while the child runs. On timeout or cancellation
/// the child gets a terminate signal, then `kill_grace` to exit, then a forced kill.
/// Partial output is always returned. Spawn failures surface as [`SpawnError`].
#[instrument(skip_all, fields(timeout_ms = limits.timeout.as_millis() as u64, output_limit_bytes = limits.output_limit_bytes))]
pub fn run_supervised(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    limits: ProcessLimits,
    cancel: &CancellationToken,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let program = cmd.get_program().to_string_lossy().into_owned();
    debug!(%program, "spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(%program, err = %e, "failed to spawn command");
            return Err(SpawnError {
                program,
                message: e.to_string(),
            }
            .into());
        }
    };

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        if let Err(e) = child_stdin.write_all(input) {
            // Child may exit without reading its input; its output still counts.
            debug!(err = %e, "stdin write failed");
        }
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let limit = limits.output_limit_bytes;
    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, limit));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, limit));

    let deadline = Instant::now() + limits.timeout;
    let resolution = loop {
        if cancel.is_cancelled() {
            warn!("cancellation requested, terminating command");
            break Resolution::Cancelled(terminate(&mut child, limits.kill_grace)?);
        }
        let now = Instant::now();
        if now >= deadline {
            warn!(
                timeout_ms = limits.timeout.as_millis() as u64,
                "command timed out, terminating"
            );
            break Resolution::TimedOut(terminate(&mut child, limits.kill_grace)?);
        }
        let slice = POLL_SLICE.min(deadline - now);
        if let Some(status) = child.wait_timeout(slice).context("wait for command")? {
            break Resolution::Exited(status);
        }
    };

    let (status, timed_out, cancelled) = match resolution {
        Resolution::Exited(status) => (status, false, false),
        Resolution::TimedOut(status) => (status, true, false),
        Resolution::Cancelled(status) => (status, false, true),
    };

    #[cfg(unix)]
    reap_group(child.id(), [&stdout_handle, &stderr_handle], limits.kill_grace);

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    let (exit_code, signal) = exit_code_of(status);
    debug!(exit_code, ?signal, timed_out, cancelled, "command finished");
    Ok(CommandOutput {
        status,
        exit_code,
        signal,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        cancelled,
    })
}

/// Exit code for `status`, mapping signal deaths to `128 + signal`.
pub fn exit_code_of(status: ExitStatus) -> (i32, Option<i32>) {
    if let Some(code) = status.code() {
        return (code, None);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return (128 + signal, Some(signal));
        }
    }
    (1, None)
}

/// Send SIGTERM to the child's process group, wait up to `grace`, then force-kill.
fn terminate(child: &mut Child, grace: Duration) -> Result<ExitStatus> {
    #[cfg(unix)]
    signal_group(child.id(), "-TERM");

    if let Some(status) = child
        .wait_timeout(grace)
        .context("wait for command after terminate")?
    {
        return Ok(status);
    }

    warn!(grace_ms = grace.as_millis() as u64, "command ignored terminate signal, killing");
    #[cfg(unix)]
    signal_group(child.id(), "-KILL");
    if let Err(e) = child.kill() {
        debug!(err = %e, "kill after grace period failed");
    }
    child.wait().context("wait command after kill")
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: &str) {
    let result = Command::new("kill")
        .arg(signal)
        .arg("--")
        .arg(format!("-{pid}"))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match result {
        Ok(status) if status.success() => {}
        Ok(status) => debug!(pid, signal, ?status, "kill reported failure"),
        Err(e) => debug!(pid, signal, err = %e, "failed to run kill"),
    }
}

/// Stop leftover members of the child's process group that still hold the output pipes.
#[cfg(unix)]
fn reap_group<T>(pid: u32, readers: [&thread::JoinHandle<T>; 2], grace: Duration) {
    let drained = || readers.iter().all(|handle| handle.is_finished());
    let settle = Instant::now() + POLL_SLICE;
    while !drained() && Instant::now() < settle {
        thread::sleep(Duration::from_millis(5));
    }
    if drained() {
        return;
    }
    warn!(pid, "background processes still hold the output pipes, terminating group");
    signal_group(pid, "-TERM");
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if drained() {
            return;
        }
        thread::sleep(POLL_SLICE);
    }
    signal_group(pid, "-KILL");
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn limits(timeout_ms: u64) -> ProcessLimits {
        ProcessLimits {
            timeout: Duration::from_millis(timeout_ms),
            output_limit_bytes: 1024,
            kill_grace: Duration::from_millis(500),
        }
    }

    #[test]
    fn captures_exit_code_and_streams() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo out; echo err >&2; exit 3");
        let output = run_supervised(cmd, None, limits(5_000), &CancellationToken::new())
            .expect("run");
        assert_eq!(output.exit_code, 3);
        assert_eq!(output.signal, None);
        assert_eq!(output.stdout_lossy(), "out\n");
        assert_eq!(output.stderr_lossy(), "err\n");
        assert!(!output.timed_out);
    }

    #[test]
    fn timeout_terminates_with_signal_exit_code() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let started = Instant::now();
        let output = run_supervised(cmd, None, limits(200), &CancellationToken::new())
            .expect("run");
        assert!(output.timed_out);
        assert_eq!(output.signal, Some(15));
        assert_eq!(output.exit_code, 143);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn cancelled_token_terminates_child() {
        let token = CancellationToken::new();
        token.cancel();
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let output = run_supervised(cmd, None, limits(5_000), &token).expect("run");
        assert!(output.cancelled);
        assert!(!output.timed_out);
    }

    #[test]
    fn background_children_do_not_outlive_the_command() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("sleep 6 & echo hi");
        let started = Instant::now();
        let output = run_supervised(cmd, None, limits(500), &CancellationToken::new())
            .expect("run");
        assert!(started.elapsed() < Duration::from_secs(3), "{:?}", started.elapsed());
        assert_eq!(output.exit_code, 0);
        assert_eq!(output.stdout_lossy(), "hi\n");
    }

    #[test]
    fn background_children_are_reaped_after_timeout() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("(trap '' TERM; sleep 6) & sleep 6");
        let started = Instant::now();
        let output = run_supervised(cmd, None, limits(200), &CancellationToken::new())
            .expect("run");
        assert!(output.timed_out);
        assert!(started.elapsed() < Duration::from_secs(4), "{:?}", started.elapsed());
    }

    #[test]
    fn missing_program_is_spawn_error() {
        let cmd = Command::new("definitely-not-a-real-program-xyz");
        let err = run_supervised(cmd, None, limits(1_000), &CancellationToken::new())
            .expect_err("spawn should fail");
        assert!(err.downcast_ref::<SpawnError>().is_some());
    }

    #[test]
    fn stdin_is_forwarded_and_output_limited() {
        let cmd = Command::new("cat");
        let input = vec![b'x'; 2048];
        let output = run_supervised(cmd, Some(&input), limits(5_000), &CancellationToken::new())
            .expect("run");
        assert_eq!(output.stdout.len(), 1024);
        assert_eq!(output.stdout_truncated, 1024);
    }
}
