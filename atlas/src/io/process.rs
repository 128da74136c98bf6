//! Child process execution with live line streaming, timeouts and bounded
//! transcripts.
//!
//! [`CommandRunner`] is the seam every pipeline goes through. The production
//! [`ProcessRunner`] spawns real children; tests substitute a scripted runner.

use std::fmt;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::types::{Step, StepOutcome};
use crate::error::{AtlasError, AtlasResult, CANCELLED_EXIT_CODE, TIMEOUT_EXIT_CODE};

pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 1_000_000;

/// How often the runner wakes to check the deadline and cancellation flag.
const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// How long to keep draining pipes once the child is gone. Grandchildren that
/// inherited the pipes can keep them open; after this we stop waiting.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Shared cancellation flag. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-step execution limits.
#[derive(Debug, Clone)]
pub struct RunControl {
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    pub cancel: CancelToken,
}

impl Default for RunControl {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_STEP_TIMEOUT,
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
            cancel: CancelToken::new(),
        }
    }
}

impl RunControl {
    pub fn new(timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            timeout,
            output_limit_bytes,
            cancel: CancelToken::new(),
        }
    }

    /// Limits for teardown commands: bounded, and deliberately detached from
    /// the run's cancellation so cleanup still happens after a cancel.
    pub fn cleanup(&self) -> Self {
        Self {
            timeout: self.timeout.min(Duration::from_secs(120)),
            output_limit_bytes: self.output_limit_bytes,
            cancel: CancelToken::new(),
        }
    }
}

/// A structured command: program plus argument list, never a shell string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<Vec<u8>>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            env: Vec::new(),
        }
    }

    /// `sh -c <line>` for operator-configured shell lines.
    pub fn shell(line: &str) -> Self {
        Self::new("sh").arg("-c").arg(line)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

impl fmt::Display for CommandSpec {
    /// Human-readable, shell-escaped rendering (display only, never executed).
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&shell_escape(&self.program))?;
        for arg in &self.args {
            write!(f, " {}", shell_escape(arg))?;
        }
        Ok(())
    }
}

/// Result of a command that was spawned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    /// `None` when the child was killed by a signal.
    pub exit_code: Option<i32>,
    /// Combined stdout/stderr, one line per output line, bounded.
    pub transcript: String,
    pub truncated_bytes: usize,
    pub timed_out: bool,
    pub cancelled: bool,
    pub duration: Duration,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        !self.timed_out && !self.cancelled && self.exit_code == Some(0)
    }

    /// Convert into a recorded step. `failure_outcome` classifies an ordinary
    /// non-zero exit (e.g. `PatchRejected` for `git apply`).
    pub fn into_step(self, name: impl Into<String>, failure_outcome: StepOutcome) -> Step {
        let (outcome, exit_code) = if self.timed_out {
            (StepOutcome::Timeout, TIMEOUT_EXIT_CODE)
        } else if self.cancelled {
            (StepOutcome::Cancelled, CANCELLED_EXIT_CODE)
        } else {
            match self.exit_code {
                Some(0) => (StepOutcome::Exited, 0),
                Some(code) => (failure_outcome, code),
                None => (failure_outcome, -1),
            }
        };
        let mut log = self.transcript;
        if self.truncated_bytes > 0 {
            log.push_str(&format!("[output truncated {} bytes]\n", self.truncated_bytes));
        }
        if self.timed_out {
            log.push_str(&format!(
                "[timed out after {}s]\n",
                self.duration.as_secs()
            ));
        }
        if self.cancelled {
            log.push_str("[cancelled]\n");
        }
        Step {
            name: name.into(),
            exit_code,
            outcome,
            log,
            duration_ms: u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Executes one external command per call.
///
/// `on_line` is invoked once per output line in the order received, stdout and
/// stderr interleaved. A non-zero exit is a normal result; only a spawn
/// failure is an error.
pub trait CommandRunner {
    fn run(
        &self,
        spec: &CommandSpec,
        workdir: &Path,
        control: &RunControl,
        on_line: &mut dyn FnMut(&str),
    ) -> AtlasResult<CommandOutcome>;
}

/// Runner that spawns real child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    #[instrument(skip_all, fields(command = %spec, timeout_secs = control.timeout.as_secs()))]
    fn run(
        &self,
        spec: &CommandSpec,
        workdir: &Path,
        control: &RunControl,
        on_line: &mut dyn FnMut(&str),
    ) -> AtlasResult<CommandOutcome> {
        let start = Instant::now();
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(workdir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        if spec.stdin.is_some() {
            cmd.stdin(Stdio::piped());
        } else {
            cmd.stdin(Stdio::null());
        }

        debug!(workdir = %workdir.display(), "spawning child process");
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                error!(err = %source, "failed to spawn command");
                return Err(AtlasError::Spawn {
                    command: spec.to_string(),
                    source,
                });
            }
        };

        // Feed stdin from its own thread so a child that writes before it
        // reads cannot deadlock against us.
        if let (Some(input), Some(mut child_stdin)) = (spec.stdin.clone(), child.stdin.take()) {
            thread::spawn(move || {
                if let Err(err) = child_stdin.write_all(&input) {
                    debug!(err = %err, "child closed stdin early");
                }
            });
        }

        let (tx, rx) = mpsc::channel::<String>();
        if let Some(stdout) = child.stdout.take() {
            spawn_line_reader(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_reader(stderr, tx.clone());
        }
        drop(tx);

        let deadline = start + control.timeout;
        let mut transcript = BoundedTranscript::new(control.output_limit_bytes);
        let mut timed_out = false;
        let mut cancelled = false;
        let mut streams_closed = false;
        let mut exit_status = None;

        while !streams_closed && exit_status.is_none() {
            if control.cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                timed_out = true;
                break;
            }
            match rx.recv_timeout(POLL_INTERVAL.min(deadline - now)) {
                Ok(line) => {
                    on_line(&line);
                    transcript.push_line(&line);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => streams_closed = true,
            }
            match child.try_wait() {
                Ok(status) => exit_status = status,
                Err(err) => warn!(err = %err, "poll for command exit failed"),
            }
        }

        let mut exit_code = exit_status.and_then(|status| status.code());
        if exit_status.is_some() {
            // A background grandchild may still hold the pipes open.
            if !streams_closed && !drain_for(&rx, DRAIN_GRACE, on_line, &mut transcript) {
                warn!("child exited but output pipes still held open; abandoning readers");
            }
        } else if !timed_out && !cancelled {
            // Pipes are closed; the child is exiting or already gone.
            let remaining = deadline.saturating_duration_since(Instant::now());
            match child.wait_timeout(remaining) {
                Ok(Some(status)) => exit_code = status.code(),
                Ok(None) => timed_out = true,
                Err(err) => warn!(err = %err, "wait for command failed"),
            }
        }

        if timed_out || cancelled {
            warn!(timed_out, cancelled, "killing command");
            if let Err(err) = child.kill() {
                debug!(err = %err, "kill failed (child already exited)");
            }
            match child.wait() {
                Ok(status) => exit_code = status.code(),
                Err(err) => warn!(err = %err, "wait after kill failed"),
            }
            if !streams_closed && !drain_for(&rx, DRAIN_GRACE, on_line, &mut transcript) {
                warn!("output pipes still open after kill; abandoning readers");
            }
        }

        let (transcript, truncated_bytes) = transcript.finish();
        if truncated_bytes > 0 {
            warn!(truncated_bytes, "output truncated");
        }
        let duration = start.elapsed();
        debug!(exit_code = ?exit_code, timed_out, cancelled, "command finished");
        Ok(CommandOutcome {
            exit_code,
            transcript,
            truncated_bytes,
            timed_out,
            cancelled,
            duration,
        })
    }
}

/// Forward buffered lines until the readers hang up or `grace` elapses.
/// Returns `true` when every reader finished.
fn drain_for(
    rx: &Receiver<String>,
    grace: Duration,
    on_line: &mut dyn FnMut(&str),
    transcript: &mut BoundedTranscript,
) -> bool {
    let grace_end = Instant::now() + grace;
    loop {
        let now = Instant::now();
        if now >= grace_end {
            return false;
        }
        match rx.recv_timeout(grace_end - now) {
            Ok(line) => {
                on_line(&line);
                transcript.push_line(&line);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return true,
        }
    }
}

fn spawn_line_reader<R: Read + Send + 'static>(reader: R, tx: Sender<String>) {
    thread::spawn(move || {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\n', '\r']).to_string();
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    debug!(err = %err, "output reader stopped");
                    break;
                }
            }
        }
    });
}

/// Transcript buffer that keeps at most `limit` bytes and counts the rest.
struct BoundedTranscript {
    buf: String,
    limit: usize,
    truncated: usize,
}

impl BoundedTranscript {
    fn new(limit: usize) -> Self {
        Self {
            buf: String::new(),
            limit,
            truncated: 0,
        }
    }

    fn push_line(&mut self, line: &str) {
        let needed = line.len() + 1;
        if self.truncated == 0 && self.buf.len() + needed <= self.limit {
            self.buf.push_str(line);
            self.buf.push('\n');
        } else {
            self.truncated += needed;
        }
    }

    fn finish(self) -> (String, usize) {
        (self.buf, self.truncated)
    }
}

fn shell_escape(input: &str) -> String {
    if !input.is_empty()
        && input
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | '/' | ':' | '=' | '@' | '%' | '^'))
    {
        return input.to_string();
    }
    let mut escaped = String::from("'");
    for ch in input.chars() {
        if ch == '\'' {
            escaped.push_str("'\"'\"'");
        } else {
            escaped.push(ch);
        }
    }
    escaped.push('\'');
    escaped
}
