//! Process Runner: spawns one agent executable and captures its output.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::env::ComposedEnvironment;
use crate::error::ProcessError;

/// Marker placed between stdout and stderr in combined output.
pub const STDERR_MARKER: &str = "\n\n----- STDERR -----\n";

/// Exit code reported when the executable cannot be found.
pub const EXIT_NOT_FOUND: i32 = 127;

/// Exit code reported when the deadline expires.
pub const EXIT_TIMED_OUT: i32 = 124;

/// How long to keep draining pipes after the child has gone.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// What to launch.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub stdin: Option<String>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<PathBuf>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            stdin: None,
        }
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

    /// Text written to the child's stdin, which is then closed.
    pub fn with_stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Command line for logging.
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.display().to_string()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

/// How the child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The process ran and exited on its own.
    Exited,
    /// The executable could not be found.
    NotFound,
    /// The deadline expired and the process was killed.
    TimedOut,
}

/// Captured result of one child process.
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub termination: Termination,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed: Duration,
}

impl ProcessOutcome {
    /// An outcome for an executable that was never started.
    pub fn not_found(program: &Path) -> Self {
        let now = Utc::now();
        Self {
            stdout: String::new(),
            stderr: format!("{}: command not found", program.display()),
            exit_code: EXIT_NOT_FOUND,
            termination: Termination::NotFound,
            started_at: now,
            finished_at: now,
            elapsed: Duration::ZERO,
        }
    }

    /// Builds an outcome from already captured text. Used by tests and replays.
    pub fn from_parts(stdout: impl Into<String>, stderr: impl Into<String>, exit_code: i32) -> Self {
        let now = Utc::now();
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code,
            termination: Termination::Exited,
            started_at: now,
            finished_at: now,
            elapsed: Duration::ZERO,
        }
    }

    /// Stdout and stderr joined by [`STDERR_MARKER`] when both are non-empty.
    pub fn combined_output(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (false, false) => format!("{}{}{}", self.stdout, STDERR_MARKER, self.stderr),
            (false, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (true, true) => String::new(),
        }
    }

    pub fn runtime_seconds(&self) -> f64 {
        self.elapsed.as_secs_f64()
    }

    pub fn is_success(&self) -> bool {
        self.termination == Termination::Exited && self.exit_code == 0
    }
}

/// Returns the stdout part of a combined output string.
pub fn stdout_only(combined: &str) -> &str {
    match combined.find(STDERR_MARKER) {
        Some(idx) => &combined[..idx],
        None => combined,
    }
}

/// Spawns child processes with a fully composed environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }

    /// Runs a process to completion or until the deadline.
    ///
    /// The inherited environment is cleared and only `env` is applied.
    /// A missing executable yields [`Termination::NotFound`] rather than an error.
    pub async fn run(
        &self,
        spec: &ProcessSpec,
        env: &ComposedEnvironment,
        timeout: Option<Duration>,
    ) -> Result<ProcessOutcome, ProcessError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.cwd)
            .env_clear()
            .envs(env.iter())
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("Spawning: {}", spec.display());

        let started_at = Utc::now();
        let start = Instant::now();

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Executable not found: {}", spec.program.display());
                return Ok(ProcessOutcome::not_found(&spec.program));
            }
            Err(source) => {
                return Err(ProcessError::Spawn {
                    program: spec.program.display().to_string(),
                    source,
                });
            }
        };

        info!("Started {} (pid {:?})", spec.program.display(), child.id());

        let stdout_buf = Arc::new(Mutex::new(Vec::new()));
        let stderr_buf = Arc::new(Mutex::new(Vec::new()));
        let stdout_task = child
            .stdout
            .take()
            .map(|pipe| spawn_reader(pipe, Arc::clone(&stdout_buf)));
        let stderr_task = child
            .stderr
            .take()
            .map(|pipe| spawn_reader(pipe, Arc::clone(&stderr_buf)));

        // fed concurrently so a child that never reads stdin still hits the deadline
        let stdin_task = match (spec.stdin.clone(), child.stdin.take()) {
            (Some(input), Some(mut stdin)) => Some(tokio::spawn(async move {
                let written = stdin.write_all(input.as_bytes()).await;
                drop(stdin);
                written
            })),
            _ => None,
        };

        let (exit_code, termination) = match timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => (exit_code_of(status.map_err(ProcessError::Wait)?), Termination::Exited),
                Err(_) => {
                    warn!("Deadline of {:?} expired, killing {}", limit, spec.program.display());
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill child: {}", e);
                    }
                    (EXIT_TIMED_OUT, Termination::TimedOut)
                }
            },
            None => (
                exit_code_of(child.wait().await.map_err(ProcessError::Wait)?),
                Termination::Exited,
            ),
        };

        if let Some(task) = stdin_task {
            if termination == Termination::TimedOut {
                task.abort();
            } else if let Ok(Ok(Err(e))) = tokio::time::timeout(DRAIN_GRACE, task).await {
                // a child that exits without reading stdin closes the pipe early
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(ProcessError::Stdin(e));
                }
            }
        }

        for task in [stdout_task, stderr_task].into_iter().flatten() {
            if tokio::time::timeout(DRAIN_GRACE, task).await.is_err() {
                debug!("Output pipe still open after child exit, keeping partial capture");
            }
        }

        let elapsed = start.elapsed();
        let outcome = ProcessOutcome {
            stdout: take_text(&stdout_buf),
            stderr: take_text(&stderr_buf),
            exit_code,
            termination,
            started_at,
            finished_at: Utc::now(),
            elapsed,
        };

        info!(
            "{} finished in {:.2}s with exit code {}",
            spec.program.display(),
            elapsed.as_secs_f64(),
            exit_code
        );

        Ok(outcome)
    }
}

fn spawn_reader<R>(mut pipe: R, buf: Arc<Mutex<Vec<u8>>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    if let Ok(mut guard) = buf.lock() {
                        guard.extend_from_slice(&chunk[..n]);
                    }
                }
                Err(e) => {
                    warn!("Error reading child output: {}", e);
                    break;
                }
            }
        }
    })
}

fn take_text(buf: &Arc<Mutex<Vec<u8>>>) -> String {
    match buf.lock() {
        Ok(guard) => String::from_utf8_lossy(&guard).into_owned(),
        Err(poisoned) => String::from_utf8_lossy(&poisoned.into_inner()).into_owned(),
    }
}

#[cfg(unix)]
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(1)
}

#[cfg(not(unix))]
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}
