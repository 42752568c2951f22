//! External tool execution for apklab.
//!
//! Provides tool invocation with:
//! - Captured stdout/stderr (read on helper threads so full pipes never stall the child)
//! - Timeout enforcement
//! - Cancellation through a shared [`CancelToken`]
//! - Process-group termination, so tools that fork (java launchers, shell
//!   wrappers) never leave orphans behind
//!
//! # Architecture
//!
//! Every invocation follows spawn → wait-or-kill → reap. The child is
//! wrapped in a guard whose `Drop` kills and reaps it, so no early return
//! can leak a running process or a zombie.
//!
//! [`ToolRunner`] is the seam between pipelines and processes: pipelines
//! only ever see `ToolStep` in, `ToolResult` out, which lets tests swap in
//! a recording runner.

use log::{debug, info, warn};
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

#[cfg(unix)]
use nix::sys::signal::{killpg, Signal};
#[cfg(unix)]
use nix::unistd::Pid;
#[cfg(unix)]
use std::os::unix::process::{CommandExt, ExitStatusExt};

use crate::error::{Error, Result};

/// Poll interval while waiting for a child.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

// ============================================================================
// Steps and results
// ============================================================================

/// A value that must never be logged or persisted (passwords).
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(****)")
    }
}

/// One command-line argument.
#[derive(Debug, Clone)]
pub enum ToolArg {
    Plain(String),
    Secret(Secret),
}

impl ToolArg {
    fn expose(&self) -> &str {
        match self {
            ToolArg::Plain(s) => s,
            ToolArg::Secret(s) => s.expose(),
        }
    }
}

impl fmt::Display for ToolArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolArg::Plain(s) => f.write_str(s),
            ToolArg::Secret(_) => f.write_str("****"),
        }
    }
}

impl From<&str> for ToolArg {
    fn from(s: &str) -> Self {
        ToolArg::Plain(s.to_string())
    }
}

impl From<String> for ToolArg {
    fn from(s: String) -> Self {
        ToolArg::Plain(s)
    }
}

impl From<&Path> for ToolArg {
    fn from(p: &Path) -> Self {
        ToolArg::Plain(p.to_string_lossy().to_string())
    }
}

/// Description of one external invocation. Immutable once built.
#[derive(Debug, Clone)]
pub struct ToolStep {
    /// Short tool name for logs and errors (e.g. "apktool")
    pub tool: String,
    pub program: String,
    pub args: Vec<ToolArg>,
    /// Working directory (must exist)
    pub cwd: PathBuf,
    pub timeout: Duration,
    /// Paths that must exist after a zero exit for the step to count as successful
    pub expected_outputs: Vec<PathBuf>,
}

impl ToolStep {
    pub fn new(tool: &str, program: &str, cwd: &Path, timeout: Duration) -> Self {
        Self {
            tool: tool.to_string(),
            program: program.to_string(),
            args: Vec::new(),
            cwd: cwd.to_path_buf(),
            timeout,
            expected_outputs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<ToolArg>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<ToolArg>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn secret_arg(mut self, secret: &Secret) -> Self {
        self.args.push(ToolArg::Secret(secret.clone()));
        self
    }

    pub fn expect_output(mut self, path: &Path) -> Self {
        self.expected_outputs.push(path.to_path_buf());
        self
    }

    /// Command line with secrets masked, safe to log.
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&arg.to_string());
        }
        line
    }
}

/// Outcome of a process that ran to completion (any exit code).
#[derive(Debug, Clone)]
pub struct ToolResult {
    /// Exit code (None if killed by a signal)
    pub exit_code: Option<i32>,
    /// Signal number (if killed by signal)
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ToolResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn duration_ms(&self) -> u128 {
        self.duration.as_millis()
    }
}

// ============================================================================
// Cancellation
// ============================================================================

/// Shared cancellation flag for one job.
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

    pub(crate) fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

// ============================================================================
// Runners
// ============================================================================

/// Runs a step and reports how the process ended.
///
/// Implementations return `Ok` for any process that exited on its own,
/// whatever its exit code; `Launch`, `Timeout` and `Cancelled` are the only
/// errors. Judging success is left to [`execute_step`].
pub trait ToolRunner: Send + Sync {
    fn run(&self, step: &ToolStep, cancel: &CancelToken) -> Result<ToolResult>;
}

/// Runs steps as real child processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

impl ToolRunner for ProcessRunner {
    fn run(&self, step: &ToolStep, cancel: &CancelToken) -> Result<ToolResult> {
        cancel.check()?;

        debug!("tool={} cwd={} Spawning: {}", step.tool, step.cwd.display(), step.command_line());

        let mut cmd = Command::new(&step.program);
        cmd.args(step.args.iter().map(ToolArg::expose))
            .current_dir(&step.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // Own process group: the whole tree can be signalled at once
        #[cfg(unix)]
        cmd.process_group(0);

        let start = Instant::now();
        let child = cmd.spawn().map_err(|e| Error::Launch {
            tool: step.tool.clone(),
            reason: format!("{}: {}", step.program, e),
        })?;
        let mut guard = ChildGuard::new(child);

        let stdout = capture(guard.child.stdout.take());
        let stderr = capture(guard.child.stderr.take());

        let outcome = loop {
            match guard.child.try_wait() {
                Ok(Some(status)) => {
                    guard.reaped = true;
                    // Leftover background children still hold the pipes
                    guard.kill_tree();
                    break Ok(status);
                }
                Ok(None) => {}
                Err(e) => {
                    break Err(Error::Launch {
                        tool: step.tool.clone(),
                        reason: format!("wait failed: {}", e),
                    })
                }
            }

            if cancel.is_cancelled() {
                warn!("tool={} Cancellation requested, terminating process group", step.tool);
                guard.terminate();
                break Err(Error::Cancelled);
            }

            if start.elapsed() > step.timeout {
                warn!(
                    "tool={} Timed out after {:?}, terminating process group",
                    step.tool, step.timeout
                );
                guard.terminate();
                break Err(Error::Timeout {
                    tool: step.tool.clone(),
                    timeout: step.timeout,
                    stdout: String::new(),
                    stderr: String::new(),
                });
            }

            std::thread::sleep(POLL_INTERVAL);
        };

        let stdout = join_capture(stdout);
        let stderr = join_capture(stderr);
        let duration = start.elapsed();

        match outcome {
            Ok(status) => {
                let result = to_result(status, stdout, stderr, duration);
                info!(
                    "tool={} exit_code={:?} duration_ms={} Tool finished",
                    step.tool,
                    result.exit_code,
                    result.duration_ms()
                );
                Ok(result)
            }
            Err(Error::Timeout { tool, timeout, .. }) => Err(Error::Timeout {
                tool,
                timeout,
                stdout,
                stderr,
            }),
            Err(e) => Err(e),
        }
    }
}

fn to_result(status: ExitStatus, stdout: String, stderr: String, duration: Duration) -> ToolResult {
    #[cfg(unix)]
    let signal = status.signal();
    #[cfg(not(unix))]
    let signal = None;

    ToolResult {
        exit_code: status.code(),
        signal,
        stdout,
        stderr,
        duration,
    }
}

/// Owns a running child; kills the process group and reaps on drop.
struct ChildGuard {
    child: Child,
    reaped: bool,
}

impl ChildGuard {
    fn new(child: Child) -> Self {
        Self { child, reaped: false }
    }

    /// Signal every process in the child's group.
    fn kill_tree(&mut self) {
        #[cfg(unix)]
        {
            // Process group id == child pid (process_group(0))
            let pgid = Pid::from_raw(self.child.id() as i32);
            if let Err(e) = killpg(pgid, Signal::SIGKILL) {
                if e != nix::errno::Errno::ESRCH {
                    warn!("Failed to kill process group {}: {}", pgid, e);
                }
            }
        }
        if !self.reaped {
            let _ = self.child.kill();
        }
    }

    /// Kill the tree and reap the direct child.
    fn terminate(&mut self) {
        self.kill_tree();
        if !self.reaped {
            let _ = self.child.wait();
            self.reaped = true;
        }
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if !self.reaped {
            self.terminate();
        }
    }
}

fn capture<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<String>> {
    pipe.map(|mut pipe| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

fn join_capture(handle: Option<JoinHandle<String>>) -> String {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

// ============================================================================
// Success predicate
// ============================================================================

/// Run a step and apply its success predicate.
///
/// Success = exit code 0 and every expected output present. Anything else
/// becomes `ToolFailure` with the raw output attached.
pub fn execute_step(runner: &dyn ToolRunner, step: &ToolStep, cancel: &CancelToken) -> Result<ToolResult> {
    info!("tool={} Running: {}", step.tool, step.command_line());
    let result = runner.run(step, cancel)?;

    if !result.success() {
        let reason = match (result.exit_code, result.signal) {
            (Some(code), _) => format!("exit code {}", code),
            (None, Some(signal)) => format!("killed by signal {}", signal),
            (None, None) => "terminated unexpectedly".to_string(),
        };
        return Err(Error::ToolFailure {
            tool: step.tool.clone(),
            reason,
            exit_code: result.exit_code,
            stdout: result.stdout,
            stderr: result.stderr,
        });
    }

    let missing: Vec<String> = step
        .expected_outputs
        .iter()
        .filter(|p| !p.exists())
        .map(|p| p.display().to_string())
        .collect();
    if !missing.is_empty() {
        return Err(Error::ToolFailure {
            tool: step.tool.clone(),
            reason: format!("exited 0 but did not produce: {}", missing.join(", ")),
            exit_code: result.exit_code,
            stdout: result.stdout,
            stderr: result.stderr,
        });
    }

    Ok(result)
}
