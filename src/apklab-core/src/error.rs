use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::job::Stage;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failure categories surfaced by the pipelines.
///
/// Tool-related variants keep the raw captured output untouched: the
/// operator has to act on it, so it is never summarised.
#[derive(Error, Debug)]
pub enum Error {
    #[error("workspace allocation failed: {0}")]
    Allocation(String),

    #[error("workspace cleanup failed for {}: {reason}", path.display())]
    Cleanup { path: PathBuf, reason: String },

    #[error("failed to launch {tool}: {reason}")]
    Launch { tool: String, reason: String },

    #[error("{tool} failed: {reason}")]
    ToolFailure {
        tool: String,
        reason: String,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("{tool} timed out after {}s", timeout.as_secs_f64())]
    Timeout {
        tool: String,
        timeout: Duration,
        stdout: String,
        stderr: String,
    },

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("failed to fetch input: {0}")]
    Fetch(String),

    #[error("invalid project: {0}")]
    InvalidProject(String),

    #[error("manifest patch failed: {0}")]
    Patch(String),

    #[error("signing failed: {reason}")]
    Signing {
        reason: String,
        stdout: String,
        stderr: String,
    },

    #[error("packaging failed: {0}")]
    Packaging(String),

    #[error("job cancelled")]
    Cancelled,
}

impl Error {
    /// Stable category name, suitable for UIs and log filters.
    pub fn category(&self) -> &'static str {
        match self {
            Error::Allocation(_) => "allocation",
            Error::Cleanup { .. } => "cleanup",
            Error::Launch { .. } => "tool-launch",
            Error::ToolFailure { .. } => "tool-failure",
            Error::Timeout { .. } => "timeout",
            Error::InvalidOptions(_) => "invalid-options",
            Error::Fetch(_) => "fetch",
            Error::InvalidProject(_) => "invalid-project",
            Error::Patch(_) => "patch",
            Error::Signing { .. } => "signing",
            Error::Packaging(_) => "packaging",
            Error::Cancelled => "cancelled",
        }
    }

    /// Raw (stdout, stderr) of the offending tool, if any was captured.
    pub fn diagnostics(&self) -> Option<(&str, &str)> {
        match self {
            Error::ToolFailure { stdout, stderr, .. }
            | Error::Timeout { stdout, stderr, .. }
            | Error::Signing { stdout, stderr, .. } => Some((stdout, stderr)),
            _ => None,
        }
    }

    /// Re-categorise a tool error raised while signing.
    ///
    /// Credential problems need a different remedy than compile errors, so
    /// everything the signer produces is reported as `Signing`.
    pub(crate) fn into_signing(self) -> Error {
        match self {
            Error::ToolFailure { reason, stdout, stderr, .. } => Error::Signing { reason, stdout, stderr },
            Error::Timeout { tool, timeout, stdout, stderr } => Error::Signing {
                reason: format!("{} timed out after {}s", tool, timeout.as_secs_f64()),
                stdout,
                stderr,
            },
            Error::Launch { tool, reason } => Error::Signing {
                reason: format!("failed to launch {}: {}", tool, reason),
                stdout: String::new(),
                stderr: String::new(),
            },
            other => other,
        }
    }
}

/// Error returned to pipeline callers: which job, which stage, what went wrong.
#[derive(Error, Debug)]
#[error("job {job_id} failed during {stage}: {source}")]
pub struct PipelineError {
    pub job_id: String,
    pub stage: Stage,
    #[source]
    pub source: Error,
}

impl PipelineError {
    pub fn category(&self) -> &'static str {
        self.source.category()
    }

    pub fn diagnostics(&self) -> Option<(&str, &str)> {
        self.source.diagnostics()
    }
}
