//! Job model for apklab.
//!
//! A job is one decompile or one rebuild request. It is owned by the
//! pipeline running it and records every state transition so callers can
//! see exactly where a failure happened.

use chrono::{DateTime, Utc};
use log::info;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::options::OptionSet;
use crate::workspace::validate_path_component;

// ============================================================================
// Job kinds, inputs and states
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Decompile,
    Rebuild,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Decompile => write!(f, "decompile"),
            JobKind::Rebuild => write!(f, "rebuild"),
        }
    }
}

/// Where the job's input comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobInput {
    /// Uploaded or local file (package or project archive)
    File(PathBuf),
    /// Remote package URL (decompile only)
    Url(String),
}

impl JobInput {
    /// File stem used to name the artifact (e.g. "app" for app.apk).
    pub fn stem(&self) -> String {
        let stem = match self {
            JobInput::File(path) => path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string()),
            JobInput::Url(url) => url
                .rsplit('/')
                .next()
                .and_then(|last| last.split(['?', '#']).next())
                .and_then(|name| name.strip_suffix(".apk"))
                .map(|s| s.to_string()),
        };

        // Stems end up in artifact file names
        match stem {
            Some(s) if validate_path_component(&s).is_ok() => s,
            _ => "package".to_string(),
        }
    }
}

/// Working stages of both pipelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Validating,
    Fetching,
    Disassembling,
    RenderingSource,
    Scanning,
    Patching,
    Packaging,
    Unpacking,
    Compiling,
    Signing,
    Publishing,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Validating => "validating",
            Stage::Fetching => "fetching",
            Stage::Disassembling => "disassembling",
            Stage::RenderingSource => "rendering_source",
            Stage::Scanning => "scanning",
            Stage::Patching => "patching",
            Stage::Packaging => "packaging",
            Stage::Unpacking => "unpacking",
            Stage::Compiling => "compiling",
            Stage::Signing => "signing",
            Stage::Publishing => "publishing",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "stage", rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running(Stage),
    Done,
    Failed(Stage),
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Failed(_))
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Pending => write!(f, "pending"),
            JobState::Running(stage) => write!(f, "{}", stage),
            JobState::Done => write!(f, "done"),
            JobState::Failed(stage) => write!(f, "failed({})", stage),
        }
    }
}

// ============================================================================
// Job
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    /// Unique job identifier, also the workspace directory name
    pub id: String,
    pub kind: JobKind,
    pub input: JobInput,
    pub options: OptionSet,
    pub created_at: DateTime<Utc>,
    /// SHA-256 of the staged input, filled in once fetched
    pub input_sha256: Option<String>,
    state: JobState,
    history: Vec<JobState>,
}

impl Job {
    /// Create a job with a generated identifier.
    pub fn new(input: JobInput, options: OptionSet) -> Self {
        let kind = options.kind();
        let id = format!("{}-{}", kind, Uuid::new_v4().simple());
        Self::build(id, kind, input, options)
    }

    /// Create a job with a caller-chosen identifier.
    ///
    /// The id names the workspace directory, so it must be a single safe
    /// path component.
    pub fn with_id(id: &str, input: JobInput, options: OptionSet) -> Result<Self> {
        validate_path_component(id)
            .map_err(|e| Error::InvalidOptions(format!("invalid job id: {:#}", e)))?;
        let kind = options.kind();
        Ok(Self::build(id.to_string(), kind, input, options))
    }

    fn build(id: String, kind: JobKind, input: JobInput, options: OptionSet) -> Self {
        Self {
            id,
            kind,
            input,
            options,
            created_at: Utc::now(),
            input_sha256: None,
            state: JobState::Pending,
            history: vec![JobState::Pending],
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Every state the job has been in, oldest first.
    pub fn history(&self) -> &[JobState] {
        &self.history
    }

    /// Stage the job is currently in (Validating while still pending).
    pub fn current_stage(&self) -> Stage {
        match self.state {
            JobState::Running(stage) | JobState::Failed(stage) => stage,
            JobState::Pending | JobState::Done => Stage::Validating,
        }
    }

    pub(crate) fn enter(&mut self, stage: Stage) {
        self.transition(JobState::Running(stage));
    }

    pub(crate) fn finish(&mut self) {
        self.transition(JobState::Done);
    }

    pub(crate) fn fail(&mut self) {
        let stage = self.current_stage();
        self.transition(JobState::Failed(stage));
    }

    fn transition(&mut self, next: JobState) {
        info!("job={} kind={} state={} -> {}", self.id, self.kind, self.state, next);
        self.state = next;
        self.history.push(next);
    }

    /// Stages the job actually ran, in order.
    pub fn stages(&self) -> Vec<Stage> {
        self.history
            .iter()
            .filter_map(|s| match s {
                JobState::Running(stage) => Some(*stage),
                _ => None,
            })
            .collect()
    }
}
