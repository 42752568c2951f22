//! Pipeline orchestrator.
//!
//! Owns everything the pipelines share: the workspace manager, the
//! configured toolchain, the tool runner and the artifact store. The
//! pipelines themselves live in `decompile` and `rebuild`; both follow the
//! same shape:
//!
//! ```text
//! validate → acquire workspace → stages... → publish artifact → release
//! ```
//!
//! Validation happens before the workspace exists, so an invalid request
//! never touches the filesystem or spawns a process. The workspace is
//! released on every path, success or failure.

use log::{error, info, warn};
use std::sync::Arc;

use crate::archive::ArchiveFormat;
use crate::artifacts::{Artifact, ArtifactStore};
use crate::config::{FetchConfig, OptionalStepPolicy, OrchestratorConfig};
use crate::error::{Error, PipelineError};
use crate::execution::{CancelToken, ProcessRunner, ToolRunner};
use crate::job::Job;
use crate::manifest::ManifestPatchSpec;
use crate::rebuild::SigningCredentials;
use crate::tools::Toolchain;
use crate::workspace::{Workspace, WorkspaceManager};

/// What to do with a job, beyond what its options say.
#[derive(Debug, Clone)]
pub enum Work {
    Decompile,
    Rebuild(SigningCredentials),
}

pub struct Orchestrator {
    pub(crate) workspaces: WorkspaceManager,
    pub(crate) toolchain: Toolchain,
    pub(crate) runner: Arc<dyn ToolRunner>,
    pub(crate) artifacts: ArtifactStore,
    pub(crate) format: ArchiveFormat,
    pub(crate) policy: OptionalStepPolicy,
    pub(crate) patch_spec: ManifestPatchSpec,
    pub(crate) fetch: FetchConfig,
}

impl Orchestrator {
    /// Orchestrator running real processes.
    pub fn new(config: &OrchestratorConfig) -> Result<Self, Error> {
        Self::with_runner(config, Arc::new(ProcessRunner::new()))
    }

    /// Orchestrator with a custom tool runner (tests, remote execution).
    ///
    /// Relative paths in `config` are resolved against the current directory.
    pub fn with_runner(config: &OrchestratorConfig, runner: Arc<dyn ToolRunner>) -> Result<Self, Error> {
        let base = std::env::current_dir()
            .map_err(|e| Error::Allocation(format!("cannot determine current directory: {}", e)))?;
        let mut config = config.clone();
        config.anchor_paths(&base);

        let workspaces = WorkspaceManager::new(&config.workspace.base_dir, config.workspace.limits())?;
        let artifacts = ArtifactStore::new(&config.artifacts.dir)?;
        let patch = &config.pipeline.patch;

        Ok(Self {
            workspaces,
            toolchain: Toolchain::new(&config.tools, &config.timeouts),
            runner,
            artifacts,
            format: config.artifacts.format,
            policy: config.pipeline.optional_step_failure,
            patch_spec: ManifestPatchSpec::interception(patch.cleartext_traffic, patch.debuggable),
            fetch: config.fetch.clone(),
        })
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub fn toolchain(&self) -> &Toolchain {
        &self.toolchain
    }

    pub fn runner(&self) -> &dyn ToolRunner {
        self.runner.as_ref()
    }

    /// Run `job` with the pipeline matching `work`.
    pub fn run(&self, job: &mut Job, work: &Work, cancel: &CancelToken) -> Result<Artifact, PipelineError> {
        match work {
            Work::Decompile => self.decompile(job, cancel),
            Work::Rebuild(creds) => self.rebuild(job, creds, cancel),
        }
    }

    /// Mark `job` failed at its current stage and wrap the cause.
    pub(crate) fn fail(&self, job: &mut Job, source: Error) -> PipelineError {
        job.fail();
        let stage = job.current_stage();
        error!(
            "job={} kind={} stage={} category={} {}",
            job.id,
            job.kind,
            stage,
            source.category(),
            source
        );
        PipelineError {
            job_id: job.id.clone(),
            stage,
            source,
        }
    }

    /// Release a workspace; cleanup problems are logged, never propagated.
    pub(crate) fn release(&self, workspace: Workspace) {
        let job_id = workspace.job_id().to_string();
        if let Err(e) = workspace.release() {
            warn!("job={} {}", job_id, e);
        }
    }

    /// Common tail of both pipelines.
    pub(crate) fn conclude(
        &self,
        job: &mut Job,
        workspace: Workspace,
        outcome: Result<Artifact, Error>,
        started: std::time::Instant,
    ) -> Result<Artifact, PipelineError> {
        // Artifact is already in the store: releasing cannot lose it
        self.release(workspace);

        match outcome {
            Ok(artifact) => {
                job.finish();
                info!(
                    "job={} kind={} artifact={} duration_ms={} Job completed",
                    job.id,
                    job.kind,
                    artifact.path.display(),
                    started.elapsed().as_millis()
                );
                Ok(artifact)
            }
            Err(e) => Err(self.fail(job, e)),
        }
    }
}
