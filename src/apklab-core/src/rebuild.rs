//! Rebuild pipeline.
//!
//! ```text
//! Validating → Unpacking → Compiling → Signing → Publishing → Done
//! ```
//!
//! Credentials are checked before a workspace is allocated. Anything that
//! goes wrong inside the signer is reported as `Signing`, never as a
//! compile failure.

use log::{debug, info};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::archive;
use crate::artifacts::{Artifact, ArtifactKind};
use crate::error::{Error, PipelineError, Result};
use crate::execution::{execute_step, CancelToken, Secret, ToolRunner};
use crate::fetch::stage_input;
use crate::job::{Job, JobInput, Stage};
use crate::options::{OptionSet, RebuildOptions};
use crate::orchestrator::Orchestrator;
use crate::tools::{signed_output_path, Toolchain};
use crate::workspace::Workspace;

/// Files that mark the root of a decoded project.
const PROJECT_MARKERS: [&str; 2] = ["apktool.yml", "AndroidManifest.xml"];

/// Keystore credentials. Passwords are held as [`Secret`]s and only ever
/// handed to the signer process.
#[derive(Debug, Clone)]
pub struct SigningCredentials {
    pub keystore: PathBuf,
    pub store_password: Secret,
    pub alias: String,
    /// Defaults to the store password
    pub key_password: Option<Secret>,
}

impl SigningCredentials {
    pub fn validate(&self) -> Result<()> {
        let missing = |what: &str| Error::Signing {
            reason: format!("missing {}", what),
            stdout: String::new(),
            stderr: String::new(),
        };

        if !self.keystore.is_file() {
            return Err(Error::Signing {
                reason: format!("keystore not found: {}", self.keystore.display()),
                stdout: String::new(),
                stderr: String::new(),
            });
        }
        if self.alias.trim().is_empty() {
            return Err(missing("key alias"));
        }
        if self.store_password.is_empty() {
            return Err(missing("keystore password"));
        }
        if self.key_password.as_ref().map_or(false, Secret::is_empty) {
            return Err(missing("key password"));
        }
        Ok(())
    }
}

/// Sign `unsigned` into `out_dir` and return the signed package path.
pub fn sign_package(
    runner: &dyn ToolRunner,
    toolchain: &Toolchain,
    unsigned: &Path,
    out_dir: &Path,
    creds: &SigningCredentials,
    cancel: &CancelToken,
) -> Result<PathBuf> {
    creds.validate()?;
    fs::create_dir_all(out_dir).map_err(|e| Error::Signing {
        reason: format!("cannot create {}: {}", out_dir.display(), e),
        stdout: String::new(),
        stderr: String::new(),
    })?;

    // The signer runs in `out_dir`; a relative keystore must not resolve there
    let keystore = fs::canonicalize(&creds.keystore).map_err(|e| Error::Signing {
        reason: format!("cannot resolve keystore {}: {}", creds.keystore.display(), e),
        stdout: String::new(),
        stderr: String::new(),
    })?;
    let creds = SigningCredentials {
        keystore,
        ..creds.clone()
    };

    let step = toolchain.sign(unsigned, out_dir, &creds, out_dir);
    execute_step(runner, &step, cancel).map_err(Error::into_signing)?;

    let signed = signed_output_path(unsigned, out_dir);
    info!("Signed {} -> {}", unsigned.display(), signed.display());
    Ok(signed)
}

/// Directory holding the decoded project: `dir` itself or its only subdirectory.
pub(crate) fn find_project_root(dir: &Path) -> Result<PathBuf> {
    let is_project = |p: &Path| PROJECT_MARKERS.iter().all(|m| p.join(m).is_file());

    if is_project(dir) {
        return Ok(dir.to_path_buf());
    }

    let entries = fs::read_dir(dir).map_err(|e| Error::InvalidProject(format!("cannot read {}: {}", dir.display(), e)))?;
    let subdirs: Vec<PathBuf> = entries
        .flatten()
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter(|e| {
            let name = e.file_name();
            let name = name.to_string_lossy();
            !name.starts_with('.') && name != "__MACOSX"
        })
        .map(|e| e.path())
        .collect();

    match subdirs.as_slice() {
        [only] if is_project(only) => {
            debug!("Project root is nested: {}", only.display());
            Ok(only.clone())
        }
        _ => Err(Error::InvalidProject(format!(
            "archive does not contain a decoded project ({} at its root or in a single top-level directory)",
            PROJECT_MARKERS.join(" and ")
        ))),
    }
}

impl Orchestrator {
    /// Rebuild and sign `job`'s project archive.
    pub fn rebuild(
        &self,
        job: &mut Job,
        creds: &SigningCredentials,
        cancel: &CancelToken,
    ) -> std::result::Result<Artifact, PipelineError> {
        let started = Instant::now();
        job.enter(Stage::Validating);

        let opts = match &job.options {
            OptionSet::Rebuild(opts) => opts.clone(),
            OptionSet::Decompile(_) => {
                let err = Error::InvalidOptions(format!("job {} is not a rebuild job", job.id));
                return Err(self.fail(job, err));
            }
        };
        if let JobInput::Url(_) = job.input {
            let err = Error::InvalidOptions("rebuild jobs take an uploaded project archive, not a URL".to_string());
            return Err(self.fail(job, err));
        }
        if let Err(e) = creds.validate().and_then(|_| cancel.check()) {
            return Err(self.fail(job, e));
        }

        let workspace = match self.workspaces.acquire(&job.id) {
            Ok(ws) => ws,
            Err(e) => return Err(self.fail(job, e)),
        };

        let outcome = self.rebuild_in(job, &opts, creds, &workspace, cancel);
        self.conclude(job, workspace, outcome, started)
    }

    fn rebuild_in(
        &self,
        job: &mut Job,
        opts: &RebuildOptions,
        creds: &SigningCredentials,
        ws: &Workspace,
        cancel: &CancelToken,
    ) -> Result<Artifact> {
        let runner = self.runner.as_ref();

        job.enter(Stage::Unpacking);
        let staged = stage_input(&job.input, &ws.in_dir, "project.zip", &self.fetch)?;
        job.input_sha256 = Some(staged.sha256.clone());
        let unpacked = ws.out_dir.join("project");
        fs::create_dir(&unpacked)
            .map_err(|e| Error::InvalidProject(format!("cannot create {}: {}", unpacked.display(), e)))?;
        archive::unpack(&staged.path, &unpacked)?;
        let project = find_project_root(&unpacked)?;
        cancel.check()?;

        job.enter(Stage::Compiling);
        let unsigned = ws.work_dir.join("rebuilt-unsigned.apk");
        execute_step(runner, &self.toolchain.build(&project, &unsigned, opts, &ws.root), cancel)?;

        job.enter(Stage::Signing);
        let signed = sign_package(runner, &self.toolchain, &unsigned, &ws.work_dir.join("signed"), creds, cancel)?;

        // Copy out before the workspace goes away
        job.enter(Stage::Publishing);
        let name = format!("{}-signed.apk", job.input.stem());
        self.artifacts
            .publish_file(&job.id, &name, ArtifactKind::SignedPackage, &signed)
    }
}
