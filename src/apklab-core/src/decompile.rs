//! Decompile pipeline.
//!
//! ```text
//! Validating → Fetching → Disassembling → [RenderingSource] → [Scanning]
//!            → [Patching] → Packaging → Done
//! ```
//!
//! Workspace layout while running:
//! - `in/<package>.apk`           staged input
//! - `out/decoded/`               apktool output (patched in place)
//! - `out/java_sources/`          jadx output
//! - `out/reports/`               scanner report, pipeline notes
//!
//! The archive mirrors it: decoded tree at the root, then `java_sources/`
//! and `reports/`, so it can be fed straight back into a rebuild.

use log::{info, warn};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::time::Instant;

use crate::archive::{self, PackSource};
use crate::artifacts::{Artifact, ArtifactKind};
use crate::config::OptionalStepPolicy;
use crate::error::{Error, PipelineError, Result};
use crate::execution::{execute_step, CancelToken, ToolResult};
use crate::fetch::stage_input;
use crate::job::{Job, Stage};
use crate::manifest::{patch_manifest, PatchOutcome};
use crate::options::{DecompileOptions, OptionSet};
use crate::orchestrator::Orchestrator;
use crate::workspace::Workspace;

const NOTES_FILE: &str = "pipeline-notes.txt";
const SCAN_REPORT: &str = "quark-report.json";

/// A degraded optional step, recorded for the archive.
struct StepNote {
    stage: Stage,
    tool: String,
    error: Error,
}

impl Orchestrator {
    /// Decompile `job`'s package into an archive artifact.
    pub fn decompile(&self, job: &mut Job, cancel: &CancelToken) -> std::result::Result<Artifact, PipelineError> {
        let started = Instant::now();
        job.enter(Stage::Validating);

        let opts = match &job.options {
            OptionSet::Decompile(opts) => opts.clone(),
            OptionSet::Rebuild(_) => {
                let err = Error::InvalidOptions(format!("job {} is not a decompile job", job.id));
                return Err(self.fail(job, err));
            }
        };
        if let Err(e) = opts.validate().and_then(|_| cancel.check()) {
            return Err(self.fail(job, e));
        }

        let workspace = match self.workspaces.acquire(&job.id) {
            Ok(ws) => ws,
            Err(e) => return Err(self.fail(job, e)),
        };

        let outcome = self.decompile_in(job, &opts, &workspace, cancel);
        self.conclude(job, workspace, outcome, started)
    }

    fn decompile_in(
        &self,
        job: &mut Job,
        opts: &DecompileOptions,
        ws: &Workspace,
        cancel: &CancelToken,
    ) -> Result<Artifact> {
        let runner = self.runner.as_ref();

        job.enter(Stage::Fetching);
        let staged = stage_input(&job.input, &ws.in_dir, "input.apk", &self.fetch)?;
        job.input_sha256 = Some(staged.sha256.clone());
        let apk = staged.path;
        cancel.check()?;

        job.enter(Stage::Disassembling);
        let decoded = ws.out_dir.join("decoded");
        execute_step(runner, &self.toolchain.decode(&apk, &decoded, opts, &ws.root), cancel)?;

        // Rendering and scanning only read the input package
        let mut notes = Vec::new();
        let java_sources = ws.out_dir.join("java_sources");
        let reports = ws.out_dir.join("reports");

        let mut rendered = false;
        if opts.render_source {
            job.enter(Stage::RenderingSource);
            let step = self.toolchain.render(&apk, &java_sources, opts, &ws.root);
            let outcome = execute_step(runner, &step, cancel);
            rendered = self.optional_step(job, &step.tool, outcome, &mut notes)?;
        }

        let mut scanned = false;
        if opts.scan {
            job.enter(Stage::Scanning);
            let step = self.toolchain.scan(&apk, &reports.join(SCAN_REPORT), &ws.root);
            let outcome = fs::create_dir_all(&reports)
                .map_err(|e| Error::Launch {
                    tool: step.tool.clone(),
                    reason: format!("cannot create {}: {}", reports.display(), e),
                })
                .and_then(|_| execute_step(runner, &step, cancel));
            scanned = self.optional_step(job, &step.tool, outcome, &mut notes)?;
        }

        if opts.mitm_patch {
            job.enter(Stage::Patching);
            cancel.check()?;
            match patch_manifest(&decoded, &self.patch_spec)? {
                PatchOutcome::Replaced { previous } => {
                    info!("job={} Replaced existing network security config {}", job.id, previous)
                }
                PatchOutcome::AlreadyPatched => info!("job={} Manifest already patched", job.id),
                PatchOutcome::Applied => {}
            }
        }

        job.enter(Stage::Packaging);
        cancel.check()?;
        if !notes.is_empty() {
            create_dir(&reports)?;
            write_notes(&reports.join(NOTES_FILE), &notes)?;
        }

        // Output of a failed optional step is incomplete; only its note ships
        let mut sources = vec![PackSource::new(&decoded)];
        if rendered && java_sources.is_dir() {
            sources.push(PackSource::new(&java_sources).with_prefix("java_sources"));
        }
        if reports.is_dir() {
            let mut source = PackSource::new(&reports).with_prefix("reports");
            if !scanned {
                source = source.with_filter(|relative| relative != Path::new(SCAN_REPORT));
            }
            sources.push(source);
        }

        let name = format!("{}-decompiled.{}", job.input.stem(), self.format.extension());
        let format = self.format;
        self.artifacts
            .publish_with(&job.id, &name, ArtifactKind::DecompiledProject, |path| {
                archive::pack(&sources, path, format).map(|members| {
                    info!("job={} Archived {} members", job.id, members.len());
                })
            })
    }

    /// Apply the configured failure policy to an optional step's outcome.
    ///
    /// Returns whether the step succeeded; a degraded failure is recorded in
    /// `notes` instead.
    fn optional_step(
        &self,
        job: &Job,
        tool: &str,
        outcome: Result<ToolResult>,
        notes: &mut Vec<StepNote>,
    ) -> Result<bool> {
        match outcome {
            Ok(_) => Ok(true),
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) if self.policy == OptionalStepPolicy::Degrade => {
                warn!(
                    "job={} stage={} tool={} Optional step failed, continuing: {}",
                    job.id,
                    job.current_stage(),
                    tool,
                    e
                );
                notes.push(StepNote {
                    stage: job.current_stage(),
                    tool: tool.to_string(),
                    error: e,
                });
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

fn create_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| Error::Packaging(format!("cannot create {}: {}", dir.display(), e)))
}

fn write_notes(path: &Path, notes: &[StepNote]) -> Result<()> {
    let mut text = String::new();
    for note in notes {
        let _ = writeln!(text, "stage: {}", note.stage);
        let _ = writeln!(text, "tool: {}", note.tool);
        let _ = writeln!(text, "error: {}", note.error);
        if let Some((stdout, stderr)) = note.error.diagnostics() {
            let _ = writeln!(text, "--- stdout ---\n{}", stdout.trim_end());
            let _ = writeln!(text, "--- stderr ---\n{}", stderr.trim_end());
        }
        text.push('\n');
    }
    fs::write(path, text).map_err(|e| Error::Packaging(format!("cannot write {}: {}", path.display(), e)))
}
