//! Orchestrator configuration.
//!
//! Every section and field has a default, so an empty document (or no
//! config file at all) yields a working setup that expects the tools under
//! `./tools` the way the upstream distribution lays them out.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::archive::ArchiveFormat;
use crate::tools::ToolCommand;
use crate::workspace::WorkspaceLimits;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub artifacts: ArtifactsConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
}

impl OrchestratorConfig {
    /// Resolve every relative path (directories, tool commands) against `base`.
    ///
    /// Tools run with the job workspace as working directory, so paths from
    /// a config file or the defaults must not stay relative.
    pub fn anchor_paths(&mut self, base: &Path) {
        anchor_dir(&mut self.workspace.base_dir, base);
        anchor_dir(&mut self.artifacts.dir, base);
        for command in [
            &mut self.tools.apktool,
            &mut self.tools.jadx,
            &mut self.tools.quark,
            &mut self.tools.signer,
        ] {
            command.anchor(base);
        }
        if let Some(dir) = self.tools.framework_dir.as_mut() {
            anchor_dir(dir, base);
        }
    }
}

fn anchor_dir(dir: &mut PathBuf, base: &Path) {
    if dir.is_relative() {
        *dir = base.join(&*dir);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    #[serde(default = "default_work_dir")]
    pub base_dir: PathBuf,
    /// Workspaces alive at once; also the scheduler's worker count
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Refuse new jobs once the base directory holds this much data
    #[serde(default)]
    pub max_disk_mb: Option<u64>,
    /// Keep workspaces after jobs finish (debugging)
    #[serde(default)]
    pub keep: bool,
}

fn default_work_dir() -> PathBuf {
    std::env::temp_dir().join("apklab").join("work")
}

fn default_max_concurrent() -> usize {
    4
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            base_dir: default_work_dir(),
            max_concurrent: default_max_concurrent(),
            max_disk_mb: None,
            keep: false,
        }
    }
}

impl WorkspaceConfig {
    pub fn limits(&self) -> WorkspaceLimits {
        WorkspaceLimits {
            max_concurrent: Some(self.max_concurrent.max(1)),
            max_disk_bytes: self.max_disk_mb.map(|mb| mb.saturating_mul(1024 * 1024)),
            keep: self.keep,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactsConfig {
    #[serde(default = "default_artifacts_dir")]
    pub dir: PathBuf,
    #[serde(default)]
    pub format: ArchiveFormat,
}

fn default_artifacts_dir() -> PathBuf {
    PathBuf::from("downloads")
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self {
            dir: default_artifacts_dir(),
            format: ArchiveFormat::default(),
        }
    }
}

/// How each external tool is launched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_apktool")]
    pub apktool: ToolCommand,
    #[serde(default = "default_jadx")]
    pub jadx: ToolCommand,
    #[serde(default = "default_quark")]
    pub quark: ToolCommand,
    #[serde(default = "default_signer")]
    pub signer: ToolCommand,
    /// Framework files passed to apktool as `-p <dir>`
    #[serde(default)]
    pub framework_dir: Option<PathBuf>,
}

fn default_apktool() -> ToolCommand {
    ToolCommand::jar(&Path::new("tools").join("apktool.jar"))
}

fn default_jadx() -> ToolCommand {
    ToolCommand::new(&Path::new("tools").join("jadx").join("bin").join("jadx").to_string_lossy())
}

fn default_quark() -> ToolCommand {
    ToolCommand::new("quark")
}

fn default_signer() -> ToolCommand {
    ToolCommand::jar(&Path::new("tools").join("uber-apk-signer.jar"))
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            apktool: default_apktool(),
            jadx: default_jadx(),
            quark: default_quark(),
            signer: default_signer(),
            framework_dir: None,
        }
    }
}

impl ToolsConfig {
    /// Standard distribution layout under `dir`:
    /// `apktool.jar`, `uber-apk-signer.jar` and `jadx/bin/jadx`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            apktool: ToolCommand::jar(&dir.join("apktool.jar")),
            jadx: ToolCommand::new(&dir.join("jadx").join("bin").join("jadx").to_string_lossy()),
            quark: default_quark(),
            signer: ToolCommand::jar(&dir.join("uber-apk-signer.jar")),
            framework_dir: None,
        }
    }
}

/// Per-step timeouts, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_decode_secs")]
    pub decode_secs: u64,
    #[serde(default = "default_render_secs")]
    pub render_secs: u64,
    #[serde(default = "default_scan_secs")]
    pub scan_secs: u64,
    #[serde(default = "default_build_secs")]
    pub build_secs: u64,
    #[serde(default = "default_sign_secs")]
    pub sign_secs: u64,
}

fn default_decode_secs() -> u64 {
    600
}

fn default_render_secs() -> u64 {
    1800
}

fn default_scan_secs() -> u64 {
    900
}

fn default_build_secs() -> u64 {
    900
}

fn default_sign_secs() -> u64 {
    120
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            decode_secs: default_decode_secs(),
            render_secs: default_render_secs(),
            scan_secs: default_scan_secs(),
            build_secs: default_build_secs(),
            sign_secs: default_sign_secs(),
        }
    }
}

impl TimeoutsConfig {
    pub fn decode(&self) -> Duration {
        Duration::from_secs(self.decode_secs)
    }

    pub fn render(&self) -> Duration {
        Duration::from_secs(self.render_secs)
    }

    pub fn scan(&self) -> Duration {
        Duration::from_secs(self.scan_secs)
    }

    pub fn build(&self) -> Duration {
        Duration::from_secs(self.build_secs)
    }

    pub fn sign(&self) -> Duration {
        Duration::from_secs(self.sign_secs)
    }
}

/// What to do when an optional step (source rendering, scanning) fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionalStepPolicy {
    /// Fail the whole job
    #[default]
    Abort,
    /// Record the failure in reports/pipeline-notes.txt and carry on
    Degrade,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub optional_step_failure: OptionalStepPolicy,
    #[serde(default)]
    pub patch: PatchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchConfig {
    /// Also set android:debuggable="true" on <application>
    #[serde(default)]
    pub debuggable: bool,
    /// cleartextTrafficPermitted on the injected base-config
    #[serde(default = "default_true")]
    pub cleartext_traffic: bool,
}

fn default_true() -> bool {
    true
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self {
            debuggable: false,
            cleartext_traffic: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
    #[serde(default = "default_fetch_timeout")]
    pub timeout_secs: u64,
}

fn default_max_bytes() -> u64 {
    512 * 1024 * 1024
}

fn default_fetch_timeout() -> u64 {
    300
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_max_bytes(),
            timeout_secs: default_fetch_timeout(),
        }
    }
}
