//! Configuration loading for the apklab CLI.
//!
//! Loads configuration from:
//! 1. `--config <path>`, or a `.apklabconfig` file (YAML) in the current
//!    directory or the home directory
//! 2. Environment variables (override file config)
//!
//! Configuration structure:
//! ```yaml
//! workspace:
//!   base_dir: /var/tmp/apklab/work
//!   max_concurrent: 4
//!
//! artifacts:
//!   dir: downloads
//!   format: zip          # or tar.gz
//!
//! tools:
//!   apktool: { program: java, args: [-jar, tools/apktool.jar] }
//!
//! pipeline:
//!   optional_step_failure: abort   # or degrade
//! ```

use anyhow::{Context, Result};
use apklab_core::config::ToolsConfig;
use apklab_core::OrchestratorConfig;
use log::debug;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = ".apklabconfig";

/// Load configuration from file and environment variables.
///
/// Environment variables override file settings:
/// - APKLAB_WORK_DIR - Workspace base directory
/// - APKLAB_ARTIFACTS_DIR - Where finished artifacts are kept
/// - APKLAB_TOOLS_DIR - Directory holding apktool.jar, jadx/ and uber-apk-signer.jar
/// - APKLAB_MAX_CONCURRENT - Concurrent job limit
/// - APKLAB_KEEP_WORKSPACES - Keep workspaces after jobs finish (true/false)
///
/// Relative paths are resolved against the current directory.
pub fn load(explicit: Option<&Path>) -> Result<OrchestratorConfig> {
    let mut config = match explicit {
        Some(path) => load_from_file(path)?,
        None => match find_config_file() {
            Some(path) => load_from_file(&path)?,
            None => OrchestratorConfig::default(),
        },
    };

    apply_overrides(&mut config, |key| env::var(key).ok())?;

    let cwd = env::current_dir().context("Failed to determine current directory")?;
    config.anchor_paths(&cwd);
    Ok(config)
}

/// Find .apklabconfig in the current directory, then the home directory
fn find_config_file() -> Option<PathBuf> {
    let cwd_config = PathBuf::from(CONFIG_FILE);
    if cwd_config.exists() {
        return Some(cwd_config);
    }

    if let Ok(home) = env::var("HOME") {
        let home_config = PathBuf::from(home).join(CONFIG_FILE);
        if home_config.exists() {
            return Some(home_config);
        }
    }

    None
}

fn load_from_file(path: &Path) -> Result<OrchestratorConfig> {
    debug!("Loading config from {}", path.display());
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    // An empty file is a valid "all defaults" config
    if content.trim().is_empty() {
        return Ok(OrchestratorConfig::default());
    }

    serde_yaml::from_str(&content).with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Apply overrides from `lookup` (the process environment outside tests).
fn apply_overrides<F>(config: &mut OrchestratorConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(dir) = lookup("APKLAB_WORK_DIR") {
        config.workspace.base_dir = PathBuf::from(dir);
    }

    if let Some(dir) = lookup("APKLAB_ARTIFACTS_DIR") {
        config.artifacts.dir = PathBuf::from(dir);
    }

    if let Some(dir) = lookup("APKLAB_TOOLS_DIR") {
        let framework_dir = config.tools.framework_dir.take();
        let quark = config.tools.quark.clone();
        config.tools = ToolsConfig {
            quark,
            framework_dir,
            ..ToolsConfig::in_dir(Path::new(&dir))
        };
    }

    if let Some(value) = lookup("APKLAB_MAX_CONCURRENT") {
        config.workspace.max_concurrent = value
            .parse()
            .context("Invalid APKLAB_MAX_CONCURRENT value (must be a number)")?;
    }

    if let Some(value) = lookup("APKLAB_KEEP_WORKSPACES") {
        config.workspace.keep = match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => true,
            "0" | "false" | "no" => false,
            other => anyhow::bail!("Invalid APKLAB_KEEP_WORKSPACES value '{}' (expected true or false)", other),
        };
    }

    Ok(())
}

/// Create a sample .apklabconfig file
pub fn create_sample(path: &Path) -> Result<()> {
    let yaml = serde_yaml::to_string(&OrchestratorConfig::default()).context("Failed to serialize sample config")?;

    let commented = format!(
        "# apklab configuration\n\
         #\n\
         # Every field is optional; missing fields take the values shown here.\n\
         #\n\
         # Environment variables override these settings:\n\
         #   APKLAB_WORK_DIR        - Workspace base directory\n\
         #   APKLAB_ARTIFACTS_DIR   - Artifact directory\n\
         #   APKLAB_TOOLS_DIR       - Directory with apktool.jar, jadx/, uber-apk-signer.jar\n\
         #   APKLAB_MAX_CONCURRENT  - Concurrent job limit\n\
         #   APKLAB_KEEP_WORKSPACES - Keep workspaces for debugging (true/false)\n\
         #\n\
         # Keystore passwords are never read from this file: use APKLAB_KS_PASS /\n\
         # APKLAB_KEY_PASS or --ks-pass-file / --key-pass-file.\n\
         #\n\
         {}",
        yaml
    );

    fs::write(path, commented).with_context(|| format!("Failed to write config file: {}", path.display()))?;

    Ok(())
}
