use anyhow::{Context, Result};
use apklab_core::{patch_manifest, ManifestPatchSpec, PatchOutcome};
use colored::Colorize;
use std::path::Path;

pub fn run(dir: &Path, debuggable: bool, cleartext: bool) -> Result<()> {
    let spec = ManifestPatchSpec::interception(cleartext, debuggable);

    println!("{}", "Patching manifest for traffic interception...".bright_blue());
    println!("  Project: {}", dir.display());
    println!();

    let outcome = patch_manifest(dir, &spec).with_context(|| format!("Failed to patch {}", dir.display()))?;

    match outcome {
        PatchOutcome::Applied => {
            println!("  {} Manifest patched", "✓".green());
        }
        PatchOutcome::Replaced { previous } => {
            println!("  {} Manifest patched", "✓".green());
            println!("    {} replaced previous config {}", "!".yellow(), previous.yellow());
        }
        PatchOutcome::AlreadyPatched => {
            println!("  {} Already patched, nothing to do", "✓".green());
        }
    }
    println!("    Resource: {}", spec.resource_path(dir).display().to_string().dimmed());

    Ok(())
}
