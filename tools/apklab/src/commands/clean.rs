use anyhow::{Context, Result};
use apklab_core::ArtifactStore;
use colored::Colorize;
use std::path::Path;

use crate::config;

/// Remove the stored artifacts of `job_ids`, or of every job with `all`.
pub fn run(config_path: Option<&Path>, job_ids: &[String], all: bool) -> Result<()> {
    let config = config::load(config_path).context("Failed to load configuration")?;
    let store = ArtifactStore::new(&config.artifacts.dir).context("Failed to open artifact store")?;

    let targets: Vec<String> = if all {
        store
            .list()
            .context("Failed to list artifacts")?
            .into_iter()
            .map(|a| a.job_id)
            .collect()
    } else {
        job_ids.to_vec()
    };

    if targets.is_empty() {
        println!("{}", "No artifacts stored".dimmed());
        return Ok(());
    }

    for job_id in &targets {
        if store.remove(job_id).with_context(|| format!("Failed to remove artifacts of {}", job_id))? {
            println!("  {} Removed {}", "✓".green(), job_id.bright_white());
        } else {
            println!("  {} No artifacts for {}", "-".dimmed(), job_id.dimmed());
        }
    }

    Ok(())
}
