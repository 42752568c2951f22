use anyhow::{bail, Context, Result};
use apklab_core::tools::{check_tools, Toolchain};
use apklab_core::ProcessRunner;
use colored::Colorize;
use std::path::Path;

use crate::config;

pub fn run(config_path: Option<&Path>, json: bool) -> Result<()> {
    let config = config::load(config_path).context("Failed to load configuration")?;
    let toolchain = Toolchain::new(&config.tools, &config.timeouts);
    let checks = check_tools(&toolchain, &ProcessRunner::new());
    let failed = checks.iter().filter(|c| !c.ok).count();

    if json {
        println!("{}", serde_json::to_string_pretty(&checks)?);
    } else {
        println!("{}", "Checking toolchain...".bright_blue());
        println!();
        for check in &checks {
            if check.ok {
                println!("  {} {:<10} {}", "✓".green(), check.name, check.detail.dimmed());
            } else {
                println!("  {} {:<10} {}", "✗".red(), check.name, check.detail.red());
            }
        }
        println!();
        println!("  Workspaces: {}", config.workspace.base_dir.display());
        println!("  Artifacts:  {}", config.artifacts.dir.display());
    }

    if failed > 0 {
        bail!("{} tool check(s) failed", failed);
    }
    Ok(())
}
