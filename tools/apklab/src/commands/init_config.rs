use anyhow::{bail, Result};
use colored::Colorize;
use std::path::Path;

use crate::config;

pub fn run(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("File already exists: {} (use --force to overwrite)", path.display());
    }

    config::create_sample(path)?;

    println!("{} {}", "✓ Wrote".green(), path.display());
    println!();
    println!("Next steps:");
    println!("  vim {}          {}", path.display(), "# Point tools at your apktool/jadx/signer install".dimmed());
    println!("  apklab doctor   {}", "# Check the toolchain".dimmed());

    Ok(())
}
