use anyhow::{bail, Context, Result};
use apklab_core::{CancelToken, Job, JobInput, JobKind, OptionSet, Orchestrator, Secret, SigningCredentials};
use colored::Colorize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config;
use crate::output::report;

pub const KS_PASS_ENV: &str = "APKLAB_KS_PASS";
pub const KEY_PASS_ENV: &str = "APKLAB_KEY_PASS";

/// Keystore arguments as given on the command line.
pub struct KeyArgs {
    pub keystore: PathBuf,
    pub alias: String,
    pub ks_pass_file: Option<PathBuf>,
    pub key_pass_file: Option<PathBuf>,
}

pub fn run(config_path: Option<&Path>, project: &Path, keys: KeyArgs, options: &[String], json: bool) -> Result<()> {
    let config = config::load(config_path).context("Failed to load configuration")?;
    let options = OptionSet::parse(JobKind::Rebuild, options)?;

    let store_password = match read_secret(keys.ks_pass_file.as_deref(), KS_PASS_ENV)? {
        Some(password) => password,
        None => bail!("Keystore password required: set {} or pass --ks-pass-file", KS_PASS_ENV),
    };
    let creds = SigningCredentials {
        keystore: keys.keystore,
        store_password,
        alias: keys.alias,
        key_password: read_secret(keys.key_pass_file.as_deref(), KEY_PASS_ENV)?,
    };

    let orchestrator = Orchestrator::new(&config).context("Failed to initialize orchestrator")?;
    let mut job = Job::new(JobInput::File(project.to_path_buf()), options);

    if !json {
        println!("{}", "Rebuilding project...".bright_blue());
        println!("  Project:  {}", project.display().to_string().bright_white());
        println!("  Keystore: {} ({})", creds.keystore.display(), creds.alias);
        println!("  Job:      {}", job.id.dimmed());
        println!();
    }

    let outcome = orchestrator.rebuild(&mut job, &creds, &CancelToken::new());
    report(&job, &outcome, json)?;

    if outcome.is_err() {
        std::process::exit(1);
    }
    Ok(())
}

/// Password from `file` (first line) or else the `env_var` environment variable.
fn read_secret(file: Option<&Path>, env_var: &str) -> Result<Option<Secret>> {
    if let Some(path) = file {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read password file: {}", path.display()))?;
        let password = content.lines().next().unwrap_or("");
        return Ok(Some(Secret::new(password)));
    }

    Ok(env::var(env_var).ok().map(Secret::new))
}
