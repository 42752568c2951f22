use anyhow::{Context, Result};
use apklab_core::{CancelToken, Job, JobKind, OptionSet, Orchestrator};
use colored::Colorize;
use std::path::Path;

use crate::config;
use crate::output::{parse_input, report};

pub fn run(config_path: Option<&Path>, input: &str, options: &[String], json: bool) -> Result<()> {
    let config = config::load(config_path).context("Failed to load configuration")?;
    let options = OptionSet::parse(JobKind::Decompile, options)?;
    let orchestrator = Orchestrator::new(&config).context("Failed to initialize orchestrator")?;

    let mut job = Job::new(parse_input(input), options);

    if !json {
        println!("{}", "Decompiling package...".bright_blue());
        println!("  Input: {}", input.bright_white());
        println!("  Job:   {}", job.id.dimmed());
        println!();
    }

    let outcome = orchestrator.decompile(&mut job, &CancelToken::new());
    report(&job, &outcome, json)?;

    if outcome.is_err() {
        std::process::exit(1);
    }
    Ok(())
}
