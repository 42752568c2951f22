//! Decompile several packages concurrently.
//!
//! Usage:
//!   apklab batch a.apk b.apk https://host/c.apk --jobs 2 -O decompile_java

use anyhow::{Context, Result};
use apklab_core::{Job, JobKind, OptionSet, Orchestrator, Scheduler, Work};
use colored::Colorize;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

use crate::config;
use crate::output::{outcome_json, parse_input, print_outcome};

pub fn run(config_path: Option<&Path>, inputs: &[String], jobs: Option<usize>, options: &[String], json: bool) -> Result<()> {
    let mut config = config::load(config_path).context("Failed to load configuration")?;
    // Reject bad options once, before anything is queued
    let options = OptionSet::parse(JobKind::Decompile, options)?;
    let workers = jobs.unwrap_or(config.workspace.max_concurrent).max(1);
    // Every worker needs a workspace slot
    config.workspace.max_concurrent = config.workspace.max_concurrent.max(workers);

    let orchestrator = Arc::new(Orchestrator::new(&config).context("Failed to initialize orchestrator")?);
    let scheduler = Scheduler::new(orchestrator, workers);

    if !json {
        println!(
            "{}",
            format!("Decompiling {} package(s) with {} worker(s)...", inputs.len(), workers).bright_blue()
        );
        println!();
    }

    let mut tickets = Vec::new();
    for input in inputs {
        let job = Job::new(parse_input(input), options.clone());
        if !json {
            println!("  {} {} {}", "→".bright_blue(), job.id.dimmed(), input);
        }
        tickets.push(scheduler.submit(job, Work::Decompile)?);
    }
    if !json {
        println!();
    }

    let mut records: Vec<Value> = Vec::new();
    let mut failed = 0;
    for ticket in tickets {
        let job_id = ticket.job_id().to_string();
        let Some(outcome) = ticket.wait() else {
            failed += 1;
            if !json {
                println!("  {} {} worker exited without a result", "✗".red().bold(), job_id);
            }
            continue;
        };

        if outcome.result.is_err() {
            failed += 1;
        }
        if json {
            records.push(outcome_json(&outcome.job, &outcome.result));
        } else {
            print_outcome(&outcome.job, &outcome.result);
            println!();
        }
    }
    scheduler.shutdown();

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else {
        println!("{}", "=".repeat(60).dimmed());
        println!(
            "Total: {} job(s), {} succeeded, {} failed",
            inputs.len(),
            (inputs.len() - failed).to_string().green(),
            if failed > 0 { failed.to_string().red() } else { failed.to_string().normal() }
        );
    }

    if failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}
