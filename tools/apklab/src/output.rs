//! Job result rendering shared by the pipeline commands.

use apklab_core::{Artifact, Job, JobInput, PipelineError};
use colored::Colorize;
use serde_json::{json, Value};

pub type Outcome = std::result::Result<Artifact, PipelineError>;

/// `http(s)://` inputs are URLs, everything else a local path.
pub fn parse_input(input: &str) -> JobInput {
    if input.starts_with("http://") || input.starts_with("https://") {
        JobInput::Url(input.to_string())
    } else {
        JobInput::File(input.into())
    }
}

/// Job record plus artifact or error, for `--json`.
pub fn outcome_json(job: &Job, outcome: &Outcome) -> Value {
    match outcome {
        Ok(artifact) => json!({
            "job": job,
            "artifact": artifact,
        }),
        Err(err) => {
            let (stdout, stderr) = err.diagnostics().unwrap_or(("", ""));
            json!({
                "job": job,
                "error": {
                    "stage": err.stage,
                    "category": err.category(),
                    "message": err.source.to_string(),
                    "stdout": stdout,
                    "stderr": stderr,
                },
            })
        }
    }
}

pub fn print_outcome(job: &Job, outcome: &Outcome) {
    let stages: Vec<String> = job.stages().iter().map(|s| s.to_string()).collect();

    match outcome {
        Ok(artifact) => {
            println!("  {} {} {}", "✓".green().bold(), job.id.bright_white(), "completed".green());
            println!("    Artifact: {}", artifact.path.display().to_string().bright_white());
            println!("    Size:     {} bytes", artifact.size);
            println!("    SHA-256:  {}", artifact.sha256.dimmed());
            println!("    Stages:   {}", stages.join(" → ").dimmed());
        }
        Err(err) => {
            println!(
                "  {} {} failed during {} ({})",
                "✗".red().bold(),
                job.id.bright_white(),
                err.stage.to_string().yellow(),
                err.category().red()
            );
            println!("    Error: {}", err.source.to_string().red());
            // Raw tool output, untouched: the operator has to act on it
            if let Some((stdout, stderr)) = err.diagnostics() {
                if !stdout.trim().is_empty() {
                    println!("    {}", "--- stdout ---".dimmed());
                    println!("{}", stdout.trim_end());
                }
                if !stderr.trim().is_empty() {
                    println!("    {}", "--- stderr ---".dimmed());
                    println!("{}", stderr.trim_end());
                }
            }
        }
    }
}

/// Print one job's result in the requested format.
pub fn report(job: &Job, outcome: &Outcome, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&outcome_json(job, outcome))?);
    } else {
        print_outcome(job, outcome);
    }
    Ok(())
}
