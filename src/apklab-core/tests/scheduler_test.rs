mod common;

use apklab_core::{
    CancelToken, Job, JobInput, JobKind, JobState, OptionSet, Orchestrator, Scheduler, Stage, ToolResult, ToolRunner,
    ToolStep, Work,
};
use common::*;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn job_for(apk: &std::path::Path, options: &[&str]) -> Job {
    Job::new(
        JobInput::File(apk.to_path_buf()),
        OptionSet::parse(JobKind::Decompile, options).unwrap(),
    )
}

#[test]
fn test_concurrent_jobs_get_distinct_workspaces() {
    let temp = TempDir::new().unwrap();
    let config = config(&temp);
    let runner = Arc::new(FakeRunner::new());
    let orchestrator = Arc::new(Orchestrator::with_runner(&config, runner.clone()).unwrap());
    let scheduler = Scheduler::new(orchestrator.clone(), 4);
    let apk = write_apk(&temp);

    let tickets: Vec<_> = (0..6)
        .map(|_| scheduler.submit(job_for(&apk, &["decompile_java"]), Work::Decompile).unwrap())
        .collect();

    let mut artifacts = HashSet::new();
    for ticket in tickets {
        let outcome = ticket.wait().unwrap();
        assert_eq!(outcome.job.state(), JobState::Done);
        artifacts.insert(outcome.result.unwrap().path);
    }
    assert_eq!(artifacts.len(), 6);

    // Each job ran its tools in its own workspace
    let workspaces: HashSet<_> = runner.calls().into_iter().map(|s| s.cwd).collect();
    assert_eq!(workspaces.len(), 6);

    assert_eq!(scheduler.in_flight(), 0);
    assert_eq!(workspace_dirs(&config), 0);
    scheduler.shutdown();
}

#[test]
fn test_cancel_running_job_releases_workspace() {
    let temp = TempDir::new().unwrap();
    let config = config(&temp);
    let runner = Arc::new(FakeRunner::hanging_on("jadx"));
    let orchestrator = Arc::new(Orchestrator::with_runner(&config, runner.clone()).unwrap());
    let scheduler = Scheduler::new(orchestrator, 2);
    let apk = write_apk(&temp);

    let ticket = scheduler.submit(job_for(&apk, &["decompile_java"]), Work::Decompile).unwrap();
    let job_id = ticket.job_id().to_string();

    let deadline = Instant::now() + Duration::from_secs(10);
    while runner.hanging.load(Ordering::SeqCst) == 0 {
        assert!(Instant::now() < deadline, "jadx never started");
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(workspace_dirs(&config), 1);

    assert!(scheduler.cancel(&job_id));
    let outcome = ticket.wait().unwrap();

    let err = outcome.result.unwrap_err();
    assert_eq!(err.category(), "cancelled");
    assert_eq!(err.stage, Stage::RenderingSource);
    assert_eq!(outcome.job.state(), JobState::Failed(Stage::RenderingSource));
    assert_eq!(workspace_dirs(&config), 0);

    // Finished jobs can no longer be cancelled
    assert!(!scheduler.cancel(&job_id));
}

#[test]
fn test_duplicate_job_id_is_rejected() {
    let temp = TempDir::new().unwrap();
    let config = config(&temp);
    let runner = Arc::new(FakeRunner::hanging_on("apktool"));
    let orchestrator = Arc::new(Orchestrator::with_runner(&config, runner).unwrap());
    let scheduler = Scheduler::new(orchestrator, 1);
    let apk = write_apk(&temp);

    let input = JobInput::File(apk.clone());
    let options = OptionSet::parse(JobKind::Decompile, &["mitm_patch"]).unwrap();
    let first = Job::with_id("job-1", input.clone(), options.clone()).unwrap();
    let second = Job::with_id("job-1", input, options).unwrap();

    let ticket = scheduler.submit(first, Work::Decompile).unwrap();
    let err = scheduler.submit(second, Work::Decompile).unwrap_err();
    assert_eq!(err.category(), "allocation");

    assert!(scheduler.cancel("job-1"));
    assert!(ticket.wait().unwrap().result.is_err());
}

#[test]
fn test_cancel_unknown_job() {
    let temp = TempDir::new().unwrap();
    let config = config(&temp);
    let orchestrator = Arc::new(Orchestrator::with_runner(&config, Arc::new(FakeRunner::new())).unwrap());
    let scheduler = Scheduler::new(orchestrator, 1);
    assert!(!scheduler.cancel("nope"));
}

/// Panics on its first call, then behaves like `FakeRunner`.
struct PanicsOnce {
    inner: FakeRunner,
    panicked: AtomicBool,
}

impl ToolRunner for PanicsOnce {
    fn run(&self, step: &ToolStep, cancel: &CancelToken) -> apklab_core::Result<ToolResult> {
        if !self.panicked.swap(true, Ordering::SeqCst) {
            panic!("{} crashed", step.tool);
        }
        self.inner.run(step, cancel)
    }
}

#[test]
fn test_panicking_job_is_unregistered() {
    let temp = TempDir::new().unwrap();
    let config = config(&temp);
    let runner = Arc::new(PanicsOnce {
        inner: FakeRunner::new(),
        panicked: AtomicBool::new(false),
    });
    let orchestrator = Arc::new(Orchestrator::with_runner(&config, runner).unwrap());
    let scheduler = Scheduler::new(orchestrator, 2);
    let apk = write_apk(&temp);

    let input = JobInput::File(apk);
    let options = OptionSet::parse(JobKind::Decompile, &["decompile_java"]).unwrap();
    let first = Job::with_id("job-1", input.clone(), options.clone()).unwrap();
    let ticket = scheduler.submit(first, Work::Decompile).unwrap();

    // The worker unwound without replying
    assert!(ticket.wait().is_none());
    assert_eq!(scheduler.in_flight(), 0);
    assert!(!scheduler.cancel("job-1"));
    assert_eq!(workspace_dirs(&config), 0);

    // The id is free again and the remaining worker runs it
    let second = Job::with_id("job-1", input, options).unwrap();
    let outcome = scheduler.submit(second, Work::Decompile).unwrap().wait().unwrap();
    assert_eq!(outcome.job.state(), JobState::Done);
    assert_eq!(scheduler.in_flight(), 0);
}
