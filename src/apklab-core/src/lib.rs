//! apklab Core Library
//!
//! Pipeline orchestration for Android package reverse engineering, shared
//! between the `apklab` CLI and anything else that wants to drive the same
//! pipelines (tests, a web front-end, a queue worker).
//!
//! This crate provides:
//! - **workspace**: Per-job isolated work directories (allocation, cleanup, quotas)
//! - **execution**: External tool invocation (spawn, timeout, process-group kill)
//! - **tools**: Argument contracts for apktool, jadx, quark and the APK signer
//! - **options**: Option set parsing and validation
//! - **manifest**: Network-security-config patching of decoded manifests
//! - **archive**: Deterministic zip/tar.gz packing and secure unpacking
//! - **artifacts**: Retrieval store for finished job outputs
//! - **orchestrator**: Decompile and rebuild pipelines
//! - **scheduler**: Concurrent job execution with cancellation
//!
//! # Design Principle
//!
//! The orchestrator never decompiles, analyses or signs anything itself.
//! It sequences external tools, stages their inputs and outputs inside a
//! job-owned workspace, and packages the results.

pub mod archive;
pub mod artifacts;
pub mod config;
mod decompile;
pub mod error;
pub mod execution;
pub mod fetch;
pub mod job;
pub mod manifest;
pub mod options;
pub mod orchestrator;
mod rebuild;
pub mod scheduler;
pub mod tools;
pub mod workspace;

// Re-export commonly used types at crate root
pub use artifacts::{Artifact, ArtifactKind, ArtifactStore};
pub use config::OrchestratorConfig;
pub use error::{Error, PipelineError, Result};
pub use job::{Job, JobInput, JobKind, JobState, Stage};
pub use options::{DecompileOptions, OptionSet, RebuildOptions};
pub use orchestrator::{Orchestrator, Work};
pub use rebuild::{sign_package, SigningCredentials};
pub use scheduler::{JobOutcome, JobTicket, Scheduler};
pub use workspace::{Workspace, WorkspaceLimits, WorkspaceManager};

// Re-export execution types and functions
pub use execution::{execute_step, CancelToken, ProcessRunner, Secret, ToolArg, ToolResult, ToolRunner, ToolStep};

// Re-export manifest patching
pub use manifest::{patch_manifest, ManifestPatchSpec, PatchOutcome};
