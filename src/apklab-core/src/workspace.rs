//! Workspace management for apklab.
//!
//! Every job gets its own directory under the configured base directory:
//! ```text
//! {base_dir}/{job_id}/
//! ├── in/       # Staged input (package, project archive)
//! ├── out/      # Tool outputs (decoded tree, java sources, reports)
//! ├── tmp/      # Scratch space for tools
//! └── .work/    # Internal (intermediate packages, staging)
//! ```
//!
//! The job directory is created with a single `create_dir` call, which
//! fails if the path exists. That makes the manager the sole arbiter of
//! the path namespace: two jobs can never end up in the same directory.

use anyhow::Result as AnyResult;
use log::{debug, info, warn};
use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use crate::error::{Error, Result};

/// Attempts made to remove a workspace before giving up.
const CLEANUP_ATTEMPTS: u32 = 3;

/// Quotas and retention policy for workspaces.
#[derive(Debug, Clone, Default)]
pub struct WorkspaceLimits {
    /// Maximum number of workspaces alive at once
    pub max_concurrent: Option<usize>,
    /// Maximum bytes used under the base directory before new jobs are refused
    pub max_disk_bytes: Option<u64>,
    /// Keep workspaces after release (debugging)
    pub keep: bool,
}

/// Allocates and reclaims job workspaces.
#[derive(Debug)]
pub struct WorkspaceManager {
    base_dir: PathBuf,
    limits: WorkspaceLimits,
    active: Arc<Mutex<HashSet<String>>>,
}

/// An exclusively owned job directory.
///
/// Dropping a workspace without calling [`Workspace::release`] still removes
/// it, so early returns and panics do not leak directories.
#[derive(Debug)]
pub struct Workspace {
    job_id: String,
    /// Root directory for this job
    pub root: PathBuf,
    /// Input directory (in/)
    pub in_dir: PathBuf,
    /// Output directory (out/)
    pub out_dir: PathBuf,
    /// Temporary directory (tmp/)
    pub tmp_dir: PathBuf,
    /// Internal work directory (.work/)
    pub work_dir: PathBuf,
    keep: bool,
    released: bool,
    active: Arc<Mutex<HashSet<String>>>,
}

impl WorkspaceManager {
    /// Create a manager rooted at `base_dir`, creating the directory if needed.
    pub fn new(base_dir: &Path, limits: WorkspaceLimits) -> Result<Self> {
        fs::create_dir_all(base_dir).map_err(|e| {
            Error::Allocation(format!(
                "cannot create workspace base {}: {}",
                base_dir.display(),
                e
            ))
        })?;

        #[cfg(unix)]
        restrict_permissions(base_dir);

        info!(
            "Workspace base: {} (max_concurrent={:?}, max_disk_bytes={:?}, keep={})",
            base_dir.display(),
            limits.max_concurrent,
            limits.max_disk_bytes,
            limits.keep
        );

        Ok(Self {
            base_dir: base_dir.to_path_buf(),
            limits,
            active: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Number of workspaces currently held by jobs.
    pub fn active_count(&self) -> usize {
        self.active.lock().map(|set| set.len()).unwrap_or(0)
    }

    /// Allocate a fresh, empty workspace for `job_id`.
    ///
    /// Fails with `Allocation` if the id is not a safe path component, the
    /// directory already exists, a quota is exhausted, or the filesystem is
    /// not writable.
    pub fn acquire(&self, job_id: &str) -> Result<Workspace> {
        validate_path_component(job_id)
            .map_err(|e| Error::Allocation(format!("invalid job id: {:#}", e)))?;

        {
            let mut active = self
                .active
                .lock()
                .map_err(|_| Error::Allocation("workspace registry poisoned".to_string()))?;

            // Measured under the registry lock so concurrent acquires see one another
            if let Some(max_bytes) = self.limits.max_disk_bytes {
                let used = dir_size(&self.base_dir);
                if used >= max_bytes {
                    return Err(Error::Allocation(format!(
                        "disk quota exhausted: {} bytes used under {} (max: {})",
                        used,
                        self.base_dir.display(),
                        max_bytes
                    )));
                }
            }

            if let Some(max) = self.limits.max_concurrent {
                if active.len() >= max {
                    return Err(Error::Allocation(format!(
                        "concurrent workspace limit reached ({} active, max: {})",
                        active.len(),
                        max
                    )));
                }
            }

            if !active.insert(job_id.to_string()) {
                return Err(Error::Allocation(format!("job {} already holds a workspace", job_id)));
            }
        }

        match self.create_layout(job_id) {
            Ok(workspace) => Ok(workspace),
            Err(e) => {
                if let Ok(mut active) = self.active.lock() {
                    active.remove(job_id);
                }
                Err(e)
            }
        }
    }

    fn create_layout(&self, job_id: &str) -> Result<Workspace> {
        let root = self.base_dir.join(job_id);

        // Atomic: fails instead of reusing an existing directory
        fs::create_dir(&root).map_err(|e| {
            if e.kind() == ErrorKind::AlreadyExists {
                Error::Allocation(format!("workspace already exists: {}", root.display()))
            } else {
                Error::Allocation(format!("cannot create {}: {}", root.display(), e))
            }
        })?;

        let workspace = Workspace {
            job_id: job_id.to_string(),
            in_dir: root.join("in"),
            out_dir: root.join("out"),
            tmp_dir: root.join("tmp"),
            work_dir: root.join(".work"),
            root,
            keep: self.limits.keep,
            released: false,
            active: Arc::clone(&self.active),
        };

        for dir in [&workspace.in_dir, &workspace.out_dir, &workspace.tmp_dir, &workspace.work_dir] {
            fs::create_dir(dir)
                .map_err(|e| Error::Allocation(format!("cannot create {}: {}", dir.display(), e)))?;
        }

        info!(
            "job={} Created workspace: {} (in, out, tmp, .work)",
            job_id,
            workspace.root.display()
        );

        Ok(workspace)
    }
}

impl Workspace {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Remove the workspace.
    ///
    /// Cleanup failures are reported as `Cleanup`; callers log them and do
    /// not fail an otherwise successful job.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.unregister();
        if self.keep {
            info!("job={} Keeping workspace for debugging: {}", self.job_id, self.root.display());
            return Ok(());
        }
        remove_with_retry(&self.root)
    }

    fn unregister(&self) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&self.job_id);
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.unregister();
        if self.keep {
            return;
        }
        if let Err(e) = remove_with_retry(&self.root) {
            warn!("job={} {}", self.job_id, e);
        }
    }
}

/// Remove a directory tree, retrying transient failures.
///
/// Tools sometimes leave read-only files behind (e.g. extracted jars); on
/// Unix write permission is restored before each retry.
fn remove_with_retry(root: &Path) -> Result<()> {
    let mut last_error = None;

    for attempt in 1..=CLEANUP_ATTEMPTS {
        match fs::remove_dir_all(root) {
            Ok(()) => {
                info!("Cleaned up workspace: {}", root.display());
                return Ok(());
            }
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                debug!(
                    "Cleanup attempt {}/{} for {} failed: {}",
                    attempt,
                    CLEANUP_ATTEMPTS,
                    root.display(),
                    e
                );
                last_error = Some(e);
                #[cfg(unix)]
                make_writable(root);
                std::thread::sleep(Duration::from_millis(100 * u64::from(attempt)));
            }
        }
    }

    let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
    warn!("Failed to clean up workspace {}: {}", root.display(), reason);
    Err(Error::Cleanup {
        path: root.to_path_buf(),
        reason,
    })
}

/// Recursively add owner write/execute permission to directories.
#[cfg(unix)]
fn make_writable(path: &Path) {
    let Ok(metadata) = fs::symlink_metadata(path) else {
        return;
    };
    if !metadata.is_dir() {
        return;
    }

    let mut permissions = metadata.permissions();
    permissions.set_mode(permissions.mode() | 0o700);
    let _ = fs::set_permissions(path, permissions);

    if let Ok(entries) = fs::read_dir(path) {
        for entry in entries.flatten() {
            make_writable(&entry.path());
        }
    }
}

/// Set the base directory to 0711 (owner full, others traverse only).
#[cfg(unix)]
fn restrict_permissions(base_dir: &Path) {
    if base_dir.starts_with("/tmp") || base_dir.starts_with("/var/tmp") {
        warn!("Workspace base is in shared temporary space: {}", base_dir.display());
    }

    if let Ok(metadata) = fs::metadata(base_dir) {
        let mut permissions = metadata.permissions();
        if permissions.mode() & 0o777 != 0o711 {
            permissions.set_mode(0o711);
            if let Err(e) = fs::set_permissions(base_dir, permissions) {
                warn!("Failed to restrict permissions on {}: {}", base_dir.display(), e);
            }
        }
    }
}

/// Total size of regular files under `path` (symlinks are not followed).
pub fn dir_size(path: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(path) else {
        return 0;
    };

    entries
        .flatten()
        .map(|entry| match entry.file_type() {
            Ok(ft) if ft.is_dir() => dir_size(&entry.path()),
            Ok(ft) if ft.is_file() => entry.metadata().map(|m| m.len()).unwrap_or(0),
            _ => 0,
        })
        .sum()
}

/// Validate path component to prevent directory traversal and injection attacks.
///
/// SECURITY: Only allows alphanumeric, dots, dashes, underscores.
/// Rejects "..", "/", shell metacharacters.
pub fn validate_path_component(component: &str) -> AnyResult<()> {
    if component.is_empty() {
        anyhow::bail!("Path component cannot be empty");
    }

    if component.len() > 255 {
        anyhow::bail!("Path component too long: {} bytes", component.len());
    }

    for c in component.chars() {
        if !c.is_ascii_alphanumeric() && c != '.' && c != '-' && c != '_' {
            anyhow::bail!(
                "Invalid character in path component '{}': '{}' (only alphanumeric, ., -, _ allowed)",
                component, c
            );
        }
    }

    if component.contains("..") {
        anyhow::bail!("Directory traversal detected: {}", component);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(temp: &TempDir, limits: WorkspaceLimits) -> WorkspaceManager {
        WorkspaceManager::new(&temp.path().join("work"), limits).unwrap()
    }

    #[test]
    fn test_workspace_creation() {
        let temp = TempDir::new().unwrap();
        let mgr = manager(&temp, WorkspaceLimits::default());
        let ws = mgr.acquire("job-123").unwrap();

        assert!(ws.root.exists());
        assert!(ws.in_dir.exists());
        assert!(ws.out_dir.exists());
        assert!(ws.tmp_dir.exists());
        assert!(ws.work_dir.exists());

        assert!(ws.in_dir.ends_with("in"));
        assert!(ws.work_dir.ends_with(".work"));
        assert_eq!(ws.job_id(), "job-123");
        assert_eq!(mgr.active_count(), 1);
    }

    #[test]
    fn test_existing_path_is_not_reused() {
        let temp = TempDir::new().unwrap();
        let mgr = manager(&temp, WorkspaceLimits::default());
        fs::create_dir_all(mgr.base_dir().join("stale-job")).unwrap();

        let err = mgr.acquire("stale-job").unwrap_err();
        assert_eq!(err.category(), "allocation");
        assert_eq!(mgr.active_count(), 0);
    }

    #[test]
    fn test_same_job_cannot_hold_two_workspaces() {
        let temp = TempDir::new().unwrap();
        let mgr = manager(&temp, WorkspaceLimits::default());
        let _ws = mgr.acquire("job-a").unwrap();
        assert!(mgr.acquire("job-a").is_err());
    }

    #[test]
    fn test_release_removes_tree() {
        let temp = TempDir::new().unwrap();
        let mgr = manager(&temp, WorkspaceLimits::default());
        let ws = mgr.acquire("job-release").unwrap();
        fs::write(ws.out_dir.join("file.txt"), "data").unwrap();
        let root = ws.root.clone();

        ws.release().unwrap();
        assert!(!root.exists());
        assert_eq!(mgr.active_count(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_release_handles_read_only_directories() {
        let temp = TempDir::new().unwrap();
        let mgr = manager(&temp, WorkspaceLimits::default());
        let ws = mgr.acquire("job-readonly").unwrap();
        let locked = ws.out_dir.join("locked");
        fs::create_dir(&locked).unwrap();
        fs::write(locked.join("inner.txt"), "x").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o500)).unwrap();
        let root = ws.root.clone();

        ws.release().unwrap();
        assert!(!root.exists());
    }

    #[test]
    fn test_drop_cleans_up() {
        let temp = TempDir::new().unwrap();
        let mgr = manager(&temp, WorkspaceLimits::default());
        let root = {
            let ws = mgr.acquire("job-drop").unwrap();
            ws.root.clone()
        };
        assert!(!root.exists());
        assert_eq!(mgr.active_count(), 0);
    }

    #[test]
    fn test_keep_policy_retains_directory() {
        let temp = TempDir::new().unwrap();
        let mgr = manager(&temp, WorkspaceLimits { keep: true, ..Default::default() });
        let ws = mgr.acquire("job-keep").unwrap();
        let root = ws.root.clone();

        ws.release().unwrap();
        assert!(root.exists());
        assert_eq!(mgr.active_count(), 0);
    }

    #[test]
    fn test_concurrency_limit() {
        let temp = TempDir::new().unwrap();
        let mgr = manager(&temp, WorkspaceLimits { max_concurrent: Some(2), ..Default::default() });
        let a = mgr.acquire("job-1").unwrap();
        let _b = mgr.acquire("job-2").unwrap();

        let err = mgr.acquire("job-3").unwrap_err();
        assert!(err.to_string().contains("limit"));

        a.release().unwrap();
        assert!(mgr.acquire("job-3").is_ok());
    }

    #[test]
    fn test_disk_quota() {
        let temp = TempDir::new().unwrap();
        let mgr = manager(&temp, WorkspaceLimits { max_disk_bytes: Some(16), ..Default::default() });
        let ws = mgr.acquire("job-big").unwrap();
        fs::write(ws.out_dir.join("blob.bin"), vec![0u8; 64]).unwrap();

        let err = mgr.acquire("job-next").unwrap_err();
        assert!(err.to_string().contains("quota"));
    }

    #[test]
    fn test_concurrent_acquires_respect_quota() {
        let temp = TempDir::new().unwrap();
        let mgr = manager(&temp, WorkspaceLimits { max_disk_bytes: Some(32), ..Default::default() });
        fs::write(mgr.base_dir().join("leftover.bin"), vec![0u8; 64]).unwrap();

        let results: Vec<bool> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let mgr = &mgr;
                    scope.spawn(move || mgr.acquire(&format!("job-{}", i)).map(|ws| ws.release()).is_ok())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert!(results.iter().all(|ok| !ok));
        assert_eq!(mgr.active_count(), 0);
        assert_eq!(fs::read_dir(mgr.base_dir()).unwrap().count(), 1);
    }

    #[test]
    fn test_dir_size() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("a/b")).unwrap();
        fs::write(temp.path().join("a/one.bin"), vec![0u8; 10]).unwrap();
        fs::write(temp.path().join("a/b/two.bin"), vec![0u8; 5]).unwrap();
        assert_eq!(dir_size(temp.path()), 15);
    }

    #[test]
    fn test_validate_path_component_valid() {
        assert!(validate_path_component("hello").is_ok());
        assert!(validate_path_component("hello.world").is_ok());
        assert!(validate_path_component("decompile-0f3a").is_ok());
        assert!(validate_path_component("hello_world").is_ok());
    }

    #[test]
    fn test_validate_path_component_invalid() {
        assert!(validate_path_component("").is_err());
        assert!(validate_path_component("..").is_err());
        assert!(validate_path_component("../etc").is_err());
        assert!(validate_path_component("/etc").is_err());
        assert!(validate_path_component("hello world").is_err());
        assert!(validate_path_component("hello;rm -rf /").is_err());
    }
}
