//! Retrieval store for finished job outputs.
//!
//! Layout: `{dir}/{job_id}/{name}`. Artifacts are written to a hidden
//! sibling and renamed into place, so anything visible under a job
//! directory is complete.

use log::{info, warn};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::workspace::validate_path_component;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Archive of the decoded project (plus optional sources and reports)
    DecompiledProject,
    /// Rebuilt, signed package
    SignedPackage,
}

impl ArtifactKind {
    fn from_name(name: &str) -> Self {
        if name.ends_with("-signed.apk") {
            ArtifactKind::SignedPackage
        } else {
            ArtifactKind::DecompiledProject
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Artifact {
    pub job_id: String,
    pub kind: ArtifactKind,
    pub path: PathBuf,
    pub size: u64,
    pub sha256: String,
}

impl Artifact {
    fn describe(job_id: &str, kind: ArtifactKind, path: PathBuf) -> Result<Self> {
        let size = fs::metadata(&path)
            .map_err(|e| Error::Packaging(format!("cannot stat {}: {}", path.display(), e)))?
            .len();
        let sha256 = sha256_file(&path).map_err(|e| Error::Packaging(format!("cannot hash {}: {}", path.display(), e)))?;
        Ok(Self {
            job_id: job_id.to_string(),
            kind,
            path,
            size,
            sha256,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)
            .map_err(|e| Error::Packaging(format!("cannot create artifact directory {}: {}", root.display(), e)))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn job_dir(&self, job_id: &str) -> Result<PathBuf> {
        validate_path_component(job_id).map_err(|e| Error::Packaging(format!("invalid job id: {:#}", e)))?;
        Ok(self.root.join(job_id))
    }

    /// Publish an artifact produced by `write`, which receives the
    /// temporary path to write to.
    pub fn publish_with<F>(&self, job_id: &str, name: &str, kind: ArtifactKind, write: F) -> Result<Artifact>
    where
        F: FnOnce(&Path) -> Result<()>,
    {
        validate_path_component(name).map_err(|e| Error::Packaging(format!("invalid artifact name: {:#}", e)))?;
        let dir = self.job_dir(job_id)?;
        fs::create_dir_all(&dir).map_err(|e| Error::Packaging(format!("cannot create {}: {}", dir.display(), e)))?;

        let dest = dir.join(name);
        if dest.exists() {
            return Err(Error::Packaging(format!("artifact already exists: {}", dest.display())));
        }

        let temp = dir.join(format!(".{}.tmp", name));
        if let Err(e) = write(&temp) {
            let _ = fs::remove_file(&temp);
            return Err(e);
        }
        if let Err(e) = fs::rename(&temp, &dest) {
            let _ = fs::remove_file(&temp);
            return Err(Error::Packaging(format!("cannot publish {}: {}", dest.display(), e)));
        }

        let artifact = Artifact::describe(job_id, kind, dest)?;
        info!(
            "job={} Published artifact {} bytes={} sha256={}",
            job_id,
            artifact.path.display(),
            artifact.size,
            artifact.sha256
        );
        Ok(artifact)
    }

    /// Copy `source` into the store.
    pub fn publish_file(&self, job_id: &str, name: &str, kind: ArtifactKind, source: &Path) -> Result<Artifact> {
        self.publish_with(job_id, name, kind, |temp| {
            fs::copy(source, temp)
                .map(|_| ())
                .map_err(|e| Error::Packaging(format!("cannot copy {}: {}", source.display(), e)))
        })
    }

    /// The artifact of `job_id`, if one was published.
    pub fn find(&self, job_id: &str) -> Result<Option<Artifact>> {
        let dir = self.job_dir(job_id)?;
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Packaging(format!("cannot read {}: {}", dir.display(), e))),
        };

        let mut names: Vec<String> = entries
            .flatten()
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| !n.starts_with('.'))
            .collect();
        names.sort();

        match names.into_iter().next() {
            Some(name) => Artifact::describe(job_id, ArtifactKind::from_name(&name), dir.join(name)).map(Some),
            None => Ok(None),
        }
    }

    /// Every published artifact, ordered by job id.
    pub fn list(&self) -> Result<Vec<Artifact>> {
        let entries =
            fs::read_dir(&self.root).map_err(|e| Error::Packaging(format!("cannot read {}: {}", self.root.display(), e)))?;

        let mut job_ids: Vec<String> = entries
            .flatten()
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|id| validate_path_component(id).is_ok())
            .collect();
        job_ids.sort();

        let mut artifacts = Vec::new();
        for job_id in job_ids {
            if let Some(artifact) = self.find(&job_id)? {
                artifacts.push(artifact);
            }
        }
        Ok(artifacts)
    }

    /// Delete the artifact directory of `job_id`. Returns false if there was none.
    pub fn remove(&self, job_id: &str) -> Result<bool> {
        let dir = self.job_dir(job_id)?;
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                info!("job={} Removed artifacts: {}", job_id, dir.display());
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => {
                warn!("job={} Failed to remove {}: {}", job_id, dir.display(), e);
                Err(Error::Cleanup {
                    path: dir,
                    reason: e.to_string(),
                })
            }
        }
    }
}

/// Hex-encoded SHA-256 of a file's contents.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}
