//! Input staging: copy local inputs or download remote packages into a
//! workspace's `in/` directory, so tools only ever read from the workspace.

use anyhow::Result as AnyResult;
use log::info;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::artifacts::sha256_file;
use crate::config::FetchConfig;
use crate::error::{Error, Result};
use crate::job::JobInput;
use crate::workspace::validate_path_component;

const DEFAULT_DOWNLOAD_NAME: &str = "downloaded.apk";

/// An input copied into the workspace.
#[derive(Debug, Clone)]
pub struct StagedInput {
    pub path: PathBuf,
    pub size: u64,
    pub sha256: String,
}

/// Validate URL - only HTTP(S) allowed.
pub fn validate_url(url: &str) -> AnyResult<()> {
    if url.len() > 2048 {
        anyhow::bail!("URL too long: {} bytes", url.len());
    }

    if url.starts_with("https://") || url.starts_with("http://") {
        Ok(())
    } else if url.starts_with("file://") {
        anyhow::bail!("file:// URLs not allowed (security risk)");
    } else {
        anyhow::bail!("Only HTTP/HTTPS URLs allowed");
    }
}

/// File name for a downloaded package: the URL's last segment when it
/// names an `.apk`, otherwise `downloaded.apk`.
pub fn download_name(url: &str) -> String {
    url.split(['?', '#'])
        .next()
        .and_then(|u| u.rsplit('/').next())
        .filter(|name| name.ends_with(".apk") && validate_path_component(name).is_ok())
        .map(str::to_string)
        .unwrap_or_else(|| DEFAULT_DOWNLOAD_NAME.to_string())
}

/// Stage `input` into `in_dir`.
///
/// `fallback_name` is used for local files whose name is not a safe path
/// component.
pub fn stage_input(input: &JobInput, in_dir: &Path, fallback_name: &str, config: &FetchConfig) -> Result<StagedInput> {
    let start = Instant::now();
    let path = match input {
        JobInput::File(source) => copy_local(source, in_dir, fallback_name)?,
        JobInput::Url(url) => download(url, in_dir, config)?,
    };

    let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
    let sha256 = sha256_file(&path).map_err(|e| Error::Fetch(format!("cannot hash {}: {}", path.display(), e)))?;

    info!(
        "Staged input {} bytes={} sha256={} duration_ms={}",
        path.display(),
        size,
        sha256,
        start.elapsed().as_millis()
    );

    Ok(StagedInput { path, size, sha256 })
}

fn copy_local(source: &Path, in_dir: &Path, fallback_name: &str) -> Result<PathBuf> {
    if !source.is_file() {
        return Err(Error::Fetch(format!("input file not found: {}", source.display())));
    }

    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .filter(|n| validate_path_component(n).is_ok())
        .unwrap_or_else(|| fallback_name.to_string());
    let dest = in_dir.join(name);

    fs::copy(source, &dest)
        .map_err(|e| Error::Fetch(format!("cannot copy {} into workspace: {}", source.display(), e)))?;
    Ok(dest)
}

fn download(url: &str, in_dir: &Path, config: &FetchConfig) -> Result<PathBuf> {
    validate_url(url).map_err(|e| Error::InvalidOptions(format!("{:#}", e)))?;

    let dest = in_dir.join(download_name(url));
    info!("Downloading {} -> {}", url, dest.display());

    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .map_err(|e| Error::Fetch(format!("cannot build HTTP client: {}", e)))?;

    let response = client
        .get(url)
        .send()
        .and_then(|r| r.error_for_status())
        .map_err(|e| Error::Fetch(format!("{}: {}", url, e)))?;

    if let Some(length) = response.content_length() {
        if length > config.max_bytes {
            return Err(Error::Fetch(format!(
                "{} is {} bytes, larger than the {} byte limit",
                url, length, config.max_bytes
            )));
        }
    }

    let mut out = File::create(&dest).map_err(|e| Error::Fetch(format!("cannot create {}: {}", dest.display(), e)))?;
    // One byte past the limit tells an oversize body from an exact fit
    let mut limited = response.take(config.max_bytes.saturating_add(1));
    let written = io::copy(&mut limited, &mut out).map_err(|e| Error::Fetch(format!("{}: {}", url, e)))?;

    if written > config.max_bytes {
        drop(out);
        let _ = fs::remove_file(&dest);
        return Err(Error::Fetch(format!(
            "{} exceeds the {} byte limit",
            url, config.max_bytes
        )));
    }

    Ok(dest)
}
