//! Archive packing and secure unpacking.
//!
//! Packing is deterministic:
//! - Sources are added in declaration order
//! - Within a source, members are sorted by their `/`-separated path
//! - Timestamps are normalised (zip: 1980-01-01, tar: mtime 0)
//!
//! Symlinks are only followed when they resolve to a regular file inside
//! the source root. The archive is written next to its destination and
//! renamed into place, so a half-written archive is never visible.
//!
//! Unpacking validates every entry (no absolute paths, no `..`, no links)
//! before anything is written.

use anyhow::{bail, Context, Result as AnyResult};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tar::{Archive, Builder, EntryType, Header};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{Error, Result};

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const ZIP_EMPTY_MAGIC: &[u8] = b"PK\x05\x06";
const GZIP_MAGIC: &[u8] = b"\x1f\x8b";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArchiveFormat {
    #[default]
    #[serde(rename = "zip")]
    Zip,
    #[serde(rename = "tar.gz")]
    TarGz,
}

impl ArchiveFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::TarGz => "tar.gz",
        }
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ArchiveFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "zip" => Ok(ArchiveFormat::Zip),
            "tar.gz" | "tgz" => Ok(ArchiveFormat::TarGz),
            other => Err(format!("unknown archive format '{}' (expected zip or tar.gz)", other)),
        }
    }
}

/// Include predicate over a member's path relative to its source root.
pub type PathFilter = Arc<dyn Fn(&Path) -> bool + Send + Sync>;

/// One root to pack: a directory or a single file.
#[derive(Clone)]
pub struct PackSource {
    pub root: PathBuf,
    /// Member path prefix inside the archive ("" for the archive root)
    pub prefix: String,
    filter: Option<PathFilter>,
}

impl PackSource {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            prefix: String::new(),
            filter: None,
        }
    }

    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.trim_matches('/').to_string();
        self
    }

    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Path) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    fn includes(&self, relative: &Path) -> bool {
        self.filter.as_ref().map_or(true, |f| f(relative))
    }

    fn member_name(&self, relative: &str) -> String {
        if self.prefix.is_empty() {
            relative.to_string()
        } else if relative.is_empty() {
            self.prefix.clone()
        } else {
            format!("{}/{}", self.prefix, relative)
        }
    }
}

impl fmt::Debug for PackSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackSource")
            .field("root", &self.root)
            .field("prefix", &self.prefix)
            .field("filtered", &self.filter.is_some())
            .finish()
    }
}

#[derive(Debug)]
struct Member {
    name: String,
    source: PathBuf,
    executable: bool,
}

// ============================================================================
// Packing
// ============================================================================

/// Pack `sources` into `dest`. Returns the member names in archive order.
pub fn pack(sources: &[PackSource], dest: &Path, format: ArchiveFormat) -> Result<Vec<String>> {
    pack_inner(sources, dest, format).map_err(|e| Error::Packaging(format!("{:#}", e)))
}

fn pack_inner(sources: &[PackSource], dest: &Path, format: ArchiveFormat) -> AnyResult<Vec<String>> {
    let members = collect_members(sources)?;

    let file_name = dest
        .file_name()
        .context(format!("Invalid archive path: {}", dest.display()))?;
    let partial = dest.with_file_name(format!(".{}.partial", file_name.to_string_lossy()));

    let written = match format {
        ArchiveFormat::Zip => write_zip(&members, &partial),
        ArchiveFormat::TarGz => write_tar_gz(&members, &partial),
    };
    if let Err(e) = written {
        let _ = fs::remove_file(&partial);
        return Err(e);
    }

    if let Err(e) = fs::rename(&partial, dest) {
        let _ = fs::remove_file(&partial);
        return Err(e).context(format!("Failed to move archive into place: {}", dest.display()));
    }

    info!("Packed {} members into {} ({})", members.len(), dest.display(), format);
    Ok(members.into_iter().map(|m| m.name).collect())
}

fn collect_members(sources: &[PackSource]) -> AnyResult<Vec<Member>> {
    let mut all = Vec::new();
    let mut seen = HashSet::new();

    for source in sources {
        let metadata = fs::metadata(&source.root)
            .context(format!("Pack source not found: {}", source.root.display()))?;

        let mut members = Vec::new();
        if metadata.is_file() {
            let name = if source.prefix.is_empty() {
                source
                    .root
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .context(format!("Invalid pack source: {}", source.root.display()))?
            } else {
                source.prefix.clone()
            };
            members.push(Member {
                name,
                source: source.root.clone(),
                executable: is_executable(&metadata),
            });
        } else {
            let root = source
                .root
                .canonicalize()
                .context(format!("Failed to resolve {}", source.root.display()))?;
            walk(source, &root, &root, &mut members)?;
            members.sort_by(|a, b| a.name.cmp(&b.name));
        }

        for member in members {
            if !seen.insert(member.name.clone()) {
                bail!("Duplicate archive member: {}", member.name);
            }
            all.push(member);
        }
    }

    Ok(all)
}

fn walk(source: &PackSource, root: &Path, dir: &Path, out: &mut Vec<Member>) -> AnyResult<()> {
    let entries = fs::read_dir(dir).context(format!("Failed to read directory: {}", dir.display()))?;

    for entry in entries {
        let entry = entry.context(format!("Failed to read directory: {}", dir.display()))?;
        let path = entry.path();
        let relative = path.strip_prefix(root).context("Walked outside pack root")?.to_path_buf();
        let file_type = entry.file_type()?;

        let (source_path, metadata) = if file_type.is_symlink() {
            match path.canonicalize() {
                Ok(target) if target.starts_with(root) && target.is_file() => {
                    let metadata = fs::metadata(&target)?;
                    (target, metadata)
                }
                _ => {
                    warn!("Skipping symlink outside pack root or to a directory: {}", path.display());
                    continue;
                }
            }
        } else if file_type.is_dir() {
            walk(source, root, &path, out)?;
            continue;
        } else if file_type.is_file() {
            let metadata = entry.metadata()?;
            (path.clone(), metadata)
        } else {
            debug!("Skipping special file: {}", path.display());
            continue;
        };

        if !source.includes(&relative) {
            continue;
        }

        out.push(Member {
            name: source.member_name(&to_member_path(&relative)),
            source: source_path,
            executable: is_executable(&metadata),
        });
    }

    Ok(())
}

/// `/`-separated form of a relative path.
fn to_member_path(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(unix)]
fn is_executable(metadata: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &fs::Metadata) -> bool {
    false
}

fn member_mode(member: &Member) -> u32 {
    if member.executable {
        0o755
    } else {
        0o644
    }
}

fn write_zip(members: &[Member], path: &Path) -> AnyResult<()> {
    let file = File::create(path).context(format!("Failed to create archive: {}", path.display()))?;
    let mut zip = ZipWriter::new(BufWriter::new(file));

    for member in members {
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .last_modified_time(zip::DateTime::default())
            .unix_permissions(member_mode(member));
        zip.start_file(member.name.as_str(), options)
            .context(format!("Failed to add {}", member.name))?;
        let mut input = File::open(&member.source)
            .context(format!("Failed to open file: {}", member.source.display()))?;
        io::copy(&mut input, &mut zip).context(format!("Failed to archive file: {}", member.source.display()))?;
    }

    let mut out = zip.finish().context("Failed to finalize archive")?;
    out.flush().context("Failed to flush archive")?;
    Ok(())
}

fn write_tar_gz(members: &[Member], path: &Path) -> AnyResult<()> {
    let file = File::create(path).context(format!("Failed to create archive: {}", path.display()))?;
    let enc = GzEncoder::new(BufWriter::new(file), Compression::default());
    let mut tar = Builder::new(enc);

    for member in members {
        let input = File::open(&member.source)
            .context(format!("Failed to open file: {}", member.source.display()))?;
        let size = input.metadata()?.len();

        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(size);
        header.set_mode(member_mode(member));
        header.set_mtime(0);
        tar.append_data(&mut header, &member.name, input)
            .context(format!("Failed to archive file: {}", member.source.display()))?;
    }

    let enc = tar.into_inner().context("Failed to finalize archive")?;
    let mut out = enc.finish().context("Failed to finalize compression")?;
    out.flush().context("Failed to flush archive")?;
    Ok(())
}

// ============================================================================
// Unpacking
// ============================================================================

fn detect_format(path: &Path) -> AnyResult<ArchiveFormat> {
    let mut magic = [0u8; 4];
    let mut file = File::open(path).context(format!("Failed to open archive: {}", path.display()))?;
    let n = file.read(&mut magic)?;
    let magic = &magic[..n];

    if magic.starts_with(ZIP_MAGIC) || magic.starts_with(ZIP_EMPTY_MAGIC) {
        Ok(ArchiveFormat::Zip)
    } else if magic.starts_with(GZIP_MAGIC) {
        Ok(ArchiveFormat::TarGz)
    } else {
        bail!("{} is neither a zip nor a tar.gz archive", path.display())
    }
}

/// Relative path of an archive entry, or an error if it could escape `dest`.
fn safe_entry_path(name: &str) -> AnyResult<PathBuf> {
    if name.starts_with('/') || name.starts_with('\\') {
        bail!("Archive contains absolute path: {} (only relative paths allowed)", name);
    }

    let path = Path::new(name);
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir => bail!("Archive contains path traversal: {} (.. not allowed)", name),
            Component::RootDir | Component::Prefix(_) => {
                bail!("Archive contains absolute path: {} (only relative paths allowed)", name)
            }
        }
    }
    Ok(clean)
}

/// Extract `archive` (zip or tar.gz, detected by content) into `dest`.
///
/// Returns the number of regular files written.
pub fn unpack(archive: &Path, dest: &Path) -> Result<usize> {
    let unpacked = detect_format(archive).and_then(|format| match format {
        ArchiveFormat::Zip => unpack_zip(archive, dest),
        ArchiveFormat::TarGz => unpack_tar_gz(archive, dest),
    });
    let count = unpacked.map_err(|e| Error::InvalidProject(format!("{:#}", e)))?;
    info!("Unpacked {} files from {} into {}", count, archive.display(), dest.display());
    Ok(count)
}

fn unpack_zip(archive: &Path, dest: &Path) -> AnyResult<usize> {
    let file = File::open(archive).context(format!("Failed to open archive: {}", archive.display()))?;
    let mut zip = ZipArchive::new(file).context(format!("Invalid zip archive: {}", archive.display()))?;

    // Validate everything before writing anything
    let mut plan = Vec::with_capacity(zip.len());
    for i in 0..zip.len() {
        let entry = zip.by_index(i).context("Failed to read zip entry")?;
        let name = entry.name().to_string();
        if entry.enclosed_name().is_none() {
            bail!("Archive entry escapes destination: {}", name);
        }
        if entry.unix_mode().map_or(false, |mode| mode & 0o170000 == 0o120000) {
            bail!("Archive contains symlink: {} (symlinks blocked for security)", name);
        }
        plan.push((safe_entry_path(&name)?, entry.is_dir()));
    }

    let mut files = 0;
    for (i, (relative, is_dir)) in plan.into_iter().enumerate() {
        let target = dest.join(&relative);
        if is_dir {
            fs::create_dir_all(&target).context(format!("Failed to create {}", target.display()))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).context(format!("Failed to create {}", parent.display()))?;
        }
        let mut entry = zip.by_index(i).context("Failed to read zip entry")?;
        let mut out = File::create(&target).context(format!("Failed to create {}", target.display()))?;
        io::copy(&mut entry, &mut out).context(format!("Failed to extract {}", relative.display()))?;
        files += 1;
    }

    Ok(files)
}

fn unpack_tar_gz(archive: &Path, dest: &Path) -> AnyResult<usize> {
    // Pass 1: validate
    {
        let file = File::open(archive).context(format!("Failed to open archive: {}", archive.display()))?;
        let mut tar = Archive::new(GzDecoder::new(file));
        for entry in tar.entries().context("Invalid tar.gz archive")? {
            let entry = entry.context("Failed to read tar entry")?;
            let path = entry.path()?.to_string_lossy().to_string();
            let entry_type = entry.header().entry_type();

            if is_metadata_header(entry_type) {
                debug!("Skipping metadata header: {}", path);
                continue;
            }
            if entry_type.is_symlink() || entry_type.is_hard_link() {
                bail!("Archive contains symlink: {} (symlinks blocked for security)", path);
            }
            if !(entry_type.is_file() || entry_type.is_dir()) {
                bail!("Archive contains unsupported entry type: {}", path);
            }
            safe_entry_path(&path)?;
        }
    }

    // Pass 2: extract
    let file = File::open(archive).context(format!("Failed to open archive: {}", archive.display()))?;
    let mut tar = Archive::new(GzDecoder::new(file));
    let mut files = 0;
    for entry in tar.entries()? {
        let mut entry = entry?;
        if is_metadata_header(entry.header().entry_type()) {
            continue;
        }
        let is_file = entry.header().entry_type().is_file();
        let path = entry.path()?.to_path_buf();
        if !entry
            .unpack_in(dest)
            .context(format!("Failed to extract {}", path.display()))?
        {
            bail!("Archive entry escapes destination: {}", path.display());
        }
        if is_file {
            files += 1;
        }
    }

    Ok(files)
}

/// PAX and GNU headers that describe other entries instead of holding data.
fn is_metadata_header(entry_type: EntryType) -> bool {
    entry_type.is_pax_global_extensions()
        || entry_type.is_pax_local_extensions()
        || entry_type.is_gnu_longname()
        || entry_type.is_gnu_longlink()
}

/// Member names of an archive in stored order (directories excluded).
pub fn list_members(archive: &Path) -> Result<Vec<String>> {
    let listed = detect_format(archive).and_then(|format| -> AnyResult<Vec<String>> {
        let file = File::open(archive)?;
        match format {
            ArchiveFormat::Zip => {
                let mut zip = ZipArchive::new(file)?;
                let mut names = Vec::with_capacity(zip.len());
                for i in 0..zip.len() {
                    let entry = zip.by_index(i)?;
                    if !entry.is_dir() {
                        names.push(entry.name().to_string());
                    }
                }
                Ok(names)
            }
            ArchiveFormat::TarGz => {
                let mut tar = Archive::new(GzDecoder::new(file));
                let mut names = Vec::new();
                for entry in tar.entries()? {
                    let entry = entry?;
                    if entry.header().entry_type().is_file() {
                        names.push(entry.path()?.to_string_lossy().to_string());
                    }
                }
                Ok(names)
            }
        }
    });
    listed.map_err(|e| Error::Packaging(format!("{:#}", e)))
}
