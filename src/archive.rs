// src/archive.rs

//! Gzipped tarball helpers
//!
//! - Archive a checked-out VCS dependency (without its `.git` directory)
//! - Repack an npm tarball with a new `version` in its package.json
//! - Extract a tarball, refusing entries that escape the destination
//! - Assemble the final request bundle

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Component, Path};
use tar::{Archive, Builder, Header};
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{Error, Result};

/// Fixed mtime so identical trees archive to identical bytes
const ARCHIVE_MTIME: u64 = 0;

/// Create `dest` as a `.tar.gz` of `src_dir`, every entry placed under `prefix/`
///
/// Entries are added in sorted order and `.git` directories are skipped.
pub fn create_tar_gz(src_dir: &Path, prefix: &str, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::create(dest)
        .map_err(|e| Error::IoError(format!("Failed to create {}: {e}", dest.display())))?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = Builder::new(encoder);
    builder.follow_symlinks(false);

    let walker = WalkDir::new(src_dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git");

    for entry in walker {
        let entry = entry.map_err(|e| Error::IoError(format!("Failed to walk {}: {e}", src_dir.display())))?;
        let relative = entry
            .path()
            .strip_prefix(src_dir)
            .map_err(|e| Error::IoError(e.to_string()))?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let name = Path::new(prefix).join(relative);
        let file_type = entry.file_type();

        let mut header = Header::new_gnu();
        header.set_mtime(ARCHIVE_MTIME);
        header.set_uid(0);
        header.set_gid(0);

        if file_type.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_mode(0o755);
            header.set_size(0);
            builder.append_data(&mut header, &name, std::io::empty())?;
        } else if file_type.is_symlink() {
            let target = std::fs::read_link(entry.path())?;
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_mode(0o777);
            header.set_size(0);
            builder.append_link(&mut header, &name, &target)?;
        } else {
            let metadata = entry.metadata().map_err(|e| Error::IoError(e.to_string()))?;
            header.set_entry_type(tar::EntryType::Regular);
            header.set_mode(file_mode(&metadata));
            header.set_size(metadata.len());
            let mut f = File::open(entry.path())?;
            builder.append_data(&mut header, &name, &mut f)?;
        }
    }

    let encoder = builder.into_inner()?;
    encoder.finish()?;
    debug!("Archived {} into {}", src_dir.display(), dest.display());
    Ok(())
}

#[cfg(unix)]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    if metadata.permissions().mode() & 0o111 != 0 { 0o755 } else { 0o644 }
}

#[cfg(not(unix))]
fn file_mode(_metadata: &std::fs::Metadata) -> u32 {
    0o644
}

/// Copy an npm tarball, setting `version` in its top-level package.json
pub fn repack_npm_tarball(src: &Path, dest: &Path, version: &str) -> Result<()> {
    let input = File::open(src)
        .map_err(|e| Error::IoError(format!("Failed to open {}: {e}", src.display())))?;
    let mut archive = Archive::new(GzDecoder::new(input));

    let output = File::create(dest)
        .map_err(|e| Error::IoError(format!("Failed to create {}: {e}", dest.display())))?;
    let mut builder = Builder::new(GzEncoder::new(output, Compression::default()));
    let mut rewritten = false;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let mut header = entry.header().clone();

        if !rewritten && is_top_level_package_json(&path) {
            let mut content = String::new();
            entry.read_to_string(&mut content)?;
            let mut manifest: serde_json::Value = serde_json::from_str(&content)?;
            let obj = manifest.as_object_mut().ok_or_else(|| {
                Error::ValidationError(format!("{} is not a JSON object", path.display()))
            })?;
            obj.insert(
                "version".to_string(),
                serde_json::Value::String(version.to_string()),
            );
            let bytes = serde_json::to_vec_pretty(&manifest)?;
            header.set_size(bytes.len() as u64);
            header.set_cksum();
            builder.append_data(&mut header, &path, bytes.as_slice())?;
            rewritten = true;
        } else {
            builder.append_data(&mut header, &path, &mut entry)?;
        }
    }

    if !rewritten {
        return Err(Error::ValidationError(format!(
            "The npm package {} has no package.json",
            src.display()
        )));
    }

    builder.into_inner()?.finish()?;
    Ok(())
}

fn is_top_level_package_json(path: &Path) -> bool {
    let parts: Vec<_> = path.components().collect();
    parts.len() == 2 && parts[1].as_os_str() == "package.json"
}

/// Extract a `.tar.gz` into `dest`, stripping the first path component
pub fn extract_tar_gz(src: &Path, dest: &Path) -> Result<()> {
    let input = File::open(src)
        .map_err(|e| Error::IoError(format!("Failed to open {}: {e}", src.display())))?;
    let mut archive = Archive::new(GzDecoder::new(input));
    std::fs::create_dir_all(dest)?;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let stripped: std::path::PathBuf = path.components().skip(1).collect();
        if stripped.as_os_str().is_empty() {
            continue;
        }
        if stripped
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(Error::ValidationError(format!(
                "The archive {} contains an unsafe path: {}",
                src.display(),
                path.display()
            )));
        }
        entry.unpack(dest.join(&stripped))?;
    }
    Ok(())
}

/// Write `entries` (relative name, source path) into one `.tar.gz`
pub fn bundle_paths(dest: &Path, entries: &[(&str, &Path)]) -> Result<()> {
    let file = File::create(dest)
        .map_err(|e| Error::IoError(format!("Failed to create {}: {e}", dest.display())))?;
    let mut builder = Builder::new(GzEncoder::new(file, Compression::default()));
    builder.follow_symlinks(false);
    for (name, path) in entries {
        if path.is_dir() {
            builder.append_dir_all(name, path)?;
        } else if path.is_file() {
            builder.append_path_with_name(path, name)?;
        }
    }
    let mut encoder = builder.into_inner()?;
    encoder.flush()?;
    encoder.finish()?;
    Ok(())
}
