// src/paths.rs
//! Centralized path derivation for per-request bundle directories

use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};
use crate::model::PackageManager;

/// Layout of one request's working directory
///
/// ```text
/// <bundles_dir>/<id>/app/                  source checkout
/// <bundles_dir>/<id>/deps/<pm>/            downloaded artifacts
/// <bundles_dir>/<id>/<pm>-packages.json    per-manager bill of materials
/// <bundles_dir>/<id>/<pm>-config.json      per-manager emitted config
/// <bundles_dir>/<id>/packages.json         merged bill of materials
/// <bundles_dir>/<id>/config.json           merged config
/// <bundles_dir>/<id>.tar.gz                assembled bundle
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleDir {
    bundles_dir: PathBuf,
    request_id: i64,
}

impl BundleDir {
    pub fn new(bundles_dir: impl Into<PathBuf>, request_id: i64) -> Self {
        Self {
            bundles_dir: bundles_dir.into(),
            request_id,
        }
    }

    pub fn request_id(&self) -> i64 {
        self.request_id
    }

    pub fn root(&self) -> PathBuf {
        self.bundles_dir.join(self.request_id.to_string())
    }

    pub fn source_root(&self) -> PathBuf {
        self.root().join("app")
    }

    pub fn deps_dir(&self) -> PathBuf {
        self.root().join("deps")
    }

    pub fn deps_dir_for(&self, manager: PackageManager) -> PathBuf {
        self.deps_dir().join(manager.as_str())
    }

    /// Go module cache (`GOMODCACHE`)
    pub fn gomod_cache_dir(&self) -> PathBuf {
        self.deps_dir_for(PackageManager::Gomod).join("pkg").join("mod")
    }

    pub fn bom_file(&self, manager: PackageManager) -> PathBuf {
        self.root().join(format!("{}-packages.json", manager.as_str()))
    }

    pub fn config_file(&self, manager: PackageManager) -> PathBuf {
        self.root().join(format!("{}-config.json", manager.as_str()))
    }

    pub fn merged_bom_file(&self) -> PathBuf {
        self.root().join("packages.json")
    }

    pub fn merged_config_file(&self) -> PathBuf {
        self.root().join("config.json")
    }

    pub fn archive_file(&self) -> PathBuf {
        self.bundles_dir.join(format!("{}.tar.gz", self.request_id))
    }

    /// Resolve a requester-supplied package subpath inside the source root
    pub fn package_dir(&self, subpath: &Path) -> Result<PathBuf> {
        let relative = normalize_relative(subpath)?;
        Ok(self.source_root().join(relative))
    }
}

/// Lexically normalize a relative path, rejecting absolute paths and `..` escapes
pub fn normalize_relative(path: &Path) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => out.push(part),
            Component::ParentDir => {
                if !out.pop() {
                    return Err(Error::ValidationError(format!(
                        "The path {} escapes the source root",
                        path.display()
                    )));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(Error::ValidationError(format!(
                    "The path {} must be relative",
                    path.display()
                )));
            }
        }
    }
    Ok(out)
}

/// Lexically join `base` and a relative `path`, resolving `..`
///
/// Returns `None` when the result would climb above the filesystem root.
pub fn lexical_join(base: &Path, path: &Path) -> Option<PathBuf> {
    let mut out = base.to_path_buf();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => out.push(part),
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

/// Render a path relative to the source root the way the bill of materials stores it
pub fn display_relative(path: &Path) -> String {
    let s = path.to_string_lossy();
    if s.is_empty() { ".".to_string() } else { s.into_owned() }
}
