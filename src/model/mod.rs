// src/model/mod.rs

//! Core data types shared by drivers, the mirror and the aggregator
//!
//! - [`PackageManager`]: what a request asks the engine to run
//! - [`PackageType`]: the `type` recorded in the bill of materials
//! - [`Origin`], [`DependencyRecord`], [`PackageRecord`]: the normalized graph
//!   every driver produces
//! - [`RequestContext`]: the read-only view of a request that stages consume

mod dependency;

pub use dependency::{DependencyRecord, Origin, OriginKind, PackageRecord};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::paths::BundleDir;

/// Package managers a request can ask for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PackageManager {
    Gomod,
    Npm,
    Yarn,
    Pip,
    Rubygems,
    GitSubmodule,
}

impl PackageManager {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gomod => "gomod",
            Self::Npm => "npm",
            Self::Yarn => "yarn",
            Self::Pip => "pip",
            Self::Rubygems => "rubygems",
            Self::GitSubmodule => "git-submodule",
        }
    }

    pub fn all() -> &'static [PackageManager] {
        &[
            Self::Gomod,
            Self::Npm,
            Self::Yarn,
            Self::Pip,
            Self::Rubygems,
            Self::GitSubmodule,
        ]
    }

    /// The package type this manager records for its top-level packages
    pub fn package_type(&self) -> PackageType {
        match self {
            Self::Gomod => PackageType::Gomod,
            Self::Npm => PackageType::Npm,
            Self::Yarn => PackageType::Yarn,
            Self::Pip => PackageType::Pip,
            Self::Rubygems => PackageType::Rubygems,
            Self::GitSubmodule => PackageType::GitSubmodule,
        }
    }
}

impl fmt::Display for PackageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PackageManager {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gomod" => Ok(Self::Gomod),
            "npm" => Ok(Self::Npm),
            "yarn" => Ok(Self::Yarn),
            "pip" => Ok(Self::Pip),
            "rubygems" => Ok(Self::Rubygems),
            "git-submodule" => Ok(Self::GitSubmodule),
            _ => Err(Error::ValidationError(format!(
                "Unsupported package manager: {s}"
            ))),
        }
    }
}

/// `type` of a package or dependency in the bill of materials
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PackageType {
    GitSubmodule,
    GoPackage,
    Gomod,
    Npm,
    Pip,
    Rubygems,
    Yarn,
}

impl PackageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gomod => "gomod",
            Self::GoPackage => "go-package",
            Self::GitSubmodule => "git-submodule",
            Self::Npm => "npm",
            Self::Pip => "pip",
            Self::Rubygems => "rubygems",
            Self::Yarn => "yarn",
        }
    }
}

impl fmt::Display for PackageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Feature flags a request may carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Flag {
    GomodVendor,
    GomodVendorCheck,
    CgoDisable,
    ForceGomodTidy,
}

impl Flag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GomodVendor => "gomod-vendor",
            Self::GomodVendorCheck => "gomod-vendor-check",
            Self::CgoDisable => "cgo-disable",
            Self::ForceGomodTidy => "force-gomod-tidy",
        }
    }
}

impl FromStr for Flag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gomod-vendor" => Ok(Self::GomodVendor),
            "gomod-vendor-check" => Ok(Self::GomodVendorCheck),
            "cgo-disable" => Ok(Self::CgoDisable),
            "force-gomod-tidy" => Ok(Self::ForceGomodTidy),
            _ => Err(Error::ValidationError(format!("Unknown flag: {s}"))),
        }
    }
}

/// A requester-supplied override of one dependency's version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyReplacement {
    #[serde(rename = "type")]
    pub kind: PackageType,
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_name: Option<String>,
}

/// Read-only view of a request handed to every stage
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub id: i64,
    pub repo: String,
    pub git_ref: String,
    pub bundle: BundleDir,
    pub package_managers: Vec<PackageManager>,
    /// Relative package directories per manager; managers absent here use `.`
    pub packages: BTreeMap<PackageManager, Vec<PathBuf>>,
    pub flags: BTreeSet<Flag>,
    pub dependency_replacements: Vec<DependencyReplacement>,
}

impl RequestContext {
    pub fn has_flag(&self, flag: Flag) -> bool {
        self.flags.contains(&flag)
    }

    /// Package directories for one manager, relative to the source root
    pub fn package_paths(&self, manager: PackageManager) -> Vec<PathBuf> {
        match self.packages.get(&manager) {
            Some(paths) if !paths.is_empty() => paths.clone(),
            _ => vec![PathBuf::from(".")],
        }
    }

    /// Last path segment of the repository URL, without a `.git` suffix
    pub fn repo_name(&self) -> String {
        let trimmed = self.repo.trim_end_matches('/');
        let last = trimmed.rsplit(['/', ':']).next().unwrap_or(trimmed);
        last.strip_suffix(".git").unwrap_or(last).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_package_manager_roundtrip() {
        for pm in PackageManager::all() {
            assert_eq!(pm.as_str().parse::<PackageManager>().unwrap(), *pm);
        }
        assert!("cargo".parse::<PackageManager>().is_err());
    }

    #[test]
    fn test_package_type_serde() {
        let json = serde_json::to_string(&PackageType::GoPackage).unwrap();
        assert_eq!(json, "\"go-package\"");
        let back: PackageType = serde_json::from_str("\"git-submodule\"").unwrap();
        assert_eq!(back, PackageType::GitSubmodule);
    }

    #[test]
    fn test_flags() {
        assert_eq!("cgo-disable".parse::<Flag>().unwrap(), Flag::CgoDisable);
        assert!("turbo".parse::<Flag>().is_err());
    }

    #[test]
    fn test_repo_name() {
        let ctx = RequestContext {
            id: 1,
            repo: "https://github.com/example/webapp.git".to_string(),
            git_ref: "a".repeat(40),
            bundle: BundleDir::new("/tmp/bundles", 1),
            package_managers: vec![],
            packages: BTreeMap::new(),
            flags: BTreeSet::new(),
            dependency_replacements: vec![],
        };
        assert_eq!(ctx.repo_name(), "webapp");
        assert_eq!(
            ctx.package_paths(PackageManager::Npm),
            vec![PathBuf::from(".")]
        );
    }
}
