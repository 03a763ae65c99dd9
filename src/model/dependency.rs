// src/model/dependency.rs

//! Normalized dependency and package records

use std::fmt;
use std::path::PathBuf;

use super::PackageType;
use crate::hash::Hash;

/// Where a dependency comes from
///
/// Each variant carries only the fields that make sense for it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Origin {
    /// The ecosystem's canonical public index
    Registry,
    /// A fixed commit in a git repository
    Vcs { url: String, commit: String },
    /// A direct download, pinned by exactly one digest
    Url { url: String, hash: Hash },
    /// A directory inside (or allow-listed next to) the source tree
    LocalPath { path: String },
}

/// Discriminant of [`Origin`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OriginKind {
    Registry,
    Vcs,
    Url,
    LocalPath,
}

impl OriginKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Registry => "registry",
            Self::Vcs => "vcs",
            Self::Url => "url",
            Self::LocalPath => "local-path",
        }
    }
}

impl fmt::Display for OriginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Origin {
    pub fn kind(&self) -> OriginKind {
        match self {
            Self::Registry => OriginKind::Registry,
            Self::Vcs { .. } => OriginKind::Vcs,
            Self::Url { .. } => OriginKind::Url,
            Self::LocalPath { .. } => OriginKind::LocalPath,
        }
    }

    /// Only VCS and URL dependencies are republished into the store
    pub fn needs_mirror(&self) -> bool {
        matches!(self, Self::Vcs { .. } | Self::Url { .. })
    }

    /// Locator string used when a record has no version of its own
    pub fn locator(&self) -> Option<String> {
        match self {
            Self::Registry => None,
            Self::Vcs { url, commit } => Some(format!("git+{url}@{commit}")),
            Self::Url { url, hash } => Some(format!("{url}#hash={}", hash.to_prefixed_string())),
            Self::LocalPath { path } => Some(format!("file:{path}")),
        }
    }
}

/// One classified dependency
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyRecord {
    pub kind: PackageType,
    pub name: String,
    pub version: String,
    pub origin: Origin,
    pub dev: bool,
    /// Candidate digests; any one matching is sufficient
    pub hashes: Vec<Hash>,
    /// The (name, version) this record replaced, for overridden Go modules
    pub replaces: Option<(String, String)>,
}

impl DependencyRecord {
    pub fn new(kind: PackageType, name: impl Into<String>, version: impl Into<String>, origin: Origin) -> Self {
        Self {
            kind,
            name: name.into(),
            version: version.into(),
            origin,
            dev: false,
            hashes: Vec::new(),
            replaces: None,
        }
    }

    pub fn registry(kind: PackageType, name: impl Into<String>, version: impl Into<String>) -> Self {
        Self::new(kind, name, version, Origin::Registry)
    }

    pub fn with_dev(mut self, dev: bool) -> Self {
        self.dev = dev;
        self
    }

    pub fn with_hashes(mut self, hashes: Vec<Hash>) -> Self {
        self.hashes = hashes;
        self
    }

    pub fn with_replaces(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.replaces = Some((name.into(), version.into()));
        self
    }

    /// Version string persisted in the bill of materials
    pub fn bom_version(&self) -> String {
        if self.version.is_empty() {
            self.origin.locator().unwrap_or_default()
        } else {
            self.version.clone()
        }
    }
}

/// A top-level package and its dependencies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRecord {
    pub kind: PackageType,
    pub name: String,
    pub version: String,
    /// Package directory relative to the source root
    pub path: PathBuf,
    pub dependencies: Vec<DependencyRecord>,
}

impl PackageRecord {
    pub fn new(kind: PackageType, name: impl Into<String>, version: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            name: name.into(),
            version: version.into(),
            path: path.into(),
            dependencies: Vec::new(),
        }
    }
}
