// src/store/mod.rs

//! Artifact store access
//!
//! The engine talks to a hosted/proxy repository manager through the
//! [`ArtifactStore`] trait. [`HttpStore`] speaks a Nexus-style REST API;
//! [`MemoryStore`] keeps everything in process for tests and dry runs.

mod http;
mod memory;

pub use http::HttpStore;
pub use memory::MemoryStore;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Repository content format
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepositoryFormat {
    Raw,
    Npm,
    Pypi,
    Rubygems,
}

impl RepositoryFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Npm => "npm",
            Self::Pypi => "pypi",
            Self::Rubygems => "rubygems",
        }
    }
}

impl fmt::Display for RepositoryFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Hosted repositories accept uploads; groups combine other repositories for reads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepositoryKind {
    Hosted,
    Group { members: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositorySpec {
    pub name: String,
    pub format: RepositoryFormat,
    pub kind: RepositoryKind,
}

/// Read access granted to a credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub repository: String,
    pub format: RepositoryFormat,
}

/// Lookup of a published component
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentQuery {
    pub repository: String,
    pub name: String,
    pub version: Option<String>,
    pub group: Option<String>,
}

/// A component found in the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Component {
    pub repository: String,
    pub name: String,
    pub version: Option<String>,
    pub group: Option<String>,
    pub download_url: String,
    /// Hex sha256 of the asset, when the store reports it
    pub sha256: Option<String>,
}

/// One file to publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentUpload {
    pub repository: String,
    pub format: RepositoryFormat,
    /// Component name (raw: the directory; npm: the package name)
    pub name: String,
    pub version: Option<String>,
    pub filename: String,
    pub path: PathBuf,
}

impl ComponentUpload {
    /// Path of the published asset relative to the repository root
    pub fn asset_path(&self) -> String {
        match self.format {
            RepositoryFormat::Npm => {
                let basename = self.name.rsplit('/').next().unwrap_or(&self.name);
                format!(
                    "{}/-/{}-{}.tgz",
                    self.name,
                    basename,
                    self.version.as_deref().unwrap_or_default()
                )
            }
            _ => format!("{}/{}", self.name, self.filename),
        }
    }

    /// The query that finds this upload once published
    pub fn query(&self) -> ComponentQuery {
        match self.format {
            RepositoryFormat::Npm => {
                let (group, name) = split_npm_scope(&self.name);
                ComponentQuery {
                    repository: self.repository.clone(),
                    name: name.to_string(),
                    version: self.version.clone(),
                    group: group.map(str::to_string),
                }
            }
            _ => ComponentQuery {
                repository: self.repository.clone(),
                name: self.asset_path(),
                version: None,
                group: None,
            },
        }
    }
}

/// Split `@scope/name` into (`Some("scope")`, `"name"`)
pub fn split_npm_scope(name: &str) -> (Option<&str>, &str) {
    match name.strip_prefix('@').and_then(|n| n.split_once('/')) {
        Some((scope, rest)) => (Some(scope), rest),
        None => (None, name),
    }
}

/// Operations the engine needs from a repository manager
pub trait ArtifactStore: Send + Sync {
    /// Base URL the build will use to reach the store
    fn base_url(&self) -> &str;

    /// URL of a repository's content root, always ending in `/`
    fn repository_url(&self, name: &str) -> String {
        format!("{}/repository/{}/", self.base_url().trim_end_matches('/'), name)
    }

    /// Create a repository; `AlreadyExists` when the name is taken
    fn create_repository(&self, spec: &RepositorySpec) -> Result<()>;

    /// Delete a repository; `NotFoundError` when it does not exist
    fn delete_repository(&self, name: &str) -> Result<()>;

    /// Create a user able to read `grants`
    fn create_credential(&self, username: &str, password: &str, grants: &[Grant]) -> Result<()>;

    /// Delete a user; `NotFoundError` when it does not exist
    fn delete_credential(&self, username: &str) -> Result<()>;

    fn find_component(&self, query: &ComponentQuery) -> Result<Option<Component>>;

    /// Publish a file; `AlreadyExists` when a component with the same identity is present
    fn upload_component(&self, upload: &ComponentUpload) -> Result<()>;

    fn download_asset(&self, url: &str, dest: &Path) -> Result<()>;

    /// Run a named server-side maintenance script with a JSON payload
    fn execute_script(&self, name: &str, payload: &serde_json::Value) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_npm_asset_path() {
        let upload = ComponentUpload {
            repository: "r".into(),
            format: RepositoryFormat::Npm,
            name: "@scope/left-pad".into(),
            version: Some("1.0.0-external-gitcommit-abc".into()),
            filename: "left-pad.tgz".into(),
            path: PathBuf::from("/tmp/x.tgz"),
        };
        assert_eq!(
            upload.asset_path(),
            "@scope/left-pad/-/left-pad-1.0.0-external-gitcommit-abc.tgz"
        );
        let query = upload.query();
        assert_eq!(query.group.as_deref(), Some("scope"));
        assert_eq!(query.name, "left-pad");
    }

    #[test]
    fn test_raw_asset_path() {
        let upload = ComponentUpload {
            repository: "r".into(),
            format: RepositoryFormat::Raw,
            name: "bar".into(),
            version: None,
            filename: "bar-external-sha256-abc.tar.gz".into(),
            path: PathBuf::from("/tmp/x"),
        };
        assert_eq!(upload.asset_path(), "bar/bar-external-sha256-abc.tar.gz");
        assert_eq!(upload.query().name, "bar/bar-external-sha256-abc.tar.gz");
    }

    #[test]
    fn test_split_scope() {
        assert_eq!(split_npm_scope("@a/b"), (Some("a"), "b"));
        assert_eq!(split_npm_scope("b"), (None, "b"));
    }
}
