// src/mirror/registry.rs

//! Registry dependencies staged through the request's group repository
//!
//! Downloading a registry artifact through the staging group is what caches
//! it in the store's upstream proxy. The downloaded file is checked against
//! the record's candidate digests, kept under `deps/<pm>/<name>/`, and
//! published into the request's hosted repository so the staged set is
//! available without the upstream registry.
//!
//! | Layout | Path under the group |
//! |--------|----------------------|
//! | npm | `{name}/-/{basename}-{version}.tgz` |
//! | pypi | `pypi/{name}/{version}/json`, then the preferred sdist it lists |
//! | rubygems | `gems/{name}-{version}.gem` |

use rayon::prelude::*;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use url::Url;

use super::ContentMirror;
use crate::error::{Error, Result};
use crate::hash::{Hash, verify_any};
use crate::lifecycle::StagingRepository;
use crate::paths::normalize_relative;
use crate::store::{ComponentUpload, RepositoryFormat};

/// How a registry lays out its artifacts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RegistryLayout {
    Npm,
    Pypi,
    Rubygems,
}

/// One registry dependency to stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryArtifact {
    pub layout: RegistryLayout,
    pub name: String,
    pub version: String,
    /// Digests the downloaded file may match; any one is enough
    pub candidates: Vec<Hash>,
}

impl RegistryArtifact {
    pub fn new(layout: RegistryLayout, name: impl Into<String>, version: impl Into<String>, candidates: Vec<Hash>) -> Self {
        Self {
            layout,
            name: name.into(),
            version: version.into(),
            candidates,
        }
    }

    /// `name@version`
    pub fn identifier(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }
}

/// A registry dependency that was staged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedArtifact {
    pub name: String,
    pub version: String,
    /// Location under the manager's `deps/` directory
    pub path: PathBuf,
    /// The candidate that matched, `None` when the record declared no digest
    pub verified: Option<Hash>,
}

#[derive(Debug, Deserialize)]
struct PypiRelease {
    #[serde(default)]
    urls: Vec<PypiFile>,
}

#[derive(Debug, Deserialize)]
struct PypiFile {
    filename: String,
    url: String,
    #[serde(default)]
    packagetype: String,
    #[serde(default)]
    yanked: bool,
}

impl PypiFile {
    /// Not yanked beats yanked; `.tar.gz` beats `.zip` beats anything else
    fn preference(&self) -> (u8, u8) {
        let filetype = if self.filename.ends_with(".tar.gz") {
            2
        } else if self.filename.ends_with(".zip") {
            1
        } else {
            0
        };
        (u8::from(!self.yanked), filetype)
    }
}

fn join_url(base: &str, reference: &str) -> Result<String> {
    Url::parse(base)
        .and_then(|u| u.join(reference))
        .map(String::from)
        .map_err(|e| Error::ValidationError(format!("Invalid URL {reference} relative to {base}: {e}")))
}

impl ContentMirror {
    /// Stage every registry dependency on the bounded pool
    ///
    /// Artifacts are deduplicated by layout, name and version. The first
    /// failure, including a digest mismatch, fails the batch.
    pub fn stage_registry(
        &self,
        staging: &StagingRepository,
        deps_dir: &Path,
        artifacts: &[RegistryArtifact],
    ) -> Result<Vec<StagedArtifact>> {
        let mut unique: BTreeMap<(RegistryLayout, &str, &str), &RegistryArtifact> = BTreeMap::new();
        for artifact in artifacts {
            unique
                .entry((artifact.layout, artifact.name.as_str(), artifact.version.as_str()))
                .or_insert(artifact);
        }
        if unique.is_empty() {
            return Ok(Vec::new());
        }

        info!(
            "Staging {} registry dependencies through {}",
            unique.len(),
            staging.group_name()
        );
        self.pool.install(|| {
            unique
                .values()
                .collect::<Vec<_>>()
                .par_iter()
                .map(|artifact| self.stage_one(staging, deps_dir, artifact))
                .collect::<Result<Vec<_>>>()
        })
    }

    fn stage_one(
        &self,
        staging: &StagingRepository,
        deps_dir: &Path,
        artifact: &RegistryArtifact,
    ) -> Result<StagedArtifact> {
        let scratch = tempfile::tempdir()?;
        let group_url = self.store.repository_url(staging.group_name());
        let (url, filename) = self.locate(&group_url, artifact, scratch.path())?;

        let relative = normalize_relative(&Path::new(&artifact.name).join(&filename))?;
        let downloaded = scratch.path().join(&filename);
        debug!("Downloading {} from {}", artifact.identifier(), url);
        self.store.download_asset(&url, &downloaded)?;
        let verified = verify_any(&downloaded, &artifact.name, &artifact.candidates)?;

        let dest = deps_dir.join(&relative);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&downloaded, &dest).map_err(|e| {
            Error::IoError(format!("Failed to write {}: {e}", dest.display()))
        })?;

        let upload = ComponentUpload {
            repository: staging.hosted_name().to_string(),
            format: staging.hosted.format,
            name: artifact.name.clone(),
            version: (staging.hosted.format == RepositoryFormat::Npm).then(|| artifact.version.clone()),
            filename: filename.clone(),
            path: dest.clone(),
        };
        match self.store.upload_component(&upload) {
            Ok(()) => debug!("Published {} to {}", upload.asset_path(), upload.repository),
            Err(Error::AlreadyExists(_)) => {
                debug!("{} is already in {}", upload.asset_path(), upload.repository);
            }
            Err(e) => return Err(e),
        }

        Ok(StagedArtifact {
            name: artifact.name.clone(),
            version: artifact.version.clone(),
            path: relative,
            verified,
        })
    }

    /// Download URL and file name of an artifact under the group
    fn locate(&self, group_url: &str, artifact: &RegistryArtifact, scratch: &Path) -> Result<(String, String)> {
        let (name, version) = (&artifact.name, &artifact.version);
        match artifact.layout {
            RegistryLayout::Npm => {
                let basename = name.rsplit('/').next().unwrap_or(name);
                let filename = format!("{basename}-{version}.tgz");
                Ok((format!("{group_url}{name}/-/{filename}"), filename))
            }
            RegistryLayout::Rubygems => {
                let filename = format!("{name}-{version}.gem");
                Ok((format!("{group_url}gems/{filename}"), filename))
            }
            RegistryLayout::Pypi => {
                let release_url = format!("{group_url}pypi/{name}/{version}/json");
                let release_file = scratch.join("release.json");
                self.store.download_asset(&release_url, &release_file)?;
                let content = std::fs::read_to_string(&release_file)?;
                let release: PypiRelease = serde_json::from_str(&content).map_err(|e| {
                    Error::ValidationError(format!("Invalid package index response for {name}=={version}: {e}"))
                })?;

                let sdist = release
                    .urls
                    .into_iter()
                    .filter(|f| f.packagetype == "sdist")
                    .max_by_key(PypiFile::preference)
                    .ok_or_else(|| {
                        Error::ValidationError(format!("No sdists found for package {name}=={version}"))
                    })?;
                if sdist.yanked {
                    return Err(Error::ValidationError(format!(
                        "All sdists for package {name}=={version} are yanked"
                    )));
                }
                Ok((join_url(&release_url, &sdist.url)?, sdist.filename))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::hash::{HashAlgorithm, hash_bytes};
    use crate::lifecycle::RepositoryLifecycle;
    use crate::mirror::OriginFetcher;
    use crate::model::{Origin, PackageManager};
    use crate::store::{ArtifactStore, MemoryStore};
    use std::sync::Arc;

    struct Unused;

    impl OriginFetcher for Unused {
        fn fetch(&self, name: &str, _origin: &Origin, _dest: &Path) -> Result<()> {
            Err(Error::NetworkError(format!("{name} was not expected to be fetched")))
        }
    }

    fn setup(manager: PackageManager) -> (Arc<MemoryStore>, ContentMirror, StagingRepository) {
        let store = Arc::new(MemoryStore::default());
        let lifecycle = RepositoryLifecycle::new(store.clone(), &EngineConfig::default());
        let staging = lifecycle.provision(1, manager).unwrap().unwrap();
        let mirror = ContentMirror::new(store.clone(), Arc::new(Unused), 2).unwrap();
        (store, mirror, staging)
    }

    #[test]
    fn test_npm_artifact_is_verified_and_published() {
        let (store, mirror, staging) = setup(PackageManager::Npm);
        store.serve_upstream(RepositoryFormat::Npm, "@scope/left/-/left-1.2.0.tgz", b"left".to_vec());
        let deps = tempfile::tempdir().unwrap();
        let integrity = hash_bytes(HashAlgorithm::Sha512, b"left");

        let staged = mirror
            .stage_registry(
                &staging,
                deps.path(),
                &[
                    RegistryArtifact::new(RegistryLayout::Npm, "@scope/left", "1.2.0", vec![integrity.clone()]),
                    RegistryArtifact::new(RegistryLayout::Npm, "@scope/left", "1.2.0", vec![integrity.clone()]),
                ],
            )
            .unwrap();
        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].path, PathBuf::from("@scope/left/left-1.2.0.tgz"));
        assert_eq!(staged[0].verified, Some(integrity));
        assert_eq!(std::fs::read(deps.path().join(&staged[0].path)).unwrap(), b"left");
        assert_eq!(store.upstream_fetches(), 1);
        assert_eq!(
            store.component_urls(),
            vec!["http://store.invalid/repository/depstage-npm-hosted-1/@scope/left/-/left-1.2.0.tgz"]
        );
    }

    #[test]
    fn test_digest_mismatch_fails_and_publishes_nothing() {
        let (store, mirror, staging) = setup(PackageManager::Pip);
        store.serve_upstream(
            RepositoryFormat::Pypi,
            "pypi/foo/1.0.0/json",
            br#"{"urls": [{"filename": "foo-1.0.0.tar.gz", "url": "../../../packages/foo/foo-1.0.0.tar.gz", "packagetype": "sdist"}]}"#.to_vec(),
        );
        store.serve_upstream(RepositoryFormat::Pypi, "packages/foo/foo-1.0.0.tar.gz", b"foo".to_vec());
        let deps = tempfile::tempdir().unwrap();
        let wrong = Hash::new(HashAlgorithm::Sha256, "0".repeat(64)).unwrap();

        let err = mirror
            .stage_registry(
                &staging,
                deps.path(),
                &[RegistryArtifact::new(RegistryLayout::Pypi, "foo", "1.0.0", vec![wrong])],
            )
            .unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
        assert_eq!(store.upload_count(), 0);
        assert!(!deps.path().join("foo").exists());
    }

    #[test]
    fn test_pypi_prefers_unyanked_tarball_sdist() {
        let (store, mirror, staging) = setup(PackageManager::Pip);
        store.serve_upstream(
            RepositoryFormat::Pypi,
            "pypi/foo/1.0.0/json",
            br#"{"urls": [
                {"filename": "foo-1.0.0-py3-none-any.whl", "url": "../../../packages/foo/foo-1.0.0-py3-none-any.whl", "packagetype": "bdist_wheel"},
                {"filename": "foo-1.0.0.zip", "url": "../../../packages/foo/foo-1.0.0.zip", "packagetype": "sdist"},
                {"filename": "foo-1.0.0.tar.gz", "url": "../../../packages/foo/foo-1.0.0.tar.gz", "packagetype": "sdist", "yanked": true}
            ]}"#
            .to_vec(),
        );
        store.serve_upstream(RepositoryFormat::Pypi, "packages/foo/foo-1.0.0.zip", b"zip".to_vec());
        let deps = tempfile::tempdir().unwrap();

        let staged = mirror
            .stage_registry(
                &staging,
                deps.path(),
                &[RegistryArtifact::new(RegistryLayout::Pypi, "foo", "1.0.0", vec![])],
            )
            .unwrap();
        assert_eq!(staged[0].path, PathBuf::from("foo/foo-1.0.0.zip"));
        assert_eq!(staged[0].verified, None);
        assert_eq!(
            store.component_urls(),
            vec!["http://store.invalid/repository/depstage-pip-raw-1/foo/foo-1.0.0.zip"]
        );
    }

    #[test]
    fn test_missing_sdist_is_an_error() {
        let (store, mirror, staging) = setup(PackageManager::Pip);
        store.serve_upstream(RepositoryFormat::Pypi, "pypi/foo/1.0.0/json", br#"{"urls": []}"#.to_vec());
        let deps = tempfile::tempdir().unwrap();
        let err = mirror
            .stage_registry(
                &staging,
                deps.path(),
                &[RegistryArtifact::new(RegistryLayout::Pypi, "foo", "1.0.0", vec![])],
            )
            .unwrap_err();
        assert!(err.to_string().contains("No sdists found for package foo==1.0.0"));
    }

    #[test]
    fn test_gem_is_staged_from_the_group() {
        let (store, mirror, staging) = setup(PackageManager::Rubygems);
        store.serve_upstream(RepositoryFormat::Rubygems, "gems/rake-13.0.6.gem", b"gem".to_vec());
        let deps = tempfile::tempdir().unwrap();
        let staged = mirror
            .stage_registry(
                &staging,
                deps.path(),
                &[RegistryArtifact::new(RegistryLayout::Rubygems, "rake", "13.0.6", vec![])],
            )
            .unwrap();
        assert_eq!(staged[0].path, PathBuf::from("rake/rake-13.0.6.gem"));
        assert!(store.repository_url(staging.hosted_name()).ends_with("depstage-rubygems-raw-1/"));
        assert_eq!(store.upload_count(), 1);
    }
}
