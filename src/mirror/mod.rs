// src/mirror/mod.rs

//! Content mirror for non-registry dependencies
//!
//! Registry dependencies take a different path, see [`ContentMirror::stage_registry`].
//!
//! Every VCS and URL dependency gets a deterministic name in the store:
//!
//! ```text
//! {name}/{name}-external-gitcommit-{commit}.tar.gz
//! {name}/{name}-external-{algorithm}-{digest}.{ext}
//! ```
//!
//! The store is searched under that name before anything is fetched, so the
//! same dependency is downloaded from its origin at most once no matter how
//! many requests resolve it. A publish that loses a race with another worker
//! (`AlreadyExists`) counts as success.

mod fetch;
mod registry;

pub use fetch::{NetworkFetcher, OriginFetcher, VCS_ARCHIVE_PREFIX};
pub use registry::{RegistryArtifact, RegistryLayout, StagedArtifact};

use rayon::prelude::*;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::archive::repack_npm_tarball;
use crate::error::{Error, Result};
use crate::hash::{Hash, HashAlgorithm, hash_file, verify_any};
use crate::model::Origin;
use crate::store::{ArtifactStore, Component, ComponentUpload, RepositoryFormat};

/// Archive suffixes recognized on direct URLs, longest first
const KNOWN_EXTENSIONS: &[&str] = &[
    "tar.gz", "tar.bz2", "tar.xz", "tgz", "tbz2", "zip", "whl", "gem", "tar",
];

/// Deterministic store name of a mirrored dependency
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentName {
    name: String,
    kind: String,
    fingerprint: String,
    extension: String,
}

impl ComponentName {
    /// Derive the name from a dependency's identity and origin
    pub fn for_origin(name: &str, origin: &Origin, extension: &str) -> Result<Self> {
        let (kind, fingerprint) = match origin {
            Origin::Vcs { commit, .. } => ("gitcommit".to_string(), commit.clone()),
            Origin::Url { hash, .. } => (hash.algorithm.name().to_string(), hash.value.clone()),
            Origin::Registry | Origin::LocalPath { .. } => {
                return Err(Error::ValidationError(format!(
                    "The dependency {name} is a {} dependency and is not mirrored",
                    origin.kind()
                )));
            }
        };
        Ok(Self {
            name: name.to_string(),
            kind,
            fingerprint,
            extension: extension.trim_start_matches('.').to_string(),
        })
    }

    /// Directory (raw) or package name (npm)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `external-<kind>-<fingerprint>`
    pub fn tag(&self) -> String {
        format!("external-{}-{}", self.kind, self.fingerprint)
    }

    pub fn file_stem(&self) -> String {
        let basename = self.name.rsplit('/').next().unwrap_or(&self.name);
        format!("{basename}-{}", self.tag())
    }

    pub fn filename(&self) -> String {
        format!("{}.{}", self.file_stem(), self.extension)
    }

    /// Version recorded for the mirrored copy
    pub fn synthetic_version(&self, base: &str) -> String {
        format!("{base}-{}", self.tag())
    }
}

impl fmt::Display for ComponentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.filename())
    }
}

/// Archive extension of a direct URL, `tar.gz` when none is recognized
pub fn archive_extension(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let file = path.rsplit('/').next().unwrap_or(path).to_lowercase();
    KNOWN_EXTENSIONS
        .iter()
        .find(|ext| file.ends_with(&format!(".{ext}")))
        .map(|ext| ext.to_string())
        .unwrap_or_else(|| "tar.gz".to_string())
}

/// Where and how a mirrored dependency is published
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishTarget {
    /// Raw file under `{name}/`
    Raw { repository: String },
    /// npm package, repacked with a synthetic version derived from `base_version`
    Npm {
        repository: String,
        base_version: String,
    },
}

impl PublishTarget {
    pub fn repository(&self) -> &str {
        match self {
            Self::Raw { repository } | Self::Npm { repository, .. } => repository,
        }
    }

    fn digest_algorithm(&self) -> HashAlgorithm {
        match self {
            Self::Raw { .. } => HashAlgorithm::Sha256,
            Self::Npm { .. } => HashAlgorithm::Sha512,
        }
    }
}

/// One dependency to mirror
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorJob {
    pub name: String,
    pub origin: Origin,
    /// Digests the fetched content may match; any one is enough
    pub candidates: Vec<Hash>,
    pub target: PublishTarget,
}

impl MirrorJob {
    pub fn raw(name: impl Into<String>, origin: Origin, candidates: Vec<Hash>, repository: &str) -> Self {
        Self {
            name: name.into(),
            origin,
            candidates,
            target: PublishTarget::Raw {
                repository: repository.to_string(),
            },
        }
    }

    pub fn npm(
        name: impl Into<String>,
        base_version: impl Into<String>,
        origin: Origin,
        candidates: Vec<Hash>,
        repository: &str,
    ) -> Self {
        Self {
            name: name.into(),
            origin,
            candidates,
            target: PublishTarget::Npm {
                repository: repository.to_string(),
                base_version: base_version.into(),
            },
        }
    }

    pub fn component_name(&self) -> Result<ComponentName> {
        let extension = match (&self.target, &self.origin) {
            (PublishTarget::Npm { .. }, _) => "tgz".to_string(),
            (PublishTarget::Raw { .. }, Origin::Url { url, .. }) => archive_extension(url),
            (PublishTarget::Raw { .. }, _) => "tar.gz".to_string(),
        };
        ComponentName::for_origin(&self.name, &self.origin, &extension)
    }

    /// Explicit candidates plus the digest pinned in a URL origin
    fn all_candidates(&self) -> Vec<Hash> {
        let mut out = self.candidates.clone();
        if let Origin::Url { hash, .. } = &self.origin
            && !out.contains(hash)
        {
            out.push(hash.clone());
        }
        out
    }

    fn upload(&self, component: &ComponentName, path: &Path) -> ComponentUpload {
        match &self.target {
            PublishTarget::Raw { repository } => ComponentUpload {
                repository: repository.clone(),
                format: RepositoryFormat::Raw,
                name: component.name().to_string(),
                version: None,
                filename: component.filename(),
                path: path.to_path_buf(),
            },
            PublishTarget::Npm {
                repository,
                base_version,
            } => ComponentUpload {
                repository: repository.clone(),
                format: RepositoryFormat::Npm,
                name: self.name.clone(),
                version: Some(component.synthetic_version(base_version)),
                filename: component.filename(),
                path: path.to_path_buf(),
            },
        }
    }
}

/// Outcome of mirroring one dependency
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirroredArtifact {
    pub component: ComponentName,
    /// Where the build downloads the published copy
    pub url: String,
    /// Synthetic version (npm only)
    pub version: Option<String>,
    /// Digest of the published bytes: sha256 for raw, sha512 for npm
    pub digest: Hash,
    /// Whether the origin was contacted
    pub fetched: bool,
}

impl MirroredArtifact {
    /// Subresource Integrity value of the published bytes
    pub fn integrity(&self) -> String {
        self.digest.to_integrity()
    }
}

/// Results keyed by component name (`ComponentName` display form)
pub type MirrorResults = BTreeMap<String, MirroredArtifact>;

/// Looks up, fetches, verifies and publishes non-registry dependencies
pub struct ContentMirror {
    store: Arc<dyn ArtifactStore>,
    fetcher: Arc<dyn OriginFetcher>,
    pool: rayon::ThreadPool,
}

impl ContentMirror {
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        fetcher: Arc<dyn OriginFetcher>,
        concurrency: usize,
    ) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(concurrency.max(1))
            .thread_name(|i| format!("mirror-{i}"))
            .build()
            .map_err(|e| Error::IoError(format!("Failed to start mirror pool: {e}")))?;
        Ok(Self {
            store,
            fetcher,
            pool,
        })
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    /// Mirror one dependency, skipping the fetch when the store already has it
    pub fn mirror_one(&self, job: &MirrorJob) -> Result<MirroredArtifact> {
        let component = job.component_name()?;
        let version = match &job.target {
            PublishTarget::Npm { base_version, .. } => Some(component.synthetic_version(base_version)),
            PublishTarget::Raw { .. } => None,
        };
        let algorithm = job.target.digest_algorithm();
        let scratch = tempfile::tempdir()?;
        let publish_path = scratch.path().join(component.filename());
        let upload = job.upload(&component, &publish_path);

        if let Some(found) = self.store.find_component(&upload.query())? {
            debug!("{} is already in {}", component, job.target.repository());
            let digest = self.stored_digest(&found, algorithm, scratch.path())?;
            return Ok(MirroredArtifact {
                component,
                url: found.download_url,
                version,
                digest,
                fetched: false,
            });
        }

        info!("Fetching {} from its origin", job.name);
        let fetched = scratch.path().join("origin");
        self.fetcher.fetch(&job.name, &job.origin, &fetched)?;
        verify_any(&fetched, &job.name, &job.all_candidates())?;

        match &version {
            Some(v) => repack_npm_tarball(&fetched, &publish_path, v)?,
            None => std::fs::rename(&fetched, &publish_path)?,
        }
        let digest = hash_file(algorithm, &publish_path)?;

        match self.store.upload_component(&upload) {
            Ok(()) => info!("Published {} to {}", component, job.target.repository()),
            Err(Error::AlreadyExists(_)) => {
                debug!("{} was published concurrently", component);
            }
            Err(e) => return Err(e),
        }

        Ok(MirroredArtifact {
            url: format!(
                "{}{}",
                self.store.repository_url(job.target.repository()),
                upload.asset_path()
            ),
            component,
            version,
            digest,
            fetched: true,
        })
    }

    /// Mirror a batch on the bounded pool; the first failure fails the batch
    pub fn mirror_all(&self, jobs: &[MirrorJob]) -> Result<MirrorResults> {
        let mut unique: BTreeMap<String, &MirrorJob> = BTreeMap::new();
        for job in jobs {
            unique.entry(job.component_name()?.to_string()).or_insert(job);
        }
        if unique.is_empty() {
            return Ok(MirrorResults::new());
        }

        info!("Mirroring {} dependencies", unique.len());
        let results: Vec<(String, MirroredArtifact)> = self.pool.install(|| {
            unique
                .par_iter()
                .map(|(key, job)| self.mirror_one(job).map(|a| (key.clone(), a)))
                .collect::<Result<Vec<_>>>()
        })?;
        Ok(results.into_iter().collect())
    }

    fn stored_digest(&self, found: &Component, algorithm: HashAlgorithm, scratch: &Path) -> Result<Hash> {
        if algorithm == HashAlgorithm::Sha256
            && let Some(hex) = &found.sha256
        {
            return Ok(Hash::new(algorithm, hex.as_str())?);
        }
        let copy = scratch.join("stored");
        self.store.download_asset(&found.download_url, &copy)?;
        hash_file(algorithm, &copy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::create_tar_gz;
    use crate::hash::hash_bytes;
    use crate::store::{ComponentQuery, Grant, MemoryStore, RepositoryKind, RepositorySpec};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct FakeFetcher {
        content: HashMap<String, Vec<u8>>,
        calls: AtomicUsize,
    }

    impl FakeFetcher {
        fn new(entries: &[(&str, Vec<u8>)]) -> Self {
            Self {
                content: entries
                    .iter()
                    .map(|(n, c)| (n.to_string(), c.clone()))
                    .collect(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl OriginFetcher for FakeFetcher {
        fn fetch(&self, name: &str, _origin: &Origin, dest: &Path) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let content = self
                .content
                .get(name)
                .ok_or_else(|| Error::DownloadError(format!("no content for {name}")))?;
            std::fs::write(dest, content)?;
            Ok(())
        }
    }

    fn store_with(repos: &[(&str, RepositoryFormat)]) -> Arc<MemoryStore> {
        let store = MemoryStore::default();
        for (name, format) in repos {
            store
                .create_repository(&RepositorySpec {
                    name: name.to_string(),
                    format: *format,
                    kind: RepositoryKind::Hosted,
                })
                .unwrap();
        }
        Arc::new(store)
    }

    fn url_job(content: &[u8]) -> MirrorJob {
        let hash = hash_bytes(HashAlgorithm::Sha256, content);
        MirrorJob::raw(
            "bar",
            Origin::Url {
                url: "https://example.org/bar.tar.gz".into(),
                hash,
            },
            vec![],
            "raw-hosted",
        )
    }

    #[test]
    fn test_component_names() {
        let commit = "0123456789abcdef0123456789abcdef01234567";
        let vcs = Origin::Vcs {
            url: "https://github.com/a/lib.git".into(),
            commit: commit.into(),
        };
        let name = ComponentName::for_origin("@scope/lib", &vcs, "tgz").unwrap();
        assert_eq!(
            name.to_string(),
            format!("@scope/lib/lib-external-gitcommit-{commit}.tgz")
        );
        assert_eq!(
            name.synthetic_version("1.0.0"),
            format!("1.0.0-external-gitcommit-{commit}")
        );
        assert!(ComponentName::for_origin("x", &Origin::Registry, "tgz").is_err());
    }

    #[test]
    fn test_archive_extension() {
        assert_eq!(archive_extension("https://e.org/a/bar-1.0.tar.gz"), "tar.gz");
        assert_eq!(archive_extension("https://e.org/bar.zip?x=1"), "zip");
        assert_eq!(archive_extension("https://e.org/bar-1.0-py3-none-any.whl"), "whl");
        assert_eq!(archive_extension("https://e.org/download"), "tar.gz");
    }

    #[test]
    fn test_second_resolution_skips_fetch() {
        let store = store_with(&[("raw-hosted", RepositoryFormat::Raw)]);
        let fetcher = Arc::new(FakeFetcher::new(&[("bar", b"bar-content".to_vec())]));
        let mirror = ContentMirror::new(store.clone(), fetcher.clone(), 2).unwrap();
        let job = url_job(b"bar-content");

        let first = mirror.mirror_one(&job).unwrap();
        assert!(first.fetched);
        let second = mirror.mirror_one(&job).unwrap();
        assert!(!second.fetched);

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.upload_count(), 1);
        assert_eq!(first.url, second.url);
        assert_eq!(first.digest, second.digest);
        assert_eq!(first.digest, hash_bytes(HashAlgorithm::Sha256, b"bar-content"));
    }

    #[test]
    fn test_checksum_mismatch_publishes_nothing() {
        let store = store_with(&[("raw-hosted", RepositoryFormat::Raw)]);
        let fetcher = Arc::new(FakeFetcher::new(&[("bar", b"tampered".to_vec())]));
        let mirror = ContentMirror::new(store.clone(), fetcher, 1).unwrap();

        let err = mirror.mirror_one(&url_job(b"bar-content")).unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
        assert_eq!(store.upload_count(), 0);
    }

    #[test]
    fn test_any_candidate_matches() {
        let store = store_with(&[("raw-hosted", RepositoryFormat::Raw)]);
        let fetcher = Arc::new(FakeFetcher::new(&[("lib", b"lib".to_vec())]));
        let mirror = ContentMirror::new(store, fetcher, 1).unwrap();

        let job = MirrorJob::raw(
            "lib",
            Origin::Vcs {
                url: "https://github.com/a/lib.git".into(),
                commit: "a".repeat(40),
            },
            vec![
                hash_bytes(HashAlgorithm::Sha256, b"something else"),
                hash_bytes(HashAlgorithm::Sha512, b"lib"),
            ],
            "raw-hosted",
        );
        assert!(mirror.mirror_one(&job).is_ok());
    }

    /// Never finds anything, so every mirror attempt races to publish
    struct RacingStore(MemoryStore);

    impl ArtifactStore for RacingStore {
        fn base_url(&self) -> &str {
            self.0.base_url()
        }
        fn create_repository(&self, spec: &RepositorySpec) -> Result<()> {
            self.0.create_repository(spec)
        }
        fn delete_repository(&self, name: &str) -> Result<()> {
            self.0.delete_repository(name)
        }
        fn create_credential(&self, u: &str, p: &str, g: &[Grant]) -> Result<()> {
            self.0.create_credential(u, p, g)
        }
        fn delete_credential(&self, u: &str) -> Result<()> {
            self.0.delete_credential(u)
        }
        fn find_component(&self, _query: &ComponentQuery) -> Result<Option<Component>> {
            Ok(None)
        }
        fn upload_component(&self, upload: &ComponentUpload) -> Result<()> {
            self.0.upload_component(upload)
        }
        fn download_asset(&self, url: &str, dest: &Path) -> Result<()> {
            self.0.download_asset(url, dest)
        }
        fn execute_script(&self, name: &str, payload: &serde_json::Value) -> Result<()> {
            self.0.execute_script(name, payload)
        }
    }

    #[test]
    fn test_conflicting_publish_is_success() {
        let inner = MemoryStore::default();
        inner
            .create_repository(&RepositorySpec {
                name: "raw-hosted".into(),
                format: RepositoryFormat::Raw,
                kind: RepositoryKind::Hosted,
            })
            .unwrap();
        let store = Arc::new(RacingStore(inner));
        let fetcher = Arc::new(FakeFetcher::new(&[("bar", b"bar-content".to_vec())]));
        let mirror = ContentMirror::new(store.clone(), fetcher, 1).unwrap();

        let job = url_job(b"bar-content");
        let first = mirror.mirror_one(&job).unwrap();
        let second = mirror.mirror_one(&job).unwrap();
        assert_eq!(first.url, second.url);
        assert_eq!(store.0.upload_count(), 1);
    }

    #[test]
    fn test_mirror_all_dedupes() {
        let store = store_with(&[("raw-hosted", RepositoryFormat::Raw)]);
        let fetcher = Arc::new(FakeFetcher::new(&[("bar", b"bar-content".to_vec())]));
        let mirror = ContentMirror::new(store.clone(), fetcher.clone(), 4).unwrap();

        let job = url_job(b"bar-content");
        let results = mirror.mirror_all(&[job.clone(), job.clone()]).unwrap();
        assert_eq!(results.len(), 1);
        assert!(results.contains_key(&job.component_name().unwrap().to_string()));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_npm_repack_sets_synthetic_version() {
        let dir = tempdir().unwrap();
        let pkg = dir.path().join("pkg");
        std::fs::create_dir_all(&pkg).unwrap();
        std::fs::write(pkg.join("package.json"), r#"{"name":"lib","version":"0.0.1"}"#).unwrap();
        let tarball = dir.path().join("lib.tgz");
        create_tar_gz(&pkg, "package", &tarball).unwrap();

        let store = store_with(&[("npm-hosted", RepositoryFormat::Npm)]);
        let fetcher = Arc::new(FakeFetcher::new(&[("lib", std::fs::read(&tarball).unwrap())]));
        let mirror = ContentMirror::new(store.clone(), fetcher, 1).unwrap();

        let commit = "b".repeat(40);
        let job = MirrorJob::npm(
            "lib",
            "0.0.1",
            Origin::Vcs {
                url: "https://github.com/a/lib.git".into(),
                commit: commit.clone(),
            },
            vec![],
            "npm-hosted",
        );
        let artifact = mirror.mirror_one(&job).unwrap();
        let version = format!("0.0.1-external-gitcommit-{commit}");
        assert_eq!(artifact.version.as_deref(), Some(version.as_str()));
        assert_eq!(
            artifact.url,
            format!("http://store.invalid/repository/npm-hosted/lib/-/lib-{version}.tgz")
        );
        assert!(artifact.integrity().starts_with("sha512-"));

        let published = dir.path().join("published.tgz");
        std::fs::write(&published, store.content(&artifact.url).unwrap()).unwrap();
        let unpacked = dir.path().join("unpacked");
        crate::archive::extract_tar_gz(&published, &unpacked).unwrap();
        let manifest: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(unpacked.join("package.json")).unwrap())
                .unwrap();
        assert_eq!(manifest["version"], version.as_str());
    }
}
