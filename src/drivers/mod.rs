// src/drivers/mod.rs

//! Lockfile drivers
//!
//! One driver per package manager turns a package directory into normalized
//! [`PackageRecord`]s plus the [`MirrorJob`]s for its non-registry
//! dependencies and the [`RegistryArtifact`]s staged through the request's
//! group repository. Dispatch is by the manager named on the request; drivers
//! never sniff file contents to decide what they are looking at.
//!
//! A stage drives each package directory through three calls:
//!
//! 1. [`LockfileDriver::resolve`] parses and classifies
//! 2. the content mirror publishes the jobs and stages the registry artifacts
//! 3. [`LockfileDriver::apply_mirror`] points the lockfiles at the mirror
//!
//! and once per stage [`LockfileDriver::runtime_config`] renders what the
//! offline build needs.

mod git_submodule;
mod gomod;
mod js;
mod npm;
mod pip;
mod rubygems;
mod yarn;

pub use git_submodule::GitSubmoduleDriver;
pub use gomod::{GomodDriver, pseudo_version};
pub use npm::NpmDriver;
pub use pip::PipDriver;
pub use pip::metadata::{canonicalize_name, evaluate_setup_py, read_setup_cfg};
pub use pip::requirements::{Requirement, RequirementKind, RequirementsFile};
pub use rubygems::{GemfileLock, RubygemsDriver};
pub use yarn::{YarnDriver, YarnLock};

use std::path::{Path, PathBuf};

use crate::config::EngineConfig;
use crate::emit::RuntimeConfig;
use crate::error::{Error, Result};
use crate::lifecycle::Credentials;
use crate::mirror::{MirrorJob, MirrorResults, MirroredArtifact, RegistryArtifact};
use crate::model::{PackageManager, PackageRecord, RequestContext};
use crate::process::CommandRunner;
use crate::scm::Git;
use crate::store::ArtifactStore;

/// Everything a driver may touch while resolving one request
pub struct DriverContext<'a> {
    pub request: &'a RequestContext,
    pub config: &'a EngineConfig,
    pub runner: &'a CommandRunner,
    pub git: &'a Git,
    pub store: &'a dyn ArtifactStore,
    /// Shared cache mirrored dependencies are published to
    pub cache_repository: Option<&'a str>,
}

impl DriverContext<'_> {
    pub fn source_root(&self) -> PathBuf {
        self.request.bundle.source_root()
    }

    /// Absolute package directory for a requested subpath
    pub fn package_dir(&self, subpath: &Path) -> Result<PathBuf> {
        self.request.bundle.package_dir(subpath)
    }

    pub fn cache_repository(&self) -> Result<&str> {
        self.cache_repository.ok_or_else(|| {
            Error::ConfigError("No cache repository is configured for this package manager".into())
        })
    }
}

/// Output of resolving one package directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Package directory relative to the source root
    pub subpath: PathBuf,
    pub packages: Vec<PackageRecord>,
    pub jobs: Vec<MirrorJob>,
    /// Registry dependencies to download through the staging group
    pub registry: Vec<RegistryArtifact>,
}

impl Resolution {
    pub fn new(subpath: &Path) -> Self {
        Self {
            subpath: subpath.to_path_buf(),
            packages: Vec::new(),
            jobs: Vec::new(),
            registry: Vec::new(),
        }
    }
}

/// A file changed to point at the mirror, relative to the source root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewrittenFile {
    pub path: PathBuf,
    pub content: Vec<u8>,
}

impl RewrittenFile {
    pub fn json(path: PathBuf, value: &serde_json::Value) -> Result<Self> {
        let mut content = serde_json::to_vec_pretty(value)?;
        content.push(b'\n');
        Ok(Self { path, content })
    }
}

/// A resolved package directory together with its mirrored dependencies
#[derive(Debug, Clone)]
pub struct StagedPackage {
    pub resolution: Resolution,
    pub mirrored: MirrorResults,
}

/// How the build reaches the request's staging repositories
#[derive(Debug, Clone)]
pub struct StoreAccess {
    /// Group repository URL, ending in `/`
    pub group_url: String,
    pub credentials: Credentials,
    /// PEM content of the store's CA bundle
    pub ca_cert: Option<String>,
}

/// One package manager's view of a package directory
pub trait LockfileDriver: Send + Sync {
    fn manager(&self) -> PackageManager;

    /// Parse the manifest and lockfile at `subpath` and classify every dependency
    fn resolve(&self, ctx: &DriverContext<'_>, subpath: &Path) -> Result<Resolution>;

    /// Point the package's lockfiles at the mirrored copies
    fn apply_mirror(
        &self,
        _ctx: &DriverContext<'_>,
        _resolution: &Resolution,
        _mirrored: &MirrorResults,
    ) -> Result<Vec<RewrittenFile>> {
        Ok(Vec::new())
    }

    /// Configuration the build needs to use what this stage staged
    fn runtime_config(
        &self,
        ctx: &DriverContext<'_>,
        staged: &[StagedPackage],
        access: Option<&StoreAccess>,
    ) -> Result<RuntimeConfig>;
}

/// The driver for a package manager
pub fn driver_for(manager: PackageManager) -> Box<dyn LockfileDriver> {
    match manager {
        PackageManager::Gomod => Box::new(GomodDriver),
        PackageManager::Npm => Box::new(NpmDriver),
        PackageManager::Yarn => Box::new(YarnDriver),
        PackageManager::Pip => Box::new(PipDriver),
        PackageManager::Rubygems => Box::new(RubygemsDriver),
        PackageManager::GitSubmodule => Box::new(GitSubmoduleDriver),
    }
}

/// The mirrored copy produced for `job`
pub(crate) fn mirrored_for<'m>(
    mirrored: &'m MirrorResults,
    job: &MirrorJob,
) -> Result<&'m MirroredArtifact> {
    let key = job.component_name()?.to_string();
    mirrored.get(&key).ok_or_else(|| {
        Error::NotFoundError(format!("No mirrored copy of {} ({key})", job.name))
    })
}

/// Store access or an error naming the manager that needed it
pub(crate) fn require_access<'a>(
    access: Option<&'a StoreAccess>,
    manager: PackageManager,
) -> Result<&'a StoreAccess> {
    access.ok_or_else(|| {
        Error::ConfigError(format!("The {manager} stage has no staging repository"))
    })
}

/// Read and parse a JSON file, naming it in the error
pub(crate) fn read_json(path: &Path) -> Result<serde_json::Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::ValidationError(format!("Failed to read {}: {e}", path.display()))
    })?;
    serde_json::from_str(&content)
        .map_err(|e| Error::ValidationError(format!("{} is not valid JSON: {e}", path.display())))
}

/// Subpaths of every staged package, in stage order
pub(crate) fn staged_subpaths(staged: &[StagedPackage]) -> Vec<&Path> {
    staged.iter().map(|s| s.resolution.subpath.as_path()).collect()
}
