// src/pipeline/mod.rs

//! Request pipeline
//!
//! A request runs as a chain of [`Step`]s: fetch the source, one resolve
//! stage per requested package manager, assemble the bundle, mark it
//! complete. [`Engine`] does the work of each step; the [`worker`] module
//! pulls steps off the durable queue, guards them against requests that are
//! no longer in progress, and records failures.
//!
//! A resolve stage for one manager:
//!
//! 1. provision the manager's staging repositories
//! 2. resolve every requested package directory in order
//! 3. mirror the non-registry dependencies and rewrite the lockfiles
//! 4. stage the registry dependencies through the group into `deps/<pm>/`,
//!    verifying each against its declared digests
//! 5. persist the manager's bill of materials
//! 6. finalize the staging repositories and emit the runtime config

pub mod queue;
pub mod step;
pub mod worker;

pub use step::Step;
pub use worker::{Dispatcher, TaskOutcome, Worker, WorkerPool};

use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::archive::bundle_paths;
use crate::bom::BillOfMaterials;
use crate::config::EngineConfig;
use crate::drivers::{DriverContext, StagedPackage, StoreAccess, driver_for};
use crate::emit::{ConfigFile, RuntimeConfig};
use crate::error::{Error, Result};
use crate::lifecycle::{RepositoryLifecycle, StagingRepository};
use crate::mirror::{ContentMirror, NetworkFetcher, OriginFetcher};
use crate::model::{PackageManager, RequestContext};
use crate::process::CommandRunner;
use crate::scm::Git;
use crate::store::ArtifactStore;

/// Counts reported by one resolve stage
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageReport {
    pub packages: usize,
    pub dependencies: usize,
    pub mirrored: usize,
    /// Mirrored dependencies that had to be fetched from their origin
    pub fetched: usize,
    /// Registry dependencies downloaded through the staging group
    pub staged: usize,
}

/// Everything the steps share: configuration, store, mirror and tools
pub struct Engine {
    config: Arc<EngineConfig>,
    lifecycle: RepositoryLifecycle,
    mirror: ContentMirror,
    runner: CommandRunner,
    git: Git,
}

impl Engine {
    pub fn new(
        config: Arc<EngineConfig>,
        store: Arc<dyn ArtifactStore>,
        fetcher: Arc<dyn OriginFetcher>,
    ) -> Result<Self> {
        let runner = CommandRunner::new().with_timeout(config.subprocess_timeout()?);
        let git = Git::new(runner.clone(), config.retry_policy()?);
        let mirror = ContentMirror::new(store.clone(), fetcher, config.worker.mirror_concurrency)?;
        let lifecycle = RepositoryLifecycle::new(store, &config);
        Ok(Self {
            config,
            lifecycle,
            mirror,
            runner,
            git,
        })
    }

    /// Engine fetching origins over the network
    pub fn networked(config: Arc<EngineConfig>, store: Arc<dyn ArtifactStore>) -> Result<Self> {
        let runner = CommandRunner::new().with_timeout(config.subprocess_timeout()?);
        let git = Git::new(runner, config.retry_policy()?);
        let fetcher = NetworkFetcher::new(git, config.store_timeout()?, config.retry_policy()?)?;
        Self::new(config, store, Arc::new(fetcher))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> &RepositoryLifecycle {
        &self.lifecycle
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        self.lifecycle.store()
    }

    /// Run the work of one step; `complete` has none
    pub fn run_step(&self, request: &RequestContext, step: &Step) -> Result<()> {
        match step {
            Step::FetchSource => self.fetch_source(request),
            Step::Resolve { manager } => self.resolve(request, *manager).map(|report| {
                info!(
                    "Resolved {} {} packages with {} dependencies ({} mirrored, {} fetched, {} staged)",
                    report.packages,
                    manager,
                    report.dependencies,
                    report.mirrored,
                    report.fetched,
                    report.staged
                );
            }),
            Step::Assemble => self.assemble(request),
            Step::Complete => Ok(()),
        }
    }

    /// Check out the requested commit into the bundle's `app/` directory
    pub fn fetch_source(&self, request: &RequestContext) -> Result<()> {
        let source_root = request.bundle.source_root();
        if source_root.exists() {
            debug!("Removing an earlier checkout at {}", source_root.display());
            std::fs::remove_dir_all(&source_root)?;
        }
        self.git
            .clone_at(&request.repo, &request.git_ref, &source_root)?;
        if request
            .package_managers
            .contains(&PackageManager::GitSubmodule)
        {
            self.git.init_submodules(&source_root)?;
        }
        Ok(())
    }

    /// Resolve, mirror and configure every package of one manager
    pub fn resolve(&self, request: &RequestContext, manager: PackageManager) -> Result<StageReport> {
        let driver = driver_for(manager);
        let staging = self.lifecycle.provision(request.id, manager)?;
        if staging.is_some() {
            self.lifecycle.ensure_cache_repositories()?;
        }

        let ctx = DriverContext {
            request,
            config: &self.config,
            runner: &self.runner,
            git: &self.git,
            store: self.store().as_ref(),
            cache_repository: self.lifecycle.cache_repository(manager),
        };
        let source_root = request.bundle.source_root();
        let mut bom = BillOfMaterials::new();
        let mut rewritten = RuntimeConfig::new();
        let mut staged = Vec::new();
        let mut report = StageReport::default();

        for subpath in request.package_paths(manager) {
            info!(
                "Resolving the {} package at {} for request {}",
                manager,
                subpath.display(),
                request.id
            );
            let resolution = driver.resolve(&ctx, &subpath)?;
            let mirrored = self.mirror.mirror_all(&resolution.jobs)?;
            if let Some(staging) = &staging {
                let staged = self.mirror.stage_registry(
                    staging,
                    &request.bundle.deps_dir_for(manager),
                    &resolution.registry,
                )?;
                report.staged += staged.len();
            }

            for file in driver.apply_mirror(&ctx, &resolution, &mirrored)? {
                let target = source_root.join(&file.path);
                std::fs::write(&target, &file.content).map_err(|e| {
                    Error::IoError(format!("Failed to write {}: {e}", target.display()))
                })?;
                rewritten.add_file(ConfigFile::from_bytes(
                    &Path::new("app").join(&file.path),
                    &file.content,
                ));
            }

            for package in &resolution.packages {
                report.dependencies += package.dependencies.len();
                bom.add_record(package)?;
            }
            report.packages += resolution.packages.len();
            report.mirrored += mirrored.len();
            report.fetched += mirrored.values().filter(|a| a.fetched).count();
            staged.push(StagedPackage {
                resolution,
                mirrored,
            });
        }

        bom.write_to_file(&request.bundle.bom_file(manager))?;

        let access = match &staging {
            Some(staging) => Some(self.finalize(staging)?),
            None => None,
        };
        // driver output merged last so credentialed copies replace the in-tree rewrites
        let mut config = rewritten;
        config.merge(driver.runtime_config(&ctx, &staged, access.as_ref())?);
        let config = config.with_defaults(&self.config.default_env(manager.as_str()));
        config.write_to_file(&request.bundle.config_file(manager))?;

        Ok(report)
    }

    fn finalize(&self, staging: &StagingRepository) -> Result<StoreAccess> {
        let credentials = self.lifecycle.finalize(staging)?;
        let ca_cert = match &self.config.store.ca_cert {
            Some(path) => Some(std::fs::read_to_string(path).map_err(|e| {
                Error::ConfigError(format!("Failed to read CA bundle {}: {e}", path.display()))
            })?),
            None => None,
        };
        Ok(StoreAccess {
            group_url: self.store().repository_url(staging.group_name()),
            credentials,
            ca_cert,
        })
    }

    /// Merge the per-manager outputs and write the bundle archive
    pub fn assemble(&self, request: &RequestContext) -> Result<()> {
        let bundle = &request.bundle;
        let mut bom = BillOfMaterials::new();
        let mut config = RuntimeConfig::new();
        for manager in &request.package_managers {
            bom.merge(BillOfMaterials::load(&bundle.bom_file(*manager))?)?;
            config.merge(RuntimeConfig::load(&bundle.config_file(*manager))?);
        }
        bom.write_to_file(&bundle.merged_bom_file())?;
        config.write_to_file(&bundle.merged_config_file())?;

        let source_root = bundle.source_root();
        let deps_dir = bundle.deps_dir();
        std::fs::create_dir_all(&deps_dir)?;
        let merged_bom = bundle.merged_bom_file();
        let merged_config = bundle.merged_config_file();
        bundle_paths(
            &bundle.archive_file(),
            &[
                ("app", source_root.as_path()),
                ("deps", deps_dir.as_path()),
                ("packages.json", merged_bom.as_path()),
                ("config.json", merged_config.as_path()),
            ],
        )?;
        info!(
            "Assembled {} for request {} ({} packages)",
            bundle.archive_file().display(),
            request.id,
            bom.packages().len()
        );
        Ok(())
    }

    /// Tear down every staging repository of a request; never fails
    pub fn release(&self, request: &RequestContext) {
        self.lifecycle
            .teardown_all(request.id, &request.package_managers);
    }

    /// Remove a request's bundle directory and archive; never fails
    pub fn remove_bundle(&self, request: &RequestContext) {
        let root = request.bundle.root();
        if root.exists()
            && let Err(e) = std::fs::remove_dir_all(&root)
        {
            warn!("Failed to remove {}: {}", root.display(), e);
        }
        let archive = request.bundle.archive_file();
        if archive.exists()
            && let Err(e) = std::fs::remove_file(&archive)
        {
            warn!("Failed to remove {}: {}", archive.display(), e);
        }
    }
}
