// src/drivers/pip/mod.rs

//! pip driver: `setup.py`/`setup.cfg` plus `requirements.txt` and
//! `requirements-build.txt`
//!
//! Index requirements are staged through the request's group repository
//! and checked against their `--hash` values. VCS and URL
//! requirements are mirrored as raw archives and their lines rewritten to
//! the mirrored copy; the copies written into the bundle carry the staging
//! credential, the in-tree files do not.

pub mod metadata;
pub mod requirements;

use std::path::Path;
use tracing::{debug, info};

use self::metadata::package_metadata;
use self::requirements::{Requirement, RequirementKind, RequirementsFile};
use super::{
    DriverContext, LockfileDriver, Resolution, RewrittenFile, StagedPackage, StoreAccess,
    mirrored_for, require_access,
};
use crate::classify::{classify_url, classify_vcs};
use crate::emit::{ConfigFile, RuntimeConfig, pip_config, url_with_credentials};
use crate::error::Result;
use crate::mirror::{MirrorJob, MirrorResults, RegistryArtifact, RegistryLayout};
use crate::model::{DependencyRecord, Origin, PackageManager, PackageRecord, PackageType};
use crate::paths::normalize_relative;

/// Requirement files read from a package directory, and whether they hold dev dependencies
const REQUIREMENT_FILES: &[(&str, bool)] = &[
    ("requirements.txt", false),
    ("requirements-build.txt", true),
];

/// Origin of a requirement
fn requirement_origin(req: &Requirement) -> Result<Origin> {
    let name = req.canonical_name();
    match req.kind {
        RequirementKind::Pypi => Ok(Origin::Registry),
        RequirementKind::Vcs => {
            let (url, commit) = req.vcs_source()?;
            classify_vcs(&name, &url, &commit)
        }
        RequirementKind::Url => {
            let url = req.full_url().unwrap_or_default();
            classify_url(&name, &url, &req.hash_values()?)
        }
    }
}

/// Requirement files present in a package directory
fn present_files(package_dir: &Path) -> Result<Vec<(&'static str, bool, RequirementsFile)>> {
    let mut files = Vec::new();
    for (file, dev) in REQUIREMENT_FILES {
        let path = package_dir.join(file);
        if path.is_file() {
            files.push((*file, *dev, RequirementsFile::load(&path)?));
        }
    }
    Ok(files)
}

pub struct PipDriver;

impl LockfileDriver for PipDriver {
    fn manager(&self) -> PackageManager {
        PackageManager::Pip
    }

    fn resolve(&self, ctx: &DriverContext<'_>, subpath: &Path) -> Result<Resolution> {
        let subpath = normalize_relative(subpath)?;
        let package_dir = ctx.package_dir(&subpath)?;
        let (name, version) = package_metadata(&package_dir)?;
        let repository = ctx.cache_repository()?;

        let mut resolution = Resolution::new(&subpath);
        let mut package = PackageRecord::new(PackageType::Pip, name, version, subpath.clone());

        for (file, dev, requirements) in present_files(&package_dir)? {
            let require_hashes = requirements.validate()?;
            info!(
                "Resolving {} requirements from {}{}",
                requirements.requirements.len(),
                file,
                if require_hashes { " (hashes required)" } else { "" }
            );

            for req in &requirements.requirements {
                let name = req.canonical_name();
                let origin = requirement_origin(req)?;
                let (version, hashes) = match &origin {
                    Origin::Url { hash, .. } => (String::new(), vec![hash.clone()]),
                    Origin::Vcs { .. } => (String::new(), Vec::new()),
                    _ => (
                        req.pinned_version().unwrap_or_default().to_string(),
                        req.hash_values()?,
                    ),
                };
                if origin.needs_mirror() {
                    resolution
                        .jobs
                        .push(MirrorJob::raw(&name, origin.clone(), Vec::new(), repository));
                }
                if origin == Origin::Registry {
                    resolution.registry.push(RegistryArtifact::new(
                        RegistryLayout::Pypi,
                        &name,
                        &version,
                        hashes.clone(),
                    ));
                }
                debug!("{} is a {} requirement", name, origin.kind());
                package.dependencies.push(
                    DependencyRecord::new(PackageType::Pip, name, version, origin)
                        .with_dev(dev)
                        .with_hashes(hashes),
                );
            }
        }

        resolution.packages.push(package);
        Ok(resolution)
    }

    fn apply_mirror(
        &self,
        ctx: &DriverContext<'_>,
        resolution: &Resolution,
        mirrored: &MirrorResults,
    ) -> Result<Vec<RewrittenFile>> {
        if resolution.jobs.is_empty() {
            return Ok(Vec::new());
        }
        let package_dir = ctx.package_dir(&resolution.subpath)?;
        let repository = ctx.cache_repository()?;

        let mut rewritten = Vec::new();
        for (file, _, mut requirements) in present_files(&package_dir)? {
            let require_hashes = requirements.validate()?;
            let mut changed = false;

            for req in requirements.requirements.iter_mut() {
                let origin = requirement_origin(req)?;
                if !origin.needs_mirror() {
                    continue;
                }
                let job = MirrorJob::raw(req.canonical_name(), origin, Vec::new(), repository);
                let artifact = mirrored_for(mirrored, &job)?;
                let published = artifact.digest.to_prefixed_string();

                let mut hashes = match req.kind {
                    RequirementKind::Url => req.hashes.clone(),
                    _ => Vec::new(),
                };
                if require_hashes && !hashes.iter().any(|h| h.eq_ignore_ascii_case(&published)) {
                    hashes.push(published.clone());
                }
                *req = req.with_url(&artifact.url, &format!("hash={published}"), hashes);
                changed = true;
            }

            if changed {
                debug!("Rewrote {} in {}", file, package_dir.display());
                rewritten.push(RewrittenFile {
                    path: resolution.subpath.join(file),
                    content: requirements.to_string().into_bytes(),
                });
            }
        }
        Ok(rewritten)
    }

    fn runtime_config(
        &self,
        ctx: &DriverContext<'_>,
        staged: &[StagedPackage],
        access: Option<&StoreAccess>,
    ) -> Result<RuntimeConfig> {
        let access = require_access(access, self.manager())?;
        let username = &access.credentials.username;
        let password = &access.credentials.password;
        let index_url = url_with_credentials(
            &format!("{}simple/", access.group_url),
            username,
            password,
        )?;
        let mut config = pip_config(&index_url, access.ca_cert.as_deref());

        // the bundled requirement files download mirrored archives with the staging credential
        for package in staged {
            let mirrored_urls: Vec<&str> = package
                .mirrored
                .values()
                .map(|a| a.url.as_str())
                .collect();
            if mirrored_urls.is_empty() {
                continue;
            }
            let package_dir = ctx.package_dir(&package.resolution.subpath)?;
            for (file, _, mut requirements) in present_files(&package_dir)? {
                let mut changed = false;
                for req in requirements.requirements.iter_mut() {
                    if let Some(url) = &req.url
                        && mirrored_urls.contains(&url.as_str())
                    {
                        req.url = Some(url_with_credentials(url, username, password)?);
                        changed = true;
                    }
                }
                if changed {
                    let path = Path::new("app").join(&package.resolution.subpath).join(file);
                    config.add_file(ConfigFile::from_text(&path, &requirements.to_string()));
                }
            }
        }
        Ok(config)
    }
}
