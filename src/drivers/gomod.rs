// src/drivers/gomod.rs

//! Go modules driver
//!
//! The `go` tool does the resolving: requested replacements are applied with
//! `go mod edit`, modules are downloaded straight into the bundle's module
//! cache (or vendored), and the graph is read back from `go list`. Nothing is
//! published to the store; the build runs with `GOPROXY=off` against the
//! bundled cache.
//!
//! The main module's version comes from the source checkout: a semver tag on
//! the requested commit, or a Go pseudo-version derived from the closest
//! reachable tag.

use chrono::{DateTime, Utc};
use regex::Regex;
use semver::{BuildMetadata, Version};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, info, warn};

use super::{DriverContext, LockfileDriver, Resolution, StagedPackage, StoreAccess};
use crate::classify::classify_local;
use crate::emit::{RuntimeConfig, gomod_config};
use crate::error::{Error, Result};
use crate::model::{
    DependencyRecord, Flag, Origin, PackageManager, PackageRecord, PackageType,
};
use crate::paths::normalize_relative;
use crate::process::CommandRunner;
use crate::retry::RetryPolicy;
use crate::scm::Git;

static MODULE_MAJOR_VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^.+/v(\d+)$").expect("valid regex"));

const LIST_MODULES_FORMAT: &str = "{{.Path}} {{.Version}} {{.Replace}}";
const LIST_DEPS_FORMAT: &str = "{{if not .Standard}}{{.ImportPath}} {{.Module}}{{end}}";

/// Whether `package` is `parent` or lives below it
pub fn contains_package(parent: &str, package: &str) -> bool {
    match package.strip_prefix(parent) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Path from `parent` to a package inside it, empty for the parent itself
pub fn path_to_subpackage<'a>(parent: &str, package: &'a str) -> Option<&'a str> {
    contains_package(parent, package).then(|| package[parent.len()..].trim_start_matches('/'))
}

/// The longest module name containing `package`
pub fn match_parent_module<'a>(package: &str, modules: &[&'a str]) -> Option<&'a str> {
    modules
        .iter()
        .copied()
        .filter(|m| contains_package(m, package))
        .max_by_key(|m| m.len())
}

/// Major version encoded as a `/vN` suffix of the module path
pub fn module_major_version(module: &str) -> Option<u64> {
    MODULE_MAJOR_VERSION
        .captures(module)
        .and_then(|caps| caps[1].parse().ok())
}

/// A module line of `go list -m all`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleDep {
    pub name: String,
    /// Version, or the relative path of a local replacement
    pub version: String,
    /// The (name, version) a requested replacement displaced
    pub replaces: Option<(String, String)>,
}

/// Parsed `go list -m` output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleList {
    pub main: String,
    pub deps: Vec<ModuleDep>,
    /// Requested replacements that matched a module
    pub used_replacements: BTreeSet<String>,
}

/// Parse `go list -m -f "{{.Path}} {{.Version}} {{.Replace}}" all`
pub fn parse_module_list(output: &str, replaced: &BTreeSet<String>) -> Result<ModuleList> {
    let name_error = || Error::ValidationError("The Go module name could not be determined".into());
    let mut main: Option<String> = None;
    let mut deps = Vec::new();
    let mut used = BTreeSet::new();

    for line in output.lines() {
        let parts: Vec<&str> = line
            .split(' ')
            .filter(|p| !p.is_empty() && *p != "<nil>")
            .collect();
        let mut replaces = None;
        let (name, version) = match parts.as_slice() {
            [] => continue,
            [module] => {
                if let Some(existing) = &main {
                    warn!(
                        "go list produced two lines which look like module names: {} and {}",
                        existing, module
                    );
                    return Err(name_error());
                }
                main = Some(module.to_string());
                continue;
            }
            [name, version] => (*name, *version),
            // local replacement: name, version, path
            [name, _, path] => (*name, *path),
            [old_name, old_version, new_name, new_version] => {
                if replaced.contains(*old_name) {
                    used.insert(old_name.to_string());
                    replaces = Some((old_name.to_string(), old_version.to_string()));
                }
                (*new_name, *new_version)
            }
            _ => {
                warn!("Unexpected go module output: {}", line);
                continue;
            }
        };
        deps.push(ModuleDep {
            name: name.to_string(),
            version: version.to_string(),
            replaces,
        });
    }

    Ok(ModuleList {
        main: main.ok_or_else(name_error)?,
        deps,
        used_replacements: used,
    })
}

/// Package and (when present) version from one `go list -deps` line
pub fn parse_package_line(line: &str) -> Result<(String, Option<String>)> {
    // <package> <module> [<version>] [=> <path> | => <module> <version>]
    let parts: Vec<&str> = line.split(' ').collect();
    match parts.len() {
        1 | 2 => Ok((parts[0].to_string(), None)),
        3..=6 => Ok((parts[0].to_string(), parts.last().map(|v| v.to_string()))),
        _ => Err(Error::ParseError(format!(
            "Unrecognized line in go list -deps output: {line:?}"
        ))),
    }
}

/// Highest `vX.Y.Z` tag with the given major version
pub fn highest_semver_tag(tags: &[String], major: u64) -> Option<(String, Version)> {
    tags.iter()
        .filter_map(|tag| {
            let version = Version::parse(tag.strip_prefix('v')?).ok()?;
            (version.major == major).then(|| (tag.clone(), version))
        })
        .max_by(|a, b| a.1.cmp(&b.1))
}

/// Go pseudo-version for `commit`
///
/// `base` is the highest reachable tag with a matching major version; without
/// one the version is `v<major>.0.0-<timestamp>-<hash>`.
pub fn pseudo_version(
    commit: &str,
    committed: DateTime<Utc>,
    base: Option<&Version>,
    major: Option<u64>,
) -> String {
    let timestamp = committed.format("%Y%m%d%H%M%S");
    let hash = &commit[..commit.len().min(12)];
    match base {
        None => format!("v{}.0.0-{timestamp}-{hash}", major.unwrap_or(0)),
        Some(version) if !version.pre.is_empty() => {
            let mut version = version.clone();
            version.build = BuildMetadata::EMPTY;
            format!("v{version}.0.{timestamp}-{hash}")
        }
        Some(version) => format!(
            "v{}.{}.{}-0.{timestamp}-{hash}",
            version.major,
            version.minor,
            version.patch + 1
        ),
    }
}

/// Version of the module `module` at `commit`, as `go list` would report it
pub fn module_version(git: &Git, repo: &Path, module: &str, commit: &str) -> Result<String> {
    let major = module_major_version(module);
    let majors: Vec<u64> = match major {
        Some(m) => vec![m],
        None => vec![1, 0],
    };

    let on_commit = git.tags_pointing_at(repo, commit)?;
    for m in &majors {
        if let Some((tag, _)) = highest_semver_tag(&on_commit, *m) {
            debug!("Using the semantic version tag {} for commit {}", tag, commit);
            return Ok(tag);
        }
    }

    let committed = git.commit_time(repo, commit)?;
    let reachable = git.reachable_tags(repo, commit)?;
    for m in &majors {
        if let Some((tag, version)) = highest_semver_tag(&reachable, *m) {
            debug!("Using {} as the pseudo-version base for {}", tag, commit);
            return Ok(pseudo_version(commit, committed, Some(&version), Some(*m)));
        }
    }

    debug!("No semantic version tag was found for {}", commit);
    Ok(pseudo_version(commit, committed, None, major))
}

/// `go` invocations for one module directory
struct GoTool {
    runner: CommandRunner,
    retry: RetryPolicy,
    dir: PathBuf,
    // GOCACHE, removed on drop
    _cache: tempfile::TempDir,
}

impl GoTool {
    fn new(ctx: &DriverContext<'_>, dir: PathBuf) -> Result<Self> {
        let cache = tempfile::Builder::new().prefix("depstage-gocache-").tempdir()?;
        let gopath = ctx.request.bundle.deps_dir_for(PackageManager::Gomod);
        std::fs::create_dir_all(&gopath)?;

        let mut runner = ctx
            .runner
            .clone()
            .with_env("GOPATH", gopath.to_string_lossy())
            .with_env("GOMODCACHE", ctx.request.bundle.gomod_cache_dir().to_string_lossy())
            .with_env("GOCACHE", cache.path().to_string_lossy())
            .with_env("GOPROXY", ctx.config.gomod.proxy_url.as_str())
            .with_env("GO111MODULE", "on")
            .with_env("GOFLAGS", "-mod=mod");
        if !ctx.config.gomod.sumdb {
            runner = runner.with_env("GOSUMDB", "off");
        }
        if ctx.request.has_flag(Flag::CgoDisable) {
            runner = runner.with_env("CGO_ENABLED", "0");
        }

        Ok(Self {
            runner,
            retry: ctx.config.retry_policy()?,
            dir,
            _cache: cache,
        })
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        Ok(self.runner.run("go", args, &self.dir)?.stdout)
    }

    /// Commands that reach the module proxy
    fn run_online(&self, args: &[&str]) -> Result<String> {
        self.retry
            .run(&format!("go {}", args.join(" ")), || self.run(args))
    }
}

fn vendor_modules(dir: &Path) -> Option<String> {
    std::fs::read_to_string(dir.join("vendor").join("modules.txt")).ok()
}

pub struct GomodDriver;

impl GomodDriver {
    fn check_layout(&self, ctx: &DriverContext<'_>, subpath: &Path, module_dir: &Path) -> Result<bool> {
        if !module_dir.join("go.mod").is_file() {
            return Err(Error::ValidationError(format!(
                "The Go module at {} has no go.mod",
                subpath.display()
            )));
        }
        if module_dir.join("go.work").exists() || ctx.source_root().join("go.work").exists() {
            return Err(Error::UnsupportedFeature(
                "Go workspaces (go.work) are not supported".into(),
            ));
        }

        let vendored = ctx.request.has_flag(Flag::GomodVendor)
            || ctx.request.has_flag(Flag::GomodVendorCheck);
        if !vendored && module_dir.join("vendor").is_dir() {
            return Err(Error::ValidationError(
                "The \"gomod-vendor\" or \"gomod-vendor-check\" flag must be set when the \
                 repository has vendored dependencies"
                    .into(),
            ));
        }
        Ok(vendored)
    }

    fn fetch(&self, ctx: &DriverContext<'_>, go: &GoTool, vendored: bool) -> Result<BTreeSet<String>> {
        let mut replaced = BTreeSet::new();
        for replacement in &ctx.request.dependency_replacements {
            if replacement.kind != PackageType::Gomod {
                return Err(Error::UnsupportedFeature(format!(
                    "Dependency replacements of type {} are not supported",
                    replacement.kind
                )));
            }
            let new_name = replacement.new_name.as_deref().unwrap_or(&replacement.name);
            info!(
                "Applying the gomod replacement {} => {}@{}",
                replacement.name, new_name, replacement.version
            );
            go.run(&[
                "mod",
                "edit",
                "-replace",
                &format!("{}={}@{}", replacement.name, new_name, replacement.version),
            ])?;
            replaced.insert(replacement.name.clone());
        }

        if vendored {
            let before = ctx
                .request
                .has_flag(Flag::GomodVendorCheck)
                .then(|| vendor_modules(&go.dir))
                .flatten();
            info!("Vendoring the gomod dependencies");
            go.run_online(&["mod", "vendor"])?;
            if let Some(before) = before
                && vendor_modules(&go.dir).as_deref() != Some(before.as_str())
            {
                return Err(Error::ValidationError(
                    "The content of the vendor directory is not consistent with go.mod".into(),
                ));
            }
            // the build expects the cache directory even when it is unused
            std::fs::create_dir_all(ctx.request.bundle.gomod_cache_dir())?;
        } else {
            info!("Downloading the gomod dependencies");
            go.run_online(&["mod", "download"])?;
        }

        if !replaced.is_empty() || ctx.request.has_flag(Flag::ForceGomodTidy) {
            go.run_online(&["mod", "tidy"])?;
        }
        Ok(replaced)
    }
}

impl LockfileDriver for GomodDriver {
    fn manager(&self) -> PackageManager {
        PackageManager::Gomod
    }

    fn resolve(&self, ctx: &DriverContext<'_>, subpath: &Path) -> Result<Resolution> {
        let subpath = normalize_relative(subpath)?;
        let module_dir = ctx.package_dir(&subpath)?;
        let source_root = ctx.source_root();
        let vendored = self.check_layout(ctx, &subpath, &module_dir)?;

        let go = GoTool::new(ctx, module_dir.clone())?;
        let replaced = self.fetch(ctx, &go, vendored)?;

        let listing = go.run(&["list", "-mod", "readonly", "-m", "-f", LIST_MODULES_FORMAT, "all"])?;
        let modules = parse_module_list(&listing, &replaced)?;
        let unused: Vec<&String> = replaced.difference(&modules.used_replacements).collect();
        if !unused.is_empty() {
            return Err(Error::ValidationError(format!(
                "The following gomod dependency replacements don't apply: {}",
                unused.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
            )));
        }

        let version = module_version(ctx.git, &source_root, &modules.main, &ctx.request.git_ref)?;
        info!("Resolved Go module {} {}", modules.main, version);

        let allowlist = ctx
            .config
            .gomod
            .file_deps_allowlist
            .get(&modules.main)
            .or_else(|| {
                module_major_version(&modules.main)?;
                let (versionless, _) = modules.main.rsplit_once("/v")?;
                ctx.config.gomod.file_deps_allowlist.get(versionless)
            })
            .cloned()
            .unwrap_or_default();
        let vet = LocalDeps {
            module: &modules.main,
            module_dir: &module_dir,
            source_root: &source_root,
            allowlist: &allowlist,
        };

        let mut module = PackageRecord::new(PackageType::Gomod, &modules.main, &version, subpath.clone());
        for dep in &modules.deps {
            let origin = vet.origin(&dep.name, &dep.version)?;
            let mut record = DependencyRecord::new(PackageType::Gomod, &dep.name, &dep.version, origin);
            if let Some((name, version)) = &dep.replaces {
                record = record.with_replaces(name, version);
            }
            module.dependencies.push(record);
        }

        let local_modules: Vec<&str> = modules
            .deps
            .iter()
            .filter(|d| d.version.starts_with('.'))
            .map(|d| d.name.as_str())
            .collect();

        let mut resolution = Resolution::new(&subpath);
        resolution.packages.push(module);

        info!("Retrieving the list of package level dependencies");
        let mut processed: BTreeSet<String> = BTreeSet::new();
        for package in go.run(&["list", "-find", "./..."])?.lines().map(str::trim) {
            if package.is_empty() || processed.contains(package) {
                continue;
            }
            let output = go.run(&["list", "-deps", "-f", LIST_DEPS_FORMAT, package])?;
            let mut deps = Vec::new();
            for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
                let (name, dep_version) = parse_package_line(line)?;
                processed.insert(name.clone());
                deps.push((name, dep_version.unwrap_or_else(|| version.clone())));
            }
            // the package itself is listed last
            let Some((name, package_version)) = deps.pop() else {
                continue;
            };

            let mut record =
                PackageRecord::new(PackageType::GoPackage, name, package_version, subpath.clone());
            for (dep_name, dep_version) in deps {
                let dep_version = if dep_version.starts_with('.') {
                    full_local_path(&dep_name, &dep_version, &local_modules)?
                } else {
                    dep_version
                };
                let origin = vet.origin(&dep_name, &dep_version)?;
                record.dependencies.push(DependencyRecord::new(
                    PackageType::GoPackage,
                    dep_name,
                    dep_version,
                    origin,
                ));
            }
            resolution.packages.push(record);
        }

        Ok(resolution)
    }

    fn runtime_config(
        &self,
        ctx: &DriverContext<'_>,
        _staged: &[StagedPackage],
        _access: Option<&StoreAccess>,
    ) -> Result<RuntimeConfig> {
        let vendored = ctx.request.has_flag(Flag::GomodVendor)
            || ctx.request.has_flag(Flag::GomodVendorCheck);
        Ok(gomod_config(vendored, ctx.request.has_flag(Flag::CgoDisable)))
    }
}

/// Local replacement checks for one module
struct LocalDeps<'a> {
    module: &'a str,
    module_dir: &'a Path,
    source_root: &'a Path,
    allowlist: &'a [String],
}

impl LocalDeps<'_> {
    fn origin(&self, name: &str, version: &str) -> Result<Origin> {
        let is_path = version.starts_with('.') || Path::new(version).is_absolute();
        if !is_path {
            return Ok(Origin::Registry);
        }
        let allowlisted = self.allowlist.iter().any(|pattern| {
            glob::Pattern::new(pattern)
                .map(|p| p.matches(name))
                .unwrap_or(false)
        });
        debug!(
            "Module {} replaces {} with the local path {}",
            self.module, name, version
        );
        classify_local(name, version, self.module_dir, self.source_root, allowlisted).map_err(|e| {
            match e {
                Error::ValidationError(_) => Error::ValidationError(format!(
                    "The module {} is not allowed to replace {} with the local path {}",
                    self.module, name, version
                )),
                other => other,
            }
        })
    }
}

/// Path of a package inside a locally replaced module
fn full_local_path(package: &str, module_path: &str, local_modules: &[&str]) -> Result<String> {
    let module = match_parent_module(package, local_modules).ok_or_else(|| {
        Error::ParseError(format!(
            "Could not find the parent Go module of the local dependency {package}"
        ))
    })?;
    Ok(match path_to_subpackage(module, package) {
        Some(sub) if !sub.is_empty() => format!("{}/{sub}", module_path.trim_end_matches('/')),
        _ => module_path.to_string(),
    })
}
