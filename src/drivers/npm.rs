// src/drivers/npm.rs

//! npm driver: `package.json` with `package-lock.json` or `npm-shrinkwrap.json`
//!
//! Lockfile version 1 nests entries under `dependencies`; versions 2 and 3
//! list them in a flat `packages` map keyed by `node_modules/...` paths.
//! When a lockfile carries both, `packages` is parsed and both are
//! rewritten.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::js::{
    JsClassifier, is_file_locator, is_git_locator, is_http_locator, is_registry_url, npm_job,
};
use super::{
    DriverContext, LockfileDriver, Resolution, RewrittenFile, StagedPackage, StoreAccess,
    mirrored_for, read_json, require_access, staged_subpaths,
};
use crate::emit::{RuntimeConfig, npm_config};
use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::mirror::{MirrorResults, MirroredArtifact, RegistryArtifact, RegistryLayout};
use crate::model::{DependencyRecord, Origin, PackageManager, PackageRecord, PackageType};
use crate::paths::normalize_relative;

/// Lockfile names in order of preference
const LOCKFILES: &[&str] = &["npm-shrinkwrap.json", "package-lock.json"];

/// package.json sections holding dependency specs
const SPEC_SECTIONS: &[&str] = &[
    "dependencies",
    "devDependencies",
    "optionalDependencies",
    "peerDependencies",
];

pub struct NpmDriver;

/// One dependency entry of a lockfile
#[derive(Debug, Clone, PartialEq, Eq)]
struct LockEntry {
    name: String,
    locator: String,
    version: String,
    integrity: Option<String>,
    dev: bool,
    bundled: bool,
}

impl LockEntry {
    fn from_v1(name: &str, value: &Value) -> Self {
        let version = str_field(value, "version");
        let resolved = value.get("resolved").and_then(Value::as_str);
        Self {
            name: name.to_string(),
            locator: locator(&version, resolved),
            version,
            integrity: value.get("integrity").and_then(Value::as_str).map(String::from),
            dev: bool_field(value, "dev"),
            bundled: bool_field(value, "bundled"),
        }
    }

    fn from_packages(key: &str, value: &Value) -> Option<Self> {
        let (_, key_name) = key.rsplit_once("node_modules/")?;
        let name = value
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or(key_name)
            .to_string();
        let version = str_field(value, "version");
        let resolved = value.get("resolved").and_then(Value::as_str);
        let locator = if bool_field(value, "link") {
            format!("file:{}", resolved.unwrap_or_default())
        } else {
            locator(&version, resolved)
        };
        Some(Self {
            name,
            locator,
            version,
            integrity: value.get("integrity").and_then(Value::as_str).map(String::from),
            dev: bool_field(value, "dev"),
            bundled: bool_field(value, "inBundle"),
        })
    }

    /// Version recorded in the bill of materials
    fn record_version(&self) -> String {
        let non_registry = is_git_locator(&self.locator)
            || is_file_locator(&self.locator)
            || (is_http_locator(&self.locator) && !is_registry_url(&self.locator));
        if non_registry {
            self.locator.clone()
        } else {
            self.version.clone()
        }
    }

    fn integrity(&self) -> Result<Option<Hash>> {
        self.integrity
            .as_deref()
            .map(Hash::strongest_integrity)
            .transpose()
            .map_err(|e| Error::ValidationError(format!("{}: {e}", self.name)))
    }
}

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn bool_field(value: &Value, key: &str) -> bool {
    value.get(key).and_then(Value::as_bool).unwrap_or(false)
}

/// Where an entry really comes from: its version when that is a locator, else `resolved`
fn locator(version: &str, resolved: Option<&str>) -> String {
    if is_git_locator(version) || is_file_locator(version) || is_http_locator(version) {
        return version.to_string();
    }
    match resolved {
        Some(r) if is_git_locator(r) || is_http_locator(r) => r.to_string(),
        _ => version.to_string(),
    }
}

fn collect_v1(deps: &Map<String, Value>, out: &mut Vec<LockEntry>) {
    for (name, value) in deps {
        out.push(LockEntry::from_v1(name, value));
        if let Some(nested) = value.get("dependencies").and_then(Value::as_object) {
            collect_v1(nested, out);
        }
    }
}

/// Every entry of the lockfile, `packages` preferred over `dependencies`
fn collect_entries(lock: &Value) -> Vec<LockEntry> {
    let mut out = Vec::new();
    if let Some(packages) = lock.get("packages").and_then(Value::as_object) {
        for (key, value) in packages {
            if let Some(entry) = LockEntry::from_packages(key, value) {
                out.push(entry);
            }
        }
    } else if let Some(deps) = lock.get("dependencies").and_then(Value::as_object) {
        collect_v1(deps, &mut out);
    }
    out
}

/// Dedupe by (name, version); a direct, non-dev occurrence clears the flags
fn dedupe(entries: Vec<LockEntry>) -> Vec<LockEntry> {
    let mut seen: BTreeMap<(String, String), LockEntry> = BTreeMap::new();
    for entry in entries {
        let key = (entry.name.clone(), entry.record_version());
        match seen.get_mut(&key) {
            Some(existing) => {
                existing.dev &= entry.dev;
                existing.bundled &= entry.bundled;
                if existing.integrity.is_none() {
                    existing.integrity = entry.integrity;
                }
            }
            None => {
                seen.insert(key, entry);
            }
        }
    }
    seen.into_values().collect()
}

/// Files of one npm package directory
struct NpmProject {
    subpath: PathBuf,
    package_dir: PathBuf,
    lock_name: &'static str,
    manifest: Value,
    lock: Value,
    name: String,
}

impl NpmProject {
    fn load(ctx: &DriverContext<'_>, subpath: &Path) -> Result<Self> {
        let subpath = normalize_relative(subpath)?;
        let package_dir = ctx.package_dir(&subpath)?;

        let manifest_path = package_dir.join("package.json");
        if !manifest_path.is_file() {
            return Err(Error::ValidationError(format!(
                "The npm package at {} has no package.json",
                package_dir.display()
            )));
        }
        let manifest = read_json(&manifest_path)?;
        if manifest.get("workspaces").is_some() {
            return Err(Error::UnsupportedFeature(format!(
                "The npm package at {} uses workspaces, which are not supported",
                subpath.display()
            )));
        }

        let lock_name = LOCKFILES
            .iter()
            .copied()
            .find(|f| package_dir.join(f).is_file())
            .ok_or_else(|| {
                Error::ValidationError(format!(
                    "The npm package at {} has no package-lock.json or npm-shrinkwrap.json",
                    subpath.display()
                ))
            })?;
        let lock = read_json(&package_dir.join(lock_name))?;

        let name = manifest
            .get("name")
            .or_else(|| lock.get("name"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::ValidationError(format!(
                    "The npm package at {} has no name",
                    subpath.display()
                ))
            })?
            .to_string();

        Ok(Self {
            subpath,
            package_dir,
            lock_name,
            manifest,
            lock,
            name,
        })
    }

    fn version(&self) -> String {
        self.manifest
            .get("version")
            .or_else(|| self.lock.get("version"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }
}

/// Finds the mirrored copy of a lock entry
struct MirrorLookup<'a> {
    classifier: JsClassifier<'a>,
    repository: &'a str,
    mirrored: &'a MirrorResults,
}

impl MirrorLookup<'_> {
    fn artifact(&self, entry: &LockEntry) -> Result<Option<&MirroredArtifact>> {
        if entry.bundled {
            return Ok(None);
        }
        let integrity = entry.integrity()?;
        let origin = self
            .classifier
            .origin(&entry.name, &entry.locator, integrity.as_ref())?;
        match npm_job(&entry.name, &entry.version, &origin, self.repository) {
            Some(job) => mirrored_for(self.mirrored, &job).map(Some),
            None => Ok(None),
        }
    }
}

/// Point a lock entry at its mirrored copy and return the new version
fn set_mirrored(value: &mut Value, artifact: &MirroredArtifact) -> String {
    let version = artifact.version.clone().unwrap_or_default();
    if let Some(obj) = value.as_object_mut() {
        obj.insert("version".into(), Value::String(version.clone()));
        obj.insert("resolved".into(), Value::String(artifact.url.clone()));
        obj.insert("integrity".into(), Value::String(artifact.integrity()));
        obj.remove("from");
    }
    version
}

/// Replace the specs of mirrored dependencies in the package.json-style sections of `value`
fn update_specs(value: &mut Value, lookup: impl Fn(&str) -> Option<String>) -> bool {
    let mut changed = false;
    for section in SPEC_SECTIONS {
        let Some(specs) = value.get_mut(*section).and_then(Value::as_object_mut) else {
            continue;
        };
        for (name, spec) in specs.iter_mut() {
            if let Some(version) = lookup(name) {
                *spec = Value::String(version);
                changed = true;
            }
        }
    }
    changed
}

/// Lock key a dependency of the entry at `key` resolves to, searching up the tree
fn visible_key<'m>(
    key: &str,
    dep: &str,
    keys: &'m BTreeMap<String, Option<String>>,
) -> Option<&'m Option<String>> {
    let mut base = key;
    loop {
        let candidate = if base.is_empty() {
            format!("node_modules/{dep}")
        } else {
            format!("{base}/node_modules/{dep}")
        };
        if let Some(found) = keys.get(&candidate) {
            return Some(found);
        }
        if base.is_empty() {
            return None;
        }
        base = base.rfind("/node_modules/").map(|i| &base[..i]).unwrap_or("");
    }
}

impl NpmDriver {
    /// Rewrite the `packages` map; returns top-level name → new version
    fn rewrite_packages(
        packages: &mut Map<String, Value>,
        lookup: &MirrorLookup<'_>,
    ) -> Result<BTreeMap<String, String>> {
        let mut keys: BTreeMap<String, Option<String>> = BTreeMap::new();
        let mut top_level = BTreeMap::new();

        for (key, value) in packages.iter_mut() {
            let Some(entry) = LockEntry::from_packages(key, value) else {
                continue;
            };
            let new_version = match lookup.artifact(&entry)? {
                Some(artifact) => Some(set_mirrored(value, artifact)),
                None => None,
            };
            if let Some(version) = &new_version
                && key == &format!("node_modules/{}", entry.name)
            {
                top_level.insert(entry.name.clone(), version.clone());
            }
            keys.insert(key.clone(), new_version);
        }

        for (key, value) in packages.iter_mut() {
            update_specs(value, |dep| {
                visible_key(key, dep, &keys).and_then(|v| v.clone())
            });
        }
        Ok(top_level)
    }

    /// Rewrite a v1 `dependencies` level and everything below it
    fn rewrite_tree(
        deps: &mut Map<String, Value>,
        lookup: &MirrorLookup<'_>,
        scopes: &mut Vec<BTreeMap<String, Option<String>>>,
    ) -> Result<BTreeMap<String, Option<String>>> {
        let mut level = BTreeMap::new();
        for (name, value) in deps.iter_mut() {
            let entry = LockEntry::from_v1(name, value);
            let new_version = match lookup.artifact(&entry)? {
                Some(artifact) => Some(set_mirrored(value, artifact)),
                None => None,
            };
            level.insert(name.clone(), new_version);
        }

        scopes.push(level);
        for value in deps.values_mut() {
            let Some(obj) = value.as_object_mut() else {
                continue;
            };
            let children = match obj.get_mut("dependencies").and_then(Value::as_object_mut) {
                Some(children) => Self::rewrite_tree(children, lookup, scopes)?,
                None => BTreeMap::new(),
            };
            if let Some(requires) = obj.get_mut("requires").and_then(Value::as_object_mut) {
                for (dep, spec) in requires.iter_mut() {
                    let nearest = children
                        .get(dep)
                        .or_else(|| scopes.iter().rev().find_map(|s| s.get(dep)));
                    if let Some(Some(version)) = nearest {
                        *spec = Value::String(version.clone());
                    }
                }
            }
        }
        Ok(scopes.pop().unwrap_or_default())
    }
}

impl LockfileDriver for NpmDriver {
    fn manager(&self) -> PackageManager {
        PackageManager::Npm
    }

    fn resolve(&self, ctx: &DriverContext<'_>, subpath: &Path) -> Result<Resolution> {
        let project = NpmProject::load(ctx, subpath)?;
        if project.package_dir.join("node_modules").exists() {
            return Err(Error::ValidationError(format!(
                "The npm package at {} has a node_modules directory checked in",
                project.subpath.display()
            )));
        }

        info!("Resolving npm dependencies of {}", project.name);
        let source_root = ctx.source_root();
        let allowlist = ctx
            .config
            .npm
            .file_deps_allowlist
            .get(&project.name)
            .cloned()
            .unwrap_or_default();
        let classifier = JsClassifier {
            package_dir: &project.package_dir,
            source_root: &source_root,
            allowlist: &allowlist,
        };
        let repository = ctx.cache_repository()?;

        let mut resolution = Resolution::new(&project.subpath);
        let mut package = PackageRecord::new(
            PackageType::Npm,
            project.name.clone(),
            project.version(),
            project.subpath.clone(),
        );

        for entry in dedupe(collect_entries(&project.lock)) {
            let integrity = entry.integrity()?;
            let origin = if entry.bundled {
                // shipped inside its parent's tarball
                Origin::Registry
            } else {
                classifier.origin(&entry.name, &entry.locator, integrity.as_ref())?
            };
            if let Some(job) = npm_job(&entry.name, &entry.version, &origin, repository) {
                resolution.jobs.push(job);
            }
            if origin == Origin::Registry && !entry.bundled {
                resolution.registry.push(RegistryArtifact::new(
                    RegistryLayout::Npm,
                    &entry.name,
                    &entry.version,
                    integrity.iter().cloned().collect(),
                ));
            }
            debug!("{} {} is a {} dependency", entry.name, entry.version, origin.kind());
            package.dependencies.push(
                DependencyRecord::new(PackageType::Npm, &entry.name, entry.record_version(), origin)
                    .with_dev(entry.dev)
                    .with_hashes(integrity.into_iter().collect()),
            );
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
        let mut project = NpmProject::load(ctx, &resolution.subpath)?;
        let source_root = ctx.source_root();
        let allowlist = ctx
            .config
            .npm
            .file_deps_allowlist
            .get(&project.name)
            .cloned()
            .unwrap_or_default();
        let lookup = MirrorLookup {
            classifier: JsClassifier {
                package_dir: &project.package_dir,
                source_root: &source_root,
                allowlist: &allowlist,
            },
            repository: ctx.cache_repository()?,
            mirrored,
        };

        let mut top_level = BTreeMap::new();
        if let Some(packages) = project.lock.get_mut("packages").and_then(Value::as_object_mut) {
            top_level.extend(Self::rewrite_packages(packages, &lookup)?);
        }
        if let Some(deps) = project
            .lock
            .get_mut("dependencies")
            .and_then(Value::as_object_mut)
        {
            let level = Self::rewrite_tree(deps, &lookup, &mut Vec::new())?;
            top_level.extend(level.into_iter().filter_map(|(k, v)| v.map(|v| (k, v))));
        }
        update_specs(&mut project.manifest, |name| top_level.get(name).cloned());

        info!(
            "Pointed {} npm dependencies of {} at the mirror",
            resolution.jobs.len(),
            project.name
        );
        Ok(vec![
            RewrittenFile::json(project.subpath.join(project.lock_name), &project.lock)?,
            RewrittenFile::json(project.subpath.join("package.json"), &project.manifest)?,
        ])
    }

    fn runtime_config(
        &self,
        _ctx: &DriverContext<'_>,
        staged: &[StagedPackage],
        access: Option<&StoreAccess>,
    ) -> Result<RuntimeConfig> {
        let access = require_access(access, self.manager())?;
        Ok(npm_config(
            &access.group_url,
            &access.credentials.username,
            &access.credentials.password,
            access.ca_cert.as_deref(),
            &staged_subpaths(staged),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::testing::Fixture;
    use crate::hash::{HashAlgorithm, hash_bytes};
    use crate::mirror::PublishTarget;
    use serde_json::json;

    const SHA: &str = "0123456789abcdef0123456789abcdef01234567";

    fn fake_mirror(resolution: &Resolution) -> MirrorResults {
        resolution
            .jobs
            .iter()
            .map(|job| {
                let component = job.component_name().unwrap();
                let base = match &job.target {
                    PublishTarget::Npm { base_version, .. } => base_version.clone(),
                    PublishTarget::Raw { .. } => unreachable!("npm jobs only"),
                };
                let version = component.synthetic_version(&base);
                let artifact = MirroredArtifact {
                    url: format!("http://store.invalid/repository/cache/{}/-/x.tgz", job.name),
                    version: Some(version),
                    digest: hash_bytes(HashAlgorithm::Sha512, job.name.as_bytes()),
                    fetched: true,
                    component: component.clone(),
                };
                (component.to_string(), artifact)
            })
            .collect()
    }

    fn v1_fixture() -> Fixture {
        let fx = Fixture::new(PackageManager::Npm);
        fx.write(
            "package.json",
            &json!({
                "name": "webapp",
                "version": "1.0.0",
                "dependencies": {"foo": "^1.0.0", "lib": format!("github:o/lib#{SHA}")},
                "devDependencies": {"local": "file:./local"}
            })
            .to_string(),
        );
        fx.write(
            "package-lock.json",
            &json!({
                "name": "webapp",
                "version": "1.0.0",
                "lockfileVersion": 1,
                "dependencies": {
                    "foo": {
                        "version": "1.0.0",
                        "resolved": "https://registry.npmjs.org/foo/-/foo-1.0.0.tgz",
                        "integrity": hash_bytes(HashAlgorithm::Sha512, b"foo").to_integrity(),
                        "requires": {"lib": format!("github:o/lib#{SHA}")}
                    },
                    "lib": {
                        "version": format!("github:o/lib#{SHA}"),
                        "from": "github:o/lib"
                    },
                    "local": {"version": "file:local", "dev": true}
                }
            })
            .to_string(),
        );
        fx
    }

    #[test]
    fn test_resolve_v1() {
        let fx = v1_fixture();
        let resolution = NpmDriver.resolve(&fx.ctx(), Path::new(".")).unwrap();
        let package = &resolution.packages[0];
        assert_eq!(package.name, "webapp");
        assert_eq!(package.dependencies.len(), 3);

        let lib = package.dependencies.iter().find(|d| d.name == "lib").unwrap();
        assert!(matches!(lib.origin, Origin::Vcs { ref commit, .. } if commit == SHA));
        assert_eq!(lib.version, format!("github:o/lib#{SHA}"));

        let local = package.dependencies.iter().find(|d| d.name == "local").unwrap();
        assert!(local.dev);
        assert!(matches!(local.origin, Origin::LocalPath { .. }));

        assert_eq!(resolution.jobs.len(), 1);
        assert_eq!(resolution.jobs[0].name, "lib");
    }

    #[test]
    fn test_rewrite_v1() {
        let fx = v1_fixture();
        let resolution = NpmDriver.resolve(&fx.ctx(), Path::new(".")).unwrap();
        let mirrored = fake_mirror(&resolution);
        let files = NpmDriver
            .apply_mirror(&fx.ctx(), &resolution, &mirrored)
            .unwrap();
        assert_eq!(files.len(), 2);

        let expected = format!("0.0.0-external-gitcommit-{SHA}");
        let lock: Value = serde_json::from_slice(&files[0].content).unwrap();
        let lib = &lock["dependencies"]["lib"];
        assert_eq!(lib["version"], json!(expected));
        assert_eq!(
            lib["resolved"],
            json!("http://store.invalid/repository/cache/lib/-/x.tgz")
        );
        assert!(lib["integrity"].as_str().unwrap().starts_with("sha512-"));
        assert!(lib.get("from").is_none());
        assert_eq!(lock["dependencies"]["foo"]["requires"]["lib"], json!(expected));

        let manifest: Value = serde_json::from_slice(&files[1].content).unwrap();
        assert_eq!(manifest["dependencies"]["lib"], json!(expected));
        assert_eq!(manifest["dependencies"]["foo"], json!("^1.0.0"));
    }

    #[test]
    fn test_resolve_and_rewrite_packages_map() {
        let fx = Fixture::new(PackageManager::Npm);
        fx.write(
            "web/package.json",
            &json!({"name": "web", "dependencies": {"tar": "https://example.org/tar-2.0.0.tgz"}})
                .to_string(),
        );
        let integrity = hash_bytes(HashAlgorithm::Sha512, b"tar").to_integrity();
        fx.write(
            "web/package-lock.json",
            &json!({
                "name": "web",
                "lockfileVersion": 3,
                "packages": {
                    "": {"name": "web", "dependencies": {"tar": "https://example.org/tar-2.0.0.tgz"}},
                    "node_modules/tar": {
                        "version": "2.0.0",
                        "resolved": "https://example.org/tar-2.0.0.tgz",
                        "integrity": integrity
                    },
                    "node_modules/dup": {"version": "1.0.0", "dev": true},
                    "node_modules/tar/node_modules/dup": {"version": "1.0.0"}
                }
            })
            .to_string(),
        );

        let resolution = NpmDriver.resolve(&fx.ctx(), Path::new("web")).unwrap();
        let package = &resolution.packages[0];
        assert_eq!(package.path, PathBuf::from("web"));
        let dup = package.dependencies.iter().find(|d| d.name == "dup").unwrap();
        assert!(!dup.dev, "a non-dev occurrence clears the dev flag");
        assert_eq!(package.dependencies.len(), 2);
        assert!(
            resolution.jobs[0]
                .component_name()
                .unwrap()
                .tag()
                .starts_with("external-sha512-")
        );

        let mirrored = fake_mirror(&resolution);
        let files = NpmDriver.apply_mirror(&fx.ctx(), &resolution, &mirrored).unwrap();
        assert_eq!(files[0].path, PathBuf::from("web/package-lock.json"));
        let lock: Value = serde_json::from_slice(&files[0].content).unwrap();
        let version = lock["packages"]["node_modules/tar"]["version"].as_str().unwrap();
        assert!(version.starts_with("2.0.0-external-sha512-"));
        assert_eq!(lock["packages"][""]["dependencies"]["tar"], json!(version));
    }

    #[test]
    fn test_rejections() {
        let fx = Fixture::new(PackageManager::Npm);
        fx.write("package.json", r#"{"name": "w"}"#);
        let err = NpmDriver.resolve(&fx.ctx(), Path::new(".")).unwrap_err();
        assert!(err.to_string().contains("package-lock.json"));

        fx.write("package.json", r#"{"name": "w", "workspaces": ["a"]}"#);
        fx.write("package-lock.json", r#"{"lockfileVersion": 2, "packages": {}}"#);
        let err = NpmDriver.resolve(&fx.ctx(), Path::new(".")).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFeature(_)));

        fx.write("package.json", r#"{"name": "w"}"#);
        fx.write(
            "package-lock.json",
            r#"{"lockfileVersion": 1, "dependencies": {"x": {"version": "github:o/x#main"}}}"#,
        );
        assert!(NpmDriver.resolve(&fx.ctx(), Path::new(".")).is_err());
    }
}
