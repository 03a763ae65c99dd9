// src/drivers/yarn.rs

//! yarn driver: `package.json` with a v1 `yarn.lock`
//!
//! yarn.lock v1 is an indentation-based format: each entry starts with a
//! comma-separated list of `name@spec` keys at column 0, fields follow
//! indented by two spaces, and nested maps (`dependencies`,
//! `optionalDependencies`) by four. [`YarnLock`] parses and serializes it
//! with the same quoting rules yarn uses, so an untouched file round-trips.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::js::{JsClassifier, is_file_locator, is_http_locator, npm_job};
use super::{
    DriverContext, LockfileDriver, Resolution, RewrittenFile, StagedPackage, StoreAccess,
    mirrored_for, read_json, require_access, staged_subpaths,
};
use crate::emit::{RuntimeConfig, npm_config};
use crate::error::{Error, Result};
use crate::hash::{Hash, HashAlgorithm};
use crate::mirror::{MirrorJob, MirrorResults, RegistryArtifact, RegistryLayout};
use crate::model::{DependencyRecord, Origin, PackageManager, PackageRecord, PackageType};
use crate::paths::normalize_relative;

const HEADER: &str = "# THIS IS AN AUTOGENERATED FILE. DO NOT EDIT THIS FILE DIRECTLY.\n# yarn lockfile v1\n";

/// package.json sections the dependency walk starts from
const ROOT_SECTIONS: &[&str] = &["dependencies", "peerDependencies", "optionalDependencies"];

/// package.json sections rewritten to mirrored versions
const SPEC_SECTIONS: &[&str] = &[
    "dependencies",
    "devDependencies",
    "optionalDependencies",
    "peerDependencies",
];

/// Nested maps of a lock entry that name further entries
const NESTED_SECTIONS: &[&str] = &["dependencies", "optionalDependencies"];

/// A field value in yarn.lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum YarnValue {
    Scalar(String),
    Map(Vec<(String, String)>),
}

/// One resolution in yarn.lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct YarnEntry {
    /// `name@spec` keys sharing this resolution
    pub keys: Vec<String>,
    pub fields: Vec<(String, YarnValue)>,
}

impl YarnEntry {
    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.iter().find_map(|(k, v)| match v {
            YarnValue::Scalar(s) if k == field => Some(s.as_str()),
            _ => None,
        })
    }

    /// Set a scalar field, keeping its position when it exists
    pub fn set(&mut self, field: &str, value: impl Into<String>) {
        let value = YarnValue::Scalar(value.into());
        match self.fields.iter_mut().find(|(k, _)| k == field) {
            Some((_, v)) => *v = value,
            None => self.fields.push((field.to_string(), value)),
        }
    }

    pub fn map(&self, field: &str) -> &[(String, String)] {
        self.fields
            .iter()
            .find_map(|(k, v)| match v {
                YarnValue::Map(m) if k == field => Some(m.as_slice()),
                _ => None,
            })
            .unwrap_or_default()
    }

    fn map_mut(&mut self, field: &str) -> Option<&mut Vec<(String, String)>> {
        self.fields.iter_mut().find_map(|(k, v)| match v {
            YarnValue::Map(m) if k == field => Some(m),
            _ => None,
        })
    }

    /// Package name, taken from the first key
    pub fn name(&self) -> Result<&str> {
        let key = self
            .keys
            .first()
            .ok_or_else(|| Error::ParseError("yarn.lock entry without keys".into()))?;
        Ok(split_key(key)?.0)
    }

    /// Specs of every key
    pub fn specs(&self) -> Vec<&str> {
        self.keys
            .iter()
            .filter_map(|k| split_key(k).ok().map(|(_, spec)| spec))
            .collect()
    }
}

/// Split `name@spec`, allowing a leading `@` for scoped names
pub fn split_key(key: &str) -> Result<(&str, &str)> {
    let start = usize::from(key.starts_with('@'));
    key[start..]
        .find('@')
        .map(|i| (&key[..start + i], &key[start + i + 1..]))
        .ok_or_else(|| Error::ParseError(format!("Invalid yarn.lock key: {key}")))
}

/// A parsed yarn.lock v1 file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct YarnLock {
    pub entries: Vec<YarnEntry>,
}

impl YarnLock {
    pub fn parse(content: &str) -> Result<Self> {
        let mut entries = Vec::new();
        let mut current: Option<YarnEntry> = None;
        let mut nested: Option<(String, Vec<(String, String)>)> = None;

        for (index, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let err = |msg: &str| Error::ParseError(format!("yarn.lock line {}: {msg}", index + 1));
            let indent = raw.len() - raw.trim_start().len();

            if indent != 4
                && let (Some(entry), Some((field, map))) = (current.as_mut(), nested.take())
            {
                entry.fields.push((field, YarnValue::Map(map)));
            }

            match indent {
                0 => {
                    entries.extend(current.take());
                    let header = line.strip_suffix(':').ok_or_else(|| err("expected `key:`"))?;
                    current = Some(YarnEntry {
                        keys: split_keys(header),
                        fields: Vec::new(),
                    });
                }
                2 => {
                    let entry = current.as_mut().ok_or_else(|| err("field outside an entry"))?;
                    match line.strip_suffix(':') {
                        Some(field) => nested = Some((unquote(field), Vec::new())),
                        None => {
                            let (k, v) = split_pair(line).ok_or_else(|| err("expected `key value`"))?;
                            entry.fields.push((k, YarnValue::Scalar(v)));
                        }
                    }
                }
                4 => {
                    let (_, map) = nested.as_mut().ok_or_else(|| err("nested value outside a map"))?;
                    let (k, v) = split_pair(line).ok_or_else(|| err("expected `key value`"))?;
                    map.push((k, v));
                }
                _ => return Err(err("unexpected indentation")),
            }
        }

        if let (Some(entry), Some((field, map))) = (current.as_mut(), nested.take()) {
            entry.fields.push((field, YarnValue::Map(map)));
        }
        entries.extend(current);
        Ok(Self { entries })
    }

    /// Index of the entry each `name@spec` key belongs to
    fn key_index(&self) -> HashMap<&str, usize> {
        self.entries
            .iter()
            .enumerate()
            .flat_map(|(i, e)| e.keys.iter().map(move |k| (k.as_str(), i)))
            .collect()
    }
}

impl fmt::Display for YarnLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{HEADER}")?;
        for entry in &self.entries {
            let keys: Vec<String> = entry.keys.iter().map(|k| maybe_quote(k)).collect();
            writeln!(f)?;
            writeln!(f, "{}:", keys.join(", "))?;
            for (field, value) in &entry.fields {
                match value {
                    YarnValue::Scalar(s) => writeln!(f, "  {} {}", maybe_quote(field), maybe_quote(s))?,
                    YarnValue::Map(map) => {
                        writeln!(f, "  {}:", maybe_quote(field))?;
                        for (k, v) in map {
                            writeln!(f, "    {} {}", maybe_quote(k), maybe_quote(v))?;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Quote a string the way yarn does
fn maybe_quote(s: &str) -> String {
    let needs = s.starts_with("true")
        || s.starts_with("false")
        || s.chars().any(|c| matches!(c, ':' | '\\' | '"' | ',' | '[' | ']') || c.is_whitespace())
        || !s.starts_with(|c: char| c.is_ascii_alphabetic());
    if needs {
        format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        s.to_string()
    }
}

fn unquote(s: &str) -> String {
    let s = s.trim();
    match s.strip_prefix('"').and_then(|r| r.strip_suffix('"')) {
        Some(inner) => inner.replace("\\\"", "\"").replace("\\\\", "\\"),
        None => s.to_string(),
    }
}

/// Split an entry header into keys, honoring quotes
fn split_keys(header: &str) -> Vec<String> {
    let mut keys = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in header.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                current.push(c);
            }
            ',' if !quoted => keys.push(unquote(&std::mem::take(&mut current))),
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        keys.push(unquote(&current));
    }
    keys
}

/// Split `key value`, where the key may be quoted
fn split_pair(line: &str) -> Option<(String, String)> {
    if let Some(rest) = line.strip_prefix('"') {
        let end = rest.find('"')?;
        return Some((rest[..end].to_string(), unquote(&rest[end + 1..])));
    }
    let (key, value) = line.split_once(char::is_whitespace)?;
    Some((key.to_string(), unquote(value)))
}

/// A lock entry after classification
struct Classified {
    name: String,
    version: String,
    locator: String,
    integrity: Option<Hash>,
    origin: Origin,
}

impl Classified {
    fn record_version(&self) -> String {
        match self.origin {
            Origin::Registry => self.version.clone(),
            _ => self.locator.clone(),
        }
    }

    fn job(&self, repository: &str) -> Option<MirrorJob> {
        npm_job(&self.name, &self.version, &self.origin, repository)
    }
}

/// Where the entry comes from and the digest pinning it
fn entry_source(entry: &YarnEntry) -> Result<(String, Option<Hash>)> {
    let name = entry.name()?;
    let integrity = entry
        .get("integrity")
        .map(Hash::strongest_integrity)
        .transpose()
        .map_err(|e| Error::ValidationError(format!("{name}: {e}")))?;

    if let Some(spec) = entry.specs().into_iter().find(|s| is_file_locator(s)) {
        return Ok((spec.to_string(), integrity));
    }

    let resolved = entry.get("resolved").ok_or_else(|| {
        Error::ValidationError(format!("The yarn.lock entry for {name} has no resolved source"))
    })?;

    // registry tarballs carry their sha1 as a bare fragment
    if is_http_locator(resolved)
        && let Some((url, fragment)) = resolved.split_once('#')
        && !fragment.contains('=')
    {
        let integrity = match integrity {
            Some(i) => Some(i),
            None => Hash::new(HashAlgorithm::Sha1, fragment).ok(),
        };
        return Ok((url.to_string(), integrity));
    }
    Ok((resolved.to_string(), integrity))
}

/// Files of one yarn package directory
struct YarnProject {
    subpath: PathBuf,
    package_dir: PathBuf,
    manifest: Value,
    lock: YarnLock,
    name: String,
    allowlist: Vec<String>,
}

impl YarnProject {
    fn load(ctx: &DriverContext<'_>, subpath: &Path) -> Result<Self> {
        let subpath = normalize_relative(subpath)?;
        let package_dir = ctx.package_dir(&subpath)?;

        let manifest_path = package_dir.join("package.json");
        if !manifest_path.is_file() {
            return Err(Error::ValidationError(format!(
                "The yarn package at {} has no package.json",
                package_dir.display()
            )));
        }
        let manifest = read_json(&manifest_path)?;
        if manifest.get("workspaces").is_some() {
            return Err(Error::UnsupportedFeature(format!(
                "The yarn package at {} uses workspaces, which are not supported",
                subpath.display()
            )));
        }

        let lock_path = package_dir.join("yarn.lock");
        if !lock_path.is_file() {
            return Err(Error::ValidationError(format!(
                "The yarn package at {} has no yarn.lock",
                subpath.display()
            )));
        }
        let lock = YarnLock::parse(&std::fs::read_to_string(&lock_path)?)?;

        let name = manifest
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::ValidationError(format!(
                    "The yarn package at {} has no name",
                    subpath.display()
                ))
            })?
            .to_string();
        let allowlist = ctx
            .config
            .npm
            .file_deps_allowlist
            .get(&name)
            .cloned()
            .unwrap_or_default();

        Ok(Self {
            subpath,
            package_dir,
            manifest,
            lock,
            name,
            allowlist,
        })
    }

    fn classify(&self, ctx: &DriverContext<'_>, entry: &YarnEntry) -> Result<Classified> {
        let source_root = ctx.source_root();
        let classifier = JsClassifier {
            package_dir: &self.package_dir,
            source_root: &source_root,
            allowlist: &self.allowlist,
        };
        let name = entry.name()?.to_string();
        let (locator, integrity) = entry_source(entry)?;
        let origin = classifier.origin(&name, &locator, integrity.as_ref())?;
        Ok(Classified {
            version: entry.get("version").unwrap_or_default().to_string(),
            name,
            locator,
            integrity,
            origin,
        })
    }

    /// Entries reachable from the non-dev sections of package.json
    fn reachable(&self) -> BTreeSet<usize> {
        let index = self.lock.key_index();
        let mut queue: VecDeque<String> = ROOT_SECTIONS
            .iter()
            .filter_map(|s| self.manifest.get(*s).and_then(Value::as_object))
            .flat_map(|deps| {
                deps.iter()
                    .filter_map(|(name, spec)| spec.as_str().map(|s| format!("{name}@{s}")))
            })
            .collect();

        let mut seen = BTreeSet::new();
        while let Some(key) = queue.pop_front() {
            let Some(&i) = index.get(key.as_str()) else {
                continue;
            };
            if !seen.insert(i) {
                continue;
            }
            for section in NESTED_SECTIONS {
                for (dep, spec) in self.lock.entries[i].map(section) {
                    queue.push_back(format!("{dep}@{spec}"));
                }
            }
        }
        seen
    }
}

pub struct YarnDriver;

impl LockfileDriver for YarnDriver {
    fn manager(&self) -> PackageManager {
        PackageManager::Yarn
    }

    fn resolve(&self, ctx: &DriverContext<'_>, subpath: &Path) -> Result<Resolution> {
        let project = YarnProject::load(ctx, subpath)?;
        info!("Resolving yarn dependencies of {}", project.name);
        let repository = ctx.cache_repository()?;
        let reachable = project.reachable();

        let mut resolution = Resolution::new(&project.subpath);
        let mut package = PackageRecord::new(
            PackageType::Yarn,
            project.name.clone(),
            project
                .manifest
                .get("version")
                .and_then(Value::as_str)
                .unwrap_or_default(),
            project.subpath.clone(),
        );

        for (i, entry) in project.lock.entries.iter().enumerate() {
            let classified = project.classify(ctx, entry)?;
            if let Some(job) = classified.job(repository) {
                resolution.jobs.push(job);
            }
            if classified.origin == Origin::Registry {
                resolution.registry.push(RegistryArtifact::new(
                    RegistryLayout::Npm,
                    &classified.name,
                    &classified.version,
                    classified.integrity.iter().cloned().collect(),
                ));
            }
            debug!(
                "{} {} is a {} dependency",
                classified.name,
                classified.version,
                classified.origin.kind()
            );
            package.dependencies.push(
                DependencyRecord::new(
                    PackageType::Yarn,
                    &classified.name,
                    classified.record_version(),
                    classified.origin.clone(),
                )
                .with_dev(!reachable.contains(&i))
                .with_hashes(classified.integrity.into_iter().collect()),
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
        let mut project = YarnProject::load(ctx, &resolution.subpath)?;
        let repository = ctx.cache_repository()?;

        // old `name@spec` key -> mirrored version
        let mut replaced: BTreeMap<String, String> = BTreeMap::new();
        let mut updates = Vec::new();
        for (i, entry) in project.lock.entries.iter().enumerate() {
            let classified = project.classify(ctx, entry)?;
            let Some(job) = classified.job(repository) else {
                continue;
            };
            let artifact = mirrored_for(mirrored, &job)?;
            let version = artifact.version.clone().unwrap_or_default();
            for key in &entry.keys {
                replaced.insert(key.clone(), version.clone());
            }
            updates.push((i, classified.name, version, artifact.url.clone(), artifact.integrity()));
        }

        for (i, name, version, url, integrity) in updates {
            let entry = &mut project.lock.entries[i];
            entry.keys = vec![format!("{name}@{version}")];
            entry.set("version", version);
            entry.set("resolved", url);
            entry.set("integrity", integrity);
        }

        for entry in &mut project.lock.entries {
            for section in NESTED_SECTIONS {
                if let Some(map) = entry.map_mut(section) {
                    for (dep, spec) in map.iter_mut() {
                        if let Some(version) = replaced.get(&format!("{dep}@{spec}")) {
                            *spec = version.clone();
                        }
                    }
                }
            }
        }

        for section in SPEC_SECTIONS {
            let Some(specs) = project.manifest.get_mut(*section).and_then(Value::as_object_mut) else {
                continue;
            };
            for (name, spec) in specs.iter_mut() {
                let key = format!("{name}@{}", spec.as_str().unwrap_or_default());
                if let Some(version) = replaced.get(&key) {
                    *spec = Value::String(version.clone());
                }
            }
        }

        info!(
            "Pointed {} yarn dependencies of {} at the mirror",
            resolution.jobs.len(),
            project.name
        );
        Ok(vec![
            RewrittenFile {
                path: project.subpath.join("yarn.lock"),
                content: project.lock.to_string().into_bytes(),
            },
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
    use crate::hash::hash_bytes;
    use crate::mirror::{MirroredArtifact, PublishTarget};

    const SHA: &str = "0123456789abcdef0123456789abcdef01234567";

    fn lockfile() -> String {
        let integrity = hash_bytes(HashAlgorithm::Sha512, b"chalk").to_integrity();
        format!(
            r#"{HEADER}

"@scope/util@^1.0.0", "@scope/util@^1.2.0":
  version "1.2.3"
  resolved "https://registry.yarnpkg.com/@scope/util/-/util-1.2.3.tgz#{sha1}"
  integrity {integrity}
  dependencies:
    chalk "^4.0.0"

chalk@^4.0.0:
  version "4.1.0"
  resolved "https://registry.yarnpkg.com/chalk/-/chalk-4.1.0.tgz#{sha1}"
  integrity {integrity}

"lib@git+https://github.com/o/lib.git#{SHA}":
  version "2.0.0"
  resolved "git+https://github.com/o/lib.git#{SHA}"
  dependencies:
    chalk "^4.0.0"

mocha@^8.0.0:
  version "8.0.0"
  resolved "https://registry.yarnpkg.com/mocha/-/mocha-8.0.0.tgz#{sha1}"
"#,
            sha1 = "a".repeat(40),
        )
    }

    fn fixture() -> Fixture {
        let fx = Fixture::new(PackageManager::Yarn);
        fx.write(
            "package.json",
            &serde_json::json!({
                "name": "webapp",
                "version": "1.0.0",
                "dependencies": {
                    "@scope/util": "^1.0.0",
                    "lib": format!("git+https://github.com/o/lib.git#{SHA}")
                },
                "devDependencies": {"mocha": "^8.0.0"}
            })
            .to_string(),
        );
        fx.write("yarn.lock", &lockfile());
        fx
    }

    #[test]
    fn test_parse_and_serialize_roundtrip() {
        let content = lockfile();
        let lock = YarnLock::parse(&content).unwrap();
        assert_eq!(lock.entries.len(), 4);
        assert_eq!(lock.entries[0].keys, vec!["@scope/util@^1.0.0", "@scope/util@^1.2.0"]);
        assert_eq!(lock.entries[0].name().unwrap(), "@scope/util");
        assert_eq!(lock.entries[0].get("version"), Some("1.2.3"));
        assert_eq!(
            lock.entries[0].map("dependencies"),
            &[("chalk".to_string(), "^4.0.0".to_string())]
        );
        assert_eq!(lock.to_string(), content);
    }

    #[test]
    fn test_split_key() {
        assert_eq!(split_key("@s/n@^1.0").unwrap(), ("@s/n", "^1.0"));
        assert_eq!(
            split_key("x@git+ssh://git@host/x.git").unwrap(),
            ("x", "git+ssh://git@host/x.git")
        );
        assert!(split_key("nothing").is_err());
    }

    #[test]
    fn test_resolve_dev_and_origins() {
        let fx = fixture();
        let resolution = YarnDriver.resolve(&fx.ctx(), Path::new(".")).unwrap();
        let deps = &resolution.packages[0].dependencies;
        assert_eq!(deps.len(), 4);

        let by_name = |n: &str| deps.iter().find(|d| d.name == n).unwrap();
        assert!(!by_name("chalk").dev, "reached through @scope/util and lib");
        assert!(by_name("mocha").dev);
        assert_eq!(by_name("@scope/util").version, "1.2.3");
        assert_eq!(by_name("@scope/util").hashes[0].algorithm, HashAlgorithm::Sha512);
        assert_eq!(by_name("mocha").hashes[0].algorithm, HashAlgorithm::Sha1);
        assert_eq!(
            by_name("lib").version,
            format!("git+https://github.com/o/lib.git#{SHA}")
        );
        assert_eq!(resolution.jobs.len(), 1);
    }

    #[test]
    fn test_rewrite() {
        let fx = fixture();
        let resolution = YarnDriver.resolve(&fx.ctx(), Path::new(".")).unwrap();
        let job = &resolution.jobs[0];
        let component = job.component_name().unwrap();
        let PublishTarget::Npm { base_version, .. } = &job.target else {
            panic!("npm target expected");
        };
        let version = component.synthetic_version(base_version);
        assert_eq!(version, format!("2.0.0-external-gitcommit-{SHA}"));
        let mirrored: MirrorResults = [(
            component.to_string(),
            MirroredArtifact {
                component: component.clone(),
                url: "http://store.invalid/repository/cache/lib/-/lib.tgz".into(),
                version: Some(version.clone()),
                digest: hash_bytes(HashAlgorithm::Sha512, b"lib"),
                fetched: true,
            },
        )]
        .into_iter()
        .collect();

        let files = YarnDriver.apply_mirror(&fx.ctx(), &resolution, &mirrored).unwrap();
        let lock = YarnLock::parse(std::str::from_utf8(&files[0].content).unwrap()).unwrap();
        let lib = lock
            .entries
            .iter()
            .find(|e| e.name().unwrap() == "lib")
            .unwrap();
        assert_eq!(lib.keys, vec![format!("lib@{version}")]);
        assert_eq!(lib.get("resolved"), Some("http://store.invalid/repository/cache/lib/-/lib.tgz"));
        assert!(lib.get("integrity").unwrap().starts_with("sha512-"));

        let manifest: Value = serde_json::from_slice(&files[1].content).unwrap();
        assert_eq!(manifest["dependencies"]["lib"], Value::String(version));
        assert_eq!(manifest["dependencies"]["@scope/util"], "^1.0.0");
    }
}
