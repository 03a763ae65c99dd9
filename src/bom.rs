// src/bom.rs

//! Bill of materials for a request
//!
//! Packages are unique by (type, name, version, path). Adding an identical
//! package again is a no-op; adding a different package under the same key
//! is a duplicate-package error. Ordering is only guaranteed after
//! [`BillOfMaterials::sort`], which [`BillOfMaterials::write_to_file`] applies
//! before persisting:
//!
//! ```json
//! { "packages": [ { "name": "...", "type": "...", "version": "...",
//!                   "path": "web", "dependencies": [ ... ] } ] }
//! ```

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{DependencyRecord, PackageRecord, PackageType};
use crate::paths::display_relative;

/// The `(name, type, version)` a replaced dependency used to have
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplacedDependency {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: PackageType,
    pub version: String,
}

/// A dependency as persisted
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BomDependency {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: PackageType,
    pub version: String,
    #[serde(default)]
    pub dev: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replaces: Option<ReplacedDependency>,
}

impl BomDependency {
    fn sort_key(&self) -> (&str, bool, &str, &str) {
        (self.kind.as_str(), self.dev, &self.name, &self.version)
    }

    fn dedupe_key(&self) -> (PackageType, &str, &str, bool) {
        (self.kind, &self.name, &self.version, self.dev)
    }
}

impl From<&DependencyRecord> for BomDependency {
    fn from(record: &DependencyRecord) -> Self {
        Self {
            name: record.name.clone(),
            kind: record.kind,
            version: record.bom_version(),
            dev: record.dev,
            replaces: record.replaces.as_ref().map(|(name, version)| ReplacedDependency {
                name: name.clone(),
                kind: record.kind,
                version: version.clone(),
            }),
        }
    }
}

/// A package as persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BomPackage {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: PackageType,
    pub version: String,
    /// Omitted when the package lives at the source root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<BomDependency>,
}

type PackageKey = (PackageType, String, String, Option<String>);

impl BomPackage {
    fn key(&self) -> PackageKey {
        (
            self.kind,
            self.name.clone(),
            self.version.clone(),
            self.path.clone(),
        )
    }

    fn sort_key(&self) -> (&str, &str, &str, &str) {
        (
            self.kind.as_str(),
            &self.name,
            &self.version,
            self.path.as_deref().unwrap_or("."),
        )
    }
}

impl From<&PackageRecord> for BomPackage {
    fn from(record: &PackageRecord) -> Self {
        let path = display_relative(&record.path);
        Self {
            name: record.name.clone(),
            kind: record.kind,
            version: record.version.clone(),
            path: (path != ".").then_some(path),
            dependencies: record.dependencies.iter().map(BomDependency::from).collect(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct BomFile {
    #[serde(default)]
    packages: Vec<BomPackage>,
}

/// Aggregated packages for one request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BillOfMaterials {
    packages: Vec<BomPackage>,
    index: HashMap<PackageKey, usize>,
}

impl BillOfMaterials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn packages(&self) -> &[BomPackage] {
        &self.packages
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// Add one package, rejecting content-differing duplicates
    ///
    /// The package's own dependencies are deduplicated first, so two records
    /// that normalize to the same (type, name, version, dev) are stored once.
    pub fn add_package(&mut self, mut package: BomPackage) -> Result<()> {
        package.dependencies = dedupe_dependencies(std::mem::take(&mut package.dependencies));
        let key = package.key();
        if let Some(&existing) = self.index.get(&key) {
            if self.packages[existing] == package {
                debug!("Package {} {} already recorded", package.name, package.version);
                return Ok(());
            }
            return Err(Error::DuplicatePackage(format!(
                "{} {} {} at {}",
                package.kind,
                package.name,
                package.version,
                package.path.as_deref().unwrap_or(".")
            )));
        }
        self.index.insert(key, self.packages.len());
        self.packages.push(package);
        Ok(())
    }

    /// Add a driver-produced package record
    pub fn add_record(&mut self, record: &PackageRecord) -> Result<()> {
        self.add_package(BomPackage::from(record))
    }

    /// Merge every package of `other` into this one
    pub fn merge(&mut self, other: BillOfMaterials) -> Result<()> {
        for package in other.packages {
            self.add_package(package)?;
        }
        Ok(())
    }

    /// Sort packages, and every package's dependencies, into canonical order
    pub fn sort(&mut self) {
        for package in &mut self.packages {
            sort_dependencies(&mut package.dependencies);
        }
        self.packages.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        self.reindex();
    }

    fn reindex(&mut self) {
        self.index = self
            .packages
            .iter()
            .enumerate()
            .map(|(i, p)| (p.key(), i))
            .collect();
    }

    /// Every dependency of every package, deduplicated and sorted
    pub fn all_dependencies(&self) -> Vec<BomDependency> {
        let all = self
            .packages
            .iter()
            .flat_map(|p| p.dependencies.iter().cloned())
            .collect();
        let mut out = dedupe_dependencies(all);
        sort_dependencies(&mut out);
        out
    }

    /// Persist in canonical order
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let mut sorted = self.clone();
        sorted.sort();
        let file = BomFile {
            packages: sorted.packages,
        };
        let json = serde_json::to_string_pretty(&file)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)
            .map_err(|e| Error::IoError(format!("Failed to write {}: {e}", path.display())))?;
        Ok(())
    }

    /// Load a persisted bill of materials
    ///
    /// A missing file or a missing `packages` key yields an empty result.
    /// Uniqueness is re-validated while loading.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::IoError(format!("Failed to read {}: {e}", path.display())))?;
        let file: BomFile = serde_json::from_str(&content)?;
        let mut bom = Self::new();
        for package in file.packages {
            bom.add_package(package)?;
        }
        Ok(bom)
    }
}

/// Keep the first dependency seen for every (type, name, version, dev)
fn dedupe_dependencies(deps: Vec<BomDependency>) -> Vec<BomDependency> {
    let mut seen = BTreeSet::new();
    deps.into_iter()
        .filter(|dep| {
            let (kind, name, version, dev) = dep.dedupe_key();
            seen.insert((kind, name.to_string(), version.to_string(), dev))
        })
        .collect()
}

fn sort_dependencies(deps: &mut [BomDependency]) {
    deps.sort_by(|a, b| match a.sort_key().cmp(&b.sort_key()) {
        Ordering::Equal => a.replaces.cmp(&b.replaces),
        other => other,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn dep(kind: PackageType, name: &str, version: &str, dev: bool) -> BomDependency {
        BomDependency {
            name: name.to_string(),
            kind,
            version: version.to_string(),
            dev,
            replaces: None,
        }
    }

    fn package(name: &str, deps: Vec<BomDependency>) -> BomPackage {
        BomPackage {
            name: name.to_string(),
            kind: PackageType::Npm,
            version: "1.0.0".to_string(),
            path: None,
            dependencies: deps,
        }
    }

    #[test]
    fn test_identical_duplicate_is_noop() {
        let mut bom = BillOfMaterials::new();
        let pkg = package("web", vec![dep(PackageType::Npm, "a", "1", false)]);
        bom.add_package(pkg.clone()).unwrap();
        bom.add_package(pkg).unwrap();
        assert_eq!(bom.packages().len(), 1);
    }

    #[test]
    fn test_differing_duplicate_fails() {
        let mut bom = BillOfMaterials::new();
        bom.add_package(package("web", vec![dep(PackageType::Npm, "a", "1", false)]))
            .unwrap();
        let err = bom
            .add_package(package("web", vec![dep(PackageType::Npm, "b", "1", false)]))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicatePackage(_)));
    }

    #[test]
    fn test_same_package_different_path_is_distinct() {
        let mut bom = BillOfMaterials::new();
        bom.add_package(package("web", vec![])).unwrap();
        let mut other = package("web", vec![]);
        other.path = Some("sub".to_string());
        bom.add_package(other).unwrap();
        assert_eq!(bom.packages().len(), 2);
    }

    #[test]
    fn test_sort_order_and_idempotence() {
        let mut bom = BillOfMaterials::new();
        bom.add_package(package(
            "web",
            vec![
                dep(PackageType::Npm, "zeta", "1", false),
                dep(PackageType::Npm, "alpha", "2", true),
                dep(PackageType::Npm, "alpha", "1", false),
                dep(PackageType::GoPackage, "x", "1", false),
            ],
        ))
        .unwrap();
        bom.sort();
        let names: Vec<_> = bom.packages()[0]
            .dependencies
            .iter()
            .map(|d| format!("{}:{}:{}", d.kind, d.name, d.dev))
            .collect();
        assert_eq!(
            names,
            vec![
                "go-package:x:false",
                "npm:alpha:false",
                "npm:zeta:false",
                "npm:alpha:true"
            ]
        );

        let once = bom.clone();
        bom.sort();
        assert_eq!(bom, once);
    }

    #[test]
    fn test_write_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("packages.json");

        let mut bom = BillOfMaterials::new();
        let mut pkg = package("web", vec![dep(PackageType::Npm, "a", "1", false)]);
        pkg.path = Some("web".to_string());
        bom.add_package(pkg).unwrap();
        bom.add_package(package("api", vec![])).unwrap();
        bom.write_to_file(&path).unwrap();

        let loaded = BillOfMaterials::load(&path).unwrap();
        let mut expected = bom.clone();
        expected.sort();
        assert_eq!(loaded, expected);

        let raw = std::fs::read_to_string(&path).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(json["packages"][0].get("path").is_none());
        assert_eq!(json["packages"][1]["path"], "web");
    }

    #[test]
    fn test_load_tolerates_missing_file_and_key() {
        let dir = tempdir().unwrap();
        assert!(BillOfMaterials::load(&dir.path().join("nope.json")).unwrap().is_empty());

        let path = dir.path().join("empty.json");
        std::fs::write(&path, "{}").unwrap();
        assert!(BillOfMaterials::load(&path).unwrap().is_empty());
    }

    #[test]
    fn test_load_revalidates_uniqueness() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dup.json");
        std::fs::write(
            &path,
            r#"{"packages": [
                {"name": "a", "type": "npm", "version": "1", "dependencies": []},
                {"name": "a", "type": "npm", "version": "1",
                 "dependencies": [{"name": "b", "type": "npm", "version": "2"}]}
            ]}"#,
        )
        .unwrap();
        assert!(matches!(
            BillOfMaterials::load(&path),
            Err(Error::DuplicatePackage(_))
        ));
    }

    #[test]
    fn test_all_dependencies_dedupes() {
        let mut bom = BillOfMaterials::new();
        bom.add_package(package(
            "a",
            vec![
                dep(PackageType::Npm, "shared", "1", false),
                dep(PackageType::Npm, "only-a", "1", false),
            ],
        ))
        .unwrap();
        bom.add_package(package(
            "b",
            vec![
                dep(PackageType::Npm, "shared", "1", false),
                dep(PackageType::Npm, "shared", "1", true),
            ],
        ))
        .unwrap();
        let all = bom.all_dependencies();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].name, "only-a");
        assert_eq!(all[1].name, "shared");
        assert!(!all[1].dev);
        assert!(all[2].dev);
    }

    #[test]
    fn test_package_dependencies_are_deduplicated() {
        let mut bom = BillOfMaterials::new();
        bom.add_package(package(
            "web",
            vec![
                dep(PackageType::Pip, "foo-bar", "1.0.0", false),
                dep(PackageType::Pip, "foo-bar", "1.0.0", false),
                dep(PackageType::Pip, "foo-bar", "1.0.0", true),
            ],
        ))
        .unwrap();
        let deps = &bom.packages()[0].dependencies;
        assert_eq!(deps.len(), 2);
        assert!(!deps[0].dev);
        assert!(deps[1].dev);

        // the deduplicated form compares equal to a re-add carrying the duplicate
        bom.add_package(package(
            "web",
            vec![
                dep(PackageType::Pip, "foo-bar", "1.0.0", false),
                dep(PackageType::Pip, "foo-bar", "1.0.0", true),
                dep(PackageType::Pip, "foo-bar", "1.0.0", true),
            ],
        ))
        .unwrap();
        assert_eq!(bom.packages().len(), 1);
    }

    #[test]
    fn test_load_deduplicates_persisted_dependencies() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("packages.json");
        std::fs::write(
            &path,
            r#"{"packages": [{"name": "a", "type": "pip", "version": "1", "dependencies": [
                {"name": "b", "type": "pip", "version": "2"},
                {"name": "b", "type": "pip", "version": "2", "dev": false}
            ]}]}"#,
        )
        .unwrap();
        let bom = BillOfMaterials::load(&path).unwrap();
        assert_eq!(bom.packages()[0].dependencies.len(), 1);
    }

    fn parts() -> (BillOfMaterials, BillOfMaterials) {
        let mut npm = BillOfMaterials::new();
        npm.add_package(package(
            "web",
            vec![
                dep(PackageType::Npm, "zeta", "1", true),
                dep(PackageType::Npm, "alpha", "1", false),
            ],
        ))
        .unwrap();
        npm.add_package(package("admin", vec![dep(PackageType::Npm, "beta", "3", false)]))
            .unwrap();

        let mut pip = BillOfMaterials::new();
        let mut api = package(
            "api",
            vec![
                dep(PackageType::Pip, "requests", "2.31.0", false),
                dep(PackageType::Pip, "attrs", "23.1.0", false),
            ],
        );
        api.kind = PackageType::Pip;
        api.path = Some("api".to_string());
        pip.add_package(api).unwrap();
        (npm, pip)
    }

    #[test]
    fn test_sort_commutes_with_merge() {
        let (npm, pip) = parts();

        let mut merged_then_sorted = npm.clone();
        merged_then_sorted.merge(pip.clone()).unwrap();
        merged_then_sorted.sort();

        let (mut sorted_npm, mut sorted_pip) = (npm.clone(), pip.clone());
        sorted_npm.sort();
        sorted_pip.sort();
        let mut sorted_then_merged = sorted_pip;
        sorted_then_merged.merge(sorted_npm).unwrap();
        sorted_then_merged.sort();

        assert_eq!(merged_then_sorted, sorted_then_merged);

        let dir = tempdir().unwrap();
        let (a, b) = (dir.path().join("a.json"), dir.path().join("b.json"));
        merged_then_sorted.write_to_file(&a).unwrap();
        sorted_then_merged.write_to_file(&b).unwrap();
        assert_eq!(
            std::fs::read_to_string(a).unwrap(),
            std::fs::read_to_string(b).unwrap()
        );
    }
}
