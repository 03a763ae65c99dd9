// src/drivers/js.rs

//! Locator handling shared by the npm and yarn drivers

use std::path::Path;
use url::Url;

use crate::classify::{classify_local, classify_url, classify_vcs};
use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::mirror::MirrorJob;
use crate::model::Origin;

/// Hosts serving the public npm registry
pub const NPM_REGISTRY_HOSTS: &[&str] = &["registry.npmjs.org", "registry.yarnpkg.com"];

/// Locator prefixes naming a git dependency
const GIT_PREFIXES: &[&str] = &[
    "git://",
    "git+http://",
    "git+https://",
    "git+ssh://",
    "github:",
    "gitlab:",
    "bitbucket:",
];

pub fn is_git_locator(locator: &str) -> bool {
    GIT_PREFIXES.iter().any(|p| locator.starts_with(p))
}

pub fn is_file_locator(locator: &str) -> bool {
    locator.starts_with("file:") || locator.starts_with("link:")
}

pub fn is_http_locator(locator: &str) -> bool {
    locator.starts_with("http://") || locator.starts_with("https://")
}

/// Whether an http(s) URL points at the public registry
pub fn is_registry_url(locator: &str) -> bool {
    Url::parse(locator)
        .ok()
        .and_then(|u| u.host_str().map(|h| NPM_REGISTRY_HOSTS.contains(&h)))
        .unwrap_or(false)
}

/// Split a git locator into a clonable URL and the ref after `#`
pub fn parse_git_locator(locator: &str) -> Result<(String, String)> {
    let (repo, reference) = locator.rsplit_once('#').ok_or_else(|| {
        Error::ValidationError(format!(
            "The git dependency {locator} does not name a commit"
        ))
    })?;

    for host in ["github", "gitlab", "bitbucket"] {
        if let Some(path) = repo.strip_prefix(&format!("{host}:")) {
            let path = path.trim_end_matches(".git");
            let tld = if host == "bitbucket" { "org" } else { "com" };
            return Ok((format!("https://{host}.{tld}/{path}.git"), reference.to_string()));
        }
    }

    let url = repo.strip_prefix("git+").unwrap_or(repo);
    Ok((url.to_string(), reference.to_string()))
}

/// Version the synthetic mirror version is derived from
pub fn base_version(version: &str) -> String {
    match semver::Version::parse(version) {
        Ok(_) => version.to_string(),
        Err(_) => "0.0.0".to_string(),
    }
}

/// Classifies npm and yarn locators for one package directory
pub struct JsClassifier<'a> {
    pub package_dir: &'a Path,
    pub source_root: &'a Path,
    /// `file:` dependencies allowed outside the tree, by name or path
    pub allowlist: &'a [String],
}

impl JsClassifier<'_> {
    /// Assign an origin to `locator`; `integrity` pins http(s) tarballs
    pub fn origin(&self, name: &str, locator: &str, integrity: Option<&Hash>) -> Result<Origin> {
        if let Some(path) = locator
            .strip_prefix("file:")
            .or_else(|| locator.strip_prefix("link:"))
        {
            let allowlisted = self.allowlist.iter().any(|a| a == name || a == path);
            return classify_local(name, path, self.package_dir, self.source_root, allowlisted);
        }

        if is_git_locator(locator) {
            let (url, reference) = parse_git_locator(locator)?;
            return classify_vcs(name, &url, &reference);
        }

        if is_http_locator(locator) {
            if is_registry_url(locator) {
                return Ok(Origin::Registry);
            }
            let integrity = integrity.ok_or_else(|| {
                Error::ValidationError(format!(
                    "The dependency {name} from {locator} is missing an integrity value"
                ))
            })?;
            return classify_url(name, locator, std::slice::from_ref(integrity));
        }

        Ok(Origin::Registry)
    }
}

/// Mirror job for an npm-style dependency, `None` when nothing is mirrored
pub fn npm_job(name: &str, version: &str, origin: &Origin, repository: &str) -> Option<MirrorJob> {
    origin.needs_mirror().then(|| {
        MirrorJob::npm(
            name,
            base_version(version),
            origin.clone(),
            Vec::new(),
            repository,
        )
    })
}
