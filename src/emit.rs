// src/emit.rs

//! Runtime configuration emitted for the downstream build
//!
//! Every stage produces a [`RuntimeConfig`]: files the build must place
//! (base64 content at a path relative to the bundle root) and environment
//! variables, either literal values or paths relative to the bundle root.
//! The per-manager configs are merged into one `config.json` at assembly.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

/// File name of the registry CA emitted for npm and yarn
pub const NPM_CA_FILE: &str = "registry-ca.pem";

/// File name of the index CA emitted for pip
pub const PIP_CA_FILE: &str = "package-index-ca.pem";

/// How the build should interpret an environment variable value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvVarKind {
    #[default]
    Literal,
    /// Relative to the bundle root
    Path,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub value: String,
    #[serde(default)]
    pub kind: EnvVarKind,
}

impl EnvVar {
    pub fn literal(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            kind: EnvVarKind::Literal,
        }
    }

    pub fn path(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            kind: EnvVarKind::Path,
        }
    }
}

/// A file to create in the build's working tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Relative to the bundle root
    pub path: String,
    /// Base64-encoded content
    pub content: String,
    #[serde(rename = "type")]
    pub encoding: String,
}

impl ConfigFile {
    pub fn from_bytes(path: &Path, content: &[u8]) -> Self {
        Self {
            path: crate::paths::display_relative(&path.components().collect::<PathBuf>()),
            content: BASE64.encode(content),
            encoding: "base64".to_string(),
        }
    }

    pub fn from_text(path: &Path, content: &str) -> Self {
        Self::from_bytes(path, content.as_bytes())
    }

    pub fn decode(&self) -> Result<Vec<u8>> {
        if self.encoding != "base64" {
            return Err(Error::ParseError(format!(
                "Unsupported config file encoding {} for {}",
                self.encoding, self.path
            )));
        }
        BASE64
            .decode(&self.content)
            .map_err(|e| Error::ParseError(format!("Invalid base64 in {}: {e}", self.path)))
    }
}

/// Files and environment for one stage, or for a whole request once merged
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub config_files: Vec<ConfigFile>,
    #[serde(default)]
    pub environment_variables: BTreeMap<String, EnvVar>,
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.config_files.is_empty() && self.environment_variables.is_empty()
    }

    /// Add a file, replacing any earlier file at the same path
    pub fn add_file(&mut self, file: ConfigFile) {
        self.config_files.retain(|f| f.path != file.path);
        self.config_files.push(file);
    }

    pub fn set_env(&mut self, name: impl Into<String>, var: EnvVar) {
        self.environment_variables.insert(name.into(), var);
    }

    /// Fill in configured defaults; values already emitted win
    pub fn with_defaults(mut self, defaults: &BTreeMap<String, EnvVar>) -> Self {
        for (name, var) in defaults {
            self.environment_variables
                .entry(name.clone())
                .or_insert_with(|| var.clone());
        }
        self
    }

    /// Merge a later stage's config into this one
    pub fn merge(&mut self, other: RuntimeConfig) {
        for file in other.config_files {
            self.add_file(file);
        }
        self.environment_variables.extend(other.environment_variables);
    }

    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let mut config = self.clone();
        config.config_files.sort_by(|a, b| a.path.cmp(&b.path));
        let json = serde_json::to_string_pretty(&config)?;
        std::fs::write(path, json).map_err(|e| {
            Error::IoError(format!("Failed to write {}: {e}", path.display()))
        })
    }

    /// Load a config; a missing file is empty
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Embed credentials in an http(s) URL
pub fn url_with_credentials(raw: &str, username: &str, password: &str) -> Result<String> {
    let mut url = url::Url::parse(raw)
        .map_err(|e| Error::ConfigError(format!("Invalid store URL {raw}: {e}")))?;
    url.set_username(username)
        .and_then(|_| url.set_password(Some(password)))
        .map_err(|_| Error::ConfigError(format!("Cannot add credentials to {raw}")))?;
    Ok(url.to_string())
}

/// Path from a package directory back to a file at the source root
pub fn relative_to_source_root(subpath: &Path, file_name: &str) -> String {
    let depth = subpath
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .count();
    let mut out = "../".repeat(depth);
    out.push_str(file_name);
    out
}

/// Content of the `.npmrc` pointing npm at the request's proxy repository
pub fn npmrc(proxy_url: &str, username: &str, password: &str, cafile: Option<&str>) -> String {
    let token = BASE64.encode(format!("{username}:{password}"));
    let schemeless = proxy_url
        .split_once(':')
        .map(|(_, rest)| rest)
        .unwrap_or(proxy_url);

    let mut out = format!(
        "registry={proxy_url}\n\
         email=noreply@depstage.local\n\
         always-auth=true\n\
         {schemeless}:_auth={token}\n\
         fetch-retries=5\n\
         fetch-retry-factor=2\n\
         strict-ssl=true\n"
    );
    if let Some(cafile) = cafile {
        out.push_str(&format!("cafile=\"{cafile}\"\n"));
    }
    out
}

/// npm/yarn config: one `.npmrc` per package directory plus the optional CA
pub fn npm_config(
    proxy_url: &str,
    username: &str,
    password: &str,
    ca_cert: Option<&str>,
    subpaths: &[&Path],
) -> RuntimeConfig {
    let mut config = RuntimeConfig::new();
    if let Some(pem) = ca_cert {
        config.add_file(ConfigFile::from_text(
            &Path::new("app").join(NPM_CA_FILE),
            pem,
        ));
    }
    for subpath in subpaths {
        let cafile = ca_cert.map(|_| relative_to_source_root(subpath, NPM_CA_FILE));
        let content = npmrc(proxy_url, username, password, cafile.as_deref());
        let path = Path::new("app").join(subpath).join(".npmrc");
        config.add_file(ConfigFile::from_text(&path, &content));
    }
    config
}

/// pip config: the index URL with credentials and the optional CA
pub fn pip_config(index_url: &str, ca_cert: Option<&str>) -> RuntimeConfig {
    let mut config = RuntimeConfig::new();
    config.set_env("PIP_INDEX_URL", EnvVar::literal(index_url));
    if let Some(pem) = ca_cert {
        let path = Path::new("app").join(PIP_CA_FILE);
        config.add_file(ConfigFile::from_text(&path, pem));
        config.set_env("PIP_CERT", EnvVar::path(crate::paths::display_relative(&path)));
    }
    config
}

/// Go config: the populated module cache under `deps/gomod`, network off
pub fn gomod_config(vendored: bool, cgo_disabled: bool) -> RuntimeConfig {
    let mut config = RuntimeConfig::new();
    config.set_env("GOPATH", EnvVar::path("deps/gomod"));
    config.set_env("GOMODCACHE", EnvVar::path("deps/gomod/pkg/mod"));
    config.set_env("GOCACHE", EnvVar::path("deps/gomod"));
    config.set_env("GOPROXY", EnvVar::literal("off"));
    let goflags = if vendored { "-mod=vendor" } else { "-mod=mod" };
    config.set_env("GOFLAGS", EnvVar::literal(goflags));
    if cgo_disabled {
        config.set_env("CGO_ENABLED", EnvVar::literal("0"));
    }
    config
}

/// Key bundler uses for a local git override of `name`
pub fn bundler_local_key(name: &str) -> String {
    format!(
        "BUNDLE_LOCAL__{}",
        name.to_uppercase().replace('-', "___").replace('.', "__")
    )
}

/// Content of `.bundle/config`; `git_locals` pairs gem names with paths relative to the package
pub fn bundler_config(mirror_url: &str, git_locals: &[(String, String)]) -> String {
    let mut out = format!(
        "---\n\
         BUNDLE_MIRROR__ALL: \"{mirror_url}\"\n\
         BUNDLE_MIRROR__ALL__FALLBACK_TIMEOUT: \"false\"\n\
         BUNDLE_FORCE_RUBY_PLATFORM: \"true\"\n\
         BUNDLE_DEPLOYMENT: \"true\"\n\
         BUNDLE_FROZEN: \"true\"\n\
         BUNDLE_DISABLE_LOCAL_BRANCH_CHECK: \"true\"\n"
    );
    for (name, path) in git_locals {
        out.push_str(&format!("{}: \"{path}\"\n", bundler_local_key(name)));
    }
    out
}
