// src/config.rs

//! Configuration file parsing for the staging engine
//!
//! Supports TOML configuration files with the following sections:
//! - [worker] - Directories, database, mirror concurrency, request lifetime, task lease
//! - [store] - Artifact store URL, credentials, repository naming
//! - [retry] - Backoff policy for transient failures
//! - [gomod], [npm], [pip], [rubygems] - Per-ecosystem settings
//! - [env.<manager>] - Default environment variables emitted per package manager
//!
//! Every field has a default, so an empty file is a valid configuration.

use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::emit::EnvVar;
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

/// Floor for `worker.min_request_lifetime`; a bundle must outlive its own staging
pub const MIN_REQUEST_LIFETIME: Duration = Duration::from_secs(60 * 60);

/// TOML configuration file structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub worker: WorkerSection,

    #[serde(default)]
    pub store: StoreSection,

    #[serde(default)]
    pub retry: RetrySection,

    #[serde(default)]
    pub gomod: GomodSection,

    #[serde(default)]
    pub npm: NpmSection,

    #[serde(default)]
    pub pip: PipSection,

    #[serde(default)]
    pub rubygems: RubygemsSection,

    /// Default environment variables keyed by package manager name
    #[serde(default)]
    pub env: HashMap<String, BTreeMap<String, EnvVar>>,
}

/// Worker configuration section
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSection {
    /// Root of per-request bundle directories
    #[serde(default = "default_bundles_dir")]
    pub bundles_dir: PathBuf,

    /// SQLite database holding requests and the task queue
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Parallel fetch/publish jobs per stage
    #[serde(default = "default_mirror_concurrency")]
    pub mirror_concurrency: usize,

    /// Deadline for go/git/npm subprocesses (e.g., "1h")
    #[serde(default = "default_subprocess_timeout")]
    pub subprocess_timeout: String,

    /// Age after which complete requests become stale (e.g., "1d")
    #[serde(default = "default_request_lifetime")]
    pub request_lifetime: String,

    /// Shortest lifetime an operator may configure, never below [`MIN_REQUEST_LIFETIME`]
    #[serde(default = "default_min_request_lifetime")]
    pub min_request_lifetime: String,

    /// How long a claimed task may run before another worker reclaims it
    #[serde(default = "default_task_lease")]
    pub task_lease: String,

    /// Claims per task before a lapsed lease fails the request instead
    #[serde(default = "default_task_attempts")]
    pub task_attempts: u32,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            bundles_dir: default_bundles_dir(),
            db_path: default_db_path(),
            mirror_concurrency: default_mirror_concurrency(),
            subprocess_timeout: default_subprocess_timeout(),
            request_lifetime: default_request_lifetime(),
            min_request_lifetime: default_min_request_lifetime(),
            task_lease: default_task_lease(),
            task_attempts: default_task_attempts(),
        }
    }
}

fn default_bundles_dir() -> PathBuf {
    PathBuf::from("/var/lib/depstage/bundles")
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/depstage/depstage.db")
}

fn default_mirror_concurrency() -> usize {
    4
}

fn default_subprocess_timeout() -> String {
    "1h".to_string()
}

fn default_request_lifetime() -> String {
    "1d".to_string()
}

fn default_min_request_lifetime() -> String {
    "1h".to_string()
}

fn default_task_lease() -> String {
    "4h".to_string()
}

fn default_task_attempts() -> u32 {
    3
}

/// Artifact store configuration section
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    /// Base URL of the repository manager
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Administrative account used to manage repositories and credentials
    #[serde(default = "default_store_username")]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// CA bundle used to reach the store and emitted to the build
    #[serde(default)]
    pub ca_cert: Option<PathBuf>,

    /// Prefix for every per-request repository and credential
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// HTTP timeout (e.g., "30s")
    #[serde(default = "default_store_timeout")]
    pub timeout: String,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            username: default_store_username(),
            password: String::new(),
            ca_cert: None,
            prefix: default_prefix(),
            timeout: default_store_timeout(),
        }
    }
}

fn default_store_url() -> String {
    "http://localhost:8081".to_string()
}

fn default_store_username() -> String {
    "depstage".to_string()
}

fn default_prefix() -> String {
    "depstage-".to_string()
}

fn default_store_timeout() -> String {
    "30s".to_string()
}

/// Retry policy section
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_delay")]
    pub initial_delay: String,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    #[serde(default = "default_max_delay")]
    pub max_delay: String,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            backoff_factor: default_backoff_factor(),
            max_delay: default_max_delay(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay() -> String {
    "1s".to_string()
}

fn default_backoff_factor() -> f64 {
    1.3
}

fn default_max_delay() -> String {
    "1m".to_string()
}

/// Go modules section
#[derive(Debug, Clone, Deserialize)]
pub struct GomodSection {
    /// Upstream module proxy
    #[serde(default = "default_goproxy")]
    pub proxy_url: String,

    /// Allow-listed local replacements outside the source tree, by module path
    #[serde(default)]
    pub file_deps_allowlist: HashMap<String, Vec<String>>,

    /// Verify checksums against the public sum database
    #[serde(default = "default_true")]
    pub sumdb: bool,
}

impl Default for GomodSection {
    fn default() -> Self {
        Self {
            proxy_url: default_goproxy(),
            file_deps_allowlist: HashMap::new(),
            sumdb: true,
        }
    }
}

fn default_goproxy() -> String {
    "https://proxy.golang.org".to_string()
}

fn default_true() -> bool {
    true
}

/// npm and yarn section
#[derive(Debug, Clone, Deserialize)]
pub struct NpmSection {
    /// Name of the store's proxy repository for the public npm registry
    #[serde(default = "default_npm_proxy_repo")]
    pub proxy_repo: String,

    /// Shared hosted repository caching mirrored non-registry packages
    #[serde(default = "default_npm_cache_repo")]
    pub cache_repo: String,

    /// Allow-listed `file:` dependencies outside the tree, by top-level package name
    #[serde(default)]
    pub file_deps_allowlist: HashMap<String, Vec<String>>,
}

impl Default for NpmSection {
    fn default() -> Self {
        Self {
            proxy_repo: default_npm_proxy_repo(),
            cache_repo: default_npm_cache_repo(),
            file_deps_allowlist: HashMap::new(),
        }
    }
}

fn default_npm_proxy_repo() -> String {
    "depstage-js".to_string()
}

fn default_npm_cache_repo() -> String {
    "depstage-js-hosted".to_string()
}

/// Python section
#[derive(Debug, Clone, Deserialize)]
pub struct PipSection {
    /// Name of the store's proxy repository for PyPI
    #[serde(default = "default_pypi_proxy_repo")]
    pub proxy_repo: String,

    /// Shared raw repository caching mirrored VCS and URL requirements
    #[serde(default = "default_pip_cache_repo")]
    pub cache_repo: String,
}

impl Default for PipSection {
    fn default() -> Self {
        Self {
            proxy_repo: default_pypi_proxy_repo(),
            cache_repo: default_pip_cache_repo(),
        }
    }
}

fn default_pypi_proxy_repo() -> String {
    "depstage-pip".to_string()
}

fn default_pip_cache_repo() -> String {
    "depstage-pip-raw".to_string()
}

/// Ruby section
#[derive(Debug, Clone, Deserialize)]
pub struct RubygemsSection {
    /// Name of the store's proxy repository for rubygems.org
    #[serde(default = "default_rubygems_proxy_repo")]
    pub proxy_repo: String,

    /// Shared raw repository caching mirrored git gems
    #[serde(default = "default_rubygems_cache_repo")]
    pub cache_repo: String,
}

impl Default for RubygemsSection {
    fn default() -> Self {
        Self {
            proxy_repo: default_rubygems_proxy_repo(),
            cache_repo: default_rubygems_cache_repo(),
        }
    }
}

fn default_rubygems_proxy_repo() -> String {
    "depstage-rubygems".to_string()
}

fn default_rubygems_cache_repo() -> String {
    "depstage-rubygems-raw".to_string()
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("Failed to read config file {}: {e}", path.display()))
        })?;
        let mut config = Self::from_toml(&content)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML text without validating it
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| Error::ConfigError(format!("Failed to parse config: {e}")))
    }

    /// Replace file values with `DEPSTAGE_*` environment overrides
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("DEPSTAGE_STORE_URL") {
            self.store.url = url;
        }
        if let Some(username) = lookup("DEPSTAGE_STORE_USERNAME") {
            self.store.username = username;
        }
        if let Some(password) = lookup("DEPSTAGE_STORE_PASSWORD") {
            self.store.password = password;
        }
        if let Some(db_path) = lookup("DEPSTAGE_DB_PATH") {
            self.worker.db_path = PathBuf::from(db_path);
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.worker.mirror_concurrency == 0 {
            return Err(Error::ConfigError(
                "worker.mirror_concurrency must be at least 1".to_string(),
            ));
        }

        let store_url = url::Url::parse(&self.store.url)
            .map_err(|e| Error::ConfigError(format!("Invalid store.url: {e}")))?;
        if !matches!(store_url.scheme(), "http" | "https") {
            return Err(Error::ConfigError(format!(
                "store.url must be http or https, got {}",
                store_url.scheme()
            )));
        }

        if self.retry.max_attempts == 0 {
            return Err(Error::ConfigError(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }

        self.subprocess_timeout()?;
        self.store_timeout()?;
        self.retry_policy()?;

        let floor = parse_duration(&self.worker.min_request_lifetime)?;
        if floor < MIN_REQUEST_LIFETIME {
            return Err(Error::ConfigError(format!(
                "worker.min_request_lifetime must be at least {}s",
                MIN_REQUEST_LIFETIME.as_secs()
            )));
        }
        let lifetime = parse_duration(&self.worker.request_lifetime)?;
        if lifetime < floor {
            return Err(Error::ConfigError(format!(
                "worker.request_lifetime must be at least {}s",
                floor.as_secs()
            )));
        }

        if self.worker.task_attempts == 0 {
            return Err(Error::ConfigError(
                "worker.task_attempts must be at least 1".to_string(),
            ));
        }
        if self.task_lease()? <= self.subprocess_timeout()? {
            return Err(Error::ConfigError(
                "worker.task_lease must be longer than worker.subprocess_timeout".to_string(),
            ));
        }

        Ok(())
    }

    pub fn subprocess_timeout(&self) -> Result<Duration> {
        parse_duration(&self.worker.subprocess_timeout)
    }

    pub fn store_timeout(&self) -> Result<Duration> {
        parse_duration(&self.store.timeout)
    }

    /// Configured lifetime floor, never below [`MIN_REQUEST_LIFETIME`]
    pub fn min_request_lifetime(&self) -> Result<Duration> {
        Ok(parse_duration(&self.worker.min_request_lifetime)?.max(MIN_REQUEST_LIFETIME))
    }

    /// Effective request lifetime, never below [`Self::min_request_lifetime`]
    pub fn request_lifetime(&self) -> Result<Duration> {
        Ok(parse_duration(&self.worker.request_lifetime)?.max(self.min_request_lifetime()?))
    }

    pub fn task_lease(&self) -> Result<Duration> {
        parse_duration(&self.worker.task_lease)
    }

    pub fn retry_policy(&self) -> Result<RetryPolicy> {
        Ok(RetryPolicy {
            max_attempts: self.retry.max_attempts,
            initial_delay: parse_duration(&self.retry.initial_delay)?,
            backoff_factor: self.retry.backoff_factor,
            max_delay: parse_duration(&self.retry.max_delay)?,
        })
    }

    /// Default environment variables for one package manager
    pub fn default_env(&self, manager: &str) -> BTreeMap<String, EnvVar> {
        self.env.get(manager).cloned().unwrap_or_default()
    }
}

/// Parse a human-readable duration string (e.g., "15m", "1h", "30s")
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim().to_lowercase();

    let (num_str, multiplier) = if let Some(n) = s.strip_suffix('d') {
        (n, 24 * 60 * 60)
    } else if let Some(n) = s.strip_suffix('h') {
        (n, 60 * 60)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 60)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, 1)
    } else {
        // Assume seconds
        (s.as_str(), 1)
    };

    let num: u64 = num_str
        .trim()
        .parse()
        .map_err(|_| Error::ConfigError(format!("Invalid duration: {s}")))?;

    Ok(Duration::from_secs(num * multiplier))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emit::EnvVarKind;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("15m").unwrap(), Duration::from_secs(15 * 60));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("2d").unwrap(), Duration::from_secs(2 * 24 * 3600));
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.store.prefix, "depstage-");
        assert_eq!(config.worker.mirror_concurrency, 4);
        assert_eq!(config.retry_policy().unwrap().max_attempts, 5);
    }

    #[test]
    fn test_empty_toml_is_valid() {
        let config = EngineConfig::from_toml("").unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
[worker]
bundles_dir = "/srv/bundles"
mirror_concurrency = 2
request_lifetime = "3d"

[store]
url = "https://nexus.example.com"
password = "secret"

[gomod]
file_deps_allowlist = { "example.com/app" = ["example.com/lib/*"] }

[env.gomod]
GOFLAGS = { value = "-mod=mod", kind = "literal" }
"#;
        let config = EngineConfig::from_toml(toml_str).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.worker.bundles_dir, PathBuf::from("/srv/bundles"));
        assert_eq!(config.worker.mirror_concurrency, 2);
        assert_eq!(config.request_lifetime().unwrap(), Duration::from_secs(3 * 86400));
        assert_eq!(
            config.gomod.file_deps_allowlist["example.com/app"],
            vec!["example.com/lib/*".to_string()]
        );
        let env = config.default_env("gomod");
        assert_eq!(env["GOFLAGS"].value, "-mod=mod");
        assert_eq!(env["GOFLAGS"].kind, EnvVarKind::Literal);
    }

    #[test]
    fn test_validation_failures() {
        let mut config = EngineConfig::default();
        config.worker.mirror_concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.store.url = "ftp://store".to_string();
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.worker.request_lifetime = "5m".to_string();
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.worker.task_lease = "30m".to_string();
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.worker.task_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_min_request_lifetime() {
        let config = EngineConfig::from_toml(
            r#"
[worker]
min_request_lifetime = "12h"
request_lifetime = "6h"
"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
        assert_eq!(config.request_lifetime().unwrap(), Duration::from_secs(12 * 3600));

        let mut config = EngineConfig::default();
        config.worker.min_request_lifetime = "10m".to_string();
        assert!(config.validate().is_err());
        assert_eq!(config.min_request_lifetime().unwrap(), MIN_REQUEST_LIFETIME);

        config.worker.min_request_lifetime = "2h".to_string();
        config.worker.request_lifetime = "2h".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = EngineConfig::default();
        config.apply_env_overrides(|key| match key {
            "DEPSTAGE_STORE_URL" => Some("https://override".to_string()),
            "DEPSTAGE_DB_PATH" => Some("/tmp/x.db".to_string()),
            _ => None,
        });
        assert_eq!(config.store.url, "https://override");
        assert_eq!(config.worker.db_path, PathBuf::from("/tmp/x.db"));
        assert_eq!(config.store.username, "depstage");
    }
}
