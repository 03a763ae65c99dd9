// src/drivers/pip/requirements.rs

//! pip requirements files
//!
//! Lines ending in `\` are joined with the next one and `#` comments are
//! dropped. Each remaining line splits into global options, per-requirement
//! options (`--hash`, `-e`) and the requirement itself, which is one of:
//!
//! - `name[extras]==1.0 ; marker` from the package index
//! - `name @ git+https://host/repo.git@<commit>` from version control
//! - `name @ https://host/file.tar.gz#hash=sha256:<hex>` from a direct URL

use regex::Regex;
use std::fmt;
use std::path::Path;
use std::sync::LazyLock;
use tracing::info;
use url::Url;

use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::scm::is_full_commit;

use super::metadata::canonicalize_name;

/// Known options and whether they take a value
const OPTIONS: &[(&str, bool)] = &[
    ("--constraint", true),
    ("--editable", false),
    ("--extra-index-url", true),
    ("--find-links", true),
    ("--index-url", true),
    ("--no-binary", true),
    ("--no-index", false),
    ("--only-binary", true),
    ("--pre", false),
    ("--prefer-binary", false),
    ("--require-hashes", false),
    ("--requirement", true),
    ("--trusted-host", true),
    ("--use-feature", true),
    ("-c", true),
    ("-e", false),
    ("-f", true),
    ("--hash", true),
    ("-i", true),
    ("-r", true),
];

/// Options that apply to the requirement on their line only
const REQUIREMENT_OPTIONS: &[&str] = &["-e", "--editable", "--hash"];

/// Global options that would let pip reach outside the staged index
const REJECTED_OPTIONS: &[&str] = &[
    "-i",
    "--index-url",
    "--extra-index-url",
    "--no-index",
    "-f",
    "--find-links",
    "--only-binary",
    "-r",
    "--requirement",
    "-c",
    "--constraint",
];

const URL_SCHEMES: &[&str] = &["http", "https", "ftp"];

const VCS_SCHEMES: &[&str] = &[
    "bzr", "bzr+ftp", "bzr+http", "bzr+https", "git", "git+ftp", "git+http", "git+https",
    "git+ssh", "hg", "hg+ftp", "hg+http", "hg+https", "svn", "svn+ftp", "svn+http", "svn+https",
];

static LINE_COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(^|\s)#.*$").expect("valid regex"));

static NAMED_URL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"@.+://").expect("valid regex"));

static PYPI_REQUIREMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z0-9][A-Za-z0-9._-]*)\s*(?:\[([^\]]*)\])?\s*(.*)$").expect("valid regex")
});

static VERSION_SPEC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(===|==|!=|<=|>=|~=|<|>)\s*([A-Za-z0-9_.*+!-]+)$").expect("valid regex")
});

static GIT_REF_IN_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@[0-9a-fA-F]{40}$").expect("valid regex"));

/// Where a requirement is downloaded from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequirementKind {
    Pypi,
    Url,
    Vcs,
}

/// One requirement line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub kind: RequirementKind,
    /// Name as written
    pub raw_name: String,
    pub extras: Vec<String>,
    /// `(operator, version)` pairs
    pub specs: Vec<(String, String)>,
    pub marker: Option<String>,
    /// Direct URL without the fragment (URL and VCS kinds)
    pub url: Option<String>,
    /// `key=value` pairs from the URL fragment, in order
    pub qualifiers: Vec<(String, String)>,
    /// `--hash` values as written, `algo:hex`
    pub hashes: Vec<String>,
    /// Per-requirement options other than `--hash`
    pub options: Vec<String>,
}

impl Requirement {
    /// Parse a requirement line stripped of its options
    pub fn parse(line: &str, options: Vec<String>) -> Result<Self> {
        let (hashes, options) = split_hashes(options);
        let mut requirement = match direct_access_kind(line)? {
            Some(kind) => parse_direct(line, kind)?,
            None => parse_pypi(line)?,
        };
        requirement.hashes = hashes;
        requirement.options = options;
        Ok(requirement)
    }

    pub fn canonical_name(&self) -> String {
        canonicalize_name(&self.raw_name)
    }

    /// The exact version of a pinned index requirement
    pub fn pinned_version(&self) -> Option<&str> {
        match self.specs.as_slice() {
            [(op, version)] if op == "==" || op == "===" => Some(version),
            _ => None,
        }
    }

    fn qualifier(&self, key: &str) -> Option<&str> {
        self.qualifiers
            .iter()
            .find_map(|(k, v)| (k == key).then_some(v.as_str()))
    }

    /// Whether a hash is given by option or URL qualifier
    pub fn has_hash(&self) -> bool {
        !self.hashes.is_empty()
            || self.qualifier("hash").is_some()
            || self
                .qualifiers
                .iter()
                .any(|(k, _)| k.parse::<crate::hash::HashAlgorithm>().is_ok())
    }

    /// `--hash` values as digests
    pub fn hash_values(&self) -> Result<Vec<Hash>> {
        self.hashes
            .iter()
            .map(|h| {
                Hash::parse_prefixed(h).map_err(|e| {
                    Error::ValidationError(format!(
                        "Invalid hash {h:?} for {}: {e}",
                        self.raw_name
                    ))
                })
            })
            .collect()
    }

    /// The URL with its fragment, as written
    pub fn full_url(&self) -> Option<String> {
        let url = self.url.as_ref()?;
        if self.qualifiers.is_empty() {
            return Some(url.clone());
        }
        let fragment: Vec<String> = self
            .qualifiers
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        Some(format!("{url}#{}", fragment.join("&")))
    }

    /// Clonable URL and commit of a VCS requirement
    pub fn vcs_source(&self) -> Result<(String, String)> {
        let url = self.url.as_deref().unwrap_or_default();
        let (repo, commit) = url.rsplit_once('@').ok_or_else(|| {
            Error::ValidationError(format!("No git ref in {}", self.download_line()))
        })?;
        let repo = repo.strip_prefix("git+").unwrap_or(repo);
        Ok((repo.to_string(), commit.to_lowercase()))
    }

    /// The same requirement downloaded from `url`, pinned by `hashes`
    pub fn with_url(&self, url: &str, fragment: &str, hashes: Vec<String>) -> Self {
        Self {
            kind: RequirementKind::Url,
            raw_name: self.raw_name.clone(),
            extras: Vec::new(),
            specs: Vec::new(),
            marker: self.marker.clone(),
            url: Some(url.to_string()),
            qualifiers: fragment
                .split('&')
                .filter_map(|q| q.split_once('='))
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            hashes,
            options: self
                .options
                .iter()
                .filter(|o| *o != "-e" && *o != "--editable")
                .cloned()
                .collect(),
        }
    }

    /// The requirement without options
    pub fn download_line(&self) -> String {
        let mut line = self.raw_name.clone();
        if !self.extras.is_empty() {
            line.push_str(&format!("[{}]", self.extras.join(",")));
        }
        match self.kind {
            RequirementKind::Pypi => {
                let specs: Vec<String> = self
                    .specs
                    .iter()
                    .map(|(op, version)| format!("{op}{version}"))
                    .collect();
                line.push_str(&specs.join(","));
                if let Some(marker) = &self.marker {
                    line.push_str(&format!("; {marker}"));
                }
            }
            RequirementKind::Url | RequirementKind::Vcs => {
                line.push_str(&format!(" @ {}", self.full_url().unwrap_or_default()));
                if let Some(marker) = &self.marker {
                    line.push_str(&format!(" ; {marker}"));
                }
            }
        }
        line
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = self.options.clone();
        parts.push(self.download_line());
        parts.extend(self.hashes.iter().map(|h| format!("--hash={h}")));
        write!(f, "{}", parts.join(" "))
    }
}

fn split_hashes(options: Vec<String>) -> (Vec<String>, Vec<String>) {
    let mut hashes = Vec::new();
    let mut rest = Vec::new();
    let mut iter = options.into_iter();
    while let Some(option) = iter.next() {
        if option == "--hash" {
            hashes.extend(iter.next());
        } else {
            rest.push(option);
        }
    }
    (hashes, rest)
}

fn direct_access_kind(line: &str) -> Result<Option<RequirementKind>> {
    let Some((before_colon, _)) = line.split_once(':') else {
        return Ok(None);
    };
    let scheme_parts: Vec<&str> = before_colon.split('@').collect();
    if scheme_parts.len() > 2 {
        return Err(Error::ValidationError(format!(
            "Unable to extract scheme from direct access requirement {line:?}"
        )));
    }
    let scheme = scheme_parts[scheme_parts.len() - 1].trim().to_lowercase();
    if URL_SCHEMES.contains(&scheme.as_str()) {
        Ok(Some(RequirementKind::Url))
    } else if VCS_SCHEMES.contains(&scheme.as_str()) {
        Ok(Some(RequirementKind::Vcs))
    } else {
        Err(Error::UnsupportedFeature(format!(
            "Direct references with the {scheme:?} scheme are not supported: {line:?}"
        )))
    }
}

fn parse_direct(line: &str, kind: RequirementKind) -> Result<Requirement> {
    let (mut name, rest) = if NAMED_URL.is_match(line) {
        let (name, url) = line.split_once('@').unwrap_or_default();
        (Some(name.trim().to_string()), url.trim())
    } else {
        (None, line.trim())
    };

    let (url, marker) = match rest.split_once("; ") {
        Some((url, marker)) => (url.trim(), Some(marker.trim().to_string())),
        None => (rest.trim_end_matches(';').trim(), None),
    };

    let (base, fragment) = url.split_once('#').unwrap_or((url, ""));
    let mut qualifiers = Vec::new();
    for section in fragment.split('&') {
        if let Some((key, value)) = section.split_once('=') {
            if key == "egg" {
                name = Some(value.to_string());
            }
            qualifiers.push((key.to_string(), value.to_string()));
        }
    }

    let name = name.filter(|n| !n.is_empty()).ok_or_else(|| {
        Error::ValidationError(format!(
            "Egg name could not be determined from the requirement {line:?}"
        ))
    })?;
    let (raw_name, extras) = split_extras(&name);

    Ok(Requirement {
        kind,
        raw_name,
        extras,
        specs: Vec::new(),
        marker,
        url: Some(base.to_string()),
        qualifiers,
        hashes: Vec::new(),
        options: Vec::new(),
    })
}

fn split_extras(name: &str) -> (String, Vec<String>) {
    match name.split_once('[') {
        Some((name, extras)) => (
            name.trim().to_string(),
            extras
                .trim_end_matches(']')
                .split(',')
                .map(|e| e.trim().to_string())
                .filter(|e| !e.is_empty())
                .collect(),
        ),
        None => (name.trim().to_string(), Vec::new()),
    }
}

fn parse_pypi(line: &str) -> Result<Requirement> {
    let invalid = |why: &str| Error::ValidationError(format!("Unable to parse the requirement {line:?}: {why}"));

    let (requirement, marker) = match line.split_once(';') {
        Some((r, m)) => (r.trim(), Some(m.trim().to_string()).filter(|m| !m.is_empty())),
        None => (line.trim(), None),
    };
    let caps = PYPI_REQUIREMENT
        .captures(requirement)
        .ok_or_else(|| invalid("expected a project name"))?;

    let extras = caps
        .get(2)
        .map(|m| {
            m.as_str()
                .split(',')
                .map(|e| e.trim().to_string())
                .filter(|e| !e.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let spec_text = caps[3].trim();
    let spec_text = spec_text
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .unwrap_or(spec_text);
    let mut specs = Vec::new();
    for spec in spec_text.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let spec_caps = VERSION_SPEC
            .captures(spec)
            .ok_or_else(|| invalid(&format!("invalid version specifier {spec:?}")))?;
        specs.push((spec_caps[1].to_string(), spec_caps[2].to_string()));
    }

    Ok(Requirement {
        kind: RequirementKind::Pypi,
        raw_name: caps[1].to_string(),
        extras,
        specs,
        marker,
        url: None,
        qualifiers: Vec::new(),
        hashes: Vec::new(),
        options: Vec::new(),
    })
}

/// A parsed requirements file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequirementsFile {
    /// Global options, values following their option
    pub options: Vec<String>,
    pub requirements: Vec<Requirement>,
}

impl RequirementsFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::ValidationError(format!("Failed to read {}: {e}", path.display()))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut file = Self::default();
        for line in logical_lines(content) {
            let (global, per_requirement, requirement) = split_options(&line)?;
            file.options.extend(global);
            if !requirement.is_empty() {
                file.requirements
                    .push(Requirement::parse(&requirement, per_requirement)?);
            }
        }
        Ok(file)
    }

    /// Check global options; returns whether `--require-hashes` is set
    pub fn process_options(&self) -> Result<bool> {
        let mut require_hashes = false;
        let mut ignored = Vec::new();
        let mut rejected = Vec::new();
        for option in &self.options {
            if option == "--require-hashes" {
                require_hashes = true;
            } else if REJECTED_OPTIONS.contains(&option.as_str()) {
                rejected.push(option.as_str());
            } else if option.starts_with('-') {
                ignored.push(option.as_str());
            }
        }
        if !ignored.is_empty() {
            info!("Ignoring the requirements file options {}", ignored.join(", "));
        }
        if !rejected.is_empty() {
            return Err(Error::UnsupportedFeature(format!(
                "The following requirements file options are not supported: {}",
                rejected.join(", ")
            )));
        }
        Ok(require_hashes)
    }

    /// Validate every requirement; returns whether hashes are required
    pub fn validate(&self) -> Result<bool> {
        let require_hashes =
            self.process_options()? || self.requirements.iter().any(|r| !r.hashes.is_empty());

        for req in &self.requirements {
            if req.options.iter().any(|o| o == "-e" || o == "--editable") {
                return Err(Error::UnsupportedFeature(format!(
                    "Editable requirements are not supported: {}",
                    req.download_line()
                )));
            }

            if req.kind == RequirementKind::Pypi && req.pinned_version().is_none() {
                return Err(Error::ValidationError(format!(
                    "Requirement must be pinned to an exact version: {}",
                    req.download_line()
                )));
            }

            let hash_required = require_hashes || req.kind == RequirementKind::Url;
            if hash_required && !req.has_hash() {
                return Err(Error::ValidationError(format!(
                    "Hash is required, dependency does not specify any: {}",
                    req.download_line()
                )));
            }
            req.hash_values()?;

            if req.kind == RequirementKind::Vcs {
                let url = req.url.as_deref().unwrap_or_default();
                let scheme = url.split(':').next().unwrap_or_default();
                if !scheme.starts_with("git") {
                    return Err(Error::UnsupportedFeature(format!(
                        "Unsupported VCS for {}: {scheme}",
                        req.download_line()
                    )));
                }
                let path = Url::parse(url).map(|u| u.path().to_string()).map_err(|e| {
                    Error::ValidationError(format!("Invalid URL in {}: {e}", req.download_line()))
                })?;
                let commit_ok = GIT_REF_IN_PATH.is_match(&path)
                    && req.vcs_source().is_ok_and(|(_, c)| is_full_commit(&c));
                if !commit_ok {
                    return Err(Error::ValidationError(format!(
                        "No valid git ref in {} (expected 40 hexadecimal characters)",
                        req.download_line()
                    )));
                }
            }
        }
        Ok(require_hashes)
    }
}

impl fmt::Display for RequirementsFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.options.is_empty() {
            writeln!(f, "{}", self.options.join(" "))?;
        }
        for requirement in &self.requirements {
            writeln!(f, "{requirement}")?;
        }
        Ok(())
    }
}

/// Join continuation lines and drop comments and blank lines
fn logical_lines(content: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut buffer = String::new();
    for line in content.lines() {
        if let Some(continued) = line.strip_suffix('\\') {
            buffer.push_str(continued);
            continue;
        }
        buffer.push_str(line);
        let cleaned = LINE_COMMENT.replace(&buffer, "").trim().to_string();
        if !cleaned.is_empty() {
            lines.push(cleaned);
        }
        buffer.clear();
    }
    if !buffer.trim().is_empty() {
        lines.push(buffer.trim().to_string());
    }
    lines
}

/// Split a line into global options, requirement options and the requirement
fn split_options(line: &str) -> Result<(Vec<String>, Vec<String>, String)> {
    let mut global = Vec::new();
    let mut per_requirement = Vec::new();
    let mut requirement = Vec::new();
    // (option, applies to the requirement) awaiting its value
    let mut pending: Option<(String, bool)> = None;

    for part in line.split_whitespace() {
        if let Some((_, scoped)) = pending.take() {
            let target = if scoped { &mut per_requirement } else { &mut global };
            target.push(part.to_string());
            continue;
        }
        if !part.starts_with('-') {
            requirement.push(part);
            continue;
        }

        let (option, value) = match part.split_once('=') {
            Some((option, value)) => (option, Some(value)),
            None => (part, None),
        };
        let takes_value = OPTIONS
            .iter()
            .find_map(|(name, takes)| (*name == option).then_some(*takes))
            .ok_or_else(|| {
                Error::ValidationError(format!("Unknown requirements file option {part:?}"))
            })?;
        if value.is_some() && !takes_value {
            return Err(Error::ValidationError(format!(
                "Unexpected value for requirements file option {part:?}"
            )));
        }

        let scoped = REQUIREMENT_OPTIONS.contains(&option);
        let target = if scoped { &mut per_requirement } else { &mut global };
        target.push(option.to_string());
        match value {
            Some(value) => target.push(value.to_string()),
            None if takes_value => pending = Some((option.to_string(), scoped)),
            None => {}
        }
    }

    if let Some((option, _)) = pending {
        return Err(Error::ValidationError(format!(
            "Requirements file option {option:?} requires a value"
        )));
    }
    if !per_requirement.is_empty() && requirement.is_empty() {
        return Err(Error::ValidationError(format!(
            "Requirements file options {per_requirement:?} can only be applied to a requirement"
        )));
    }
    Ok((global, per_requirement, requirement.join(" ")))
}
