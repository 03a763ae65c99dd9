// src/scm.rs

//! Git operations through the `git` executable
//!
//! Used to fetch the request's source, to clone VCS dependencies before they
//! are archived into the store, to compute Go module versions from tags, and
//! to enumerate submodules.

use chrono::{DateTime, TimeZone, Utc};
use ini::Ini;
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;
use tracing::info;

use crate::error::{Error, Result};
use crate::process::CommandRunner;
use crate::retry::RetryPolicy;

static FULL_COMMIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-fA-F]{40}$").expect("valid regex"));

/// Whether `reference` is a full-length commit id
pub fn is_full_commit(reference: &str) -> bool {
    FULL_COMMIT_RE.is_match(reference)
}

/// Messages that point at connectivity rather than a bad request
const NETWORK_HINTS: &[&str] = &[
    "Could not resolve host",
    "Connection refused",
    "Connection timed out",
    "Failed to connect",
    "early EOF",
    "The remote end hung up unexpectedly",
];

/// A submodule as recorded in `.gitmodules` and the superproject tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submodule {
    pub name: String,
    pub path: String,
    pub url: String,
    pub commit: String,
}

/// Thin wrapper around the `git` command line
#[derive(Debug, Clone)]
pub struct Git {
    runner: CommandRunner,
    retry: RetryPolicy,
}

impl Git {
    pub fn new(runner: CommandRunner, retry: RetryPolicy) -> Self {
        let runner = runner
            .with_env("GIT_TERMINAL_PROMPT", "0")
            .with_env("GIT_ASKPASS", "/bin/true");
        Self { runner, retry }
    }

    fn git(&self, cwd: &Path, args: &[&str]) -> Result<String> {
        Ok(self.runner.run("git", args, cwd)?.stdout)
    }

    /// Clone `url` into `dest` and check out `commit`
    pub fn clone_at(&self, url: &str, commit: &str, dest: &Path) -> Result<()> {
        if !is_full_commit(commit) {
            return Err(Error::ValidationError(format!(
                "The git reference {commit} for {url} is not a full commit id"
            )));
        }

        let parent = dest.parent().unwrap_or(Path::new("."));
        std::fs::create_dir_all(parent)?;
        let dest_str = dest.to_string_lossy().into_owned();

        info!("Cloning {} at {}", url, commit);
        self.retry.run(&format!("Clone of {url}"), || {
            if dest.exists() {
                std::fs::remove_dir_all(dest)?;
            }
            self.git(parent, &["clone", "--quiet", "--no-checkout", url, &dest_str])
                .map(|_| ())
                .map_err(classify_network)
        })?;

        self.git(dest, &["checkout", "--quiet", commit]).map_err(|e| {
            Error::ValidationError(format!(
                "The commit {commit} could not be checked out from {url}: {e}"
            ))
        })?;
        Ok(())
    }

    /// Full commit id of `rev` in `repo`
    pub fn rev_parse(&self, repo: &Path, rev: &str) -> Result<String> {
        Ok(self.git(repo, &["rev-parse", rev])?.trim().to_string())
    }

    /// Tags pointing directly at `commit`
    pub fn tags_pointing_at(&self, repo: &Path, commit: &str) -> Result<Vec<String>> {
        let out = self.git(repo, &["tag", "--points-at", commit])?;
        Ok(split_lines(&out))
    }

    /// Tags reachable from `commit`
    pub fn reachable_tags(&self, repo: &Path, commit: &str) -> Result<Vec<String>> {
        let out = self.git(repo, &["tag", "--merged", commit])?;
        Ok(split_lines(&out))
    }

    /// Committer timestamp of `commit`
    pub fn commit_time(&self, repo: &Path, commit: &str) -> Result<DateTime<Utc>> {
        let out = self.git(repo, &["show", "-s", "--format=%ct", commit])?;
        let secs: i64 = out.trim().parse().map_err(|_| {
            Error::ParseError(format!("Unexpected commit timestamp for {commit}: {out}"))
        })?;
        Utc.timestamp_opt(secs, 0)
            .single()
            .ok_or_else(|| Error::ParseError(format!("Invalid commit timestamp {secs}")))
    }

    /// Submodules declared by the superproject at `repo`
    pub fn submodules(&self, repo: &Path) -> Result<Vec<Submodule>> {
        let gitmodules = repo.join(".gitmodules");
        if !gitmodules.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&gitmodules)?;
        let mut submodules = Vec::new();
        for (name, path, url) in parse_gitmodules(&content)? {
            let out = self.git(repo, &["ls-tree", "HEAD", &path])?;
            let commit = parse_ls_tree_commit(&out).ok_or_else(|| {
                Error::ValidationError(format!(
                    "The submodule {name} at {path} is not checked in as a commit"
                ))
            })?;
            submodules.push(Submodule {
                name,
                path,
                url,
                commit,
            });
        }
        Ok(submodules)
    }

    /// Check out every submodule at the commit the superproject pins
    pub fn init_submodules(&self, repo: &Path) -> Result<()> {
        if !repo.join(".gitmodules").exists() {
            return Ok(());
        }
        info!("Checking out the submodules of {}", repo.display());
        self.retry.run("Submodule checkout", || {
            self.git(repo, &["submodule", "update", "--init", "--recursive", "--quiet"])
                .map(|_| ())
                .map_err(classify_network)
        })
    }
}

fn classify_network(e: Error) -> Error {
    match e {
        Error::CommandFailed(msg) if NETWORK_HINTS.iter().any(|h| msg.contains(h)) => {
            Error::NetworkError(msg)
        }
        other => other,
    }
}

fn split_lines(out: &str) -> Vec<String> {
    out.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect()
}

/// Parse `.gitmodules` into (name, path, url) triples
pub fn parse_gitmodules(content: &str) -> Result<Vec<(String, String, String)>> {
    let ini = Ini::load_from_str(content)
        .map_err(|e| Error::ParseError(format!("Invalid .gitmodules: {e}")))?;
    let mut out = Vec::new();
    for (section, props) in ini.iter() {
        let Some(section) = section else { continue };
        let Some(name) = section.trim().strip_prefix("submodule") else {
            continue;
        };
        let name = name.trim().trim_matches('"').to_string();
        let path = props.get("path").ok_or_else(|| {
            Error::ParseError(format!("The submodule {name} has no path"))
        })?;
        let url = props.get("url").ok_or_else(|| {
            Error::ParseError(format!("The submodule {name} has no url"))
        })?;
        out.push((name, path.trim().to_string(), url.trim().to_string()));
    }
    Ok(out)
}

/// Commit id from `git ls-tree` output for a gitlink entry
fn parse_ls_tree_commit(out: &str) -> Option<String> {
    let line = out.lines().next()?;
    let mut fields = line.split_whitespace();
    let _mode = fields.next()?;
    let kind = fields.next()?;
    let sha = fields.next()?;
    (kind == "commit" && is_full_commit(sha)).then(|| sha.to_string())
}
