// src/mirror/fetch.rs

//! Fetching dependencies from their true origin

use reqwest::blocking::Client;
use std::fs::{self, File};
use std::io;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::archive::create_tar_gz;
use crate::error::{Error, Result};
use crate::model::Origin;
use crate::retry::{RetryPolicy, is_retryable_status, transport_error};
use crate::scm::Git;

/// Directory every VCS archive is rooted at
pub const VCS_ARCHIVE_PREFIX: &str = "app";

/// Produces the bytes of a non-registry dependency at `dest`
pub trait OriginFetcher: Send + Sync {
    fn fetch(&self, name: &str, origin: &Origin, dest: &Path) -> Result<()>;
}

/// Fetches over the network: git clones and HTTP downloads
pub struct NetworkFetcher {
    git: Git,
    client: Client,
    retry: RetryPolicy,
}

impl NetworkFetcher {
    pub fn new(git: Git, timeout: Duration, retry: RetryPolicy) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::ConfigError(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { git, client, retry })
    }

    fn download(&self, url: &str, dest: &Path) -> Result<()> {
        info!("Downloading {} to {}", url, dest.display());
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::IoError(format!("Failed to create directory {}: {e}", parent.display()))
            })?;
        }

        self.retry.run(&format!("Download of {url}"), || {
            let mut response = self
                .client
                .get(url)
                .send()
                .map_err(|e| transport_error(&format!("Failed to download {url}"), e))?;

            let status = response.status();
            if !status.is_success() {
                let message = format!("HTTP {status} from {url}");
                return Err(if is_retryable_status(status.as_u16()) {
                    Error::NetworkError(message)
                } else {
                    Error::DownloadError(message)
                });
            }

            // Write to a temporary file first
            let temp_path = dest.with_extension("part");
            let mut file = File::create(&temp_path).map_err(|e| {
                Error::IoError(format!("Failed to create file {}: {e}", temp_path.display()))
            })?;
            io::copy(&mut response, &mut file)
                .map_err(|e| Error::NetworkError(format!("Failed to read {url}: {e}")))?;

            fs::rename(&temp_path, dest).map_err(|e| {
                Error::IoError(format!(
                    "Failed to move {} to {}: {e}",
                    temp_path.display(),
                    dest.display()
                ))
            })
        })
    }

    fn archive_commit(&self, url: &str, commit: &str, dest: &Path) -> Result<()> {
        let scratch = tempfile::tempdir()?;
        let checkout = scratch.path().join("repo");
        self.git.clone_at(url, commit, &checkout)?;
        create_tar_gz(&checkout, VCS_ARCHIVE_PREFIX, dest)
    }
}

impl OriginFetcher for NetworkFetcher {
    fn fetch(&self, name: &str, origin: &Origin, dest: &Path) -> Result<()> {
        match origin {
            Origin::Vcs { url, commit } => self.archive_commit(url, commit, dest),
            Origin::Url { url, .. } => self.download(url, dest),
            Origin::Registry | Origin::LocalPath { .. } => Err(Error::ValidationError(format!(
                "The dependency {name} is a {} dependency and is never fetched from its origin",
                origin.kind()
            ))),
        }
    }
}
