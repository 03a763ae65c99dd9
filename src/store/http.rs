// src/store/http.rs

//! Nexus-style REST client for the artifact store
//!
//! Wraps a blocking reqwest client. Every call authenticates with the
//! administrative account and goes through the retry policy; connection
//! failures and 500/502/503/504 responses count as transient.

use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use super::{
    ArtifactStore, Component, ComponentQuery, ComponentUpload, Grant, RepositoryFormat,
    RepositoryKind, RepositorySpec,
};
use crate::config::StoreSection;
use crate::error::{Error, Result};
use crate::retry::{RetryPolicy, is_retryable_status, transport_error};

/// Default timeout for HTTP requests (30 seconds)
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

const API: &str = "service/rest/v1";

#[derive(Debug, Deserialize)]
struct SearchPage {
    #[serde(default)]
    items: Vec<SearchItem>,
    #[serde(rename = "continuationToken")]
    continuation_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    repository: String,
    #[serde(default)]
    group: Option<String>,
    name: String,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    assets: Vec<SearchAsset>,
}

#[derive(Debug, Deserialize)]
struct SearchAsset {
    #[serde(rename = "downloadUrl")]
    download_url: String,
    #[serde(default)]
    checksum: HashMap<String, String>,
}

/// HTTP artifact store
pub struct HttpStore {
    client: Client,
    base_url: String,
    username: String,
    password: String,
    retry: RetryPolicy,
}

impl HttpStore {
    /// Create a client from the `[store]` configuration section
    pub fn new(config: &StoreSection, timeout: Option<Duration>, retry: RetryPolicy) -> Result<Self> {
        let mut builder = Client::builder().timeout(timeout.unwrap_or(HTTP_TIMEOUT));
        if let Some(ca) = &config.ca_cert {
            let pem = fs::read(ca).map_err(|e| {
                Error::ConfigError(format!("Failed to read CA bundle {}: {e}", ca.display()))
            })?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| Error::ConfigError(format!("Invalid CA bundle: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder
            .build()
            .map_err(|e| Error::ConfigError(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            retry,
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/{}/{}", self.base_url, API, path)
    }

    /// Send a request built by `build`, retrying transient failures
    fn send<F>(&self, label: &str, build: F) -> Result<Response>
    where
        F: Fn() -> Result<RequestBuilder>,
    {
        self.retry.run(label, || {
            let response = build()?
                .basic_auth(&self.username, Some(&self.password))
                .send()
                .map_err(|e| transport_error(label, e))?;
            let status = response.status().as_u16();
            if is_retryable_status(status) {
                return Err(Error::NetworkError(format!("{label}: HTTP {status}")));
            }
            Ok(response)
        })
    }

    fn expect_success(label: &str, response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().unwrap_or_default();
        Err(classify_failure(label, status, &body))
    }
}

/// Map a non-success response to an error
fn classify_failure(label: &str, status: StatusCode, body: &str) -> Error {
    let message = format!("{label}: HTTP {status}: {}", body.trim());
    match status {
        StatusCode::NOT_FOUND => Error::NotFoundError(message),
        StatusCode::CONFLICT => Error::AlreadyExists(message),
        StatusCode::BAD_REQUEST
            if body.contains("does not allow updating") || body.contains("already exists") =>
        {
            Error::AlreadyExists(message)
        }
        _ => Error::NetworkError(message),
    }
}

fn repository_body(spec: &RepositorySpec) -> serde_json::Value {
    match &spec.kind {
        RepositoryKind::Hosted => json!({
            "name": spec.name,
            "online": true,
            "storage": {
                "blobStoreName": "default",
                "strictContentTypeValidation": true,
                "writePolicy": "allow_once",
            },
        }),
        RepositoryKind::Group { members } => json!({
            "name": spec.name,
            "online": true,
            "storage": {
                "blobStoreName": "default",
                "strictContentTypeValidation": true,
            },
            "group": { "memberNames": members },
        }),
    }
}

fn read_privileges(grants: &[Grant]) -> Vec<String> {
    grants
        .iter()
        .flat_map(|g| {
            [
                format!("nx-repository-view-{}-{}-read", g.format, g.repository),
                format!("nx-repository-view-{}-{}-browse", g.format, g.repository),
            ]
        })
        .collect()
}

impl ArtifactStore for HttpStore {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn create_repository(&self, spec: &RepositorySpec) -> Result<()> {
        let kind = match spec.kind {
            RepositoryKind::Hosted => "hosted",
            RepositoryKind::Group { .. } => "group",
        };
        let url = self.api_url(&format!("repositories/{}/{}", spec.format, kind));
        let body = repository_body(spec);
        let label = format!("Creating repository {}", spec.name);
        let response = self.send(&label, || Ok(self.client.post(&url).json(&body)))?;
        Self::expect_success(&label, response)?;
        info!("Created {} {} repository {}", spec.format, kind, spec.name);
        Ok(())
    }

    fn delete_repository(&self, name: &str) -> Result<()> {
        let url = self.api_url(&format!("repositories/{name}"));
        let label = format!("Deleting repository {name}");
        let response = self.send(&label, || Ok(self.client.delete(&url)))?;
        Self::expect_success(&label, response)?;
        info!("Deleted repository {}", name);
        Ok(())
    }

    fn create_credential(&self, username: &str, password: &str, grants: &[Grant]) -> Result<()> {
        let role_url = self.api_url("security/roles");
        let role = json!({
            "id": username,
            "name": username,
            "description": format!("Read access for {username}"),
            "privileges": read_privileges(grants),
            "roles": [],
        });
        let label = format!("Creating role {username}");
        let response = self.send(&label, || Ok(self.client.post(&role_url).json(&role)))?;
        Self::expect_success(&label, response)?;

        let user_url = self.api_url("security/users");
        let user = json!({
            "userId": username,
            "firstName": username,
            "lastName": username,
            "emailAddress": "noreply@depstage.local",
            "password": password,
            "status": "active",
            "roles": [username],
        });
        let label = format!("Creating user {username}");
        let response = self.send(&label, || Ok(self.client.post(&user_url).json(&user)))?;
        Self::expect_success(&label, response)?;
        info!("Created credential {}", username);
        Ok(())
    }

    fn delete_credential(&self, username: &str) -> Result<()> {
        let user_url = self.api_url(&format!("security/users/{username}"));
        let label = format!("Deleting user {username}");
        let response = self.send(&label, || Ok(self.client.delete(&user_url)))?;
        let user_result = Self::expect_success(&label, response).map(|_| ());

        let role_url = self.api_url(&format!("security/roles/{username}"));
        let label = format!("Deleting role {username}");
        let response = self.send(&label, || Ok(self.client.delete(&role_url)))?;
        match Self::expect_success(&label, response) {
            Ok(_) | Err(Error::NotFoundError(_)) => {}
            Err(e) => return Err(e),
        }
        user_result
    }

    fn find_component(&self, query: &ComponentQuery) -> Result<Option<Component>> {
        let url = self.api_url("search");
        let mut token: Option<String> = None;

        loop {
            let mut params: Vec<(&str, String)> = vec![
                ("repository", query.repository.clone()),
                ("name", query.name.clone()),
            ];
            if let Some(version) = &query.version {
                params.push(("version", version.clone()));
            }
            if let Some(group) = &query.group {
                params.push(("group", group.clone()));
            }
            if let Some(t) = &token {
                params.push(("continuationToken", t.clone()));
            }

            let label = format!("Searching for {}", query.name);
            let response = self.send(&label, || Ok(self.client.get(&url).query(&params)))?;
            let page: SearchPage = Self::expect_success(&label, response)?
                .json()
                .map_err(|e| Error::NetworkError(format!("Invalid search response: {e}")))?;

            // search is fuzzy; keep exact matches only
            let hit = page.items.into_iter().find(|item| {
                item.repository == query.repository
                    && item.name == query.name
                    && (query.version.is_none() || item.version == query.version)
                    && (query.group.is_none() || item.group == query.group)
            });
            if let Some(item) = hit {
                let asset = item.assets.into_iter().next();
                return Ok(Some(Component {
                    repository: item.repository,
                    name: item.name,
                    version: item.version,
                    group: item.group,
                    download_url: asset
                        .as_ref()
                        .map(|a| a.download_url.clone())
                        .unwrap_or_default(),
                    sha256: asset.and_then(|mut a| a.checksum.remove("sha256")),
                }));
            }

            match page.continuation_token {
                Some(next) => token = Some(next),
                None => return Ok(None),
            }
        }
    }

    fn upload_component(&self, upload: &ComponentUpload) -> Result<()> {
        let url = self.api_url("components");
        let label = format!("Uploading {}", upload.filename);
        debug!("Uploading {} to {}", upload.path.display(), upload.repository);

        let response = self.send(&label, || {
            let bytes = fs::read(&upload.path).map_err(|e| {
                Error::IoError(format!("Failed to read {}: {e}", upload.path.display()))
            })?;
            let part = Part::bytes(bytes).file_name(upload.filename.clone());
            let form = match upload.format {
                RepositoryFormat::Raw => Form::new()
                    .text("raw.directory", upload.name.clone())
                    .part("raw.asset1", part)
                    .text("raw.asset1.filename", upload.filename.clone()),
                RepositoryFormat::Npm => Form::new().part("npm.asset", part),
                RepositoryFormat::Pypi => Form::new().part("pypi.asset", part),
                RepositoryFormat::Rubygems => Form::new().part("rubygems.asset", part),
            };
            Ok(self
                .client
                .post(&url)
                .query(&[("repository", upload.repository.as_str())])
                .multipart(form))
        })?;
        Self::expect_success(&label, response)?;
        info!("Published {} to {}", upload.asset_path(), upload.repository);
        Ok(())
    }

    fn download_asset(&self, url: &str, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let label = format!("Downloading {url}");
        let mut response = Self::expect_success(&label, self.send(&label, || Ok(self.client.get(url)))?)?;

        let temp_path = dest.with_extension("part");
        let mut file = File::create(&temp_path).map_err(|e| {
            Error::IoError(format!("Failed to create file {}: {e}", temp_path.display()))
        })?;
        io::copy(&mut response, &mut file)
            .map_err(|e| Error::DownloadError(format!("Failed to read {url}: {e}")))?;
        fs::rename(&temp_path, dest).map_err(|e| {
            Error::IoError(format!(
                "Failed to move {} to {}: {e}",
                temp_path.display(),
                dest.display()
            ))
        })?;
        Ok(())
    }

    fn execute_script(&self, name: &str, payload: &serde_json::Value) -> Result<()> {
        let url = self.api_url(&format!("script/{name}/run"));
        let body = payload.to_string();
        let label = format!("Executing script {name}");
        let response = self.send(&label, || {
            Ok(self
                .client
                .post(&url)
                .header(reqwest::header::CONTENT_TYPE, "text/plain")
                .body(body.clone()))
        })?;
        Self::expect_success(&label, response)?;
        info!("Executed store script {}", name);
        Ok(())
    }
}
