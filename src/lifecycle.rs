// src/lifecycle.rs

//! Per-request staging repositories in the artifact store
//!
//! Each (request, package manager) pair owns a hosted repository for
//! request-scoped uploads and a group repository the build reads from, plus
//! a credential that can only read what the request needs. Names are derived
//! from the request id so a retried stage finds what an earlier attempt
//! created.
//!
//! | Manager | Hosted | Group |
//! |---------|--------|-------|
//! | npm, yarn | npm `{prefix}{pm}-hosted-{id}` | npm `{prefix}{pm}-{id}` (hosted + cache + upstream) |
//! | pip | raw `{prefix}pip-raw-{id}` | pypi `{prefix}pip-{id}` (upstream) |
//! | rubygems | raw `{prefix}rubygems-raw-{id}` | rubygems `{prefix}rubygems-{id}` (upstream) |
//!
//! Mirrored dependencies live in a shared cache repository per ecosystem
//! that outlives requests; the credential can read it too. Go modules and
//! git submodules need no repositories.

use rand::Rng;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::model::PackageManager;
use crate::store::{ArtifactStore, Grant, RepositoryFormat, RepositoryKind, RepositorySpec};

/// Repositories and credential owned by one (request, manager) pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingRepository {
    pub request_id: i64,
    pub manager: PackageManager,
    pub hosted: RepositorySpec,
    pub group: RepositorySpec,
    /// Shared cache holding mirrored dependencies
    pub cache: Grant,
    pub username: String,
}

impl StagingRepository {
    pub fn hosted_name(&self) -> &str {
        &self.hosted.name
    }

    pub fn group_name(&self) -> &str {
        &self.group.name
    }

    fn grants(&self) -> Vec<Grant> {
        vec![
            Grant {
                repository: self.group.name.clone(),
                format: self.group.format,
            },
            Grant {
                repository: self.hosted.name.clone(),
                format: self.hosted.format,
            },
            self.cache.clone(),
        ]
    }
}

/// Credential handed to the build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Creates, finalizes and removes staging repositories
pub struct RepositoryLifecycle {
    store: Arc<dyn ArtifactStore>,
    prefix: String,
    npm: (String, String),
    pip: (String, String),
    rubygems: (String, String),
}

impl RepositoryLifecycle {
    pub fn new(store: Arc<dyn ArtifactStore>, config: &EngineConfig) -> Self {
        Self {
            store,
            prefix: config.store.prefix.clone(),
            npm: (config.npm.proxy_repo.clone(), config.npm.cache_repo.clone()),
            pip: (config.pip.proxy_repo.clone(), config.pip.cache_repo.clone()),
            rubygems: (
                config.rubygems.proxy_repo.clone(),
                config.rubygems.cache_repo.clone(),
            ),
        }
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    /// Shared cache repository mirrored dependencies of `manager` are published to
    pub fn cache_repository(&self, manager: PackageManager) -> Option<&str> {
        match manager {
            PackageManager::Npm | PackageManager::Yarn => Some(&self.npm.1),
            PackageManager::Pip => Some(&self.pip.1),
            PackageManager::Rubygems => Some(&self.rubygems.1),
            PackageManager::Gomod | PackageManager::GitSubmodule => None,
        }
    }

    /// Create the shared cache repositories that do not exist yet
    pub fn ensure_cache_repositories(&self) -> Result<()> {
        let caches = [
            (&self.npm.1, RepositoryFormat::Npm),
            (&self.pip.1, RepositoryFormat::Raw),
            (&self.rubygems.1, RepositoryFormat::Raw),
        ];
        for (name, format) in caches {
            let spec = RepositorySpec {
                name: name.clone(),
                format,
                kind: RepositoryKind::Hosted,
            };
            match self.store.create_repository(&spec) {
                Ok(()) => info!("Created cache repository {}", name),
                Err(Error::AlreadyExists(_)) => debug!("Cache repository {} exists", name),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Names for a pair; `None` for managers that stage nothing in the store
    pub fn staging_for(&self, request_id: i64, manager: PackageManager) -> Option<StagingRepository> {
        let pm = manager.as_str();
        let prefix = &self.prefix;
        let group_name = format!("{prefix}{pm}-{request_id}");

        let (hosted_format, group_format, hosted_suffix, members, cache) = match manager {
            PackageManager::Npm | PackageManager::Yarn => {
                let (proxy, cache) = &self.npm;
                let hosted = format!("{prefix}{pm}-hosted-{request_id}");
                (
                    RepositoryFormat::Npm,
                    RepositoryFormat::Npm,
                    "hosted",
                    vec![hosted, cache.clone(), proxy.clone()],
                    Grant {
                        repository: cache.clone(),
                        format: RepositoryFormat::Npm,
                    },
                )
            }
            PackageManager::Pip | PackageManager::Rubygems => {
                let ((proxy, cache), group_format) = if manager == PackageManager::Pip {
                    (&self.pip, RepositoryFormat::Pypi)
                } else {
                    (&self.rubygems, RepositoryFormat::Rubygems)
                };
                (
                    RepositoryFormat::Raw,
                    group_format,
                    "raw",
                    vec![proxy.clone()],
                    Grant {
                        repository: cache.clone(),
                        format: RepositoryFormat::Raw,
                    },
                )
            }
            PackageManager::Gomod | PackageManager::GitSubmodule => return None,
        };

        Some(StagingRepository {
            request_id,
            manager,
            hosted: RepositorySpec {
                name: format!("{prefix}{pm}-{hosted_suffix}-{request_id}"),
                format: hosted_format,
                kind: RepositoryKind::Hosted,
            },
            group: RepositorySpec {
                name: group_name.clone(),
                format: group_format,
                kind: RepositoryKind::Group { members },
            },
            cache,
            username: group_name,
        })
    }

    /// Create the hosted and group repositories; existing ones are reused
    pub fn provision(&self, request_id: i64, manager: PackageManager) -> Result<Option<StagingRepository>> {
        let Some(staging) = self.staging_for(request_id, manager) else {
            return Ok(None);
        };

        info!(
            "Provisioning {} repositories for request {}",
            manager, request_id
        );
        for spec in [&staging.hosted, &staging.group] {
            match self.store.create_repository(spec) {
                Ok(()) => {}
                Err(Error::AlreadyExists(_)) => {
                    debug!("Repository {} already exists, reusing it", spec.name);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(Some(staging))
    }

    /// Issue the read-only credential and run the store's post-staging script
    pub fn finalize(&self, staging: &StagingRepository) -> Result<Credentials> {
        let password = generate_password();
        let grants = staging.grants();

        match self
            .store
            .create_credential(&staging.username, &password, &grants)
        {
            Ok(()) => {}
            Err(Error::AlreadyExists(_)) => {
                // left over from an earlier attempt whose password is gone
                debug!("Replacing credential {}", staging.username);
                self.store.delete_credential(&staging.username)?;
                self.store
                    .create_credential(&staging.username, &password, &grants)?;
            }
            Err(e) => return Err(e),
        }

        let script = format!("{}_after_content_staged", script_prefix(staging.manager));
        self.store.execute_script(
            &script,
            &json!({
                "hosted_repository": staging.hosted.name,
                "group_repository": staging.group.name,
                "username": staging.username,
            }),
        )?;

        info!(
            "Finalized {} repositories for request {}",
            staging.manager, staging.request_id
        );
        Ok(Credentials {
            username: staging.username.clone(),
            password,
        })
    }

    /// Remove a pair and its credential; failures are logged, never returned
    pub fn teardown(&self, request_id: i64, manager: PackageManager) {
        let Some(staging) = self.staging_for(request_id, manager) else {
            return;
        };

        match self.store.delete_credential(&staging.username) {
            Ok(()) | Err(Error::NotFoundError(_)) => {}
            Err(e) => error!("Failed to delete credential {}: {}", staging.username, e),
        }
        // group first, it references the hosted repository
        for name in [staging.group_name(), staging.hosted_name()] {
            match self.store.delete_repository(name) {
                Ok(()) | Err(Error::NotFoundError(_)) => {}
                Err(e) => error!("Failed to delete repository {}: {}", name, e),
            }
        }
    }

    /// Tear down every manager's pair for a request
    pub fn teardown_all(&self, request_id: i64, managers: &[PackageManager]) {
        for manager in managers {
            self.teardown(request_id, *manager);
        }
    }
}

fn script_prefix(manager: PackageManager) -> &'static str {
    match manager {
        PackageManager::Npm | PackageManager::Yarn => "js",
        other => other.as_str(),
    }
}

/// Random hex password for a staging credential
fn generate_password() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}
