// src/request/mod.rs

//! Requests and their persisted state
//!
//! A [`NewRequest`] is validated once at submission. After that the stored
//! [`Request`] only changes through [`Request::transition`], which enforces
//! the state machine in [`state`] and appends to the history table.

pub mod state;

pub use state::{RequestState, StateChange};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::db;
use crate::error::{Error, Result};
use crate::model::{DependencyReplacement, Flag, PackageManager, PackageType, RequestContext};
use crate::paths::{BundleDir, normalize_relative};
use crate::scm::is_full_commit;

/// Stored timestamps sort lexicographically in time order
pub(crate) fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::ParseError(format!("Invalid timestamp {raw:?}: {e}")))
}

/// What a caller submits
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRequest {
    pub repo: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub package_managers: Vec<PackageManager>,
    /// Package directories per manager; managers absent here use `.`
    #[serde(default)]
    pub packages: BTreeMap<PackageManager, Vec<PathBuf>>,
    #[serde(default)]
    pub flags: BTreeSet<Flag>,
    #[serde(default)]
    pub dependency_replacements: Vec<DependencyReplacement>,
}

impl NewRequest {
    /// Check the request and normalize its package paths
    pub fn validate(mut self) -> Result<Self> {
        if self.repo.trim().is_empty() {
            return Err(Error::ValidationError("The repo is required".into()));
        }
        if !is_full_commit(&self.git_ref) {
            return Err(Error::ValidationError(format!(
                "The ref {:?} is not a full-length commit id",
                self.git_ref
            )));
        }
        if self.package_managers.is_empty() {
            return Err(Error::ValidationError(
                "At least one package manager is required".into(),
            ));
        }
        let mut seen = BTreeSet::new();
        for manager in &self.package_managers {
            if !seen.insert(*manager) {
                return Err(Error::ValidationError(format!(
                    "The package manager {manager} is listed more than once"
                )));
            }
        }

        for (manager, paths) in self.packages.iter_mut() {
            if !seen.contains(manager) {
                return Err(Error::ValidationError(format!(
                    "Packages were given for {manager}, which is not a requested package manager"
                )));
            }
            let mut normalized = Vec::with_capacity(paths.len());
            for path in paths.iter() {
                let path = normalize_relative(path)?;
                let path = if path.as_os_str().is_empty() {
                    PathBuf::from(".")
                } else {
                    path
                };
                if normalized.contains(&path) {
                    return Err(Error::ValidationError(format!(
                        "The {manager} package path {} is listed more than once",
                        path.display()
                    )));
                }
                normalized.push(path);
            }
            *paths = normalized;
        }

        for replacement in &self.dependency_replacements {
            if replacement.kind != PackageType::Gomod {
                return Err(Error::UnsupportedFeature(format!(
                    "Dependency replacements of type {} are not supported",
                    replacement.kind
                )));
            }
            if !seen.contains(&PackageManager::Gomod) {
                return Err(Error::ValidationError(
                    "Dependency replacements require the gomod package manager".into(),
                ));
            }
        }
        Ok(self)
    }
}

/// A stored request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Request {
    pub id: i64,
    pub repo: String,
    pub git_ref: String,
    pub package_managers: Vec<PackageManager>,
    pub packages: BTreeMap<PackageManager, Vec<PathBuf>>,
    pub flags: BTreeSet<Flag>,
    pub dependency_replacements: Vec<DependencyReplacement>,
    pub state: RequestState,
    pub state_reason: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const REQUEST_COLUMNS: &str = "id, repo, git_ref, package_managers, packages, flags, \
     dependency_replacements, state, state_reason, created_at, updated_at";

/// Raw column values, converted outside of rusqlite's row callback
struct RequestRow {
    id: i64,
    repo: String,
    git_ref: String,
    package_managers: String,
    packages: String,
    flags: String,
    dependency_replacements: String,
    state: String,
    state_reason: String,
    created_at: String,
    updated_at: String,
}

impl RequestRow {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            repo: row.get(1)?,
            git_ref: row.get(2)?,
            package_managers: row.get(3)?,
            packages: row.get(4)?,
            flags: row.get(5)?,
            dependency_replacements: row.get(6)?,
            state: row.get(7)?,
            state_reason: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    fn into_request(self) -> Result<Request> {
        Ok(Request {
            id: self.id,
            repo: self.repo,
            git_ref: self.git_ref,
            package_managers: serde_json::from_str(&self.package_managers)?,
            packages: serde_json::from_str(&self.packages)?,
            flags: serde_json::from_str(&self.flags)?,
            dependency_replacements: serde_json::from_str(&self.dependency_replacements)?,
            state: self.state.parse()?,
            state_reason: self.state_reason,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

impl Request {
    /// Store a validated request in the `created` state
    pub fn insert(conn: &Connection, new: &NewRequest, now: DateTime<Utc>) -> Result<Self> {
        let reason = "The request was initiated";
        let stamp = format_timestamp(now);
        conn.execute(
            "INSERT INTO requests (repo, git_ref, package_managers, packages, flags,
                 dependency_replacements, state, state_reason, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![
                new.repo,
                new.git_ref,
                serde_json::to_string(&new.package_managers)?,
                serde_json::to_string(&new.packages)?,
                serde_json::to_string(&new.flags)?,
                serde_json::to_string(&new.dependency_replacements)?,
                RequestState::Created.as_str(),
                reason,
                stamp,
            ],
        )?;
        let id = conn.last_insert_rowid();
        record_history(conn, id, RequestState::Created, reason, &stamp)?;
        info!("Created request {} for {} at {}", id, new.repo, new.git_ref);

        Ok(Self {
            id,
            repo: new.repo.clone(),
            git_ref: new.git_ref.clone(),
            package_managers: new.package_managers.clone(),
            packages: new.packages.clone(),
            flags: new.flags.clone(),
            dependency_replacements: new.dependency_replacements.clone(),
            state: RequestState::Created,
            state_reason: reason.to_string(),
            created_at: parse_timestamp(&stamp)?,
            updated_at: parse_timestamp(&stamp)?,
        })
    }

    pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<Self>> {
        let mut stmt =
            conn.prepare(&format!("SELECT {REQUEST_COLUMNS} FROM requests WHERE id = ?1"))?;
        let row = stmt.query_row([id], RequestRow::from_row).optional()?;
        row.map(RequestRow::into_request).transpose()
    }

    /// Like [`Request::find_by_id`], failing when the request does not exist
    pub fn get(conn: &Connection, id: i64) -> Result<Self> {
        Self::find_by_id(conn, id)?
            .ok_or_else(|| Error::NotFoundError(format!("request {id}")))
    }

    pub fn list_by_state(conn: &Connection, state: RequestState) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {REQUEST_COLUMNS} FROM requests WHERE state = ?1 ORDER BY id"
        ))?;
        let rows = stmt
            .query_map([state.as_str()], RequestRow::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(RequestRow::into_request).collect()
    }

    /// Move to `state`; returns false when (state, reason) is already current
    pub fn transition(
        &mut self,
        conn: &Connection,
        state: RequestState,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if self.state == state && self.state_reason == reason {
            debug!("Request {} is already {} ({})", self.id, state, reason);
            return Ok(false);
        }
        if !self.state.can_transition_to(state) {
            return Err(Error::InvalidTransition(format!(
                "request {} cannot move from {} to {}",
                self.id, self.state, state
            )));
        }

        let stamp = format_timestamp(now);
        db::savepoint(conn, "request_transition", |conn| {
            let changed = conn.execute(
                "UPDATE requests SET state = ?1, state_reason = ?2, updated_at = ?3
                 WHERE id = ?4 AND state = ?5 AND state_reason = ?6",
                params![
                    state.as_str(),
                    reason,
                    stamp,
                    self.id,
                    self.state.as_str(),
                    self.state_reason
                ],
            )?;
            if changed == 0 {
                return Err(Error::InvalidTransition(format!(
                    "request {} changed state concurrently",
                    self.id
                )));
            }
            record_history(conn, self.id, state, reason, &stamp)
        })?;

        info!("Request {} is {}: {}", self.id, state, reason);
        self.state = state;
        self.state_reason = reason.to_string();
        self.updated_at = parse_timestamp(&stamp)?;
        Ok(true)
    }

    /// State changes, oldest first
    pub fn history(&self, conn: &Connection) -> Result<Vec<StateChange>> {
        let mut stmt = conn.prepare(
            "SELECT state, reason, created_at FROM request_state_history
             WHERE request_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map([self.id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(state, reason, at)| {
                Ok(StateChange {
                    state: state.parse()?,
                    reason,
                    at: parse_timestamp(&at)?,
                })
            })
            .collect()
    }

    /// The read-only view the pipeline stages work from
    pub fn context(&self, bundles_dir: &Path) -> RequestContext {
        RequestContext {
            id: self.id,
            repo: self.repo.clone(),
            git_ref: self.git_ref.clone(),
            bundle: BundleDir::new(bundles_dir, self.id),
            package_managers: self.package_managers.clone(),
            packages: self.packages.clone(),
            flags: self.flags.clone(),
            dependency_replacements: self.dependency_replacements.clone(),
        }
    }
}

fn record_history(
    conn: &Connection,
    request_id: i64,
    state: RequestState,
    reason: &str,
    stamp: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO request_state_history (request_id, state, reason, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![request_id, state.as_str(), reason, stamp],
    )?;
    Ok(())
}
