// src/store/memory.rs

//! In-process artifact store
//!
//! Behaves like the HTTP store at the level the engine cares about: names
//! are unique, a second publish of the same component is `AlreadyExists`,
//! missing repositories and users are `NotFoundError`. Counters let callers
//! check how often the store was actually written to.
//!
//! Reads through a group repository look at the group's members first and
//! then at upstream content registered with [`MemoryStore::serve_upstream`],
//! standing in for the public registry behind the store's proxies.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use super::{
    ArtifactStore, Component, ComponentQuery, ComponentUpload, Grant, RepositoryFormat,
    RepositoryKind, RepositorySpec,
};
use crate::error::{Error, Result};
use crate::hash::{HashAlgorithm, hash_bytes};

#[derive(Debug, Clone)]
struct StoredComponent {
    component: Component,
    content: Vec<u8>,
}

#[derive(Debug, Default)]
struct MemoryState {
    repositories: BTreeMap<String, RepositorySpec>,
    credentials: BTreeMap<String, (String, Vec<Grant>)>,
    components: Vec<StoredComponent>,
    scripts: Vec<(String, serde_json::Value)>,
    upstream: BTreeMap<(RepositoryFormat, String), Vec<u8>>,
    uploads: usize,
    upstream_fetches: usize,
}

impl MemoryState {
    fn component_content(&self, url: &str) -> Option<&[u8]> {
        self.components
            .iter()
            .find(|c| c.component.download_url == url)
            .map(|c| c.content.as_slice())
    }
}

/// Thread-safe in-memory store
#[derive(Debug)]
pub struct MemoryStore {
    base_url: String,
    state: Mutex<MemoryState>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new("http://store.invalid")
    }
}

impl MemoryStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            state: Mutex::new(MemoryState::default()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| Error::IoError("memory store lock poisoned".to_string()))
    }

    /// Make `path` readable through any group repository of `format`
    pub fn serve_upstream(&self, format: RepositoryFormat, path: &str, content: Vec<u8>) {
        if let Ok(mut state) = self.lock() {
            state.upstream.insert((format, path.to_string()), content);
        }
    }

    /// Number of reads that reached upstream content
    pub fn upstream_fetches(&self) -> usize {
        self.lock().map(|s| s.upstream_fetches).unwrap_or(0)
    }

    /// Number of successful publishes
    pub fn upload_count(&self) -> usize {
        self.lock().map(|s| s.uploads).unwrap_or(0)
    }

    pub fn repository_names(&self) -> Vec<String> {
        self.lock()
            .map(|s| s.repositories.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn credential_names(&self) -> Vec<String> {
        self.lock()
            .map(|s| s.credentials.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Names of executed scripts, in order
    pub fn executed_scripts(&self) -> Vec<String> {
        self.lock()
            .map(|s| s.scripts.iter().map(|(n, _)| n.clone()).collect())
            .unwrap_or_default()
    }

    /// Download URLs of every published component
    pub fn component_urls(&self) -> Vec<String> {
        self.lock()
            .map(|s| {
                s.components
                    .iter()
                    .map(|c| c.component.download_url.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Stored bytes for a download URL
    pub fn content(&self, url: &str) -> Option<Vec<u8>> {
        let state = self.lock().ok()?;
        state.component_content(url).map(<[u8]>::to_vec)
    }

    /// Resolve a URL the way the store serves it
    fn read(&self, url: &str) -> Result<Vec<u8>> {
        let mut state = self.lock()?;
        if let Some(content) = state.component_content(url) {
            return Ok(content.to_vec());
        }

        let not_found = || Error::NotFoundError(url.to_string());
        let prefix = format!("{}/repository/", self.base_url.trim_end_matches('/'));
        let (repository, path) = url
            .strip_prefix(&prefix)
            .and_then(|rest| rest.split_once('/'))
            .ok_or_else(not_found)?;
        let spec = state.repositories.get(repository).ok_or_else(not_found)?;
        let RepositoryKind::Group { members } = &spec.kind else {
            return Err(not_found());
        };
        let format = spec.format;

        for member in members {
            let member_url = format!("{}{}", self.repository_url(member), path);
            if let Some(content) = state.component_content(&member_url) {
                return Ok(content.to_vec());
            }
        }
        let content = state
            .upstream
            .get(&(format, path.to_string()))
            .cloned()
            .ok_or_else(not_found)?;
        state.upstream_fetches += 1;
        Ok(content)
    }
}

fn matches(component: &Component, query: &ComponentQuery) -> bool {
    component.repository == query.repository
        && component.name == query.name
        && (query.version.is_none() || component.version == query.version)
        && (query.group.is_none() || component.group == query.group)
}

impl ArtifactStore for MemoryStore {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn create_repository(&self, spec: &RepositorySpec) -> Result<()> {
        let mut state = self.lock()?;
        if state.repositories.contains_key(&spec.name) {
            return Err(Error::AlreadyExists(format!("repository {}", spec.name)));
        }
        state.repositories.insert(spec.name.clone(), spec.clone());
        Ok(())
    }

    fn delete_repository(&self, name: &str) -> Result<()> {
        let mut state = self.lock()?;
        if state.repositories.remove(name).is_none() {
            return Err(Error::NotFoundError(format!("repository {name}")));
        }
        state.components.retain(|c| c.component.repository != name);
        Ok(())
    }

    fn create_credential(&self, username: &str, password: &str, grants: &[Grant]) -> Result<()> {
        let mut state = self.lock()?;
        if state.credentials.contains_key(username) {
            return Err(Error::AlreadyExists(format!("user {username}")));
        }
        state
            .credentials
            .insert(username.to_string(), (password.to_string(), grants.to_vec()));
        Ok(())
    }

    fn delete_credential(&self, username: &str) -> Result<()> {
        let mut state = self.lock()?;
        state
            .credentials
            .remove(username)
            .map(|_| ())
            .ok_or_else(|| Error::NotFoundError(format!("user {username}")))
    }

    fn find_component(&self, query: &ComponentQuery) -> Result<Option<Component>> {
        let state = self.lock()?;
        Ok(state
            .components
            .iter()
            .find(|c| matches(&c.component, query))
            .map(|c| c.component.clone()))
    }

    fn upload_component(&self, upload: &ComponentUpload) -> Result<()> {
        let content = std::fs::read(&upload.path).map_err(|e| {
            Error::IoError(format!("Failed to read {}: {e}", upload.path.display()))
        })?;
        let query = upload.query();
        let mut state = self.lock()?;
        if !state.repositories.contains_key(&upload.repository) {
            return Err(Error::NotFoundError(format!(
                "repository {}",
                upload.repository
            )));
        }
        if state.components.iter().any(|c| matches(&c.component, &query)) {
            return Err(Error::AlreadyExists(upload.asset_path()));
        }
        let component = Component {
            repository: upload.repository.clone(),
            name: query.name,
            version: query.version,
            group: query.group,
            download_url: format!(
                "{}{}",
                self.repository_url(&upload.repository),
                upload.asset_path()
            ),
            sha256: Some(hash_bytes(HashAlgorithm::Sha256, &content).value),
        };
        state.components.push(StoredComponent { component, content });
        state.uploads += 1;
        Ok(())
    }

    fn download_asset(&self, url: &str, dest: &Path) -> Result<()> {
        let content = self.read(url)?;
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(dest, content)?;
        Ok(())
    }

    fn execute_script(&self, name: &str, payload: &serde_json::Value) -> Result<()> {
        self.lock()?.scripts.push((name.to_string(), payload.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{RepositoryFormat, RepositoryKind};
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn hosted(name: &str) -> RepositorySpec {
        RepositorySpec {
            name: name.to_string(),
            format: RepositoryFormat::Raw,
            kind: RepositoryKind::Hosted,
        }
    }

    #[test]
    fn test_repository_lifecycle() {
        let store = MemoryStore::default();
        store.create_repository(&hosted("r1")).unwrap();
        assert!(matches!(
            store.create_repository(&hosted("r1")),
            Err(Error::AlreadyExists(_))
        ));
        store.delete_repository("r1").unwrap();
        assert!(matches!(
            store.delete_repository("r1"),
            Err(Error::NotFoundError(_))
        ));
    }

    #[test]
    fn test_duplicate_upload_conflicts() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("bar.tar.gz");
        std::fs::write(&file, b"bar").unwrap();

        let store = MemoryStore::default();
        store.create_repository(&hosted("raw")).unwrap();
        let upload = ComponentUpload {
            repository: "raw".into(),
            format: RepositoryFormat::Raw,
            name: "bar".into(),
            version: None,
            filename: "bar-external-sha256-x.tar.gz".into(),
            path: PathBuf::from(&file),
        };
        store.upload_component(&upload).unwrap();
        assert!(matches!(
            store.upload_component(&upload),
            Err(Error::AlreadyExists(_))
        ));
        assert_eq!(store.upload_count(), 1);

        let found = store.find_component(&upload.query()).unwrap().unwrap();
        assert_eq!(
            found.download_url,
            "http://store.invalid/repository/raw/bar/bar-external-sha256-x.tar.gz"
        );

        let dest = dir.path().join("copy");
        store.download_asset(&found.download_url, &dest).unwrap();
        assert_eq!(std::fs::read(dest).unwrap(), b"bar");
    }

    #[test]
    fn test_group_reads_members_then_upstream() {
        let dir = tempdir().unwrap();
        let store = MemoryStore::default();
        store.create_repository(&hosted("member")).unwrap();
        store
            .create_repository(&RepositorySpec {
                name: "group".into(),
                format: RepositoryFormat::Raw,
                kind: RepositoryKind::Group {
                    members: vec!["member".into(), "proxy".into()],
                },
            })
            .unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"hosted").unwrap();
        store
            .upload_component(&ComponentUpload {
                repository: "member".into(),
                format: RepositoryFormat::Raw,
                name: "a".into(),
                version: None,
                filename: "a.txt".into(),
                path: file,
            })
            .unwrap();
        store.serve_upstream(RepositoryFormat::Raw, "b/b.txt", b"upstream".to_vec());

        let dest = dir.path().join("out");
        store
            .download_asset("http://store.invalid/repository/group/a/a.txt", &dest)
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"hosted");
        assert_eq!(store.upstream_fetches(), 0);

        store
            .download_asset("http://store.invalid/repository/group/b/b.txt", &dest)
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"upstream");
        assert_eq!(store.upstream_fetches(), 1);

        // hosted repositories never reach upstream
        assert!(matches!(
            store.download_asset("http://store.invalid/repository/member/b/b.txt", &dest),
            Err(Error::NotFoundError(_))
        ));
    }
}
