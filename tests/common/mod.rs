// tests/common/mod.rs

//! Shared test utilities and helpers for integration tests.

#![allow(dead_code)]

use depstage::archive::create_tar_gz;
use depstage::mirror::OriginFetcher;
use depstage::model::RequestContext;
use depstage::paths::BundleDir;
use depstage::store::RepositoryFormat;
use depstage::{Engine, EngineConfig, Error, MemoryStore, Origin, PackageManager, Result};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Serves origin content from memory and counts every fetch
#[derive(Default)]
pub struct CountingFetcher {
    content: Mutex<HashMap<String, Vec<u8>>>,
    fetches: AtomicUsize,
}

impl CountingFetcher {
    /// Register the bytes served for a URL (or VCS repository URL)
    pub fn serve(&self, url: &str, bytes: Vec<u8>) {
        self.content.lock().unwrap().insert(url.to_string(), bytes);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl OriginFetcher for CountingFetcher {
    fn fetch(&self, name: &str, origin: &Origin, dest: &Path) -> Result<()> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let url = match origin {
            Origin::Url { url, .. } | Origin::Vcs { url, .. } => url,
            _ => return Err(Error::ValidationError(format!("{name} is not fetchable"))),
        };
        let bytes = self
            .content
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| Error::NetworkError(format!("nothing served at {url}")))?;
        std::fs::write(dest, bytes)?;
        Ok(())
    }
}

/// An engine over a memory store and a counting fetcher, rooted in a temp dir
pub struct TestEngine {
    pub dir: TempDir,
    pub store: Arc<MemoryStore>,
    pub fetcher: Arc<CountingFetcher>,
    pub engine: Arc<Engine>,
}

impl TestEngine {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.worker.bundles_dir = dir.path().join("bundles");
        config.worker.db_path = dir.path().join("depstage.db");
        config.retry.max_attempts = 1;
        let store = Arc::new(MemoryStore::default());
        let fetcher = Arc::new(CountingFetcher::default());
        let engine = Arc::new(
            Engine::new(Arc::new(config), store.clone(), fetcher.clone()).unwrap(),
        );
        Self {
            dir,
            store,
            fetcher,
            engine,
        }
    }

    /// A request whose source tree is already in place
    pub fn request(&self, id: i64, manager: PackageManager) -> RequestContext {
        let request = RequestContext {
            id,
            repo: "https://github.com/example/webapp.git".into(),
            git_ref: "0123456789abcdef0123456789abcdef01234567".into(),
            bundle: BundleDir::new(self.engine.config().worker.bundles_dir.clone(), id),
            package_managers: vec![manager],
            packages: BTreeMap::new(),
            flags: BTreeSet::new(),
            dependency_replacements: vec![],
        };
        std::fs::create_dir_all(request.bundle.source_root()).unwrap();
        request
    }
}

/// Write a file relative to a request's source root
pub fn write_source(request: &RequestContext, path: &str, content: &str) {
    let full = request.bundle.source_root().join(path);
    std::fs::create_dir_all(full.parent().unwrap()).unwrap();
    std::fs::write(full, content).unwrap();
}

pub fn read_source(request: &RequestContext, path: &str) -> String {
    std::fs::read_to_string(request.bundle.source_root().join(path)).unwrap()
}

/// Serve an sdist through pip staging groups the way a PyPI proxy lists it
pub fn serve_sdist(store: &MemoryStore, name: &str, version: &str, content: &[u8]) {
    let filename = format!("{name}-{version}.tar.gz");
    let release = json!({
        "urls": [{
            "filename": filename,
            "url": format!("../../../packages/{name}/{version}/{filename}"),
            "packagetype": "sdist"
        }]
    });
    store.serve_upstream(
        RepositoryFormat::Pypi,
        &format!("pypi/{name}/{version}/json"),
        release.to_string().into_bytes(),
    );
    store.serve_upstream(
        RepositoryFormat::Pypi,
        &format!("packages/{name}/{version}/{filename}"),
        content.to_vec(),
    );
}

/// Serve a registry tarball through npm staging groups
pub fn serve_npm_package(store: &MemoryStore, name: &str, version: &str, content: &[u8]) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    store.serve_upstream(
        RepositoryFormat::Npm,
        &format!("{name}/-/{basename}-{version}.tgz"),
        content.to_vec(),
    );
}

/// A gzipped npm package tarball with a `package/package.json`
pub fn npm_tarball(name: &str, version: &str) -> Vec<u8> {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src");
    std::fs::create_dir_all(&src).unwrap();
    std::fs::write(
        src.join("package.json"),
        format!(r#"{{"name": "{name}", "version": "{version}"}}"#),
    )
    .unwrap();
    std::fs::write(src.join("index.js"), "module.exports = {};\n").unwrap();
    let archive = dir.path().join("pkg.tgz");
    create_tar_gz(&src, "package", &archive).unwrap();
    std::fs::read(archive).unwrap()
}
