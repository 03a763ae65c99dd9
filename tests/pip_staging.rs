// tests/pip_staging.rs

//! pip resolve stage against the in-memory store.

mod common;

use common::{TestEngine, read_source, serve_sdist, write_source};
use depstage::emit::EnvVarKind;
use depstage::hash::{HashAlgorithm, hash_bytes};
use depstage::{BillOfMaterials, PackageManager, PackageType, RuntimeConfig};

const BAR_URL: &str = "https://example.org/bar-1.0.tar.gz";

fn stage_sources(te: &TestEngine, id: i64) -> (depstage::model::RequestContext, String) {
    let bar = b"bar source archive".to_vec();
    let digest = hash_bytes(HashAlgorithm::Sha256, &bar);
    te.fetcher.serve(BAR_URL, bar);
    serve_sdist(&te.store, "foo", "1.0.0", b"foo sdist");

    let request = te.request(id, PackageManager::Pip);
    write_source(
        &request,
        "setup.py",
        "from setuptools import setup\n\nsetup(name='webapp', version='1.0.0')\n",
    );
    write_source(
        &request,
        "requirements.txt",
        &format!("foo==1.0.0\nbar @ {BAR_URL}#hash=sha256:{}\n", digest.value),
    );
    (request, digest.value)
}

#[test]
fn test_pip_stage_mirrors_and_rewrites() {
    let te = TestEngine::new();
    let (request, digest) = stage_sources(&te, 1);

    let report = te.engine.resolve(&request, PackageManager::Pip).unwrap();
    assert_eq!(report.packages, 1);
    assert_eq!(report.dependencies, 2);
    assert_eq!(report.mirrored, 1);
    assert_eq!(report.fetched, 1);
    assert_eq!(report.staged, 1);

    // the registry requirement is staged into the bundle and the request's hosted repository
    let staged = request.bundle.deps_dir_for(PackageManager::Pip).join("foo/foo-1.0.0.tar.gz");
    assert_eq!(std::fs::read(staged).unwrap(), b"foo sdist");
    assert!(
        te.store
            .component_urls()
            .contains(&"http://store.invalid/repository/depstage-pip-raw-1/foo/foo-1.0.0.tar.gz".to_string())
    );

    let mirrored_url = format!(
        "http://store.invalid/repository/depstage-pip-raw/bar/bar-external-sha256-{digest}.tar.gz"
    );
    assert_eq!(
        read_source(&request, "requirements.txt"),
        format!("foo==1.0.0\nbar @ {mirrored_url}#hash=sha256:{digest}\n")
    );
    assert_eq!(
        te.store.content(&mirrored_url).unwrap(),
        b"bar source archive".to_vec()
    );

    let bom = BillOfMaterials::load(&request.bundle.bom_file(PackageManager::Pip)).unwrap();
    let package = &bom.packages()[0];
    assert_eq!(package.name, "webapp");
    assert_eq!(package.kind, PackageType::Pip);
    let versions: Vec<(&str, &str)> = package
        .dependencies
        .iter()
        .map(|d| (d.name.as_str(), d.version.as_str()))
        .collect();
    let bar_version = format!("{BAR_URL}#hash=sha256:{digest}");
    assert!(versions.contains(&("foo", "1.0.0")));
    assert!(versions.contains(&("bar", bar_version.as_str())));

    let config = RuntimeConfig::load(&request.bundle.config_file(PackageManager::Pip)).unwrap();
    let index = &config.environment_variables["PIP_INDEX_URL"];
    assert_eq!(index.kind, EnvVarKind::Literal);
    assert!(index.value.ends_with("@store.invalid/repository/depstage-pip-1/simple/"));

    // the bundled copy carries the staging credential, the in-tree file does not
    let bundled = config
        .config_files
        .iter()
        .find(|f| f.path == "app/requirements.txt")
        .unwrap();
    let bundled = String::from_utf8(bundled.decode().unwrap()).unwrap();
    assert!(bundled.contains("@store.invalid/repository/depstage-pip-raw/bar/"));
    assert!(bundled.contains("depstage-pip-1:"));
    assert!(!read_source(&request, "requirements.txt").contains("depstage-pip-1:"));
}

#[test]
fn test_pip_fetches_each_artifact_once() {
    let te = TestEngine::new();
    let (first, _) = stage_sources(&te, 1);
    let (second, _) = stage_sources(&te, 2);

    te.engine.resolve(&first, PackageManager::Pip).unwrap();
    let report = te.engine.resolve(&second, PackageManager::Pip).unwrap();

    assert_eq!(te.fetcher.fetch_count(), 1);
    assert_eq!(report.mirrored, 1);
    assert_eq!(report.fetched, 0);
    let cached: Vec<String> = te
        .store
        .component_urls()
        .into_iter()
        .filter(|url| url.contains("/repository/depstage-pip-raw/"))
        .collect();
    assert_eq!(cached.len(), 1);
    // each request stages its own copy of the registry requirement
    assert_eq!(te.store.upload_count(), 3);
    assert_eq!(
        read_source(&first, "requirements.txt"),
        read_source(&second, "requirements.txt")
    );
}

#[test]
fn test_pip_hash_mismatch_fails_stage() {
    let te = TestEngine::new();
    let (request, _) = stage_sources(&te, 1);
    write_source(
        &request,
        "requirements.txt",
        &format!("bar @ {BAR_URL}#hash=sha256:{}\n", "0".repeat(64)),
    );

    let err = te.engine.resolve(&request, PackageManager::Pip).unwrap_err();
    assert!(matches!(err, depstage::Error::ChecksumMismatch { .. }));
    assert_eq!(te.store.upload_count(), 0);
}

#[test]
fn test_registry_hash_mismatch_fails_stage() {
    let te = TestEngine::new();
    let (request, _) = stage_sources(&te, 1);
    write_source(
        &request,
        "requirements.txt",
        &format!("foo==1.0.0 --hash=sha256:{}\n", "0".repeat(64)),
    );

    let err = te.engine.resolve(&request, PackageManager::Pip).unwrap_err();
    assert!(matches!(err, depstage::Error::ChecksumMismatch { .. }));
    assert_eq!(te.store.upload_count(), 0);
    assert!(
        !request
            .bundle
            .deps_dir_for(PackageManager::Pip)
            .join("foo")
            .exists()
    );
}

#[test]
fn test_registry_hash_match_is_staged() {
    let te = TestEngine::new();
    let (request, _) = stage_sources(&te, 1);
    let digest = hash_bytes(HashAlgorithm::Sha256, b"foo sdist");
    write_source(
        &request,
        "requirements.txt",
        &format!("foo==1.0.0 --hash=sha256:{}\n", digest.value),
    );

    let report = te.engine.resolve(&request, PackageManager::Pip).unwrap();
    assert_eq!(report.staged, 1);
    assert_eq!(te.store.upstream_fetches(), 2);
}

#[test]
fn test_equivalent_requirements_recorded_once() {
    let te = TestEngine::new();
    let (request, _) = stage_sources(&te, 1);
    serve_sdist(&te.store, "foo-bar", "1.0.0", b"foo-bar sdist");
    write_source(&request, "requirements.txt", "Foo_Bar==1.0.0\nfoo-bar==1.0.0\n");

    let report = te.engine.resolve(&request, PackageManager::Pip).unwrap();
    assert_eq!(report.staged, 1);

    let bom = BillOfMaterials::load(&request.bundle.bom_file(PackageManager::Pip)).unwrap();
    let deps: Vec<(&str, &str)> = bom.packages()[0]
        .dependencies
        .iter()
        .map(|d| (d.name.as_str(), d.version.as_str()))
        .collect();
    assert_eq!(deps, vec![("foo-bar", "1.0.0")]);
}
