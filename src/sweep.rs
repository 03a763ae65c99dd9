// src/sweep.rs

//! Expiry of completed requests
//!
//! A complete request keeps its staging repositories and bundle until it
//! outlives the configured request lifetime. The sweep moves it to `stale`
//! and releases both.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::pipeline::Engine;
use crate::request::{Request, RequestState};

pub const EXPIRED_REASON: &str = "The request has expired";

pub struct StaleSweeper {
    engine: Arc<Engine>,
}

impl StaleSweeper {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Expire every complete request last updated before `now - lifetime`
    ///
    /// Returns the ids of the requests that were moved to `stale`.
    pub fn run(&self, conn: &Connection, now: DateTime<Utc>) -> Result<Vec<i64>> {
        let lifetime = chrono::Duration::from_std(self.engine.config().request_lifetime()?)
            .map_err(|e| Error::ConfigError(format!("Invalid request lifetime: {e}")))?;
        let cutoff = now - lifetime;
        let bundles_dir = &self.engine.config().worker.bundles_dir;

        let mut expired = Vec::new();
        for mut request in Request::list_by_state(conn, RequestState::Complete)? {
            if request.updated_at >= cutoff {
                continue;
            }
            match request.transition(conn, RequestState::Stale, EXPIRED_REASON, now) {
                Ok(_) => {}
                Err(Error::InvalidTransition(msg)) => {
                    warn!("Skipping request {}: {}", request.id, msg);
                    continue;
                }
                Err(e) => return Err(e),
            }
            let ctx = request.context(bundles_dir);
            self.engine.release(&ctx);
            self.engine.remove_bundle(&ctx);
            expired.push(request.id);
        }

        if !expired.is_empty() {
            info!("Expired {} requests", expired.len());
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::db;
    use crate::mirror::OriginFetcher;
    use crate::model::{Origin, PackageManager};
    use crate::request::NewRequest;
    use crate::store::MemoryStore;
    use std::path::Path;

    struct NoFetch;

    impl OriginFetcher for NoFetch {
        fn fetch(&self, name: &str, _origin: &Origin, _dest: &Path) -> Result<()> {
            Err(Error::NetworkError(format!("no network for {name}")))
        }
    }

    fn completed(conn: &Connection, at: DateTime<Utc>) -> Request {
        let new = NewRequest {
            repo: "https://github.com/example/webapp.git".into(),
            git_ref: "0123456789abcdef0123456789abcdef01234567".into(),
            package_managers: vec![PackageManager::Npm],
            ..Default::default()
        };
        let mut request = Request::insert(conn, &new, at).unwrap();
        request
            .transition(conn, RequestState::InProgress, "Fetching", at)
            .unwrap();
        request
            .transition(conn, RequestState::Complete, "Completed successfully", at)
            .unwrap();
        request
    }

    #[test]
    fn test_sweep_expires_old_requests() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.worker.bundles_dir = dir.path().to_path_buf();
        let store = Arc::new(MemoryStore::default());
        let engine = Arc::new(
            Engine::new(Arc::new(config), store.clone(), Arc::new(NoFetch)).unwrap(),
        );
        let conn = db::open_in_memory().unwrap();

        let now = Utc::now();
        let old = completed(&conn, now - chrono::Duration::hours(30));
        let fresh = completed(&conn, now - chrono::Duration::minutes(5));

        let old_ctx = old.context(dir.path());
        let staging = engine
            .lifecycle()
            .provision(old.id, PackageManager::Npm)
            .unwrap()
            .unwrap();
        std::fs::create_dir_all(old_ctx.bundle.source_root()).unwrap();
        assert!(
            store
                .repository_names()
                .contains(&staging.hosted_name().to_string())
        );

        let expired = StaleSweeper::new(engine).run(&conn, now).unwrap();
        assert_eq!(expired, vec![old.id]);

        let old = Request::get(&conn, old.id).unwrap();
        assert_eq!(old.state, RequestState::Stale);
        assert_eq!(old.state_reason, EXPIRED_REASON);
        assert_eq!(
            Request::get(&conn, fresh.id).unwrap().state,
            RequestState::Complete
        );
        assert!(!old_ctx.bundle.root().exists());
        assert!(
            !store
                .repository_names()
                .contains(&staging.hosted_name().to_string())
        );
    }
}
