// src/db/mod.rs

//! SQLite database shared by submitters and workers

pub mod schema;

use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// How long a connection waits for another writer before giving up
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

fn configure(conn: &Connection) -> Result<()> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(())
}

/// Create the database (and its directory) and bring the schema up to date
pub fn init(db_path: impl AsRef<Path>) -> Result<Connection> {
    let db_path = db_path.as_ref();
    info!("Initializing database at {}", db_path.display());

    if let Some(parent) = db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(db_path)?;
    configure(&conn)?;
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    debug!("Journal mode {}", mode);
    schema::migrate(&conn)?;
    Ok(conn)
}

/// Open an existing database
pub fn open(db_path: impl AsRef<Path>) -> Result<Connection> {
    let db_path = db_path.as_ref();
    if !db_path.exists() {
        return Err(Error::NotFoundError(format!(
            "Database not found at {}, run `depstage init` first",
            db_path.display()
        )));
    }
    let conn = Connection::open(db_path)?;
    configure(&conn)?;
    schema::migrate(&conn)?;
    Ok(conn)
}

/// In-memory database with the schema applied
pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    configure(&conn)?;
    schema::migrate(&conn)?;
    Ok(conn)
}

/// Run `f` in an immediate transaction, committing only when it succeeds
pub fn transaction<T, F>(conn: &mut Connection, f: F) -> Result<T>
where
    F: FnOnce(&Transaction<'_>) -> Result<T>,
{
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let value = f(&tx)?;
    tx.commit()?;
    Ok(value)
}

/// Run `f` inside a named savepoint on a shared connection
///
/// Works both on its own and nested in an open transaction, so helpers that
/// only borrow the connection can still make several writes atomically.
pub fn savepoint<T, F>(conn: &Connection, name: &str, f: F) -> Result<T>
where
    F: FnOnce(&Connection) -> Result<T>,
{
    conn.execute_batch(&format!("SAVEPOINT {name}"))?;
    match f(conn) {
        Ok(value) => {
            conn.execute_batch(&format!("RELEASE {name}"))?;
            Ok(value)
        }
        Err(e) => {
            let rollback = format!("ROLLBACK TO {name}; RELEASE {name}");
            if let Err(failed) = conn.execute_batch(&rollback) {
                debug!("Rolling back savepoint {} failed: {}", name, failed);
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_init_then_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("depstage.db");
        assert!(matches!(open(&path), Err(Error::NotFoundError(_))));

        init(&path).unwrap();
        let conn = open(&path).unwrap();
        assert_eq!(
            schema::get_schema_version(&conn).unwrap(),
            schema::SCHEMA_VERSION
        );
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let mut conn = open_in_memory().unwrap();
        let result: Result<()> = transaction(&mut conn, |tx| {
            tx.execute(
                "INSERT INTO requests (repo, git_ref, package_managers, state, state_reason,
                     created_at, updated_at)
                 VALUES ('r', 'g', '[]', 'created', '', 'now', 'now')",
                [],
            )?;
            Err(Error::ValidationError("abort".into()))
        });
        assert!(result.is_err());

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM requests", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_savepoint_nests_in_transaction() {
        let insert = "INSERT INTO requests (repo, git_ref, package_managers, state,
                          state_reason, created_at, updated_at)
                      VALUES ('r', 'g', '[]', 'created', '', 'now', 'now')";
        let mut conn = open_in_memory().unwrap();
        transaction(&mut conn, |tx| {
            tx.execute(insert, [])?;
            let inner: Result<()> = savepoint(tx, "inner", |conn| {
                conn.execute(insert, [])?;
                Err(Error::ValidationError("abort".into()))
            });
            assert!(inner.is_err());
            savepoint(tx, "kept", |conn| conn.execute(insert, []).map_err(Error::from))?;
            Ok(())
        })
        .unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM requests", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }
}
