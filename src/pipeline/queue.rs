// src/pipeline/queue.rs

//! Durable task queue in the `tasks` table
//!
//! A claim is a lease: `updated_at` records when a task went `running`, and a
//! task still running once the lease has lapsed belonged to a worker that died.
//! [`reclaim_expired`] puts such tasks back in the queue until they run out of
//! attempts, after which they are failed.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

use super::step::Step;
use crate::db;
use crate::error::{Error, Result};
use crate::request::format_timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            _ => Err(Error::ParseError(format!("Invalid task status: {s}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: i64,
    pub request_id: i64,
    pub step: Step,
    pub status: TaskStatus,
    pub attempts: u32,
    pub error: Option<String>,
}

/// Add a pending step for a request
pub fn enqueue(conn: &Connection, request_id: i64, step: Step, now: DateTime<Utc>) -> Result<i64> {
    let stamp = format_timestamp(now);
    conn.execute(
        "INSERT INTO tasks (request_id, step, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?4)",
        params![
            request_id,
            serde_json::to_string(&step)?,
            TaskStatus::Pending.as_str(),
            stamp
        ],
    )?;
    let id = conn.last_insert_rowid();
    debug!("Queued task {} {} for request {}", id, step, request_id);
    Ok(id)
}

/// Take the oldest pending task and mark it running
pub fn claim_next(conn: &mut Connection, now: DateTime<Utc>) -> Result<Option<Task>> {
    db::transaction(conn, |tx| {
        let row = tx
            .query_row(
                "SELECT id, request_id, step, attempts FROM tasks
                 WHERE status = 'pending' ORDER BY id LIMIT 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, u32>(3)?,
                    ))
                },
            )
            .optional()?;
        let Some((id, request_id, step, attempts)) = row else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE tasks SET status = ?1, attempts = attempts + 1, updated_at = ?2 WHERE id = ?3",
            params![TaskStatus::Running.as_str(), format_timestamp(now), id],
        )?;
        Ok(Some(Task {
            id,
            request_id,
            step: serde_json::from_str(&step)?,
            status: TaskStatus::Running,
            attempts: attempts + 1,
            error: None,
        }))
    })
}

/// Requeue running tasks whose lease lapsed; returns the ones failed for good
pub fn reclaim_expired(
    conn: &mut Connection,
    lease: Duration,
    max_attempts: u32,
    now: DateTime<Utc>,
) -> Result<Vec<Task>> {
    let lease = chrono::Duration::from_std(lease)
        .map_err(|e| Error::ConfigError(format!("Invalid task lease: {e}")))?;
    let cutoff = format_timestamp(now - lease);
    let stamp = format_timestamp(now);

    db::transaction(conn, |tx| {
        let mut stmt = tx.prepare(
            "SELECT id, request_id, step, attempts FROM tasks
             WHERE status = 'running' AND updated_at < ?1 ORDER BY id",
        )?;
        let expired = stmt
            .query_map([&cutoff], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, u32>(3)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut abandoned = Vec::new();
        for (id, request_id, step, attempts) in expired {
            let step: Step = serde_json::from_str(&step)?;
            if attempts < max_attempts {
                warn!(
                    "Lease on task {} {} for request {} lapsed, requeueing",
                    id, step, request_id
                );
                tx.execute(
                    "UPDATE tasks SET status = 'pending', updated_at = ?1 WHERE id = ?2",
                    params![stamp, id],
                )?;
                continue;
            }

            let error = format!("Abandoned after {attempts} attempts");
            warn!("Task {} {} for request {}: {}", id, step, request_id, error);
            tx.execute(
                "UPDATE tasks SET status = 'failed', error = ?1, updated_at = ?2 WHERE id = ?3",
                params![error, stamp, id],
            )?;
            abandoned.push(Task {
                id,
                request_id,
                step,
                status: TaskStatus::Failed,
                attempts,
                error: Some(error),
            });
        }
        Ok(abandoned)
    })
}

/// Record how a claimed task ended
pub fn finish(
    conn: &Connection,
    task_id: i64,
    status: TaskStatus,
    error: Option<&str>,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "UPDATE tasks SET status = ?1, error = ?2, updated_at = ?3 WHERE id = ?4",
        params![status.as_str(), error, format_timestamp(now), task_id],
    )?;
    Ok(())
}

pub fn tasks_for_request(conn: &Connection, request_id: i64) -> Result<Vec<Task>> {
    let mut stmt = conn.prepare(
        "SELECT id, request_id, step, status, attempts, error FROM tasks
         WHERE request_id = ?1 ORDER BY id",
    )?;
    let rows = stmt
        .query_map([request_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, u32>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(id, request_id, step, status, attempts, error)| {
            Ok(Task {
                id,
                request_id,
                step: serde_json::from_str(&step)?,
                status: status.parse()?,
                attempts,
                error,
            })
        })
        .collect()
}

pub fn pending_count(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM tasks WHERE status = 'pending'",
        [],
        |row| row.get(0),
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PackageManager;

    fn request_row(conn: &Connection) -> i64 {
        conn.execute(
            "INSERT INTO requests (repo, git_ref, package_managers, state, state_reason,
                 created_at, updated_at)
             VALUES ('r', 'g', '[\"npm\"]', 'in_progress', '', 'now', 'now')",
            [],
        )
        .unwrap();
        conn.last_insert_rowid()
    }

    #[test]
    fn test_claim_in_order() {
        let mut conn = db::open_in_memory().unwrap();
        let request = request_row(&conn);
        enqueue(&conn, request, Step::FetchSource, Utc::now()).unwrap();
        enqueue(
            &conn,
            request,
            Step::Resolve { manager: PackageManager::Npm },
            Utc::now(),
        )
        .unwrap();
        assert_eq!(pending_count(&conn).unwrap(), 2);

        let first = claim_next(&mut conn, Utc::now()).unwrap().unwrap();
        assert_eq!(first.step, Step::FetchSource);
        assert_eq!(first.attempts, 1);
        finish(&conn, first.id, TaskStatus::Done, None, Utc::now()).unwrap();

        let second = claim_next(&mut conn, Utc::now()).unwrap().unwrap();
        assert_eq!(second.step, Step::Resolve { manager: PackageManager::Npm });
        finish(&conn, second.id, TaskStatus::Failed, Some("boom"), Utc::now()).unwrap();

        assert!(claim_next(&mut conn, Utc::now()).unwrap().is_none());
        let tasks = tasks_for_request(&conn, request).unwrap();
        assert_eq!(tasks[0].status, TaskStatus::Done);
        assert_eq!(tasks[1].status, TaskStatus::Failed);
        assert_eq!(tasks[1].error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_lapsed_claims_are_requeued_then_failed() {
        let mut conn = db::open_in_memory().unwrap();
        let request = request_row(&conn);
        enqueue(&conn, request, Step::FetchSource, Utc::now()).unwrap();
        let lease = Duration::from_secs(60);
        let claimed_at = Utc::now() - chrono::Duration::minutes(10);

        // inside the lease nothing moves
        let task = claim_next(&mut conn, Utc::now()).unwrap().unwrap();
        assert!(reclaim_expired(&mut conn, lease, 2, Utc::now()).unwrap().is_empty());
        assert!(claim_next(&mut conn, Utc::now()).unwrap().is_none());

        // the claimer went away: first lapse requeues
        conn.execute(
            "UPDATE tasks SET updated_at = ?1 WHERE id = ?2",
            params![format_timestamp(claimed_at), task.id],
        )
        .unwrap();
        assert!(reclaim_expired(&mut conn, lease, 2, Utc::now()).unwrap().is_empty());
        let again = claim_next(&mut conn, claimed_at).unwrap().unwrap();
        assert_eq!(again.id, task.id);
        assert_eq!(again.attempts, 2);

        // out of attempts: failed and handed back
        let abandoned = reclaim_expired(&mut conn, lease, 2, Utc::now()).unwrap();
        assert_eq!(abandoned.len(), 1);
        assert_eq!(abandoned[0].request_id, request);
        let tasks = tasks_for_request(&conn, request).unwrap();
        assert_eq!(tasks[0].status, TaskStatus::Failed);
        assert_eq!(tasks[0].error.as_deref(), Some("Abandoned after 2 attempts"));
        assert_eq!(pending_count(&conn).unwrap(), 0);
    }
}
