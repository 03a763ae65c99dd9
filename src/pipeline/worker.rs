// src/pipeline/worker.rs

//! Submitting requests and running their steps

use chrono::Utc;
use rusqlite::Connection;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use super::queue::{self, Task, TaskStatus};
use super::{Engine, Step};
use crate::db;
use crate::error::{Error, Result};
use crate::request::{NewRequest, Request, RequestState};

/// Validates, stores and queues new requests
pub struct Dispatcher<'c> {
    conn: &'c mut Connection,
}

impl<'c> Dispatcher<'c> {
    pub fn new(conn: &'c mut Connection) -> Self {
        Self { conn }
    }

    /// Store a request, move it to `in_progress` and queue its first step
    pub fn submit(&mut self, new: NewRequest) -> Result<Request> {
        let new = new.validate()?;
        db::transaction(self.conn, |tx| {
            let now = Utc::now();
            let mut request = Request::insert(tx, &new, now)?;
            let first = Step::FetchSource;
            request.transition(tx, RequestState::InProgress, &first.progress_message(), now)?;
            queue::enqueue(tx, request.id, first, now)?;
            Ok(request)
        })
    }
}

/// What happened to one claimed task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    pub task_id: i64,
    pub request_id: i64,
    pub step: Step,
    pub status: TaskStatus,
}

/// Runs queued steps on one database connection
pub struct Worker {
    engine: Arc<Engine>,
    conn: Connection,
}

impl Worker {
    pub fn new(engine: Arc<Engine>, conn: Connection) -> Self {
        Self { engine, conn }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Claim and run the oldest pending task; `None` when the queue is empty
    ///
    /// Errors from the step itself, or from recording its result, fail the
    /// task and its request. Only a failure to reach the queue is returned.
    pub fn run_once(&mut self) -> Result<Option<TaskOutcome>> {
        self.reclaim()?;
        let Some(task) = queue::claim_next(&mut self.conn, Utc::now())? else {
            return Ok(None);
        };

        let status = match self.handle(&task) {
            Ok(status) => status,
            Err(e) => {
                error!(
                    "Task {} {} for request {} errored: {}",
                    task.id, task.step, task.request_id, e
                );
                self.abandon(&task, &e);
                TaskStatus::Failed
            }
        };

        Ok(Some(TaskOutcome {
            task_id: task.id,
            request_id: task.request_id,
            step: task.step,
            status,
        }))
    }

    /// Requeue tasks whose worker went away and fail the ones out of attempts
    fn reclaim(&mut self) -> Result<()> {
        let config = self.engine.config();
        let lease = config.task_lease()?;
        let attempts = config.worker.task_attempts;
        for task in queue::reclaim_expired(&mut self.conn, lease, attempts, Utc::now())? {
            let err = Error::CommandTimeout(format!(
                "{} did not finish after {} attempts",
                task.step, task.attempts
            ));
            if let Err(e) = Request::get(&self.conn, task.request_id)
                .and_then(|mut request| self.on_failure(&mut request, &task.step, &err))
            {
                error!("Could not fail request {}: {}", task.request_id, e);
            }
        }
        Ok(())
    }

    fn handle(&self, task: &Task) -> Result<TaskStatus> {
        let mut request = Request::get(&self.conn, task.request_id)?;

        if request.state != RequestState::InProgress {
            info!(
                "Skipping {} for request {}, which is {}",
                task.step, request.id, request.state
            );
            queue::finish(&self.conn, task.id, TaskStatus::Skipped, None, Utc::now())?;
            return Ok(TaskStatus::Skipped);
        }

        match self.run_task(&mut request, task) {
            Ok(()) => {
                queue::finish(&self.conn, task.id, TaskStatus::Done, None, Utc::now())?;
                if let Some(next) = task.step.next(&request.package_managers) {
                    queue::enqueue(&self.conn, request.id, next, Utc::now())?;
                }
                Ok(TaskStatus::Done)
            }
            Err(e) => {
                queue::finish(
                    &self.conn,
                    task.id,
                    TaskStatus::Failed,
                    Some(&e.to_string()),
                    Utc::now(),
                )?;
                self.on_failure(&mut request, &task.step, &e)?;
                Ok(TaskStatus::Failed)
            }
        }
    }

    /// Best effort: mark the task and its request failed after an unexpected error
    fn abandon(&self, task: &Task, err: &Error) {
        let finished = queue::finish(
            &self.conn,
            task.id,
            TaskStatus::Failed,
            Some(&err.to_string()),
            Utc::now(),
        );
        if let Err(e) = finished {
            error!("Could not mark task {} failed: {}", task.id, e);
        }
        let failed = Request::get(&self.conn, task.request_id)
            .and_then(|mut request| self.on_failure(&mut request, &task.step, err));
        if let Err(e) = failed {
            // the lease will hand the request to another worker
            error!("Could not fail request {}: {}", task.request_id, e);
        }
    }

    fn run_task(&self, request: &mut Request, task: &Task) -> Result<()> {
        let message = task.step.progress_message();
        if task.step == Step::Complete {
            request.transition(&self.conn, RequestState::Complete, &message, Utc::now())?;
            return Ok(());
        }
        request.transition(&self.conn, RequestState::InProgress, &message, Utc::now())?;
        let ctx = request.context(&self.engine.config().worker.bundles_dir);
        self.engine.run_step(&ctx, &task.step)
    }

    /// Record the failure on the request and release what it staged
    fn on_failure(&self, request: &mut Request, step: &Step, err: &Error) -> Result<()> {
        error!("Step {} of request {} failed: {}", step, request.id, err);
        // the request may have been moved elsewhere while the step ran
        let mut current = Request::get(&self.conn, request.id)?;
        if current.state != RequestState::InProgress {
            warn!(
                "Request {} is already {}, not marking it failed",
                current.id, current.state
            );
            *request = current;
            return Ok(());
        }
        current.transition(&self.conn, RequestState::Failed, &err.user_message(), Utc::now())?;
        self.engine
            .release(&current.context(&self.engine.config().worker.bundles_dir));
        *request = current;
        Ok(())
    }
}

/// A fixed number of workers, each with its own connection
pub struct WorkerPool {
    engine: Arc<Engine>,
    db_path: PathBuf,
    workers: usize,
    poll_interval: Duration,
}

impl WorkerPool {
    pub fn new(engine: Arc<Engine>, db_path: PathBuf, workers: usize) -> Self {
        Self {
            engine,
            db_path,
            workers: workers.max(1),
            poll_interval: Duration::from_secs(2),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Run until the queue is empty, or forever with `follow`; returns the tasks handled
    pub fn run(&self, follow: bool) -> Result<usize> {
        info!("Starting {} workers", self.workers);
        let results: Vec<Result<usize>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..self.workers)
                .map(|i| {
                    std::thread::Builder::new()
                        .name(format!("worker-{i}"))
                        .spawn_scoped(scope, move || self.work(follow))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| match handle {
                    Ok(handle) => handle
                        .join()
                        .unwrap_or_else(|_| Err(Error::IoError("worker thread panicked".into()))),
                    Err(e) => Err(Error::IoError(format!("Failed to start a worker: {e}"))),
                })
                .collect()
        });

        let mut handled = 0;
        for result in results {
            handled += result?;
        }
        Ok(handled)
    }

    fn work(&self, follow: bool) -> Result<usize> {
        let mut worker = Worker::new(self.engine.clone(), db::open(&self.db_path)?);
        let mut handled = 0;
        loop {
            let claimed = match worker.run_once() {
                Ok(claimed) => claimed,
                Err(e) if follow => {
                    error!("Worker could not reach the queue: {}", e);
                    std::thread::sleep(self.poll_interval);
                    continue;
                }
                Err(e) => return Err(e),
            };
            match claimed {
                Some(outcome) => {
                    handled += 1;
                    info!(
                        "Task {} {} for request {}: {}",
                        outcome.task_id, outcome.step, outcome.request_id, outcome.status
                    );
                }
                None if follow => std::thread::sleep(self.poll_interval),
                None => return Ok(handled),
            }
        }
    }
}
