// src/process.rs

//! Subprocess execution with deadlines
//!
//! Every external tool (`git`, `go`) runs through [`CommandRunner`]. stdin is
//! always null, stdout and stderr are drained on their own threads so a
//! chatty tool can never fill a pipe and stall, and a deadline kills the
//! child. A timeout is reported as [`Error::CommandTimeout`], which is
//! transient and therefore retried by callers holding a retry policy.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

use crate::error::{Error, Result};

/// Default deadline for one subprocess
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3600);

/// Lines of stderr kept in a failure message
const STDERR_TAIL_LINES: usize = 20;

/// Captured result of a successful run
#[derive(Debug, Clone)]
pub struct Output {
    pub stdout: String,
    pub stderr: String,
}

/// Runs external tools with explicit environment overrides
#[derive(Debug, Clone)]
pub struct CommandRunner {
    timeout: Duration,
    env: BTreeMap<String, String>,
}

impl Default for CommandRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRunner {
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            env: BTreeMap::new(),
        }
    }

    /// Set custom timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Add an environment override applied to every command
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Locate an executable on `PATH`
    pub fn resolve(program: &str) -> Result<PathBuf> {
        which::which(program).map_err(|_| {
            Error::CommandFailed(format!("The {program} executable was not found on PATH"))
        })
    }

    /// Run `program args...` in `cwd` and return its output
    pub fn run(&self, program: &str, args: &[&str], cwd: &Path) -> Result<Output> {
        let executable = Self::resolve(program)?;
        let command_line = format!("{} {}", program, args.join(" "));
        debug!("Running `{}` in {}", command_line, cwd.display());

        let mut child = Command::new(&executable)
            .args(args)
            .current_dir(cwd)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::CommandFailed(format!("Failed to spawn `{command_line}`: {e}")))?;

        let stdout_reader = child.stdout.take().map(drain);
        let stderr_reader = child.stderr.take().map(drain);

        let status = match child.wait_timeout(self.timeout)? {
            Some(status) => status,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::CommandTimeout(format!(
                    "`{}` timed out after {} seconds",
                    command_line,
                    self.timeout.as_secs()
                )));
            }
        };

        let stdout = join_reader(stdout_reader);
        let stderr = join_reader(stderr_reader);

        for line in stdout.lines() {
            debug!("[{}] {}", program, line);
        }
        for line in stderr.lines() {
            warn!("[{}] {}", program, line);
        }

        if status.success() {
            Ok(Output { stdout, stderr })
        } else {
            let code = status.code().unwrap_or(-1);
            Err(Error::CommandFailed(format!(
                "`{}` failed with exit code {}: {}",
                command_line,
                code,
                stderr_tail(&stderr)
            )))
        }
    }
}

fn drain<R: Read + Send + 'static>(mut reader: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn join_reader(handle: Option<thread::JoinHandle<String>>) -> String {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.trim().lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_run_captures_stdout() {
        let dir = tempdir().unwrap();
        let output = CommandRunner::new()
            .run("sh", &["-c", "echo hello"], dir.path())
            .unwrap();
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[test]
    fn test_debug_logging_names_command_line() {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
        let dir = tempdir().unwrap();
        let err = CommandRunner::new()
            .run("sh", &["-c", "exit 2"], dir.path())
            .unwrap_err();
        assert!(err.to_string().contains("`sh -c exit 2` failed with exit code 2"));
    }

    #[test]
    fn test_env_overrides() {
        let dir = tempdir().unwrap();
        let output = CommandRunner::new()
            .with_env("DEPSTAGE_TEST_VALUE", "42")
            .run("sh", &["-c", "echo $DEPSTAGE_TEST_VALUE"], dir.path())
            .unwrap();
        assert_eq!(output.stdout.trim(), "42");
    }

    #[test]
    fn test_failure_carries_stderr() {
        let dir = tempdir().unwrap();
        let err = CommandRunner::new()
            .run("sh", &["-c", "echo broken >&2; exit 3"], dir.path())
            .unwrap_err();
        match err {
            Error::CommandFailed(msg) => {
                assert!(msg.contains("exit code 3"));
                assert!(msg.contains("broken"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_timeout_is_transient() {
        let dir = tempdir().unwrap();
        let err = CommandRunner::new()
            .with_timeout(Duration::from_millis(100))
            .run("sh", &["-c", "sleep 5"], dir.path())
            .unwrap_err();
        assert!(matches!(err, Error::CommandTimeout(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn test_missing_program() {
        let dir = tempdir().unwrap();
        let err = CommandRunner::new()
            .run("definitely-not-a-real-tool", &[], dir.path())
            .unwrap_err();
        assert!(matches!(err, Error::CommandFailed(_)));
    }
}
