// src/retry.rs

//! Bounded exponential backoff for transient failures
//!
//! Only errors for which [`Error::is_transient`] holds are retried. Anything
//! else, and the last transient failure once attempts are exhausted, is
//! returned to the caller unchanged.

use std::time::Duration;
use tracing::warn;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            backoff_factor: 1.3,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before the retry following `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        Duration::from_secs_f64(secs).min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out
    pub fn run<T, F>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    warn!("{} attempt {} failed: {}, retrying...", label, attempt, e);
                    std::thread::sleep(self.delay_for(attempt));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Whether an HTTP status should be retried
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 500 | 502 | 503 | 504)
}

/// Map a reqwest transport failure to a transient error
pub fn transport_error(context: &str, e: reqwest::Error) -> Error {
    Error::NetworkError(format!("{context}: {e}"))
}
