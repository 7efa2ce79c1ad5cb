//! Timeout-and-retry runner.
//!
//! A [`RetryPolicy`] is a schedule: one timeout per attempt and one backoff
//! before each retry. Only timeouts are retried. Every attempt runs on its own
//! task, so an attempt that times out is abandoned rather than cancelled and
//! its late result is dropped.

use core_runtime::config::SessionSettings;
use futures::future::BoxFuture;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{AuthError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Timeout of each attempt, in order. Its length is the attempt budget.
    pub timeouts: Vec<Duration>,
    /// Delay before attempt `n + 1`
    pub backoffs: Vec<Duration>,
}

/// Passed to the attempt factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    /// Zero-based
    pub index: usize,
    pub timeout: Duration,
}

impl Attempt {
    pub fn is_retry(&self) -> bool {
        self.index > 0
    }
}

impl RetryPolicy {
    pub fn new(timeouts: Vec<Duration>, backoffs: Vec<Duration>) -> Self {
        Self { timeouts, backoffs }
    }

    /// One attempt, no retry.
    pub fn single(timeout: Duration) -> Self {
        Self::new(vec![timeout], Vec::new())
    }

    /// 5 s, then 1 s backoff and 10 s.
    pub fn session_fetch() -> Self {
        Self::new(
            vec![Duration::from_secs(5), Duration::from_secs(10)],
            vec![Duration::from_secs(1)],
        )
    }

    pub fn from_settings(settings: &SessionSettings) -> Self {
        Self::new(
            settings.fetch_timeouts.clone(),
            settings.fetch_backoffs.clone(),
        )
    }

    pub fn max_attempts(&self) -> usize {
        self.timeouts.len()
    }

    /// Upper bound on the wall time of [`run`](Self::run).
    pub fn worst_case(&self) -> Duration {
        let retries = self.max_attempts().saturating_sub(1);
        self.timeouts.iter().sum::<Duration>()
            + self.backoffs.iter().take(retries).sum::<Duration>()
    }

    /// Run `make_attempt` until it succeeds, fails with anything other than
    /// a timeout, or the schedule is exhausted.
    pub async fn run<T, F>(&self, operation: &str, mut make_attempt: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnMut(Attempt) -> BoxFuture<'static, Result<T>>,
    {
        let mut last_error = AuthError::timeout(operation);

        for (index, &timeout) in self.timeouts.iter().enumerate() {
            if index > 0 {
                let backoff = self.backoffs.get(index - 1).copied().unwrap_or_default();
                debug!(
                    operation,
                    attempt = index + 1,
                    backoff_ms = backoff.as_millis() as u64,
                    "Backing off before retry"
                );
                tokio::time::sleep(backoff).await;
            }

            let attempt = Attempt { index, timeout };
            let handle = tokio::spawn(make_attempt(attempt));

            let error = match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(Ok(value))) => {
                    if index > 0 {
                        debug!(operation, attempts = index + 1, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Ok(Ok(Err(error))) => error,
                Ok(Err(join_error)) => {
                    AuthError::Internal(format!("{} attempt aborted: {}", operation, join_error))
                }
                Err(_) => AuthError::timeout(format!("{} after {:?}", operation, timeout)),
            };

            if !error.is_timeout() {
                warn!(
                    operation,
                    attempt = index + 1,
                    error = %error,
                    "Attempt failed, not retrying"
                );
                return Err(error);
            }

            warn!(
                operation,
                attempt = index + 1,
                max_attempts = self.max_attempts(),
                timeout_ms = timeout.as_millis() as u64,
                "Attempt timed out"
            );
            last_error = error;
        }

        Err(last_error)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::session_fetch()
    }
}
