use super::backend::StorageResult;

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounded retry with fixed backoff for blocking backend calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "crate::config::duration_millis")]
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::ZERO,
        }
    }

    /// Runs `call` until it succeeds, fails with a non-retryable error, or
    /// `max_attempts` is exhausted. Sleeps the calling thread between attempts,
    /// so only use it from blocking contexts.
    pub fn run<T>(&self, what: &str, mut call: impl FnMut() -> StorageResult<T>) -> StorageResult<T> {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match call() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    tracing::warn!(
                        "{} failed (attempt {}/{}): {}, retrying",
                        what,
                        attempt,
                        attempts,
                        e
                    );
                    std::thread::sleep(self.backoff);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
