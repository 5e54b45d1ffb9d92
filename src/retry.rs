// src/retry.rs

//! Retry wrapper for transient backend errors
//!
//! Exponential backoff with jitter around command execution. Only errors
//! classified transient by [`Error::is_transient`] (busy, locked, I/O) are
//! retried; logical errors such as concurrency conflicts or constraint
//! violations surface immediately. Retries are never applied across a
//! successful commit.

use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::{Error, Result};

/// Backoff policy for transient failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay randomized in both directions, 0.0..=1.0
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            jitter: 0.25,
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

    /// Delay before the given retry (1-based), with jitter applied
    fn delay_for(&self, retry: u32) -> Duration {
        let exponential = self
            .base_delay
            .saturating_mul(1u32 << (retry - 1).min(16))
            .min(self.max_delay);
        if self.jitter <= 0.0 {
            return exponential;
        }
        let spread = rand::rng().random_range(-self.jitter..=self.jitter);
        let jittered = exponential.as_secs_f64() * (1.0 + spread);
        Duration::from_secs_f64(jittered.max(0.0))
    }

    /// Run `f`, retrying transient failures up to the attempt budget
    pub fn run<T>(&self, operation: &str, mut f: impl FnMut() -> Result<T>) -> Result<T> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match f() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_attempts.max(1) => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation,
                        attempt,
                        ?delay,
                        error = %err,
                        "transient backend error, retrying"
                    );
                    std::thread::sleep(delay);
                }
                Err(err) => return Err(err),
            }
        }
    }
}
