// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry and backoff policy.
//!
//! Two uses:
//! - [`retry`] wraps connection setup and idempotent driver calls.
//! - [`RetryConfig::backoff_delay`] spaces out background sync runs after
//!   runs that left failed items behind.
//!
//! # Example
//!
//! ```
//! use offline_sync::RetryConfig;
//! use std::time::Duration;
//!
//! // Startup: fail fast on bad config
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_retries, Some(5));
//!
//! // Sync loop: grows from 1s, capped at 5 minutes
//! let sync = RetryConfig::sync_loop(Duration::from_secs(1), Duration::from_secs(300));
//! assert_eq!(sync.backoff_delay(0), Duration::from_secs(1));
//! assert_eq!(sync.backoff_delay(3), Duration::from_secs(8));
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub max_retries: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::query()
    }
}

impl RetryConfig {
    /// Fast-fail retry for the initial durable-store connection.
    /// 5 attempts, roughly 3 seconds in total.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Open-ended reconnection once the process is running: never gives
    /// up, spacing attempts from 1s up to 5 minutes.
    #[must_use]
    pub fn daemon() -> Self {
        Self {
            max_retries: None,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            factor: 2.0,
        }
    }

    /// One try, no waiting. For callers that space attempts themselves.
    #[must_use]
    pub fn single_attempt() -> Self {
        Self {
            max_retries: Some(1),
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            factor: 1.0,
        }
    }

    /// Quick retry for single idempotent driver calls. Callers bound the
    /// whole thing with their own timeout.
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            factor: 2.0,
        }
    }

    /// Backoff between background sync runs that ended with failures.
    /// Never gives up; the loop keeps ticking for the life of the process.
    #[must_use]
    pub fn sync_loop(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries: None,
            initial_delay,
            max_delay: max_delay.max(initial_delay),
            factor: 2.0,
        }
    }

    /// Delay before the next attempt after `failures` consecutive failures.
    #[must_use]
    pub fn backoff_delay(&self, failures: u32) -> Duration {
        let mut delay = self.initial_delay;
        for _ in 0..failures {
            delay = delay.mul_f64(self.factor).min(self.max_delay);
            if delay >= self.max_delay || delay.is_zero() {
                break;
            }
        }
        delay
    }

    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }
}

pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = config.initial_delay;
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!(operation = operation_name, attempts, "Operation succeeded after retries");
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;

                match config.max_retries {
                    Some(max) if attempts >= max => return Err(err),
                    Some(max) => warn!(
                        operation = operation_name,
                        attempt = attempts,
                        max,
                        error = %err,
                        retry_in = ?delay,
                        "Operation failed, retrying"
                    ),
                    None => warn!(
                        operation = operation_name,
                        attempt = attempts,
                        error = %err,
                        retry_in = ?delay,
                        "Operation failed, will retry until it succeeds"
                    ),
                }

                sleep(delay).await;
                delay = delay.mul_f64(config.factor).min(config.max_delay);
            }
        }
    }
}
