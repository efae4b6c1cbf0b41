//! Retry utilities for optimistic-concurrency writes.
//!
//! Every read-modify-write against a Deployment or Service runs inside
//! [`retry_on_conflict`]. The closure is invoked once per attempt and must
//! re-fetch the object it mutates, so each attempt computes its delta from
//! the latest stored version instead of a captured copy.
//!
//! # Example
//!
//! ```ignore
//! use mittens_common::retry::{retry_on_conflict, RetryConfig};
//!
//! retry_on_conflict(&RetryConfig::conflict(), "redirect Service", || async {
//!     let mut svc = store.get_service(ns, name).await?;
//!     mutate(&mut svc);
//!     store.replace_service(ns, &svc).await
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

use crate::Error;

/// Attempts made for a conflicting update before giving up
pub const DEFAULT_CONFLICT_ATTEMPTS: u32 = 5;

/// Configuration for bounded retries with exponential backoff and jitter.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::conflict()
    }
}

impl RetryConfig {
    /// Budget for update conflicts: a handful of quick attempts.
    pub fn conflict() -> Self {
        Self {
            max_attempts: DEFAULT_CONFLICT_ATTEMPTS,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
        }
    }

    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Self::conflict()
        }
    }
}

/// Execute an async operation, retrying while `should_retry` accepts the error.
///
/// Errors rejected by `should_retry` are returned immediately. Once
/// `max_attempts` is reached the last error is returned unchanged.
pub async fn retry_with_backoff_when<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !should_retry(&e) => return Err(e),
            Err(e) => {
                if attempt >= config.max_attempts.max(1) {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                // Add jitter: 0.5x to 1.5x of the delay
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(jittered_delay).await;

                // Exponential backoff, capped at max_delay
                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}

/// Retry a read-modify-write while it fails with [`Error::Conflict`].
///
/// Any other error aborts immediately. Exhausting the budget surfaces
/// [`Error::RetriesExhausted`] wrapping the last conflict.
pub async fn retry_on_conflict<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    retry_with_backoff_when(config, operation_name, Error::is_conflict, operation)
        .await
        .map_err(|e| {
            if e.is_conflict() {
                Error::RetriesExhausted {
                    operation: operation_name.to_string(),
                    attempts: config.max_attempts.max(1),
                    source: Box::new(e),
                }
            } else {
                e
            }
        })
}
