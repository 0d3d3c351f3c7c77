//! Retry utilities for per-instance resilience
//!
//! Adapters never retry on their own. The dispatcher runs each candidate
//! instance through [`retry_with_backoff`] with the instance's own retry
//! budget and fails over once that budget is spent.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::sleep;

use crate::llm::traits::ProviderError;

/// Exponential backoff curve between attempts on the same instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Delay before the first retry
    #[serde(with = "crate::config::duration_millis", default = "default_initial_delay")]
    pub initial_delay: Duration,
    /// Maximum delay between retries (caps exponential growth)
    #[serde(with = "crate::config::duration_millis", default = "default_max_delay")]
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (e.g., 2.0 doubles delay each time)
    #[serde(default = "default_multiplier")]
    pub backoff_multiplier: f64,
    /// Whether to add random jitter so concurrent callers spread out
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl RetryConfig {
    /// No waiting between attempts (for tests)
    pub fn immediate() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(10)
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> bool {
    true
}

/// Decision about whether to retry after an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry the operation after the backoff delay
    Retry,
    /// Retry, but wait at least this long (vendor-supplied hint)
    RetryAfter(Duration),
    /// Fail immediately without retrying
    FailImmediately,
}

/// Type alias for boxed future to simplify retry function signatures
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Result of a retried operation together with the number of calls made
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: Result<T, E>,
    /// Calls made, including the first
    pub attempts: u32,
}

/// Calculate delay for exponential backoff with optional jitter.
///
/// `attempt` is zero-based: 0 is the wait before the first retry.
pub fn calculate_backoff_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let base_delay = config.initial_delay.as_millis() as f64;
    let multiplier = config.backoff_multiplier.max(1.0).powi(attempt.min(32) as i32);
    let delay_ms = (base_delay * multiplier).min(config.max_delay.as_millis() as f64) as u64;

    let delay = Duration::from_millis(delay_ms);

    if config.jitter {
        add_jitter(delay).min(config.max_delay)
    } else {
        delay
    }
}

/// Spread the delay over ±25% of its value
fn add_jitter(delay: Duration) -> Duration {
    let jitter_factor = 0.75 + 0.5 * fastrand::f64();
    Duration::from_millis((delay.as_millis() as f64 * jitter_factor) as u64)
}

/// Retry policy for classified provider errors: transient errors retry,
/// request errors fail immediately, rate limits honor `retry_after`.
pub fn should_retry_provider_error(error: &ProviderError) -> RetryDecision {
    if !error.is_transient() {
        return RetryDecision::FailImmediately;
    }
    match error.retry_after() {
        Some(hint) => RetryDecision::RetryAfter(hint),
        None => RetryDecision::Retry,
    }
}

/// Execute an operation up to `1 + max_retries` times with exponential backoff.
///
/// Sleeping suspends the task, so dropping the returned future (for
/// example on cancellation) aborts the loop between or during attempts.
pub async fn retry_with_backoff<'a, F, T, E>(
    mut operation: F,
    config: &RetryConfig,
    max_retries: u32,
    should_retry: impl Fn(&E) -> RetryDecision,
) -> RetryOutcome<T, E>
where
    F: FnMut(u32) -> BoxFuture<'a, Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        let result = operation(attempt).await;
        attempt += 1;

        let error = match result {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(attempt, "Operation succeeded on retry");
                }
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt,
                };
            }
            Err(error) => error,
        };

        let hint = match should_retry(&error) {
            RetryDecision::FailImmediately => {
                return RetryOutcome {
                    result: Err(error),
                    attempts: attempt,
                }
            }
            RetryDecision::Retry => None,
            RetryDecision::RetryAfter(hint) => Some(hint),
        };

        if attempt > max_retries {
            tracing::debug!(attempts = attempt, "Retry budget exhausted");
            return RetryOutcome {
                result: Err(error),
                attempts: attempt,
            };
        }

        let backoff = calculate_backoff_delay(attempt - 1, config);
        let delay = match hint {
            Some(hint) => backoff.max(hint.min(config.max_delay)),
            None => backoff,
        };

        tracing::debug!(
            delay_ms = delay.as_millis() as u64,
            attempt,
            max_retries,
            "Retrying operation after backoff"
        );

        if !delay.is_zero() {
            sleep(delay).await;
        }
    }
}
