//! Retry helpers for discovery and API traffic.
//!
//! Discovery retries re-run the whole capture immediately since the
//! failure mode is a flaky page, not a congested service. API calls back
//! off exponentially per [`RetryPolicy`] and honor server-provided
//! Retry-After hints.

use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use argus_common::RetryPolicy;

use crate::api::{ApiError, ApiResult};
use crate::error::{Error, Result};

/// Re-run `op` until it succeeds or `attempts` are used up.
///
/// Only transient errors are retried; aborts and permanent failures
/// propagate immediately. Cancellation is checked between attempts so a
/// stopping build does not start another capture.
pub async fn with_retries<T, F, Fut>(
    attempts: u32,
    cancel: &CancellationToken,
    what: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);

    for attempt in 1..=attempts {
        if cancel.is_cancelled() {
            return Err(Error::Aborted);
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retryable() || attempt == attempts => return Err(err),
            Err(err) => {
                info!("Retrying {what} after error: {err}");
            }
        }
    }

    unreachable!("loop returns on the final attempt")
}

/// Retry an API call with exponential backoff.
///
/// Non-retryable errors and exhausted attempts return the last error.
/// A rate-limit response with a Retry-After hint overrides the computed
/// delay for that attempt. Cancellation during a backoff sleep gives up
/// and returns the pending error.
pub async fn with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    what: &str,
    mut op: F,
) -> ApiResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ApiResult<T>>,
{
    let attempts = policy.max_attempts.max(1);

    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retryable() || attempt == attempts => return Err(err),
            Err(err) => {
                let delay = match &err {
                    ApiError::RateLimit { retry_after: Some(after) } => *after,
                    _ => policy.delay_for(attempt),
                };

                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "{what} failed, backing off: {err}"
                );

                tokio::select! {
                    _ = cancel.cancelled() => return Err(err),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    unreachable!("loop returns on the final attempt")
}
