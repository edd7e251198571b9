//! Exponential backoff for admin API calls.
//!
//! Transient control-plane failures (HTTP 5xx) are absorbed here; everything
//! else surfaces immediately. After the guarded retries are exhausted one
//! final unguarded attempt runs so a persistent error reaches the caller
//! verbatim rather than wrapped in retry bookkeeping.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};

/// Golden-ratio multiplier between successive delays.
const BACKOFF_MULTIPLIER: f64 = 1.618;

#[derive(Debug, Clone)]
pub(crate) struct BackoffPolicy {
    pub base: Duration,
    pub multiplier: f64,
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(200),
            multiplier: BACKOFF_MULTIPLIER,
            max_retries: 5,
        }
    }
}

impl BackoffPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        self.base.mul_f64(self.multiplier.powi(attempt as i32))
    }
}

/// Runs `op`, sleeping between retryable failures per `policy`.
///
/// The delay before retry `n` is `base * multiplier^n`. Non-retryable errors
/// and cancellation cut the loop short.
pub(crate) async fn with_backoff<T, F, Fut>(
    policy: &BackoffPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    for attempt in 1..=policy.max_retries {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() => {
                let delay = policy.delay(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying after transient failure");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => return Err(e),
        }
    }
    op().await
}

/// Races a fallible future against the caller's cancellation signal.
pub(crate) async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = fut => result,
    }
}
