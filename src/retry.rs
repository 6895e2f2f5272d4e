//! Retry with exponential backoff around a broker send

use crate::error::{EventError, Result};
use crate::types::Status;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default number of attempts for every typed write
pub const STD_RETRY_COUNT: u32 = 3;

/// Exponential backoff bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(5),
            max: Duration::from_secs(1),
        }
    }
}

impl BackoffPolicy {
    /// Delay after the zero-based `attempt` failed: `min(base * 2^attempt, max)`
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// Call `send` until it succeeds, fails permanently, or `max_attempts` run out
///
/// Only retryable errors are retried. Cancellation during a backoff sleep
/// returns `EventError::Cancelled` immediately. When every attempt fails
/// the last error is returned.
pub async fn retry_send<F, Fut>(
    ctx: &CancellationToken,
    max_attempts: u32,
    backoff: &BackoffPolicy,
    mut send: F,
) -> Result<Status>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Status>>,
{
    if max_attempts == 0 {
        return Err(EventError::InvalidParameter(
            "max attempts must be at least 1".to_string(),
        ));
    }

    let mut attempt = 0;
    loop {
        if ctx.is_cancelled() {
            return Err(EventError::Cancelled);
        }
        let err = match send().await {
            Ok(status) => return Ok(status),
            Err(e) => e,
        };
        attempt += 1;
        if !err.is_retryable() || attempt >= max_attempts {
            return Err(err);
        }

        let delay = backoff.delay(attempt - 1);
        tracing::debug!(
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Send failed, retrying"
        );
        tokio::select! {
            _ = ctx.cancelled() => return Err(EventError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
