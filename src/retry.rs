//! Bounded retry with fixed or fixed-plus-linear backoff
//!
//! Used around teardown I/O, where a transient failure should not leave the
//! channel half-closed.

use crate::error::TransportResult;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Delay schedule between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay before every retry
    Fixed(Duration),
    /// `initial + increment * (retry - 1)`
    Linear {
        initial: Duration,
        increment: Duration,
    },
}

/// Retry policy for transient transport failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt (total attempts = 1 + max_retries)
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::close_default()
    }
}

impl RetryPolicy {
    /// Five retries, one second apart plus one second per retry
    pub fn close_default() -> Self {
        Self::linear(5, Duration::from_secs(1), Duration::from_secs(1))
    }

    pub fn no_retry() -> Self {
        Self::fixed(0, Duration::ZERO)
    }

    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Fixed(delay),
        }
    }

    pub fn linear(max_retries: u32, initial: Duration, increment: Duration) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Linear { initial, increment },
        }
    }

    /// Delay before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed(delay) => delay,
            Backoff::Linear { initial, increment } => {
                initial + increment.saturating_mul(retry.saturating_sub(1))
            }
        }
    }

    /// Calculate the total time spent sleeping if every attempt fails
    pub fn max_total_delay(&self) -> Duration {
        (1..=self.max_retries).map(|retry| self.delay_for(retry)).sum()
    }

    /// Run `operation`, retrying while it fails with a transient error
    pub async fn execute<F, Fut, T>(&self, operation_name: &str, mut operation: F) -> TransportResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = TransportResult<T>>,
    {
        let mut retry = 0;
        loop {
            match operation().await {
                Ok(value) => {
                    if retry > 0 {
                        debug!(
                            "Operation '{}' succeeded after {} attempts",
                            operation_name,
                            retry + 1
                        );
                    }
                    return Ok(value);
                }
                Err(error) if !error.is_transient() => {
                    debug!(
                        "Operation '{}' failed with non-retryable error: {}",
                        operation_name, error
                    );
                    return Err(error);
                }
                Err(error) if retry >= self.max_retries => {
                    warn!(
                        "Operation '{}' failed after {} attempts: {}",
                        operation_name,
                        retry + 1,
                        error
                    );
                    return Err(error);
                }
                Err(error) => {
                    retry += 1;
                    let delay = self.delay_for(retry);
                    debug!(
                        "Operation '{}' failed (attempt {}), retrying in {:?}: {}",
                        operation_name, retry, delay, error
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}
