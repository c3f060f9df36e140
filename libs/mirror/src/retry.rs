//! Bounded retry with a constant delay.
//!
//! A mirroring run is a one-shot batch, so the policy is deliberately plain:
//! a fixed number of attempts, a fixed sleep between failures, no backoff and
//! no jitter. Every attempt and every sleep races the cancellation signal.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::cancel::CancelSignal;

/// Outcome of a retried operation that did not succeed.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The cancellation signal was raised.
    Cancelled,

    /// The operation gave up; `source` is the last failure and `attempts`
    /// the number of attempts made. Fewer than the budget means the failure
    /// was not retryable.
    Exhausted { attempts: u32, source: E },
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => f.write_str("cancelled"),
            Self::Exhausted { attempts, source } => {
                write!(f, "giving up after {attempts} attempts: {source}")
            }
        }
    }
}

impl<E> std::error::Error for RetryError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Cancelled => None,
            Self::Exhausted { source, .. } => Some(source),
        }
    }
}

/// Retry configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total number of attempts, the first one included.
    pub attempts: u32,

    /// Sleep between a failed attempt and the next one.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }

    /// Run `operation` until it succeeds, the attempt budget is spent, or
    /// `cancel` fires.
    ///
    /// A zero attempt budget still runs the operation once.
    pub async fn run<T, E, F, Fut>(
        &self,
        label: &str,
        cancel: &CancelSignal,
        operation: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        self.run_if(label, cancel, |_| true, operation).await
    }

    /// Like [`run`](Self::run), but stops at the first failure for which
    /// `retryable` returns false.
    pub async fn run_if<T, E, R, F, Fut>(
        &self,
        label: &str,
        cancel: &CancelSignal,
        retryable: R,
        mut operation: F,
    ) -> Result<T, RetryError<E>>
    where
        R: Fn(&E) -> bool,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;

        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled);
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                result = operation() => result,
            };

            match result {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(label, attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if !retryable(&e) => {
                    warn!(label, attempt, error = %e, "Operation failed permanently");
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        source: e,
                    });
                }
                Err(e) if attempt < attempts => {
                    warn!(
                        label,
                        attempt,
                        max_attempts = attempts,
                        delay_secs = self.delay.as_secs_f64(),
                        error = %e,
                        "Operation failed, retrying"
                    );

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                        _ = tokio::time::sleep(self.delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => {
                    warn!(label, attempts, error = %e, "Operation failed, no attempts left");
                    return Err(RetryError::Exhausted {
                        attempts,
                        source: e,
                    });
                }
            }
        }
    }
}
