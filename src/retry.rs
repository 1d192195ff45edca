#![forbid(unsafe_code)]

//! Retry-with-backoff for collaborator calls.
//!
//! The delay computation is a pure function of the attempt number so it can
//! be tested on its own; [`with_retry`] only decides whether to call it.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Whether a failure is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
}

pub trait Classify {
    fn class(&self) -> ErrorClass;
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay after the first failed attempt; doubles for every further one.
    pub base_delay: Duration,
    /// Hard cap on any single backoff delay, jitter included.
    pub max_delay: Duration,
    /// Adds up to `base_delay / 2` of random delay so concurrent tasks do not
    /// retry in lockstep.
    pub jitter: bool,
    /// Initial delay added per dispatch position.
    pub stagger_step: Duration,
    pub stagger_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(60),
            jitter: true,
            stagger_step: Duration::from_millis(750),
            stagger_cap: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based).
    ///
    /// `jitter_unit` is a sample from `[0, 1)`; it is ignored when jitter is
    /// disabled. The result never exceeds `max_delay`.
    pub fn backoff_delay(&self, attempt: u32, jitter_unit: f64) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let multiplier = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        let capped = self
            .base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        if !self.jitter {
            return capped;
        }

        let headroom = self.max_delay.saturating_sub(capped);
        let jitter_limit = (self.base_delay / 2).min(headroom);
        let unit = if jitter_unit.is_finite() {
            jitter_unit.clamp(0.0, 1.0)
        } else {
            0.0
        };
        (capped + jitter_limit.mul_f64(unit)).min(self.max_delay)
    }

    /// Initial delay for the task at `index` in dispatch order.
    pub fn stagger_delay(&self, index: usize) -> Duration {
        let index = u32::try_from(index).unwrap_or(u32::MAX);
        self.stagger_step
            .saturating_mul(index)
            .min(self.stagger_cap)
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Terminal outcome of a retried operation.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryError<E> {
    /// Every attempt failed with a transient error.
    Exhausted { attempts: u32, last: E },
    /// A permanent error ended the loop early.
    Permanent { attempts: u32, error: E },
    /// The run was cancelled while waiting to retry.
    Cancelled,
}

impl<E: Display> Display for RetryError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryError::Exhausted { attempts, last } => {
                write!(f, "{last} (gave up after {attempts} attempts)")
            }
            RetryError::Permanent { error, .. } => write!(f, "{error}"),
            RetryError::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Runs `operation` until it succeeds, fails permanently, or the attempt
/// ceiling is reached. The closure receives the 1-based attempt number.
///
/// Backoff sleeps end early when `cancel` fires.
pub async fn with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    label: &str,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify + Display,
{
    let max_attempts = policy.attempts();
    let mut attempt = 1;
    loop {
        let err = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if err.class() == ErrorClass::Permanent {
            debug!(label, attempt, error = %err, "permanent failure, not retrying");
            return Err(RetryError::Permanent {
                attempts: attempt,
                error: err,
            });
        }
        if attempt >= max_attempts {
            warn!(label, attempts = attempt, error = %err, "retry budget exhausted");
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last: err,
            });
        }

        let delay = policy.backoff_delay(attempt, rand::rng().random::<f64>());
        warn!(
            label,
            attempt,
            max = max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retrying after transient error"
        );
        tokio::select! {
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}
