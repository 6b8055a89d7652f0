//! Bounded retry of transient infrastructure errors.
//!
//! Only errors on the transient whitelist are retried; everything else is
//! returned on the first failure. The default schedule is three retries
//! after 30s, 60s and 120s.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cancellation::CancellationToken;
use crate::errors::{PhaseflowError, Result};

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base * 2^retry
    #[default]
    Exponential,
    /// delay = base * (retry + 1)
    Linear,
    /// delay = base
    Constant,
}

/// Jitter applied on top of the backoff delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// Exact delays.
    #[default]
    None,
    /// Random from 0 to delay.
    Full,
    /// Half fixed, half random.
    Equal,
    /// min(max, random(base, prev * 3))
    Decorrelated,
}

/// Retry policy for transient errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the initial attempt.
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Cap on any single delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Backoff strategy.
    pub backoff: BackoffStrategy,
    /// Jitter strategy.
    pub jitter: JitterStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 30_000,
            max_delay_ms: 120_000,
            backoff: BackoffStrategy::Exponential,
            jitter: JitterStrategy::None,
        }
    }
}

impl RetryPolicy {
    /// Creates the default policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Same retry count, no waiting. Used by tests and dry runs.
    #[must_use]
    pub fn immediate() -> Self {
        Self {
            base_delay_ms: 0,
            max_delay_ms: 0,
            ..Self::default()
        }
    }

    /// Sets the retry count.
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter = strategy;
        self
    }

    /// The un-jittered schedule, one entry per retry.
    #[must_use]
    pub fn schedule(&self) -> Vec<Duration> {
        (0..self.max_retries)
            .map(|retry| Duration::from_millis(self.base_delay(retry)))
            .collect()
    }

    fn base_delay(&self, retry: u32) -> u64 {
        let base = self.base_delay_ms;
        let delay = match self.backoff {
            BackoffStrategy::Exponential => base.saturating_mul(2u64.saturating_pow(retry)),
            BackoffStrategy::Linear => base.saturating_mul(u64::from(retry) + 1),
            BackoffStrategy::Constant => base,
        };
        delay.min(self.max_delay_ms)
    }
}

/// Retry bookkeeping for one operation.
#[derive(Debug, Default, Clone)]
pub struct RetryState {
    /// Retries performed so far.
    pub retries: u32,
    previous_delay: Option<u64>,
}

impl RetryState {
    /// Creates a new retry state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true once no retries remain.
    #[must_use]
    pub fn is_exhausted(&self, policy: &RetryPolicy) -> bool {
        self.retries >= policy.max_retries
    }

    /// Delay before the next retry, with jitter applied.
    pub fn calculate_delay(&mut self, policy: &RetryPolicy) -> Duration {
        let delay = policy.base_delay(self.retries);
        let jittered = match policy.jitter {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=delay)
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
            JitterStrategy::Decorrelated => {
                let base = policy.base_delay_ms;
                let prev = self.previous_delay.unwrap_or(base);
                let upper = prev.saturating_mul(3).min(policy.max_delay_ms);
                if upper <= base {
                    base
                } else {
                    rand::thread_rng().gen_range(base..=upper)
                }
            }
        };
        self.previous_delay = Some(jittered);
        Duration::from_millis(jittered)
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry(Duration),
    /// Transient, but no retries remain.
    GiveUp,
    /// Not on the transient whitelist.
    NotRetryable,
}

/// Decides whether `error` is retried, consuming one retry if so.
#[must_use]
pub fn should_retry(state: &mut RetryState, policy: &RetryPolicy, error: &PhaseflowError) -> RetryDecision {
    if !error.is_transient() {
        return RetryDecision::NotRetryable;
    }
    if state.is_exhausted(policy) {
        return RetryDecision::GiveUp;
    }
    let delay = state.calculate_delay(policy);
    state.retries += 1;
    RetryDecision::Retry(delay)
}

/// Sleeps for `delay` unless cancellation arrives first.
pub async fn backoff(delay: Duration, cancel: &CancellationToken) -> Result<()> {
    if delay.is_zero() {
        return cancel.ensure_active();
    }
    tokio::select! {
        () = tokio::time::sleep(delay) => Ok(()),
        () = cancel.cancelled() => cancel.ensure_active(),
    }
}

/// Executes an operation, retrying transient errors per `policy`.
///
/// Retries consumed are added to `state`, so callers can account for them.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    key: &str,
    cancel: &CancellationToken,
    state: &mut RetryState,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => match should_retry(state, policy, &e) {
                RetryDecision::Retry(delay) => {
                    debug!(
                        key = %key,
                        retry = state.retries,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Retrying after transient error"
                    );
                    backoff(delay, cancel).await?;
                }
                RetryDecision::GiveUp => {
                    warn!(key = %key, retries = state.retries, error = %e, "Retries exhausted");
                    return Err(e);
                }
                RetryDecision::NotRetryable => return Err(e),
            },
        }
    }
}
