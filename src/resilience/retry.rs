//! Retry executor with exponential backoff and full jitter.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use super::context::RequestContext;
use crate::config::RetryConfig;
use crate::errors::{ErrorClass, GitHubError, GitHubResult};
use crate::observability::{Telemetry, TelemetryEvent};

/// Retry limits for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first one.
    pub max_attempts: u32,
    /// Backoff ceiling of the first retry.
    pub initial_backoff: Duration,
    /// Cap of any backoff ceiling.
    pub max_backoff: Duration,
    /// Budget for all attempts and waits together.
    pub max_elapsed: Duration,
    /// Retry a primary rate limit without sleeping; the next attempt picks
    /// another credential.
    pub rotate_on_rate_limit: bool,
    /// Longest accepted sleep until a rate-limit reset.
    pub max_rate_limit_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: config.initial_backoff,
            max_backoff: config.max_backoff,
            max_elapsed: config.max_elapsed,
            rotate_on_rate_limit: config.rotate_on_rate_limit,
            max_rate_limit_wait: config.max_rate_limit_wait,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Upper bound of the backoff after `attempt` failed attempts.
    pub fn backoff_ceiling(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Full jitter: uniform in `[0, ceiling]`.
    pub fn jittered_backoff(&self, attempt: u32) -> Duration {
        let ceiling = self.backoff_ceiling(attempt).as_millis() as u64;
        if ceiling == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling))
    }

    /// Delay before the next attempt, or `None` to give up.
    fn delay_for(&self, error: &GitHubError, attempt: u32) -> Option<Duration> {
        match error.class() {
            ErrorClass::NonRetryable => None,
            ErrorClass::Transient => {
                let backoff = self.jittered_backoff(attempt);
                Some(match error.server_retry_after() {
                    Some(server) => backoff.max(server),
                    None => backoff,
                })
            }
            ErrorClass::AfterWait => {
                if self.rotate_on_rate_limit {
                    return Some(Duration::ZERO);
                }
                let wait = error.retry_after().unwrap_or(self.max_backoff);
                (wait <= self.max_rate_limit_wait).then_some(wait)
            }
        }
    }
}

/// Runs an operation under a [`RetryPolicy`].
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    telemetry: Telemetry,
}

impl RetryExecutor {
    /// Creates an executor reporting through `telemetry`.
    pub fn new(telemetry: Telemetry) -> Self {
        Self { telemetry }
    }

    /// Calls `operation` with the attempt number (from 1) until it succeeds,
    /// fails with a non-retryable error, or a limit is reached. The last
    /// error is returned unchanged.
    pub async fn execute<F, Fut, T>(
        &self,
        policy: &RetryPolicy,
        ctx: &RequestContext,
        group: &str,
        mut operation: F,
    ) -> GitHubResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = GitHubResult<T>>,
    {
        let started = Instant::now();
        let mut attempt = 0;

        loop {
            attempt += 1;
            ctx.check()?;

            let error = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if attempt >= policy.max_attempts {
                return Err(error);
            }
            let delay = match policy.delay_for(&error, attempt) {
                Some(delay) => delay,
                None => return Err(error),
            };
            if started.elapsed() + delay > policy.max_elapsed {
                tracing::debug!(group = %group, attempt, "Retry budget exhausted");
                return Err(error);
            }
            if ctx.remaining().map(|left| delay > left).unwrap_or(false) {
                return Err(error);
            }

            self.telemetry.emit(TelemetryEvent::RetryScheduled {
                group: group.to_string(),
                attempt,
                delay,
                error: error.kind(),
            });
            if !delay.is_zero() {
                ctx.sleep(delay).await?;
            }
        }
    }
}
