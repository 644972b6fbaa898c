//! Retry and circuit breaking combined.

use std::future::Future;
use std::sync::Arc;

use super::circuit_breaker::{CircuitBreakerRegistry, CircuitState};
use super::context::RequestContext;
use super::retry::{RetryExecutor, RetryPolicy};
use crate::config::{CircuitBreakerConfig, RetryConfig};
use crate::errors::{GitHubErrorKind, GitHubResult};
use crate::observability::Telemetry;

/// Runs calls through the endpoint group's breaker, retrying as the policy
/// allows. Every attempt asks the breaker separately.
#[derive(Debug)]
pub struct ResilienceOrchestrator {
    retry: RetryExecutor,
    breakers: Arc<CircuitBreakerRegistry>,
    policy: RetryPolicy,
}

impl ResilienceOrchestrator {
    /// Creates a new resilience orchestrator.
    pub fn new(retry: &RetryConfig, breaker: &CircuitBreakerConfig, telemetry: Telemetry) -> Self {
        Self {
            retry: RetryExecutor::new(telemetry.clone()),
            breakers: Arc::new(CircuitBreakerRegistry::new(breaker.clone(), telemetry)),
            policy: RetryPolicy::from(retry),
        }
    }

    /// Default retry policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Breaker registry.
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Breaker states by group.
    pub fn circuit_states(&self) -> Vec<(String, CircuitState)> {
        self.breakers.states()
    }

    /// Executes `operation` under the default policy.
    pub async fn execute<F, Fut, T>(
        &self,
        group: &str,
        ctx: &RequestContext,
        operation: F,
    ) -> GitHubResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = GitHubResult<T>>,
    {
        self.execute_with_policy(&self.policy, group, ctx, operation)
            .await
    }

    /// Executes `operation` under `policy`.
    ///
    /// Only server-side health failures count against the breaker. Local
    /// refusals and rate limits release the permit without touching it;
    /// every other answer from GitHub counts as healthy.
    pub async fn execute_with_policy<F, Fut, T>(
        &self,
        policy: &RetryPolicy,
        group: &str,
        ctx: &RequestContext,
        mut operation: F,
    ) -> GitHubResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = GitHubResult<T>>,
    {
        let breaker = self.breakers.get(group);
        self.retry
            .execute(policy, ctx, group, |attempt| {
                let call = breaker
                    .try_acquire()
                    .map(|permit| (permit, operation(attempt)));
                async move {
                    let (permit, call) = call?;
                    let result = call.await;
                    match &result {
                        Ok(_) => permit.success(),
                        Err(e) if e.counts_as_endpoint_failure() => permit.failure(),
                        Err(e) if e.is_local() || e.kind() == GitHubErrorKind::RateLimited => {
                            drop(permit)
                        }
                        Err(_) => permit.success(),
                    }
                    result
                }
            })
            .await
    }
}
