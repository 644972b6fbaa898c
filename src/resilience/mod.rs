//! Resilience patterns for the GitHub access layer.
//!
//! - [`RateLimitTracker`]: per-credential budget windows with reservations
//! - [`RetryExecutor`]: classified retries with full-jitter backoff
//! - [`CircuitBreaker`]: per-endpoint-group breakers with a single trial call
//! - [`ResilienceOrchestrator`]: retries wrapped around breaker permits
//! - [`RequestContext`]: caller deadline, cancellation and wait policy

mod circuit_breaker;
mod context;
mod orchestrator;
mod rate_limit;
mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerRegistry, CircuitPermit, CircuitState};
pub use context::{RequestContext, WaitPolicy};
pub use orchestrator::ResilienceOrchestrator;
pub use rate_limit::{
    ApiSurface, BudgetDecision, BudgetSnapshot, GraphQlRateLimit, RateLimitTracker,
    RateLimitWindow, Reservation,
};
pub use retry::{RetryExecutor, RetryPolicy};
