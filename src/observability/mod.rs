//! Observability: metrics, telemetry events and logging.
//!
//! Components report what they do through a [`Telemetry`] handle. Every event
//! bumps the matching [`Metrics`] counter and is forwarded to a
//! [`TelemetrySink`]; the default sink writes structured `tracing` events.

mod logging;

pub use logging::{LogFormat, LogLevel, LoggingConfig};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::auth::CredentialId;
use crate::errors::GitHubErrorKind;
use crate::resilience::{ApiSurface, CircuitState};

/// Something observable happened inside the access layer.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    /// A request was sent to GitHub.
    RequestSent {
        /// Endpoint group.
        group: String,
        /// Credential used.
        credential_id: CredentialId,
    },
    /// A request finished with a response or transport error.
    RequestCompleted {
        /// Endpoint group.
        group: String,
        /// HTTP status, absent on transport errors.
        status: Option<u16>,
        /// Latency.
        latency: Duration,
    },
    /// A failed attempt will be retried.
    RetryScheduled {
        /// Endpoint group.
        group: String,
        /// Attempt that failed, starting at 1.
        attempt: u32,
        /// Delay before the next attempt.
        delay: Duration,
        /// Failure kind.
        error: GitHubErrorKind,
    },
    /// A circuit breaker changed state.
    CircuitTransition {
        /// Endpoint group.
        group: String,
        /// Previous state.
        from: CircuitState,
        /// New state.
        to: CircuitState,
    },
    /// A call was rejected by an open circuit.
    CircuitRejected {
        /// Endpoint group.
        group: String,
    },
    /// Budget state changed after a response.
    RateLimitUpdated {
        /// Credential.
        credential_id: CredentialId,
        /// API surface.
        surface: ApiSurface,
        /// Window limit.
        limit: u32,
        /// Remaining units.
        remaining: u32,
        /// Server-reported reset time.
        reset_at: DateTime<Utc>,
    },
    /// A request could not get budget.
    BudgetExhausted {
        /// API surface.
        surface: ApiSurface,
        /// Time until the earliest reset, if known.
        wait: Option<Duration>,
    },
    /// A credential was quarantined until its window resets.
    CredentialQuarantined {
        /// Credential.
        credential_id: CredentialId,
        /// End of quarantine.
        until: DateTime<Utc>,
    },
    /// A quarantined credential became active again.
    CredentialRestored {
        /// Credential.
        credential_id: CredentialId,
    },
    /// An App installation token was refreshed.
    CredentialRefreshed {
        /// Credential.
        credential_id: CredentialId,
        /// New expiry.
        expires_at: DateTime<Utc>,
    },
    /// A credential can no longer be used.
    CredentialExpired {
        /// Credential.
        credential_id: CredentialId,
        /// Why.
        reason: String,
    },
    /// A fresh cache entry answered without a request.
    CacheHit {
        /// Request signature.
        signature: String,
    },
    /// A 304 confirmed a cached entry.
    CacheRevalidated {
        /// Request signature.
        signature: String,
    },
    /// A response was stored.
    CacheStored {
        /// Request signature.
        signature: String,
    },
    /// Maintenance evicted entries.
    CacheEvicted {
        /// Evicted count.
        count: usize,
    },
    /// A caller joined an in-flight request.
    RequestCoalesced {
        /// Request signature.
        signature: String,
    },
    /// GraphQL cost reported by the server.
    GraphQlCostReconciled {
        /// Credential.
        credential_id: CredentialId,
        /// Points reserved before sending.
        estimated: u32,
        /// Points charged by GitHub.
        actual: u32,
    },
    /// An oversized query was split.
    QueryPlanned {
        /// Estimated node cost of the whole query.
        estimated_cost: u64,
        /// Number of sub-queries.
        sub_queries: usize,
    },
    /// An inbound webhook delivery was refused.
    WebhookRejected {
        /// Delivery id, when the header was present.
        delivery_id: Option<String>,
        /// Why.
        reason: GitHubErrorKind,
    },
}

/// Installs the global `tracing` subscriber described by `config`.
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(config: LoggingConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    config.init()
}

/// Receives telemetry events.
pub trait TelemetrySink: Send + Sync {
    /// Records one event. Must not block.
    fn record(&self, event: &TelemetryEvent);
}

/// Sink writing every event as a structured `tracing` record.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn record(&self, event: &TelemetryEvent) {
        match event {
            TelemetryEvent::RequestSent {
                group,
                credential_id,
            } => debug!(group = %group, credential_id = %credential_id, "GitHub request sent"),
            TelemetryEvent::RequestCompleted {
                group,
                status,
                latency,
            } => debug!(
                group = %group,
                status = status.unwrap_or(0),
                duration_ms = latency.as_millis() as u64,
                "GitHub request completed"
            ),
            TelemetryEvent::RetryScheduled {
                group,
                attempt,
                delay,
                error,
            } => warn!(
                group = %group,
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying GitHub request"
            ),
            TelemetryEvent::CircuitTransition { group, from, to } => warn!(
                group = %group,
                old_state = ?from,
                new_state = ?to,
                "Circuit breaker state changed"
            ),
            TelemetryEvent::CircuitRejected { group } => {
                debug!(group = %group, "Circuit open, failing fast")
            }
            TelemetryEvent::RateLimitUpdated {
                credential_id,
                surface,
                limit,
                remaining,
                reset_at,
            } => debug!(
                credential_id = %credential_id,
                surface = %surface,
                limit = limit,
                remaining = remaining,
                reset_at = %reset_at,
                "Rate limit updated"
            ),
            TelemetryEvent::BudgetExhausted { surface, wait } => warn!(
                surface = %surface,
                wait_ms = wait.map(|w| w.as_millis() as u64),
                "No credential has budget"
            ),
            TelemetryEvent::CredentialQuarantined {
                credential_id,
                until,
            } => warn!(credential_id = %credential_id, until = %until, "Credential quarantined"),
            TelemetryEvent::CredentialRestored { credential_id } => {
                info!(credential_id = %credential_id, "Credential restored")
            }
            TelemetryEvent::CredentialRefreshed {
                credential_id,
                expires_at,
            } => info!(
                credential_id = %credential_id,
                expires_at = %expires_at,
                "Installation token refreshed"
            ),
            TelemetryEvent::CredentialExpired {
                credential_id,
                reason,
            } => warn!(credential_id = %credential_id, reason = %reason, "Credential expired"),
            TelemetryEvent::CacheHit { signature } => debug!(signature = %signature, "Cache hit"),
            TelemetryEvent::CacheRevalidated { signature } => {
                debug!(signature = %signature, "Cache entry revalidated")
            }
            TelemetryEvent::CacheStored { signature } => {
                debug!(signature = %signature, "Cache entry stored")
            }
            TelemetryEvent::CacheEvicted { count } => debug!(count = count, "Cache entries evicted"),
            TelemetryEvent::RequestCoalesced { signature } => {
                debug!(signature = %signature, "Joined in-flight request")
            }
            TelemetryEvent::GraphQlCostReconciled {
                credential_id,
                estimated,
                actual,
            } => debug!(
                credential_id = %credential_id,
                estimated = estimated,
                actual = actual,
                "GraphQL cost reconciled"
            ),
            TelemetryEvent::QueryPlanned {
                estimated_cost,
                sub_queries,
            } => info!(
                estimated_cost = estimated_cost,
                sub_queries = sub_queries,
                "GraphQL query split"
            ),
            TelemetryEvent::WebhookRejected {
                delivery_id,
                reason,
            } => warn!(
                delivery_id = delivery_id.as_deref().unwrap_or("-"),
                reason = ?reason,
                "Webhook delivery rejected"
            ),
        }
    }
}

/// Metrics collector for the access layer.
#[derive(Debug, Default)]
pub struct Metrics {
    requests_total: AtomicU64,
    requests_success: AtomicU64,
    requests_failed: AtomicU64,
    requests_retried: AtomicU64,
    requests_rate_limited: AtomicU64,
    requests_circuit_broken: AtomicU64,
    cache_hits: AtomicU64,
    cache_revalidations: AtomicU64,
    requests_coalesced: AtomicU64,
    credentials_quarantined: AtomicU64,
    webhooks_rejected: AtomicU64,
    latency_total_us: AtomicU64,
    latency_count: AtomicU64,
}

impl Metrics {
    /// Creates a new metrics collector.
    pub fn new() -> Self {
        Self::default()
    }

    fn observe(&self, event: &TelemetryEvent) {
        let counter = match event {
            TelemetryEvent::RequestSent { .. } => &self.requests_total,
            TelemetryEvent::RequestCompleted { status, latency, .. } => {
                self.latency_total_us
                    .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
                self.latency_count.fetch_add(1, Ordering::Relaxed);
                match status {
                    Some(code) if *code < 400 => &self.requests_success,
                    _ => &self.requests_failed,
                }
            }
            TelemetryEvent::RetryScheduled { .. } => &self.requests_retried,
            TelemetryEvent::BudgetExhausted { .. } => &self.requests_rate_limited,
            TelemetryEvent::CircuitRejected { .. } => &self.requests_circuit_broken,
            TelemetryEvent::CacheHit { .. } => &self.cache_hits,
            TelemetryEvent::CacheRevalidated { .. } => &self.cache_revalidations,
            TelemetryEvent::RequestCoalesced { .. } => &self.requests_coalesced,
            TelemetryEvent::CredentialQuarantined { .. } => &self.credentials_quarantined,
            TelemetryEvent::WebhookRejected { .. } => &self.webhooks_rejected,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Gets a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let count = self.latency_count.load(Ordering::Relaxed);
        let total = self.latency_total_us.load(Ordering::Relaxed);
        MetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success: self.requests_success.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            requests_retried: self.requests_retried.load(Ordering::Relaxed),
            requests_rate_limited: self.requests_rate_limited.load(Ordering::Relaxed),
            requests_circuit_broken: self.requests_circuit_broken.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_revalidations: self.cache_revalidations.load(Ordering::Relaxed),
            requests_coalesced: self.requests_coalesced.load(Ordering::Relaxed),
            credentials_quarantined: self.credentials_quarantined.load(Ordering::Relaxed),
            webhooks_rejected: self.webhooks_rejected.load(Ordering::Relaxed),
            average_latency_us: if count == 0 { 0 } else { total / count },
        }
    }
}

/// A snapshot of metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Requests sent to GitHub.
    pub requests_total: u64,
    /// Responses below 400.
    pub requests_success: u64,
    /// Error responses and transport failures.
    pub requests_failed: u64,
    /// Retries scheduled.
    pub requests_retried: u64,
    /// Requests refused for lack of budget.
    pub requests_rate_limited: u64,
    /// Requests refused by an open circuit.
    pub requests_circuit_broken: u64,
    /// Fresh cache hits.
    pub cache_hits: u64,
    /// 304 revalidations.
    pub cache_revalidations: u64,
    /// Callers that joined an in-flight request.
    pub requests_coalesced: u64,
    /// Quarantines applied.
    pub credentials_quarantined: u64,
    /// Webhook deliveries refused.
    pub webhooks_rejected: u64,
    /// Average latency in microseconds.
    pub average_latency_us: u64,
}

/// Shared handle components report through.
#[derive(Clone)]
pub struct Telemetry {
    sink: Arc<dyn TelemetrySink>,
    metrics: Arc<Metrics>,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new(Arc::new(TracingTelemetry))
    }
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry")
            .field("metrics", &self.metrics.snapshot())
            .finish()
    }
}

impl Telemetry {
    /// Creates a handle forwarding to `sink`.
    pub fn new(sink: Arc<dyn TelemetrySink>) -> Self {
        Self {
            sink,
            metrics: Arc::new(Metrics::new()),
        }
    }

    /// Records an event.
    pub fn emit(&self, event: TelemetryEvent) {
        self.metrics.observe(&event);
        self.sink.record(&event);
    }

    /// Counters accumulated so far.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }
}

/// Sensitive headers that should be redacted in logs.
pub const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "x-github-token",
    "x-access-token",
    "x-hub-signature-256",
    "cookie",
    "set-cookie",
];

/// Redacts sensitive values in headers.
pub fn redact_header(name: &str, value: &str) -> String {
    if SENSITIVE_HEADERS.contains(&name.to_lowercase().as_str()) {
        "[REDACTED]".to_string()
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::CollectingTelemetry;

    #[test]
    fn test_redact_header() {
        assert_eq!(redact_header("Authorization", "Bearer ghp_x"), "[REDACTED]");
        assert_eq!(redact_header("accept", "application/json"), "application/json");
    }

    #[test]
    fn test_events_update_metrics_and_reach_sink() {
        let sink = Arc::new(CollectingTelemetry::default());
        let telemetry = Telemetry::new(sink.clone());

        telemetry.emit(TelemetryEvent::RequestSent {
            group: "rest:issues".into(),
            credential_id: CredentialId::new("pat-0"),
        });
        telemetry.emit(TelemetryEvent::RequestCompleted {
            group: "rest:issues".into(),
            status: Some(200),
            latency: Duration::from_millis(4),
        });
        telemetry.emit(TelemetryEvent::RequestCompleted {
            group: "rest:issues".into(),
            status: Some(502),
            latency: Duration::from_millis(6),
        });
        telemetry.emit(TelemetryEvent::CacheHit {
            signature: "GET x".into(),
        });

        let snapshot = telemetry.metrics().snapshot();
        assert_eq!(snapshot.requests_total, 1);
        assert_eq!(snapshot.requests_success, 1);
        assert_eq!(snapshot.requests_failed, 1);
        assert_eq!(snapshot.cache_hits, 1);
        assert_eq!(snapshot.average_latency_us, 5_000);
        assert_eq!(sink.events().len(), 4);
    }
}
