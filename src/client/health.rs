//! Startup health check.

use std::time::Duration;

use reqwest::Method;
use tokio::time::Instant;
use tracing::{info, warn};

use super::{GitHubClient, RequestSpec};
use crate::auth::CredentialId;
use crate::config::GitHubConfig;
use crate::errors::{header_str, GitHubError, GitHubResult};
use crate::resilience::{ApiSurface, BudgetSnapshot, RequestContext, WaitPolicy};
use crate::types::RateLimitOverview;

/// Outcome of [`GitHubClient::health_check`].
#[derive(Debug, Clone)]
pub struct HealthStatus {
    /// GitHub answered and the credential was accepted.
    pub healthy: bool,
    /// Round-trip time of the health check.
    pub latency: Duration,
    /// Credential the health check used.
    pub credential_id: Option<CredentialId>,
    /// Scopes GitHub reported for that credential.
    pub scopes: Vec<String>,
    /// Budget windows of that credential after seeding.
    pub budgets: Vec<BudgetSnapshot>,
    /// Why the health check failed.
    pub error: Option<GitHubError>,
}

impl GitHubClient {
    /// Builds a client and checks that GitHub answers.
    ///
    /// Only an invalid configuration is fatal. An unreachable GitHub yields
    /// a client plus an unhealthy status; the caller decides what to do.
    pub async fn connect(config: GitHubConfig) -> GitHubResult<(Self, HealthStatus)> {
        let client = Self::new(config)?;
        let status = client.health_check().await;
        Ok((client, status))
    }

    /// Checks connectivity, one credential's scopes and its current budget.
    ///
    /// Calls `GET /rate_limit`, which does not count against the budget, and
    /// seeds the tracker with every window it reports. Never retries and
    /// never waits for a budget reset.
    pub async fn health_check(&self) -> HealthStatus {
        let started = Instant::now();
        let ctx = RequestContext::new()
            .with_wait_policy(WaitPolicy::FailFast)
            .with_timeout(self.config().timeout);

        match self.check_rate_limit(&ctx).await {
            Ok(credential_id) => {
                let scopes = self
                    .rotator()
                    .store()
                    .get(&credential_id)
                    .map(|c| c.scopes.into_iter().collect())
                    .unwrap_or_default();
                let budgets: Vec<BudgetSnapshot> = self
                    .rate_limits()
                    .into_iter()
                    .filter(|b| b.credential_id == credential_id)
                    .collect();
                info!(
                    credential_id = %credential_id,
                    latency_ms = started.elapsed().as_millis() as u64,
                    "GitHub health check passed"
                );
                HealthStatus {
                    healthy: true,
                    latency: started.elapsed(),
                    credential_id: Some(credential_id),
                    scopes,
                    budgets,
                    error: None,
                }
            }
            Err(error) => {
                warn!(error = %error, kind = ?error.kind(), "GitHub health check failed");
                HealthStatus {
                    healthy: false,
                    latency: started.elapsed(),
                    credential_id: None,
                    scopes: Vec::new(),
                    budgets: Vec::new(),
                    error: Some(error),
                }
            }
        }
    }

    async fn check_rate_limit(&self, ctx: &RequestContext) -> GitHubResult<CredentialId> {
        let mut spec = RequestSpec::rest(Method::GET, "/rate_limit", self.url("/rate_limit")?);
        spec.cacheable = false;
        spec.shareable = false;
        spec.retry = false;

        let fetched = self.fetch(spec, ctx).await?;
        let credential_id = fetched
            .meta
            .credential_id
            .clone()
            .ok_or_else(|| GitHubError::deserialization("Health check answered without a credential"))?;

        if let Some(scopes) = header_str(&fetched.headers, "x-oauth-scopes") {
            self.rotator().record_scopes(&credential_id, scopes);
        }

        let overview: RateLimitOverview = fetched.decode()?;
        let tracker = self.rotator().tracker();
        for (resource, window) in &overview.resources {
            let surface = match resource.as_str() {
                "core" => ApiSurface::Rest,
                "graphql" => ApiSurface::GraphQl,
                "search" => ApiSurface::Search,
                _ => continue,
            };
            tracker.seed(&credential_id, surface, window.limit, window.remaining, window.reset);
        }
        Ok(credential_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::CredentialConfig;
    use crate::mocks::{MockResponse, MockTransport};
    use serde_json::json;
    use std::sync::Arc;

    fn config() -> GitHubConfig {
        GitHubConfig::builder()
            .credential(CredentialConfig::pat("ghp_health").with_id("health"))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_check_seeds_budget_and_scopes() {
        let reset = chrono::Utc::now().timestamp() + 1800;
        let transport = Arc::new(MockTransport::new());
        transport.on_get(
            "/rate_limit",
            MockResponse::ok(&json!({
                "resources": {
                    "core": {"limit": 5000, "remaining": 4321, "reset": reset, "used": 679},
                    "graphql": {"limit": 5000, "remaining": 4990, "reset": reset, "used": 10},
                    "search": {"limit": 30, "remaining": 30, "reset": reset, "used": 0}
                }
            }))
            .with_header("x-oauth-scopes", "repo, read:org"),
        );
        let client = GitHubClient::with_transport(config(), transport).unwrap();

        let status = client.health_check().await;
        assert!(status.healthy, "{:?}", status.error);
        assert_eq!(status.credential_id, Some(CredentialId::new("health")));
        assert_eq!(status.scopes, vec!["read:org".to_string(), "repo".to_string()]);

        let core = status
            .budgets
            .iter()
            .find(|b| b.surface == ApiSurface::Rest)
            .unwrap();
        assert_eq!(core.remaining, 4321);
        assert!(status.budgets.iter().any(|b| b.surface == ApiSurface::Search && b.limit == 30));
    }

    #[tokio::test]
    async fn test_unreachable_github_is_not_fatal() {
        let transport = Arc::new(MockTransport::new());
        transport.on_get("/rate_limit", MockResponse::network_error());
        let client = GitHubClient::with_transport(config(), transport.clone()).unwrap();

        let status = client.health_check().await;
        assert!(!status.healthy);
        assert!(status.credential_id.is_none());
        assert_eq!(
            status.error.map(|e| e.kind()),
            Some(crate::errors::GitHubErrorKind::TransientNetwork)
        );
        assert_eq!(transport.call_count(), 1);
    }
}
