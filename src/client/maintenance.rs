//! Periodic background maintenance.

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::GitHubClient;
use crate::rotation::SweepReport;

/// What one maintenance pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Credential transitions.
    pub sweep: SweepReport,
    /// Cache entries evicted past their maximum staleness.
    pub cache_evicted: usize,
    /// Delivery ids dropped from the replay window.
    pub deliveries_pruned: usize,
}

impl MaintenanceReport {
    /// True when the pass changed nothing.
    pub fn is_idle(&self) -> bool {
        self.sweep == SweepReport::default() && self.cache_evicted == 0 && self.deliveries_pruned == 0
    }
}

/// Handle to the task started by [`GitHubClient::spawn_maintenance`].
#[derive(Debug)]
pub struct MaintenanceHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl MaintenanceHandle {
    /// Stops the task and waits for the pass in progress to finish.
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "Maintenance task ended abnormally");
        }
    }

    /// True once the task has stopped.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl GitHubClient {
    /// Runs one maintenance pass: lifts elapsed quarantines, refreshes App
    /// tokens close to expiry, evicts stale cache entries and prunes the
    /// webhook replay window.
    pub async fn maintain(&self) -> MaintenanceReport {
        let report = MaintenanceReport {
            sweep: self.rotator().sweep().await,
            cache_evicted: self.inner.cache.evict_expired(),
            deliveries_pruned: self.inner.webhooks.prune(),
        };
        if !report.is_idle() {
            debug!(
                restored = report.sweep.restored.len(),
                expired = report.sweep.expired.len(),
                refreshed = report.sweep.refreshed.len(),
                cache_evicted = report.cache_evicted,
                deliveries_pruned = report.deliveries_pruned,
                "Maintenance pass"
            );
        }
        report
    }

    /// Runs [`maintain`](Self::maintain) every `maintenance_interval` on a
    /// background task, independent of request traffic.
    pub fn spawn_maintenance(&self) -> MaintenanceHandle {
        let token = CancellationToken::new();
        let stop = token.clone();
        let client = self.clone();
        let period = self.config().maintenance_interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        client.maintain().await;
                    }
                }
            }
        });

        MaintenanceHandle { token, task }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{CredentialConfig, CredentialId, CredentialStatus};
    use crate::config::GitHubConfig;
    use crate::mocks::{MockResponse, MockTransport};
    use crate::resilience::RequestContext;
    use std::sync::Arc;
    use std::time::Duration;

    fn client(transport: Arc<MockTransport>) -> GitHubClient {
        let config = GitHubConfig::builder()
            .credential(CredentialConfig::pat("ghp_a").with_id("a"))
            .credential(CredentialConfig::pat("ghp_b").with_id("b"))
            .no_retry()
            .maintenance_interval(Duration::from_secs(10))
            .build()
            .unwrap();
        GitHubClient::with_transport(config, transport).unwrap()
    }

    fn status_of(client: &GitHubClient, id: &str) -> CredentialStatus {
        client
            .credentials()
            .into_iter()
            .find(|c| c.id == CredentialId::new(id))
            .map(|c| c.status)
            .unwrap()
    }

    #[tokio::test]
    async fn test_idle_pass_reports_nothing() {
        let client = client(Arc::new(MockTransport::new()));
        assert!(client.maintain().await.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweep_restores_quarantined_credential() {
        // A reset already in the past: the quarantine is due to be lifted by
        // the first sweep.
        let reset = chrono::Utc::now().timestamp() - 1;
        let transport = Arc::new(MockTransport::new());
        transport.on_get(
            "/user",
            MockResponse::error(403, "API rate limit exceeded").with_rate_limit(5000, 0, reset),
        );
        let client = client(transport);

        let error = client
            .get::<serde_json::Value>("/user", &RequestContext::new())
            .await
            .unwrap_err();
        assert_eq!(error.kind(), crate::errors::GitHubErrorKind::RateLimited);
        let quarantined: Vec<&str> = ["a", "b"]
            .into_iter()
            .filter(|id| status_of(&client, id) == CredentialStatus::Quarantined)
            .collect();
        assert_eq!(quarantined.len(), 1);

        let handle = client.spawn_maintenance();
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert_eq!(status_of(&client, quarantined[0]), CredentialStatus::Active);
        assert!(!handle.is_finished());
        handle.shutdown().await;
    }
}
