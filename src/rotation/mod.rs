//! Token rotation.
//!
//! The [`TokenRotator`] picks a credential for every outgoing call, reserving
//! rate-limit budget on it in the same step. It is the only component that
//! changes credential status:
//!
//! - Active credentials whose surface budget hits zero are quarantined until
//!   the server-reported reset, and restored lazily or by maintenance.
//! - A 401 marks a credential expired; so does a failed App token refresh.
//! - App installation tokens are refreshed ahead of expiry, one refresh per
//!   credential at a time.

mod strategy;

pub use strategy::{Candidate, LeastRecentlyUsed, RandomStrategy, RoundRobin, SelectionStrategy};

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::time::Instant;

use crate::auth::{
    CredentialId, CredentialKind, CredentialSlot, CredentialStatus, CredentialStore, Credential,
    TokenRefresher,
};
use crate::config::{RateLimitConfig, RotationConfig};
use crate::errors::{GitHubError, GitHubErrorKind, GitHubResult, RateLimitInfo};
use crate::observability::{Telemetry, TelemetryEvent};
use crate::resilience::{
    ApiSurface, BudgetDecision, RateLimitTracker, RequestContext, Reservation, WaitPolicy,
};

/// Quarantine applied when GitHub reports exhaustion without a reset time.
const DEFAULT_QUARANTINE: Duration = Duration::from_secs(60);

/// Shortest pause between two budget checks while queued.
const MIN_QUEUE_POLL: Duration = Duration::from_millis(25);

/// What a caller needs from a credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquireRequest {
    /// Scopes the credential must carry.
    pub scopes: Vec<String>,
    /// Surface whose budget is spent.
    pub surface: ApiSurface,
    /// Units to reserve.
    pub estimated_cost: u32,
}

impl AcquireRequest {
    /// One REST unit.
    pub fn rest() -> Self {
        Self::new(ApiSurface::Rest, 1)
    }

    /// Request on `surface` costing `estimated_cost` units.
    pub fn new(surface: ApiSurface, estimated_cost: u32) -> Self {
        Self {
            scopes: Vec::new(),
            surface,
            estimated_cost,
        }
    }

    /// Requires these scopes.
    pub fn with_scopes(mut self, scopes: &[String]) -> Self {
        self.scopes = scopes.to_vec();
        self
    }
}

/// A credential checked out for one request.
///
/// Hand it back with [`TokenRotator::release`]. A lease dropped without
/// release counts its reserved units as spent.
#[derive(Debug)]
pub struct CredentialLease {
    credential_id: CredentialId,
    kind: CredentialKind,
    surface: ApiSurface,
    authorization: SecretString,
    reservation: Option<Reservation>,
    tracker: Arc<RateLimitTracker>,
}

impl CredentialLease {
    /// Credential id.
    pub fn credential_id(&self) -> &CredentialId {
        &self.credential_id
    }

    /// Credential kind.
    pub fn kind(&self) -> CredentialKind {
        self.kind
    }

    /// Surface the budget was reserved on.
    pub fn surface(&self) -> ApiSurface {
        self.surface
    }

    /// Units reserved for this request.
    pub fn reserved_units(&self) -> u32 {
        self.reservation.as_ref().map(Reservation::units).unwrap_or(0)
    }

    pub(crate) fn authorization(&self) -> &SecretString {
        &self.authorization
    }
}

impl Drop for CredentialLease {
    fn drop(&mut self) {
        if let Some(reservation) = self.reservation.take() {
            self.tracker.settle(reservation, None, true);
        }
    }
}

/// How the leased request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseOutcome {
    /// GitHub answered (any status other than the two below).
    Completed,
    /// Primary rate limit exhausted.
    RateLimited,
    /// The credential was rejected (401).
    AuthFailed,
    /// Nothing was sent.
    NotSent,
}

/// Result of a maintenance sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Quarantines lifted.
    pub restored: Vec<CredentialId>,
    /// Credentials found past expiry.
    pub expired: Vec<CredentialId>,
    /// App tokens refreshed.
    pub refreshed: Vec<CredentialId>,
    /// App tokens that failed to refresh.
    pub refresh_failed: Vec<CredentialId>,
}

enum Attempt {
    Acquired(CredentialLease),
    /// Nothing usable right now; `wait` until the earliest reset.
    Exhausted {
        wait: Duration,
        budget_limited: bool,
    },
}

/// Selects credentials and tracks their lifecycle.
pub struct TokenRotator {
    store: Arc<CredentialStore>,
    tracker: Arc<RateLimitTracker>,
    strategy: Box<dyn SelectionStrategy>,
    refresher: Option<Arc<dyn TokenRefresher>>,
    refresh_margin: chrono::Duration,
    queue: Semaphore,
    default_wait_policy: WaitPolicy,
    telemetry: Telemetry,
}

impl std::fmt::Debug for TokenRotator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenRotator")
            .field("credentials", &self.store.len())
            .field("strategy", &self.strategy)
            .field("default_wait_policy", &self.default_wait_policy)
            .finish()
    }
}

impl TokenRotator {
    /// Creates a rotator over `store`.
    pub fn new(
        store: Arc<CredentialStore>,
        tracker: Arc<RateLimitTracker>,
        rotation: &RotationConfig,
        rate_limit: &RateLimitConfig,
        telemetry: Telemetry,
    ) -> Self {
        Self {
            store,
            tracker,
            strategy: rotation.strategy.build(),
            refresher: None,
            refresh_margin: chrono::Duration::from_std(rotation.refresh_margin)
                .unwrap_or_else(|_| chrono::Duration::minutes(5)),
            queue: Semaphore::new(rate_limit.max_queued_waiters),
            default_wait_policy: rate_limit.default_wait_policy,
            telemetry,
        }
    }

    /// Uses `refresher` for App installation tokens.
    pub fn with_refresher(mut self, refresher: Arc<dyn TokenRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    /// Uses a custom selection strategy.
    pub fn with_strategy(mut self, strategy: Box<dyn SelectionStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Credential store.
    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    /// Rate limit tracker.
    pub fn tracker(&self) -> &Arc<RateLimitTracker> {
        &self.tracker
    }

    /// Picks a credential carrying `required_scopes` for one REST call,
    /// failing fast when none has budget.
    pub async fn acquire(&self, required_scopes: &[String]) -> GitHubResult<CredentialLease> {
        let ctx = RequestContext::new().with_wait_policy(WaitPolicy::FailFast);
        self.acquire_for(&AcquireRequest::rest().with_scopes(required_scopes), &ctx)
            .await
    }

    /// Picks a credential for `request`, reserving its estimated cost.
    ///
    /// When every candidate is out of budget the context's wait policy
    /// decides: fail fast, or queue (bounded) until the earliest reset.
    ///
    /// # Errors
    ///
    /// `NoCredentialAvailable` if no credential carries the scopes or all of
    /// them are quarantined or expired; `RateLimited` if the remaining ones
    /// are out of budget and waiting is not allowed. Both are local errors.
    pub async fn acquire_for(
        &self,
        request: &AcquireRequest,
        ctx: &RequestContext,
    ) -> GitHubResult<CredentialLease> {
        let policy = ctx.wait_policy_or(self.default_wait_policy);
        let started = Instant::now();
        let mut queued: Option<SemaphorePermit<'_>> = None;

        loop {
            ctx.check()?;
            let (wait, budget_limited) = match self.try_acquire(request).await? {
                Attempt::Acquired(lease) => return Ok(lease),
                Attempt::Exhausted {
                    wait,
                    budget_limited,
                } => (wait, budget_limited),
            };

            let max_wait = match policy {
                WaitPolicy::FailFast => None,
                WaitPolicy::Queue { max_wait } => Some(max_wait),
            };
            let within_bound = max_wait
                .map(|max| started.elapsed() + wait <= max)
                .unwrap_or(false);
            if queued.is_none() && within_bound {
                queued = self.queue.try_acquire().ok();
                if queued.is_none() {
                    tracing::warn!("Rate-limit wait queue is full");
                }
            }
            if queued.is_none() || !within_bound {
                self.telemetry.emit(TelemetryEvent::BudgetExhausted {
                    surface: request.surface,
                    wait: Some(wait),
                });
                return Err(Self::exhausted_error(request.surface, wait, budget_limited));
            }

            tracing::debug!(
                surface = %request.surface,
                wait_ms = wait.as_millis() as u64,
                "Waiting for rate-limit reset"
            );
            ctx.sleep(wait.max(MIN_QUEUE_POLL)).await?;
        }
    }

    fn exhausted_error(surface: ApiSurface, wait: Duration, budget_limited: bool) -> GitHubError {
        let error = if budget_limited {
            GitHubError::new(
                GitHubErrorKind::RateLimited,
                format!("No credential has {} budget left", surface),
            )
        } else {
            GitHubError::new(
                GitHubErrorKind::NoCredentialAvailable,
                "All credentials are quarantined or expired",
            )
        };
        error.with_retry_after(wait).local()
    }

    async fn try_acquire(&self, request: &AcquireRequest) -> GitHubResult<Attempt> {
        let now = Utc::now();
        let slots = self.store.slots();
        if slots.is_empty() {
            return Err(GitHubError::new(
                GitHubErrorKind::NoCredentialAvailable,
                "No credentials configured",
            )
            .local());
        }

        let mut usable: Vec<(Arc<CredentialSlot>, Candidate)> = Vec::new();
        let mut earliest_restore: Option<Duration> = None;
        let mut scoped = 0usize;
        for slot in slots {
            let credential = self.lazy_transitions(&slot, now);
            if !credential.has_scopes(&request.scopes) {
                continue;
            }
            scoped += 1;
            match credential.status {
                CredentialStatus::Active => usable.push((
                    Arc::clone(&slot),
                    Candidate {
                        position: slot.position,
                        last_used_at: credential.usage.last_used_at,
                        requests_issued: credential.usage.requests_issued,
                    },
                )),
                CredentialStatus::Quarantined => {
                    let left = credential
                        .quarantined_until
                        .and_then(|until| (until - now).to_std().ok())
                        .unwrap_or(Duration::ZERO);
                    earliest_restore = Some(earliest_restore.map_or(left, |e| e.min(left)));
                }
                CredentialStatus::Expired => {}
            }
        }

        if scoped == 0 {
            return Err(GitHubError::new(
                GitHubErrorKind::NoCredentialAvailable,
                format!("No credential carries scopes {:?}", request.scopes),
            )
            .local());
        }

        let candidates: Vec<Candidate> = usable.iter().map(|(_, c)| c.clone()).collect();
        let mut earliest_budget: Option<Duration> = None;
        for index in self.strategy.order(&candidates) {
            let slot = &usable[index].0;
            if self.needs_refresh(slot, now) && self.ensure_fresh(slot).await.is_err() {
                continue;
            }

            let mut credential = slot.state.lock();
            if credential.status != CredentialStatus::Active {
                continue;
            }
            let authorization = match credential.authorization() {
                Some(auth) => auth,
                None => continue,
            };
            match self
                .tracker
                .check_budget(&slot.id, request.surface, request.estimated_cost)
            {
                BudgetDecision::Allow(reservation) => {
                    credential.usage.requests_issued += 1;
                    credential.usage.last_used_at = Some(Utc::now());
                    return Ok(Attempt::Acquired(CredentialLease {
                        credential_id: slot.id.clone(),
                        kind: credential.kind,
                        surface: request.surface,
                        authorization,
                        reservation: Some(reservation),
                        tracker: Arc::clone(&self.tracker),
                    }));
                }
                BudgetDecision::MustWait(wait) => {
                    earliest_budget = Some(earliest_budget.map_or(wait, |e| e.min(wait)));
                }
            }
        }

        match (earliest_budget, earliest_restore) {
            (Some(budget), restore) => Ok(Attempt::Exhausted {
                wait: restore.map_or(budget, |r| r.min(budget)),
                budget_limited: true,
            }),
            (None, Some(restore)) => Ok(Attempt::Exhausted {
                wait: restore,
                budget_limited: false,
            }),
            (None, None) => Err(GitHubError::new(
                GitHubErrorKind::NoCredentialAvailable,
                "All credentials are expired",
            )
            .local()),
        }
    }

    /// Applies time-driven status changes and returns a copy.
    fn lazy_transitions(&self, slot: &CredentialSlot, now: DateTime<Utc>) -> Credential {
        let (snapshot, restored, expired) = {
            let mut credential = slot.state.lock();
            let mut restored = false;
            let mut expired = false;
            if credential.status == CredentialStatus::Quarantined
                && credential.quarantined_until.map(|u| u <= now).unwrap_or(true)
            {
                credential.status = CredentialStatus::Active;
                credential.quarantined_until = None;
                restored = true;
            }
            if credential.kind == CredentialKind::Pat
                && credential.status != CredentialStatus::Expired
                && credential.is_expired_at(now)
            {
                credential.status = CredentialStatus::Expired;
                expired = true;
            }
            (credential.clone(), restored, expired)
        };
        if restored {
            self.telemetry.emit(TelemetryEvent::CredentialRestored {
                credential_id: slot.id.clone(),
            });
        }
        if expired {
            self.telemetry.emit(TelemetryEvent::CredentialExpired {
                credential_id: slot.id.clone(),
                reason: "token past expiry".to_string(),
            });
        }
        snapshot
    }

    fn needs_refresh(&self, slot: &CredentialSlot, now: DateTime<Utc>) -> bool {
        slot.state.lock().needs_refresh(now, self.refresh_margin)
    }

    /// Refreshes an App token unless another caller is already doing so and
    /// the current token is still valid.
    async fn ensure_fresh(&self, slot: &CredentialSlot) -> GitHubResult<()> {
        match slot.refresh_guard.try_lock() {
            Ok(guard) => self.refresh_locked(slot, false, guard).await,
            Err(_) => {
                let usable = {
                    let credential = slot.state.lock();
                    credential.has_secret() && !credential.is_expired_at(Utc::now())
                };
                if usable {
                    return Ok(());
                }
                let guard = slot.refresh_guard.lock().await;
                self.refresh_locked(slot, false, guard).await
            }
        }
    }

    async fn refresh_locked(
        &self,
        slot: &CredentialSlot,
        force: bool,
        _guard: tokio::sync::MutexGuard<'_, ()>,
    ) -> GitHubResult<()> {
        let app = {
            let credential = slot.state.lock();
            if !force && !credential.needs_refresh(Utc::now(), self.refresh_margin) {
                return Ok(());
            }
            match credential.app() {
                Some(app) => app.clone(),
                None => {
                    return Err(GitHubError::new(
                        GitHubErrorKind::TokenRefreshFailed,
                        format!("{} is not an App installation credential", slot.id),
                    )
                    .local())
                }
            }
        };

        let refresher = self.refresher.as_ref().ok_or_else(|| {
            GitHubError::new(
                GitHubErrorKind::TokenRefreshFailed,
                "No token refresher configured",
            )
            .local()
        })?;

        match refresher.refresh(&app).await {
            Ok(token) => {
                let expires_at = token.expires_at;
                slot.state.lock().install_token(token);
                self.telemetry.emit(TelemetryEvent::CredentialRefreshed {
                    credential_id: slot.id.clone(),
                    expires_at,
                });
                Ok(())
            }
            Err(error) => {
                self.mark_expired(slot, format!("token refresh failed: {}", error.message()));
                Err(error)
            }
        }
    }

    fn mark_expired(&self, slot: &CredentialSlot, reason: String) {
        {
            let mut credential = slot.state.lock();
            credential.status = CredentialStatus::Expired;
            credential.quarantined_until = None;
        }
        self.telemetry.emit(TelemetryEvent::CredentialExpired {
            credential_id: slot.id.clone(),
            reason,
        });
    }

    /// Forces an App installation token refresh.
    pub async fn refresh(&self, id: &CredentialId) -> GitHubResult<Credential> {
        let slot = self.store.slot(id).ok_or_else(|| {
            GitHubError::new(
                GitHubErrorKind::NoCredentialAvailable,
                format!("Unknown credential {}", id),
            )
            .local()
        })?;
        let guard = slot.refresh_guard.lock().await;
        self.refresh_locked(&slot, true, guard).await?;
        let credential = slot.state.lock().clone();
        Ok(credential)
    }

    /// Returns a lease and applies what the response said about the
    /// credential.
    pub fn release(
        &self,
        mut lease: CredentialLease,
        outcome: LeaseOutcome,
        rate_limit: Option<&RateLimitInfo>,
    ) {
        if let Some(reservation) = lease.reservation.take() {
            self.tracker
                .settle(reservation, rate_limit, outcome != LeaseOutcome::NotSent);
        }

        let slot = match self.store.slot(&lease.credential_id) {
            Some(slot) => slot,
            None => return,
        };

        match outcome {
            LeaseOutcome::AuthFailed => {
                self.mark_expired(&slot, "rejected by GitHub (401)".to_string());
            }
            LeaseOutcome::RateLimited => {
                let until = rate_limit.map(|r| r.reset_at).unwrap_or_else(|| {
                    Utc::now()
                        + chrono::Duration::from_std(DEFAULT_QUARANTINE)
                            .unwrap_or_else(|_| chrono::Duration::seconds(60))
                });
                self.quarantine(&slot, until);
            }
            LeaseOutcome::Completed => {
                if let Some(info) = rate_limit {
                    let surface = info
                        .resource
                        .as_deref()
                        .and_then(ApiSurface::from_resource)
                        .unwrap_or(lease.surface);
                    if info.remaining == 0 && surface != ApiSurface::Search {
                        self.quarantine(&slot, info.reset_at);
                    }
                }
            }
            LeaseOutcome::NotSent => {}
        }
    }

    fn quarantine(&self, slot: &CredentialSlot, until: DateTime<Utc>) {
        {
            let mut credential = slot.state.lock();
            if credential.status == CredentialStatus::Expired {
                return;
            }
            // Extends, never shortens.
            if credential.status == CredentialStatus::Quarantined
                && credential.quarantined_until.map(|u| u >= until).unwrap_or(false)
            {
                return;
            }
            credential.status = CredentialStatus::Quarantined;
            credential.quarantined_until = Some(until);
        }
        self.telemetry.emit(TelemetryEvent::CredentialQuarantined {
            credential_id: slot.id.clone(),
            until,
        });
    }

    /// Fails unless a credential that is not expired carries `scopes`.
    ///
    /// Answers handed out without a lease (fresh cache hits, joined calls)
    /// must pass this so they only reach callers some credential could serve.
    ///
    /// # Errors
    ///
    /// `NoCredentialAvailable`, as a local error.
    pub fn check_scopes(&self, scopes: &[String]) -> GitHubResult<()> {
        if scopes.is_empty() {
            return Ok(());
        }
        let now = Utc::now();
        let servable = self.store.slots().iter().any(|slot| {
            let credential = self.lazy_transitions(slot, now);
            credential.status != CredentialStatus::Expired && credential.has_scopes(scopes)
        });
        if servable {
            Ok(())
        } else {
            Err(GitHubError::new(
                GitHubErrorKind::NoCredentialAvailable,
                format!("No credential carries scopes {:?}", scopes),
            )
            .local())
        }
    }

    /// Records scopes discovered from `x-oauth-scopes`.
    pub fn record_scopes(&self, id: &CredentialId, scopes: &str) {
        if let Some(slot) = self.store.slot(id) {
            let discovered = scopes
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string);
            slot.state.lock().scopes = discovered.collect();
        }
    }

    /// Lifts elapsed quarantines, expires stale PATs, and refreshes App
    /// tokens that are close to expiry or failed earlier. Each credential is
    /// locked only while it is inspected.
    pub async fn sweep(&self) -> SweepReport {
        let now = Utc::now();
        let mut report = SweepReport::default();

        for slot in self.store.slots() {
            let before = slot.state.lock().status;
            let credential = self.lazy_transitions(&slot, now);
            if before == CredentialStatus::Quarantined && credential.status != before {
                report.restored.push(slot.id.clone());
            }
            if before != CredentialStatus::Expired && credential.status == CredentialStatus::Expired {
                report.expired.push(slot.id.clone());
            }

            let due = credential.kind == CredentialKind::AppInstallation
                && (credential.status == CredentialStatus::Expired
                    || credential.needs_refresh(now, self.refresh_margin));
            if !due || self.refresher.is_none() {
                continue;
            }
            let guard = match slot.refresh_guard.try_lock() {
                Ok(guard) => guard,
                Err(_) => continue,
            };
            match self.refresh_locked(&slot, true, guard).await {
                Ok(()) => report.refreshed.push(slot.id.clone()),
                Err(_) => report.refresh_failed.push(slot.id.clone()),
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AppInstallation, CredentialConfig, InstallationToken};
    use crate::mocks::CollectingTelemetry;
    use async_trait::async_trait;
    use mockall::mock;
    use reqwest::header::{HeaderMap, HeaderValue};
    use std::collections::HashMap;

    const APP_KEY: &str = include_str!("../../tests/fixtures/app_key.pem");

    mock! {
        pub Refresher {}

        #[async_trait]
        impl TokenRefresher for Refresher {
            async fn refresh(&self, app: &AppInstallation) -> GitHubResult<InstallationToken>;
        }
    }

    fn rotator_with(configs: Vec<CredentialConfig>, margin: u32) -> TokenRotator {
        let telemetry = Telemetry::default();
        TokenRotator::new(
            Arc::new(CredentialStore::new(configs).unwrap()),
            Arc::new(RateLimitTracker::new(margin, telemetry.clone())),
            &RotationConfig::default(),
            &RateLimitConfig {
                safety_margin: margin,
                ..RateLimitConfig::default()
            },
            telemetry,
        )
    }

    fn exhausted_headers(reset_in: i64) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-limit", HeaderValue::from(5000));
        headers.insert("x-ratelimit-remaining", HeaderValue::from(0));
        headers.insert(
            "x-ratelimit-reset",
            HeaderValue::from(Utc::now().timestamp() + reset_in),
        );
        headers.insert("x-ratelimit-resource", HeaderValue::from_static("core"));
        headers
    }

    fn token(minutes: i64) -> InstallationToken {
        InstallationToken {
            token: SecretString::new("ghs_fresh".into()),
            expires_at: Utc::now() + chrono::Duration::minutes(minutes),
            permissions: HashMap::from([("issues".to_string(), "write".to_string())]),
            repository_selection: Some("all".to_string()),
        }
    }

    #[tokio::test]
    async fn test_round_robin_spreads_load() {
        let rotator = rotator_with(
            vec![CredentialConfig::pat("ghp_a"), CredentialConfig::pat("ghp_b")],
            0,
        );
        let first = rotator.acquire(&[]).await.unwrap();
        let second = rotator.acquire(&[]).await.unwrap();
        assert_ne!(first.credential_id(), second.credential_id());
        rotator.release(first, LeaseOutcome::Completed, None);
        rotator.release(second, LeaseOutcome::Completed, None);
    }

    #[tokio::test]
    async fn test_exhausted_credential_is_quarantined_and_skipped() {
        let rotator = rotator_with(
            vec![
                CredentialConfig::pat("ghp_a").with_id("a"),
                CredentialConfig::pat("ghp_b").with_id("b"),
            ],
            0,
        );
        let info = RateLimitInfo::from_headers(&exhausted_headers(60)).unwrap();

        let lease = rotator.acquire(&[]).await.unwrap();
        let exhausted = lease.credential_id().clone();
        rotator.release(lease, LeaseOutcome::Completed, Some(&info));

        let status = rotator.store().get(&exhausted).unwrap().status;
        assert_eq!(status, CredentialStatus::Quarantined);
        for _ in 0..4 {
            let lease = rotator.acquire(&[]).await.unwrap();
            assert_ne!(lease.credential_id(), &exhausted);
            rotator.release(lease, LeaseOutcome::Completed, None);
        }
    }

    #[tokio::test]
    async fn test_all_quarantined_fails_fast() {
        let rotator = rotator_with(vec![CredentialConfig::pat("ghp_a")], 0);
        let lease = rotator.acquire(&[]).await.unwrap();
        let info = RateLimitInfo::from_headers(&exhausted_headers(60)).unwrap();
        rotator.release(lease, LeaseOutcome::RateLimited, Some(&info));

        let error = rotator.acquire(&[]).await.unwrap_err();
        assert_eq!(error.kind(), GitHubErrorKind::NoCredentialAvailable);
        assert!(error.is_local());
        assert!(error.retry_after().unwrap() <= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_quarantine_lifts_at_reset() {
        let rotator = rotator_with(vec![CredentialConfig::pat("ghp_a").with_id("a")], 0);
        let lease = rotator.acquire(&[]).await.unwrap();
        let info = RateLimitInfo::from_headers(&exhausted_headers(-1)).unwrap();
        rotator.release(lease, LeaseOutcome::RateLimited, Some(&info));

        let report = rotator.sweep().await;
        assert_eq!(report.restored, vec![CredentialId::new("a")]);
        assert!(rotator.acquire(&[]).await.is_ok());
    }

    #[tokio::test]
    async fn test_auth_failure_expires_credential() {
        let sink = Arc::new(CollectingTelemetry::default());
        let telemetry = Telemetry::new(sink.clone());
        let rotator = TokenRotator::new(
            Arc::new(CredentialStore::new(vec![CredentialConfig::pat("ghp_a")]).unwrap()),
            Arc::new(RateLimitTracker::new(0, telemetry.clone())),
            &RotationConfig::default(),
            &RateLimitConfig::default(),
            telemetry,
        );

        let lease = rotator.acquire(&[]).await.unwrap();
        rotator.release(lease, LeaseOutcome::AuthFailed, None);

        let error = rotator.acquire(&[]).await.unwrap_err();
        assert_eq!(error.kind(), GitHubErrorKind::NoCredentialAvailable);
        assert!(sink
            .events()
            .iter()
            .any(|e| matches!(e, TelemetryEvent::CredentialExpired { .. })));
    }

    #[tokio::test]
    async fn test_scope_filtering() {
        let rotator = rotator_with(
            vec![
                CredentialConfig::pat("ghp_a").with_id("narrow").with_scopes(["public_repo"]),
                CredentialConfig::pat("ghp_b").with_id("wide").with_scopes(["repo", "read:org"]),
            ],
            0,
        );
        for _ in 0..3 {
            let lease = rotator.acquire(&["read:org".to_string()]).await.unwrap();
            assert_eq!(lease.credential_id().as_str(), "wide");
            rotator.release(lease, LeaseOutcome::Completed, None);
        }
        let error = rotator.acquire(&["admin:org".to_string()]).await.unwrap_err();
        assert_eq!(error.kind(), GitHubErrorKind::NoCredentialAvailable);
    }

    #[tokio::test]
    async fn test_dropped_lease_counts_units() {
        let rotator = rotator_with(vec![CredentialConfig::pat("ghp_a").with_id("a")], 0);
        let id = CredentialId::new("a");
        drop(rotator.acquire(&[]).await.unwrap());
        let window = rotator.tracker().window_state(&id, ApiSurface::Rest).unwrap();
        assert_eq!(window.reserved, 0);
        assert_eq!(window.remaining, 4999);
    }

    #[tokio::test]
    async fn test_app_token_refreshed_before_use() {
        let mut refresher = MockRefresher::new();
        refresher
            .expect_refresh()
            .times(1)
            .returning(|_| Ok(token(60)));

        let rotator = rotator_with(
            vec![CredentialConfig::app_installation(1, 42, APP_KEY)],
            0,
        )
        .with_refresher(Arc::new(refresher));

        let lease = rotator.acquire(&[]).await.unwrap();
        assert_eq!(lease.kind(), CredentialKind::AppInstallation);
        rotator.release(lease, LeaseOutcome::Completed, None);

        // Second call reuses the token.
        let lease = rotator.acquire(&["issues:write".to_string()]).await.unwrap();
        rotator.release(lease, LeaseOutcome::Completed, None);
    }

    #[tokio::test]
    async fn test_refresh_failure_falls_back_to_next_credential() {
        let mut refresher = MockRefresher::new();
        refresher.expect_refresh().times(1).returning(|_| {
            Err(GitHubError::new(GitHubErrorKind::TokenRefreshFailed, "key revoked"))
        });

        let rotator = rotator_with(
            vec![
                CredentialConfig::app_installation(1, 42, APP_KEY).with_id("app"),
                CredentialConfig::pat("ghp_b").with_id("pat"),
            ],
            0,
        )
        .with_refresher(Arc::new(refresher));

        for _ in 0..2 {
            let lease = rotator.acquire(&[]).await.unwrap();
            assert_eq!(lease.credential_id().as_str(), "pat");
            rotator.release(lease, LeaseOutcome::Completed, None);
        }
        let app = rotator.store().get(&CredentialId::new("app")).unwrap();
        assert_eq!(app.status, CredentialStatus::Expired);
    }

    #[tokio::test]
    async fn test_queue_policy_respects_max_wait() {
        let rotator = rotator_with(vec![CredentialConfig::pat("ghp_a").with_id("a")], 0);
        rotator.tracker().update(
            &CredentialId::new("a"),
            ApiSurface::Search,
            &{
                let mut h = exhausted_headers(30);
                h.insert("x-ratelimit-resource", HeaderValue::from_static("search"));
                h
            },
        );
        let ctx = RequestContext::new().with_wait_policy(WaitPolicy::Queue {
            max_wait: Duration::from_secs(1),
        });
        let error = rotator
            .acquire_for(&AcquireRequest::new(ApiSurface::Search, 1), &ctx)
            .await
            .unwrap_err();
        assert_eq!(error.kind(), GitHubErrorKind::RateLimited);
        assert!(error.is_local());
    }
}
