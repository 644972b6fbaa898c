//! Per-credential rate-limit budget tracking.
//!
//! One window per credential and API surface, each behind its own lock.
//! A successful [`RateLimitTracker::check_budget`] reserves the units it
//! approved, so concurrent callers can never commit more than the window
//! holds. Reservations are settled when the response headers arrive (server
//! numbers win) or refunded when nothing was sent.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::{Mutex, RwLock};
use reqwest::header::HeaderMap;
use serde::Deserialize;

use crate::auth::CredentialId;
use crate::errors::RateLimitInfo;
use crate::observability::{Telemetry, TelemetryEvent};

/// Wait forced when a window is exhausted but the server never said when it
/// resets.
const UNKNOWN_RESET_WAIT: Duration = Duration::from_secs(60);

/// GitHub API surface with its own budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiSurface {
    /// REST `core` resource.
    Rest,
    /// GraphQL point budget.
    GraphQl,
    /// Search API.
    Search,
}

impl ApiSurface {
    /// Maps an `x-ratelimit-resource` value.
    pub fn from_resource(resource: &str) -> Option<Self> {
        match resource {
            "core" => Some(Self::Rest),
            "graphql" => Some(Self::GraphQl),
            "search" | "code_search" => Some(Self::Search),
            _ => None,
        }
    }

    /// Budget assumed before the first response is seen.
    pub fn default_limit(self) -> u32 {
        match self {
            Self::Rest | Self::GraphQl => 5000,
            Self::Search => 30,
        }
    }
}

impl fmt::Display for ApiSurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rest => write!(f, "rest"),
            Self::GraphQl => write!(f, "graphql"),
            Self::Search => write!(f, "search"),
        }
    }
}

/// Budget state of one credential on one surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitWindow {
    /// Window size.
    pub limit: u32,
    /// Units left according to the server, minus unreported local use.
    pub remaining: u32,
    /// Reset time of the active window, as reported by the server.
    pub reset_at: Option<DateTime<Utc>>,
    /// Units reserved by requests still in flight.
    pub reserved: u32,
    /// Latest reset time ever reported; older reports are stale.
    pub last_server_reset: Option<DateTime<Utc>>,
    /// Points reserved for the last GraphQL request.
    pub last_estimated_cost: Option<u32>,
    /// Points GitHub charged for the last GraphQL request.
    pub last_actual_cost: Option<u32>,
}

impl RateLimitWindow {
    fn new(surface: ApiSurface) -> Self {
        let limit = surface.default_limit();
        Self {
            limit,
            remaining: limit,
            reset_at: None,
            reserved: 0,
            last_server_reset: None,
            last_estimated_cost: None,
            last_actual_cost: None,
        }
    }

    /// Units not yet spent or reserved.
    pub fn available(&self) -> u32 {
        self.remaining.saturating_sub(self.reserved)
    }

    fn roll_over(&mut self, now: DateTime<Utc>) {
        if let Some(reset) = self.reset_at {
            if reset <= now {
                self.remaining = self.limit;
                self.reset_at = None;
            }
        }
    }

    /// Applies server numbers. Returns false for stale reports.
    fn apply(&mut self, limit: u32, remaining: u32, reset_at: DateTime<Utc>) -> bool {
        match self.last_server_reset {
            Some(last) if reset_at < last => return false,
            Some(last) if reset_at == last => {
                if self.reset_at.is_none() {
                    // Report from a window already rolled over locally.
                    return false;
                }
                self.remaining = self.remaining.min(remaining);
            }
            _ => {
                self.remaining = remaining;
                self.reset_at = Some(reset_at);
                self.last_server_reset = Some(reset_at);
            }
        }
        self.limit = limit.max(1);
        self.remaining = self.remaining.min(self.limit);
        true
    }

    fn wait_time(&self, now: DateTime<Utc>) -> Duration {
        match self.reset_at {
            Some(reset) => (reset - now).to_std().unwrap_or(Duration::ZERO),
            None => UNKNOWN_RESET_WAIT,
        }
    }
}

/// Units approved by [`RateLimitTracker::check_budget`].
///
/// Must be handed back through [`RateLimitTracker::settle`].
#[derive(Debug, PartialEq, Eq)]
#[must_use]
pub struct Reservation {
    credential_id: CredentialId,
    surface: ApiSurface,
    units: u32,
}

impl Reservation {
    /// Credential the units were reserved on.
    pub fn credential_id(&self) -> &CredentialId {
        &self.credential_id
    }

    /// Surface the units were reserved on.
    pub fn surface(&self) -> ApiSurface {
        self.surface
    }

    /// Reserved units.
    pub fn units(&self) -> u32 {
        self.units
    }
}

/// Outcome of a budget check.
#[derive(Debug, PartialEq, Eq)]
pub enum BudgetDecision {
    /// Proceed; the units are reserved.
    Allow(Reservation),
    /// Not enough budget before the window resets.
    MustWait(Duration),
}

/// The `rateLimit` object of a GraphQL response.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GraphQlRateLimit {
    /// Points charged for the query.
    pub cost: u32,
    /// Points left.
    pub remaining: u32,
    /// Reset time.
    pub reset_at: DateTime<Utc>,
    /// Window size.
    #[serde(default)]
    pub limit: Option<u32>,
}

/// Budget of one window at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BudgetSnapshot {
    /// Credential.
    pub credential_id: CredentialId,
    /// Surface.
    pub surface: ApiSurface,
    /// Window size.
    pub limit: u32,
    /// Remaining units.
    pub remaining: u32,
    /// Units held by in-flight requests.
    pub reserved: u32,
    /// Server-reported reset.
    pub reset_at: Option<DateTime<Utc>>,
}

type WindowKey = (CredentialId, ApiSurface);

/// Tracks budget windows for every credential.
#[derive(Debug)]
pub struct RateLimitTracker {
    windows: RwLock<HashMap<WindowKey, Arc<Mutex<RateLimitWindow>>>>,
    safety_margin: u32,
    telemetry: Telemetry,
}

impl RateLimitTracker {
    /// Creates a tracker keeping `safety_margin` units in reserve.
    pub fn new(safety_margin: u32, telemetry: Telemetry) -> Self {
        Self {
            windows: RwLock::new(HashMap::new()),
            safety_margin,
            telemetry,
        }
    }

    fn window(&self, credential: &CredentialId, surface: ApiSurface) -> Arc<Mutex<RateLimitWindow>> {
        let key = (credential.clone(), surface);
        if let Some(window) = self.windows.read().get(&key) {
            return Arc::clone(window);
        }
        Arc::clone(
            self.windows
                .write()
                .entry(key)
                .or_insert_with(|| Arc::new(Mutex::new(RateLimitWindow::new(surface)))),
        )
    }

    /// Reserves `estimated_cost` units if the window can afford them on top
    /// of the safety margin. The margin never exceeds a tenth of the window.
    pub fn check_budget(
        &self,
        credential: &CredentialId,
        surface: ApiSurface,
        estimated_cost: u32,
    ) -> BudgetDecision {
        self.check_budget_at(credential, surface, estimated_cost, Utc::now())
    }

    pub(crate) fn check_budget_at(
        &self,
        credential: &CredentialId,
        surface: ApiSurface,
        estimated_cost: u32,
        now: DateTime<Utc>,
    ) -> BudgetDecision {
        let window = self.window(credential, surface);
        let mut w = window.lock();
        w.roll_over(now);

        let units = estimated_cost.max(1).min(w.limit);
        let margin = self.safety_margin.min(w.limit / 10);
        if w.available() >= units.saturating_add(margin) {
            w.reserved += units;
            BudgetDecision::Allow(Reservation {
                credential_id: credential.clone(),
                surface,
                units,
            })
        } else {
            BudgetDecision::MustWait(w.wait_time(now))
        }
    }

    /// Applies response headers to the window they describe.
    pub fn update(
        &self,
        credential: &CredentialId,
        surface: ApiSurface,
        headers: &HeaderMap,
    ) -> Option<RateLimitInfo> {
        let info = RateLimitInfo::from_headers(headers)?;
        self.apply_info(credential, surface, &info);
        Some(info)
    }

    /// Releases a reservation, applying the server's numbers when present.
    ///
    /// Without server numbers the units count as spent if the request was
    /// sent and are refunded otherwise.
    pub fn settle(&self, reservation: Reservation, info: Option<&RateLimitInfo>, sent: bool) {
        {
            let window = self.window(&reservation.credential_id, reservation.surface);
            let mut w = window.lock();
            w.reserved = w.reserved.saturating_sub(reservation.units);
            if info.is_none() && sent {
                w.remaining = w.remaining.saturating_sub(reservation.units);
            }
        }
        if let Some(info) = info {
            self.apply_info(&reservation.credential_id, reservation.surface, info);
        }
    }

    fn apply_info(&self, credential: &CredentialId, requested: ApiSurface, info: &RateLimitInfo) {
        let surface = info
            .resource
            .as_deref()
            .and_then(ApiSurface::from_resource)
            .unwrap_or(requested);
        let applied = {
            let window = self.window(credential, surface);
            let mut w = window.lock();
            w.apply(info.limit, info.remaining, info.reset_at)
        };
        if applied {
            self.telemetry.emit(TelemetryEvent::RateLimitUpdated {
                credential_id: credential.clone(),
                surface,
                limit: info.limit,
                remaining: info.remaining,
                reset_at: info.reset_at,
            });
        }
    }

    /// Reconciles a GraphQL estimate with the cost GitHub reported.
    pub fn reconcile_graphql(
        &self,
        credential: &CredentialId,
        estimated: u32,
        actual: &GraphQlRateLimit,
    ) {
        {
            let window = self.window(credential, ApiSurface::GraphQl);
            let mut w = window.lock();
            let limit = actual.limit.unwrap_or(w.limit);
            w.apply(limit, actual.remaining, actual.reset_at);
            w.last_estimated_cost = Some(estimated);
            w.last_actual_cost = Some(actual.cost);
        }
        self.telemetry.emit(TelemetryEvent::GraphQlCostReconciled {
            credential_id: credential.clone(),
            estimated,
            actual: actual.cost,
        });
    }

    /// Seeds a window from the `/rate_limit` endpoint.
    pub fn seed(
        &self,
        credential: &CredentialId,
        surface: ApiSurface,
        limit: u32,
        remaining: u32,
        reset_epoch: i64,
    ) {
        if let Some(reset_at) = Utc.timestamp_opt(reset_epoch, 0).single() {
            let info = RateLimitInfo {
                limit,
                remaining,
                used: None,
                reset_at,
                retry_after: None,
                resource: None,
            };
            self.apply_info(credential, surface, &info);
        }
    }

    /// Copy of one window.
    pub fn window_state(
        &self,
        credential: &CredentialId,
        surface: ApiSurface,
    ) -> Option<RateLimitWindow> {
        let key = (credential.clone(), surface);
        let window = self.windows.read().get(&key).cloned()?;
        let state = window.lock().clone();
        Some(state)
    }

    /// Budgets of every known window.
    pub fn snapshots(&self) -> Vec<BudgetSnapshot> {
        let windows: Vec<(WindowKey, Arc<Mutex<RateLimitWindow>>)> = self
            .windows
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();
        let mut snapshots: Vec<BudgetSnapshot> = windows
            .into_iter()
            .map(|((credential_id, surface), window)| {
                let w = window.lock();
                BudgetSnapshot {
                    credential_id,
                    surface,
                    limit: w.limit,
                    remaining: w.remaining,
                    reserved: w.reserved,
                    reset_at: w.reset_at,
                }
            })
            .collect();
        snapshots.sort_by(|a, b| {
            (a.credential_id.as_str(), a.surface.to_string())
                .cmp(&(b.credential_id.as_str(), b.surface.to_string()))
        });
        snapshots
    }

    /// Drops all windows of a credential.
    pub fn forget(&self, credential: &CredentialId) {
        self.windows.write().retain(|(id, _), _| id != credential);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use reqwest::header::HeaderValue;

    fn tracker(margin: u32) -> RateLimitTracker {
        RateLimitTracker::new(margin, Telemetry::default())
    }

    fn headers(limit: u32, remaining: u32, reset: DateTime<Utc>, resource: &str) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert("x-ratelimit-limit", HeaderValue::from(limit));
        map.insert("x-ratelimit-remaining", HeaderValue::from(remaining));
        map.insert("x-ratelimit-reset", HeaderValue::from(reset.timestamp()));
        map.insert("x-ratelimit-resource", HeaderValue::from_str(resource).unwrap());
        map
    }

    fn reset_in(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(Utc::now().timestamp() + secs, 0).unwrap()
    }

    #[test]
    fn test_reservation_prevents_overcommit() {
        let tracker = tracker(0);
        let id = CredentialId::new("pat-0");
        tracker.update(&id, ApiSurface::Rest, &headers(5000, 1, reset_in(60), "core"));

        let first = tracker.check_budget(&id, ApiSurface::Rest, 1);
        let second = tracker.check_budget(&id, ApiSurface::Rest, 1);

        assert!(matches!(first, BudgetDecision::Allow(_)));
        match second {
            BudgetDecision::MustWait(wait) => {
                assert!(wait <= Duration::from_secs(60));
                assert!(wait >= Duration::from_secs(58));
            }
            other => panic!("expected MustWait, got {:?}", other),
        }
    }

    #[test]
    fn test_safety_margin_is_kept() {
        let tracker = tracker(10);
        let id = CredentialId::new("pat-0");
        tracker.update(&id, ApiSurface::Rest, &headers(5000, 10, reset_in(60), "core"));
        assert!(matches!(
            tracker.check_budget(&id, ApiSurface::Rest, 1),
            BudgetDecision::MustWait(_)
        ));

        // Search windows are small; the margin shrinks with them.
        tracker.update(&id, ApiSurface::Search, &headers(30, 4, reset_in(60), "search"));
        assert!(matches!(
            tracker.check_budget(&id, ApiSurface::Search, 1),
            BudgetDecision::Allow(_)
        ));
    }

    #[test]
    fn test_settle_applies_server_numbers() {
        let tracker = tracker(0);
        let id = CredentialId::new("pat-0");
        let reservation = match tracker.check_budget(&id, ApiSurface::Rest, 1) {
            BudgetDecision::Allow(r) => r,
            other => panic!("unexpected {:?}", other),
        };
        let info = RateLimitInfo::from_headers(&headers(5000, 4321, reset_in(600), "core")).unwrap();
        tracker.settle(reservation, Some(&info), true);

        let window = tracker.window_state(&id, ApiSurface::Rest).unwrap();
        assert_eq!(window.remaining, 4321);
        assert_eq!(window.reserved, 0);
    }

    #[test]
    fn test_unsent_reservation_is_refunded() {
        let tracker = tracker(0);
        let id = CredentialId::new("pat-0");
        tracker.update(&id, ApiSurface::Rest, &headers(5000, 3, reset_in(60), "core"));
        if let BudgetDecision::Allow(r) = tracker.check_budget(&id, ApiSurface::Rest, 2) {
            tracker.settle(r, None, false);
        }
        let window = tracker.window_state(&id, ApiSurface::Rest).unwrap();
        assert_eq!(window.remaining, 3);
        assert_eq!(window.available(), 3);
    }

    #[test]
    fn test_stale_reports_are_ignored() {
        let tracker = tracker(0);
        let id = CredentialId::new("pat-0");
        let current = reset_in(3600);
        let older = current - ChronoDuration::seconds(3600);

        tracker.update(&id, ApiSurface::Rest, &headers(5000, 100, current, "core"));
        // Same window reported out of order: remaining only goes down.
        tracker.update(&id, ApiSurface::Rest, &headers(5000, 150, current, "core"));
        // Previous window.
        tracker.update(&id, ApiSurface::Rest, &headers(5000, 4999, older, "core"));

        let window = tracker.window_state(&id, ApiSurface::Rest).unwrap();
        assert_eq!(window.remaining, 100);
        assert_eq!(window.reset_at, Some(current));
    }

    #[test]
    fn test_window_replenishes_after_reset() {
        let tracker = tracker(0);
        let id = CredentialId::new("pat-0");
        let reset = reset_in(60);
        tracker.update(&id, ApiSurface::Rest, &headers(5000, 0, reset, "core"));

        assert!(matches!(
            tracker.check_budget(&id, ApiSurface::Rest, 1),
            BudgetDecision::MustWait(_)
        ));
        let later = reset + ChronoDuration::seconds(1);
        assert!(matches!(
            tracker.check_budget_at(&id, ApiSurface::Rest, 1, later),
            BudgetDecision::Allow(_)
        ));
    }

    #[test]
    fn test_resource_header_selects_window() {
        let tracker = tracker(0);
        let id = CredentialId::new("pat-0");
        tracker.update(&id, ApiSurface::Rest, &headers(30, 7, reset_in(60), "search"));

        assert_eq!(tracker.window_state(&id, ApiSurface::Search).unwrap().remaining, 7);
        assert!(tracker.window_state(&id, ApiSurface::Rest).is_none());
    }

    #[test]
    fn test_graphql_reconciliation() {
        let tracker = tracker(0);
        let id = CredentialId::new("pat-0");
        let reset = reset_in(1800);
        tracker.reconcile_graphql(
            &id,
            3,
            &GraphQlRateLimit {
                cost: 11,
                remaining: 4989,
                reset_at: reset,
                limit: Some(5000),
            },
        );
        let window = tracker.window_state(&id, ApiSurface::GraphQl).unwrap();
        assert_eq!(window.remaining, 4989);
        assert_eq!(window.last_estimated_cost, Some(3));
        assert_eq!(window.last_actual_cost, Some(11));
    }
}
