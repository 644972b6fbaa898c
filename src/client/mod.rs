//! GitHub API client façade.
//!
//! [`GitHubClient`] composes the credential rotator, rate-limit tracker,
//! resilience orchestrator, conditional cache, request coalescer, query
//! planner and webhook verifier behind typed operations. Every request goes
//! through the same path:
//!
//! 1. a fresh cache entry answers without touching the network;
//! 2. identical in-flight reads are coalesced into one call;
//! 3. each attempt leases a credential with budget for it, sends, and
//!    reports what the response said about the credential and its window.

mod health;
mod maintenance;

pub use health::HealthStatus;
pub use maintenance::{MaintenanceHandle, MaintenanceReport};

use std::sync::Arc;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as Json;
use tokio::time::Instant;
use tracing::debug;
use url::Url;

use crate::auth::{AppTokenExchanger, Credential, CredentialId, CredentialStore, TokenRefresher};
use crate::cache::{CacheEntry, CacheLookup, ConditionalCache, RequestCoalescer, RequestSignature};
use crate::config::GitHubConfig;
use crate::errors::{header_str, GitHubError, GitHubErrorKind, GitHubResult, RateLimitInfo};
use crate::graphql::{CostEstimate, GraphQlResult, QueryPlanner};
use crate::observability::{MetricsSnapshot, Telemetry, TelemetryEvent};
use crate::pagination::{resolve_cursor, Page, PaginationLinks};
use crate::resilience::{
    ApiSurface, BudgetSnapshot, CircuitState, RateLimitTracker, RequestContext,
    ResilienceOrchestrator, RetryPolicy,
};
use crate::rotation::{AcquireRequest, CredentialLease, LeaseOutcome, TokenRotator};
use crate::services::{
    graphql_rate_limited, reported_rate_limit, GraphQlService, IssuesService, ListIssuesParams,
    RepositoriesService,
};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
use crate::types::{Issue, Repository};
use crate::webhooks::{WebhookEvent, WebhookVerifier};

/// How a response relates to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheStatus {
    /// Cacheable request answered by GitHub with a full body.
    Miss,
    /// Served from a fresh entry without a request.
    Fresh,
    /// GitHub answered 304; the stored body was returned.
    Revalidated,
    /// Not a cacheable request.
    #[default]
    Uncached,
}

/// What happened while answering an operation.
#[derive(Debug, Clone, Default)]
pub struct ResponseMeta {
    /// Budget reported by the last response, if any reached GitHub.
    pub rate_limit: Option<RateLimitInfo>,
    /// Cache involvement.
    pub cache: CacheStatus,
    /// Credential used for the last request.
    pub credential_id: Option<CredentialId>,
    /// Attempts made, retries included. Zero when served from cache.
    pub attempts: u32,
    /// True when the result came from another caller's identical request.
    pub coalesced: bool,
}

impl ResponseMeta {
    /// Folds in the metadata of one more request of the same operation.
    pub(crate) fn absorb(&mut self, other: &ResponseMeta) {
        self.attempts += other.attempts;
        self.coalesced |= other.coalesced;
        if other.rate_limit.is_some() {
            self.rate_limit = other.rate_limit.clone();
        }
        if other.credential_id.is_some() {
            self.credential_id = other.credential_id.clone();
        }
    }
}

/// Result of an operation with its metadata.
#[derive(Debug, Clone)]
pub struct Response<T> {
    /// Decoded result.
    pub data: T,
    /// Request metadata.
    pub meta: ResponseMeta,
}

impl<T> Response<T> {
    /// Drops the metadata.
    pub fn into_data(self) -> T {
        self.data
    }

    /// Maps the result, keeping the metadata.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Response<U> {
        Response {
            data: f(self.data),
            meta: self.meta,
        }
    }
}

/// One HTTP exchange as the façade describes it.
#[derive(Debug, Clone)]
pub(crate) struct RequestSpec {
    pub(crate) method: Method,
    pub(crate) url: Url,
    pub(crate) body: Option<Bytes>,
    /// Circuit-breaker group.
    pub(crate) group: String,
    pub(crate) surface: ApiSurface,
    /// Budget units reserved per attempt.
    pub(crate) cost: u32,
    pub(crate) cacheable: bool,
    /// Identical concurrent requests may share one call.
    pub(crate) shareable: bool,
    pub(crate) graphql: bool,
    pub(crate) retry: bool,
}

impl RequestSpec {
    /// `path` is the request path relative to the API base, as the caller
    /// gave it. It alone decides the breaker group and budget surface.
    pub(crate) fn rest(method: Method, path: &str, url: Url) -> Self {
        let (group, surface) = rest_group(path);
        let read = method == Method::GET;
        Self {
            method,
            url,
            body: None,
            group,
            surface,
            cost: 1,
            cacheable: read,
            shareable: read,
            graphql: false,
            retry: true,
        }
    }

    pub(crate) fn graphql(url: Url, body: Bytes, group: String, points: u32, shareable: bool) -> Self {
        Self {
            method: Method::POST,
            url,
            body: Some(body),
            group,
            surface: ApiSurface::GraphQl,
            cost: points.max(1),
            cacheable: false,
            shareable,
            graphql: true,
            retry: true,
        }
    }
}

/// Circuit-breaker group and budget surface of a base-relative REST path.
///
/// `/repos/{owner}/{repo}/{resource}/..` groups by resource so one failing
/// sub-API does not open the circuit for the rest of the repository API.
fn rest_group(path: &str) -> (String, ApiSurface) {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    match segments.as_slice() {
        ["search", ..] => ("rest:search".to_string(), ApiSurface::Search),
        ["repos", _, _, resource, ..] => (format!("rest:{}", resource), ApiSurface::Rest),
        [first, ..] => (format!("rest:{}", first), ApiSurface::Rest),
        [] => ("rest:root".to_string(), ApiSurface::Rest),
    }
}

/// A response as it travels between the cache, the coalescer and callers.
#[derive(Debug, Clone)]
pub(crate) struct Fetched {
    pub(crate) headers: HeaderMap,
    pub(crate) body: Bytes,
    pub(crate) meta: ResponseMeta,
}

impl Fetched {
    fn from_entry(entry: &CacheEntry, cache: CacheStatus) -> Self {
        let mut headers = HeaderMap::new();
        let stored = [
            ("etag", entry.etag()),
            ("last-modified", entry.last_modified()),
            ("link", entry.link()),
        ];
        for (name, value) in stored {
            if let Some(value) = value.and_then(|v| HeaderValue::from_str(v).ok()) {
                headers.insert(HeaderName::from_static(name), value);
            }
        }
        Self {
            headers,
            body: entry.body().clone(),
            meta: ResponseMeta {
                cache,
                ..ResponseMeta::default()
            },
        }
    }

    pub(crate) fn decode<T: DeserializeOwned>(&self) -> GitHubResult<T> {
        serde_json::from_slice(&self.body).map_err(|e| {
            GitHubError::deserialization(format!("Failed to deserialize response: {}", e))
        })
    }
}

/// Builder for [`GitHubClient`].
pub struct GitHubClientBuilder {
    config: GitHubConfig,
    transport: Option<Arc<dyn HttpTransport>>,
    telemetry: Option<Telemetry>,
    refresher: Option<Arc<dyn TokenRefresher>>,
}

impl GitHubClientBuilder {
    /// Starts from `config`.
    pub fn new(config: GitHubConfig) -> Self {
        Self {
            config,
            transport: None,
            telemetry: None,
            refresher: None,
        }
    }

    /// Sends requests through `transport` instead of reqwest.
    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Reports events to `telemetry` instead of the tracing sink.
    pub fn telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Refreshes App installation tokens with `refresher`.
    pub fn token_refresher(mut self, refresher: Arc<dyn TokenRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    /// Builds the client.
    ///
    /// # Errors
    ///
    /// `InvalidConfiguration` when the configuration does not validate.
    pub fn build(self) -> GitHubResult<GitHubClient> {
        let config = self.config;
        config.validate()?;

        let base_url = Url::parse(&config.base_url)
            .map_err(|e| GitHubError::configuration(format!("Invalid base URL: {}", e)))?;
        let graphql_url = Url::parse(&config.graphql_endpoint())
            .map_err(|e| GitHubError::configuration(format!("Invalid GraphQL URL: {}", e)))?;

        let telemetry = self.telemetry.unwrap_or_default();
        let transport: Arc<dyn HttpTransport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::with_timeout(config.timeout)?),
        };
        let refresher = self.refresher.unwrap_or_else(|| {
            Arc::new(AppTokenExchanger::new(
                Arc::clone(&transport),
                config.base_url.clone(),
                config.user_agent.clone(),
                config.api_version.clone(),
            ))
        });

        let store = Arc::new(CredentialStore::new(config.credentials.clone())?);
        let tracker = Arc::new(RateLimitTracker::new(
            config.rate_limit.safety_margin,
            telemetry.clone(),
        ));
        let rotator = TokenRotator::new(
            store,
            tracker,
            &config.rotation,
            &config.rate_limit,
            telemetry.clone(),
        )
        .with_refresher(refresher);

        let inner = ClientInner {
            orchestrator: ResilienceOrchestrator::new(
                &config.retry,
                &config.circuit_breaker,
                telemetry.clone(),
            ),
            cache: ConditionalCache::new(&config.cache, telemetry.clone()),
            coalescer: RequestCoalescer::new(config.cache.shards, telemetry.clone()),
            planner: QueryPlanner::from_config(&config.graphql),
            webhooks: WebhookVerifier::new(&config.webhook, telemetry.clone()),
            rotator,
            transport,
            telemetry,
            base_url,
            graphql_url,
            config,
        };
        Ok(GitHubClient {
            inner: Arc::new(inner),
        })
    }
}

pub(crate) struct ClientInner {
    config: GitHubConfig,
    base_url: Url,
    graphql_url: Url,
    transport: Arc<dyn HttpTransport>,
    telemetry: Telemetry,
    rotator: TokenRotator,
    orchestrator: ResilienceOrchestrator,
    cache: ConditionalCache,
    coalescer: RequestCoalescer<Fetched>,
    planner: QueryPlanner,
    webhooks: WebhookVerifier,
}

/// GitHub API client.
///
/// Cheap to clone; clones share credentials, budgets, cache and breakers.
#[derive(Clone)]
pub struct GitHubClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for GitHubClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubClient")
            .field("base_url", &self.inner.base_url.as_str())
            .field("credentials", &self.inner.rotator.store().len())
            .field("cached_entries", &self.inner.cache.len())
            .finish()
    }
}

impl GitHubClient {
    /// Creates a client sending through reqwest.
    pub fn new(config: GitHubConfig) -> GitHubResult<Self> {
        GitHubClientBuilder::new(config).build()
    }

    /// Creates a client sending through `transport`.
    pub fn with_transport(config: GitHubConfig, transport: Arc<dyn HttpTransport>) -> GitHubResult<Self> {
        GitHubClientBuilder::new(config).transport(transport).build()
    }

    /// Returns a builder for customizing transport and telemetry.
    pub fn builder(config: GitHubConfig) -> GitHubClientBuilder {
        GitHubClientBuilder::new(config)
    }

    /// Configuration in use.
    pub fn config(&self) -> &GitHubConfig {
        &self.inner.config
    }

    /// REST base URL.
    pub fn base_url(&self) -> &Url {
        &self.inner.base_url
    }

    /// Repository operations.
    pub fn repositories(&self) -> RepositoriesService<'_> {
        RepositoriesService::new(self)
    }

    /// Issue operations.
    pub fn issues(&self) -> IssuesService<'_> {
        IssuesService::new(self)
    }

    /// GraphQL operations.
    pub fn graphql(&self) -> GraphQlService<'_> {
        GraphQlService::new(self)
    }

    /// Gets a repository.
    pub async fn get_repository(
        &self,
        owner: &str,
        repo: &str,
        ctx: &RequestContext,
    ) -> GitHubResult<Response<Repository>> {
        self.repositories().get(owner, repo, ctx).await
    }

    /// Lists one page of a repository's issues.
    ///
    /// Pass `None` for the first page, then the previous page's
    /// `next_cursor()`. `params` only applies to the first page; cursors
    /// carry their own query.
    pub async fn list_issues(
        &self,
        owner: &str,
        repo: &str,
        params: &ListIssuesParams,
        cursor: Option<&str>,
        ctx: &RequestContext,
    ) -> GitHubResult<Response<Page<Issue>>> {
        self.issues().list(owner, repo, params, cursor, ctx).await
    }

    /// Runs a GraphQL operation, splitting it when it exceeds the node
    /// ceiling.
    pub async fn run_graphql(
        &self,
        query: &str,
        variables: &Json,
        operation_name: Option<&str>,
        ctx: &RequestContext,
    ) -> GitHubResult<Response<GraphQlResult>> {
        self.graphql().run(query, variables, operation_name, ctx).await
    }

    /// Runs a GraphQL operation and decodes `data` into `T`.
    pub async fn run_graphql_typed<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: &Json,
        operation_name: Option<&str>,
        ctx: &RequestContext,
    ) -> GitHubResult<Response<T>> {
        self.graphql()
            .run_typed(query, variables, operation_name, ctx)
            .await
    }

    /// Estimates a GraphQL operation without sending it.
    pub fn estimate_graphql_cost(
        &self,
        query: &str,
        variables: &Json,
        operation_name: Option<&str>,
    ) -> GitHubResult<CostEstimate> {
        self.graphql().estimate(query, variables, operation_name)
    }

    /// Verifies an inbound webhook delivery and returns it.
    ///
    /// # Errors
    ///
    /// `MalformedWebhook` when headers are missing, `InvalidWebhookSignature`
    /// when no configured secret signed the payload, `DuplicateDelivery` when
    /// the delivery id was already seen within the replay window.
    pub fn verify_webhook(&self, headers: &HeaderMap, payload: impl Into<Bytes>) -> GitHubResult<WebhookEvent> {
        let event = WebhookEvent::from_headers(headers, payload)?;
        self.inner.webhooks.verify(&event)?;
        Ok(event)
    }

    /// Webhook verifier.
    pub fn webhooks(&self) -> &WebhookVerifier {
        &self.inner.webhooks
    }

    /// GETs `path` and decodes the body.
    pub async fn get<T: DeserializeOwned>(&self, path: &str, ctx: &RequestContext) -> GitHubResult<Response<T>> {
        let spec = RequestSpec::rest(Method::GET, path, self.url(path)?);
        let fetched = self.fetch(spec, ctx).await?;
        Ok(Response {
            data: fetched.decode()?,
            meta: fetched.meta,
        })
    }

    /// GETs one page of a list endpoint.
    ///
    /// `cursor` must be a cursor returned by an earlier page of this client;
    /// anything pointing elsewhere fails with `InvalidCursor`.
    pub async fn list<T, P>(
        &self,
        path: &str,
        params: &P,
        cursor: Option<&str>,
        ctx: &RequestContext,
    ) -> GitHubResult<Response<Page<T>>>
    where
        T: DeserializeOwned,
        P: Serialize + ?Sized,
    {
        let (api_path, url) = match cursor {
            Some(cursor) => {
                let url = resolve_cursor(&self.inner.base_url, cursor)?;
                let base_path = self.inner.base_url.path().trim_end_matches('/');
                let relative = url.path().strip_prefix(base_path).unwrap_or(url.path());
                (relative.to_string(), url)
            }
            None => {
                let query = serde_urlencoded::to_string(params).map_err(|e| {
                    GitHubError::new(
                        GitHubErrorKind::ValidationFailed,
                        format!("Failed to encode query parameters: {}", e),
                    )
                    .local()
                })?;
                let mut url = self.url(path)?;
                if !query.is_empty() {
                    url.set_query(Some(&query));
                }
                (path.to_string(), url)
            }
        };

        let spec = RequestSpec::rest(Method::GET, &api_path, url);
        let fetched = self.fetch(spec, ctx).await?;
        let items: Vec<T> = fetched.decode()?;
        let links = PaginationLinks::from_headers(&fetched.headers);
        Ok(Response {
            data: Page::new(items, &links),
            meta: fetched.meta,
        })
    }

    /// Credentials with their current status.
    pub fn credentials(&self) -> Vec<Credential> {
        self.inner.rotator.store().snapshot()
    }

    /// Budget windows of every credential.
    pub fn rate_limits(&self) -> Vec<BudgetSnapshot> {
        self.inner.rotator.tracker().snapshots()
    }

    /// Counters accumulated since the client was built.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.telemetry.metrics().snapshot()
    }

    /// Circuit breaker states by endpoint group.
    pub fn circuit_states(&self) -> Vec<(String, CircuitState)> {
        self.inner.orchestrator.circuit_states()
    }

    pub(crate) fn url(&self, path: &str) -> GitHubResult<Url> {
        let joined = format!(
            "{}/{}",
            self.inner.base_url.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        Url::parse(&joined).map_err(|e| {
            GitHubError::new(
                GitHubErrorKind::ValidationFailed,
                format!("Invalid request path {}: {}", path, e),
            )
            .local()
        })
    }

    pub(crate) fn planner(&self) -> &QueryPlanner {
        &self.inner.planner
    }

    pub(crate) fn graphql_url(&self) -> &Url {
        &self.inner.graphql_url
    }

    pub(crate) fn telemetry(&self) -> &Telemetry {
        &self.inner.telemetry
    }

    pub(crate) fn rotator(&self) -> &TokenRotator {
        &self.inner.rotator
    }

    /// Answers `spec` from the cache, an in-flight identical call, or the
    /// network, in that order.
    pub(crate) async fn fetch(&self, spec: RequestSpec, ctx: &RequestContext) -> GitHubResult<Fetched> {
        let signature = RequestSignature::new(&spec.method, &spec.url, spec.body.as_deref());
        let cacheable = spec.cacheable && self.inner.cache.is_enabled() && !ctx.cache_bypassed();

        // Cache hits and joined calls skip credential selection.
        self.inner.rotator.check_scopes(ctx.required_scopes())?;
        if cacheable {
            if let CacheLookup::Fresh(entry) = self.inner.cache.lookup(&signature) {
                return Ok(Fetched::from_entry(&entry, CacheStatus::Fresh));
            }
        }
        if !spec.shareable {
            return self.inner.send(&spec, &signature, cacheable, ctx).await;
        }

        let inner = Arc::clone(&self.inner);
        let shared_ctx = ctx.detached();
        let flight = signature.scoped(ctx.required_scopes());
        let coalesced = self
            .inner
            .coalescer
            .coalesce(&flight, ctx, move || async move {
                inner.send(&spec, &signature, cacheable, &shared_ctx).await
            })
            .await;

        let mut fetched = coalesced.result?;
        fetched.meta.coalesced = coalesced.joined;
        Ok(fetched)
    }
}

impl ClientInner {
    async fn send(
        &self,
        spec: &RequestSpec,
        signature: &RequestSignature,
        cacheable: bool,
        ctx: &RequestContext,
    ) -> GitHubResult<Fetched> {
        let no_retry = RetryPolicy::no_retry();
        let policy = if spec.retry {
            self.orchestrator.policy()
        } else {
            &no_retry
        };

        let mut attempts = 0;
        let result = self
            .orchestrator
            .execute_with_policy(policy, &spec.group, ctx, |attempt| {
                attempts = attempt;
                self.attempt(spec, signature, cacheable, ctx)
            })
            .await;

        result.map(|mut fetched| {
            fetched.meta.attempts = attempts;
            fetched
        })
    }

    fn build_request(
        &self,
        spec: &RequestSpec,
        lease: &CredentialLease,
        previous: Option<&CacheEntry>,
    ) -> GitHubResult<HttpRequest> {
        let mut request = HttpRequest::new(spec.method.clone(), spec.url.clone())
            .with_header("accept", "application/vnd.github+json")?
            .with_header("user-agent", &self.config.user_agent)?
            .with_header("x-github-api-version", &self.config.api_version)?
            .with_header("authorization", lease.authorization().expose_secret())?
            .with_timeout(self.config.timeout);

        if let Some(previous) = previous {
            if let Some(etag) = previous.etag() {
                request = request.with_header("if-none-match", etag)?;
            } else if let Some(modified) = previous.last_modified() {
                request = request.with_header("if-modified-since", modified)?;
            }
        }
        if let Some(body) = &spec.body {
            request = request.with_json_body(body.clone());
        }
        Ok(request)
    }

    async fn attempt(
        &self,
        spec: &RequestSpec,
        signature: &RequestSignature,
        cacheable: bool,
        ctx: &RequestContext,
    ) -> GitHubResult<Fetched> {
        let acquire = AcquireRequest::new(spec.surface, spec.cost).with_scopes(ctx.required_scopes());
        let lease = self.rotator.acquire_for(&acquire, ctx).await?;

        let previous = if cacheable {
            self.cache.get(signature)
        } else {
            None
        };
        let request = match self.build_request(spec, &lease, previous.as_deref()) {
            Ok(request) => request,
            Err(error) => {
                self.rotator.release(lease, LeaseOutcome::NotSent, None);
                return Err(error);
            }
        };

        let credential_id = lease.credential_id().clone();
        self.telemetry.emit(TelemetryEvent::RequestSent {
            group: spec.group.clone(),
            credential_id: credential_id.clone(),
        });
        let started = Instant::now();

        let response = match ctx.run(self.transport.send(request)).await {
            Ok(response) => response,
            Err(error) => {
                // The request may have reached GitHub; count it as spent.
                self.rotator.release(lease, LeaseOutcome::Completed, None);
                self.telemetry.emit(TelemetryEvent::RequestCompleted {
                    group: spec.group.clone(),
                    status: None,
                    latency: started.elapsed(),
                });
                return Err(error);
            }
        };

        self.telemetry.emit(TelemetryEvent::RequestCompleted {
            group: spec.group.clone(),
            status: Some(response.status.as_u16()),
            latency: started.elapsed(),
        });
        self.settle(spec, signature, cacheable, lease, previous, response)
    }

    /// Releases the lease according to the response and turns the response
    /// into a result.
    fn settle(
        &self,
        spec: &RequestSpec,
        signature: &RequestSignature,
        cacheable: bool,
        lease: CredentialLease,
        previous: Option<Arc<CacheEntry>>,
        response: HttpResponse,
    ) -> GitHubResult<Fetched> {
        let HttpResponse {
            status,
            headers,
            body,
        } = response;
        let rate_limit = RateLimitInfo::from_headers(&headers);
        let credential_id = lease.credential_id().clone();

        if status == StatusCode::NOT_MODIFIED {
            if let Some(previous) = previous {
                self.rotator
                    .release(lease, LeaseOutcome::Completed, rate_limit.as_ref());
                let etag = header_str(&headers, "etag").map(str::to_string);
                let entry = self.cache.revalidate(signature, &previous, etag);
                debug!(signature = %signature, "Cache entry revalidated");
                let mut fetched = Fetched::from_entry(&entry, CacheStatus::Revalidated);
                fetched.meta.rate_limit = rate_limit;
                fetched.meta.credential_id = Some(credential_id);
                return Ok(fetched);
            }
        }

        if !status.is_success() {
            let error = GitHubError::from_response(status.as_u16(), &headers, &body);
            let outcome = match error.kind() {
                GitHubErrorKind::AuthFailed => LeaseOutcome::AuthFailed,
                GitHubErrorKind::RateLimited => LeaseOutcome::RateLimited,
                _ => LeaseOutcome::Completed,
            };
            self.rotator.release(lease, outcome, rate_limit.as_ref());
            return Err(error);
        }

        if spec.graphql {
            if let Ok(result) = serde_json::from_slice::<GraphQlResult>(&body) {
                if let Some(error) = graphql_rate_limited(&result, rate_limit.clone()) {
                    self.rotator
                        .release(lease, LeaseOutcome::RateLimited, rate_limit.as_ref());
                    return Err(error);
                }
                self.rotator
                    .release(lease, LeaseOutcome::Completed, rate_limit.as_ref());
                if let Some(reported) = reported_rate_limit(&result.data) {
                    self.rotator
                        .tracker()
                        .reconcile_graphql(&credential_id, spec.cost, &reported);
                }
            } else {
                self.rotator
                    .release(lease, LeaseOutcome::Completed, rate_limit.as_ref());
            }
        } else {
            self.rotator
                .release(lease, LeaseOutcome::Completed, rate_limit.as_ref());
        }

        let cache = if cacheable && status == StatusCode::OK {
            let entry = CacheEntry::new(
                status.as_u16(),
                body.clone(),
                header_str(&headers, "etag").map(str::to_string),
                self.cache.ttl(),
            )
            .with_last_modified(header_str(&headers, "last-modified").map(str::to_string))
            .with_link(header_str(&headers, "link").map(str::to_string));
            self.cache.put(signature.clone(), entry);
            CacheStatus::Miss
        } else {
            CacheStatus::Uncached
        };

        Ok(Fetched {
            headers,
            body,
            meta: ResponseMeta {
                rate_limit,
                cache,
                credential_id: Some(credential_id),
                attempts: 0,
                coalesced: false,
            },
        })
    }
}
