//! Error types for the GitHub access layer.
//!
//! Every operation returns [`GitHubResult`]. Errors are `Clone` so a single
//! failed network call can be handed to every coalesced waiter, and they carry
//! the context a caller needs to pick a fallback: HTTP status, GitHub error
//! code, request id and the remaining rate-limit budget.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::HeaderMap;
use serde::Deserialize;
use thiserror::Error;

/// Result type alias for GitHub operations.
pub type GitHubResult<T> = Result<T, GitHubError>;

/// Error kinds for categorizing GitHub errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GitHubErrorKind {
    // Configuration errors
    /// Invalid configuration.
    InvalidConfiguration,

    // Credential errors
    /// The server rejected the credential (401). Fatal for that credential.
    AuthFailed,
    /// Every candidate credential is quarantined, expired or lacks scopes.
    NoCredentialAvailable,
    /// GitHub App installation token exchange failed.
    TokenRefreshFailed,

    // Rate limit errors
    /// Primary rate limit exhausted; wait for reset or rotate.
    RateLimited,
    /// Secondary (abuse) rate limit; retried with backoff.
    SecondaryRateLimited,

    // Resilience errors
    /// Circuit breaker for the endpoint group is open.
    CircuitOpen,
    /// The caller cancelled the operation.
    Cancelled,
    /// The caller's deadline passed.
    DeadlineExceeded,

    // Network errors
    /// Connection or I/O failure talking to GitHub.
    TransientNetwork,
    /// Request timed out.
    Timeout,
    /// GitHub answered with a 5xx status.
    ServerError,

    // Request errors
    /// Request validation failed (400).
    ValidationFailed,
    /// Access forbidden (403 without rate-limit signals).
    Forbidden,
    /// Resource not found (404).
    NotFound,
    /// Resource conflict (409).
    Conflict,
    /// Resource is gone (410).
    Gone,
    /// Unprocessable entity (422).
    UnprocessableEntity,
    /// Pagination cursor is malformed or points off the API host.
    InvalidCursor,

    // Response errors
    /// Failed to deserialize a response body.
    Deserialization,

    // GraphQL errors
    /// The GraphQL document could not be parsed or is not plannable.
    InvalidQuery,
    /// The query cannot be split under the node-cost ceiling.
    QueryTooLarge,
    /// GraphQL returned errors without usable data.
    QueryFailed,

    // Webhook errors
    /// Webhook HMAC signature did not match.
    InvalidWebhookSignature,
    /// Delivery id already seen inside the replay window.
    DuplicateDelivery,
    /// Webhook request is missing required headers.
    MalformedWebhook,

    // Generic
    /// Unknown error.
    Unknown,
}

impl fmt::Display for GitHubErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InvalidConfiguration => "invalid_configuration",
            Self::AuthFailed => "auth_failed",
            Self::NoCredentialAvailable => "no_credential_available",
            Self::TokenRefreshFailed => "token_refresh_failed",
            Self::RateLimited => "rate_limited",
            Self::SecondaryRateLimited => "secondary_rate_limited",
            Self::CircuitOpen => "circuit_open",
            Self::Cancelled => "cancelled",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::TransientNetwork => "transient_network",
            Self::Timeout => "timeout",
            Self::ServerError => "server_error",
            Self::ValidationFailed => "validation_failed",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Gone => "gone",
            Self::UnprocessableEntity => "unprocessable_entity",
            Self::InvalidCursor => "invalid_cursor",
            Self::Deserialization => "deserialization_error",
            Self::InvalidQuery => "invalid_query",
            Self::QueryTooLarge => "query_too_large",
            Self::QueryFailed => "query_failed",
            Self::InvalidWebhookSignature => "invalid_webhook_signature",
            Self::DuplicateDelivery => "duplicate_delivery",
            Self::MalformedWebhook => "malformed_webhook",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// How the retry executor treats a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry with exponential backoff and full jitter.
    Transient,
    /// Wait for the rate-limit reset or switch credential, then retry.
    AfterWait,
    /// Surface to the caller immediately.
    NonRetryable,
}

/// Rate limit information parsed from response headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitInfo {
    /// Maximum units allowed in the window.
    pub limit: u32,
    /// Remaining units in the current window.
    pub remaining: u32,
    /// Units used in the current window.
    pub used: Option<u32>,
    /// Time when the window resets, as reported by the server.
    pub reset_at: DateTime<Utc>,
    /// Retry-After header value in seconds (if present).
    pub retry_after: Option<u64>,
    /// Resource category (`core`, `graphql`, `search`, ...).
    pub resource: Option<String>,
}

impl RateLimitInfo {
    /// Parses the `x-ratelimit-*` headers.
    ///
    /// Returns `None` unless limit, remaining and reset are all present.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let limit = header_u64(headers, "x-ratelimit-limit")?;
        let remaining = header_u64(headers, "x-ratelimit-remaining")?;
        let reset = header_u64(headers, "x-ratelimit-reset")?;
        let reset_at = Utc.timestamp_opt(i64::try_from(reset).ok()?, 0).single()?;

        Some(Self {
            limit: clamp_u32(limit),
            remaining: clamp_u32(remaining).min(clamp_u32(limit)),
            used: header_u64(headers, "x-ratelimit-used").map(clamp_u32),
            reset_at,
            retry_after: header_u64(headers, "retry-after"),
            resource: header_str(headers, "x-ratelimit-resource").map(str::to_string),
        })
    }

    /// Time left until the window resets, zero if already past.
    pub fn time_until_reset(&self) -> Duration {
        (self.reset_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }
}

pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    header_str(headers, name).and_then(|v| v.parse().ok())
}

fn clamp_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

/// GitHub API error with detailed information.
#[derive(Error, Debug, Clone)]
pub struct GitHubError {
    kind: GitHubErrorKind,
    message: String,
    status_code: Option<u16>,
    /// REST `errors[].code` or GraphQL error `type`.
    github_code: Option<String>,
    request_id: Option<String>,
    documentation_url: Option<String>,
    rate_limit: Option<RateLimitInfo>,
    retry_after: Option<Duration>,
    /// Raised before anything reached the network.
    local: bool,
    #[source]
    cause: Option<Arc<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for GitHubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)?;
        if let Some(code) = self.status_code {
            write!(f, " (HTTP {})", code)?;
        }
        if let Some(ref code) = self.github_code {
            write!(f, " [code: {}]", code)?;
        }
        if let Some(ref id) = self.request_id {
            write!(f, " [request_id: {}]", id)?;
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
    documentation_url: Option<String>,
    #[serde(default)]
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    code: Option<String>,
}

impl GitHubError {
    /// Creates a new GitHub error.
    pub fn new(kind: GitHubErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status_code: None,
            github_code: None,
            request_id: None,
            documentation_url: None,
            rate_limit: None,
            retry_after: None,
            local: false,
            cause: None,
        }
    }

    /// Sets the HTTP status code.
    pub fn with_status(mut self, code: u16) -> Self {
        self.status_code = Some(code);
        self
    }

    /// Sets the GitHub error code.
    pub fn with_github_code(mut self, code: impl Into<String>) -> Self {
        self.github_code = Some(code.into());
        self
    }

    /// Sets the GitHub request ID.
    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    /// Sets the documentation URL.
    pub fn with_documentation_url(mut self, url: impl Into<String>) -> Self {
        self.documentation_url = Some(url.into());
        self
    }

    /// Sets the rate limit info.
    pub fn with_rate_limit(mut self, info: RateLimitInfo) -> Self {
        self.rate_limit = Some(info);
        self
    }

    /// Sets an explicit wait before the next attempt.
    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    /// Marks the error as decided locally, without a network round-trip.
    pub fn local(mut self) -> Self {
        self.local = true;
        self
    }

    /// Sets the underlying cause.
    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    /// Gets the error kind.
    pub fn kind(&self) -> GitHubErrorKind {
        self.kind
    }

    /// Gets the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Gets the HTTP status code.
    pub fn status_code(&self) -> Option<u16> {
        self.status_code
    }

    /// Gets the GitHub error code.
    pub fn github_code(&self) -> Option<&str> {
        self.github_code.as_deref()
    }

    /// Gets the request ID.
    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    /// Gets the documentation URL.
    pub fn documentation_url(&self) -> Option<&str> {
        self.documentation_url.as_deref()
    }

    /// Gets the rate limit info.
    pub fn rate_limit(&self) -> Option<&RateLimitInfo> {
        self.rate_limit.as_ref()
    }

    /// Remaining budget reported alongside the error, if known.
    pub fn remaining_budget(&self) -> Option<u32> {
        self.rate_limit.as_ref().map(|r| r.remaining)
    }

    /// Returns true when the error was raised without contacting GitHub.
    pub fn is_local(&self) -> bool {
        self.local
    }

    /// How long to wait before the next attempt, if the server said so.
    ///
    /// An explicit `Retry-After` wins over the window reset time.
    pub fn retry_after(&self) -> Option<Duration> {
        if let Some(delay) = self.retry_after {
            return Some(delay);
        }
        let info = self.rate_limit.as_ref()?;
        if let Some(secs) = info.retry_after {
            return Some(Duration::from_secs(secs));
        }
        Some(info.time_until_reset())
    }

    /// Explicit `Retry-After` sent with this response, ignoring window resets.
    pub fn server_retry_after(&self) -> Option<Duration> {
        self.retry_after
            .or_else(|| self.rate_limit.as_ref()?.retry_after.map(Duration::from_secs))
    }

    /// Classifies the error for the retry executor.
    pub fn class(&self) -> ErrorClass {
        if self.local {
            return ErrorClass::NonRetryable;
        }
        match self.kind {
            GitHubErrorKind::TransientNetwork
            | GitHubErrorKind::Timeout
            | GitHubErrorKind::ServerError
            | GitHubErrorKind::SecondaryRateLimited => ErrorClass::Transient,
            GitHubErrorKind::RateLimited => ErrorClass::AfterWait,
            _ => ErrorClass::NonRetryable,
        }
    }

    /// Returns true if this error is retried by the executor.
    pub fn is_retryable(&self) -> bool {
        self.class() != ErrorClass::NonRetryable
    }

    /// Returns true if the failure says something about endpoint health.
    pub fn counts_as_endpoint_failure(&self) -> bool {
        !self.local && self.class() == ErrorClass::Transient
    }

    /// Creates an error from a non-success HTTP response.
    pub fn from_response(status: u16, headers: &HeaderMap, body: &[u8]) -> Self {
        let parsed: Option<ErrorBody> = serde_json::from_slice(body).ok();
        let message = parsed
            .as_ref()
            .and_then(|b| b.message.clone())
            .unwrap_or_else(|| format!("GitHub returned HTTP {}", status));
        let rate_limit = RateLimitInfo::from_headers(headers);
        let kind = Self::kind_from_response(status, &message, headers, rate_limit.as_ref());

        let mut error = Self::new(kind, message).with_status(status);
        if let Some(body) = parsed {
            if let Some(url) = body.documentation_url {
                error = error.with_documentation_url(url);
            }
            if let Some(code) = body.errors.into_iter().find_map(|e| e.code) {
                error = error.with_github_code(code);
            }
        }
        if let Some(id) = header_str(headers, "x-github-request-id") {
            error = error.with_request_id(id);
        }
        if let Some(info) = rate_limit {
            error = error.with_rate_limit(info);
        }
        if let Some(secs) = header_u64(headers, "retry-after") {
            error = error.with_retry_after(Duration::from_secs(secs));
        }
        error
    }

    fn kind_from_response(
        status: u16,
        message: &str,
        headers: &HeaderMap,
        rate_limit: Option<&RateLimitInfo>,
    ) -> GitHubErrorKind {
        match status {
            401 => GitHubErrorKind::AuthFailed,
            403 | 429 => {
                let exhausted = rate_limit.map(|r| r.remaining == 0).unwrap_or(false)
                    || header_str(headers, "x-ratelimit-remaining") == Some("0");
                let lowered = message.to_ascii_lowercase();
                if exhausted {
                    GitHubErrorKind::RateLimited
                } else if headers.contains_key("retry-after")
                    || lowered.contains("secondary rate limit")
                    || lowered.contains("abuse")
                    || status == 429
                {
                    GitHubErrorKind::SecondaryRateLimited
                } else {
                    GitHubErrorKind::Forbidden
                }
            }
            400 => GitHubErrorKind::ValidationFailed,
            404 => GitHubErrorKind::NotFound,
            409 => GitHubErrorKind::Conflict,
            410 => GitHubErrorKind::Gone,
            422 => GitHubErrorKind::UnprocessableEntity,
            500..=599 => GitHubErrorKind::ServerError,
            _ => GitHubErrorKind::Unknown,
        }
    }

    // Convenience constructors

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(GitHubErrorKind::InvalidConfiguration, message).local()
    }

    /// Creates a deserialization error.
    pub fn deserialization(message: impl Into<String>) -> Self {
        Self::new(GitHubErrorKind::Deserialization, message)
    }

    /// Creates a query-too-large error.
    pub fn query_too_large(message: impl Into<String>) -> Self {
        Self::new(GitHubErrorKind::QueryTooLarge, message).local()
    }

    /// Creates an invalid-query error.
    pub fn invalid_query(message: impl Into<String>) -> Self {
        Self::new(GitHubErrorKind::InvalidQuery, message).local()
    }

    /// Creates a cancellation error.
    pub fn cancelled() -> Self {
        Self::new(GitHubErrorKind::Cancelled, "operation cancelled by caller").local()
    }

    /// Creates a deadline error.
    pub fn deadline_exceeded() -> Self {
        Self::new(GitHubErrorKind::DeadlineExceeded, "deadline exceeded").local()
    }
}

impl From<serde_json::Error> for GitHubError {
    fn from(err: serde_json::Error) -> Self {
        GitHubError::deserialization(err.to_string()).with_cause(err)
    }
}
