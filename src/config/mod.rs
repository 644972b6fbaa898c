//! Configuration types for the GitHub access layer.
//!
//! [`GitHubConfig`] is a fixed struct of named options grouped into
//! sub-configs. It is validated once in [`GitHubConfigBuilder::build`] (and
//! again when a client is constructed) so invalid combinations never reach
//! the first request.

use std::collections::HashSet;
use std::time::Duration;

use secrecy::SecretString;
use url::Url;

use crate::auth::CredentialConfig;
use crate::errors::GitHubError;
use crate::graphql::CostModel;
use crate::resilience::WaitPolicy;

/// Default GitHub API base URL.
pub const DEFAULT_BASE_URL: &str = "https://api.github.com";

/// Default GitHub API version (date-based).
pub const DEFAULT_API_VERSION: &str = "2022-11-28";

/// Default request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default User-Agent header.
pub const DEFAULT_USER_AGENT: &str = "integrations-github-access/0.1.0";

/// GitHub's documented GraphQL node limit.
pub const DEFAULT_GRAPHQL_COST_CEILING: u64 = 500_000;

/// Retry configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum attempts, including the first one.
    pub max_attempts: u32,
    /// Backoff ceiling for the first retry.
    pub initial_backoff: Duration,
    /// Upper bound of any single backoff.
    pub max_backoff: Duration,
    /// Total time budget across all attempts and waits.
    pub max_elapsed: Duration,
    /// Retry a primary rate limit immediately on another credential instead
    /// of sleeping until reset.
    pub rotate_on_rate_limit: bool,
    /// Longest sleep accepted while waiting for a rate-limit reset.
    pub max_rate_limit_wait: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            max_elapsed: Duration::from_secs(120),
            rotate_on_rate_limit: true,
            max_rate_limit_wait: Duration::from_secs(300),
        }
    }
}

/// Circuit breaker configuration, applied per endpoint group.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures inside `failure_window` that open the circuit.
    pub failure_threshold: u32,
    /// Rolling window the failures must fall into.
    pub failure_window: Duration,
    /// Time the circuit stays open before allowing a trial call.
    pub cooldown: Duration,
    /// Enable circuit breaking.
    pub enabled: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
            enabled: true,
        }
    }
}

/// Rate limit configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Units kept in reserve on every credential window.
    pub safety_margin: u32,
    /// Maximum callers queued waiting for a window reset.
    pub max_queued_waiters: usize,
    /// Wait policy used when a request does not set one.
    pub default_wait_policy: WaitPolicy,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            safety_margin: 10,
            max_queued_waiters: 64,
            default_wait_policy: WaitPolicy::FailFast,
        }
    }
}

/// Conditional cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Soft TTL: entries younger than this are served without a request.
    pub ttl: Duration,
    /// Entries older than this are evicted instead of revalidated.
    pub max_stale: Duration,
    /// Number of independently locked shards.
    pub shards: usize,
    /// Capacity of each shard.
    pub max_entries_per_shard: usize,
    /// Enable caching of GET responses.
    pub enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            max_stale: Duration::from_secs(3600),
            shards: 16,
            max_entries_per_shard: 1024,
            enabled: true,
        }
    }
}

/// GraphQL planning configuration.
#[derive(Debug, Clone)]
pub struct GraphQlConfig {
    /// Node-cost ceiling a single request may not exceed.
    pub cost_ceiling: u64,
    /// Rules used to estimate node cost.
    pub cost_model: CostModel,
    /// Upper bound on sub-queries a single plan may produce.
    pub max_sub_queries: usize,
}

impl Default for GraphQlConfig {
    fn default() -> Self {
        Self {
            cost_ceiling: DEFAULT_GRAPHQL_COST_CEILING,
            cost_model: CostModel::default(),
            max_sub_queries: 64,
        }
    }
}

/// Webhook verification configuration.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Accepted secrets; more than one during secret rotation.
    pub secrets: Vec<SecretString>,
    /// How long a delivery id is remembered.
    pub replay_window: Duration,
    /// Upper bound on remembered delivery ids.
    pub max_tracked_deliveries: usize,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secrets: Vec::new(),
            replay_window: Duration::from_secs(600),
            max_tracked_deliveries: 100_000,
        }
    }
}

/// Credential selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RotationStrategy {
    /// Cycle through credentials in order.
    #[default]
    RoundRobin,
    /// Prefer the credential used longest ago.
    LeastRecentlyUsed,
    /// Pick uniformly at random.
    Random,
}

/// Token rotation configuration.
#[derive(Debug, Clone)]
pub struct RotationConfig {
    /// Selection strategy.
    pub strategy: RotationStrategy,
    /// App installation tokens are refreshed this long before expiry.
    pub refresh_margin: Duration,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            strategy: RotationStrategy::default(),
            refresh_margin: Duration::from_secs(300),
        }
    }
}

/// GitHub client configuration.
#[derive(Debug, Clone)]
pub struct GitHubConfig {
    /// REST API base URL.
    pub base_url: String,
    /// GraphQL endpoint; derived from `base_url` when unset.
    pub graphql_url: Option<String>,
    /// API version header.
    pub api_version: String,
    /// Request timeout.
    pub timeout: Duration,
    /// User-Agent header.
    pub user_agent: String,
    /// Credentials available for rotation.
    pub credentials: Vec<CredentialConfig>,
    /// Retry configuration.
    pub retry: RetryConfig,
    /// Circuit breaker configuration.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Rate limit configuration.
    pub rate_limit: RateLimitConfig,
    /// Cache configuration.
    pub cache: CacheConfig,
    /// GraphQL configuration.
    pub graphql: GraphQlConfig,
    /// Webhook configuration.
    pub webhook: WebhookConfig,
    /// Rotation configuration.
    pub rotation: RotationConfig,
    /// Period of the background maintenance sweep.
    pub maintenance_interval: Duration,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            graphql_url: None,
            api_version: DEFAULT_API_VERSION.to_string(),
            timeout: DEFAULT_TIMEOUT,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            credentials: Vec::new(),
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            cache: CacheConfig::default(),
            graphql: GraphQlConfig::default(),
            webhook: WebhookConfig::default(),
            rotation: RotationConfig::default(),
            maintenance_interval: Duration::from_secs(30),
        }
    }
}

impl GitHubConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> GitHubConfigBuilder {
        GitHubConfigBuilder::new()
    }

    /// Resolved GraphQL endpoint.
    pub fn graphql_endpoint(&self) -> String {
        match &self.graphql_url {
            Some(url) => url.clone(),
            None => format!("{}/graphql", self.base_url.trim_end_matches('/')),
        }
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), GitHubError> {
        let base = Url::parse(&self.base_url)
            .map_err(|e| GitHubError::configuration(format!("Invalid base URL: {}", e)))?;
        if base.scheme() != "http" && base.scheme() != "https" {
            return Err(GitHubError::configuration(
                "Base URL must start with http:// or https://",
            ));
        }
        if let Some(ref url) = self.graphql_url {
            Url::parse(url)
                .map_err(|e| GitHubError::configuration(format!("Invalid GraphQL URL: {}", e)))?;
        }

        if self.user_agent.is_empty() {
            return Err(GitHubError::configuration("User-Agent is required by GitHub API"));
        }

        if self.credentials.is_empty() {
            return Err(GitHubError::configuration("At least one credential is required"));
        }
        let mut ids = HashSet::new();
        for credential in &self.credentials {
            credential.validate()?;
            if let Some(id) = credential.explicit_id() {
                if !ids.insert(id.to_string()) {
                    return Err(GitHubError::configuration(format!(
                        "Duplicate credential id: {}",
                        id
                    )));
                }
            }
        }

        if self.retry.max_attempts == 0 {
            return Err(GitHubError::configuration("retry.max_attempts must be at least 1"));
        }
        if self.retry.initial_backoff > self.retry.max_backoff {
            return Err(GitHubError::configuration(
                "retry.initial_backoff cannot exceed retry.max_backoff",
            ));
        }
        if self.retry.max_elapsed.is_zero() {
            return Err(GitHubError::configuration("retry.max_elapsed must be positive"));
        }

        if self.circuit_breaker.enabled {
            if self.circuit_breaker.failure_threshold == 0 {
                return Err(GitHubError::configuration(
                    "circuit_breaker.failure_threshold must be at least 1",
                ));
            }
            if self.circuit_breaker.failure_window.is_zero()
                || self.circuit_breaker.cooldown.is_zero()
            {
                return Err(GitHubError::configuration(
                    "circuit_breaker window and cooldown must be positive",
                ));
            }
        }

        if self.cache.shards == 0 || self.cache.max_entries_per_shard == 0 {
            return Err(GitHubError::configuration("cache needs at least one shard and entry"));
        }
        if self.cache.max_stale < self.cache.ttl {
            return Err(GitHubError::configuration("cache.max_stale cannot be below cache.ttl"));
        }

        if self.graphql.cost_ceiling == 0 {
            return Err(GitHubError::configuration("graphql.cost_ceiling must be positive"));
        }
        if self.graphql.max_sub_queries == 0 {
            return Err(GitHubError::configuration("graphql.max_sub_queries must be positive"));
        }
        self.graphql.cost_model.validate()?;

        if self.webhook.replay_window.is_zero() || self.webhook.max_tracked_deliveries == 0 {
            return Err(GitHubError::configuration(
                "webhook replay window and capacity must be positive",
            ));
        }

        if self.maintenance_interval.is_zero() {
            return Err(GitHubError::configuration("maintenance_interval must be positive"));
        }

        Ok(())
    }
}

/// Builder for GitHubConfig.
#[derive(Debug, Default)]
pub struct GitHubConfigBuilder {
    base_url: Option<String>,
    graphql_url: Option<String>,
    api_version: Option<String>,
    timeout: Option<Duration>,
    user_agent: Option<String>,
    credentials: Vec<CredentialConfig>,
    retry: Option<RetryConfig>,
    circuit_breaker: Option<CircuitBreakerConfig>,
    rate_limit: Option<RateLimitConfig>,
    cache: Option<CacheConfig>,
    graphql: Option<GraphQlConfig>,
    webhook: Option<WebhookConfig>,
    rotation: Option<RotationConfig>,
    maintenance_interval: Option<Duration>,
}

impl GitHubConfigBuilder {
    /// Creates a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the base URL.
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Sets the GraphQL endpoint explicitly.
    pub fn graphql_url(mut self, url: impl Into<String>) -> Self {
        self.graphql_url = Some(url.into());
        self
    }

    /// Sets the API version.
    pub fn api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = Some(version.into());
        self
    }

    /// Sets the request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the User-Agent header.
    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = Some(ua.into());
        self
    }

    /// Adds a credential.
    pub fn credential(mut self, credential: CredentialConfig) -> Self {
        self.credentials.push(credential);
        self
    }

    /// Adds several credentials.
    pub fn credentials(mut self, credentials: impl IntoIterator<Item = CredentialConfig>) -> Self {
        self.credentials.extend(credentials);
        self
    }

    /// Adds PATs from `GITHUB_TOKEN` and the comma-separated `GITHUB_TOKENS`.
    pub fn credentials_from_env(mut self) -> Self {
        let mut tokens: Vec<String> = Vec::new();
        if let Ok(token) = std::env::var("GITHUB_TOKEN") {
            tokens.push(token);
        }
        if let Ok(list) = std::env::var("GITHUB_TOKENS") {
            tokens.extend(list.split(',').map(str::to_string));
        }
        for token in tokens {
            let token = token.trim();
            if !token.is_empty() {
                self.credentials.push(CredentialConfig::pat(token));
            }
        }
        self
    }

    /// Sets the retry configuration.
    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.retry = Some(config);
        self
    }

    /// Disables retries.
    pub fn no_retry(mut self) -> Self {
        self.retry = Some(RetryConfig {
            max_attempts: 1,
            ..Default::default()
        });
        self
    }

    /// Sets the circuit breaker configuration.
    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    /// Sets the rate limit configuration.
    pub fn rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = Some(config);
        self
    }

    /// Sets the cache configuration.
    pub fn cache(mut self, config: CacheConfig) -> Self {
        self.cache = Some(config);
        self
    }

    /// Sets the GraphQL configuration.
    pub fn graphql(mut self, config: GraphQlConfig) -> Self {
        self.graphql = Some(config);
        self
    }

    /// Sets the webhook configuration.
    pub fn webhook(mut self, config: WebhookConfig) -> Self {
        self.webhook = Some(config);
        self
    }

    /// Adds a webhook secret.
    pub fn webhook_secret(mut self, secret: impl Into<String>) -> Self {
        self.webhook
            .get_or_insert_with(WebhookConfig::default)
            .secrets
            .push(SecretString::new(secret.into()));
        self
    }

    /// Sets the rotation configuration.
    pub fn rotation(mut self, config: RotationConfig) -> Self {
        self.rotation = Some(config);
        self
    }

    /// Sets the rotation strategy.
    pub fn strategy(mut self, strategy: RotationStrategy) -> Self {
        self.rotation.get_or_insert_with(RotationConfig::default).strategy = strategy;
        self
    }

    /// Sets the maintenance interval.
    pub fn maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = Some(interval);
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> Result<GitHubConfig, GitHubError> {
        let config = GitHubConfig {
            base_url: self.base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            graphql_url: self.graphql_url,
            api_version: self.api_version.unwrap_or_else(|| DEFAULT_API_VERSION.to_string()),
            timeout: self.timeout.unwrap_or(DEFAULT_TIMEOUT),
            user_agent: self.user_agent.unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            credentials: self.credentials,
            retry: self.retry.unwrap_or_default(),
            circuit_breaker: self.circuit_breaker.unwrap_or_default(),
            rate_limit: self.rate_limit.unwrap_or_default(),
            cache: self.cache.unwrap_or_default(),
            graphql: self.graphql.unwrap_or_default(),
            webhook: self.webhook.unwrap_or_default(),
            rotation: self.rotation.unwrap_or_default(),
            maintenance_interval: self.maintenance_interval.unwrap_or(Duration::from_secs(30)),
        };

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::GitHubErrorKind;

    fn builder() -> GitHubConfigBuilder {
        GitHubConfig::builder().credential(CredentialConfig::pat("ghp_test"))
    }

    #[test]
    fn test_default_config() {
        let config = GitHubConfig::default();
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.api_version, DEFAULT_API_VERSION);
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.graphql.cost_ceiling, 500_000);
        assert_eq!(config.graphql_endpoint(), "https://api.github.com/graphql");
    }

    #[test]
    fn test_config_builder() {
        let config = builder()
            .base_url("https://github.example.com/api/v3")
            .user_agent("test-client/1.0")
            .timeout(Duration::from_secs(60))
            .strategy(RotationStrategy::LeastRecentlyUsed)
            .webhook_secret("s3cret")
            .build()
            .unwrap();

        assert_eq!(config.base_url, "https://github.example.com/api/v3");
        assert_eq!(config.user_agent, "test-client/1.0");
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(config.rotation.strategy, RotationStrategy::LeastRecentlyUsed);
        assert_eq!(config.webhook.secrets.len(), 1);
        assert_eq!(
            config.graphql_endpoint(),
            "https://github.example.com/api/v3/graphql"
        );
    }

    #[test]
    fn test_rejects_missing_credentials() {
        let err = GitHubConfig::builder().build().unwrap_err();
        assert_eq!(err.kind(), GitHubErrorKind::InvalidConfiguration);
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(builder().base_url("invalid-url").build().is_err());
        assert!(builder().base_url("ftp://example.com").build().is_err());
    }

    #[test]
    fn test_rejects_invalid_combinations() {
        let backoff = RetryConfig {
            initial_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(1),
            ..Default::default()
        };
        assert!(builder().retry(backoff).build().is_err());

        let ceiling = GraphQlConfig {
            cost_ceiling: 0,
            ..Default::default()
        };
        assert!(builder().graphql(ceiling).build().is_err());

        let cache = CacheConfig {
            ttl: Duration::from_secs(120),
            max_stale: Duration::from_secs(60),
            ..Default::default()
        };
        assert!(builder().cache(cache).build().is_err());
    }

    #[test]
    fn test_rejects_duplicate_credential_ids() {
        let result = GitHubConfig::builder()
            .credential(CredentialConfig::pat("a").with_id("primary"))
            .credential(CredentialConfig::pat("b").with_id("primary"))
            .build();
        assert!(result.is_err());
    }
}
