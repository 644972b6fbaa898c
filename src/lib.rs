//! # GitHub Access Layer
//!
//! A GitHub API client for services that share a pool of credentials:
//! - Token rotation across personal access tokens and GitHub App installations
//! - Per-credential rate-limit budgets with atomic reservation
//! - Retry with jittered backoff and per-endpoint circuit breakers
//! - ETag caching with request coalescing
//! - GraphQL cost estimation and automatic query splitting
//! - Webhook signature verification with replay protection
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use integrations_github_access::{GitHubClient, GitHubConfig, ListIssuesParams, RequestContext};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GitHubConfig::builder().credentials_from_env().build()?;
//!     let (client, health) = GitHubClient::connect(config).await?;
//!     if !health.healthy {
//!         eprintln!("GitHub unreachable: {:?}", health.error);
//!     }
//!
//!     let ctx = RequestContext::new();
//!     let mut cursor = None;
//!     loop {
//!         let page = client
//!             .list_issues("rust-lang", "rust", &ListIssuesParams::default(), cursor.as_deref(), &ctx)
//!             .await?;
//!         for issue in &page.data.items {
//!             println!("#{} {}", issue.number, issue.title);
//!         }
//!         match page.data.next_cursor() {
//!             Some(next) => cursor = Some(next.to_string()),
//!             None => break,
//!         }
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core modules
pub mod config;
pub mod errors;
pub mod types;

// Credentials
pub mod auth;
pub mod rotation;

// Request pipeline
pub mod cache;
pub mod resilience;
pub mod transport;

// GraphQL planning
pub mod graphql;

// Client façade
pub mod client;
pub mod pagination;
pub mod services;

// Webhooks
pub mod webhooks;

// Observability
pub mod observability;

// Mocks for testing
pub mod mocks;

// Re-exports for convenience
pub use auth::{Credential, CredentialConfig, CredentialId, CredentialStatus};
pub use client::{
    CacheStatus, GitHubClient, GitHubClientBuilder, HealthStatus, MaintenanceHandle,
    MaintenanceReport, Response, ResponseMeta,
};
pub use config::{GitHubConfig, GitHubConfigBuilder};
pub use errors::{GitHubError, GitHubErrorKind, GitHubResult, RateLimitInfo};
pub use graphql::{CostEstimate, GraphQlResult};
pub use pagination::{Page, PageInfo};
pub use resilience::{RequestContext, WaitPolicy};
pub use services::ListIssuesParams;
pub use types::*;
pub use webhooks::{WebhookEvent, WebhookVerifier};
