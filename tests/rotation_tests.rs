//! Credential rotation under contention.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use integrations_github_access::auth::CredentialStore;
use integrations_github_access::config::{RateLimitConfig, RotationConfig, RotationStrategy};
use integrations_github_access::mocks::{MockResponse, MockTransport};
use integrations_github_access::observability::Telemetry;
use integrations_github_access::resilience::{ApiSurface, RateLimitTracker};
use integrations_github_access::rotation::{AcquireRequest, TokenRotator};
use integrations_github_access::{
    CredentialConfig, CredentialId, GitHubClient, GitHubConfig, GitHubErrorKind, RequestContext,
    WaitPolicy,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn rotator(credentials: Vec<CredentialConfig>) -> TokenRotator {
    let telemetry = Telemetry::default();
    let config = RateLimitConfig {
        safety_margin: 0,
        ..RateLimitConfig::default()
    };
    TokenRotator::new(
        Arc::new(CredentialStore::new(credentials).unwrap()),
        Arc::new(RateLimitTracker::new(config.safety_margin, telemetry.clone())),
        &RotationConfig::default(),
        &config,
        telemetry,
    )
}

fn reset_in(seconds: i64) -> i64 {
    chrono::Utc::now().timestamp() + seconds
}

#[tokio::test]
async fn test_last_unit_goes_to_exactly_one_caller() {
    let rotator = rotator(vec![CredentialConfig::pat("ghp_a").with_id("a")]);
    rotator
        .tracker()
        .seed(&CredentialId::new("a"), ApiSurface::Rest, 5000, 1, reset_in(3600));

    let (first, second) = tokio::join!(rotator.acquire(&[]), rotator.acquire(&[]));
    let results = [first, second];

    let granted = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(granted, 1);
    let refused = results.iter().find_map(|r| r.as_ref().err()).unwrap();
    assert_eq!(refused.kind(), GitHubErrorKind::RateLimited);
    assert!(refused.is_local());
}

#[tokio::test]
async fn test_concurrent_acquires_never_overcommit() {
    let rotator = rotator(vec![
        CredentialConfig::pat("ghp_a").with_id("a"),
        CredentialConfig::pat("ghp_b").with_id("b"),
    ]);
    let reset = reset_in(3600);
    rotator
        .tracker()
        .seed(&CredentialId::new("a"), ApiSurface::Rest, 5000, 3, reset);
    rotator
        .tracker()
        .seed(&CredentialId::new("b"), ApiSurface::Rest, 5000, 2, reset);

    let results = join_all((0..12).map(|_| rotator.acquire(&[]))).await;

    let mut per_credential: HashMap<String, usize> = HashMap::new();
    for lease in results.iter().flatten() {
        *per_credential
            .entry(lease.credential_id().as_str().to_string())
            .or_default() += 1;
    }
    assert_eq!(per_credential.get("a"), Some(&3));
    assert_eq!(per_credential.get("b"), Some(&2));
    assert_eq!(results.iter().filter(|r| r.is_err()).count(), 7);
}

#[tokio::test]
async fn test_least_recently_used_spreads_requests() {
    let transport = Arc::new(MockTransport::new());
    transport.on_get("/user", MockResponse::ok(&json!({"id": 1, "login": "octocat"})));
    let config = GitHubConfig::builder()
        .credential(CredentialConfig::pat("ghp_a").with_id("a"))
        .credential(CredentialConfig::pat("ghp_b").with_id("b"))
        .credential(CredentialConfig::pat("ghp_c").with_id("c"))
        .strategy(RotationStrategy::LeastRecentlyUsed)
        .build()
        .unwrap();
    let client = GitHubClient::with_transport(config, transport.clone()).unwrap();
    let ctx = RequestContext::new().bypass_cache();

    let mut used = Vec::new();
    for _ in 0..6 {
        let response = client.get::<serde_json::Value>("/user", &ctx).await.unwrap();
        used.push(response.meta.credential_id.unwrap().as_str().to_string());
    }
    assert_eq!(used, vec!["a", "b", "c", "a", "b", "c"]);

    let tokens: Vec<String> = transport
        .requests()
        .iter()
        .filter_map(|r| r.headers.get("authorization"))
        .filter_map(|v| v.to_str().ok().map(str::to_string))
        .collect();
    assert_eq!(
        tokens,
        vec![
            "Bearer ghp_a",
            "Bearer ghp_b",
            "Bearer ghp_c",
            "Bearer ghp_a",
            "Bearer ghp_b",
            "Bearer ghp_c"
        ]
    );
}

#[tokio::test]
async fn test_scoped_request_uses_matching_credential() {
    let transport = Arc::new(MockTransport::new());
    transport.on_get("/orgs/octo/members", MockResponse::ok(&json!([])));
    let config = GitHubConfig::builder()
        .credential(CredentialConfig::pat("ghp_public").with_id("public").with_scopes(["public_repo"]))
        .credential(CredentialConfig::pat("ghp_org").with_id("org").with_scopes(["read:org"]))
        .build()
        .unwrap();
    let client = GitHubClient::with_transport(config, transport).unwrap();

    for _ in 0..3 {
        let ctx = RequestContext::new().bypass_cache().with_scopes(["read:org"]);
        let response = client
            .get::<serde_json::Value>("/orgs/octo/members", &ctx)
            .await
            .unwrap();
        assert_eq!(response.meta.credential_id, Some(CredentialId::new("org")));
    }

    let ctx = RequestContext::new().with_scopes(["admin:org"]);
    let error = client
        .get::<serde_json::Value>("/orgs/octo/members", &ctx)
        .await
        .unwrap_err();
    assert_eq!(error.kind(), GitHubErrorKind::NoCredentialAvailable);
}

#[tokio::test]
async fn test_queued_acquire_is_granted_after_reset() {
    let rotator = rotator(vec![CredentialConfig::pat("ghp_a").with_id("a")]);
    // Windows follow GitHub's wall-clock reset epoch, so this waits for real.
    rotator
        .tracker()
        .seed(&CredentialId::new("a"), ApiSurface::Rest, 5000, 0, reset_in(2));
    let ctx = RequestContext::new().with_wait_policy(WaitPolicy::Queue {
        max_wait: Duration::from_secs(5),
    });

    let started = std::time::Instant::now();
    let lease = rotator
        .acquire_for(&AcquireRequest::rest(), &ctx)
        .await
        .unwrap();
    assert_eq!(lease.credential_id().as_str(), "a");
    assert!(started.elapsed() >= Duration::from_millis(500));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn test_cancelling_a_queued_acquire_returns_promptly() {
    let rotator = rotator(vec![CredentialConfig::pat("ghp_a").with_id("a")]);
    rotator
        .tracker()
        .seed(&CredentialId::new("a"), ApiSurface::Rest, 5000, 0, reset_in(600));
    let token = CancellationToken::new();
    let ctx = RequestContext::new()
        .with_cancellation(token.clone())
        .with_wait_policy(WaitPolicy::Queue {
            max_wait: Duration::from_secs(900),
        });

    let cancel = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
    });
    let started = Instant::now();
    let error = rotator
        .acquire_for(&AcquireRequest::rest(), &ctx)
        .await
        .unwrap_err();
    cancel.await.unwrap();

    assert_eq!(error.kind(), GitHubErrorKind::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_cached_answer_still_requires_a_scoped_credential() {
    let transport = Arc::new(MockTransport::new());
    transport.on_get("/orgs/octo/members", MockResponse::ok(&json!([])));
    let config = GitHubConfig::builder()
        .credential(CredentialConfig::pat("ghp_public").with_id("public").with_scopes(["public_repo"]))
        .build()
        .unwrap();
    let client = GitHubClient::with_transport(config, transport.clone()).unwrap();

    client
        .get::<serde_json::Value>("/orgs/octo/members", &RequestContext::new())
        .await
        .unwrap();

    let ctx = RequestContext::new().with_scopes(["admin:org"]);
    let error = client
        .get::<serde_json::Value>("/orgs/octo/members", &ctx)
        .await
        .unwrap_err();
    assert_eq!(error.kind(), GitHubErrorKind::NoCredentialAvailable);
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test]
async fn test_scoped_caller_does_not_join_an_unscoped_call() {
    let transport = Arc::new(MockTransport::new());
    transport.on_get(
        "/orgs/octo/members",
        MockResponse::ok(&json!([])).with_delay(Duration::from_millis(100)),
    );
    let config = GitHubConfig::builder()
        .credential(CredentialConfig::pat("ghp_public").with_id("public").with_scopes(["public_repo"]))
        .credential(CredentialConfig::pat("ghp_org").with_id("org").with_scopes(["read:org"]))
        .build()
        .unwrap();
    let client = GitHubClient::with_transport(config, transport.clone()).unwrap();

    let plain = RequestContext::new();
    let scoped = RequestContext::new().with_scopes(["read:org"]);
    let (unscoped, org) = tokio::join!(
        client.get::<serde_json::Value>("/orgs/octo/members", &plain),
        client.get::<serde_json::Value>("/orgs/octo/members", &scoped),
    );

    let org = org.unwrap();
    assert!(!org.meta.coalesced);
    assert_eq!(org.meta.credential_id, Some(CredentialId::new("org")));
    assert!(unscoped.is_ok());
    assert_eq!(transport.call_count(), 2);
}
