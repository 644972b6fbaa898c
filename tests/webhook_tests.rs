//! Webhook deliveries through the client.

use integrations_github_access::config::WebhookConfig;
use integrations_github_access::mocks::webhook_headers;
use integrations_github_access::webhooks::{WebhookEnvelope, WebhookEventType};
use integrations_github_access::{CredentialConfig, GitHubClient, GitHubConfig, GitHubErrorKind};
use pretty_assertions::assert_eq;
use reqwest::header::HeaderMap;
use secrecy::SecretString;
use std::time::Duration;

const PAYLOAD: &[u8] =
    br#"{"action":"opened","repository":{"id":1,"full_name":"octo/widgets"},"sender":{"id":2,"login":"octocat"}}"#;

fn client(secrets: &[&str]) -> GitHubClient {
    let config = GitHubConfig::builder()
        .credential(CredentialConfig::pat("ghp_hooks"))
        .webhook(WebhookConfig {
            secrets: secrets
                .iter()
                .map(|s| SecretString::new(s.to_string()))
                .collect(),
            replay_window: Duration::from_secs(600),
            ..WebhookConfig::default()
        })
        .build()
        .unwrap();
    GitHubClient::new(config).unwrap()
}

#[test]
fn test_signed_delivery_is_accepted_once() {
    let client = client(&["It's a Secret to Everybody"]);
    let headers = webhook_headers("It's a Secret to Everybody", "d-1", "issues", PAYLOAD).unwrap();

    let event = client.verify_webhook(&headers, PAYLOAD).unwrap();
    assert_eq!(event.event_type, WebhookEventType::Issues);
    assert_eq!(event.delivery_id, "d-1");
    let envelope: WebhookEnvelope = event.payload_as().unwrap();
    assert_eq!(envelope.action.as_deref(), Some("opened"));

    let replay = client.verify_webhook(&headers, PAYLOAD).unwrap_err();
    assert_eq!(replay.kind(), GitHubErrorKind::DuplicateDelivery);
    assert_eq!(client.metrics().webhooks_rejected, 1);
}

#[test]
fn test_forged_delivery_is_rejected_without_burning_the_id() {
    let client = client(&["real"]);
    let forged = webhook_headers("guess", "d-2", "push", PAYLOAD).unwrap();
    let error = client.verify_webhook(&forged, PAYLOAD).unwrap_err();
    assert_eq!(error.kind(), GitHubErrorKind::InvalidWebhookSignature);

    let genuine = webhook_headers("real", "d-2", "push", PAYLOAD).unwrap();
    assert!(client.verify_webhook(&genuine, PAYLOAD).is_ok());
}

#[test]
fn test_tampered_payload_is_rejected() {
    let client = client(&["real"]);
    let headers = webhook_headers("real", "d-3", "issues", PAYLOAD).unwrap();
    let tampered = String::from_utf8_lossy(PAYLOAD).replace("opened", "closed");
    let error = client.verify_webhook(&headers, tampered.into_bytes()).unwrap_err();
    assert_eq!(error.kind(), GitHubErrorKind::InvalidWebhookSignature);
}

#[test]
fn test_previous_secret_still_verifies_during_rotation() {
    let client = client(&["new-secret", "old-secret"]);
    let old = webhook_headers("old-secret", "d-4", "ping", PAYLOAD).unwrap();
    let new = webhook_headers("new-secret", "d-5", "ping", PAYLOAD).unwrap();
    assert!(client.verify_webhook(&old, PAYLOAD).is_ok());
    assert!(client.verify_webhook(&new, PAYLOAD).is_ok());
}

#[test]
fn test_missing_headers_are_malformed() {
    let client = client(&["real"]);
    let error = client.verify_webhook(&HeaderMap::new(), PAYLOAD).unwrap_err();
    assert_eq!(error.kind(), GitHubErrorKind::MalformedWebhook);
}
