//! GitHub webhook signature verification and replay protection.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::time::Instant;

use crate::config::WebhookConfig;
use crate::errors::{header_str, GitHubError, GitHubErrorKind, GitHubResult};
use crate::observability::{Telemetry, TelemetryEvent};

type HmacSha256 = Hmac<Sha256>;

/// Signature header.
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";
/// Event name header.
pub const EVENT_HEADER: &str = "x-github-event";
/// Delivery id header.
pub const DELIVERY_HEADER: &str = "x-github-delivery";

const SIGNATURE_PREFIX: &str = "sha256=";
const REPLAY_SHARDS: usize = 16;

/// Outcome of a signature check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureCheck {
    /// The signature matches the payload.
    Valid,
    /// Missing, malformed or wrong.
    Invalid,
}

/// Outcome of a replay check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayCheck {
    /// First time this delivery id is seen within the window.
    Fresh,
    /// Already seen within the window.
    Duplicate,
}

/// Checks `signature_header` (`sha256=<hex>`) against the HMAC-SHA256 of
/// `payload` under `secret`.
///
/// The comparison is constant-time.
pub fn verify_signature(payload: &[u8], signature_header: &str, secret: &[u8]) -> SignatureCheck {
    let Some(expected) = decode_signature(signature_header) else {
        return SignatureCheck::Invalid;
    };
    if signature_matches(payload, &expected, secret) {
        SignatureCheck::Valid
    } else {
        SignatureCheck::Invalid
    }
}

/// Computes the `X-Hub-Signature-256` header value for a payload.
pub fn compute_signature(secret: &str, payload: &[u8]) -> GitHubResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|e| {
        GitHubError::new(GitHubErrorKind::Unknown, format!("Failed to create HMAC: {}", e))
    })?;
    mac.update(payload);
    Ok(format!(
        "{}{}",
        SIGNATURE_PREFIX,
        hex::encode(mac.finalize().into_bytes())
    ))
}

fn decode_signature(header: &str) -> Option<Vec<u8>> {
    hex::decode(header.trim().strip_prefix(SIGNATURE_PREFIX)?).ok()
}

fn signature_matches(payload: &[u8], expected: &[u8], secret: &[u8]) -> bool {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(expected).is_ok()
}

/// An inbound delivery.
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    /// `X-GitHub-Delivery`.
    pub delivery_id: String,
    /// `X-GitHub-Event` as received.
    pub event_name: String,
    /// Parsed event type.
    pub event_type: WebhookEventType,
    /// `X-Hub-Signature-256`.
    pub signature: String,
    /// Raw body; the signature covers these exact bytes.
    pub payload: Bytes,
    /// Receipt time.
    pub received_at: DateTime<Utc>,
}

impl WebhookEvent {
    /// Creates an event from its parts.
    pub fn new(
        delivery_id: impl Into<String>,
        event_name: impl Into<String>,
        signature: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        let event_name = event_name.into();
        Self {
            delivery_id: delivery_id.into(),
            event_type: event_name.parse().unwrap_or(WebhookEventType::Unknown),
            event_name,
            signature: signature.into(),
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }

    /// Reads the delivery headers.
    ///
    /// # Errors
    ///
    /// `MalformedWebhook` when the delivery id, event or signature header is
    /// missing.
    pub fn from_headers(headers: &HeaderMap, payload: impl Into<Bytes>) -> GitHubResult<Self> {
        let required = |name: &str| {
            header_str(headers, name)
                .filter(|v| !v.trim().is_empty())
                .map(str::to_string)
                .ok_or_else(|| {
                    GitHubError::new(
                        GitHubErrorKind::MalformedWebhook,
                        format!("Missing {} header", name),
                    )
                })
        };
        Ok(Self::new(
            required(DELIVERY_HEADER)?,
            required(EVENT_HEADER)?,
            required(SIGNATURE_HEADER)?,
            payload,
        ))
    }

    /// Deserializes the payload.
    pub fn payload_as<T: DeserializeOwned>(&self) -> GitHubResult<T> {
        serde_json::from_slice(&self.payload).map_err(|e| {
            GitHubError::new(
                GitHubErrorKind::MalformedWebhook,
                format!("Failed to parse {} payload: {}", self.event_name, e),
            )
        })
    }
}

#[derive(Debug, Default)]
struct ReplayShard {
    seen: HashMap<String, Instant>,
    order: VecDeque<(Instant, String)>,
}

impl ReplayShard {
    fn prune(&mut self, now: Instant, window: Duration, capacity: usize) -> usize {
        let mut removed = 0;
        while let Some((at, id)) = self.order.front() {
            let expired = now.saturating_duration_since(*at) >= window;
            if !expired && self.order.len() <= capacity {
                break;
            }
            if self.seen.get(id) == Some(at) {
                self.seen.remove(id);
                removed += 1;
            }
            self.order.pop_front();
        }
        removed
    }
}

/// Remembers delivery ids for a time window, bounded in count.
///
/// When the count bound is hit the oldest ids are forgotten first, even if
/// still inside the window.
#[derive(Debug)]
pub struct ReplayGuard {
    shards: Vec<Mutex<ReplayShard>>,
    window: Duration,
    capacity_per_shard: usize,
}

impl ReplayGuard {
    /// Creates a guard tracking at most `max_tracked` ids across `shards`.
    pub fn new(window: Duration, max_tracked: usize, shards: usize) -> Self {
        let shards = shards.clamp(1, max_tracked.max(1));
        Self {
            shards: (0..shards).map(|_| Mutex::new(ReplayShard::default())).collect(),
            window,
            capacity_per_shard: (max_tracked.max(1) / shards).max(1),
        }
    }

    fn shard(&self, delivery_id: &str) -> &Mutex<ReplayShard> {
        let mut hasher = DefaultHasher::new();
        delivery_id.hash(&mut hasher);
        &self.shards[(hasher.finish() % self.shards.len() as u64) as usize]
    }

    /// Records `delivery_id`, reporting whether it was already seen.
    pub fn check_replay(&self, delivery_id: &str) -> ReplayCheck {
        let now = Instant::now();
        let mut shard = self.shard(delivery_id).lock();
        if let Some(seen_at) = shard.seen.get(delivery_id) {
            if now.saturating_duration_since(*seen_at) < self.window {
                return ReplayCheck::Duplicate;
            }
        }
        shard.seen.insert(delivery_id.to_string(), now);
        shard.order.push_back((now, delivery_id.to_string()));
        shard.prune(now, self.window, self.capacity_per_shard);
        ReplayCheck::Fresh
    }

    /// Forgets ids older than the window. Locks one shard at a time.
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        self.shards
            .iter()
            .map(|shard| shard.lock().prune(now, self.window, self.capacity_per_shard))
            .sum()
    }

    /// Ids currently remembered.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().seen.len()).sum()
    }

    /// True when nothing is remembered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Verifies deliveries against the configured secrets and rejects replays.
pub struct WebhookVerifier {
    secrets: Vec<SecretString>,
    replay: ReplayGuard,
    telemetry: Telemetry,
}

impl std::fmt::Debug for WebhookVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookVerifier")
            .field("secrets", &self.secrets.len())
            .field("replay", &self.replay)
            .finish()
    }
}

impl WebhookVerifier {
    /// Creates a verifier.
    pub fn new(config: &WebhookConfig, telemetry: Telemetry) -> Self {
        Self {
            secrets: config.secrets.clone(),
            replay: ReplayGuard::new(
                config.replay_window,
                config.max_tracked_deliveries,
                REPLAY_SHARDS,
            ),
            telemetry,
        }
    }

    /// Verifier with a single secret and default bounds.
    pub fn with_secret(secret: impl Into<String>) -> Self {
        let config = WebhookConfig {
            secrets: vec![SecretString::new(secret.into())],
            ..WebhookConfig::default()
        };
        Self::new(&config, Telemetry::default())
    }

    /// Checks the signature against every configured secret.
    ///
    /// All secrets are tried, so timing does not reveal which one matched.
    pub fn verify_signature(&self, payload: &[u8], signature_header: &str) -> SignatureCheck {
        let Some(expected) = decode_signature(signature_header) else {
            return SignatureCheck::Invalid;
        };
        let matched = self.secrets.iter().fold(false, |matched, secret| {
            matched | signature_matches(payload, &expected, secret.expose_secret().as_bytes())
        });
        if matched {
            SignatureCheck::Valid
        } else {
            SignatureCheck::Invalid
        }
    }

    /// Records a delivery id.
    pub fn check_replay(&self, delivery_id: &str) -> ReplayCheck {
        self.replay.check_replay(delivery_id)
    }

    /// Verifies a delivery: signature first, then replay.
    ///
    /// A forged delivery never reaches the replay set, so it cannot block the
    /// genuine delivery with the same id.
    ///
    /// # Errors
    ///
    /// `InvalidWebhookSignature` or `DuplicateDelivery`.
    pub fn verify(&self, event: &WebhookEvent) -> GitHubResult<()> {
        if self.verify_signature(&event.payload, &event.signature) == SignatureCheck::Invalid {
            return Err(self.reject(
                event,
                GitHubErrorKind::InvalidWebhookSignature,
                "Webhook signature does not match payload".to_string(),
            ));
        }
        if self.check_replay(&event.delivery_id) == ReplayCheck::Duplicate {
            return Err(self.reject(
                event,
                GitHubErrorKind::DuplicateDelivery,
                format!("Delivery {} already processed", event.delivery_id),
            ));
        }
        Ok(())
    }

    /// Verifies then deserializes the payload.
    pub fn verify_and_parse<T: DeserializeOwned>(&self, event: &WebhookEvent) -> GitHubResult<T> {
        self.verify(event)?;
        event.payload_as()
    }

    /// Forgets delivery ids older than the window.
    pub fn prune(&self) -> usize {
        self.replay.prune()
    }

    /// Replay bookkeeping.
    pub fn replay_guard(&self) -> &ReplayGuard {
        &self.replay
    }

    fn reject(&self, event: &WebhookEvent, kind: GitHubErrorKind, message: String) -> GitHubError {
        self.telemetry.emit(TelemetryEvent::WebhookRejected {
            delivery_id: Some(event.delivery_id.clone()),
            reason: kind,
        });
        GitHubError::new(kind, message)
    }
}

/// Webhook event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventType {
    /// Webhook created.
    Ping,
    /// Push to a repository.
    Push,
    /// Branch or tag created.
    Create,
    /// Branch or tag deleted.
    Delete,
    /// Issue activity.
    Issues,
    /// Issue comment activity.
    IssueComment,
    /// Pull request activity.
    PullRequest,
    /// Pull request review activity.
    PullRequestReview,
    /// Release activity.
    Release,
    /// Repository activity.
    Repository,
    /// Star added or removed.
    Star,
    /// Fork created.
    Fork,
    /// Check run activity.
    CheckRun,
    /// Check suite activity.
    CheckSuite,
    /// Workflow run activity.
    WorkflowRun,
    /// Workflow job activity.
    WorkflowJob,
    /// App installation activity.
    Installation,
    /// Repositories added to or removed from an installation.
    InstallationRepositories,
    /// Anything else.
    #[serde(other)]
    Unknown,
}

const EVENT_NAMES: &[(WebhookEventType, &str)] = &[
    (WebhookEventType::Ping, "ping"),
    (WebhookEventType::Push, "push"),
    (WebhookEventType::Create, "create"),
    (WebhookEventType::Delete, "delete"),
    (WebhookEventType::Issues, "issues"),
    (WebhookEventType::IssueComment, "issue_comment"),
    (WebhookEventType::PullRequest, "pull_request"),
    (WebhookEventType::PullRequestReview, "pull_request_review"),
    (WebhookEventType::Release, "release"),
    (WebhookEventType::Repository, "repository"),
    (WebhookEventType::Star, "star"),
    (WebhookEventType::Fork, "fork"),
    (WebhookEventType::CheckRun, "check_run"),
    (WebhookEventType::CheckSuite, "check_suite"),
    (WebhookEventType::WorkflowRun, "workflow_run"),
    (WebhookEventType::WorkflowJob, "workflow_job"),
    (WebhookEventType::Installation, "installation"),
    (WebhookEventType::InstallationRepositories, "installation_repositories"),
];

impl WebhookEventType {
    /// Header value for this type.
    pub fn as_str(self) -> &'static str {
        EVENT_NAMES
            .iter()
            .find(|(t, _)| *t == self)
            .map_or("unknown", |(_, name)| name)
    }
}

impl std::fmt::Display for WebhookEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WebhookEventType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(EVENT_NAMES
            .iter()
            .find(|(_, name)| *name == s)
            .map_or(WebhookEventType::Unknown, |(t, _)| *t))
    }
}

/// Fields common to every delivery payload.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEnvelope {
    /// Action, for events that have one.
    pub action: Option<String>,
    /// Repository the event relates to.
    pub repository: Option<WebhookRepository>,
    /// Sender.
    pub sender: Option<WebhookSender>,
    /// App installation the delivery is for.
    pub installation: Option<WebhookInstallation>,
}

/// Repository in a payload.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookRepository {
    /// Repository ID.
    pub id: u64,
    /// `owner/name`.
    pub full_name: String,
}

/// Sender in a payload.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookSender {
    /// User ID.
    pub id: u64,
    /// Login.
    pub login: String,
}

/// Installation in a payload.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookInstallation {
    /// Installation ID.
    pub id: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::CollectingTelemetry;
    use reqwest::header::HeaderValue;
    use std::sync::Arc;

    const PAYLOAD: &[u8] = br#"{"action":"opened","repository":{"id":1,"full_name":"o/r"},"sender":{"id":2,"login":"octocat"}}"#;

    fn event(id: &str, secret: &str, payload: &[u8]) -> WebhookEvent {
        WebhookEvent::new(
            id,
            "issues",
            compute_signature(secret, payload).unwrap(),
            payload.to_vec(),
        )
    }

    #[test]
    fn test_verify_signature() {
        let signature = compute_signature("It's a Secret to Everybody", b"Hello, World!").unwrap();
        assert_eq!(
            signature,
            "sha256=757107ea0eb2509fc211221cce984b8a37570b6d7586c22c46f4379c8b043e17"
        );
        assert_eq!(
            verify_signature(b"Hello, World!", &signature, b"It's a Secret to Everybody"),
            SignatureCheck::Valid
        );
    }

    #[test]
    fn test_tampered_or_malformed_signatures_are_invalid() {
        let signature = compute_signature("s", PAYLOAD).unwrap();
        assert_eq!(verify_signature(b"{}", &signature, b"s"), SignatureCheck::Invalid);
        assert_eq!(verify_signature(PAYLOAD, &signature, b"other"), SignatureCheck::Invalid);
        assert_eq!(
            verify_signature(PAYLOAD, &signature.replace("sha256=", "sha1="), b"s"),
            SignatureCheck::Invalid
        );
        assert_eq!(verify_signature(PAYLOAD, "sha256=zz", b"s"), SignatureCheck::Invalid);
        assert_eq!(verify_signature(PAYLOAD, "sha256=abcd", b"s"), SignatureCheck::Invalid);
    }

    #[test]
    fn test_any_configured_secret_is_accepted() {
        let config = WebhookConfig {
            secrets: vec![SecretString::new("old".into()), SecretString::new("new".into())],
            ..WebhookConfig::default()
        };
        let verifier = WebhookVerifier::new(&config, Telemetry::default());
        assert!(verifier.verify(&event("d-1", "old", PAYLOAD)).is_ok());
        assert!(verifier.verify(&event("d-2", "new", PAYLOAD)).is_ok());
        assert_eq!(
            verifier.verify(&event("d-3", "stale", PAYLOAD)).unwrap_err().kind(),
            GitHubErrorKind::InvalidWebhookSignature
        );
    }

    #[test]
    fn test_replayed_delivery_is_rejected_despite_valid_signature() {
        let sink = Arc::new(CollectingTelemetry::default());
        let config = WebhookConfig {
            secrets: vec![SecretString::new("s".into())],
            ..WebhookConfig::default()
        };
        let verifier = WebhookVerifier::new(&config, Telemetry::new(sink.clone()));

        verifier.verify(&event("abc", "s", PAYLOAD)).unwrap();
        let err = verifier.verify(&event("abc", "s", PAYLOAD)).unwrap_err();
        assert_eq!(err.kind(), GitHubErrorKind::DuplicateDelivery);
        assert!(sink.events().contains(&TelemetryEvent::WebhookRejected {
            delivery_id: Some("abc".into()),
            reason: GitHubErrorKind::DuplicateDelivery,
        }));
    }

    #[test]
    fn test_forged_delivery_does_not_poison_replay_set() {
        let verifier = WebhookVerifier::with_secret("s");
        assert!(verifier.verify(&event("abc", "forged", PAYLOAD)).is_err());
        assert!(verifier.replay_guard().is_empty());
        assert!(verifier.verify(&event("abc", "s", PAYLOAD)).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_ids_expire_after_window() {
        let guard = ReplayGuard::new(Duration::from_secs(600), 100, 4);
        assert_eq!(guard.check_replay("a"), ReplayCheck::Fresh);
        tokio::time::advance(Duration::from_secs(599)).await;
        assert_eq!(guard.check_replay("a"), ReplayCheck::Duplicate);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(guard.prune(), 1);
        assert_eq!(guard.check_replay("a"), ReplayCheck::Fresh);
    }

    #[test]
    fn test_tracked_ids_are_bounded() {
        let guard = ReplayGuard::new(Duration::from_secs(600), 2, 1);
        for id in ["a", "b", "c"] {
            assert_eq!(guard.check_replay(id), ReplayCheck::Fresh);
        }
        assert_eq!(guard.len(), 2);
        assert_eq!(guard.check_replay("c"), ReplayCheck::Duplicate);
        assert_eq!(guard.check_replay("a"), ReplayCheck::Fresh);
    }

    #[test]
    fn test_event_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(DELIVERY_HEADER, HeaderValue::from_static("72d3162e"));
        headers.insert(EVENT_HEADER, HeaderValue::from_static("pull_request"));
        let err = WebhookEvent::from_headers(&headers, PAYLOAD.to_vec()).unwrap_err();
        assert_eq!(err.kind(), GitHubErrorKind::MalformedWebhook);

        headers.insert(SIGNATURE_HEADER, HeaderValue::from_static("sha256=00"));
        let event = WebhookEvent::from_headers(&headers, PAYLOAD.to_vec()).unwrap();
        assert_eq!(event.event_type, WebhookEventType::PullRequest);
        assert_eq!(event.delivery_id, "72d3162e");

        let envelope: WebhookEnvelope = event.payload_as().unwrap();
        assert_eq!(envelope.action.as_deref(), Some("opened"));
        assert_eq!(envelope.repository.unwrap().full_name, "o/r");
    }

    #[test]
    fn test_event_type_names_round_trip() {
        assert_eq!("push".parse::<WebhookEventType>(), Ok(WebhookEventType::Push));
        assert_eq!(WebhookEventType::IssueComment.to_string(), "issue_comment");
        assert_eq!("sponsorship".parse::<WebhookEventType>(), Ok(WebhookEventType::Unknown));
    }
}
