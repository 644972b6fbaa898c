//! Credentials and GitHub App token exchange.
//!
//! The [`CredentialStore`] owns every configured credential. Each credential
//! lives in its own slot with its own lock, so state transitions on one
//! credential never serialize traffic on another. Only the token rotator
//! mutates slot state.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use parking_lot::{Mutex, RwLock};
use reqwest::Method;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::errors::{GitHubError, GitHubErrorKind, GitHubResult};
use crate::transport::{HttpRequest, HttpTransport};

/// Stable identifier of a credential, safe to log.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CredentialId(String);

impl CredentialId {
    /// Creates an id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CredentialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// GitHub App installation parameters.
#[derive(Debug, Clone)]
pub struct AppInstallation {
    /// GitHub App ID.
    pub app_id: u64,
    /// Installation ID.
    pub installation_id: u64,
    /// Private key (PEM format).
    pub private_key: SecretString,
}

/// Configuration of one credential.
#[derive(Debug, Clone)]
pub enum CredentialConfig {
    /// Personal access token (classic or fine-grained).
    Pat {
        /// Explicit id; generated from the position when absent.
        id: Option<String>,
        /// Token value.
        token: SecretString,
        /// Scopes the token is known to carry. Empty means unrestricted.
        scopes: Vec<String>,
        /// Expiry of fine-grained tokens.
        expires_at: Option<DateTime<Utc>>,
    },
    /// GitHub App installation, exchanged for short-lived tokens.
    AppInstallation {
        /// Explicit id; generated from app and installation ids when absent.
        id: Option<String>,
        /// App parameters.
        app: AppInstallation,
        /// Scopes required of the installation. Replaced by granted permissions.
        scopes: Vec<String>,
    },
}

impl CredentialConfig {
    /// Creates a PAT credential.
    pub fn pat(token: impl Into<String>) -> Self {
        Self::Pat {
            id: None,
            token: SecretString::new(token.into()),
            scopes: Vec::new(),
            expires_at: None,
        }
    }

    /// Creates a GitHub App installation credential.
    pub fn app_installation(
        app_id: u64,
        installation_id: u64,
        private_key: impl Into<String>,
    ) -> Self {
        Self::AppInstallation {
            id: None,
            app: AppInstallation {
                app_id,
                installation_id,
                private_key: SecretString::new(private_key.into()),
            },
            scopes: Vec::new(),
        }
    }

    /// Sets an explicit id.
    pub fn with_id(mut self, new_id: impl Into<String>) -> Self {
        match &mut self {
            Self::Pat { id, .. } | Self::AppInstallation { id, .. } => *id = Some(new_id.into()),
        }
        self
    }

    /// Sets the known scopes.
    pub fn with_scopes<I, S>(mut self, new_scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let collected: Vec<String> = new_scopes.into_iter().map(Into::into).collect();
        match &mut self {
            Self::Pat { scopes, .. } | Self::AppInstallation { scopes, .. } => *scopes = collected,
        }
        self
    }

    /// Sets the expiry of a PAT. Ignored for App installations.
    pub fn with_expiry(mut self, at: DateTime<Utc>) -> Self {
        if let Self::Pat { expires_at, .. } = &mut self {
            *expires_at = Some(at);
        }
        self
    }

    pub(crate) fn explicit_id(&self) -> Option<&str> {
        match self {
            Self::Pat { id, .. } | Self::AppInstallation { id, .. } => id.as_deref(),
        }
    }

    /// Validates the credential material.
    pub fn validate(&self) -> GitHubResult<()> {
        match self {
            Self::Pat { token, .. } => {
                if token.expose_secret().trim().is_empty() {
                    return Err(GitHubError::configuration("PAT credential has an empty token"));
                }
            }
            Self::AppInstallation { app, .. } => {
                EncodingKey::from_rsa_pem(app.private_key.expose_secret().as_bytes()).map_err(
                    |e| {
                        GitHubError::configuration(format!(
                            "App {} private key is not a valid RSA PEM: {}",
                            app.app_id, e
                        ))
                    },
                )?;
            }
        }
        Ok(())
    }
}

/// Credential kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    /// Personal access token.
    Pat,
    /// GitHub App installation token.
    AppInstallation,
}

/// Credential lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialStatus {
    /// Usable.
    Active,
    /// Rate limit exhausted until `quarantined_until`.
    Quarantined,
    /// Rejected by GitHub, past expiry, or failed to refresh.
    Expired,
}

impl fmt::Display for CredentialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Quarantined => write!(f, "quarantined"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

/// Usage counters.
#[derive(Debug, Clone, Default)]
pub struct UsageCounters {
    /// Requests issued with this credential.
    pub requests_issued: u64,
    /// Last time the credential was handed out.
    pub last_used_at: Option<DateTime<Utc>>,
}

/// A credential and its metadata.
///
/// `Debug` never prints the secret.
#[derive(Debug, Clone)]
pub struct Credential {
    /// Identifier.
    pub id: CredentialId,
    /// Kind.
    pub kind: CredentialKind,
    secret: Option<SecretString>,
    /// Known scopes; empty means unrestricted.
    pub scopes: BTreeSet<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Expiry of the current secret.
    pub expires_at: Option<DateTime<Utc>>,
    /// Usage counters.
    pub usage: UsageCounters,
    /// Status.
    pub status: CredentialStatus,
    /// End of the current quarantine.
    pub quarantined_until: Option<DateTime<Utc>>,
    app: Option<AppInstallation>,
}

impl Credential {
    fn from_config(config: CredentialConfig, position: usize) -> Self {
        let now = Utc::now();
        match config {
            CredentialConfig::Pat {
                id,
                token,
                scopes,
                expires_at,
            } => Self {
                id: CredentialId::new(id.unwrap_or_else(|| format!("pat-{}", position))),
                kind: CredentialKind::Pat,
                secret: Some(token),
                scopes: scopes.into_iter().collect(),
                created_at: now,
                expires_at,
                usage: UsageCounters::default(),
                status: CredentialStatus::Active,
                quarantined_until: None,
                app: None,
            },
            CredentialConfig::AppInstallation { id, app, scopes } => Self {
                id: CredentialId::new(id.unwrap_or_else(|| {
                    format!("app-{}-{}", app.app_id, app.installation_id)
                })),
                kind: CredentialKind::AppInstallation,
                secret: None,
                scopes: scopes.into_iter().collect(),
                created_at: now,
                expires_at: None,
                usage: UsageCounters::default(),
                status: CredentialStatus::Active,
                quarantined_until: None,
                app: Some(app),
            },
        }
    }

    /// App parameters for installation credentials.
    pub fn app(&self) -> Option<&AppInstallation> {
        self.app.as_ref()
    }

    /// Returns true when a usable secret is present.
    pub fn has_secret(&self) -> bool {
        self.secret.is_some()
    }

    /// Returns true if the credential carries every required scope.
    pub fn has_scopes(&self, required: &[String]) -> bool {
        self.scopes.is_empty() || required.iter().all(|s| self.scopes.contains(s))
    }

    /// Returns true once the secret is past its expiry.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }

    /// Returns true for App credentials without a token or close to expiry.
    pub fn needs_refresh(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        if self.kind != CredentialKind::AppInstallation {
            return false;
        }
        match (&self.secret, self.expires_at) {
            (Some(_), Some(at)) => at - margin <= now,
            _ => true,
        }
    }

    /// Redacted token prefix for logging.
    pub fn token_prefix(&self) -> &'static str {
        match (&self.kind, &self.secret) {
            (CredentialKind::AppInstallation, _) => "ghs_***",
            (CredentialKind::Pat, Some(t)) if t.expose_secret().starts_with("ghp_") => "ghp_***",
            (CredentialKind::Pat, Some(t)) if t.expose_secret().starts_with("github_pat_") => {
                "github_pat_***"
            }
            _ => "***",
        }
    }

    pub(crate) fn authorization(&self) -> Option<SecretString> {
        self.secret
            .as_ref()
            .map(|s| SecretString::new(format!("Bearer {}", s.expose_secret())))
    }

    pub(crate) fn install_token(&mut self, token: InstallationToken) {
        self.secret = Some(token.token);
        self.expires_at = Some(token.expires_at);
        if !token.permissions.is_empty() {
            self.scopes = token
                .permissions
                .iter()
                .map(|(name, level)| format!("{}:{}", name, level))
                .collect();
        }
        self.status = CredentialStatus::Active;
        self.quarantined_until = None;
    }
}

/// One credential with its own lock.
#[derive(Debug)]
pub(crate) struct CredentialSlot {
    pub(crate) id: CredentialId,
    pub(crate) position: usize,
    pub(crate) state: Mutex<Credential>,
    /// Held for the duration of an App token exchange.
    pub(crate) refresh_guard: tokio::sync::Mutex<()>,
}

/// Holds the configured credentials.
#[derive(Debug, Default)]
pub struct CredentialStore {
    slots: RwLock<Vec<Arc<CredentialSlot>>>,
}

impl CredentialStore {
    /// Builds a store from configuration.
    pub fn new(configs: Vec<CredentialConfig>) -> GitHubResult<Self> {
        let store = Self::default();
        for config in configs {
            store.insert(config)?;
        }
        Ok(store)
    }

    /// Adds a credential at runtime.
    pub fn insert(&self, config: CredentialConfig) -> GitHubResult<CredentialId> {
        config.validate()?;
        let mut slots = self.slots.write();
        let position = slots.len();
        let credential = Credential::from_config(config, position);
        if slots.iter().any(|s| s.id == credential.id) {
            return Err(GitHubError::configuration(format!(
                "Duplicate credential id: {}",
                credential.id
            )));
        }
        let id = credential.id.clone();
        slots.push(Arc::new(CredentialSlot {
            id: id.clone(),
            position,
            state: Mutex::new(credential),
            refresh_guard: tokio::sync::Mutex::new(()),
        }));
        Ok(id)
    }

    /// Removes a credential. In-flight leases stay valid until released.
    pub fn remove(&self, id: &CredentialId) -> bool {
        let mut slots = self.slots.write();
        let before = slots.len();
        slots.retain(|s| &s.id != id);
        slots.len() != before
    }

    /// Number of credentials.
    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    /// Returns true when no credentials are configured.
    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    /// Point-in-time copies of every credential.
    pub fn snapshot(&self) -> Vec<Credential> {
        self.slots().iter().map(|s| s.state.lock().clone()).collect()
    }

    /// Copy of one credential.
    pub fn get(&self, id: &CredentialId) -> Option<Credential> {
        self.slot(id).map(|s| s.state.lock().clone())
    }

    pub(crate) fn slots(&self) -> Vec<Arc<CredentialSlot>> {
        self.slots.read().clone()
    }

    pub(crate) fn slot(&self, id: &CredentialId) -> Option<Arc<CredentialSlot>> {
        self.slots.read().iter().find(|s| &s.id == id).cloned()
    }
}

/// Installation token returned by the token exchange.
#[derive(Debug, Clone, Deserialize)]
pub struct InstallationToken {
    /// Access token.
    pub token: SecretString,
    /// Expiration time.
    pub expires_at: DateTime<Utc>,
    /// Permissions granted.
    #[serde(default)]
    pub permissions: HashMap<String, String>,
    /// Repository selection.
    pub repository_selection: Option<String>,
}

/// Exchanges App credentials for installation tokens.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Obtains a fresh installation token.
    async fn refresh(&self, app: &AppInstallation) -> GitHubResult<InstallationToken>;
}

/// JWT claims for GitHub App authentication.
#[derive(Debug, Serialize, Deserialize)]
struct JwtClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

/// Signs the short-lived App JWT.
pub fn generate_app_jwt(app: &AppInstallation) -> GitHubResult<String> {
    let now = Utc::now();
    // Backdated for clock drift; GitHub caps lifetime at 10 minutes.
    let claims = JwtClaims {
        iat: (now - Duration::seconds(60)).timestamp(),
        exp: (now + Duration::minutes(9)).timestamp(),
        iss: app.app_id.to_string(),
    };

    let key = EncodingKey::from_rsa_pem(app.private_key.expose_secret().as_bytes()).map_err(|e| {
        GitHubError::new(
            GitHubErrorKind::TokenRefreshFailed,
            format!("Failed to parse private key: {}", e),
        )
        .local()
    })?;

    encode(&Header::new(Algorithm::RS256), &claims, &key).map_err(|e| {
        GitHubError::new(
            GitHubErrorKind::TokenRefreshFailed,
            format!("Failed to generate JWT: {}", e),
        )
        .local()
    })
}

/// Token refresher calling `POST /app/installations/{id}/access_tokens`.
pub struct AppTokenExchanger {
    transport: Arc<dyn HttpTransport>,
    base_url: String,
    user_agent: String,
    api_version: String,
}

impl AppTokenExchanger {
    /// Creates an exchanger against the given API base URL.
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        base_url: impl Into<String>,
        user_agent: impl Into<String>,
        api_version: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            base_url: base_url.into(),
            user_agent: user_agent.into(),
            api_version: api_version.into(),
        }
    }
}

#[async_trait]
impl TokenRefresher for AppTokenExchanger {
    async fn refresh(&self, app: &AppInstallation) -> GitHubResult<InstallationToken> {
        let jwt = generate_app_jwt(app)?;
        let url = format!(
            "{}/app/installations/{}/access_tokens",
            self.base_url.trim_end_matches('/'),
            app.installation_id
        );
        let url = Url::parse(&url)
            .map_err(|e| GitHubError::configuration(format!("Invalid token URL: {}", e)))?;

        let request = HttpRequest::new(Method::POST, url)
            .with_header("authorization", &format!("Bearer {}", jwt))?
            .with_header("accept", "application/vnd.github+json")?
            .with_header("user-agent", &self.user_agent)?
            .with_header("x-github-api-version", &self.api_version)?
            .with_json_body(Bytes::from_static(b"{}"));

        let response = self.transport.send(request).await?;
        if !response.status.is_success() {
            let cause =
                GitHubError::from_response(response.status.as_u16(), &response.headers, &response.body);
            return Err(GitHubError::new(
                GitHubErrorKind::TokenRefreshFailed,
                format!(
                    "Installation {} token exchange failed: {}",
                    app.installation_id,
                    cause.message()
                ),
            )
            .with_status(response.status.as_u16())
            .with_cause(cause));
        }

        serde_json::from_slice(&response.body).map_err(|e| {
            GitHubError::new(
                GitHubErrorKind::TokenRefreshFailed,
                format!("Invalid installation token response: {}", e),
            )
        })
    }
}
