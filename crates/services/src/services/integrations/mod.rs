//! Third-party integrations (Slack, Zendesk, Intercom).
//!
//! Every provider implements [`IntegrationProvider`]: the OAuth2 authorization
//! code flow, webhook signature verification, normalization of webhook payloads
//! into [`InboundEvent`]s, outbound status updates and a cheap health probe.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use db::models::feedback::FeedbackStatus;
pub use db::models::integration::ProviderKind;
use reqwest::{Client, Response, StatusCode, header::HeaderMap};
use secrecy::SecretString;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

pub mod intercom;
pub mod signature;
pub mod slack;
pub mod zendesk;

pub use intercom::IntercomProvider;
pub use slack::SlackProvider;
pub use zendesk::ZendeskProvider;

const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("provider rejected the credentials")]
    Unauthorized,
    #[error("provider rate limit exceeded")]
    RateLimited,
    #[error("provider returned HTTP {status}: {body}")]
    Api { status: u16, body: String },
    #[error("request to provider timed out")]
    Timeout,
    #[error("request to provider failed: {0}")]
    Transport(String),
    #[error("failed to parse provider response: {0}")]
    Parse(String),
    #[error("missing header {0}")]
    MissingHeader(&'static str),
    #[error("invalid webhook signature")]
    InvalidSignature,
    #[error("webhook timestamp outside the accepted window")]
    StaleTimestamp,
    #[error("malformed webhook payload: {0}")]
    MalformedPayload(String),
    #[error("missing setting `{0}`")]
    MissingSetting(&'static str),
    #[error("invalid setting `{name}`: {reason}")]
    InvalidSetting { name: &'static str, reason: String },
    #[error("provider does not support token refresh")]
    RefreshUnsupported,
}

impl ProviderError {
    /// Returns true if the error is transient and the call could be retried.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout | Self::Transport(_) | Self::RateLimited => true,
            Self::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Errors caused by the webhook sender rather than by us or the provider API.
    pub fn is_verification_failure(&self) -> bool {
        matches!(
            self,
            Self::MissingHeader(_) | Self::InvalidSignature | Self::StaleTimestamp
        )
    }
}

/// OAuth tokens as persisted (encrypted) on an integration.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredCredentials {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl StoredCredentials {
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            token_type: Some("bearer".to_string()),
            scope: None,
            expires_at: None,
        }
    }

    /// True when the token expires within `margin` from now. Tokens without an
    /// expiry never expire.
    pub fn expires_within(&self, margin: chrono::Duration) -> bool {
        self.expires_at
            .is_some_and(|expires_at| expires_at <= Utc::now() + margin)
    }

    pub fn is_expired(&self) -> bool {
        self.expires_within(chrono::Duration::zero())
    }
}

impl fmt::Debug for StoredCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredCredentials")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("token_type", &self.token_type)
            .field("scope", &self.scope)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Result of exchanging an authorization code.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub credentials: StoredCredentials,
    /// Slack team id, Zendesk subdomain or Intercom app id.
    pub external_account_id: Option<String>,
    /// Provider specific settings stored on the integration.
    pub settings: Value,
}

/// Who sent a piece of feedback, as far as the provider tells us.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerIdentity {
    pub provider: ProviderKind,
    pub external_id: Option<String>,
    pub email: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundFeedback {
    pub title: String,
    pub content: String,
    /// Stable reference in the source system; feedback is upserted on it.
    pub source_id: String,
    #[serde(default)]
    pub metadata: Value,
}

/// A normalized webhook event. Stored as the payload of inbound integration events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    /// Delivery id used for deduplication.
    pub external_id: String,
    pub event_type: String,
    pub customer: CustomerIdentity,
    pub feedback: InboundFeedback,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WebhookEnvelope {
    pub account_id: Option<String>,
    /// Set for endpoint verification requests that must be echoed back.
    pub challenge: Option<String>,
    pub events: Vec<InboundEvent>,
}

/// Status change pushed back to the system a feedback item came from. Stored
/// as the payload of outbound integration events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundUpdate {
    pub feedback_id: Uuid,
    pub source_id: String,
    pub title: String,
    pub status: FeedbackStatus,
    pub message: String,
}

impl OutboundUpdate {
    pub fn status_message(title: &str, status: FeedbackStatus) -> String {
        format!(
            "Feedback \"{}\" is now {}",
            title,
            status.to_string().replace('_', " ")
        )
    }
}

#[async_trait]
pub trait IntegrationProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Secret shared by every integration of this provider, if webhooks are
    /// signed with an application-level secret.
    fn signing_secret(&self) -> Option<&SecretString>;

    fn authorize_url(
        &self,
        state: &str,
        redirect_uri: &str,
        context: &Value,
    ) -> Result<Url, ProviderError>;

    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        context: &Value,
    ) -> Result<TokenGrant, ProviderError>;

    async fn refresh(
        &self,
        refresh_token: &str,
        settings: &Value,
    ) -> Result<StoredCredentials, ProviderError>;

    fn verify_webhook(
        &self,
        headers: &HeaderMap,
        body: &[u8],
        secret: &str,
    ) -> Result<(), ProviderError>;

    fn parse_webhook(&self, body: &[u8]) -> Result<WebhookEnvelope, ProviderError>;

    async fn push_update(
        &self,
        credentials: &StoredCredentials,
        settings: &Value,
        update: &OutboundUpdate,
    ) -> Result<(), ProviderError>;

    async fn health_check(
        &self,
        credentials: &StoredCredentials,
        settings: &Value,
    ) -> Result<(), ProviderError>;
}

/// OAuth application credentials for one provider.
#[derive(Debug, Clone)]
pub struct OAuthClient {
    pub client_id: String,
    pub client_secret: SecretString,
}

/// The providers this deployment has credentials for.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, Arc<dyn IntegrationProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn IntegrationProvider>) {
        self.providers.insert(provider.kind(), provider);
    }

    pub fn with(mut self, provider: impl IntegrationProvider + 'static) -> Self {
        self.register(Arc::new(provider));
        self
    }

    pub fn get(&self, kind: ProviderKind) -> Option<Arc<dyn IntegrationProvider>> {
        self.providers.get(&kind).cloned()
    }

    pub fn is_configured(&self, kind: ProviderKind) -> bool {
        self.providers.contains_key(&kind)
    }

    pub fn kinds(&self) -> Vec<ProviderKind> {
        let mut kinds: Vec<ProviderKind> = self.providers.keys().copied().collect();
        kinds.sort_by_key(|kind| kind.to_string());
        kinds
    }
}

/// Shared HTTP client for provider API calls.
pub fn http_client() -> Result<Client, ProviderError> {
    Client::builder()
        .timeout(HTTP_TIMEOUT)
        .user_agent(concat!("feedback-hub/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| ProviderError::Transport(e.to_string()))
}

pub(crate) fn map_reqwest_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout
    } else if e.is_decode() {
        ProviderError::Parse(e.to_string())
    } else {
        ProviderError::Transport(e.to_string())
    }
}

/// Map non-2xx responses onto [`ProviderError`].
pub(crate) async fn check_status(response: Response) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    tracing::warn!(status = status.as_u16(), body = %body, "Provider returned error");
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Unauthorized,
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited,
        _ => ProviderError::Api {
            status: status.as_u16(),
            body,
        },
    })
}

pub(crate) async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, ProviderError> {
    check_status(response)
        .await?
        .json::<T>()
        .await
        .map_err(|e| ProviderError::Parse(e.to_string()))
}

pub(crate) fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ProviderError> {
    serde_json::from_slice(body).map_err(|e| ProviderError::MalformedPayload(e.to_string()))
}

pub(crate) fn expires_at(expires_in: Option<i64>) -> Option<DateTime<Utc>> {
    expires_in
        .filter(|secs| *secs > 0)
        .map(|secs| Utc::now() + chrono::Duration::seconds(secs))
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
