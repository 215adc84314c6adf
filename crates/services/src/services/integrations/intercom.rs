use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, header::HeaderMap};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Value, json};
use url::Url;

use super::{
    CustomerIdentity, InboundEvent, InboundFeedback, IntegrationProvider, OAuthClient,
    OutboundUpdate, ProviderError, ProviderKind, StoredCredentials, TokenGrant, WebhookEnvelope,
    check_status, map_reqwest_error, non_empty, parse_body, read_json,
    signature::{header, hmac_sha1_hex, verify_equal},
};

pub const DEFAULT_API_BASE: &str = "https://api.intercom.io";
pub const DEFAULT_AUTHORIZE_URL: &str = "https://app.intercom.com/oauth";
const API_VERSION: &str = "2.11";

const TITLE_MAX_CHARS: usize = 120;

const FEEDBACK_TOPICS: [&str; 2] = ["conversation.user.created", "conversation.user.replied"];

pub struct IntercomProvider {
    http: Client,
    client: OAuthClient,
    api_base: String,
    authorize_url: String,
}

impl IntercomProvider {
    pub fn new(http: Client, client: OAuthClient) -> Self {
        Self {
            http,
            client,
            api_base: DEFAULT_API_BASE.to_string(),
            authorize_url: DEFAULT_AUTHORIZE_URL.to_string(),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn authed(&self, request: RequestBuilder, access_token: &str) -> RequestBuilder {
        request
            .bearer_auth(access_token)
            .header("Accept", "application/json")
            .header("Intercom-Version", API_VERSION)
    }

    async fn me(&self, access_token: &str) -> Result<AdminResponse, ProviderError> {
        let response = self
            .authed(self.http.get(format!("{}/me", self.api_base)), access_token)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        read_json(response).await
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
    token_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AdminResponse {
    id: String,
    email: Option<String>,
    app: Option<AdminApp>,
}

#[derive(Debug, Deserialize)]
struct AdminApp {
    id_code: String,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Notification {
    id: Option<String>,
    topic: String,
    app_id: Option<String>,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Default, Deserialize)]
struct NotificationData {
    item: Option<Conversation>,
}

#[derive(Debug, Deserialize)]
struct Conversation {
    id: String,
    source: Option<ConversationSource>,
    conversation_parts: Option<ConversationParts>,
}

#[derive(Debug, Deserialize)]
struct ConversationSource {
    subject: Option<String>,
    body: Option<String>,
    author: Option<Author>,
}

#[derive(Debug, Deserialize)]
struct ConversationParts {
    #[serde(default)]
    conversation_parts: Vec<ConversationPart>,
}

#[derive(Debug, Deserialize)]
struct ConversationPart {
    id: Option<String>,
    body: Option<String>,
    author: Option<Author>,
}

#[derive(Debug, Clone, Deserialize)]
struct Author {
    #[serde(rename = "type")]
    kind: Option<String>,
    id: Option<String>,
    email: Option<String>,
    name: Option<String>,
}

impl Author {
    fn is_customer(&self) -> bool {
        matches!(self.kind.as_deref(), Some("user" | "lead" | "contact"))
    }
}

impl Conversation {
    /// The conversation text as written by the customer: the opening message
    /// followed by every customer-authored part.
    fn customer_text(&self) -> String {
        let opening = self
            .source
            .as_ref()
            .and_then(|s| s.body.as_deref())
            .map(utils::text::strip_html);
        let replies = self
            .conversation_parts
            .iter()
            .flat_map(|parts| parts.conversation_parts.iter())
            .filter(|part| part.author.as_ref().is_some_and(Author::is_customer))
            .filter_map(|part| part.body.as_deref().map(utils::text::strip_html));

        opening
            .into_iter()
            .chain(replies)
            .filter(|text| !text.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    fn author(&self) -> Option<Author> {
        self.source
            .as_ref()
            .and_then(|s| s.author.clone())
            .filter(Author::is_customer)
    }

    fn last_part_id(&self) -> Option<&str> {
        self.conversation_parts
            .as_ref()
            .and_then(|parts| parts.conversation_parts.last())
            .and_then(|part| part.id.as_deref())
    }
}

#[async_trait]
impl IntegrationProvider for IntercomProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Intercom
    }

    /// Intercom signs notifications with the app's client secret.
    fn signing_secret(&self) -> Option<&SecretString> {
        Some(&self.client.client_secret)
    }

    fn authorize_url(
        &self,
        state: &str,
        redirect_uri: &str,
        _context: &Value,
    ) -> Result<Url, ProviderError> {
        let mut url =
            Url::parse(&self.authorize_url).map_err(|e| ProviderError::InvalidSetting {
                name: "authorize_url",
                reason: e.to_string(),
            })?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.client.client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("state", state);
        Ok(url)
    }

    async fn exchange_code(
        &self,
        code: &str,
        _redirect_uri: &str,
        _context: &Value,
    ) -> Result<TokenGrant, ProviderError> {
        let response = self
            .http
            .post(format!("{}/auth/eagle/token", self.api_base))
            .json(&json!({
                "code": code,
                "client_id": self.client.client_id,
                "client_secret": self.client.client_secret.expose_secret(),
            }))
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let token: TokenResponse = read_json(response).await?;
        let access_token = token
            .access_token
            .or(token.token)
            .ok_or_else(|| ProviderError::Parse("missing access token".to_string()))?;

        // The token response does not say which workspace was connected
        let admin = self.me(&access_token).await?;
        let app = admin
            .app
            .ok_or_else(|| ProviderError::Parse("missing app in /me response".to_string()))?;

        Ok(TokenGrant {
            credentials: StoredCredentials {
                access_token,
                refresh_token: None,
                token_type: token.token_type,
                scope: None,
                expires_at: None,
            },
            external_account_id: Some(app.id_code.clone()),
            settings: json!({
                "app_id": app.id_code,
                "app_name": app.name,
                "admin_id": admin.id,
                "admin_email": admin.email,
            }),
        })
    }

    async fn refresh(
        &self,
        _refresh_token: &str,
        _settings: &Value,
    ) -> Result<StoredCredentials, ProviderError> {
        Err(ProviderError::RefreshUnsupported)
    }

    fn verify_webhook(
        &self,
        headers: &HeaderMap,
        body: &[u8],
        secret: &str,
    ) -> Result<(), ProviderError> {
        let signature = header(headers, "X-Hub-Signature")?;
        let expected = format!("sha1={}", hmac_sha1_hex(secret.as_bytes(), body)?);
        verify_equal(signature, &expected)
    }

    fn parse_webhook(&self, body: &[u8]) -> Result<WebhookEnvelope, ProviderError> {
        let notification: Notification = parse_body(body)?;
        let mut envelope = WebhookEnvelope {
            account_id: notification.app_id.clone(),
            ..Default::default()
        };

        if !FEEDBACK_TOPICS.contains(&notification.topic.as_str()) {
            return Ok(envelope);
        }

        let data: NotificationData = serde_json::from_value(notification.data)
            .map_err(|e| ProviderError::MalformedPayload(e.to_string()))?;
        let conversation = data.item.ok_or_else(|| {
            ProviderError::MalformedPayload("missing conversation item".to_string())
        })?;
        let content = conversation.customer_text();
        let subject = conversation
            .source
            .as_ref()
            .and_then(|s| s.subject.as_deref())
            .map(utils::text::strip_html);
        let title = match non_empty(subject.as_deref()) {
            Some(subject) => utils::text::truncate_chars(&subject, TITLE_MAX_CHARS),
            None => utils::text::title_from_text(&content, TITLE_MAX_CHARS),
        };
        let author = conversation.author();

        let external_id = notification.id.clone().unwrap_or_else(|| {
            format!(
                "{}:{}:{}",
                notification.topic,
                conversation.id,
                conversation.last_part_id().unwrap_or("0")
            )
        });

        envelope.events.push(InboundEvent {
            external_id,
            event_type: notification.topic.clone(),
            customer: CustomerIdentity {
                provider: ProviderKind::Intercom,
                external_id: author.as_ref().and_then(|a| a.id.clone()),
                email: author.as_ref().and_then(|a| non_empty(a.email.as_deref())),
                name: author.as_ref().and_then(|a| non_empty(a.name.as_deref())),
            },
            feedback: InboundFeedback {
                title,
                content,
                source_id: conversation.id.clone(),
                metadata: json!({ "conversation_id": conversation.id }),
            },
        });
        Ok(envelope)
    }

    async fn push_update(
        &self,
        credentials: &StoredCredentials,
        settings: &Value,
        update: &OutboundUpdate,
    ) -> Result<(), ProviderError> {
        let admin_id = settings
            .get("admin_id")
            .and_then(Value::as_str)
            .ok_or(ProviderError::MissingSetting("admin_id"))?;

        let response = self
            .authed(
                self.http.post(format!(
                    "{}/conversations/{}/reply",
                    self.api_base, update.source_id
                )),
                &credentials.access_token,
            )
            .json(&json!({
                "message_type": "note",
                "type": "admin",
                "admin_id": admin_id,
                "body": update.message,
            }))
            .send()
            .await
            .map_err(map_reqwest_error)?;
        check_status(response).await.map(|_| ())
    }

    async fn health_check(
        &self,
        credentials: &StoredCredentials,
        _settings: &Value,
    ) -> Result<(), ProviderError> {
        self.me(&credentials.access_token).await.map(|_| ())
    }
}

/// Compute the `X-Hub-Signature` header for a request body.
pub fn sign(secret: &str, body: &[u8]) -> Result<String, ProviderError> {
    Ok(format!("sha1={}", hmac_sha1_hex(secret.as_bytes(), body)?))
}
