use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, header::HeaderMap};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Value, json};
use url::Url;

use super::{
    CustomerIdentity, InboundEvent, InboundFeedback, IntegrationProvider, OAuthClient,
    OutboundUpdate, ProviderError, ProviderKind, StoredCredentials, TokenGrant, WebhookEnvelope,
    map_reqwest_error, non_empty, parse_body, read_json,
    signature::{header, hmac_sha256_hex, verify_equal},
};

pub const DEFAULT_API_BASE: &str = "https://slack.com";

const SCOPES: &str = "channels:history,groups:history,chat:write,users:read,users:read.email";

/// Requests older than this are rejected to prevent replays.
const MAX_TIMESTAMP_SKEW_SECS: u64 = 60 * 5;

const TITLE_MAX_CHARS: usize = 120;

pub struct SlackProvider {
    http: Client,
    client: OAuthClient,
    signing_secret: SecretString,
    api_base: String,
}

impl SlackProvider {
    pub fn new(http: Client, client: OAuthClient, signing_secret: SecretString) -> Self {
        Self {
            http,
            client,
            signing_secret,
            api_base: DEFAULT_API_BASE.to_string(),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/api/{}", self.api_base, method)
    }

    /// Slack answers HTTP 200 with `ok: false` for most failures.
    fn check_ok(body: &Value) -> Result<(), ProviderError> {
        if body.get("ok").and_then(Value::as_bool) == Some(true) {
            return Ok(());
        }
        let error = body
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown_error");
        Err(match error {
            "invalid_auth" | "not_authed" | "token_revoked" | "token_expired"
            | "account_inactive" => ProviderError::Unauthorized,
            "ratelimited" => ProviderError::RateLimited,
            other => ProviderError::Api {
                status: 200,
                body: other.to_string(),
            },
        })
    }

    async fn call(
        &self,
        method: &str,
        access_token: &str,
        payload: &Value,
    ) -> Result<Value, ProviderError> {
        let response = self
            .http
            .post(self.api_url(method))
            .bearer_auth(access_token)
            .json(payload)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let body: Value = read_json(response).await?;
        Self::check_ok(&body)?;
        Ok(body)
    }
}

#[derive(Debug, Deserialize)]
struct OAuthAccessResponse {
    access_token: Option<String>,
    token_type: Option<String>,
    scope: Option<String>,
    bot_user_id: Option<String>,
    team: Option<SlackTeam>,
    incoming_webhook: Option<IncomingWebhook>,
}

#[derive(Debug, Deserialize)]
struct SlackTeam {
    id: String,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IncomingWebhook {
    channel_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SlackPayload {
    UrlVerification {
        challenge: String,
    },
    EventCallback {
        team_id: Option<String>,
        event_id: String,
        event: SlackEvent,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct SlackEvent {
    #[serde(rename = "type")]
    kind: String,
    subtype: Option<String>,
    bot_id: Option<String>,
    user: Option<String>,
    channel: Option<String>,
    text: Option<String>,
    ts: Option<String>,
    thread_ts: Option<String>,
}

impl SlackEvent {
    fn into_inbound(self, event_id: String, team_id: Option<&str>) -> Option<InboundEvent> {
        // Edits, deletions, joins and bot posts arrive as subtypes
        if self.kind != "message" || self.subtype.is_some() || self.bot_id.is_some() {
            return None;
        }
        let text = non_empty(self.text.as_deref())?;
        let channel = self.channel?;
        let ts = self.ts?;

        Some(InboundEvent {
            external_id: event_id,
            event_type: "message".to_string(),
            customer: CustomerIdentity {
                provider: ProviderKind::Slack,
                external_id: self.user,
                email: None,
                name: None,
            },
            feedback: InboundFeedback {
                title: utils::text::title_from_text(&text, TITLE_MAX_CHARS),
                content: text,
                source_id: format!("{channel}:{ts}"),
                metadata: json!({
                    "team_id": team_id,
                    "channel": channel,
                    "ts": ts,
                    "thread_ts": self.thread_ts,
                }),
            },
        })
    }
}

#[async_trait]
impl IntegrationProvider for SlackProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Slack
    }

    fn signing_secret(&self) -> Option<&SecretString> {
        Some(&self.signing_secret)
    }

    fn authorize_url(
        &self,
        state: &str,
        redirect_uri: &str,
        _context: &Value,
    ) -> Result<Url, ProviderError> {
        let mut url = Url::parse(&format!("{}/oauth/v2/authorize", self.api_base))
            .map_err(|e| ProviderError::InvalidSetting {
                name: "api_base",
                reason: e.to_string(),
            })?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.client.client_id)
            .append_pair("scope", SCOPES)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("state", state);
        Ok(url)
    }

    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        _context: &Value,
    ) -> Result<TokenGrant, ProviderError> {
        let response = self
            .http
            .post(self.api_url("oauth.v2.access"))
            .form(&[
                ("client_id", self.client.client_id.as_str()),
                ("client_secret", self.client.client_secret.expose_secret()),
                ("code", code),
                ("redirect_uri", redirect_uri),
            ])
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let body: Value = read_json(response).await?;
        Self::check_ok(&body)?;

        let access: OAuthAccessResponse =
            serde_json::from_value(body).map_err(|e| ProviderError::Parse(e.to_string()))?;
        let access_token = access
            .access_token
            .ok_or_else(|| ProviderError::Parse("missing access_token".to_string()))?;
        let team = access
            .team
            .ok_or_else(|| ProviderError::Parse("missing team".to_string()))?;

        Ok(TokenGrant {
            credentials: StoredCredentials {
                access_token,
                refresh_token: None,
                token_type: access.token_type,
                scope: access.scope,
                expires_at: None,
            },
            external_account_id: Some(team.id.clone()),
            settings: json!({
                "team_id": team.id,
                "team_name": team.name,
                "bot_user_id": access.bot_user_id,
                "channel": access.incoming_webhook.and_then(|w| w.channel_id),
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
        let timestamp = header(headers, "X-Slack-Request-Timestamp")?;
        let signature = header(headers, "X-Slack-Signature")?;

        let sent_at: i64 = timestamp.parse().map_err(|_| ProviderError::StaleTimestamp)?;
        let skew = Utc::now().timestamp().checked_sub(sent_at).map(i64::unsigned_abs);
        if !skew.is_some_and(|skew| skew <= MAX_TIMESTAMP_SKEW_SECS) {
            return Err(ProviderError::StaleTimestamp);
        }

        let digest = hmac_sha256_hex(
            secret.as_bytes(),
            &[b"v0:".as_slice(), timestamp.as_bytes(), b":".as_slice(), body],
        )?;
        verify_equal(signature, &format!("v0={digest}"))
    }

    fn parse_webhook(&self, body: &[u8]) -> Result<WebhookEnvelope, ProviderError> {
        match parse_body::<SlackPayload>(body)? {
            SlackPayload::UrlVerification { challenge } => Ok(WebhookEnvelope {
                challenge: Some(challenge),
                ..Default::default()
            }),
            SlackPayload::EventCallback {
                team_id,
                event_id,
                event,
            } => Ok(WebhookEnvelope {
                events: event
                    .into_inbound(event_id, team_id.as_deref())
                    .into_iter()
                    .collect(),
                account_id: team_id,
                challenge: None,
            }),
            SlackPayload::Other => Ok(WebhookEnvelope::default()),
        }
    }

    async fn push_update(
        &self,
        credentials: &StoredCredentials,
        _settings: &Value,
        update: &OutboundUpdate,
    ) -> Result<(), ProviderError> {
        let (channel, ts) =
            update
                .source_id
                .split_once(':')
                .ok_or_else(|| ProviderError::InvalidSetting {
                    name: "source_id",
                    reason: format!("expected <channel>:<ts>, got {}", update.source_id),
                })?;

        self.call(
            "chat.postMessage",
            &credentials.access_token,
            &json!({
                "channel": channel,
                "thread_ts": ts,
                "text": update.message,
            }),
        )
        .await?;
        Ok(())
    }

    async fn health_check(
        &self,
        credentials: &StoredCredentials,
        _settings: &Value,
    ) -> Result<(), ProviderError> {
        self.call("auth.test", &credentials.access_token, &json!({}))
            .await
            .map(|_| ())
    }
}

/// Compute the `X-Slack-Signature` header for a request body.
pub fn sign(secret: &str, timestamp: i64, body: &[u8]) -> Result<String, ProviderError> {
    let timestamp = timestamp.to_string();
    let digest = hmac_sha256_hex(
        secret.as_bytes(),
        &[b"v0:".as_slice(), timestamp.as_bytes(), b":".as_slice(), body],
    )?;
    Ok(format!("v0={digest}"))
}
