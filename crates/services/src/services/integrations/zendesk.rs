use async_trait::async_trait;
use reqwest::{Client, header::HeaderMap};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Value, json};
use url::Url;

use super::{
    CustomerIdentity, InboundEvent, InboundFeedback, IntegrationProvider, OAuthClient,
    OutboundUpdate, ProviderError, ProviderKind, StoredCredentials, TokenGrant, WebhookEnvelope,
    check_status, expires_at, map_reqwest_error, non_empty, parse_body, read_json,
    signature::{header, hmac_sha256_base64, verify_equal},
};

const SCOPE: &str = "read write";

const TITLE_MAX_CHARS: usize = 120;

/// Zendesk hosts every account on its own subdomain; `api_base` replaces
/// `https://{subdomain}.zendesk.com` when set.
pub struct ZendeskProvider {
    http: Client,
    client: OAuthClient,
    api_base: Option<String>,
}

impl ZendeskProvider {
    pub fn new(http: Client, client: OAuthClient) -> Self {
        Self {
            http,
            client,
            api_base: None,
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = Some(api_base.into().trim_end_matches('/').to_string());
        self
    }

    fn base_url(&self, subdomain: &str) -> String {
        match &self.api_base {
            Some(base) => base.clone(),
            None => format!("https://{subdomain}.zendesk.com"),
        }
    }

    async fn request_token(
        &self,
        subdomain: &str,
        body: Value,
    ) -> Result<StoredCredentials, ProviderError> {
        let response = self
            .http
            .post(format!("{}/oauth/tokens", self.base_url(subdomain)))
            .json(&body)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let token: TokenResponse = read_json(response).await?;

        Ok(StoredCredentials {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            token_type: token.token_type,
            scope: token.scope,
            expires_at: expires_at(token.expires_in),
        })
    }
}

/// Subdomains are plain DNS labels; anything else would let a caller point
/// the OAuth flow at an arbitrary host.
pub fn validate_subdomain(value: Option<&str>) -> Result<String, ProviderError> {
    let subdomain = non_empty(value)
        .ok_or(ProviderError::MissingSetting("subdomain"))?
        .to_lowercase();
    let valid = subdomain.len() <= 63
        && !subdomain.starts_with('-')
        && !subdomain.ends_with('-')
        && subdomain
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-');
    if !valid {
        return Err(ProviderError::InvalidSetting {
            name: "subdomain",
            reason: format!("`{subdomain}` is not a valid Zendesk subdomain"),
        });
    }
    Ok(subdomain)
}

fn subdomain_of(value: &Value) -> Result<String, ProviderError> {
    validate_subdomain(value.get("subdomain").and_then(Value::as_str))
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    token_type: Option<String>,
    scope: Option<String>,
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TicketWebhook {
    id: Option<String>,
    #[serde(rename = "type")]
    kind: String,
    account_id: Option<Value>,
    #[serde(alias = "detail")]
    ticket: Option<Ticket>,
}

#[derive(Debug, Deserialize)]
struct Ticket {
    id: Value,
    subject: Option<String>,
    description: Option<String>,
    requester: Option<Requester>,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Requester {
    id: Option<Value>,
    email: Option<String>,
    name: Option<String>,
}

/// Zendesk ids arrive as numbers or strings depending on the payload template.
fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => non_empty(Some(s)),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
impl IntegrationProvider for ZendeskProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Zendesk
    }

    /// Zendesk webhooks are signed with a per-integration secret.
    fn signing_secret(&self) -> Option<&SecretString> {
        None
    }

    fn authorize_url(
        &self,
        state: &str,
        redirect_uri: &str,
        context: &Value,
    ) -> Result<Url, ProviderError> {
        let subdomain = subdomain_of(context)?;
        let mut url = Url::parse(&format!(
            "{}/oauth/authorizations/new",
            self.base_url(&subdomain)
        ))
        .map_err(|e| ProviderError::InvalidSetting {
            name: "subdomain",
            reason: e.to_string(),
        })?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.client.client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("scope", SCOPE)
            .append_pair("state", state);
        Ok(url)
    }

    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        context: &Value,
    ) -> Result<TokenGrant, ProviderError> {
        let subdomain = subdomain_of(context)?;
        let credentials = self
            .request_token(
                &subdomain,
                json!({
                    "grant_type": "authorization_code",
                    "code": code,
                    "client_id": self.client.client_id,
                    "client_secret": self.client.client_secret.expose_secret(),
                    "redirect_uri": redirect_uri,
                    "scope": SCOPE,
                }),
            )
            .await?;

        Ok(TokenGrant {
            credentials,
            external_account_id: Some(subdomain.clone()),
            settings: json!({ "subdomain": subdomain }),
        })
    }

    async fn refresh(
        &self,
        refresh_token: &str,
        settings: &Value,
    ) -> Result<StoredCredentials, ProviderError> {
        let subdomain = subdomain_of(settings)?;
        self.request_token(
            &subdomain,
            json!({
                "grant_type": "refresh_token",
                "refresh_token": refresh_token,
                "client_id": self.client.client_id,
                "client_secret": self.client.client_secret.expose_secret(),
                "scope": SCOPE,
            }),
        )
        .await
    }

    fn verify_webhook(
        &self,
        headers: &HeaderMap,
        body: &[u8],
        secret: &str,
    ) -> Result<(), ProviderError> {
        let signature = header(headers, "X-Zendesk-Webhook-Signature")?;
        let timestamp = header(headers, "X-Zendesk-Webhook-Signature-Timestamp")?;
        let expected = hmac_sha256_base64(secret.as_bytes(), &[timestamp.as_bytes(), body])?;
        verify_equal(signature, &expected)
    }

    fn parse_webhook(&self, body: &[u8]) -> Result<WebhookEnvelope, ProviderError> {
        let payload: TicketWebhook = parse_body(body)?;
        let account_id = payload.account_id.as_ref().and_then(id_string);

        // Only new tickets become feedback
        if !payload.kind.ends_with("ticket.created") {
            return Ok(WebhookEnvelope {
                account_id,
                ..Default::default()
            });
        }

        let ticket = payload
            .ticket
            .ok_or_else(|| ProviderError::MalformedPayload("missing ticket".to_string()))?;
        let ticket_id = id_string(&ticket.id)
            .ok_or_else(|| ProviderError::MalformedPayload("missing ticket id".to_string()))?;

        let subject = non_empty(ticket.subject.as_deref());
        let description = non_empty(ticket.description.as_deref()).unwrap_or_default();
        let title = match &subject {
            Some(subject) => utils::text::truncate_chars(subject, TITLE_MAX_CHARS),
            None => utils::text::title_from_text(&description, TITLE_MAX_CHARS),
        };
        let requester = ticket.requester.unwrap_or(Requester {
            id: None,
            email: None,
            name: None,
        });

        let event = InboundEvent {
            external_id: payload
                .id
                .unwrap_or_else(|| format!("ticket-{ticket_id}-created")),
            event_type: "ticket.created".to_string(),
            customer: CustomerIdentity {
                provider: ProviderKind::Zendesk,
                external_id: requester.id.as_ref().and_then(id_string),
                email: non_empty(requester.email.as_deref()),
                name: non_empty(requester.name.as_deref()),
            },
            feedback: InboundFeedback {
                title,
                content: description,
                source_id: ticket_id.clone(),
                metadata: json!({ "ticket_id": ticket_id, "tags": ticket.tags }),
            },
        };

        Ok(WebhookEnvelope {
            account_id,
            challenge: None,
            events: vec![event],
        })
    }

    async fn push_update(
        &self,
        credentials: &StoredCredentials,
        settings: &Value,
        update: &OutboundUpdate,
    ) -> Result<(), ProviderError> {
        let subdomain = subdomain_of(settings)?;
        let response = self
            .http
            .put(format!(
                "{}/api/v2/tickets/{}.json",
                self.base_url(&subdomain),
                update.source_id
            ))
            .bearer_auth(&credentials.access_token)
            .json(&json!({
                "ticket": {
                    "comment": { "body": update.message, "public": false }
                }
            }))
            .send()
            .await
            .map_err(map_reqwest_error)?;
        check_status(response).await.map(|_| ())
    }

    async fn health_check(
        &self,
        credentials: &StoredCredentials,
        settings: &Value,
    ) -> Result<(), ProviderError> {
        let subdomain = subdomain_of(settings)?;
        let response = self
            .http
            .get(format!("{}/api/v2/users/me.json", self.base_url(&subdomain)))
            .bearer_auth(&credentials.access_token)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        check_status(response).await.map(|_| ())
    }
}

/// Compute the `X-Zendesk-Webhook-Signature` header for a request body.
pub fn sign(secret: &str, timestamp: &str, body: &[u8]) -> Result<String, ProviderError> {
    hmac_sha256_base64(secret.as_bytes(), &[timestamp.as_bytes(), body])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> ZendeskProvider {
        ZendeskProvider::new(
            Client::new(),
            OAuthClient {
                client_id: "client".to_string(),
                client_secret: SecretString::from("client-secret".to_string()),
            },
        )
    }

    #[test]
    fn subdomain_validation() {
        assert_eq!(validate_subdomain(Some(" Acme ")).unwrap(), "acme");
        assert!(matches!(
            validate_subdomain(None),
            Err(ProviderError::MissingSetting("subdomain"))
        ));
        assert!(validate_subdomain(Some("evil.com/")).is_err());
        assert!(validate_subdomain(Some("-acme")).is_err());
    }

    #[test]
    fn authorize_url_requires_subdomain() {
        assert!(
            provider()
                .authorize_url("s", "http://localhost/cb", &json!({}))
                .is_err()
        );
        let url = provider()
            .authorize_url("s", "http://localhost/cb", &json!({ "subdomain": "acme" }))
            .unwrap();
        assert_eq!(url.host_str(), Some("acme.zendesk.com"));
        assert_eq!(url.path(), "/oauth/authorizations/new");
    }

    #[test]
    fn verifies_signature_over_timestamp_and_body() {
        let body = br#"{"type":"ticket.created"}"#;
        let timestamp = "2025-03-01T10:00:00Z";
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-zendesk-webhook-signature",
            sign("whsec", timestamp, body).unwrap().parse().unwrap(),
        );
        headers.insert(
            "x-zendesk-webhook-signature-timestamp",
            timestamp.parse().unwrap(),
        );

        assert!(provider().verify_webhook(&headers, body, "whsec").is_ok());
        assert!(matches!(
            provider().verify_webhook(&headers, body, "other"),
            Err(ProviderError::InvalidSignature)
        ));

        headers.remove("x-zendesk-webhook-signature-timestamp");
        assert!(matches!(
            provider().verify_webhook(&headers, body, "whsec"),
            Err(ProviderError::MissingHeader(_))
        ));
    }

    #[test]
    fn parses_ticket_created() {
        let body = json!({
            "id": "evt-1",
            "type": "zen:event-type:ticket.created",
            "account_id": 4242,
            "detail": {
                "id": 35,
                "subject": "Cannot export invoices",
                "description": "The export button does nothing",
                "requester": { "id": 7, "email": "Jane@Example.com", "name": "Jane" },
                "tags": ["billing"]
            }
        });
        let envelope = provider()
            .parse_webhook(body.to_string().as_bytes())
            .unwrap();

        assert_eq!(envelope.account_id.as_deref(), Some("4242"));
        let event = &envelope.events[0];
        assert_eq!(event.external_id, "evt-1");
        assert_eq!(event.feedback.source_id, "35");
        assert_eq!(event.feedback.title, "Cannot export invoices");
        assert_eq!(event.customer.external_id.as_deref(), Some("7"));
        assert_eq!(event.customer.email.as_deref(), Some("Jane@Example.com"));
    }

    #[test]
    fn ignores_other_ticket_events() {
        let body = json!({ "type": "ticket.status_changed", "ticket": { "id": 1 } });
        let envelope = provider()
            .parse_webhook(body.to_string().as_bytes())
            .unwrap();
        assert!(envelope.events.is_empty());
    }
}
