//! OAuth2 authorization-code flow for connecting integrations, plus access to
//! (and refresh of) the stored, encrypted credentials.

use std::sync::Arc;

use chrono::Duration;
use db::{
    DBService,
    models::{
        integration::{ConnectIntegration, Integration, IntegrationStatus},
        oauth_state::{CreateOAuthState, OAuthState, OAuthStateError},
    },
};
use rand::Rng;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{info, warn};
use url::Url;
use utils::crypto::{CredentialCipher, CryptoError};
use uuid::Uuid;

use crate::services::integrations::{
    IntegrationProvider, ProviderError, ProviderKind, ProviderRegistry, StoredCredentials,
};

/// Access tokens expiring within this window are refreshed before use.
const REFRESH_MARGIN_MINUTES: i64 = 5;

#[derive(Debug, Error)]
pub enum OAuthConnectionError {
    #[error("{0} integration is not configured")]
    NotConfigured(ProviderKind),
    #[error("invalid or expired oauth state")]
    InvalidState,
    #[error("oauth state was issued for {expected}, not {actual}")]
    ProviderMismatch {
        expected: ProviderKind,
        actual: ProviderKind,
    },
    #[error("this {0} account is already connected to another organization")]
    AccountInUse(ProviderKind),
    #[error("integration has no stored credentials")]
    MissingCredentials,
    #[error("integration must be re-authorized")]
    ReauthorizationRequired,
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl From<OAuthStateError> for OAuthConnectionError {
    fn from(err: OAuthStateError) -> Self {
        match err {
            OAuthStateError::NotFound | OAuthStateError::Expired => Self::InvalidState,
            OAuthStateError::Database(e) => Self::Database(e),
        }
    }
}

#[derive(Clone)]
pub struct OAuthConnectionService {
    db: DBService,
    registry: Arc<ProviderRegistry>,
    cipher: Arc<CredentialCipher>,
    public_base_url: String,
}

impl OAuthConnectionService {
    pub fn new(
        db: DBService,
        registry: Arc<ProviderRegistry>,
        cipher: Arc<CredentialCipher>,
        public_base_url: impl Into<String>,
    ) -> Self {
        Self {
            db,
            registry,
            cipher,
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// The callback URL registered with every provider.
    pub fn redirect_uri(&self, provider: ProviderKind) -> String {
        format!(
            "{}/v1/integrations/{}/callback",
            self.public_base_url, provider
        )
    }

    fn provider(
        &self,
        kind: ProviderKind,
    ) -> Result<Arc<dyn IntegrationProvider>, OAuthConnectionError> {
        self.registry
            .get(kind)
            .ok_or(OAuthConnectionError::NotConfigured(kind))
    }

    /// Begin connecting `provider` for an organization. Returns the URL the
    /// user must visit to grant access.
    pub async fn start(
        &self,
        organization_id: Uuid,
        user_id: Uuid,
        kind: ProviderKind,
        context: Value,
    ) -> Result<Url, OAuthConnectionError> {
        let provider = self.provider(kind)?;
        let state = random_token();
        let redirect_uri = self.redirect_uri(kind);

        // Validates provider specific context before anything is stored
        let url = provider.authorize_url(&state, &redirect_uri, &context)?;

        OAuthState::purge_expired(&self.db.pool).await?;
        OAuthState::create(
            &self.db.pool,
            &CreateOAuthState {
                state,
                organization_id,
                user_id,
                provider: kind,
                context,
                redirect_uri,
            },
        )
        .await?;

        info!(%organization_id, provider = %kind, "Started OAuth connection");
        Ok(url)
    }

    /// Finish the flow started by [`start`](Self::start): exchange the code and
    /// store the (re)activated integration.
    pub async fn complete(
        &self,
        kind: ProviderKind,
        state: &str,
        code: &str,
    ) -> Result<Integration, OAuthConnectionError> {
        let provider = self.provider(kind)?;
        let pending = OAuthState::consume(&self.db.pool, state).await?;
        if pending.provider != kind {
            return Err(OAuthConnectionError::ProviderMismatch {
                expected: pending.provider,
                actual: kind,
            });
        }

        let grant = provider
            .exchange_code(code, &pending.redirect_uri, &pending.context.0)
            .await?;

        // One organization per external account, so webhooks resolve unambiguously
        if let Some(account_id) = grant.external_account_id.as_deref()
            && let Some(existing) =
                Integration::find_by_external_account(&self.db.pool, kind, account_id).await?
            && existing.organization_id != pending.organization_id
            && existing.is_enabled()
        {
            warn!(
                integration_id = %existing.id,
                provider = %kind,
                "Refused to connect an account already claimed by another organization"
            );
            return Err(OAuthConnectionError::AccountInUse(kind));
        }

        let credentials = self.cipher.encrypt_json(&grant.credentials)?;

        let integration = Integration::create_or_reactivate(
            &self.db.pool,
            &ConnectIntegration {
                organization_id: pending.organization_id,
                provider: kind,
                external_account_id: grant.external_account_id,
                credentials,
                webhook_secret: random_token(),
                settings: grant.settings,
            },
        )
        .await?;

        info!(
            integration_id = %integration.id,
            organization_id = %integration.organization_id,
            provider = %kind,
            "Integration connected"
        );
        Ok(integration)
    }

    /// Decrypt the integration's credentials, refreshing them first when the
    /// access token is about to expire.
    pub async fn credentials(
        &self,
        integration: &Integration,
    ) -> Result<StoredCredentials, OAuthConnectionError> {
        let sealed = integration
            .credentials
            .as_deref()
            .ok_or(OAuthConnectionError::MissingCredentials)?;
        let credentials: StoredCredentials = self.cipher.decrypt_json(sealed)?;

        if !credentials.expires_within(Duration::minutes(REFRESH_MARGIN_MINUTES)) {
            return Ok(credentials);
        }

        let Some(refresh_token) = credentials.refresh_token.clone() else {
            if credentials.is_expired() {
                self.require_reauthorization(integration, "access token expired")
                    .await?;
                return Err(OAuthConnectionError::ReauthorizationRequired);
            }
            return Ok(credentials);
        };

        let provider = self.provider(integration.provider)?;
        match provider
            .refresh(&refresh_token, &integration.settings.0)
            .await
        {
            Ok(mut refreshed) => {
                // Providers may omit the refresh token when it did not rotate
                if refreshed.refresh_token.is_none() {
                    refreshed.refresh_token = Some(refresh_token);
                }
                let sealed = self.cipher.encrypt_json(&refreshed)?;
                Integration::update_credentials(&self.db.pool, integration.id, &sealed).await?;
                info!(integration_id = %integration.id, "Refreshed integration credentials");
                Ok(refreshed)
            }
            Err(ProviderError::Unauthorized | ProviderError::RefreshUnsupported) => {
                self.require_reauthorization(integration, "token refresh rejected")
                    .await?;
                Err(OAuthConnectionError::ReauthorizationRequired)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn require_reauthorization(
        &self,
        integration: &Integration,
        reason: &str,
    ) -> Result<(), sqlx::Error> {
        warn!(
            integration_id = %integration.id,
            provider = %integration.provider,
            reason,
            "Integration requires re-authorization"
        );
        Integration::set_status(&self.db.pool, integration.id, IntegrationStatus::Error).await?;
        Integration::set_metadata(
            &self.db.pool,
            integration.id,
            "last_error",
            &json!({
                "message": format!("re-authorization required: {reason}"),
                "at": chrono::Utc::now(),
            }),
        )
        .await
    }

    /// Forget the credentials and stop syncing. The integration row is kept.
    pub async fn disconnect(
        &self,
        integration: &Integration,
    ) -> Result<Integration, OAuthConnectionError> {
        let integration = Integration::disconnect(&self.db.pool, integration.id).await?;
        info!(
            integration_id = %integration.id,
            provider = %integration.provider,
            "Integration disconnected"
        );
        Ok(integration)
    }
}

/// 32 random bytes, hex encoded.
fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}
