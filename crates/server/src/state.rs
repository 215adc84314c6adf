use std::sync::Arc;

use db::DBService;
use services::services::{
    health_monitor::HealthMonitorService,
    integration_processor::IntegrationProcessor,
    integrations::{
        IntercomProvider, OAuthClient, ProviderError, ProviderRegistry, SlackProvider,
        ZendeskProvider, http_client,
    },
    oauth_connection::OAuthConnectionService,
};
use tokio_util::sync::CancellationToken;
use utils::crypto::{CredentialCipher, CryptoError};

use crate::{
    auth::JwtService,
    config::{ProviderConfig, ServerConfig},
};

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("invalid CREDENTIALS_KEY: {0}")]
    Cipher(#[from] CryptoError),
    #[error("failed to build HTTP client: {0}")]
    Http(#[from] ProviderError),
}

/// Shared handles for every request handler.
#[derive(Clone)]
pub struct AppState {
    pub db: DBService,
    pub config: Arc<ServerConfig>,
    pub jwt: Arc<JwtService>,
    pub connections: OAuthConnectionService,
    pub processor: IntegrationProcessor,
    pub health: HealthMonitorService,
    pub cancel: CancellationToken,
}

impl AppState {
    pub fn new(
        db: DBService,
        config: ServerConfig,
        cancel: CancellationToken,
    ) -> Result<Self, StateError> {
        let cipher = Arc::new(CredentialCipher::from_base64(&config.credentials_key)?);
        let registry = Arc::new(build_registry(&config)?);
        let connections = OAuthConnectionService::new(
            db.clone(),
            registry,
            cipher,
            config.public_base_url.clone(),
        );
        let processor = IntegrationProcessor::new(db.clone(), connections.clone(), cancel.clone());
        let health = HealthMonitorService::new(db.clone(), connections.clone())
            .with_interval(config.health_check_interval);
        let jwt = Arc::new(JwtService::new(config.jwt_secret.clone(), config.jwt_ttl));

        Ok(Self {
            db,
            config: Arc::new(config),
            jwt,
            connections,
            processor,
            health,
            cancel,
        })
    }
}

fn oauth_client(config: &ProviderConfig) -> OAuthClient {
    OAuthClient {
        client_id: config.client_id.clone(),
        client_secret: config.client_secret.clone(),
    }
}

/// Register every provider that has credentials configured.
pub fn build_registry(config: &ServerConfig) -> Result<ProviderRegistry, ProviderError> {
    let http = http_client()?;
    let mut registry = ProviderRegistry::new();

    if let Some(slack) = &config.slack {
        let mut provider = SlackProvider::new(
            http.clone(),
            oauth_client(&slack.oauth),
            slack.signing_secret.clone(),
        );
        if let Some(base) = &slack.oauth.api_base {
            provider = provider.with_api_base(base.clone());
        }
        registry.register(Arc::new(provider));
    }

    if let Some(zendesk) = &config.zendesk {
        let mut provider = ZendeskProvider::new(http.clone(), oauth_client(zendesk));
        if let Some(base) = &zendesk.api_base {
            provider = provider.with_api_base(base.clone());
        }
        registry.register(Arc::new(provider));
    }

    if let Some(intercom) = &config.intercom {
        let mut provider = IntercomProvider::new(http, oauth_client(intercom));
        if let Some(base) = &intercom.api_base {
            provider = provider.with_api_base(base.clone());
        }
        registry.register(Arc::new(provider));
    }

    Ok(registry)
}
