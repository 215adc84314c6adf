//! Shared fixtures for the service integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use db::{
    DBService,
    models::{
        integration::{ConnectIntegration, Integration, ProviderKind},
        organization::{CreateOrganization, Organization, Plan},
        user::{CreateUser, User, UserRole},
    },
    test_utils::create_test_pool,
};
use httpmock::MockServer;
use secrecy::SecretString;
use serde_json::json;
use services::services::{
    integrations::{
        OAuthClient, ProviderRegistry, SlackProvider, StoredCredentials, ZendeskProvider,
        http_client,
    },
    oauth_connection::OAuthConnectionService,
};
use tempfile::TempDir;
use utils::crypto::CredentialCipher;

pub const SLACK_SIGNING_SECRET: &str = "slack-signing-secret";
pub const ZENDESK_WEBHOOK_SECRET: &str = "zendesk-webhook-secret";

pub struct Harness {
    pub db: DBService,
    pub org: Organization,
    pub user: User,
    pub cipher: Arc<CredentialCipher>,
    pub connections: OAuthConnectionService,
    _dir: TempDir,
}

fn oauth_client(prefix: &str) -> OAuthClient {
    OAuthClient {
        client_id: format!("{prefix}-client"),
        client_secret: SecretString::from(format!("{prefix}-secret")),
    }
}

/// A migrated database with one organization and owner, and Slack plus
/// Zendesk providers pointed at `server`.
pub async fn harness(server: &MockServer) -> Harness {
    let (pool, dir) = create_test_pool().await;
    let db = DBService { pool };

    let org = Organization::create(
        &db.pool,
        &CreateOrganization {
            name: "Acme".to_string(),
            plan: Plan::Pro,
        },
    )
    .await
    .unwrap();
    let user = User::create(
        &db.pool,
        &CreateUser {
            organization_id: org.id,
            email: "owner@acme.test".to_string(),
            name: "Owner".to_string(),
            role: UserRole::Owner,
            password_hash: "hash".to_string(),
        },
    )
    .await
    .unwrap();

    let http = http_client().unwrap();
    let registry = ProviderRegistry::new()
        .with(
            SlackProvider::new(
                http.clone(),
                oauth_client("slack"),
                SecretString::from(SLACK_SIGNING_SECRET.to_string()),
            )
            .with_api_base(server.base_url()),
        )
        .with(ZendeskProvider::new(http, oauth_client("zendesk")).with_api_base(server.base_url()));

    let cipher = Arc::new(CredentialCipher::new(&[7u8; 32]).unwrap());
    let connections = OAuthConnectionService::new(
        db.clone(),
        Arc::new(registry),
        cipher.clone(),
        "http://localhost:8080/",
    );

    Harness {
        db,
        org,
        user,
        cipher,
        connections,
        _dir: dir,
    }
}

/// Store an active Zendesk integration for the harness organization.
pub async fn connect_zendesk(h: &Harness, credentials: &StoredCredentials) -> Integration {
    Integration::create_or_reactivate(
        &h.db.pool,
        &ConnectIntegration {
            organization_id: h.org.id,
            provider: ProviderKind::Zendesk,
            external_account_id: Some("acme".to_string()),
            credentials: h.cipher.encrypt_json(credentials).unwrap(),
            webhook_secret: ZENDESK_WEBHOOK_SECRET.to_string(),
            settings: json!({ "subdomain": "acme" }),
        },
    )
    .await
    .unwrap()
}

/// Store an active Slack integration for the harness organization.
pub async fn connect_slack(h: &Harness, team_id: &str) -> Integration {
    Integration::create_or_reactivate(
        &h.db.pool,
        &ConnectIntegration {
            organization_id: h.org.id,
            provider: ProviderKind::Slack,
            external_account_id: Some(team_id.to_string()),
            credentials: h
                .cipher
                .encrypt_json(&StoredCredentials::bearer("xoxb-token"))
                .unwrap(),
            webhook_secret: "unused".to_string(),
            settings: json!({ "team_id": team_id }),
        },
    )
    .await
    .unwrap()
}
