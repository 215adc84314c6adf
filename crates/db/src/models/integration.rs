use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, SqlitePool, Type, types::Json};
use strum_macros::{Display, EnumIter, EnumString};
use uuid::Uuid;

/// Third-party systems feedback can be synchronized with.
#[derive(
    Debug,
    Clone,
    Copy,
    Type,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumString,
    EnumIter,
)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ProviderKind {
    Slack,
    Zendesk,
    Intercom,
}

#[derive(
    Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, Display, EnumString, Default,
)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum IntegrationStatus {
    #[default]
    Pending,
    Active,
    Error,
    Disconnected,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Integration {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub provider: ProviderKind,
    pub status: IntegrationStatus,
    /// Slack team id, Zendesk subdomain or Intercom app id.
    pub external_account_id: Option<String>,
    /// AES-GCM encrypted `StoredCredentials`.
    #[serde(skip_serializing)]
    pub credentials: Option<Vec<u8>>,
    #[serde(skip_serializing)]
    pub webhook_secret: Option<String>,
    pub settings: Json<Value>,
    pub metadata: Json<Value>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ConnectIntegration {
    pub organization_id: Uuid,
    pub provider: ProviderKind,
    pub external_account_id: Option<String>,
    pub credentials: Vec<u8>,
    pub webhook_secret: String,
    pub settings: Value,
}

const INTEGRATION_COLUMNS: &str = "id, organization_id, provider, status, external_account_id, credentials, webhook_secret, settings, metadata, last_synced_at, created_at, updated_at";

impl Integration {
    /// Whether webhooks and health checks should be handled for this integration.
    pub fn is_enabled(&self) -> bool {
        matches!(
            self.status,
            IntegrationStatus::Active | IntegrationStatus::Error
        )
    }

    /// Read a string value from the settings object.
    pub fn setting(&self, key: &str) -> Option<&str> {
        self.settings.0.get(key).and_then(Value::as_str)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Integration>(&format!(
            "SELECT {INTEGRATION_COLUMNS} FROM integrations WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    /// Lookup scoped to an organization.
    pub async fn find_for_org(
        pool: &SqlitePool,
        organization_id: Uuid,
        id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Integration>(&format!(
            "SELECT {INTEGRATION_COLUMNS} FROM integrations WHERE id = $1 AND organization_id = $2"
        ))
        .bind(id)
        .bind(organization_id)
        .fetch_optional(pool)
        .await
    }

    pub async fn find_by_provider(
        pool: &SqlitePool,
        organization_id: Uuid,
        provider: ProviderKind,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Integration>(&format!(
            "SELECT {INTEGRATION_COLUMNS} FROM integrations WHERE organization_id = $1 AND provider = $2"
        ))
        .bind(organization_id)
        .bind(provider)
        .fetch_optional(pool)
        .await
    }

    /// Resolve the integration a webhook belongs to from the account id in
    /// its payload. Enabled integrations win over disconnected ones; connecting
    /// refuses a second enabled integration for the same account.
    pub async fn find_by_external_account(
        pool: &SqlitePool,
        provider: ProviderKind,
        external_account_id: &str,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Integration>(&format!(
            r#"SELECT {INTEGRATION_COLUMNS} FROM integrations
               WHERE provider = $1 AND external_account_id = $2
               ORDER BY status IN ('active', 'error') DESC, updated_at DESC
               LIMIT 1"#
        ))
        .bind(provider)
        .bind(external_account_id)
        .fetch_optional(pool)
        .await
    }

    /// Integrations that are connected, including those currently in error.
    pub async fn list_active(pool: &SqlitePool) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Integration>(&format!(
            r#"SELECT {INTEGRATION_COLUMNS} FROM integrations
               WHERE status IN ('active', 'error')
               ORDER BY created_at ASC"#
        ))
        .fetch_all(pool)
        .await
    }

    pub async fn list_by_organization(
        pool: &SqlitePool,
        organization_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Integration>(&format!(
            r#"SELECT {INTEGRATION_COLUMNS} FROM integrations
               WHERE organization_id = $1
               ORDER BY provider ASC"#
        ))
        .bind(organization_id)
        .fetch_all(pool)
        .await
    }

    /// Insert a new integration or reconnect the existing one for the same
    /// organization and provider. Metadata from a previous connection is reset.
    pub async fn create_or_reactivate(
        pool: &SqlitePool,
        data: &ConnectIntegration,
    ) -> Result<Self, sqlx::Error> {
        let now = Utc::now();
        sqlx::query_as::<_, Integration>(&format!(
            r#"INSERT INTO integrations (id, organization_id, provider, status, external_account_id,
                                         credentials, webhook_secret, settings, metadata, created_at, updated_at)
               VALUES ($1, $2, $3, 'active', $4, $5, $6, $7, '{{}}', $8, $8)
               ON CONFLICT (organization_id, provider) DO UPDATE SET
                   status = 'active',
                   external_account_id = excluded.external_account_id,
                   credentials = excluded.credentials,
                   webhook_secret = excluded.webhook_secret,
                   settings = excluded.settings,
                   metadata = '{{}}',
                   updated_at = excluded.updated_at
               RETURNING {INTEGRATION_COLUMNS}"#
        ))
        .bind(Uuid::new_v4())
        .bind(data.organization_id)
        .bind(data.provider)
        .bind(data.external_account_id.as_deref())
        .bind(&data.credentials)
        .bind(&data.webhook_secret)
        .bind(Json(&data.settings))
        .bind(now)
        .fetch_one(pool)
        .await
    }

    pub async fn update_credentials(
        pool: &SqlitePool,
        id: Uuid,
        credentials: &[u8],
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE integrations SET credentials = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(credentials)
            .bind(Utc::now())
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn set_status(
        pool: &SqlitePool,
        id: Uuid,
        status: IntegrationStatus,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE integrations SET status = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(status)
            .bind(Utc::now())
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Set a single top-level key of the metadata object.
    pub async fn set_metadata(
        pool: &SqlitePool,
        id: Uuid,
        key: &str,
        value: &Value,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"UPDATE integrations
               SET metadata = json_set(metadata, '$.' || $2, json($3)), updated_at = $4
               WHERE id = $1"#,
        )
        .bind(id)
        .bind(key)
        .bind(value.to_string())
        .bind(Utc::now())
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn touch_synced(pool: &SqlitePool, id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE integrations SET last_synced_at = $2 WHERE id = $1")
            .bind(id)
            .bind(Utc::now())
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Drop stored credentials and mark the integration disconnected. The row
    /// and its event history are kept.
    pub async fn disconnect(pool: &SqlitePool, id: Uuid) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Integration>(&format!(
            r#"UPDATE integrations
               SET status = 'disconnected', credentials = NULL, updated_at = $2
               WHERE id = $1
               RETURNING {INTEGRATION_COLUMNS}"#
        ))
        .bind(id)
        .bind(Utc::now())
        .fetch_one(pool)
        .await
    }
}
