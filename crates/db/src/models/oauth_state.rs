use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::{FromRow, SqlitePool, types::Json};
use thiserror::Error;
use uuid::Uuid;

use super::integration::ProviderKind;

/// How long an authorization round trip may take.
pub const OAUTH_STATE_TTL_MINUTES: i64 = 10;

/// Pending OAuth authorization, keyed by the random `state` parameter.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct OAuthState {
    pub state: String,
    pub organization_id: Uuid,
    pub user_id: Uuid,
    pub provider: ProviderKind,
    pub context: Json<Value>,
    pub redirect_uri: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateOAuthState {
    pub state: String,
    pub organization_id: Uuid,
    pub user_id: Uuid,
    pub provider: ProviderKind,
    pub context: Value,
    pub redirect_uri: String,
}

#[derive(Debug, Error)]
pub enum OAuthStateError {
    #[error("unknown oauth state")]
    NotFound,
    #[error("oauth state expired")]
    Expired,
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

const STATE_COLUMNS: &str =
    "state, organization_id, user_id, provider, context, redirect_uri, expires_at, created_at";

impl OAuthState {
    pub async fn create(pool: &SqlitePool, data: &CreateOAuthState) -> Result<Self, sqlx::Error> {
        let now = Utc::now();
        sqlx::query_as::<_, OAuthState>(&format!(
            r#"INSERT INTO oauth_states (state, organization_id, user_id, provider, context, redirect_uri, expires_at, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
               RETURNING {STATE_COLUMNS}"#
        ))
        .bind(&data.state)
        .bind(data.organization_id)
        .bind(data.user_id)
        .bind(data.provider)
        .bind(Json(&data.context))
        .bind(&data.redirect_uri)
        .bind(now + Duration::minutes(OAUTH_STATE_TTL_MINUTES))
        .bind(now)
        .fetch_one(pool)
        .await
    }

    /// Delete the state and return it. A state can only be used once, even
    /// when it turns out to be expired.
    pub async fn consume(pool: &SqlitePool, state: &str) -> Result<Self, OAuthStateError> {
        let row = sqlx::query_as::<_, OAuthState>(&format!(
            "DELETE FROM oauth_states WHERE state = $1 RETURNING {STATE_COLUMNS}"
        ))
        .bind(state)
        .fetch_optional(pool)
        .await?
        .ok_or(OAuthStateError::NotFound)?;

        if row.expires_at <= Utc::now() {
            return Err(OAuthStateError::Expired);
        }
        Ok(row)
    }

    pub async fn purge_expired(pool: &SqlitePool) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM oauth_states WHERE expires_at <= $1")
            .bind(Utc::now())
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }
}
