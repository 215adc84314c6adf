use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, SqlitePool, Type, types::Json};
use strum_macros::{Display, EnumString};
use uuid::Uuid;

use super::ListParams;

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EventDirection {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EventStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// One unit of work in the sync pipeline. `attempts` counts failed runs.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct IntegrationEvent {
    pub id: Uuid,
    pub integration_id: Uuid,
    pub organization_id: Uuid,
    pub direction: EventDirection,
    pub event_type: String,
    pub external_id: String,
    pub payload: Json<Value>,
    pub status: EventStatus,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewIntegrationEvent {
    pub integration_id: Uuid,
    pub organization_id: Uuid,
    pub direction: EventDirection,
    pub event_type: String,
    pub external_id: String,
    pub payload: Value,
}

const EVENT_COLUMNS: &str = "id, integration_id, organization_id, direction, event_type, external_id, payload, status, attempts, last_error, next_retry_at, processed_at, created_at, updated_at";

impl IntegrationEvent {
    /// Record an event unless one with the same `(integration, direction,
    /// external_id)` exists. `None` means the event is a duplicate delivery.
    pub async fn insert_if_absent(
        pool: &SqlitePool,
        data: &NewIntegrationEvent,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, IntegrationEvent>(&format!(
            r#"INSERT INTO integration_events (id, integration_id, organization_id, direction, event_type,
                                               external_id, payload, status, attempts, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', 0, $8, $8)
               ON CONFLICT (integration_id, direction, external_id) DO NOTHING
               RETURNING {EVENT_COLUMNS}"#
        ))
        .bind(Uuid::new_v4())
        .bind(data.integration_id)
        .bind(data.organization_id)
        .bind(data.direction)
        .bind(&data.event_type)
        .bind(&data.external_id)
        .bind(Json(&data.payload))
        .bind(Utc::now())
        .fetch_optional(pool)
        .await
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, IntegrationEvent>(&format!(
            "SELECT {EVENT_COLUMNS} FROM integration_events WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    pub async fn list_for_integration(
        pool: &SqlitePool,
        integration_id: Uuid,
        status: Option<EventStatus>,
        params: ListParams,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, IntegrationEvent>(&format!(
            r#"SELECT {EVENT_COLUMNS} FROM integration_events
               WHERE integration_id = $1 AND ($2 IS NULL OR status = $2)
               ORDER BY created_at DESC
               LIMIT $3 OFFSET $4"#
        ))
        .bind(integration_id)
        .bind(status)
        .bind(params.limit())
        .bind(params.offset())
        .fetch_all(pool)
        .await
    }

    /// Events whose processing was interrupted, oldest first.
    pub async fn list_resumable(pool: &SqlitePool) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, IntegrationEvent>(&format!(
            r#"SELECT {EVENT_COLUMNS} FROM integration_events
               WHERE status IN ('pending', 'processing')
               ORDER BY created_at ASC"#
        ))
        .fetch_all(pool)
        .await
    }

    pub async fn mark_processing(pool: &SqlitePool, id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE integration_events SET status = 'processing', next_retry_at = NULL, updated_at = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(Utc::now())
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn mark_completed(pool: &SqlitePool, id: Uuid) -> Result<(), sqlx::Error> {
        let now = Utc::now();
        sqlx::query(
            r#"UPDATE integration_events
               SET status = 'completed', last_error = NULL, next_retry_at = NULL,
                   processed_at = $2, updated_at = $2
               WHERE id = $1"#,
        )
        .bind(id)
        .bind(now)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Count a failed attempt and park the event until `next_retry_at`.
    pub async fn mark_retry(
        pool: &SqlitePool,
        id: Uuid,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, IntegrationEvent>(&format!(
            r#"UPDATE integration_events
               SET status = 'pending', attempts = attempts + 1, last_error = $2,
                   next_retry_at = $3, updated_at = $4
               WHERE id = $1
               RETURNING {EVENT_COLUMNS}"#
        ))
        .bind(id)
        .bind(error)
        .bind(next_retry_at)
        .bind(Utc::now())
        .fetch_one(pool)
        .await
    }

    pub async fn mark_failed(pool: &SqlitePool, id: Uuid, error: &str) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, IntegrationEvent>(&format!(
            r#"UPDATE integration_events
               SET status = 'failed', attempts = attempts + 1, last_error = $2,
                   next_retry_at = NULL, updated_at = $3
               WHERE id = $1
               RETURNING {EVENT_COLUMNS}"#
        ))
        .bind(id)
        .bind(error)
        .bind(Utc::now())
        .fetch_one(pool)
        .await
    }

    /// Put a failed event back in the queue with a fresh attempt budget.
    pub async fn reset_for_retry(pool: &SqlitePool, id: Uuid) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, IntegrationEvent>(&format!(
            r#"UPDATE integration_events
               SET status = 'pending', attempts = 0, last_error = NULL,
                   next_retry_at = NULL, processed_at = NULL, updated_at = $2
               WHERE id = $1
               RETURNING {EVENT_COLUMNS}"#
        ))
        .bind(id)
        .bind(Utc::now())
        .fetch_one(pool)
        .await
    }
}
