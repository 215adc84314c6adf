use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, SqlitePool, Type, types::Json};
use strum_macros::{Display, EnumString};
use uuid::Uuid;

use super::{ListParams, double_option, integration::ProviderKind};

#[derive(
    Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, Display, EnumString, Default,
)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FeedbackSource {
    #[default]
    Manual,
    Api,
    Slack,
    Zendesk,
    Intercom,
}

impl FeedbackSource {
    /// Sources that correspond to a connected third-party integration.
    pub fn is_external(self) -> bool {
        matches!(
            self,
            FeedbackSource::Slack | FeedbackSource::Zendesk | FeedbackSource::Intercom
        )
    }

    pub fn provider(self) -> Option<ProviderKind> {
        match self {
            FeedbackSource::Slack => Some(ProviderKind::Slack),
            FeedbackSource::Zendesk => Some(ProviderKind::Zendesk),
            FeedbackSource::Intercom => Some(ProviderKind::Intercom),
            FeedbackSource::Manual | FeedbackSource::Api => None,
        }
    }
}

impl From<ProviderKind> for FeedbackSource {
    fn from(kind: ProviderKind) -> Self {
        match kind {
            ProviderKind::Slack => FeedbackSource::Slack,
            ProviderKind::Zendesk => FeedbackSource::Zendesk,
            ProviderKind::Intercom => FeedbackSource::Intercom,
        }
    }
}

#[derive(
    Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, Display, EnumString, Default,
)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FeedbackStatus {
    #[default]
    New,
    UnderReview,
    Planned,
    InProgress,
    Completed,
    Closed,
}

#[derive(
    Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, Display, EnumString, Default,
)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FeedbackPriority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Feedback {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub customer_id: Option<Uuid>,
    pub title: String,
    pub content: String,
    pub source: FeedbackSource,
    /// Reference into the source system (Slack `channel:ts`, Zendesk ticket id, ...).
    pub source_id: Option<String>,
    pub status: FeedbackStatus,
    pub priority: FeedbackPriority,
    pub category: Option<String>,
    pub tags: Json<Vec<String>>,
    pub metadata: Json<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateFeedback {
    pub customer_id: Option<Uuid>,
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub source: FeedbackSource,
    pub source_id: Option<String>,
    #[serde(default)]
    pub status: FeedbackStatus,
    #[serde(default)]
    pub priority: FeedbackPriority,
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateFeedback {
    /// `Some(None)` detaches the customer.
    #[serde(default, deserialize_with = "double_option")]
    pub customer_id: Option<Option<Uuid>>,
    pub title: Option<String>,
    pub content: Option<String>,
    pub status: Option<FeedbackStatus>,
    pub priority: Option<FeedbackPriority>,
    #[serde(default, deserialize_with = "double_option")]
    pub category: Option<Option<String>>,
    pub tags: Option<Vec<String>>,
}

/// Filters for listing feedback. All fields are optional and combined with AND.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeedbackFilter {
    pub status: Option<FeedbackStatus>,
    pub source: Option<FeedbackSource>,
    pub priority: Option<FeedbackPriority>,
    pub customer_id: Option<Uuid>,
    pub search: Option<String>,
}

/// Feedback arriving from an external system, keyed by `(source, source_id)`.
#[derive(Debug, Clone)]
pub struct SourcedFeedback {
    pub customer_id: Option<Uuid>,
    pub title: String,
    pub content: String,
    pub source: FeedbackSource,
    pub source_id: String,
    pub metadata: Value,
}

const FEEDBACK_COLUMNS: &str = "id, organization_id, customer_id, title, content, source, source_id, status, priority, category, tags, metadata, created_at, updated_at";

impl Feedback {
    pub async fn find_by_id(
        pool: &SqlitePool,
        organization_id: Uuid,
        id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Feedback>(&format!(
            "SELECT {FEEDBACK_COLUMNS} FROM feedback WHERE id = $1 AND organization_id = $2"
        ))
        .bind(id)
        .bind(organization_id)
        .fetch_optional(pool)
        .await
    }

    pub async fn find_by_source(
        pool: &SqlitePool,
        organization_id: Uuid,
        source: FeedbackSource,
        source_id: &str,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Feedback>(&format!(
            r#"SELECT {FEEDBACK_COLUMNS} FROM feedback
               WHERE organization_id = $1 AND source = $2 AND source_id = $3"#
        ))
        .bind(organization_id)
        .bind(source)
        .bind(source_id)
        .fetch_optional(pool)
        .await
    }

    pub async fn list(
        pool: &SqlitePool,
        organization_id: Uuid,
        filter: &FeedbackFilter,
        params: ListParams,
    ) -> Result<Vec<Self>, sqlx::Error> {
        let pattern = filter
            .search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| format!("%{s}%"));

        sqlx::query_as::<_, Feedback>(&format!(
            r#"SELECT {FEEDBACK_COLUMNS} FROM feedback
               WHERE organization_id = $1
                 AND ($2 IS NULL OR status = $2)
                 AND ($3 IS NULL OR source = $3)
                 AND ($4 IS NULL OR priority = $4)
                 AND ($5 IS NULL OR customer_id = $5)
                 AND ($6 IS NULL OR title LIKE $6 OR content LIKE $6)
               ORDER BY created_at DESC
               LIMIT $7 OFFSET $8"#
        ))
        .bind(organization_id)
        .bind(filter.status)
        .bind(filter.source)
        .bind(filter.priority)
        .bind(filter.customer_id)
        .bind(pattern)
        .bind(params.limit())
        .bind(params.offset())
        .fetch_all(pool)
        .await
    }

    pub async fn create(
        pool: &SqlitePool,
        organization_id: Uuid,
        data: &CreateFeedback,
    ) -> Result<Self, sqlx::Error> {
        let now = Utc::now();
        let metadata = data
            .metadata
            .clone()
            .unwrap_or_else(|| Value::Object(Default::default()));

        sqlx::query_as::<_, Feedback>(&format!(
            r#"INSERT INTO feedback (id, organization_id, customer_id, title, content, source, source_id,
                                     status, priority, category, tags, metadata, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $13)
               RETURNING {FEEDBACK_COLUMNS}"#
        ))
        .bind(Uuid::new_v4())
        .bind(organization_id)
        .bind(data.customer_id)
        .bind(data.title.trim())
        .bind(&data.content)
        .bind(data.source)
        .bind(data.source_id.as_deref())
        .bind(data.status)
        .bind(data.priority)
        .bind(data.category.as_deref())
        .bind(Json(&data.tags))
        .bind(Json(&metadata))
        .bind(now)
        .fetch_one(pool)
        .await
    }

    /// Idempotent insert for externally sourced feedback. A redelivered item
    /// refreshes title, content and customer but keeps its triage state.
    /// Returns the row and whether it was newly created.
    pub async fn upsert_from_source(
        pool: &SqlitePool,
        organization_id: Uuid,
        data: &SourcedFeedback,
    ) -> Result<(Self, bool), sqlx::Error> {
        if let Some(existing) =
            Self::find_by_source(pool, organization_id, data.source, &data.source_id).await?
        {
            let updated = sqlx::query_as::<_, Feedback>(&format!(
                r#"UPDATE feedback
                   SET title = $2, content = $3, customer_id = COALESCE($4, customer_id), updated_at = $5
                   WHERE id = $1
                   RETURNING {FEEDBACK_COLUMNS}"#
            ))
            .bind(existing.id)
            .bind(data.title.trim())
            .bind(&data.content)
            .bind(data.customer_id)
            .bind(Utc::now())
            .fetch_one(pool)
            .await?;
            return Ok((updated, false));
        }

        let create = CreateFeedback {
            customer_id: data.customer_id,
            title: data.title.clone(),
            content: data.content.clone(),
            source: data.source,
            source_id: Some(data.source_id.clone()),
            metadata: Some(data.metadata.clone()),
            ..Default::default()
        };

        match Self::create(pool, organization_id, &create).await {
            Ok(created) => Ok((created, true)),
            // Lost a race with a concurrent delivery of the same item
            Err(e) if crate::is_unique_violation(&e) => {
                let existing =
                    Self::find_by_source(pool, organization_id, data.source, &data.source_id)
                        .await?
                        .ok_or(e)?;
                Ok((existing, false))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn update(
        pool: &SqlitePool,
        organization_id: Uuid,
        id: Uuid,
        data: &UpdateFeedback,
    ) -> Result<Self, sqlx::Error> {
        let existing = Self::find_by_id(pool, organization_id, id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)?;

        let customer_id = data.customer_id.unwrap_or(existing.customer_id);
        let title = data.title.as_deref().map(str::trim).unwrap_or(&existing.title);
        let content = data.content.as_deref().unwrap_or(&existing.content);
        let status = data.status.unwrap_or(existing.status);
        let priority = data.priority.unwrap_or(existing.priority);
        let category = match &data.category {
            Some(category) => category.as_deref(),
            None => existing.category.as_deref(),
        };
        let tags = data.tags.as_ref().unwrap_or(&existing.tags.0);

        sqlx::query_as::<_, Feedback>(&format!(
            r#"UPDATE feedback
               SET customer_id = $3, title = $4, content = $5, status = $6, priority = $7,
                   category = $8, tags = $9, updated_at = $10
               WHERE id = $1 AND organization_id = $2
               RETURNING {FEEDBACK_COLUMNS}"#
        ))
        .bind(id)
        .bind(organization_id)
        .bind(customer_id)
        .bind(title)
        .bind(content)
        .bind(status)
        .bind(priority)
        .bind(category)
        .bind(Json(tags))
        .bind(Utc::now())
        .fetch_one(pool)
        .await
    }

    /// Replace the `sync` block of the metadata column.
    pub async fn set_sync_metadata(
        pool: &SqlitePool,
        id: Uuid,
        sync: &Value,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE feedback SET metadata = json_set(metadata, '$.sync', json($2)) WHERE id = $1")
            .bind(id)
            .bind(sync.to_string())
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn delete(
        pool: &SqlitePool,
        organization_id: Uuid,
        id: Uuid,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM feedback WHERE id = $1 AND organization_id = $2")
            .bind(id)
            .bind(organization_id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }
}
