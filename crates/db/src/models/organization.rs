use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, SqlitePool, Type, types::Json};
use strum_macros::{Display, EnumString};
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, Display, EnumString, Default,
)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Plan {
    #[default]
    Free,
    Pro,
    Enterprise,
}

/// A tenant. Every other record hangs off an organization.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub plan: Plan,
    pub settings: Json<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateOrganization {
    pub name: String,
    #[serde(default)]
    pub plan: Plan,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateOrganization {
    pub name: Option<String>,
    pub plan: Option<Plan>,
    pub settings: Option<Value>,
}

const SELECT_ORGANIZATION: &str =
    "SELECT id, name, slug, plan, settings, created_at, updated_at FROM organizations";

impl Organization {
    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Organization>(&format!("{SELECT_ORGANIZATION} WHERE id = $1"))
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn find_by_slug(pool: &SqlitePool, slug: &str) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Organization>(&format!("{SELECT_ORGANIZATION} WHERE slug = $1"))
            .bind(slug)
            .fetch_optional(pool)
            .await
    }

    /// Pick a slug derived from `name` that is not taken yet.
    async fn available_slug(pool: &SqlitePool, name: &str) -> Result<String, sqlx::Error> {
        let mut base = utils::text::slugify(name);
        if base.is_empty() {
            base = "org".to_string();
        }

        let mut candidate = base.clone();
        let mut suffix = 2;
        while Self::find_by_slug(pool, &candidate).await?.is_some() {
            candidate = format!("{base}-{suffix}");
            suffix += 1;
        }
        Ok(candidate)
    }

    pub async fn create(pool: &SqlitePool, data: &CreateOrganization) -> Result<Self, sqlx::Error> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let name = data.name.trim();
        let slug = Self::available_slug(pool, name).await?;

        sqlx::query_as::<_, Organization>(
            r#"INSERT INTO organizations (id, name, slug, plan, settings, created_at, updated_at)
               VALUES ($1, $2, $3, $4, '{}', $5, $5)
               RETURNING id, name, slug, plan, settings, created_at, updated_at"#,
        )
        .bind(id)
        .bind(name)
        .bind(slug)
        .bind(data.plan)
        .bind(now)
        .fetch_one(pool)
        .await
    }

    pub async fn update(
        pool: &SqlitePool,
        id: Uuid,
        data: &UpdateOrganization,
    ) -> Result<Self, sqlx::Error> {
        let existing = Self::find_by_id(pool, id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)?;

        let name = data
            .name
            .as_deref()
            .map(str::trim)
            .unwrap_or(&existing.name);
        let plan = data.plan.unwrap_or(existing.plan);
        let settings = data.settings.as_ref().unwrap_or(&existing.settings.0);

        sqlx::query_as::<_, Organization>(
            r#"UPDATE organizations
               SET name = $2, plan = $3, settings = $4, updated_at = $5
               WHERE id = $1
               RETURNING id, name, slug, plan, settings, created_at, updated_at"#,
        )
        .bind(id)
        .bind(name)
        .bind(plan)
        .bind(Json(settings))
        .bind(Utc::now())
        .fetch_one(pool)
        .await
    }

    pub async fn delete(pool: &SqlitePool, id: Uuid) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM organizations WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }
}
