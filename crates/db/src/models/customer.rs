use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, SqlitePool, types::Json};
use thiserror::Error;
use uuid::Uuid;

use super::{ListParams, user::normalize_email};

/// An end customer of a tenant: the person who gave the feedback.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Customer {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub email: Option<String>,
    pub name: Option<String>,
    pub company: Option<String>,
    /// External identities keyed by provider (`slack`, `zendesk`, `intercom`).
    pub external_ids: Json<BTreeMap<String, String>>,
    pub metadata: Json<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateCustomer {
    pub email: Option<String>,
    pub name: Option<String>,
    pub company: Option<String>,
    #[serde(default)]
    pub external_ids: BTreeMap<String, String>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateCustomer {
    pub email: Option<String>,
    pub name: Option<String>,
    pub company: Option<String>,
    pub metadata: Option<Value>,
}

#[derive(Debug, Error)]
pub enum CustomerError {
    #[error("customer not found")]
    NotFound,
    #[error("a customer with email '{0}' already exists in this organization")]
    DuplicateEmail(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

const CUSTOMER_COLUMNS: &str =
    "id, organization_id, email, name, company, external_ids, metadata, created_at, updated_at";

fn map_conflict(err: sqlx::Error, email: Option<&str>) -> CustomerError {
    if crate::is_unique_violation(&err) {
        return CustomerError::DuplicateEmail(email.unwrap_or_default().to_string());
    }
    CustomerError::Database(err)
}

fn clean(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

impl Customer {
    pub async fn find_by_id(
        pool: &SqlitePool,
        organization_id: Uuid,
        id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Customer>(&format!(
            "SELECT {CUSTOMER_COLUMNS} FROM customers WHERE id = $1 AND organization_id = $2"
        ))
        .bind(id)
        .bind(organization_id)
        .fetch_optional(pool)
        .await
    }

    /// Case-insensitive email lookup within an organization.
    pub async fn find_by_email(
        pool: &SqlitePool,
        organization_id: Uuid,
        email: &str,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Customer>(&format!(
            "SELECT {CUSTOMER_COLUMNS} FROM customers WHERE organization_id = $1 AND email = $2"
        ))
        .bind(organization_id)
        .bind(normalize_email(email))
        .fetch_optional(pool)
        .await
    }

    pub async fn find_by_external_id(
        pool: &SqlitePool,
        organization_id: Uuid,
        provider: &str,
        external_id: &str,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Customer>(&format!(
            r#"SELECT {CUSTOMER_COLUMNS} FROM customers
               WHERE organization_id = $1
                 AND json_extract(external_ids, '$.' || $2) = $3
               LIMIT 1"#
        ))
        .bind(organization_id)
        .bind(provider)
        .bind(external_id)
        .fetch_optional(pool)
        .await
    }

    /// List customers, optionally filtered by a substring of name, email or company.
    pub async fn list(
        pool: &SqlitePool,
        organization_id: Uuid,
        search: Option<&str>,
        params: ListParams,
    ) -> Result<Vec<Self>, sqlx::Error> {
        let pattern = clean(search).map(|s| format!("%{s}%"));
        sqlx::query_as::<_, Customer>(&format!(
            r#"SELECT {CUSTOMER_COLUMNS} FROM customers
               WHERE organization_id = $1
                 AND ($2 IS NULL OR name LIKE $2 OR email LIKE $2 OR company LIKE $2)
               ORDER BY created_at DESC
               LIMIT $3 OFFSET $4"#
        ))
        .bind(organization_id)
        .bind(pattern)
        .bind(params.limit())
        .bind(params.offset())
        .fetch_all(pool)
        .await
    }

    pub async fn create(
        pool: &SqlitePool,
        organization_id: Uuid,
        data: &CreateCustomer,
    ) -> Result<Self, CustomerError> {
        let now = Utc::now();
        let email = clean(data.email.as_deref()).map(|e| normalize_email(&e));
        let metadata = data.metadata.clone().unwrap_or_else(|| Value::Object(Default::default()));

        sqlx::query_as::<_, Customer>(&format!(
            r#"INSERT INTO customers (id, organization_id, email, name, company, external_ids, metadata, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
               RETURNING {CUSTOMER_COLUMNS}"#
        ))
        .bind(Uuid::new_v4())
        .bind(organization_id)
        .bind(email.as_deref())
        .bind(clean(data.name.as_deref()))
        .bind(clean(data.company.as_deref()))
        .bind(Json(&data.external_ids))
        .bind(Json(&metadata))
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(|e| map_conflict(e, email.as_deref()))
    }

    pub async fn update(
        pool: &SqlitePool,
        organization_id: Uuid,
        id: Uuid,
        data: &UpdateCustomer,
    ) -> Result<Self, CustomerError> {
        let existing = Self::find_by_id(pool, organization_id, id)
            .await?
            .ok_or(CustomerError::NotFound)?;

        let email = match data.email.as_deref() {
            Some(email) => clean(Some(email)).map(|e| normalize_email(&e)),
            None => existing.email.clone(),
        };
        let name = match data.name.as_deref() {
            Some(name) => clean(Some(name)),
            None => existing.name.clone(),
        };
        let company = match data.company.as_deref() {
            Some(company) => clean(Some(company)),
            None => existing.company.clone(),
        };
        let metadata = data.metadata.as_ref().unwrap_or(&existing.metadata.0);

        sqlx::query_as::<_, Customer>(&format!(
            r#"UPDATE customers
               SET email = $3, name = $4, company = $5, metadata = $6, updated_at = $7
               WHERE id = $1 AND organization_id = $2
               RETURNING {CUSTOMER_COLUMNS}"#
        ))
        .bind(id)
        .bind(organization_id)
        .bind(email.as_deref())
        .bind(name)
        .bind(company)
        .bind(Json(metadata))
        .bind(Utc::now())
        .fetch_one(pool)
        .await
        .map_err(|e| map_conflict(e, email.as_deref()))
    }

    /// Record (or replace) the identity this customer has at `provider`.
    pub async fn set_external_id(
        pool: &SqlitePool,
        id: Uuid,
        provider: &str,
        external_id: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"UPDATE customers
               SET external_ids = json_set(external_ids, '$.' || $2, $3), updated_at = $4
               WHERE id = $1"#,
        )
        .bind(id)
        .bind(provider)
        .bind(external_id)
        .bind(Utc::now())
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Fill name and email only where they are still empty.
    pub async fn fill_missing(
        pool: &SqlitePool,
        id: Uuid,
        email: Option<&str>,
        name: Option<&str>,
    ) -> Result<(), CustomerError> {
        let email = clean(email).map(|e| normalize_email(&e));
        sqlx::query(
            r#"UPDATE customers
               SET email = COALESCE(email, $2), name = COALESCE(name, $3), updated_at = $4
               WHERE id = $1"#,
        )
        .bind(id)
        .bind(email.as_deref())
        .bind(clean(name))
        .bind(Utc::now())
        .execute(pool)
        .await
        .map_err(|e| map_conflict(e, email.as_deref()))?;
        Ok(())
    }

    pub async fn delete(
        pool: &SqlitePool,
        organization_id: Uuid,
        id: Uuid,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM customers WHERE id = $1 AND organization_id = $2")
            .bind(id)
            .bind(organization_id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }
}
