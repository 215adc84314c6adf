use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Executor, FromRow, Sqlite, SqlitePool};

/// Status row written by the migration runner for every applied migration.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ExecutedMigration {
    pub name: String,
    pub checksum: String,
    pub executed_at: DateTime<Utc>,
    pub execution_time_ms: i64,
}

impl ExecutedMigration {
    pub async fn ensure_table(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS executed_migrations (
                name              TEXT PRIMARY KEY,
                checksum          TEXT NOT NULL,
                executed_at       TEXT NOT NULL,
                execution_time_ms INTEGER NOT NULL
            )"#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn find_all(pool: &SqlitePool) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, ExecutedMigration>(
            r#"SELECT name, checksum, executed_at, execution_time_ms
               FROM executed_migrations
               ORDER BY name ASC"#,
        )
        .fetch_all(pool)
        .await
    }

    pub async fn record<'e, E>(
        executor: E,
        name: &str,
        checksum: &str,
        executed_at: DateTime<Utc>,
        execution_time_ms: i64,
    ) -> Result<(), sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query(
            r#"INSERT INTO executed_migrations (name, checksum, executed_at, execution_time_ms)
               VALUES ($1, $2, $3, $4)"#,
        )
        .bind(name)
        .bind(checksum)
        .bind(executed_at)
        .bind(execution_time_ms)
        .execute(executor)
        .await?;
        Ok(())
    }

    pub async fn remove<'e, E>(executor: E, name: &str) -> Result<(), sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query("DELETE FROM executed_migrations WHERE name = $1")
            .bind(name)
            .execute(executor)
            .await?;
        Ok(())
    }
}
