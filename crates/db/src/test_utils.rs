//! Test utilities for database tests.
//!
//! Every pool is backed by a fresh file in a temporary directory with the
//! crate's real migrations applied through [`Migrator`].

use std::{str::FromStr, time::Duration};

use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use tempfile::TempDir;

use crate::{Migrator, default_migrations_dir};

/// Create an empty database without running migrations.
///
/// Returns the pool and a TempDir that must be kept alive for the duration of the test.
pub async fn create_empty_pool() -> (SqlitePool, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create test temp dir");
    let db_path = temp_dir.path().join("test.db");

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path.display()))
        .expect("Invalid test database URL")
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect_with(options)
        .await
        .expect("Failed to create test pool");

    (pool, temp_dir)
}

/// Create a test database pool with migrations applied.
pub async fn create_test_pool() -> (SqlitePool, TempDir) {
    let (pool, temp_dir) = create_empty_pool().await;

    Migrator::load(default_migrations_dir())
        .expect("Failed to load migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    (pool, temp_dir)
}
