//! Integration tests for the connection settings applied by `DBService`.

use db::DBService;
use sqlx::Row;
use tempfile::TempDir;

async fn setup_service() -> (DBService, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join("test.db");

    let service = DBService::new(&format!("sqlite://{}", db_path.to_string_lossy()))
        .await
        .expect("Failed to open database");

    (service, temp_dir)
}

#[tokio::test]
async fn test_database_file_is_created() {
    let (service, temp_dir) = setup_service().await;
    service.ping().await.expect("ping should succeed");
    assert!(temp_dir.path().join("test.db").exists());
}

#[tokio::test]
async fn test_sqlite_pragma_journal_mode_wal() {
    let (service, _temp_dir) = setup_service().await;

    let row = sqlx::query("PRAGMA journal_mode")
        .fetch_one(&service.pool)
        .await
        .expect("Failed to query journal_mode");

    let journal_mode: String = row.get(0);
    assert_eq!(journal_mode.to_lowercase(), "wal");
}

#[tokio::test]
async fn test_sqlite_pragma_synchronous_normal() {
    let (service, _temp_dir) = setup_service().await;

    let row = sqlx::query("PRAGMA synchronous")
        .fetch_one(&service.pool)
        .await
        .expect("Failed to query synchronous");

    let synchronous: i32 = row.get(0);
    // NORMAL = 1
    assert_eq!(synchronous, 1);
}

#[tokio::test]
async fn test_foreign_keys_enforced_on_all_connections() {
    let (service, _temp_dir) = setup_service().await;

    for i in 0..3 {
        let mut conn = service
            .pool
            .acquire()
            .await
            .expect("Failed to acquire connection");

        let row = sqlx::query("PRAGMA foreign_keys")
            .fetch_one(&mut *conn)
            .await
            .expect("Failed to query foreign_keys");

        let enabled: i32 = row.get(0);
        assert_eq!(enabled, 1, "Connection {i} should enforce foreign keys");
    }
}

#[tokio::test]
async fn test_sqlite_pragma_cache_size() {
    let (service, _temp_dir) = setup_service().await;

    let row = sqlx::query("PRAGMA cache_size")
        .fetch_one(&service.pool)
        .await
        .expect("Failed to query cache_size");

    let cache_size: i32 = row.get(0);
    assert_eq!(cache_size, -64000);
}
