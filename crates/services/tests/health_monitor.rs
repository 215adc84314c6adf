mod common;

use db::models::integration::{Integration, IntegrationStatus};
use httpmock::prelude::*;
use serde_json::json;
use services::services::{
    health_monitor::{FAILURE_THRESHOLD, HealthMonitorService, HealthStatus},
    integrations::StoredCredentials,
};

use common::{connect_zendesk, harness};

async fn reload(pool: &sqlx::SqlitePool, integration: &Integration) -> Integration {
    Integration::find_by_id(pool, integration.id)
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn repeated_failures_flip_to_error_and_success_recovers() {
    let server = MockServer::start_async().await;
    let h = harness(&server).await;
    let integration = connect_zendesk(&h, &StoredCredentials::bearer("zd-access")).await;
    let monitor = HealthMonitorService::new(h.db.clone(), h.connections.clone());

    let mut failing = server
        .mock_async(|when, then| {
            when.method(GET).path("/api/v2/users/me.json");
            then.status(401).json_body(json!({ "error": "invalid_token" }));
        })
        .await;

    for attempt in 1..=FAILURE_THRESHOLD {
        let current = reload(&h.db.pool, &integration).await;
        let report = monitor.check_one(&current).await.unwrap();
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(report.consecutive_failures, attempt);

        let expected = if attempt < FAILURE_THRESHOLD {
            IntegrationStatus::Active
        } else {
            IntegrationStatus::Error
        };
        assert_eq!(reload(&h.db.pool, &integration).await.status, expected);
    }

    let stored = reload(&h.db.pool, &integration).await;
    assert_eq!(stored.metadata.0["health"]["status"], "unhealthy");
    assert_eq!(stored.metadata.0["health"]["consecutive_failures"], 3);

    failing.delete_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/api/v2/users/me.json")
                .header("authorization", "Bearer zd-access");
            then.status(200).json_body(json!({ "user": { "id": 1 } }));
        })
        .await;

    let report = monitor.check_one(&stored).await.unwrap();
    assert_eq!(report.status, HealthStatus::Healthy);
    assert_eq!(report.consecutive_failures, 0);

    let recovered = reload(&h.db.pool, &integration).await;
    assert_eq!(recovered.status, IntegrationStatus::Active);
    assert_eq!(recovered.metadata.0["health"]["status"], "healthy");
}

#[tokio::test]
async fn check_all_skips_disconnected_integrations() {
    let server = MockServer::start_async().await;
    let h = harness(&server).await;
    let integration = connect_zendesk(&h, &StoredCredentials::bearer("zd-access")).await;
    let monitor = HealthMonitorService::new(h.db.clone(), h.connections.clone());

    let me = server
        .mock_async(|when, then| {
            when.method(GET).path("/api/v2/users/me.json");
            then.status(200).json_body(json!({ "user": { "id": 1 } }));
        })
        .await;

    assert_eq!(monitor.check_all().await.unwrap(), 1);
    assert_eq!(me.hits_async().await, 1);

    h.connections.disconnect(&integration).await.unwrap();
    assert_eq!(monitor.check_all().await.unwrap(), 0);
    assert_eq!(me.hits_async().await, 1);
}
