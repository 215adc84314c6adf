mod common;

use std::time::Duration;

use chrono::Utc;
use db::models::{
    ListParams,
    customer::Customer,
    feedback::{CreateFeedback, Feedback, FeedbackSource, FeedbackStatus},
    integration::{Integration, ProviderKind},
    integration_event::{EventDirection, EventStatus, IntegrationEvent, NewIntegrationEvent},
};
use httpmock::prelude::*;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::json;
use services::services::{
    integration_processor::{IntegrationProcessor, ProcessorError},
    integrations::{ProviderError, StoredCredentials, slack, zendesk},
};
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use common::{
    Harness, SLACK_SIGNING_SECRET, ZENDESK_WEBHOOK_SECRET, connect_slack, connect_zendesk,
    harness,
};

const ZENDESK_TS: &str = "2025-03-01T12:00:00Z";

fn processor(h: &Harness) -> IntegrationProcessor {
    IntegrationProcessor::new(h.db.clone(), h.connections.clone(), CancellationToken::new())
        .with_retry_schedule(vec![Duration::from_millis(10); 3])
}

fn zendesk_headers(body: &[u8], secret: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        "X-Zendesk-Webhook-Signature",
        HeaderValue::from_str(&zendesk::sign(secret, ZENDESK_TS, body).unwrap()).unwrap(),
    );
    headers.insert(
        "X-Zendesk-Webhook-Signature-Timestamp",
        HeaderValue::from_static(ZENDESK_TS),
    );
    headers
}

fn slack_headers(body: &[u8], timestamp: i64) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        "X-Slack-Request-Timestamp",
        HeaderValue::from_str(&timestamp.to_string()).unwrap(),
    );
    headers.insert(
        "X-Slack-Signature",
        HeaderValue::from_str(&slack::sign(SLACK_SIGNING_SECRET, timestamp, body).unwrap())
            .unwrap(),
    );
    headers
}

fn ticket_created_body() -> Vec<u8> {
    serde_json::to_vec(&json!({
        "id": "evt-ticket-42",
        "type": "zen:event-type:ticket.created",
        "account_id": 1234,
        "detail": {
            "id": 42,
            "subject": "Export to CSV",
            "description": "Please let us export reports as CSV.",
            "requester": { "id": 900, "email": "Jane@Example.com", "name": "Jane Doe" },
            "tags": ["reports"]
        }
    }))
    .unwrap()
}

async fn wait_for_status(pool: &SqlitePool, id: Uuid, status: EventStatus) -> IntegrationEvent {
    for _ in 0..200 {
        let event = IntegrationEvent::find_by_id(pool, id).await.unwrap().unwrap();
        if event.status == status {
            return event;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("event {id} never reached {status}");
}

async fn only_event(pool: &SqlitePool, integration: &Integration) -> IntegrationEvent {
    let events =
        IntegrationEvent::list_for_integration(pool, integration.id, None, ListParams::default())
            .await
            .unwrap();
    assert_eq!(events.len(), 1);
    events.into_iter().next().unwrap()
}

async fn sourced_feedback(h: &Harness, status: FeedbackStatus) -> Feedback {
    Feedback::create(
        &h.db.pool,
        h.org.id,
        &CreateFeedback {
            title: "Export to CSV".to_string(),
            content: "Please let us export reports as CSV.".to_string(),
            source: FeedbackSource::Zendesk,
            source_id: Some("42".to_string()),
            status,
            ..Default::default()
        },
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn zendesk_ticket_becomes_feedback_once() {
    let server = MockServer::start_async().await;
    let h = harness(&server).await;
    let integration = connect_zendesk(&h, &StoredCredentials::bearer("zd")).await;
    let processor = processor(&h);

    let body = ticket_created_body();
    let headers = zendesk_headers(&body, ZENDESK_WEBHOOK_SECRET);

    let outcome = processor
        .ingest(ProviderKind::Zendesk, Some(integration.id), &headers, &body)
        .await
        .unwrap();
    assert_eq!(outcome.accepted, 1);
    assert_eq!(outcome.duplicates, 0);
    assert!(outcome.challenge.is_none());

    let event = only_event(&h.db.pool, &integration).await;
    assert_eq!(event.direction, EventDirection::Inbound);
    assert_eq!(event.external_id, "evt-ticket-42");
    let event = wait_for_status(&h.db.pool, event.id, EventStatus::Completed).await;
    assert_eq!(event.attempts, 0);
    assert!(event.processed_at.is_some());

    let feedback = Feedback::find_by_source(&h.db.pool, h.org.id, FeedbackSource::Zendesk, "42")
        .await
        .unwrap()
        .expect("feedback created from ticket");
    assert_eq!(feedback.title, "Export to CSV");
    assert_eq!(feedback.status, FeedbackStatus::New);

    let customer = Customer::find_by_external_id(&h.db.pool, h.org.id, "zendesk", "900")
        .await
        .unwrap()
        .expect("customer resolved from requester");
    assert_eq!(feedback.customer_id, Some(customer.id));

    let synced = Integration::find_by_id(&h.db.pool, integration.id)
        .await
        .unwrap()
        .unwrap();
    assert!(synced.last_synced_at.is_some());

    // Redelivery of the same webhook is acknowledged and dropped
    let again = processor
        .ingest(ProviderKind::Zendesk, Some(integration.id), &headers, &body)
        .await
        .unwrap();
    assert_eq!(again.accepted, 0);
    assert_eq!(again.duplicates, 1);
    only_event(&h.db.pool, &integration).await;
}

#[tokio::test]
async fn ingest_rejects_bad_signatures_and_inactive_integrations() {
    let server = MockServer::start_async().await;
    let h = harness(&server).await;
    let integration = connect_zendesk(&h, &StoredCredentials::bearer("zd")).await;
    let processor = processor(&h);
    let body = ticket_created_body();

    let forged = zendesk_headers(&body, "wrong-secret");
    let result = processor
        .ingest(ProviderKind::Zendesk, Some(integration.id), &forged, &body)
        .await;
    assert!(matches!(
        result,
        Err(ProcessorError::Provider(ProviderError::InvalidSignature))
    ));

    let unknown = processor
        .ingest(
            ProviderKind::Zendesk,
            Some(Uuid::new_v4()),
            &zendesk_headers(&body, ZENDESK_WEBHOOK_SECRET),
            &body,
        )
        .await;
    assert!(matches!(unknown, Err(ProcessorError::IntegrationNotFound)));

    let without_id = processor
        .ingest(
            ProviderKind::Zendesk,
            None,
            &zendesk_headers(&body, ZENDESK_WEBHOOK_SECRET),
            &body,
        )
        .await;
    assert!(matches!(
        without_id,
        Err(ProcessorError::IntegrationIdRequired(ProviderKind::Zendesk))
    ));

    h.connections.disconnect(&integration).await.unwrap();
    let inactive = processor
        .ingest(
            ProviderKind::Zendesk,
            Some(integration.id),
            &zendesk_headers(&body, ZENDESK_WEBHOOK_SECRET),
            &body,
        )
        .await;
    assert!(matches!(inactive, Err(ProcessorError::IntegrationInactive)));

    let events =
        IntegrationEvent::list_for_integration(&h.db.pool, integration.id, None, ListParams::default())
            .await
            .unwrap();
    assert!(events.is_empty());
}

#[tokio::test]
async fn slack_challenge_and_messages() {
    let server = MockServer::start_async().await;
    let h = harness(&server).await;
    let integration = connect_slack(&h, "T0001").await;
    let processor = processor(&h);
    let now = Utc::now().timestamp();

    let challenge = br#"{"type":"url_verification","challenge":"3eZbrw1aBm2rZgRNFdxV2595E9CY3gmdALWMmHkvFXO7tYXAYM8P","token":"x"}"#;
    let outcome = processor
        .ingest(
            ProviderKind::Slack,
            None,
            &slack_headers(challenge, now),
            challenge,
        )
        .await
        .unwrap();
    assert_eq!(
        outcome.challenge.as_deref(),
        Some("3eZbrw1aBm2rZgRNFdxV2595E9CY3gmdALWMmHkvFXO7tYXAYM8P")
    );

    let message = serde_json::to_vec(&json!({
        "type": "event_callback",
        "team_id": "T0001",
        "event_id": "Ev01",
        "event": {
            "type": "message",
            "user": "U123",
            "channel": "C42",
            "text": "Dark mode would be great",
            "ts": "1700000000.000100"
        }
    }))
    .unwrap();

    let stale = processor
        .ingest(
            ProviderKind::Slack,
            None,
            &slack_headers(&message, now - 3600),
            &message,
        )
        .await;
    assert!(matches!(
        stale,
        Err(ProcessorError::Provider(ProviderError::StaleTimestamp))
    ));

    let outcome = processor
        .ingest(ProviderKind::Slack, None, &slack_headers(&message, now), &message)
        .await
        .unwrap();
    assert_eq!(outcome.accepted, 1);

    let event = only_event(&h.db.pool, &integration).await;
    wait_for_status(&h.db.pool, event.id, EventStatus::Completed).await;

    let feedback = Feedback::find_by_source(
        &h.db.pool,
        h.org.id,
        FeedbackSource::Slack,
        "C42:1700000000.000100",
    )
    .await
    .unwrap()
    .expect("feedback created from message");
    assert_eq!(feedback.content, "Dark mode would be great");
    assert!(feedback.customer_id.is_some());
}

#[tokio::test]
async fn outbound_sync_is_delivered_and_recorded() {
    let server = MockServer::start_async().await;
    let h = harness(&server).await;
    connect_zendesk(&h, &StoredCredentials::bearer("zd-access")).await;
    let processor = processor(&h);

    let comment = server
        .mock_async(|when, then| {
            when.method(PUT)
                .path("/api/v2/tickets/42.json")
                .header("authorization", "Bearer zd-access")
                .body_contains("is now planned");
            then.status(200).json_body(json!({ "ticket": { "id": 42 } }));
        })
        .await;

    let feedback = sourced_feedback(&h, FeedbackStatus::Planned).await;
    let event = processor
        .sync_feedback(&feedback)
        .await
        .unwrap()
        .expect("outbound event queued");
    assert_eq!(event.direction, EventDirection::Outbound);

    wait_for_status(&h.db.pool, event.id, EventStatus::Completed).await;
    comment.assert_async().await;

    let reloaded = Feedback::find_by_id(&h.db.pool, h.org.id, feedback.id)
        .await
        .unwrap()
        .unwrap();
    let sync = &reloaded.metadata.0["sync"];
    assert_eq!(sync["status"], "synced");
    assert_eq!(sync["attempts"], 1);
    assert!(sync["last_synced_at"].is_string());

    // The same status change is only queued once
    assert!(processor.sync_feedback(&feedback).await.unwrap().is_none());
}

#[tokio::test]
async fn outbound_sync_retries_transient_failures_then_fails() {
    let server = MockServer::start_async().await;
    let h = harness(&server).await;
    let integration = connect_zendesk(&h, &StoredCredentials::bearer("zd-access")).await;
    let processor = processor(&h);

    let unavailable = server
        .mock_async(|when, then| {
            when.method(PUT).path("/api/v2/tickets/42.json");
            then.status(503).body("maintenance");
        })
        .await;

    let feedback = sourced_feedback(&h, FeedbackStatus::InProgress).await;
    let event = processor.sync_feedback(&feedback).await.unwrap().unwrap();

    let failed = wait_for_status(&h.db.pool, event.id, EventStatus::Failed).await;
    assert_eq!(failed.attempts, 4);
    assert!(failed.last_error.unwrap().contains("503"));
    assert_eq!(unavailable.hits_async().await, 4);

    let reloaded = Feedback::find_by_id(&h.db.pool, h.org.id, feedback.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reloaded.metadata.0["sync"]["status"], "failed");
    assert_eq!(reloaded.metadata.0["sync"]["attempts"], 4);

    let integration = Integration::find_by_id(&h.db.pool, integration.id)
        .await
        .unwrap()
        .unwrap();
    assert!(integration.metadata.0["last_error"]["message"].is_string());
}

#[tokio::test]
async fn permanent_failures_are_not_retried_until_asked() {
    let server = MockServer::start_async().await;
    let h = harness(&server).await;
    connect_zendesk(&h, &StoredCredentials::bearer("zd-access")).await;
    let processor = processor(&h);

    let rejected = server
        .mock_async(|when, then| {
            when.method(PUT).path("/api/v2/tickets/42.json");
            then.status(422).body(r#"{"error":"RecordInvalid"}"#);
        })
        .await;

    let feedback = sourced_feedback(&h, FeedbackStatus::Completed).await;
    let event = processor.sync_feedback(&feedback).await.unwrap().unwrap();
    let failed = wait_for_status(&h.db.pool, event.id, EventStatus::Failed).await;
    assert_eq!(failed.attempts, 1);
    assert_eq!(rejected.hits_async().await, 1);

    let retried = processor.retry_event(h.org.id, event.id).await.unwrap();
    assert_eq!(retried.attempts, 0);
    assert_eq!(retried.status, EventStatus::Pending);
    wait_for_status(&h.db.pool, event.id, EventStatus::Failed).await;
    assert_eq!(rejected.hits_async().await, 2);

    let other_org = processor.retry_event(Uuid::new_v4(), event.id).await;
    assert!(matches!(other_org, Err(ProcessorError::EventNotFound)));
}

#[tokio::test]
async fn manual_feedback_is_not_synced() {
    let server = MockServer::start_async().await;
    let h = harness(&server).await;
    connect_zendesk(&h, &StoredCredentials::bearer("zd-access")).await;
    let processor = processor(&h);

    let feedback = Feedback::create(
        &h.db.pool,
        h.org.id,
        &CreateFeedback {
            title: "Typed in by support".to_string(),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert!(processor.sync_feedback(&feedback).await.unwrap().is_none());
}

#[tokio::test]
async fn resume_pending_processes_stored_events() {
    let server = MockServer::start_async().await;
    let h = harness(&server).await;
    let integration = connect_zendesk(&h, &StoredCredentials::bearer("zd")).await;

    let payload = json!({
        "external_id": "evt-7",
        "event_type": "ticket.created",
        "customer": { "provider": "zendesk", "external_id": null, "email": "sam@example.com", "name": "Sam" },
        "feedback": { "title": "Slow search", "content": "Search takes seconds", "source_id": "7", "metadata": {} }
    });
    let stored = IntegrationEvent::insert_if_absent(
        &h.db.pool,
        &NewIntegrationEvent {
            integration_id: integration.id,
            organization_id: h.org.id,
            direction: EventDirection::Inbound,
            event_type: "ticket.created".to_string(),
            external_id: "evt-7".to_string(),
            payload,
        },
    )
    .await
    .unwrap()
    .unwrap();

    let processor = processor(&h);
    assert_eq!(processor.resume_pending().await.unwrap(), 1);
    wait_for_status(&h.db.pool, stored.id, EventStatus::Completed).await;

    let feedback = Feedback::find_by_source(&h.db.pool, h.org.id, FeedbackSource::Zendesk, "7")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(feedback.title, "Slow search");
}
