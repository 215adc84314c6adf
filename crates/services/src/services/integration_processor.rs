//! At-least-once pipeline for integration events.
//!
//! Inbound webhooks are verified, normalized and stored as
//! [`IntegrationEvent`]s before they are acknowledged; outbound status updates
//! are stored the same way. Every event is then processed on a tokio task and
//! retried on a fixed schedule when it fails with a transient error.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use db::{
    DBService,
    models::{
        customer::CustomerError,
        feedback::{Feedback, SourcedFeedback},
        integration::Integration,
        integration_event::{EventDirection, EventStatus, IntegrationEvent, NewIntegrationEvent},
    },
};
use reqwest::header::HeaderMap;
use secrecy::ExposeSecret;
use serde::Serialize;
use serde_json::{Value, json};
use strum_macros::Display;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::services::{
    customer_resolver::CustomerResolver,
    integrations::{
        InboundEvent, IntegrationProvider, OutboundUpdate, ProviderError, ProviderKind,
    },
    oauth_connection::{OAuthConnectionError, OAuthConnectionService},
};

/// Delays before the 2nd, 3rd and 4th attempt of a failing event.
pub const DEFAULT_RETRY_SCHEDULE: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(5),
    Duration::from_secs(15),
];

const FEEDBACK_STATUS_CHANGED: &str = "feedback.status_changed";

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("{0} integration is not configured")]
    NotConfigured(ProviderKind),
    #[error("integration not found")]
    IntegrationNotFound,
    #[error("{0} webhooks must be sent to /v1/webhooks/{0}/{{integration_id}}")]
    IntegrationIdRequired(ProviderKind),
    #[error("integration is not active")]
    IntegrationInactive,
    #[error("integration event not found")]
    EventNotFound,
    #[error("only failed events can be retried (event is {0})")]
    NotRetryable(EventStatus),
    #[error("invalid event payload: {0}")]
    Payload(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Connection(#[from] OAuthConnectionError),
    #[error(transparent)]
    Customer(#[from] CustomerError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl ProcessorError {
    /// Whether another attempt might succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ProcessorError::Provider(e) => e.is_transient(),
            ProcessorError::Connection(OAuthConnectionError::Provider(e)) => e.is_transient(),
            ProcessorError::Connection(OAuthConnectionError::Database(e))
            | ProcessorError::Customer(CustomerError::Database(e))
            | ProcessorError::Database(e) => !matches!(e, sqlx::Error::RowNotFound),
            _ => false,
        }
    }
}

/// Result of accepting a webhook delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestOutcome {
    /// Endpoint verification challenge to echo back.
    pub challenge: Option<String>,
    pub accepted: usize,
    pub duplicates: usize,
}

/// Outbound sync state kept in `feedback.metadata.sync`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SyncState {
    Pending,
    Synced,
    Failed,
}

#[derive(Clone)]
pub struct IntegrationProcessor {
    db: DBService,
    connections: OAuthConnectionService,
    resolver: CustomerResolver,
    retry_schedule: Arc<[Duration]>,
    cancel: CancellationToken,
}

impl IntegrationProcessor {
    pub fn new(
        db: DBService,
        connections: OAuthConnectionService,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            resolver: CustomerResolver::new(db.clone()),
            db,
            connections,
            retry_schedule: Arc::from(DEFAULT_RETRY_SCHEDULE.as_slice()),
            cancel,
        }
    }

    pub fn with_retry_schedule(mut self, schedule: Vec<Duration>) -> Self {
        self.retry_schedule = Arc::from(schedule);
        self
    }

    /// Maximum number of runs of a single event.
    pub fn max_attempts(&self) -> usize {
        self.retry_schedule.len() + 1
    }

    fn provider(&self, kind: ProviderKind) -> Result<Arc<dyn IntegrationProvider>, ProcessorError> {
        self.connections
            .registry()
            .get(kind)
            .ok_or(ProcessorError::NotConfigured(kind))
    }

    /// Accept a webhook delivery. Events are persisted before this returns;
    /// processing happens in the background.
    pub async fn ingest(
        &self,
        kind: ProviderKind,
        integration_id: Option<Uuid>,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<IngestOutcome, ProcessorError> {
        let provider = self.provider(kind)?;

        // Per-integration secrets can only be looked up from the URL
        let secret = match provider.signing_secret() {
            Some(secret) => Some(secret),
            None if integration_id.is_none() => {
                return Err(ProcessorError::IntegrationIdRequired(kind));
            }
            None => None,
        };
        if let Some(secret) = secret {
            provider.verify_webhook(headers, body, secret.expose_secret())?;
        }

        let envelope = provider.parse_webhook(body)?;
        if envelope.challenge.is_some() {
            return Ok(IngestOutcome {
                challenge: envelope.challenge,
                ..Default::default()
            });
        }

        let integration = match self
            .resolve_integration(kind, integration_id, envelope.account_id.as_deref())
            .await?
        {
            Some(integration) => integration,
            // Pings and other event-less notifications for unknown accounts
            None if envelope.events.is_empty() => return Ok(IngestOutcome::default()),
            None => return Err(ProcessorError::IntegrationNotFound),
        };

        if provider.signing_secret().is_none() {
            let secret = integration
                .webhook_secret
                .as_deref()
                .ok_or(ProviderError::InvalidSignature)?;
            provider.verify_webhook(headers, body, secret)?;
        }

        if !integration.is_enabled() {
            warn!(
                integration_id = %integration.id,
                status = %integration.status,
                "Rejected webhook for inactive integration"
            );
            return Err(ProcessorError::IntegrationInactive);
        }

        let mut outcome = IngestOutcome::default();
        for event in envelope.events {
            let payload =
                serde_json::to_value(&event).map_err(|e| ProcessorError::Payload(e.to_string()))?;
            let new_event = NewIntegrationEvent {
                integration_id: integration.id,
                organization_id: integration.organization_id,
                direction: EventDirection::Inbound,
                event_type: event.event_type,
                external_id: event.external_id,
                payload,
            };

            match IntegrationEvent::insert_if_absent(&self.db.pool, &new_event).await? {
                Some(stored) => {
                    outcome.accepted += 1;
                    self.schedule(stored.id, Duration::ZERO);
                }
                None => {
                    debug!(
                        integration_id = %integration.id,
                        external_id = %new_event.external_id,
                        "Dropping duplicate webhook delivery"
                    );
                    outcome.duplicates += 1;
                }
            }
        }

        info!(
            integration_id = %integration.id,
            provider = %kind,
            accepted = outcome.accepted,
            duplicates = outcome.duplicates,
            "Webhook ingested"
        );
        Ok(outcome)
    }

    async fn resolve_integration(
        &self,
        kind: ProviderKind,
        integration_id: Option<Uuid>,
        account_id: Option<&str>,
    ) -> Result<Option<Integration>, sqlx::Error> {
        if let Some(id) = integration_id {
            let integration = Integration::find_by_id(&self.db.pool, id).await?;
            return Ok(integration.filter(|i| i.provider == kind));
        }
        match account_id {
            Some(account_id) => {
                Integration::find_by_external_account(&self.db.pool, kind, account_id).await
            }
            None => Ok(None),
        }
    }

    /// Run `event_id` after `delay`, unless the processor is shut down first.
    pub fn schedule(&self, event_id: Uuid, delay: Duration) {
        let processor = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = processor.cancel.cancelled() => {
                    debug!(%event_id, "Processor shutting down, event left for resume");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            if let Err(e) = processor.process_event(event_id).await {
                error!(%event_id, error = %e, "Failed to process integration event");
            }
        });
    }

    /// Run one attempt of an event and record the outcome. Returns the status
    /// the event ended up in.
    pub async fn process_event(&self, event_id: Uuid) -> Result<EventStatus, ProcessorError> {
        let pool = &self.db.pool;
        let event = IntegrationEvent::find_by_id(pool, event_id)
            .await?
            .ok_or(ProcessorError::EventNotFound)?;

        if matches!(event.status, EventStatus::Completed | EventStatus::Failed) {
            debug!(%event_id, status = %event.status, "Event already settled");
            return Ok(event.status);
        }

        IntegrationEvent::mark_processing(pool, event.id).await?;

        let result = match event.direction {
            EventDirection::Inbound => self.apply_inbound(&event).await,
            EventDirection::Outbound => self.deliver_outbound(&event).await,
        };

        match result {
            Ok(()) => {
                IntegrationEvent::mark_completed(pool, event.id).await?;
                Integration::touch_synced(pool, event.integration_id).await?;
                if event.direction == EventDirection::Outbound {
                    self.record_sync(&event, SyncState::Synced, event.attempts + 1, None)
                        .await?;
                }
                debug!(%event_id, attempt = event.attempts + 1, "Integration event completed");
                Ok(EventStatus::Completed)
            }
            Err(err) => self.handle_failure(&event, err).await,
        }
    }

    async fn handle_failure(
        &self,
        event: &IntegrationEvent,
        err: ProcessorError,
    ) -> Result<EventStatus, ProcessorError> {
        let pool = &self.db.pool;
        let attempt = usize::try_from(event.attempts).unwrap_or(0) + 1;
        let message = err.to_string();

        if err.is_transient()
            && let Some(delay) = self.retry_schedule.get(attempt - 1).copied()
        {
            let next_retry_at =
                Utc::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
            let updated = IntegrationEvent::mark_retry(pool, event.id, &message, next_retry_at).await?;
            warn!(
                event_id = %event.id,
                integration_id = %event.integration_id,
                attempt,
                retry_in = ?delay,
                error = %message,
                "Integration event failed, retrying"
            );
            if event.direction == EventDirection::Outbound {
                self.record_sync(&updated, SyncState::Pending, updated.attempts, Some(&message))
                    .await?;
            }
            self.schedule(event.id, delay);
            return Ok(EventStatus::Pending);
        }

        let failed = IntegrationEvent::mark_failed(pool, event.id, &message).await?;
        error!(
            event_id = %event.id,
            integration_id = %event.integration_id,
            attempts = failed.attempts,
            error = %message,
            "Integration event failed permanently"
        );
        Integration::set_metadata(
            pool,
            event.integration_id,
            "last_error",
            &json!({
                "message": message,
                "event_id": event.id,
                "at": Utc::now(),
            }),
        )
        .await?;
        if event.direction == EventDirection::Outbound {
            self.record_sync(&failed, SyncState::Failed, failed.attempts, Some(&message))
                .await?;
        }
        Ok(EventStatus::Failed)
    }

    async fn apply_inbound(&self, event: &IntegrationEvent) -> Result<(), ProcessorError> {
        let inbound: InboundEvent = serde_json::from_value(event.payload.0.clone())
            .map_err(|e| ProcessorError::Payload(e.to_string()))?;
        let integration = Integration::find_by_id(&self.db.pool, event.integration_id)
            .await?
            .ok_or(ProcessorError::IntegrationNotFound)?;

        let customer = self
            .resolver
            .resolve(event.organization_id, &inbound.customer)
            .await?;

        let metadata = match inbound.feedback.metadata {
            Value::Null => json!({}),
            Value::Object(map) => Value::Object(map),
            other => json!({ "source": other }),
        };
        let sourced = SourcedFeedback {
            customer_id: customer.map(|c| c.id),
            title: inbound.feedback.title,
            content: inbound.feedback.content,
            source: integration.provider.into(),
            source_id: inbound.feedback.source_id,
            metadata,
        };

        let (feedback, created) =
            Feedback::upsert_from_source(&self.db.pool, event.organization_id, &sourced).await?;
        info!(
            feedback_id = %feedback.id,
            integration_id = %integration.id,
            created,
            "Applied inbound feedback"
        );
        Ok(())
    }

    async fn deliver_outbound(&self, event: &IntegrationEvent) -> Result<(), ProcessorError> {
        let update: OutboundUpdate = serde_json::from_value(event.payload.0.clone())
            .map_err(|e| ProcessorError::Payload(e.to_string()))?;
        let integration = Integration::find_by_id(&self.db.pool, event.integration_id)
            .await?
            .ok_or(ProcessorError::IntegrationNotFound)?;
        if !integration.is_enabled() {
            return Err(ProcessorError::IntegrationInactive);
        }

        let provider = self.provider(integration.provider)?;
        let credentials = self.connections.credentials(&integration).await?;
        provider
            .push_update(&credentials, &integration.settings.0, &update)
            .await?;
        Ok(())
    }

    /// Queue a status update for the system a feedback item came from. Returns
    /// `None` when there is nothing to sync or the same update is already queued.
    pub async fn sync_feedback(
        &self,
        feedback: &Feedback,
    ) -> Result<Option<IntegrationEvent>, ProcessorError> {
        let (Some(kind), Some(source_id)) = (feedback.source.provider(), feedback.source_id.as_deref())
        else {
            return Ok(None);
        };

        let integration =
            Integration::find_by_provider(&self.db.pool, feedback.organization_id, kind)
                .await?
                .filter(Integration::is_enabled);
        let Some(integration) = integration else {
            debug!(
                feedback_id = %feedback.id,
                provider = %kind,
                "No active integration, skipping outbound sync"
            );
            return Ok(None);
        };

        let update = OutboundUpdate {
            feedback_id: feedback.id,
            source_id: source_id.to_string(),
            title: feedback.title.clone(),
            status: feedback.status,
            message: OutboundUpdate::status_message(&feedback.title, feedback.status),
        };
        let payload =
            serde_json::to_value(&update).map_err(|e| ProcessorError::Payload(e.to_string()))?;

        let new_event = NewIntegrationEvent {
            integration_id: integration.id,
            organization_id: feedback.organization_id,
            direction: EventDirection::Outbound,
            event_type: FEEDBACK_STATUS_CHANGED.to_string(),
            external_id: format!(
                "{}:{}:{}",
                feedback.id,
                feedback.status,
                feedback.updated_at.timestamp_millis()
            ),
            payload,
        };

        let Some(event) = IntegrationEvent::insert_if_absent(&self.db.pool, &new_event).await?
        else {
            return Ok(None);
        };

        self.record_sync(&event, SyncState::Pending, 0, None).await?;
        self.schedule(event.id, Duration::ZERO);
        info!(
            feedback_id = %feedback.id,
            integration_id = %integration.id,
            status = %feedback.status,
            "Queued outbound status sync"
        );
        Ok(Some(event))
    }

    /// Write `metadata.sync` on the feedback an outbound event belongs to.
    async fn record_sync(
        &self,
        event: &IntegrationEvent,
        state: SyncState,
        attempts: i64,
        last_error: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        let Some(feedback_id) = event
            .payload
            .0
            .get("feedback_id")
            .and_then(Value::as_str)
            .and_then(|id| Uuid::parse_str(id).ok())
        else {
            return Ok(());
        };

        let Some(feedback) =
            Feedback::find_by_id(&self.db.pool, event.organization_id, feedback_id).await?
        else {
            return Ok(());
        };

        let last_synced_at = match state {
            SyncState::Synced => json!(Utc::now()),
            _ => feedback
                .metadata
                .0
                .pointer("/sync/last_synced_at")
                .cloned()
                .unwrap_or(Value::Null),
        };

        Feedback::set_sync_metadata(
            &self.db.pool,
            feedback.id,
            &json!({
                "status": state,
                "attempts": attempts,
                "last_error": last_error,
                "last_synced_at": last_synced_at,
            }),
        )
        .await
    }

    /// Re-schedule events whose timers died with a previous process.
    pub async fn resume_pending(&self) -> Result<usize, ProcessorError> {
        let events = IntegrationEvent::list_resumable(&self.db.pool).await?;
        let now = Utc::now();
        for event in &events {
            let delay = event
                .next_retry_at
                .and_then(|at| (at - now).to_std().ok())
                .unwrap_or(Duration::ZERO);
            self.schedule(event.id, delay);
        }
        if !events.is_empty() {
            info!(count = events.len(), "Resumed pending integration events");
        }
        Ok(events.len())
    }

    /// Give a failed event a fresh attempt budget and run it again.
    pub async fn retry_event(
        &self,
        organization_id: Uuid,
        event_id: Uuid,
    ) -> Result<IntegrationEvent, ProcessorError> {
        let event = IntegrationEvent::find_by_id(&self.db.pool, event_id)
            .await?
            .filter(|e| e.organization_id == organization_id)
            .ok_or(ProcessorError::EventNotFound)?;
        if event.status != EventStatus::Failed {
            return Err(ProcessorError::NotRetryable(event.status));
        }

        let event = IntegrationEvent::reset_for_retry(&self.db.pool, event.id).await?;
        info!(event_id = %event.id, integration_id = %event.integration_id, "Manual retry requested");
        self.schedule(event.id, Duration::ZERO);
        Ok(event)
    }
}
