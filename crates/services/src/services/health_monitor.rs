use std::time::Duration;

use chrono::{DateTime, Utc};
use db::{
    DBService,
    models::integration::{Integration, IntegrationStatus},
};
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use thiserror::Error;
use tokio::{task::JoinHandle, time::interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::services::oauth_connection::OAuthConnectionService;

/// Consecutive failed checks before an active integration is flagged.
pub const FAILURE_THRESHOLD: i64 = 3;

#[derive(Debug, Error)]
pub enum HealthMonitorError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// Stored under `integrations.metadata.health`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checked_at: DateTime<Utc>,
    pub consecutive_failures: i64,
    pub last_error: Option<String>,
}

impl HealthReport {
    fn previous(integration: &Integration) -> Option<Self> {
        integration
            .metadata
            .0
            .get("health")
            .and_then(|health| serde_json::from_value(health.clone()).ok())
    }
}

/// Periodically probes every connected integration with a cheap API call.
#[derive(Clone)]
pub struct HealthMonitorService {
    db: DBService,
    connections: OAuthConnectionService,
    poll_interval: Duration,
}

impl HealthMonitorService {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5 * 60);

    pub fn new(db: DBService, connections: OAuthConnectionService) -> Self {
        Self {
            db,
            connections,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.start(cancel).await;
        })
    }

    async fn start(&self, cancel: CancellationToken) {
        info!(
            "Starting integration health monitor with interval {:?}",
            self.poll_interval
        );

        // First tick fires immediately
        let mut interval = interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Integration health monitor stopped");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.check_all().await {
                        error!("Error checking integration health: {}", e);
                    }
                }
            }
        }
    }

    /// Check every active or errored integration. Returns how many were checked.
    pub async fn check_all(&self) -> Result<usize, HealthMonitorError> {
        let integrations = Integration::list_active(&self.db.pool).await?;
        if integrations.is_empty() {
            debug!("No connected integrations to check");
            return Ok(0);
        }

        for integration in &integrations {
            if let Err(e) = self.check_one(integration).await {
                warn!(
                    integration_id = %integration.id,
                    provider = %integration.provider,
                    "Error recording integration health: {}",
                    e
                );
            }
        }
        Ok(integrations.len())
    }

    /// Probe one integration, record the report and apply status transitions.
    pub async fn check_one(
        &self,
        integration: &Integration,
    ) -> Result<HealthReport, HealthMonitorError> {
        let previous = HealthReport::previous(integration);
        let outcome = self.probe(integration).await;

        let report = match outcome {
            Ok(()) => HealthReport {
                status: HealthStatus::Healthy,
                checked_at: Utc::now(),
                consecutive_failures: 0,
                last_error: None,
            },
            Err(message) => HealthReport {
                status: HealthStatus::Unhealthy,
                checked_at: Utc::now(),
                consecutive_failures: previous.map_or(0, |p| p.consecutive_failures) + 1,
                last_error: Some(message),
            },
        };

        let value = serde_json::to_value(&report).unwrap_or_default();
        Integration::set_metadata(&self.db.pool, integration.id, "health", &value).await?;

        // Status is re-read because a failed credential refresh may have changed it
        let current = Integration::find_by_id(&self.db.pool, integration.id)
            .await?
            .map_or(integration.status, |i| i.status);

        match report.status {
            HealthStatus::Healthy if current == IntegrationStatus::Error => {
                Integration::set_status(&self.db.pool, integration.id, IntegrationStatus::Active)
                    .await?;
                info!(integration_id = %integration.id, "Integration recovered");
            }
            HealthStatus::Unhealthy
                if current == IntegrationStatus::Active
                    && report.consecutive_failures >= FAILURE_THRESHOLD =>
            {
                Integration::set_status(&self.db.pool, integration.id, IntegrationStatus::Error)
                    .await?;
                warn!(
                    integration_id = %integration.id,
                    failures = report.consecutive_failures,
                    "Integration marked as errored after repeated health check failures"
                );
            }
            HealthStatus::Unhealthy => {
                debug!(
                    integration_id = %integration.id,
                    failures = report.consecutive_failures,
                    error = ?report.last_error,
                    "Integration health check failed"
                );
            }
            HealthStatus::Healthy => {}
        }

        Ok(report)
    }

    async fn probe(&self, integration: &Integration) -> Result<(), String> {
        let provider = self
            .connections
            .registry()
            .get(integration.provider)
            .ok_or_else(|| format!("{} integration is not configured", integration.provider))?;

        let credentials = self
            .connections
            .credentials(integration)
            .await
            .map_err(|e| e.to_string())?;

        provider
            .health_check(&credentials, &integration.settings.0)
            .await
            .map_err(|e| e.to_string())
    }
}
