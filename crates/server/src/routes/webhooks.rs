use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::post,
};
use db::models::integration::{Integration, ProviderKind};
use serde_json::json;
use tracing::debug;
use utils::response::ApiResponse;
use uuid::Uuid;

use crate::{AppState, error::ApiError, routes::integrations::parse_provider};

/// Where the provider should deliver webhooks for `integration`. Zendesk
/// signs with a per-integration secret, so its URL names the integration.
pub fn webhook_url(state: &AppState, integration: &Integration) -> String {
    let base = format!(
        "{}/v1/webhooks/{}",
        state.config.public_base_url, integration.provider
    );
    match integration.provider {
        ProviderKind::Zendesk => format!("{base}/{}", integration.id),
        ProviderKind::Slack | ProviderKind::Intercom => base,
    }
}

pub async fn receive(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    handle(&state, &provider, None, &headers, &body).await
}

pub async fn receive_for_integration(
    State(state): State<AppState>,
    Path((provider, integration_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let integration_id =
        Uuid::parse_str(&integration_id).map_err(|_| ApiError::not_found("integration"))?;
    handle(&state, &provider, Some(integration_id), &headers, &body).await
}

async fn handle(
    state: &AppState,
    provider: &str,
    integration_id: Option<Uuid>,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, ApiError> {
    let kind = parse_provider(provider)?;
    let outcome = state
        .processor
        .ingest(kind, integration_id, headers, body)
        .await?;

    if let Some(challenge) = outcome.challenge {
        debug!(provider = %kind, "Answered webhook verification challenge");
        return Ok(Json(json!({ "challenge": challenge })).into_response());
    }

    Ok(Json(ApiResponse::success(outcome)).into_response())
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/webhooks/{provider}", post(receive))
        .route(
            "/webhooks/{provider}/{integration_id}",
            post(receive_for_integration),
        )
}
