use axum::{
    Extension, Json, Router,
    extract::{Path, Query, State},
    response::Json as ResponseJson,
    routing::{get, post},
};
use db::models::{
    ListParams,
    integration::{Integration, ProviderKind},
    integration_event::{EventStatus, IntegrationEvent},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use services::services::health_monitor::HealthReport;
use utils::response::ApiResponse;
use uuid::Uuid;

use crate::{AppState, auth::RequestContext, error::ApiError, routes::webhooks::webhook_url};

#[derive(Debug, Default, Deserialize)]
pub struct ConnectRequest {
    /// Provider specific input, e.g. `{"subdomain": "acme"}` for Zendesk.
    #[serde(default)]
    pub settings: Value,
}

#[derive(Debug, Serialize)]
pub struct ConnectResponse {
    pub provider: ProviderKind,
    pub authorize_url: String,
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EventQuery {
    pub status: Option<EventStatus>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// An integration plus what an admin needs to configure the provider side.
#[derive(Debug, Serialize)]
pub struct IntegrationDetails {
    #[serde(flatten)]
    pub integration: Integration,
    pub webhook_url: String,
    /// Only for providers that sign webhooks with a per-integration secret.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_secret: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ProviderSummary {
    pub provider: ProviderKind,
    pub configured: bool,
}

#[derive(Debug, Serialize)]
pub struct IntegrationList {
    pub integrations: Vec<Integration>,
    pub providers: Vec<ProviderSummary>,
}

pub(crate) fn parse_provider(raw: &str) -> Result<ProviderKind, ApiError> {
    raw.parse::<ProviderKind>()
        .map_err(|_| ApiError::NotFound(format!("unknown integration provider `{raw}`")))
}

fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::not_found("integration"))
}

async fn find_integration(
    state: &AppState,
    ctx: &RequestContext,
    raw_id: &str,
) -> Result<Integration, ApiError> {
    let id = parse_id(raw_id)?;
    Integration::find_for_org(&state.db.pool, ctx.organization_id(), id)
        .await?
        .ok_or_else(|| ApiError::not_found("integration"))
}

pub async fn list_integrations(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
) -> Result<ResponseJson<ApiResponse<IntegrationList>>, ApiError> {
    let integrations =
        Integration::list_by_organization(&state.db.pool, ctx.organization_id()).await?;
    let registry = state.connections.registry();
    let providers = [ProviderKind::Slack, ProviderKind::Zendesk, ProviderKind::Intercom]
        .into_iter()
        .map(|provider| ProviderSummary {
            provider,
            configured: registry.is_configured(provider),
        })
        .collect();

    Ok(ResponseJson(ApiResponse::success(IntegrationList {
        integrations,
        providers,
    })))
}

pub async fn get_integration(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(integration_id): Path<String>,
) -> Result<ResponseJson<ApiResponse<IntegrationDetails>>, ApiError> {
    let integration = find_integration(&state, &ctx, &integration_id).await?;
    let webhook_secret = match integration.provider {
        ProviderKind::Zendesk if ctx.user.role.can_manage() => integration.webhook_secret.clone(),
        _ => None,
    };
    let webhook_url = webhook_url(&state, &integration);

    Ok(ResponseJson(ApiResponse::success(IntegrationDetails {
        integration,
        webhook_url,
        webhook_secret,
    })))
}

pub async fn connect_integration(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(provider): Path<String>,
    Json(payload): Json<ConnectRequest>,
) -> Result<ResponseJson<ApiResponse<ConnectResponse>>, ApiError> {
    ctx.require_manager()?;
    let provider = parse_provider(&provider)?;
    let settings = match payload.settings {
        Value::Null => Value::Object(Default::default()),
        Value::Object(map) => Value::Object(map),
        _ => return Err(ApiError::validation("settings", "must be a JSON object")),
    };

    let url = state
        .connections
        .start(ctx.organization_id(), ctx.user.id, provider, settings)
        .await?;

    Ok(ResponseJson(ApiResponse::success(ConnectResponse {
        provider,
        authorize_url: url.to_string(),
    })))
}

/// OAuth redirect target. Authenticated by the single-use `state` parameter.
pub async fn oauth_callback(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<CallbackQuery>,
) -> Result<ResponseJson<ApiResponse<Integration>>, ApiError> {
    let provider = parse_provider(&provider)?;
    if let Some(error) = query.error {
        let detail = query.error_description.unwrap_or(error);
        return Err(ApiError::BadRequest(format!(
            "{provider} authorization was not granted: {detail}"
        )));
    }
    let (Some(code), Some(oauth_state)) = (query.code, query.state) else {
        return Err(ApiError::BadRequest(
            "callback requires `code` and `state`".to_string(),
        ));
    };

    let integration = state
        .connections
        .complete(provider, &oauth_state, &code)
        .await?;
    Ok(ResponseJson(ApiResponse::success_with_message(
        integration,
        format!("{provider} connected"),
    )))
}

pub async fn disconnect_integration(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(integration_id): Path<String>,
) -> Result<ResponseJson<ApiResponse<Integration>>, ApiError> {
    ctx.require_manager()?;
    let integration = find_integration(&state, &ctx, &integration_id).await?;
    let integration = state.connections.disconnect(&integration).await?;
    Ok(ResponseJson(ApiResponse::success(integration)))
}

pub async fn check_integration_health(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(integration_id): Path<String>,
) -> Result<ResponseJson<ApiResponse<HealthReport>>, ApiError> {
    ctx.require_manager()?;
    let integration = find_integration(&state, &ctx, &integration_id).await?;
    if !integration.is_enabled() {
        return Err(ApiError::Conflict(format!(
            "integration is {}",
            integration.status
        )));
    }
    let report = state.health.check_one(&integration).await?;
    Ok(ResponseJson(ApiResponse::success(report)))
}

pub async fn list_events(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(integration_id): Path<String>,
    Query(query): Query<EventQuery>,
) -> Result<ResponseJson<ApiResponse<Vec<IntegrationEvent>>>, ApiError> {
    let integration = find_integration(&state, &ctx, &integration_id).await?;
    let params = ListParams {
        limit: query.limit,
        offset: query.offset,
    };
    let events =
        IntegrationEvent::list_for_integration(&state.db.pool, integration.id, query.status, params)
            .await?;
    Ok(ResponseJson(ApiResponse::success(events)))
}

pub async fn retry_event(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path((integration_id, event_id)): Path<(String, Uuid)>,
) -> Result<ResponseJson<ApiResponse<IntegrationEvent>>, ApiError> {
    ctx.require_manager()?;
    let integration = find_integration(&state, &ctx, &integration_id).await?;
    let belongs = IntegrationEvent::find_by_id(&state.db.pool, event_id)
        .await?
        .is_some_and(|event| event.integration_id == integration.id);
    if !belongs {
        return Err(ApiError::not_found("integration event"));
    }

    let event = state
        .processor
        .retry_event(ctx.organization_id(), event_id)
        .await?;
    Ok(ResponseJson(ApiResponse::success(event)))
}

/// The second path segment is a provider name for the OAuth routes and an
/// integration id for the rest, so every route names it the same.
pub fn protected_router() -> Router<AppState> {
    Router::new()
        .route("/integrations", get(list_integrations))
        .route("/integrations/{integration}", get(get_integration))
        .route(
            "/integrations/{integration}/connect",
            post(connect_integration),
        )
        .route(
            "/integrations/{integration}/disconnect",
            post(disconnect_integration),
        )
        .route(
            "/integrations/{integration}/health",
            post(check_integration_health),
        )
        .route("/integrations/{integration}/events", get(list_events))
        .route(
            "/integrations/{integration}/events/{event_id}/retry",
            post(retry_event),
        )
}

pub fn public_router() -> Router<AppState> {
    Router::new().route("/integrations/{integration}/callback", get(oauth_callback))
}
