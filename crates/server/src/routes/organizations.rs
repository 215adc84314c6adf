use axum::{
    Extension, Json, Router, extract::State, response::Json as ResponseJson, routing::get,
};
use db::models::organization::{Organization, UpdateOrganization};
use utils::response::ApiResponse;

use crate::{AppState, auth::RequestContext, error::ApiError, routes::auth::require_non_empty};

pub async fn get_organization(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
) -> Result<ResponseJson<ApiResponse<Organization>>, ApiError> {
    let organization = Organization::find_by_id(&state.db.pool, ctx.organization_id())
        .await?
        .ok_or_else(|| ApiError::not_found("organization"))?;
    Ok(ResponseJson(ApiResponse::success(organization)))
}

pub async fn update_organization(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Json(payload): Json<UpdateOrganization>,
) -> Result<ResponseJson<ApiResponse<Organization>>, ApiError> {
    ctx.require_manager()?;
    if let Some(name) = &payload.name {
        require_non_empty("name", name)?;
    }
    if let Some(settings) = &payload.settings
        && !settings.is_object()
    {
        return Err(ApiError::validation("settings", "must be a JSON object"));
    }

    let organization =
        Organization::update(&state.db.pool, ctx.organization_id(), &payload).await?;
    Ok(ResponseJson(ApiResponse::success(organization)))
}

pub fn router() -> Router<AppState> {
    Router::new().route(
        "/organization",
        get(get_organization).patch(update_organization),
    )
}
