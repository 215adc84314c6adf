use axum::{
    Extension, Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json as ResponseJson,
    routing::get,
};
use db::models::{
    ListParams,
    feedback::{
        CreateFeedback, Feedback, FeedbackFilter, FeedbackPriority, FeedbackSource,
        FeedbackStatus, UpdateFeedback,
    },
};
use serde::Deserialize;
use tracing::warn;
use utils::response::ApiResponse;
use uuid::Uuid;

use crate::{
    AppState,
    auth::RequestContext,
    error::ApiError,
    routes::{auth::require_non_empty, customers::find_customer},
};

#[derive(Debug, Default, Deserialize)]
pub struct FeedbackQuery {
    pub status: Option<FeedbackStatus>,
    pub source: Option<FeedbackSource>,
    pub priority: Option<FeedbackPriority>,
    pub customer_id: Option<Uuid>,
    pub search: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn list_feedback(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Query(query): Query<FeedbackQuery>,
) -> Result<ResponseJson<ApiResponse<Vec<Feedback>>>, ApiError> {
    let filter = FeedbackFilter {
        status: query.status,
        source: query.source,
        priority: query.priority,
        customer_id: query.customer_id,
        search: query.search,
    };
    let params = ListParams {
        limit: query.limit,
        offset: query.offset,
    };
    let feedback = Feedback::list(&state.db.pool, ctx.organization_id(), &filter, params).await?;
    Ok(ResponseJson(ApiResponse::success(feedback)))
}

pub async fn create_feedback(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Json(payload): Json<CreateFeedback>,
) -> Result<(StatusCode, ResponseJson<ApiResponse<Feedback>>), ApiError> {
    require_non_empty("title", &payload.title)?;
    if payload.source.is_external() {
        return Err(ApiError::validation(
            "source",
            "feedback from integrations is created by webhooks",
        ));
    }
    if let Some(metadata) = &payload.metadata
        && !metadata.is_object()
    {
        return Err(ApiError::validation("metadata", "must be a JSON object"));
    }
    if let Some(customer_id) = payload.customer_id {
        find_customer(&state, &ctx, customer_id).await?;
    }

    let feedback = Feedback::create(&state.db.pool, ctx.organization_id(), &payload).await?;
    Ok((
        StatusCode::CREATED,
        ResponseJson(ApiResponse::success(feedback)),
    ))
}

pub async fn get_feedback(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(feedback_id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<Feedback>>, ApiError> {
    let feedback = find_feedback(&state, &ctx, feedback_id).await?;
    Ok(ResponseJson(ApiResponse::success(feedback)))
}

/// A status change on feedback that came from an integration is pushed back
/// to the source system.
pub async fn update_feedback(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(feedback_id): Path<Uuid>,
    Json(payload): Json<UpdateFeedback>,
) -> Result<ResponseJson<ApiResponse<Feedback>>, ApiError> {
    let existing = find_feedback(&state, &ctx, feedback_id).await?;
    if let Some(title) = &payload.title {
        require_non_empty("title", title)?;
    }
    if let Some(Some(customer_id)) = payload.customer_id {
        find_customer(&state, &ctx, customer_id).await?;
    }

    let pool = &state.db.pool;
    let mut feedback = Feedback::update(pool, ctx.organization_id(), existing.id, &payload).await?;

    if feedback.status != existing.status && feedback.source.is_external() {
        match state.processor.sync_feedback(&feedback).await {
            Ok(Some(_)) => {
                // Pick up the pending sync state written by the processor
                if let Some(refreshed) =
                    Feedback::find_by_id(pool, ctx.organization_id(), feedback.id).await?
                {
                    feedback = refreshed;
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(feedback_id = %feedback.id, "Failed to queue outbound sync: {}", e);
            }
        }
    }

    Ok(ResponseJson(ApiResponse::success(feedback)))
}

pub async fn delete_feedback(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(feedback_id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    let rows_affected =
        Feedback::delete(&state.db.pool, ctx.organization_id(), feedback_id).await?;
    if rows_affected == 0 {
        Err(ApiError::not_found("feedback"))
    } else {
        Ok(ResponseJson(ApiResponse::success(())))
    }
}

async fn find_feedback(
    state: &AppState,
    ctx: &RequestContext,
    id: Uuid,
) -> Result<Feedback, ApiError> {
    Feedback::find_by_id(&state.db.pool, ctx.organization_id(), id)
        .await?
        .ok_or_else(|| ApiError::not_found("feedback"))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/feedback", get(list_feedback).post(create_feedback))
        .route(
            "/feedback/{feedback_id}",
            get(get_feedback)
                .patch(update_feedback)
                .delete(delete_feedback),
        )
}
