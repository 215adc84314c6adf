use axum::{
    Extension, Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json as ResponseJson,
    routing::get,
};
use db::models::{
    ListParams,
    customer::{CreateCustomer, Customer, CustomerError, UpdateCustomer},
    feedback::{Feedback, FeedbackFilter},
};
use serde::Deserialize;
use utils::response::ApiResponse;
use uuid::Uuid;

use crate::{AppState, auth::RequestContext, error::ApiError, routes::auth::validate_email};

#[derive(Debug, Default, Deserialize)]
pub struct CustomerQuery {
    pub search: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl From<&PageQuery> for ListParams {
    fn from(query: &PageQuery) -> Self {
        ListParams {
            limit: query.limit,
            offset: query.offset,
        }
    }
}

pub async fn list_customers(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Query(query): Query<CustomerQuery>,
) -> Result<ResponseJson<ApiResponse<Vec<Customer>>>, ApiError> {
    let params = ListParams {
        limit: query.limit,
        offset: query.offset,
    };
    let customers = Customer::list(
        &state.db.pool,
        ctx.organization_id(),
        query.search.as_deref(),
        params,
    )
    .await?;
    Ok(ResponseJson(ApiResponse::success(customers)))
}

pub async fn create_customer(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Json(payload): Json<CreateCustomer>,
) -> Result<(StatusCode, ResponseJson<ApiResponse<Customer>>), ApiError> {
    let has_email = payload.email.as_deref().is_some_and(|e| !e.trim().is_empty());
    let has_name = payload.name.as_deref().is_some_and(|n| !n.trim().is_empty());
    if !has_email && !has_name {
        return Err(ApiError::validation(
            "email",
            "a customer needs an email or a name",
        ));
    }
    if has_email && let Some(email) = &payload.email {
        validate_email(email)?;
    }

    let customer = Customer::create(&state.db.pool, ctx.organization_id(), &payload).await?;
    Ok((
        StatusCode::CREATED,
        ResponseJson(ApiResponse::success(customer)),
    ))
}

pub async fn get_customer(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(customer_id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<Customer>>, ApiError> {
    let customer = find_customer(&state, &ctx, customer_id).await?;
    Ok(ResponseJson(ApiResponse::success(customer)))
}

pub async fn update_customer(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(customer_id): Path<Uuid>,
    Json(payload): Json<UpdateCustomer>,
) -> Result<ResponseJson<ApiResponse<Customer>>, ApiError> {
    if let Some(email) = payload.email.as_deref()
        && !email.trim().is_empty()
    {
        validate_email(email)?;
    }
    let customer =
        Customer::update(&state.db.pool, ctx.organization_id(), customer_id, &payload).await?;
    Ok(ResponseJson(ApiResponse::success(customer)))
}

pub async fn delete_customer(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(customer_id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    let rows_affected =
        Customer::delete(&state.db.pool, ctx.organization_id(), customer_id).await?;
    if rows_affected == 0 {
        Err(CustomerError::NotFound.into())
    } else {
        Ok(ResponseJson(ApiResponse::success(())))
    }
}

pub async fn list_customer_feedback(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(customer_id): Path<Uuid>,
    Query(page): Query<PageQuery>,
) -> Result<ResponseJson<ApiResponse<Vec<Feedback>>>, ApiError> {
    let customer = find_customer(&state, &ctx, customer_id).await?;
    let filter = FeedbackFilter {
        customer_id: Some(customer.id),
        ..Default::default()
    };
    let feedback = Feedback::list(
        &state.db.pool,
        ctx.organization_id(),
        &filter,
        ListParams::from(&page),
    )
    .await?;
    Ok(ResponseJson(ApiResponse::success(feedback)))
}

pub(crate) async fn find_customer(
    state: &AppState,
    ctx: &RequestContext,
    id: Uuid,
) -> Result<Customer, ApiError> {
    Customer::find_by_id(&state.db.pool, ctx.organization_id(), id)
        .await?
        .ok_or_else(|| CustomerError::NotFound.into())
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/customers", get(list_customers).post(create_customer))
        .route(
            "/customers/{customer_id}",
            get(get_customer)
                .patch(update_customer)
                .delete(delete_customer),
        )
        .route(
            "/customers/{customer_id}/feedback",
            get(list_customer_feedback),
        )
}
