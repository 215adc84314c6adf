use axum::{
    Extension, Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::Json as ResponseJson,
    routing::get,
};
use db::models::user::{CreateUser, UpdateUser, User, UserRole};
use serde::Deserialize;
use tracing::info;
use utils::response::ApiResponse;
use uuid::Uuid;

use crate::{
    AppState,
    auth::{RequestContext, hash_password},
    error::ApiError,
    routes::auth::{require_non_empty, validate_email, validate_password},
};

#[derive(Debug, Deserialize)]
pub struct InviteUser {
    pub email: String,
    pub name: String,
    pub password: String,
    #[serde(default)]
    pub role: UserRole,
}

const LAST_OWNER: &str = "an organization must keep at least one owner";

pub async fn list_users(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
) -> Result<ResponseJson<ApiResponse<Vec<User>>>, ApiError> {
    let users = User::list_by_organization(&state.db.pool, ctx.organization_id()).await?;
    Ok(ResponseJson(ApiResponse::success(users)))
}

pub async fn get_user(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(user_id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<User>>, ApiError> {
    let user = find_user(&state, &ctx, user_id).await?;
    Ok(ResponseJson(ApiResponse::success(user)))
}

pub async fn create_user(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Json(payload): Json<InviteUser>,
) -> Result<(StatusCode, ResponseJson<ApiResponse<User>>), ApiError> {
    ctx.require_manager()?;
    require_non_empty("name", &payload.name)?;
    validate_email(&payload.email)?;
    validate_password(&payload.password)?;
    if payload.role == UserRole::Owner && ctx.user.role != UserRole::Owner {
        return Err(ApiError::Forbidden(
            "only owners can grant the owner role".to_string(),
        ));
    }

    let pool = &state.db.pool;
    if User::find_by_email(pool, &payload.email).await?.is_some() {
        return Err(ApiError::Conflict(
            "an account with this email already exists".to_string(),
        ));
    }

    let user = User::create(
        pool,
        &CreateUser {
            organization_id: ctx.organization_id(),
            email: payload.email,
            name: payload.name,
            role: payload.role,
            password_hash: hash_password(&payload.password)?,
        },
    )
    .await?;

    info!(organization_id = %user.organization_id, user_id = %user.id, role = %user.role, "User added");
    Ok((StatusCode::CREATED, ResponseJson(ApiResponse::success(user))))
}

pub async fn update_user(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(user_id): Path<Uuid>,
    Json(payload): Json<UpdateUser>,
) -> Result<ResponseJson<ApiResponse<User>>, ApiError> {
    let target = find_user(&state, &ctx, user_id).await?;

    // Members may edit their own profile but not roles
    if target.id != ctx.user.id || payload.role.is_some() {
        ctx.require_manager()?;
    }
    if let Some(name) = &payload.name {
        require_non_empty("name", name)?;
    }
    if let Some(email) = &payload.email {
        validate_email(email)?;
        if let Some(existing) = User::find_by_email(&state.db.pool, email).await?
            && existing.id != target.id
        {
            return Err(ApiError::Conflict(
                "an account with this email already exists".to_string(),
            ));
        }
    }
    if let Some(role) = payload.role {
        if (role == UserRole::Owner || target.role == UserRole::Owner)
            && ctx.user.role != UserRole::Owner
        {
            return Err(ApiError::Forbidden(
                "only owners can change the owner role".to_string(),
            ));
        }
        if target.role == UserRole::Owner
            && role != UserRole::Owner
            && User::count_owners(&state.db.pool, ctx.organization_id()).await? <= 1
        {
            return Err(ApiError::Conflict(LAST_OWNER.to_string()));
        }
    }

    let user = User::update(&state.db.pool, target.id, &payload).await?;
    Ok(ResponseJson(ApiResponse::success(user)))
}

pub async fn delete_user(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(user_id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    ctx.require_manager()?;
    let target = find_user(&state, &ctx, user_id).await?;

    if target.role == UserRole::Owner {
        if ctx.user.role != UserRole::Owner {
            return Err(ApiError::Forbidden(
                "only owners can remove an owner".to_string(),
            ));
        }
        if User::count_owners(&state.db.pool, ctx.organization_id()).await? <= 1 {
            return Err(ApiError::Conflict(LAST_OWNER.to_string()));
        }
    }

    User::delete(&state.db.pool, target.id).await?;
    info!(organization_id = %target.organization_id, user_id = %target.id, "User removed");
    Ok(ResponseJson(ApiResponse::success(())))
}

async fn find_user(state: &AppState, ctx: &RequestContext, id: Uuid) -> Result<User, ApiError> {
    User::find_in_organization(&state.db.pool, ctx.organization_id(), id)
        .await?
        .ok_or_else(|| ApiError::not_found("user"))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/users", get(list_users).post(create_user))
        .route(
            "/users/{user_id}",
            get(get_user).patch(update_user).delete(delete_user),
        )
}
