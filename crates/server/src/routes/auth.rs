use axum::{
    Extension, Json, Router,
    extract::State,
    http::StatusCode,
    response::Json as ResponseJson,
    routing::{get, post},
};
use db::models::{
    organization::{CreateOrganization, Organization, Plan},
    user::{CreateUser, User, UserRole},
};
use serde::{Deserialize, Serialize};
use tracing::info;
use utils::response::ApiResponse;

use crate::{
    AppState,
    auth::{IssuedToken, MIN_PASSWORD_LEN, RequestContext, hash_password, verify_password},
    error::ApiError,
};

#[derive(Debug, Deserialize)]
pub struct SignupRequest {
    pub organization_name: String,
    pub name: String,
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub plan: Plan,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub token: IssuedToken,
    pub user: User,
    pub organization: Organization,
}

#[derive(Debug, Serialize)]
pub struct MeResponse {
    pub user: User,
    pub organization: Organization,
}

pub(crate) fn validate_email(email: &str) -> Result<(), ApiError> {
    let email = email.trim();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(()),
        _ => Err(ApiError::validation("email", "must be a valid email address")),
    }
}

pub(crate) fn validate_password(password: &str) -> Result<(), ApiError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ApiError::validation(
            "password",
            format!("must be at least {MIN_PASSWORD_LEN} characters"),
        ));
    }
    Ok(())
}

pub(crate) fn require_non_empty(field: &'static str, value: &str) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        return Err(ApiError::validation(field, "must not be empty"));
    }
    Ok(())
}

pub async fn signup(
    State(state): State<AppState>,
    Json(payload): Json<SignupRequest>,
) -> Result<(StatusCode, ResponseJson<ApiResponse<SessionResponse>>), ApiError> {
    require_non_empty("organization_name", &payload.organization_name)?;
    require_non_empty("name", &payload.name)?;
    validate_email(&payload.email)?;
    validate_password(&payload.password)?;

    let pool = &state.db.pool;
    if User::find_by_email(pool, &payload.email).await?.is_some() {
        return Err(ApiError::Conflict(
            "an account with this email already exists".to_string(),
        ));
    }

    let password_hash = hash_password(&payload.password)?;
    let organization = Organization::create(
        pool,
        &CreateOrganization {
            name: payload.organization_name,
            plan: payload.plan,
        },
    )
    .await?;

    let user = match User::create(
        pool,
        &CreateUser {
            organization_id: organization.id,
            email: payload.email,
            name: payload.name,
            role: UserRole::Owner,
            password_hash,
        },
    )
    .await
    {
        Ok(user) => user,
        Err(e) => {
            // Lost a race on the email; do not leave an empty organization behind
            Organization::delete(pool, organization.id).await?;
            if db::is_unique_violation(&e) {
                return Err(ApiError::Conflict(
                    "an account with this email already exists".to_string(),
                ));
            }
            return Err(e.into());
        }
    };

    let token = state.jwt.issue(&user)?;
    info!(organization_id = %organization.id, user_id = %user.id, "Organization signed up");

    Ok((
        StatusCode::CREATED,
        ResponseJson(ApiResponse::success(SessionResponse {
            token,
            user,
            organization,
        })),
    ))
}

pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> Result<ResponseJson<ApiResponse<SessionResponse>>, ApiError> {
    let pool = &state.db.pool;
    let user = User::find_by_email(pool, &payload.email)
        .await?
        .filter(|user| verify_password(&payload.password, &user.password_hash))
        .ok_or(ApiError::Unauthorized)?;

    let organization = Organization::find_by_id(pool, user.organization_id)
        .await?
        .ok_or(ApiError::Unauthorized)?;

    User::touch_login(pool, user.id).await?;
    let token = state.jwt.issue(&user)?;

    Ok(ResponseJson(ApiResponse::success(SessionResponse {
        token,
        user,
        organization,
    })))
}

pub async fn me(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
) -> Result<ResponseJson<ApiResponse<MeResponse>>, ApiError> {
    let organization = Organization::find_by_id(&state.db.pool, ctx.organization_id())
        .await?
        .ok_or_else(|| ApiError::not_found("organization"))?;

    Ok(ResponseJson(ApiResponse::success(MeResponse {
        user: ctx.user,
        organization,
    })))
}

pub fn public_router() -> Router<AppState> {
    Router::new()
        .route("/auth/signup", post(signup))
        .route("/auth/login", post(login))
}

pub fn protected_router() -> Router<AppState> {
    Router::new().route("/auth/me", get(me))
}
