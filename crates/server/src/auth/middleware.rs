use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::headers::{Authorization, HeaderMapExt, authorization::Bearer};
use db::models::user::User;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{AppState, error::ApiError};

/// Context for authenticated requests.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub user: User,
}

impl RequestContext {
    pub fn organization_id(&self) -> Uuid {
        self.user.organization_id
    }

    /// Owners and admins manage users and integrations.
    pub fn require_manager(&self) -> Result<(), ApiError> {
        if self.user.role.can_manage() {
            Ok(())
        } else {
            Err(ApiError::Forbidden(
                "this action requires the owner or admin role".to_string(),
            ))
        }
    }
}

pub async fn require_session(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let bearer = match req.headers().typed_get::<Authorization<Bearer>>() {
        Some(Authorization(token)) => token.token().to_owned(),
        None => return ApiError::Unauthorized.into_response(),
    };

    let claims = match state.jwt.decode(&bearer) {
        Ok(claims) => claims,
        Err(error) => {
            debug!(%error, "rejected access token");
            return ApiError::Unauthorized.into_response();
        }
    };

    let user = match User::find_in_organization(&state.db.pool, claims.org, claims.sub).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            warn!("user `{}` missing from organization `{}`", claims.sub, claims.org);
            return ApiError::Unauthorized.into_response();
        }
        Err(error) => return ApiError::Database(error).into_response(),
    };

    req.extensions_mut().insert(RequestContext { user });
    next.run(req).await
}
