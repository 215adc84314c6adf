use axum::{
    Router,
    http::{HeaderName, Request},
    middleware::from_fn_with_state,
    routing::get,
};
use tower_http::{
    cors::CorsLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::{AppState, auth::require_session};

pub mod auth;
pub mod customers;
pub mod feedback;
pub mod health;
pub mod integrations;
pub mod organizations;
pub mod users;
pub mod webhooks;

const REQUEST_ID_HEADER: &str = "x-request-id";

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .merge(auth::protected_router())
        .merge(organizations::router())
        .merge(users::router())
        .merge(customers::router())
        .merge(feedback::router())
        .merge(integrations::protected_router())
        .layer(from_fn_with_state(state.clone(), require_session));

    let public = Router::new()
        .route("/health", get(health::health_check))
        .merge(auth::public_router())
        .merge(integrations::public_router())
        .merge(webhooks::router());

    let request_id = HeaderName::from_static(REQUEST_ID_HEADER);

    Router::new()
        .nest("/v1", public.merge(protected))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(PropagateRequestIdLayer::new(request_id.clone()))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
                let request_id = request
                    .headers()
                    .get(REQUEST_ID_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default();
                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    uri = %request.uri(),
                    request_id,
                )
            }),
        )
        .layer(SetRequestIdLayer::new(request_id, MakeRequestUuid))
}
