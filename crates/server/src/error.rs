use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use db::models::customer::CustomerError;
use services::services::{
    health_monitor::HealthMonitorError,
    integration_processor::ProcessorError,
    integrations::ProviderError,
    oauth_connection::OAuthConnectionError,
};
use thiserror::Error;
use utils::response::ApiResponse;

use crate::auth::{JwtError, PasswordError};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{field}: {message}")]
    Validation {
        field: &'static str,
        message: String,
    },
    #[error("authentication required")]
    Unauthorized,
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("rate limit exceeded, try again later")]
    RateLimited,
    #[error("integration provider error: {0}")]
    Provider(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        ApiError::Validation {
            field,
            message: message.into(),
        }
    }

    pub fn not_found(what: &str) -> Self {
        ApiError::NotFound(format!("{what} not found"))
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) | ApiError::Validation { .. } => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Provider(_) => StatusCode::BAD_GATEWAY,
            ApiError::Database(sqlx::Error::RowNotFound) => StatusCode::NOT_FOUND,
            ApiError::Database(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::Validation { .. } => "VALIDATION_ERROR",
            ApiError::Unauthorized => "UNAUTHORIZED",
            ApiError::Forbidden(_) => "FORBIDDEN",
            ApiError::NotFound(_) | ApiError::Database(sqlx::Error::RowNotFound) => "NOT_FOUND",
            ApiError::Conflict(_) => "CONFLICT",
            ApiError::RateLimited => "RATE_LIMITED",
            ApiError::Provider(_) => "PROVIDER_ERROR",
            ApiError::Database(_) => "DATABASE_ERROR",
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Message shown to clients. Internal details only go to the log.
    fn public_message(&self) -> String {
        match self {
            ApiError::Database(sqlx::Error::RowNotFound) => "record not found".to_string(),
            ApiError::Database(_) | ApiError::Internal(_) => {
                "internal server error".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, error_code = self.error_code(), "request failed");
        } else {
            tracing::debug!(error = %self, error_code = self.error_code(), "request rejected");
        }

        let body: ApiResponse<()> = ApiResponse::error(self.error_code(), self.public_message());
        (status, Json(body)).into_response()
    }
}

impl From<CustomerError> for ApiError {
    fn from(err: CustomerError) -> Self {
        match err {
            CustomerError::NotFound => ApiError::not_found("customer"),
            CustomerError::DuplicateEmail(_) => ApiError::Conflict(err.to_string()),
            CustomerError::Database(e) => ApiError::Database(e),
        }
    }
}

impl From<ProviderError> for ApiError {
    fn from(err: ProviderError) -> Self {
        if err.is_verification_failure() {
            return ApiError::Unauthorized;
        }
        match err {
            ProviderError::RateLimited => ApiError::RateLimited,
            ProviderError::MalformedPayload(_) => ApiError::BadRequest(err.to_string()),
            ProviderError::MissingSetting(name) | ProviderError::InvalidSetting { name, .. } => {
                ApiError::validation(name, err.to_string())
            }
            other => ApiError::Provider(other.to_string()),
        }
    }
}

impl From<OAuthConnectionError> for ApiError {
    fn from(err: OAuthConnectionError) -> Self {
        match err {
            OAuthConnectionError::NotConfigured(_)
            | OAuthConnectionError::InvalidState
            | OAuthConnectionError::ProviderMismatch { .. } => ApiError::BadRequest(err.to_string()),
            OAuthConnectionError::AccountInUse(_)
            | OAuthConnectionError::MissingCredentials
            | OAuthConnectionError::ReauthorizationRequired => ApiError::Conflict(err.to_string()),
            OAuthConnectionError::Provider(e) => e.into(),
            OAuthConnectionError::Crypto(e) => ApiError::Internal(e.to_string()),
            OAuthConnectionError::Database(e) => ApiError::Database(e),
        }
    }
}

impl From<ProcessorError> for ApiError {
    fn from(err: ProcessorError) -> Self {
        match err {
            ProcessorError::NotConfigured(_)
            | ProcessorError::IntegrationIdRequired(_)
            | ProcessorError::Payload(_) => {
                ApiError::BadRequest(err.to_string())
            }
            ProcessorError::IntegrationNotFound => ApiError::not_found("integration"),
            ProcessorError::EventNotFound => ApiError::not_found("integration event"),
            ProcessorError::IntegrationInactive | ProcessorError::NotRetryable(_) => {
                ApiError::Conflict(err.to_string())
            }
            ProcessorError::Provider(e) => e.into(),
            ProcessorError::Connection(e) => e.into(),
            ProcessorError::Customer(e) => e.into(),
            ProcessorError::Database(e) => ApiError::Database(e),
        }
    }
}

impl From<HealthMonitorError> for ApiError {
    fn from(err: HealthMonitorError) -> Self {
        match err {
            HealthMonitorError::Database(e) => ApiError::Database(e),
        }
    }
}

impl From<JwtError> for ApiError {
    fn from(err: JwtError) -> Self {
        match err {
            JwtError::Encode(e) => ApiError::Internal(e.to_string()),
            JwtError::Invalid | JwtError::Expired => ApiError::Unauthorized,
        }
    }
}

impl From<PasswordError> for ApiError {
    fn from(err: PasswordError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(
            ApiError::validation("email", "invalid").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::Database(sqlx::Error::RowNotFound).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::Database(sqlx::Error::PoolTimedOut).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ApiError::from(ProviderError::InvalidSignature).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::from(ProviderError::Timeout).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiError::from(ProcessorError::NotRetryable(
                db::models::integration_event::EventStatus::Completed
            ))
            .status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(CustomerError::DuplicateEmail("a@b.c".into())).status_code(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn internal_details_are_not_exposed() {
        let err = ApiError::Internal("cipher key mismatch".to_string());
        assert_eq!(err.public_message(), "internal server error");
        assert_eq!(err.error_code(), "INTERNAL_ERROR");
    }
}
