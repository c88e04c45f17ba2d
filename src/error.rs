//! Error handling for the analytics backend
//!
//! Two layers: `ProviderError` is the closed taxonomy for upstream calls
//! (what workers branch on), `AppError` is the HTTP-facing type handlers
//! return. Services use `anyhow::Result` internally and surface one of
//! these at their boundaries.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;
use validator::ValidationErrors;

/// Closed error taxonomy for provider-facing calls.
///
/// Every upstream response maps to exactly one of these kinds; retry and
/// breaker policy branch on the kind, never on status codes or strings.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Upstream 401 - the access token was rejected
    #[error("provider rejected the access token")]
    Unauthenticated,

    /// Upstream 403 - scope or ownership problem, usually terminal
    #[error("provider refused the request")]
    Forbidden,

    /// Upstream 429 with the parsed Retry-After window
    #[error("provider rate limit hit, retry after {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: u64 },

    /// Upstream 5xx
    #[error("provider unavailable (status {status})")]
    ProviderDown { status: u16 },

    /// Short-circuited locally by the circuit breaker
    #[error("circuit breaker open for service '{service}'")]
    BreakerOpen { service: String },

    /// Connection, timeout, or body-decode failure
    #[error("transport failure: {0}")]
    Transport(String),

    /// Any other upstream 4xx, terminal for the call
    #[error("provider returned client error (status {status})")]
    Api { status: u16 },

    /// The refresh endpoint reported `invalid_grant` - the user revoked access
    #[error("provider reports the grant was revoked")]
    GrantRevoked,

    /// Oversized batch or otherwise malformed request, rejected locally.
    /// A programmer error, never retried.
    #[error("invalid request to provider client: {0}")]
    InvalidInput(String),
}

impl ProviderError {
    /// Whether this failure should count toward tripping a circuit breaker.
    ///
    /// Auth and validation errors are not breaker-meaningful; only genuine
    /// upstream unavailability is.
    pub fn should_count(&self) -> bool {
        matches!(
            self,
            ProviderError::ProviderDown { .. } | ProviderError::Transport(_)
        )
    }

    /// Whether the queue layer may retry a job that failed with this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::ProviderDown { .. }
                | ProviderError::Transport(_)
                | ProviderError::BreakerOpen { .. }
                | ProviderError::RateLimited { .. }
        )
    }
}

/// Error response structure for consistent API responses
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub correlation_id: String,
    pub timestamp: String,
}

/// HTTP-facing application error
#[derive(Debug, Error)]
pub enum AppError {
    // Session / auth errors
    #[error("Authentication required")]
    Unauthorized,

    #[error("Session expired")]
    SessionExpired,

    #[error("Invalid cron secret")]
    CronSecretInvalid,

    // Validation errors
    #[error("Request validation failed")]
    ValidationFailed(ValidationErrors),

    #[error("Invalid field value: {field}")]
    InvalidFieldValue { field: String, message: String },

    #[error("Confirmation token invalid or expired")]
    ConfirmationTokenInvalid,

    #[error("Request parameters do not match the confirmation token")]
    ParamMismatch { fields: Vec<String> },

    // Resource errors
    #[error("Resource not found: {resource}")]
    NotFound { resource: String },

    #[error("Resource conflict: {message}")]
    Conflict { message: String },

    // Admission control
    #[error("Too many playlist jobs")]
    SlotExhausted { retry_after: Option<u64> },

    // Upstream
    #[error("Provider error")]
    Provider(#[from] ProviderError),

    // Storage
    #[error("Database query failed")]
    DatabaseQueryFailed(sqlx::Error),

    #[error("Database connection failed")]
    DatabaseConnectionFailed,

    #[error("Shared store operation failed")]
    RedisOperationFailed(String),

    #[error("Shared store connection failed")]
    RedisConnectionFailed,

    // System errors
    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::ValidationFailed(_)
            | AppError::InvalidFieldValue { .. }
            | AppError::ConfirmationTokenInvalid
            | AppError::ParamMismatch { .. }
            | AppError::Provider(ProviderError::InvalidInput(_)) => StatusCode::BAD_REQUEST,

            AppError::Unauthorized | AppError::SessionExpired | AppError::CronSecretInvalid => {
                StatusCode::UNAUTHORIZED
            }

            AppError::Provider(ProviderError::Forbidden) => StatusCode::FORBIDDEN,

            AppError::NotFound { .. } => StatusCode::NOT_FOUND,

            AppError::Conflict { .. } => StatusCode::CONFLICT,

            AppError::SlotExhausted { .. }
            | AppError::Provider(ProviderError::RateLimited { .. }) => {
                StatusCode::TOO_MANY_REQUESTS
            }

            AppError::Provider(ProviderError::ProviderDown { .. })
            | AppError::Provider(ProviderError::BreakerOpen { .. }) => StatusCode::BAD_GATEWAY,

            AppError::DatabaseConnectionFailed | AppError::RedisConnectionFailed => {
                StatusCode::SERVICE_UNAVAILABLE
            }

            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::Unauthorized => "AUTH_REQUIRED",
            AppError::SessionExpired => "SESSION_EXPIRED",
            AppError::CronSecretInvalid => "CRON_SECRET_INVALID",
            AppError::ValidationFailed(_) => "VALIDATION_FAILED",
            AppError::InvalidFieldValue { .. } => "INVALID_FIELD_VALUE",
            AppError::ConfirmationTokenInvalid => "CONFIRMATION_TOKEN_INVALID",
            AppError::ParamMismatch { .. } => "PARAM_MISMATCH",
            AppError::NotFound { .. } => "RESOURCE_NOT_FOUND",
            AppError::Conflict { .. } => "RESOURCE_CONFLICT",
            AppError::SlotExhausted { .. } => "PLAYLIST_SLOT_EXHAUSTED",
            AppError::Provider(ProviderError::Unauthenticated) => "PROVIDER_UNAUTHENTICATED",
            AppError::Provider(ProviderError::Forbidden) => "PROVIDER_FORBIDDEN",
            AppError::Provider(ProviderError::RateLimited { .. }) => "PROVIDER_RATE_LIMITED",
            AppError::Provider(ProviderError::ProviderDown { .. }) => "PROVIDER_DOWN",
            AppError::Provider(ProviderError::BreakerOpen { .. }) => "CIRCUIT_BREAKER_OPEN",
            AppError::Provider(ProviderError::Transport(_)) => "PROVIDER_TRANSPORT_ERROR",
            AppError::Provider(ProviderError::Api { .. }) => "PROVIDER_API_ERROR",
            AppError::Provider(ProviderError::GrantRevoked) => "PROVIDER_GRANT_REVOKED",
            AppError::Provider(ProviderError::InvalidInput(_)) => "PROVIDER_INVALID_INPUT",
            AppError::DatabaseQueryFailed(_) => "DATABASE_QUERY_FAILED",
            AppError::DatabaseConnectionFailed => "DATABASE_CONNECTION_FAILED",
            AppError::RedisOperationFailed(_) => "REDIS_OPERATION_FAILED",
            AppError::RedisConnectionFailed => "REDIS_CONNECTION_FAILED",
            AppError::ConfigurationError { .. } => "CONFIGURATION_ERROR",
            AppError::InvariantViolation(_) => "INVARIANT_VIOLATION",
            AppError::Internal(_) => "INTERNAL_SERVER_ERROR",
        }
    }

    /// Get error details for the response body
    pub fn error_details(&self) -> Option<serde_json::Value> {
        match self {
            AppError::ValidationFailed(errors) => {
                let details: std::collections::HashMap<String, Vec<String>> = errors
                    .field_errors()
                    .iter()
                    .map(|(field, field_errors)| {
                        let messages = field_errors
                            .iter()
                            .map(|e| {
                                e.message
                                    .as_ref()
                                    .map(|m| m.to_string())
                                    .unwrap_or_else(|| "Invalid value".to_string())
                            })
                            .collect();
                        (field.to_string(), messages)
                    })
                    .collect();
                Some(json!(details))
            }
            AppError::ParamMismatch { fields } => Some(json!({ "paramMismatch": fields })),
            AppError::SlotExhausted { retry_after } => {
                Some(json!({ "retry_after_seconds": retry_after }))
            }
            AppError::Provider(ProviderError::RateLimited {
                retry_after_seconds,
            }) => Some(json!({ "retry_after_seconds": retry_after_seconds })),
            AppError::InvalidFieldValue { field, message } => {
                Some(json!({ "field": field, "message": message }))
            }
            _ => None,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let correlation_id = Uuid::new_v4().to_string();
        let status = self.status_code();
        let error_code = self.error_code();
        let details = self.error_details();

        if status.is_server_error() {
            tracing::error!(
                correlation_id = %correlation_id,
                error_code = %error_code,
                error = %self,
                "Server error occurred"
            );
        } else {
            tracing::info!(
                correlation_id = %correlation_id,
                error_code = %error_code,
                error = %self,
                "Client error occurred"
            );
        }

        let error_response = ErrorResponse {
            error: self.to_string(),
            error_code: error_code.to_string(),
            message: self.to_string(),
            details,
            correlation_id,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(error_response)).into_response()
    }
}

// Conversion implementations for common error types
impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                AppError::DatabaseConnectionFailed
            }
            _ => AppError::DatabaseQueryFailed(err),
        }
    }
}

impl From<redis::RedisError> for AppError {
    fn from(err: redis::RedisError) -> Self {
        match err.kind() {
            redis::ErrorKind::IoError | redis::ErrorKind::AuthenticationFailed => {
                AppError::RedisConnectionFailed
            }
            _ => AppError::RedisOperationFailed(err.to_string()),
        }
    }
}

impl From<ValidationErrors> for AppError {
    fn from(err: ValidationErrors) -> Self {
        AppError::ValidationFailed(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaker_counts_only_unavailability() {
        assert!(ProviderError::ProviderDown { status: 502 }.should_count());
        assert!(ProviderError::Transport("reset".into()).should_count());
        assert!(!ProviderError::Unauthenticated.should_count());
        assert!(!ProviderError::Forbidden.should_count());
        assert!(!ProviderError::RateLimited {
            retry_after_seconds: 60
        }
        .should_count());
        assert!(!ProviderError::Api { status: 404 }.should_count());
    }

    #[test]
    fn status_codes_follow_policy_table() {
        assert_eq!(
            AppError::Provider(ProviderError::RateLimited {
                retry_after_seconds: 30
            })
            .status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            AppError::ParamMismatch {
                fields: vec!["name".into()]
            }
            .status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::InvariantViolation("rank gap".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
