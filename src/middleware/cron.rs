//! Shared-secret guard for the cron endpoints

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use tracing::warn;

const CRON_SECRET_HEADER: &str = "x-cron-secret";

/// Holds the configured cron secret for comparison
pub struct CronGuard {
    secret: String,
}

impl CronGuard {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

/// Reject cron requests lacking the correct `X-Cron-Secret` header
pub async fn cron_secret_middleware(
    State(guard): State<Arc<CronGuard>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let provided = request
        .headers()
        .get(CRON_SECRET_HEADER)
        .and_then(|v| v.to_str().ok());

    match provided {
        Some(value) if value == guard.secret => Ok(next.run(request).await),
        _ => {
            warn!("Cron endpoint called without a valid secret");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}
