//! Cron endpoints, driven by an external wall-clock source.
//! All routes here sit behind the `X-Cron-Secret` middleware.

use axum::{extract::State, Json};
use serde_json::json;

use crate::error::{AppError, Result};
use crate::AppState;

/// POST /cron/seed-sync
pub async fn seed_sync_handler(State(state): State<AppState>) -> Result<Json<serde_json::Value>> {
    let summary = state
        .scheduler
        .seed_sync()
        .await
        .map_err(AppError::Internal)?;
    Ok(Json(json!({ "status": "ok", "data": summary })))
}

/// POST /cron/seed-top-stats
pub async fn seed_top_stats_handler(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>> {
    let summary = state
        .scheduler
        .seed_top_stats()
        .await
        .map_err(AppError::Internal)?;
    Ok(Json(json!({ "status": "ok", "data": summary })))
}

/// POST /cron/manage-partitions
pub async fn manage_partitions_handler(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>> {
    let partitions = state
        .scheduler
        .manage_partitions()
        .await
        .map_err(AppError::Internal)?;
    Ok(Json(json!({ "status": "ok", "data": { "partitions": partitions } })))
}

/// POST /cron/cleanup-stale-imports
pub async fn cleanup_stale_imports_handler(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>> {
    let failed = state
        .scheduler
        .cleanup_stale_imports()
        .await
        .map_err(AppError::Internal)?;
    Ok(Json(json!({ "status": "ok", "data": { "failed": failed } })))
}
