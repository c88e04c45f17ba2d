//! Music analytics backend
//!
//! Ingests a streaming provider's per-user play history, aggregates it
//! into pre-computed statistics, and builds derived playlists on the
//! provider. The HTTP surface is thin; the substance is the background
//! pipeline: scheduler -> job queues -> token manager -> rate limiter ->
//! circuit breaker -> provider client -> catalog -> events -> rollups.

use std::sync::Arc;

use axum::{
    extract::State,
    response::Json,
    routing::{get, post},
    Router,
};
use moka::future::Cache;
use sqlx::PgPool;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

pub mod config;
pub mod database;
pub mod error;
pub mod metrics;
pub mod models;

pub mod handlers;
pub mod middleware;
pub mod services;

// Re-export commonly used types
pub use config::{AppConfig, ConfigError, Environment};
pub use database::{create_pool, create_redis_pool, health_check as db_health_check, redis_health_check};
pub use error::{AppError, ErrorResponse, ProviderError, Result};
pub use metrics::MetricsCollector;
pub use models::*;
pub use services::{
    AdaptiveRateLimiter, AggregationService, CatalogService, CircuitBreakerRegistry,
    ConfirmationTokenService, IngestService, JobQueue, PlaylistService, SchedulerService,
    TokenManager, TopStatsService, WorkerPool,
};

use crate::middleware::{CronGuard, SessionService};

/// Read-through cache TTL for top-list responses
const STATS_CACHE_TTL: std::time::Duration = std::time::Duration::from_secs(300);

/// Shared state for request handlers. Worker pools hold their own service
/// handles; only what the HTTP surface touches lives here.
#[derive(Clone)]
pub struct AppState {
    pub db_pool: PgPool,
    pub redis_pool: deadpool_redis::Pool,
    pub sessions: Arc<SessionService>,
    pub confirmation: Arc<ConfirmationTokenService>,
    pub top_stats: Arc<TopStatsService>,
    pub playlists: Arc<PlaylistService>,
    pub scheduler: Arc<SchedulerService>,
    pub metrics: Arc<MetricsCollector>,
    pub stats_cache: Cache<String, serde_json::Value>,
    pub cron_guard: Arc<CronGuard>,
}

impl AppState {
    pub fn build_stats_cache() -> Cache<String, serde_json::Value> {
        Cache::builder()
            .max_capacity(10_000)
            .time_to_live(STATS_CACHE_TTL)
            .build()
    }
}

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/stats/top/tracks", get(handlers::stats::top_tracks_handler))
        .route(
            "/stats/top/artists",
            get(handlers::stats::top_artists_handler),
        )
        .route("/stats/summary", get(handlers::stats::summary_handler))
        .route(
            "/playlists/validate",
            post(handlers::playlists::validate_playlist_handler),
        )
        .route("/playlists", post(handlers::playlists::create_playlist_handler))
        .route(
            "/playlists/jobs/:job_id",
            get(handlers::playlists::get_playlist_job_handler),
        )
        .layer(axum::middleware::from_fn_with_state(
            state.sessions.clone(),
            crate::middleware::session_middleware,
        ));

    let cron_routes = Router::new()
        .route("/seed-sync", post(handlers::cron::seed_sync_handler))
        .route(
            "/seed-top-stats",
            post(handlers::cron::seed_top_stats_handler),
        )
        .route(
            "/manage-partitions",
            post(handlers::cron::manage_partitions_handler),
        )
        .route(
            "/cleanup-stale-imports",
            post(handlers::cron::cleanup_stale_imports_handler),
        )
        .layer(axum::middleware::from_fn_with_state(
            state.cron_guard.clone(),
            crate::middleware::cron_secret_middleware,
        ));

    Router::new()
        .route("/health", get(health_handler))
        .route("/health/ready", get(readiness_handler))
        .route("/health/live", get(liveness_handler))
        .route("/metrics", get(metrics_endpoint))
        .nest("/api/v1", protected_routes)
        .nest("/cron", cron_routes)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(crate::middleware::create_cors_layer()),
        )
        .with_state(state)
}

/// Health check: verifies both backing stores answer
async fn health_handler(State(state): State<AppState>) -> Result<Json<serde_json::Value>> {
    let database = database::health_check(&state.db_pool).await.is_ok();
    let shared_store = database::redis_health_check(&state.redis_pool).await.is_ok();
    let healthy = database && shared_store;

    let body = serde_json::json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "services": { "database": database, "shared_store": shared_store },
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });

    if healthy {
        Ok(Json(body))
    } else {
        tracing::warn!(database, shared_store, "Health check degraded");
        Ok(Json(body))
    }
}

/// Readiness check endpoint for orchestrators
async fn readiness_handler(State(state): State<AppState>) -> Result<Json<serde_json::Value>> {
    database::health_check(&state.db_pool)
        .await
        .map_err(AppError::Internal)?;
    database::redis_health_check(&state.redis_pool)
        .await
        .map_err(AppError::Internal)?;

    Ok(Json(serde_json::json!({
        "status": "ready",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })))
}

/// Liveness check endpoint for orchestrators
async fn liveness_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "alive",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// Prometheus metrics endpoint
async fn metrics_endpoint(State(state): State<AppState>) -> impl axum::response::IntoResponse {
    crate::metrics::metrics_handler(axum::extract::State(state.metrics)).await
}
