//! Process entry point: build the dependency container once, spawn the
//! worker pools and the reaper, serve HTTP, and drain everything on
//! SIGINT/SIGTERM.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use music_analytics_backend::middleware::{CronGuard, SessionService};
use music_analytics_backend::services::catalog::{ArtistMetadataHandler, CatalogService};
use music_analytics_backend::services::confirmation::ConfirmationTokenService;
use music_analytics_backend::services::ingest::{IngestService, SyncJobHandler};
use music_analytics_backend::services::job_queue::{
    JobQueue, StartRateLimiter, WorkerConfig, WorkerPool,
};
use music_analytics_backend::services::playlist_builder::{
    PlaylistJobHandler, PlaylistService, PlaylistSlotLimiter, StaleJobReaper,
};
use music_analytics_backend::services::provider::SpotifyClient;
use music_analytics_backend::services::scheduler::SchedulerService;
use music_analytics_backend::services::top_stats::{TopStatsJobHandler, TopStatsService};
use music_analytics_backend::services::{
    AdaptiveRateLimiter, AggregationService, CircuitBreakerRegistry, TokenManager,
};
use music_analytics_backend::{create_pool, create_redis_pool, AppConfig, AppState, MetricsCollector};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_env()?;
    info!(
        environment = ?config.environment,
        "Starting music analytics backend"
    );

    let db_pool = create_pool(&config.database).await?;
    let redis_pool = create_redis_pool(&config.redis)?;
    let metrics = Arc::new(MetricsCollector::new()?);

    // Queues
    let sync_queue = JobQueue::new(redis_pool.clone(), "sync_queue");
    let top_stats_queue = JobQueue::new(redis_pool.clone(), "top_stats_queue");
    let playlist_queue = JobQueue::new(redis_pool.clone(), "playlist_queue");
    let artist_metadata_queue = JobQueue::new(redis_pool.clone(), "artist_metadata_queue");

    // Provider middleware stack: one limiter and one breaker registry per
    // process, shared by every worker pool
    let provider = Arc::new(SpotifyClient::new(&config.provider)?);
    let limiter = AdaptiveRateLimiter::new();
    let breakers = Arc::new(CircuitBreakerRegistry::new().with_metrics(metrics.clone()));
    let tokens = Arc::new(TokenManager::new(
        db_pool.clone(),
        provider.clone(),
        &config.secrets.hmac_secret,
    ));

    // Pipeline services
    let catalog = Arc::new(CatalogService::new(
        db_pool.clone(),
        artist_metadata_queue.clone(),
    ));
    let aggregator = Arc::new(AggregationService::new(db_pool.clone()));
    let ingest = Arc::new(IngestService::new(
        db_pool.clone(),
        provider.clone(),
        tokens.clone(),
        limiter.clone(),
        breakers.clone(),
        catalog.clone(),
        aggregator.clone(),
        sync_queue.clone(),
    ));
    let top_stats = Arc::new(TopStatsService::new(
        db_pool.clone(),
        provider.clone(),
        tokens.clone(),
        limiter.clone(),
        breakers.clone(),
        catalog.clone(),
        top_stats_queue.clone(),
    ));
    let slots = Arc::new(PlaylistSlotLimiter::new(
        redis_pool.clone(),
        db_pool.clone(),
    ));
    let playlists = Arc::new(PlaylistService::new(
        db_pool.clone(),
        playlist_queue.clone(),
        slots.clone(),
    ));
    let scheduler = Arc::new(SchedulerService::new(
        db_pool.clone(),
        redis_pool.clone(),
        sync_queue.clone(),
        top_stats_queue.clone(),
    ));

    let shutdown = CancellationToken::new();

    // Worker pools
    let sync_pool = WorkerPool::new(
        sync_queue.clone(),
        Arc::new(SyncJobHandler::new(ingest.clone())),
        WorkerConfig {
            concurrency: config.workers.sync_concurrency,
            ..Default::default()
        },
    )
    .with_metrics(metrics.clone());

    let top_stats_pool = WorkerPool::new(
        top_stats_queue.clone(),
        Arc::new(TopStatsJobHandler::new(top_stats.clone(), shutdown.clone())),
        WorkerConfig {
            concurrency: config.workers.top_stats_concurrency,
            ..Default::default()
        },
    )
    .with_metrics(metrics.clone());

    let playlist_pool = WorkerPool::new(
        playlist_queue.clone(),
        Arc::new(PlaylistJobHandler::new(
            db_pool.clone(),
            provider.clone(),
            tokens.clone(),
            limiter.clone(),
            breakers.clone(),
            top_stats.clone(),
            playlist_queue.clone(),
            slots.clone(),
        )),
        WorkerConfig {
            concurrency: config.workers.playlist_concurrency,
            start_limiter: Some(StartRateLimiter::new(
                config.workers.playlist_jobs_per_minute,
            )),
            ..Default::default()
        },
    )
    .with_metrics(metrics.clone());

    let artist_metadata_pool = WorkerPool::new(
        artist_metadata_queue.clone(),
        Arc::new(ArtistMetadataHandler::new(
            db_pool.clone(),
            provider.clone(),
            tokens.clone(),
            limiter.clone(),
            breakers.clone(),
        )),
        WorkerConfig {
            concurrency: 1,
            ..Default::default()
        },
    )
    .with_metrics(metrics.clone());

    let mut worker_handles = Vec::new();
    worker_handles.push(tokio::spawn(sync_pool.run(shutdown.clone())));
    worker_handles.push(tokio::spawn(top_stats_pool.run(shutdown.clone())));
    worker_handles.push(tokio::spawn(playlist_pool.run(shutdown.clone())));
    worker_handles.push(tokio::spawn(artist_metadata_pool.run(shutdown.clone())));

    let reaper = StaleJobReaper::new(db_pool.clone(), slots.clone());
    worker_handles.push(tokio::spawn(reaper.run(shutdown.clone())));

    // HTTP surface
    let state = AppState {
        db_pool,
        redis_pool,
        sessions: Arc::new(SessionService::new(&config.secrets.hmac_secret)),
        confirmation: Arc::new(ConfirmationTokenService::new(&config.secrets.hmac_secret)),
        top_stats,
        playlists,
        scheduler,
        metrics,
        stats_cache: AppState::build_stats_cache(),
        cron_guard: Arc::new(CronGuard::new(config.secrets.cron_secret.clone())),
    };
    let router = music_analytics_backend::create_router(state);

    let bind_address = config.server.bind_address();
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    info!(address = %bind_address, "HTTP server listening");

    let server_shutdown = shutdown.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("Shutdown signal received");
            server_shutdown.cancel();
        })
        .await?;

    // In-flight jobs finish before the process exits
    for handle in worker_handles {
        let _ = handle.await;
    }
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
