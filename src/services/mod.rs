// Provider-facing middleware stack
pub mod circuit_breaker;
pub mod provider;
pub mod rate_limiter;
pub mod token_manager;

// Durable queues and workers
pub mod job_queue;

// Ingestion and aggregation pipeline
pub mod aggregate;
pub mod catalog;
pub mod ingest;

// Derived data
pub mod playlist_builder;
pub mod top_stats;

// Request-path helpers
pub mod confirmation;
pub mod scheduler;

pub use aggregate::AggregationService;
pub use catalog::{ArtistMetadataHandler, CatalogService};
pub use circuit_breaker::{BreakerState, CircuitBreakerConfig, CircuitBreakerRegistry};
pub use confirmation::{ConfirmationClaims, ConfirmationTokenService};
pub use ingest::{IngestService, SyncJobHandler, SyncUserJob};
pub use job_queue::{
    JobHandler, JobOptions, JobOutcome, JobPriority, JobQueue, JobState, QueueCounts, QueuedJob,
    StartRateLimiter, WorkerConfig, WorkerPool,
};
pub use playlist_builder::{
    BuildPlaylistJob, CreateJobResponse, PlaylistJobHandler, PlaylistService,
    PlaylistSlotLimiter, SlotDecision, StaleJobReaper,
};
pub use provider::{ProviderApi, SpotifyClient};
pub use rate_limiter::{AdaptiveRateLimiter, RateLimiterConfig};
pub use scheduler::{SchedulerService, SeedSummary};
pub use token_manager::{AccessToken, TokenEncryption, TokenManager};
pub use top_stats::{RefreshTopStatsJob, TopStatsJobHandler, TopStatsService};
