//! Long-running idempotent playlist creation
//!
//! A playlist job is a durable row; the queue entry merely points at it.
//! The worker drives the row through CREATING -> ADDING_TRACKS ->
//! UPLOADING_IMAGE -> COMPLETED, persisting enough state at each step
//! (provider playlist id before any add, `added_tracks` after every
//! batch) that a retry resumes instead of duplicating work.
//!
//! Admission is two Redis counters per user (pending and hourly) with
//! rollback on rejection and a database fallback when the store is down.
//! A provider 429 pauses the whole queue through the shared pause key;
//! only the latest pauser's timer resumes it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::error::{AppError, ProviderError};
use crate::models::{
    CatalogTrack, CreationMethod, PlaylistJob, PlaylistJobStatus, PlaylistParams, ShuffleMode,
    TokenFailureReason, Top50Term,
};
use crate::services::circuit_breaker::CircuitBreakerRegistry;
use crate::services::confirmation::ConfirmationTokenService;
use crate::services::job_queue::{JobHandler, JobOptions, JobOutcome, JobQueue, QueuedJob};
use crate::services::provider::{
    ProviderApi, ADD_TRACKS_MAX, PLAYLIST_PAGE_MAX, PLAYLIST_TRACKS_TOTAL_MAX,
};
use crate::services::rate_limiter::AdaptiveRateLimiter;
use crate::services::token_manager::TokenManager;
use crate::services::top_stats::TopStatsService;

/// Fewer resolved tracks than this fails the job
pub const MIN_TRACKS: usize = 25;
/// Per-user concurrent job cap
const PENDING_SLOT_LIMIT: i64 = 5;
/// Per-user hourly job cap
const HOURLY_SLOT_LIMIT: i64 = 10;
/// Safety TTL on the slot counters
const SLOT_TTL_SECONDS: i64 = 3600;
/// Heartbeat cadence while a worker owns a job
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Jobs whose heartbeat is older than this are presumed dead
const STALE_AFTER: Duration = Duration::from_secs(5 * 60);
/// Maximum look-back window for recent-k playlists
pub const RECENT_WINDOW_MAX_DAYS: i64 = 365;

/// Payload of one playlist build job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildPlaylistJob {
    pub playlist_job_id: Uuid,
}

/// Outcome of a slot acquisition attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotDecision {
    Granted,
    Rejected,
}

/// Per-user admission control over the shared store
pub struct PlaylistSlotLimiter {
    redis: deadpool_redis::Pool,
    pool: PgPool,
}

impl PlaylistSlotLimiter {
    pub fn new(redis: deadpool_redis::Pool, pool: PgPool) -> Self {
        Self { redis, pool }
    }

    fn pending_key(user_id: Uuid) -> String {
        format!("playlist_rate:pending:{}", user_id)
    }

    fn hourly_key(user_id: Uuid) -> String {
        format!("playlist_rate:hourly:{}", user_id)
    }

    /// Take one slot: bump pending (limit 5), then hourly (limit 10),
    /// rolling back on rejection so a refused request costs nothing.
    pub async fn try_acquire(&self, user_id: Uuid) -> Result<SlotDecision> {
        match self.try_acquire_redis(user_id).await {
            Ok(decision) => Ok(decision),
            Err(e) => {
                warn!(error = %e, "Slot store unavailable, falling back to row counts");
                self.try_acquire_fallback(user_id).await
            }
        }
    }

    async fn try_acquire_redis(&self, user_id: Uuid) -> Result<SlotDecision> {
        let mut conn = self.redis.get().await?;
        let pending_key = Self::pending_key(user_id);
        let hourly_key = Self::hourly_key(user_id);

        let pending: i64 = conn.incr(&pending_key, 1).await?;
        if pending == 1 {
            let _: () = conn.expire(&pending_key, SLOT_TTL_SECONDS).await?;
        }
        if pending > PENDING_SLOT_LIMIT {
            let _: () = conn.decr(&pending_key, 1).await?;
            return Ok(SlotDecision::Rejected);
        }

        let hourly: i64 = conn.incr(&hourly_key, 1).await?;
        if hourly == 1 {
            let _: () = conn.expire(&hourly_key, SLOT_TTL_SECONDS).await?;
        }
        if hourly > HOURLY_SLOT_LIMIT {
            let _: () = conn.decr(&hourly_key, 1).await?;
            let _: () = conn.decr(&pending_key, 1).await?;
            return Ok(SlotDecision::Rejected);
        }

        Ok(SlotDecision::Granted)
    }

    /// Conservative fallback counting job rows when Redis is unreachable
    async fn try_acquire_fallback(&self, user_id: Uuid) -> Result<SlotDecision> {
        let (pending, hourly): (i64, i64) = sqlx::query_as(
            "SELECT \
                 COUNT(*) FILTER (WHERE status IN \
                     ('pending', 'creating', 'adding_tracks', 'uploading_image')), \
                 COUNT(*) FILTER (WHERE created_at > NOW() - INTERVAL '1 hour') \
             FROM playlist_jobs WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        if pending >= PENDING_SLOT_LIMIT || hourly >= HOURLY_SLOT_LIMIT {
            Ok(SlotDecision::Rejected)
        } else {
            Ok(SlotDecision::Granted)
        }
    }

    /// Return a pending slot; the counter never goes below zero
    pub async fn release(&self, user_id: Uuid) -> Result<()> {
        let mut conn = self.redis.get().await?;
        let pending_key = Self::pending_key(user_id);
        let value: i64 = conn.decr(&pending_key, 1).await?;
        if value < 0 {
            let _: () = conn.set(&pending_key, 0).await?;
        }
        Ok(())
    }
}

/// In-place Fisher-Yates shuffle
pub fn fisher_yates<T, R: Rng>(items: &mut [T], rng: &mut R) {
    for i in (1..items.len()).rev() {
        let j = rng.gen_range(0..=i);
        items.swap(i, j);
    }
}

fn primary_artist(track: &CatalogTrack) -> Option<&str> {
    track.artists.first().map(|a| a.provider_id.as_str())
}

/// Fisher-Yates followed by one pass that displaces adjacent tracks by the
/// same primary artist further down the list when possible
pub fn smart_shuffle<R: Rng>(tracks: &mut [CatalogTrack], rng: &mut R) {
    fisher_yates(tracks, rng);
    for i in 1..tracks.len() {
        let same = match (primary_artist(&tracks[i - 1]), primary_artist(&tracks[i])) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        };
        if !same {
            continue;
        }
        if let Some(j) = (i + 1..tracks.len())
            .find(|&j| primary_artist(&tracks[j]) != primary_artist(&tracks[i - 1]))
        {
            tracks.swap(i, j);
        }
    }
}

/// Response of the creation path
#[derive(Debug, Clone, Serialize)]
pub struct CreateJobResponse {
    pub job_id: Uuid,
    pub idempotent: bool,
}

/// Handler-facing creation service
pub struct PlaylistService {
    pool: PgPool,
    queue: JobQueue,
    slots: Arc<PlaylistSlotLimiter>,
}

impl PlaylistService {
    pub fn new(pool: PgPool, queue: JobQueue, slots: Arc<PlaylistSlotLimiter>) -> Self {
        Self { pool, queue, slots }
    }

    /// Structural validation of method parameters, run before a
    /// confirmation token is issued.
    pub fn validate_params(params: &PlaylistParams) -> std::result::Result<(), AppError> {
        match params {
            PlaylistParams::Shuffle {
                source_playlist_id, ..
            } => {
                if source_playlist_id.trim().is_empty() {
                    return Err(AppError::InvalidFieldValue {
                        field: "source_playlist_id".to_string(),
                        message: "must not be empty".to_string(),
                    });
                }
            }
            PlaylistParams::Top50 { .. } => {}
            PlaylistParams::Recent {
                k_value,
                start_date,
                end_date,
            } => {
                if *k_value < MIN_TRACKS as i32 || *k_value > PLAYLIST_TRACKS_TOTAL_MAX as i32 {
                    return Err(AppError::InvalidFieldValue {
                        field: "k_value".to_string(),
                        message: format!(
                            "must be between {} and {}",
                            MIN_TRACKS, PLAYLIST_TRACKS_TOTAL_MAX
                        ),
                    });
                }
                if let (Some(start), Some(end)) = (start_date, end_date) {
                    if start >= end {
                        return Err(AppError::InvalidFieldValue {
                            field: "start_date".to_string(),
                            message: "must precede end_date".to_string(),
                        });
                    }
                    if *end - *start > chrono::Duration::days(RECENT_WINDOW_MAX_DAYS) {
                        return Err(AppError::InvalidFieldValue {
                            field: "end_date".to_string(),
                            message: format!(
                                "window may span at most {} days",
                                RECENT_WINDOW_MAX_DAYS
                            ),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Create (or idempotently return) the job bound to a confirmation
    /// token and enqueue it.
    pub async fn create_job(
        &self,
        user_id: Uuid,
        confirmation_token: &str,
        params: &PlaylistParams,
        name: &str,
        is_public: bool,
        cover_image_base64: Option<String>,
    ) -> std::result::Result<CreateJobResponse, AppError> {
        let idempotency_key = ConfirmationTokenService::idempotency_key(confirmation_token);

        if let Some((existing_id,)) = sqlx::query_as::<_, (Uuid,)>(
            "SELECT id FROM playlist_jobs WHERE idempotency_key = $1",
        )
        .bind(&idempotency_key)
        .fetch_optional(&self.pool)
        .await?
        {
            return Ok(CreateJobResponse {
                job_id: existing_id,
                idempotent: true,
            });
        }

        match self
            .slots
            .try_acquire(user_id)
            .await
            .map_err(AppError::Internal)?
        {
            SlotDecision::Granted => {}
            SlotDecision::Rejected => {
                return Err(AppError::SlotExhausted {
                    retry_after: Some(SLOT_TTL_SECONDS as u64),
                });
            }
        }

        let job_id = Uuid::new_v4();
        let method = params.creation_method();
        let (source_playlist_id, shuffle_mode, k_value, start_date, end_date, estimated) =
            match params {
                PlaylistParams::Shuffle {
                    source_playlist_id,
                    shuffle_mode,
                } => (
                    Some(source_playlist_id.clone()),
                    Some(*shuffle_mode),
                    None,
                    None,
                    None,
                    0i32,
                ),
                PlaylistParams::Top50 { .. } => (None, None, None, None, None, 50i32),
                PlaylistParams::Recent {
                    k_value,
                    start_date,
                    end_date,
                } => (None, None, Some(*k_value), *start_date, *end_date, *k_value),
            };

        let insert = sqlx::query(
            "INSERT INTO playlist_jobs \
                 (id, user_id, idempotency_key, creation_method, name, is_public, \
                  source_playlist_id, shuffle_mode, k_value, start_date, end_date, \
                  cover_image_base64, status, total_tracks, added_tracks, estimated_tracks, \
                  retry_count, rate_limit_delays, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, 'pending', 0, 0, $13, \
                     0, 0, $14) \
             ON CONFLICT (idempotency_key) DO NOTHING",
        )
        .bind(job_id)
        .bind(user_id)
        .bind(&idempotency_key)
        .bind(method)
        .bind(name)
        .bind(is_public)
        .bind(source_playlist_id)
        .bind(shuffle_mode)
        .bind(k_value)
        .bind(start_date)
        .bind(end_date)
        .bind(cover_image_base64)
        .bind(estimated)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if insert.rows_affected() == 0 {
            // Lost a race against the same token; the slot goes back
            if let Err(e) = self.slots.release(user_id).await {
                warn!(error = %e, "Failed to release slot after idempotent replay");
            }
            let (existing_id,): (Uuid,) = sqlx::query_as(
                "SELECT id FROM playlist_jobs WHERE idempotency_key = $1",
            )
            .bind(&idempotency_key)
            .fetch_one(&self.pool)
            .await?;
            return Ok(CreateJobResponse {
                job_id: existing_id,
                idempotent: true,
            });
        }

        let payload = serde_json::to_value(BuildPlaylistJob {
            playlist_job_id: job_id,
        })
        .map_err(|e| AppError::Internal(e.into()))?;
        self.queue
            .add(
                "build_playlist",
                payload,
                JobOptions::with_job_id(job_id.to_string()),
            )
            .await
            .map_err(AppError::Internal)?;

        Ok(CreateJobResponse {
            job_id,
            idempotent: false,
        })
    }

    pub async fn get_job(&self, user_id: Uuid, job_id: Uuid) -> Result<Option<PlaylistJob>> {
        let job = sqlx::query_as::<_, PlaylistJob>(
            "SELECT * FROM playlist_jobs WHERE id = $1 AND user_id = $2",
        )
        .bind(job_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }
}

/// Internal step error: decides between failing the row, rescheduling
/// after a rate limit, and letting the queue retry
enum StepError {
    /// Mark the row FAILED; no retry will change the outcome
    Fatal(String),
    /// Provider 429: pause the queue and reschedule
    RateLimited { retry_after_seconds: u64 },
    /// Transient; surface to the queue retry policy
    Other(anyhow::Error),
}

impl From<ProviderError> for StepError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::RateLimited {
                retry_after_seconds,
            } => StepError::RateLimited {
                retry_after_seconds,
            },
            ProviderError::Forbidden => StepError::Fatal("provider refused access".to_string()),
            ProviderError::Api { status } => {
                StepError::Fatal(format!("provider rejected the request (status {})", status))
            }
            ProviderError::InvalidInput(message) => StepError::Fatal(message),
            other => StepError::Other(other.into()),
        }
    }
}

impl From<sqlx::Error> for StepError {
    fn from(err: sqlx::Error) -> Self {
        StepError::Other(err.into())
    }
}

impl From<anyhow::Error> for StepError {
    fn from(err: anyhow::Error) -> Self {
        StepError::Other(err)
    }
}

/// Queue handler executing playlist jobs
pub struct PlaylistJobHandler {
    pool: PgPool,
    provider: Arc<dyn ProviderApi>,
    tokens: Arc<TokenManager>,
    limiter: Arc<AdaptiveRateLimiter>,
    breakers: Arc<CircuitBreakerRegistry>,
    top_stats: Arc<TopStatsService>,
    queue: JobQueue,
    slots: Arc<PlaylistSlotLimiter>,
}

impl PlaylistJobHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: PgPool,
        provider: Arc<dyn ProviderApi>,
        tokens: Arc<TokenManager>,
        limiter: Arc<AdaptiveRateLimiter>,
        breakers: Arc<CircuitBreakerRegistry>,
        top_stats: Arc<TopStatsService>,
        queue: JobQueue,
        slots: Arc<PlaylistSlotLimiter>,
    ) -> Self {
        Self {
            pool,
            provider,
            tokens,
            limiter,
            breakers,
            top_stats,
            queue,
            slots,
        }
    }

    async fn observe<T>(&self, result: Result<T, ProviderError>) -> Result<T, StepError> {
        match result {
            Ok(value) => {
                self.limiter.record_success().await;
                Ok(value)
            }
            Err(ProviderError::RateLimited {
                retry_after_seconds,
            }) => {
                self.limiter.handle_rate_limit(retry_after_seconds).await;
                Err(StepError::RateLimited {
                    retry_after_seconds,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn set_status(&self, job_id: Uuid, status: PlaylistJobStatus) -> Result<(), StepError> {
        sqlx::query(
            "UPDATE playlist_jobs SET status = $2, last_heartbeat_at = NOW() WHERE id = $1",
        )
        .bind(job_id)
        .bind(status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(&self, job: &PlaylistJob, message: &str) {
        let result = sqlx::query(
            "UPDATE playlist_jobs SET status = 'failed', error_message = $2, \
             completed_at = NOW() WHERE id = $1",
        )
        .bind(job.id)
        .bind(message)
        .execute(&self.pool)
        .await;
        if let Err(e) = result {
            error!(job_id = %job.id, error = %e, "Failed to persist job failure");
        }
        if let Err(e) = self.slots.release(job.user_id).await {
            warn!(job_id = %job.id, error = %e, "Failed to release slot");
        }
    }

    /// Resolve the track list according to the creation method
    async fn resolve_tracks(
        &self,
        job: &PlaylistJob,
        access_token: &str,
    ) -> Result<Vec<String>, StepError> {
        match job.creation_method {
            CreationMethod::Shuffle => self.resolve_shuffle(job, access_token).await,
            CreationMethod::Top50Short => self.resolve_top50(job, Top50Term::Short).await,
            CreationMethod::Top50Medium => self.resolve_top50(job, Top50Term::Medium).await,
            CreationMethod::Top50Long => self.resolve_top50(job, Top50Term::Long).await,
            CreationMethod::Top50AllTime => self.resolve_all_time(job).await,
            CreationMethod::TopKRecent => self.resolve_recent(job).await,
        }
    }

    async fn resolve_shuffle(
        &self,
        job: &PlaylistJob,
        access_token: &str,
    ) -> Result<Vec<String>, StepError> {
        let source = job
            .source_playlist_id
            .as_deref()
            .ok_or_else(|| StepError::Fatal("shuffle job without a source playlist".to_string()))?;

        let mut tracks: Vec<CatalogTrack> = Vec::new();
        let mut offset = 0usize;
        loop {
            self.limiter.acquire().await;
            let page = self
                .observe(
                    self.breakers
                        .execute("playlist", || {
                            self.provider.playlist_tracks(
                                access_token,
                                source,
                                PLAYLIST_PAGE_MAX,
                                offset,
                            )
                        })
                        .await,
                )
                .await?;

            let fetched = page.items.len();
            tracks.extend(page.items.into_iter().filter(|t| !t.is_local));
            offset += PLAYLIST_PAGE_MAX;
            if fetched < PLAYLIST_PAGE_MAX
                || offset >= page.total as usize
                || offset >= PLAYLIST_TRACKS_TOTAL_MAX
            {
                break;
            }
        }

        let mut rng = rand::thread_rng();
        match job.shuffle_mode.unwrap_or(ShuffleMode::Standard) {
            ShuffleMode::Standard => fisher_yates(&mut tracks, &mut rng),
            ShuffleMode::Smart => smart_shuffle(&mut tracks, &mut rng),
        }

        Ok(tracks
            .into_iter()
            .map(|t| format!("spotify:track:{}", t.provider_id))
            .collect())
    }

    async fn resolve_top50(
        &self,
        job: &PlaylistJob,
        term: Top50Term,
    ) -> Result<Vec<String>, StepError> {
        let term = term
            .term()
            .ok_or_else(|| StepError::Fatal("all-time term has no provider window".to_string()))?;
        let ranked = self
            .top_stats
            .ensure_top_tracks_cached(job.user_id, term)
            .await
            .map_err(StepError::Other)?;
        Ok(ranked
            .into_iter()
            .map(|t| format!("spotify:track:{}", t.provider_id))
            .collect())
    }

    async fn resolve_all_time(&self, job: &PlaylistJob) -> Result<Vec<String>, StepError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT t.provider_id FROM user_track_stats s \
             JOIN tracks t ON t.id = s.track_id \
             WHERE s.user_id = $1 \
             ORDER BY s.play_count DESC, s.total_ms DESC LIMIT 50",
        )
        .bind(job.user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(provider_id,)| format!("spotify:track:{}", provider_id))
            .collect())
    }

    async fn resolve_recent(&self, job: &PlaylistJob) -> Result<Vec<String>, StepError> {
        let k = job
            .k_value
            .ok_or_else(|| StepError::Fatal("recent job without k_value".to_string()))?
            as usize;

        let start = job.start_date.unwrap_or_else(|| {
            Utc::now() - chrono::Duration::days(RECENT_WINDOW_MAX_DAYS)
        });
        let end = job.end_date.unwrap_or_else(Utc::now);

        // Overfetch 3x, then dedup by track keeping the most recent play
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT t.provider_id FROM listening_events e \
             JOIN tracks t ON t.id = e.track_id \
             WHERE e.user_id = $1 AND e.played_at >= $2 AND e.played_at <= $3 \
             ORDER BY e.played_at DESC LIMIT $4",
        )
        .bind(job.user_id)
        .bind(start)
        .bind(end)
        .bind((k * 3) as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut seen = std::collections::HashSet::new();
        let mut uris = Vec::with_capacity(k);
        for (provider_id,) in rows {
            if seen.insert(provider_id.clone()) {
                uris.push(format!("spotify:track:{}", provider_id));
                if uris.len() >= k {
                    break;
                }
            }
        }
        Ok(uris)
    }

    /// The resumable body of one job run
    async fn process(&self, mut job: PlaylistJob, access_token: &str) -> Result<(), StepError> {
        let user_provider_id: (String,) =
            sqlx::query_as("SELECT provider_id FROM users WHERE id = $1")
                .bind(job.user_id)
                .fetch_one(&self.pool)
                .await?;

        if job.started_at.is_none() {
            sqlx::query(
                "UPDATE playlist_jobs SET started_at = NOW(), last_heartbeat_at = NOW() \
                 WHERE id = $1 AND started_at IS NULL",
            )
            .bind(job.id)
            .execute(&self.pool)
            .await?;
            job.started_at = Some(Utc::now());
        } else {
            sqlx::query(
                "UPDATE playlist_jobs SET retry_count = retry_count + 1, \
                 last_heartbeat_at = NOW() WHERE id = $1",
            )
            .bind(job.id)
            .execute(&self.pool)
            .await?;
        }

        self.set_status(job.id, PlaylistJobStatus::Creating).await?;

        let mut uris = self.resolve_tracks(&job, access_token).await?;
        if uris.len() < MIN_TRACKS {
            return Err(StepError::Fatal(format!(
                "resolved {} tracks, minimum is {}",
                uris.len(),
                MIN_TRACKS
            )));
        }
        if uris.len() > PLAYLIST_TRACKS_TOTAL_MAX {
            uris.truncate(PLAYLIST_TRACKS_TOTAL_MAX);
        }

        sqlx::query("UPDATE playlist_jobs SET total_tracks = $2 WHERE id = $1")
            .bind(job.id)
            .bind(uris.len() as i32)
            .execute(&self.pool)
            .await?;

        // The provider playlist id is persisted before any track is added,
        // so a retry reuses it instead of creating a second playlist.
        let playlist_id = match &job.spotify_playlist_id {
            Some(id) => id.clone(),
            None => {
                self.limiter.acquire().await;
                let created = self
                    .observe(
                        self.breakers
                            .execute("playlist", || {
                                self.provider.create_playlist(
                                    access_token,
                                    &user_provider_id.0,
                                    &job.name,
                                    job.is_public,
                                )
                            })
                            .await,
                    )
                    .await?;

                sqlx::query(
                    "UPDATE playlist_jobs SET spotify_playlist_id = $2, \
                     spotify_playlist_url = $3 WHERE id = $1 AND spotify_playlist_id IS NULL",
                )
                .bind(job.id)
                .bind(&created.provider_id)
                .bind(&created.url)
                .execute(&self.pool)
                .await?;
                created.provider_id
            }
        };

        self.set_status(job.id, PlaylistJobStatus::AddingTracks)
            .await?;

        // Resume from the last fully persisted batch
        let start_batch = (job.added_tracks as usize) / ADD_TRACKS_MAX;
        let batches: Vec<&[String]> = uris.chunks(ADD_TRACKS_MAX).collect();
        for (index, batch) in batches.iter().enumerate().skip(start_batch) {
            self.limiter.acquire().await;
            self.observe(
                self.breakers
                    .execute("playlist", || {
                        self.provider.add_tracks(access_token, &playlist_id, batch)
                    })
                    .await,
            )
            .await?;

            let added = ((index + 1) * ADD_TRACKS_MAX).min(uris.len()) as i32;
            sqlx::query(
                "UPDATE playlist_jobs SET added_tracks = $2, last_heartbeat_at = NOW() \
                 WHERE id = $1",
            )
            .bind(job.id)
            .bind(added)
            .execute(&self.pool)
            .await?;
        }

        if let Some(cover) = &job.cover_image_base64 {
            self.set_status(job.id, PlaylistJobStatus::UploadingImage)
                .await?;
            self.limiter.acquire().await;
            self.observe(
                self.breakers
                    .execute("playlist", || {
                        self.provider
                            .upload_cover_image(access_token, &playlist_id, cover)
                    })
                    .await,
            )
            .await?;
        }

        let processing_time_ms = job
            .started_at
            .map(|started| (Utc::now() - started).num_milliseconds())
            .unwrap_or(0);
        sqlx::query(
            "UPDATE playlist_jobs SET status = 'completed', completed_at = NOW(), \
             processing_time_ms = $2 WHERE id = $1",
        )
        .bind(job.id)
        .bind(processing_time_ms)
        .execute(&self.pool)
        .await?;

        if let Err(e) = self.slots.release(job.user_id).await {
            warn!(job_id = %job.id, error = %e, "Failed to release slot");
        }

        info!(
            job_id = %job.id,
            tracks = uris.len(),
            processing_time_ms,
            "Playlist job completed"
        );
        Ok(())
    }

    /// Pause the whole queue for the provider's retry window and hand the
    /// job back with a matching delay. Only the latest pauser resumes.
    async fn enter_rate_limit_pause(
        &self,
        job: &PlaylistJob,
        retry_after_seconds: u64,
    ) -> Result<JobOutcome> {
        sqlx::query(
            "UPDATE playlist_jobs SET rate_limit_delays = rate_limit_delays + 1 WHERE id = $1",
        )
        .bind(job.id)
        .execute(&self.pool)
        .await?;

        let pause_until = Utc::now() + chrono::Duration::seconds(retry_after_seconds as i64);
        let became_latest = self.queue.publish_pause_until(pause_until).await?;
        self.queue.pause().await?;

        if became_latest {
            let queue = self.queue.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(retry_after_seconds)).await;
                match queue.try_resume_if_elapsed(Utc::now()).await {
                    Ok(true) => info!("Playlist queue resumed after rate-limit window"),
                    Ok(false) => info!("Playlist queue resume superseded by a later pause"),
                    Err(e) => error!(error = %e, "Playlist queue resume failed"),
                }
            });
        }

        let jitter_ms = rand::thread_rng().gen_range(0..=3000);
        Ok(JobOutcome::Reschedule {
            delay: Duration::from_secs(retry_after_seconds) + Duration::from_millis(jitter_ms),
        })
    }
}

#[async_trait]
impl JobHandler for PlaylistJobHandler {
    async fn handle(&self, queued: &QueuedJob) -> Result<JobOutcome> {
        let payload: BuildPlaylistJob = serde_json::from_value(queued.payload.clone())
            .context("playlist job payload malformed")?;

        let Some(job) = sqlx::query_as::<_, PlaylistJob>(
            "SELECT * FROM playlist_jobs WHERE id = $1",
        )
        .bind(payload.playlist_job_id)
        .fetch_optional(&self.pool)
        .await?
        else {
            warn!(job_id = %payload.playlist_job_id, "Playlist job row missing, dropping");
            return Ok(JobOutcome::Completed(serde_json::json!({"missing": true})));
        };

        if job.status.is_terminal() {
            return Ok(JobOutcome::Completed(serde_json::json!({
                "status": job.status,
            })));
        }

        let access = match self.tokens.get_valid_access_token(job.user_id).await? {
            Some(access) => access,
            None => {
                self.mark_failed(&job, "no valid provider connection").await;
                return Ok(JobOutcome::Completed(serde_json::json!({"failed": true})));
            }
        };

        // Heartbeat while this worker owns the job
        let heartbeat_cancel = CancellationToken::new();
        {
            let pool = self.pool.clone();
            let job_id = job.id;
            let cancel = heartbeat_cancel.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(HEARTBEAT_INTERVAL);
                tick.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tick.tick() => {
                            let _ = sqlx::query(
                                "UPDATE playlist_jobs SET last_heartbeat_at = NOW() WHERE id = $1",
                            )
                            .bind(job_id)
                            .execute(&pool)
                            .await;
                        }
                    }
                }
            });
        }

        let result = self.process(job.clone(), &access.token).await;
        heartbeat_cancel.cancel();

        match result {
            Ok(()) => Ok(JobOutcome::Completed(serde_json::json!({"completed": true}))),
            Err(StepError::RateLimited {
                retry_after_seconds,
            }) => self.enter_rate_limit_pause(&job, retry_after_seconds).await,
            Err(StepError::Fatal(message)) => {
                self.mark_failed(&job, &message).await;
                Ok(JobOutcome::Completed(serde_json::json!({"failed": true})))
            }
            Err(StepError::Other(err)) => {
                if err
                    .downcast_ref::<ProviderError>()
                    .map(|e| matches!(e, ProviderError::Unauthenticated))
                    .unwrap_or(false)
                {
                    self.tokens
                        .record_token_failure(job.user_id, TokenFailureReason::Unauthenticated)
                        .await?;
                }
                Err(err)
            }
        }
    }

    fn max_execution_time(&self) -> Duration {
        Duration::from_secs(300)
    }
}

/// Moves jobs whose worker died (heartbeat older than five minutes) to
/// FAILED so their slots free up and the UI stops showing progress.
pub struct StaleJobReaper {
    pool: PgPool,
    slots: Arc<PlaylistSlotLimiter>,
}

impl StaleJobReaper {
    pub fn new(pool: PgPool, slots: Arc<PlaylistSlotLimiter>) -> Self {
        Self { pool, slots }
    }

    /// Reap once; returns the number of jobs failed
    #[instrument(skip(self))]
    pub async fn reap_once(&self) -> Result<u64> {
        let stalled: Vec<(Uuid, Uuid)> = sqlx::query_as(
            "UPDATE playlist_jobs SET status = 'failed', \
                 error_message = 'job stalled: worker heartbeat lost', completed_at = NOW() \
             WHERE status IN ('creating', 'adding_tracks', 'uploading_image') \
               AND last_heartbeat_at < NOW() - $1::interval \
             RETURNING id, user_id",
        )
        .bind(format!("{} seconds", STALE_AFTER.as_secs()))
        .fetch_all(&self.pool)
        .await?;

        for (job_id, user_id) in &stalled {
            warn!(job_id = %job_id, user_id = %user_id, "Reaped stalled playlist job");
            if let Err(e) = self.slots.release(*user_id).await {
                warn!(user_id = %user_id, error = %e, "Failed to release slot for reaped job");
            }
        }
        Ok(stalled.len() as u64)
    }

    /// Run every five minutes until shutdown
    pub async fn run(self, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(STALE_AFTER);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    if let Err(e) = self.reap_once().await {
                        error!(error = %e, "Stale job reaper failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CatalogArtist;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn track(id: usize, artist: &str) -> CatalogTrack {
        CatalogTrack {
            provider_id: format!("t{}", id),
            name: format!("track {}", id),
            duration_ms: 200_000,
            preview_url: None,
            is_local: false,
            album: None,
            artists: vec![CatalogArtist {
                provider_id: artist.to_string(),
                name: artist.to_string(),
                image_url: None,
            }],
        }
    }

    #[test]
    fn fisher_yates_is_a_permutation() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut items: Vec<usize> = (0..100).collect();
        fisher_yates(&mut items, &mut rng);

        let mut sorted = items.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..100).collect::<Vec<_>>());
        assert_ne!(items, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn smart_shuffle_breaks_up_artist_runs() {
        let mut rng = StdRng::seed_from_u64(42);
        // 10 tracks by artist A, 10 by 10 distinct artists
        let mut tracks: Vec<CatalogTrack> = (0..10)
            .map(|i| track(i, "artist_a"))
            .chain((10..20).map(|i| track(i, &format!("artist_{}", i))))
            .collect();

        smart_shuffle(&mut tracks, &mut rng);

        let adjacent_dupes = tracks
            .windows(2)
            .filter(|w| primary_artist(&w[0]) == primary_artist(&w[1]))
            .count();
        // A perfect interleave is not always possible, but runs must be rare
        assert!(adjacent_dupes <= 3, "{} adjacent duplicates", adjacent_dupes);
        assert_eq!(tracks.len(), 20);
    }

    #[test]
    fn smart_shuffle_keeps_all_tracks() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut tracks: Vec<CatalogTrack> =
            (0..30).map(|i| track(i, &format!("a{}", i % 3))).collect();
        smart_shuffle(&mut tracks, &mut rng);

        let mut ids: Vec<String> = tracks.iter().map(|t| t.provider_id.clone()).collect();
        ids.sort();
        let mut expected: Vec<String> = (0..30).map(|i| format!("t{}", i)).collect();
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[test]
    fn recent_window_validation() {
        let now = Utc::now();
        let ok = PlaylistParams::Recent {
            k_value: 100,
            start_date: Some(now - chrono::Duration::days(30)),
            end_date: Some(now),
        };
        assert!(PlaylistService::validate_params(&ok).is_ok());

        let too_wide = PlaylistParams::Recent {
            k_value: 100,
            start_date: Some(now - chrono::Duration::days(400)),
            end_date: Some(now),
        };
        assert!(PlaylistService::validate_params(&too_wide).is_err());

        let inverted = PlaylistParams::Recent {
            k_value: 100,
            start_date: Some(now),
            end_date: Some(now - chrono::Duration::days(1)),
        };
        assert!(PlaylistService::validate_params(&inverted).is_err());

        let too_small = PlaylistParams::Recent {
            k_value: 3,
            start_date: None,
            end_date: None,
        };
        assert!(PlaylistService::validate_params(&too_small).is_err());
    }

    #[test]
    fn batch_resumption_starts_after_persisted_batches() {
        // 250 added of 730 total: batches 0 and 1 are durable, resume at 2
        assert_eq!(250usize / ADD_TRACKS_MAX, 2);
        assert_eq!(0usize / ADD_TRACKS_MAX, 0);
        assert_eq!(700usize / ADD_TRACKS_MAX, 7);
    }
}
