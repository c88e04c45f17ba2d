//! Atomic refresh of per-user top-N caches
//!
//! Six provider fetches (three terms, tracks and artists) run in parallel
//! and must all succeed before anything mutates. The catalog pass happens
//! outside the transaction because it is idempotent. The commit itself is
//! one transaction that locks the user row, deletes every prior entry,
//! inserts the new ranks and stamps `top_stats_refreshed_at` - the cached
//! lists are always a complete snapshot of one run or absent entirely.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, QueryBuilder};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::ProviderError;
use crate::models::{CatalogArtist, CatalogTrack, Term, TokenFailureReason, TopKind, User};
use crate::services::catalog::CatalogService;
use crate::services::circuit_breaker::CircuitBreakerRegistry;
use crate::services::job_queue::{
    JobHandler, JobOptions, JobOutcome, JobPriority, JobQueue, QueuedJob,
};
use crate::services::provider::{ProviderApi, TOP_LIST_MAX};
use crate::services::rate_limiter::AdaptiveRateLimiter;
use crate::services::token_manager::TokenManager;

/// Commit-phase transaction budget
const COMMIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Cache age beyond which a synchronous read-path refresh runs
const SYNCHRONOUS_REFRESH_AGE: chrono::Duration = chrono::Duration::hours(1);

/// Payload of one refresh job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshTopStatsJob {
    pub user_id: Uuid,
}

/// A cached top track with the ids playlist building needs
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RankedTrack {
    pub track_id: Uuid,
    pub provider_id: String,
    pub rank: i32,
}

pub struct TopStatsService {
    pool: PgPool,
    provider: Arc<dyn ProviderApi>,
    tokens: Arc<TokenManager>,
    limiter: Arc<AdaptiveRateLimiter>,
    breakers: Arc<CircuitBreakerRegistry>,
    catalog: Arc<CatalogService>,
    queue: JobQueue,
}

impl TopStatsService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: PgPool,
        provider: Arc<dyn ProviderApi>,
        tokens: Arc<TokenManager>,
        limiter: Arc<AdaptiveRateLimiter>,
        breakers: Arc<CircuitBreakerRegistry>,
        catalog: Arc<CatalogService>,
        queue: JobQueue,
    ) -> Self {
        Self {
            pool,
            provider,
            tokens,
            limiter,
            breakers,
            catalog,
            queue,
        }
    }

    async fn fetch_top_tracks(
        &self,
        access_token: &str,
        term: Term,
    ) -> Result<Vec<CatalogTrack>, ProviderError> {
        self.limiter.acquire().await;
        let result = self
            .breakers
            .execute("top", || {
                self.provider.top_tracks(access_token, term, TOP_LIST_MAX)
            })
            .await;
        match &result {
            Ok(_) => self.limiter.record_success().await,
            Err(ProviderError::RateLimited {
                retry_after_seconds,
            }) => self.limiter.handle_rate_limit(*retry_after_seconds).await,
            Err(_) => {}
        }
        result
    }

    async fn fetch_top_artists(
        &self,
        access_token: &str,
        term: Term,
    ) -> Result<Vec<CatalogArtist>, ProviderError> {
        self.limiter.acquire().await;
        let result = self
            .breakers
            .execute("top", || {
                self.provider.top_artists(access_token, term, TOP_LIST_MAX)
            })
            .await;
        match &result {
            Ok(_) => self.limiter.record_success().await,
            Err(ProviderError::RateLimited {
                retry_after_seconds,
            }) => self.limiter.handle_rate_limit(*retry_after_seconds).await,
            Err(_) => {}
        }
        result
    }

    /// Rebuild a user's six top-N lists atomically.
    ///
    /// The cancellation token is honored at the three phase boundaries;
    /// an abort never leaves a partial snapshot behind.
    #[instrument(skip(self, cancel), fields(user_id = %user_id))]
    pub async fn refresh_user(&self, user_id: Uuid, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(anyhow!("top-stats refresh aborted before fetch"));
        }

        let access = self
            .tokens
            .get_valid_access_token(user_id)
            .await?
            .ok_or_else(|| anyhow!("User {} has no valid provider connection", user_id))?;

        // Phase 1: all six lists or nothing
        let fetch = tokio::try_join!(
            self.fetch_top_tracks(&access.token, Term::Short),
            self.fetch_top_tracks(&access.token, Term::Medium),
            self.fetch_top_tracks(&access.token, Term::Long),
            self.fetch_top_artists(&access.token, Term::Short),
            self.fetch_top_artists(&access.token, Term::Medium),
            self.fetch_top_artists(&access.token, Term::Long),
        );
        let (tracks_short, tracks_medium, tracks_long, artists_short, artists_medium, artists_long) =
            match fetch {
                Ok(lists) => {
                    self.tokens.reset_token_failures(user_id).await?;
                    lists
                }
                Err(err) => {
                    if matches!(err, ProviderError::Unauthenticated) {
                        self.tokens
                            .record_token_failure(user_id, TokenFailureReason::Unauthenticated)
                            .await?;
                    }
                    return Err(err.into());
                }
            };

        if cancel.is_cancelled() {
            return Err(anyhow!("top-stats refresh aborted before catalog"));
        }

        // Phase 2: idempotent catalog pass over the union, outside the
        // transaction
        let mut all_tracks = Vec::new();
        all_tracks.extend(tracks_short.iter().cloned());
        all_tracks.extend(tracks_medium.iter().cloned());
        all_tracks.extend(tracks_long.iter().cloned());
        let mut all_artists = Vec::new();
        all_artists.extend(artists_short.iter().cloned());
        all_artists.extend(artists_medium.iter().cloned());
        all_artists.extend(artists_long.iter().cloned());

        let maps = self
            .catalog
            .upsert_batch(user_id, &all_tracks, &all_artists)
            .await
            .context("catalog upsert for top stats failed")?;

        let track_lists = [
            (Term::Short, &tracks_short),
            (Term::Medium, &tracks_medium),
            (Term::Long, &tracks_long),
        ];
        let artist_lists = [
            (Term::Short, &artists_short),
            (Term::Medium, &artists_medium),
            (Term::Long, &artists_long),
        ];

        // (kind, term, rank, track_id, artist_id), ranks contiguous per list
        let mut rows: Vec<(TopKind, Term, i32, Option<Uuid>, Option<Uuid>)> = Vec::new();
        for (term, tracks) in track_lists {
            let mut rank = 0;
            for track in tracks.iter() {
                if let Some(track_id) = maps.tracks.get(&track.provider_id) {
                    rank += 1;
                    rows.push((TopKind::Tracks, term, rank, Some(*track_id), None));
                }
            }
        }
        for (term, artists) in artist_lists {
            let mut rank = 0;
            for artist in artists.iter() {
                if let Some(artist_id) = maps.artists.get(&artist.provider_id) {
                    rank += 1;
                    rows.push((TopKind::Artists, term, rank, None, Some(*artist_id)));
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(anyhow!("top-stats refresh aborted before commit"));
        }

        // Phase 3: one transaction, serialized per user by the row lock
        let commit = async {
            let mut tx = self.pool.begin().await?;

            sqlx::query("SELECT id FROM users WHERE id = $1 FOR UPDATE")
                .bind(user_id)
                .fetch_one(&mut *tx)
                .await?;

            sqlx::query("DELETE FROM top_entries WHERE user_id = $1")
                .bind(user_id)
                .execute(&mut *tx)
                .await?;

            if !rows.is_empty() {
                let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                    "INSERT INTO top_entries (user_id, kind, term, rank, track_id, artist_id) ",
                );
                builder.push_values(rows.iter(), |mut b, (kind, term, rank, track_id, artist_id)| {
                    b.push_bind(user_id)
                        .push_bind(*kind)
                        .push_bind(*term)
                        .push_bind(*rank)
                        .push_bind(*track_id)
                        .push_bind(*artist_id);
                });
                builder.build().execute(&mut *tx).await?;
            }

            sqlx::query("UPDATE users SET top_stats_refreshed_at = $2 WHERE id = $1")
                .bind(user_id)
                .bind(Utc::now())
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
            Ok::<_, sqlx::Error>(())
        };
        tokio::time::timeout(COMMIT_TIMEOUT, commit)
            .await
            .map_err(|_| anyhow!("top-stats commit timed out"))??;

        info!(user_id = %user_id, entries = rows.len(), "Top stats refreshed");
        Ok(())
    }

    /// Enqueue a high-priority refresh if the cache is stale. One pending
    /// job per user via the natural job id; never blocks the caller.
    pub async fn trigger_lazy_refresh_if_stale(&self, user: &User) -> Result<()> {
        if !user.top_stats_refresh_needed(Utc::now()) {
            return Ok(());
        }
        let payload = serde_json::to_value(RefreshTopStatsJob { user_id: user.id })?;
        self.queue
            .add(
                "refresh_top_stats",
                payload,
                JobOptions::with_job_id(format!("top_stats:{}", user.id))
                    .priority(JobPriority::High),
            )
            .await?;
        Ok(())
    }

    /// Read the cached top tracks for a term, refreshing synchronously
    /// first when the cache is more than an hour old. Used by top-50
    /// playlist creation, which needs fresh ranks.
    pub async fn ensure_top_tracks_cached(
        &self,
        user_id: Uuid,
        term: Term,
    ) -> Result<Vec<RankedTrack>> {
        let refreshed_at: Option<(Option<chrono::DateTime<Utc>>,)> =
            sqlx::query_as("SELECT top_stats_refreshed_at FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        let refreshed_at = refreshed_at
            .ok_or_else(|| anyhow!("User {} not found", user_id))?
            .0;

        let stale = match refreshed_at {
            None => true,
            Some(at) => Utc::now() - at > SYNCHRONOUS_REFRESH_AGE,
        };
        if stale {
            self.refresh_user(user_id, &CancellationToken::new()).await?;
        }

        let tracks = sqlx::query_as::<_, RankedTrack>(
            "SELECT e.track_id, t.provider_id, e.rank FROM top_entries e \
             JOIN tracks t ON t.id = e.track_id \
             WHERE e.user_id = $1 AND e.kind = 'tracks' AND e.term = $2 \
             ORDER BY e.rank",
        )
        .bind(user_id)
        .bind(term)
        .fetch_all(&self.pool)
        .await?;
        Ok(tracks)
    }
}

/// Queue handler wrapping [`TopStatsService::refresh_user`].
/// Holds the process shutdown token so an exiting worker aborts cleanly at
/// the next phase boundary.
pub struct TopStatsJobHandler {
    service: Arc<TopStatsService>,
    shutdown: CancellationToken,
}

impl TopStatsJobHandler {
    pub fn new(service: Arc<TopStatsService>, shutdown: CancellationToken) -> Self {
        Self { service, shutdown }
    }
}

#[async_trait]
impl JobHandler for TopStatsJobHandler {
    async fn handle(&self, job: &QueuedJob) -> Result<JobOutcome> {
        let payload: RefreshTopStatsJob = serde_json::from_value(job.payload.clone())
            .context("top-stats job payload malformed")?;
        self.service
            .refresh_user(payload.user_id, &self.shutdown)
            .await?;
        Ok(JobOutcome::Completed(serde_json::json!({"refreshed": true})))
    }

    fn max_execution_time(&self) -> Duration {
        Duration::from_secs(180)
    }
}
