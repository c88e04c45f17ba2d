//! Pull ingestion of provider play history
//!
//! One sync job per user: read the cursor, pull up to one page of recent
//! plays, resolve the catalog, insert events keyed by
//! (user, track, played_at), fold the additions into the rollups, then
//! advance the cursor to the newest *added* play. A full page that made
//! temporal progress schedules a follow-up drain with a short random
//! delay, capped at five iterations.
//!
//! The same resolution table serves offline imports: an import may claim
//! an api event whose `ms_played` was estimated, never the other way
//! around.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::ProviderError;
use crate::models::{
    AddedPlay, CatalogIdMaps, EventSource, IngestSummary, ParsedEvent, TokenFailureReason, User,
    UserSettings,
};
use crate::services::aggregate::AggregationService;
use crate::services::catalog::CatalogService;
use crate::services::circuit_breaker::CircuitBreakerRegistry;
use crate::services::job_queue::{JobHandler, JobOptions, JobOutcome, JobQueue, QueuedJob};
use crate::services::provider::{ProviderApi, RECENTLY_PLAYED_MAX};
use crate::services::rate_limiter::AdaptiveRateLimiter;
use crate::services::token_manager::TokenManager;

/// Minimum gap between syncs for one user unless explicitly skipped
pub const SYNC_COOLDOWN: Duration = Duration::from_secs(5 * 60);
/// Cap on backlog-drain follow-ups per seed
pub const MAX_FOLLOWUP_ITERATIONS: u32 = 5;

/// Payload of one sync job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncUserJob {
    pub user_id: Uuid,
    #[serde(default)]
    pub skip_cooldown: bool,
    #[serde(default)]
    pub iteration: u32,
}

pub struct IngestService {
    pool: PgPool,
    provider: Arc<dyn ProviderApi>,
    tokens: Arc<TokenManager>,
    limiter: Arc<AdaptiveRateLimiter>,
    breakers: Arc<CircuitBreakerRegistry>,
    catalog: Arc<CatalogService>,
    aggregator: Arc<AggregationService>,
    sync_queue: JobQueue,
}

impl IngestService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: PgPool,
        provider: Arc<dyn ProviderApi>,
        tokens: Arc<TokenManager>,
        limiter: Arc<AdaptiveRateLimiter>,
        breakers: Arc<CircuitBreakerRegistry>,
        catalog: Arc<CatalogService>,
        aggregator: Arc<AggregationService>,
        sync_queue: JobQueue,
    ) -> Self {
        Self {
            pool,
            provider,
            tokens,
            limiter,
            breakers,
            catalog,
            aggregator,
            sync_queue,
        }
    }

    async fn load_user_and_settings(&self, user_id: Uuid) -> Result<(User, UserSettings)> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, provider_id, display_name, image_url, country, created_at, \
             last_login_at, last_ingested_at, top_stats_refreshed_at \
             FROM users WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| anyhow!("User {} not found", user_id))?;

        let settings = sqlx::query_as::<_, UserSettings>(
            "SELECT user_id, timezone, is_public_profile FROM user_settings WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .unwrap_or(UserSettings {
            user_id,
            timezone: "UTC".to_string(),
            is_public_profile: false,
        });

        Ok((user, settings))
    }

    /// Run one sync iteration for a user
    #[instrument(skip(self), fields(user_id = %job.user_id, iteration = job.iteration))]
    pub async fn sync_user(&self, job: &SyncUserJob) -> Result<IngestSummary> {
        let (user, settings) = self.load_user_and_settings(job.user_id).await?;
        let now = Utc::now();

        if !job.skip_cooldown {
            if let Some(last) = user.last_ingested_at {
                let since = (now - last).to_std().unwrap_or(Duration::ZERO);
                if since < SYNC_COOLDOWN {
                    return Ok(IngestSummary::default());
                }
            }
        }

        let access = self
            .tokens
            .get_valid_access_token(job.user_id)
            .await?
            .ok_or_else(|| anyhow!("User {} has no valid provider connection", job.user_id))?;

        let prior_cursor = user.last_ingested_at;
        let after_ms = prior_cursor.map(|c| c.timestamp_millis());

        self.limiter.acquire().await;
        let page = match self
            .breakers
            .execute("player", || {
                self.provider
                    .recently_played(&access.token, after_ms, RECENTLY_PLAYED_MAX)
            })
            .await
        {
            Ok(page) => {
                self.limiter.record_success().await;
                self.tokens.reset_token_failures(job.user_id).await?;
                page
            }
            Err(ProviderError::RateLimited {
                retry_after_seconds,
            }) => {
                self.limiter.handle_rate_limit(retry_after_seconds).await;
                return Err(ProviderError::RateLimited {
                    retry_after_seconds,
                }
                .into());
            }
            Err(err @ ProviderError::Unauthenticated) => {
                self.tokens
                    .record_token_failure(job.user_id, TokenFailureReason::Unauthenticated)
                    .await?;
                return Err(err.into());
            }
            Err(err) => return Err(err.into()),
        };

        if page.items.is_empty() {
            return Ok(IngestSummary::default());
        }

        let page_len = page.items.len();
        let oldest_in_page = page.items.iter().map(|i| i.played_at).min();

        // The feed does not report listen duration: estimate from the track
        // length and mark the row so an import can claim it later.
        let events: Vec<ParsedEvent> = page
            .items
            .into_iter()
            .map(|item| ParsedEvent {
                played_at: item.played_at,
                ms_played: item.track.duration_ms,
                is_estimated: true,
                source: EventSource::Api,
                track: item.track,
            })
            .collect();

        let tracks: Vec<_> = events.iter().map(|e| e.track.clone()).collect();
        let maps = self
            .catalog
            .upsert_batch(job.user_id, &tracks, &[])
            .await
            .context("catalog upsert failed")?;

        let (summary, added) = self.insert_api_events(job.user_id, &events, &maps).await?;

        let tz = settings.tz();
        self.aggregator.apply(job.user_id, &added, &tz).await?;

        if let Some(cursor) = added.iter().map(|p| p.played_at).max() {
            sqlx::query(
                "UPDATE users SET last_ingested_at = GREATEST(COALESCE(last_ingested_at, \
                 'epoch'::timestamptz), $2) WHERE id = $1",
            )
            .bind(job.user_id)
            .bind(cursor)
            .execute(&self.pool)
            .await?;
        }

        // Backlog drain: a full page whose oldest item made temporal
        // progress means more history is waiting behind it.
        let made_progress = match (oldest_in_page, prior_cursor) {
            (Some(oldest), Some(prior)) => oldest > prior,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if page_len == RECENTLY_PLAYED_MAX && made_progress && job.iteration < MAX_FOLLOWUP_ITERATIONS
        {
            let delay_ms = rand::thread_rng().gen_range(1000..=6000);
            let followup = SyncUserJob {
                user_id: job.user_id,
                skip_cooldown: true,
                iteration: job.iteration + 1,
            };
            self.sync_queue
                .add(
                    "sync_user",
                    serde_json::to_value(&followup)?,
                    JobOptions::default().delayed(Duration::from_millis(delay_ms)),
                )
                .await?;
            info!(
                user_id = %job.user_id,
                iteration = followup.iteration,
                delay_ms,
                "Follow-up sync enqueued"
            );
        }

        info!(
            user_id = %job.user_id,
            added = summary.added,
            skipped = summary.skipped,
            "Sync completed"
        );
        Ok(summary)
    }

    /// Insert api-sourced events; an existing row always wins.
    /// Returns the summary plus the added plays with resolved ids.
    async fn insert_api_events(
        &self,
        user_id: Uuid,
        events: &[ParsedEvent],
        maps: &CatalogIdMaps,
    ) -> Result<(IngestSummary, Vec<AddedPlay>)> {
        let mut summary = IngestSummary::default();

        let mut track_ids = Vec::new();
        let mut played_ats = Vec::new();
        let mut ms_playeds = Vec::new();
        let mut artist_ids_by_track: HashMap<Uuid, Vec<Uuid>> = HashMap::new();

        for event in events {
            let Some(track_id) = maps.tracks.get(&event.track.provider_id).copied() else {
                warn!(
                    track = %event.track.provider_id,
                    "Track missing from catalog maps, counting as error"
                );
                summary.errors += 1;
                continue;
            };
            track_ids.push(track_id);
            played_ats.push(event.played_at);
            ms_playeds.push(event.ms_played);
            artist_ids_by_track
                .entry(track_id)
                .or_insert_with(|| maps.artist_ids_for(&event.track));
        }

        if track_ids.is_empty() {
            return Ok((summary, Vec::new()));
        }

        let inserted: Vec<(Uuid, DateTime<Utc>, i64)> = sqlx::query_as(
            "INSERT INTO listening_events \
                 (user_id, track_id, played_at, ms_played, is_estimated, source) \
             SELECT $1, t.track_id, t.played_at, t.ms_played, TRUE, 'api' \
             FROM UNNEST($2::uuid[], $3::timestamptz[], $4::bigint[]) \
                 AS t(track_id, played_at, ms_played) \
             ON CONFLICT (user_id, track_id, played_at) DO NOTHING \
             RETURNING track_id, played_at, ms_played",
        )
        .bind(user_id)
        .bind(&track_ids)
        .bind(&played_ats)
        .bind(&ms_playeds)
        .fetch_all(&self.pool)
        .await?;

        summary.added = inserted.len() as u32;
        summary.skipped = (track_ids.len() - inserted.len()) as u32;

        let added = inserted
            .into_iter()
            .map(|(track_id, played_at, ms_played)| AddedPlay {
                artist_ids: artist_ids_by_track
                    .get(&track_id)
                    .cloned()
                    .unwrap_or_default(),
                track_id,
                played_at,
                ms_played,
            })
            .collect();

        Ok((summary, added))
    }

    /// Apply import-sourced events (offline history files).
    ///
    /// Resolution per (user, track, played_at):
    /// - no existing row: insert
    /// - existing estimated row: claim it with the measured duration
    /// - existing measured row: skip
    pub async fn ingest_import_events(
        &self,
        user_id: Uuid,
        events: Vec<ParsedEvent>,
        timezone: &chrono_tz::Tz,
    ) -> Result<IngestSummary> {
        let mut summary = IngestSummary::default();
        if events.is_empty() {
            return Ok(summary);
        }

        let tracks: Vec<_> = events.iter().map(|e| e.track.clone()).collect();
        let maps = self.catalog.upsert_batch(user_id, &tracks, &[]).await?;

        struct Candidate {
            track_id: Uuid,
            played_at: DateTime<Utc>,
            ms_played: i64,
            artist_ids: Vec<Uuid>,
        }

        let mut candidates = Vec::new();
        for event in &events {
            let Some(track_id) = maps.tracks.get(&event.track.provider_id).copied() else {
                summary.errors += 1;
                continue;
            };
            candidates.push(Candidate {
                track_id,
                played_at: event.played_at,
                ms_played: event.ms_played,
                artist_ids: maps.artist_ids_for(&event.track),
            });
        }
        if candidates.is_empty() {
            return Ok(summary);
        }

        let track_ids: Vec<Uuid> = candidates.iter().map(|c| c.track_id).collect();
        let played_ats: Vec<DateTime<Utc>> = candidates.iter().map(|c| c.played_at).collect();

        let existing: Vec<(Uuid, DateTime<Utc>, i64, bool)> = sqlx::query_as(
            "SELECT e.track_id, e.played_at, e.ms_played, e.is_estimated \
             FROM listening_events e \
             JOIN UNNEST($2::uuid[], $3::timestamptz[]) AS t(track_id, played_at) \
               ON e.track_id = t.track_id AND e.played_at = t.played_at \
             WHERE e.user_id = $1",
        )
        .bind(user_id)
        .bind(&track_ids)
        .bind(&played_ats)
        .fetch_all(&self.pool)
        .await?;

        let existing_by_key: HashMap<(Uuid, DateTime<Utc>), (i64, bool)> = existing
            .into_iter()
            .map(|(track_id, played_at, ms, est)| ((track_id, played_at), (ms, est)))
            .collect();

        let mut to_insert = Vec::new();
        let mut to_update = Vec::new();
        let mut ms_deltas = Vec::new();
        for candidate in candidates {
            match existing_by_key.get(&(candidate.track_id, candidate.played_at)) {
                None => to_insert.push(candidate),
                Some((old_ms, true)) => {
                    ms_deltas.push(AddedPlay {
                        track_id: candidate.track_id,
                        artist_ids: candidate.artist_ids.clone(),
                        played_at: candidate.played_at,
                        ms_played: candidate.ms_played - old_ms,
                    });
                    to_update.push(candidate);
                }
                Some((_, false)) => summary.skipped += 1,
            }
        }

        if !to_update.is_empty() {
            let update_tracks: Vec<Uuid> = to_update.iter().map(|c| c.track_id).collect();
            let update_played: Vec<DateTime<Utc>> = to_update.iter().map(|c| c.played_at).collect();
            let update_ms: Vec<i64> = to_update.iter().map(|c| c.ms_played).collect();

            sqlx::query(
                "UPDATE listening_events e SET \
                     ms_played = t.ms_played, is_estimated = FALSE, source = 'import' \
                 FROM UNNEST($2::uuid[], $3::timestamptz[], $4::bigint[]) \
                     AS t(track_id, played_at, ms_played) \
                 WHERE e.user_id = $1 AND e.track_id = t.track_id \
                   AND e.played_at = t.played_at AND e.is_estimated",
            )
            .bind(user_id)
            .bind(&update_tracks)
            .bind(&update_played)
            .bind(&update_ms)
            .execute(&self.pool)
            .await?;
            summary.updated = to_update.len() as u32;

            // Keep the rollup totals coherent with the corrected durations
            self.aggregator
                .apply_ms_deltas(user_id, &ms_deltas, timezone)
                .await?;
        }

        if !to_insert.is_empty() {
            let insert_tracks: Vec<Uuid> = to_insert.iter().map(|c| c.track_id).collect();
            let insert_played: Vec<DateTime<Utc>> = to_insert.iter().map(|c| c.played_at).collect();
            let insert_ms: Vec<i64> = to_insert.iter().map(|c| c.ms_played).collect();

            let inserted: Vec<(Uuid, DateTime<Utc>)> = sqlx::query_as(
                "INSERT INTO listening_events \
                     (user_id, track_id, played_at, ms_played, is_estimated, source) \
                 SELECT $1, t.track_id, t.played_at, t.ms_played, FALSE, 'import' \
                 FROM UNNEST($2::uuid[], $3::timestamptz[], $4::bigint[]) \
                     AS t(track_id, played_at, ms_played) \
                 ON CONFLICT (user_id, track_id, played_at) DO NOTHING \
                 RETURNING track_id, played_at",
            )
            .bind(user_id)
            .bind(&insert_tracks)
            .bind(&insert_played)
            .bind(&insert_ms)
            .fetch_all(&self.pool)
            .await?;

            summary.added = inserted.len() as u32;
            summary.skipped += (to_insert.len() - inserted.len()) as u32;

            let inserted_keys: std::collections::HashSet<(Uuid, DateTime<Utc>)> =
                inserted.into_iter().collect();
            let added: Vec<AddedPlay> = to_insert
                .into_iter()
                .filter(|c| inserted_keys.contains(&(c.track_id, c.played_at)))
                .map(|c| AddedPlay {
                    track_id: c.track_id,
                    artist_ids: c.artist_ids,
                    played_at: c.played_at,
                    ms_played: c.ms_played,
                })
                .collect();
            self.aggregator.apply(user_id, &added, timezone).await?;
        }

        Ok(summary)
    }
}

/// Queue handler wrapping [`IngestService::sync_user`]
pub struct SyncJobHandler {
    ingest: Arc<IngestService>,
}

impl SyncJobHandler {
    pub fn new(ingest: Arc<IngestService>) -> Self {
        Self { ingest }
    }
}

#[async_trait]
impl JobHandler for SyncJobHandler {
    async fn handle(&self, job: &QueuedJob) -> Result<JobOutcome> {
        let payload: SyncUserJob = serde_json::from_value(job.payload.clone())
            .context("sync job payload malformed")?;
        let summary = self.ingest.sync_user(&payload).await?;
        Ok(JobOutcome::Completed(serde_json::to_value(summary)?))
    }

    fn max_execution_time(&self) -> Duration {
        Duration::from_secs(120)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_job_payload_defaults() {
        let payload: SyncUserJob =
            serde_json::from_value(serde_json::json!({"user_id": Uuid::new_v4()})).unwrap();
        assert!(!payload.skip_cooldown);
        assert_eq!(payload.iteration, 0);
    }

    #[test]
    fn followup_iterations_are_capped() {
        assert_eq!(MAX_FOLLOWUP_ITERATIONS, 5);
        // An iteration-5 job never enqueues a sixth
        assert!(!(5u32 < MAX_FOLLOWUP_ITERATIONS));
        assert!(4u32 < MAX_FOLLOWUP_ITERATIONS);
    }
}
