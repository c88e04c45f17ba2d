//! Set-based catalog upserts
//!
//! Turns batches of raw provider entities into stable internal ids without
//! per-row round-trips: dedup in memory, `INSERT .. ON CONFLICT DO
//! NOTHING` per entity kind, then one re-select per kind to build the
//! providerId -> id maps. Round-trip count is constant regardless of batch
//! size.
//!
//! The only side effect beyond the inserts is enqueueing artists observed
//! without an image into the artist-metadata queue; natural job ids make
//! that append idempotent under retries.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::{CatalogArtist, CatalogIdMaps, CatalogTrack};
use crate::services::circuit_breaker::CircuitBreakerRegistry;
use crate::services::job_queue::{JobHandler, JobOptions, JobOutcome, JobQueue, QueuedJob};
use crate::services::provider::ProviderApi;
use crate::services::rate_limiter::AdaptiveRateLimiter;
use crate::services::token_manager::TokenManager;

pub struct CatalogService {
    pool: PgPool,
    artist_metadata_queue: JobQueue,
}

impl CatalogService {
    pub fn new(pool: PgPool, artist_metadata_queue: JobQueue) -> Self {
        Self {
            pool,
            artist_metadata_queue,
        }
    }

    /// Upsert a batch of tracks (with their embedded albums and artists)
    /// plus any standalone artists, returning providerId -> internal id
    /// maps for everything referenced.
    pub async fn upsert_batch(
        &self,
        user_id: Uuid,
        tracks: &[CatalogTrack],
        extra_artists: &[CatalogArtist],
    ) -> Result<CatalogIdMaps> {
        // Dedup across the batch in memory
        let mut artists: HashMap<&str, &CatalogArtist> = HashMap::new();
        let mut albums = HashMap::new();
        let mut unique_tracks: HashMap<&str, &CatalogTrack> = HashMap::new();

        for track in tracks {
            unique_tracks.entry(track.provider_id.as_str()).or_insert(track);
            for artist in &track.artists {
                artists.entry(artist.provider_id.as_str()).or_insert(artist);
            }
            if let Some(album) = &track.album {
                albums.entry(album.provider_id.as_str()).or_insert(album);
            }
        }
        for artist in extra_artists {
            artists.entry(artist.provider_id.as_str()).or_insert(artist);
        }

        let mut maps = CatalogIdMaps::default();
        if artists.is_empty() && albums.is_empty() && unique_tracks.is_empty() {
            return Ok(maps);
        }

        let now = Utc::now();

        // Artists, then albums, then tracks; later kinds reference earlier
        // maps by provider id.
        if !artists.is_empty() {
            let mut builder: QueryBuilder<Postgres> =
                QueryBuilder::new("INSERT INTO artists (id, provider_id, name, image_url, created_at) ");
            builder.push_values(artists.values(), |mut b, artist| {
                b.push_bind(Uuid::new_v4())
                    .push_bind(&artist.provider_id)
                    .push_bind(&artist.name)
                    .push_bind(&artist.image_url)
                    .push_bind(now);
            });
            builder.push(" ON CONFLICT (provider_id) DO NOTHING");
            builder.build().execute(&self.pool).await?;

            maps.artists = self
                .select_ids("artists", artists.keys().map(|k| k.to_string()).collect())
                .await?;
        }

        if !albums.is_empty() {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO albums (id, provider_id, name, image_url, release_date, created_at) ",
            );
            builder.push_values(albums.values(), |mut b, album| {
                b.push_bind(Uuid::new_v4())
                    .push_bind(&album.provider_id)
                    .push_bind(&album.name)
                    .push_bind(&album.image_url)
                    .push_bind(&album.release_date)
                    .push_bind(now);
            });
            builder.push(" ON CONFLICT (provider_id) DO NOTHING");
            builder.build().execute(&self.pool).await?;

            maps.albums = self
                .select_ids("albums", albums.keys().map(|k| k.to_string()).collect())
                .await?;
        }

        if !unique_tracks.is_empty() {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO tracks (id, provider_id, name, duration_ms, preview_url, album_id, created_at) ",
            );
            builder.push_values(unique_tracks.values(), |mut b, track| {
                let album_id = track
                    .album
                    .as_ref()
                    .and_then(|a| maps.albums.get(&a.provider_id).copied());
                b.push_bind(Uuid::new_v4())
                    .push_bind(&track.provider_id)
                    .push_bind(&track.name)
                    .push_bind(track.duration_ms)
                    .push_bind(&track.preview_url)
                    .push_bind(album_id)
                    .push_bind(now);
            });
            builder.push(" ON CONFLICT (provider_id) DO NOTHING");
            builder.build().execute(&self.pool).await?;

            maps.tracks = self
                .select_ids(
                    "tracks",
                    unique_tracks.keys().map(|k| k.to_string()).collect(),
                )
                .await?;

            // Join rows, deduplicated the same way the entities were
            let mut join_rows: HashSet<(Uuid, Uuid)> = HashSet::new();
            for track in unique_tracks.values() {
                let Some(track_id) = maps.tracks.get(&track.provider_id) else {
                    continue;
                };
                for artist in &track.artists {
                    if let Some(artist_id) = maps.artists.get(&artist.provider_id) {
                        join_rows.insert((*track_id, *artist_id));
                    }
                }
            }

            if !join_rows.is_empty() {
                let mut builder: QueryBuilder<Postgres> =
                    QueryBuilder::new("INSERT INTO track_artists (track_id, artist_id) ");
                builder.push_values(join_rows.iter(), |mut b, (track_id, artist_id)| {
                    b.push_bind(track_id).push_bind(artist_id);
                });
                builder.push(" ON CONFLICT DO NOTHING");
                builder.build().execute(&self.pool).await?;
            }
        }

        self.enqueue_artist_enrichment(user_id, &artists).await;

        debug!(
            artists = maps.artists.len(),
            albums = maps.albums.len(),
            tracks = maps.tracks.len(),
            "Catalog batch upserted"
        );
        Ok(maps)
    }

    async fn select_ids(
        &self,
        table: &str,
        provider_ids: Vec<String>,
    ) -> Result<HashMap<String, Uuid>> {
        let rows: Vec<(String, Uuid)> = sqlx::query_as(&format!(
            "SELECT provider_id, id FROM {} WHERE provider_id = ANY($1)",
            table
        ))
        .bind(&provider_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    /// Queue image enrichment for artists that arrived without one.
    /// Best effort: a lost enqueue is repaired on the next sighting.
    async fn enqueue_artist_enrichment(
        &self,
        user_id: Uuid,
        artists: &HashMap<&str, &CatalogArtist>,
    ) {
        for artist in artists.values() {
            if artist.image_url.is_some() {
                continue;
            }
            let payload = match serde_json::to_value(ArtistMetadataJob {
                artist_provider_id: artist.provider_id.clone(),
                user_id,
            }) {
                Ok(payload) => payload,
                Err(_) => continue,
            };
            let options = JobOptions::with_job_id(format!("artist_meta:{}", artist.provider_id));
            if let Err(e) = self
                .artist_metadata_queue
                .add("artist_metadata", payload, options)
                .await
            {
                warn!(
                    artist = %artist.provider_id,
                    error = %e,
                    "Failed to enqueue artist enrichment"
                );
            }
        }
    }
}

/// Payload of one artist-metadata enrichment job
#[derive(Debug, Serialize, Deserialize)]
pub struct ArtistMetadataJob {
    pub artist_provider_id: String,
    pub user_id: Uuid,
}

/// Background worker that backfills missing artist images
pub struct ArtistMetadataHandler {
    pool: PgPool,
    provider: Arc<dyn ProviderApi>,
    tokens: Arc<TokenManager>,
    limiter: Arc<AdaptiveRateLimiter>,
    breakers: Arc<CircuitBreakerRegistry>,
}

impl ArtistMetadataHandler {
    pub fn new(
        pool: PgPool,
        provider: Arc<dyn ProviderApi>,
        tokens: Arc<TokenManager>,
        limiter: Arc<AdaptiveRateLimiter>,
        breakers: Arc<CircuitBreakerRegistry>,
    ) -> Self {
        Self {
            pool,
            provider,
            tokens,
            limiter,
            breakers,
        }
    }
}

#[async_trait]
impl JobHandler for ArtistMetadataHandler {
    async fn handle(&self, job: &QueuedJob) -> Result<JobOutcome> {
        let payload: ArtistMetadataJob = serde_json::from_value(job.payload.clone())?;

        let Some(access) = self.tokens.get_valid_access_token(payload.user_id).await? else {
            // Requester disconnected; another user's sync will re-enqueue
            return Ok(JobOutcome::Completed(serde_json::json!({"skipped": true})));
        };

        self.limiter.acquire().await;
        let ids = vec![payload.artist_provider_id.clone()];
        let result = self
            .breakers
            .execute("catalog", || self.provider.artists(&access.token, &ids))
            .await;

        let fetched = match result {
            Ok(fetched) => {
                self.limiter.record_success().await;
                fetched
            }
            Err(crate::error::ProviderError::RateLimited {
                retry_after_seconds,
            }) => {
                self.limiter.handle_rate_limit(retry_after_seconds).await;
                return Ok(JobOutcome::Reschedule {
                    delay: std::time::Duration::from_secs(retry_after_seconds),
                });
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(artist) = fetched.into_iter().find(|a| a.image_url.is_some()) {
            sqlx::query(
                "UPDATE artists SET image_url = $2 \
                 WHERE provider_id = $1 AND image_url IS NULL",
            )
            .bind(&artist.provider_id)
            .bind(&artist.image_url)
            .execute(&self.pool)
            .await?;
        }

        Ok(JobOutcome::Completed(serde_json::json!({"enriched": true})))
    }

    fn max_execution_time(&self) -> std::time::Duration {
        std::time::Duration::from_secs(60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CatalogAlbum;

    fn artist(id: &str, image: Option<&str>) -> CatalogArtist {
        CatalogArtist {
            provider_id: id.to_string(),
            name: format!("artist {}", id),
            image_url: image.map(|s| s.to_string()),
        }
    }

    fn track(id: &str, artist_ids: &[&str], album_id: Option<&str>) -> CatalogTrack {
        CatalogTrack {
            provider_id: id.to_string(),
            name: format!("track {}", id),
            duration_ms: 180_000,
            preview_url: None,
            is_local: false,
            album: album_id.map(|a| CatalogAlbum {
                provider_id: a.to_string(),
                name: format!("album {}", a),
                image_url: None,
                release_date: None,
            }),
            artists: artist_ids.iter().map(|a| artist(a, None)).collect(),
        }
    }

    #[test]
    fn batch_dedup_collapses_repeats() {
        let tracks = vec![
            track("t1", &["a1", "a2"], Some("al1")),
            track("t1", &["a1", "a2"], Some("al1")),
            track("t2", &["a1"], Some("al1")),
        ];
        let extra = vec![artist("a3", Some("http://img"))];

        let mut artists: HashMap<&str, &CatalogArtist> = HashMap::new();
        let mut albums = HashMap::new();
        let mut unique_tracks: HashMap<&str, &CatalogTrack> = HashMap::new();
        for t in &tracks {
            unique_tracks.entry(t.provider_id.as_str()).or_insert(t);
            for a in &t.artists {
                artists.entry(a.provider_id.as_str()).or_insert(a);
            }
            if let Some(al) = &t.album {
                albums.entry(al.provider_id.as_str()).or_insert(al);
            }
        }
        for a in &extra {
            artists.entry(a.provider_id.as_str()).or_insert(a);
        }

        assert_eq!(unique_tracks.len(), 2);
        assert_eq!(artists.len(), 3);
        assert_eq!(albums.len(), 1);
    }
}
