//! Per-user rollup maintenance
//!
//! One pass over a batch of added plays builds four in-memory maps (track,
//! artist, local day, UTC hour); the four upsert groups are then issued
//! concurrently, each as a single array-based statement. Day buckets are
//! midnight in the user's timezone, stored as the equivalent UTC instant.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use crate::models::AddedPlay;

/// Start of `played_at`'s calendar day in `tz`, as a UTC instant.
///
/// DST gaps around midnight resolve to the earliest valid local time.
pub fn local_day_bucket(played_at: DateTime<Utc>, tz: &Tz) -> DateTime<Utc> {
    let local_date = played_at.with_timezone(tz).date_naive();
    let midnight = local_date.and_hms_opt(0, 0, 0).expect("midnight is valid");
    tz.from_local_datetime(&midnight)
        .earliest()
        .or_else(|| tz.from_local_datetime(&midnight).latest())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&midnight))
}

#[derive(Debug, Default)]
struct TrackAccumulator {
    play_count: i64,
    total_ms: i64,
    last_played_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct CountMsAccumulator {
    play_count: i64,
    total_ms: i64,
}

#[derive(Debug, Default)]
struct DayAccumulator {
    play_count: i64,
    total_ms: i64,
    tracks: HashSet<Uuid>,
}

pub struct AggregationService {
    pool: PgPool,
}

impl AggregationService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Fold a batch of added plays into the user's rollups
    pub async fn apply(&self, user_id: Uuid, plays: &[AddedPlay], timezone: &Tz) -> Result<()> {
        if plays.is_empty() {
            return Ok(());
        }

        let mut tracks: HashMap<Uuid, TrackAccumulator> = HashMap::new();
        let mut artists: HashMap<Uuid, CountMsAccumulator> = HashMap::new();
        let mut days: HashMap<DateTime<Utc>, DayAccumulator> = HashMap::new();
        let mut hours: HashMap<i16, CountMsAccumulator> = HashMap::new();

        for play in plays {
            let track = tracks.entry(play.track_id).or_default();
            track.play_count += 1;
            track.total_ms += play.ms_played;
            track.last_played_at = Some(match track.last_played_at {
                Some(prev) => prev.max(play.played_at),
                None => play.played_at,
            });

            for artist_id in &play.artist_ids {
                let artist = artists.entry(*artist_id).or_default();
                artist.play_count += 1;
                artist.total_ms += play.ms_played;
            }

            let day = days
                .entry(local_day_bucket(play.played_at, timezone))
                .or_default();
            day.play_count += 1;
            day.total_ms += play.ms_played;
            day.tracks.insert(play.track_id);

            use chrono::Timelike;
            let hour = hours.entry(play.played_at.hour() as i16).or_default();
            hour.play_count += 1;
            hour.total_ms += play.ms_played;
        }

        futures::try_join!(
            self.upsert_track_stats(user_id, &tracks),
            self.upsert_artist_stats(user_id, &artists),
            self.upsert_day_stats(user_id, &days),
            self.upsert_hour_stats(user_id, &hours),
        )?;

        debug!(
            user_id = %user_id,
            plays = plays.len(),
            tracks = tracks.len(),
            artists = artists.len(),
            "Rollups updated"
        );
        Ok(())
    }

    /// Fold duration corrections into the rollups without changing any
    /// play counts. Used when an import claims an estimated api event:
    /// `ms_played` on each delta is the signed difference between the
    /// measured and the estimated duration.
    pub async fn apply_ms_deltas(
        &self,
        user_id: Uuid,
        deltas: &[AddedPlay],
        timezone: &Tz,
    ) -> Result<()> {
        if deltas.is_empty() {
            return Ok(());
        }

        let mut tracks: HashMap<Uuid, TrackAccumulator> = HashMap::new();
        let mut artists: HashMap<Uuid, CountMsAccumulator> = HashMap::new();
        let mut days: HashMap<DateTime<Utc>, DayAccumulator> = HashMap::new();
        let mut hours: HashMap<i16, CountMsAccumulator> = HashMap::new();

        for delta in deltas {
            let track = tracks.entry(delta.track_id).or_default();
            track.total_ms += delta.ms_played;
            track.last_played_at = Some(match track.last_played_at {
                Some(prev) => prev.max(delta.played_at),
                None => delta.played_at,
            });

            for artist_id in &delta.artist_ids {
                artists.entry(*artist_id).or_default().total_ms += delta.ms_played;
            }
            days.entry(local_day_bucket(delta.played_at, timezone))
                .or_default()
                .total_ms += delta.ms_played;

            use chrono::Timelike;
            hours.entry(delta.played_at.hour() as i16).or_default().total_ms += delta.ms_played;
        }

        futures::try_join!(
            self.upsert_track_stats(user_id, &tracks),
            self.upsert_artist_stats(user_id, &artists),
            self.upsert_day_stats(user_id, &days),
            self.upsert_hour_stats(user_id, &hours),
        )?;
        Ok(())
    }

    async fn upsert_track_stats(
        &self,
        user_id: Uuid,
        tracks: &HashMap<Uuid, TrackAccumulator>,
    ) -> Result<()> {
        if tracks.is_empty() {
            return Ok(());
        }

        let mut track_ids = Vec::with_capacity(tracks.len());
        let mut counts = Vec::with_capacity(tracks.len());
        let mut totals = Vec::with_capacity(tracks.len());
        let mut last_played = Vec::with_capacity(tracks.len());
        for (track_id, acc) in tracks {
            track_ids.push(*track_id);
            counts.push(acc.play_count);
            totals.push(acc.total_ms);
            last_played.push(acc.last_played_at.expect("set for every accumulated track"));
        }

        sqlx::query(
            "INSERT INTO user_track_stats (user_id, track_id, play_count, total_ms, last_played_at) \
             SELECT $1, t.track_id, t.play_count, t.total_ms, t.last_played_at \
             FROM UNNEST($2::uuid[], $3::bigint[], $4::bigint[], $5::timestamptz[]) \
                 AS t(track_id, play_count, total_ms, last_played_at) \
             ON CONFLICT (user_id, track_id) DO UPDATE SET \
                 play_count = user_track_stats.play_count + EXCLUDED.play_count, \
                 total_ms = user_track_stats.total_ms + EXCLUDED.total_ms, \
                 last_played_at = GREATEST(user_track_stats.last_played_at, EXCLUDED.last_played_at)",
        )
        .bind(user_id)
        .bind(&track_ids)
        .bind(&counts)
        .bind(&totals)
        .bind(&last_played)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_artist_stats(
        &self,
        user_id: Uuid,
        artists: &HashMap<Uuid, CountMsAccumulator>,
    ) -> Result<()> {
        if artists.is_empty() {
            return Ok(());
        }

        let mut artist_ids = Vec::with_capacity(artists.len());
        let mut counts = Vec::with_capacity(artists.len());
        let mut totals = Vec::with_capacity(artists.len());
        for (artist_id, acc) in artists {
            artist_ids.push(*artist_id);
            counts.push(acc.play_count);
            totals.push(acc.total_ms);
        }

        sqlx::query(
            "INSERT INTO user_artist_stats (user_id, artist_id, play_count, total_ms) \
             SELECT $1, t.artist_id, t.play_count, t.total_ms \
             FROM UNNEST($2::uuid[], $3::bigint[], $4::bigint[]) \
                 AS t(artist_id, play_count, total_ms) \
             ON CONFLICT (user_id, artist_id) DO UPDATE SET \
                 play_count = user_artist_stats.play_count + EXCLUDED.play_count, \
                 total_ms = user_artist_stats.total_ms + EXCLUDED.total_ms",
        )
        .bind(user_id)
        .bind(&artist_ids)
        .bind(&counts)
        .bind(&totals)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_day_stats(
        &self,
        user_id: Uuid,
        days: &HashMap<DateTime<Utc>, DayAccumulator>,
    ) -> Result<()> {
        if days.is_empty() {
            return Ok(());
        }

        let mut buckets = Vec::with_capacity(days.len());
        let mut counts = Vec::with_capacity(days.len());
        let mut totals = Vec::with_capacity(days.len());
        let mut uniques = Vec::with_capacity(days.len());
        for (bucket, acc) in days {
            buckets.push(*bucket);
            counts.push(acc.play_count);
            totals.push(acc.total_ms);
            uniques.push(acc.tracks.len() as i64);
        }

        sqlx::query(
            "INSERT INTO user_time_bucket_stats \
                 (user_id, bucket_type, bucket_date, play_count, total_ms, unique_tracks) \
             SELECT $1, 'day', t.bucket_date, t.play_count, t.total_ms, t.unique_tracks \
             FROM UNNEST($2::timestamptz[], $3::bigint[], $4::bigint[], $5::bigint[]) \
                 AS t(bucket_date, play_count, total_ms, unique_tracks) \
             ON CONFLICT (user_id, bucket_type, bucket_date) DO UPDATE SET \
                 play_count = user_time_bucket_stats.play_count + EXCLUDED.play_count, \
                 total_ms = user_time_bucket_stats.total_ms + EXCLUDED.total_ms, \
                 unique_tracks = user_time_bucket_stats.unique_tracks + EXCLUDED.unique_tracks",
        )
        .bind(user_id)
        .bind(&buckets)
        .bind(&counts)
        .bind(&totals)
        .bind(&uniques)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_hour_stats(
        &self,
        user_id: Uuid,
        hours: &HashMap<i16, CountMsAccumulator>,
    ) -> Result<()> {
        if hours.is_empty() {
            return Ok(());
        }

        let mut hour_keys = Vec::with_capacity(hours.len());
        let mut counts = Vec::with_capacity(hours.len());
        let mut totals = Vec::with_capacity(hours.len());
        for (hour, acc) in hours {
            hour_keys.push(*hour);
            counts.push(acc.play_count);
            totals.push(acc.total_ms);
        }

        sqlx::query(
            "INSERT INTO user_hour_stats (user_id, hour, play_count, total_ms) \
             SELECT $1, t.hour, t.play_count, t.total_ms \
             FROM UNNEST($2::smallint[], $3::bigint[], $4::bigint[]) \
                 AS t(hour, play_count, total_ms) \
             ON CONFLICT (user_id, hour) DO UPDATE SET \
                 play_count = user_hour_stats.play_count + EXCLUDED.play_count, \
                 total_ms = user_hour_stats.total_ms + EXCLUDED.total_ms",
        )
        .bind(user_id)
        .bind(&hour_keys)
        .bind(&counts)
        .bind(&totals)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn same_local_day_maps_to_one_bucket() {
        let tz: Tz = "America/New_York".parse().unwrap();
        // Both are Jan 15 in New York even though the second crosses a UTC day
        let morning = Utc.with_ymd_and_hms(2025, 1, 15, 13, 0, 0).unwrap();
        let late_night = Utc.with_ymd_and_hms(2025, 1, 16, 2, 30, 0).unwrap();

        assert_eq!(
            local_day_bucket(morning, &tz),
            local_day_bucket(late_night, &tz)
        );
    }

    #[test]
    fn different_local_days_map_to_different_buckets() {
        let tz: Tz = "America/New_York".parse().unwrap();
        // 04:59 UTC is Jan 14 23:59 in New York; 05:01 UTC is Jan 15 00:01
        let before = Utc.with_ymd_and_hms(2025, 1, 15, 4, 59, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2025, 1, 15, 5, 1, 0).unwrap();

        assert_ne!(local_day_bucket(before, &tz), local_day_bucket(after, &tz));
    }

    #[test]
    fn bucket_is_local_midnight_as_utc_instant() {
        let tz: Tz = "Asia/Tokyo".parse().unwrap();
        let played = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap(); // 19:00 JST
        let bucket = local_day_bucket(played, &tz);
        // Midnight June 1 JST is 15:00 UTC on May 31
        assert_eq!(bucket, Utc.with_ymd_and_hms(2025, 5, 31, 15, 0, 0).unwrap());
    }

    #[test]
    fn utc_timezone_buckets_on_utc_midnight() {
        let tz = chrono_tz::UTC;
        let played = Utc.with_ymd_and_hms(2025, 3, 10, 17, 45, 12).unwrap();
        assert_eq!(
            local_day_bucket(played, &tz),
            Utc.with_ymd_and_hms(2025, 3, 10, 0, 0, 0).unwrap()
        );
    }
}
