//! Periodic seeding, partition provisioning and stale-import cleanup
//!
//! The process exposes these as secret-guarded endpoints; an external
//! wall-clock source drives them. Seeding is fleet-safe: `seed-sync` runs
//! under a short distributed lock and every seeded job carries a natural
//! id, so overlapping cron ticks cannot double-enqueue.

use anyhow::Result;
use chrono::{Datelike, NaiveDate, Utc};
use deadpool_redis::Pool as RedisPool;
use rand::Rng;
use serde::Serialize;
use sqlx::PgPool;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::models::EngagementTier;
use crate::services::ingest::SyncUserJob;
use crate::services::job_queue::{JobOptions, JobPriority, JobQueue};
use crate::services::top_stats::RefreshTopStatsJob;

/// Distributed lock around sync seeding
const SYNC_LOCK_KEY: &str = "cron:sync:lock";
const SYNC_LOCK_TTL_SECONDS: u64 = 240;

/// Months of event partitions provisioned ahead
const PARTITION_MONTHS_AHEAD: u32 = 4;

/// Maximum random jitter on seeded top-stats jobs
const TOP_STATS_JITTER: Duration = Duration::from_secs(4 * 3600);

/// Result of one seeding run
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SeedSummary {
    pub enqueued: u64,
    /// True when another instance held the lock and nothing ran
    pub lock_held_elsewhere: bool,
}

pub struct SchedulerService {
    pool: PgPool,
    redis: RedisPool,
    sync_queue: JobQueue,
    top_stats_queue: JobQueue,
}

impl SchedulerService {
    pub fn new(
        pool: PgPool,
        redis: RedisPool,
        sync_queue: JobQueue,
        top_stats_queue: JobQueue,
    ) -> Self {
        Self {
            pool,
            redis,
            sync_queue,
            top_stats_queue,
        }
    }

    async fn try_acquire_sync_lock(&self) -> Result<bool> {
        let mut conn = self.redis.get().await?;
        let token = Uuid::new_v4().to_string();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(SYNC_LOCK_KEY)
            .arg(&token)
            .arg("NX")
            .arg("EX")
            .arg(SYNC_LOCK_TTL_SECONDS)
            .query_async(&mut *conn)
            .await?;
        Ok(acquired.is_some())
    }

    /// Enqueue sync jobs for every eligible user: connected, and either
    /// never ingested or due again while recently active.
    #[instrument(skip(self))]
    pub async fn seed_sync(&self) -> Result<SeedSummary> {
        if !self.try_acquire_sync_lock().await? {
            info!("Sync seeding skipped, lock held elsewhere");
            return Ok(SeedSummary {
                enqueued: 0,
                lock_held_elsewhere: true,
            });
        }

        let users: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT u.id FROM users u \
             JOIN auth_records a ON a.user_id = u.id \
             WHERE a.is_valid \
               AND (u.last_ingested_at IS NULL \
                    OR (u.last_ingested_at < NOW() - INTERVAL '5 minutes' \
                        AND u.last_login_at >= NOW() - INTERVAL '7 days'))",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut enqueued = 0;
        for (user_id,) in users {
            let payload = serde_json::to_value(SyncUserJob {
                user_id,
                skip_cooldown: false,
                iteration: 0,
            })?;
            match self
                .sync_queue
                .add(
                    "sync_user",
                    payload,
                    JobOptions::with_job_id(format!("sync:{}", user_id)),
                )
                .await
            {
                Ok(_) => enqueued += 1,
                Err(e) => warn!(user_id = %user_id, error = %e, "Failed to seed sync job"),
            }
        }

        info!(enqueued, "Sync seeding complete");
        Ok(SeedSummary {
            enqueued,
            lock_held_elsewhere: false,
        })
    }

    /// Enqueue top-stats refreshes for tier-1 and tier-2 users, jittered
    /// across four hours so the provider budget is not spent in one burst.
    #[instrument(skip(self))]
    pub async fn seed_top_stats(&self) -> Result<SeedSummary> {
        let users: Vec<(Uuid, Option<chrono::DateTime<Utc>>)> = sqlx::query_as(
            "SELECT u.id, u.last_login_at FROM users u \
             JOIN auth_records a ON a.user_id = u.id \
             WHERE a.is_valid AND u.last_login_at >= NOW() - INTERVAL '7 days'",
        )
        .fetch_all(&self.pool)
        .await?;

        let now = Utc::now();
        let mut enqueued = 0;
        for (user_id, last_login_at) in users {
            let tier = EngagementTier::classify(last_login_at, now);
            let priority = match tier {
                EngagementTier::Active => JobPriority::Normal,
                _ => JobPriority::Low,
            };
            let jitter =
                Duration::from_secs(rand::thread_rng().gen_range(0..TOP_STATS_JITTER.as_secs()));

            let payload = serde_json::to_value(RefreshTopStatsJob { user_id })?;
            match self
                .top_stats_queue
                .add(
                    "refresh_top_stats",
                    payload,
                    JobOptions::with_job_id(format!("top_stats:{}", user_id))
                        .priority(priority)
                        .delayed(jitter),
                )
                .await
            {
                Ok(_) => enqueued += 1,
                Err(e) => warn!(user_id = %user_id, error = %e, "Failed to seed top-stats job"),
            }
        }

        info!(enqueued, "Top-stats seeding complete");
        Ok(SeedSummary {
            enqueued,
            lock_held_elsewhere: false,
        })
    }

    /// Ensure monthly partitions of `listening_events` exist for the next
    /// four months, each with its unique (user, track, played_at) index.
    /// Idempotent: existing partitions are left untouched.
    #[instrument(skip(self))]
    pub async fn manage_partitions(&self) -> Result<Vec<String>> {
        let today = Utc::now().date_naive();
        let mut ensured = Vec::new();

        for offset in 0..PARTITION_MONTHS_AHEAD {
            let start = add_months(first_of_month(today), offset);
            let end = add_months(start, 1);
            let name = partition_name(start);

            let create = format!(
                "CREATE TABLE IF NOT EXISTS {name} PARTITION OF listening_events \
                 FOR VALUES FROM ('{start}') TO ('{end}')",
                name = name,
                start = start,
                end = end,
            );
            sqlx::query(&create).execute(&self.pool).await?;

            let index = format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {name}_user_track_played_key \
                 ON {name} (user_id, track_id, played_at)",
                name = name,
            );
            sqlx::query(&index).execute(&self.pool).await?;

            ensured.push(name);
        }

        info!(partitions = ?ensured, "Event partitions ensured");
        Ok(ensured)
    }

    /// Fail PENDING import jobs older than five minutes
    #[instrument(skip(self))]
    pub async fn cleanup_stale_imports(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE import_jobs SET status = 'failed', \
                 error_message = 'import stalled before processing', updated_at = NOW() \
             WHERE status = 'pending' AND created_at < NOW() - INTERVAL '5 minutes'",
        )
        .execute(&self.pool)
        .await?;

        let failed = result.rows_affected();
        if failed > 0 {
            info!(failed, "Stale import jobs moved to FAILED");
        }
        Ok(failed)
    }
}

fn first_of_month(date: NaiveDate) -> NaiveDate {
    NaiveDate::from_ymd_opt(date.year(), date.month(), 1).expect("first of month is valid")
}

fn add_months(date: NaiveDate, months: u32) -> NaiveDate {
    let zero_based = date.month0() + months;
    let year = date.year() + (zero_based / 12) as i32;
    let month = zero_based % 12 + 1;
    NaiveDate::from_ymd_opt(year, month, 1).expect("computed month is valid")
}

/// Partition naming scheme: `listening_events_y2025m08`
fn partition_name(month_start: NaiveDate) -> String {
    format!(
        "listening_events_y{:04}m{:02}",
        month_start.year(),
        month_start.month()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_names_are_zero_padded() {
        let march = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
        assert_eq!(partition_name(march), "listening_events_y2025m03");

        let december = NaiveDate::from_ymd_opt(2025, 12, 1).unwrap();
        assert_eq!(partition_name(december), "listening_events_y2025m12");
    }

    #[test]
    fn month_arithmetic_rolls_over_years() {
        let november = NaiveDate::from_ymd_opt(2025, 11, 1).unwrap();
        assert_eq!(
            add_months(november, 3),
            NaiveDate::from_ymd_opt(2026, 2, 1).unwrap()
        );
        assert_eq!(add_months(november, 0), november);
    }

    #[test]
    fn four_consecutive_partitions_from_mid_month() {
        let today = NaiveDate::from_ymd_opt(2025, 11, 17).unwrap();
        let names: Vec<String> = (0..PARTITION_MONTHS_AHEAD)
            .map(|offset| partition_name(add_months(first_of_month(today), offset)))
            .collect();
        assert_eq!(
            names,
            vec![
                "listening_events_y2025m11",
                "listening_events_y2025m12",
                "listening_events_y2026m01",
                "listening_events_y2026m02",
            ]
        );
    }
}
