//! Database and shared-store pool construction
//!
//! The Postgres pool is the sole owner of durable state; the Redis pool
//! backs the job queues, distributed locks, and rate-limit counters.
//! Worker pools take their own connections from these pools so request
//! handlers are never starved by background work.

use deadpool_redis::{Config as RedisPoolConfig, Pool as RedisPool, Runtime};
use redis::AsyncCommands;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::config::{DatabaseSettings, RedisSettings};

/// Create the Postgres connection pool
pub async fn create_pool(settings: &DatabaseSettings) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .acquire_timeout(settings.connection_timeout)
        .connect(&settings.url)
        .await?;

    Ok(pool)
}

/// Create the Redis connection pool
pub fn create_redis_pool(settings: &RedisSettings) -> anyhow::Result<RedisPool> {
    let config = RedisPoolConfig::from_url(&settings.url);
    let pool = config.create_pool(Some(Runtime::Tokio1))?;
    Ok(pool)
}

/// Verify the database answers a trivial query
pub async fn health_check(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Verify the shared store answers a PING
pub async fn redis_health_check(pool: &RedisPool) -> anyhow::Result<()> {
    let mut conn = pool.get().await?;
    let _: String = redis::cmd("PING").query_async(&mut *conn).await?;
    Ok(())
}

/// Best-effort read of a shared-store key, used by health reporting
pub async fn redis_get_string(pool: &RedisPool, key: &str) -> anyhow::Result<Option<String>> {
    let mut conn = pool.get().await?;
    let value: Option<String> = conn.get(key).await?;
    Ok(value)
}
