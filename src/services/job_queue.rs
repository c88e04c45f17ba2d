//! Durable Redis-backed job queues and worker pools
//!
//! Each logical queue (sync, top-stats, playlist, artist-metadata) is a
//! sorted set of job ids scored by their scheduled time, with the job body
//! stored under its own key. Jobs may carry a caller-chosen id for
//! natural-key deduplication. Retries are handled at the queue level with
//! exponential backoff; handlers can also ask for a plain reschedule that
//! does not consume an attempt (the playlist 429 path).
//!
//! Cross-worker pause coordination uses a shared `<queue>:pause_until` key
//! holding the maximum pause instant; only a resumer that observes the
//! stored instant as elapsed removes the key and resumes the queue.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use deadpool_redis::Pool;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::metrics::MetricsCollector;

/// Default maximum delivery attempts per job
pub const DEFAULT_ATTEMPTS: u32 = 5;
/// Base delay for exponential retry backoff
pub const DEFAULT_BACKOFF_MS: u64 = 1000;
/// Job bodies are kept this long after reaching a terminal state
const JOB_RECORD_TTL_SECONDS: u64 = 86400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum JobPriority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
}

/// A job as stored in the queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id: String,
    /// Job kind within the queue, e.g. "sync_user"
    pub kind: String,
    pub payload: serde_json::Value,
    pub priority: JobPriority,
    pub state: JobState,
    pub attempts: u32,
    pub attempts_made: u32,
    pub backoff_base_ms: u64,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl QueuedJob {
    /// Delay before the next retry attempt, exponential in attempts made
    pub fn retry_delay(&self) -> Duration {
        let exponent = self.attempts_made.saturating_sub(1).min(10);
        Duration::from_millis(self.backoff_base_ms * 2u64.pow(exponent))
    }
}

/// Options for enqueueing a job
#[derive(Debug, Clone)]
pub struct JobOptions {
    /// Caller-chosen id for natural-key deduplication
    pub job_id: Option<String>,
    pub delay: Option<Duration>,
    pub priority: JobPriority,
    pub attempts: u32,
    pub backoff_base_ms: u64,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            job_id: None,
            delay: None,
            priority: JobPriority::Normal,
            attempts: DEFAULT_ATTEMPTS,
            backoff_base_ms: DEFAULT_BACKOFF_MS,
        }
    }
}

impl JobOptions {
    pub fn with_job_id(id: impl Into<String>) -> Self {
        Self {
            job_id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }
}

/// Queue depth counters
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

/// What a handler did with a job
#[derive(Debug)]
pub enum JobOutcome {
    Completed(serde_json::Value),
    /// Put the job back without consuming an attempt (rate-limit pauses)
    Reschedule { delay: Duration },
}

/// Trait implemented by each queue's job processor
#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &QueuedJob) -> Result<JobOutcome>;

    /// Wall-clock budget for one job
    fn max_execution_time(&self) -> Duration {
        Duration::from_secs(300)
    }
}

/// One durable queue over the shared store
#[derive(Clone)]
pub struct JobQueue {
    redis: Pool,
    name: String,
}

impl JobQueue {
    pub fn new(redis: Pool, name: impl Into<String>) -> Self {
        Self {
            redis,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn waiting_key(&self) -> String {
        format!("queue:{}:waiting", self.name)
    }

    fn active_key(&self) -> String {
        format!("queue:{}:active", self.name)
    }

    fn counter_key(&self, which: &str) -> String {
        format!("queue:{}:{}", self.name, which)
    }

    fn paused_key(&self) -> String {
        format!("queue:{}:paused", self.name)
    }

    /// The cross-worker pause instant, e.g. `playlist_queue:pause_until`
    fn pause_until_key(&self) -> String {
        format!("{}:pause_until", self.name)
    }

    fn job_key(&self, id: &str) -> String {
        format!("job:{}:{}", self.name, id)
    }

    /// Enqueue a job. When `job_id` names a job that is still waiting or
    /// active, the existing id is returned and nothing is added.
    pub async fn add(
        &self,
        kind: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<String> {
        let mut conn = self.redis.get().await?;

        let id = options
            .job_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        if options.job_id.is_some() {
            let existing: Option<String> = conn.get(self.job_key(&id)).await?;
            if let Some(raw) = existing {
                if let Ok(job) = serde_json::from_str::<QueuedJob>(&raw) {
                    if matches!(job.state, JobState::Waiting | JobState::Active) {
                        return Ok(id);
                    }
                }
            }
        }

        let now = Utc::now();
        let scheduled_at = now
            + chrono::Duration::from_std(options.delay.unwrap_or(Duration::ZERO))
                .unwrap_or_else(|_| chrono::Duration::zero());

        let job = QueuedJob {
            id: id.clone(),
            kind: kind.to_string(),
            payload,
            priority: options.priority,
            state: JobState::Waiting,
            attempts: options.attempts,
            attempts_made: 0,
            backoff_base_ms: options.backoff_base_ms,
            created_at: now,
            scheduled_at,
            started_at: None,
            finished_at: None,
            error_message: None,
        };

        self.save_job(&mut conn, &job).await?;
        let _: () = conn
            .zadd(
                self.waiting_key(),
                &id,
                scheduled_at.timestamp_millis() as f64,
            )
            .await?;

        Ok(id)
    }

    /// Enqueue many jobs in one pipeline; per-job dedup is skipped
    pub async fn add_bulk(
        &self,
        jobs: Vec<(String, serde_json::Value, JobOptions)>,
    ) -> Result<Vec<String>> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.redis.get().await?;
        let now = Utc::now();
        let mut pipe = redis::pipe();
        pipe.atomic();
        let mut ids = Vec::with_capacity(jobs.len());

        for (kind, payload, options) in jobs {
            let id = options
                .job_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            let scheduled_at = now
                + chrono::Duration::from_std(options.delay.unwrap_or(Duration::ZERO))
                    .unwrap_or_else(|_| chrono::Duration::zero());

            let job = QueuedJob {
                id: id.clone(),
                kind,
                payload,
                priority: options.priority,
                state: JobState::Waiting,
                attempts: options.attempts,
                attempts_made: 0,
                backoff_base_ms: options.backoff_base_ms,
                created_at: now,
                scheduled_at,
                started_at: None,
                finished_at: None,
                error_message: None,
            };

            pipe.set_ex(
                self.job_key(&id),
                serde_json::to_string(&job)?,
                JOB_RECORD_TTL_SECONDS,
            );
            pipe.zadd(
                self.waiting_key(),
                &id,
                scheduled_at.timestamp_millis() as f64,
            );
            ids.push(id);
        }

        let _: () = pipe.query_async(&mut *conn).await?;
        Ok(ids)
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<QueuedJob>> {
        let mut conn = self.redis.get().await?;
        let raw: Option<String> = conn.get(self.job_key(id)).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn counts(&self) -> Result<QueueCounts> {
        let mut conn = self.redis.get().await?;
        let now_ms = Utc::now().timestamp_millis();

        let waiting: u64 = redis::cmd("ZCOUNT")
            .arg(self.waiting_key())
            .arg("-inf")
            .arg(now_ms)
            .query_async(&mut *conn)
            .await?;
        let delayed: u64 = redis::cmd("ZCOUNT")
            .arg(self.waiting_key())
            .arg(format!("({}", now_ms))
            .arg("+inf")
            .query_async(&mut *conn)
            .await?;
        let active: u64 = conn.scard(self.active_key()).await?;
        let completed: u64 = conn
            .get::<_, Option<u64>>(self.counter_key("completed"))
            .await?
            .unwrap_or(0);
        let failed: u64 = conn
            .get::<_, Option<u64>>(self.counter_key("failed"))
            .await?
            .unwrap_or(0);

        Ok(QueueCounts {
            waiting,
            delayed,
            active,
            completed,
            failed,
        })
    }

    pub async fn pause(&self) -> Result<()> {
        let mut conn = self.redis.get().await?;
        let _: () = conn.set(self.paused_key(), 1).await?;
        info!(queue = %self.name, "Queue paused");
        Ok(())
    }

    pub async fn resume(&self) -> Result<()> {
        let mut conn = self.redis.get().await?;
        let _: () = conn.del(self.paused_key()).await?;
        info!(queue = %self.name, "Queue resumed");
        Ok(())
    }

    pub async fn is_paused(&self) -> Result<bool> {
        let mut conn = self.redis.get().await?;
        let flag: Option<i64> = conn.get(self.paused_key()).await?;
        Ok(flag.is_some())
    }

    /// Publish a pause instant into the shared key, keeping the maximum.
    /// Returns true when this caller became the latest pauser.
    pub async fn publish_pause_until(&self, until: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.redis.get().await?;
        let stored: Option<i64> = conn.get(self.pause_until_key()).await?;
        let until_ms = until.timestamp_millis();

        if stored.map_or(true, |current| until_ms > current) {
            let _: () = conn.set(self.pause_until_key(), until_ms).await?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub async fn pause_until(&self) -> Result<Option<DateTime<Utc>>> {
        let mut conn = self.redis.get().await?;
        let stored: Option<i64> = conn.get(self.pause_until_key()).await?;
        Ok(stored.and_then(|ms| DateTime::from_timestamp_millis(ms)))
    }

    /// Resume the queue only when the stored pause instant has elapsed.
    /// A later pauser supersedes earlier resume timers.
    pub async fn try_resume_if_elapsed(&self, now: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.redis.get().await?;
        let stored: Option<i64> = conn.get(self.pause_until_key()).await?;

        match stored {
            None => {
                self.resume().await?;
                Ok(true)
            }
            Some(until_ms) if now.timestamp_millis() >= until_ms => {
                let _: () = conn.del(self.pause_until_key()).await?;
                self.resume().await?;
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }

    async fn save_job(
        &self,
        conn: &mut deadpool_redis::Connection,
        job: &QueuedJob,
    ) -> Result<()> {
        let _: () = conn
            .set_ex(
                self.job_key(&job.id),
                serde_json::to_string(job)?,
                JOB_RECORD_TTL_SECONDS,
            )
            .await?;
        Ok(())
    }

    /// Claim up to `limit` due jobs. The ZREM is the claim: only the worker
    /// that removes the id owns the job.
    async fn claim_due_jobs(&self, limit: usize) -> Result<Vec<QueuedJob>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.redis.get().await?;
        let now_ms = Utc::now().timestamp_millis();

        let candidates: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.waiting_key())
            .arg("-inf")
            .arg(now_ms)
            .arg("LIMIT")
            .arg(0)
            .arg((limit * 4) as isize)
            .query_async(&mut *conn)
            .await?;

        let mut claimed = Vec::new();
        for id in candidates {
            let removed: i64 = conn.zrem(self.waiting_key(), &id).await?;
            if removed != 1 {
                continue; // another worker won the claim
            }

            let raw: Option<String> = conn.get(self.job_key(&id)).await?;
            let Some(raw) = raw else {
                continue;
            };
            let Ok(mut job) = serde_json::from_str::<QueuedJob>(&raw) else {
                warn!(queue = %self.name, job_id = %id, "Dropping undecodable job body");
                continue;
            };

            job.state = JobState::Active;
            job.started_at = Some(Utc::now());
            self.save_job(&mut conn, &job).await?;
            let _: () = conn.sadd(self.active_key(), &id).await?;
            claimed.push(job);

            if claimed.len() >= limit {
                break;
            }
        }

        // Priority wins over insertion order among due jobs
        claimed.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });

        Ok(claimed)
    }

    /// Put an active job back into the waiting set after a delay
    async fn release_to_waiting(&self, job: &QueuedJob, delay: Duration) -> Result<()> {
        let mut conn = self.redis.get().await?;
        let mut job = job.clone();
        job.state = JobState::Waiting;
        job.started_at = None;
        job.scheduled_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

        self.save_job(&mut conn, &job).await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.srem(self.active_key(), &job.id);
        pipe.zadd(
            self.waiting_key(),
            &job.id,
            job.scheduled_at.timestamp_millis() as f64,
        );
        let _: () = pipe.query_async(&mut *conn).await?;
        Ok(())
    }

    async fn finish_job(&self, job: &mut QueuedJob, state: JobState) -> Result<()> {
        let mut conn = self.redis.get().await?;
        job.state = state;
        job.finished_at = Some(Utc::now());
        self.save_job(&mut conn, job).await?;

        let counter = match state {
            JobState::Completed => "completed",
            _ => "failed",
        };
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.srem(self.active_key(), &job.id);
        pipe.incr(self.counter_key(counter), 1);
        let _: () = pipe.query_async(&mut *conn).await?;
        Ok(())
    }
}

/// Sliding one-minute cap on job starts, used by the playlist pool
pub struct StartRateLimiter {
    max_per_minute: u32,
    starts: Mutex<VecDeque<tokio::time::Instant>>,
}

impl StartRateLimiter {
    pub fn new(max_per_minute: u32) -> Arc<Self> {
        Arc::new(Self {
            max_per_minute,
            starts: Mutex::new(VecDeque::new()),
        })
    }

    /// Whether another job may start now; records the start when allowed
    pub async fn try_start(&self) -> bool {
        let mut starts = self.starts.lock().await;
        let now = tokio::time::Instant::now();
        while let Some(front) = starts.front() {
            if now.duration_since(*front) >= Duration::from_secs(60) {
                starts.pop_front();
            } else {
                break;
            }
        }
        if starts.len() < self.max_per_minute as usize {
            starts.push_back(now);
            true
        } else {
            false
        }
    }
}

/// Worker pool configuration
#[derive(Clone)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub poll_interval: Duration,
    /// Optional cap on job starts per minute across the pool
    pub start_limiter: Option<Arc<StartRateLimiter>>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            poll_interval: Duration::from_millis(1000),
            start_limiter: None,
        }
    }
}

/// A pool of workers draining one queue through one handler
pub struct WorkerPool {
    queue: JobQueue,
    handler: Arc<dyn JobHandler>,
    config: WorkerConfig,
    metrics: Option<Arc<MetricsCollector>>,
}

impl WorkerPool {
    pub fn new(queue: JobQueue, handler: Arc<dyn JobHandler>, config: WorkerConfig) -> Self {
        Self {
            queue,
            handler,
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run until the shutdown token fires. In-flight jobs finish; waiting
    /// jobs stay durable in the store.
    pub async fn run(self, shutdown: CancellationToken) {
        let queue_name = self.queue.name().to_string();
        info!(queue = %queue_name, concurrency = self.config.concurrency, "Worker pool starting");

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut poll = interval(self.config.poll_interval);
        let this = Arc::new(self);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(queue = %queue_name, "Worker pool shutting down");
                    break;
                }
                _ = poll.tick() => {
                    if let Err(e) = this.clone().drain_tick(&semaphore).await {
                        error!(queue = %queue_name, error = %e, "Worker tick failed");
                    }
                }
            }
        }

        // Wait for in-flight jobs before returning
        let _ = semaphore
            .acquire_many(this.config.concurrency as u32)
            .await;
    }

    async fn drain_tick(self: Arc<Self>, semaphore: &Arc<Semaphore>) -> Result<()> {
        if self.queue.is_paused().await? {
            return Ok(());
        }

        let free = semaphore.available_permits();
        if free == 0 {
            return Ok(());
        }

        let jobs = self.queue.claim_due_jobs(free).await?;
        for job in jobs {
            if let Some(limiter) = &self.config.start_limiter {
                if !limiter.try_start().await {
                    // Over the per-minute cap: hand the job back briefly
                    self.queue
                        .release_to_waiting(&job, Duration::from_secs(5))
                        .await?;
                    continue;
                }
            }
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| anyhow!("worker semaphore closed"))?;
            let this = self.clone();
            tokio::spawn(async move {
                this.execute_job(job).await;
                drop(permit);
            });
        }
        Ok(())
    }

    async fn execute_job(&self, mut job: QueuedJob) {
        let queue_name = self.queue.name();
        let budget = self.handler.max_execution_time();

        let outcome = match tokio::time::timeout(budget, self.handler.handle(&job)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!(
                "job execution timed out after {}ms",
                budget.as_millis()
            )),
        };

        match outcome {
            Ok(JobOutcome::Completed(_)) => {
                if let Err(e) = self.queue.finish_job(&mut job, JobState::Completed).await {
                    error!(queue = %queue_name, job_id = %job.id, error = %e, "Failed to persist completion");
                }
                if let Some(metrics) = &self.metrics {
                    metrics
                        .jobs_total
                        .with_label_values(&[queue_name, "completed"])
                        .inc();
                }
            }
            Ok(JobOutcome::Reschedule { delay }) => {
                info!(
                    queue = %queue_name,
                    job_id = %job.id,
                    delay_ms = delay.as_millis() as u64,
                    "Job rescheduled without consuming an attempt"
                );
                if let Err(e) = self.queue.release_to_waiting(&job, delay).await {
                    error!(queue = %queue_name, job_id = %job.id, error = %e, "Failed to reschedule");
                }
                if let Some(metrics) = &self.metrics {
                    metrics
                        .jobs_total
                        .with_label_values(&[queue_name, "rescheduled"])
                        .inc();
                }
            }
            Err(e) => {
                job.attempts_made += 1;
                job.error_message = Some(e.to_string());

                if job.attempts_made < job.attempts {
                    let delay = job.retry_delay();
                    warn!(
                        queue = %queue_name,
                        job_id = %job.id,
                        attempt = job.attempts_made,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Job failed, scheduling retry"
                    );
                    if let Err(persist) = self.queue.release_to_waiting(&job, delay).await {
                        error!(queue = %queue_name, job_id = %job.id, error = %persist, "Failed to schedule retry");
                    }
                } else {
                    error!(
                        queue = %queue_name,
                        job_id = %job.id,
                        attempts = job.attempts_made,
                        error = %e,
                        "Job failed terminally"
                    );
                    if let Err(persist) = self.queue.finish_job(&mut job, JobState::Failed).await {
                        error!(queue = %queue_name, job_id = %job.id, error = %persist, "Failed to persist failure");
                    }
                    if let Some(metrics) = &self.metrics {
                        metrics
                            .jobs_total
                            .with_label_values(&[queue_name, "failed"])
                            .inc();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_is_exponential_from_one_second() {
        let mut job = QueuedJob {
            id: "j1".to_string(),
            kind: "sync_user".to_string(),
            payload: serde_json::json!({}),
            priority: JobPriority::Normal,
            state: JobState::Waiting,
            attempts: DEFAULT_ATTEMPTS,
            attempts_made: 1,
            backoff_base_ms: DEFAULT_BACKOFF_MS,
            created_at: Utc::now(),
            scheduled_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error_message: None,
        };

        assert_eq!(job.retry_delay(), Duration::from_millis(1000));
        job.attempts_made = 2;
        assert_eq!(job.retry_delay(), Duration::from_millis(2000));
        job.attempts_made = 4;
        assert_eq!(job.retry_delay(), Duration::from_millis(8000));
    }

    #[test]
    fn priority_orders_critical_first() {
        let mut priorities = vec![
            JobPriority::Low,
            JobPriority::Critical,
            JobPriority::Normal,
            JobPriority::High,
        ];
        priorities.sort_by(|a, b| b.cmp(a));
        assert_eq!(
            priorities,
            vec![
                JobPriority::Critical,
                JobPriority::High,
                JobPriority::Normal,
                JobPriority::Low,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn start_limiter_caps_a_sliding_minute() {
        let limiter = StartRateLimiter::new(3);
        assert!(limiter.try_start().await);
        assert!(limiter.try_start().await);
        assert!(limiter.try_start().await);
        assert!(!limiter.try_start().await);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(limiter.try_start().await);
    }
}
