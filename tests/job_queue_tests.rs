//! Queue model behavior that needs no backing store

use std::time::Duration;

use chrono::Utc;
use music_analytics_backend::services::job_queue::{
    JobOptions, JobPriority, JobState, QueuedJob, StartRateLimiter, DEFAULT_ATTEMPTS,
    DEFAULT_BACKOFF_MS,
};
use music_analytics_backend::services::ingest::SyncUserJob;
use uuid::Uuid;

fn job(attempts_made: u32) -> QueuedJob {
    QueuedJob {
        id: Uuid::new_v4().to_string(),
        kind: "sync_user".to_string(),
        payload: serde_json::json!({ "user_id": Uuid::new_v4() }),
        priority: JobPriority::Normal,
        state: JobState::Waiting,
        attempts: DEFAULT_ATTEMPTS,
        attempts_made,
        backoff_base_ms: DEFAULT_BACKOFF_MS,
        created_at: Utc::now(),
        scheduled_at: Utc::now(),
        started_at: None,
        finished_at: None,
        error_message: None,
    }
}

#[test]
fn defaults_match_queue_policy() {
    let options = JobOptions::default();
    assert_eq!(options.attempts, 5);
    assert_eq!(options.backoff_base_ms, 1000);
    assert_eq!(options.priority, JobPriority::Normal);
    assert!(options.job_id.is_none());
    assert!(options.delay.is_none());
}

#[test]
fn builder_style_options_compose() {
    let options = JobOptions::with_job_id("sync:abc")
        .priority(JobPriority::High)
        .delayed(Duration::from_secs(30));
    assert_eq!(options.job_id.as_deref(), Some("sync:abc"));
    assert_eq!(options.priority, JobPriority::High);
    assert_eq!(options.delay, Some(Duration::from_secs(30)));
}

#[test]
fn backoff_doubles_per_attempt() {
    assert_eq!(job(1).retry_delay(), Duration::from_millis(1000));
    assert_eq!(job(2).retry_delay(), Duration::from_millis(2000));
    assert_eq!(job(3).retry_delay(), Duration::from_millis(4000));
    assert_eq!(job(5).retry_delay(), Duration::from_millis(16000));
}

#[test]
fn backoff_exponent_is_capped() {
    // Far past the attempt limit the delay must stay finite
    let delay = job(40).retry_delay();
    assert_eq!(delay, Duration::from_millis(1000 * 1024));
}

#[test]
fn job_payloads_round_trip_through_json() {
    let original = SyncUserJob {
        user_id: Uuid::new_v4(),
        skip_cooldown: true,
        iteration: 3,
    };
    let value = serde_json::to_value(&original).unwrap();
    let decoded: SyncUserJob = serde_json::from_value(value).unwrap();
    assert_eq!(decoded.user_id, original.user_id);
    assert!(decoded.skip_cooldown);
    assert_eq!(decoded.iteration, 3);
}

#[tokio::test(start_paused = true)]
async fn start_limiter_refills_as_the_window_slides() {
    let limiter = StartRateLimiter::new(2);
    assert!(limiter.try_start().await);

    tokio::time::advance(Duration::from_secs(30)).await;
    assert!(limiter.try_start().await);
    assert!(!limiter.try_start().await);

    // 31 more seconds: the first start falls out of the window
    tokio::time::advance(Duration::from_secs(31)).await;
    assert!(limiter.try_start().await);
    assert!(!limiter.try_start().await);
}
