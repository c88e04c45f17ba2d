//! Limiter and breaker behavior through their public APIs

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use music_analytics_backend::services::circuit_breaker::{
    BreakerState, CircuitBreakerConfig, CircuitBreakerRegistry,
};
use music_analytics_backend::services::rate_limiter::AdaptiveRateLimiter;
use music_analytics_backend::ProviderError;

#[tokio::test]
async fn breaker_trips_only_on_countable_failures() {
    let breakers = CircuitBreakerRegistry::new();
    let calls = Arc::new(AtomicU32::new(0));

    // Interleave auth failures with provider failures: only the latter count
    for i in 0..8 {
        let calls = calls.clone();
        let result: Result<(), ProviderError> = breakers
            .execute("player", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if i % 2 == 0 {
                    Err(ProviderError::Unauthenticated)
                } else {
                    Err(ProviderError::ProviderDown { status: 502 })
                }
            })
            .await;
        assert!(result.is_err());
    }

    // Four countable failures out of eight: still closed
    assert_eq!(breakers.state("player").await, BreakerState::Closed);
    assert_eq!(calls.load(Ordering::SeqCst), 8);

    let _: Result<(), ProviderError> = breakers
        .execute("player", || async {
            Err(ProviderError::Transport("connection reset".to_string()))
        })
        .await;
    assert_eq!(breakers.state("player").await, BreakerState::Open);
}

#[tokio::test]
async fn open_breaker_short_circuits_without_invoking_the_operation() {
    let breakers = CircuitBreakerRegistry::with_config(CircuitBreakerConfig {
        failure_threshold: 1,
        reset_timeout: Duration::from_secs(30),
    });
    breakers.record_failure("top").await;

    let invoked = Arc::new(AtomicU32::new(0));
    let invoked_inner = invoked.clone();
    let result: Result<(), ProviderError> = breakers
        .execute("top", || async move {
            invoked_inner.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;

    assert!(matches!(result, Err(ProviderError::BreakerOpen { .. })));
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn successful_probe_recloses_the_circuit() {
    let breakers = CircuitBreakerRegistry::with_config(CircuitBreakerConfig {
        failure_threshold: 1,
        reset_timeout: Duration::ZERO,
    });
    breakers.record_failure("catalog").await;
    assert_eq!(breakers.state("catalog").await, BreakerState::Open);

    let result: Result<u32, ProviderError> =
        breakers.execute("catalog", || async { Ok(7) }).await;
    assert_eq!(result.unwrap(), 7);
    assert_eq!(breakers.state("catalog").await, BreakerState::Closed);
}

#[tokio::test]
async fn limiter_recovers_toward_but_never_past_the_initial_rate() {
    let limiter = AdaptiveRateLimiter::new();
    assert_eq!(limiter.current_rate().await, 2.0);

    limiter.handle_rate_limit(0).await;
    limiter.handle_rate_limit(0).await;
    limiter.handle_rate_limit(0).await;
    assert_eq!(limiter.current_rate().await, 0.5);

    // Three full streaks: 0.5 -> 0.625 -> 0.78125 -> 0.9765625
    for _ in 0..60 {
        limiter.record_success().await;
    }
    let rate = limiter.current_rate().await;
    assert!(rate > 0.9 && rate < 1.0, "rate {}", rate);

    for _ in 0..1000 {
        limiter.record_success().await;
    }
    assert_eq!(limiter.current_rate().await, 2.0);
}

#[tokio::test(start_paused = true)]
async fn paused_limiter_releases_callers_at_the_window_end() {
    let limiter = AdaptiveRateLimiter::new();
    limiter.handle_rate_limit(90).await;

    let started = tokio::time::Instant::now();
    limiter.acquire().await;
    let waited = started.elapsed();
    assert!(
        waited >= Duration::from_secs(90),
        "released after {:?}",
        waited
    );
}
