//! Adaptive rate limiter shared by every provider-facing worker
//!
//! A token bucket whose rate adapts to upstream feedback: 429 responses
//! halve the rate and pause the bucket for the advertised window, sustained
//! success recovers it multiplicatively up to the initial rate. One
//! instance per process; all worker pools draw from the same budget.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

/// Limiter tuning knobs
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Requests per second at startup, and the recovery ceiling
    pub initial_rate: f64,
    /// Floor the rate never drops below
    pub min_rate: f64,
    /// Maximum tokens the bucket holds
    pub burst_capacity: f64,
    /// Rate multiplier applied on every full success streak
    pub recovery_factor: f64,
    /// Successes per recovery step
    pub success_streak_threshold: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            initial_rate: 2.0,
            min_rate: 0.5,
            burst_capacity: 5.0,
            recovery_factor: 1.25,
            success_streak_threshold: 20,
        }
    }
}

#[derive(Debug)]
struct LimiterState {
    tokens: f64,
    rate: f64,
    success_streak: u32,
    pause_until: Option<Instant>,
    last_refill: Instant,
}

/// Process-wide adaptive token bucket
pub struct AdaptiveRateLimiter {
    config: RateLimiterConfig,
    state: Mutex<LimiterState>,
}

impl AdaptiveRateLimiter {
    pub fn new() -> Arc<Self> {
        Self::with_config(RateLimiterConfig::default())
    }

    pub fn with_config(config: RateLimiterConfig) -> Arc<Self> {
        let state = LimiterState {
            tokens: config.burst_capacity,
            rate: config.initial_rate,
            success_streak: 0,
            pause_until: None,
            last_refill: Instant::now(),
        };
        Arc::new(Self {
            config,
            state: Mutex::new(state),
        })
    }

    /// Lazy refill: credit tokens for the time elapsed since the last call,
    /// capped at the burst capacity.
    fn refill(state: &mut LimiterState, cap: f64, now: Instant) {
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * state.rate).min(cap);
        state.last_refill = now;
    }

    /// Wait until a token is available, then take it.
    ///
    /// Suspends while the limiter is paused or the bucket is empty; the
    /// lock is never held across a sleep.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();

                if let Some(until) = state.pause_until {
                    if now < until {
                        until.duration_since(now)
                    } else {
                        state.pause_until = None;
                        // Paused time earns no tokens
                        state.last_refill = now;
                        continue;
                    }
                } else {
                    Self::refill(&mut state, self.config.burst_capacity, now);
                    if state.tokens >= 1.0 {
                        state.tokens -= 1.0;
                        return;
                    }
                    let deficit = 1.0 - state.tokens;
                    Duration::from_secs_f64(deficit / state.rate)
                }
            };

            tokio::time::sleep(wait).await;
        }
    }

    /// Record one successful upstream call; every full streak recovers the
    /// rate multiplicatively, capped at the initial rate.
    pub async fn record_success(&self) {
        let mut state = self.state.lock().await;
        state.success_streak += 1;
        if state.success_streak % self.config.success_streak_threshold == 0 {
            let recovered = (state.rate * self.config.recovery_factor)
                .min(self.config.initial_rate);
            if recovered > state.rate {
                debug!(
                    from = state.rate,
                    to = recovered,
                    "Rate limiter recovering"
                );
            }
            state.rate = recovered;
        }
    }

    /// Back off after an upstream 429: halve the rate (floored), clear the
    /// streak and pause the bucket for the advertised window.
    pub async fn handle_rate_limit(&self, retry_after_seconds: u64) {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        Self::refill(&mut state, self.config.burst_capacity, now);

        state.rate = (state.rate / 2.0).max(self.config.min_rate);
        state.success_streak = 0;
        state.pause_until = Some(now + Duration::from_secs(retry_after_seconds));

        info!(
            rate = state.rate,
            retry_after_seconds, "Rate limiter backing off after 429"
        );
    }

    /// Current requests-per-second rate (diagnostics)
    pub async fn current_rate(&self) -> f64 {
        self.state.lock().await.rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> Arc<AdaptiveRateLimiter> {
        AdaptiveRateLimiter::new()
    }

    #[tokio::test(start_paused = true)]
    async fn burst_then_throttle() {
        let limiter = limiter();

        // Burst capacity admits 5 immediately
        for _ in 0..5 {
            limiter.acquire().await;
        }

        // The sixth must wait about half a second at 2 req/s
        let before = Instant::now();
        limiter.acquire().await;
        let waited = Instant::now().duration_since(before);
        assert!(waited >= Duration::from_millis(400), "waited {:?}", waited);
    }

    #[tokio::test]
    async fn rate_halves_on_429_and_floors_at_min() {
        let limiter = limiter();
        limiter.handle_rate_limit(1).await;
        assert_eq!(limiter.current_rate().await, 1.0);
        limiter.handle_rate_limit(1).await;
        assert_eq!(limiter.current_rate().await, 0.5);
        limiter.handle_rate_limit(1).await;
        assert_eq!(limiter.current_rate().await, 0.5);
    }

    #[tokio::test]
    async fn recovery_needs_a_full_streak() {
        let limiter = limiter();
        limiter.handle_rate_limit(0).await;
        limiter.handle_rate_limit(0).await;
        assert_eq!(limiter.current_rate().await, 0.5);

        for _ in 0..19 {
            limiter.record_success().await;
        }
        assert_eq!(limiter.current_rate().await, 0.5);

        limiter.record_success().await;
        assert_eq!(limiter.current_rate().await, 0.625);
    }

    #[tokio::test]
    async fn recovery_caps_at_initial_rate() {
        let limiter = limiter();
        limiter.handle_rate_limit(0).await;
        for _ in 0..200 {
            limiter.record_success().await;
        }
        assert_eq!(limiter.current_rate().await, 2.0);
    }

    #[tokio::test]
    async fn rate_limit_clears_the_streak() {
        let limiter = limiter();
        limiter.handle_rate_limit(0).await;
        for _ in 0..19 {
            limiter.record_success().await;
        }
        limiter.handle_rate_limit(0).await;
        limiter.record_success().await;
        // 19 + 1 successes straddling a 429 must not count as a streak
        assert_eq!(limiter.current_rate().await, 0.5);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_sleeps_through_the_pause_window() {
        let limiter = limiter();
        limiter.handle_rate_limit(120).await;

        let before = Instant::now();
        limiter.acquire().await;
        let waited = Instant::now().duration_since(before);
        assert!(waited >= Duration::from_secs(120), "waited {:?}", waited);
    }
}
