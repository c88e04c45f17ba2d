//! Circuit breaker for provider calls
//!
//! One breaker per service key; keys group endpoints by failure domain
//! (`player`, `top`, `catalog`, `playlist`) so a storm on one endpoint
//! family does not trip another.
//!
//! ## State machine
//! - **Closed**: requests pass; consecutive countable failures increment a
//!   counter; at the threshold the circuit opens
//! - **Open**: requests short-circuit with `BreakerOpen`; after the reset
//!   timeout the next call is admitted as a half-open probe
//! - **HalfOpen**: exactly one probe in flight; success closes the circuit,
//!   failure reopens it
//!
//! Only `ProviderDown` and `TransportError` count toward the threshold
//! ([`ProviderError::should_count`]); auth and validation errors pass
//! through without touching breaker state.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::ProviderError;
use crate::metrics::MetricsCollector;

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive countable failures that open the circuit
    pub failure_threshold: u32,
    /// Time since the last failure before a half-open probe is admitted
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug)]
struct CircuitState {
    state: BreakerState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    /// When the current half-open probe was admitted
    probe_started_at: Option<Instant>,
}

impl Default for CircuitState {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            probe_started_at: None,
        }
    }
}

/// Per-service-key circuit breakers; the process holds exactly one registry
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    circuits: RwLock<HashMap<String, CircuitState>>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::with_config(CircuitBreakerConfig::default())
    }

    pub fn with_config(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuits: RwLock::new(HashMap::new()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn publish_state(&self, service: &str, state: BreakerState) {
        if let Some(metrics) = &self.metrics {
            let value = match state {
                BreakerState::Closed => 0,
                BreakerState::Open => 1,
                BreakerState::HalfOpen => 2,
            };
            metrics
                .breaker_state
                .with_label_values(&[service])
                .set(value);
        }
    }

    /// Current state of a service's circuit
    pub async fn state(&self, service: &str) -> BreakerState {
        let circuits = self.circuits.read().await;
        circuits
            .get(service)
            .map(|c| c.state)
            .unwrap_or(BreakerState::Closed)
    }

    /// Admit or reject a request, performing state transitions.
    ///
    /// Rejection means the caller must fail with `BreakerOpen` without
    /// touching the network.
    pub async fn try_acquire(&self, service: &str) -> Result<(), ProviderError> {
        let mut circuits = self.circuits.write().await;
        let circuit = circuits.entry(service.to_string()).or_default();
        let now = Instant::now();

        match circuit.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed = circuit
                    .last_failure_at
                    .map(|at| now.duration_since(at))
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.reset_timeout {
                    info!(service = service, "Circuit breaker admitting half-open probe");
                    circuit.state = BreakerState::HalfOpen;
                    circuit.probe_started_at = Some(now);
                    self.publish_state(service, BreakerState::HalfOpen);
                    Ok(())
                } else {
                    Err(ProviderError::BreakerOpen {
                        service: service.to_string(),
                    })
                }
            }
            BreakerState::HalfOpen => {
                // One probe at a time; a probe that never reported back is
                // replaced after the reset timeout so the circuit cannot
                // wedge half-open forever.
                let stale = circuit
                    .probe_started_at
                    .map(|at| now.duration_since(at) >= self.config.reset_timeout)
                    .unwrap_or(true);
                if stale {
                    circuit.probe_started_at = Some(now);
                    Ok(())
                } else {
                    Err(ProviderError::BreakerOpen {
                        service: service.to_string(),
                    })
                }
            }
        }
    }

    /// Record a successful call
    pub async fn record_success(&self, service: &str) {
        let mut circuits = self.circuits.write().await;
        let circuit = circuits.entry(service.to_string()).or_default();

        if circuit.state != BreakerState::Closed {
            info!(
                service = service,
                from = %circuit.state,
                "Circuit breaker closing"
            );
        }
        circuit.state = BreakerState::Closed;
        circuit.consecutive_failures = 0;
        circuit.last_failure_at = None;
        circuit.probe_started_at = None;
        self.publish_state(service, BreakerState::Closed);
    }

    /// Record a countable failure
    pub async fn record_failure(&self, service: &str) {
        let mut circuits = self.circuits.write().await;
        let circuit = circuits.entry(service.to_string()).or_default();
        let now = Instant::now();
        circuit.last_failure_at = Some(now);

        match circuit.state {
            BreakerState::Closed => {
                circuit.consecutive_failures += 1;
                if circuit.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        service = service,
                        failures = circuit.consecutive_failures,
                        "Circuit breaker tripping to open"
                    );
                    circuit.state = BreakerState::Open;
                    self.publish_state(service, BreakerState::Open);
                }
            }
            BreakerState::HalfOpen => {
                warn!(service = service, "Half-open probe failed, reopening circuit");
                circuit.state = BreakerState::Open;
                circuit.probe_started_at = None;
                self.publish_state(service, BreakerState::Open);
            }
            BreakerState::Open => {}
        }
    }

    /// Execute a provider call under this service's breaker.
    ///
    /// Failures that are not breaker-meaningful pass through without
    /// counting.
    pub async fn execute<F, Fut, T>(&self, service: &str, operation: F) -> Result<T, ProviderError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        self.try_acquire(service).await?;

        match operation().await {
            Ok(value) => {
                self.record_success(service).await;
                Ok(value)
            }
            Err(err) => {
                if err.should_count() {
                    self.record_failure(service).await;
                } else if self.state(service).await == BreakerState::HalfOpen {
                    // The probe completed and reached the provider; a
                    // non-countable response still proves liveness.
                    self.record_success(service).await;
                }
                Err(err)
            }
        }
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starts_closed() {
        let breakers = CircuitBreakerRegistry::new();
        assert_eq!(breakers.state("player").await, BreakerState::Closed);
        assert!(breakers.try_acquire("player").await.is_ok());
    }

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let breakers = CircuitBreakerRegistry::new();
        for _ in 0..5 {
            breakers.try_acquire("player").await.unwrap();
            breakers.record_failure("player").await;
        }

        assert_eq!(breakers.state("player").await, BreakerState::Open);
        assert!(matches!(
            breakers.try_acquire("player").await,
            Err(ProviderError::BreakerOpen { .. })
        ));
    }

    #[tokio::test]
    async fn success_resets_the_failure_count() {
        let breakers = CircuitBreakerRegistry::new();
        for _ in 0..4 {
            breakers.record_failure("player").await;
        }
        breakers.record_success("player").await;
        for _ in 0..4 {
            breakers.record_failure("player").await;
        }
        assert_eq!(breakers.state("player").await, BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_admits_one_probe_then_closes_on_success() {
        let breakers = CircuitBreakerRegistry::with_config(CircuitBreakerConfig {
            failure_threshold: 2,
            reset_timeout: Duration::ZERO,
        });
        breakers.record_failure("top").await;
        breakers.record_failure("top").await;
        assert_eq!(breakers.state("top").await, BreakerState::Open);

        // Reset timeout of zero: next acquire becomes the probe
        assert!(breakers.try_acquire("top").await.is_ok());
        assert_eq!(breakers.state("top").await, BreakerState::HalfOpen);

        breakers.record_success("top").await;
        assert_eq!(breakers.state("top").await, BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_probe_failure_reopens() {
        let breakers = CircuitBreakerRegistry::with_config(CircuitBreakerConfig {
            failure_threshold: 1,
            reset_timeout: Duration::ZERO,
        });
        breakers.record_failure("top").await;
        breakers.try_acquire("top").await.unwrap();
        assert_eq!(breakers.state("top").await, BreakerState::HalfOpen);

        breakers.record_failure("top").await;
        assert_eq!(breakers.state("top").await, BreakerState::Open);
    }

    #[tokio::test]
    async fn second_request_is_rejected_while_probe_in_flight() {
        let breakers = CircuitBreakerRegistry::with_config(CircuitBreakerConfig {
            failure_threshold: 1,
            reset_timeout: Duration::from_secs(30),
        });
        breakers.record_failure("catalog").await;

        tokio::time::pause();
        tokio::time::advance(Duration::from_secs(31)).await;

        assert!(breakers.try_acquire("catalog").await.is_ok());
        assert!(matches!(
            breakers.try_acquire("catalog").await,
            Err(ProviderError::BreakerOpen { .. })
        ));
    }

    #[tokio::test]
    async fn non_countable_errors_do_not_trip() {
        let breakers = CircuitBreakerRegistry::new();
        for _ in 0..10 {
            let result: Result<(), ProviderError> = breakers
                .execute("player", || async { Err(ProviderError::Unauthenticated) })
                .await;
            assert!(result.is_err());
        }
        assert_eq!(breakers.state("player").await, BreakerState::Closed);
    }

    #[tokio::test]
    async fn independent_service_keys() {
        let breakers = CircuitBreakerRegistry::new();
        for _ in 0..5 {
            breakers.record_failure("player").await;
        }
        assert_eq!(breakers.state("player").await, BreakerState::Open);
        assert_eq!(breakers.state("top").await, BreakerState::Closed);
        assert!(breakers.try_acquire("top").await.is_ok());
    }
}
