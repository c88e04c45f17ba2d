//! Prometheus metrics registry and HTTP exposition

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{CounterVec, Encoder, IntGaugeVec, Opts, Registry, TextEncoder};

/// Process-wide metrics collector
pub struct MetricsCollector {
    registry: Registry,
    /// Jobs processed per queue and outcome
    pub jobs_total: CounterVec,
    /// Current circuit breaker state per service key (0=closed, 1=open, 2=half_open)
    pub breaker_state: IntGaugeVec,
}

impl MetricsCollector {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let jobs_total = CounterVec::new(
            Opts::new("jobs_total", "Jobs processed by queue and outcome")
                .namespace("analytics"),
            &["queue", "outcome"],
        )?;
        let breaker_state = IntGaugeVec::new(
            Opts::new(
                "circuit_breaker_state",
                "Circuit breaker state (0=closed, 1=open, 2=half_open)",
            )
            .namespace("analytics"),
            &["service"],
        )?;

        registry.register(Box::new(jobs_total.clone()))?;
        registry.register(Box::new(breaker_state.clone()))?;

        Ok(Self {
            registry,
            jobs_total,
            breaker_state,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render the registry in the Prometheus text format
    pub fn gather(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).to_string())
    }
}

/// Prometheus text exposition endpoint
pub async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<Arc<MetricsCollector>>,
) -> impl IntoResponse {
    match metrics.gather() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, String::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collector_registers_and_gathers() {
        let metrics = MetricsCollector::new().unwrap();
        metrics
            .jobs_total
            .with_label_values(&["sync_queue", "completed"])
            .inc();
        let body = metrics.gather().unwrap();
        assert!(body.contains("analytics_jobs_total"));
    }
}
