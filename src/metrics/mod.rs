//! Metrics collection for observability

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec_with_registry, register_histogram_with_registry, CounterVec, Histogram,
    Opts, Registry,
};
use std::sync::Arc;

/// Global metrics registry
pub static METRICS: Lazy<Arc<Metrics>> =
    Lazy::new(|| Arc::new(Metrics::new().expect("Failed to initialize metrics")));

/// Metrics collector
pub struct Metrics {
    registry: Registry,

    // Orchestrator metrics
    pub turns_total: CounterVec,
    pub tokens_reduced: Histogram,

    // Summarizer metrics
    pub summarization_requests: CounterVec,

    // Circuit breaker metrics
    pub breaker_transitions: CounterVec,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let registry = Registry::new();

        let turns_total = register_counter_vec_with_registry!(
            Opts::new("context_turns_total", "Turns processed, by terminal action"),
            &["action"],
            registry
        )?;

        let tokens_reduced = register_histogram_with_registry!(
            "context_tokens_reduced",
            "Tokens eliminated per thread migration",
            registry
        )?;

        let summarization_requests = register_counter_vec_with_registry!(
            Opts::new(
                "summarization_requests_total",
                "Summarization requests, by outcome"
            ),
            &["status"],
            registry
        )?;

        let breaker_transitions = register_counter_vec_with_registry!(
            Opts::new(
                "circuit_breaker_transitions_total",
                "Circuit breaker state transitions"
            ),
            &["breaker", "state"],
            registry
        )?;

        Ok(Self {
            registry,
            turns_total,
            tokens_reduced,
            summarization_requests,
            breaker_transitions,
        })
    }

    /// Get the metrics registry for exporting
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record a completed turn
    pub fn record_turn(&self, action: &str) {
        self.turns_total.with_label_values(&[action]).inc();
    }

    /// Record a summarization request outcome
    pub fn record_summarization(&self, success: bool) {
        let status = if success { "success" } else { "error" };
        self.summarization_requests
            .with_label_values(&[status])
            .inc();
    }

    /// Record a circuit breaker state transition
    pub fn record_breaker_transition(&self, breaker: &str, state: &str) {
        self.breaker_transitions
            .with_label_values(&[breaker, state])
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialize() {
        let metrics = Metrics::new().unwrap();
        metrics.record_turn("passthrough");
        metrics.record_breaker_transition("llm-threads", "open");
        metrics.record_summarization(true);

        let families = metrics.registry().gather();
        assert!(!families.is_empty());
    }

    #[test]
    fn test_global_registry() {
        METRICS.tokens_reduced.observe(1200.0);
        assert!(!METRICS.registry().gather().is_empty());
    }
}
