//! Circuit breaker for LLM backend protection
//!
//! Two independently tuned instances guard the thread/message backend and the
//! summarization backend, so an outage in one failure domain never blocks the
//! other.

use crate::error::{ContextError, Result};
use crate::metrics::METRICS;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub name: String,
    /// Failures within the monitoring window that open the circuit.
    pub failure_threshold: usize,
    /// How long an open circuit rejects calls before probing.
    pub reset_timeout: Duration,
    /// Failures older than this are pruned before each decision.
    pub monitoring_window: Duration,
    /// Consecutive half-open successes required to close.
    pub half_open_successes: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            monitoring_window: Duration::from_secs(120),
            half_open_successes: 3,
        }
    }
}

struct BreakerInner {
    state: BreakerState,
    failures: VecDeque<Instant>,
    last_failure: Option<Instant>,
    consecutive_successes: usize,
}

/// Circuit breaker statistics snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerStats {
    pub name: String,
    pub state: BreakerState,
    pub recent_failures: usize,
    pub consecutive_successes: usize,
    pub last_failure_age_ms: Option<u64>,
}

/// Circuit breaker wrapping calls to an unreliable dependency.
pub struct CircuitBreaker {
    inner: Arc<Mutex<BreakerInner>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failures: VecDeque::new(),
                last_failure: None,
                consecutive_successes: 0,
            })),
            config,
        }
    }

    /// Tighter breaker for primary thread/message operations.
    pub fn for_thread_ops() -> Self {
        Self::new(CircuitBreakerConfig {
            name: "llm-threads".to_string(),
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(15),
            monitoring_window: Duration::from_secs(60),
            half_open_successes: 3,
        })
    }

    /// Looser breaker for summarization completion calls.
    pub fn for_summarization() -> Self {
        Self::new(CircuitBreakerConfig {
            name: "llm-summarization".to_string(),
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(45),
            monitoring_window: Duration::from_secs(120),
            half_open_successes: 3,
        })
    }

    /// Run `operation` through the breaker.
    ///
    /// When the circuit is open and the reset timeout has not elapsed, the
    /// call fails fast with [`ContextError::BreakerOpen`] and the operation
    /// is never invoked. Operation failures are recorded and re-thrown
    /// unchanged so callers can tell the two error kinds apart.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.before_call()?;

        match operation().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                self.on_failure();
                Err(e)
            }
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().unwrap().state
    }

    pub fn stats(&self) -> BreakerStats {
        let inner = self.inner.lock().unwrap();
        BreakerStats {
            name: self.config.name.clone(),
            state: inner.state,
            recent_failures: inner.failures.len(),
            consecutive_successes: inner.consecutive_successes,
            last_failure_age_ms: inner.last_failure.map(|at| at.elapsed().as_millis() as u64),
        }
    }

    /// Force the breaker back to closed, dropping all failure history.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = BreakerState::Closed;
        inner.failures.clear();
        inner.last_failure = None;
        inner.consecutive_successes = 0;
    }

    fn before_call(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        self.prune_failures(&mut inner);

        if inner.state != BreakerState::Open {
            return Ok(());
        }

        let elapsed = inner
            .last_failure
            .map(|at| at.elapsed())
            .unwrap_or(self.config.reset_timeout);

        if elapsed >= self.config.reset_timeout {
            debug!(breaker = %self.config.name, "Circuit half-open, probing");
            inner.state = BreakerState::HalfOpen;
            inner.consecutive_successes = 0;
            METRICS.record_breaker_transition(&self.config.name, "half_open");
            return Ok(());
        }

        let retry_after = self.config.reset_timeout - elapsed;
        Err(ContextError::BreakerOpen {
            name: self.config.name.clone(),
            retry_after_ms: retry_after.as_millis() as u64,
        })
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => {
                // Each success pays down one recorded failure, never below 0.
                inner.failures.pop_front();
            }
            BreakerState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.half_open_successes {
                    debug!(breaker = %self.config.name, "Circuit closed after probation");
                    inner.state = BreakerState::Closed;
                    inner.failures.clear();
                    inner.last_failure = None;
                    METRICS.record_breaker_transition(&self.config.name, "closed");
                }
            }
            BreakerState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        inner.failures.push_back(now);
        inner.last_failure = Some(now);
        inner.consecutive_successes = 0;
        self.prune_failures(&mut inner);

        let should_open = match inner.state {
            BreakerState::HalfOpen => true,
            BreakerState::Closed => inner.failures.len() >= self.config.failure_threshold,
            BreakerState::Open => false,
        };

        if should_open {
            warn!(
                breaker = %self.config.name,
                failures = inner.failures.len(),
                "Circuit opened"
            );
            inner.state = BreakerState::Open;
            METRICS.record_breaker_transition(&self.config.name, "open");
        }
    }

    fn prune_failures(&self, inner: &mut BreakerInner) {
        let window = self.config.monitoring_window;
        while let Some(oldest) = inner.failures.front() {
            if oldest.elapsed() > window {
                inner.failures.pop_front();
            } else {
                break;
            }
        }
    }
}
