//! Circuit Breaker
//!
//! Isolates the orchestrator from an unreliable downstream collaborator (the
//! automation/learning service). Every guarded call is also bounded by its own
//! timeout so a CLOSED breaker cannot hang the caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{ConductorError, Result};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation - all calls allowed
    Closed,
    /// Failure threshold exceeded - calls rejected locally
    Open,
    /// Recovering: exactly one trial call allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for the circuit breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures (without an intervening success) that trip the circuit
    pub failure_threshold: u32,
    /// Time after the last failure before an OPEN circuit allows a trial call (seconds)
    pub recovery_timeout_secs: u64,
    /// Timeout applied to every guarded call (milliseconds)
    pub call_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout_secs: 60,
            call_timeout_ms: 2000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<DateTime<Utc>>,
    last_success: Option<DateTime<Utc>>,
    /// When the HALF_OPEN trial call was handed out. A trial with no outcome
    /// after `recovery_timeout` is treated as abandoned.
    trial_started: Option<DateTime<Utc>>,
}

/// Generic three-state circuit breaker
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    call_timeout: Duration,
    inner: RwLock<BreakerState>,
    total_trips: AtomicU64,
    rejected_calls: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    pub fn new(name: &str, config: &CircuitBreakerConfig) -> Self {
        Self::with_timeouts(
            name,
            config.failure_threshold,
            config.recovery_timeout(),
            config.call_timeout(),
        )
    }

    /// Create with explicit durations (sub-second recovery windows included)
    pub fn with_timeouts(
        name: &str,
        failure_threshold: u32,
        recovery_timeout: Duration,
        call_timeout: Duration,
    ) -> Self {
        Self {
            name: name.to_string(),
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            call_timeout,
            inner: RwLock::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                last_success: None,
                trial_started: None,
            }),
            total_trips: AtomicU64::new(0),
            rejected_calls: AtomicU64::new(0),
        }
    }

    /// Create with default configuration
    pub fn with_defaults(name: &str) -> Self {
        Self::new(name, &CircuitBreakerConfig::default())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get current state
    pub async fn state(&self) -> CircuitState {
        self.inner.read().await.state
    }

    pub async fn failure_count(&self) -> u32 {
        self.inner.read().await.failure_count
    }

    /// Check whether a call may proceed.
    ///
    /// An OPEN circuit whose recovery timeout has elapsed moves to HALF_OPEN
    /// and admits exactly one caller; further callers are rejected until that
    /// trial reports its outcome, or until another recovery timeout passes
    /// without one.
    pub async fn can_execute(&self) -> bool {
        let mut inner = self.inner.write().await;

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|at| Utc::now().signed_duration_since(at).to_std().unwrap_or_default())
                    .unwrap_or(self.recovery_timeout);

                if elapsed >= self.recovery_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_started = Some(Utc::now());
                    info!(breaker = %self.name, "Circuit breaker transitioning to HALF-OPEN");
                    true
                } else {
                    self.rejected_calls.fetch_add(1, Ordering::SeqCst);
                    false
                }
            }
            CircuitState::HalfOpen => {
                let now = Utc::now();
                let abandoned = inner.trial_started.map_or(true, |at| {
                    now.signed_duration_since(at).to_std().unwrap_or_default()
                        >= self.recovery_timeout
                });
                if abandoned {
                    if inner.trial_started.is_some() {
                        warn!(breaker = %self.name, "trial call reported no outcome, handing out a new trial");
                    }
                    inner.trial_started = Some(now);
                    true
                } else {
                    self.rejected_calls.fetch_add(1, Ordering::SeqCst);
                    false
                }
            }
        }
    }

    /// Record a successful call
    pub async fn record_success(&self) {
        let mut inner = self.inner.write().await;
        inner.failure_count = 0;
        inner.last_success = Some(Utc::now());

        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Closed;
            inner.trial_started = None;
            info!(breaker = %self.name, "Circuit breaker CLOSED - normal operation resumed");
        }
    }

    /// Record a failed call
    pub async fn record_failure(&self, reason: &str) {
        let mut inner = self.inner.write().await;
        inner.failure_count += 1;
        inner.last_failure = Some(Utc::now());

        warn!(
            breaker = %self.name,
            failures = inner.failure_count,
            "guarded call failed: {}",
            reason
        );

        let should_trip = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.failure_count >= self.failure_threshold,
            CircuitState::Open => false,
        };

        if should_trip {
            inner.state = CircuitState::Open;
            inner.trial_started = None;
            self.total_trips.fetch_add(1, Ordering::SeqCst);
            warn!(
                breaker = %self.name,
                failures = inner.failure_count,
                "Circuit breaker TRIPPED"
            );
        }
    }

    /// Run `call` through the breaker.
    ///
    /// Rejected immediately with [`ConductorError::CircuitOpen`] while the
    /// circuit is open; otherwise bounded by the call timeout, which counts as
    /// a failure.
    pub async fn call<F, T>(&self, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if !self.can_execute().await {
            debug!(breaker = %self.name, "call rejected, circuit open");
            return Err(ConductorError::CircuitOpen(self.name.clone()));
        }

        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(Ok(value)) => {
                self.record_success().await;
                Ok(value)
            }
            Ok(Err(e)) => {
                self.record_failure(&e.to_string()).await;
                Err(e)
            }
            Err(_) => {
                self.record_failure("call timed out").await;
                Err(ConductorError::Timeout(self.call_timeout))
            }
        }
    }

    /// Force the circuit closed (manual reset)
    pub async fn reset(&self) {
        let mut inner = self.inner.write().await;
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.trial_started = None;
        warn!(breaker = %self.name, "Circuit breaker force-closed");
    }

    /// Get circuit breaker statistics
    pub async fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.read().await;
        CircuitBreakerStats {
            state: inner.state,
            failure_count: inner.failure_count,
            failure_threshold: self.failure_threshold,
            last_failure: inner.last_failure,
            last_success: inner.last_success,
            total_trips: self.total_trips.load(Ordering::SeqCst),
            rejected_calls: self.rejected_calls.load(Ordering::SeqCst),
        }
    }
}

/// Statistics for monitoring
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub total_trips: u64,
    pub rejected_calls: u64,
}
