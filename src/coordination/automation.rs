//! Automation publisher
//!
//! Events leaving the engine (automated actions, health reports, alerts) go to
//! an external automation/learning service through an [`AutomationSink`].
//! Every publish is guarded by a [`CircuitBreaker`] so a failing service is
//! skipped locally instead of stalling the caller.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats};
use crate::error::Result;
use crate::platform::AgentStatus;
use crate::supervisor::Alert;

/// Event published to the automation service
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AutomationEvent {
    /// A decision rule fired and its command was enqueued
    ActionTriggered {
        rule: String,
        action: String,
        recipient: String,
        priority: i32,
        timestamp: DateTime<Utc>,
    },
    /// Health monitor observation about one agent
    HealthReport {
        agent: String,
        status: AgentStatus,
        detail: String,
        timestamp: DateTime<Utc>,
    },
    Alert(Alert),
}

impl AutomationEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            AutomationEvent::ActionTriggered { .. } => "action_triggered",
            AutomationEvent::HealthReport { .. } => "health_report",
            AutomationEvent::Alert(_) => "alert",
        }
    }
}

/// Downstream automation/learning service
#[async_trait]
pub trait AutomationSink: Send + Sync {
    async fn publish(&self, event: AutomationEvent) -> Result<()>;
}

/// Result of one publish attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Delivered,
    /// Not attempted: no sink configured or circuit open
    Skipped,
    Failed(String),
}

/// Breaker-guarded publisher; cheap to clone
#[derive(Clone)]
pub struct AutomationPublisher {
    sink: Option<Arc<dyn AutomationSink>>,
    breaker: Arc<CircuitBreaker>,
}

impl AutomationPublisher {
    pub fn new(sink: Arc<dyn AutomationSink>, config: &CircuitBreakerConfig) -> Self {
        Self {
            sink: Some(sink),
            breaker: Arc::new(CircuitBreaker::new("automation", config)),
        }
    }

    /// Publisher that skips every event
    pub fn disabled() -> Self {
        Self {
            sink: None,
            breaker: Arc::new(CircuitBreaker::with_defaults("automation")),
        }
    }

    pub fn with_breaker(sink: Arc<dyn AutomationSink>, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            sink: Some(sink),
            breaker,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Publish one event through the breaker
    pub async fn publish(&self, event: AutomationEvent) -> PublishOutcome {
        let Some(sink) = self.sink.as_ref() else {
            return PublishOutcome::Skipped;
        };

        let kind = event.kind();
        match self.breaker.call(sink.publish(event)).await {
            Ok(()) => PublishOutcome::Delivered,
            Err(e) if e.is_skipped() => {
                debug!(kind, "automation service unavailable, event skipped");
                PublishOutcome::Skipped
            }
            Err(e) => {
                warn!(kind, error = %e, "automation publish failed");
                PublishOutcome::Failed(e.to_string())
            }
        }
    }

    /// Fire-and-forget publish on a separate task
    pub fn publish_detached(&self, event: AutomationEvent) -> JoinHandle<PublishOutcome> {
        let publisher = self.clone();
        tokio::spawn(async move { publisher.publish(event).await })
    }

    pub async fn stats(&self) -> CircuitBreakerStats {
        self.breaker.stats().await
    }
}
