//! Alert Manager
//!
//! Routes operator alerts by severity: every alert is logged and broadcast
//! locally, non-info alerts are forwarded to the automation service. Includes
//! rate limiting to prevent alert storms.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

use crate::coordination::{AutomationEvent, AutomationPublisher};

/// Alert severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    /// Informational - log only
    Info,
    Warning,
    Error,
    /// Needs manual intervention
    Critical,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Info => "info",
            AlertLevel::Warning => "warning",
            AlertLevel::Error => "error",
            AlertLevel::Critical => "critical",
        }
    }
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Alert payload
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub component: String,
    pub title: String,
    pub message: String,
    pub metadata: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn new(level: AlertLevel, component: &str, title: &str, message: &str) -> Self {
        Self {
            level,
            component: component.to_string(),
            title: title.to_string(),
            message: message.to_string(),
            metadata: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    fn dedup_key(&self) -> String {
        format!("{}:{}:{}", self.component, self.level, self.title)
    }

    fn log(&self) {
        let (component, title, message) = (&self.component, &self.title, &self.message);
        match self.level {
            AlertLevel::Info => info!(%component, %title, "{message}"),
            AlertLevel::Warning => warn!(%component, %title, "{message}"),
            AlertLevel::Error => error!(%component, %title, "{message}"),
            AlertLevel::Critical => error!(%component, %title, critical = true, "{message}"),
        }
    }
}

/// Configuration for alert manager
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertManagerConfig {
    /// Minimum interval between duplicate alerts (default: 60s)
    pub rate_limit_secs: u64,
    /// Forward info-level alerts too (default: false)
    pub forward_info: bool,
    /// Maximum forwarded alerts per minute before throttling (default: 10)
    pub max_alerts_per_minute: u32,
}

impl Default for AlertManagerConfig {
    fn default() -> Self {
        Self {
            rate_limit_secs: 60,
            forward_info: false,
            max_alerts_per_minute: 10,
        }
    }
}

/// Forwarding gate: per-key quiet window plus a sliding one-minute cap
#[derive(Debug, Default)]
struct ForwardLimiter {
    /// key -> (last forwarded, suppressed since)
    last_forwarded: HashMap<String, (DateTime<Utc>, u32)>,
    forwarded_window: VecDeque<DateTime<Utc>>,
}

enum Gate {
    Open,
    Duplicate(u32),
    Throttled(usize),
}

impl ForwardLimiter {
    fn admit(&mut self, key: String, now: DateTime<Utc>, config: &AlertManagerConfig) -> Gate {
        let quiet = chrono::Duration::seconds(config.rate_limit_secs as i64);
        // Keys whose quiet window has passed no longer suppress anything
        self.last_forwarded
            .retain(|_, (last, _)| now.signed_duration_since(*last) < quiet);
        if let Some((_, suppressed)) = self.last_forwarded.get_mut(&key) {
            *suppressed += 1;
            return Gate::Duplicate(*suppressed);
        }

        let window_start = now - chrono::Duration::minutes(1);
        while self.forwarded_window.front().is_some_and(|t| *t <= window_start) {
            self.forwarded_window.pop_front();
        }
        if self.forwarded_window.len() >= config.max_alerts_per_minute as usize {
            return Gate::Throttled(self.forwarded_window.len());
        }

        self.forwarded_window.push_back(now);
        self.last_forwarded.insert(key, (now, 0));
        Gate::Open
    }
}

/// Shared alert router; clones share rate limits and subscribers
#[derive(Clone)]
pub struct AlertManager {
    config: AlertManagerConfig,
    publisher: Option<AutomationPublisher>,
    limiter: Arc<Mutex<ForwardLimiter>>,
    event_tx: broadcast::Sender<Alert>,
}

impl AlertManager {
    pub fn new(config: AlertManagerConfig) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            config,
            publisher: None,
            limiter: Arc::new(Mutex::new(ForwardLimiter::default())),
            event_tx,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(AlertManagerConfig::default())
    }

    /// Forward alerts to the automation service
    pub fn with_publisher(mut self, publisher: AutomationPublisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.event_tx.subscribe()
    }

    /// Raise an alert: broadcast, log by level, then forward when the
    /// publisher is set and the limiter admits it
    pub async fn alert(&self, alert: Alert) {
        let _ = self.event_tx.send(alert.clone());
        alert.log();

        let Some(publisher) = self.publisher.as_ref() else {
            return;
        };
        if alert.level == AlertLevel::Info && !self.config.forward_info {
            return;
        }

        let gate = self
            .limiter
            .lock()
            .await
            .admit(alert.dedup_key(), Utc::now(), &self.config);
        match gate {
            Gate::Open => {
                publisher.publish_detached(AutomationEvent::Alert(alert));
            }
            Gate::Duplicate(suppressed) => {
                debug!(title = %alert.title, suppressed, "duplicate alert not forwarded");
            }
            Gate::Throttled(recent) => {
                warn!(
                    recent,
                    max = self.config.max_alerts_per_minute,
                    title = %alert.title,
                    "alert forwarding throttled"
                );
            }
        }
    }

    pub async fn info(&self, component: &str, title: &str, message: &str) {
        self.alert(Alert::new(AlertLevel::Info, component, title, message))
            .await;
    }

    pub async fn warning(&self, component: &str, title: &str, message: &str) {
        self.alert(Alert::new(AlertLevel::Warning, component, title, message))
            .await;
    }

    pub async fn error(&self, component: &str, title: &str, message: &str) {
        self.alert(Alert::new(AlertLevel::Error, component, title, message))
            .await;
    }

    pub async fn critical(&self, component: &str, title: &str, message: &str) {
        self.alert(Alert::new(AlertLevel::Critical, component, title, message))
            .await;
    }

    /// Agent stopped sending heartbeats
    pub async fn agent_timed_out(&self, agent: &str, last_heartbeat: Option<DateTime<Utc>>) {
        let message = format!("{agent} missed heartbeats and was marked TIMEOUT");
        self.alert(
            Alert::new(AlertLevel::Warning, agent, "Agent Heartbeat Timeout", &message).with_metadata(
                serde_json::json!({ "action": "restart_requested", "last_heartbeat": last_heartbeat }),
            ),
        )
        .await;
    }

    /// Agent stayed in TIMEOUT through every restart attempt
    pub async fn restart_exhausted(&self, agent: &str, attempts: u32) {
        let message = format!("{agent} still in TIMEOUT after {attempts} restart commands");
        self.alert(
            Alert::new(AlertLevel::Critical, agent, "Restart Attempts Exhausted", &message)
                .with_metadata(serde_json::json!({ "attempts": attempts })),
        )
        .await;
    }

    /// Decision rule fired but its command could not be issued
    pub async fn rule_trigger_failed(&self, rule: &str, error: &str) {
        self.alert(
            Alert::new(AlertLevel::Error, "decision_engine", "Rule Trigger Failed", error)
                .with_metadata(serde_json::json!({ "rule": rule })),
        )
        .await;
    }

    /// Decision rule condition panicked; treated as not holding
    pub async fn rule_condition_failed(&self, rule: &str, error: &str) {
        self.alert(
            Alert::new(AlertLevel::Error, "decision_engine", "Rule Condition Failed", error)
                .with_metadata(serde_json::json!({ "rule": rule })),
        )
        .await;
    }

    pub async fn workflow_failed(&self, workflow_id: &str, step: Option<&str>, reason: &str) {
        let message = format!("workflow {workflow_id} failed: {reason}");
        self.alert(
            Alert::new(AlertLevel::Error, "workflow_manager", "Workflow Failed", &message)
                .with_metadata(serde_json::json!({ "workflow_id": workflow_id, "failed_step": step })),
        )
        .await;
    }

    /// Suppressed duplicate counts keyed by `component:level:title`
    pub async fn suppressed_counts(&self) -> HashMap<String, u32> {
        self.limiter
            .lock()
            .await
            .last_forwarded
            .iter()
            .filter(|(_, (_, suppressed))| *suppressed > 0)
            .map(|(key, (_, suppressed))| (key.clone(), *suppressed))
            .collect()
    }

    pub async fn reset_rate_limits(&self) {
        *self.limiter.lock().await = ForwardLimiter::default();
        debug!("alert rate limits reset");
    }
}
