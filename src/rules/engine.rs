//! Decision Rule Engine
//!
//! Turns sustained abnormal conditions into automated commands. Each rule has
//! a timer that starts when its condition first holds and is deleted as soon
//! as the condition is false, so only a continuously true condition can fire.
//! Firing sends a COMMAND through the router and restarts the timer.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::metrics::MetricsSource;
use crate::coordination::{AutomationEvent, AutomationPublisher, ShutdownController};
use crate::error::{ConductorError, Result};
use crate::platform::{Message, MessageRouter, Metrics, Payload};
use crate::supervisor::AlertManager;

/// Sender name on automated commands
pub const DECISION_AGENT: &str = "decision_engine";

/// Rule evaluation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    /// Run the evaluation loop at all
    pub enabled: bool,
    /// Interval between evaluations (default: 60s)
    pub evaluation_interval_secs: u64,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            evaluation_interval_secs: 60,
        }
    }
}

impl RulesConfig {
    pub fn evaluation_interval(&self) -> Duration {
        Duration::from_secs(self.evaluation_interval_secs)
    }
}

/// Predicate over the current metrics snapshot
pub type RuleCondition = Arc<dyn Fn(&Metrics) -> bool + Send + Sync>;

/// Named condition/timeout/action triple
#[derive(Clone)]
pub struct DecisionRule {
    pub name: String,
    pub condition: RuleCondition,
    /// How long the condition must hold before firing
    pub timeout: Duration,
    pub action: String,
    pub recipient: String,
    pub priority: i32,
    /// Static command parameters; a numeric `priority` entry overrides the rule's
    pub parameters: Payload,
}

impl DecisionRule {
    pub fn new<F>(name: &str, recipient: &str, action: &str, timeout: Duration, condition: F) -> Self
    where
        F: Fn(&Metrics) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            condition: Arc::new(condition),
            timeout,
            action: action.to_string(),
            recipient: recipient.to_string(),
            priority: 0,
            parameters: Payload::new(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_parameters(mut self, parameters: Payload) -> Self {
        self.parameters = parameters;
        self
    }

    /// Priority attached to the fired command
    pub fn resolved_priority(&self) -> i32 {
        self.parameters
            .get("priority")
            .and_then(Value::as_i64)
            .and_then(|p| i32::try_from(p).ok())
            .unwrap_or(self.priority)
    }

    /// Evaluate the condition. A panicking condition is reported as `Err`
    /// with the panic text.
    fn holds(&self, metrics: &Metrics) -> std::result::Result<bool, String> {
        panic::catch_unwind(AssertUnwindSafe(|| (self.condition)(metrics))).map_err(|payload| {
            payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string())
        })
    }
}

impl fmt::Debug for DecisionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecisionRule")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("action", &self.action)
            .field("recipient", &self.recipient)
            .field("priority", &self.priority)
            .finish()
    }
}

/// Timer-driven rule evaluator
#[derive(Clone)]
pub struct DecisionEngine {
    config: RulesConfig,
    router: MessageRouter,
    alerts: Option<AlertManager>,
    publisher: Option<AutomationPublisher>,
    rules: Arc<RwLock<Vec<DecisionRule>>>,
    timers: Arc<DashMap<String, DateTime<Utc>>>,
}

impl DecisionEngine {
    pub fn new(config: RulesConfig, router: MessageRouter) -> Self {
        Self {
            config,
            router,
            alerts: None,
            publisher: None,
            rules: Arc::new(RwLock::new(Vec::new())),
            timers: Arc::new(DashMap::new()),
        }
    }

    pub fn with_alerts(mut self, alerts: AlertManager) -> Self {
        self.alerts = Some(alerts);
        self
    }

    pub fn with_publisher(mut self, publisher: AutomationPublisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn config(&self) -> &RulesConfig {
        &self.config
    }

    /// Add a rule, replacing any rule with the same name (and its timer)
    pub async fn add_rule(&self, rule: DecisionRule) {
        let mut rules = self.rules.write().await;
        self.timers.remove(&rule.name);
        match rules.iter_mut().find(|r| r.name == rule.name) {
            Some(existing) => *existing = rule,
            None => {
                info!(rule = %rule.name, action = %rule.action, "decision rule added");
                rules.push(rule);
            }
        }
    }

    pub async fn remove_rule(&self, name: &str) -> bool {
        let mut rules = self.rules.write().await;
        let before = rules.len();
        rules.retain(|r| r.name != name);
        self.timers.remove(name);
        rules.len() != before
    }

    pub async fn rule_names(&self) -> Vec<String> {
        self.rules.read().await.iter().map(|r| r.name.clone()).collect()
    }

    /// When the rule's condition started holding, if it currently does
    pub fn timer_started(&self, name: &str) -> Option<DateTime<Utc>> {
        self.timers.get(name).map(|t| *t)
    }

    /// Evaluate every rule against `metrics` as of `now`. Returns the names of
    /// rules that fired.
    pub async fn evaluate(&self, metrics: &Metrics, now: DateTime<Utc>) -> Vec<String> {
        let rules = self.rules.read().await.clone();
        let mut fired = Vec::new();

        for rule in &rules {
            let holds = match rule.holds(metrics) {
                Ok(holds) => holds,
                Err(panic) => {
                    error!(rule = %rule.name, "rule condition panicked: {}", panic);
                    if let Some(alerts) = &self.alerts {
                        alerts.rule_condition_failed(&rule.name, &panic).await;
                    }
                    false
                }
            };
            if !holds {
                if self.timers.remove(&rule.name).is_some() {
                    debug!(rule = %rule.name, "condition cleared, timer reset");
                }
                continue;
            }

            let Some(started) = self.timer_started(&rule.name) else {
                debug!(rule = %rule.name, "condition holds, timer started");
                self.timers.insert(rule.name.clone(), now);
                continue;
            };

            let held = now.signed_duration_since(started).to_std().unwrap_or_default();
            if held < rule.timeout {
                continue;
            }

            match self.trigger(rule, now).await {
                Ok(()) => {
                    self.timers.insert(rule.name.clone(), now);
                    fired.push(rule.name.clone());
                }
                Err(e) => {
                    // Timer kept so the next evaluation retries
                    error!(rule = %rule.name, "rule trigger failed: {}", e);
                    if let Some(alerts) = &self.alerts {
                        alerts.rule_trigger_failed(&rule.name, &e.to_string()).await;
                    }
                }
            }
        }

        fired
    }

    async fn trigger(&self, rule: &DecisionRule, now: DateTime<Utc>) -> Result<()> {
        let priority = rule.resolved_priority();
        let mut parameters = rule.parameters.clone();
        parameters.insert("triggered_by".into(), Value::String(rule.name.clone()));
        parameters.insert("automated".into(), Value::Bool(true));

        let command = Message::command(DECISION_AGENT, &rule.recipient, &rule.action, parameters)
            .with_priority(priority);
        if !self.router.send(command).await {
            return Err(ConductorError::QueueClosed);
        }

        warn!(
            rule = %rule.name,
            action = %rule.action,
            recipient = %rule.recipient,
            priority,
            "decision rule fired"
        );

        if let Some(publisher) = &self.publisher {
            publisher.publish_detached(AutomationEvent::ActionTriggered {
                rule: rule.name.clone(),
                action: rule.action.clone(),
                recipient: rule.recipient.clone(),
                priority,
                timestamp: now,
            });
        }
        Ok(())
    }

    /// Evaluation loop over `source`; runs until shutdown
    pub async fn run(self, source: Arc<dyn MetricsSource>, shutdown: ShutdownController) {
        let mut shutdown_rx = shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.config.evaluation_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            interval_secs = self.config.evaluation_interval_secs,
            "decision engine started"
        );

        while shutdown.is_running() {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => {}
            }

            match source.snapshot().await {
                Ok(metrics) => {
                    let fired = self.evaluate(&metrics, Utc::now()).await;
                    if !fired.is_empty() {
                        debug!(?fired, "rules fired");
                    }
                }
                Err(e) => warn!("metrics snapshot unavailable: {}", e),
            }
        }

        info!("decision engine stopped");
    }
}
