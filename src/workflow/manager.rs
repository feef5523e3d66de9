//! Workflow Manager
//!
//! Drives every active workflow one step at a time. Each tick the current step
//! of each workflow is checked against a registry snapshot; once its
//! dependencies hold, a COMMAND carrying `{action, parameters, workflow_id,
//! step_name}` is sent to the step's agent.
//!
//! Advancement policy:
//! - loose (default): a step counts as executed once its command is enqueued
//! - acknowledged (`require_ack`): a step advances only on a RESPONSE with the
//!   command's correlation id; an ERROR reply fails the workflow and a missing
//!   reply is re-sent a bounded number of times

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::definition::{PendingAck, WorkflowDefinition, WorkflowState, WorkflowStep};
use crate::coordination::ShutdownController;
use crate::error::{ConductorError, Result};
use crate::platform::{
    Agent, AgentRegistry, Message, MessageHandler, MessageRouter, MessageType, Payload,
};
use crate::supervisor::AlertManager;

/// Sender name on workflow commands
pub const WORKFLOW_AGENT: &str = "workflow_manager";

/// Workflow manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Interval between progression passes (ms)
    pub tick_interval_ms: u64,
    /// Advance only on a correlated RESPONSE
    pub require_ack: bool,
    /// Wait for a RESPONSE before re-sending (acknowledged mode)
    pub ack_timeout_secs: u64,
    /// Re-sends after the first command before the workflow fails
    pub max_ack_retries: u32,
    /// Finished workflows kept for inspection
    pub history_limit: usize,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 5000,
            require_ack: false,
            ack_timeout_secs: 30,
            max_ack_retries: 2,
            history_limit: 100,
        }
    }
}

impl WorkflowConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn ack_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.ack_timeout_secs as i64)
    }
}

/// What one progression pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// `(workflow_id, step_name)` for every command sent
    pub dispatched: Vec<(String, String)>,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
}

enum StepOutcome {
    Waiting,
    Dispatched(String),
    Completed,
    Failed(String),
}

/// Clone-friendly handle to the workflow tables
#[derive(Clone)]
pub struct WorkflowManager {
    config: WorkflowConfig,
    registry: AgentRegistry,
    router: MessageRouter,
    alerts: Option<AlertManager>,
    active: Arc<RwLock<HashMap<String, WorkflowState>>>,
    history: Arc<RwLock<VecDeque<WorkflowState>>>,
    definitions: Arc<RwLock<HashMap<String, WorkflowDefinition>>>,
}

impl WorkflowManager {
    pub fn new(config: WorkflowConfig, router: MessageRouter) -> Self {
        Self {
            config,
            registry: router.registry().clone(),
            router,
            alerts: None,
            active: Arc::new(RwLock::new(HashMap::new())),
            history: Arc::new(RwLock::new(VecDeque::new())),
            definitions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn with_alerts(mut self, alerts: AlertManager) -> Self {
        self.alerts = Some(alerts);
        self
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    /// Subscribe to RESPONSE and ERROR messages when acknowledgements are
    /// required. No-op in loose mode.
    pub async fn attach(&self) {
        if !self.config.require_ack {
            return;
        }
        let handler: Arc<dyn MessageHandler> = Arc::new(self.clone());
        self.router
            .subscribe(MessageType::Response, handler.clone())
            .await;
        self.router.subscribe(MessageType::Error, handler).await;
        debug!("workflow acknowledgement handlers attached");
    }

    // ==================== Definitions ====================

    /// Validate and register a named definition
    pub async fn define_workflow(
        &self,
        name: &str,
        steps: Vec<WorkflowStep>,
        metadata: Option<Payload>,
    ) -> Result<WorkflowDefinition> {
        let definition = WorkflowDefinition::new(name, steps, metadata)?;
        self.definitions
            .write()
            .await
            .insert(name.to_string(), definition.clone());
        info!(workflow = name, steps = definition.steps.len(), "workflow defined");
        Ok(definition)
    }

    pub async fn definition(&self, name: &str) -> Option<WorkflowDefinition> {
        self.definitions.read().await.get(name).cloned()
    }

    // ==================== Lifecycle ====================

    /// Start a workflow instance. Returns false if `id` is already active.
    pub async fn start_workflow(&self, id: &str, definition: WorkflowDefinition) -> bool {
        let mut active = self.active.write().await;
        if active.contains_key(id) {
            warn!(workflow_id = id, "workflow already active");
            return false;
        }

        info!(
            workflow_id = id,
            definition = %definition.name,
            steps = definition.steps.len(),
            "starting workflow"
        );
        active.insert(id.to_string(), WorkflowState::new(id, definition));
        true
    }

    /// Start a workflow from a definition registered with [`define_workflow`](Self::define_workflow)
    pub async fn start_defined_workflow(&self, id: &str, name: &str) -> Result<bool> {
        let definition = self
            .definition(name)
            .await
            .ok_or_else(|| ConductorError::WorkflowNotFound(name.to_string()))?;
        Ok(self.start_workflow(id, definition).await)
    }

    /// State of an active or recently finished workflow
    pub async fn workflow_state(&self, id: &str) -> Option<WorkflowState> {
        if let Some(state) = self.active.read().await.get(id) {
            return Some(state.clone());
        }
        self.history
            .read()
            .await
            .iter()
            .rev()
            .find(|s| s.id == id)
            .cloned()
    }

    pub async fn active_workflows(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }

    /// Finished workflows, oldest first
    pub async fn history(&self) -> Vec<WorkflowState> {
        self.history.read().await.iter().cloned().collect()
    }

    // ==================== Progression ====================

    /// Run one progression pass over every active workflow
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let agents = self.registry.snapshot().await;
        let mut report = TickReport::default();
        let mut finished = Vec::new();

        let mut active = self.active.write().await;
        let mut ids: Vec<String> = active.keys().cloned().collect();
        ids.sort();

        for id in ids {
            let Some(state) = active.get_mut(&id) else {
                continue;
            };

            match self.progress(state, &agents, now).await {
                StepOutcome::Waiting => {}
                StepOutcome::Dispatched(step) => report.dispatched.push((id.clone(), step)),
                StepOutcome::Completed => {
                    info!(workflow_id = %id, steps = state.completed_steps.len(), "workflow completed");
                    report.completed.push(id.clone());
                    finished.push(id);
                }
                StepOutcome::Failed(reason) => {
                    error!(
                        workflow_id = %id,
                        step = ?state.failed_step,
                        "workflow failed: {}",
                        reason
                    );
                    if let Some(alerts) = &self.alerts {
                        alerts
                            .workflow_failed(&id, state.failed_step.as_deref(), &reason)
                            .await;
                    }
                    report.failed.push(id.clone());
                    finished.push(id);
                }
            }
        }

        let archived: Vec<WorkflowState> = finished
            .iter()
            .filter_map(|id| active.remove(id))
            .collect();
        drop(active);
        self.archive(archived).await;

        report
    }

    async fn progress(
        &self,
        state: &mut WorkflowState,
        agents: &HashMap<String, Agent>,
        now: DateTime<Utc>,
    ) -> StepOutcome {
        let Some(step) = state.current().cloned() else {
            state.complete(now);
            return StepOutcome::Completed;
        };

        if let Some(pending) = state.pending_ack.clone() {
            if now.signed_duration_since(pending.sent_at) < self.config.ack_timeout() {
                return StepOutcome::Waiting;
            }
            if pending.attempts > self.config.max_ack_retries {
                let reason = format!(
                    "no response to step '{}' after {} attempts",
                    step.name, pending.attempts
                );
                state.fail(now, &reason);
                return StepOutcome::Failed(reason);
            }

            warn!(
                workflow_id = %state.id,
                step = %step.name,
                attempt = pending.attempts + 1,
                "acknowledgement timed out, re-sending"
            );
            return match self.dispatch(&state.id, &step).await {
                Some(correlation_id) => {
                    state.pending_ack = Some(PendingAck {
                        step_index: state.current_step,
                        correlation_id,
                        sent_at: now,
                        attempts: pending.attempts + 1,
                    });
                    StepOutcome::Dispatched(step.name)
                }
                None => {
                    let reason = "message queue closed".to_string();
                    state.fail(now, &reason);
                    StepOutcome::Failed(reason)
                }
            };
        }

        if !step.dependencies_satisfied(agents) {
            return StepOutcome::Waiting;
        }

        let Some(correlation_id) = self.dispatch(&state.id, &step).await else {
            let reason = "message queue closed".to_string();
            state.fail(now, &reason);
            return StepOutcome::Failed(reason);
        };

        if self.config.require_ack {
            state.pending_ack = Some(PendingAck {
                step_index: state.current_step,
                correlation_id,
                sent_at: now,
                attempts: 1,
            });
        } else {
            state.advance();
        }
        StepOutcome::Dispatched(step.name)
    }

    /// Send the step command; returns its correlation id, or None when the
    /// queue is closed
    async fn dispatch(&self, workflow_id: &str, step: &WorkflowStep) -> Option<String> {
        let correlation_id = Uuid::new_v4().to_string();
        let mut command =
            Message::command(WORKFLOW_AGENT, &step.agent, &step.action, step.parameters.clone())
                .with_correlation_id(correlation_id.clone());
        command
            .payload
            .insert("workflow_id".into(), Value::String(workflow_id.to_string()));
        command
            .payload
            .insert("step_name".into(), Value::String(step.name.clone()));

        if !self.router.send(command).await {
            return None;
        }

        debug!(
            workflow_id,
            step = %step.name,
            agent = %step.agent,
            action = %step.action,
            "workflow step dispatched"
        );
        Some(correlation_id)
    }

    async fn archive(&self, finished: Vec<WorkflowState>) {
        if finished.is_empty() {
            return;
        }
        let mut history = self.history.write().await;
        for state in finished {
            history.push_back(state);
        }
        while history.len() > self.config.history_limit {
            history.pop_front();
        }
    }

    /// Apply a RESPONSE or ERROR to the workflow awaiting its correlation id
    async fn acknowledge(&self, message: &Message) {
        let Some(correlation_id) = message.correlation_id.as_deref() else {
            return;
        };

        let mut active = self.active.write().await;
        let Some(state) = active.values_mut().find(|s| {
            s.pending_ack
                .as_ref()
                .is_some_and(|p| p.correlation_id == correlation_id)
        }) else {
            debug!(correlation_id, "no workflow awaiting this reply");
            return;
        };

        match message.message_type {
            MessageType::Response => {
                debug!(workflow_id = %state.id, current_step = state.current_step, "step acknowledged");
                state.advance();
            }
            MessageType::Error => {
                let reason = message
                    .payload
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("agent reported an error")
                    .to_string();
                let now = Utc::now();
                state.fail(now, &reason);
                let id = state.id.clone();
                let failed_step = state.failed_step.clone();
                error!(workflow_id = %id, step = ?failed_step, "workflow failed: {}", reason);

                let archived: Vec<WorkflowState> = active.remove(&id).into_iter().collect();
                drop(active);
                self.archive(archived).await;

                if let Some(alerts) = &self.alerts {
                    alerts
                        .workflow_failed(&id, failed_step.as_deref(), &reason)
                        .await;
                }
            }
            _ => {}
        }
    }

    /// Progression loop; runs until shutdown
    pub async fn run(self, shutdown: ShutdownController) {
        let mut shutdown_rx = shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            interval_ms = self.config.tick_interval_ms,
            require_ack = self.config.require_ack,
            "workflow manager started"
        );

        while shutdown.is_running() {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => {}
            }
            self.tick(Utc::now()).await;
        }

        info!("workflow manager stopped");
    }
}

#[async_trait]
impl MessageHandler for WorkflowManager {
    async fn handle(&self, message: Message) -> Result<()> {
        if matches!(
            message.message_type,
            MessageType::Response | MessageType::Error
        ) {
            self.acknowledge(&message).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{Metrics, RouterConfig};
    use crate::workflow::definition::{Condition, ThresholdOperator, WorkflowStatus};

    fn manager(config: WorkflowConfig) -> (WorkflowManager, MessageRouter) {
        let router = MessageRouter::new(RouterConfig::default(), AgentRegistry::new());
        (WorkflowManager::new(config, router.clone()), router)
    }

    async fn drain(router: &MessageRouter) -> Vec<Message> {
        let mut out = Vec::new();
        while let Some(m) = router.recv(Duration::from_millis(5)).await {
            out.push(m);
        }
        out
    }

    fn two_steps() -> WorkflowDefinition {
        WorkflowDefinition::new(
            "w",
            vec![
                WorkflowStep::new("s1", "a", "go"),
                WorkflowStep::new("s2", "b", "analyze").after_agent("a"),
            ],
            None,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_start_rejects_duplicate_active_id() {
        let (manager, _router) = manager(WorkflowConfig::default());
        assert!(manager.start_workflow("w1", two_steps()).await);
        assert!(!manager.start_workflow("w1", two_steps()).await);
        assert_eq!(manager.active_workflows().await, vec!["w1"]);
    }

    #[tokio::test]
    async fn test_dependency_gating_dispatches_once() {
        let (manager, router) = manager(WorkflowConfig::default());
        router.registry().register("a", vec![], vec![], None).await;
        router.registry().register("b", vec![], vec![], None).await;
        manager.start_workflow("w1", two_steps()).await;

        let now = Utc::now();
        let report = manager.tick(now).await;
        assert_eq!(report.dispatched, vec![("w1".to_string(), "s1".to_string())]);

        // s2 waits for "a" to be RUNNING
        for _ in 0..3 {
            assert!(manager.tick(now).await.dispatched.is_empty());
        }

        router
            .registry()
            .record_heartbeat("a", now, &Metrics::new())
            .await;
        let report = manager.tick(now).await;
        assert_eq!(report.dispatched, vec![("w1".to_string(), "s2".to_string())]);

        let report = manager.tick(now).await;
        assert_eq!(report.completed, vec!["w1"]);
        assert_eq!(manager.active_count().await, 0);

        let sent = drain(&router).await;
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].recipient, "b");
        assert_eq!(sent[1].payload["workflow_id"], "w1");
        assert_eq!(sent[1].payload["step_name"], "s2");
        assert_eq!(sent[1].action(), Some("analyze"));

        let state = manager.workflow_state("w1").await.unwrap();
        assert_eq!(state.status, WorkflowStatus::Completed);
        assert_eq!(state.completed_steps, vec!["s1", "s2"]);
    }

    #[tokio::test]
    async fn test_metric_condition_gates_step() {
        let (manager, router) = manager(WorkflowConfig::default());
        router.registry().register("scanner", vec![], vec![], None).await;
        let definition = WorkflowDefinition::new(
            "gated",
            vec![WorkflowStep::new("trade", "trader", "buy").when(Condition::MetricThreshold {
                agent: "scanner".into(),
                metric: "candidates".into(),
                threshold: 3.0,
                operator: ThresholdOperator::Gte,
            })],
            None,
        )
        .unwrap();
        manager.start_workflow("g1", definition).await;

        let metrics: Metrics = [("candidates".to_string(), 2.0)].into_iter().collect();
        router
            .registry()
            .record_heartbeat("scanner", Utc::now(), &metrics)
            .await;
        assert!(manager.tick(Utc::now()).await.dispatched.is_empty());

        let metrics: Metrics = [("candidates".to_string(), 3.0)].into_iter().collect();
        router
            .registry()
            .record_heartbeat("scanner", Utc::now(), &metrics)
            .await;
        assert_eq!(manager.tick(Utc::now()).await.dispatched.len(), 1);
    }

    #[tokio::test]
    async fn test_closed_queue_fails_workflow() {
        let (manager, router) = manager(WorkflowConfig::default());
        manager.start_workflow("w1", two_steps()).await;
        router.close().await;

        let report = manager.tick(Utc::now()).await;
        assert_eq!(report.failed, vec!["w1"]);

        let state = manager.workflow_state("w1").await.unwrap();
        assert_eq!(state.status, WorkflowStatus::Failed);
        assert_eq!(state.failed_step.as_deref(), Some("s1"));
        assert!(state.failed_at.is_some());
        assert_eq!(manager.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_start_defined_workflow() {
        let (manager, _router) = manager(WorkflowConfig::default());
        manager
            .define_workflow("scan", vec![WorkflowStep::new("s1", "scanner", "scan")], None)
            .await
            .unwrap();

        assert!(manager.start_defined_workflow("run-1", "scan").await.unwrap());
        let err = manager
            .start_defined_workflow("run-2", "missing")
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::WorkflowNotFound(_)));
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let (manager, router) = manager(WorkflowConfig {
            history_limit: 2,
            ..Default::default()
        });
        router.registry().register("a", vec![], vec![], None).await;
        let single = WorkflowDefinition::new("one", vec![WorkflowStep::new("s1", "a", "go")], None)
            .unwrap();

        for i in 0..3 {
            manager.start_workflow(&format!("w{i}"), single.clone()).await;
        }
        manager.tick(Utc::now()).await;
        manager.tick(Utc::now()).await;

        let history: Vec<String> = manager.history().await.into_iter().map(|s| s.id).collect();
        assert_eq!(history, vec!["w1", "w2"]);
        assert!(manager.workflow_state("w0").await.is_none());
    }

    #[tokio::test]
    async fn test_ack_mode_waits_for_response() {
        let (manager, router) = manager(WorkflowConfig {
            require_ack: true,
            ..Default::default()
        });
        manager.attach().await;
        assert_eq!(router.subscriber_count(MessageType::Response).await, 1);

        manager.start_workflow("w1", two_steps()).await;
        let now = Utc::now();
        manager.tick(now).await;
        let command = drain(&router).await.remove(0);

        // No advance without the reply
        manager.tick(now).await;
        assert_eq!(manager.workflow_state("w1").await.unwrap().current_step, 0);

        // Uncorrelated replies are ignored
        router
            .process(Message::new(MessageType::Response, "a", WORKFLOW_AGENT, Payload::new()))
            .await;
        assert_eq!(manager.workflow_state("w1").await.unwrap().current_step, 0);

        router.process(command.reply(Payload::new())).await;
        let state = manager.workflow_state("w1").await.unwrap();
        assert_eq!(state.current_step, 1);
        assert_eq!(state.completed_steps, vec!["s1"]);
        assert!(state.pending_ack.is_none());
    }

    #[tokio::test]
    async fn test_ack_mode_error_reply_fails_workflow() {
        let (manager, router) = manager(WorkflowConfig {
            require_ack: true,
            ..Default::default()
        });
        manager.attach().await;
        manager.start_workflow("w1", two_steps()).await;
        manager.tick(Utc::now()).await;
        let command = drain(&router).await.remove(0);

        router.process(command.error_reply("agent offline")).await;

        let state = manager.workflow_state("w1").await.unwrap();
        assert_eq!(state.status, WorkflowStatus::Failed);
        assert_eq!(state.failed_step.as_deref(), Some("s1"));
        assert_eq!(state.failure_reason.as_deref(), Some("agent offline"));
    }

    #[tokio::test]
    async fn test_ack_timeout_retries_then_fails() {
        let (manager, router) = manager(WorkflowConfig {
            require_ack: true,
            ack_timeout_secs: 10,
            max_ack_retries: 1,
            ..Default::default()
        });
        manager.start_workflow("w1", two_steps()).await;

        let start = Utc::now();
        manager.tick(start).await;
        let report = manager.tick(start + chrono::Duration::seconds(11)).await;
        assert_eq!(report.dispatched.len(), 1);

        let sent = drain(&router).await;
        assert_eq!(sent.len(), 2);
        assert_ne!(sent[0].correlation_id, sent[1].correlation_id);

        let report = manager.tick(start + chrono::Duration::seconds(22)).await;
        assert_eq!(report.failed, vec!["w1"]);
        let state = manager.workflow_state("w1").await.unwrap();
        assert!(state.failure_reason.unwrap().contains("after 2 attempts"));
    }
}
