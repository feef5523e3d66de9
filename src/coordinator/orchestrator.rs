//! Orchestrator: facade over the orchestration engine
//!
//! Owns the agent registry, router, health monitor, workflow manager and
//! decision engine, and runs their loops as tokio tasks. `stop()`:
//!   - delivers a `shutdown` COMMAND directly to every agent handler
//!   - flips the running flag and wakes every loop
//!   - closes the queue, dropping undelivered messages
//!   - waits a bounded time for the loops (and in-flight handlers) to finish

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use super::config::OrchestratorConfig;
use super::state::{AgentSnapshot, OrchestratorStatus, SystemMetrics, SystemStatus};
use crate::coordination::{AutomationPublisher, AutomationSink, ShutdownController};
use crate::error::{ConductorError, Result};
use crate::platform::{
    AgentRegistry, AgentStatusReport, Message, MessageRouter, MessageType, Payload,
    SharedHandler, SYSTEM_AGENT,
};
use crate::rules::{DecisionEngine, DecisionRule, MetricsSource, RegistryMetrics};
use crate::supervisor::{AlertManager, HealthMonitor};
use crate::workflow::{WorkflowDefinition, WorkflowManager, WorkflowState, WorkflowStep};

pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: AgentRegistry,
    router: MessageRouter,
    health: HealthMonitor,
    workflows: WorkflowManager,
    rules: DecisionEngine,
    alerts: AlertManager,
    publisher: AutomationPublisher,
    shutdown: ShutdownController,
    status: Arc<RwLock<OrchestratorStatus>>,
    tasks: Mutex<JoinSet<()>>,
}

impl Orchestrator {
    /// Engine without an automation service; published events are skipped
    pub fn new(config: OrchestratorConfig) -> Self {
        Self::build(config, AutomationPublisher::disabled())
    }

    /// Engine publishing to `sink` through the automation circuit breaker
    pub fn with_automation(config: OrchestratorConfig, sink: Arc<dyn AutomationSink>) -> Self {
        let publisher = AutomationPublisher::new(sink, &config.breaker);
        Self::build(config, publisher)
    }

    fn build(config: OrchestratorConfig, publisher: AutomationPublisher) -> Self {
        let registry = AgentRegistry::new();
        let router = MessageRouter::new(config.router.clone(), registry.clone());
        let alerts = AlertManager::new(config.alerts.clone()).with_publisher(publisher.clone());

        let health = HealthMonitor::new(config.health.clone(), router.clone())
            .with_alerts(alerts.clone())
            .with_publisher(publisher.clone());
        let workflows =
            WorkflowManager::new(config.workflow.clone(), router.clone()).with_alerts(alerts.clone());
        let rules = DecisionEngine::new(config.rules.clone(), router.clone())
            .with_alerts(alerts.clone())
            .with_publisher(publisher.clone());

        Self {
            config,
            registry,
            router,
            health,
            workflows,
            rules,
            alerts,
            publisher,
            shutdown: ShutdownController::new(),
            status: Arc::new(RwLock::new(OrchestratorStatus::Idle)),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    // ==================== Lifecycle ====================

    /// Start every loop, evaluating rules against the registry's own metrics
    pub async fn start(&self) -> Result<()> {
        let source = Arc::new(RegistryMetrics::new(self.registry.clone()));
        self.start_with_metrics(source).await
    }

    /// Start every loop, evaluating rules against `metrics`
    pub async fn start_with_metrics(&self, metrics: Arc<dyn MetricsSource>) -> Result<()> {
        {
            let mut status = self.status.write().await;
            if *status != OrchestratorStatus::Idle {
                return Err(ConductorError::Internal(format!(
                    "orchestrator cannot start from state {:?}",
                    *status
                )));
            }
            *status = OrchestratorStatus::Running;
        }

        self.workflows.attach().await;

        let mut tasks = self.tasks.lock().await;
        tasks.spawn(self.router.clone().run(self.shutdown.clone()));
        tasks.spawn(self.health.clone().run(self.shutdown.clone()));
        tasks.spawn(self.workflows.clone().run(self.shutdown.clone()));
        if self.config.rules.enabled {
            tasks.spawn(self.rules.clone().run(metrics, self.shutdown.clone()));
        }

        info!(
            agents = self.registry.len().await,
            loops = tasks.len(),
            "orchestrator started"
        );
        Ok(())
    }

    /// Graceful shutdown
    pub async fn stop(&self) {
        {
            let mut status = self.status.write().await;
            if matches!(
                *status,
                OrchestratorStatus::Stopping | OrchestratorStatus::Stopped
            ) {
                warn!("orchestrator already stopping");
                return;
            }
            *status = OrchestratorStatus::Stopping;
        }

        let drain_timeout = self.config.router.drain_timeout();
        self.notify_agents_shutdown(drain_timeout).await;

        self.shutdown.request_shutdown();
        let dropped = self.router.close().await;

        let mut tasks = self.tasks.lock().await;
        // The router waits up to drain_timeout for its own handlers
        let joined = tokio::time::timeout(drain_timeout * 2, async {
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    error!("engine loop task failed: {}", e);
                }
            }
        })
        .await;
        if joined.is_err() {
            warn!(remaining = tasks.len(), "engine loops did not stop in time, aborting");
            tasks.abort_all();
        }

        *self.status.write().await = OrchestratorStatus::Stopped;
        info!(dropped_messages = dropped, "orchestrator stopped");
    }

    async fn notify_agents_shutdown(&self, timeout: std::time::Duration) {
        let agents = self.registry.handlers().await;
        if agents.is_empty() {
            return;
        }

        info!(agents = agents.len(), "sending shutdown to all agents");
        let router = self.router.clone();
        let delivered = tokio::time::timeout(timeout, async move {
            for (name, _) in agents {
                let command = Message::command(SYSTEM_AGENT, &name, "shutdown", Payload::new());
                router.process(command).await;
            }
        })
        .await;
        if delivered.is_err() {
            warn!("timed out delivering shutdown commands");
        }
    }

    pub async fn status(&self) -> OrchestratorStatus {
        *self.status.read().await
    }

    // ==================== Registration ====================

    pub async fn register_agent(
        &self,
        name: &str,
        capabilities: Vec<String>,
        dependencies: Vec<String>,
        handler: Option<SharedHandler>,
    ) {
        self.registry
            .register(name, capabilities, dependencies, handler)
            .await;
    }

    pub async fn unregister_agent(&self, name: &str) -> bool {
        self.registry.unregister(name).await
    }

    pub async fn agent_status(&self, name: &str) -> Result<AgentStatusReport> {
        self.registry.status_of(name).await
    }

    // ==================== Messaging ====================

    pub async fn send_message(&self, message: Message) -> bool {
        self.router.send(message).await
    }

    pub async fn add_message_handler(&self, message_type: MessageType, handler: SharedHandler) {
        self.router.subscribe(message_type, handler).await;
    }

    pub async fn remove_message_handler(
        &self,
        message_type: MessageType,
        handler: &SharedHandler,
    ) -> bool {
        self.router.unsubscribe(message_type, handler).await
    }

    // ==================== Workflows ====================

    pub async fn define_workflow(
        &self,
        name: &str,
        steps: Vec<WorkflowStep>,
        metadata: Option<Payload>,
    ) -> Result<WorkflowDefinition> {
        self.workflows.define_workflow(name, steps, metadata).await
    }

    pub async fn start_workflow(&self, id: &str, definition: WorkflowDefinition) -> bool {
        self.workflows.start_workflow(id, definition).await
    }

    pub async fn start_defined_workflow(&self, id: &str, name: &str) -> Result<bool> {
        self.workflows.start_defined_workflow(id, name).await
    }

    pub async fn workflow_state(&self, id: &str) -> Option<WorkflowState> {
        self.workflows.workflow_state(id).await
    }

    // ==================== Decision rules ====================

    pub async fn add_decision_rule(&self, rule: DecisionRule) {
        self.rules.add_rule(rule).await;
    }

    pub async fn remove_decision_rule(&self, name: &str) -> bool {
        self.rules.remove_rule(name).await
    }

    // ==================== Status ====================

    pub async fn get_system_status(&self) -> SystemStatus {
        let agents = self.registry.snapshot().await;

        SystemStatus {
            orchestrator_status: self.status().await,
            timestamp: Utc::now(),
            system_metrics: SystemMetrics::from_agents(&agents),
            agents: agents
                .iter()
                .map(|(name, agent)| (name.clone(), AgentSnapshot::from(agent)))
                .collect(),
            active_workflows: self.workflows.active_count().await,
            message_queue_size: self.router.queue_size().await,
            router: self.router.stats().await,
            queue: self.router.queue_stats().await,
            automation_breaker: self.publisher.stats().await,
        }
    }

    // ==================== Components ====================

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    pub fn health_monitor(&self) -> &HealthMonitor {
        &self.health
    }

    pub fn workflows(&self) -> &WorkflowManager {
        &self.workflows
    }

    pub fn decision_engine(&self) -> &DecisionEngine {
        &self.rules
    }

    pub fn alerts(&self) -> &AlertManager {
        &self.alerts
    }

    pub fn publisher(&self) -> &AutomationPublisher {
        &self.publisher
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }
}
