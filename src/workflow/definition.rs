//! Workflow definitions and per-workflow runtime state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::error::{ConductorError, Result};
use crate::platform::{Agent, AgentStatus, Payload};

/// Comparison used by metric threshold conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdOperator {
    Gte,
    Lte,
    Eq,
}

impl ThresholdOperator {
    pub fn compare(&self, value: f64, threshold: f64) -> bool {
        match self {
            ThresholdOperator::Gte => value >= threshold,
            ThresholdOperator::Lte => value <= threshold,
            ThresholdOperator::Eq => (value - threshold).abs() < f64::EPSILON,
        }
    }
}

/// Structured step precondition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    AgentStatus {
        agent: String,
        status: AgentStatus,
    },
    MetricThreshold {
        agent: String,
        metric: String,
        threshold: f64,
        operator: ThresholdOperator,
    },
}

/// Step dependency: a bare agent name (that agent must be RUNNING) or a
/// structured condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepDependency {
    Agent(String),
    Condition(Condition),
}

impl StepDependency {
    /// Evaluate against a registry snapshot. Missing agents and metrics are
    /// never satisfied.
    pub fn is_satisfied(&self, agents: &HashMap<String, Agent>) -> bool {
        match self {
            StepDependency::Agent(name) => agents.get(name).is_some_and(Agent::is_running),
            StepDependency::Condition(Condition::AgentStatus { agent, status }) => {
                agents.get(agent).is_some_and(|a| a.status == *status)
            }
            StepDependency::Condition(Condition::MetricThreshold {
                agent,
                metric,
                threshold,
                operator,
            }) => agents
                .get(agent)
                .and_then(|a| a.metrics.get(metric))
                .is_some_and(|value| operator.compare(*value, *threshold)),
        }
    }
}

/// One dependency-gated command in a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub name: String,
    pub agent: String,
    pub action: String,
    #[serde(default)]
    pub parameters: Payload,
    #[serde(default)]
    pub dependencies: Vec<StepDependency>,
}

impl WorkflowStep {
    pub fn new(name: &str, agent: &str, action: &str) -> Self {
        Self {
            name: name.to_string(),
            agent: agent.to_string(),
            action: action.to_string(),
            parameters: Payload::new(),
            dependencies: Vec::new(),
        }
    }

    pub fn with_parameters(mut self, parameters: Payload) -> Self {
        self.parameters = parameters;
        self
    }

    /// Require `agent` to be RUNNING
    pub fn after_agent(mut self, agent: &str) -> Self {
        self.dependencies
            .push(StepDependency::Agent(agent.to_string()));
        self
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.dependencies.push(StepDependency::Condition(condition));
        self
    }

    pub fn dependencies_satisfied(&self, agents: &HashMap<String, Agent>) -> bool {
        self.dependencies.iter().all(|d| d.is_satisfied(agents))
    }
}

/// Named, ordered list of steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub metadata: Option<Payload>,
}

impl WorkflowDefinition {
    /// Build and validate a definition
    pub fn new(name: &str, steps: Vec<WorkflowStep>, metadata: Option<Payload>) -> Result<Self> {
        let definition = Self {
            name: name.to_string(),
            steps,
            metadata,
        };
        definition.validate()?;
        Ok(definition)
    }

    /// Parse and validate a JSON definition
    pub fn from_json(json: &str) -> Result<Self> {
        let definition: Self = serde_json::from_str(json)?;
        definition.validate()?;
        Ok(definition)
    }

    /// Non-empty, unique step names, every step targets an agent
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(ConductorError::InvalidWorkflow(format!(
                "workflow '{}' has no steps",
                self.name
            )));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.name.is_empty() {
                return Err(ConductorError::InvalidWorkflow(format!(
                    "workflow '{}' has a step without a name",
                    self.name
                )));
            }
            if !seen.insert(step.name.as_str()) {
                return Err(ConductorError::InvalidWorkflow(format!(
                    "workflow '{}' has duplicate step '{}'",
                    self.name, step.name
                )));
            }
            if step.agent.is_empty() {
                return Err(ConductorError::InvalidWorkflow(format!(
                    "step '{}' has no target agent",
                    step.name
                )));
            }
        }
        Ok(())
    }
}

/// Lifecycle of a started workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Running,
    Failed,
    Completed,
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStatus::Running => write!(f, "running"),
            WorkflowStatus::Failed => write!(f, "failed"),
            WorkflowStatus::Completed => write!(f, "completed"),
        }
    }
}

/// Command awaiting its RESPONSE (acknowledged mode only)
#[derive(Debug, Clone, Serialize)]
pub struct PendingAck {
    pub step_index: usize,
    pub correlation_id: String,
    pub sent_at: DateTime<Utc>,
    /// Sends so far, the first one included
    pub attempts: u32,
}

/// Runtime state of one workflow instance
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowState {
    pub id: String,
    pub definition: WorkflowDefinition,
    pub current_step: usize,
    pub completed_steps: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub status: WorkflowStatus,
    pub finished_at: Option<DateTime<Utc>>,
    pub failed_step: Option<String>,
    pub failed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub pending_ack: Option<PendingAck>,
}

impl WorkflowState {
    pub fn new(id: &str, definition: WorkflowDefinition) -> Self {
        Self {
            id: id.to_string(),
            definition,
            current_step: 0,
            completed_steps: Vec::new(),
            started_at: Utc::now(),
            status: WorkflowStatus::Running,
            finished_at: None,
            failed_step: None,
            failed_at: None,
            failure_reason: None,
            pending_ack: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == WorkflowStatus::Running
    }

    pub fn current(&self) -> Option<&WorkflowStep> {
        self.definition.steps.get(self.current_step)
    }

    /// Mark the current step executed and move to the next one
    pub(crate) fn advance(&mut self) {
        if let Some(step) = self.definition.steps.get(self.current_step) {
            self.completed_steps.push(step.name.clone());
        }
        self.current_step += 1;
        self.pending_ack = None;
    }

    pub(crate) fn complete(&mut self, now: DateTime<Utc>) {
        self.status = WorkflowStatus::Completed;
        self.finished_at = Some(now);
    }

    pub(crate) fn fail(&mut self, now: DateTime<Utc>, reason: &str) {
        self.status = WorkflowStatus::Failed;
        self.failed_step = self.current().map(|s| s.name.clone());
        self.failed_at = Some(now);
        self.finished_at = Some(now);
        self.failure_reason = Some(reason.to_string());
        self.pending_ack = None;
    }
}
