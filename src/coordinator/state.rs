//! System status snapshot returned by the orchestrator

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

use crate::coordination::CircuitBreakerStats;
use crate::platform::{Agent, AgentStatus, Metrics, QueueStats, RouterStats};

/// Orchestrator lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OrchestratorStatus {
    /// Constructed, loops not started
    Idle,
    Running,
    Stopping,
    Stopped,
}

/// Per-agent view in the system status
#[derive(Debug, Clone, Serialize)]
pub struct AgentSnapshot {
    pub status: AgentStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub error_count: u64,
    pub capabilities: Vec<String>,
    pub metrics: Metrics,
}

impl From<&Agent> for AgentSnapshot {
    fn from(agent: &Agent) -> Self {
        Self {
            status: agent.status,
            last_heartbeat: agent.last_heartbeat,
            error_count: agent.error_count,
            capabilities: agent.capabilities.clone(),
            metrics: agent.metrics.clone(),
        }
    }
}

/// Agent counts
#[derive(Debug, Clone, Default, Serialize)]
pub struct SystemMetrics {
    pub total_agents: usize,
    pub running_agents: usize,
    pub error_agents: usize,
}

/// Full operator view of the engine
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub orchestrator_status: OrchestratorStatus,
    pub timestamp: DateTime<Utc>,
    pub agents: HashMap<String, AgentSnapshot>,
    /// Number of active workflows
    pub active_workflows: usize,
    pub message_queue_size: usize,
    pub system_metrics: SystemMetrics,
    pub router: RouterStats,
    pub queue: QueueStats,
    pub automation_breaker: CircuitBreakerStats,
}

impl SystemStatus {
    /// Number of agents currently RUNNING
    pub fn running_agents(&self) -> usize {
        self.system_metrics.running_agents
    }
}

impl SystemMetrics {
    pub fn from_agents(agents: &HashMap<String, Agent>) -> Self {
        Self {
            total_agents: agents.len(),
            running_agents: agents.values().filter(|a| a.is_running()).count(),
            error_agents: agents
                .values()
                .filter(|a| a.status == AgentStatus::Error)
                .count(),
        }
    }
}
