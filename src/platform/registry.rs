//! Agent Registry
//!
//! In-memory table of known agents, their declared capabilities/dependencies,
//! live status and optional message handler. The table is shared by the router
//! (heartbeats, status updates, handler failures), the health monitor
//! (timeouts) and the workflow manager (dependency gating), so every access
//! goes through one async lock.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::traits::SharedHandler;
use super::types::{Agent, AgentStatus, Metrics, StatusEvent};
use crate::error::{ConductorError, Result};

struct AgentEntry {
    agent: Agent,
    handler: Option<SharedHandler>,
}

/// Status and metrics snapshot returned by [`AgentRegistry::status_of`]
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatusReport {
    pub status: AgentStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub metrics: Metrics,
}

/// Clone-friendly handle to the shared agent table
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: Arc<RwLock<HashMap<String, AgentEntry>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or re-register) an agent. Re-registering overwrites the
    /// previous entry, runtime state included.
    pub async fn register(
        &self,
        name: &str,
        capabilities: Vec<String>,
        dependencies: Vec<String>,
        handler: Option<SharedHandler>,
    ) {
        let agent = Agent::new(name, capabilities, dependencies);
        info!(
            agent = name,
            capabilities = ?agent.capabilities,
            dependencies = ?agent.dependencies,
            has_handler = handler.is_some(),
            "registering agent"
        );

        let previous = self
            .agents
            .write()
            .await
            .insert(name.to_string(), AgentEntry { agent, handler });
        if previous.is_some() {
            debug!(agent = name, "replaced existing registry entry");
        }
    }

    /// Remove an agent. Returns false if it was not registered.
    pub async fn unregister(&self, name: &str) -> bool {
        let removed = self.agents.write().await.remove(name).is_some();
        if removed {
            info!(agent = name, "unregistered agent");
        }
        removed
    }

    /// Current status and metrics of an agent
    pub async fn status_of(&self, name: &str) -> Result<AgentStatusReport> {
        let agents = self.agents.read().await;
        let entry = agents
            .get(name)
            .ok_or_else(|| ConductorError::AgentNotFound(name.to_string()))?;

        Ok(AgentStatusReport {
            status: entry.agent.status,
            last_heartbeat: entry.agent.last_heartbeat,
            metrics: entry.agent.metrics.clone(),
        })
    }

    pub async fn get(&self, name: &str) -> Option<Agent> {
        self.agents.read().await.get(name).map(|e| e.agent.clone())
    }

    /// Copy of every agent, keyed by name
    pub async fn snapshot(&self) -> HashMap<String, Agent> {
        self.agents
            .read()
            .await
            .iter()
            .map(|(name, entry)| (name.clone(), entry.agent.clone()))
            .collect()
    }

    pub async fn handler(&self, name: &str) -> Option<SharedHandler> {
        self.agents
            .read()
            .await
            .get(name)
            .and_then(|e| e.handler.clone())
    }

    pub async fn has_handler(&self, name: &str) -> bool {
        self.handler(name).await.is_some()
    }

    /// All registered handlers, keyed by agent name
    pub async fn handlers(&self) -> Vec<(String, SharedHandler)> {
        self.agents
            .read()
            .await
            .iter()
            .filter_map(|(name, e)| e.handler.clone().map(|h| (name.clone(), h)))
            .collect()
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agents.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn len(&self) -> usize {
        self.agents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.agents.read().await.is_empty()
    }

    // ==================== Mutations (router / health monitor) ====================

    /// Apply a heartbeat: keep the latest timestamp seen, force RUNNING and
    /// merge reported metrics. Unknown agents are ignored.
    pub(crate) async fn record_heartbeat(
        &self,
        name: &str,
        at: DateTime<Utc>,
        metrics: &Metrics,
    ) -> bool {
        let mut agents = self.agents.write().await;
        let Some(entry) = agents.get_mut(name) else {
            debug!(agent = name, "heartbeat from unregistered agent ignored");
            return false;
        };

        let agent = &mut entry.agent;
        agent.last_heartbeat = Some(agent.last_heartbeat.map_or(at, |prev| prev.max(at)));

        let previous = agent.status;
        agent.status = previous.apply(StatusEvent::Heartbeat);
        if previous != agent.status {
            info!(agent = name, from = %previous, to = %agent.status, "agent status changed");
        }

        agent
            .metrics
            .extend(metrics.iter().map(|(k, v)| (k.clone(), *v)));
        true
    }

    /// Apply a status event and return the new status
    pub(crate) async fn apply_status(
        &self,
        name: &str,
        event: StatusEvent,
    ) -> Option<AgentStatus> {
        let mut agents = self.agents.write().await;
        let entry = agents.get_mut(name)?;
        let previous = entry.agent.status;
        entry.agent.status = previous.apply(event);
        if previous != entry.agent.status {
            info!(agent = name, from = %previous, to = %entry.agent.status, "agent status changed");
        }
        Some(entry.agent.status)
    }

    pub(crate) async fn merge_metrics(&self, name: &str, metrics: &Metrics) -> bool {
        let mut agents = self.agents.write().await;
        match agents.get_mut(name) {
            Some(entry) => {
                entry
                    .agent
                    .metrics
                    .extend(metrics.iter().map(|(k, v)| (k.clone(), *v)));
                true
            }
            None => false,
        }
    }

    /// Count a handler failure against an agent
    pub(crate) async fn record_error(&self, name: &str, error: &str) -> bool {
        let mut agents = self.agents.write().await;
        match agents.get_mut(name) {
            Some(entry) => {
                entry.agent.error_count += 1;
                entry.agent.last_error = Some(error.to_string());
                true
            }
            None => false,
        }
    }

    /// Mark every agent whose last heartbeat is older than `threshold` as
    /// TIMEOUT. An agent that never sent a heartbeat is measured from its
    /// registration time. Returns the names that changed on this call.
    pub(crate) async fn mark_timed_out(
        &self,
        now: DateTime<Utc>,
        threshold: ChronoDuration,
    ) -> Vec<String> {
        let mut agents = self.agents.write().await;
        let mut timed_out = Vec::new();

        for (name, entry) in agents.iter_mut() {
            let agent = &mut entry.agent;
            if agent.status == AgentStatus::Timeout {
                continue;
            }
            let last_hb = agent.last_heartbeat.unwrap_or(agent.registered_at);
            if now.signed_duration_since(last_hb) > threshold {
                agent.status = agent.status.apply(StatusEvent::HeartbeatTimeout);
                warn!(
                    agent = %name,
                    last_heartbeat = %last_hb,
                    "agent missed heartbeats, marked TIMEOUT"
                );
                timed_out.push(name.clone());
            }
        }

        timed_out.sort();
        timed_out
    }
}
