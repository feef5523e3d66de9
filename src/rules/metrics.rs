//! Metrics snapshots consumed by the decision engine

use async_trait::async_trait;

use crate::error::Result;
use crate::platform::{AgentRegistry, AgentStatus, Metrics};

/// Supplies the metrics snapshot each evaluation runs against
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn snapshot(&self) -> Result<Metrics>;
}

/// Flattens the agent registry into one metrics map.
///
/// Aggregates are published under `agents.*`; each agent's own metrics appear
/// as `<agent>.<metric>`.
#[derive(Clone)]
pub struct RegistryMetrics {
    registry: AgentRegistry,
}

impl RegistryMetrics {
    pub fn new(registry: AgentRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl MetricsSource for RegistryMetrics {
    async fn snapshot(&self) -> Result<Metrics> {
        let agents = self.registry.snapshot().await;
        let count = |status: AgentStatus| agents.values().filter(|a| a.status == status).count() as f64;

        let mut metrics = Metrics::new();
        metrics.insert("agents.total".into(), agents.len() as f64);
        metrics.insert("agents.running".into(), count(AgentStatus::Running));
        metrics.insert("agents.error".into(), count(AgentStatus::Error));
        metrics.insert("agents.timeout".into(), count(AgentStatus::Timeout));
        metrics.insert(
            "agents.errors_total".into(),
            agents.values().map(|a| a.error_count as f64).sum(),
        );

        for (name, agent) in &agents {
            for (metric, value) in &agent.metrics {
                metrics.insert(format!("{name}.{metric}"), *value);
            }
        }

        Ok(metrics)
    }
}
