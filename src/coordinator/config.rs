//! Orchestrator Configuration

use serde::{Deserialize, Serialize};

use crate::coordination::CircuitBreakerConfig;
use crate::platform::RouterConfig;
use crate::rules::RulesConfig;
use crate::supervisor::{AlertManagerConfig, HealthConfig};
use crate::workflow::WorkflowConfig;

/// Configuration for every engine component
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub router: RouterConfig,
    pub health: HealthConfig,
    pub workflow: WorkflowConfig,
    pub rules: RulesConfig,
    /// Breaker guarding the automation service
    pub breaker: CircuitBreakerConfig,
    pub alerts: AlertManagerConfig,
}
