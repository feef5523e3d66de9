//! Orchestrator facade
//!
//! Wires the registry, router, health monitor, workflow manager and decision
//! engine together and exposes the engine's external interface.

pub mod config;
pub mod orchestrator;
pub mod state;

pub use config::OrchestratorConfig;
pub use orchestrator::Orchestrator;
pub use state::{AgentSnapshot, OrchestratorStatus, SystemMetrics, SystemStatus};
