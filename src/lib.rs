pub mod config;
pub mod coordination;
pub mod coordinator;
pub mod error;
pub mod logging;
pub mod platform;
pub mod rules;
pub mod supervisor;
pub mod workflow;

pub use config::{AppConfig, LoggingConfig};
pub use coordination::{
    AutomationEvent, AutomationPublisher, AutomationSink, CircuitBreaker, CircuitBreakerConfig,
    CircuitState, PublishOutcome, ShutdownController,
};
pub use coordinator::{Orchestrator, OrchestratorConfig, OrchestratorStatus, SystemStatus};
pub use error::{ConductorError, Result};
pub use logging::init_logging;
pub use platform::{
    handler_fn, Agent, AgentRegistry, AgentStatus, Message, MessageHandler, MessageRouter,
    MessageType, Metrics, Payload, SharedHandler,
};
pub use rules::{DecisionEngine, DecisionRule, MetricsSource, RegistryMetrics};
pub use supervisor::{AlertLevel, AlertManager, HealthMonitor};
pub use workflow::{
    Condition, StepDependency, ThresholdOperator, WorkflowDefinition, WorkflowManager,
    WorkflowState, WorkflowStatus, WorkflowStep,
};
