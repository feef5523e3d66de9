//! Dependency-gated workflows
//!
//! A workflow is an ordered list of steps; each step becomes a COMMAND to one
//! agent once its dependencies hold.

pub mod definition;
pub mod manager;

pub use definition::{
    Condition, PendingAck, StepDependency, ThresholdOperator, WorkflowDefinition, WorkflowState,
    WorkflowStatus, WorkflowStep,
};
pub use manager::{TickReport, WorkflowConfig, WorkflowManager, WORKFLOW_AGENT};
