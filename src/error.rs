use std::time::Duration;

use thiserror::Error;

/// Main error type for the orchestration engine
#[derive(Error, Debug)]
pub enum ConductorError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Registry errors
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    // Messaging errors
    #[error("Message queue closed")]
    QueueClosed,

    #[error("Handler failed: {0}")]
    Handler(String),

    // Workflow errors
    #[error("Invalid workflow definition: {0}")]
    InvalidWorkflow(String),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    // Fault isolation
    #[error("Circuit breaker open: {0}")]
    CircuitOpen(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl ConductorError {
    /// Whether the error means "skipped, try later" rather than a hard failure
    pub fn is_skipped(&self) -> bool {
        matches!(self, ConductorError::CircuitOpen(_))
    }
}

/// Result type alias for ConductorError
pub type Result<T> = std::result::Result<T, ConductorError>;
