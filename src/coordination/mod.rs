//! Coordination primitives shared by the engine's loops
//!
//! - Circuit breaker isolating the downstream automation service
//! - Breaker-guarded automation publisher
//! - Shutdown signalling

pub mod automation;
pub mod circuit_breaker;
pub mod shutdown;

pub use automation::{AutomationEvent, AutomationPublisher, AutomationSink, PublishOutcome};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use shutdown::ShutdownController;
