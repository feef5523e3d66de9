//! Supervisor Layer for agent monitoring and operator alerts
//!
//! - Health monitor for heartbeat timeouts and restart commands
//! - Alert manager for rate-limited operator alerts

pub mod alert_manager;
pub mod health_monitor;

pub use alert_manager::{Alert, AlertLevel, AlertManager, AlertManagerConfig};
pub use health_monitor::{HealthCheckReport, HealthConfig, HealthEvent, HealthMonitor};
