use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::coordinator::OrchestratorConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    /// Engine settings (router, health monitor, workflows, rules, breaker, alerts)
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Directory for daily rolling log files (console only when unset)
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            log_dir: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default values
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("CONDUCTOR_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (CONDUCTOR_ORCHESTRATOR__HEALTH__TIMEOUT_THRESHOLD_SECS, etc.)
            .add_source(
                Environment::with_prefix("CONDUCTOR")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::QueueOrdering;
    use std::fs;

    #[test]
    fn test_load_from_missing_dir_uses_defaults() {
        let config = AppConfig::load_from("/nonexistent/conductor/config").unwrap();

        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
        assert_eq!(config.orchestrator.health.timeout_threshold_secs, 300);
        assert_eq!(config.orchestrator.health.heartbeat_interval_secs, 30);
        assert_eq!(config.orchestrator.breaker.failure_threshold, 3);
        assert!(!config.orchestrator.workflow.require_ack);
    }

    #[test]
    fn test_load_from_toml_overrides_sections() {
        let dir = std::env::temp_dir().join(format!("conductor-config-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("default.toml"),
            r#"
[logging]
level = "debug"

[orchestrator.router]
ordering = "priority"
worker_pool_size = 2

[orchestrator.workflow]
require_ack = true
ack_timeout_secs = 10
"#,
        )
        .unwrap();

        let config = AppConfig::load_from(&dir).unwrap();
        fs::remove_dir_all(&dir).ok();

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.orchestrator.router.ordering, QueueOrdering::Priority);
        assert_eq!(config.orchestrator.router.worker_pool_size, 2);
        // Untouched keys keep their defaults
        assert_eq!(config.orchestrator.router.poll_timeout_ms, 1000);
        assert!(config.orchestrator.workflow.require_ack);
        assert_eq!(config.orchestrator.workflow.ack_timeout_secs, 10);
        assert_eq!(config.orchestrator.workflow.tick_interval_ms, 5000);
    }
}
