//! Decision rules over live metrics

pub mod engine;
pub mod metrics;

pub use engine::{DecisionEngine, DecisionRule, RuleCondition, RulesConfig, DECISION_AGENT};
pub use metrics::{MetricsSource, RegistryMetrics};
