//! Agent and message types shared by every engine component

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::str::FromStr;
use uuid::Uuid;

/// Recipient/sender name used for messages originating inside the engine
pub const SYSTEM_AGENT: &str = "system";

/// Opaque message payload (schema owned by sender and recipient)
pub type Payload = Map<String, Value>;

/// Flat metric map reported by agents (last-reported-wins)
pub type Metrics = HashMap<String, f64>;

/// Agent lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Idle,
    Running,
    Completed,
    Error,
    Timeout,
    Disabled,
}

/// Inputs to the status transition function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEvent {
    /// Liveness signal from the agent itself
    Heartbeat,
    /// Status reported through a STATUS_UPDATE message
    Reported(AgentStatus),
    /// Health monitor detected missed heartbeats
    HeartbeatTimeout,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Idle => "IDLE",
            AgentStatus::Running => "RUNNING",
            AgentStatus::Completed => "COMPLETED",
            AgentStatus::Error => "ERROR",
            AgentStatus::Timeout => "TIMEOUT",
            AgentStatus::Disabled => "DISABLED",
        }
    }

    /// Apply a status event.
    ///
    /// Transitions are permissive: a heartbeat revives an agent from any state
    /// (ERROR and DISABLED included) and reported statuses are taken as-is.
    pub fn apply(self, event: StatusEvent) -> AgentStatus {
        match event {
            StatusEvent::Heartbeat => AgentStatus::Running,
            StatusEvent::Reported(status) => status,
            StatusEvent::HeartbeatTimeout => AgentStatus::Timeout,
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AgentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "IDLE" => Ok(AgentStatus::Idle),
            "RUNNING" => Ok(AgentStatus::Running),
            "COMPLETED" => Ok(AgentStatus::Completed),
            "ERROR" => Ok(AgentStatus::Error),
            "TIMEOUT" => Ok(AgentStatus::Timeout),
            "DISABLED" => Ok(AgentStatus::Disabled),
            other => Err(format!("unknown agent status: {other}")),
        }
    }
}

/// Message types understood by the router
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Command,
    Response,
    Error,
    Heartbeat,
    StatusUpdate,
    Data,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Command => "COMMAND",
            MessageType::Response => "RESPONSE",
            MessageType::Error => "ERROR",
            MessageType::Heartbeat => "HEARTBEAT",
            MessageType::StatusUpdate => "STATUS_UPDATE",
            MessageType::Data => "DATA",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Unit of inter-agent communication
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub sender: String,
    pub recipient: String,
    #[serde(default)]
    pub payload: Payload,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// Higher = more urgent. Only honoured by a priority-ordered queue.
    #[serde(default)]
    pub priority: i32,
}

impl Message {
    pub fn new(
        message_type: MessageType,
        sender: impl Into<String>,
        recipient: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message_type,
            sender: sender.into(),
            recipient: recipient.into(),
            payload,
            timestamp: Utc::now(),
            correlation_id: None,
            priority: 0,
        }
    }

    /// COMMAND carrying `{action, parameters}`
    pub fn command(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        action: &str,
        parameters: Payload,
    ) -> Self {
        let mut payload = Payload::new();
        payload.insert("action".into(), Value::String(action.to_string()));
        payload.insert("parameters".into(), Value::Object(parameters));
        Self::new(MessageType::Command, sender, recipient, payload)
    }

    /// HEARTBEAT from `agent` reporting `metrics`
    pub fn heartbeat(agent: impl Into<String>, metrics: &Metrics) -> Self {
        let mut payload = Payload::new();
        payload.insert("metrics".into(), json!(metrics));
        Self::new(MessageType::Heartbeat, agent, SYSTEM_AGENT, payload)
    }

    /// STATUS_UPDATE from `agent`
    pub fn status_update(agent: impl Into<String>, status: AgentStatus) -> Self {
        let mut payload = Payload::new();
        payload.insert("status".into(), Value::String(status.as_str().to_string()));
        Self::new(MessageType::StatusUpdate, agent, SYSTEM_AGENT, payload)
    }

    /// RESPONSE to this message, correlated with it
    pub fn reply(&self, payload: Payload) -> Self {
        let correlation = self.correlation_id.clone().unwrap_or_else(|| self.id.clone());
        Self::new(MessageType::Response, self.recipient.clone(), self.sender.clone(), payload)
            .with_correlation_id(correlation)
    }

    /// ERROR sent back to this message's sender
    pub fn error_reply(&self, error: &str) -> Self {
        let mut payload = Payload::new();
        payload.insert("original_message_id".into(), Value::String(self.id.clone()));
        payload.insert("error".into(), Value::String(error.to_string()));
        let mut reply = Self::new(
            MessageType::Error,
            self.recipient.clone(),
            self.sender.clone(),
            payload,
        );
        reply.correlation_id = self.correlation_id.clone();
        reply
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// `payload.action` for COMMAND messages
    pub fn action(&self) -> Option<&str> {
        self.payload.get("action").and_then(Value::as_str)
    }

    /// Numeric entries of `payload.metrics`; non-numeric values are skipped
    pub fn metrics(&self) -> Metrics {
        self.payload
            .get("metrics")
            .and_then(Value::as_object)
            .map(|obj| {
                obj.iter()
                    .filter_map(|(k, v)| v.as_f64().map(|n| (k.clone(), n)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// `payload.status` parsed as an agent status
    pub fn reported_status(&self) -> Option<AgentStatus> {
        self.payload
            .get("status")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
    }
}

/// Registry view of one agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub name: String,
    pub status: AgentStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub dependencies: Vec<String>,
    pub capabilities: Vec<String>,
    pub error_count: u64,
    pub last_error: Option<String>,
    pub metrics: Metrics,
    pub registered_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(name: &str, capabilities: Vec<String>, dependencies: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            status: AgentStatus::Idle,
            last_heartbeat: None,
            dependencies: dedup_ordered(dependencies),
            capabilities: dedup_ordered(capabilities),
            error_count: 0,
            last_error: None,
            metrics: Metrics::new(),
            registered_at: Utc::now(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == AgentStatus::Running
    }
}

fn dedup_ordered(items: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    items.into_iter().filter(|i| seen.insert(i.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_revives_any_status() {
        for status in [
            AgentStatus::Idle,
            AgentStatus::Error,
            AgentStatus::Timeout,
            AgentStatus::Disabled,
            AgentStatus::Completed,
        ] {
            assert_eq!(status.apply(StatusEvent::Heartbeat), AgentStatus::Running);
        }
        assert_eq!(
            AgentStatus::Running.apply(StatusEvent::HeartbeatTimeout),
            AgentStatus::Timeout
        );
    }

    #[test]
    fn test_message_json_shape() {
        let msg = Message::command("scanner", "analyst", "analyze", Payload::new())
            .with_id("m-1")
            .with_priority(5);
        let value = serde_json::to_value(&msg).unwrap();

        assert_eq!(value["type"], "COMMAND");
        assert_eq!(value["id"], "m-1");
        assert_eq!(value["payload"]["action"], "analyze");
        assert_eq!(value["priority"], 5);
    }

    #[test]
    fn test_metrics_skip_non_numeric() {
        let mut msg = Message::new(MessageType::Heartbeat, "risk", SYSTEM_AGENT, Payload::new());
        msg.payload.insert(
            "metrics".into(),
            json!({"exposure": 12.5, "open_positions": 3, "mode": "paper"}),
        );

        let metrics = msg.metrics();
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics["exposure"], 12.5);
        assert_eq!(metrics["open_positions"], 3.0);
    }

    #[test]
    fn test_error_reply_keeps_correlation() {
        let cmd = Message::command("workflow_manager", "trader", "buy", Payload::new())
            .with_correlation_id("corr-9");
        let err = cmd.error_reply("boom");

        assert_eq!(err.message_type, MessageType::Error);
        assert_eq!(err.recipient, "workflow_manager");
        assert_eq!(err.correlation_id.as_deref(), Some("corr-9"));
        assert_eq!(err.payload["original_message_id"], json!(cmd.id));
        assert_eq!(err.payload["error"], "boom");
    }

    #[test]
    fn test_status_parse_is_case_insensitive() {
        assert_eq!("running".parse::<AgentStatus>(), Ok(AgentStatus::Running));
        assert!("sleeping".parse::<AgentStatus>().is_err());
    }

    #[test]
    fn test_agent_dedups_dependencies_in_order() {
        let agent = Agent::new(
            "trader",
            vec![],
            vec!["risk".into(), "scanner".into(), "risk".into()],
        );
        assert_eq!(agent.dependencies, vec!["risk", "scanner"]);
        assert_eq!(agent.status, AgentStatus::Idle);
    }
}
