//! Health Monitor
//!
//! Periodically scans the agent registry for missed heartbeats. An agent whose
//! last heartbeat is older than the timeout threshold is marked TIMEOUT and,
//! when it has a handler, sent a `restart` command. The next heartbeat is the
//! only confirmation that the restart worked; an agent still in TIMEOUT after
//! the retry interval gets another command, up to a bounded number of attempts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

use crate::coordination::{AutomationEvent, AutomationPublisher, ShutdownController};
use crate::error::{ConductorError, Result};
use crate::platform::{AgentRegistry, AgentStatus, Message, MessageRouter, Payload, SYSTEM_AGENT};
use crate::supervisor::AlertManager;

/// Configuration for the health monitor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Interval between health checks (default: 30s)
    pub heartbeat_interval_secs: u64,
    /// Heartbeat age before an agent is marked TIMEOUT (default: 300s)
    pub timeout_threshold_secs: u64,
    /// Pause after a failed check before retrying (default: 5s)
    pub error_retry_delay_secs: u64,
    /// Time an agent may stay in TIMEOUT before the next restart command (default: 60s)
    pub restart_retry_secs: u64,
    /// Restart commands sent before escalating (default: 3)
    pub max_restart_attempts: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            timeout_threshold_secs: 300,
            error_retry_delay_secs: 5,
            restart_retry_secs: 60,
            max_restart_attempts: 3,
        }
    }
}

impl HealthConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn timeout_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.timeout_threshold_secs as i64)
    }

    pub fn error_retry_delay(&self) -> Duration {
        Duration::from_secs(self.error_retry_delay_secs)
    }

    pub fn restart_retry(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.restart_retry_secs as i64)
    }
}

/// Event emitted by the health monitor
#[derive(Debug, Clone, PartialEq)]
pub enum HealthEvent {
    AgentTimedOut {
        agent: String,
        last_heartbeat: Option<DateTime<Utc>>,
    },
    RestartRequested {
        agent: String,
        attempt: u32,
    },
    /// Agent stayed in TIMEOUT through every restart attempt
    RestartExhausted {
        agent: String,
        attempts: u32,
    },
}

/// Outcome of one health check
#[derive(Debug, Clone, Default)]
pub struct HealthCheckReport {
    pub timed_out: Vec<String>,
    pub restarts_sent: Vec<String>,
    pub exhausted: Vec<String>,
}

#[derive(Debug)]
struct RestartTracker {
    attempts: u32,
    last_attempt: DateTime<Utc>,
    exhausted: bool,
}

/// Heartbeat-based health monitor
#[derive(Clone)]
pub struct HealthMonitor {
    config: HealthConfig,
    registry: AgentRegistry,
    router: MessageRouter,
    alerts: Option<AlertManager>,
    publisher: Option<AutomationPublisher>,
    restarts: Arc<RwLock<HashMap<String, RestartTracker>>>,
    event_tx: broadcast::Sender<HealthEvent>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, router: MessageRouter) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            config,
            registry: router.registry().clone(),
            router,
            alerts: None,
            publisher: None,
            restarts: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
        }
    }

    pub fn with_alerts(mut self, alerts: AlertManager) -> Self {
        self.alerts = Some(alerts);
        self
    }

    pub fn with_publisher(mut self, publisher: AutomationPublisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.event_tx.subscribe()
    }

    /// Restart commands sent to `agent` since it entered TIMEOUT
    pub async fn restart_attempts(&self, agent: &str) -> u32 {
        self.restarts
            .read()
            .await
            .get(agent)
            .map_or(0, |t| t.attempts)
    }

    /// Run one health check as of `now`.
    ///
    /// Fails only when a restart command could not be enqueued; every other
    /// agent in the same pass is still processed.
    pub async fn check(&self, now: DateTime<Utc>) -> Result<HealthCheckReport> {
        let mut report = HealthCheckReport::default();
        let mut send_failed = false;

        if !self.escalate(now, &mut report).await {
            send_failed = true;
        }

        let timed_out = self
            .registry
            .mark_timed_out(now, self.config.timeout_threshold())
            .await;

        for name in timed_out {
            let last_heartbeat = self.registry.get(&name).await.and_then(|a| a.last_heartbeat);
            let _ = self.event_tx.send(HealthEvent::AgentTimedOut {
                agent: name.clone(),
                last_heartbeat,
            });
            if let Some(alerts) = &self.alerts {
                alerts.agent_timed_out(&name, last_heartbeat).await;
            }
            self.report(&name, "missed heartbeats", now);

            if self.registry.has_handler(&name).await {
                if self.send_restart(&name, 1).await {
                    self.restarts.write().await.insert(
                        name.clone(),
                        RestartTracker {
                            attempts: 1,
                            last_attempt: now,
                            exhausted: false,
                        },
                    );
                    report.restarts_sent.push(name.clone());
                } else {
                    send_failed = true;
                }
            } else {
                debug!(agent = %name, "no handler registered, restart not requested");
            }

            report.timed_out.push(name);
        }

        if send_failed {
            return Err(ConductorError::QueueClosed);
        }
        Ok(report)
    }

    /// Re-send restarts to agents still in TIMEOUT and forget agents that
    /// recovered. Returns false if a restart could not be enqueued.
    async fn escalate(&self, now: DateTime<Utc>, report: &mut HealthCheckReport) -> bool {
        let agents = self.registry.snapshot().await;
        let retry = self.config.restart_retry();
        let max_attempts = self.config.max_restart_attempts;
        let mut ok = true;

        let mut due: Vec<(String, u32)> = Vec::new();
        let mut exhausted: Vec<(String, u32)> = Vec::new();
        {
            let mut restarts = self.restarts.write().await;
            restarts.retain(|name, _| {
                let still_down = agents
                    .get(name)
                    .is_some_and(|a| a.status == AgentStatus::Timeout);
                if !still_down {
                    info!(agent = %name, "agent recovered after restart");
                }
                still_down
            });

            for (name, tracker) in restarts.iter_mut() {
                if tracker.exhausted || now.signed_duration_since(tracker.last_attempt) < retry {
                    continue;
                }
                if tracker.attempts < max_attempts {
                    tracker.attempts += 1;
                    tracker.last_attempt = now;
                    due.push((name.clone(), tracker.attempts));
                } else {
                    tracker.exhausted = true;
                    exhausted.push((name.clone(), tracker.attempts));
                }
            }
        }

        for (name, attempt) in due {
            if self.send_restart(&name, attempt).await {
                report.restarts_sent.push(name);
            } else {
                ok = false;
            }
        }

        for (name, attempts) in exhausted {
            error!(agent = %name, attempts, "agent did not recover, giving up on restarts");
            let _ = self.event_tx.send(HealthEvent::RestartExhausted {
                agent: name.clone(),
                attempts,
            });
            if let Some(alerts) = &self.alerts {
                alerts.restart_exhausted(&name, attempts).await;
            }
            self.report(&name, "restart attempts exhausted", now);
            report.exhausted.push(name);
        }

        ok
    }

    async fn send_restart(&self, agent: &str, attempt: u32) -> bool {
        let mut parameters = Payload::new();
        parameters.insert("reason".into(), Value::String("heartbeat_timeout".into()));
        parameters.insert("attempt".into(), Value::from(attempt));

        let command = Message::command(SYSTEM_AGENT, agent, "restart", parameters);
        if !self.router.send(command).await {
            warn!(agent, "queue closed, restart command not sent");
            return false;
        }

        info!(agent, attempt, "restart command sent");
        let _ = self.event_tx.send(HealthEvent::RestartRequested {
            agent: agent.to_string(),
            attempt,
        });
        true
    }

    fn report(&self, agent: &str, detail: &str, now: DateTime<Utc>) {
        if let Some(publisher) = &self.publisher {
            publisher.publish_detached(AutomationEvent::HealthReport {
                agent: agent.to_string(),
                status: AgentStatus::Timeout,
                detail: detail.to_string(),
                timestamp: now,
            });
        }
    }

    /// Monitoring loop; runs until shutdown
    pub async fn run(self, shutdown: ShutdownController) {
        let mut shutdown_rx = shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            interval_secs = self.config.heartbeat_interval_secs,
            timeout_secs = self.config.timeout_threshold_secs,
            "health monitor started"
        );

        while shutdown.is_running() {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => {}
            }

            match self.check(Utc::now()).await {
                Ok(report) if !report.timed_out.is_empty() => {
                    debug!(timed_out = ?report.timed_out, "health check complete");
                }
                Ok(_) => {}
                Err(e) => {
                    error!("health check failed: {}", e);
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = tokio::time::sleep(self.config.error_retry_delay()) => {}
                    }
                }
            }
        }

        info!("health monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{handler_fn, Metrics, MessageType, RouterConfig};
    use chrono::Duration as ChronoDuration;

    async fn monitor_with_agent(name: &str) -> (HealthMonitor, MessageRouter) {
        let router = MessageRouter::new(RouterConfig::default(), AgentRegistry::new());
        router
            .registry()
            .register(name, vec![], vec![], Some(handler_fn(|_| async { Ok(()) })))
            .await;
        let monitor = HealthMonitor::new(HealthConfig::default(), router.clone());
        (monitor, router)
    }

    async fn drain(router: &MessageRouter) -> Vec<Message> {
        let mut out = Vec::new();
        while let Some(m) = router.recv(std::time::Duration::from_millis(5)).await {
            out.push(m);
        }
        out
    }

    #[tokio::test]
    async fn test_timeout_marks_agent_and_sends_one_restart() {
        let (monitor, router) = monitor_with_agent("scanner").await;
        let mut events = monitor.subscribe();

        let now = Utc::now();
        router
            .registry()
            .record_heartbeat("scanner", now - ChronoDuration::seconds(301), &Metrics::new())
            .await;

        let report = monitor.check(now).await.unwrap();
        assert_eq!(report.timed_out, vec!["scanner"]);
        assert_eq!(
            router.registry().status_of("scanner").await.unwrap().status,
            AgentStatus::Timeout
        );

        let sent = drain(&router).await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].message_type, MessageType::Command);
        assert_eq!(sent[0].recipient, "scanner");
        assert_eq!(sent[0].action(), Some("restart"));

        // Second tick without a heartbeat does not repeat the command
        let report = monitor.check(now + ChronoDuration::seconds(30)).await.unwrap();
        assert!(report.timed_out.is_empty());
        assert!(drain(&router).await.is_empty());

        assert!(matches!(events.recv().await.unwrap(), HealthEvent::AgentTimedOut { .. }));
        assert_eq!(
            events.recv().await.unwrap(),
            HealthEvent::RestartRequested {
                agent: "scanner".into(),
                attempt: 1
            }
        );
    }

    #[tokio::test]
    async fn test_agent_silent_since_registration_is_restarted() {
        let (monitor, router) = monitor_with_agent("dead_on_arrival").await;
        let registered_at = router
            .registry()
            .get("dead_on_arrival")
            .await
            .unwrap()
            .registered_at;

        let report = monitor
            .check(registered_at + ChronoDuration::seconds(301))
            .await
            .unwrap();
        assert_eq!(report.timed_out, vec!["dead_on_arrival"]);
        assert_eq!(report.restarts_sent, vec!["dead_on_arrival"]);

        let agent = router.registry().get("dead_on_arrival").await.unwrap();
        assert_eq!(agent.status, AgentStatus::Timeout);
        assert!(agent.last_heartbeat.is_none());

        let sent = drain(&router).await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].action(), Some("restart"));
    }

    #[tokio::test]
    async fn test_agent_without_handler_not_restarted() {
        let router = MessageRouter::new(RouterConfig::default(), AgentRegistry::new());
        router.registry().register("passive", vec![], vec![], None).await;
        let monitor = HealthMonitor::new(HealthConfig::default(), router.clone());

        let now = Utc::now();
        router
            .registry()
            .record_heartbeat("passive", now - ChronoDuration::seconds(600), &Metrics::new())
            .await;

        let report = monitor.check(now).await.unwrap();
        assert_eq!(report.timed_out, vec!["passive"]);
        assert!(report.restarts_sent.is_empty());
        assert!(drain(&router).await.is_empty());
    }

    #[tokio::test]
    async fn test_restart_escalation_is_bounded() {
        let (monitor, router) = monitor_with_agent("trader").await;
        let now = Utc::now();
        router
            .registry()
            .record_heartbeat("trader", now - ChronoDuration::seconds(400), &Metrics::new())
            .await;

        monitor.check(now).await.unwrap();
        let mut at = now;
        for expected in 2..=3 {
            at += ChronoDuration::seconds(61);
            let report = monitor.check(at).await.unwrap();
            assert_eq!(report.restarts_sent, vec!["trader"]);
            assert_eq!(monitor.restart_attempts("trader").await, expected);
        }

        at += ChronoDuration::seconds(61);
        let report = monitor.check(at).await.unwrap();
        assert!(report.restarts_sent.is_empty());
        assert_eq!(report.exhausted, vec!["trader"]);

        // Escalation happens once
        at += ChronoDuration::seconds(61);
        let report = monitor.check(at).await.unwrap();
        assert!(report.exhausted.is_empty());
        assert_eq!(drain(&router).await.len(), 3);
    }

    #[tokio::test]
    async fn test_recovery_resets_restart_tracking() {
        let (monitor, router) = monitor_with_agent("risk").await;
        let now = Utc::now();
        router
            .registry()
            .record_heartbeat("risk", now - ChronoDuration::seconds(400), &Metrics::new())
            .await;
        monitor.check(now).await.unwrap();
        assert_eq!(monitor.restart_attempts("risk").await, 1);

        router
            .registry()
            .record_heartbeat("risk", now, &Metrics::new())
            .await;
        monitor.check(now + ChronoDuration::seconds(61)).await.unwrap();
        assert_eq!(monitor.restart_attempts("risk").await, 0);
    }

    #[tokio::test]
    async fn test_closed_queue_reports_error() {
        let (monitor, router) = monitor_with_agent("scanner").await;
        let now = Utc::now();
        router
            .registry()
            .record_heartbeat("scanner", now - ChronoDuration::seconds(400), &Metrics::new())
            .await;
        router.close().await;

        let err = monitor.check(now).await.unwrap_err();
        assert!(matches!(err, ConductorError::QueueClosed));
        // The status change still happened
        assert_eq!(
            router.registry().status_of("scanner").await.unwrap().status,
            AgentStatus::Timeout
        );
    }
}
