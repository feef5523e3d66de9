use std::sync::Arc;
use std::time::Duration;

use conductor::platform::RouterConfig;
use conductor::{
    handler_fn, AgentStatus, ConductorError, Message, MessageType, Metrics, Orchestrator,
    OrchestratorConfig, OrchestratorStatus, Payload, SharedHandler, WorkflowDefinition,
    WorkflowStatus, WorkflowStep,
};
use tokio::sync::Mutex;

fn fast_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.router = RouterConfig {
        poll_timeout_ms: 10,
        drain_timeout_ms: 500,
        ..Default::default()
    };
    config.workflow.tick_interval_ms = 10;
    config.rules.enabled = false;
    config
}

/// Handler recording the action of every COMMAND it receives
fn recording_agent(seen: Arc<Mutex<Vec<String>>>) -> SharedHandler {
    handler_fn(move |message: Message| {
        let seen = seen.clone();
        async move {
            if message.message_type == MessageType::Command {
                if let Some(action) = message.action() {
                    seen.lock().await.push(action.to_string());
                }
            }
            Ok(())
        }
    })
}

async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn workflow_runs_steps_in_dependency_order() {
    let orchestrator = Arc::new(Orchestrator::new(fast_config()));
    let seen_a = Arc::new(Mutex::new(Vec::new()));
    let seen_b = Arc::new(Mutex::new(Vec::new()));

    orchestrator
        .register_agent("A", vec!["fetch".into()], vec![], Some(recording_agent(seen_a.clone())))
        .await;
    orchestrator
        .register_agent("B", vec!["report".into()], vec!["A".into()], Some(recording_agent(seen_b.clone())))
        .await;

    let definition = WorkflowDefinition::new(
        "W",
        vec![
            WorkflowStep::new("s1", "A", "fetch"),
            WorkflowStep::new("s2", "B", "report").after_agent("A"),
        ],
        None,
    )
    .unwrap();

    orchestrator.start().await.unwrap();
    assert!(orchestrator.start_workflow("w-1", definition.clone()).await);
    // Duplicate ids are rejected while the first run is active
    assert!(!orchestrator.start_workflow("w-1", definition).await);

    wait_until(|| {
        let seen_a = seen_a.clone();
        async move { seen_a.lock().await.len() == 1 }
    })
    .await;

    // s2 waits for A to report in
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(seen_b.lock().await.is_empty());
    let state = orchestrator.workflow_state("w-1").await.unwrap();
    assert_eq!(state.status, WorkflowStatus::Running);
    assert_eq!(state.current_step, 1);

    assert!(
        orchestrator
            .send_message(Message::heartbeat("A", &Metrics::new()))
            .await
    );

    let orch = orchestrator.clone();
    wait_until(move || {
        let orch = orch.clone();
        async move {
            orch.workflow_state("w-1")
                .await
                .is_some_and(|s| s.status == WorkflowStatus::Completed)
        }
    })
    .await;

    assert_eq!(*seen_a.lock().await, vec!["fetch".to_string()]);
    assert_eq!(*seen_b.lock().await, vec!["report".to_string()]);

    let state = orchestrator.workflow_state("w-1").await.unwrap();
    assert_eq!(state.completed_steps, vec!["s1".to_string(), "s2".to_string()]);
    assert!(state.finished_at.is_some());

    let status = orchestrator.get_system_status().await;
    assert_eq!(status.orchestrator_status, OrchestratorStatus::Running);
    assert_eq!(status.active_workflows, 0);
    assert_eq!(status.agents["A"].status, AgentStatus::Running);
    assert_eq!(status.agents["B"].status, AgentStatus::Idle);

    orchestrator.stop().await;
    assert_eq!(orchestrator.status().await, OrchestratorStatus::Stopped);
    // Both agents were told to shut down
    assert_eq!(seen_a.lock().await.last().map(String::as_str), Some("shutdown"));
    assert_eq!(seen_b.lock().await.last().map(String::as_str), Some("shutdown"));
}

#[tokio::test]
async fn defined_workflow_can_be_started_by_name() {
    let orchestrator = Orchestrator::new(fast_config());
    orchestrator
        .define_workflow("nightly", vec![WorkflowStep::new("s1", "A", "fetch")], None)
        .await
        .unwrap();

    assert!(orchestrator.start_defined_workflow("n-1", "nightly").await.unwrap());
    assert!(matches!(
        orchestrator.start_defined_workflow("n-2", "missing").await,
        Err(ConductorError::WorkflowNotFound(_))
    ));
}

#[tokio::test]
async fn failing_error_subscriber_does_not_loop() {
    let orchestrator = Orchestrator::new(fast_config());

    // Fails every command it receives, producing one ERROR reply
    orchestrator
        .register_agent(
            "flaky",
            vec![],
            vec![],
            Some(handler_fn(|message: Message| async move {
                if message.message_type == MessageType::Command {
                    return Err(ConductorError::Handler("boom".into()));
                }
                Ok(())
            })),
        )
        .await;

    // ERROR subscriber that itself always fails
    let error_calls = Arc::new(Mutex::new(0usize));
    let calls = error_calls.clone();
    orchestrator
        .add_message_handler(
            MessageType::Error,
            handler_fn(move |_message: Message| {
                let calls = calls.clone();
                async move {
                    *calls.lock().await += 1;
                    Err(ConductorError::Handler("error handler down".into()))
                }
            }),
        )
        .await;

    orchestrator.start().await.unwrap();
    assert!(
        orchestrator
            .send_message(Message::command("caller", "flaky", "work", Payload::new()))
            .await
    );

    let calls = error_calls.clone();
    wait_until(move || {
        let calls = calls.clone();
        async move { *calls.lock().await >= 1 }
    })
    .await;

    // Let the router drain anything a loop would have produced
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(*error_calls.lock().await, 1);

    let status = orchestrator.get_system_status().await;
    assert_eq!(status.router.error_replies, 1);
    assert_eq!(status.router.handler_errors, 2);
    assert_eq!(status.message_queue_size, 0);

    orchestrator.stop().await;
}
