mod common;

use bytes::Bytes;
use common::{actions, collecting_funnel, config, count, credential, MockConnector};
use mq_hammer::agent::{Agent, AgentContext};
use mq_hammer::config::RunConfig;
use mq_hammer::event::{ActionType, AgentState, CompletenessReport, Event, EventKind, Outcome};
use mq_hammer::reference::{Messages, ReferenceSet};
use mq_hammer::scenario::{Action, ActionKind, Scenario};
use rumqttc::QoS;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn reference(entries: &[(&str, &str)]) -> Arc<ReferenceSet> {
    let messages: Messages = entries
        .iter()
        .map(|(topic, payload)| (topic.to_string(), Bytes::from(payload.to_string())))
        .collect();
    Arc::new(ReferenceSet::new(messages))
}

async fn run_agent(
    connector: MockConnector,
    scenario: &str,
    reference: Option<Arc<ReferenceSet>>,
    config: RunConfig,
    cancel: CancellationToken,
) -> (AgentState, Vec<Event>) {
    let scenario = Scenario::from_json(scenario).unwrap();
    run_scenario(connector, scenario, reference, config, cancel).await
}

async fn run_scenario(
    connector: MockConnector,
    scenario: Scenario,
    reference: Option<Arc<ReferenceSet>>,
    config: RunConfig,
    cancel: CancellationToken,
) -> (AgentState, Vec<Event>) {
    let (collector, events, funnel) = collecting_funnel();
    let ctx = AgentContext {
        config: Arc::new(config),
        connector: Arc::new(connector),
        scenario: Arc::new(scenario),
        reference,
        events,
    };

    let state = Agent::new(0, credential("agent-0"), ctx, cancel).run().await;
    funnel.await.unwrap();
    (state, collector.events())
}

fn cancel_after(delay: Duration) -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        trigger.cancel();
    });
    cancel
}

fn received(events: &[Event]) -> Vec<(String, usize)> {
    events
        .iter()
        .filter_map(|event| match &event.kind {
            EventKind::MessageReceived { topic, bytes } => Some((topic.clone(), *bytes)),
            _ => None,
        })
        .collect()
}

fn checks(events: &[Event]) -> Vec<CompletenessReport> {
    events
        .iter()
        .filter_map(|event| match &event.kind {
            EventKind::ReferenceChecked(report) => Some(report.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn publish_then_subscribe_reports_two_successes_in_order() {
    let scenario = r#"[
        {"t": 0.05, "action": "subscribe", "topic": "/x"},
        {"t": 0, "action": "publish", "topic": "/x", "payload": "hello"}
    ]"#;

    let started = Instant::now();
    let (state, events) = run_agent(
        MockConnector::new(),
        scenario,
        None,
        config(1),
        CancellationToken::new(),
    )
    .await;

    assert_eq!(state, AgentState::Completed);
    assert_eq!(
        actions(&events),
        vec![
            (ActionType::Publish, Outcome::Ok),
            (ActionType::Subscribe, Outcome::Ok),
        ]
    );
    assert!(started.elapsed() >= Duration::from_millis(50));

    assert!(matches!(events.first().unwrap().kind, EventKind::Connected { .. }));
    assert_eq!(
        events.last().unwrap().kind,
        EventKind::Finished {
            state: AgentState::Completed
        }
    );
    // no reference set, no completeness checks
    assert!(checks(&events).is_empty());
}

#[tokio::test(start_paused = true)]
async fn actions_are_rendered_for_the_agent() {
    let scenario = r#"[
        {"t": 0, "action": "subscribe", "topic": "/dev/{client_id}/#"},
        {"t": 0.1, "action": "publish", "topic": "/dev/{client_id}/n{ordinal}", "payload": "hi"}
    ]"#;

    let (state, events) = run_agent(
        MockConnector::new(),
        scenario,
        None,
        config(1),
        CancellationToken::new(),
    )
    .await;

    assert_eq!(state, AgentState::Completed);
    assert_eq!(received(&events), vec![("/dev/agent-0/n0".to_string(), 2)]);
}

#[tokio::test(start_paused = true)]
async fn echo_of_the_last_publish_is_received_before_finishing() {
    let scenario = r#"[
        {"t": 0, "action": "subscribe", "topic": "/echo"},
        {"t": 1, "action": "publish", "topic": "/echo", "payload": "ping", "qos": 1}
    ]"#;

    let (state, events) = run_agent(
        MockConnector::new(),
        scenario,
        None,
        config(1),
        CancellationToken::new(),
    )
    .await;

    assert_eq!(state, AgentState::Completed);
    let kinds: Vec<_> = events.iter().map(|event| &event.kind).collect();
    let n = kinds.len();
    assert!(matches!(
        kinds[n - 3],
        EventKind::ActionCompleted {
            action: ActionType::Publish,
            ..
        }
    ));
    assert_eq!(
        *kinds[n - 2],
        EventKind::MessageReceived {
            topic: "/echo".to_string(),
            bytes: 4
        }
    );
    assert_eq!(
        *kinds[n - 1],
        EventKind::Finished {
            state: AgentState::Completed
        }
    );
}

#[tokio::test(start_paused = true)]
async fn scheduled_actions_are_not_held_off_by_inbound_traffic() {
    let mut connector = MockConnector::new();
    for i in 0..500 {
        connector = connector.retain(&format!("/flood/{}", i), "x");
    }
    let scenario = r#"[
        {"t": 0, "action": "subscribe", "topic": "/flood/#"},
        {"t": 0, "action": "publish", "topic": "/tick", "payload": "t"}
    ]"#;

    let (state, events) = run_agent(connector, scenario, None, config(1), CancellationToken::new()).await;

    assert_eq!(state, AgentState::Completed);
    let publish = events
        .iter()
        .position(|event| {
            matches!(
                event.kind,
                EventKind::ActionCompleted {
                    action: ActionType::Publish,
                    ..
                }
            )
        })
        .unwrap();
    let first_message = events
        .iter()
        .position(|event| matches!(event.kind, EventKind::MessageReceived { .. }))
        .unwrap();
    assert!(publish < first_message);
    // the backlog is still accounted for once the timeline is done
    assert_eq!(received(&events).len(), 500);
}

#[tokio::test(start_paused = true)]
async fn unreachable_offset_waits_for_cancellation() {
    let scenario = Scenario::from_actions(vec![Action {
        offset: Duration::MAX,
        kind: ActionKind::Publish {
            topic: "/never".to_string(),
            payload: String::new(),
            qos: QoS::AtMostOnce,
            retain: false,
        },
    }]);

    let (state, events) = run_scenario(
        MockConnector::new(),
        scenario,
        None,
        config(1),
        cancel_after(Duration::from_secs(1)),
    )
    .await;

    assert_eq!(state, AgentState::Cancelled);
    assert!(actions(&events).is_empty());
    assert_eq!(
        events.last().unwrap().kind,
        EventKind::Finished {
            state: AgentState::Cancelled
        }
    );
}

#[tokio::test(start_paused = true)]
async fn unbounded_reference_timeout_waits_for_cancellation() {
    let connector = MockConnector::new().retain("/r/a", "A");
    let reference = reference(&[("/r/a", "A"), ("/r/b", "B")]);
    let scenario = r#"[{"t": 0, "action": "subscribe", "topic": "/r/#"}]"#;

    let mut config = config(1);
    config.reference_timeout = Duration::MAX;

    let (state, events) = run_agent(
        connector,
        scenario,
        Some(reference),
        config,
        cancel_after(Duration::from_secs(5)),
    )
    .await;

    assert_eq!(state, AgentState::Cancelled);
    let reports = checks(&events);
    assert_eq!(reports.len(), 1);
    assert_eq!((reports[0].expected, reports[0].received), (2, 1));
    assert!(reports[0].elapsed >= Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn complete_reference_data_is_reported() {
    let connector = MockConnector::new()
        .retain("/r/a", "A")
        .retain("/r/b", "B")
        .retain("/other", "O");
    let reference = reference(&[("/r/a", "A"), ("/r/b", "B"), ("/other", "O")]);
    let scenario = r#"[{"t": 0, "action": "subscribe", "topic": "/r/#"}]"#;

    let (state, events) = run_agent(
        connector,
        scenario,
        Some(reference),
        config(1),
        CancellationToken::new(),
    )
    .await;

    assert_eq!(state, AgentState::Completed);
    assert_eq!(
        count(&events, |kind| matches!(kind, EventKind::MessageReceived { .. })),
        2
    );

    let reports = checks(&events);
    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    assert_eq!(report.filter, "/r/#");
    assert!(report.is_complete());
    assert_eq!((report.expected, report.received, report.mismatched), (2, 2, 0));
}

#[tokio::test(start_paused = true)]
async fn missing_reference_data_times_out() {
    let connector = MockConnector::new()
        .retain("/r/a", "A")
        .retain("/r/b", "stale");
    let reference = reference(&[("/r/a", "A"), ("/r/b", "B"), ("/r/c", "C")]);
    let scenario = r#"[{"t": 0, "action": "subscribe", "topic": "/r/+"}]"#;

    let mut config = config(1);
    config.reference_timeout = Duration::from_secs(2);

    let started = Instant::now();
    let (state, events) = run_agent(
        connector,
        scenario,
        Some(reference),
        config,
        CancellationToken::new(),
    )
    .await;

    // the agent waits for the pending check before finishing
    assert_eq!(state, AgentState::Completed);
    assert!(started.elapsed() >= Duration::from_secs(2));

    let reports = checks(&events);
    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    assert!(!report.is_complete());
    assert_eq!(report.expected, 3);
    assert_eq!(report.received, 2);
    assert_eq!(report.mismatched, 1);
    assert_eq!(report.missing(), 1);
    assert!(report.elapsed >= Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn unsubscribe_closes_pending_check() {
    let connector = MockConnector::new().retain("/r/a", "A");
    let reference = reference(&[("/r/a", "A"), ("/r/b", "B")]);
    let scenario = r#"[
        {"t": 0, "action": "subscribe", "topic": "/r/#"},
        {"t": 1, "action": "unsubscribe", "topic": "/r/#"}
    ]"#;

    let (state, events) = run_agent(
        connector,
        scenario,
        Some(reference),
        config(1),
        CancellationToken::new(),
    )
    .await;

    assert_eq!(state, AgentState::Completed);
    let reports = checks(&events);
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].received, 1);
    assert!(reports[0].elapsed >= Duration::from_secs(1));
    assert!(reports[0].elapsed < Duration::from_secs(30));
}

#[tokio::test(start_paused = true)]
async fn filter_without_reference_topics_completes_immediately() {
    let reference = reference(&[("/r/a", "A")]);
    let scenario = r#"[{"t": 0, "action": "subscribe", "topic": "/nothing/#"}]"#;

    let (state, events) = run_agent(
        MockConnector::new(),
        scenario,
        Some(reference),
        config(1),
        CancellationToken::new(),
    )
    .await;

    assert_eq!(state, AgentState::Completed);
    let reports = checks(&events);
    assert_eq!(reports.len(), 1);
    assert_eq!((reports[0].expected, reports[0].received), (0, 0));
    assert_eq!(reports[0].elapsed, Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn rejected_action_does_not_stop_the_timeline() {
    let connector = MockConnector::new().reject_filter("/denied");
    let scenario = r#"[
        {"t": 0, "action": "subscribe", "topic": "/denied"},
        {"t": 1, "action": "publish", "topic": "/ok", "payload": "x", "qos": 1}
    ]"#;

    let (state, events) = run_agent(connector, scenario, None, config(1), CancellationToken::new()).await;

    assert_eq!(state, AgentState::Completed);
    let outcomes = actions(&events);
    assert_eq!(outcomes.len(), 2);
    assert!(matches!(outcomes[0], (ActionType::Subscribe, Outcome::Rejected(_))));
    assert_eq!(outcomes[1], (ActionType::Publish, Outcome::Ok));
}

#[tokio::test(start_paused = true)]
async fn missing_ack_times_out() {
    let connector = MockConnector::new().never_ack("/blackhole");
    let scenario = r#"[
        {"t": 0, "action": "subscribe", "topic": "/blackhole", "qos": 1},
        {"t": 0, "action": "publish", "topic": "/after", "payload": "x"}
    ]"#;

    let mut config = config(1);
    config.ack_timeout = Duration::from_secs(1);

    let (state, events) = run_agent(connector, scenario, None, config, CancellationToken::new()).await;

    assert_eq!(state, AgentState::Completed);
    assert_eq!(
        actions(&events),
        vec![
            (ActionType::Subscribe, Outcome::TimedOut),
            (ActionType::Publish, Outcome::Ok),
        ]
    );

    // the publish was scheduled at 0 but could only start after the timeout
    let lag = events
        .iter()
        .find_map(|event| match &event.kind {
            EventKind::ActionCompleted {
                action: ActionType::Publish,
                lag,
                ..
            } => Some(*lag),
            _ => None,
        })
        .unwrap();
    assert!(lag >= Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn lost_connection_fails_the_agent() {
    let connector = MockConnector::new().fatal_topic("/boom");
    let scenario = r#"[
        {"t": 0, "action": "publish", "topic": "/boom"},
        {"t": 1, "action": "publish", "topic": "/never"}
    ]"#;

    let (state, events) = run_agent(connector, scenario, None, config(1), CancellationToken::new()).await;

    assert_eq!(state, AgentState::Failed);
    assert!(actions(&events).is_empty());
    assert_eq!(
        count(&events, |kind| matches!(kind, EventKind::ConnectionLost { .. })),
        1
    );
    assert_eq!(
        events.last().unwrap().kind,
        EventKind::Finished {
            state: AgentState::Failed
        }
    );
}

#[tokio::test(start_paused = true)]
async fn refused_connection_fails_without_actions() {
    let connector = MockConnector::new().refuse_user("user");
    let scenario = r#"[{"t": 0, "action": "publish", "topic": "/x"}]"#;

    let (state, events) = run_agent(connector, scenario, None, config(1), CancellationToken::new()).await;

    assert_eq!(state, AgentState::Failed);
    assert_eq!(events.len(), 2);
    assert!(matches!(events[0].kind, EventKind::ConnectFailed { .. }));
}

#[tokio::test(start_paused = true)]
async fn slow_connect_times_out() {
    let connector = MockConnector::new().connect_delay(Duration::from_secs(60));
    let mut config = config(1);
    config.connect_timeout = Duration::from_secs(5);

    let (state, events) = run_agent(connector, "[]", None, config, CancellationToken::new()).await;

    assert_eq!(state, AgentState::Failed);
    assert_eq!(
        events[0].kind,
        EventKind::ConnectFailed {
            error: "connect timed out".to_string()
        }
    );
}

#[tokio::test(start_paused = true)]
async fn cancellation_interrupts_the_timeline() {
    let scenario = r#"[
        {"t": 0, "action": "publish", "topic": "/x"},
        {"t": 60, "action": "publish", "topic": "/x"}
    ]"#;

    let started = Instant::now();
    let cancel = cancel_after(Duration::from_secs(1));
    let (state, events) = run_agent(MockConnector::new(), scenario, None, config(1), cancel).await;

    assert_eq!(state, AgentState::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(60));
    assert_eq!(actions(&events).len(), 1);
    assert_eq!(
        events.last().unwrap().kind,
        EventKind::Finished {
            state: AgentState::Cancelled
        }
    );
}

#[tokio::test(start_paused = true)]
async fn empty_scenario_completes_immediately() {
    let (state, events) = run_agent(
        MockConnector::new(),
        "[]",
        None,
        config(1),
        CancellationToken::new(),
    )
    .await;

    assert_eq!(state, AgentState::Completed);
    assert_eq!(events.len(), 2);
}
