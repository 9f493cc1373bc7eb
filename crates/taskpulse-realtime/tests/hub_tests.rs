//! Integration tests for the fan-out hub: subscription routing, the
//! connection cap, heartbeat semantics, and backpressure.

use std::sync::Arc;
use std::time::Duration;

use taskpulse_progress::ProgressEngine;
use taskpulse_realtime::auth::NullTokenValidator;
use taskpulse_realtime::hub::{run_event_pump, FanoutHub, Mailbox};
use taskpulse_realtime::{AppHandle, Bootstrap};
use taskpulse_shared::config::{HubConfig, ProgressConfig, TaskPulseConfig};
use taskpulse_shared::error::PulseError;
use taskpulse_shared::store::StoreGateway;
use taskpulse_shared::types::{ServerFrame, ServerPayload, TaskKind};
use tokio_util::sync::CancellationToken;

fn hub_with(config: HubConfig) -> (Arc<FanoutHub>, Arc<ProgressEngine>, StoreGateway) {
    let gateway = StoreGateway::in_memory();
    let engine = Arc::new(ProgressEngine::new(
        gateway.clone(),
        ProgressConfig::default(),
    ));
    let hub = Arc::new(FanoutHub::new(
        config,
        engine.clone(),
        Arc::new(NullTokenValidator),
    ));
    (hub, engine, gateway)
}

async fn drain(mailbox: &Arc<Mailbox>) -> Vec<ServerFrame> {
    let mut frames = Vec::new();
    while let Ok(Some(frame)) =
        tokio::time::timeout(Duration::from_millis(200), mailbox.recv()).await
    {
        frames.push(frame);
    }
    frames
}

fn subscribe_frame(task_ids: &[&str], channels: &[&str]) -> String {
    serde_json::json!({
        "type": "subscribe",
        "data": { "task_ids": task_ids, "channels": channels }
    })
    .to_string()
}

#[tokio::test]
async fn test_subscriber_fanout_routing() {
    let (hub, engine, gateway) = hub_with(HubConfig::default());

    engine
        .create_task("T1", TaskKind::Download, vec!["downloading".into()], None, None)
        .await
        .unwrap();

    let a = hub.connect(Some("A".into()), None).await.unwrap();
    let b = hub.connect(Some("B".into()), None).await.unwrap();

    // A follows the task; B only the progress channel
    hub.handle_frame("A", &subscribe_frame(&["T1"], &[])).await;
    hub.handle_frame("B", &subscribe_frame(&[], &["progress"])).await;

    // Pump events from the store subscription into the hub
    let token = CancellationToken::new();
    let pump = tokio::spawn(run_event_pump(
        hub.clone(),
        gateway.clone(),
        token.clone(),
    ));
    tokio::time::sleep(Duration::from_millis(50)).await;

    engine
        .start_stage("T1", "downloading", Some(1_000), None)
        .await
        .unwrap();
    engine
        .update_stage_progress("T1", "downloading", 500, None, None, None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let a_frames = drain(&a.mailbox).await;
    let stage_updates: Vec<_> = a_frames
        .iter()
        .filter_map(|f| match &f.payload {
            ServerPayload::StageUpdate(data) => Some(data),
            _ => None,
        })
        .collect();
    assert_eq!(stage_updates.len(), 2, "start + one progress update");
    assert!(stage_updates.iter().all(|d| d.task_id == "T1"));
    assert_eq!(stage_updates[1].updated_stage.as_deref(), Some("downloading"));
    assert!((stage_updates[1].stages["downloading"].percentage - 50.0).abs() < 0.01);

    // Channel `progress` is an opt-in label, not task fan-out: B sees only
    // its welcome and subscription ack
    let b_frames = drain(&b.mailbox).await;
    for frame in &b_frames {
        assert!(
            matches!(
                frame.payload,
                ServerPayload::Connected(_) | ServerPayload::StatusResponse(_)
            ),
            "unexpected frame for B: {:?}",
            frame.payload
        );
    }

    token.cancel();
    let _ = pump.await;
}

#[tokio::test]
async fn test_connection_cap_enforced() {
    let (hub, _engine, _gateway) = hub_with(HubConfig {
        max_connections: 2,
        ..HubConfig::default()
    });

    hub.connect(Some("one".into()), None).await.unwrap();
    hub.connect(Some("two".into()), None).await.unwrap();

    let err = hub.connect(Some("three".into()), None).await.unwrap_err();
    assert!(matches!(err, PulseError::Capacity(_)));

    // Freeing a slot lets the third client in
    hub.disconnect("one", "test");
    hub.connect(Some("three".into()), None).await.unwrap();
    assert_eq!(hub.active_connections(), 2);
}

#[tokio::test]
async fn test_duplicate_client_id_rejected() {
    let (hub, _engine, _gateway) = hub_with(HubConfig::default());
    hub.connect(Some("dup".into()), None).await.unwrap();
    let err = hub.connect(Some("dup".into()), None).await.unwrap_err();
    assert!(matches!(err, PulseError::Conflict(_)));
}

#[tokio::test]
async fn test_welcome_frame_contents() {
    let (hub, _engine, _gateway) = hub_with(HubConfig::default());
    let handle = hub.connect(Some("c".into()), None).await.unwrap();
    let frames = drain(&handle.mailbox).await;

    match &frames[0].payload {
        ServerPayload::Connected(data) => {
            assert_eq!(data.client_id, "c");
            assert!(!data.authenticated);
            assert_eq!(data.heartbeat_interval, 30);
            assert_eq!(
                data.available_channels,
                vec!["progress", "system", "alerts"]
            );
            assert!(data.features.stage_level_updates);
        }
        other => panic!("expected connected frame, got {other:?}"),
    }
}

#[tokio::test]
async fn test_subscribe_unsubscribe_resubscribe_law() {
    let (hub, engine, _gateway) = hub_with(HubConfig::default());
    engine
        .create_task("T", TaskKind::Download, vec!["s".into()], None, None)
        .await
        .unwrap();
    engine.start_stage("T", "s", None, None).await.unwrap();

    let handle = hub.connect(Some("c".into()), None).await.unwrap();
    let mut events = engine.subscribe();

    hub.handle_frame("c", &subscribe_frame(&["T"], &[])).await;
    engine
        .update_stage_progress("T", "s", 1, Some(10.0), None, None)
        .await
        .unwrap();
    hub.broadcast_event(&events.recv().await.unwrap()).await;

    let received = drain(&handle.mailbox).await;
    assert!(received
        .iter()
        .any(|f| matches!(f.payload, ServerPayload::StageUpdate(_))));

    // After unsubscribe the connection receives nothing for that task
    hub.handle_frame(
        "c",
        &serde_json::json!({"type": "unsubscribe", "data": {"task_ids": ["T"]}}).to_string(),
    )
    .await;
    drain(&handle.mailbox).await;

    engine
        .update_stage_progress("T", "s", 2, Some(20.0), None, None)
        .await
        .unwrap();
    hub.broadcast_event(&events.recv().await.unwrap()).await;
    let after_unsub = drain(&handle.mailbox).await;
    assert!(after_unsub
        .iter()
        .all(|f| !matches!(f.payload, ServerPayload::StageUpdate(_))));

    // Resubscribing restores delivery
    hub.handle_frame("c", &subscribe_frame(&["T"], &[])).await;
    drain(&handle.mailbox).await;
    engine
        .update_stage_progress("T", "s", 3, Some(30.0), None, None)
        .await
        .unwrap();
    hub.broadcast_event(&events.recv().await.unwrap()).await;
    let after_resub = drain(&handle.mailbox).await;
    assert!(after_resub
        .iter()
        .any(|f| matches!(f.payload, ServerPayload::StageUpdate(_))));

    assert!(hub.registry().indices_consistent());
}

#[tokio::test]
async fn test_unknown_message_type_yields_error_frame() {
    let (hub, _engine, _gateway) = hub_with(HubConfig::default());
    let handle = hub.connect(Some("c".into()), None).await.unwrap();
    drain(&handle.mailbox).await;

    hub.handle_frame("c", r#"{"type":"bogus","data":{}}"#).await;
    let frames = drain(&handle.mailbox).await;
    assert!(frames
        .iter()
        .any(|f| matches!(&f.payload, ServerPayload::Error { error } if error.contains("unknown message type"))));
}

#[tokio::test]
async fn test_ping_updates_heartbeat_and_echoes() {
    let (hub, _engine, _gateway) = hub_with(HubConfig::default());
    let handle = hub.connect(Some("c".into()), None).await.unwrap();
    drain(&handle.mailbox).await;

    hub.handle_frame(
        "c",
        &serde_json::json!({"type": "ping", "data": {"timestamp": "client-ts"}}).to_string(),
    )
    .await;
    let frames = drain(&handle.mailbox).await;
    match &frames[0].payload {
        ServerPayload::Pong {
            client_id,
            latency_test,
            ..
        } => {
            assert_eq!(client_id, "c");
            assert_eq!(latency_test.as_ref().unwrap(), "client-ts");
        }
        other => panic!("expected pong, got {other:?}"),
    }
}

#[tokio::test]
async fn test_heartbeat_staleness_boundary() {
    let (hub, _engine, _gateway) = hub_with(HubConfig::default());
    hub.connect(Some("fresh".into()), None).await.unwrap();

    // Well within the timeout: alive
    assert!(hub
        .registry()
        .stale_connections(Duration::from_secs(60))
        .is_empty());

    tokio::time::sleep(Duration::from_millis(30)).await;
    // Past a tiny timeout: stale
    let stale = hub.registry().stale_connections(Duration::from_millis(10));
    assert_eq!(stale, vec!["fresh".to_string()]);
    // Not past a generous one
    assert!(hub
        .registry()
        .stale_connections(Duration::from_secs(10))
        .is_empty());
}

#[tokio::test]
async fn test_one_way_connections_exempt_from_heartbeat() {
    let (hub, _engine, _gateway) = hub_with(HubConfig::default());
    hub.connect_one_way(Some("sse".into()), None).await.unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(hub
        .registry()
        .stale_connections(Duration::from_millis(1))
        .is_empty());
}

#[tokio::test]
async fn test_backpressure_drops_progress_keeps_terminal() {
    let (hub, engine, _gateway) = hub_with(HubConfig {
        send_buffer_limit: 3,
        ..HubConfig::default()
    });
    engine
        .create_task("T", TaskKind::Download, vec!["s".into()], None, None)
        .await
        .unwrap();
    engine.start_stage("T", "s", None, None).await.unwrap();

    let handle = hub.connect(Some("slow".into()), None).await.unwrap();
    hub.handle_frame("slow", &subscribe_frame(&["T"], &[])).await;
    // Clear welcome + ack so the queue starts empty
    drain(&handle.mailbox).await;

    let mut events = engine.subscribe();
    for pct in [10.0, 20.0, 30.0, 40.0, 50.0] {
        engine
            .update_stage_progress("T", "s", 0, Some(pct), None, None)
            .await
            .unwrap();
        hub.broadcast_event(&events.recv().await.unwrap()).await;
    }
    engine.complete_stage("T", "s", None).await.unwrap();
    // stage_completed, then task_completed
    hub.broadcast_event(&events.recv().await.unwrap()).await;
    hub.broadcast_event(&events.recv().await.unwrap()).await;

    assert!(handle.mailbox.dropped_count() > 0);
    let frames = drain(&handle.mailbox).await;
    // The terminal frame survived the shedding
    assert!(frames
        .iter()
        .any(|f| matches!(f.payload, ServerPayload::TaskComplete { .. })));
    let stats = hub.stats();
    assert!(stats.messages.dropped > 0);
}

#[tokio::test]
async fn test_disconnect_is_idempotent_and_atomic() {
    let (hub, _engine, _gateway) = hub_with(HubConfig::default());
    hub.connect(Some("c".into()), None).await.unwrap();
    hub.handle_frame("c", &subscribe_frame(&["T1", "T2"], &["alerts"])).await;

    hub.disconnect("c", "test");
    hub.disconnect("c", "test");

    assert_eq!(hub.active_connections(), 0);
    assert!(hub.registry().task_subscribers("T1").is_empty());
    assert!(hub.registry().task_subscribers("T2").is_empty());
    assert!(hub.registry().indices_consistent());
}

#[tokio::test]
async fn test_shutdown_closes_all_and_rejects_new() {
    let (hub, _engine, _gateway) = hub_with(HubConfig::default());
    let handle = hub.connect(Some("c".into()), None).await.unwrap();

    hub.shutdown();
    assert_eq!(hub.active_connections(), 0);
    assert!(handle.mailbox.is_closed());

    let err = hub.connect(Some("late".into()), None).await.unwrap_err();
    assert!(matches!(err, PulseError::ShuttingDown));
}

#[tokio::test]
async fn test_bootstrap_smoke() {
    let mut config = TaskPulseConfig::default();
    config.http.bind_addr = "127.0.0.1:0".into();
    config.shutdown_timeout_ms = 2_000;
    config.optimizer.baseline_sample_gap_ms = 0;

    let handle: AppHandle =
        Bootstrap::start_with_gateway(config, StoreGateway::in_memory())
            .await
            .unwrap();
    assert!(handle.hub.is_accepting());
    assert_ne!(handle.local_addr.port(), 0);

    handle.stop().await.unwrap();
}
