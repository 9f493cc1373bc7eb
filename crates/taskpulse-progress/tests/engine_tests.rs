//! Integration tests for the progress engine against the in-memory store.

use std::collections::BTreeMap;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value;

use taskpulse_progress::{CleanupSweeper, ProgressEngine};
use taskpulse_shared::config::ProgressConfig;
use taskpulse_shared::error::PulseError;
use taskpulse_shared::store::{task_key, StoreGateway, ACTIVE_TASKS_KEY};
use taskpulse_shared::types::{TaskEventKind, TaskKind, TaskStatus};

fn engine() -> ProgressEngine {
    ProgressEngine::new(StoreGateway::in_memory(), ProgressConfig::default())
}

fn download_stages() -> Vec<String> {
    ["metadata", "downloading", "extracting", "finalizing"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[tokio::test]
async fn test_happy_path_download() {
    let engine = engine();
    engine
        .create_task("T1", TaskKind::Download, download_stages(), None, None)
        .await
        .unwrap();

    engine.start_stage("T1", "metadata", None, None).await.unwrap();
    engine.complete_stage("T1", "metadata", None).await.unwrap();

    engine
        .start_stage("T1", "downloading", Some(1_000_000), None)
        .await
        .unwrap();
    for bytes in [250_000u64, 500_000, 750_000, 1_000_000] {
        engine
            .update_stage_progress("T1", "downloading", bytes, None, None, None)
            .await
            .unwrap();
    }
    engine.complete_stage("T1", "downloading", None).await.unwrap();

    engine.start_stage("T1", "extracting", None, None).await.unwrap();
    engine.complete_stage("T1", "extracting", None).await.unwrap();
    engine.start_stage("T1", "finalizing", None, None).await.unwrap();
    engine.complete_stage("T1", "finalizing", None).await.unwrap();

    let record = engine.get_task("T1").await.unwrap().unwrap();
    assert_eq!(record.status, TaskStatus::Completed);
    assert!((record.progress.percentage - 100.0).abs() < 0.01);
    assert!(record.completed_at.is_some());
    assert!(record.completed_at.unwrap() >= record.started_at.unwrap());

    // Exactly one task_completed in the timeline
    let timeline = engine.get_timeline("T1", 1_000, 0).await.unwrap();
    let completions = timeline
        .iter()
        .filter(|e| e.event_type == TaskEventKind::TaskCompleted)
        .count();
    assert_eq!(completions, 1);

    // Removed from the active set
    assert!(engine.active_task_ids().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_create_then_get_round_trip_and_conflict() {
    let engine = engine();
    let created = engine
        .create_task("dup", TaskKind::Download, download_stages(), None, None)
        .await
        .unwrap();

    let fetched = engine.get_task("dup").await.unwrap().unwrap();
    assert_eq!(fetched.task_id, created.task_id);
    assert_eq!(fetched.status, TaskStatus::Pending);
    assert_eq!(fetched.progress.stages.len(), 4);

    // Second create on the same id conflicts and leaves the first unchanged
    let err = engine
        .create_task("dup", TaskKind::Upload, vec!["only".into()], None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, PulseError::Conflict(_)));

    let still = engine.get_task("dup").await.unwrap().unwrap();
    assert_eq!(still.kind, TaskKind::Download);
    assert_eq!(still.progress.stages.len(), 4);
}

#[tokio::test]
async fn test_zero_stages_rejected() {
    let engine = engine();
    let err = engine
        .create_task("empty", TaskKind::Download, vec![], None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, PulseError::Validation(_)));
    assert!(engine.get_task("empty").await.unwrap().is_none());
}

#[tokio::test]
async fn test_start_stage_idempotent() {
    let engine = engine();
    engine
        .create_task("T", TaskKind::Download, download_stages(), None, None)
        .await
        .unwrap();

    engine
        .start_stage("T", "downloading", Some(500), None)
        .await
        .unwrap();
    let first = engine.get_task("T").await.unwrap().unwrap();
    let first_started = first.progress.stages["downloading"].started_at;

    engine
        .start_stage("T", "downloading", Some(999), None)
        .await
        .unwrap();
    let second = engine.get_task("T").await.unwrap().unwrap();

    // Observably equivalent to a single call
    assert_eq!(second.progress.stages["downloading"].started_at, first_started);
    assert_eq!(second.progress.stages["downloading"].total_bytes, 500);
}

#[tokio::test]
async fn test_percentage_clamped_and_monotonic() {
    let engine = engine();
    engine
        .create_task("T", TaskKind::Download, download_stages(), None, None)
        .await
        .unwrap();
    engine.start_stage("T", "downloading", None, None).await.unwrap();

    engine
        .update_stage_progress("T", "downloading", 10, Some(150.0), None, None)
        .await
        .unwrap();
    let record = engine.get_task("T").await.unwrap().unwrap();
    assert!((record.progress.stages["downloading"].percentage - 100.0).abs() < f64::EPSILON);

    // A later, lower report does not move percentage backwards
    engine
        .update_stage_progress("T", "downloading", 5, Some(40.0), None, None)
        .await
        .unwrap();
    let record = engine.get_task("T").await.unwrap().unwrap();
    assert!((record.progress.stages["downloading"].percentage - 100.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_aggregate_matches_weighted_sum() {
    let engine = engine();
    let weights = BTreeMap::from([("a".to_string(), 0.3), ("b".to_string(), 0.7)]);
    engine
        .create_task(
            "T",
            TaskKind::Conversion,
            vec!["a".into(), "b".into()],
            Some(weights),
            None,
        )
        .await
        .unwrap();

    engine.start_stage("T", "a", None, None).await.unwrap();
    engine.complete_stage("T", "a", None).await.unwrap();
    engine.start_stage("T", "b", None, None).await.unwrap();
    engine
        .update_stage_progress("T", "b", 0, Some(50.0), None, None)
        .await
        .unwrap();

    let record = engine.get_task("T").await.unwrap().unwrap();
    let expected: f64 = record
        .progress
        .stage_weights
        .iter()
        .map(|(name, w)| record.progress.stages[name].percentage * w)
        .sum::<f64>()
        / record.progress.stage_weights.values().sum::<f64>();
    assert!((record.progress.percentage - expected).abs() < 0.01);
    // 100 * 0.3 + 50 * 0.7 = 65
    assert!((record.progress.percentage - 65.0).abs() < 0.01);
}

#[tokio::test]
async fn test_updates_against_terminal_task_dropped() {
    let engine = engine();
    engine
        .create_task("T", TaskKind::Download, vec!["only".into()], None, None)
        .await
        .unwrap();
    engine.start_stage("T", "only", None, None).await.unwrap();
    engine.complete_stage("T", "only", None).await.unwrap();

    let before = engine.get_task("T").await.unwrap().unwrap();
    assert_eq!(before.status, TaskStatus::Completed);

    // Dropped silently, no error, no state change
    engine
        .update_stage_progress("T", "only", 123, Some(10.0), None, None)
        .await
        .unwrap();
    let after = engine.get_task("T").await.unwrap().unwrap();
    assert_eq!(after.status, TaskStatus::Completed);
    assert!((after.progress.stages["only"].percentage - 100.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_fail_stage_is_terminal() {
    let engine = engine();
    engine
        .create_task("T", TaskKind::Download, download_stages(), None, None)
        .await
        .unwrap();
    engine.start_stage("T", "downloading", None, None).await.unwrap();
    engine
        .fail_stage("T", "downloading", "connection reset", None)
        .await
        .unwrap();

    let record = engine.get_task("T").await.unwrap().unwrap();
    assert_eq!(record.status, TaskStatus::Failed);
    assert!(record.error.as_deref().unwrap().contains("connection reset"));
    assert!(record.completed_at.is_some());
    assert!(engine.active_task_ids().await.unwrap().is_empty());

    let timeline = engine.get_timeline("T", 10, 0).await.unwrap();
    assert_eq!(timeline[0].event_type, TaskEventKind::TaskFailed);
    assert_eq!(timeline[1].event_type, TaskEventKind::StageFailed);

    // A failed task never recovers
    engine.start_stage("T", "extracting", None, None).await.unwrap();
    let record = engine.get_task("T").await.unwrap().unwrap();
    assert_eq!(record.status, TaskStatus::Failed);
}

#[tokio::test]
async fn test_cancel_task() {
    let engine = engine();
    engine
        .create_task("T", TaskKind::Transcription, vec!["preparing".into()], None, None)
        .await
        .unwrap();
    engine.cancel_task("T", Some("user request")).await.unwrap();

    let record = engine.get_task("T").await.unwrap().unwrap();
    assert_eq!(record.status, TaskStatus::Cancelled);
    assert!(engine.active_task_ids().await.unwrap().is_empty());

    let timeline = engine.get_timeline("T", 10, 0).await.unwrap();
    assert_eq!(timeline[0].event_type, TaskEventKind::TaskCancelled);
}

#[tokio::test]
async fn test_published_events_carry_full_aggregate() {
    let engine = engine();
    let mut events = engine.subscribe();

    engine
        .create_task("T", TaskKind::Download, download_stages(), None, None)
        .await
        .unwrap();
    engine
        .start_stage("T", "downloading", Some(1_000), None)
        .await
        .unwrap();
    engine
        .update_stage_progress("T", "downloading", 500, None, None, None)
        .await
        .unwrap();

    let started = events.recv().await.unwrap();
    assert_eq!(started.event_type, TaskEventKind::StageStarted);
    assert_eq!(started.stage.as_deref(), Some("downloading"));

    let progress = events.recv().await.unwrap();
    assert_eq!(progress.event_type, TaskEventKind::StageProgress);
    assert_eq!(progress.progress.stages.len(), 4);
    assert!((progress.progress.stages["downloading"].percentage - 50.0).abs() < 0.01);
}

#[tokio::test]
async fn test_timeline_is_reverse_chronological_with_offset() {
    let engine = engine();
    engine
        .create_task("T", TaskKind::Download, vec!["s".into()], None, None)
        .await
        .unwrap();
    engine.start_stage("T", "s", None, None).await.unwrap();
    engine.complete_stage("T", "s", None).await.unwrap();

    let all = engine.get_timeline("T", 100, 0).await.unwrap();
    // Newest first: task_completed, stage_completed, stage_started, task_created
    assert_eq!(all[0].event_type, TaskEventKind::TaskCompleted);
    assert_eq!(all.last().unwrap().event_type, TaskEventKind::TaskCreated);
    for pair in all.windows(2) {
        assert!(pair[0].timestamp >= pair[1].timestamp);
    }

    let offset = engine.get_timeline("T", 2, 1).await.unwrap();
    assert_eq!(offset.len(), 2);
    assert_eq!(offset[0].event_type, all[1].event_type);
}

#[tokio::test]
async fn test_cleanup_sweep_removes_expired_terminal_tasks() {
    let gateway = StoreGateway::in_memory();
    let engine = ProgressEngine::new(gateway.clone(), ProgressConfig::default());

    engine
        .create_task("T2", TaskKind::Download, vec!["s".into()], None, None)
        .await
        .unwrap();
    engine.start_stage("T2", "s", None, None).await.unwrap();
    engine.complete_stage("T2", "s", None).await.unwrap();

    // Backdate completion past the 7-day TTL
    let key = task_key("T2");
    let data = gateway.hash_get(&key, "data").await.unwrap().unwrap();
    let mut record: Value = serde_json::from_str(&data).unwrap();
    let stale = (Utc::now() - ChronoDuration::days(8)).to_rfc3339();
    record["completed_at"] = Value::String(stale);
    gateway
        .hash_set(&key, vec![("data".into(), record.to_string())])
        .await
        .unwrap();

    // A fresh terminal task survives the sweep
    engine
        .create_task("fresh", TaskKind::Download, vec!["s".into()], None, None)
        .await
        .unwrap();
    engine.start_stage("fresh", "s", None, None).await.unwrap();
    engine.complete_stage("fresh", "s", None).await.unwrap();

    let sweeper = CleanupSweeper::new(gateway.clone(), ProgressConfig::default());
    let removed = sweeper.sweep().await.unwrap();
    assert_eq!(removed, 1);

    assert!(engine.get_task("T2").await.unwrap().is_none());
    assert!(gateway
        .list_range("events:T2", 0, -1)
        .await
        .unwrap()
        .is_empty());
    assert!(!gateway
        .set_members(ACTIVE_TASKS_KEY)
        .await
        .unwrap()
        .contains(&"T2".to_string()));
    assert!(engine.get_task("fresh").await.unwrap().is_some());

    // Idempotent re-entry
    assert_eq!(sweeper.sweep().await.unwrap(), 0);
}

#[tokio::test]
async fn test_statistics_roll_up() {
    let engine = engine();
    engine
        .create_task("a", TaskKind::Download, vec!["s".into()], None, None)
        .await
        .unwrap();
    engine
        .create_task("b", TaskKind::Transcription, vec!["s".into()], None, None)
        .await
        .unwrap();
    engine.start_stage("b", "s", None, None).await.unwrap();
    engine.complete_stage("b", "s", None).await.unwrap();

    let stats = engine.statistics().await.unwrap();
    assert_eq!(stats.tasks_by_status["pending"], 1);
    assert_eq!(stats.tasks_by_status["completed"], 1);
    assert_eq!(stats.tasks_by_kind["download"], 1);
    assert_eq!(stats.tasks_by_kind["transcription"], 1);
    assert_eq!(stats.active_tasks, 1);
    assert!(stats.total_events >= 4);
}
