//! Action pipeline tests: publishing, retries, throttling, trigger modes and workflows

#![allow(clippy::disallowed_methods)] // Integration test - unwrap is acceptable

mod common;

use chrono::{TimeZone, Utc};
use common::{action_channel, next_report, rule, value, RecordingPublisher, RecordingWriter};
use edge_rules::{
    Clock, EdgeComputeEngine, ManualClock, NumericValue, RuleStatus, TriggerMode,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn alarm_rule(actions: serde_json::Value) -> edge_rules::Rule {
    rule(json!({
        "id": "r1",
        "name": "Boiler temperature",
        "sources": [{"alias": "t", "channel_id": "c1", "device_id": "d1", "point_id": "temp"}],
        "condition": "t > 50",
        "actions": actions
    }))
}

#[tokio::test]
async fn test_mqtt_payloads() {
    let publisher = RecordingPublisher::new();
    let (hook, mut rx) = action_channel();
    let engine = EdgeComputeEngine::builder()
        .publisher(publisher.clone())
        .action_hook(hook)
        .build()
        .unwrap();
    engine.load_rules(vec![alarm_rule(json!([
        {"type": "mqtt", "config": {"topic": "alarms/raw", "client_id": "north"}},
        {"type": "mqtt", "config": {"topic": "alarms/batch", "send_strategy": "batch"}},
        {"type": "mqtt", "config": {"topic": "alarms/text", "message": "boiler at ${t}C"}},
        {"type": "mqtt", "config": {}}
    ]))]);
    engine.start().await.unwrap();

    engine.handle_value(value("temp", 72.5));
    for _ in 0..4 {
        let report = next_report(&mut rx).await;
        assert!(report.error.is_none(), "{:?}", report.error);
    }

    let mut messages = publisher.messages();
    messages.sort_by(|a, b| a.1.cmp(&b.1));
    assert_eq!(messages.len(), 3);

    let batch: serde_json::Value = serde_json::from_slice(&messages[0].2).unwrap();
    assert_eq!(batch, json!({"t": 72.5, "temp": 72.5}));

    assert_eq!(messages[1].0.as_deref(), Some("north"));
    let raw: serde_json::Value = serde_json::from_slice(&messages[1].2).unwrap();
    assert_eq!(raw["point_id"], "temp");
    assert_eq!(raw["value"], 72.5);

    assert_eq!(&messages[2].2[..], b"boiler at 72.5C");

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_failed_mqtt_is_retried() {
    let publisher = RecordingPublisher::new();
    publisher.set_failing(true);
    let (hook, mut rx) = action_channel();
    let engine = EdgeComputeEngine::builder()
        .publisher(publisher.clone())
        .action_hook(hook)
        .build()
        .unwrap();
    engine.load_rules(vec![alarm_rule(json!([
        {"type": "mqtt", "config": {"topic": "alarms"}},
        {"type": "log", "config": {"level": "warn"}}
    ]))]);
    engine.start().await.unwrap();

    engine.handle_value(value("temp", 90));
    let mut errors = 0;
    for _ in 0..2 {
        if next_report(&mut rx).await.error.is_some() {
            errors += 1;
        }
    }
    assert_eq!(errors, 1);

    let failed = engine.get_failed_actions().await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].action.type_name(), "mqtt");
    assert_eq!(failed[0].retry_count, 0);

    // Still failing: retry_count grows
    let report = engine.process_failed_actions().await.unwrap();
    assert_eq!(report.retried, 1);
    assert_eq!(engine.get_failed_actions().await.unwrap()[0].retry_count, 1);

    publisher.set_failing(false);
    let report = engine.process_failed_actions().await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert!(engine.get_failed_actions().await.unwrap().is_empty());
    assert_eq!(publisher.messages().len(), 1);

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_action_interval_throttle() {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap(),
    ));
    let (hook, mut rx) = action_channel();
    let engine = EdgeComputeEngine::builder()
        .clock(clock.clone())
        .action_hook(hook)
        .build()
        .unwrap();
    engine.load_rules(vec![alarm_rule(json!([
        {"type": "log", "config": {"interval": "1h", "message": "throttled"}}
    ]))]);
    engine.start().await.unwrap();

    for _ in 0..3 {
        engine.execute_rule("r1", value("temp", 90)).await.unwrap();
        clock.advance(Duration::from_secs(60));
    }
    next_report(&mut rx).await;

    clock.advance(Duration::from_secs(3600));
    let state = engine.execute_rule("r1", value("temp", 90)).await.unwrap();
    next_report(&mut rx).await;
    assert_eq!(state.trigger_count, 4);
    assert_eq!(state.action_last_runs.get(&0), Some(&clock.now()));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_on_change_fires_once_per_alarm() {
    let (hook, mut rx) = action_channel();
    let engine = EdgeComputeEngine::builder().action_hook(hook).build().unwrap();
    let mut r = alarm_rule(json!([{"type": "log", "config": {}}]));
    r.trigger_mode = TriggerMode::OnChange;
    engine.load_rules(vec![r]);
    engine.start().await.unwrap();

    for t in [60, 70, 20, 80] {
        engine.execute_rule("r1", value("temp", t)).await.unwrap();
    }
    next_report(&mut rx).await;
    next_report(&mut rx).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());

    let state = engine.get_rule_state("r1").unwrap();
    assert_eq!(state.trigger_count, 3);
    assert_eq!(state.current_status, RuleStatus::Alarm);

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_sequence_with_check_and_rollback() {
    let writer = RecordingWriter::new();
    writer.set_point("c2/d2/feedback", 0);
    let (hook, mut rx) = action_channel();
    let engine = EdgeComputeEngine::builder()
        .device_writer(writer.clone())
        .action_hook(hook)
        .build()
        .unwrap();

    let command = |v: i32| {
        json!({"type": "device_control", "config": {
            "channel_id": "c2", "device_id": "d2", "point_id": "cmd", "value": v
        }})
    };
    engine.load_rules(vec![alarm_rule(json!([{"type": "sequence", "config": {"steps": [
        command(1),
        {"type": "delay", "config": {"duration": "5ms"}},
        {"type": "check", "config": {
            "channel_id": "c2", "device_id": "d2", "point_id": "feedback",
            "expression": "v == 1", "retry": 3, "interval": "10ms",
            "on_fail": [command(0)]
        }}
    ]}}]))]);
    engine.start().await.unwrap();

    engine.handle_value(value("temp", 90));
    let report = next_report(&mut rx).await;
    let error = report.error.unwrap();
    assert!(error.contains("check failed: condition false"), "{}", error);

    let writes: Vec<NumericValue> = writer.writes().into_iter().map(|(_, v)| v).collect();
    assert_eq!(writes, vec![NumericValue::Int(1), NumericValue::Int(0)]);
    // Sequences are not retried
    assert!(engine.get_failed_actions().await.unwrap().is_empty());

    // Feedback confirms: no rollback
    writer.set_point("c2/d2/feedback", 1);
    engine.handle_value(value("temp", 91));
    let report = next_report(&mut rx).await;
    assert!(report.error.is_none(), "{:?}", report.error);
    assert_eq!(writer.writes().len(), 3);

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_database_action_and_logs() {
    let (hook, mut rx) = action_channel();
    let engine = EdgeComputeEngine::builder().action_hook(hook).build().unwrap();
    engine.load_rules(vec![alarm_rule(json!([
        {"type": "database", "config": {"bucket": "boiler_events"}},
        {"type": "http", "config": {}}
    ]))]);
    engine.start().await.unwrap();

    engine.handle_value(value("temp", 90));
    for _ in 0..2 {
        let report = next_report(&mut rx).await;
        assert!(report.error.is_none(), "{:?}", report.error);
    }

    let now = Utc::now();
    let logs = engine
        .query_logs(now - chrono::Duration::minutes(5), now + chrono::Duration::minutes(5), Some("r1"))
        .await
        .unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, RuleStatus::Alarm);
    assert_eq!(logs[0].rule_name, "Boiler temperature");

    let all = engine
        .query_logs(now - chrono::Duration::minutes(5), now + chrono::Duration::minutes(5), None)
        .await
        .unwrap();
    assert_eq!(all.len(), 1);

    engine.stop().await.unwrap();
}
