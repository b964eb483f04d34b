//! device_control action tests: expressions, read-modify-write, templates and batches

#![allow(clippy::disallowed_methods)] // Integration test - unwrap is acceptable

mod common;

use common::{action_channel, next_report, rule, value, RecordingWriter};
use edge_rules::{EdgeComputeEngine, NumericValue};
use serde_json::json;
use std::sync::Arc;

/// Engine with one always-true rule on c1/d1/p1 running `action`
async fn engine_with(
    writer: Arc<RecordingWriter>,
    action: serde_json::Value,
) -> (
    EdgeComputeEngine,
    tokio::sync::mpsc::UnboundedReceiver<edge_rules::ActionReport>,
) {
    let (hook, rx) = action_channel();
    let engine = EdgeComputeEngine::builder()
        .device_writer(writer)
        .action_hook(hook)
        .build()
        .unwrap();
    engine.load_rules(vec![rule(json!({
        "id": "ctl",
        "sources": [{"alias": "t", "channel_id": "c1", "device_id": "d1", "point_id": "p1"}],
        "condition": "value >= 0",
        "actions": [action]
    }))]);
    engine.start().await.unwrap();
    (engine, rx)
}

#[tokio::test]
async fn test_expression_with_bit_access() {
    let writer = RecordingWriter::new();
    let (engine, mut rx) = engine_with(
        writer.clone(),
        json!({"type": "device_control", "config": {
            "channel_id": "c2", "device_id": "d2", "point_id": "out",
            "expression": "v.4 * 8"
        }}),
    )
    .await;

    engine.handle_value(value("p1", 9));
    let report = next_report(&mut rx).await;
    assert!(report.error.is_none(), "{:?}", report.error);

    let writes = writer.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].0, "c2/d2/out");
    assert_eq!(writes[0].1.to_f64(), Some(8.0));

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_read_modify_write_forms() {
    let writer = RecordingWriter::new();
    writer.set_point("c2/d2/a", 4);
    writer.set_point("c2/d2/b", 6);
    writer.set_point("c2/d2/c", 7);

    let (engine, mut rx) = engine_with(
        writer.clone(),
        json!({"type": "device_control", "config": {"targets": [
            {"channel_id": "c2", "device_id": "d2", "point_id": "a", "expression": "bitset(2, value)", "value": 1},
            {"channel_id": "c2", "device_id": "d2", "point_id": "b", "expression": "v.1"},
            {"channel_id": "c2", "device_id": "d2", "point_id": "c", "expression": "bitset(3, 0)"},
            {"channel_id": "c2", "device_id": "d2", "point_id": "unread", "expression": "bitset(4, 1)"}
        ]}}),
    )
    .await;

    engine.handle_value(value("p1", 1));
    let report = next_report(&mut rx).await;
    assert!(report.error.is_none(), "{:?}", report.error);

    let writes = writer.writes();
    assert_eq!(
        writes,
        vec![
            ("c2/d2/a".to_string(), NumericValue::Int(6)),
            ("c2/d2/b".to_string(), NumericValue::Int(7)),
            ("c2/d2/c".to_string(), NumericValue::Int(3)),
            // Read failed: only the bit itself is written
            ("c2/d2/unread".to_string(), NumericValue::Int(8)),
        ]
    );

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_value_template_and_fallbacks() {
    let writer = RecordingWriter::new();
    let (engine, mut rx) = engine_with(
        writer.clone(),
        json!({"type": "device_control", "config": {"targets": [
            {"channel_id": "c2", "device_id": "d2", "point_id": "templ", "value": "${t}"},
            {"channel_id": "c2", "device_id": "d2", "point_id": "literal", "value": 42},
            {"channel_id": "c2", "device_id": "d2", "point_id": "raw"},
            {"channel_id": "c2", "device_id": "d2", "point_id": "bad", "expression": "nope +", "value": 5}
        ]}}),
    )
    .await;

    engine.handle_value(value("p1", 21.5));
    let report = next_report(&mut rx).await;
    assert!(report.error.is_none(), "{:?}", report.error);

    let writes = writer.writes();
    assert_eq!(writes[0].1, NumericValue::Float(21.5));
    assert_eq!(writes[1].1, NumericValue::Int(42));
    assert_eq!(writes[2].1, NumericValue::Float(21.5));
    // Failed expression falls back to the literal value
    assert_eq!(writes[3].1, NumericValue::Int(5));

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_batch_partial_failure() {
    let writer = RecordingWriter::new();
    writer.fail_on("c2/d2/broken");

    let (engine, mut rx) = engine_with(
        writer.clone(),
        json!({"type": "device_control", "config": {"targets": [
            {"channel_id": "c2", "device_id": "d2", "point_id": "ok1", "value": 1},
            {"channel_id": "c2", "device_id": "d2", "point_id": "broken", "value": 1},
            {"channel_id": "c2", "device_id": "d2", "value": 1},
            {"channel_id": "c2", "device_id": "d2", "point_id": "ok2", "value": 2}
        ]}}),
    )
    .await;

    engine.handle_value(value("p1", 1));
    let report = next_report(&mut rx).await;
    let error = report.error.unwrap();
    assert!(error.contains("batch control errors"), "{}", error);
    assert!(error.contains("broken"), "{}", error);

    let written: Vec<String> = writer.writes().into_iter().map(|(k, _)| k).collect();
    assert_eq!(written, vec!["c2/d2/ok1", "c2/d2/ok2"]);

    // device_control failures are queued for retry
    let failed = engine.get_failed_actions().await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].rule_id, "ctl");
    assert_eq!(engine.get_metrics().actions_failed, 1);

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_legacy_target_requires_ids() {
    let writer = RecordingWriter::new();
    let (engine, mut rx) = engine_with(
        writer.clone(),
        json!({"type": "device_control", "config": {"channel_id": "c2", "value": 1}}),
    )
    .await;

    engine.handle_value(value("p1", 1));
    let report = next_report(&mut rx).await;
    assert!(report
        .error
        .unwrap()
        .contains("missing channel_id, device_id or point_id"));
    assert!(writer.writes().is_empty());

    engine.stop().await.unwrap();
}
