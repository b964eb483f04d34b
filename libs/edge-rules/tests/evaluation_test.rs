//! Rule evaluation, debounce and restart recovery tests

#![allow(clippy::disallowed_methods)] // Integration test - unwrap is acceptable

mod common;

use chrono::{TimeZone, Utc};
use common::{rule, value, wait_until};
use edge_rules::{
    EdgeComputeEngine, EngineConfig, ManualClock, NumericValue, RuleRuntimeState, RuleStatus,
};
use edge_store::{KvStore, KvStoreExt, MemoryKvStore};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap(),
    ))
}

fn state_rule() -> edge_rules::Rule {
    rule(json!({
        "id": "overheat",
        "name": "Overheat",
        "type": "state",
        "sources": [{"alias": "t", "channel_id": "c1", "device_id": "d1", "point_id": "temp"}],
        "condition": "t > 80",
        "state": {"duration": "100ms", "count": 3}
    }))
}

#[tokio::test]
async fn test_threshold_alarm_and_recovery() {
    let engine = EdgeComputeEngine::builder().build().unwrap();
    engine.load_rules(vec![rule(json!({
        "id": "hot",
        "sources": [{"alias": "v", "channel_id": "c1", "device_id": "d1", "point_id": "p1"}],
        "condition": "v > 10"
    }))]);

    let state = engine.execute_rule("hot", value("p1", 11)).await.unwrap();
    assert_eq!(state.current_status, RuleStatus::Alarm);
    assert_eq!(state.trigger_count, 1);
    assert_eq!(state.last_value, NumericValue::Int(11));

    let state = engine.execute_rule("hot", value("p1", 9)).await.unwrap();
    assert_eq!(state.current_status, RuleStatus::Normal);
    assert_eq!(state.trigger_count, 1);
    assert!(state.last_check_time.is_some());
}

#[tokio::test]
async fn test_evaluation_error_keeps_status() {
    let engine = EdgeComputeEngine::builder().build().unwrap();
    engine.load_rules(vec![rule(json!({
        "id": "broken",
        "sources": [{"alias": "v", "channel_id": "c1", "device_id": "d1", "point_id": "p1"}],
        "condition": "v >"
    }))]);

    let state = engine.execute_rule("broken", value("p1", 11)).await.unwrap();
    assert_eq!(state.current_status, RuleStatus::Normal);
    assert!(!state.error_message.is_empty());
    assert_eq!(state.trigger_count, 0);
}

#[tokio::test]
async fn test_window_average_is_persisted() {
    let store = Arc::new(MemoryKvStore::new());
    let engine = EdgeComputeEngine::builder()
        .store(store.clone())
        .build()
        .unwrap();
    engine.load_rules(vec![rule(json!({
        "id": "avg",
        "type": "window",
        "sources": [{"channel_id": "c1", "device_id": "d1", "point_id": "p1"}],
        "condition": "value >= 3",
        "window": {"type": "sliding", "size": 3, "aggr_func": "avg"}
    }))]);

    let mut state = None;
    for v in [1, 2, 3, 4] {
        state = Some(engine.execute_rule("avg", value("p1", v)).await.unwrap());
    }
    let state = state.unwrap();
    assert_eq!(state.current_status, RuleStatus::Alarm);
    assert_eq!(state.last_value, NumericValue::Float(3.0));

    let window = engine.get_window_data("avg");
    assert_eq!(window.len(), 3);
    assert_eq!(window[0].value, NumericValue::Int(2));
    assert!(store.get_raw("rule_windows", "avg").await.unwrap().is_some());
    assert!(engine.get_window_data("missing").is_empty());
}

#[tokio::test]
async fn test_state_debounce_by_duration_and_count() {
    let clock = clock();
    let engine = EdgeComputeEngine::builder()
        .clock(clock.clone())
        .build()
        .unwrap();
    engine.load_rules(vec![state_rule()]);

    for _ in 0..3 {
        let state = engine.execute_rule("overheat", value("temp", 90)).await.unwrap();
        assert_eq!(state.current_status, RuleStatus::Warning);
        clock.advance(Duration::from_millis(10));
    }

    clock.advance(Duration::from_millis(100));
    let state = engine.execute_rule("overheat", value("temp", 90)).await.unwrap();
    assert_eq!(state.current_status, RuleStatus::Alarm);
    assert_eq!(state.condition_count, 4);

    // A false evaluation resets the debounce
    let state = engine.execute_rule("overheat", value("temp", 20)).await.unwrap();
    assert_eq!(state.current_status, RuleStatus::Normal);
    assert_eq!(state.condition_count, 0);
    assert!(state.condition_start.is_none());

    let state = engine.execute_rule("overheat", value("temp", 90)).await.unwrap();
    assert_eq!(state.current_status, RuleStatus::Warning);
    assert_eq!(state.condition_count, 1);
}

#[tokio::test]
async fn test_restart_restores_debounce_state() {
    let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
    let clock = clock();

    let first = EdgeComputeEngine::builder()
        .store(Arc::clone(&store))
        .clock(clock.clone())
        .build()
        .unwrap();
    first.load_rules(vec![state_rule()]);
    first.execute_rule("overheat", value("temp", 90)).await.unwrap();
    clock.advance(Duration::from_millis(10));
    let before = first.execute_rule("overheat", value("temp", 90)).await.unwrap();
    drop(first);

    let second = EdgeComputeEngine::builder()
        .store(Arc::clone(&store))
        .clock(clock.clone())
        .build()
        .unwrap();
    second.load_rules(vec![state_rule()]);
    second.start().await.unwrap();

    let restored = second.get_rule_state("overheat").unwrap();
    assert_eq!(restored.condition_count, 2);
    assert_eq!(restored.condition_start, before.condition_start);
    assert_eq!(restored.current_status, RuleStatus::Warning);

    // Third hit plus elapsed duration completes the debounce
    clock.advance(Duration::from_millis(200));
    let state = second.execute_rule("overheat", value("temp", 90)).await.unwrap();
    assert_eq!(state.current_status, RuleStatus::Alarm);

    second.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_persisted_state_matches_memory_under_parallel_workers() {
    const VALUES: u64 = 200;

    let store = Arc::new(MemoryKvStore::new());
    let engine = EdgeComputeEngine::builder()
        .config(EngineConfig {
            worker_count: 10,
            ..Default::default()
        })
        .store(store.clone())
        .build()
        .unwrap();
    // Count never reached: every hit only advances the debounce counter
    engine.load_rules(vec![rule(json!({
        "id": "counter",
        "type": "state",
        "sources": [{"alias": "t", "channel_id": "c1", "device_id": "d1", "point_id": "temp"}],
        "condition": "t > 80",
        "state": {"count": 100000}
    }))]);
    engine.start().await.unwrap();

    for _ in 0..VALUES {
        engine.handle_value(value("temp", 90));
    }
    wait_until(|| engine.get_metrics().rules_executed == VALUES).await;
    engine.stop().await.unwrap();

    let in_memory = engine.get_rule_state("counter").unwrap();
    assert_eq!(in_memory.condition_count as u64, VALUES);

    let persisted: RuleRuntimeState = store.get("rule_states", "counter").await.unwrap().unwrap();
    assert_eq!(persisted.condition_count, in_memory.condition_count);
    assert_eq!(persisted.condition_start, in_memory.condition_start);
    assert_eq!(persisted.current_status, RuleStatus::Warning);
}

#[tokio::test]
async fn test_calculation_with_bit_access() {
    let engine = EdgeComputeEngine::builder().build().unwrap();
    engine.load_rules(vec![rule(json!({
        "id": "bits",
        "type": "calculation",
        "sources": [{"alias": "v", "channel_id": "c1", "device_id": "d1", "point_id": "status"}],
        "expression": "v.4 * 10 + v.5"
    }))]);

    // 18 = 0b10010: bit 3 clear, bit 4 set
    let state = engine.execute_rule("bits", value("status", 18)).await.unwrap();
    assert_eq!(state.last_value.to_f64(), Some(1.0));

    let state = engine.execute_rule("bits", value("status", 9)).await.unwrap();
    assert_eq!(state.last_value.to_f64(), Some(10.0));
}

#[tokio::test]
async fn test_missing_source_fails_closed() {
    let engine = EdgeComputeEngine::builder().build().unwrap();
    engine.load_rules(vec![rule(json!({
        "id": "pair",
        "sources": [
            {"alias": "a", "channel_id": "c1", "device_id": "d1", "point_id": "p1"},
            {"alias": "b", "channel_id": "c1", "device_id": "d1", "point_id": "p2"}
        ],
        "condition": "a > 1 && b < 100"
    }))]);

    let state = engine.execute_rule("pair", value("p1", 5)).await.unwrap();
    assert_eq!(state.current_status, RuleStatus::Normal);

    // Once b has been observed the cached value is used
    engine.handle_value(value("p2", 50));
    let state = engine.execute_rule("pair", value("p1", 5)).await.unwrap();
    assert_eq!(state.current_status, RuleStatus::Alarm);
}
