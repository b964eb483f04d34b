//! Shared fixtures for edge-rules integration tests

#![allow(clippy::disallowed_methods)] // Test helpers - unwrap is acceptable
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use edge_rules::{
    ActionHook, ActionReport, DeviceWriter, NumericValue, PointValue, Publisher, Rule,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Device writer backed by an in-memory point table
#[derive(Default)]
pub struct RecordingWriter {
    pub writes: Mutex<Vec<(String, NumericValue)>>,
    pub points: Mutex<HashMap<String, NumericValue>>,
    /// Point keys whose writes fail
    pub failing: Mutex<Vec<String>>,
}

impl RecordingWriter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_point(&self, key: &str, value: impl Into<NumericValue>) {
        self.points.lock().insert(key.to_string(), value.into());
    }

    pub fn fail_on(&self, key: &str) {
        self.failing.lock().push(key.to_string());
    }

    pub fn writes(&self) -> Vec<(String, NumericValue)> {
        self.writes.lock().clone()
    }
}

#[async_trait]
impl DeviceWriter for RecordingWriter {
    async fn write_point(
        &self,
        channel_id: &str,
        device_id: &str,
        point_id: &str,
        value: NumericValue,
    ) -> anyhow::Result<()> {
        let key = format!("{}/{}/{}", channel_id, device_id, point_id);
        if self.failing.lock().contains(&key) {
            anyhow::bail!("device offline: {}", key);
        }
        self.points.lock().insert(key.clone(), value.clone());
        self.writes.lock().push((key, value));
        Ok(())
    }

    async fn read_point(
        &self,
        channel_id: &str,
        device_id: &str,
        point_id: &str,
    ) -> anyhow::Result<PointValue> {
        let key = format!("{}/{}/{}", channel_id, device_id, point_id);
        match self.points.lock().get(&key) {
            Some(v) => Ok(PointValue::new(channel_id, device_id, point_id, v.clone())),
            None => anyhow::bail!("no value for {}", key),
        }
    }
}

/// Publisher that records every message; can be switched to fail
#[derive(Default)]
pub struct RecordingPublisher {
    pub messages: Mutex<Vec<(Option<String>, String, Bytes)>>,
    pub fail: Mutex<bool>,
}

impl RecordingPublisher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock() = fail;
    }

    pub fn messages(&self) -> Vec<(Option<String>, String, Bytes)> {
        self.messages.lock().clone()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, target: Option<&str>, topic: &str, payload: Bytes) -> anyhow::Result<()> {
        if *self.fail.lock() {
            anyhow::bail!("broker unavailable");
        }
        self.messages
            .lock()
            .push((target.map(str::to_string), topic.to_string(), payload));
        Ok(())
    }
}

/// Action hook forwarding reports to a channel
pub fn action_channel() -> (ActionHook, mpsc::UnboundedReceiver<ActionReport>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let hook: ActionHook = Arc::new(move |report: &ActionReport| {
        let _ = tx.send(report.clone());
    });
    (hook, rx)
}

/// Next action report, failing the test after five seconds
pub async fn next_report(rx: &mut mpsc::UnboundedReceiver<ActionReport>) -> ActionReport {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for action")
        .expect("action channel closed")
}

/// Poll until `check` holds, failing the test after five seconds
pub async fn wait_until(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn rule(value: serde_json::Value) -> Rule {
    serde_json::from_value(value).unwrap()
}

pub fn value(point_id: &str, v: impl Into<NumericValue>) -> PointValue {
    PointValue::new("c1", "d1", point_id, v)
}
