//! Dry-run collaborators
//!
//! Field drivers and northbound clients are not wired into this service.
//! Writes and publishes are logged and kept in a point table so that
//! read-modify-write and check actions see the values written before.

use async_trait::async_trait;
use bytes::Bytes;
use edge_rules::{DeviceWriter, NumericValue, PointValue, Publisher};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::info;

#[derive(Default)]
pub struct DryRunSink {
    points: Mutex<HashMap<String, NumericValue>>,
}

impl DryRunSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an observed telemetry value so later reads return it
    pub fn observe(&self, value: &PointValue) {
        if let Ok(mut points) = self.points.lock() {
            points.insert(value.key(), value.value.clone());
        }
    }
}

#[async_trait]
impl DeviceWriter for DryRunSink {
    async fn write_point(
        &self,
        channel_id: &str,
        device_id: &str,
        point_id: &str,
        value: NumericValue,
    ) -> anyhow::Result<()> {
        let key = edge_rules::types::point_key(channel_id, device_id, point_id);
        info!(target: "edgesrv::dry_run", point = %key, value = %value, "write_point");
        self.points
            .lock()
            .map_err(|_| anyhow::anyhow!("point table lock poisoned"))?
            .insert(key, value);
        Ok(())
    }

    async fn read_point(
        &self,
        channel_id: &str,
        device_id: &str,
        point_id: &str,
    ) -> anyhow::Result<PointValue> {
        let key = edge_rules::types::point_key(channel_id, device_id, point_id);
        let value = self
            .points
            .lock()
            .map_err(|_| anyhow::anyhow!("point table lock poisoned"))?
            .get(&key)
            .cloned();
        match value {
            Some(v) => Ok(PointValue::new(channel_id, device_id, point_id, v)),
            None => anyhow::bail!("no value known for {}", key),
        }
    }
}

#[async_trait]
impl Publisher for DryRunSink {
    async fn publish(&self, target: Option<&str>, topic: &str, payload: Bytes) -> anyhow::Result<()> {
        info!(
            target: "edgesrv::dry_run",
            client = target.unwrap_or("-"),
            topic,
            payload = %String::from_utf8_lossy(&payload),
            "publish"
        );
        Ok(())
    }

    async fn publish_http(&self, config_id: &str, payload: Bytes) -> anyhow::Result<()> {
        info!(
            target: "edgesrv::dry_run",
            config_id,
            payload = %String::from_utf8_lossy(&payload),
            "publish_http"
        );
        Ok(())
    }
}
