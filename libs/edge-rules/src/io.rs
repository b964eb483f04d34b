//! Collaborator interfaces
//!
//! Field-protocol drivers, northbound publishers and rule-config storage live
//! outside this crate. The engine reaches them only through these traits.

use crate::types::{PointValue, Rule};
use async_trait::async_trait;
use bytes::Bytes;
use edge_calc::NumericValue;

/// Southbound point writes (device_control and check actions)
#[async_trait]
pub trait DeviceWriter: Send + Sync + 'static {
    async fn write_point(
        &self,
        channel_id: &str,
        device_id: &str,
        point_id: &str,
        value: NumericValue,
    ) -> anyhow::Result<()>;

    /// Current value of a point; used by read-modify-write and check actions
    async fn read_point(
        &self,
        channel_id: &str,
        device_id: &str,
        point_id: &str,
    ) -> anyhow::Result<PointValue> {
        anyhow::bail!(
            "read not supported for {}/{}/{}",
            channel_id,
            device_id,
            point_id
        )
    }
}

/// Northbound publishing (mqtt and http actions)
#[async_trait]
pub trait Publisher: Send + Sync + 'static {
    /// Publish to a topic; `target` is a client or config ID, `None` means any
    async fn publish(&self, target: Option<&str>, topic: &str, payload: Bytes)
        -> anyhow::Result<()>;

    /// Send through a configured HTTP endpoint
    async fn publish_http(&self, config_id: &str, payload: Bytes) -> anyhow::Result<()> {
        let _ = payload;
        anyhow::bail!("no http endpoint configured for '{}'", config_id)
    }
}

/// Durable rule configuration
#[async_trait]
pub trait RulePersister: Send + Sync + 'static {
    async fn save_rules(&self, rules: &[Rule]) -> anyhow::Result<()>;
}

/// Telemetry subscription callback
pub trait TelemetryHandler: Send + Sync {
    fn on_value(&self, value: PointValue);
}
