//! Engine tuning parameters

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Worker pools, queues and background loop periods
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Rule evaluation workers
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Capacity of the rule task queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_action_workers")]
    pub action_workers: usize,

    #[serde(default = "default_action_queue_capacity")]
    pub action_queue_capacity: usize,

    /// Per-action execution timeout
    #[serde(default = "default_action_timeout_ms")]
    pub action_timeout_ms: u64,

    /// Failed-action retry period
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,

    /// Entries are dropped once retry_count exceeds this
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Minute snapshot flush period
    #[serde(default = "default_snapshot_flush_ms")]
    pub snapshot_flush_ms: u64,
}

// Default value functions
fn default_worker_count() -> usize {
    10
}

fn default_queue_capacity() -> usize {
    1000
}

fn default_action_workers() -> usize {
    4
}

fn default_action_queue_capacity() -> usize {
    1000
}

fn default_action_timeout_ms() -> u64 {
    10_000
}

fn default_retry_interval_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    10
}

fn default_snapshot_flush_ms() -> u64 {
    1000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            queue_capacity: default_queue_capacity(),
            action_workers: default_action_workers(),
            action_queue_capacity: default_action_queue_capacity(),
            action_timeout_ms: default_action_timeout_ms(),
            retry_interval_secs: default_retry_interval_secs(),
            max_retries: default_max_retries(),
            snapshot_flush_ms: default_snapshot_flush_ms(),
        }
    }
}

impl EngineConfig {
    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs.max(1))
    }

    pub fn snapshot_flush_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_flush_ms.max(10))
    }

    /// Clamp zero sizes that would leave the engine without workers or queue slots
    pub fn normalized(mut self) -> Self {
        self.worker_count = self.worker_count.max(1);
        self.queue_capacity = self.queue_capacity.max(1);
        self.action_workers = self.action_workers.max(1);
        self.action_queue_capacity = self.action_queue_capacity.max(1);
        self
    }
}
