//! Engine counters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub rules_triggered: AtomicU64,
    pub rules_executed: AtomicU64,
    /// Dispatches rejected by a full rule queue
    pub rules_dropped: AtomicU64,
    pub actions_executed: AtomicU64,
    /// Actions rejected by a full action queue
    pub actions_dropped: AtomicU64,
    pub actions_failed: AtomicU64,
}

impl EngineMetrics {
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time view returned by `get_metrics`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub rules_triggered: u64,
    pub rules_executed: u64,
    pub rules_dropped: u64,
    pub actions_executed: u64,
    pub actions_dropped: u64,
    pub actions_failed: u64,
    pub worker_pool_size: usize,
    /// Rule evaluations currently queued
    pub queued: usize,
    /// `queued / queue capacity`
    pub worker_pool_usage: f64,
    pub rule_count: usize,
    pub shared_source_count: usize,
    pub cache_size: usize,
    /// Minute snapshots waiting for the next flush
    pub snapshots_pending: usize,
    pub snapshots_flushed: u64,
    pub snapshot_flush_errors: u64,
}

impl MetricsSnapshot {
    pub fn from_counters(metrics: &EngineMetrics) -> Self {
        Self {
            rules_triggered: metrics.rules_triggered.load(Ordering::Relaxed),
            rules_executed: metrics.rules_executed.load(Ordering::Relaxed),
            rules_dropped: metrics.rules_dropped.load(Ordering::Relaxed),
            actions_executed: metrics.actions_executed.load(Ordering::Relaxed),
            actions_dropped: metrics.actions_dropped.load(Ordering::Relaxed),
            actions_failed: metrics.actions_failed.load(Ordering::Relaxed),
            ..Default::default()
        }
    }
}
