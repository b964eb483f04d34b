//! Minute snapshot recorder
//!
//! Coalesces rule state into one audit record per rule per minute and
//! flushes pending records to the KV store in the background.
//!
//! Key format: `{rule_id}_{YYYY-MM-DD HH:mm}` (UTC). Keys sort by rule, then
//! by minute, so a per-rule time range is a plain key range scan.

use crate::error::Result;
use crate::types::{RuleMinuteSnapshot, RuleRuntimeState, MINUTE_LOG_BUCKET};
use chrono::{DateTime, Utc};
use edge_store::{KvStore, KvStoreExt};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const MINUTE_FORMAT: &str = "%Y-%m-%d %H:%M";

/// Minute bucket of an instant
pub fn minute_of(at: DateTime<Utc>) -> String {
    at.format(MINUTE_FORMAT).to_string()
}

pub fn snapshot_key(rule_id: &str, minute: &str) -> String {
    format!("{}_{}", rule_id, minute)
}

/// Recorder counters, reported through the engine metrics
#[derive(Debug, Default)]
struct SnapshotStats {
    records_flushed: AtomicU64,
    flush_errors: AtomicU64,
}

/// Pending per-minute snapshots, last write wins
pub struct MinuteSnapshotRecorder {
    pending: Mutex<FxHashMap<String, RuleMinuteSnapshot>>,
    /// Held across drain and save so concurrent flushes cannot reorder writes
    flush_guard: AsyncMutex<()>,
    stats: SnapshotStats,
}

impl Default for MinuteSnapshotRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl MinuteSnapshotRecorder {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(FxHashMap::default()),
            flush_guard: AsyncMutex::new(()),
            stats: SnapshotStats::default(),
        }
    }

    pub fn records_flushed(&self) -> u64 {
        self.stats.records_flushed.load(Ordering::Relaxed)
    }

    pub fn flush_errors(&self) -> u64 {
        self.stats.flush_errors.load(Ordering::Relaxed)
    }

    /// Record the current state into its minute bucket (returns immediately)
    pub fn record(&self, state: &RuleRuntimeState, now: DateTime<Utc>) {
        let minute = minute_of(now);
        let key = snapshot_key(&state.rule_id, &minute);

        let snapshot = RuleMinuteSnapshot {
            rule_id: state.rule_id.clone(),
            rule_name: state.rule_name.clone(),
            minute,
            status: state.current_status,
            trigger_count: state.trigger_count,
            last_value: state.last_value.clone(),
            last_trigger: state.last_trigger,
            error_message: state.error_message.clone(),
            updated_at: now,
        };

        self.pending.lock().insert(key, snapshot);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Write all pending snapshots, returning how many were saved
    ///
    /// Records that fail to save go back to the pending set unless a newer
    /// record for the same key arrived meanwhile.
    pub async fn flush(&self, store: &dyn KvStore) -> Result<usize> {
        let _guard = self.flush_guard.lock().await;
        let drained: Vec<(String, RuleMinuteSnapshot)> = self.pending.lock().drain().collect();
        if drained.is_empty() {
            return Ok(0);
        }

        let mut saved = 0;
        let mut first_error = None;
        for (key, snapshot) in drained {
            match store.save(MINUTE_LOG_BUCKET, &key, &snapshot).await {
                Ok(()) => saved += 1,
                Err(e) => {
                    self.pending.lock().entry(key).or_insert(snapshot);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                },
            }
        }

        self.stats
            .records_flushed
            .fetch_add(saved as u64, Ordering::Relaxed);

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(saved),
        }
    }

    /// Background flush loop; performs a final flush on cancellation
    pub async fn flush_loop(
        &self,
        store: Arc<dyn KvStore>,
        interval: Duration,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    debug!("Snapshot recorder received shutdown signal");
                    if let Err(e) = self.flush(store.as_ref()).await {
                        warn!(error = %e, "Final snapshot flush failed");
                        self.stats.flush_errors.fetch_add(1, Ordering::Relaxed);
                    }
                    break;
                }
                _ = tokio::time::sleep(interval) => {}
            }

            if let Err(e) = self.flush(store.as_ref()).await {
                warn!(error = %e, "Snapshot flush failed");
                self.stats.flush_errors.fetch_add(1, Ordering::Relaxed);
            }
        }

        debug!("Snapshot flush loop stopped");
    }
}

/// Read persisted snapshots for `[start, end]` at minute granularity
///
/// With a rule ID this is a key range scan; otherwise a full scan filtered by
/// minute. Results are ordered by key.
pub async fn query_snapshots(
    store: &dyn KvStore,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    rule_id: Option<&str>,
) -> Result<Vec<RuleMinuteSnapshot>> {
    let start_minute = minute_of(start);
    let end_minute = minute_of(end);

    let entries: Vec<(String, RuleMinuteSnapshot)> = match rule_id.filter(|id| !id.is_empty()) {
        Some(rule_id) => {
            let min_key = snapshot_key(rule_id, &start_minute);
            let max_key = snapshot_key(rule_id, &end_minute);
            store
                .load_range_as::<RuleMinuteSnapshot>(MINUTE_LOG_BUCKET, &min_key, &max_key)
                .await?
                .into_iter()
                .filter(|(_, snap)| snap.rule_id == rule_id)
                .collect()
        },
        None => store
            .load_all_as::<RuleMinuteSnapshot>(MINUTE_LOG_BUCKET)
            .await?
            .into_iter()
            .filter(|(_, snap)| snap.minute >= start_minute && snap.minute <= end_minute)
            .collect(),
    };

    Ok(entries.into_iter().map(|(_, snap)| snap).collect())
}
