//! Failed action queue
//!
//! Retryable actions (mqtt, device_control) that fail are persisted under
//! [`FAILED_ACTIONS_BUCKET`] and replayed periodically. An entry is removed on
//! success or once its retry count exceeds the configured maximum.

use crate::clock::Clock;
use crate::error::Result;
use crate::executor::ActionExecutor;
use crate::types::{FailedAction, PointValue, RuleAction, FAILED_ACTIONS_BUCKET};
use edge_calc::ExprEnv;
use edge_store::{KvStore, KvStoreExt};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of one retry pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetryReport {
    pub succeeded: usize,
    pub retried: usize,
    pub dropped: usize,
}

pub struct FailedActionQueue {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    max_retries: u32,
    seq: AtomicU64,
}

impl FailedActionQueue {
    pub fn new(store: Arc<dyn KvStore>, clock: Arc<dyn Clock>, max_retries: u32) -> Self {
        Self {
            store,
            clock,
            max_retries,
            seq: AtomicU64::new(0),
        }
    }

    /// Persist a failed action; returns `false` for non-retryable actions
    pub async fn record(
        &self,
        rule_id: &str,
        action: &RuleAction,
        value: &PointValue,
        env: &ExprEnv,
        error: &str,
    ) -> Result<bool> {
        if !action.is_retryable() {
            return Ok(false);
        }

        let now = self.clock.now();
        let nanos = now.timestamp_nanos_opt().unwrap_or_default();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) % 1_000_000;
        let id = format!("{:020}-{:06}", nanos, seq);

        let entry = FailedAction {
            id: id.clone(),
            rule_id: rule_id.to_string(),
            action: action.clone(),
            value: value.clone(),
            timestamp: now,
            retry_count: 0,
            last_error: error.to_string(),
            env: env.clone(),
        };
        self.store.save(FAILED_ACTIONS_BUCKET, &id, &entry).await?;
        debug!(rule_id, id = %id, action = action.type_name(), "Queued failed action for retry");
        Ok(true)
    }

    /// Pending entries, oldest first
    pub async fn list(&self) -> Result<Vec<FailedAction>> {
        Ok(self
            .store
            .load_all_as::<FailedAction>(FAILED_ACTIONS_BUCKET)
            .await?
            .into_iter()
            .map(|(_, entry)| entry)
            .collect())
    }

    /// Replay every pending entry once
    pub async fn process(
        &self,
        executor: &ActionExecutor,
        cancel: &CancellationToken,
    ) -> Result<RetryReport> {
        let mut report = RetryReport::default();

        for mut entry in self.list().await? {
            if cancel.is_cancelled() {
                break;
            }

            match executor
                .execute(&entry.rule_id, &entry.action, &entry.value, &entry.env, cancel)
                .await
            {
                Ok(()) => {
                    self.store.delete(FAILED_ACTIONS_BUCKET, &entry.id).await?;
                    report.succeeded += 1;
                    info!(rule_id = %entry.rule_id, id = %entry.id, "Retried action succeeded");
                },
                Err(e) => {
                    entry.retry_count += 1;
                    entry.last_error = e.to_string();
                    if entry.retry_count > self.max_retries {
                        self.store.delete(FAILED_ACTIONS_BUCKET, &entry.id).await?;
                        report.dropped += 1;
                        warn!(
                            rule_id = %entry.rule_id,
                            id = %entry.id,
                            retries = entry.retry_count,
                            error = %e,
                            "Dropping failed action after max retries"
                        );
                    } else {
                        self.store
                            .save(FAILED_ACTIONS_BUCKET, &entry.id, &entry)
                            .await?;
                        report.retried += 1;
                    }
                },
            }
        }

        Ok(report)
    }

    /// Periodic retry loop; the first pass runs one period after start
    pub async fn run(
        self: Arc<Self>,
        executor: Arc<ActionExecutor>,
        period: Duration,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.process(&executor, &shutdown).await {
                        Ok(report) if report != RetryReport::default() => {
                            debug!(?report, "Retry pass complete");
                        },
                        Ok(_) => {},
                        Err(e) => warn!(error = %e, "Retry pass failed"),
                    }
                }
            }
        }

        debug!("Retry loop stopped");
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::types::ActionKind;
    use edge_calc::ExprEngine;
    use edge_store::MemoryKvStore;

    fn setup(max_retries: u32) -> (FailedActionQueue, ActionExecutor, Arc<MemoryKvStore>) {
        let store = Arc::new(MemoryKvStore::new());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let queue = FailedActionQueue::new(store.clone(), Arc::clone(&clock), max_retries);
        // No publisher: every mqtt replay fails
        let executor = ActionExecutor::new(
            Arc::new(ExprEngine::new().unwrap()),
            store.clone(),
            None,
            None,
            clock,
        )
        .unwrap();
        (queue, executor, store)
    }

    fn mqtt() -> RuleAction {
        serde_json::from_value(serde_json::json!({"type": "mqtt", "config": {"topic": "t"}}))
            .unwrap()
    }

    #[tokio::test]
    async fn test_only_retryable_actions_recorded() {
        let (queue, _, _) = setup(10);
        let value = PointValue::new("c1", "d1", "p1", 1);
        let env = ExprEnv::new();

        let log = RuleAction::new(ActionKind::Log {
            level: Default::default(),
            message: None,
        });
        assert!(!queue.record("r1", &log, &value, &env, "boom").await.unwrap());
        assert!(queue.record("r1", &mqtt(), &value, &env, "boom").await.unwrap());
        assert!(queue.record("r1", &mqtt(), &value, &env, "boom").await.unwrap());

        let pending = queue.list().await.unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending[0].id < pending[1].id);
        assert_eq!(pending[0].last_error, "boom");
    }

    #[tokio::test]
    async fn test_retry_then_drop() {
        let (queue, executor, store) = setup(1);
        let value = PointValue::new("c1", "d1", "p1", 1);
        queue
            .record("r1", &mqtt(), &value, &ExprEnv::new(), "boom")
            .await
            .unwrap();
        let cancel = CancellationToken::new();

        let first = queue.process(&executor, &cancel).await.unwrap();
        assert_eq!(first.retried, 1);
        let pending = queue.list().await.unwrap();
        assert_eq!(pending[0].retry_count, 1);
        assert!(pending[0].last_error.contains("publisher"));

        let second = queue.process(&executor, &cancel).await.unwrap();
        assert_eq!(second.dropped, 1);
        assert!(store.is_empty(FAILED_ACTIONS_BUCKET));
    }
}
