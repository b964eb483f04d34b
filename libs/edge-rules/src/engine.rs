//! Edge Compute Engine
//!
//! Owns the rule lookup structures, the two bounded work queues and the
//! background tasks:
//!
//! - `worker_count` rule workers draining the rule queue
//! - `action_workers` action workers draining the action queue
//! - the failed-action retry loop
//! - the minute snapshot flush loop
//!
//! [`EdgeComputeEngine::handle_value`] is synchronous and never blocks; a
//! full queue drops the task and bumps the matching counter.

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::{Result, RuleError};
use crate::evaluator::RuleEvaluator;
use crate::executor::ActionExecutor;
use crate::index::{RuleStore, SourceIndex, ValueCache};
use crate::io::{DeviceWriter, Publisher, RulePersister, TelemetryHandler};
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::retry::{FailedActionQueue, RetryReport};
use crate::snapshot::{query_snapshots, MinuteSnapshotRecorder};
use crate::state::{Evaluation, RuleStateStore};
use crate::types::{
    ActionKind, FailedAction, PointValue, Rule, RuleAction, RuleMinuteSnapshot,
    RuleRuntimeState, SharedSourceInfo, RULE_STATES_BUCKET, RULE_WINDOWS_BUCKET,
};
use crate::window::WindowStore;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use edge_calc::{ExprEngine, ExprEnv};
use edge_store::{KvStore, KvStoreExt, MemoryKvStore};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outcome of one executed action, passed to the action hook
#[derive(Debug, Clone)]
pub struct ActionReport {
    pub rule_id: String,
    pub action_type: &'static str,
    pub value: PointValue,
    pub error: Option<String>,
}

/// Called after every action the action workers run
pub type ActionHook = Arc<dyn Fn(&ActionReport) + Send + Sync>;

struct RuleTask {
    rule_id: String,
    value: PointValue,
}

struct ActionTask {
    rule_id: String,
    action: RuleAction,
    value: PointValue,
    env: ExprEnv,
}

/// Handles of a running engine
struct Runtime {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`EdgeComputeEngine`]
///
/// Every collaborator is optional. Without a store the engine keeps its state
/// in memory only; without a writer or publisher the matching actions fail.
#[derive(Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn KvStore>>,
    device_writer: Option<Arc<dyn DeviceWriter>>,
    publisher: Option<Arc<dyn Publisher>>,
    rule_persister: Option<Arc<dyn RulePersister>>,
    clock: Option<Arc<dyn Clock>>,
    action_hook: Option<ActionHook>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn device_writer(mut self, writer: Arc<dyn DeviceWriter>) -> Self {
        self.device_writer = Some(writer);
        self
    }

    pub fn publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn rule_persister(mut self, persister: Arc<dyn RulePersister>) -> Self {
        self.rule_persister = Some(persister);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn action_hook(mut self, hook: ActionHook) -> Self {
        self.action_hook = Some(hook);
        self
    }

    pub fn build(self) -> Result<EdgeComputeEngine> {
        let config = self.config.normalized();
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryKvStore::new()) as Arc<dyn KvStore>);
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);

        let expr = Arc::new(ExprEngine::new()?);
        let cache = Arc::new(ValueCache::new());
        let windows = Arc::new(WindowStore::new());
        let evaluator = RuleEvaluator::new(Arc::clone(&expr), Arc::clone(&cache), Arc::clone(&windows));
        let executor = Arc::new(ActionExecutor::new(
            expr,
            Arc::clone(&store),
            self.device_writer,
            self.publisher,
            Arc::clone(&clock),
        )?);
        let retry_queue = Arc::new(FailedActionQueue::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            config.max_retries,
        ));

        let (rule_tx, rule_rx) = mpsc::channel(config.queue_capacity);
        let (action_tx, action_rx) = mpsc::channel(config.action_queue_capacity);

        Ok(EdgeComputeEngine {
            inner: Arc::new(EngineInner {
                config,
                store,
                persister: self.rule_persister,
                clock,
                rules: RuleStore::new(),
                index: SourceIndex::new(),
                cache,
                states: RuleStateStore::new(),
                windows,
                evaluator,
                executor,
                retry_queue,
                snapshots: Arc::new(MinuteSnapshotRecorder::new()),
                metrics: EngineMetrics::default(),
                persist_locks: DashMap::new(),
                rule_tx,
                rule_rx: Arc::new(AsyncMutex::new(rule_rx)),
                action_tx,
                action_rx: Arc::new(AsyncMutex::new(action_rx)),
                action_hook: self.action_hook,
                running: AtomicBool::new(false),
                runtime: Mutex::new(None),
            }),
        })
    }
}

// ============================================================================
// Engine
// ============================================================================

struct EngineInner {
    config: EngineConfig,
    store: Arc<dyn KvStore>,
    persister: Option<Arc<dyn RulePersister>>,
    clock: Arc<dyn Clock>,

    rules: RuleStore,
    index: SourceIndex,
    cache: Arc<ValueCache>,
    states: RuleStateStore,
    windows: Arc<WindowStore>,

    evaluator: RuleEvaluator,
    executor: Arc<ActionExecutor>,
    retry_queue: Arc<FailedActionQueue>,
    snapshots: Arc<MinuteSnapshotRecorder>,
    metrics: EngineMetrics,
    /// Serializes state and window saves per rule
    persist_locks: DashMap<String, Arc<AsyncMutex<()>>>,

    rule_tx: mpsc::Sender<RuleTask>,
    rule_rx: Arc<AsyncMutex<mpsc::Receiver<RuleTask>>>,
    action_tx: mpsc::Sender<ActionTask>,
    action_rx: Arc<AsyncMutex<mpsc::Receiver<ActionTask>>>,
    action_hook: Option<ActionHook>,

    running: AtomicBool,
    runtime: Mutex<Option<Runtime>>,
}

/// Rule engine for edge telemetry
pub struct EdgeComputeEngine {
    inner: Arc<EngineInner>,
}

impl EdgeComputeEngine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Restore persisted state and spawn the workers and background loops
    pub async fn start(&self) -> Result<()> {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RuleError::EngineError("engine already running".to_string()));
        }

        self.inner.restore_state().await;

        let shutdown = CancellationToken::new();
        let mut handles = Vec::new();

        for worker_id in 0..self.inner.config.worker_count {
            let inner = Arc::clone(&self.inner);
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                inner.rule_worker(worker_id, shutdown).await
            }));
        }

        for worker_id in 0..self.inner.config.action_workers {
            let inner = Arc::clone(&self.inner);
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                inner.action_worker(worker_id, shutdown).await
            }));
        }

        handles.push(tokio::spawn(Arc::clone(&self.inner.retry_queue).run(
            Arc::clone(&self.inner.executor),
            self.inner.config.retry_interval(),
            shutdown.clone(),
        )));

        {
            let snapshots = Arc::clone(&self.inner.snapshots);
            let store = Arc::clone(&self.inner.store);
            let interval = self.inner.config.snapshot_flush_interval();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                snapshots.flush_loop(store, interval, shutdown).await
            }));
        }

        *self.inner.runtime.lock() = Some(Runtime { shutdown, handles });

        info!(
            workers = self.inner.config.worker_count,
            action_workers = self.inner.config.action_workers,
            rules = self.inner.rules.len(),
            "Edge compute engine started"
        );
        Ok(())
    }

    /// Cancel all loops, join them and flush pending snapshots
    pub async fn stop(&self) -> Result<()> {
        let runtime = self.inner.runtime.lock().take();
        let Some(runtime) = runtime else {
            return Ok(());
        };

        runtime.shutdown.cancel();
        for handle in runtime.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Engine task terminated abnormally");
            }
        }

        // The flush loop flushed on cancellation; this catches records made
        // by workers that finished after it
        self.inner.snapshots.flush(self.inner.store.as_ref()).await?;
        self.inner.running.store(false, Ordering::Release);

        info!("Edge compute engine stopped");
        Ok(())
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Dispatch a telemetry value to the rules consuming its point
    pub fn handle_value(&self, value: PointValue) {
        let inner = &self.inner;
        inner.cache.update(&value);

        let rule_ids = inner.index.lookup(&value.key());
        if rule_ids.is_empty() {
            return;
        }

        let now = inner.clock.now();
        let mut matched: Vec<Arc<Rule>> = inner
            .rules
            .get_many(&rule_ids)
            .into_iter()
            .filter(|rule| rule.enable && inner.states.check_due(rule, now))
            .collect();
        // Stable: equal priorities keep index order
        matched.sort_by(|a, b| b.priority.cmp(&a.priority));

        for rule in matched {
            EngineMetrics::inc(&inner.metrics.rules_triggered);
            let task = RuleTask {
                rule_id: rule.id.clone(),
                value: value.clone(),
            };
            match inner.rule_tx.try_send(task) {
                Ok(()) => {},
                Err(TrySendError::Full(task)) => {
                    EngineMetrics::inc(&inner.metrics.rules_dropped);
                    warn!(rule_id = %task.rule_id, "Rule queue full, dropping evaluation");
                },
                Err(TrySendError::Closed(task)) => {
                    error!(rule_id = %task.rule_id, "Rule queue closed");
                },
            }
        }
    }

    /// Evaluate a rule immediately, bypassing the rule queue
    ///
    /// Actions still go through the action queue.
    pub async fn execute_rule(&self, rule_id: &str, value: PointValue) -> Result<RuleRuntimeState> {
        let rule = self
            .inner
            .rules
            .get(rule_id)
            .ok_or_else(|| RuleError::NotFound(rule_id.to_string()))?;
        Ok(self.inner.process_rule(&rule, &value).await)
    }

    // ========================================================================
    // Rule management
    // ========================================================================

    /// Merge rules into the store and rebuild the source index
    pub fn load_rules(&self, rules: Vec<Rule>) {
        let count = self.inner.rules.extend(rules);
        let all = self.inner.rules.all();
        self.inner.index.rebuild(all.iter().map(|r| r.as_ref()));
        info!(loaded = count, total = all.len(), "Loaded edge computing rules");
    }

    /// Insert or replace a rule and persist the rule set
    pub async fn upsert_rule(&self, rule: Rule) -> Result<()> {
        if rule.id.trim().is_empty() {
            return Err(RuleError::invalid("rule id is required"));
        }

        let rule_id = rule.id.clone();
        if self.inner.rules.upsert(rule.clone()).is_some() {
            self.inner.index.remove_rule(&rule_id);
        }
        self.inner.index.add_rule(&rule);
        debug!(rule_id = %rule_id, "Rule upserted");

        self.inner.persist_rules().await
    }

    /// Remove a rule with its runtime state and window history
    pub async fn delete_rule(&self, rule_id: &str) -> Result<()> {
        if self.inner.rules.remove(rule_id).is_none() {
            return Err(RuleError::NotFound(rule_id.to_string()));
        }
        self.inner.index.remove_rule(rule_id);
        self.inner.states.remove(rule_id);
        self.inner.windows.remove(rule_id);

        let lock = self.inner.persist_lock(rule_id);
        {
            let _guard = lock.lock().await;
            let store = self.inner.store.as_ref();
            for bucket in [RULE_STATES_BUCKET, RULE_WINDOWS_BUCKET] {
                if let Err(e) = store.delete(bucket, rule_id).await {
                    warn!(rule_id, bucket, error = %e, "Failed to delete persisted rule data");
                }
            }
        }
        self.inner.persist_locks.remove(rule_id);
        debug!(rule_id, "Rule deleted");

        self.inner.persist_rules().await
    }

    /// All rules sorted by ID
    pub fn get_rules(&self) -> Vec<Rule> {
        self.inner
            .rules
            .all()
            .iter()
            .map(|r| r.as_ref().clone())
            .collect()
    }

    pub fn get_rule(&self, rule_id: &str) -> Option<Rule> {
        self.inner.rules.get(rule_id).map(|r| r.as_ref().clone())
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn get_rule_states(&self) -> BTreeMap<String, RuleRuntimeState> {
        self.inner.states.snapshot_all().into_iter().collect()
    }

    pub fn get_rule_state(&self, rule_id: &str) -> Option<RuleRuntimeState> {
        self.inner.states.get(rule_id)
    }

    /// Copy of a rule's retained window; empty when unknown
    pub fn get_window_data(&self, rule_id: &str) -> Vec<PointValue> {
        self.inner.windows.get(rule_id)
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        let inner = &self.inner;
        let capacity = inner.config.queue_capacity;
        let queued = capacity.saturating_sub(inner.rule_tx.capacity());

        MetricsSnapshot {
            worker_pool_size: inner.config.worker_count,
            queued,
            worker_pool_usage: queued as f64 / capacity as f64,
            rule_count: inner.rules.len(),
            shared_source_count: inner.index.shared_sources().len(),
            cache_size: inner.cache.len(),
            snapshots_pending: inner.snapshots.pending_len(),
            snapshots_flushed: inner.snapshots.records_flushed(),
            snapshot_flush_errors: inner.snapshots.flush_errors(),
            ..MetricsSnapshot::from_counters(&inner.metrics)
        }
    }

    pub fn get_shared_sources(&self) -> Vec<SharedSourceInfo> {
        self.inner.index.shared_sources()
    }

    pub fn get_cached_value(&self, key: &str) -> Option<PointValue> {
        self.inner.cache.get(key)
    }

    pub async fn get_failed_actions(&self) -> Result<Vec<FailedAction>> {
        self.inner.retry_queue.list().await
    }

    /// Run one retry pass now instead of waiting for the retry loop
    pub async fn process_failed_actions(&self) -> Result<RetryReport> {
        let cancel = self.inner.shutdown_token();
        self.inner
            .retry_queue
            .process(&self.inner.executor, &cancel)
            .await
    }

    /// Minute snapshots in `[start, end]`, optionally for one rule
    ///
    /// Pending snapshots are flushed first so the result includes the
    /// current minute.
    pub async fn query_logs(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        rule_id: Option<&str>,
    ) -> Result<Vec<RuleMinuteSnapshot>> {
        self.inner.snapshots.flush(self.inner.store.as_ref()).await?;
        query_snapshots(self.inner.store.as_ref(), start, end, rule_id).await
    }
}

impl TelemetryHandler for EdgeComputeEngine {
    fn on_value(&self, value: PointValue) {
        self.handle_value(value);
    }
}

impl Drop for EdgeComputeEngine {
    fn drop(&mut self) {
        if let Some(runtime) = self.inner.runtime.lock().take() {
            runtime.shutdown.cancel();
        }
    }
}

// ============================================================================
// Workers
// ============================================================================

impl EngineInner {
    fn shutdown_token(&self) -> CancellationToken {
        self.runtime
            .lock()
            .as_ref()
            .map(|rt| rt.shutdown.clone())
            .unwrap_or_else(CancellationToken::new)
    }

    async fn restore_state(&self) {
        match self
            .store
            .load_all_as::<RuleRuntimeState>(RULE_STATES_BUCKET)
            .await
        {
            Ok(entries) => {
                let restored = self.states.restore(entries.into_iter().map(|(_, s)| s));
                debug!(restored, "Rule states restored");
            },
            Err(e) => warn!(error = %e, "Failed to restore rule states"),
        }

        match self
            .store
            .load_all_as::<Vec<PointValue>>(RULE_WINDOWS_BUCKET)
            .await
        {
            Ok(entries) => {
                let restored = self.windows.restore(entries);
                debug!(restored, "Rule windows restored");
            },
            Err(e) => warn!(error = %e, "Failed to restore rule windows"),
        }
    }

    async fn persist_rules(&self) -> Result<()> {
        let Some(persister) = &self.persister else {
            return Ok(());
        };
        let rules: Vec<Rule> = self.rules.all().iter().map(|r| r.as_ref().clone()).collect();
        persister.save_rules(&rules).await?;
        Ok(())
    }

    async fn rule_worker(&self, worker_id: usize, shutdown: CancellationToken) {
        debug!(worker_id, "Rule worker started");
        loop {
            let task = {
                let mut rx = self.rule_rx.lock().await;
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => None,
                    task = rx.recv() => task,
                }
            };
            let Some(task) = task else {
                break;
            };

            // The rule may have been deleted while queued
            if let Some(rule) = self.rules.get(&task.rule_id) {
                self.process_rule(&rule, &task.value).await;
            }
            EngineMetrics::inc(&self.metrics.rules_executed);
        }
        debug!(worker_id, "Rule worker stopped");
    }

    async fn action_worker(&self, worker_id: usize, shutdown: CancellationToken) {
        debug!(worker_id, "Action worker started");
        loop {
            let task = {
                let mut rx = self.action_rx.lock().await;
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => None,
                    task = rx.recv() => task,
                }
            };
            let Some(task) = task else {
                break;
            };
            self.run_action(task, &shutdown).await;
        }
        debug!(worker_id, "Action worker stopped");
    }

    /// Evaluate, update state, persist and enqueue actions
    async fn process_rule(&self, rule: &Rule, value: &PointValue) -> RuleRuntimeState {
        let now = self.clock.now();
        let outcome = self.evaluator.evaluate(rule, value);
        let transition = self.states.apply(rule, &outcome.evaluation, now);

        if let Evaluation::Failed(message) = &outcome.evaluation {
            warn!(rule_id = %rule.id, rule_name = %rule.name, error = %message, "Rule evaluation error");
        }

        self.snapshots.record(&transition.state, now);

        let mut state = transition.state;
        if transition.fire_actions {
            info!(rule_id = %rule.id, rule_name = %rule.name, value = %outcome.output.value, "Rule triggered");
            if self.enqueue_actions(rule, &outcome.output, &outcome.env, now) {
                if let Some(updated) = self.states.get(&rule.id) {
                    state = updated;
                }
            }
        }

        self.persist_rule_data(&rule.id, outcome.window_updated).await;
        state
    }

    fn persist_lock(&self, rule_id: &str) -> Arc<AsyncMutex<()>> {
        Arc::clone(&self.persist_locks.entry(rule_id.to_string()).or_default())
    }

    /// Save the rule's current in-memory state (and window)
    ///
    /// Workers can evaluate the same rule concurrently. Reading the state
    /// under the per-rule lock means the last save always carries the newest
    /// state, whichever evaluation produced it.
    async fn persist_rule_data(&self, rule_id: &str, window_updated: bool) {
        let lock = self.persist_lock(rule_id);
        let _guard = lock.lock().await;

        if window_updated {
            let window = self.windows.get(rule_id);
            if let Err(e) = self.store.save(RULE_WINDOWS_BUCKET, rule_id, &window).await {
                warn!(rule_id, error = %e, "Failed to persist rule window");
            }
        }

        // Deleted while this evaluation ran
        let Some(state) = self.states.get(rule_id) else {
            return;
        };
        if let Err(e) = self.store.save(RULE_STATES_BUCKET, rule_id, &state).await {
            warn!(rule_id, error = %e, "Failed to persist rule state");
        }
    }

    /// Queue the rule's actions; returns true when an action throttle was claimed
    fn enqueue_actions(
        &self,
        rule: &Rule,
        output: &PointValue,
        env: &ExprEnv,
        now: DateTime<Utc>,
    ) -> bool {
        let mut claimed = false;

        for (index, action) in rule.actions.iter().enumerate() {
            // For check actions the interval is the polling period
            let throttle = match action.kind {
                ActionKind::Check { .. } => None,
                _ => action.interval.filter(|d| !d.is_zero()),
            };
            if let Some(interval) = throttle {
                if !self.states.claim_action(&rule.id, index, interval, now) {
                    debug!(rule_id = %rule.id, index, "Action skipped by frequency limit");
                    continue;
                }
                claimed = true;
            }

            let task = ActionTask {
                rule_id: rule.id.clone(),
                action: action.clone(),
                value: output.clone(),
                env: env.clone(),
            };
            match self.action_tx.try_send(task) {
                Ok(()) => {},
                Err(TrySendError::Full(task)) | Err(TrySendError::Closed(task)) => {
                    EngineMetrics::inc(&self.metrics.actions_dropped);
                    warn!(
                        rule_id = %task.rule_id,
                        action = task.action.type_name(),
                        "Action queue unavailable, dropping action"
                    );
                },
            }
        }

        claimed
    }

    async fn run_action(&self, task: ActionTask, shutdown: &CancellationToken) {
        let timeout = self.config.action_timeout();
        let result = match tokio::time::timeout(
            timeout,
            self.executor
                .execute(&task.rule_id, &task.action, &task.value, &task.env, shutdown),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(RuleError::action(format!(
                "timed out after {}",
                crate::duration::format_duration(timeout)
            ))),
        };

        EngineMetrics::inc(&self.metrics.actions_executed);
        let error = match result {
            Ok(()) => None,
            Err(e) => {
                EngineMetrics::inc(&self.metrics.actions_failed);
                error!(
                    rule_id = %task.rule_id,
                    action = task.action.type_name(),
                    error = %e,
                    "Action failed"
                );
                let message = e.to_string();
                if let Err(e) = self
                    .retry_queue
                    .record(&task.rule_id, &task.action, &task.value, &task.env, &message)
                    .await
                {
                    warn!(rule_id = %task.rule_id, error = %e, "Failed to queue action for retry");
                }
                Some(message)
            },
        };

        if let Some(hook) = &self.action_hook {
            hook(&ActionReport {
                rule_id: task.rule_id,
                action_type: task.action.type_name(),
                value: task.value,
                error,
            });
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rule(id: &str, priority: i32) -> Rule {
        serde_json::from_value(json!({
            "id": id,
            "priority": priority,
            "sources": [{"alias": "v", "channel_id": "c1", "device_id": "d1", "point_id": "p1"}],
            "condition": "v > 10"
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_dispatch_orders_by_priority() {
        let engine = EdgeComputeEngine::builder().build().unwrap();
        engine.load_rules(vec![rule("low", 5), rule("high", 10), rule("mid", 5)]);

        engine.handle_value(PointValue::new("c1", "d1", "p1", 11));

        let mut rx = engine.inner.rule_rx.lock().await;
        let order: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|t| t.rule_id)
            .collect();
        assert_eq!(order, vec!["high", "low", "mid"]);
    }

    #[tokio::test]
    async fn test_disabled_rules_and_unknown_keys_ignored() {
        let engine = EdgeComputeEngine::builder().build().unwrap();
        let mut disabled = rule("off", 1);
        disabled.enable = false;
        engine.load_rules(vec![disabled, rule("on", 1)]);

        engine.handle_value(PointValue::new("c1", "d1", "other", 11));
        engine.handle_value(PointValue::new("c1", "d1", "p1", 11));

        let metrics = engine.get_metrics();
        assert_eq!(metrics.rules_triggered, 1);
        assert_eq!(metrics.queued, 1);
        assert_eq!(metrics.cache_size, 2);
    }

    #[tokio::test]
    async fn test_metrics_report_snapshot_flushes() {
        let engine = EdgeComputeEngine::builder().build().unwrap();
        engine.load_rules(vec![rule("r1", 1)]);

        engine
            .execute_rule("r1", PointValue::new("c1", "d1", "p1", 11))
            .await
            .unwrap();
        let metrics = engine.get_metrics();
        assert_eq!(metrics.snapshots_pending, 1);
        assert_eq!(metrics.snapshots_flushed, 0);

        let now = Utc::now();
        let logs = engine
            .query_logs(now - chrono::Duration::minutes(1), now, Some("r1"))
            .await
            .unwrap();
        assert_eq!(logs.len(), 1);

        let metrics = engine.get_metrics();
        assert_eq!(metrics.snapshots_pending, 0);
        assert_eq!(metrics.snapshots_flushed, 1);
        assert_eq!(metrics.snapshot_flush_errors, 0);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let engine = EdgeComputeEngine::builder().build().unwrap();
        engine.start().await.unwrap();
        assert!(engine.start().await.is_err());
        engine.stop().await.unwrap();
        assert!(!engine.is_running());
        engine.stop().await.unwrap();
    }
}
