//! Rule runtime state store
//!
//! Holds the status state machine:
//!
//! ```text
//!   condition false ──────────────► NORMAL   (debounce reset)
//!   condition true, debouncing ───► WARNING
//!   condition true, debounced ────► ALARM    (trigger_count++, actions)
//!   evaluation error ─────────────► unchanged, error_message set
//! ```

use crate::clock::elapsed_between;
use crate::types::{Rule, RuleRuntimeState, RuleStatus, TriggerMode};
use chrono::{DateTime, Utc};
use edge_calc::NumericValue;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::time::Duration;

/// Result of one rule evaluation, fed into the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    /// Condition held; carries the output value
    Triggered(NumericValue),
    NotTriggered,
    Failed(String),
}

/// State after applying an evaluation
#[derive(Debug, Clone)]
pub struct Transition {
    pub state: RuleRuntimeState,
    /// Reached ALARM on this evaluation
    pub triggered: bool,
    /// Actions should run (respects `on_change`)
    pub fire_actions: bool,
}

#[derive(Debug, Default)]
pub struct RuleStateStore {
    states: Mutex<FxHashMap<String, RuleRuntimeState>>,
}

impl RuleStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an evaluation to the rule's state, creating it on first use
    pub fn apply(&self, rule: &Rule, evaluation: &Evaluation, now: DateTime<Utc>) -> Transition {
        let mut states = self.states.lock();
        let state = states
            .entry(rule.id.clone())
            .or_insert_with(|| RuleRuntimeState::new(rule));

        state.rule_name.clone_from(&rule.name);
        state.enable = rule.enable;
        state.last_check_time = Some(now);

        let mut triggered = false;
        let mut fire_actions = false;

        match evaluation {
            Evaluation::Failed(message) => {
                state.error_message.clone_from(message);
            },
            Evaluation::NotTriggered => {
                state.error_message.clear();
                state.condition_start = None;
                state.condition_count = 0;
                state.current_status = RuleStatus::Normal;
            },
            Evaluation::Triggered(output) => {
                state.error_message.clear();
                let start = *state.condition_start.get_or_insert(now);
                state.condition_count = state.condition_count.saturating_add(1);

                if debounce_met(rule, start, state.condition_count, now) {
                    let was_alarm = state.current_status == RuleStatus::Alarm;
                    state.current_status = RuleStatus::Alarm;
                    state.last_trigger = Some(now);
                    state.trigger_count += 1;
                    state.last_value = output.clone();

                    triggered = true;
                    fire_actions = !(rule.trigger_mode == TriggerMode::OnChange && was_alarm);
                } else {
                    state.current_status = RuleStatus::Warning;
                }
            },
        }

        Transition {
            state: state.clone(),
            triggered,
            fire_actions,
        }
    }

    /// Whether an evaluation is due under the rule's `check_interval`
    pub fn check_due(&self, rule: &Rule, now: DateTime<Utc>) -> bool {
        let Some(interval) = rule.check_interval.filter(|d| !d.is_zero()) else {
            return true;
        };
        match self.states.lock().get(&rule.id).and_then(|s| s.last_check_time) {
            Some(last) => elapsed_between(last, now) >= interval,
            None => true,
        }
    }

    /// Reserve a run of action `index` under its frequency limit
    ///
    /// Returns false when the action ran less than `interval` ago.
    pub fn claim_action(
        &self,
        rule_id: &str,
        index: usize,
        interval: Duration,
        now: DateTime<Utc>,
    ) -> bool {
        let mut states = self.states.lock();
        let Some(state) = states.get_mut(rule_id) else {
            return true;
        };
        if let Some(last) = state.action_last_runs.get(&index) {
            if elapsed_between(*last, now) < interval {
                return false;
            }
        }
        state.action_last_runs.insert(index, now);
        true
    }

    pub fn get(&self, rule_id: &str) -> Option<RuleRuntimeState> {
        self.states.lock().get(rule_id).cloned()
    }

    pub fn snapshot_all(&self) -> FxHashMap<String, RuleRuntimeState> {
        self.states.lock().clone()
    }

    pub fn remove(&self, rule_id: &str) -> Option<RuleRuntimeState> {
        self.states.lock().remove(rule_id)
    }

    /// Load persisted states, replacing any in-memory entry with the same ID
    pub fn restore(&self, restored: impl IntoIterator<Item = RuleRuntimeState>) -> usize {
        let mut states = self.states.lock();
        let mut count = 0;
        for state in restored {
            if state.rule_id.is_empty() {
                continue;
            }
            states.insert(state.rule_id.clone(), state);
            count += 1;
        }
        count
    }

    pub fn len(&self) -> usize {
        self.states.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.lock().is_empty()
    }
}

/// Debounce constraints apply only when a `state` block is configured
fn debounce_met(rule: &Rule, start: DateTime<Utc>, count: u32, now: DateTime<Utc>) -> bool {
    let Some(cfg) = &rule.state else {
        return true;
    };
    if let Some(duration) = cfg.duration.filter(|d| !d.is_zero()) {
        if elapsed_between(start, now) < duration {
            return false;
        }
    }
    cfg.count == 0 || count >= cfg.count
}
