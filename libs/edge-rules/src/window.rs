//! Window store and aggregation
//!
//! Retention runs on every push:
//! - `WindowSize::Time(d)`: keep entries with `ts >= trigger_ts - d`
//! - `WindowSize::Count(n)`: keep the last `n` entries

use crate::types::{AggrFunc, PointValue, WindowConfig, WindowSize};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

/// Per-rule retained value history
#[derive(Debug, Default)]
pub struct WindowStore {
    windows: Mutex<FxHashMap<String, Vec<PointValue>>>,
}

impl WindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value, apply retention and return the retained window
    pub fn push(&self, rule_id: &str, config: &WindowConfig, value: &PointValue) -> Vec<PointValue> {
        let mut windows = self.windows.lock();
        let history = windows.entry(rule_id.to_string()).or_default();
        history.push(value.clone());

        match config.size {
            WindowSize::Time(size) => {
                // Sizes beyond chrono's range retain everything
                if let Ok(size) = chrono::Duration::from_std(size) {
                    let cutoff = value.timestamp - size;
                    history.retain(|v| v.timestamp >= cutoff);
                }
            },
            WindowSize::Count(count) => {
                if history.len() > count {
                    let excess = history.len() - count;
                    history.drain(..excess);
                }
            },
        }

        history.clone()
    }

    pub fn get(&self, rule_id: &str) -> Vec<PointValue> {
        self.windows.lock().get(rule_id).cloned().unwrap_or_default()
    }

    pub fn remove(&self, rule_id: &str) {
        self.windows.lock().remove(rule_id);
    }

    pub fn restore(&self, restored: impl IntoIterator<Item = (String, Vec<PointValue>)>) -> usize {
        let mut windows = self.windows.lock();
        let mut count = 0;
        for (rule_id, values) in restored {
            windows.insert(rule_id, values);
            count += 1;
        }
        count
    }
}

/// Aggregate a window; entries without a numeric value are ignored
///
/// An empty numeric set aggregates to 0. `rate` is
/// `(last - first) / elapsed_seconds`, or 0 with fewer than two samples or no
/// elapsed time.
pub fn aggregate(func: AggrFunc, values: &[PointValue]) -> f64 {
    let samples: Vec<(f64, &PointValue)> = values
        .iter()
        .filter_map(|v| v.value.to_f64().map(|f| (f, v)))
        .collect();

    if samples.is_empty() {
        return 0.0;
    }

    match func {
        AggrFunc::Sum => samples.iter().map(|(f, _)| f).sum(),
        AggrFunc::Avg => samples.iter().map(|(f, _)| f).sum::<f64>() / samples.len() as f64,
        AggrFunc::Max => samples
            .iter()
            .map(|(f, _)| *f)
            .fold(f64::NEG_INFINITY, f64::max),
        AggrFunc::Min => samples.iter().map(|(f, _)| *f).fold(f64::INFINITY, f64::min),
        AggrFunc::Count => samples.len() as f64,
        AggrFunc::Rate => {
            if samples.len() < 2 {
                return 0.0;
            }
            let (first, first_pv) = samples[0];
            let (last, last_pv) = samples[samples.len() - 1];
            let elapsed = (last_pv.timestamp - first_pv.timestamp)
                .num_microseconds()
                .map(|us| us as f64 / 1e6)
                .unwrap_or(0.0);
            if elapsed > 0.0 {
                (last - first) / elapsed
            } else {
                0.0
            }
        },
    }
}
