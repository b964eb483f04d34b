//! edge-rules - Edge-compute rule engine
//!
//! Evaluates rules against live telemetry and runs their actions.
//!
//! # Architecture
//!
//! ```text
//!  PointValue ──► handle_value ──► ValueCache
//!                      │
//!                      ▼  exact key lookup (SourceIndex), priority sort
//!               [rule queue] ──► rule workers ──► RuleEvaluator
//!                                                    │
//!                     ┌──────────────────────────────┼─────────────────────┐
//!                     ▼                              ▼                     ▼
//!              RuleStateStore                   WindowStore     MinuteSnapshotRecorder
//!                     │                              │                     │
//!                     └──────────────► KvStore ◄─────┴─────────────────────┘
//!                                                    ▲
//!               [action queue] ──► action workers ──►│ ActionExecutor
//!                                         │
//!                                         ▼ mqtt / device_control failures
//!                                  FailedActionQueue ──► retry loop
//! ```
//!
//! # Rule types
//!
//! - **threshold**: boolean condition
//! - **calculation**: expression result becomes the output value
//! - **window**: aggregate over a time or count window, then condition
//! - **state**: condition debounced by duration and/or hit count
//!
//! # Example
//!
//! ```ignore
//! use edge_rules::{EdgeComputeEngine, PointValue};
//!
//! let engine = EdgeComputeEngine::builder().build()?;
//! engine.load_rules(rules);
//! engine.start().await?;
//! engine.handle_value(PointValue::new("ch1", "dev1", "temp", 42.0));
//! ```

pub mod clock;
pub mod config;
pub mod duration;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod index;
pub mod io;
pub mod metrics;
pub mod retry;
pub mod snapshot;
pub mod state;
pub mod types;
pub mod window;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use engine::{ActionHook, ActionReport, EdgeComputeEngine, EngineBuilder};
pub use error::{Result, RuleError};
pub use io::{DeviceWriter, Publisher, RulePersister, TelemetryHandler};
pub use metrics::MetricsSnapshot;
pub use retry::RetryReport;
pub use types::{
    ActionKind, AggrFunc, DeviceTarget, FailedAction, LogLevel, PointValue, Rule, RuleAction,
    RuleMinuteSnapshot, RuleRuntimeState, RuleSource, RuleStatus, RuleType, SendStrategy,
    SharedSourceInfo, StateConfig, TriggerMode, WindowConfig, WindowSize,
};

pub use edge_calc::{ExprEnv, NumericValue};
