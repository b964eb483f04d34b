//! Rule model and runtime record types
//!
//! Core types for rule configuration and runtime bookkeeping:
//! - Rule: configuration unit with sources, condition/expression and actions
//! - RuleAction: typed action union decoded once at load time
//! - RuleRuntimeState: per-rule status, counters and debounce bookkeeping
//! - FailedAction / RuleMinuteSnapshot: persisted retry and audit records

use crate::duration::{parse_duration, serde_duration_opt};
use chrono::{DateTime, Utc};
use edge_calc::{ExprEnv, NumericValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

// ============================================================================
// Storage buckets
// ============================================================================

pub const RULE_STATES_BUCKET: &str = "rule_states";
pub const RULE_WINDOWS_BUCKET: &str = "rule_windows";
pub const MINUTE_LOG_BUCKET: &str = "rule_minute_log";
pub const FAILED_ACTIONS_BUCKET: &str = "failed_actions";
pub const DEFAULT_EVENTS_BUCKET: &str = "rule_events";

// ============================================================================
// Telemetry
// ============================================================================

/// A single collected point value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointValue {
    pub channel_id: String,
    pub device_id: String,
    pub point_id: String,
    #[serde(default)]
    pub value: NumericValue,
    #[serde(default)]
    pub quality: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl PointValue {
    pub fn new(
        channel_id: impl Into<String>,
        device_id: impl Into<String>,
        point_id: impl Into<String>,
        value: impl Into<NumericValue>,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            device_id: device_id.into(),
            point_id: point_id.into(),
            value: value.into(),
            quality: "Good".to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Index key `channel/device/point`
    pub fn key(&self) -> String {
        point_key(&self.channel_id, &self.device_id, &self.point_id)
    }
}

/// Build the `channel/device/point` key used by the cache and source index
pub fn point_key(channel_id: &str, device_id: &str, point_id: &str) -> String {
    format!("{}/{}/{}", channel_id, device_id, point_id)
}

// ============================================================================
// Rule configuration
// ============================================================================

/// Rule - a configured unit of streaming evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Unique identifier
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(rename = "type", default)]
    pub rule_type: RuleType,

    /// Whether the rule is enabled
    #[serde(default = "default_enabled")]
    pub enable: bool,

    /// Execution priority (higher = earlier)
    #[serde(default)]
    pub priority: i32,

    /// Minimum time between two evaluations
    #[serde(
        default,
        with = "serde_duration_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub check_interval: Option<Duration>,

    #[serde(default)]
    pub trigger_mode: TriggerMode,

    /// Single-source form kept for older rule files; `sources` wins when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<RuleSource>,

    #[serde(default)]
    pub sources: Vec<RuleSource>,

    /// Boolean expression
    #[serde(default)]
    pub condition: String,

    /// Value expression (calculation rules)
    #[serde(default)]
    pub expression: String,

    #[serde(default)]
    pub actions: Vec<RuleAction>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<WindowConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<StateConfig>,
}

fn default_enabled() -> bool {
    true
}

impl Rule {
    /// Sources the rule is indexed under
    pub fn effective_sources(&self) -> Vec<&RuleSource> {
        if !self.sources.is_empty() {
            return self.sources.iter().collect();
        }
        self.source
            .iter()
            .filter(|s| !s.channel_id.is_empty() || !s.point_id.is_empty())
            .collect()
    }
}

/// Point consumed by a rule
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSource {
    /// Variable name inside expressions
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub channel_id: String,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub point_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub point_name: String,
}

impl RuleSource {
    pub fn key(&self) -> String {
        point_key(&self.channel_id, &self.device_id, &self.point_id)
    }

    /// Direct comparison against a value; empty fields match anything
    pub fn matches(&self, value: &PointValue) -> bool {
        (self.channel_id.is_empty() || self.channel_id == value.channel_id)
            && (self.device_id.is_empty() || self.device_id == value.device_id)
            && (self.point_id.is_empty() || self.point_id == value.point_id)
    }
}

/// Rule semantics
///
/// Unrecognized type names are preserved and evaluated like a threshold rule
/// when a condition is present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RuleType {
    #[default]
    Threshold,
    Calculation,
    Window,
    State,
    Unknown(String),
}

impl From<String> for RuleType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "threshold" | "" => RuleType::Threshold,
            "calculation" => RuleType::Calculation,
            "window" => RuleType::Window,
            "state" => RuleType::State,
            _ => RuleType::Unknown(s),
        }
    }
}

impl From<RuleType> for String {
    fn from(t: RuleType) -> Self {
        t.to_string()
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleType::Threshold => write!(f, "threshold"),
            RuleType::Calculation => write!(f, "calculation"),
            RuleType::Window => write!(f, "window"),
            RuleType::State => write!(f, "state"),
            RuleType::Unknown(s) => write!(f, "{}", s),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    OnChange,
    #[default]
    #[serde(other)]
    Always,
}

// ============================================================================
// Window / state configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowConfig {
    /// sliding or tumbling (informational)
    #[serde(rename = "type", default)]
    pub window_type: String,

    pub size: WindowSize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,

    #[serde(default)]
    pub aggr_func: AggrFunc,
}

/// Retention policy of a window
///
/// Written as a duration string (`"10s"`) or an entry count (`"100"` or `100`).
/// A count is read from the leading digits (`"5x"` is 5); no digits or a
/// zero count falls back to 10 entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "StringOrNumber", into = "String")]
pub enum WindowSize {
    Time(Duration),
    Count(usize),
}

pub const DEFAULT_WINDOW_COUNT: usize = 10;

impl WindowSize {
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        if let Some(d) = parse_duration(s).filter(|d| !d.is_zero()) {
            return WindowSize::Time(d);
        }
        let digits = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
        match s[..digits].parse::<usize>() {
            Ok(n) if n > 0 => WindowSize::Count(n),
            _ => WindowSize::Count(DEFAULT_WINDOW_COUNT),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrNumber {
    Number(u64),
    String(String),
}

impl From<StringOrNumber> for WindowSize {
    fn from(raw: StringOrNumber) -> Self {
        match raw {
            StringOrNumber::Number(0) => WindowSize::Count(DEFAULT_WINDOW_COUNT),
            StringOrNumber::Number(n) => WindowSize::Count(n as usize),
            StringOrNumber::String(s) => WindowSize::parse(&s),
        }
    }
}

impl From<WindowSize> for String {
    fn from(size: WindowSize) -> Self {
        match size {
            WindowSize::Time(d) => crate::duration::format_duration(d),
            WindowSize::Count(n) => n.to_string(),
        }
    }
}

/// Window aggregate function
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggrFunc {
    Sum,
    #[default]
    Avg,
    Max,
    Min,
    Count,
    Rate,
}

/// Debounce constraints; either may be omitted
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(
        default,
        with = "serde_duration_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub duration: Option<Duration>,

    #[serde(default)]
    pub count: u32,
}

// ============================================================================
// Actions
// ============================================================================

/// One rule action
///
/// Wire form is `{type, config}`; the config map is decoded into an
/// [`ActionKind`] variant when the rule is loaded, so unknown types and
/// malformed configs are rejected up front.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawAction", into = "RawAction")]
pub struct RuleAction {
    /// Frequency limit: skip when this action ran less than `interval` ago
    pub interval: Option<Duration>,
    pub kind: ActionKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActionKind {
    Log {
        level: LogLevel,
        message: Option<String>,
    },
    Database {
        bucket: String,
    },
    Mqtt {
        topic: String,
        client_id: Option<String>,
        mqtt_config_id: Option<String>,
        send_strategy: SendStrategy,
        message: Option<String>,
    },
    Http {
        url: String,
        method: String,
        body: Option<String>,
        http_config_id: Option<String>,
        send_strategy: SendStrategy,
    },
    DeviceControl {
        targets: Vec<DeviceTarget>,
        /// Legacy single-target form: missing ids are an error, not a skip
        single: bool,
    },
    Sequence {
        steps: Vec<RuleAction>,
    },
    Delay {
        duration: Duration,
    },
    Check {
        channel_id: String,
        device_id: String,
        point_id: String,
        expression: String,
        retry: u32,
        poll_interval: Duration,
        timeout: Option<Duration>,
        on_fail: Vec<RuleAction>,
    },
}

impl RuleAction {
    pub fn new(kind: ActionKind) -> Self {
        Self {
            interval: None,
            kind,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn type_name(&self) -> &'static str {
        match self.kind {
            ActionKind::Log { .. } => "log",
            ActionKind::Database { .. } => "database",
            ActionKind::Mqtt { .. } => "mqtt",
            ActionKind::Http { .. } => "http",
            ActionKind::DeviceControl { .. } => "device_control",
            ActionKind::Sequence { .. } => "sequence",
            ActionKind::Delay { .. } => "delay",
            ActionKind::Check { .. } => "check",
        }
    }

    /// Only idempotent-safe actions are queued for retry
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            ActionKind::Mqtt { .. } | ActionKind::DeviceControl { .. }
        )
    }
}

/// Write target of a device_control action
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceTarget {
    #[serde(default)]
    pub channel_id: String,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub point_id: String,
    /// Literal value or `${var}` template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<NumericValue>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub expression: String,
}

impl DeviceTarget {
    pub fn is_complete(&self) -> bool {
        !self.channel_id.is_empty() && !self.device_id.is_empty() && !self.point_id.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendStrategy {
    Batch,
    #[default]
    #[serde(other)]
    Single,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Warn,
    Error,
    #[default]
    #[serde(other)]
    Info,
}

// ----------------------------------------------------------------------------
// Wire form
// ----------------------------------------------------------------------------

type ConfigMap = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawAction {
    #[serde(rename = "type")]
    action_type: String,
    #[serde(default)]
    config: ConfigMap,
}

#[derive(Deserialize)]
struct LogConfig {
    #[serde(default)]
    level: LogLevel,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct DatabaseConfig {
    #[serde(default)]
    bucket: Option<String>,
}

#[derive(Deserialize)]
struct MqttConfig {
    #[serde(default)]
    topic: String,
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    mqtt_config_id: Option<String>,
    #[serde(default)]
    send_strategy: SendStrategy,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct HttpConfig {
    #[serde(default)]
    url: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    http_config_id: Option<String>,
    #[serde(default)]
    send_strategy: SendStrategy,
}

#[derive(Deserialize)]
struct DeviceControlConfig {
    #[serde(default)]
    targets: Option<Vec<DeviceTarget>>,
    #[serde(flatten)]
    single: DeviceTarget,
}

#[derive(Deserialize)]
struct SequenceConfig {
    #[serde(default)]
    steps: Vec<RuleAction>,
}

#[derive(Deserialize)]
struct DelayConfig {
    #[serde(with = "crate::duration::serde_duration")]
    duration: Duration,
}

#[derive(Deserialize)]
struct CheckConfig {
    #[serde(default)]
    channel_id: String,
    #[serde(default)]
    device_id: String,
    #[serde(default)]
    point_id: String,
    #[serde(default)]
    expression: String,
    #[serde(default)]
    retry: Option<f64>,
    #[serde(default, with = "serde_duration_opt")]
    interval: Option<Duration>,
    #[serde(default, with = "serde_duration_opt")]
    timeout: Option<Duration>,
    #[serde(default)]
    on_fail: Vec<RuleAction>,
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.filter(|s| !s.is_empty())
}

fn decode<T: serde::de::DeserializeOwned>(action_type: &str, config: ConfigMap) -> Result<T, String> {
    serde_json::from_value(serde_json::Value::Object(config))
        .map_err(|e| format!("invalid {} action config: {}", action_type, e))
}

impl TryFrom<RawAction> for RuleAction {
    type Error = String;

    fn try_from(raw: RawAction) -> Result<Self, Self::Error> {
        let RawAction {
            action_type,
            config,
        } = raw;
        let t = action_type.as_str();

        // For check actions `interval` is the polling period, not a throttle
        let interval = if t == "check" {
            None
        } else {
            match config.get("interval") {
                Some(serde_json::Value::String(s)) if !s.is_empty() => Some(
                    parse_duration(s)
                        .ok_or_else(|| format!("invalid action interval '{}'", s))?,
                ),
                _ => None,
            }
        };

        let kind = match t {
            "log" => {
                let c: LogConfig = decode(t, config)?;
                ActionKind::Log {
                    level: c.level,
                    message: non_empty(c.message),
                }
            },
            "database" => {
                let c: DatabaseConfig = decode(t, config)?;
                ActionKind::Database {
                    bucket: non_empty(c.bucket)
                        .unwrap_or_else(|| DEFAULT_EVENTS_BUCKET.to_string()),
                }
            },
            "mqtt" => {
                let c: MqttConfig = decode(t, config)?;
                ActionKind::Mqtt {
                    topic: c.topic,
                    client_id: non_empty(c.client_id),
                    mqtt_config_id: non_empty(c.mqtt_config_id),
                    send_strategy: c.send_strategy,
                    message: non_empty(c.message),
                }
            },
            "http" => {
                let c: HttpConfig = decode(t, config)?;
                ActionKind::Http {
                    url: c.url,
                    method: non_empty(c.method)
                        .map(|m| m.to_uppercase())
                        .unwrap_or_else(|| "POST".to_string()),
                    body: non_empty(c.body),
                    http_config_id: non_empty(c.http_config_id),
                    send_strategy: c.send_strategy,
                }
            },
            "device_control" => {
                let c: DeviceControlConfig = decode(t, config)?;
                match c.targets {
                    Some(targets) if !targets.is_empty() => ActionKind::DeviceControl {
                        targets,
                        single: false,
                    },
                    _ => ActionKind::DeviceControl {
                        targets: vec![c.single],
                        single: true,
                    },
                }
            },
            "sequence" => {
                let c: SequenceConfig = decode(t, config)?;
                ActionKind::Sequence { steps: c.steps }
            },
            "delay" => {
                let c: DelayConfig = decode(t, config)?;
                ActionKind::Delay {
                    duration: c.duration,
                }
            },
            "check" => {
                let c: CheckConfig = decode(t, config)?;
                ActionKind::Check {
                    channel_id: c.channel_id,
                    device_id: c.device_id,
                    point_id: c.point_id,
                    expression: c.expression,
                    retry: c.retry.map(|r| r.max(1.0) as u32).unwrap_or(1),
                    poll_interval: c.interval.unwrap_or(Duration::from_secs(1)),
                    timeout: c.timeout.filter(|d| !d.is_zero()),
                    on_fail: c.on_fail,
                }
            },
            other => return Err(format!("unknown action type '{}'", other)),
        };

        Ok(RuleAction { interval, kind })
    }
}

impl From<RuleAction> for RawAction {
    fn from(action: RuleAction) -> Self {
        use serde_json::json;

        let action_type = action.type_name().to_string();
        let value = match action.kind {
            ActionKind::Log { level, message } => json!({ "level": level, "message": message }),
            ActionKind::Database { bucket } => json!({ "bucket": bucket }),
            ActionKind::Mqtt {
                topic,
                client_id,
                mqtt_config_id,
                send_strategy,
                message,
            } => json!({
                "topic": topic,
                "client_id": client_id,
                "mqtt_config_id": mqtt_config_id,
                "send_strategy": send_strategy,
                "message": message,
            }),
            ActionKind::Http {
                url,
                method,
                body,
                http_config_id,
                send_strategy,
            } => json!({
                "url": url,
                "method": method,
                "body": body,
                "http_config_id": http_config_id,
                "send_strategy": send_strategy,
            }),
            ActionKind::DeviceControl { targets, single } => {
                if single {
                    targets.into_iter().next().map(|t| json!(t)).unwrap_or_else(|| json!({}))
                } else {
                    json!({ "targets": targets })
                }
            },
            ActionKind::Sequence { steps } => json!({ "steps": steps }),
            ActionKind::Delay { duration } => {
                json!({ "duration": crate::duration::format_duration(duration) })
            },
            ActionKind::Check {
                channel_id,
                device_id,
                point_id,
                expression,
                retry,
                poll_interval,
                timeout,
                on_fail,
            } => json!({
                "channel_id": channel_id,
                "device_id": device_id,
                "point_id": point_id,
                "expression": expression,
                "retry": retry,
                "interval": crate::duration::format_duration(poll_interval),
                "timeout": timeout.map(crate::duration::format_duration),
                "on_fail": on_fail,
            }),
        };

        let mut config = match value {
            serde_json::Value::Object(map) => map,
            _ => ConfigMap::new(),
        };
        config.retain(|_, v| !v.is_null());
        if let Some(interval) = action.interval {
            config.insert(
                "interval".to_string(),
                serde_json::Value::String(crate::duration::format_duration(interval)),
            );
        }

        RawAction {
            action_type,
            config,
        }
    }
}

// ============================================================================
// Runtime state
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RuleStatus {
    #[default]
    Normal,
    Warning,
    Alarm,
}

impl fmt::Display for RuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleStatus::Normal => write!(f, "NORMAL"),
            RuleStatus::Warning => write!(f, "WARNING"),
            RuleStatus::Alarm => write!(f, "ALARM"),
        }
    }
}

/// Runtime status of a rule, persisted after every mutation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleRuntimeState {
    pub rule_id: String,
    #[serde(default)]
    pub rule_name: String,
    #[serde(default)]
    pub enable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_check_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_trigger: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_value: NumericValue,
    #[serde(default)]
    pub trigger_count: u64,
    #[serde(default)]
    pub current_status: RuleStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub condition_count: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_message: String,
    /// Last run per action index, for the action `interval` throttle
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub action_last_runs: BTreeMap<usize, DateTime<Utc>>,
}

impl RuleRuntimeState {
    pub fn new(rule: &Rule) -> Self {
        Self {
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            enable: rule.enable,
            ..Default::default()
        }
    }
}

/// Failed retryable action awaiting re-execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedAction {
    /// Time-ordered, lexicographically sortable
    pub id: String,
    pub rule_id: String,
    pub action: RuleAction,
    pub value: PointValue,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_error: String,
    #[serde(default)]
    pub env: ExprEnv,
}

/// Per-rule per-minute audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleMinuteSnapshot {
    pub rule_id: String,
    #[serde(default)]
    pub rule_name: String,
    /// `YYYY-MM-DD HH:mm` (UTC)
    pub minute: String,
    pub status: RuleStatus,
    pub trigger_count: u64,
    #[serde(default)]
    pub last_value: NumericValue,
    #[serde(default)]
    pub last_trigger: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_message: String,
    pub updated_at: DateTime<Utc>,
}

/// Point consumed by more than one rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SharedSourceInfo {
    pub source_id: String,
    pub subscribers: Vec<String>,
    pub subscriber_count: usize,
}
