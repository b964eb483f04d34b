//! Action Executor Module
//!
//! Runs typed rule actions against the device writer, publisher, KV store and
//! inline HTTP endpoints. Workflow actions (sequence, check with rollback)
//! recurse back into [`ActionExecutor::execute`].
//!
//! Device control values resolve in this order:
//! 1. `expression`, evaluated with `v` bound to the triggering value.
//!    Bare `bitget(v, N)`, `bitset(N, value)` and `bitset(N, M)` forms do a
//!    read-modify-write of a single bit of the current point value.
//! 2. literal `value`, with `${var}` templates resolved from the environment
//! 3. the raw triggering value

use crate::clock::Clock;
use crate::error::{Result, RuleError};
use crate::io::{DeviceWriter, Publisher};
use crate::types::{ActionKind, DeviceTarget, LogLevel, PointValue, RuleAction, SendStrategy};
use bytes::Bytes;
use edge_calc::{ExprEngine, ExprEnv, NumericValue};
use edge_store::{KvStore, KvStoreExt};
use regex::{Captures, Regex};
use reqwest::Client as HttpClient;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// `${name}` or `$name`
const TEMPLATE_PATTERN: &str = r"\$\{([^}]*)\}|\$([A-Za-z0-9_]+)";

/// Matched against the preprocessed expression; literal promotion turns the
/// bit index into `N.0`
const BITGET_RMW_PATTERN: &str = r"^bitget\(v,\s*(\d+)(?:\.0)?\)$";
const BITSET_VALUE_PATTERN: &str = r"^bitset\((\d+),\s*value\)$";
const BITSET_CONST_PATTERN: &str = r"^bitset\((\d+),\s*(\d+)\)$";

type ActionFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// Action executor shared by the action workers and the retry loop
pub struct ActionExecutor {
    expr: Arc<ExprEngine>,
    store: Arc<dyn KvStore>,
    writer: Option<Arc<dyn DeviceWriter>>,
    publisher: Option<Arc<dyn Publisher>>,
    clock: Arc<dyn Clock>,
    http_client: HttpClient,
    template: Regex,
    bitget_rmw: Regex,
    bitset_value: Regex,
    bitset_const: Regex,
}

impl ActionExecutor {
    pub fn new(
        expr: Arc<ExprEngine>,
        store: Arc<dyn KvStore>,
        writer: Option<Arc<dyn DeviceWriter>>,
        publisher: Option<Arc<dyn Publisher>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let http_client = HttpClient::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| RuleError::EngineError(format!("Failed to create HTTP client: {}", e)))?;

        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| RuleError::EngineError(format!("Regex error: {}", e)))
        };

        Ok(Self {
            expr,
            store,
            writer,
            publisher,
            clock,
            http_client,
            template: compile(TEMPLATE_PATTERN)?,
            bitget_rmw: compile(BITGET_RMW_PATTERN)?,
            bitset_value: compile(BITSET_VALUE_PATTERN)?,
            bitset_const: compile(BITSET_CONST_PATTERN)?,
        })
    }

    /// Execute one action
    ///
    /// Boxed because sequence and check actions execute nested actions.
    pub fn execute<'a>(
        &'a self,
        rule_id: &'a str,
        action: &'a RuleAction,
        value: &'a PointValue,
        env: &'a ExprEnv,
        cancel: &'a CancellationToken,
    ) -> ActionFuture<'a> {
        Box::pin(async move {
            if cancel.is_cancelled() {
                return Err(RuleError::action("cancelled"));
            }

            match &action.kind {
                ActionKind::Log { level, message } => {
                    self.execute_log(rule_id, *level, message.as_deref());
                    Ok(())
                },
                ActionKind::Database { bucket } => {
                    self.execute_database(rule_id, bucket, value).await
                },
                ActionKind::Mqtt {
                    topic,
                    client_id,
                    mqtt_config_id,
                    send_strategy,
                    message,
                } => {
                    let publisher = self.publisher()?;
                    let payload =
                        self.build_payload(*send_strategy, message.as_deref(), value, env)?;

                    if let Some(config_id) = mqtt_config_id {
                        return Ok(publisher
                            .publish(Some(config_id), topic, payload)
                            .await?);
                    }
                    if topic.is_empty() {
                        return Ok(());
                    }
                    Ok(publisher
                        .publish(client_id.as_deref(), topic, payload)
                        .await?)
                },
                ActionKind::Http {
                    url,
                    method,
                    body,
                    http_config_id,
                    send_strategy,
                } => {
                    let payload = self.build_payload(*send_strategy, body.as_deref(), value, env)?;
                    if let Some(config_id) = http_config_id {
                        return Ok(self.publisher()?.publish_http(config_id, payload).await?);
                    }
                    if url.is_empty() {
                        return Ok(());
                    }
                    tokio::select! {
                        result = self.execute_http(url, method, payload) => result,
                        _ = cancel.cancelled() => Err(RuleError::action("cancelled")),
                    }
                },
                ActionKind::DeviceControl { targets, single } => {
                    self.execute_device_control(targets, *single, value, env).await
                },
                ActionKind::Sequence { steps } => {
                    for step in steps {
                        self.execute(rule_id, step, value, env, cancel).await?;
                    }
                    Ok(())
                },
                ActionKind::Delay { duration } => {
                    tokio::select! {
                        _ = tokio::time::sleep(*duration) => Ok(()),
                        _ = cancel.cancelled() => Err(RuleError::action("cancelled")),
                    }
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
                } => {
                    let probe = CheckProbe {
                        channel_id,
                        device_id,
                        point_id,
                        expression,
                        retry: *retry,
                        poll_interval: *poll_interval,
                        timeout: *timeout,
                    };
                    match self.run_check(&probe, env, cancel).await? {
                        None => Ok(()),
                        Some(reason) => {
                            if !on_fail.is_empty() {
                                warn!(rule_id, reason = %reason, "Check failed, executing rollback");
                                for step in on_fail {
                                    if let Err(e) =
                                        self.execute(rule_id, step, value, env, cancel).await
                                    {
                                        debug!(rule_id, error = %e, "Rollback step failed");
                                    }
                                }
                            }
                            Err(RuleError::action(format!("check failed: {}", reason)))
                        },
                    }
                },
            }
        })
    }

    fn publisher(&self) -> Result<&Arc<dyn Publisher>> {
        self.publisher
            .as_ref()
            .ok_or_else(|| RuleError::action("publisher not available"))
    }

    fn writer(&self) -> Result<&Arc<dyn DeviceWriter>> {
        self.writer
            .as_ref()
            .ok_or_else(|| RuleError::action("device writer not available"))
    }

    // ========================================================================
    // log / database / http
    // ========================================================================

    fn execute_log(&self, rule_id: &str, level: LogLevel, message: Option<&str>) {
        let default_message;
        let message = match message {
            Some(m) => m,
            None => {
                default_message = format!("Rule {} triggered", rule_id);
                &default_message
            },
        };
        match level {
            LogLevel::Info => info!(target: "edge_rules::action", rule_id, "{}", message),
            LogLevel::Warn => warn!(target: "edge_rules::action", rule_id, "{}", message),
            LogLevel::Error => error!(target: "edge_rules::action", rule_id, "{}", message),
        }
    }

    async fn execute_database(&self, rule_id: &str, bucket: &str, value: &PointValue) -> Result<()> {
        let now = self.clock.now();
        let nanos = now.timestamp_nanos_opt().unwrap_or_default();
        let key = format!("{}_{}", rule_id, nanos);

        let record = serde_json::json!({
            "rule_id": rule_id,
            "value": value,
            "time": now,
        });
        self.store.save(bucket, &key, &record).await?;
        Ok(())
    }

    async fn execute_http(&self, url: &str, method: &str, payload: Bytes) -> Result<()> {
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| RuleError::action(format!("Unsupported HTTP method: {}", method)))?;
        debug!("HTTP request: {} {}", method, url);

        let response = self
            .http_client
            .request(method.clone(), url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload)
            .send()
            .await
            .map_err(|e| RuleError::action(format!("HTTP request failed: {} {}: {}", method, url, e)))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(RuleError::action(format!(
                "HTTP request failed with status {}: {}",
                status.as_u16(),
                body
            )))
        }
    }

    /// Payload for mqtt/http actions
    ///
    /// Default is the triggering value as JSON. The batch strategy sends every
    /// environment entry except `value`, falling back to the triggering value
    /// when there is none. A non-empty template overrides both.
    fn build_payload(
        &self,
        strategy: SendStrategy,
        template: Option<&str>,
        value: &PointValue,
        env: &ExprEnv,
    ) -> Result<Bytes> {
        if let Some(template) = template {
            return Ok(Bytes::from(self.expand_template(template, env)));
        }

        let data = match strategy {
            SendStrategy::Batch => {
                let batch: ExprEnv = env
                    .iter()
                    .filter(|(k, _)| k.as_str() != "value")
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                if batch.is_empty() {
                    serde_json::to_vec(value)?
                } else {
                    serde_json::to_vec(&batch)?
                }
            },
            SendStrategy::Single => serde_json::to_vec(value)?,
        };
        Ok(Bytes::from(data))
    }

    /// Replace `${var}` and `$var` with environment values; unknown names
    /// expand to the empty string
    pub fn expand_template(&self, template: &str, env: &ExprEnv) -> String {
        self.template
            .replace_all(template, |caps: &Captures<'_>| {
                let name = caps
                    .get(1)
                    .or_else(|| caps.get(2))
                    .map(|m| m.as_str())
                    .unwrap_or_default();
                env.get(name).map(|v| v.to_string()).unwrap_or_default()
            })
            .into_owned()
    }

    /// Resolve a literal target value; only text containing `${` is a template
    fn resolve_value_template(&self, raw: &NumericValue, env: &ExprEnv) -> NumericValue {
        match raw {
            NumericValue::Text(s) if s.contains("${") => {
                let resolved = self.expand_template(s, env);
                match resolved.trim().parse::<f64>() {
                    Ok(f) => NumericValue::Float(f),
                    Err(_) => NumericValue::Text(resolved),
                }
            },
            other => other.clone(),
        }
    }

    // ========================================================================
    // device_control
    // ========================================================================

    async fn execute_device_control(
        &self,
        targets: &[DeviceTarget],
        single: bool,
        value: &PointValue,
        env: &ExprEnv,
    ) -> Result<()> {
        let writer = self.writer()?;

        if single {
            let target = targets
                .first()
                .filter(|t| t.is_complete())
                .ok_or_else(|| RuleError::action("missing channel_id, device_id or point_id"))?;
            let write_value = self.resolve_target_value(writer, target, value, env).await;
            writer
                .write_point(&target.channel_id, &target.device_id, &target.point_id, write_value)
                .await?;
            return Ok(());
        }

        let mut errors = Vec::new();
        for target in targets {
            if !target.is_complete() {
                debug!("Skipping incomplete device_control target");
                continue;
            }

            let write_value = self.resolve_target_value(writer, target, value, env).await;
            if let Err(e) = writer
                .write_point(&target.channel_id, &target.device_id, &target.point_id, write_value)
                .await
            {
                errors.push(format!(
                    "failed to write {}/{}/{}: {}",
                    target.channel_id, target.device_id, target.point_id, e
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(RuleError::action(format!(
                "batch control errors: [{}]",
                errors.join("; ")
            )))
        }
    }

    async fn resolve_target_value(
        &self,
        writer: &Arc<dyn DeviceWriter>,
        target: &DeviceTarget,
        value: &PointValue,
        env: &ExprEnv,
    ) -> NumericValue {
        if !target.expression.is_empty() {
            if let Some(resolved) = self.evaluate_target_expression(writer, target, value, env).await {
                return resolved;
            }
        }

        match &target.value {
            Some(raw) => self.resolve_value_template(raw, env),
            None => value.value.clone(),
        }
    }

    /// Value produced by a target expression, `None` when it cannot be used
    async fn evaluate_target_expression(
        &self,
        writer: &Arc<dyn DeviceWriter>,
        target: &DeviceTarget,
        value: &PointValue,
        env: &ExprEnv,
    ) -> Option<NumericValue> {
        let expression = target.expression.trim();
        let mut calc_env = env.clone();
        calc_env.insert("v".to_string(), value.value.coerced());

        let preprocessed = self.expr.preprocess(expression);

        if let Some(caps) = self.bitget_rmw.captures(&preprocessed) {
            let bit = caps[1].parse::<u32>().ok()?;
            let bit_value = match self.expr.eval(expression, &calc_env) {
                Ok(result) => result.to_i64().unwrap_or(0),
                Err(e) => {
                    warn!(expression, error = %e, "Failed to evaluate device_control expression");
                    return None;
                },
            };
            return self.read_modify_write(writer, target, bit, bit_value).await;
        }

        if let Some(caps) = self.bitset_value.captures(expression) {
            let bit = caps[1].parse::<u32>().ok()?.saturating_sub(1);
            let bit_value = target
                .value
                .as_ref()
                .map(|raw| self.resolve_value_template(raw, env))
                .and_then(|v| v.to_f64())
                .map(|f| f as i64)
                .unwrap_or(0);
            return self.read_modify_write(writer, target, bit, bit_value).await;
        }

        if let Some(caps) = self.bitset_const.captures(expression) {
            let bit = caps[1].parse::<u32>().ok()?.saturating_sub(1);
            let bit_value = caps[2].parse::<i64>().ok()?;
            return self.read_modify_write(writer, target, bit, bit_value).await;
        }

        match self.expr.eval(expression, &calc_env) {
            Ok(result) => Some(result),
            Err(e) => {
                warn!(expression, error = %e, "Failed to evaluate device_control expression");
                None
            },
        }
    }

    /// Set or clear one bit of the point's current value
    ///
    /// When the current value cannot be read, the bit alone is written
    /// (`1 << bit` or 0).
    async fn read_modify_write(
        &self,
        writer: &Arc<dyn DeviceWriter>,
        target: &DeviceTarget,
        bit: u32,
        bit_value: i64,
    ) -> Option<NumericValue> {
        if bit > 63 {
            warn!(bit, "Bit index out of range for read-modify-write");
            return None;
        }
        let mask = 1i64 << bit;

        match writer
            .read_point(&target.channel_id, &target.device_id, &target.point_id)
            .await
        {
            Ok(current) => {
                let current = current.value.to_i64().unwrap_or(0);
                let updated = if bit_value != 0 {
                    current | mask
                } else {
                    current & !mask
                };
                debug!(
                    point = %format!("{}/{}/{}", target.channel_id, target.device_id, target.point_id),
                    bit,
                    current,
                    bit_value,
                    updated,
                    "Read-modify-write"
                );
                Some(NumericValue::Int(updated))
            },
            Err(e) => {
                warn!(
                    point = %format!("{}/{}/{}", target.channel_id, target.device_id, target.point_id),
                    error = %e,
                    "Read failed, writing bit value without other bits"
                );
                Some(NumericValue::Int(if bit_value != 0 { mask } else { 0 }))
            },
        }
    }

    // ========================================================================
    // check
    // ========================================================================

    /// Poll a point until the expression holds
    ///
    /// Returns `None` on success and the last failure reason otherwise.
    async fn run_check(
        &self,
        probe: &CheckProbe<'_>,
        env: &ExprEnv,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        let writer = self.writer()?;
        let started = tokio::time::Instant::now();
        let mut reason = String::from("not checked");

        for attempt in 0..probe.retry {
            if let Some(timeout) = probe.timeout {
                if started.elapsed() > timeout {
                    reason = "check timeout".to_string();
                    break;
                }
            }
            if cancel.is_cancelled() {
                return Err(RuleError::action("cancelled"));
            }

            match writer
                .read_point(probe.channel_id, probe.device_id, probe.point_id)
                .await
            {
                Ok(current) => {
                    let mut check_env = env.clone();
                    check_env.insert("v".to_string(), current.value.coerced());
                    match self.expr.eval_bool(probe.expression, &check_env) {
                        Ok(true) => return Ok(None),
                        Ok(false) => reason = "condition false".to_string(),
                        Err(e) => reason = format!("eval failed: {}", e),
                    }
                },
                Err(e) => reason = format!("read failed: {}", e),
            }

            if attempt + 1 < probe.retry {
                tokio::select! {
                    _ = tokio::time::sleep(probe.poll_interval) => {}
                    _ = cancel.cancelled() => return Err(RuleError::action("cancelled")),
                }
            }
        }

        Ok(Some(reason))
    }
}

struct CheckProbe<'a> {
    channel_id: &'a str,
    device_id: &'a str,
    point_id: &'a str,
    expression: &'a str,
    retry: u32,
    poll_interval: Duration,
    timeout: Option<Duration>,
}
