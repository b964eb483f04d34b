//! Rule evaluation
//!
//! Builds the expression environment for a triggering value and applies the
//! per-type semantics (threshold, calculation, window, state). Status
//! bookkeeping happens afterwards in [`RuleStateStore`](crate::state::RuleStateStore).

use crate::index::ValueCache;
use crate::state::Evaluation;
use crate::types::{PointValue, Rule, RuleType};
use crate::window::{aggregate, WindowStore};
use edge_calc::{ExprEngine, ExprEnv, NumericValue};
use std::sync::Arc;

/// Evaluation result handed to the state machine and the action queue
#[derive(Debug, Clone)]
pub struct EvalOutcome {
    pub evaluation: Evaluation,
    /// Triggering value, with the derived value for calculation and window rules
    pub output: PointValue,
    /// Environment the actions see
    pub env: ExprEnv,
    /// Window history changed and should be persisted
    pub window_updated: bool,
}

pub struct RuleEvaluator {
    expr: Arc<ExprEngine>,
    cache: Arc<ValueCache>,
    windows: Arc<WindowStore>,
}

impl RuleEvaluator {
    pub fn new(expr: Arc<ExprEngine>, cache: Arc<ValueCache>, windows: Arc<WindowStore>) -> Self {
        Self {
            expr,
            cache,
            windows,
        }
    }

    /// Expression environment for a triggering value
    ///
    /// `value` holds the trigger. Each source binds under its alias and point
    /// id: the trigger itself when the source matches it, else the cached
    /// value, else NaN.
    pub fn build_env(&self, rule: &Rule, value: &PointValue) -> ExprEnv {
        let mut env = ExprEnv::new();
        env.insert("value".to_string(), value.value.coerced());

        for source in rule.effective_sources() {
            if source.alias.is_empty() && source.point_id.is_empty() {
                continue;
            }

            let resolved = if source.matches(value) {
                value.value.coerced()
            } else {
                match self.cache.get(&source.key()) {
                    Some(cached) => cached.value.coerced(),
                    None => NumericValue::Float(f64::NAN),
                }
            };

            if !source.alias.is_empty() {
                env.insert(source.alias.clone(), resolved.clone());
            }
            if !source.point_id.is_empty() {
                env.insert(source.point_id.clone(), resolved);
            }
        }

        env
    }

    pub fn evaluate(&self, rule: &Rule, value: &PointValue) -> EvalOutcome {
        let env = self.build_env(rule, value);
        let mut output = value.clone();
        let mut window_updated = false;

        let evaluation = match &rule.rule_type {
            RuleType::Threshold | RuleType::State => {
                self.condition(&rule.condition, &env, &output.value)
            },
            RuleType::Calculation => match self.expr.eval(&rule.expression, &env) {
                Ok(result) => {
                    output.value = result.clone();
                    Evaluation::Triggered(result)
                },
                Err(e) => Evaluation::Failed(e.to_string()),
            },
            RuleType::Window => match &rule.window {
                Some(config) => {
                    let retained = self.windows.push(&rule.id, config, value);
                    window_updated = true;

                    let result = NumericValue::Float(aggregate(config.aggr_func, &retained));
                    output.value = result.clone();

                    let mut window_env = env.clone();
                    window_env.insert("value".to_string(), result.clone());
                    self.condition(&rule.condition, &window_env, &result)
                },
                None => Evaluation::Failed("missing window config".to_string()),
            },
            RuleType::Unknown(_) if rule.condition.is_empty() => Evaluation::NotTriggered,
            RuleType::Unknown(_) => self.condition(&rule.condition, &env, &output.value),
        };

        EvalOutcome {
            evaluation,
            output,
            env,
            window_updated,
        }
    }

    fn condition(&self, condition: &str, env: &ExprEnv, output: &NumericValue) -> Evaluation {
        match self.expr.eval_bool(condition, env) {
            Ok(true) => Evaluation::Triggered(output.clone()),
            Ok(false) => Evaluation::NotTriggered,
            Err(e) => Evaluation::Failed(e.to_string()),
        }
    }
}
