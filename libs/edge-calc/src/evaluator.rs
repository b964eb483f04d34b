//! ExprEngine - expression evaluator with built-in functions
//!
//! Provides formula evaluation with support for:
//! - Arithmetic: +, -, *, /, ^, %
//! - Comparison: <, >, <=, >=, ==, !=
//! - Logic: &&, ||, !
//! - Bit access shorthand: `v.4` reads bit 3 of `v`
//! - Built-in functions: bitget, bitset, bitand, ..., scale, clamp, round, sign

use crate::builtin_functions;
use crate::error::{CalcError, Result};
use crate::numeric::{ExprEnv, NumericValue};
use crate::preprocess::Preprocessor;
use dashmap::DashMap;
use evalexpr::{Context, EvalexprError, EvalexprResult, HashMapContext, Node, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Expression engine shared by all rule workers
///
/// Parsed operator trees are cached by source text, so a rule's condition is
/// preprocessed and parsed once for the lifetime of the engine.
///
/// # Example
/// ```
/// use edge_calc::{ExprEngine, ExprEnv, NumericValue};
///
/// let engine = ExprEngine::new().unwrap();
/// let mut env = ExprEnv::new();
/// env.insert("v".to_string(), NumericValue::Int(9));
///
/// assert!(engine.eval_bool("v > 5", &env).unwrap());
/// assert_eq!(engine.eval("v.4 * 8", &env).unwrap(), NumericValue::Float(8.0));
/// ```
pub struct ExprEngine {
    preprocessor: Preprocessor,
    /// Context holding the registered functions, shared by every evaluation
    functions: HashMapContext,
    compiled: DashMap<String, Arc<Node>>,
}

impl ExprEngine {
    pub fn new() -> Result<Self> {
        let mut functions = HashMapContext::new();
        builtin_functions::register_builtins(&mut functions)?;

        Ok(Self {
            preprocessor: Preprocessor::new()?,
            functions,
            compiled: DashMap::new(),
        })
    }

    /// Rewritten form of an expression, as it is handed to the parser
    pub fn preprocess(&self, expression: &str) -> String {
        self.preprocessor.process(expression)
    }

    /// Parse (or fetch from cache) the operator tree of an expression
    pub fn compile(&self, expression: &str) -> Result<Arc<Node>> {
        if let Some(node) = self.compiled.get(expression) {
            return Ok(Arc::clone(node.value()));
        }

        let processed = self.preprocess(expression);
        let node = evalexpr::build_operator_tree(&processed).map_err(|e| {
            CalcError::expression(format!("Failed to compile '{}': {}", expression, e))
        })?;
        let node = Arc::new(node);

        debug!(expression, processed = %processed, "Expression compiled");
        self.compiled
            .insert(expression.to_string(), Arc::clone(&node));
        Ok(node)
    }

    /// Evaluate an expression and return the raw evalexpr value
    ///
    /// Every variable is bound through `NumericValue::coerced`, so integers
    /// and booleans arrive as floats and null arrives as NaN.
    pub fn eval_value(&self, expression: &str, env: &ExprEnv) -> Result<Value> {
        let node = self.compile(expression)?;
        let context = EvalContext {
            functions: &self.functions,
            variables: env
                .iter()
                .map(|(name, value)| (name.clone(), value.coerced().to_expr_value()))
                .collect(),
        };

        node.eval_with_context(&context).map_err(|e| {
            CalcError::expression(format!("Failed to evaluate '{}': {}", expression, e))
        })
    }

    /// Evaluate an expression to a telemetry scalar
    pub fn eval(&self, expression: &str, env: &ExprEnv) -> Result<NumericValue> {
        let value = self.eval_value(expression, env)?;
        NumericValue::from_expr_value(value)
    }

    /// Evaluate a condition; anything other than a boolean result is an error
    pub fn eval_bool(&self, condition: &str, env: &ExprEnv) -> Result<bool> {
        match self.eval_value(condition, env)? {
            Value::Boolean(b) => Ok(b),
            other => Err(CalcError::NotBoolean(type_name(&other).to_string())),
        }
    }

    /// Number of cached operator trees
    pub fn cached_expressions(&self) -> usize {
        self.compiled.len()
    }
}

/// Per-evaluation variables over the shared function table
struct EvalContext<'a> {
    functions: &'a HashMapContext,
    variables: HashMap<String, Value>,
}

impl Context for EvalContext<'_> {
    fn get_value(&self, identifier: &str) -> Option<&Value> {
        self.variables.get(identifier)
    }

    fn call_function(&self, identifier: &str, argument: &Value) -> EvalexprResult<Value> {
        self.functions.call_function(identifier, argument)
    }

    fn are_builtin_functions_disabled(&self) -> bool {
        self.functions.are_builtin_functions_disabled()
    }

    fn set_builtin_functions_disabled(&mut self, disabled: bool) -> EvalexprResult<()> {
        if disabled == self.functions.are_builtin_functions_disabled() {
            Ok(())
        } else {
            Err(EvalexprError::CustomMessage(
                "builtin functions are fixed per engine".to_string(),
            ))
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::String(_) => "string",
        Value::Float(_) => "float",
        Value::Int(_) => "int",
        Value::Boolean(_) => "boolean",
        Value::Tuple(_) => "tuple",
        Value::Empty => "empty",
    }
}
