//! Built-in functions for expression evaluation
//!
//! Bitwise helpers: bitand, bitor, bitxor, bitnot, bitshl, bitshr, bitget, bitset.
//! Arguments are coerced to 64-bit integers. Results are returned as floats so
//! they compare cleanly against promoted literals, except when the magnitude
//! exceeds 2^53, where an integer keeps every bit.
//!
//! Stateless math helpers: scale, clamp, abs, min, max, round, sign.

use crate::error::{CalcError, Result};
use crate::numeric::NumericValue;
use evalexpr::{ContextWithMutableFunctions, EvalexprError, Function, HashMapContext, Value};

// ============================================================================
// Bitwise operations
// ============================================================================

fn check_position(pos: i64) -> Result<u32> {
    if (0..=63).contains(&pos) {
        Ok(pos as u32)
    } else {
        Err(CalcError::function(format!(
            "bit position {} out of range 0..=63",
            pos
        )))
    }
}

/// Read bit `pos` (0-based) of `value`
pub fn bitget(value: i64, pos: i64) -> Result<i64> {
    let pos = check_position(pos)?;
    Ok((value >> pos) & 1)
}

/// Set or clear bit `pos` (0-based) of `value`
pub fn bitset(value: i64, pos: i64, bit: i64) -> Result<i64> {
    let pos = check_position(pos)?;
    if bit != 0 {
        Ok(value | (1i64 << pos))
    } else {
        Ok(value & !(1i64 << pos))
    }
}

pub fn bitshl(value: i64, shift: i64) -> Result<i64> {
    let shift = check_position(shift)?;
    Ok(value << shift)
}

pub fn bitshr(value: i64, shift: i64) -> Result<i64> {
    let shift = check_position(shift)?;
    Ok(value >> shift)
}

// ============================================================================
// Stateless math
// ============================================================================

/// Multiply by factor
pub fn scale(value: f64, factor: f64) -> f64 {
    value * factor
}

/// Limit to range
pub fn clamp(value: f64, min: f64, max: f64) -> f64 {
    value.max(min).min(max)
}

pub fn abs(value: f64) -> f64 {
    value.abs()
}

pub fn min(a: f64, b: f64) -> f64 {
    a.min(b)
}

pub fn max(a: f64, b: f64) -> f64 {
    a.max(b)
}

/// Round to `decimals` places
pub fn round(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Sign: -1, 0, or 1
pub fn sign(value: f64) -> f64 {
    if value > 0.0 {
        1.0
    } else if value < 0.0 {
        -1.0
    } else {
        0.0
    }
}

// ============================================================================
// evalexpr registration
// ============================================================================

fn to_i64(value: &Value) -> std::result::Result<i64, EvalexprError> {
    NumericValue::from_expr_value(value.clone())
        .and_then(|v| v.to_i64())
        .map_err(|e| EvalexprError::CustomMessage(e.to_string()))
}

fn to_f64(value: &Value) -> std::result::Result<f64, EvalexprError> {
    match value {
        Value::Float(f) => Ok(*f),
        Value::Int(i) => Ok(*i as f64),
        Value::Boolean(b) => Ok(if *b { 1.0 } else { 0.0 }),
        _ => Err(EvalexprError::expected_number(value.clone())),
    }
}

fn args_n(args: &Value, n: usize) -> std::result::Result<Vec<Value>, EvalexprError> {
    let tuple = args.as_tuple()?;
    if tuple.len() != n {
        return Err(EvalexprError::CustomMessage(format!(
            "expected {} arguments, got {}",
            n,
            tuple.len()
        )));
    }
    Ok(tuple)
}

/// Largest magnitude an f64 holds without losing integer bits
const MAX_EXACT_FLOAT_INT: i64 = 1 << 53;

fn bit_result(r: i64) -> Value {
    if (-MAX_EXACT_FLOAT_INT..=MAX_EXACT_FLOAT_INT).contains(&r) {
        Value::Float(r as f64)
    } else {
        Value::Int(r)
    }
}

fn custom(e: CalcError) -> EvalexprError {
    EvalexprError::CustomMessage(e.to_string())
}

fn binary_bit_op(
    op: fn(i64, i64) -> Result<i64>,
) -> impl Fn(&Value) -> std::result::Result<Value, EvalexprError> + Clone + Send + Sync + 'static {
    move |args| {
        let tuple = args_n(args, 2)?;
        let a = to_i64(&tuple[0])?;
        let b = to_i64(&tuple[1])?;
        op(a, b).map(bit_result).map_err(custom)
    }
}

fn set_function(context: &mut HashMapContext, name: &str, function: Function) -> Result<()> {
    context
        .set_function(name.to_string(), function)
        .map_err(|e| CalcError::expression(format!("Failed to register {}: {}", name, e)))
}

/// Register every built-in function with an evalexpr context
pub fn register_builtins(context: &mut HashMapContext) -> Result<()> {
    set_function(
        context,
        "bitand",
        Function::new(binary_bit_op(|a, b| Ok(a & b))),
    )?;
    set_function(
        context,
        "bitor",
        Function::new(binary_bit_op(|a, b| Ok(a | b))),
    )?;
    set_function(
        context,
        "bitxor",
        Function::new(binary_bit_op(|a, b| Ok(a ^ b))),
    )?;
    set_function(context, "bitshl", Function::new(binary_bit_op(bitshl)))?;
    set_function(context, "bitshr", Function::new(binary_bit_op(bitshr)))?;
    set_function(context, "bitget", Function::new(binary_bit_op(bitget)))?;

    set_function(
        context,
        "bitnot",
        Function::new(|args| {
            let a = to_i64(args)?;
            Ok(bit_result(!a))
        }),
    )?;

    set_function(
        context,
        "bitset",
        Function::new(|args| {
            let tuple = args_n(args, 3)?;
            let value = to_i64(&tuple[0])?;
            let pos = to_i64(&tuple[1])?;
            let bit = to_i64(&tuple[2])?;
            bitset(value, pos, bit)
                .map(bit_result)
                .map_err(custom)
        }),
    )?;

    // scale(value, factor)
    set_function(
        context,
        "scale",
        Function::new(|args| {
            let tuple = args_n(args, 2)?;
            Ok(Value::Float(scale(to_f64(&tuple[0])?, to_f64(&tuple[1])?)))
        }),
    )?;

    // clamp(value, min, max)
    set_function(
        context,
        "clamp",
        Function::new(|args| {
            let tuple = args_n(args, 3)?;
            Ok(Value::Float(clamp(
                to_f64(&tuple[0])?,
                to_f64(&tuple[1])?,
                to_f64(&tuple[2])?,
            )))
        }),
    )?;

    set_function(
        context,
        "abs",
        Function::new(|args| Ok(Value::Float(abs(to_f64(args)?)))),
    )?;

    set_function(
        context,
        "min",
        Function::new(|args| {
            let tuple = args_n(args, 2)?;
            Ok(Value::Float(min(to_f64(&tuple[0])?, to_f64(&tuple[1])?)))
        }),
    )?;

    set_function(
        context,
        "max",
        Function::new(|args| {
            let tuple = args_n(args, 2)?;
            Ok(Value::Float(max(to_f64(&tuple[0])?, to_f64(&tuple[1])?)))
        }),
    )?;

    // round(value, decimals); decimals arrive as floats after literal promotion
    set_function(
        context,
        "round",
        Function::new(|args| {
            let tuple = args_n(args, 2)?;
            let value = to_f64(&tuple[0])?;
            let decimals = to_f64(&tuple[1])? as i32;
            Ok(Value::Float(round(value, decimals)))
        }),
    )?;

    set_function(
        context,
        "sign",
        Function::new(|args| Ok(Value::Float(sign(to_f64(args)?)))),
    )?;

    Ok(())
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
#[allow(clippy::approx_constant)]
mod tests {
    use super::*;

    #[test]
    fn test_bitget() {
        // 18 = 0b10010
        assert_eq!(bitget(18, 1).unwrap(), 1);
        assert_eq!(bitget(18, 3).unwrap(), 0);
        assert_eq!(bitget(18, 4).unwrap(), 1);
        assert_eq!(bitget(-1, 63).unwrap(), 1);
        assert!(bitget(1, 64).is_err());
        assert!(bitget(1, -1).is_err());
    }

    #[test]
    fn test_bitset() {
        assert_eq!(bitset(0, 3, 1).unwrap(), 8);
        assert_eq!(bitset(15, 0, 0).unwrap(), 14);
        assert_eq!(bitset(8, 3, 5).unwrap(), 8);
        assert!(bitset(0, 99, 1).is_err());
    }

    #[test]
    fn test_bit_results_keep_high_bits() {
        let mut context = HashMapContext::new();
        register_builtins(&mut context).unwrap();

        assert_eq!(
            evalexpr::eval_with_context("bitget(18, 4)", &context).unwrap(),
            Value::Float(1.0)
        );
        assert_eq!(
            evalexpr::eval_with_context("bitset(0, 60, 1)", &context).unwrap(),
            Value::Int(1 << 60)
        );
        assert_eq!(
            evalexpr::eval_with_context("bitor(bitshl(1, 62), 1)", &context).unwrap(),
            Value::Int((1 << 62) | 1)
        );
        assert_eq!(
            evalexpr::eval_with_context("bitnot(0)", &context).unwrap(),
            Value::Float(-1.0)
        );
    }

    #[test]
    fn test_shifts() {
        assert_eq!(bitshl(1, 4).unwrap(), 16);
        assert_eq!(bitshr(16, 2).unwrap(), 4);
        assert!(bitshl(1, 64).is_err());
    }

    #[test]
    fn test_stateless() {
        assert_eq!(scale(100.0, 0.5), 50.0);
        assert_eq!(clamp(150.0, 0.0, 100.0), 100.0);
        assert_eq!(clamp(-10.0, 0.0, 100.0), 0.0);
        assert_eq!(abs(-5.0), 5.0);
        assert_eq!(min(10.0, 5.0), 5.0);
        assert_eq!(max(10.0, 5.0), 10.0);
        assert_eq!(round(3.14159, 2), 3.14);
        assert_eq!(sign(-3.0), -1.0);
        assert_eq!(sign(0.0), 0.0);
    }
}
