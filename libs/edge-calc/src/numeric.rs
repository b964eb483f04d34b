//! NumericValue - dynamically typed telemetry scalar
//!
//! Field drivers deliver integers of every width, floats, booleans and
//! occasionally numeric strings. All coercion goes through this sum type so
//! the conversion matrix lives in one place.

use crate::error::{CalcError, Result};
use evalexpr::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Variable environment handed to the expression engine
pub type ExprEnv = BTreeMap<String, NumericValue>;

/// Telemetry scalar
///
/// Serialized untagged, so JSON `12`, `12.5`, `true`, `"12"` and `null`
/// all round-trip to the natural variant.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NumericValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    #[default]
    Null,
}

impl NumericValue {
    /// Coerce to f64
    ///
    /// Booleans map to 1/0 and strings are parsed. Returns `None` for
    /// non-numeric strings and null.
    pub fn to_f64(&self) -> Option<f64> {
        match self {
            NumericValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            NumericValue::Int(i) => Some(*i as f64),
            NumericValue::UInt(u) => Some(*u as f64),
            NumericValue::Float(f) => Some(*f),
            NumericValue::Text(s) => s.trim().parse::<f64>().ok(),
            NumericValue::Null => None,
        }
    }

    /// Coerce to f64, NaN when the value is not numeric
    pub fn to_f64_or_nan(&self) -> f64 {
        self.to_f64().unwrap_or(f64::NAN)
    }

    /// Coerce to i64
    ///
    /// Floats are truncated toward zero. Strings are parsed as integers
    /// first and as floats second.
    pub fn to_i64(&self) -> Result<i64> {
        match self {
            NumericValue::Bool(b) => Ok(i64::from(*b)),
            NumericValue::Int(i) => Ok(*i),
            NumericValue::UInt(u) => Ok(*u as i64),
            NumericValue::Float(f) => {
                if f.is_finite() {
                    Ok(f.trunc() as i64)
                } else {
                    Err(CalcError::conversion(format!("cannot convert {} to int", f)))
                }
            },
            NumericValue::Text(s) => {
                let s = s.trim();
                if let Ok(i) = s.parse::<i64>() {
                    return Ok(i);
                }
                match s.parse::<f64>() {
                    Ok(f) if f.is_finite() => Ok(f.trunc() as i64),
                    _ => Err(CalcError::conversion(format!(
                        "cannot convert '{}' to int",
                        s
                    ))),
                }
            },
            NumericValue::Null => Err(CalcError::conversion("cannot convert null to int")),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, NumericValue::Null)
    }

    /// True for every variant that `to_f64` accepts
    pub fn is_numeric(&self) -> bool {
        self.to_f64().is_some()
    }

    /// Normalize numeric variants to `Float`
    ///
    /// Expressions compare against float-coerced telemetry, so every value
    /// bound into an environment goes through here. Non-numeric text is kept
    /// as-is; null becomes NaN so comparisons evaluate to false.
    pub fn coerced(&self) -> NumericValue {
        match self {
            NumericValue::Null => NumericValue::Float(f64::NAN),
            NumericValue::Text(s) => match s.trim().parse::<f64>() {
                Ok(f) => NumericValue::Float(f),
                Err(_) => self.clone(),
            },
            other => other
                .to_f64()
                .map(NumericValue::Float)
                .unwrap_or_else(|| other.clone()),
        }
    }

    /// Convert into an evalexpr value
    pub fn to_expr_value(&self) -> Value {
        match self {
            NumericValue::Bool(b) => Value::Boolean(*b),
            NumericValue::Int(i) => Value::Int(*i),
            NumericValue::UInt(u) => Value::Float(*u as f64),
            NumericValue::Float(f) => Value::Float(*f),
            NumericValue::Text(s) => Value::String(s.clone()),
            NumericValue::Null => Value::Empty,
        }
    }

    /// Convert an evaluation result back into a telemetry scalar
    pub fn from_expr_value(value: Value) -> Result<Self> {
        match value {
            Value::Boolean(b) => Ok(NumericValue::Bool(b)),
            Value::Int(i) => Ok(NumericValue::Int(i)),
            Value::Float(f) => Ok(NumericValue::Float(f)),
            Value::String(s) => Ok(NumericValue::Text(s)),
            Value::Empty => Ok(NumericValue::Null),
            Value::Tuple(t) => Err(CalcError::conversion(format!(
                "tuple result is not a scalar ({} elements)",
                t.len()
            ))),
        }
    }

    /// JSON representation, used for payloads and persisted events
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            NumericValue::Bool(b) => serde_json::Value::Bool(*b),
            NumericValue::Int(i) => serde_json::Value::from(*i),
            NumericValue::UInt(u) => serde_json::Value::from(*u),
            NumericValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            NumericValue::Text(s) => serde_json::Value::String(s.clone()),
            NumericValue::Null => serde_json::Value::Null,
        }
    }
}

impl fmt::Display for NumericValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NumericValue::Bool(b) => write!(f, "{}", b),
            NumericValue::Int(i) => write!(f, "{}", i),
            NumericValue::UInt(u) => write!(f, "{}", u),
            NumericValue::Float(v) => write!(f, "{}", v),
            NumericValue::Text(s) => f.write_str(s),
            NumericValue::Null => f.write_str("null"),
        }
    }
}

macro_rules! impl_from_signed {
    ($($t:ty),*) => {
        $(impl From<$t> for NumericValue {
            fn from(v: $t) -> Self {
                NumericValue::Int(i64::from(v))
            }
        })*
    };
}

macro_rules! impl_from_unsigned {
    ($($t:ty),*) => {
        $(impl From<$t> for NumericValue {
            fn from(v: $t) -> Self {
                NumericValue::UInt(u64::from(v))
            }
        })*
    };
}

impl_from_signed!(i8, i16, i32, i64);
impl_from_unsigned!(u8, u16, u32, u64);

impl From<isize> for NumericValue {
    fn from(v: isize) -> Self {
        NumericValue::Int(v as i64)
    }
}

impl From<usize> for NumericValue {
    fn from(v: usize) -> Self {
        NumericValue::UInt(v as u64)
    }
}

impl From<f32> for NumericValue {
    fn from(v: f32) -> Self {
        NumericValue::Float(f64::from(v))
    }
}

impl From<f64> for NumericValue {
    fn from(v: f64) -> Self {
        NumericValue::Float(v)
    }
}

impl From<bool> for NumericValue {
    fn from(v: bool) -> Self {
        NumericValue::Bool(v)
    }
}

impl From<String> for NumericValue {
    fn from(v: String) -> Self {
        NumericValue::Text(v)
    }
}

impl From<&str> for NumericValue {
    fn from(v: &str) -> Self {
        NumericValue::Text(v.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_to_f64_matrix() {
        assert_eq!(NumericValue::from(5i8).to_f64(), Some(5.0));
        assert_eq!(NumericValue::from(-7i32).to_f64(), Some(-7.0));
        assert_eq!(NumericValue::from(9u16).to_f64(), Some(9.0));
        assert_eq!(NumericValue::from(u64::MAX).to_f64(), Some(u64::MAX as f64));
        assert_eq!(NumericValue::from(2.5f32).to_f64(), Some(2.5));
        assert_eq!(NumericValue::from(true).to_f64(), Some(1.0));
        assert_eq!(NumericValue::from(false).to_f64(), Some(0.0));
        assert_eq!(NumericValue::from(" 12.5 ").to_f64(), Some(12.5));
        assert_eq!(NumericValue::from("abc").to_f64(), None);
        assert_eq!(NumericValue::Null.to_f64(), None);
        assert!(NumericValue::Null.to_f64_or_nan().is_nan());
    }

    #[test]
    fn test_to_i64_matrix() {
        assert_eq!(NumericValue::from(42i64).to_i64().unwrap(), 42);
        assert_eq!(NumericValue::from(3.9f64).to_i64().unwrap(), 3);
        assert_eq!(NumericValue::from(-3.9f64).to_i64().unwrap(), -3);
        assert_eq!(NumericValue::from(true).to_i64().unwrap(), 1);
        assert_eq!(NumericValue::from("17").to_i64().unwrap(), 17);
        assert_eq!(NumericValue::from("17.8").to_i64().unwrap(), 17);
        assert!(NumericValue::from("x17").to_i64().is_err());
        assert!(NumericValue::Null.to_i64().is_err());
        assert!(NumericValue::Float(f64::NAN).to_i64().is_err());
    }

    #[test]
    fn test_coerced() {
        assert_eq!(NumericValue::Int(9).coerced(), NumericValue::Float(9.0));
        assert_eq!(NumericValue::Bool(true).coerced(), NumericValue::Float(1.0));
        assert_eq!(NumericValue::from("4").coerced(), NumericValue::Float(4.0));
        assert_eq!(
            NumericValue::from("open").coerced(),
            NumericValue::from("open")
        );
        match NumericValue::Null.coerced() {
            NumericValue::Float(f) => assert!(f.is_nan()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_untagged_json() {
        let v: NumericValue = serde_json::from_str("12").unwrap();
        assert_eq!(v, NumericValue::Int(12));
        let v: NumericValue = serde_json::from_str("12.5").unwrap();
        assert_eq!(v, NumericValue::Float(12.5));
        let v: NumericValue = serde_json::from_str("true").unwrap();
        assert_eq!(v, NumericValue::Bool(true));
        let v: NumericValue = serde_json::from_str("\"run\"").unwrap();
        assert_eq!(v, NumericValue::Text("run".into()));
        let v: NumericValue = serde_json::from_str("null").unwrap();
        assert_eq!(v, NumericValue::Null);
        let v: NumericValue = serde_json::from_str("18446744073709551615").unwrap();
        assert_eq!(v, NumericValue::UInt(u64::MAX));
    }

    #[test]
    fn test_expr_value_conversion() {
        assert_eq!(
            NumericValue::from_expr_value(Value::Float(8.0)).unwrap(),
            NumericValue::Float(8.0)
        );
        assert_eq!(
            NumericValue::from_expr_value(Value::Empty).unwrap(),
            NumericValue::Null
        );
        assert!(NumericValue::from_expr_value(Value::Tuple(vec![Value::Int(1)])).is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(NumericValue::Float(8.0).to_string(), "8");
        assert_eq!(NumericValue::Float(12.5).to_string(), "12.5");
        assert_eq!(NumericValue::Int(-3).to_string(), "-3");
        assert_eq!(NumericValue::Null.to_string(), "null");
    }
}
