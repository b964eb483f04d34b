//! Expression preprocessing
//!
//! Two rewrites run before an expression is handed to evalexpr:
//!
//! 1. Bit access: `var.N` and `var.bit.N` become `bitget(var, N-1)`.
//!    Indexing is 1-based, `var.0` is accepted as an alias for bit 0.
//! 2. Integer literal promotion: `10` becomes `10.0`. Telemetry is bound as
//!    floats, and evalexpr's `==` does not treat `Int(5)` and `Float(5.0)`
//!    as equal.

use crate::error::{CalcError, Result};
use regex::{Captures, Regex};

const BIT_ACCESS_PATTERN: &str = r"\b([a-zA-Z_]\w*)\.(?:bit\.)?(\d+)\b";

/// Expression rewriter
#[derive(Debug, Clone)]
pub struct Preprocessor {
    bit_access: Regex,
}

impl Preprocessor {
    pub fn new() -> Result<Self> {
        let bit_access = Regex::new(BIT_ACCESS_PATTERN)
            .map_err(|e| CalcError::expression(format!("Regex error: {}", e)))?;
        Ok(Self { bit_access })
    }

    /// Apply both rewrites
    pub fn process(&self, input: &str) -> String {
        promote_int_literals(&self.rewrite_bit_access(input))
    }

    /// Rewrite `var.N` into `bitget(var, N-1)`
    pub fn rewrite_bit_access(&self, input: &str) -> String {
        self.bit_access
            .replace_all(input, |caps: &Captures<'_>| {
                let var = &caps[1];
                let index = match caps[2].parse::<u64>() {
                    Ok(n) => n.saturating_sub(1),
                    // Out of range digit runs are left for the evaluator to reject
                    Err(_) => return caps[0].to_string(),
                };
                format!("bitget({}, {})", var, index)
            })
            .into_owned()
    }
}

/// Append `.0` to bare decimal integer literals
///
/// String literals, digits inside identifiers, float literals, exponents and
/// hex literals are copied unchanged.
pub fn promote_int_literals(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len() + 8);
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c == '"' {
            // Copy the string literal, honoring escapes
            out.push(c);
            i += 1;
            while i < chars.len() {
                let sc = chars[i];
                out.push(sc);
                i += 1;
                if sc == '\\' && i < chars.len() {
                    out.push(chars[i]);
                    i += 1;
                } else if sc == '"' {
                    break;
                }
            }
            continue;
        }

        if is_ident_char(c) && !c.is_ascii_digit() {
            while i < chars.len() && (is_ident_char(chars[i]) || chars[i] == ':') {
                out.push(chars[i]);
                i += 1;
            }
            continue;
        }

        if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            let next = chars.get(i).copied();
            let is_float = match next {
                Some('.') => chars.get(i + 1).is_some_and(|d| d.is_ascii_digit()),
                Some('e') | Some('E') => true,
                _ => false,
            };
            let is_other_literal = next.is_some_and(|n| n.is_alphabetic() || n == '_');

            if is_float || is_other_literal {
                // Copy the rest of the literal unchanged
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric()
                        || chars[i] == '.'
                        || chars[i] == '_'
                        || ((chars[i] == '-' || chars[i] == '+')
                            && matches!(chars[i - 1], 'e' | 'E')))
                {
                    i += 1;
                }
                out.extend(&chars[start..i]);
            } else {
                out.extend(&chars[start..i]);
                out.push_str(".0");
            }
            continue;
        }

        out.push(c);
        i += 1;
    }

    out
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}
