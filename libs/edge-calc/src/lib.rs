//! edge-calc - Expression engine for edge rules
//!
//! Evaluates rule conditions and calculations over telemetry values.
//!
//! # Features
//!
//! - **Expression evaluation**: Arithmetic, comparison, and logic operations (evalexpr)
//! - **Bit access**: `v.4` / `v.bit.4` read bit 3 (1-based shorthand)
//! - **Bitwise functions**: `bitand()`, `bitor()`, `bitxor()`, `bitnot()`, `bitshl()`,
//!   `bitshr()`, `bitget()`, `bitset()`
//! - **Stateless functions**: `scale()`, `clamp()`, `abs()`, `min()`, `max()`, `round()`, `sign()`
//! - **Numeric coercion**: [`NumericValue`] covers every scalar a field driver can deliver
//!
//! # Built-in Functions
//!
//! | Function | Signature | Description |
//! |----------|-----------|-------------|
//! | `bitget` | `bitget(value, pos)` | Bit at 0-based position |
//! | `bitset` | `bitset(value, pos, bit)` | Value with bit set (bit != 0) or cleared |
//! | `bitand` / `bitor` / `bitxor` | `bitand(a, b)` | Bitwise ops on 64-bit integers |
//! | `bitnot` | `bitnot(a)` | Bitwise complement |
//! | `bitshl` / `bitshr` | `bitshl(a, n)` | Shift by 0..=63 |
//! | `scale` | `scale(value, factor)` | Multiply by factor |
//! | `clamp` | `clamp(value, min, max)` | Limit to range |
//! | `round` | `round(value, decimals)` | Round to decimals |
//! | `sign` | `sign(value)` | Sign: -1, 0, or 1 |

pub mod builtin_functions;
pub mod error;
pub mod evaluator;
pub mod numeric;
pub mod preprocess;

// Re-exports for convenience
pub use error::{CalcError, Result};
pub use evaluator::ExprEngine;
pub use numeric::{ExprEnv, NumericValue};
pub use preprocess::Preprocessor;
