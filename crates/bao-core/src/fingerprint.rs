//! # Result Fingerprints
//!
//! Disabling an optimizer must never change what a query returns. To catch rules
//! that silently alter semantics, every measured execution hashes its result set and
//! storage compares the digest against the first digest recorded for the query.
//!
//! The digest is MD5 over the flattened row values in order. Floating-point values
//! are rounded to two decimal places first so that nondeterministic aggregation order
//! across repeats does not produce spurious mismatches. This is an equality check,
//! not a security boundary.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Number of decimal places floats are rounded to before hashing.
pub const FLOAT_PRECISION: i32 = 2;

/// MD5 digest over a query result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub [u8; 16]);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Hash a row set. Row boundaries are not part of the digest, only value order.
pub fn hash_result(rows: &[Vec<Value>]) -> Fingerprint {
    let mut ctx = md5::Context::new();
    for value in rows.iter().flatten() {
        ctx.consume(normalize(value).as_bytes());
    }
    Fingerprint(ctx.compute().0)
}

fn round(value: f64) -> f64 {
    let factor = 10f64.powi(FLOAT_PRECISION);
    (value * factor).round() / factor
}

/// Stringify one cell. Nested arrays and maps are normalized recursively so floats
/// inside `ARRAY`/`MAP`/`ROW` values are rounded too.
fn normalize(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::String(s) => s.clone(),
        Value::Number(n) => match (n.as_i64(), n.as_u64(), n.as_f64()) {
            (Some(i), _, _) => i.to_string(),
            (_, Some(u), _) => u.to_string(),
            (_, _, Some(f)) => round(f).to_string(),
            _ => n.to_string(),
        },
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(normalize).collect();
            format!("[{}]", inner.join(","))
        }
        Value::Object(map) => {
            let inner: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{}:{}", k, normalize(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows(values: Value) -> Vec<Vec<Value>> {
        serde_json::from_value(values).unwrap()
    }

    #[test]
    fn test_hash_is_deterministic() {
        let data = rows(json!([[1, "a", 2.5], [2, "b", null]]));
        assert_eq!(hash_result(&data), hash_result(&data.clone()));
    }

    #[test]
    fn test_float_noise_is_absorbed() {
        let a = rows(json!([[1, 0.30000000000000004]]));
        let b = rows(json!([[1, 0.3]]));
        assert_eq!(hash_result(&a), hash_result(&b));

        let nested_a = rows(json!([[[1.001, 2.0]]]));
        let nested_b = rows(json!([[[1.0, 2.004]]]));
        assert_eq!(hash_result(&nested_a), hash_result(&nested_b));
    }

    #[test]
    fn test_different_values_differ() {
        let a = rows(json!([[1, 0.31]]));
        let b = rows(json!([[1, 0.32]]));
        assert_ne!(hash_result(&a), hash_result(&b));
    }

    #[test]
    fn test_value_order_matters() {
        let a = rows(json!([["x"], ["y"]]));
        let b = rows(json!([["y"], ["x"]]));
        assert_ne!(hash_result(&a), hash_result(&b));
    }

    #[test]
    fn test_display_is_hex() {
        let fp = hash_result(&[]);
        // MD5 of the empty input
        assert_eq!(fp.to_string(), "d41d8cd98f00b204e9800998ecf8427e");
    }
}
