//! Helpers over JSON-like values.
//!
//! Entity attributes, codex variables and task payloads are all plain
//! `serde_json::Value`s; this module gives them the comparison and
//! coercion rules the kernel relies on.

use crate::core::{KernelError, Result};
use serde_json::{Number, Value};
use std::cmp::Ordering;

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

pub fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64().and_then(|f| {
                if f.is_finite() && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
                    Some(f as i64)
                } else {
                    None
                }
            })
        }),
        _ => None,
    }
}

pub fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

pub fn float_value(f: f64) -> Result<Value> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| KernelError::ExecutionError(format!("non-finite float result: {}", f)))
}

/// Equality with int/float coercion, so `1 == 1.0`.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(i), Some(j)) => i == j,
            _ => match (x.as_f64(), y.as_f64()) {
                (Some(f), Some(g)) => f == g,
                _ => x == y,
            },
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).map(|y| values_equal(x, y)).unwrap_or(false))
        }
        _ => a == b,
    }
}

/// Orders two scalar values. NULL sorts last; mixed numeric types are
/// coerced; anything else of differing types is a type mismatch.
pub fn compare(a: &Value, b: &Value) -> Result<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Ok(Ordering::Equal),
        (Value::Null, _) => Ok(Ordering::Greater),
        (_, Value::Null) => Ok(Ordering::Less),

        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(i), Some(j)) => Ok(i.cmp(&j)),
            _ => {
                let f = x.as_f64().unwrap_or(f64::NAN);
                let g = y.as_f64().unwrap_or(f64::NAN);
                match (f.is_nan(), g.is_nan()) {
                    (true, true) => Ok(Ordering::Equal),
                    (true, false) => Ok(Ordering::Greater),
                    (false, true) => Ok(Ordering::Less),
                    (false, false) => Ok(f.partial_cmp(&g).unwrap_or(Ordering::Equal)),
                }
            }
        },

        (Value::String(x), Value::String(y)) => Ok(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Ok(x.cmp(y)),

        _ => Err(KernelError::ExecutionError(format!(
            "Cannot compare incompatible types: {} and {}",
            type_name(a),
            type_name(b)
        ))),
    }
}

/// Human rendering: strings without quotes, everything else as JSON.
pub fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_numeric_equality_coerces() {
        assert!(values_equal(&json!(1), &json!(1.0)));
        assert!(!values_equal(&json!(1), &json!(2)));
        assert!(values_equal(&json!([1, {"a": 2}]), &json!([1.0, {"a": 2}])));
    }

    #[test]
    fn test_compare_null_last() {
        assert_eq!(compare(&Value::Null, &json!(0)).unwrap(), Ordering::Greater);
        assert_eq!(compare(&json!("a"), &Value::Null).unwrap(), Ordering::Less);
        assert_eq!(compare(&json!(2), &json!(10.5)).unwrap(), Ordering::Less);
        assert_eq!(compare(&json!("b"), &json!("a")).unwrap(), Ordering::Greater);
    }

    #[test]
    fn test_compare_type_mismatch() {
        let err = compare(&json!("1"), &json!(1)).unwrap_err();
        assert!(err.to_string().contains("incompatible types"));
    }

    #[test]
    fn test_truthy() {
        assert!(!truthy(&Value::Null));
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!("")));
        assert!(truthy(&json!([0])));
        assert!(truthy(&json!(0.5)));
    }

    #[test]
    fn test_display() {
        assert_eq!(display(&json!("hi")), "hi");
        assert_eq!(display(&json!(3)), "3");
        assert_eq!(display(&Value::Null), "null");
    }
}
