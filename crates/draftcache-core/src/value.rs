//! JSON-like field values, structural equality, and canonical keys.
//!
//! Every dirty/equality decision in the workspace goes through [`deep_equal`].
//! Editors re-parse JSON constantly, so equality must be structural, never by
//! reference and never by comparing serialized strings.

use serde_json::{Map, Number, Value};

/// Ordered mapping from field name to value.
pub type FieldMap = Map<String, Value>;

/// How arrays are treated when building a canonical key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArrayOrder {
    /// Arrays keep their element order.
    #[default]
    Preserve,
    /// Arrays are treated as sets: sorted by canonical form, duplicates dropped.
    Normalize,
}

/// Structural equality over JSON values.
///
/// Object keys are order-independent, arrays are order-sensitive, and numbers
/// compare numerically (`1` equals `1.0`).
pub fn deep_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => numbers_equal(x, y),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(l, r)| deep_equal(l, r))
        }
        (Value::Object(x), Value::Object(y)) => maps_equal(x, y),
        _ => false,
    }
}

/// [`deep_equal`] lifted to optional values; `None` only equals `None`.
pub fn option_equal(a: Option<&Value>, b: Option<&Value>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => deep_equal(a, b),
        (None, None) => true,
        _ => false,
    }
}

/// Key-order-independent map equality.
pub fn maps_equal(a: &FieldMap, b: &FieldMap) -> bool {
    a.len() == b.len()
        && a
            .iter()
            .all(|(k, v)| b.get(k).is_some_and(|other| deep_equal(v, other)))
}

fn numbers_equal(a: &Number, b: &Number) -> bool {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return x == y;
    }
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        return x == y;
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

/// Whether a value renders as empty in a table cell.
pub fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// Canonical string form of a value: object keys sorted at every level.
///
/// Two values that are [`deep_equal`] produce the same key when arrays are
/// preserved.
pub fn canonical_key(value: &Value, arrays: ArrayOrder) -> String {
    let mut out = String::new();
    write_canonical(value, arrays, &mut out);
    out
}

fn write_canonical(value: &Value, arrays: ArrayOrder, out: &mut String) {
    match value {
        Value::Null | Value::Bool(_) | Value::String(_) => out.push_str(&value.to_string()),
        Value::Number(n) => out.push_str(&canonical_number(n)),
        Value::Array(items) => {
            let mut parts: Vec<String> = items.iter().map(|v| canonical_key(v, arrays)).collect();
            if arrays == ArrayOrder::Normalize {
                parts.sort();
                parts.dedup();
            }
            out.push('[');
            out.push_str(&parts.join(","));
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                if let Some(v) = map.get(key) {
                    write_canonical(v, arrays, out);
                }
            }
            out.push('}');
        }
    }
}

#[allow(clippy::cast_possible_truncation, clippy::float_cmp)]
fn canonical_number(n: &Number) -> String {
    if n.is_i64() || n.is_u64() {
        return n.to_string();
    }
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => (f as i64).to_string(),
        _ => n.to_string(),
    }
}
