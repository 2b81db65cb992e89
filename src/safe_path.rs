//! Non-panicking lookups into deeply nested upstream JSON.
//!
//! Upstream envelopes routinely drop or retype nested fields. Every parser goes
//! through [`lookup`] and the typed helpers below instead of indexing `Value`
//! directly, so a missing key, a wrong type or an out-of-range index always
//! collapses to the caller's default.

use serde_json::Value;

#[derive(Debug, Clone, Copy)]
pub enum Seg<'a> {
    Key(&'a str),
    Idx(usize),
}

impl<'a> From<&'a str> for Seg<'a> {
    fn from(value: &'a str) -> Self {
        Seg::Key(value)
    }
}

impl From<usize> for Seg<'_> {
    fn from(value: usize) -> Self {
        Seg::Idx(value)
    }
}

/// Builds a `&[Seg]` from mixed keys and indices: `path!["data", "list", 0]`.
#[macro_export]
macro_rules! path {
    ($($seg:expr),* $(,)?) => {
        &[$($crate::safe_path::Seg::from($seg)),*]
    };
}

pub fn lookup<'v>(root: &'v Value, path: &[Seg<'_>]) -> Option<&'v Value> {
    let mut current = root;
    for seg in path {
        current = match (seg, current) {
            (Seg::Key(key), Value::Object(map)) => map.get(*key)?,
            (Seg::Idx(idx), Value::Array(items)) => items.get(*idx)?,
            _ => return None,
        };
    }
    if current.is_null() { None } else { Some(current) }
}

/// String at `path`; numbers and booleans are rendered, anything else yields `default`.
pub fn str_or(root: &Value, path: &[Seg<'_>], default: &str) -> String {
    match lookup(root, path) {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => default.to_string(),
    }
}

pub fn i64_or(root: &Value, path: &[Seg<'_>], default: i64) -> i64 {
    match lookup(root, path) {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(default),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
        _ => default,
    }
}

pub fn array<'v>(root: &'v Value, path: &[Seg<'_>]) -> &'v [Value] {
    match lookup(root, path) {
        Some(Value::Array(items)) => items.as_slice(),
        _ => &[],
    }
}
