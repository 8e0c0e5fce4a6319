//! Canonical JSON serialization for stable bundle/claim digests.
//!
//! `serde_json::Map` here is backed by a `BTreeMap` (the crate's
//! `preserve_order` feature is deliberately not enabled), so object keys
//! come out of `serde_json::to_value` already sorted. `to_canonical_string`
//! only needs to additionally strip whitespace and recurse into nested
//! values, matching the compact, key-sorted form described by RFC 8785.

use crate::errors::{CnabError, Result};
use serde::Serialize;
use serde_json::Value;

/// Serialize `value` to canonical JSON: object keys sorted, no
/// insignificant whitespace, numbers and strings as `serde_json` would
/// normally escape them.
///
/// Idempotent: `to_canonical_string(&from_str(&to_canonical_string(v)))`
/// equals `to_canonical_string(v)` for any JSON-representable `v`.
pub fn to_canonical_string<T: Serialize>(value: &T) -> Result<String> {
    let json = serde_json::to_value(value)
        .map_err(|e| CnabError::schema(format!("failed to serialize to JSON: {e}")))?;
    let canonical = canonicalize(json);
    serde_json::to_string(&canonical)
        .map_err(|e| CnabError::schema(format!("failed to render canonical JSON: {e}")))
}

/// Recursively sort object keys (already alphabetical via `BTreeMap`, this
/// normalizes any value built by hand with `serde_json::json!`) and
/// normalize nested containers.
pub fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted = serde_json::Map::new();
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(map[key].clone()));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// Parse canonical (or any valid) JSON text back into a `T`.
pub fn from_str<T: serde::de::DeserializeOwned>(text: &str) -> Result<T> {
    serde_json::from_str(text).map_err(|e| CnabError::schema(format!("invalid JSON: {e}")))
}
