//! Cache key generation.
//!
//! A key is a fingerprint over `{namespace, operation, normalized request
//! parameters}`. Parameters are canonicalized recursively (object keys
//! sorted at every level) before hashing, so two logically identical
//! requests produce the same key no matter how their fields were ordered.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub namespace: String,
    pub operation: String,
    pub hash: String,
}

impl CacheKey {
    /// Rendered form used as the store key; the readable prefix is what
    /// `clear(pattern)` matches against.
    pub fn render(&self) -> String {
        format!("{}:{}:{}", self.namespace, self.operation, self.hash)
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.render())
    }
}

/// Recursively canonicalize a JSON value: object keys sorted at every level,
/// arrays kept in order, scalars rendered by serde_json.
fn canonicalize(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, String> =
                map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
            let inner: Vec<String> = sorted
                .into_iter()
                .map(|(k, v)| format!("{}:{}", serde_json::to_string(k).unwrap_or_default(), v))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonicalize).collect();
            format!("[{}]", inner.join(","))
        }
        scalar => serde_json::to_string(scalar).unwrap_or_default(),
    }
}

/// Fingerprint an operation's parameters into a [`CacheKey`].
pub fn fingerprint(namespace: &str, operation: &str, params: &Value) -> CacheKey {
    let canonical = format!("{namespace}\n{operation}\n{}", canonicalize(params));
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let hash: String = hasher.finalize().iter().map(|b| format!("{:02x}", b)).collect();
    CacheKey {
        namespace: namespace.to_string(),
        operation: operation.to_string(),
        hash,
    }
}
