//! Cache-key derivation.
//!
//! A cache key identifies one query's cached result: the endpoint name plus
//! a canonical rendering of its arguments. The default deriver serializes
//! arguments as JSON with object keys emitted in sorted order at every
//! nesting level, so `{"a":1,"b":2}` and `{"b":2,"a":1}` collide to the
//! same key while `[1,2]` and `[2,1]` stay distinct.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Deterministic string identifying one query's cached result.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Wraps an already-derived key. Prefer [`default_cache_key`] or the
    /// engine's configured serializer.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pluggable cache-key deriver.
///
/// Must be total for JSON values: a deriver that panics for contractually
/// valid arguments is a programming error, not a runtime error path.
pub type KeySerializer = Arc<dyn Fn(&str, &Value) -> CacheKey + Send + Sync>;

/// The default deriver: `endpoint(<canonical json args>)`.
pub fn default_cache_key(endpoint: &str, args: &Value) -> CacheKey {
    let mut out = String::with_capacity(endpoint.len() + 16);
    out.push_str(endpoint);
    out.push('(');
    write_canonical(&mut out, args);
    out.push(')');
    CacheKey(out)
}

/// Writes `value` as JSON with recursively sorted object keys.
fn write_canonical(out: &mut String, value: &Value) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();

            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Object keys are strings; serializing a string is infallible.
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(out, &map[*key]);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(out, item);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_order_does_not_matter() {
        let a = default_cache_key("getPost", &json!({"a": 1, "b": 2}));
        let b = default_cache_key("getPost", &json!({"b": 2, "a": 1}));
        assert_eq!(a, b);
    }

    #[test]
    fn test_nested_key_order_does_not_matter() {
        let a = default_cache_key("search", &json!({"filter": {"x": 1, "y": [ {"q": 1, "p": 2} ]}}));
        let b = default_cache_key("search", &json!({"filter": {"y": [ {"p": 2, "q": 1} ], "x": 1}}));
        assert_eq!(a, b);
    }

    #[test]
    fn test_array_order_matters() {
        let a = default_cache_key("list", &json!([1, 2]));
        let b = default_cache_key("list", &json!([2, 1]));
        assert_ne!(a, b);
    }

    #[test]
    fn test_endpoint_distinguishes_keys() {
        let a = default_cache_key("getPost", &json!("3"));
        let b = default_cache_key("getUser", &json!("3"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_scalar_args() {
        assert_eq!(default_cache_key("getPost", &json!("3")).as_str(), "getPost(\"3\")");
        assert_eq!(default_cache_key("getPost", &json!(3)).as_str(), "getPost(3)");
        assert_eq!(default_cache_key("getAll", &Value::Null).as_str(), "getAll(null)");
    }

    #[test]
    fn test_string_keys_are_escaped() {
        let key = default_cache_key("q", &json!({"we\"ird": 1}));
        assert_eq!(key.as_str(), r#"q({"we\"ird":1})"#);
    }
}
