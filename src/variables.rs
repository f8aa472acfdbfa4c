// Variables Container
// Concurrency-safe key/value store shared between tasks, stages and jobs.
// Merging is right-biased and pure: the result is always a fresh container.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;

/// A dynamically typed variable value. Template rendering coerces every
/// variant to a string; merging preserves the right-hand tag.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    String(String),
    List(Vec<String>),
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl Value {
    /// Coerce the value to its string form.
    pub fn as_string(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            Value::List(items) => items.join(","),
            Value::Bool(b) => b.to_string(),
            Value::Int(n) => n.to_string(),
            Value::Float(n) => n.to_string(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<Vec<String>> for Value {
    fn from(v: Vec<String>) -> Self {
        Value::List(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

/// Shared key/value container. Cloning yields a handle onto the same store;
/// `merge` and `with` return new, independent containers.
#[derive(Debug, Clone)]
pub struct Variables {
    inner: Arc<RwLock<HashMap<String, Value>>>,
}

impl Variables {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Build a container from any iterator of key/value pairs.
    pub fn from_map<K, V>(values: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        let vars = Self::new();
        for (k, v) in values {
            vars.set(k, v);
        }
        vars
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.into(), value.into());
    }

    pub fn has(&self, key: &str) -> bool {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(key)
    }

    /// Snapshot of the current contents.
    pub fn map(&self) -> HashMap<String, Value> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Snapshot with every value coerced to a string.
    pub fn string_map(&self) -> HashMap<String, String> {
        self.map()
            .into_iter()
            .map(|(k, v)| (k, v.as_string()))
            .collect()
    }

    /// Right-biased merge: `other` overwrites. Neither input is mutated.
    pub fn merge(&self, other: &Variables) -> Variables {
        let dst = Variables::new();
        for (k, v) in self.map() {
            dst.set(k, v);
        }
        for (k, v) in other.map() {
            dst.set(k, v);
        }
        dst
    }

    /// New container with one extra key set.
    pub fn with(&self, key: impl Into<String>, value: impl Into<Value>) -> Variables {
        let dst = self.merge(&Variables::new());
        dst.set(key, value);
        dst
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Variables {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_has() {
        let vars = Variables::new();
        vars.set("key1", "val1");

        assert!(vars.has("key1"));
        assert_eq!(vars.get("key1"), Some(Value::String("val1".to_string())));
        assert_eq!(vars.get("missing"), None);
    }

    #[test]
    fn test_merge_is_right_biased_and_pure() {
        let a = Variables::from_map([("shared", "from-a"), ("only-a", "a")]);
        let b = Variables::from_map([("shared", "from-b"), ("only-b", "b")]);

        let merged = a.merge(&b);

        assert_eq!(merged.get("shared"), Some(Value::String("from-b".into())));
        assert_eq!(merged.get("only-a"), Some(Value::String("a".into())));
        assert_eq!(merged.get("only-b"), Some(Value::String("b".into())));

        // inputs untouched
        assert_eq!(a.get("shared"), Some(Value::String("from-a".into())));
        assert!(!a.has("only-b"));
        assert!(!b.has("only-a"));

        // result is independent of the inputs
        merged.set("shared", "mutated");
        assert_eq!(a.get("shared"), Some(Value::String("from-a".into())));
        assert_eq!(b.get("shared"), Some(Value::String("from-b".into())));
    }

    #[test]
    fn test_with_creates_new_container() {
        let a = Variables::from_map([("Root", "/tmp")]);
        let b = a.with("Root", "/");

        assert_eq!(a.get("Root"), Some(Value::String("/tmp".into())));
        assert_eq!(b.get("Root"), Some(Value::String("/".into())));
    }

    #[test]
    fn test_clone_shares_store() {
        let a = Variables::new();
        let b = a.clone();
        b.set("k", "v");
        assert!(a.has("k"));
    }

    #[test]
    fn test_value_coercion() {
        assert_eq!(Value::Int(123).as_string(), "123");
        assert_eq!(Value::Bool(true).as_string(), "true");
        assert_eq!(Value::String("s".into()).as_string(), "s");
        assert_eq!(
            Value::List(vec!["a".into(), "b".into()]).as_string(),
            "a,b"
        );
    }

    #[test]
    fn test_merge_preserves_right_hand_tag() {
        let a = Variables::from_map([("k", Value::String("1".into()))]);
        let b = Variables::from_map([("k", Value::Int(1))]);
        assert_eq!(a.merge(&b).get("k"), Some(Value::Int(1)));
    }
}
