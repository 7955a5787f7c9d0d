//! Shared argument dictionary consulted by conditional transitions.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;

/// String keys to JSON values, shared by every action of one machine.
#[derive(Debug, Default)]
pub struct SharedArgs {
    inner: RwLock<BTreeMap<String, Value>>,
}

impl SharedArgs {
    /// Empty dictionary.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of `key`.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.read().get(key).cloned()
    }

    /// Set `key`, returning the previous value.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.inner.write().insert(key.into(), value.into())
    }

    /// Remove `key`.
    pub fn remove(&self, key: &str) -> Option<Value> {
        self.inner.write().remove(key)
    }

    /// Whether `key` currently holds exactly `value`.
    pub fn matches(&self, key: &str, value: &Value) -> bool {
        self.inner.read().get(key) == Some(value)
    }

    /// `key` as a bool, `false` when absent or not a bool.
    pub fn flag(&self, key: &str) -> bool {
        self.inner
            .read()
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Copy of every entry.
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.inner.read().clone()
    }

    /// Remove every entry.
    pub fn clear(&self) {
        self.inner.write().clear();
    }
}
