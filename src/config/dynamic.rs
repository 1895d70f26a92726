//! Runtime-adjustable settings
//!
//! The collector can return `{"limits": {...}}` in any file-stream response;
//! those keys are merged here and picked up by the uploader on its next
//! iteration (most importantly `heartbeat_seconds`).

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::{Map, Value};

/// Heartbeat interval used until the collector provides one
pub const DEFAULT_HEARTBEAT_SECONDS: f64 = 30.0;

/// Longest heartbeat interval honored; larger values are clamped
pub const MAX_HEARTBEAT_SECONDS: f64 = 86_400.0;

/// Shared settings store, cheap to clone
#[derive(Debug, Clone, Default)]
pub struct DynamicSettings {
    inner: Arc<RwLock<Map<String, Value>>>,
}

impl DynamicSettings {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded with the given values
    pub fn from_map(values: Map<String, Value>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(values)),
        }
    }

    /// Read a raw value
    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.read().get(key).cloned()
    }

    /// Set a single value
    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.inner.write().insert(key.into(), value);
    }

    /// Merge a `limits` object from a collector response
    pub fn update(&self, limits: &Map<String, Value>) {
        let mut inner = self.inner.write();
        for (key, value) in limits {
            inner.insert(key.clone(), value.clone());
        }
    }

    /// Maximum silence before a keep-alive status post
    pub fn heartbeat(&self) -> Duration {
        let seconds = self
            .inner
            .read()
            .get("heartbeat_seconds")
            .and_then(Value::as_f64)
            .filter(|s| s.is_finite() && *s >= 0.0)
            .unwrap_or(DEFAULT_HEARTBEAT_SECONDS)
            .min(MAX_HEARTBEAT_SECONDS);
        Duration::from_secs_f64(seconds)
    }

    pub fn base_url(&self) -> Option<String> {
        self.get_str("base_url")
    }

    pub fn entity(&self) -> Option<String> {
        self.get_str("entity")
    }

    pub fn project(&self) -> Option<String> {
        self.get_str("project")
    }

    fn get_str(&self, key: &str) -> Option<String> {
        self.inner
            .read()
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}
