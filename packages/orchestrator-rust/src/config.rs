//! Orchestrator configuration.
//!
//! Plain structs with defaults. Every struct is deserializable with
//! `#[serde(default)]` so an embedder can load a partial document with any
//! loader and fall back to the defaults for the rest.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};

/// Options handed to a transport at startup: a JSON object.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct TransportOptions(Map<String, Value>);

impl TransportOptions {
    #[must_use]
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Adds or replaces one option.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    #[must_use]
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(Value::as_u64)
    }

    /// Returns these options overlaid on `defaults`: keys present here win.
    #[must_use]
    pub fn merged_over(&self, defaults: &TransportOptions) -> TransportOptions {
        let mut merged = defaults.0.clone();
        merged.extend(self.0.iter().map(|(k, v)| (k.clone(), v.clone())));
        TransportOptions(merged)
    }

    #[must_use]
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

impl From<Map<String, Value>> for TransportOptions {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Prefix of every queue key.
    pub prefix: String,
    /// Separator between queue key segments.
    pub delimiter: String,
    /// Task field holding the task id.
    pub id_field: String,
    /// Default concurrency limit per capability type.
    pub max_concurrent_callbacks: usize,
    /// Route tasks carrying `defer_field` to the queue's `defer`.
    pub allow_defer: bool,
    /// Task field holding the epoch-millisecond time a deferred task becomes due.
    pub defer_field: String,
    /// Route tasks carrying `recur_field` to the queue's `recur`.
    pub allow_recur: bool,
    /// Task field holding a recurrence interval in milliseconds.
    pub recur_field: String,
    /// Upper bound on `end()`. There is no unbounded mode.
    pub end_timeout_ms: u64,
    /// Buffer size of the notification broadcast channel.
    pub notification_capacity: usize,
    /// Options every transport starts from; per-transport options overlay them.
    pub transport_defaults: TransportOptions,
    /// Per-capability-type queue options.
    pub specific: HashMap<String, Map<String, Value>>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            prefix: "qb".to_string(),
            delimiter: ":".to_string(),
            id_field: "id".to_string(),
            max_concurrent_callbacks: 100,
            allow_defer: true,
            defer_field: "when".to_string(),
            allow_recur: true,
            recur_field: "every".to_string(),
            end_timeout_ms: 10_000,
            notification_capacity: 256,
            transport_defaults: TransportOptions::default(),
            specific: HashMap::new(),
        }
    }
}

impl OrchestratorConfig {
    #[must_use]
    pub fn end_timeout(&self) -> Duration {
        Duration::from_millis(self.end_timeout_ms)
    }

    /// Queue key for a capability type, e.g. `qb:service:echo`.
    #[must_use]
    pub fn queue_key(&self, task_type: &str) -> String {
        [self.prefix.as_str(), "service", task_type].join(self.delimiter.as_str())
    }
}
