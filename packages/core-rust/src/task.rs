//! Open-ended task record routed through the orchestrator.
//!
//! A task is a JSON object. Interceptors and handlers mutate it in place; the
//! orchestrator only relies on two conventions: an id field (configurable name,
//! assigned on push when missing) and "hidden" fields whose keys start with `_`,
//! which are stripped after processing.

use std::ops::{Deref, DerefMut};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Prefix marking a field as hidden (removed after the handler runs).
pub const HIDDEN_FIELD_PREFIX: char = '_';

/// Structured payload routed to a capability handler.
///
/// Serializes transparently as a JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Task(Map<String, Value>);

impl Task {
    /// Creates an empty task.
    #[must_use]
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Builds a task from a JSON value. Returns `None` unless the value is an object.
    #[must_use]
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    /// Consumes the task, returning it as a JSON value.
    #[must_use]
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Returns the id stored under `field`, assigning a fresh UUID v4 when the
    /// field is absent or null. Non-string ids are returned in their JSON text form.
    pub fn ensure_id(&mut self, field: &str) -> String {
        match self.0.get(field) {
            Some(Value::String(id)) => id.clone(),
            Some(Value::Null) | None => {
                let id = Uuid::new_v4().to_string();
                self.0.insert(field.to_string(), Value::String(id.clone()));
                id
            }
            Some(other) => other.to_string(),
        }
    }

    /// Returns the id stored under `field` without assigning one.
    #[must_use]
    pub fn id(&self, field: &str) -> Option<String> {
        match self.0.get(field)? {
            Value::String(id) => Some(id.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    /// Removes every field whose key starts with `_`.
    pub fn strip_hidden_fields(&mut self) {
        self.0.retain(|key, _| !key.starts_with(HIDDEN_FIELD_PREFIX));
    }
}

impl Deref for Task {
    type Target = Map<String, Value>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Task {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<Map<String, Value>> for Task {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn task(value: Value) -> Task {
        Task::from_value(value).unwrap()
    }

    #[test]
    fn from_value_rejects_non_objects() {
        assert!(Task::from_value(json!([1, 2])).is_none());
        assert!(Task::from_value(json!("task")).is_none());
        assert!(Task::from_value(json!({})).is_some());
    }

    #[test]
    fn ensure_id_keeps_existing_string_id() {
        let mut t = task(json!({"id": "abc"}));
        assert_eq!(t.ensure_id("id"), "abc");
        assert_eq!(t["id"], json!("abc"));
    }

    #[test]
    fn ensure_id_assigns_uuid_when_missing_or_null() {
        let mut missing = Task::new();
        let id = missing.ensure_id("id");
        assert!(Uuid::parse_str(&id).is_ok());
        assert_eq!(missing.id("id"), Some(id));

        let mut null = task(json!({"id": null}));
        let id = null.ensure_id("id");
        assert!(Uuid::parse_str(&id).is_ok());
    }

    #[test]
    fn ensure_id_respects_custom_field_and_numeric_ids() {
        let mut t = task(json!({"key": 42}));
        assert_eq!(t.ensure_id("key"), "42");
        assert!(t.get("id").is_none());
    }

    #[test]
    fn strip_hidden_fields_removes_underscore_keys_only() {
        let mut t = task(json!({"_secret": 1, "visible": 2, "a_b": 3}));
        t.strip_hidden_fields();
        assert_eq!(t.into_value(), json!({"visible": 2, "a_b": 3}));
    }

    #[test]
    fn serializes_as_plain_object() {
        let t = task(json!({"foo": "bar"}));
        assert_eq!(serde_json::to_string(&t).unwrap(), r#"{"foo":"bar"}"#);
    }
}
