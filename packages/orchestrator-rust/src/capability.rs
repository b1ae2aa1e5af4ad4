//! Capability handlers and the table of declared capability types.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use quarterback_core::Task;
use tracing::warn;

/// Processes tasks of one capability type.
///
/// Returning `Err` fails the task: the `process` chain short-circuits and the
/// `fail` chain runs. A panic is treated the same way.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &mut Task) -> anyhow::Result<()>;
}

/// Adapter for synchronous closure handlers; see [`handler_fn`].
pub struct HandlerFn<F>(F);

#[async_trait]
impl<F> TaskHandler for HandlerFn<F>
where
    F: Fn(&mut Task) -> anyhow::Result<()> + Send + Sync,
{
    async fn handle(&self, task: &mut Task) -> anyhow::Result<()> {
        (self.0)(task)
    }
}

/// Wraps a synchronous closure as a [`TaskHandler`].
pub fn handler_fn<F>(f: F) -> HandlerFn<F>
where
    F: Fn(&mut Task) -> anyhow::Result<()> + Send + Sync,
{
    HandlerFn(f)
}

/// A declared capability.
#[derive(Clone)]
pub struct Capability {
    pub task_type: String,
    pub max_concurrent: usize,
    pub handler: Arc<dyn TaskHandler>,
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capability")
            .field("task_type", &self.task_type)
            .field("max_concurrent", &self.max_concurrent)
            .finish_non_exhaustive()
    }
}

/// Declared capabilities in registration order. The first registration of a
/// type wins; later ones are ignored.
#[derive(Default)]
pub struct CapabilityTable {
    entries: RwLock<Vec<Capability>>,
}

impl CapabilityTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the type was already registered.
    pub fn register(
        &self,
        task_type: &str,
        max_concurrent: usize,
        handler: Arc<dyn TaskHandler>,
    ) -> bool {
        let mut entries = self.entries.write();
        if entries.iter().any(|c| c.task_type == task_type) {
            warn!(task_type, "capability already registered, keeping the first handler");
            return false;
        }
        entries.push(Capability {
            task_type: task_type.to_string(),
            max_concurrent,
            handler,
        });
        true
    }

    #[must_use]
    pub fn get(&self, task_type: &str) -> Option<Capability> {
        self.entries
            .read()
            .iter()
            .find(|c| c.task_type == task_type)
            .cloned()
    }

    #[must_use]
    pub fn contains(&self, task_type: &str) -> bool {
        self.entries.read().iter().any(|c| c.task_type == task_type)
    }

    #[must_use]
    pub fn types(&self) -> Vec<String> {
        self.entries.read().iter().map(|c| c.task_type.clone()).collect()
    }

    #[must_use]
    pub fn all(&self) -> Vec<Capability> {
        self.entries.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn first_registration_wins() {
        let table = CapabilityTable::new();
        assert!(table.register(
            "echo",
            5,
            Arc::new(handler_fn(|t: &mut Task| {
                t.insert("by".into(), json!("first"));
                Ok(())
            }))
        ));
        assert!(!table.register("echo", 9, Arc::new(handler_fn(|_: &mut Task| Ok(())))));

        let cap = table.get("echo").unwrap();
        assert_eq!(cap.max_concurrent, 5);
        let mut task = Task::new();
        cap.handler.handle(&mut task).await.unwrap();
        assert_eq!(task["by"], json!("first"));
    }

    #[test]
    fn types_keep_registration_order() {
        let table = CapabilityTable::new();
        for t in ["b", "a", "c"] {
            table.register(t, 1, Arc::new(handler_fn(|_: &mut Task| Ok(()))));
        }
        assert_eq!(table.types(), vec!["b", "a", "c"]);
        assert!(table.contains("a"));
        assert!(!table.contains("z"));
    }
}
