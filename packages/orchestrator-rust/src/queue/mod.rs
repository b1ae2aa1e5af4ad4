//! Queue backend contract.
//!
//! The orchestrator owns one queue per capability type. Tasks enter through
//! `push` (or `defer`/`recur` when the queue supports scheduling) and leave
//! through the registered [`TaskListener`], which runs the `process` chain.

mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use quarterback_core::{InterceptError, Task};
use serde_json::{Map, Value};

use crate::config::OrchestratorConfig;

pub use memory::{MemoryQueue, MemoryQueueFactory, CAPACITY_OPTION};

/// Receives dequeued tasks.
#[async_trait]
pub trait TaskListener: Send + Sync {
    /// Processes one task. The error is the processing failure, already routed
    /// to the `fail` chain.
    async fn on_task(&self, task: Task) -> Result<(), InterceptError>;

    /// Internal queue fault not tied to a task.
    fn on_error(&self, error: anyhow::Error);
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn push(&self, task: Task) -> anyhow::Result<()>;

    /// Enqueues `task` once the clock reaches `when_ms` (epoch milliseconds).
    async fn defer(&self, task: Task, when_ms: u64) -> anyhow::Result<()> {
        let _ = (task, when_ms);
        anyhow::bail!("this queue does not support deferred tasks")
    }

    /// Enqueues a copy of `task` every `interval_ms` until the queue ends.
    async fn recur(&self, task: Task, interval_ms: u64) -> anyhow::Result<()> {
        let _ = (task, interval_ms);
        anyhow::bail!("this queue does not support recurring tasks")
    }

    /// Starts delivering tasks to `listener`. Called once per queue.
    fn listen(&self, listener: Arc<dyn TaskListener>) -> anyhow::Result<()>;

    /// Stops accepting tasks and waits for in-flight ones to finish.
    async fn end(&self) -> anyhow::Result<()>;
}

/// Everything a factory needs to build the queue of one capability type.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueSpec {
    /// e.g. `qb:service:echo`
    pub key: String,
    pub task_type: String,
    pub max_concurrent: usize,
    /// The type's entry in `OrchestratorConfig::specific`.
    pub options: Map<String, Value>,
}

impl QueueSpec {
    #[must_use]
    pub fn new(config: &OrchestratorConfig, task_type: &str, max_concurrent: usize) -> Self {
        Self {
            key: config.queue_key(task_type),
            task_type: task_type.to_string(),
            max_concurrent,
            options: config.specific.get(task_type).cloned().unwrap_or_default(),
        }
    }
}

pub trait QueueFactory: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the backend cannot provide a queue for `spec`.
    fn create(&self, spec: &QueueSpec) -> anyhow::Result<Arc<dyn TaskQueue>>;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn spec_picks_up_key_and_specific_options() {
        let mut config = OrchestratorConfig::default();
        config.specific.insert(
            "echo".into(),
            json!({"capacity": 4}).as_object().cloned().unwrap(),
        );

        let spec = QueueSpec::new(&config, "echo", 7);
        assert_eq!(spec.key, "qb:service:echo");
        assert_eq!(spec.max_concurrent, 7);
        assert_eq!(spec.options["capacity"], json!(4));
        assert!(QueueSpec::new(&config, "other", 1).options.is_empty());
    }
}
