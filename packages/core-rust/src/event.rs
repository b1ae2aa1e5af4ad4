//! Task lifecycle events and the argument record threaded through their chains.

use crate::dispatch::InterceptError;
use crate::task::Task;

/// Emitted when a task is pushed. The built-in main interceptor enqueues it.
pub const PUSH: &str = "push";
/// Emitted when a queued task is delivered. The built-in main interceptor runs the handler.
pub const PROCESS: &str = "process";
/// Emitted after a process chain completes.
pub const FINISH: &str = "finish";
/// Emitted after a process chain fails.
pub const FAIL: &str = "fail";

/// Every lifecycle event name, in emission order.
pub const LIFECYCLE: [&str; 4] = [PUSH, PROCESS, FINISH, FAIL];

/// Arguments passed by reference to every interceptor of a lifecycle chain.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskEvent {
    /// Capability name the task is addressed to.
    pub task_type: String,
    /// The task record; interceptors mutate it in place.
    pub task: Task,
    /// The processing error. Only set on `fail` chains.
    pub error: Option<InterceptError>,
}

impl TaskEvent {
    #[must_use]
    pub fn new(task_type: impl Into<String>, task: Task) -> Self {
        Self {
            task_type: task_type.into(),
            task,
            error: None,
        }
    }

    /// Attaches the processing error carried by a `fail` chain.
    #[must_use]
    pub fn with_error(mut self, error: InterceptError) -> Self {
        self.error = Some(error);
        self
    }
}
