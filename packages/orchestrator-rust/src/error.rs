//! Error taxonomy of the orchestrator.
//!
//! - [`UsageError`]: mis-sequenced or invalid calls. Returned synchronously, never retried.
//! - [`OrchestratorError`]: outcome of a push that did not produce a finished task.
//! - [`TransportError`]: transport faults, surfaced through error notifications.
//! - [`ShutdownError`]: reported once by `end()`; shutdown completes regardless.

use quarterback_core::{InterceptError, RegisterError};

use crate::transport::TransportKind;

/// Programmer error detected at the call site.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UsageError {
    #[error(transparent)]
    Register(#[from] RegisterError),

    #[error("an orchestrator can only be started once")]
    AlreadyStarted,

    #[error("the orchestrator has not been started")]
    NotStarted,

    #[error("the orchestrator is shutting down")]
    ShuttingDown,

    #[error("transport {0} has not been declared")]
    UnknownTransport(String),

    #[error("transport {0} has not been started")]
    TransportNotStarted(String),

    #[error("invalid transport name {0:?}")]
    InvalidTransport(String),

    #[error("type {0} is not a registered capability")]
    UnknownCapability(String),

    #[error("invalid contact address {0:?}, expected transport://location")]
    InvalidAddress(String),

    #[error("no tokio runtime is running on this thread")]
    NoRuntime,

    #[error("transport {transport} is {actual}, not {expected}")]
    WrongCallerKind {
        transport: String,
        expected: TransportKind,
        actual: TransportKind,
    },
}

/// Failure of a push or of a transport call made on the orchestrator's behalf.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Usage(#[from] UsageError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The handler or a process interceptor failed.
    #[error("task of type {task_type} failed: {error}")]
    TaskFailed {
        task_type: String,
        error: InterceptError,
    },

    /// A push interceptor failed before the task was enqueued.
    #[error("push of type {task_type} rejected: {error}")]
    Rejected {
        task_type: String,
        error: InterceptError,
    },

    /// A continuation halted the chain.
    #[error("{event} chain for type {task_type} was halted")]
    Halted { event: String, task_type: String },

    /// The orchestrator ended before the task settled.
    #[error("task {task_id} was abandoned during shutdown")]
    Abandoned { task_id: String },

    /// The orchestrator behind a handle has been dropped.
    #[error("the orchestrator is gone")]
    Gone,
}

impl OrchestratorError {
    /// The interceptor error behind a failed or rejected task, if any.
    #[must_use]
    pub fn intercept_error(&self) -> Option<&InterceptError> {
        match self {
            Self::TaskFailed { error, .. } | Self::Rejected { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Transport-level fault.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport {name} failed to start: {reason}")]
    Startup { name: String, reason: String },

    #[error("transport {name} is declared {declared} but started {started}")]
    KindMismatch {
        name: String,
        declared: TransportKind,
        started: TransportKind,
    },

    #[error("transport {name} rejected capabilities {types:?}: {reason}")]
    Propagation {
        name: String,
        types: Vec<String>,
        reason: String,
    },

    #[error("transport {name} failed to subscribe to {channel}: {reason}")]
    Subscribe {
        name: String,
        channel: String,
        reason: String,
    },

    #[error("transport {name} failed to end: {reason}")]
    End { name: String, reason: String },
}

/// Outcome of a shutdown that did not end cleanly.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShutdownError {
    #[error("shutdown timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("shutdown completed with errors: {}", .0.join("; "))]
    Failed(Vec<String>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_failed_exposes_handler_message() {
        let err = OrchestratorError::TaskFailed {
            task_type: "boom".into(),
            error: InterceptError::msg("x"),
        };
        assert_eq!(err.intercept_error().map(InterceptError::message), Some("x"));
        assert_eq!(err.to_string(), "task of type boom failed: x");
    }

    #[test]
    fn register_error_converts_through_usage() {
        let err: OrchestratorError = UsageError::from(RegisterError::MissingEvent).into();
        assert!(matches!(err, OrchestratorError::Usage(UsageError::Register(_))));
    }

    #[test]
    fn shutdown_failures_are_joined() {
        let err = ShutdownError::Failed(vec!["a".into(), "b".into()]);
        assert_eq!(err.to_string(), "shutdown completed with errors: a; b");
    }
}
