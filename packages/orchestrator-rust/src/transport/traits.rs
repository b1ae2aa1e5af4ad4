//! Transport contracts.
//!
//! A [`TransportFactory`] is declared on the orchestrator and started at most
//! once. Startup yields a [`TransportInstance`] of the declared kind. Instances
//! reach back into the orchestrator only through an [`OrchestratorHandle`],
//! which holds a weak reference so a transport never keeps its orchestrator alive.

use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use quarterback_core::Task;
use tracing::warn;

use crate::config::TransportOptions;
use crate::error::OrchestratorError;

// ---------------------------------------------------------------------------
// Kinds and instances
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    RequestResponse,
    PubSub,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::RequestResponse => "request-response",
            Self::PubSub => "pub-sub",
        })
    }
}

/// Callback invoked with every message delivered on a subscribed channel.
pub type MessageHandler = Arc<dyn Fn(Task) + Send + Sync>;

/// Request/response transport instance.
#[async_trait]
pub trait RequestResponseTransport: Send + Sync {
    /// Registers capability types this instance serves. The registry passes
    /// each type at most once per instance.
    fn can(&self, types: &[String]) -> anyhow::Result<()>;

    /// Sends a task to `destination` and resolves with the remote result.
    async fn push(&self, destination: &str, task_type: &str, task: Task) -> anyhow::Result<Task>;

    async fn end(&self) -> anyhow::Result<()>;
}

/// Publish/subscribe transport instance.
#[async_trait]
pub trait PubSubTransport: Send + Sync {
    fn subscribe(&self, channel: &str, on_message: MessageHandler) -> anyhow::Result<()>;

    async fn publish(&self, channel: &str, task: Task) -> anyhow::Result<()>;

    async fn end(&self) -> anyhow::Result<()>;
}

/// A started transport.
#[derive(Clone)]
pub enum TransportInstance {
    RequestResponse(Arc<dyn RequestResponseTransport>),
    PubSub(Arc<dyn PubSubTransport>),
}

impl TransportInstance {
    #[must_use]
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::RequestResponse(_) => TransportKind::RequestResponse,
            Self::PubSub(_) => TransportKind::PubSub,
        }
    }

    pub(crate) async fn end(&self) -> anyhow::Result<()> {
        match self {
            Self::RequestResponse(t) => t.end().await,
            Self::PubSub(t) => t.end().await,
        }
    }
}

impl fmt::Debug for TransportInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransportInstance({})", self.kind())
    }
}

/// Descriptor of a transport implementation.
pub trait TransportFactory: Send + Sync {
    /// Registry key and the scheme used in `name://location` addresses.
    fn name(&self) -> &str;

    fn kind(&self) -> TransportKind;

    /// Creates the instance. Called at most once per declaration.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot be brought up with `options`.
    fn startup(
        &self,
        orchestrator: OrchestratorHandle,
        options: &TransportOptions,
    ) -> anyhow::Result<TransportInstance>;
}

// ---------------------------------------------------------------------------
// Orchestrator back-reference
// ---------------------------------------------------------------------------

/// The part of the orchestrator a transport may call.
#[async_trait]
pub trait TaskSink: Send + Sync {
    fn has_capability(&self, task_type: &str) -> bool;

    /// Pushes a task into the local pipeline and waits for it to settle.
    async fn push(&self, task_type: &str, task: Task) -> Result<Task, OrchestratorError>;

    /// Surfaces a fault as an error notification.
    fn report(&self, source: &str, error: anyhow::Error);
}

/// Weak, cloneable reference to the orchestrator handed to transports.
#[derive(Clone, Default)]
pub struct OrchestratorHandle {
    inner: Option<Weak<dyn TaskSink>>,
}

impl OrchestratorHandle {
    #[must_use]
    pub fn new(inner: Weak<dyn TaskSink>) -> Self {
        Self { inner: Some(inner) }
    }

    /// A handle bound to no orchestrator. Pushes fail with [`OrchestratorError::Gone`].
    #[must_use]
    pub fn detached() -> Self {
        Self { inner: None }
    }

    fn sink(&self) -> Option<Arc<dyn TaskSink>> {
        self.inner.as_ref().and_then(Weak::upgrade)
    }

    #[must_use]
    pub fn has_capability(&self, task_type: &str) -> bool {
        self.sink().is_some_and(|s| s.has_capability(task_type))
    }

    /// # Errors
    ///
    /// Returns [`OrchestratorError::Gone`] if the orchestrator was dropped,
    /// otherwise whatever the push itself returns.
    pub async fn push(&self, task_type: &str, task: Task) -> Result<Task, OrchestratorError> {
        match self.sink() {
            Some(sink) => sink.push(task_type, task).await,
            None => Err(OrchestratorError::Gone),
        }
    }

    pub fn report(&self, source: &str, error: anyhow::Error) {
        match self.sink() {
            Some(sink) => sink.report(source, error),
            None => warn!(source, error = %format!("{error:#}"), "fault reported to a detached handle"),
        }
    }
}

impl fmt::Debug for OrchestratorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestratorHandle")
            .field("attached", &self.sink().is_some())
            .finish()
    }
}
