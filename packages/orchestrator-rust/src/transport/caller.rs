//! Destination-bound caller handles.
//!
//! A [`Caller`] binds one started transport to one destination: an endpoint
//! for request/response transports, a channel for publish/subscribe ones.
//! The registry caches callers per `(transport, destination)`, so repeated
//! lookups return the same `Arc` and subscriptions made through any of them
//! accumulate on the same channel.

use std::fmt;
use std::sync::Arc;

use quarterback_core::Task;
use tokio::runtime::Handle;
use tracing::debug;

use super::traits::{
    MessageHandler, OrchestratorHandle, PubSubTransport, RequestResponseTransport, TransportKind,
};
use crate::error::{OrchestratorError, TransportError, UsageError};

/// Kind-specific caller handle. Cloning shares the underlying caller.
#[derive(Clone, Debug)]
pub enum Caller {
    RequestResponse(Arc<RpcCaller>),
    PubSub(Arc<PubSubCaller>),
}

impl Caller {
    #[must_use]
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::RequestResponse(_) => TransportKind::RequestResponse,
            Self::PubSub(_) => TransportKind::PubSub,
        }
    }

    #[must_use]
    pub fn transport(&self) -> &str {
        match self {
            Self::RequestResponse(c) => &c.transport,
            Self::PubSub(c) => &c.transport,
        }
    }

    /// # Errors
    ///
    /// Returns [`UsageError::WrongCallerKind`] for a publish/subscribe caller.
    pub fn as_rpc(&self) -> Result<&Arc<RpcCaller>, UsageError> {
        match self {
            Self::RequestResponse(c) => Ok(c),
            Self::PubSub(_) => Err(self.wrong_kind(TransportKind::RequestResponse)),
        }
    }

    /// # Errors
    ///
    /// Returns [`UsageError::WrongCallerKind`] for a request/response caller.
    pub fn as_pubsub(&self) -> Result<&Arc<PubSubCaller>, UsageError> {
        match self {
            Self::PubSub(c) => Ok(c),
            Self::RequestResponse(_) => Err(self.wrong_kind(TransportKind::PubSub)),
        }
    }

    /// Whether both handles share the same underlying caller.
    #[must_use]
    pub fn ptr_eq(&self, other: &Caller) -> bool {
        match (self, other) {
            (Self::RequestResponse(a), Self::RequestResponse(b)) => Arc::ptr_eq(a, b),
            (Self::PubSub(a), Self::PubSub(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    fn wrong_kind(&self, expected: TransportKind) -> UsageError {
        UsageError::WrongCallerKind {
            transport: self.transport().to_string(),
            expected,
            actual: self.kind(),
        }
    }
}

// ---------------------------------------------------------------------------
// Request/response
// ---------------------------------------------------------------------------

pub struct RpcCaller {
    transport: String,
    endpoint: String,
    inner: Arc<dyn RequestResponseTransport>,
}

impl RpcCaller {
    pub(crate) fn new(
        transport: impl Into<String>,
        endpoint: impl Into<String>,
        inner: Arc<dyn RequestResponseTransport>,
    ) -> Self {
        Self {
            transport: transport.into(),
            endpoint: endpoint.into(),
            inner,
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Pushes a task of `task_type` to the bound endpoint.
    ///
    /// # Errors
    ///
    /// Returns whatever the transport reports: delivery failure, or the remote
    /// task failure.
    pub async fn push(&self, task_type: &str, task: Task) -> anyhow::Result<Task> {
        debug!(transport = %self.transport, endpoint = %self.endpoint, task_type, "remote push");
        self.inner.push(&self.endpoint, task_type, task).await
    }

    /// A new, uncached caller on the same transport bound to `endpoint`.
    #[must_use]
    pub fn to(&self, endpoint: impl Into<String>) -> RpcCaller {
        RpcCaller::new(self.transport.clone(), endpoint, Arc::clone(&self.inner))
    }
}

impl fmt::Debug for RpcCaller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcCaller")
            .field("transport", &self.transport)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Publish/subscribe
// ---------------------------------------------------------------------------

type MessageCallback = Arc<dyn Fn(&Task) + Send + Sync>;

/// What to do with each message arriving on a subscribed channel.
#[derive(Clone)]
pub enum SubscribeAction {
    /// Invoke a callback with the raw message.
    Callback(MessageCallback),
    /// Push the message as a task of this capability type into the local pipeline.
    Capability(String),
}

impl SubscribeAction {
    pub fn callback<F>(f: F) -> Self
    where
        F: Fn(&Task) + Send + Sync + 'static,
    {
        Self::Callback(Arc::new(f))
    }

    pub fn capability(task_type: impl Into<String>) -> Self {
        Self::Capability(task_type.into())
    }
}

impl From<&str> for SubscribeAction {
    fn from(task_type: &str) -> Self {
        Self::capability(task_type)
    }
}

impl fmt::Debug for SubscribeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Callback(_) => f.write_str("Callback"),
            Self::Capability(t) => f.debug_tuple("Capability").field(t).finish(),
        }
    }
}

pub struct PubSubCaller {
    transport: String,
    channel: String,
    inner: Arc<dyn PubSubTransport>,
    orchestrator: OrchestratorHandle,
}

impl PubSubCaller {
    pub(crate) fn new(
        transport: impl Into<String>,
        channel: impl Into<String>,
        inner: Arc<dyn PubSubTransport>,
        orchestrator: OrchestratorHandle,
    ) -> Self {
        Self {
            transport: transport.into(),
            channel: channel.into(),
            inner,
            orchestrator,
        }
    }

    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Publishes `task` on the bound channel.
    ///
    /// # Errors
    ///
    /// Returns the transport's publish error.
    pub async fn publish(&self, task: Task) -> anyhow::Result<()> {
        self.publish_to(&self.channel, task).await
    }

    /// Publishes `task` on an explicit channel of the same transport.
    ///
    /// # Errors
    ///
    /// Returns the transport's publish error.
    pub async fn publish_to(&self, channel: &str, task: Task) -> anyhow::Result<()> {
        debug!(transport = %self.transport, channel, "publish");
        self.inner.publish(channel, task).await
    }

    /// Subscribes the bound channel. Every message runs the callback actions in
    /// order, then pushes one task per capability action.
    ///
    /// Capability pushes are spawned on the tokio runtime current at subscribe
    /// time, so the transport may deliver messages from any thread.
    ///
    /// # Errors
    ///
    /// Returns [`UsageError::NoRuntime`] if capability actions are given outside
    /// a tokio runtime.
    /// Returns [`UsageError::UnknownCapability`] if a capability action names a
    /// type that is not registered; nothing is subscribed in that case. Returns
    /// [`TransportError::Subscribe`] if the transport refuses the subscription.
    pub fn subscribe<I>(&self, actions: I) -> Result<(), OrchestratorError>
    where
        I: IntoIterator<Item = SubscribeAction>,
    {
        let actions: Vec<SubscribeAction> = actions.into_iter().collect();
        for action in &actions {
            if let SubscribeAction::Capability(task_type) = action {
                if !self.orchestrator.has_capability(task_type) {
                    return Err(UsageError::UnknownCapability(task_type.clone()).into());
                }
            }
        }

        let (callbacks, capabilities): (Vec<_>, Vec<_>) = actions
            .into_iter()
            .partition(|a| matches!(a, SubscribeAction::Callback(_)));
        let runtime = match Handle::try_current() {
            Ok(handle) => Some(handle),
            Err(_) if capabilities.is_empty() => None,
            Err(_) => return Err(UsageError::NoRuntime.into()),
        };
        let orchestrator = self.orchestrator.clone();
        let on_message: MessageHandler = Arc::new(move |task: Task| {
            for action in &callbacks {
                if let SubscribeAction::Callback(f) = action {
                    f(&task);
                }
            }
            let Some(runtime) = &runtime else { return };
            for action in &capabilities {
                if let SubscribeAction::Capability(task_type) = action {
                    spawn_push(runtime, orchestrator.clone(), task_type.clone(), task.clone());
                }
            }
        });

        self.inner
            .subscribe(&self.channel, on_message)
            .map_err(|e| {
                TransportError::Subscribe {
                    name: self.transport.clone(),
                    channel: self.channel.clone(),
                    reason: format!("{e:#}"),
                }
                .into()
            })
    }
}

fn spawn_push(runtime: &Handle, orchestrator: OrchestratorHandle, task_type: String, task: Task) {
    runtime.spawn(async move {
        match orchestrator.push(&task_type, task).await {
            // The fail chain already saw it.
            Ok(_) | Err(OrchestratorError::TaskFailed { .. }) => {}
            Err(error) => orchestrator.report("subscribe", anyhow::Error::new(error)),
        }
    });
}

impl fmt::Debug for PubSubCaller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PubSubCaller")
            .field("transport", &self.transport)
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}
