//! The orchestrator facade.
//!
//! An [`Orchestrator`] holds the capability table, one queue per capability,
//! the transport registry, and an [`EventDispatcher`] over [`TaskEvent`]s.
//! A pushed task flows through four chains:
//!
//! 1. `push`: built-in main interceptor enqueues the task (or defers/recurs it).
//! 2. `process`: run when the queue delivers; built-in main interceptors run the
//!    capability handler and then strip hidden fields.
//! 3. `finish` after a completed `process` chain, or
//! 4. `fail` after a failed one, with the error on [`TaskEvent::error`].
//!
//! `push` resolves once the task settles: with the finished task, or with
//! [`OrchestratorError::TaskFailed`] after the `fail` chain completes. A `fail`
//! chain that halts (a retry is pending) leaves the push unsettled until the
//! retried task settles under the same id.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::join_all;
use quarterback_core::{
    event, ChainBuilder, Continuation, Emission, EventDispatcher, Flow, InterceptError,
    RegisterError, Task, TaskEvent,
};
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info};

use crate::capability::{Capability, CapabilityTable, TaskHandler};
use crate::config::{OrchestratorConfig, TransportOptions};
use crate::error::{OrchestratorError, ShutdownError, UsageError};
use crate::middleware::delete_hidden_fields;
use crate::notify::{Notification, Notifier};
use crate::queue::{MemoryQueueFactory, QueueFactory, QueueSpec, TaskListener, TaskQueue};
use crate::shutdown::{LifecycleController, LifecycleState};
use crate::transport::{
    Address, Caller, OrchestratorHandle, TaskSink, TransportFactory, TransportInstance,
    TransportRegistry,
};

type QueueMap = DashMap<String, Arc<dyn TaskQueue>>;
type Settlement = Result<Task, OrchestratorError>;

// ---------------------------------------------------------------------------
// Scheduling fields
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Schedule {
    Now,
    Defer(u64),
    Recur(u64),
}

impl Schedule {
    fn is_scheduled(self) -> bool {
        self != Schedule::Now
    }
}

#[derive(Debug, Clone)]
struct ScheduleFields {
    allow_defer: bool,
    defer_field: String,
    allow_recur: bool,
    recur_field: String,
}

impl ScheduleFields {
    fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            allow_defer: config.allow_defer,
            defer_field: config.defer_field.clone(),
            allow_recur: config.allow_recur,
            recur_field: config.recur_field.clone(),
        }
    }

    /// A positive number in the defer field wins over one in the recur field.
    fn of(&self, task: &Task) -> Schedule {
        let positive = |field: &str| task.get(field).and_then(positive_millis);
        if self.allow_defer {
            if let Some(when) = positive(&self.defer_field) {
                return Schedule::Defer(when);
            }
        }
        if self.allow_recur {
            if let Some(every) = positive(&self.recur_field) {
                return Schedule::Recur(every);
            }
        }
        Schedule::Now
    }
}

/// Milliseconds from a JSON number. Fractions round up so any positive value
/// schedules; zero, negatives and non-numbers do not.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn positive_millis(value: &Value) -> Option<u64> {
    if let Some(millis) = value.as_u64() {
        return (millis > 0).then_some(millis);
    }
    let millis = value.as_f64()?;
    (millis.is_finite() && millis > 0.0).then(|| millis.ceil() as u64)
}

// ---------------------------------------------------------------------------
// Push waiters
// ---------------------------------------------------------------------------

/// Pending pushes keyed by task id.
#[derive(Default)]
struct Waiters {
    pending: DashMap<String, Vec<(u64, oneshot::Sender<Settlement>)>>,
    next_token: AtomicU64,
}

impl Waiters {
    fn register(&self, id: &str) -> (u64, oneshot::Receiver<Settlement>) {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.entry(id.to_string()).or_default().push((token, tx));
        (token, rx)
    }

    fn cancel(&self, id: &str, token: u64) {
        if let Some(mut waiters) = self.pending.get_mut(id) {
            waiters.retain(|(t, _)| *t != token);
        }
        self.pending.remove_if(id, |_, waiters| waiters.is_empty());
    }

    fn settle(&self, id: &str, outcome: &Settlement) {
        if let Some((_, waiters)) = self.pending.remove(id) {
            for (_, tx) in waiters {
                // The pushing side may have given up.
                let _ = tx.send(outcome.clone());
            }
        }
    }

    fn release_all(&self) {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            let abandoned = Err(OrchestratorError::Abandoned { task_id: id.clone() });
            self.settle(&id, &abandoned);
        }
    }

    fn len(&self) -> usize {
        self.pending.len()
    }
}

// ---------------------------------------------------------------------------
// Built-in interceptors
// ---------------------------------------------------------------------------

/// main:push. Hands the task to its type's queue.
struct Enqueue {
    queues: Arc<QueueMap>,
    schedule: ScheduleFields,
}

#[async_trait]
impl Continuation<TaskEvent> for Enqueue {
    async fn call(&self, ev: &mut TaskEvent) -> Result<Flow, InterceptError> {
        let queue = self
            .queues
            .get(&ev.task_type)
            .map(|q| Arc::clone(q.value()))
            .ok_or_else(|| InterceptError::msg(format!("no queue for type {}", ev.task_type)))?;
        match self.schedule.of(&ev.task) {
            Schedule::Now => queue.push(ev.task.clone()).await?,
            Schedule::Defer(when) => queue.defer(ev.task.clone(), when).await?,
            Schedule::Recur(every) => queue.recur(ev.task.clone(), every).await?,
        }
        Ok(Flow::Proceed)
    }
}

/// main:process. Runs the capability handler.
struct InvokeHandler {
    capabilities: Arc<CapabilityTable>,
}

#[async_trait]
impl Continuation<TaskEvent> for InvokeHandler {
    async fn call(&self, ev: &mut TaskEvent) -> Result<Flow, InterceptError> {
        let capability = self.capabilities.get(&ev.task_type).ok_or_else(|| {
            InterceptError::msg(format!("type {} is not a registered capability", ev.task_type))
        })?;
        capability.handler.handle(&mut ev.task).await?;
        Ok(Flow::Proceed)
    }
}

fn install_builtins(
    dispatcher: &EventDispatcher<TaskEvent>,
    capabilities: &Arc<CapabilityTable>,
    queues: &Arc<QueueMap>,
    schedule: &ScheduleFields,
) -> Result<(), RegisterError> {
    dispatcher.on(event::PUSH)?.continuation(Enqueue {
        queues: Arc::clone(queues),
        schedule: schedule.clone(),
    });
    dispatcher
        .on(event::PROCESS)?
        .continuation(InvokeHandler {
            capabilities: Arc::clone(capabilities),
        })
        .fire_and_forget(delete_hidden_fields());
    Ok(())
}

/// Feeds one queue's deliveries into the `process` chain.
struct ProcessListener {
    task_type: String,
    orchestrator: Weak<Orchestrator>,
}

#[async_trait]
impl TaskListener for ProcessListener {
    async fn on_task(&self, task: Task) -> Result<(), InterceptError> {
        match self.orchestrator.upgrade() {
            Some(orchestrator) => orchestrator.process(&self.task_type, task).await,
            None => Err(InterceptError::msg("orchestrator dropped")),
        }
    }

    fn on_error(&self, error: anyhow::Error) {
        if let Some(orchestrator) = self.orchestrator.upgrade() {
            orchestrator
                .notifier
                .error(format!("queue:{}", self.task_type), format!("{error:#}"));
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Capability registry, transport registry, and task pipeline in one place.
///
/// Built with [`Orchestrator::new`]; always handled through an `Arc`.
pub struct Orchestrator {
    config: OrchestratorConfig,
    dispatcher: Arc<EventDispatcher<TaskEvent>>,
    capabilities: Arc<CapabilityTable>,
    queues: Arc<QueueMap>,
    queue_factory: Arc<dyn QueueFactory>,
    transports: TransportRegistry,
    contacts: DashMap<String, Caller>,
    waiters: Waiters,
    lifecycle: LifecycleController,
    notifier: Notifier,
    schedule: ScheduleFields,
    started: AtomicBool,
    ended: AtomicBool,
    self_ref: Weak<Orchestrator>,
}

impl Orchestrator {
    /// Creates an orchestrator backed by in-memory queues.
    #[must_use]
    pub fn new(config: OrchestratorConfig) -> Arc<Self> {
        Self::with_queue_factory(config, Arc::new(MemoryQueueFactory::default()))
    }

    #[must_use]
    pub fn with_queue_factory(
        config: OrchestratorConfig,
        queue_factory: Arc<dyn QueueFactory>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let sink: Weak<dyn TaskSink> = weak.clone();
            let notifier = Notifier::new(config.notification_capacity);
            let dispatcher = Arc::new(EventDispatcher::new());
            let capabilities = Arc::new(CapabilityTable::new());
            let queues = Arc::new(DashMap::new());
            let schedule = ScheduleFields::from_config(&config);
            if let Err(error) = install_builtins(&dispatcher, &capabilities, &queues, &schedule) {
                error!(%error, "failed to install built-in interceptors");
            }
            let transports = TransportRegistry::new(
                config.transport_defaults.clone(),
                OrchestratorHandle::new(sink),
                notifier.clone(),
            );

            Self {
                config,
                dispatcher,
                capabilities,
                queues,
                queue_factory,
                transports,
                contacts: DashMap::new(),
                waiters: Waiters::default(),
                lifecycle: LifecycleController::new(),
                notifier,
                schedule,
                started: AtomicBool::new(false),
                ended: AtomicBool::new(false),
                self_ref: weak.clone(),
            }
        })
    }

    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    #[must_use]
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Notification> {
        self.notifier.subscribe()
    }

    // -- interceptor registration -------------------------------------------

    #[must_use]
    pub fn dispatcher(&self) -> &Arc<EventDispatcher<TaskEvent>> {
        &self.dispatcher
    }

    /// # Errors
    ///
    /// Returns [`RegisterError::MissingEvent`] if `event` is empty.
    pub fn pre(&self, event: &str) -> Result<ChainBuilder<'_, TaskEvent>, RegisterError> {
        self.dispatcher.pre(event)
    }

    /// # Errors
    ///
    /// Returns [`RegisterError::MissingEvent`] if `event` is empty.
    pub fn once(&self, event: &str) -> Result<ChainBuilder<'_, TaskEvent>, RegisterError> {
        self.dispatcher.once(event)
    }

    /// # Errors
    ///
    /// Returns [`RegisterError::MissingEvent`] if `event` is empty.
    pub fn on(&self, event: &str) -> Result<ChainBuilder<'_, TaskEvent>, RegisterError> {
        self.dispatcher.on(event)
    }

    /// # Errors
    ///
    /// Returns [`RegisterError::MissingEvent`] if `event` is empty.
    pub fn post(&self, event: &str) -> Result<ChainBuilder<'_, TaskEvent>, RegisterError> {
        self.dispatcher.post(event)
    }

    // -- capabilities -------------------------------------------------------

    /// Declares a capability with the configured default concurrency limit.
    pub fn can(&self, task_type: &str, handler: impl TaskHandler + 'static) -> &Self {
        self.can_with_limit(task_type, self.config.max_concurrent_callbacks, handler)
    }

    /// Declares a capability processing at most `max_concurrent` tasks at once.
    ///
    /// Re-declaring a type keeps the first handler and limit. After `start()`
    /// the queue is opened and the type propagated to transports immediately.
    pub fn can_with_limit(
        &self,
        task_type: &str,
        max_concurrent: usize,
        handler: impl TaskHandler + 'static,
    ) -> &Self {
        if !self
            .capabilities
            .register(task_type, max_concurrent, Arc::new(handler))
        {
            return self;
        }
        debug!(task_type, max_concurrent, "capability registered");
        self.transports.register_capability(task_type);

        if self.started.load(Ordering::SeqCst) && !self.ended.load(Ordering::SeqCst) {
            if let Some(capability) = self.capabilities.get(task_type) {
                self.open_queue(&capability);
            }
        }
        self
    }

    /// Capability types in registration order.
    #[must_use]
    pub fn types(&self) -> Vec<String> {
        self.capabilities.types()
    }

    /// The queue of a capability type, once started.
    #[must_use]
    pub fn queue(&self, task_type: &str) -> Option<Arc<dyn TaskQueue>> {
        self.queues.get(task_type).map(|q| Arc::clone(q.value()))
    }

    fn open_queue(&self, capability: &Capability) {
        let Entry::Vacant(slot) = self.queues.entry(capability.task_type.clone()) else {
            return;
        };
        let spec = QueueSpec::new(&self.config, &capability.task_type, capability.max_concurrent);
        let source = format!("queue:{}", capability.task_type);

        let queue = match self.queue_factory.create(&spec) {
            Ok(queue) => queue,
            Err(e) => {
                self.notifier.error(source, format!("{e:#}"));
                return;
            }
        };
        let listener = Arc::new(ProcessListener {
            task_type: capability.task_type.clone(),
            orchestrator: self.self_ref.clone(),
        });
        if let Err(e) = queue.listen(listener) {
            self.notifier.error(source, format!("{e:#}"));
            return;
        }
        debug!(queue = %spec.key, max_concurrent = capability.max_concurrent, "queue listening");
        slot.insert(queue);
    }

    // -- transports ---------------------------------------------------------

    /// Declares a transport. `options` overlay `transport_defaults`.
    ///
    /// # Errors
    ///
    /// Returns [`UsageError::InvalidTransport`] if the transport name cannot be
    /// used as an address scheme and [`UsageError::ShuttingDown`] after `end()`.
    pub fn speaks(
        &self,
        factory: impl TransportFactory + 'static,
        options: &TransportOptions,
    ) -> Result<&Self, UsageError> {
        self.transports.declare(Arc::new(factory), options)?;
        Ok(self)
    }

    /// The running instance of a declared transport.
    ///
    /// # Errors
    ///
    /// Returns a [`UsageError`] if the transport is unknown or not started.
    pub fn transport(&self, name: &str) -> Result<TransportInstance, UsageError> {
        self.transports.instance(name)
    }

    #[must_use]
    pub fn transports(&self) -> &TransportRegistry {
        &self.transports
    }

    /// Caller bound to `destination` through the named transport.
    ///
    /// # Errors
    ///
    /// Returns a [`UsageError`] if the transport is unknown or not started.
    pub fn caller(&self, transport: &str, destination: &str) -> Result<Caller, UsageError> {
        self.transports.caller(transport, destination)
    }

    /// Resolves a `transport://location` address to a caller and optionally
    /// stores it under `alias`.
    ///
    /// # Errors
    ///
    /// Returns [`UsageError::InvalidAddress`] for a malformed address, or the
    /// transport lookup error. After `end()` every lookup fails with
    /// [`UsageError::ShuttingDown`].
    pub fn contacts(&self, uri: &str, alias: Option<&str>) -> Result<Caller, UsageError> {
        if self.ended.load(Ordering::SeqCst) {
            return Err(UsageError::ShuttingDown);
        }
        let cached = self.contacts.get(uri).map(|c| c.value().clone());
        let caller = match cached {
            Some(caller) => caller,
            None => {
                let address = Address::parse(uri)?;
                let caller = self.transports.caller(&address.transport, &address.location)?;
                self.contacts
                    .entry(uri.to_string())
                    .or_insert(caller)
                    .value()
                    .clone()
            }
        };
        if let Some(alias) = alias {
            self.contacts.insert(alias.to_string(), caller.clone());
        }
        Ok(caller)
    }

    /// Looks up an alias, falling back to parsing `alias_or_uri` as an address.
    ///
    /// # Errors
    ///
    /// Same as [`contacts`](Self::contacts).
    pub fn contact(&self, alias_or_uri: &str) -> Result<Caller, UsageError> {
        if self.ended.load(Ordering::SeqCst) {
            return Err(UsageError::ShuttingDown);
        }
        let cached = self.contacts.get(alias_or_uri).map(|c| c.value().clone());
        match cached {
            Some(caller) => Ok(caller),
            None => self.contacts(alias_or_uri, None),
        }
    }

    // -- lifecycle ----------------------------------------------------------

    /// Opens a queue per capability, then starts every declared transport.
    /// Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`UsageError::AlreadyStarted`] on a second call and
    /// [`UsageError::ShuttingDown`] after `end()`.
    pub fn start(&self) -> Result<(), UsageError> {
        if self.ended.load(Ordering::SeqCst) {
            return Err(UsageError::ShuttingDown);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(UsageError::AlreadyStarted);
        }

        for capability in self.capabilities.all() {
            self.open_queue(&capability);
        }
        self.lifecycle.set_running();
        self.transports.start();

        info!(prefix = %self.config.prefix, types = ?self.types(), "orchestrator started");
        self.notifier.ready();
        Ok(())
    }

    /// Pushes a task into the local pipeline and waits until it settles.
    ///
    /// Assigns an id under `id_field` when missing. Tasks routed to `defer` or
    /// `recur` resolve as soon as they are enqueued.
    ///
    /// # Errors
    ///
    /// - [`UsageError::UnknownCapability`], [`UsageError::NotStarted`] or
    ///   [`UsageError::ShuttingDown`] before anything is dispatched.
    /// - [`OrchestratorError::Rejected`] if a push interceptor failed.
    /// - [`OrchestratorError::TaskFailed`] if processing failed.
    /// - [`OrchestratorError::Halted`] if a push or process interceptor halted.
    /// - [`OrchestratorError::Abandoned`] if the orchestrator ended first.
    pub async fn push(&self, task_type: &str, mut task: Task) -> Result<Task, OrchestratorError> {
        if !self.capabilities.contains(task_type) {
            return Err(UsageError::UnknownCapability(task_type.to_string()).into());
        }
        match self.lifecycle.state() {
            LifecycleState::Configuring => return Err(UsageError::NotStarted.into()),
            LifecycleState::Draining | LifecycleState::Stopped => {
                return Err(UsageError::ShuttingDown.into());
            }
            LifecycleState::Running => {}
        }

        let _in_flight = self.lifecycle.in_flight_guard();
        let id = task.ensure_id(&self.config.id_field);
        let waiter = (!self.schedule.of(&task).is_scheduled()).then(|| self.waiters.register(&id));

        match self.dispatcher.dispatch(event::PUSH, TaskEvent::new(task_type, task)).await {
            Emission::Completed(ev) => match waiter {
                Some((_, settled)) => settled
                    .await
                    .unwrap_or(Err(OrchestratorError::Abandoned { task_id: id })),
                None => Ok(ev.task),
            },
            Emission::Failed { error, .. } => {
                if let Some((token, _)) = waiter {
                    self.waiters.cancel(&id, token);
                }
                debug!(task_type, %error, "push rejected");
                Err(OrchestratorError::Rejected {
                    task_type: task_type.to_string(),
                    error,
                })
            }
            Emission::Halted(_) => {
                if let Some((token, _)) = waiter {
                    self.waiters.cancel(&id, token);
                }
                Err(OrchestratorError::Halted {
                    event: event::PUSH.to_string(),
                    task_type: task_type.to_string(),
                })
            }
        }
    }

    /// Runs the `process` chain for a delivered task, then `finish` or `fail`.
    async fn process(&self, task_type: &str, task: Task) -> Result<(), InterceptError> {
        let id = task.id(&self.config.id_field);
        match self.dispatcher.dispatch(event::PROCESS, TaskEvent::new(task_type, task)).await {
            Emission::Completed(ev) => {
                let finished = self.dispatcher.dispatch(event::FINISH, ev).await;
                if let Some(error) = finished.error() {
                    self.notifier.error(format!("finish:{task_type}"), error);
                }
                self.settle(id.as_deref(), &Ok(finished.into_args().task));
                Ok(())
            }
            Emission::Failed { error, args } => {
                debug!(task_type, %error, "task failed");
                let failed = self
                    .dispatcher
                    .dispatch(event::FAIL, args.with_error(error.clone()))
                    .await;
                match failed {
                    Emission::Halted(_) => debug!(task_type, "fail chain halted, task not settled"),
                    outcome => {
                        if let Some(fail_error) = outcome.error() {
                            self.notifier.error(format!("fail:{task_type}"), fail_error);
                        }
                        let failure = Err(OrchestratorError::TaskFailed {
                            task_type: task_type.to_string(),
                            error: error.clone(),
                        });
                        self.settle(id.as_deref(), &failure);
                    }
                }
                Err(error)
            }
            Emission::Halted(_) => {
                let halted = Err(OrchestratorError::Halted {
                    event: event::PROCESS.to_string(),
                    task_type: task_type.to_string(),
                });
                self.settle(id.as_deref(), &halted);
                Ok(())
            }
        }
    }

    /// Settles a task whose retry could not be pushed with its last failure,
    /// and reports why the retry was refused.
    pub(crate) fn settle_refused_retry(
        &self,
        task_type: &str,
        task: &Task,
        error: InterceptError,
        refusal: &OrchestratorError,
    ) {
        self.notifier.error(format!("retry:{task_type}"), refusal);
        let failure = Err(OrchestratorError::TaskFailed {
            task_type: task_type.to_string(),
            error,
        });
        self.settle(task.id(&self.config.id_field).as_deref(), &failure);
    }

    fn settle(&self, id: Option<&str>, outcome: &Settlement) {
        if let Some(id) = id {
            self.waiters.settle(id, outcome);
        }
    }

    /// Ends transports and queues in parallel, releases pending pushes, and
    /// waits for in-flight pushes, all bounded by `end_timeout_ms`. Later calls
    /// return `Ok(())` immediately.
    ///
    /// # Errors
    ///
    /// Returns [`ShutdownError::Timeout`] if the bound elapsed and
    /// [`ShutdownError::Failed`] if a component failed to end. Shutdown
    /// completes either way.
    pub async fn end(&self) -> Result<(), ShutdownError> {
        if self.ended.swap(true, Ordering::SeqCst) {
            debug!("end already requested");
            return Ok(());
        }
        info!(prefix = %self.config.prefix, "ending orchestrator");
        self.lifecycle.begin_drain();

        let timeout = self.config.end_timeout();
        let outcome = tokio::time::timeout(timeout, self.end_components(timeout)).await;
        self.waiters.release_all();
        self.contacts.clear();
        self.lifecycle.mark_stopped();

        let result = match outcome {
            Ok(errors) if errors.is_empty() => Ok(()),
            Ok(errors) => Err(ShutdownError::Failed(errors)),
            Err(_) => Err(ShutdownError::Timeout {
                timeout_ms: self.config.end_timeout_ms,
            }),
        };
        match &result {
            Ok(()) => info!(prefix = %self.config.prefix, "all tasks finished, orchestrator ended"),
            Err(error) => self.notifier.error("shutdown", error),
        }
        self.notifier.ended(result.as_ref().err());
        result
    }

    async fn end_components(&self, timeout: Duration) -> Vec<String> {
        let queues: Vec<(String, Arc<dyn TaskQueue>)> = self
            .queues
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        let (transport_errors, queue_results) = tokio::join!(
            self.transports.end(),
            join_all(queues.iter().map(|(task_type, queue)| async move {
                queue
                    .end()
                    .await
                    .map_err(|e| format!("queue {task_type} failed to end: {e:#}"))
            })),
        );

        let mut errors: Vec<String> = transport_errors.iter().map(ToString::to_string).collect();
        errors.extend(queue_results.into_iter().filter_map(Result::err));

        self.waiters.release_all();
        if !self.lifecycle.wait_for_drain(timeout).await {
            errors.push("in-flight pushes did not drain".to_string());
        }
        errors
    }
}

#[async_trait]
impl TaskSink for Orchestrator {
    fn has_capability(&self, task_type: &str) -> bool {
        self.capabilities.contains(task_type)
    }

    async fn push(&self, task_type: &str, task: Task) -> Result<Task, OrchestratorError> {
        Orchestrator::push(self, task_type, task).await
    }

    fn report(&self, source: &str, error: anyhow::Error) {
        self.notifier.error(source, format!("{error:#}"));
    }
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("prefix", &self.config.prefix)
            .field("state", &self.state())
            .field("types", &self.types())
            .field("pending_pushes", &self.waiters.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::capability::handler_fn;
    use crate::transport::memory::{MemoryNetwork, ENDPOINT_OPTION};

    fn task(value: Value) -> Task {
        Task::from_value(value).unwrap()
    }

    fn echo(qb: &Orchestrator) {
        qb.can("echo", handler_fn(|_: &mut Task| Ok(())));
    }

    #[test]
    fn schedule_prefers_defer_and_ignores_disabled_fields() {
        let mut config = OrchestratorConfig::default();
        let fields = ScheduleFields::from_config(&config);
        assert_eq!(fields.of(&task(json!({"when": 5, "every": 7}))), Schedule::Defer(5));
        assert_eq!(fields.of(&task(json!({"every": 7}))), Schedule::Recur(7));
        assert_eq!(fields.of(&task(json!({"when": 0}))), Schedule::Now);
        assert_eq!(
            fields.of(&task(json!({"when": 1.7e12}))),
            Schedule::Defer(1_700_000_000_000)
        );
        assert_eq!(fields.of(&task(json!({"every": 0.5}))), Schedule::Recur(1));
        assert_eq!(fields.of(&task(json!({"when": -3.0, "every": "soon"}))), Schedule::Now);

        config.allow_defer = false;
        let fields = ScheduleFields::from_config(&config);
        assert_eq!(fields.of(&task(json!({"when": 5}))), Schedule::Now);
    }

    #[tokio::test]
    async fn push_is_refused_outside_running_state() {
        let qb = Orchestrator::new(OrchestratorConfig::default());
        echo(&qb);

        assert_eq!(
            qb.push("nope", Task::new()).await,
            Err(OrchestratorError::Usage(UsageError::UnknownCapability("nope".into())))
        );
        assert_eq!(
            qb.push("echo", Task::new()).await,
            Err(OrchestratorError::Usage(UsageError::NotStarted))
        );

        qb.start().unwrap();
        assert_eq!(qb.start(), Err(UsageError::AlreadyStarted));
        qb.end().await.unwrap();
        assert_eq!(
            qb.push("echo", Task::new()).await,
            Err(OrchestratorError::Usage(UsageError::ShuttingDown))
        );
    }

    #[tokio::test]
    async fn push_assigns_id_and_strips_hidden_fields() {
        let qb = Orchestrator::new(OrchestratorConfig::default());
        qb.can(
            "tag",
            handler_fn(|t: &mut Task| {
                t.insert("_scratch".into(), json!(true));
                t.insert("tagged".into(), json!(true));
                Ok(())
            }),
        );
        qb.start().unwrap();

        let done = qb.push("tag", task(json!({"_input": 1}))).await.unwrap();
        assert!(done.id("id").is_some());
        assert_eq!(done["tagged"], json!(true));
        assert!(done.keys().all(|k| !k.starts_with('_')));
        qb.end().await.unwrap();
    }

    #[tokio::test]
    async fn failing_push_interceptor_rejects_without_enqueueing() {
        let qb = Orchestrator::new(OrchestratorConfig::default());
        echo(&qb);
        qb.pre(event::PUSH)
            .unwrap()
            .continuation_fn(|_: &mut TaskEvent| Err(InterceptError::msg("no thanks")));
        qb.start().unwrap();

        let err = qb.push("echo", Task::new()).await.unwrap_err();
        assert_eq!(err.intercept_error().map(InterceptError::message), Some("no thanks"));
        assert!(matches!(err, OrchestratorError::Rejected { .. }));
        assert_eq!(qb.waiters.len(), 0);
        qb.end().await.unwrap();
    }

    #[tokio::test]
    async fn handler_panic_is_a_task_failure() {
        let qb = Orchestrator::new(OrchestratorConfig::default());
        qb.can("bad", handler_fn(|_: &mut Task| panic!("handler exploded")));
        qb.start().unwrap();

        let err = qb.push("bad", Task::new()).await.unwrap_err();
        assert_eq!(
            err.intercept_error(),
            Some(&InterceptError::Panicked("handler exploded".into()))
        );
        qb.end().await.unwrap();
    }

    #[tokio::test]
    async fn can_after_start_opens_queue_and_propagates() {
        let network = MemoryNetwork::new();
        let qb = Orchestrator::new(OrchestratorConfig::default());
        qb.speaks(network.factory(), &TransportOptions::new().with(ENDPOINT_OPTION, "svc"))
            .unwrap();
        qb.start().unwrap();
        assert!(qb.queue("late").is_none());

        qb.can("late", handler_fn(|_: &mut Task| Ok(())));
        assert!(qb.queue("late").is_some());
        assert_eq!(network.accepted("svc"), vec!["late"]);
        assert!(qb.push("late", Task::new()).await.is_ok());
        qb.end().await.unwrap();
    }

    #[tokio::test]
    async fn contacts_resolve_aliases_to_cached_callers() {
        let network = MemoryNetwork::new();
        let qb = Orchestrator::new(OrchestratorConfig::default());
        qb.speaks(network.factory(), &TransportOptions::new().with(ENDPOINT_OPTION, "me"))
            .unwrap();

        assert_eq!(
            qb.contacts("local://me", None).err(),
            Some(UsageError::TransportNotStarted("local".into()))
        );
        qb.start().unwrap();

        let by_uri = qb.contacts("local://me", Some("self")).unwrap();
        let by_alias = qb.contact("self").unwrap();
        assert!(by_uri.ptr_eq(&by_alias));
        assert!(by_uri.ptr_eq(&qb.caller("local", "me").unwrap()));
        assert_eq!(by_alias.as_rpc().unwrap().endpoint(), "me");
        assert_eq!(
            qb.contact("nonsense").err(),
            Some(UsageError::InvalidAddress("nonsense".into()))
        );
        qb.end().await.unwrap();

        assert_eq!(qb.contact("self").err(), Some(UsageError::ShuttingDown));
        assert_eq!(qb.contact("local://me").err(), Some(UsageError::ShuttingDown));
        assert_eq!(qb.caller("local", "me").err(), Some(UsageError::ShuttingDown));
    }

    #[tokio::test]
    async fn transports_declared_after_end_are_refused() {
        let network = MemoryNetwork::new();
        let qb = Orchestrator::new(OrchestratorConfig::default());
        qb.start().unwrap();
        qb.end().await.unwrap();

        assert_eq!(
            qb.speaks(network.factory(), &TransportOptions::new().with(ENDPOINT_OPTION, "late"))
                .err(),
            Some(UsageError::ShuttingDown)
        );
        assert_eq!(qb.transport("local").err(), Some(UsageError::ShuttingDown));
        assert!(qb.transports().names().is_empty());
    }

    #[tokio::test]
    async fn end_is_idempotent_and_notifies() {
        let qb = Orchestrator::new(OrchestratorConfig::default());
        let mut notifications = qb.subscribe_notifications();
        qb.start().unwrap();

        assert_eq!(qb.end().await, Ok(()));
        assert_eq!(qb.end().await, Ok(()));
        assert_eq!(qb.state(), LifecycleState::Stopped);
        assert_eq!(notifications.recv().await.unwrap(), Notification::Ready);
        assert_eq!(notifications.recv().await.unwrap(), Notification::Ended { error: None });
        assert_eq!(qb.start(), Err(UsageError::ShuttingDown));
    }
}
