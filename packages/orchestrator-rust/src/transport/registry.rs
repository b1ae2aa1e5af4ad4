//! Transport registry.
//!
//! Bindings are kept in declaration order. Each binding is instantiated at
//! most once, either by `start()` or, after start, at declaration time. The
//! registry tracks which capability types each request/response instance has
//! already been told about and only ever sends the difference. Once ended, the
//! registry refuses new declarations and caller lookups.
//!
//! No lock is held while calling into a transport (`startup`, `can`, `end`),
//! so transports may call back into the orchestrator from those methods.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::join_all;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::address::is_valid_transport_name;
use super::caller::{Caller, PubSubCaller, RpcCaller};
use super::traits::{
    OrchestratorHandle, RequestResponseTransport, TransportFactory, TransportInstance,
};
use crate::config::TransportOptions;
use crate::error::{TransportError, UsageError};
use crate::notify::Notifier;

enum BindingState {
    Declared,
    Starting,
    Running(TransportInstance),
    Failed,
    Ended,
}

struct Binding {
    factory: Arc<dyn TransportFactory>,
    options: TransportOptions,
    state: BindingState,
    propagated: HashSet<String>,
}

impl Binding {
    fn name(&self) -> &str {
        self.factory.name()
    }

    fn request_response(&self) -> Option<Arc<dyn RequestResponseTransport>> {
        match &self.state {
            BindingState::Running(TransportInstance::RequestResponse(t)) => Some(Arc::clone(t)),
            _ => None,
        }
    }
}

/// Declared transports, their instances, and the caller cache.
pub struct TransportRegistry {
    bindings: Mutex<Vec<Binding>>,
    capabilities: Mutex<Vec<String>>,
    callers: DashMap<(String, String), Caller>,
    defaults: TransportOptions,
    orchestrator: OrchestratorHandle,
    notifier: Notifier,
    started: AtomicBool,
    ended: AtomicBool,
}

impl TransportRegistry {
    #[must_use]
    pub fn new(
        defaults: TransportOptions,
        orchestrator: OrchestratorHandle,
        notifier: Notifier,
    ) -> Self {
        Self {
            bindings: Mutex::new(Vec::new()),
            capabilities: Mutex::new(Vec::new()),
            callers: DashMap::new(),
            defaults,
            orchestrator,
            notifier,
            started: AtomicBool::new(false),
            ended: AtomicBool::new(false),
        }
    }

    /// Declares a transport with `options` overlaid on the registry defaults.
    ///
    /// Re-declaring a name that is not yet instantiated replaces the earlier
    /// declaration; re-declaring an instantiated one is a no-op. After
    /// [`start`](Self::start) the transport is instantiated immediately.
    ///
    /// # Errors
    ///
    /// Returns [`UsageError::InvalidTransport`] if the name cannot be used as
    /// an address scheme and [`UsageError::ShuttingDown`] once [`end`](Self::end)
    /// has been called.
    pub fn declare(
        &self,
        factory: Arc<dyn TransportFactory>,
        options: &TransportOptions,
    ) -> Result<(), UsageError> {
        if self.is_ended() {
            return Err(UsageError::ShuttingDown);
        }
        let name = factory.name().to_string();
        if !is_valid_transport_name(&name) {
            return Err(UsageError::InvalidTransport(name));
        }
        let options = options.merged_over(&self.defaults);

        {
            let mut bindings = self.bindings.lock();
            match bindings.iter_mut().find(|b| b.name() == name) {
                Some(existing) if matches!(existing.state, BindingState::Declared) => {
                    debug!(transport = %name, "replacing pending transport declaration");
                    existing.factory = factory;
                    existing.options = options;
                }
                Some(_) => {
                    debug!(transport = %name, "transport already instantiated, ignoring declaration");
                    return Ok(());
                }
                None => bindings.push(Binding {
                    factory,
                    options,
                    state: BindingState::Declared,
                    propagated: HashSet::new(),
                }),
            }
        }

        if self.is_started() {
            self.bring_up();
        }
        Ok(())
    }

    /// Adds a capability type and, once started, propagates it to every
    /// running request/response instance that does not have it yet.
    pub fn register_capability(&self, task_type: &str) {
        {
            let mut capabilities = self.capabilities.lock();
            if !capabilities.iter().any(|t| t == task_type) {
                capabilities.push(task_type.to_string());
            }
        }
        if self.is_started() {
            self.propagate();
        }
    }

    /// Instantiates every declared transport and propagates the capability set.
    /// Later calls only pick up what is still pending.
    pub fn start(&self) {
        if !self.started.swap(true, Ordering::SeqCst) {
            info!("starting transports");
        }
        self.bring_up();
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    /// Declared transport names in declaration order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.bindings.lock().iter().map(|b| b.name().to_string()).collect()
    }

    /// Capability types already sent to the named transport, sorted.
    #[must_use]
    pub fn propagated(&self, name: &str) -> Vec<String> {
        let bindings = self.bindings.lock();
        let mut types: Vec<String> = bindings
            .iter()
            .find(|b| b.name() == name)
            .map(|b| b.propagated.iter().cloned().collect())
            .unwrap_or_default();
        types.sort();
        types
    }

    /// The running instance of a declared transport.
    ///
    /// # Errors
    ///
    /// Returns [`UsageError::UnknownTransport`] if `name` was never declared and
    /// [`UsageError::TransportNotStarted`] if it has no running instance.
    /// After [`end`](Self::end) every lookup fails with [`UsageError::ShuttingDown`].
    pub fn instance(&self, name: &str) -> Result<TransportInstance, UsageError> {
        if self.is_ended() {
            return Err(UsageError::ShuttingDown);
        }
        let bindings = self.bindings.lock();
        let binding = bindings
            .iter()
            .find(|b| b.name() == name)
            .ok_or_else(|| UsageError::UnknownTransport(name.to_string()))?;
        match &binding.state {
            BindingState::Running(instance) => Ok(instance.clone()),
            _ => Err(UsageError::TransportNotStarted(name.to_string())),
        }
    }

    /// Returns the cached caller for `(transport, destination)`, creating it on
    /// first use.
    ///
    /// # Errors
    ///
    /// Same as [`instance`](Self::instance).
    pub fn caller(&self, transport: &str, destination: &str) -> Result<Caller, UsageError> {
        let key = (transport.to_string(), destination.to_string());
        if self.is_ended() {
            return Err(UsageError::ShuttingDown);
        }
        if let Some(caller) = self.callers.get(&key) {
            return Ok(caller.value().clone());
        }

        let caller = match self.instance(transport)? {
            TransportInstance::RequestResponse(inner) => {
                Caller::RequestResponse(Arc::new(RpcCaller::new(transport, destination, inner)))
            }
            TransportInstance::PubSub(inner) => Caller::PubSub(Arc::new(PubSubCaller::new(
                transport,
                destination,
                inner,
                self.orchestrator.clone(),
            ))),
        };
        // A concurrent lookup may have won the race; keep whichever landed first.
        Ok(self.callers.entry(key).or_insert(caller).value().clone())
    }

    /// Ends every running instance in parallel. Each instance is ended at most
    /// once, however many times this is called. Returns the failures.
    pub async fn end(&self) -> Vec<TransportError> {
        self.ended.store(true, Ordering::SeqCst);
        let running: Vec<(String, TransportInstance)> = {
            let mut bindings = self.bindings.lock();
            bindings
                .iter_mut()
                .filter_map(|b| {
                    match std::mem::replace(&mut b.state, BindingState::Ended) {
                        BindingState::Running(instance) => Some((b.name().to_string(), instance)),
                        BindingState::Declared => {
                            b.state = BindingState::Declared;
                            None
                        }
                        _ => None,
                    }
                })
                .collect()
        };
        self.callers.clear();

        let results = join_all(running.iter().map(|(name, instance)| async move {
            debug!(transport = %name, "ending transport");
            instance.end().await.map_err(|e| TransportError::End {
                name: name.clone(),
                reason: format!("{e:#}"),
            })
        }))
        .await;

        results.into_iter().filter_map(Result::err).collect()
    }

    // -- internals ----------------------------------------------------------

    fn bring_up(&self) {
        self.instantiate_pending();
        self.propagate();
    }

    fn instantiate_pending(&self) {
        let pending: Vec<(Arc<dyn TransportFactory>, TransportOptions)> = {
            let mut bindings = self.bindings.lock();
            bindings
                .iter_mut()
                .filter(|b| matches!(b.state, BindingState::Declared))
                .map(|b| {
                    b.state = BindingState::Starting;
                    (Arc::clone(&b.factory), b.options.clone())
                })
                .collect()
        };

        for (factory, options) in pending {
            let name = factory.name().to_string();
            let state = match factory.startup(self.orchestrator.clone(), &options) {
                Ok(instance) if instance.kind() == factory.kind() => {
                    info!(transport = %name, kind = %instance.kind(), "transport started");
                    BindingState::Running(instance)
                }
                Ok(instance) => {
                    let error = TransportError::KindMismatch {
                        name: name.clone(),
                        declared: factory.kind(),
                        started: instance.kind(),
                    };
                    self.notifier.error(format!("transport:{name}"), &error);
                    BindingState::Failed
                }
                Err(e) => {
                    let error = TransportError::Startup {
                        name: name.clone(),
                        reason: format!("{e:#}"),
                    };
                    self.notifier.error(format!("transport:{name}"), &error);
                    BindingState::Failed
                }
            };

            let mut bindings = self.bindings.lock();
            if let Some(binding) = bindings.iter_mut().find(|b| b.name() == name) {
                if matches!(binding.state, BindingState::Starting) {
                    binding.state = state;
                }
            }
        }
    }

    fn propagate(&self) {
        let capabilities = self.capabilities.lock().clone();
        // Claim the difference under the lock, call outside it, and roll the
        // claim back if the transport refuses.
        let claims: Vec<(String, Arc<dyn RequestResponseTransport>, Vec<String>)> = {
            let mut bindings = self.bindings.lock();
            bindings
                .iter_mut()
                .filter_map(|b| {
                    let transport = b.request_response()?;
                    let fresh: Vec<String> = capabilities
                        .iter()
                        .filter(|t| !b.propagated.contains(*t))
                        .cloned()
                        .collect();
                    if fresh.is_empty() {
                        return None;
                    }
                    b.propagated.extend(fresh.iter().cloned());
                    Some((b.name().to_string(), transport, fresh))
                })
                .collect()
        };

        for (name, transport, types) in claims {
            debug!(transport = %name, ?types, "propagating capabilities");
            if let Err(e) = transport.can(&types) {
                warn!(transport = %name, ?types, "capability propagation refused");
                if let Some(binding) = self.bindings.lock().iter_mut().find(|b| b.name() == name) {
                    for t in &types {
                        binding.propagated.remove(t);
                    }
                }
                let error = TransportError::Propagation {
                    name: name.clone(),
                    types,
                    reason: format!("{e:#}"),
                };
                self.notifier.error(format!("transport:{name}"), &error);
            }
        }
    }
}

impl std::fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportRegistry")
            .field("transports", &self.names())
            .field("started", &self.is_started())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
