//! In-process reference transports.
//!
//! [`MemoryBroker`] is a publish/subscribe hub and [`MemoryNetwork`] a
//! request/response hub. Both can be shared by several orchestrators in one
//! process, which makes them useful for tests and single-binary deployments.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use quarterback_core::Task;

use super::traits::{
    MessageHandler, OrchestratorHandle, PubSubTransport, RequestResponseTransport,
    TransportFactory, TransportInstance, TransportKind,
};
use crate::config::TransportOptions;

/// Option naming the endpoint a [`MemoryNetwork`] transport listens on.
pub const ENDPOINT_OPTION: &str = "endpoint";

// ---------------------------------------------------------------------------
// Publish/subscribe
// ---------------------------------------------------------------------------

#[derive(Default)]
struct BrokerState {
    channels: DashMap<String, Vec<(u64, MessageHandler)>>,
    next_instance: AtomicU64,
}

/// Shared in-process publish/subscribe hub.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A factory named `memory` whose instances share this broker.
    #[must_use]
    pub fn factory(&self) -> MemoryPubSubFactory {
        self.factory_named("memory")
    }

    #[must_use]
    pub fn factory_named(&self, name: impl Into<String>) -> MemoryPubSubFactory {
        MemoryPubSubFactory {
            name: name.into(),
            broker: self.clone(),
        }
    }

    /// Number of live subscriptions on `channel`.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.state.channels.get(channel).map_or(0, |subs| subs.len())
    }
}

pub struct MemoryPubSubFactory {
    name: String,
    broker: MemoryBroker,
}

impl TransportFactory for MemoryPubSubFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> TransportKind {
        TransportKind::PubSub
    }

    fn startup(
        &self,
        _orchestrator: OrchestratorHandle,
        _options: &TransportOptions,
    ) -> anyhow::Result<TransportInstance> {
        let id = self.broker.state.next_instance.fetch_add(1, Ordering::Relaxed);
        Ok(TransportInstance::PubSub(Arc::new(MemoryPubSub {
            id,
            broker: self.broker.clone(),
            ended: AtomicBool::new(false),
        })))
    }
}

struct MemoryPubSub {
    id: u64,
    broker: MemoryBroker,
    ended: AtomicBool,
}

#[async_trait]
impl PubSubTransport for MemoryPubSub {
    fn subscribe(&self, channel: &str, on_message: MessageHandler) -> anyhow::Result<()> {
        if self.ended.load(Ordering::SeqCst) {
            bail!("memory broker transport has ended");
        }
        self.broker
            .state
            .channels
            .entry(channel.to_string())
            .or_default()
            .push((self.id, on_message));
        Ok(())
    }

    async fn publish(&self, channel: &str, task: Task) -> anyhow::Result<()> {
        if self.ended.load(Ordering::SeqCst) {
            bail!("memory broker transport has ended");
        }
        // Release the shard before running handlers; they may subscribe.
        let handlers: Vec<MessageHandler> = self
            .broker
            .state
            .channels
            .get(channel)
            .map(|subs| subs.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();
        for handler in handlers {
            handler(task.clone());
        }
        Ok(())
    }

    async fn end(&self) -> anyhow::Result<()> {
        self.ended.store(true, Ordering::SeqCst);
        for mut subs in self.broker.state.channels.iter_mut() {
            subs.retain(|(owner, _)| *owner != self.id);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Request/response
// ---------------------------------------------------------------------------

struct Endpoint {
    owner: u64,
    orchestrator: OrchestratorHandle,
    accepts: Arc<RwLock<HashSet<String>>>,
}

#[derive(Default)]
struct NetworkState {
    endpoints: DashMap<String, Endpoint>,
    next_instance: AtomicU64,
}

/// Shared in-process request/response hub. Each started transport binds the
/// endpoint named by its `endpoint` option and serves the capability types
/// propagated to it.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<NetworkState>,
}

impl MemoryNetwork {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A factory named `local` whose instances join this network.
    #[must_use]
    pub fn factory(&self) -> MemoryRpcFactory {
        self.factory_named("local")
    }

    #[must_use]
    pub fn factory_named(&self, name: impl Into<String>) -> MemoryRpcFactory {
        MemoryRpcFactory {
            name: name.into(),
            network: self.clone(),
        }
    }

    /// Capability types the endpoint accepts, sorted.
    #[must_use]
    pub fn accepted(&self, endpoint: &str) -> Vec<String> {
        let mut types: Vec<String> = self
            .state
            .endpoints
            .get(endpoint)
            .map(|e| e.accepts.read().iter().cloned().collect())
            .unwrap_or_default();
        types.sort();
        types
    }
}

pub struct MemoryRpcFactory {
    name: String,
    network: MemoryNetwork,
}

impl TransportFactory for MemoryRpcFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> TransportKind {
        TransportKind::RequestResponse
    }

    fn startup(
        &self,
        orchestrator: OrchestratorHandle,
        options: &TransportOptions,
    ) -> anyhow::Result<TransportInstance> {
        let endpoint = options
            .get_str(ENDPOINT_OPTION)
            .ok_or_else(|| anyhow!("memory network transport requires an `{ENDPOINT_OPTION}` option"))?
            .to_string();
        let owner = self.network.state.next_instance.fetch_add(1, Ordering::Relaxed);
        let accepts = Arc::new(RwLock::new(HashSet::new()));

        match self.network.state.endpoints.entry(endpoint.clone()) {
            Entry::Occupied(_) => bail!("endpoint {endpoint} is already bound"),
            Entry::Vacant(slot) => {
                slot.insert(Endpoint {
                    owner,
                    orchestrator,
                    accepts: Arc::clone(&accepts),
                });
            }
        }

        Ok(TransportInstance::RequestResponse(Arc::new(MemoryRpc {
            owner,
            endpoint,
            accepts,
            network: self.network.clone(),
        })))
    }
}

struct MemoryRpc {
    owner: u64,
    endpoint: String,
    accepts: Arc<RwLock<HashSet<String>>>,
    network: MemoryNetwork,
}

#[async_trait]
impl RequestResponseTransport for MemoryRpc {
    fn can(&self, types: &[String]) -> anyhow::Result<()> {
        self.accepts.write().extend(types.iter().cloned());
        Ok(())
    }

    async fn push(&self, destination: &str, task_type: &str, task: Task) -> anyhow::Result<Task> {
        let target = {
            let endpoint = self
                .network
                .state
                .endpoints
                .get(destination)
                .ok_or_else(|| anyhow!("no endpoint {destination} on the memory network"))?;
            if !endpoint.accepts.read().contains(task_type) {
                bail!("endpoint {destination} does not accept type {task_type}");
            }
            endpoint.orchestrator.clone()
        };
        Ok(target.push(task_type, task).await?)
    }

    async fn end(&self) -> anyhow::Result<()> {
        self.network
            .state
            .endpoints
            .remove_if(&self.endpoint, |_, e| e.owner == self.owner);
        Ok(())
    }
}
