//! Pluggable transports, the registry that starts them, and caller handles.

mod address;
mod caller;
pub mod memory;
mod registry;
mod traits;

pub use address::Address;
pub use caller::{Caller, PubSubCaller, RpcCaller, SubscribeAction};
pub use registry::TransportRegistry;
pub use traits::{
    MessageHandler, OrchestratorHandle, PubSubTransport, RequestResponseTransport, TaskSink,
    TransportFactory, TransportInstance, TransportKind,
};
