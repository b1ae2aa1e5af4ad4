//! Interceptor chains keyed by event name.

mod dispatcher;
mod error;
mod interceptor;
mod phase;

pub use dispatcher::{Chain, ChainBuilder, Emission, EventDispatcher};
pub use error::{InterceptError, RegisterError};
pub use interceptor::{Continuation, ContinuationFn, Flow, Interceptor};
pub use phase::Phase;
