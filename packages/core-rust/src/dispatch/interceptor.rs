//! Interceptor calling conventions.
//!
//! An interceptor is either a [`Continuation`], which decides whether the chain
//! proceeds, or a fire-and-forget closure, which proceeds automatically once it
//! returns. Both receive the chain arguments by mutable reference.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;

use super::error::InterceptError;

/// What a continuation asks the chain to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Run the next interceptor (or the terminal callback).
    Proceed,
    /// Stop here. Neither later interceptors nor the terminal callback run.
    Halt,
}

/// Interceptor that explicitly signals how the chain continues.
///
/// Returning `Err` short-circuits the chain and hands the error to the
/// terminal callback. A continuation that never resolves stalls only its own
/// emission.
#[async_trait]
pub trait Continuation<A>: Send + Sync
where
    A: Send + 'static,
{
    async fn call(&self, args: &mut A) -> Result<Flow, InterceptError>;
}

/// Adapter turning a synchronous closure into a [`Continuation`].
pub struct ContinuationFn<F>(pub F);

#[async_trait]
impl<A, F> Continuation<A> for ContinuationFn<F>
where
    A: Send + 'static,
    F: Fn(&mut A) -> Result<Flow, InterceptError> + Send + Sync,
{
    async fn call(&self, args: &mut A) -> Result<Flow, InterceptError> {
        (self.0)(args)
    }
}

type FireAndForgetFn<A> = dyn Fn(&mut A) + Send + Sync;

/// A registered chain entry.
pub enum Interceptor<A> {
    Continuation(Arc<dyn Continuation<A>>),
    FireAndForget(Arc<FireAndForgetFn<A>>),
}

impl<A> Clone for Interceptor<A> {
    fn clone(&self) -> Self {
        match self {
            Self::Continuation(c) => Self::Continuation(Arc::clone(c)),
            Self::FireAndForget(f) => Self::FireAndForget(Arc::clone(f)),
        }
    }
}

impl<A> fmt::Debug for Interceptor<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Continuation(_) => f.write_str("Interceptor::Continuation"),
            Self::FireAndForget(_) => f.write_str("Interceptor::FireAndForget"),
        }
    }
}

impl<A: Send + 'static> Interceptor<A> {
    pub fn continuation(c: impl Continuation<A> + 'static) -> Self {
        Self::Continuation(Arc::new(c))
    }

    pub fn continuation_fn<F>(f: F) -> Self
    where
        F: Fn(&mut A) -> Result<Flow, InterceptError> + Send + Sync + 'static,
    {
        Self::Continuation(Arc::new(ContinuationFn(f)))
    }

    pub fn fire_and_forget<F>(f: F) -> Self
    where
        F: Fn(&mut A) + Send + Sync + 'static,
    {
        Self::FireAndForget(Arc::new(f))
    }

    /// Runs the interceptor. A panic becomes [`InterceptError::Panicked`].
    pub(crate) async fn invoke(&self, args: &mut A) -> Result<Flow, InterceptError> {
        match self {
            Self::Continuation(c) => match AssertUnwindSafe(c.call(args)).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => Err(InterceptError::from_panic(payload.as_ref())),
            },
            Self::FireAndForget(f) => match catch_unwind(AssertUnwindSafe(|| f(args))) {
                Ok(()) => Ok(Flow::Proceed),
                Err(payload) => Err(InterceptError::from_panic(payload.as_ref())),
            },
        }
    }
}
