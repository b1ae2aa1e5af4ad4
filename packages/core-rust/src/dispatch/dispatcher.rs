//! Phase-ordered event dispatcher.
//!
//! Each event owns four ordered chains (`pre`, `once`, `main`, `post`). An
//! emission snapshots the effective chain synchronously, consuming the `once`
//! entries under the write lock, so interceptors registered or emitted
//! re-entrantly afterwards never affect a chain that is already running.

use std::collections::HashMap;
use std::future::Future;

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::error::{InterceptError, RegisterError};
use super::interceptor::{Continuation, Flow, Interceptor};
use super::phase::Phase;

// ---------------------------------------------------------------------------
// Emission outcome
// ---------------------------------------------------------------------------

/// Outcome of running a chain.
#[derive(Debug, Clone, PartialEq)]
pub enum Emission<A> {
    /// Every interceptor proceeded. Carries the (possibly mutated) arguments.
    Completed(A),
    /// An interceptor failed. Remaining interceptors were skipped.
    Failed { error: InterceptError, args: A },
    /// A continuation halted the chain. The terminal callback is not invoked.
    Halted(A),
}

impl<A> Emission<A> {
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    #[must_use]
    pub fn error(&self) -> Option<&InterceptError> {
        match self {
            Self::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Returns the arguments regardless of outcome.
    pub fn into_args(self) -> A {
        match self {
            Self::Completed(args) | Self::Halted(args) | Self::Failed { args, .. } => args,
        }
    }

    /// Converts to a `Result`, treating a halt as `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns the interceptor error when the chain failed.
    pub fn into_result(self) -> Result<Option<A>, InterceptError> {
        match self {
            Self::Completed(args) => Ok(Some(args)),
            Self::Halted(_) => Ok(None),
            Self::Failed { error, .. } => Err(error),
        }
    }
}

// ---------------------------------------------------------------------------
// Chain snapshot
// ---------------------------------------------------------------------------

/// An effective chain captured at emission time.
pub struct Chain<A> {
    event: String,
    interceptors: Vec<Interceptor<A>>,
}

impl<A: Send + 'static> Chain<A> {
    #[must_use]
    pub fn event(&self) -> &str {
        &self.event
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Runs the interceptors in order, threading `args` through each.
    pub async fn run(self, mut args: A) -> Emission<A> {
        for (position, interceptor) in self.interceptors.iter().enumerate() {
            trace!(event = %self.event, position, "invoking interceptor");
            match interceptor.invoke(&mut args).await {
                Ok(Flow::Proceed) => {}
                Ok(Flow::Halt) => {
                    debug!(event = %self.event, position, "chain halted");
                    return Emission::Halted(args);
                }
                Err(error) => {
                    debug!(event = %self.event, position, %error, "chain short-circuited");
                    return Emission::Failed { error, args };
                }
            }
        }
        Emission::Completed(args)
    }
}

#[derive(Default)]
struct EventChains<A> {
    pre: Vec<Interceptor<A>>,
    once: Vec<Interceptor<A>>,
    main: Vec<Interceptor<A>>,
    post: Vec<Interceptor<A>>,
}

impl<A> EventChains<A> {
    fn new() -> Self {
        Self {
            pre: Vec::new(),
            once: Vec::new(),
            main: Vec::new(),
            post: Vec::new(),
        }
    }

    fn slot(&mut self, phase: Phase) -> &mut Vec<Interceptor<A>> {
        match phase {
            Phase::Pre => &mut self.pre,
            Phase::Once => &mut self.once,
            Phase::Main => &mut self.main,
            Phase::Post => &mut self.post,
        }
    }

    fn len(&self, phase: Phase) -> usize {
        match phase {
            Phase::Pre => self.pre.len(),
            Phase::Once => self.once.len(),
            Phase::Main => self.main.len(),
            Phase::Post => self.post.len(),
        }
    }
}

// ---------------------------------------------------------------------------
// EventDispatcher
// ---------------------------------------------------------------------------

/// Registry of per-event interceptor chains.
///
/// Registration is synchronous and thread-safe. Emissions run concurrently and
/// independently: a stalled interceptor blocks only its own emission.
pub struct EventDispatcher<A> {
    chains: RwLock<HashMap<String, EventChains<A>>>,
}

impl<A: Send + 'static> Default for EventDispatcher<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Send + 'static> EventDispatcher<A> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            chains: RwLock::new(HashMap::new()),
        }
    }

    /// Appends `interceptor` to the `phase` chain of `event`.
    ///
    /// # Errors
    ///
    /// Returns [`RegisterError::MissingEvent`] if `event` is empty.
    pub fn register(
        &self,
        phase: Phase,
        event: &str,
        interceptor: Interceptor<A>,
    ) -> Result<(), RegisterError> {
        validate_event(event)?;
        self.append(phase, event, interceptor);
        Ok(())
    }

    fn append(&self, phase: Phase, event: &str, interceptor: Interceptor<A>) {
        let mut chains = self.chains.write();
        chains
            .entry(event.to_string())
            .or_insert_with(EventChains::new)
            .slot(phase)
            .push(interceptor);
        trace!(event, %phase, "interceptor registered");
    }

    /// Selects `event` in `phase` for fluent registration.
    ///
    /// # Errors
    ///
    /// Returns [`RegisterError::MissingEvent`] if `event` is empty.
    pub fn select(&self, phase: Phase, event: &str) -> Result<ChainBuilder<'_, A>, RegisterError> {
        validate_event(event)?;
        Ok(ChainBuilder {
            dispatcher: self,
            phase,
            event: event.to_string(),
        })
    }

    /// Selects the `pre` chain of `event`.
    ///
    /// # Errors
    ///
    /// Returns [`RegisterError::MissingEvent`] if `event` is empty.
    pub fn pre(&self, event: &str) -> Result<ChainBuilder<'_, A>, RegisterError> {
        self.select(Phase::Pre, event)
    }

    /// Selects the `once` chain of `event`.
    ///
    /// # Errors
    ///
    /// Returns [`RegisterError::MissingEvent`] if `event` is empty.
    pub fn once(&self, event: &str) -> Result<ChainBuilder<'_, A>, RegisterError> {
        self.select(Phase::Once, event)
    }

    /// Selects the `main` chain of `event`.
    ///
    /// # Errors
    ///
    /// Returns [`RegisterError::MissingEvent`] if `event` is empty.
    pub fn on(&self, event: &str) -> Result<ChainBuilder<'_, A>, RegisterError> {
        self.select(Phase::Main, event)
    }

    /// Selects the `post` chain of `event`.
    ///
    /// # Errors
    ///
    /// Returns [`RegisterError::MissingEvent`] if `event` is empty.
    pub fn post(&self, event: &str) -> Result<ChainBuilder<'_, A>, RegisterError> {
        self.select(Phase::Post, event)
    }

    /// Number of interceptors currently registered in one chain.
    #[must_use]
    pub fn chain_len(&self, phase: Phase, event: &str) -> usize {
        self.chains.read().get(event).map_or(0, |c| c.len(phase))
    }

    /// Captures the effective chain `pre ++ once ++ main ++ reverse(post)`,
    /// removing the `once` entries.
    #[must_use]
    pub fn snapshot(&self, event: &str) -> Chain<A> {
        let mut chains = self.chains.write();
        let interceptors = match chains.get_mut(event) {
            Some(entry) => {
                let once = std::mem::take(&mut entry.once);
                entry
                    .pre
                    .iter()
                    .cloned()
                    .chain(once)
                    .chain(entry.main.iter().cloned())
                    .chain(entry.post.iter().rev().cloned())
                    .collect()
            }
            None => Vec::new(),
        };
        Chain {
            event: event.to_string(),
            interceptors,
        }
    }

    /// Emits `event` and returns a future resolving to the outcome.
    ///
    /// The chain is captured before this function returns, so the future sees
    /// exactly the interceptors registered at call time.
    pub fn dispatch(&self, event: &str, args: A) -> impl Future<Output = Emission<A>> + Send + 'static {
        self.snapshot(event).run(args)
    }

    /// Emits `event` on the runtime and invokes `on_complete` with the outcome,
    /// unless a continuation halted the chain.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime. Use [`dispatch`](Self::dispatch)
    /// to drive the emission on an executor of the caller's choice.
    pub fn emit<F>(&self, event: &str, args: A, on_complete: F) -> JoinHandle<()>
    where
        F: FnOnce(Emission<A>) + Send + 'static,
    {
        let emission = self.dispatch(event, args);
        tokio::spawn(async move {
            match emission.await {
                Emission::Halted(_) => {}
                outcome => on_complete(outcome),
            }
        })
    }

    /// Emits `event` with no terminal callback. Failures are logged.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn emit_detached(&self, event: &str, args: A) -> JoinHandle<()> {
        let name = event.to_string();
        self.emit(event, args, move |outcome| {
            if let Some(error) = outcome.error() {
                debug!(event = %name, %error, "detached emission failed");
            }
        })
    }
}

fn validate_event(event: &str) -> Result<(), RegisterError> {
    if event.is_empty() {
        Err(RegisterError::MissingEvent)
    } else {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ChainBuilder
// ---------------------------------------------------------------------------

/// Fluent registration handle bound to one event and phase.
pub struct ChainBuilder<'a, A> {
    dispatcher: &'a EventDispatcher<A>,
    phase: Phase,
    event: String,
}

impl<A: Send + 'static> ChainBuilder<'_, A> {
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    #[must_use]
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Appends a prepared interceptor.
    pub fn with(self, interceptor: Interceptor<A>) -> Self {
        self.dispatcher.append(self.phase, &self.event, interceptor);
        self
    }

    /// Appends a closure that proceeds automatically once it returns.
    pub fn fire_and_forget<F>(self, f: F) -> Self
    where
        F: Fn(&mut A) + Send + Sync + 'static,
    {
        self.with(Interceptor::fire_and_forget(f))
    }

    /// Appends an async continuation.
    pub fn continuation(self, c: impl Continuation<A> + 'static) -> Self {
        self.with(Interceptor::continuation(c))
    }

    /// Appends a synchronous continuation.
    pub fn continuation_fn<F>(self, f: F) -> Self
    where
        F: Fn(&mut A) -> Result<Flow, InterceptError> + Send + Sync + 'static,
    {
        self.with(Interceptor::continuation_fn(f))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Weak};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;

    type Trail = Vec<String>;

    fn mark(label: &'static str) -> impl Fn(&mut Trail) + Send + Sync + 'static {
        move |trail: &mut Trail| trail.push(label.to_string())
    }

    #[tokio::test]
    async fn effective_order_is_pre_once_main_then_reversed_post() {
        let d = EventDispatcher::<Trail>::new();
        d.pre("ev").unwrap().fire_and_forget(mark("A"));
        d.on("ev").unwrap().fire_and_forget(mark("M"));
        d.post("ev").unwrap().fire_and_forget(mark("B"));
        d.post("ev").unwrap().fire_and_forget(mark("C"));
        d.once("ev").unwrap().fire_and_forget(mark("O"));

        let outcome = d.dispatch("ev", Vec::new()).await;
        assert_eq!(outcome, Emission::Completed(vec!["A".into(), "O".into(), "M".into(), "C".into(), "B".into()]));
    }

    #[tokio::test]
    async fn once_entries_run_on_first_emission_only() {
        let d = EventDispatcher::<Trail>::new();
        d.once("ev").unwrap().fire_and_forget(mark("O"));
        d.on("ev").unwrap().fire_and_forget(mark("M"));

        assert_eq!(d.dispatch("ev", Vec::new()).await.into_args(), vec!["O", "M"]);
        assert_eq!(d.dispatch("ev", Vec::new()).await.into_args(), vec!["M"]);
        assert_eq!(d.chain_len(Phase::Once, "ev"), 0);
    }

    #[tokio::test]
    async fn once_entry_is_consumed_even_when_an_earlier_interceptor_fails() {
        let d = EventDispatcher::<Trail>::new();
        d.pre("ev")
            .unwrap()
            .continuation_fn(|_: &mut Trail| Err(InterceptError::msg("pre failed")));
        d.once("ev").unwrap().fire_and_forget(mark("O"));

        let first = d.dispatch("ev", Vec::new()).await;
        assert_eq!(first.error(), Some(&InterceptError::msg("pre failed")));
        assert!(first.into_args().is_empty());
        assert_eq!(d.chain_len(Phase::Once, "ev"), 0);
    }

    #[tokio::test]
    async fn error_short_circuits_and_returns_args_as_mutated_so_far() {
        let d = EventDispatcher::<Trail>::new();
        d.pre("ev").unwrap().fire_and_forget(mark("A"));
        d.on("ev")
            .unwrap()
            .continuation_fn(|_: &mut Trail| Err(InterceptError::msg("x")));
        d.post("ev").unwrap().fire_and_forget(mark("never"));

        match d.dispatch("ev", Vec::new()).await {
            Emission::Failed { error, args } => {
                assert_eq!(error.to_string(), "x");
                assert_eq!(args, vec!["A"]);
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn panicking_interceptors_surface_as_errors() {
        let d = EventDispatcher::<Trail>::new();
        d.on("sync").unwrap().fire_and_forget(|_: &mut Trail| panic!("kaboom"));
        d.on("cont")
            .unwrap()
            .continuation_fn(|_: &mut Trail| -> Result<Flow, InterceptError> { panic!("cont kaboom") });

        let sync = d.dispatch("sync", Vec::new()).await;
        assert_eq!(sync.error(), Some(&InterceptError::Panicked("kaboom".into())));
        let cont = d.dispatch("cont", Vec::new()).await;
        assert_eq!(cont.error(), Some(&InterceptError::Panicked("cont kaboom".into())));
    }

    #[tokio::test]
    async fn halt_skips_rest_of_chain_and_terminal_callback() {
        let d = EventDispatcher::<Trail>::new();
        d.on("ev")
            .unwrap()
            .continuation_fn(|t: &mut Trail| {
                t.push("H".into());
                Ok(Flow::Halt)
            })
            .fire_and_forget(mark("never"));

        assert_eq!(d.dispatch("ev", Vec::new()).await, Emission::Halted(vec!["H".into()]));

        let called = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&called);
        d.emit("ev", Vec::new(), move |_| flag.store(true, Ordering::SeqCst))
            .await
            .unwrap();
        assert!(!called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn emit_invokes_terminal_callback_with_outcome() {
        let d = EventDispatcher::<Trail>::new();
        d.on("ev").unwrap().fire_and_forget(mark("M"));
        let (tx, rx) = tokio::sync::oneshot::channel();
        d.emit("ev", vec!["start".into()], move |outcome| {
            let _ = tx.send(outcome);
        });
        assert_eq!(rx.await.unwrap(), Emission::Completed(vec!["start".into(), "M".into()]));
    }

    #[tokio::test]
    async fn unknown_event_completes_with_untouched_args() {
        let d = EventDispatcher::<Trail>::new();
        assert_eq!(d.dispatch("nothing", vec!["a".into()]).await, Emission::Completed(vec!["a".into()]));
    }

    #[tokio::test]
    async fn events_do_not_share_chains() {
        let d = EventDispatcher::<Trail>::new();
        d.on("one").unwrap().fire_and_forget(mark("1"));
        d.on("two").unwrap().fire_and_forget(mark("2"));
        assert_eq!(d.dispatch("two", Vec::new()).await.into_args(), vec!["2"]);
    }

    #[test]
    fn registration_without_event_is_rejected() {
        let d = EventDispatcher::<Trail>::new();
        assert_eq!(d.on("").err(), Some(RegisterError::MissingEvent));
        assert_eq!(
            d.register(Phase::Pre, "", Interceptor::fire_and_forget(mark("x"))),
            Err(RegisterError::MissingEvent)
        );
        assert!(d.register(Phase::Pre, "ev", Interceptor::fire_and_forget(mark("x"))).is_ok());
        assert_eq!(d.chain_len(Phase::Pre, "ev"), 1);
    }

    #[tokio::test]
    async fn chain_is_snapshotted_when_dispatch_is_called() {
        let d = EventDispatcher::<Trail>::new();
        d.on("ev").unwrap().fire_and_forget(mark("early"));
        let pending = d.dispatch("ev", Vec::new());
        d.on("ev").unwrap().fire_and_forget(mark("late"));
        assert_eq!(pending.await.into_args(), vec!["early"]);
    }

    struct Reenter {
        dispatcher: Weak<EventDispatcher<Trail>>,
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Continuation<Trail> for Reenter {
        async fn call(&self, args: &mut Trail) -> Result<Flow, InterceptError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if args.iter().any(|a| a == "inner") {
                return Ok(Flow::Proceed);
            }
            let dispatcher = self
                .dispatcher
                .upgrade()
                .ok_or_else(|| InterceptError::msg("dispatcher dropped"))?;
            let inner = dispatcher.dispatch("ev", vec!["inner".into()]).await.into_args();
            args.extend(inner);
            Ok(Flow::Proceed)
        }
    }

    #[tokio::test]
    async fn reentrant_emission_does_not_rerun_consumed_once_entries() {
        let d = Arc::new(EventDispatcher::<Trail>::new());
        let runs = Arc::new(AtomicUsize::new(0));
        d.once("ev").unwrap().fire_and_forget(mark("O"));
        d.on("ev").unwrap().continuation(Reenter {
            dispatcher: Arc::downgrade(&d),
            runs: Arc::clone(&runs),
        });

        let outer = d.dispatch("ev", Vec::new()).await.into_args();
        assert_eq!(outer, vec!["O", "inner"]);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    struct Gate(Arc<Notify>);

    #[async_trait]
    impl Continuation<Trail> for Gate {
        async fn call(&self, args: &mut Trail) -> Result<Flow, InterceptError> {
            if args.iter().any(|a| a == "stall") {
                self.0.notified().await;
            }
            Ok(Flow::Proceed)
        }
    }

    #[tokio::test]
    async fn stalled_emission_does_not_block_others() {
        let d = EventDispatcher::<Trail>::new();
        let gate = Arc::new(Notify::new());
        d.on("ev").unwrap().continuation(Gate(Arc::clone(&gate)));

        let stalled = tokio::spawn(d.dispatch("ev", vec!["stall".into()]));
        let free = tokio::time::timeout(Duration::from_secs(1), d.dispatch("ev", vec!["go".into()]))
            .await
            .expect("unstalled emission should complete");
        assert!(free.is_completed());
        assert!(!stalled.is_finished());

        gate.notify_one();
        assert!(stalled.await.unwrap().is_completed());
    }
}
