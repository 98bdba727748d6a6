use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

use futures::FutureExt;
use tracing::trace;

use crate::error::{ChainError, Panicked};
use crate::fault::{BoxError, Fault};
use crate::scheduler::Scheduler;

/// Resolution state of a deferred operation, without payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Pending,
    Succeeded,
    Faulted,
    Canceled,
}

impl Status {
    #[must_use]
    pub fn is_resolved(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Faulted => write!(f, "faulted"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

/// How a deferred operation ended.
#[derive(Debug, Clone)]
pub enum Resolution {
    Succeeded,
    Faulted(Fault),
    Canceled,
}

impl Resolution {
    #[must_use]
    pub fn status(&self) -> Status {
        match self {
            Self::Succeeded => Status::Succeeded,
            Self::Faulted(_) => Status::Faulted,
            Self::Canceled => Status::Canceled,
        }
    }

    /// Convert into the observer's view, marking any fault as observed.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::Faulted`] or [`ChainError::Canceled`] when the
    /// operation did not succeed.
    pub fn into_result(self) -> Result<(), ChainError> {
        match self {
            Self::Succeeded => Ok(()),
            Self::Faulted(fault) => {
                fault.mark_observed();
                Err(ChainError::Faulted(fault))
            }
            Self::Canceled => Err(ChainError::Canceled),
        }
    }

    fn settle<E: Into<BoxError>>(output: std::thread::Result<Result<(), E>>) -> Self {
        match output {
            Ok(Ok(())) => Self::Succeeded,
            Ok(Err(error)) => Self::Faulted(Fault::new(error)),
            Err(payload) => Self::Faulted(Fault::new(Panicked::from_payload(&*payload))),
        }
    }
}

/// Where a continuation runs once its operation resolves.
#[derive(Debug, Clone)]
pub enum Dispatch {
    /// On the thread that resolves the operation, or immediately on the
    /// attaching thread when the operation is already resolved.
    Inline,
    /// Handed to a scheduler.
    Scheduled(Arc<dyn Scheduler>),
}

type Callback = Box<dyn FnOnce(Resolution) + Send + 'static>;

struct Continuation {
    dispatch: Dispatch,
    callback: Callback,
}

impl Continuation {
    fn run(self, resolution: Resolution) {
        let callback = self.callback;
        match self.dispatch {
            Dispatch::Inline => callback(resolution),
            Dispatch::Scheduled(scheduler) => {
                scheduler.schedule(Box::new(move || callback(resolution)));
            }
        }
    }
}

thread_local! {
    /// Whether this thread is already draining resolved continuations.
    static DRAINING: Cell<bool> = const { Cell::new(false) };
    static READY: RefCell<VecDeque<(Continuation, Resolution)>> =
        const { RefCell::new(VecDeque::new()) };
}

/// Run `ready` continuations without growing the stack per chained operation.
///
/// A resolve triggered from inside a continuation only queues its
/// continuations; the outermost resolve on the thread runs the queue in order
/// before returning. A panicking continuation does not stop the others and is
/// re-raised once the queue is empty.
fn run_continuations(ready: Vec<Continuation>, resolution: &Resolution) {
    READY.with_borrow_mut(|queue| {
        queue.extend(
            ready
                .into_iter()
                .map(|continuation| (continuation, resolution.clone())),
        );
    });
    if DRAINING.replace(true) {
        return;
    }

    let mut panicked = None;
    while let Some((continuation, resolution)) = READY.with_borrow_mut(VecDeque::pop_front) {
        if let Err(payload) =
            panic::catch_unwind(AssertUnwindSafe(|| continuation.run(resolution)))
        {
            panicked.get_or_insert(payload);
        }
    }
    DRAINING.set(false);

    if let Some(payload) = panicked {
        panic::resume_unwind(payload);
    }
}

enum State {
    Pending {
        continuations: Vec<Continuation>,
        wakers: Vec<Waker>,
    },
    Resolved(Resolution),
}

struct Shared {
    state: Mutex<State>,
}

impl Shared {
    fn with_state(state: State) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resolve(&self, resolution: Resolution) -> bool {
        let previous = {
            let mut state = self.lock();
            if matches!(*state, State::Resolved(_)) {
                return false;
            }
            mem::replace(&mut *state, State::Resolved(resolution.clone()))
        };
        let State::Pending {
            continuations,
            wakers,
        } = previous
        else {
            return false;
        };

        trace!(
            status = %resolution.status(),
            continuations = continuations.len(),
            "deferred operation resolved"
        );
        for waker in wakers {
            waker.wake();
        }
        run_continuations(continuations, &resolution);
        true
    }
}

/// An operation that is resolved now or will be resolved later.
///
/// Cloning yields another handle to the same operation. A deferred operation
/// can be inspected synchronously, can have continuations attached, and can be
/// awaited.
#[derive(Clone)]
pub struct Deferred {
    shared: Arc<Shared>,
}

impl Deferred {
    #[must_use]
    pub fn succeeded() -> Self {
        Self::from_resolution(Resolution::Succeeded)
    }

    #[must_use]
    pub fn faulted(fault: Fault) -> Self {
        Self::from_resolution(Resolution::Faulted(fault))
    }

    /// Shorthand for a faulted operation carrying a fresh fault.
    pub fn failed(error: impl Into<BoxError>) -> Self {
        Self::faulted(Fault::new(error))
    }

    #[must_use]
    pub fn canceled() -> Self {
        Self::from_resolution(Resolution::Canceled)
    }

    #[must_use]
    pub fn from_resolution(resolution: Resolution) -> Self {
        Self {
            shared: Shared::with_state(State::Resolved(resolution)),
        }
    }

    /// A pending operation and the resolver that settles it.
    #[must_use]
    pub fn pending() -> (Self, Resolver) {
        let shared = Shared::with_state(State::Pending {
            continuations: Vec::new(),
            wakers: Vec::new(),
        });
        (
            Self {
                shared: Arc::clone(&shared),
            },
            Resolver { shared },
        )
    }

    /// Wrap a future as a deferred operation.
    ///
    /// The future is polled once on the calling thread. If it is already
    /// complete the operation is created resolved; otherwise the rest of the
    /// future runs on `scheduler`. Panics inside the future fault the operation.
    pub fn from_future<F, E>(future: F, scheduler: &Arc<dyn Scheduler>) -> Self
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let mut future = AssertUnwindSafe(future).catch_unwind().boxed();
        let mut cx = Context::from_waker(futures::task::noop_waker_ref());
        if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
            return Self::from_resolution(Resolution::settle(output));
        }

        trace!("future suspended, continuing on scheduler");
        let (deferred, resolver) = Self::pending();
        scheduler.spawn(
            async move {
                let output = future.await;
                resolver.try_resolve(Resolution::settle(output));
            }
            .boxed(),
        );
        deferred
    }

    #[must_use]
    pub fn status(&self) -> Status {
        match &*self.shared.lock() {
            State::Pending { .. } => Status::Pending,
            State::Resolved(resolution) => resolution.status(),
        }
    }

    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.status().is_resolved()
    }

    /// The resolution if there is one. Does not mark a fault observed.
    #[must_use]
    pub fn resolution(&self) -> Option<Resolution> {
        match &*self.shared.lock() {
            State::Pending { .. } => None,
            State::Resolved(resolution) => Some(resolution.clone()),
        }
    }

    /// Observe the outcome without waiting, marking any fault as observed.
    #[must_use]
    pub fn try_outcome(&self) -> Option<Result<(), ChainError>> {
        self.resolution().map(Resolution::into_result)
    }

    /// Attach a continuation that receives the resolution.
    ///
    /// Continuations attached to a pending operation run in attachment order.
    pub fn on_resolved(
        &self,
        dispatch: Dispatch,
        callback: impl FnOnce(Resolution) + Send + 'static,
    ) {
        let continuation = Continuation {
            dispatch,
            callback: Box::new(callback),
        };
        let resolution = {
            let mut state = self.shared.lock();
            match &mut *state {
                State::Pending { continuations, .. } => {
                    continuations.push(continuation);
                    return;
                }
                State::Resolved(resolution) => resolution.clone(),
            }
        };
        continuation.run(resolution);
    }

    /// Whether both handles refer to the same operation.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl fmt::Debug for Deferred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("status", &self.status())
            .finish()
    }
}

impl Future for Deferred {
    type Output = Result<(), ChainError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.shared.lock();
        match &mut *state {
            State::Resolved(resolution) => Poll::Ready(resolution.clone().into_result()),
            State::Pending { wakers, .. } => {
                if !wakers.iter().any(|waker| waker.will_wake(cx.waker())) {
                    wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

/// The settling side of a pending [`Deferred`].
///
/// The first resolution wins; later attempts return `false`.
#[derive(Clone)]
pub struct Resolver {
    shared: Arc<Shared>,
}

impl Resolver {
    pub fn try_resolve(&self, resolution: Resolution) -> bool {
        self.shared.resolve(resolution)
    }

    pub fn try_succeed(&self) -> bool {
        self.try_resolve(Resolution::Succeeded)
    }

    pub fn try_fault(&self, fault: Fault) -> bool {
        self.try_resolve(Resolution::Faulted(fault))
    }

    pub fn try_cancel(&self) -> bool {
        self.try_resolve(Resolution::Canceled)
    }

    /// Adopt the resolution of `inner` once it resolves.
    ///
    /// This flattens an operation that produces another operation into one.
    pub fn follow(&self, inner: &Deferred) {
        let resolver = self.clone();
        inner.on_resolved(Dispatch::Inline, move |resolution| {
            resolver.try_resolve(resolution);
        });
    }
}

impl fmt::Debug for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use super::*;
    use crate::scheduler::ThreadScheduler;

    #[derive(Debug, thiserror::Error)]
    #[error("boom")]
    struct Boom;

    #[test]
    fn resolved_constructors_report_their_status() {
        let fault = Fault::new(Boom);
        fault.mark_observed();

        assert_eq!(Deferred::succeeded().status(), Status::Succeeded);
        assert_eq!(Deferred::faulted(fault).status(), Status::Faulted);
        assert_eq!(Deferred::canceled().status(), Status::Canceled);
        assert!(Deferred::canceled().is_resolved());
    }

    #[test]
    fn first_resolution_wins() {
        let (deferred, resolver) = Deferred::pending();

        assert_eq!(deferred.status(), Status::Pending);
        assert!(resolver.try_cancel());
        assert!(!resolver.try_succeed());
        assert_eq!(deferred.status(), Status::Canceled);
    }

    #[test]
    fn inline_continuations_run_in_attachment_order_on_resolving_thread() {
        let (deferred, resolver) = Deferred::pending();
        let order = Arc::new(Mutex::new(Vec::new()));

        for index in 0..3 {
            let order = Arc::clone(&order);
            deferred.on_resolved(Dispatch::Inline, move |resolution| {
                assert_eq!(resolution.status(), Status::Succeeded);
                order
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push((index, thread::current().id()));
            });
        }

        let resolving_thread = thread::spawn(move || {
            resolver.try_succeed();
            thread::current().id()
        })
        .join()
        .expect("resolver thread completes");

        let order = order.lock().unwrap_or_else(PoisonError::into_inner);
        assert_eq!(
            order.iter().map(|(index, _)| *index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert!(order.iter().all(|(_, id)| *id == resolving_thread));
    }

    #[test]
    fn continuation_on_resolved_operation_runs_immediately() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        Deferred::succeeded().on_resolved(Dispatch::Inline, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn follow_flattens_inner_resolution() {
        let (outer, outer_resolver) = Deferred::pending();
        let (inner, inner_resolver) = Deferred::pending();

        outer_resolver.follow(&inner);
        assert_eq!(outer.status(), Status::Pending);

        inner_resolver.try_fault(Fault::new(Boom));
        let error = outer
            .try_outcome()
            .expect("outer resolved")
            .expect_err("outer faulted");
        assert!(error.fault().is_some_and(|fault| fault.downcast_ref::<Boom>().is_some()));
    }

    #[test]
    fn long_follow_chain_resolves_without_recursing() {
        let (first, first_resolver) = Deferred::pending();
        let mut last = first;
        for _ in 0..100_000 {
            let (next, resolver) = Deferred::pending();
            resolver.follow(&last);
            last = next;
        }

        first_resolver.try_succeed();

        assert_eq!(last.status(), Status::Succeeded);
    }

    #[test]
    fn panicking_continuation_does_not_starve_later_ones() {
        let (deferred, resolver) = Deferred::pending();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        deferred.on_resolved(Dispatch::Inline, panicking_continuation);
        deferred.on_resolved(Dispatch::Inline, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let outcome = panic::catch_unwind(AssertUnwindSafe(move || resolver.try_succeed()));

        assert!(outcome.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let (later, later_resolver) = Deferred::pending();
        later_resolver.try_succeed();
        assert_eq!(later.status(), Status::Succeeded);
    }

    fn panicking_continuation(_resolution: Resolution) {
        panic!("continuation exploded");
    }

    #[test]
    fn inspecting_resolution_does_not_observe_fault() {
        let deferred = Deferred::failed(Boom);

        let Some(Resolution::Faulted(fault)) = deferred.resolution() else {
            panic!("expected a fault");
        };
        assert!(!fault.is_observed());

        let _ = deferred.try_outcome();
        assert!(fault.is_observed());
    }

    #[test]
    fn ready_future_resolves_without_scheduler() {
        let scheduler: Arc<dyn Scheduler> = Arc::new(ThreadScheduler);

        let ok = Deferred::from_future(async { Ok::<(), Boom>(()) }, &scheduler);
        let failed = Deferred::from_future(async { Err::<(), Boom>(Boom) }, &scheduler);

        assert_eq!(ok.status(), Status::Succeeded);
        assert_eq!(failed.status(), Status::Faulted);
        let _ = failed.try_outcome();
    }

    fn deferred_panics() -> bool {
        true
    }

    #[test]
    fn panicking_future_faults() {
        let scheduler: Arc<dyn Scheduler> = Arc::new(ThreadScheduler);

        let deferred = Deferred::from_future(
            async {
                if deferred_panics() {
                    panic!("future exploded");
                }
                Ok::<(), Boom>(())
            },
            &scheduler,
        );

        let error = deferred
            .try_outcome()
            .expect("resolved")
            .expect_err("faulted");
        let panic = error
            .fault()
            .and_then(|fault| fault.downcast_ref::<Panicked>())
            .expect("panic captured");
        assert_eq!(panic.message, "future exploded");
    }

    #[tokio::test]
    async fn suspended_future_completes_on_scheduler() -> anyhow::Result<()> {
        let scheduler = crate::scheduler::default_scheduler();

        let deferred = Deferred::from_future(
            async {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                Ok::<(), Boom>(())
            },
            &scheduler,
        );

        assert_eq!(deferred.status(), Status::Pending);
        deferred.await?;
        Ok(())
    }

    #[tokio::test]
    async fn awaiting_a_canceled_operation_yields_canceled() {
        let (deferred, resolver) = Deferred::pending();
        tokio::spawn(async move {
            resolver.try_cancel();
        });

        let error = deferred.await.expect_err("canceled");
        assert!(error.is_canceled());
    }
}
