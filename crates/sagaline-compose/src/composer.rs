use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use sagaline_deferred::{
    BoxError, CancellationToken, Deferred, Fault, Registration, Resolution, Scheduler, Status,
    Timer, TimerHandle, default_scheduler, default_timer, run_guarded,
};
use tracing::{debug, trace};

use crate::compensation::{Compensation, CompensationOutcome};
use crate::error::{ComposeError, InvalidCompensation, InvalidDelay};
use crate::options::ComposeOptions;
use crate::step::{Execution, IntoStep};

/// What every step of a composition, nested ones included, shares.
pub(crate) struct Environment<T> {
    pub(crate) payload: T,
    pub(crate) cancellation: CancellationToken,
    pub(crate) scheduler: Arc<dyn Scheduler>,
    pub(crate) timer: Arc<dyn Timer>,
}

/// Folds registered steps into a single chain of deferred operations.
///
/// Each registration inspects the current chain tail. When the tail is already
/// resolved the step runs right away on the registering thread; otherwise a
/// continuation is attached and the step runs once the tail resolves. Either
/// way the step's operation becomes the new tail, so steps run in registration
/// order.
///
/// Registration is single-writer: a composer is driven by one thread at a time
/// through `&mut self`. After [`Composer::finish`] every registration fails with
/// [`ComposeError::CompositionClosed`].
pub struct Composer<T = ()> {
    env: Arc<Environment<T>>,
    tail: Deferred,
    finished: bool,
}

impl<T> Composer<T>
where
    T: Send + Sync + 'static,
{
    /// Create a composer for `payload` configured by `options`.
    #[must_use]
    pub fn new(payload: T, options: ComposeOptions) -> Self {
        let (cancellation, run_synchronously, scheduler, timer) = options.into_parts();
        let env = Environment {
            payload,
            cancellation,
            scheduler: scheduler.unwrap_or_else(default_scheduler),
            timer: timer.unwrap_or_else(default_timer),
        };
        Self::from_environment(Arc::new(env), run_synchronously)
    }

    pub(crate) fn from_environment(env: Arc<Environment<T>>, run_synchronously: bool) -> Self {
        let tail = if run_synchronously {
            if env.cancellation.is_canceled() {
                Deferred::canceled()
            } else {
                Deferred::succeeded()
            }
        } else {
            let (tail, resolver) = Deferred::pending();
            let cancellation = env.cancellation.clone();
            env.scheduler.schedule(Box::new(move || {
                if cancellation.is_canceled() {
                    resolver.try_cancel();
                } else {
                    resolver.try_succeed();
                }
            }));
            tail
        };

        Self {
            env,
            tail,
            finished: false,
        }
    }

    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.env.cancellation
    }

    #[must_use]
    pub fn payload(&self) -> &T {
        &self.env.payload
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Append a synchronous step.
    ///
    /// The action runs only if everything before it succeeded and the
    /// cancellation token has not fired. An error or panic faults the chain.
    ///
    /// # Errors
    ///
    /// Returns [`ComposeError::CompositionClosed`] after [`Composer::finish`].
    pub fn execute<F, R>(&mut self, action: F) -> Result<&mut Self, ComposeError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: IntoStep<()>,
    {
        self.execute_with(Execution::Synchronous, action)
    }

    /// [`Composer::execute`] with an explicit [`Execution`] for the slow path.
    ///
    /// # Errors
    ///
    /// Returns [`ComposeError::CompositionClosed`] after [`Composer::finish`].
    pub fn execute_with<F, R>(
        &mut self,
        execution: Execution,
        action: F,
    ) -> Result<&mut Self, ComposeError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: IntoStep<()>,
    {
        self.run_step(execution, move || {
            action().into_step()?;
            Ok(Deferred::succeeded())
        })
    }

    /// Append a step that starts an asynchronous operation.
    ///
    /// The returned operation becomes the chain tail. Failing to start it
    /// faults the chain rather than returning an error here.
    ///
    /// # Errors
    ///
    /// Returns [`ComposeError::CompositionClosed`] after [`Composer::finish`].
    pub fn execute_async<F, R>(&mut self, action: F) -> Result<&mut Self, ComposeError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: IntoStep<Deferred>,
    {
        self.execute_async_with(Execution::Synchronous, action)
    }

    /// [`Composer::execute_async`] with an explicit [`Execution`] for the slow path.
    ///
    /// # Errors
    ///
    /// Returns [`ComposeError::CompositionClosed`] after [`Composer::finish`].
    pub fn execute_async_with<F, R>(
        &mut self,
        execution: Execution,
        action: F,
    ) -> Result<&mut Self, ComposeError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: IntoStep<Deferred>,
    {
        self.run_step(execution, move || action().into_step())
    }

    /// Append a step whose body is a future.
    ///
    /// A future that completes on its first poll keeps the chain on the fast
    /// path; otherwise it is driven to completion on the scheduler.
    ///
    /// # Errors
    ///
    /// Returns [`ComposeError::CompositionClosed`] after [`Composer::finish`].
    pub fn execute_future<F, Fut, E>(&mut self, action: F) -> Result<&mut Self, ComposeError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        self.execute_future_with(Execution::Synchronous, action)
    }

    /// [`Composer::execute_future`] with an explicit [`Execution`] for the slow path.
    ///
    /// # Errors
    ///
    /// Returns [`ComposeError::CompositionClosed`] after [`Composer::finish`].
    pub fn execute_future_with<F, Fut, E>(
        &mut self,
        execution: Execution,
        action: F,
    ) -> Result<&mut Self, ComposeError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let scheduler = Arc::clone(&self.env.scheduler);
        self.run_step(execution, move || {
            Ok(Deferred::from_future(action(), &scheduler))
        })
    }

    /// Register a handler that runs only if the chain has faulted.
    ///
    /// A succeeded chain is left untouched and a canceled one stays canceled.
    /// On a fault the handler's outcome replaces the chain tail; a handler that
    /// fails or panics faults the chain with [`InvalidCompensation`].
    ///
    /// # Errors
    ///
    /// Returns [`ComposeError::CompositionClosed`] after [`Composer::finish`].
    pub fn compensate<F, R>(&mut self, handler: F) -> Result<&mut Self, ComposeError>
    where
        F: FnOnce(Compensation<T>) -> R + Send + 'static,
        R: IntoStep<CompensationOutcome>,
    {
        self.ensure_open()?;
        if self.tail.status() == Status::Succeeded {
            return Ok(self);
        }

        let env = Arc::clone(&self.env);
        let step = move |resolution: Resolution| match resolution {
            Resolution::Faulted(fault) => {
                fault.mark_observed();
                debug!(error = %fault, "compensating faulted chain");
                let compensation = Compensation::new(fault, env);
                match run_guarded(move || handler(compensation).into_step()) {
                    Ok(outcome) => outcome.into_deferred(),
                    Err(source) if source.downcast_ref::<InvalidCompensation>().is_some() => {
                        debug!(error = %source, "compensation produced no operation");
                        Deferred::faulted(source)
                    }
                    Err(source) => {
                        source.mark_observed();
                        debug!(error = %source, "compensation handler failed");
                        Deferred::failed(InvalidCompensation { source })
                    }
                }
            }
            other => Deferred::from_resolution(other),
        };
        self.advance(Execution::Synchronous, Waiting::Uncancelable, step);
        Ok(self)
    }

    /// Register a continuation that runs whatever the chain's outcome.
    ///
    /// It receives the resolution status. If it fails, its error replaces the
    /// chain's resolution, overriding a previous fault or cancellation.
    ///
    /// # Errors
    ///
    /// Returns [`ComposeError::CompositionClosed`] after [`Composer::finish`].
    pub fn finally<F, R>(&mut self, continuation: F) -> Result<&mut Self, ComposeError>
    where
        F: FnOnce(Status) -> R + Send + 'static,
        R: IntoStep<()>,
    {
        self.finally_with(Execution::Synchronous, continuation)
    }

    /// [`Composer::finally`] with an explicit [`Execution`] for the slow path.
    ///
    /// # Errors
    ///
    /// Returns [`ComposeError::CompositionClosed`] after [`Composer::finish`].
    pub fn finally_with<F, R>(
        &mut self,
        execution: Execution,
        continuation: F,
    ) -> Result<&mut Self, ComposeError>
    where
        F: FnOnce(Status) -> R + Send + 'static,
        R: IntoStep<()>,
    {
        self.ensure_open()?;
        self.advance(execution, Waiting::Uncancelable, move |resolution| {
            let status = resolution.status();
            match run_guarded(move || continuation(status).into_step()) {
                Ok(()) => Deferred::from_resolution(resolution),
                Err(fault) => {
                    if let Resolution::Faulted(previous) = &resolution {
                        previous.mark_observed();
                    }
                    debug!(%status, error = %fault, "finally step failed, replacing resolution");
                    Deferred::faulted(fault)
                }
            }
        });
        Ok(self)
    }

    /// Suspend the chain for `due`.
    ///
    /// A zero delay completes immediately without using the timer. If the
    /// cancellation token fires first the delay resolves canceled and its
    /// timer is released.
    ///
    /// # Errors
    ///
    /// Returns [`ComposeError::CompositionClosed`] after [`Composer::finish`].
    pub fn delay(&mut self, due: Duration) -> Result<&mut Self, ComposeError> {
        self.delay_for(Some(due))
    }

    /// Suspend the chain until the cancellation token fires.
    ///
    /// # Errors
    ///
    /// Returns [`ComposeError::CompositionClosed`] after [`Composer::finish`].
    pub fn delay_indefinitely(&mut self) -> Result<&mut Self, ComposeError> {
        self.delay_for(None)
    }

    /// Suspend the chain for `millis` milliseconds, `-1` meaning indefinitely.
    ///
    /// # Errors
    ///
    /// Returns [`ComposeError::CompositionClosed`] after [`Composer::finish`],
    /// or [`ComposeError::InvalidDelay`] for values below `-1`.
    pub fn delay_millis(&mut self, millis: i64) -> Result<&mut Self, ComposeError> {
        self.ensure_open()?;
        let due = match millis {
            -1 => None,
            millis if millis < -1 => return Err(InvalidDelay { millis }.into()),
            millis => Some(Duration::from_millis(millis.unsigned_abs())),
        };
        self.delay_for(due)
    }

    /// Append a step that succeeds, marking the end of the composition's work.
    ///
    /// # Errors
    ///
    /// Returns [`ComposeError::CompositionClosed`] after [`Composer::finish`].
    pub fn completed(&mut self) -> Result<(), ComposeError> {
        self.run_step(Execution::Synchronous, || Ok(Deferred::succeeded()))?;
        Ok(())
    }

    /// Force the chain to fault with `error`, whatever it resolved to so far.
    ///
    /// # Errors
    ///
    /// Returns [`ComposeError::CompositionClosed`] after [`Composer::finish`].
    pub fn failed(&mut self, error: impl Into<BoxError>) -> Result<(), ComposeError> {
        self.ensure_open()?;
        let fault = Fault::new(error);
        self.advance(Execution::Synchronous, Waiting::Uncancelable, move |resolution| {
            if let Resolution::Faulted(previous) = &resolution {
                previous.mark_observed();
            }
            Deferred::faulted(fault)
        });
        Ok(())
    }

    /// Build an independent sub-chain sharing this composition's environment.
    ///
    /// The nested chain is not appended to this one; use the returned
    /// operation in a step (for example through [`Composer::execute_async`])
    /// to wait for it.
    ///
    /// # Errors
    ///
    /// Returns [`ComposeError::CompositionClosed`] after [`Composer::finish`],
    /// or whatever error `setup` returns.
    pub fn compose<F>(&mut self, setup: F) -> Result<Deferred, ComposeError>
    where
        F: FnOnce(&mut Composer<T>) -> Result<(), ComposeError>,
    {
        self.ensure_open()?;
        let mut nested = Self::from_environment(Arc::clone(&self.env), true);
        setup(&mut nested)?;
        Ok(nested.finish())
    }

    /// Close the composer and return the operation representing the whole chain.
    pub fn finish(&mut self) -> Deferred {
        self.finished = true;
        debug!(status = %self.tail.status(), "composition finished");
        self.tail.clone()
    }

    fn ensure_open(&self) -> Result<(), ComposeError> {
        if self.finished {
            return Err(ComposeError::CompositionClosed);
        }
        Ok(())
    }

    /// Run `start` once everything before it succeeded, unless canceled.
    fn run_step<F>(&mut self, execution: Execution, start: F) -> Result<&mut Self, ComposeError>
    where
        F: FnOnce() -> Result<Deferred, BoxError> + Send + 'static,
    {
        self.ensure_open()?;
        let cancellation = self.env.cancellation.clone();
        self.advance(execution, Waiting::Cancelable, move |resolution| match resolution {
            Resolution::Succeeded if cancellation.is_canceled() => Deferred::canceled(),
            Resolution::Succeeded => run_guarded(start).unwrap_or_else(Deferred::faulted),
            other => Deferred::from_resolution(other),
        });
        Ok(self)
    }

    /// Replace the tail with the operation `step` derives from its resolution.
    ///
    /// A resolved tail is handed to `step` immediately; a pending one gets a
    /// continuation whose result the new tail follows. A [`Waiting::Cancelable`]
    /// step resolves canceled as soon as the token fires while it still waits
    /// for its predecessor.
    fn advance<F>(&mut self, execution: Execution, waiting: Waiting, step: F)
    where
        F: FnOnce(Resolution) -> Deferred + Send + 'static,
    {
        let next = match self.tail.resolution() {
            Some(resolution) => {
                trace!(status = %resolution.status(), "step on fast path");
                step(resolution)
            }
            None => {
                trace!(?execution, ?waiting, "step on slow path");
                let (next, resolver) = Deferred::pending();
                let registration = match waiting {
                    Waiting::Cancelable if self.env.cancellation.can_be_canceled() => {
                        let resolver = resolver.clone();
                        Some(self.env.cancellation.register(move || {
                            if resolver.try_cancel() {
                                debug!("waiting step canceled");
                            }
                        }))
                    }
                    _ => None,
                };
                let waiting_tail = registration.as_ref().map(|_| next.clone());
                self.tail
                    .on_resolved(execution.dispatch(&self.env.scheduler), move |resolution| {
                        drop(registration);
                        if waiting_tail.is_some_and(|tail| tail.is_resolved()) {
                            if let Resolution::Faulted(fault) = &resolution {
                                fault.mark_observed();
                            }
                            return;
                        }
                        resolver.follow(&step(resolution));
                    });
                next
            }
        };
        self.tail = next;
    }

    fn delay_for(&mut self, due: Option<Duration>) -> Result<&mut Self, ComposeError> {
        let env = Arc::clone(&self.env);
        self.run_step(Execution::Synchronous, move || {
            Ok(start_delay(due, &env.cancellation, env.timer.as_ref()))
        })
    }
}

/// Whether a step waiting on a pending predecessor gives way to cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Waiting {
    /// Resolve canceled as soon as the token fires; the body never starts.
    Cancelable,
    /// Always wait for the predecessor; compensations and `finally` must see it.
    Uncancelable,
}

impl<T> fmt::Debug for Composer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Composer")
            .field("tail", &self.tail)
            .field("finished", &self.finished)
            .field("cancellation", &self.env.cancellation)
            .finish_non_exhaustive()
    }
}

fn start_delay(
    due: Option<Duration>,
    cancellation: &CancellationToken,
    timer: &dyn Timer,
) -> Deferred {
    if due == Some(Duration::ZERO) {
        return Deferred::succeeded();
    }

    let (delay, resolver) = Deferred::pending();
    let registration: Arc<Mutex<Option<Registration>>> = Arc::default();
    let handle: Arc<Mutex<Option<TimerHandle>>> = Arc::default();

    if let Some(due) = due {
        let resolver = resolver.clone();
        let registration = Arc::clone(&registration);
        let scheduled = timer.schedule(
            due,
            Box::new(move || {
                drop(take(&registration));
                resolver.try_succeed();
            }),
        );
        *handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(scheduled);
        debug!(?due, "delay timer scheduled");
    }

    if cancellation.can_be_canceled() {
        let handle = Arc::clone(&handle);
        let registered = cancellation.register(move || {
            if let Some(handle) = take(&handle) {
                handle.cancel();
            }
            if resolver.try_cancel() {
                debug!("delay canceled before its timer fired");
            }
        });
        *registration.lock().unwrap_or_else(PoisonError::into_inner) = Some(registered);
    }

    delay
}

fn take<V>(slot: &Mutex<Option<V>>) -> Option<V> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
}
