use std::fmt;
use std::sync::Arc;

use sagaline_deferred::{BoxError, CancellationToken, Deferred, Fault};

use crate::composer::{Composer, Environment};
use crate::error::ComposeError;

/// View of a faulted chain handed to a compensation handler.
///
/// The handler consumes it to produce a [`CompensationOutcome`]; the fault has
/// already been marked observed by the time the handler runs.
pub struct Compensation<T> {
    fault: Fault,
    env: Arc<Environment<T>>,
}

impl<T> Compensation<T>
where
    T: Send + Sync + 'static,
{
    pub(crate) fn new(fault: Fault, env: Arc<Environment<T>>) -> Self {
        Self { fault, env }
    }

    /// The fault being compensated.
    #[must_use]
    pub fn fault(&self) -> &Fault {
        &self.fault
    }

    /// The payload the composition was created with.
    #[must_use]
    pub fn payload(&self) -> &T {
        &self.env.payload
    }

    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.env.cancellation
    }

    /// The fault is handled; the chain continues as succeeded.
    #[must_use]
    pub fn handled(self) -> CompensationOutcome {
        CompensationOutcome::new(Deferred::succeeded())
    }

    /// Re-raise the same errors as a fresh fault for a later observer.
    #[must_use]
    pub fn rethrow(self) -> CompensationOutcome {
        CompensationOutcome::new(Deferred::faulted(self.fault.rethrown()))
    }

    /// Replace the fault with a different error.
    pub fn fail(self, error: impl Into<BoxError>) -> CompensationOutcome {
        CompensationOutcome::new(Deferred::failed(error))
    }

    /// Continue the chain with `deferred` in place of the fault.
    #[must_use]
    pub fn resume(self, deferred: Deferred) -> CompensationOutcome {
        CompensationOutcome::new(deferred)
    }

    /// Build a multi-step compensation as a nested composition.
    ///
    /// The nested composer shares this composition's cancellation token,
    /// payload, scheduler and timer.
    ///
    /// # Errors
    ///
    /// Returns whatever error `setup` returns.
    pub fn compose<F>(&self, setup: F) -> Result<Deferred, ComposeError>
    where
        F: FnOnce(&mut Composer<T>) -> Result<(), ComposeError>,
    {
        let mut nested = Composer::from_environment(Arc::clone(&self.env), true);
        setup(&mut nested)?;
        Ok(nested.finish())
    }
}

impl<T> fmt::Debug for Compensation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Compensation")
            .field("fault", &self.fault)
            .finish_non_exhaustive()
    }
}

/// The replacement operation produced by a compensation handler.
#[derive(Debug, Clone)]
pub struct CompensationOutcome {
    deferred: Deferred,
}

impl CompensationOutcome {
    fn new(deferred: Deferred) -> Self {
        Self { deferred }
    }

    #[must_use]
    pub fn deferred(&self) -> &Deferred {
        &self.deferred
    }

    #[must_use]
    pub fn into_deferred(self) -> Deferred {
        self.deferred
    }
}

impl From<Deferred> for CompensationOutcome {
    fn from(deferred: Deferred) -> Self {
        Self::new(deferred)
    }
}
