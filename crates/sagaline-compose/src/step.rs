use std::sync::Arc;

use sagaline_deferred::{BoxError, Deferred, Dispatch, Fault, Scheduler};

use crate::compensation::CompensationOutcome;
use crate::error::{InvalidCompensation, MissingOperation};

/// Conversion from what a step body returns into what the composer expects.
///
/// Implemented for the bare value (an infallible body) and for
/// `Result<V, E>` (a fallible body), so closures may return either. Bodies
/// that produce an operation may also return an `Option`; `None` faults the
/// chain with [`InvalidCompensation`].
///
/// # Type Parameters
///
/// - `V`: The value the composer needs: `()` for plain steps, a [`Deferred`]
///   for asynchronous steps, a [`CompensationOutcome`] for compensations.
pub trait IntoStep<V> {
    /// Convert, boxing any error.
    ///
    /// # Errors
    ///
    /// Returns the body's error when it failed.
    fn into_step(self) -> Result<V, BoxError>;
}

impl IntoStep<()> for () {
    fn into_step(self) -> Result<(), BoxError> {
        Ok(())
    }
}

impl IntoStep<Deferred> for Deferred {
    fn into_step(self) -> Result<Deferred, BoxError> {
        Ok(self)
    }
}

impl IntoStep<CompensationOutcome> for CompensationOutcome {
    fn into_step(self) -> Result<CompensationOutcome, BoxError> {
        Ok(self)
    }
}

impl IntoStep<Deferred> for Option<Deferred> {
    fn into_step(self) -> Result<Deferred, BoxError> {
        self.ok_or_else(missing_operation)
    }
}

impl IntoStep<CompensationOutcome> for Option<CompensationOutcome> {
    fn into_step(self) -> Result<CompensationOutcome, BoxError> {
        self.ok_or_else(missing_operation)
    }
}

fn missing_operation() -> BoxError {
    let source = Fault::new(MissingOperation);
    source.mark_observed();
    Box::new(InvalidCompensation { source })
}

impl<V, E> IntoStep<V> for Result<V, E>
where
    E: Into<BoxError>,
{
    fn into_step(self) -> Result<V, BoxError> {
        self.map_err(Into::into)
    }
}

/// Where a step's continuation runs when its predecessor is still pending.
///
/// Steps whose predecessor is already resolved always run immediately on the
/// registering thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Execution {
    /// Inline on the thread that resolves the predecessor.
    #[default]
    Synchronous,
    /// On the composition's scheduler.
    Scheduled,
}

impl Execution {
    pub(crate) fn dispatch(self, scheduler: &Arc<dyn Scheduler>) -> Dispatch {
        match self {
            Self::Synchronous => Dispatch::Inline,
            Self::Scheduled => Dispatch::Scheduled(Arc::clone(scheduler)),
        }
    }
}

impl From<bool> for Execution {
    fn from(run_synchronously: bool) -> Self {
        if run_synchronously {
            Self::Synchronous
        } else {
            Self::Scheduled
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("step failed")]
    struct StepFailed;

    #[test]
    fn unit_and_ok_results_convert_to_success() {
        assert!(().into_step().is_ok());
        assert!(Ok::<(), StepFailed>(()).into_step().is_ok());
    }

    #[test]
    fn err_results_keep_their_error() {
        let error = IntoStep::<()>::into_step(Err::<(), _>(StepFailed)).expect_err("failed");

        assert!(error.downcast_ref::<StepFailed>().is_some());
    }

    #[test]
    fn missing_operation_becomes_invalid_compensation() {
        let error = IntoStep::<Deferred>::into_step(None::<Deferred>).expect_err("missing");

        let invalid = error
            .downcast_ref::<InvalidCompensation>()
            .expect("invalid compensation");
        assert!(invalid.source.downcast_ref::<MissingOperation>().is_some());
    }

    #[test]
    fn run_synchronously_flag_maps_to_execution() {
        assert_eq!(Execution::from(true), Execution::Synchronous);
        assert_eq!(Execution::from(false), Execution::Scheduled);
    }
}
