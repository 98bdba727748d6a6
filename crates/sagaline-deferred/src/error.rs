use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};

use thiserror::Error;

use crate::fault::{BoxError, Fault};

/// Error seen by whoever observes a deferred operation that did not succeed.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum ChainError {
    /// The operation faulted.
    #[error("operation faulted: {0}")]
    Faulted(#[source] Fault),

    /// The operation was canceled.
    #[error("operation was canceled")]
    Canceled,
}

impl ChainError {
    /// The fault, if the operation faulted.
    #[must_use]
    pub fn fault(&self) -> Option<&Fault> {
        match self {
            Self::Faulted(fault) => Some(fault),
            Self::Canceled => None,
        }
    }

    #[must_use]
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

/// A step body panicked instead of returning.
#[derive(Debug, Clone, Error)]
#[error("step panicked: {message}")]
pub struct Panicked {
    /// The panic message, when the payload was a string.
    pub message: String,
}

impl Panicked {
    pub(crate) fn from_payload(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&'static str>() {
            (*message).to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            String::from("non-string panic payload")
        };
        Self { message }
    }
}

/// Run a step body, turning both its error and a panic into a [`Fault`].
///
/// # Errors
///
/// Returns the body's error, or a [`Panicked`] error if it panicked, as a fresh fault.
pub fn run_guarded<R>(body: impl FnOnce() -> Result<R, BoxError>) -> Result<R, Fault> {
    match catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(Fault::new(error)),
        Err(payload) => Err(Fault::new(Panicked::from_payload(&*payload))),
    }
}
