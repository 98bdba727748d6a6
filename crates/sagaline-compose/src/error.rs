use sagaline_deferred::{BoxError, Fault};
use thiserror::Error;

/// Error returned immediately by a composer operation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ComposeError {
    /// The composer has been finished and accepts no more steps.
    #[error("the composition is already complete")]
    CompositionClosed,

    #[error(transparent)]
    InvalidDelay(#[from] InvalidDelay),

    /// Caller-supplied setup logic failed.
    #[error("composition setup failed")]
    Setup(#[source] BoxError),
}

/// A delay outside the accepted range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("delay of {millis}ms is invalid: it must be non-negative, or -1 to wait indefinitely")]
pub struct InvalidDelay {
    /// The rejected value in milliseconds.
    pub millis: i64,
}

/// A compensation handler or asynchronous step failed to produce a
/// replacement operation.
///
/// Carried inside the chain's fault, never returned from a composer call. A
/// handler that returned `None` carries [`MissingOperation`] as its source.
#[derive(Debug, Error)]
#[error("compensation handler did not produce a replacement operation")]
pub struct InvalidCompensation {
    /// What the handler failed with, a [`Panicked`](sagaline_deferred::Panicked) error if it panicked.
    #[source]
    pub source: Fault,
}

/// A step or compensation handler returned no operation to continue with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no replacement operation was produced")]
pub struct MissingOperation;

/// Error loading [`ComposerSettings`](crate::ComposerSettings).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SettingsError {
    #[error("failed to parse composer settings")]
    Parse(#[from] toml::de::Error),

    #[error("scheduler 'tokio' requested outside of a tokio runtime")]
    NoRuntime(#[source] tokio::runtime::TryCurrentError),
}
