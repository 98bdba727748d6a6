//! Deferred operations and the collaborators that drive them.
//!
//! A [`Deferred`] is either already resolved (succeeded, faulted or canceled)
//! or will be resolved later through its [`Resolver`]. Continuations attached
//! to it run inline on the resolving thread or on a [`Scheduler`]. Delays are
//! built on a [`Timer`], and cooperative cancellation on a
//! [`CancellationToken`].

mod cancel;
mod deferred;
mod error;
mod fault;
mod scheduler;
mod timer;

pub use cancel::{CancellationSource, CancellationToken, Registration};
pub use deferred::{Deferred, Dispatch, Resolution, Resolver, Status};
pub use error::{ChainError, Panicked, run_guarded};
pub use fault::{BoxError, Fault};
pub use scheduler::{Job, Scheduler, ThreadScheduler, TokioScheduler, default_scheduler};
#[cfg(any(test, feature = "testing"))]
pub use timer::{ManualTimer, ScheduledTimer};
pub use timer::{ThreadTimer, Timer, TimerCallback, TimerHandle, TokioTimer, default_timer};
