//! Fluent composition of steps over deferred operations.
//!
//! A [`Composer`] folds each registered step into a chain. Steps run on the
//! registering thread while their predecessors are already resolved and only
//! fall back to continuations once something genuinely suspends. Faulted chains
//! can be repaired with [`Composer::compensate`], and [`Composer::finally`]
//! runs whatever the outcome.
//!
//! ```
//! use sagaline_compose::compose;
//! use sagaline_deferred::Status;
//!
//! let chain = compose(|composer| {
//!     composer
//!         .execute(|| Err::<(), _>("payment declined"))?
//!         .compensate(|compensation| compensation.handled())?
//!         .finally(|_status| ())?;
//!     Ok(())
//! })?;
//!
//! assert_eq!(chain.status(), Status::Succeeded);
//! # Ok::<(), sagaline_compose::ComposeError>(())
//! ```

mod compensation;
mod compose;
mod composer;
mod error;
mod options;
mod settings;
mod step;

pub use compensation::{Compensation, CompensationOutcome};
pub use compose::{compose, compose_with};
pub use composer::Composer;
pub use error::{
    ComposeError, InvalidCompensation, InvalidDelay, MissingOperation, SettingsError,
};
pub use options::ComposeOptions;
pub use settings::{ComposerSettings, SchedulerKind};
pub use step::{Execution, IntoStep};
