use std::fmt;
use std::sync::Arc;

use sagaline_deferred::{
    CancellationToken, Scheduler, ThreadScheduler, ThreadTimer, Timer, TokioScheduler, TokioTimer,
};
use tokio::runtime::Handle;

use crate::error::SettingsError;
use crate::settings::{ComposerSettings, SchedulerKind};

/// How a composition is set up.
///
/// Defaults: a token that never fires, steps run synchronously, and the
/// scheduler and timer of the calling thread's tokio runtime (or plain OS
/// threads outside a runtime).
#[derive(Clone)]
pub struct ComposeOptions {
    cancellation: CancellationToken,
    run_synchronously: bool,
    scheduler: Option<Arc<dyn Scheduler>>,
    timer: Option<Arc<dyn Timer>>,
}

impl Default for ComposeOptions {
    fn default() -> Self {
        Self {
            cancellation: CancellationToken::none(),
            run_synchronously: true,
            scheduler: None,
            timer: None,
        }
    }
}

impl ComposeOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build options from loaded settings.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::NoRuntime`] when the settings ask for the tokio
    /// scheduler and the calling thread is not inside a tokio runtime.
    pub fn from_settings(settings: &ComposerSettings) -> Result<Self, SettingsError> {
        let options = Self::new().run_synchronously(settings.run_synchronously());
        let options = match settings.scheduler() {
            SchedulerKind::Auto => options,
            SchedulerKind::Tokio => {
                let handle = Handle::try_current().map_err(SettingsError::NoRuntime)?;
                options
                    .with_scheduler(Arc::new(TokioScheduler::new(handle.clone())))
                    .with_timer(Arc::new(TokioTimer::new(handle)))
            }
            SchedulerKind::Thread => options
                .with_scheduler(Arc::new(ThreadScheduler))
                .with_timer(Arc::new(ThreadTimer)),
        };
        Ok(options)
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// When `false` the chain starts with a no-op on the scheduler, so even the
    /// first step runs off the calling thread.
    #[must_use]
    pub fn run_synchronously(mut self, run_synchronously: bool) -> Self {
        self.run_synchronously = run_synchronously;
        self
    }

    #[must_use]
    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    #[must_use]
    pub fn with_timer(mut self, timer: Arc<dyn Timer>) -> Self {
        self.timer = Some(timer);
        self
    }

    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    #[must_use]
    pub fn is_synchronous(&self) -> bool {
        self.run_synchronously
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        CancellationToken,
        bool,
        Option<Arc<dyn Scheduler>>,
        Option<Arc<dyn Timer>>,
    ) {
        (
            self.cancellation,
            self.run_synchronously,
            self.scheduler,
            self.timer,
        )
    }
}

impl fmt::Debug for ComposeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComposeOptions")
            .field("cancellation", &self.cancellation)
            .field("run_synchronously", &self.run_synchronously)
            .field("custom_scheduler", &self.scheduler.is_some())
            .field("custom_timer", &self.timer.is_some())
            .finish()
    }
}
