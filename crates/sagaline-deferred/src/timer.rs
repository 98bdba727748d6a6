use std::fmt;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tracing::trace;

use crate::scheduler::{spawn_or_run_inline, spawn_thread, take_job};

/// Callback invoked when a timer elapses.
pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// Facility that fires a callback after a delay.
pub trait Timer: Send + Sync {
    /// Arrange for `on_fire` to run once `due` has elapsed.
    fn schedule(&self, due: Duration, on_fire: TimerCallback) -> TimerHandle;
}

/// Releases a scheduled timer.
///
/// Dropping the handle leaves the timer running; call [`TimerHandle::cancel`]
/// to release it.
#[must_use = "a timer can only be released through its handle"]
pub struct TimerHandle {
    release: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl TimerHandle {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// Prevent the callback from firing if it has not fired yet.
    pub fn cancel(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("releasable", &self.release.is_some())
            .finish()
    }
}

/// Timer backed by `tokio::time::sleep`.
#[derive(Debug, Clone)]
pub struct TokioTimer {
    handle: Handle,
}

impl TokioTimer {
    #[must_use]
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    #[must_use]
    pub fn try_current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }
}

impl Timer for TokioTimer {
    fn schedule(&self, due: Duration, on_fire: TimerCallback) -> TimerHandle {
        let task = self.handle.spawn(async move {
            tokio::time::sleep(due).await;
            on_fire();
        });
        TimerHandle::new(move || task.abort())
    }
}

/// Timer that parks a dedicated OS thread until the deadline.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadTimer;

impl Timer for ThreadTimer {
    fn schedule(&self, due: Duration, on_fire: TimerCallback) -> TimerHandle {
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let deadline = Instant::now() + due;

        spawn_or_run_inline(
            "sagaline-timer",
            on_fire,
            |body| spawn_thread("sagaline-timer", body),
            move |slot| {
                let fire = || {
                    if let Some(on_fire) = take_job(slot) {
                        on_fire();
                    }
                };
                match release_rx.recv_timeout(due) {
                    Ok(()) => trace!("timer released before firing"),
                    Err(RecvTimeoutError::Timeout) => fire(),
                    Err(RecvTimeoutError::Disconnected) => {
                        thread::sleep(deadline.saturating_duration_since(Instant::now()));
                        fire();
                    }
                }
            },
        );

        TimerHandle::new(move || {
            let _ = release_tx.send(());
        })
    }
}

impl fmt::Debug for dyn Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dyn Timer")
    }
}

/// The tokio timer of the calling thread's runtime if there is one, else [`ThreadTimer`].
#[must_use]
pub fn default_timer() -> Arc<dyn Timer> {
    match TokioTimer::try_current() {
        Some(timer) => Arc::new(timer),
        None => Arc::new(ThreadTimer),
    }
}

#[cfg(any(test, feature = "testing"))]
pub use manual::{ManualTimer, ScheduledTimer};

#[cfg(any(test, feature = "testing"))]
mod manual {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex, PoisonError};
    use std::time::Duration;

    use super::{Timer, TimerCallback, TimerHandle};

    /// A timer that only fires when told to.
    #[derive(Debug, Default, Clone)]
    pub struct ManualTimer {
        scheduled: Arc<Mutex<Vec<ScheduledTimer>>>,
    }

    /// One call to [`ManualTimer::schedule`].
    #[derive(Clone)]
    pub struct ScheduledTimer {
        due: Duration,
        released: Arc<AtomicBool>,
        on_fire: Arc<Mutex<Option<TimerCallback>>>,
    }

    impl std::fmt::Debug for ScheduledTimer {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("ScheduledTimer")
                .field("due", &self.due)
                .field("released", &self.is_released())
                .finish_non_exhaustive()
        }
    }

    impl ScheduledTimer {
        #[must_use]
        pub fn due(&self) -> Duration {
            self.due
        }

        #[must_use]
        pub fn is_released(&self) -> bool {
            self.released.load(Ordering::SeqCst)
        }

        /// Fire the callback unless the timer was released. Returns whether it fired.
        pub fn fire(&self) -> bool {
            if self.is_released() {
                return false;
            }
            let on_fire = self
                .on_fire
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            match on_fire {
                Some(on_fire) => {
                    on_fire();
                    true
                }
                None => false,
            }
        }
    }

    impl ManualTimer {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Every timer scheduled so far, oldest first.
        #[must_use]
        pub fn scheduled(&self) -> Vec<ScheduledTimer> {
            self.scheduled
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }
    }

    impl Timer for ManualTimer {
        fn schedule(&self, due: Duration, on_fire: TimerCallback) -> TimerHandle {
            let timer = ScheduledTimer {
                due,
                released: Arc::new(AtomicBool::new(false)),
                on_fire: Arc::new(Mutex::new(Some(on_fire))),
            };
            let released = Arc::clone(&timer.released);
            self.scheduled
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(timer);
            TimerHandle::new(move || released.store(true, Ordering::SeqCst))
        }
    }
}
