use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tracing::error;

/// A unit of work handed to a [`Scheduler`].
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Executes continuations that were not run inline.
pub trait Scheduler: Send + Sync {
    /// Run a synchronous job off the current thread.
    fn schedule(&self, job: Job);

    /// Drive a future to completion in the background.
    fn spawn(&self, future: BoxFuture<'static, ()>);
}

/// Schedules work on a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    #[must_use]
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Bind to the runtime of the calling thread, if there is one.
    #[must_use]
    pub fn try_current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, job: Job) {
        self.handle.spawn(async move { job() });
    }

    fn spawn(&self, future: BoxFuture<'static, ()>) {
        self.handle.spawn(future);
    }
}

/// Schedules every job on a freshly spawned OS thread.
///
/// Used when no async runtime is available.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadScheduler;

impl ThreadScheduler {
    fn start(&self, name: &str, job: Job) {
        spawn_or_run_inline(
            name,
            job,
            |body| spawn_thread(name, body),
            |slot| {
                if let Some(job) = take_job(slot) {
                    job();
                }
            },
        );
    }
}

pub(crate) fn spawn_thread(name: &str, body: Job) -> io::Result<()> {
    thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .map(drop)
}

pub(crate) fn take_job(slot: &Mutex<Option<Job>>) -> Option<Job> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
}

/// Start `body` through `spawn`, handing it the slot that holds `job`.
///
/// If spawning fails `job` is taken back out of the slot and run on the
/// calling thread, so the work it carries is never dropped.
pub(crate) fn spawn_or_run_inline<S, B>(name: &str, job: Job, spawn: S, body: B)
where
    S: FnOnce(Job) -> io::Result<()>,
    B: FnOnce(&Mutex<Option<Job>>) + Send + 'static,
{
    let slot = Arc::new(Mutex::new(Some(job)));
    let shared = Arc::clone(&slot);
    if let Err(err) = spawn(Box::new(move || body(&shared))) {
        error!(error = %err, thread = name, "failed to spawn thread, running inline");
        if let Some(job) = take_job(&slot) {
            job();
        }
    }
}

impl Scheduler for ThreadScheduler {
    fn schedule(&self, job: Job) {
        self.start("sagaline-job", job);
    }

    fn spawn(&self, future: BoxFuture<'static, ()>) {
        self.start(
            "sagaline-future",
            Box::new(move || futures::executor::block_on(future)),
        );
    }
}

impl fmt::Debug for dyn Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dyn Scheduler")
    }
}

/// The tokio runtime of the calling thread if there is one, else [`ThreadScheduler`].
#[must_use]
pub fn default_scheduler() -> Arc<dyn Scheduler> {
    match TokioScheduler::try_current() {
        Some(scheduler) => Arc::new(scheduler),
        None => Arc::new(ThreadScheduler),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use futures::FutureExt;

    use super::*;

    #[test]
    fn thread_scheduler_runs_jobs_off_the_calling_thread() -> anyhow::Result<()> {
        let (tx, rx) = mpsc::channel();
        let caller = thread::current().id();

        ThreadScheduler.schedule(Box::new(move || {
            let _ = tx.send(thread::current().id());
        }));

        let worker = rx.recv_timeout(Duration::from_secs(5))?;
        assert_ne!(worker, caller);
        Ok(())
    }

    #[test]
    fn thread_scheduler_drives_futures() -> anyhow::Result<()> {
        let (tx, rx) = mpsc::channel();

        ThreadScheduler.spawn(
            async move {
                let _ = tx.send(42);
            }
            .boxed(),
        );

        assert_eq!(rx.recv_timeout(Duration::from_secs(5))?, 42);
        Ok(())
    }

    #[test]
    fn failed_spawn_runs_the_job_inline() {
        let caller = thread::current().id();
        let ran_on = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&ran_on);

        spawn_or_run_inline(
            "sagaline-test",
            Box::new(move || {
                *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(thread::current().id());
            }),
            |_body| Err(io::Error::other("thread limit reached")),
            |_slot| {},
        );

        assert_eq!(
            *ran_on.lock().unwrap_or_else(PoisonError::into_inner),
            Some(caller)
        );
    }

    #[test]
    fn spawned_body_takes_the_job() {
        let (tx, rx) = mpsc::channel();

        spawn_or_run_inline(
            "sagaline-test",
            Box::new(move || {
                let _ = tx.send("ran");
            }),
            |body| {
                body();
                Ok(())
            },
            |slot| {
                if let Some(job) = take_job(slot) {
                    job();
                }
            },
        );

        assert_eq!(rx.try_recv().ok(), Some("ran"));
    }

    #[test]
    fn default_scheduler_without_runtime_uses_threads() {
        assert!(TokioScheduler::try_current().is_none());
        let _scheduler = default_scheduler();
    }

    #[tokio::test]
    async fn tokio_scheduler_runs_jobs_on_the_runtime() -> anyhow::Result<()> {
        let scheduler = TokioScheduler::try_current().expect("inside a runtime");
        let (tx, rx) = tokio::sync::oneshot::channel();

        scheduler.schedule(Box::new(move || {
            let _ = tx.send("ran");
        }));

        assert_eq!(rx.await?, "ran");
        Ok(())
    }
}
