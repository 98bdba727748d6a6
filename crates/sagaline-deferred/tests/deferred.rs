//! Integration tests for deferred operations across threads and runtimes.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use sagaline_deferred::{
    CancellationSource, ChainError, Deferred, Dispatch, Fault, Resolution, Scheduler, Status,
    ThreadScheduler, TokioScheduler,
};

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct TestError(&'static str);

#[test]
fn resolution_from_another_thread_wakes_a_blocked_waiter() -> anyhow::Result<()> {
    let (deferred, resolver) = Deferred::pending();

    let resolving = thread::spawn(move || {
        thread::sleep(Duration::from_millis(10));
        resolver.try_succeed()
    });

    futures::executor::block_on(deferred)?;
    assert!(resolving.join().expect("resolver thread"));
    Ok(())
}

#[test]
fn followers_chain_through_several_levels() {
    let (outer, outer_resolver) = Deferred::pending();
    let (middle, middle_resolver) = Deferred::pending();
    let (inner, inner_resolver) = Deferred::pending();

    outer_resolver.follow(&middle);
    middle_resolver.follow(&inner);
    assert_eq!(outer.status(), Status::Pending);

    inner_resolver.try_fault(Fault::new(TestError("deep")));

    assert_eq!(middle.status(), Status::Faulted);
    let error = outer.try_outcome().expect("resolved").expect_err("faulted");
    assert_eq!(
        error
            .fault()
            .and_then(|fault| fault.downcast_ref::<TestError>())
            .map(|e| e.0),
        Some("deep")
    );
}

#[test]
fn scheduled_continuations_all_run_once() {
    let (deferred, resolver) = Deferred::pending();
    let calls = Arc::new(AtomicUsize::new(0));
    let scheduler: Arc<dyn Scheduler> = Arc::new(ThreadScheduler);
    let (done_tx, done_rx) = std::sync::mpsc::channel();

    for _ in 0..4 {
        let calls = Arc::clone(&calls);
        let done_tx = done_tx.clone();
        deferred.on_resolved(Dispatch::Scheduled(Arc::clone(&scheduler)), move |resolution| {
            assert!(matches!(resolution, Resolution::Canceled));
            calls.fetch_add(1, Ordering::SeqCst);
            let _ = done_tx.send(());
        });
    }

    resolver.try_cancel();
    for _ in 0..4 {
        done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("continuation ran");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test(flavor = "multi_thread")]
async fn pending_future_completes_on_the_runtime() -> anyhow::Result<()> {
    let scheduler: Arc<dyn Scheduler> =
        Arc::new(TokioScheduler::try_current().expect("inside a runtime"));
    let (tx, rx) = tokio::sync::oneshot::channel::<u32>();

    let deferred = Deferred::from_future(
        async move {
            let value = rx.await.map_err(|_| TestError("sender dropped"))?;
            if value == 7 {
                Ok(())
            } else {
                Err(TestError("unexpected value"))
            }
        },
        &scheduler,
    );
    assert_eq!(deferred.status(), Status::Pending);

    tx.send(7).expect("receiver alive");
    deferred.await?;
    Ok(())
}

#[tokio::test]
async fn canceled_deferred_awaits_as_canceled() {
    let source = CancellationSource::new();
    let (deferred, resolver) = Deferred::pending();
    let _registration = source.token().register(move || {
        resolver.try_cancel();
    });

    source.cancel();

    assert!(matches!(deferred.await, Err(ChainError::Canceled)));
}
