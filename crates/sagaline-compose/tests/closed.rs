//! Integration tests for a composer that has already been finished.

use std::time::Duration;

use sagaline_compose::{ComposeError, ComposeOptions, Composer, Execution};
use sagaline_deferred::{Deferred, Status};

fn finished() -> Composer {
    let mut composer = Composer::new((), ComposeOptions::new());
    let chain = composer.finish();
    assert_eq!(chain.status(), Status::Succeeded);
    composer
}

fn assert_closed<V: std::fmt::Debug>(result: Result<V, ComposeError>) {
    assert!(
        matches!(result, Err(ComposeError::CompositionClosed)),
        "expected CompositionClosed, got {result:?}"
    );
}

#[test]
fn finished_composer_reports_itself_finished() {
    assert!(finished().is_finished());
}

#[test]
fn step_registrations_are_rejected() {
    let mut composer = finished();

    assert_closed(composer.execute(|| ()).map(|_| ()));
    assert_closed(composer.execute_with(Execution::Scheduled, || ()).map(|_| ()));
    assert_closed(composer.execute_async(Deferred::succeeded).map(|_| ()));
    assert_closed(
        composer
            .execute_async_with(Execution::Scheduled, Deferred::succeeded)
            .map(|_| ()),
    );
    assert_closed(
        composer
            .execute_future(|| async { Ok::<(), ComposeError>(()) })
            .map(|_| ()),
    );
    assert_closed(
        composer
            .execute_future_with(Execution::Scheduled, || async {
                Ok::<(), ComposeError>(())
            })
            .map(|_| ()),
    );
}

#[test]
fn handlers_are_rejected() {
    let mut composer = finished();

    assert_closed(
        composer
            .compensate(|compensation| compensation.handled())
            .map(|_| ()),
    );
    assert_closed(composer.finally(|_status| ()).map(|_| ()));
    assert_closed(
        composer
            .finally_with(Execution::Scheduled, |_status| ())
            .map(|_| ()),
    );
}

#[test]
fn delays_are_rejected_before_validation() {
    let mut composer = finished();

    assert_closed(composer.delay(Duration::from_millis(5)).map(|_| ()));
    assert_closed(composer.delay_indefinitely().map(|_| ()));
    assert_closed(composer.delay_millis(10).map(|_| ()));
    assert_closed(composer.delay_millis(-5).map(|_| ()));
}

#[test]
fn terminal_and_nested_operations_are_rejected() {
    let mut composer = finished();

    assert_closed(composer.completed());
    assert_closed(composer.failed("too late"));
    assert_closed(composer.compose(|_nested| Ok(())));
}

#[test]
fn finishing_again_returns_the_same_chain() {
    let mut composer = Composer::new((), ComposeOptions::new());
    let first = composer.finish();
    let second = composer.finish();

    assert!(first.ptr_eq(&second));
}
