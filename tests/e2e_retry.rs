//! Retry-policy suite.
//!
//! A configured operation treats selected error kinds as transient: observing
//! one suspends the attempt instead of failing the invocation, and the
//! operation re-executes on the next attempt. Failures are never memoised,
//! and fences preceding the retried operation stay memoised.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::{init_test_logging, wait, Glitch, Hard};
use tokamak::{op_builder, once_unit, run, Error, ErrorKind, Eventual};

#[test]
fn transient_fence_failure_is_retried_without_rerunning_prior_fences() {
    init_test_logging();
    let fence_runs = Arc::new(AtomicUsize::new(0));
    let flaky_runs = Arc::new(AtomicUsize::new(0));

    let fences = Arc::clone(&fence_runs);
    let flakies = Arc::clone(&flaky_runs);
    let op = op_builder::<i32>().retry_on::<Glitch>().build();

    let result = run(move || {
        once_unit(|| {
            fences.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })?;
        let value = op.perform(|| {
            if flakies.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::user(Glitch))
            } else {
                Ok(7)
            }
        })?;
        Ok(value)
    });

    assert_eq!(wait(&result).expect("run failed"), 7);
    assert_eq!(fence_runs.load(Ordering::SeqCst), 1);
    assert_eq!(flaky_runs.load(Ordering::SeqCst), 2);
}

#[test]
fn transient_awaited_failure_re_executes_the_await() {
    init_test_logging();
    let supplies = Arc::new(AtomicUsize::new(0));
    let supplied = Arc::clone(&supplies);
    let op = op_builder::<i32>().retry_on::<Glitch>().build();

    let result = run(move || {
        let eventual = if supplied.fetch_add(1, Ordering::SeqCst) == 0 {
            Eventual::failed(Error::user(Glitch))
        } else {
            Eventual::resolved(9)
        };
        let value = op.await_value(eventual)?;
        Ok(value)
    });

    assert_eq!(wait(&result).expect("run failed"), 9);
    // The first attempt observed the failed eventual; the second stored and
    // extracted the fresh one.
    assert_eq!(supplies.load(Ordering::SeqCst), 2);
}

#[test]
fn retry_by_kind_matches_the_error_kind() {
    init_test_logging();
    let rounds = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&rounds);
    let op = op_builder::<i32>()
        .retry_on_kind(ErrorKind::Cancelled)
        .build();

    let result = run(move || {
        let value = op.perform(|| {
            if counted.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::new(ErrorKind::Cancelled))
            } else {
                Ok(3)
            }
        })?;
        Ok(value)
    });

    assert_eq!(wait(&result).expect("run failed"), 3);
    assert_eq!(rounds.load(Ordering::SeqCst), 3);
}

#[test]
fn non_transient_failure_is_not_retried() {
    init_test_logging();
    let runs = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&runs);
    let op = op_builder::<i32>().retry_on::<Glitch>().build();

    let result = run(move || {
        let value = op.perform(|| {
            counted.fetch_add(1, Ordering::SeqCst);
            Err(Error::user(Hard))
        })?;
        Ok(value)
    });

    let error = wait(&result).expect_err("run succeeded");
    assert_eq!(error.kind(), ErrorKind::User);
    assert!(error.source_ref().expect("source missing").is::<Hard>());
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn unconfigured_awaits_do_not_retry_transient_failures() {
    init_test_logging();
    let result = run(|| {
        let value: i32 = tokamak::await_value(Eventual::failed(Error::user(Glitch)))?;
        Ok(value)
    });
    let error = wait(&result).expect_err("run succeeded");
    assert_eq!(error.kind(), ErrorKind::User);
    assert!(error.source_ref().expect("source missing").is::<Glitch>());
}
